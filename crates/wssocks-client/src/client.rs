//! The wssocks client.
//!
//! Manages the connection lifecycle: dial, AUTH, the per-session read
//! loop, and the reconnect policy. Forward mode runs a local SOCKS5
//! listener whose accepted requests wait (bounded) for a live session,
//! so the listener survives reconnects.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures_util::stream::SplitStream;
use futures_util::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use wssocks_core::error::{Result, WssocksError};
use wssocks_core::messages::{ConnectorOp, Message};
use wssocks_core::relay;
use wssocks_core::session::{next_frame, run_writer, CloseReason, Session, SessionRole};
use wssocks_core::socks::{self, ReplyCode, SocksAuth};

/// Dial and AUTH budget per connection attempt.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long an accepted SOCKS request waits for a live session.
const SESSION_WAIT: Duration = Duration::from_secs(10);

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// WebSocket server URL, e.g. `ws://localhost:8765`.
    pub url: String,
    /// Request the reverse-egress role.
    pub reverse: bool,
    /// Forward-mode SOCKS listener address.
    pub socks_host: String,
    pub socks_port: u16,
    /// Credentials required from local SOCKS clients.
    pub socks_auth: Option<SocksAuth>,
    /// Start the SOCKS listener only after the first successful AUTH.
    pub socks_wait_server: bool,
    /// Redial on session loss.
    pub reconnect: bool,
    pub reconnect_delay: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8765".into(),
            reverse: false,
            socks_host: "127.0.0.1".into(),
            socks_port: 1080,
            socks_auth: None,
            socks_wait_server: true,
            reconnect: true,
            reconnect_delay: Duration::from_secs(3),
        }
    }
}

/// The wssocks client.
pub struct WsSocksClient {
    token: String,
    opts: ClientOptions,
    /// The live session, when connected. SOCKS dispatch and connector
    /// operations go through here.
    current: RwLock<Option<Arc<Session>>>,
    /// Signaled when a session becomes live.
    joined: Notify,
    stop_tx: watch::Sender<bool>,
    socks_started: AtomicBool,
}

impl WsSocksClient {
    pub fn new(token: impl Into<String>, opts: ClientOptions) -> Arc<Self> {
        let (stop_tx, _) = watch::channel(false);
        Arc::new(Self {
            token: token.into(),
            opts,
            current: RwLock::new(None),
            joined: Notify::new(),
            stop_tx,
            socks_started: AtomicBool::new(false),
        })
    }

    /// Ask the run loop to stop; the live session closes cleanly.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
        if let Some(session) = self.current.read().unwrap().clone() {
            session.close(CloseReason::Normal);
        }
    }

    fn stopped(&self) -> bool {
        *self.stop_tx.borrow()
    }

    /// Run the client until stopped. Redials on session loss when
    /// reconnect is enabled; otherwise returns the session error.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        if !self.opts.reverse && !self.opts.socks_wait_server {
            self.clone().start_socks_listener().await?;
        }

        let mut stop_rx = self.stop_tx.subscribe();
        loop {
            let result = self.clone().connect_once().await;
            if self.stopped() {
                return Ok(());
            }
            match result {
                Ok(()) => info!("session ended"),
                // A listener bind failure cannot be retried into existence.
                Err(e @ WssocksError::Alloc(_)) => return Err(e),
                Err(e) => {
                    if !self.opts.reconnect {
                        return Err(e);
                    }
                    warn!(error = %e, "session failed");
                }
            }
            if !self.opts.reconnect {
                return Ok(());
            }
            debug!(delay = ?self.opts.reconnect_delay, "reconnecting");
            tokio::select! {
                _ = tokio::time::sleep(self.opts.reconnect_delay) => {}
                _ = stop_rx.changed() => return Ok(()),
            }
        }
    }

    async fn connect_once(self: Arc<Self>) -> Result<()> {
        let (ws, _) = tokio::time::timeout(
            CONNECT_TIMEOUT,
            tokio_tungstenite::connect_async(self.opts.url.as_str()),
        )
        .await
        .map_err(|_| WssocksError::Timeout)?
        .map_err(|e| WssocksError::Transport(format!("websocket connect: {e}")))?;
        let (sink, mut stream) = ws.split();

        let role = if self.opts.reverse {
            SessionRole::ReverseEgress
        } else {
            SessionRole::ForwardIngress
        };
        let (session, outbound_rx) = Session::new(role);
        tokio::spawn(run_writer(sink, outbound_rx, session.closed()));

        session
            .send(Message::Auth {
                token: self.token.clone(),
                reverse: self.opts.reverse,
            })
            .await?;
        match tokio::time::timeout(CONNECT_TIMEOUT, next_frame(&mut stream)).await {
            Ok(Ok(Some(Message::AuthResponse { success: true, .. }))) => {}
            Ok(Ok(Some(Message::AuthResponse { error, .. }))) => {
                session.close(CloseReason::Normal);
                return Err(WssocksError::Auth(
                    error.unwrap_or_else(|| "authentication rejected".into()),
                ));
            }
            Ok(Ok(Some(other))) => {
                session.close(CloseReason::ProtocolViolation);
                return Err(WssocksError::Protocol(format!(
                    "expected auth response, got {}",
                    other.kind()
                )));
            }
            Ok(Ok(None)) => {
                session.close(CloseReason::Normal);
                return Err(WssocksError::Transport("closed during auth".into()));
            }
            Ok(Err(e)) => {
                session.close(CloseReason::Internal);
                return Err(e);
            }
            Err(_) => {
                session.close(CloseReason::Internal);
                return Err(WssocksError::Timeout);
            }
        }
        info!(session = %session.id(), url = %self.opts.url, reverse = self.opts.reverse,
              "authenticated");

        *self.current.write().unwrap() = Some(session.clone());
        self.joined.notify_waiters();
        if !self.opts.reverse
            && self.opts.socks_wait_server
            && !self.socks_started.load(Ordering::Relaxed)
        {
            self.clone().start_socks_listener().await?;
        }

        let result = self.run_session(&session, &mut stream).await;

        session.close(CloseReason::Normal);
        *self.current.write().unwrap() = None;
        result
    }

    async fn run_session(
        &self,
        session: &Arc<Session>,
        stream: &mut SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
    ) -> Result<()> {
        let mut closed = session.closed();
        if session.is_closed() {
            return Ok(());
        }
        loop {
            tokio::select! {
                _ = closed.changed() => return Ok(()),
                frame = next_frame(stream) => {
                    match frame {
                        Ok(Some(msg)) => {
                            let leftover = session.handle_frame(msg).await?;
                            if let Some(msg) = leftover {
                                self.handle_role_frame(session, msg);
                            }
                        }
                        Ok(None) => return Ok(()),
                        Err(e @ WssocksError::Protocol(_)) => {
                            warn!(session = %session.id(), error = %e, "protocol violation");
                            session.close(CloseReason::ProtocolViolation);
                            return Err(e);
                        }
                        Err(e) => {
                            session.close(CloseReason::Internal);
                            return Err(e);
                        }
                    }
                }
            }
        }
    }

    fn handle_role_frame(&self, session: &Arc<Session>, msg: Message) {
        match msg {
            Message::Connect { connect_id, target } if self.opts.reverse => {
                tokio::spawn(relay::handle_connect(session.clone(), connect_id, target));
            }
            other => {
                warn!(session = %session.id(), role = ?session.role(), kind = other.kind(),
                      "unexpected frame for role");
            }
        }
    }

    /// Bind the forward-mode SOCKS listener and start its accept loop.
    /// Bind failure is fatal for the client.
    async fn start_socks_listener(self: Arc<Self>) -> Result<()> {
        if self.socks_started.swap(true, Ordering::Relaxed) {
            return Ok(());
        }
        let addr = format!("{}:{}", self.opts.socks_host, self.opts.socks_port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| WssocksError::Alloc(format!("socks listener bind {addr}: {e}")))?;
        info!(addr = %addr, "socks listener started");

        let client = self.clone();
        let mut stop_rx = self.stop_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => {
                        debug!("socks listener stopped");
                        break;
                    }
                    result = listener.accept() => {
                        match result {
                            Ok((stream, peer)) => {
                                debug!(peer = %peer, "socks request accepted");
                                let client = client.clone();
                                tokio::spawn(async move {
                                    if let Err(e) = client.dispatch_socks(stream).await {
                                        debug!(error = %e, "socks dispatch ended");
                                    }
                                });
                            }
                            Err(e) => {
                                warn!(error = %e, "socks accept failed");
                            }
                        }
                    }
                }
            }
        });
        Ok(())
    }

    async fn dispatch_socks(&self, mut stream: TcpStream) -> Result<()> {
        let request = socks::handshake(&mut stream, self.opts.socks_auth.as_ref()).await?;
        match self.wait_for_session(SESSION_WAIT).await {
            Some(session) => socks::serve_request(stream, request, session).await,
            None => {
                let bind = stream.local_addr()?;
                socks::send_reply(&mut stream, ReplyCode::GeneralFailure, bind).await?;
                Err(WssocksError::Timeout)
            }
        }
    }

    async fn wait_for_session(&self, wait: Duration) -> Option<Arc<Session>> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(session) = self.current.read().unwrap().clone() {
                if !session.is_closed() {
                    return Some(session);
                }
            }
            let notified = self.joined.notified();
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    /// Authorize a connector token through the live reverse session.
    /// Returns the effective token (server-generated when `token` is
    /// empty).
    pub async fn add_connector(&self, token: &str) -> Result<String> {
        let session = self
            .wait_for_session(SESSION_WAIT)
            .await
            .ok_or(WssocksError::Cancelled)?;
        let granted = session.request_connector(token, ConnectorOp::Add).await?;
        granted.ok_or_else(|| {
            WssocksError::Protocol("connector add without granted token".into())
        })
    }

    /// Revoke a previously authorized connector token.
    pub async fn remove_connector(&self, token: &str) -> Result<()> {
        let session = self
            .wait_for_session(SESSION_WAIT)
            .await
            .ok_or(WssocksError::Cancelled)?;
        session.request_connector(token, ConnectorOp::Remove).await?;
        Ok(())
    }

    /// Identifier of the live session, if any. Used by tests and status
    /// reporting.
    pub fn session_id(&self) -> Option<Uuid> {
        self.current.read().unwrap().as_ref().map(|s| s.id())
    }
}
