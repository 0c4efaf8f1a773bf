//! Server orchestrator.
//!
//! Accepts WebSocket upgrades, runs the AUTH state machine, assigns each
//! session its role, and binds it into the registries. Forward-egress
//! sessions dial targets locally; reverse-ingress sessions receive the
//! CONNECTs produced by the token's SOCKS listener; connector-bound
//! sessions have their channels relayed through the issuer's reverse
//! session, which is the only cross-session routing in the system.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use wssocks_core::channel::ChannelEvent;
use wssocks_core::codec::pack_message;
use wssocks_core::error::{Result, WssocksError};
use wssocks_core::messages::{ConnectTarget, ConnectorOp, Message, Protocol};
use wssocks_core::relay;
use wssocks_core::session::{next_frame, run_writer, CloseReason, Session, SessionRole};

use crate::listener::{start_reverse_listener, ReverseListener, SharedSessions};
use crate::tokens::{AuthGrant, RemovedToken, ReverseTokenOptions, TokenKind, TokenRegistry, TokenStatus};

/// How long the server waits for the AUTH frame on a fresh connection.
const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// WebSocket listen address.
    pub ws_host: String,
    pub ws_port: u16,
    /// Bind address for reverse SOCKS listeners.
    pub socks_host: String,
    /// Enables the HTTP admin API when set.
    pub api_key: Option<String>,
    /// Admin API listen address.
    pub api_host: String,
    pub api_port: u16,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            ws_host: "0.0.0.0".into(),
            ws_port: 8765,
            socks_host: "127.0.0.1".into(),
            api_key: None,
            api_host: "127.0.0.1".into(),
            api_port: 8766,
        }
    }
}

/// Role-specific state attached to a server-side session.
#[derive(Debug, Clone)]
enum SessionKind {
    /// Forward token: this side dials.
    ForwardEgress,
    /// Reverse token: this side runs the SOCKS listener and may manage
    /// connector tokens.
    ReverseIngress,
    /// Connector token: CONNECTs relay through the issuer's session.
    ConnectorBound { issuer: Uuid },
}

/// The wssocks server.
pub struct WsSocksServer {
    opts: ServerOptions,
    tokens: Arc<TokenRegistry>,
    sessions: SharedSessions,
    listeners: Mutex<HashMap<String, ReverseListener>>,
}

impl WsSocksServer {
    pub fn new(opts: ServerOptions) -> Arc<Self> {
        Arc::new(Self {
            opts,
            tokens: Arc::new(TokenRegistry::new()),
            sessions: Arc::new(RwLock::new(HashMap::new())),
            listeners: Mutex::new(HashMap::new()),
        })
    }

    pub fn options(&self) -> &ServerOptions {
        &self.opts
    }

    /// Register a forward token (generated when `None`); idempotent.
    pub fn add_forward_token(&self, token: Option<String>) -> String {
        self.tokens.add_forward_token(token)
    }

    /// Register a reverse token and bind its SOCKS listener. Returns the
    /// effective token and the bound port.
    pub async fn add_reverse_token(
        self: &Arc<Self>,
        opts: ReverseTokenOptions,
    ) -> Result<(String, u16)> {
        let token = self.tokens.reserve_reverse_token(opts.token.clone())?;
        let listener = start_reverse_listener(
            &self.opts.socks_host,
            opts.port,
            token.clone(),
            self.sessions.clone(),
            self.tokens.clone(),
        )
        .await?;
        let port = listener.port;
        self.tokens
            .insert_reverse_token(&token, port, opts.socks_auth());
        self.listeners.lock().unwrap().insert(token.clone(), listener);
        Ok((token, port))
    }

    /// Remove a token of any kind: tears down its listener (reverse),
    /// closes every session authenticated with it, and with them their
    /// channels.
    pub async fn remove_token(&self, token: &str) -> bool {
        let Some(RemovedToken { kind, sessions, .. }) = self.tokens.remove_token(token) else {
            return false;
        };
        if kind == TokenKind::Reverse {
            let listener = self.listeners.lock().unwrap().remove(token);
            if let Some(listener) = listener {
                listener.stop().await;
            }
        }
        self.close_sessions(&sessions, CloseReason::Normal);
        true
    }

    pub fn client_count(&self, token: &str) -> usize {
        self.tokens.client_count(token)
    }

    pub fn status(&self) -> Vec<TokenStatus> {
        self.tokens.status()
    }

    fn close_sessions(&self, ids: &[Uuid], reason: CloseReason) {
        let sessions = self.sessions.read().unwrap();
        for id in ids {
            if let Some(session) = sessions.get(id) {
                session.close(reason);
            }
        }
    }

    /// Bind the WebSocket listener (and the admin API when configured) and
    /// serve until the task is cancelled. Listener bind failure is fatal.
    pub async fn serve(self: Arc<Self>) -> Result<()> {
        if let Some(api_key) = self.opts.api_key.clone() {
            let server = self.clone();
            let host = self.opts.api_host.clone();
            let port = self.opts.api_port;
            tokio::spawn(async move {
                if let Err(e) = crate::api::serve_api(server, &host, port, api_key).await {
                    warn!(error = %e, "admin api stopped");
                }
            });
        }

        let addr = format!("{}:{}", self.opts.ws_host, self.opts.ws_port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| WssocksError::Alloc(format!("websocket bind {addr}: {e}")))?;
        info!(addr = %addr, "websocket listener started");

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(stream).await {
                            debug!(peer = %peer, error = %e, "connection ended");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "tcp accept failed");
                }
            }
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream) -> Result<()> {
        let ws = tokio_tungstenite::accept_async(stream)
            .await
            .map_err(|e| WssocksError::Transport(format!("websocket handshake: {e}")))?;
        let (mut sink, mut stream) = ws.split();

        // Handshaking: the first frame must be AUTH.
        let first = match tokio::time::timeout(AUTH_TIMEOUT, next_frame(&mut stream)).await {
            Ok(Ok(Some(msg))) => msg,
            Ok(Ok(None)) => return Ok(()),
            Ok(Err(e)) => {
                let _ = sink.send(WsMessage::Close(None)).await;
                return Err(e);
            }
            Err(_) => {
                let _ = sink.send(WsMessage::Close(None)).await;
                return Err(WssocksError::Timeout);
            }
        };
        let Message::Auth { token, reverse } = first else {
            let _ = sink.send(WsMessage::Close(None)).await;
            return Err(WssocksError::Protocol(format!(
                "expected auth, got {}",
                first.kind()
            )));
        };

        let grant = match self.tokens.validate(&token, reverse) {
            Ok(grant) => grant,
            Err(e) => {
                reject_auth(&mut sink, "invalid token").await;
                return Err(e);
            }
        };
        let (role, kind) = match grant {
            AuthGrant::Forward => (SessionRole::ForwardEgress, SessionKind::ForwardEgress),
            AuthGrant::Reverse => (SessionRole::ReverseIngress, SessionKind::ReverseIngress),
            AuthGrant::Connector { issuer } => (
                SessionRole::ForwardEgress,
                SessionKind::ConnectorBound { issuer },
            ),
        };

        let (session, outbound_rx) = Session::new(role);
        tokio::spawn(run_writer(sink, outbound_rx, session.closed()));
        session
            .send(Message::AuthResponse {
                success: true,
                error: None,
            })
            .await?;

        self.sessions
            .write()
            .unwrap()
            .insert(session.id(), session.clone());
        self.tokens.attach_session(&token, session.id());
        info!(session = %session.id(), token = %token, ?role, "session authenticated");

        let result = self.run_session(&session, &kind, &mut stream).await;

        // Teardown: drain channels, detach, and cascade connector scoping.
        session.close(CloseReason::Normal);
        self.sessions.write().unwrap().remove(&session.id());
        self.tokens.detach_session(&token, session.id());
        if matches!(kind, SessionKind::ReverseIngress) {
            for (ctoken, dependents) in self.tokens.remove_connectors_of(session.id()) {
                debug!(token = %ctoken, count = dependents.len(),
                       "closing sessions of expired connector token");
                self.close_sessions(&dependents, CloseReason::Normal);
            }
        }
        info!(session = %session.id(), "session closed");
        result
    }

    async fn run_session(
        self: &Arc<Self>,
        session: &Arc<Session>,
        kind: &SessionKind,
        stream: &mut SplitStream<WebSocketStream<TcpStream>>,
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
                                self.handle_role_frame(session, kind, msg).await;
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

    async fn handle_role_frame(
        self: &Arc<Self>,
        session: &Arc<Session>,
        kind: &SessionKind,
        msg: Message,
    ) {
        match (kind, msg) {
            (SessionKind::ForwardEgress, Message::Connect { connect_id, target }) => {
                tokio::spawn(relay::handle_connect(session.clone(), connect_id, target));
            }

            (SessionKind::ConnectorBound { issuer }, Message::Connect { connect_id, target }) => {
                let server = self.clone();
                let session = session.clone();
                let issuer = *issuer;
                tokio::spawn(async move {
                    server
                        .relay_via_issuer(session, issuer, connect_id, target)
                        .await;
                });
            }

            (
                SessionKind::ReverseIngress,
                Message::Connector {
                    connect_id,
                    token,
                    op,
                },
            ) => {
                self.handle_connector_op(session, connect_id, token, op).await;
            }

            (_, msg) => {
                warn!(session = %session.id(), role = ?session.role(), kind = msg.kind(),
                      "unexpected frame for role");
            }
        }
    }

    async fn handle_connector_op(
        &self,
        session: &Arc<Session>,
        connect_id: Uuid,
        token: String,
        op: ConnectorOp,
    ) {
        let reply = match op {
            ConnectorOp::Add => {
                let requested = Some(token).filter(|t| !t.is_empty());
                match self.tokens.add_connector_token(requested, session.id()) {
                    Ok(token) => Message::ConnectorResponse {
                        success: true,
                        connect_id,
                        token: Some(token),
                        error: None,
                    },
                    Err(e) => Message::ConnectorResponse {
                        success: false,
                        connect_id,
                        token: None,
                        error: Some(e.to_string()),
                    },
                }
            }
            ConnectorOp::Remove => {
                match self.tokens.remove_connector_token(&token, session.id()) {
                    Ok(dependents) => {
                        self.close_sessions(&dependents, CloseReason::Normal);
                        Message::ConnectorResponse {
                            success: true,
                            connect_id,
                            token: Some(token),
                            error: None,
                        }
                    }
                    Err(e) => Message::ConnectorResponse {
                        success: false,
                        connect_id,
                        token: None,
                        error: Some(e.to_string()),
                    },
                }
            }
        };
        if session.send(reply).await.is_err() {
            debug!(session = %session.id(), "connector reply after session close");
        }
    }

    /// Open a channel on behalf of a connector-bound session by asking the
    /// issuer's reverse session to dial, then link the two registries.
    async fn relay_via_issuer(
        self: Arc<Self>,
        session: Arc<Session>,
        issuer: Uuid,
        connect_id: Uuid,
        target: ConnectTarget,
    ) {
        let protocol = target.protocol();
        let issuer_session = self.sessions.read().unwrap().get(&issuer).cloned();
        let Some(issuer_session) = issuer_session else {
            let _ = session
                .send(connect_failure(connect_id, "issuer session gone"))
                .await;
            return;
        };

        match issuer_session.request_connect(target).await {
            Ok((channel_id, issuer_rx)) => {
                let conn_rx = match session.channels.register(channel_id, protocol) {
                    Ok(rx) => rx,
                    Err(e) => {
                        warn!(channel = %channel_id, error = %e, "relay channel collision");
                        issuer_session.channels.remove(&channel_id);
                        let _ = issuer_session
                            .send(Message::Disconnect { channel_id })
                            .await;
                        let _ = session
                            .send(connect_failure(connect_id, "channel collision"))
                            .await;
                        return;
                    }
                };
                let reply = Message::ConnectResponse {
                    success: true,
                    channel_id,
                    connect_id,
                    protocol: Some(protocol),
                    error: None,
                };
                if session.send(reply).await.is_err() {
                    issuer_session.channels.remove(&channel_id);
                    let _ = issuer_session
                        .send(Message::Disconnect { channel_id })
                        .await;
                    return;
                }
                debug!(channel = %channel_id, issuer = %issuer, "connector channel linked");
                tokio::spawn(link_pump(
                    conn_rx,
                    issuer_session.clone(),
                    session.clone(),
                    channel_id,
                    protocol,
                ));
                tokio::spawn(link_pump(
                    issuer_rx,
                    session,
                    issuer_session,
                    channel_id,
                    protocol,
                ));
            }
            Err(e) => {
                let _ = session.send(connect_failure(connect_id, &e.to_string())).await;
            }
        }
    }
}

fn connect_failure(connect_id: Uuid, error: &str) -> Message {
    Message::ConnectResponse {
        success: false,
        channel_id: Uuid::nil(),
        connect_id,
        protocol: None,
        error: Some(error.to_string()),
    }
}

async fn reject_auth(
    sink: &mut SplitSink<WebSocketStream<TcpStream>, WsMessage>,
    error: &str,
) {
    let reply = Message::AuthResponse {
        success: false,
        error: Some(error.to_string()),
    };
    if let Ok(frame) = pack_message(&reply) {
        let _ = sink.send(WsMessage::Binary(frame)).await;
    }
    let _ = sink.send(WsMessage::Close(None)).await;
}

/// Forward one channel's inbound events from `from` into `to`'s outbound
/// stream. Ends on DISCONNECT or registry drain, removing the mirrored
/// entry on the way out.
async fn link_pump(
    mut from_rx: mpsc::Receiver<ChannelEvent>,
    to: Arc<Session>,
    from: Arc<Session>,
    channel_id: Uuid,
    protocol: Protocol,
) {
    while let Some(event) = from_rx.recv().await {
        match event {
            ChannelEvent::Data { data, udp } => {
                let frame = Message::Data {
                    protocol,
                    channel_id,
                    compression: Default::default(),
                    data,
                    udp,
                };
                if to.send(frame).await.is_err() {
                    break;
                }
            }
            ChannelEvent::Disconnect => break,
        }
    }
    from.channels.remove(&channel_id);
    to.channels.remove(&channel_id);
    let _ = to.send(Message::Disconnect { channel_id }).await;
    debug!(channel = %channel_id, "connector channel unlinked");
}
