//! Reverse SOCKS listener management.
//!
//! Each reverse token owns one TCP listener for the life of the token.
//! Accepted SOCKS requests are negotiated immediately, then dispatched
//! round-robin across the sessions currently serving the token; when none
//! is connected the request is held for up to 10 s and then rejected.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use wssocks_core::error::{Result, WssocksError};
use wssocks_core::session::Session;
use wssocks_core::socks::{self, ReplyCode};

use crate::tokens::TokenRegistry;

/// How long an accepted SOCKS request waits for a serving session.
pub const SESSION_WAIT: Duration = Duration::from_secs(10);

/// Sessions shared between the accept loops and the server orchestrator.
pub type SharedSessions = Arc<RwLock<HashMap<Uuid, Arc<Session>>>>;

/// Handle to a running reverse listener.
pub struct ReverseListener {
    pub port: u16,
    cancel_tx: mpsc::Sender<()>,
}

impl ReverseListener {
    /// Stop the accept loop. The bound port is released once the loop
    /// observes the signal.
    pub async fn stop(&self) {
        let _ = self.cancel_tx.send(()).await;
    }
}

/// Bind a reverse SOCKS listener for `token` and start its accept loop.
/// `port` 0 asks the OS for an ephemeral port; the actual port is returned
/// in the handle.
pub async fn start_reverse_listener(
    host: &str,
    port: u16,
    token: String,
    sessions: SharedSessions,
    registry: Arc<TokenRegistry>,
) -> Result<ReverseListener> {
    let listener = TcpListener::bind((host, port))
        .await
        .map_err(|e| WssocksError::Alloc(format!("socks listener bind {host}:{port}: {e}")))?;
    let actual_port = listener
        .local_addr()
        .map_err(|e| WssocksError::Alloc(format!("socks listener address: {e}")))?
        .port();

    let (cancel_tx, mut cancel_rx) = mpsc::channel::<()>(1);
    info!(token = %token, port = actual_port, "reverse socks listener started");

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel_rx.recv() => {
                    debug!(token = %token, "reverse listener cancelled");
                    break;
                }
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            debug!(token = %token, peer = %peer, "socks request accepted");
                            let token = token.clone();
                            let sessions = sessions.clone();
                            let registry = registry.clone();
                            tokio::spawn(async move {
                                if let Err(e) =
                                    dispatch(stream, &token, sessions, registry).await
                                {
                                    debug!(token = %token, error = %e, "socks dispatch ended");
                                }
                            });
                        }
                        Err(e) => {
                            warn!(token = %token, error = %e, "socks accept failed");
                        }
                    }
                }
            }
        }
    });

    Ok(ReverseListener {
        port: actual_port,
        cancel_tx,
    })
}

/// Negotiate the SOCKS handshake, wait for a serving session, and bridge.
async fn dispatch(
    mut stream: TcpStream,
    token: &str,
    sessions: SharedSessions,
    registry: Arc<TokenRegistry>,
) -> Result<()> {
    let auth = registry.reverse_auth(token);
    let request = socks::handshake(&mut stream, auth.as_ref()).await?;

    match wait_for_session(token, &sessions, &registry, SESSION_WAIT).await {
        Some(session) => socks::serve_request(stream, request, session).await,
        None => {
            let bind = stream.local_addr()?;
            socks::send_reply(&mut stream, ReplyCode::GeneralFailure, bind).await?;
            Err(WssocksError::Timeout)
        }
    }
}

/// Round-robin pick with a bounded wait for a session to attach.
pub async fn wait_for_session(
    token: &str,
    sessions: &SharedSessions,
    registry: &Arc<TokenRegistry>,
    wait: Duration,
) -> Option<Arc<Session>> {
    let deadline = Instant::now() + wait;
    loop {
        match registry.pick_reverse_session(token) {
            Some(id) => {
                if let Some(session) = sessions.read().unwrap().get(&id).cloned() {
                    if !session.is_closed() {
                        return Some(session);
                    }
                }
                // Stale rotation entry; the cursor has advanced, retry soon.
                if Instant::now() >= deadline {
                    return None;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            None => {
                let notified = registry.joined().notified();
                if tokio::time::timeout_at(deadline, notified).await.is_err() {
                    return None;
                }
            }
        }
    }
}
