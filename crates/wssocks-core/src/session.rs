//! Session fabric: one instance per WebSocket connection.
//!
//! A session owns the single ordered outbound stream (drained by one writer
//! task), the channel registry, and the request/response correlation map.
//! All producers submit frames through [`Session::send`]; ordering per
//! (session, channel) follows from the single writer and the ordered
//! transport.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::channel::{ChannelEvent, ChannelRegistry};
use crate::codec::{pack_message, parse_message};
use crate::error::{Result, WssocksError};
use crate::messages::{ConnectTarget, ConnectorOp, Message, Protocol};

/// Soft cap on the outbound queue. Hitting it logs once and shifts the
/// session into back-pressured sends.
pub const OUTBOUND_SOFT_CAP: usize = 1024;

/// Bounded wait for a CONNECT / CONNECTOR response.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// The authenticated role of a session, from the perspective of the side
/// holding it. Ingress faces the SOCKS client; egress dials destinations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    /// Forward mode, client side: local SOCKS listener, CONNECTs go out.
    ForwardIngress,
    /// Forward mode, server side: receives CONNECTs and dials.
    ForwardEgress,
    /// Reverse mode, server side: server SOCKS listener, CONNECTs go out.
    ReverseIngress,
    /// Reverse mode, client side: receives CONNECTs and dials.
    ReverseEgress,
}

/// Why a session is closing; maps to the WebSocket close code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Clean shutdown (1000).
    Normal,
    /// Malformed or unexpected frame (1002).
    ProtocolViolation,
    /// Internal failure (1011).
    Internal,
}

impl CloseReason {
    fn code(&self) -> CloseCode {
        match self {
            CloseReason::Normal => CloseCode::Normal,
            CloseReason::ProtocolViolation => CloseCode::Protocol,
            CloseReason::Internal => CloseCode::Error,
        }
    }
}

/// One live tunnel session.
pub struct Session {
    id: Uuid,
    role: SessionRole,
    outbound: mpsc::Sender<Message>,
    outbound_warned: AtomicBool,
    pub channels: ChannelRegistry,
    pending: Mutex<HashMap<Uuid, oneshot::Sender<Message>>>,
    /// Channels registered by the read loop on CONNECT_RESPONSE, awaiting
    /// pickup by the requester. Registration happens in the read loop so no
    /// DATA frame can race past an unregistered channel.
    claimable: Mutex<HashMap<Uuid, mpsc::Receiver<ChannelEvent>>>,
    close_tx: watch::Sender<Option<CloseReason>>,
}

impl Session {
    /// Create a session. The returned receiver is the outbound queue; hand
    /// it to [`run_writer`] together with the WebSocket sink.
    pub fn new(role: SessionRole) -> (Arc<Self>, mpsc::Receiver<Message>) {
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_SOFT_CAP);
        let (close_tx, _) = watch::channel(None);
        let session = Arc::new(Self {
            id: Uuid::new_v4(),
            role,
            outbound,
            outbound_warned: AtomicBool::new(false),
            channels: ChannelRegistry::new(),
            pending: Mutex::new(HashMap::new()),
            claimable: Mutex::new(HashMap::new()),
            close_tx,
        });
        (session, outbound_rx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    /// Submit a frame to the ordered outbound stream.
    pub async fn send(&self, msg: Message) -> Result<()> {
        match self.outbound.try_send(msg) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(msg)) => {
                if !self.outbound_warned.swap(true, Ordering::Relaxed) {
                    warn!(
                        session = %self.id,
                        cap = OUTBOUND_SOFT_CAP,
                        "outbound queue at soft cap, producers now back-pressured"
                    );
                }
                self.outbound
                    .send(msg)
                    .await
                    .map_err(|_| WssocksError::Transport("session outbound closed".into()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(WssocksError::Transport("session outbound closed".into()))
            }
        }
    }

    /// Subscribe to the session's cancellation signal.
    pub fn closed(&self) -> watch::Receiver<Option<CloseReason>> {
        self.close_tx.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.close_tx.borrow().is_some()
    }

    /// Cancel the session: signal every task, drain the channel registry,
    /// and fail all pending requests. The first reason wins.
    pub fn close(&self, reason: CloseReason) {
        let first = self.close_tx.send_if_modified(|cur| {
            if cur.is_none() {
                *cur = Some(reason);
                true
            } else {
                false
            }
        });
        if first {
            debug!(session = %self.id, ?reason, "session closing");
        }
        self.channels.drain_all();
        self.pending.lock().unwrap().clear();
        self.claimable.lock().unwrap().clear();
    }

    fn register_pending(&self, connect_id: Uuid) -> oneshot::Receiver<Message> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(connect_id, tx);
        rx
    }

    /// Complete a pending request. Returns false when no waiter exists
    /// (late or unsolicited response).
    pub fn complete_pending(&self, connect_id: Uuid, msg: Message) -> bool {
        let waiter = self.pending.lock().unwrap().remove(&connect_id);
        match waiter {
            Some(tx) => tx.send(msg).is_ok(),
            None => false,
        }
    }

    async fn request(&self, connect_id: Uuid, msg: Message) -> Result<Message> {
        let rx = self.register_pending(connect_id);
        self.send(msg).await?;
        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(_)) => Err(WssocksError::Cancelled),
            Err(_) => {
                self.pending.lock().unwrap().remove(&connect_id);
                Err(WssocksError::Timeout)
            }
        }
    }

    /// Ask the peer to open a channel. On success the channel is already
    /// registered; the returned receiver is its inbound queue.
    pub async fn request_connect(
        &self,
        target: ConnectTarget,
    ) -> Result<(Uuid, mpsc::Receiver<ChannelEvent>)> {
        let connect_id = Uuid::new_v4();
        let resp = self
            .request(connect_id, Message::Connect { connect_id, target })
            .await?;
        match resp {
            Message::ConnectResponse {
                success: true,
                channel_id,
                ..
            } => {
                let rx = self.claim_channel(&channel_id).ok_or_else(|| {
                    WssocksError::Transport("connect response without a registered channel".into())
                })?;
                Ok((channel_id, rx))
            }
            Message::ConnectResponse { error, .. } => Err(WssocksError::Dial(
                error.unwrap_or_else(|| "connect failed".into()),
            )),
            other => Err(WssocksError::Protocol(format!(
                "unexpected {} in reply to connect",
                other.kind()
            ))),
        }
    }

    /// Authorize or revoke a connector token. On a successful add the
    /// returned token is the effective one (server-generated when the
    /// request carried an empty token).
    pub async fn request_connector(&self, token: &str, op: ConnectorOp) -> Result<Option<String>> {
        let connect_id = Uuid::new_v4();
        let resp = self
            .request(
                connect_id,
                Message::Connector {
                    connect_id,
                    token: token.to_string(),
                    op,
                },
            )
            .await?;
        match resp {
            Message::ConnectorResponse {
                success: true,
                token,
                ..
            } => Ok(token),
            Message::ConnectorResponse { error, .. } => Err(WssocksError::Other(
                error.unwrap_or_else(|| "connector request failed".into()),
            )),
            other => Err(WssocksError::Protocol(format!(
                "unexpected {} in reply to connector",
                other.kind()
            ))),
        }
    }

    /// Take ownership of a channel queue registered by the read loop.
    pub fn claim_channel(&self, channel_id: &Uuid) -> Option<mpsc::Receiver<ChannelEvent>> {
        self.claimable.lock().unwrap().remove(channel_id)
    }

    /// Role-independent frame dispatch. Consumes DATA, DISCONNECT and the
    /// two response types; everything else is returned to the caller for
    /// role-specific handling.
    pub async fn handle_frame(&self, msg: Message) -> Result<Option<Message>> {
        match msg {
            Message::Data {
                channel_id,
                data,
                udp,
                ..
            } => {
                if let Err(e) = self
                    .channels
                    .deliver(channel_id, ChannelEvent::Data { data, udp })
                    .await
                {
                    // ChannelGone: prompt the peer to clean up its end.
                    debug!(session = %self.id, error = %e, "dropping data frame");
                    self.send(Message::Disconnect { channel_id }).await?;
                }
                Ok(None)
            }

            Message::Disconnect { channel_id } => {
                let _ = self
                    .channels
                    .deliver(channel_id, ChannelEvent::Disconnect)
                    .await;
                self.channels.remove(&channel_id);
                self.claimable.lock().unwrap().remove(&channel_id);
                Ok(None)
            }

            Message::ConnectResponse {
                success,
                channel_id,
                connect_id,
                protocol,
                error,
            } => {
                if success {
                    match self
                        .channels
                        .register(channel_id, protocol.unwrap_or(Protocol::Tcp))
                    {
                        Ok(rx) => {
                            self.claimable.lock().unwrap().insert(channel_id, rx);
                        }
                        Err(e) => {
                            warn!(session = %self.id, channel = %channel_id, error = %e,
                                  "connect response for duplicate channel");
                        }
                    }
                }
                let completed = self.complete_pending(
                    connect_id,
                    Message::ConnectResponse {
                        success,
                        channel_id,
                        connect_id,
                        protocol,
                        error,
                    },
                );
                if !completed {
                    debug!(session = %self.id, connect = %connect_id, "unmatched connect response");
                    if success {
                        // The requester gave up (timeout); tell the egress
                        // side to tear its end down.
                        self.channels.remove(&channel_id);
                        self.claimable.lock().unwrap().remove(&channel_id);
                        self.send(Message::Disconnect { channel_id }).await?;
                    }
                }
                Ok(None)
            }

            Message::ConnectorResponse {
                success,
                connect_id,
                token,
                error,
            } => {
                if !self.complete_pending(
                    connect_id,
                    Message::ConnectorResponse {
                        success,
                        connect_id,
                        token,
                        error,
                    },
                ) {
                    debug!(session = %self.id, connect = %connect_id, "unmatched connector response");
                }
                Ok(None)
            }

            other => Ok(Some(other)),
        }
    }
}

/// Drain the outbound queue into the WebSocket sink. One per session; runs
/// until the session is cancelled or the queue closes, then performs a
/// bounded drain and sends the close frame.
pub async fn run_writer<S>(
    mut sink: SplitSink<WebSocketStream<S>, WsMessage>,
    mut outbound: mpsc::Receiver<Message>,
    mut closed: watch::Receiver<Option<CloseReason>>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let already = *closed.borrow_and_update();
    let reason = if let Some(reason) = already {
        reason
    } else {
        loop {
            tokio::select! {
                changed = closed.changed() => {
                    if changed.is_err() {
                        break CloseReason::Normal;
                    }
                    if let Some(reason) = *closed.borrow() {
                        break reason;
                    }
                }
                msg = outbound.recv() => {
                    let Some(msg) = msg else {
                        break CloseReason::Normal;
                    };
                    match pack_message(&msg) {
                        Ok(frame) => {
                            if sink.send(WsMessage::Binary(frame)).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, kind = msg.kind(), "dropping unpackable outbound frame");
                        }
                    }
                }
            }
        }
    };

    // Bounded drain: flush whatever is already queued, nothing more.
    while let Ok(msg) = outbound.try_recv() {
        if let Ok(frame) = pack_message(&msg) {
            if sink.send(WsMessage::Binary(frame)).await.is_err() {
                return;
            }
        }
    }

    let _ = sink
        .send(WsMessage::Close(Some(CloseFrame {
            code: reason.code(),
            reason: "".into(),
        })))
        .await;
}

/// Read the next tunnel frame from the WebSocket. `Ok(None)` means the peer
/// closed; a parse failure is a protocol violation the caller must close
/// the session over (code 1002).
pub async fn next_frame<S>(stream: &mut SplitStream<WebSocketStream<S>>) -> Result<Option<Message>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        match stream.next().await {
            Some(Ok(WsMessage::Binary(data))) => return parse_message(&data).map(Some),
            Some(Ok(WsMessage::Close(_))) => return Ok(None),
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                return Err(WssocksError::Transport(format!("websocket read failed: {e}")))
            }
            None => return Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Compression;

    #[tokio::test]
    async fn request_completes_with_matching_response() {
        let (session, mut outbound) = Session::new(SessionRole::ForwardIngress);

        let requester = {
            let session = session.clone();
            tokio::spawn(async move {
                session
                    .request_connect(ConnectTarget::Tcp {
                        address: "example.test".into(),
                        port: 80,
                    })
                    .await
            })
        };

        // Pull the CONNECT off the outbound queue and answer it.
        let sent = outbound.recv().await.unwrap();
        let connect_id = match sent {
            Message::Connect { connect_id, .. } => connect_id,
            other => panic!("expected connect, got {other:?}"),
        };
        let channel_id = Uuid::new_v4();
        session
            .handle_frame(Message::ConnectResponse {
                success: true,
                channel_id,
                connect_id,
                protocol: Some(Protocol::Tcp),
                error: None,
            })
            .await
            .unwrap();

        let (got_channel, _rx) = requester.await.unwrap().unwrap();
        assert_eq!(got_channel, channel_id);
        assert_eq!(session.channels.len(), 1);
    }

    #[tokio::test]
    async fn failed_connect_surfaces_error() {
        let (session, mut outbound) = Session::new(SessionRole::ForwardIngress);
        let requester = {
            let session = session.clone();
            tokio::spawn(async move {
                session
                    .request_connect(ConnectTarget::Tcp {
                        address: "nope.test".into(),
                        port: 81,
                    })
                    .await
            })
        };
        let connect_id = match outbound.recv().await.unwrap() {
            Message::Connect { connect_id, .. } => connect_id,
            other => panic!("expected connect, got {other:?}"),
        };
        session
            .handle_frame(Message::ConnectResponse {
                success: false,
                channel_id: Uuid::nil(),
                connect_id,
                protocol: None,
                error: Some("connection refused".into()),
            })
            .await
            .unwrap();

        match requester.await.unwrap() {
            Err(WssocksError::Dial(e)) => assert_eq!(e, "connection refused"),
            other => panic!("expected dial error, got {other:?}"),
        }
        assert!(session.channels.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn request_times_out_without_response() {
        let (session, _outbound) = Session::new(SessionRole::ForwardIngress);
        let err = session
            .request_connect(ConnectTarget::Udp)
            .await
            .unwrap_err();
        assert!(matches!(err, WssocksError::Timeout));
    }

    #[tokio::test]
    async fn data_for_unknown_channel_answers_disconnect() {
        let (session, mut outbound) = Session::new(SessionRole::ForwardEgress);
        let channel_id = Uuid::new_v4();
        session
            .handle_frame(Message::Data {
                protocol: Protocol::Tcp,
                channel_id,
                compression: Compression::None,
                data: vec![1, 2, 3],
                udp: None,
            })
            .await
            .unwrap();
        match outbound.recv().await.unwrap() {
            Message::Disconnect { channel_id: got } => assert_eq!(got, channel_id),
            other => panic!("expected disconnect, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let (session, _outbound) = Session::new(SessionRole::ForwardEgress);
        let channel_id = Uuid::new_v4();
        let mut rx = session.channels.register(channel_id, Protocol::Tcp).unwrap();

        for _ in 0..3 {
            session
                .handle_frame(Message::Disconnect { channel_id })
                .await
                .unwrap();
        }
        match rx.recv().await {
            Some(ChannelEvent::Disconnect) | None => {}
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(session.channels.is_empty());
    }

    #[tokio::test]
    async fn channel_ids_are_distinct_across_connects() {
        let (session, mut outbound) = Session::new(SessionRole::ForwardIngress);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..32 {
            let requester = {
                let session = session.clone();
                tokio::spawn(async move { session.request_connect(ConnectTarget::Udp).await })
            };
            let connect_id = match outbound.recv().await.unwrap() {
                Message::Connect { connect_id, .. } => connect_id,
                other => panic!("expected connect, got {other:?}"),
            };
            let channel_id = Uuid::new_v4();
            session
                .handle_frame(Message::ConnectResponse {
                    success: true,
                    channel_id,
                    connect_id,
                    protocol: Some(Protocol::Udp),
                    error: None,
                })
                .await
                .unwrap();
            let (got, _rx) = requester.await.unwrap().unwrap();
            assert!(seen.insert(got), "duplicate channel id {got}");
        }
    }

    #[tokio::test]
    async fn close_fails_pending_and_drains_channels() {
        let (session, mut outbound) = Session::new(SessionRole::ForwardIngress);
        let requester = {
            let session = session.clone();
            tokio::spawn(async move { session.request_connect(ConnectTarget::Udp).await })
        };
        // Wait until the CONNECT is queued so the pending slot exists.
        outbound.recv().await.unwrap();
        let _ch = session.channels.register(Uuid::new_v4(), Protocol::Tcp).unwrap();

        session.close(CloseReason::Normal);
        assert!(session.is_closed());
        assert!(session.channels.is_empty());
        match requester.await.unwrap() {
            Err(WssocksError::Cancelled) => {}
            other => panic!("expected cancelled, got {other:?}"),
        }
    }
}
