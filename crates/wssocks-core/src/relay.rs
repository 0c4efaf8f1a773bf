//! Egress relay: dialing targets on behalf of CONNECT frames and pumping
//! bytes between sockets and the tunnel.
//!
//! Each TCP channel runs two pump tasks (socket→tunnel, tunnel→socket);
//! each UDP association runs one task multiplexing both directions with an
//! idle timer. All pumps exit on the session's cancellation signal.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::channel::ChannelEvent;
use crate::error::{Result, WssocksError};
use crate::messages::{Compression, ConnectTarget, Message, Protocol, UdpAddrs};
use crate::session::Session;

/// Resolve + dial budget for one CONNECT.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Idle UDP associations are reclaimed after this long.
pub const UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Read buffer for TCP pumps. Frames stay well under the 256 KiB payload
/// ceiling.
pub const TCP_CHUNK: usize = 64 * 1024;

const UDP_DATAGRAM_MAX: usize = 65536;

/// Handle a CONNECT frame on the egress side: dial the target, reply, and
/// start the pumps. Per-request failures are reported in the response and
/// never tear down the session.
pub async fn handle_connect(session: Arc<Session>, connect_id: Uuid, target: ConnectTarget) {
    let result = match target {
        ConnectTarget::Tcp { address, port } => dial_tcp(&session, &address, port).await,
        ConnectTarget::Udp => open_udp(&session).await,
    };

    match result {
        Ok((channel_id, protocol)) => {
            let reply = Message::ConnectResponse {
                success: true,
                channel_id,
                connect_id,
                protocol: Some(protocol),
                error: None,
            };
            if session.send(reply).await.is_err() {
                session.channels.remove(&channel_id);
            }
        }
        Err(e) => {
            debug!(session = %session.id(), connect = %connect_id, error = %e, "connect failed");
            let _ = session
                .send(Message::ConnectResponse {
                    success: false,
                    channel_id: Uuid::nil(),
                    connect_id,
                    protocol: None,
                    error: Some(e.to_string()),
                })
                .await;
        }
    }
}

async fn dial_tcp(session: &Arc<Session>, address: &str, port: u16) -> Result<(Uuid, Protocol)> {
    let addrs: Vec<std::net::SocketAddr> =
        match tokio::time::timeout(DIAL_TIMEOUT, tokio::net::lookup_host((address, port))).await {
            Ok(Ok(addrs)) => addrs.collect(),
            Ok(Err(e)) => {
                return Err(WssocksError::Resolve(format!("resolve {address}: {e}")));
            }
            Err(_) => return Err(WssocksError::Resolve(format!("resolve {address}: timed out"))),
        };
    if addrs.is_empty() {
        return Err(WssocksError::Resolve(format!("resolve {address}: no addresses")));
    }

    let stream = match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(addrs.as_slice())).await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(WssocksError::Dial(format!("connect {address}:{port}: {e}"))),
        Err(_) => {
            return Err(WssocksError::Dial(format!("connect {address}:{port}: timed out")))
        }
    };

    let channel_id = Uuid::new_v4();
    let rx = session.channels.register(channel_id, Protocol::Tcp)?;
    debug!(session = %session.id(), channel = %channel_id, target = %format!("{address}:{port}"),
           "tcp channel open");
    spawn_tcp_channel(session.clone(), channel_id, stream, rx);
    Ok((channel_id, Protocol::Tcp))
}

async fn open_udp(session: &Arc<Session>) -> Result<(Uuid, Protocol)> {
    let socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .map_err(|e| WssocksError::Alloc(format!("udp association bind: {e}")))?;
    let channel_id = Uuid::new_v4();
    let rx = session.channels.register(channel_id, Protocol::Udp)?;
    debug!(session = %session.id(), channel = %channel_id, "udp association open");
    tokio::spawn(run_udp_channel(session.clone(), channel_id, socket, rx));
    Ok((channel_id, Protocol::Udp))
}

/// Start the pump pair for an established TCP channel. Used on both sides:
/// the egress attaches the dialed socket, the ingress attaches the SOCKS
/// client socket.
pub fn spawn_tcp_channel(
    session: Arc<Session>,
    channel_id: Uuid,
    stream: TcpStream,
    inbound: mpsc::Receiver<ChannelEvent>,
) {
    let (read_half, write_half) = stream.into_split();
    tokio::spawn(pump_socket_to_tunnel(
        session.clone(),
        channel_id,
        read_half,
    ));
    tokio::spawn(pump_tunnel_to_socket(channel_id, write_half, inbound));
}

/// socket → tunnel: read chunks, wrap in DATA frames. EOF or error sends
/// DISCONNECT and removes the channel.
async fn pump_socket_to_tunnel(session: Arc<Session>, channel_id: Uuid, mut read_half: OwnedReadHalf) {
    let mut closed = session.closed();
    let mut buf = vec![0u8; TCP_CHUNK];
    loop {
        tokio::select! {
            _ = closed.changed() => {
                debug!(channel = %channel_id, "tcp pump cancelled");
                return;
            }
            result = read_half.read(&mut buf) => {
                match result {
                    Ok(0) => break,
                    Ok(n) => {
                        let frame = Message::Data {
                            protocol: Protocol::Tcp,
                            channel_id,
                            compression: Compression::None,
                            data: buf[..n].to_vec(),
                            udp: None,
                        };
                        if session.send(frame).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        debug!(channel = %channel_id, error = %e, "tcp read error");
                        break;
                    }
                }
            }
        }
    }
    if session.channels.remove(&channel_id) {
        let _ = session.send(Message::Disconnect { channel_id }).await;
    }
}

/// tunnel → socket: drain the inbound queue into the socket. Queue close
/// (channel removed) or a DISCONNECT event shuts the write side down.
async fn pump_tunnel_to_socket(
    channel_id: Uuid,
    mut write_half: OwnedWriteHalf,
    mut inbound: mpsc::Receiver<ChannelEvent>,
) {
    while let Some(event) = inbound.recv().await {
        match event {
            ChannelEvent::Data { data, .. } => {
                if let Err(e) = write_half.write_all(&data).await {
                    debug!(channel = %channel_id, error = %e, "tcp write error");
                    break;
                }
            }
            ChannelEvent::Disconnect => break,
        }
    }
    let _ = write_half.shutdown().await;
    debug!(channel = %channel_id, "tcp channel closed");
}

/// UDP association pump: one task for both directions plus idle reclaim.
///
/// ingress→egress frames carry the datagram destination in `dst`; replies
/// are framed with the remote sender as `src` and the association's local
/// binding as `dst`, so the ingress side can de-multiplex.
pub async fn run_udp_channel(
    session: Arc<Session>,
    channel_id: Uuid,
    socket: UdpSocket,
    mut inbound: mpsc::Receiver<ChannelEvent>,
) {
    let local = match socket.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            warn!(channel = %channel_id, error = %e, "udp association has no local address");
            session.channels.remove(&channel_id);
            return;
        }
    };
    let mut closed = session.closed();
    let mut buf = vec![0u8; UDP_DATAGRAM_MAX];
    let mut idle_at = Instant::now() + UDP_IDLE_TIMEOUT;

    loop {
        tokio::select! {
            _ = closed.changed() => {
                debug!(channel = %channel_id, "udp pump cancelled");
                return;
            }
            _ = tokio::time::sleep_until(idle_at) => {
                debug!(channel = %channel_id, "udp association idle, reclaiming");
                break;
            }
            event = inbound.recv() => {
                match event {
                    Some(ChannelEvent::Data { data, udp: Some(addrs) }) => {
                        idle_at = Instant::now() + UDP_IDLE_TIMEOUT;
                        let dst = (addrs.dst_addr.as_str(), addrs.dst_port);
                        if let Err(e) = socket.send_to(&data, dst).await {
                            debug!(channel = %channel_id, error = %e, "udp send error");
                        }
                    }
                    Some(ChannelEvent::Data { udp: None, .. }) => {
                        debug!(channel = %channel_id, "udp frame without addressing, dropped");
                    }
                    Some(ChannelEvent::Disconnect) | None => break,
                }
            }
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((n, peer)) => {
                        idle_at = Instant::now() + UDP_IDLE_TIMEOUT;
                        let frame = Message::Data {
                            protocol: Protocol::Udp,
                            channel_id,
                            compression: Compression::None,
                            data: buf[..n].to_vec(),
                            udp: Some(UdpAddrs {
                                src_addr: peer.ip().to_string(),
                                src_port: peer.port(),
                                dst_addr: local.ip().to_string(),
                                dst_port: local.port(),
                            }),
                        };
                        if session.send(frame).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        debug!(channel = %channel_id, error = %e, "udp recv error");
                        break;
                    }
                }
            }
        }
    }

    if session.channels.remove(&channel_id) {
        let _ = session.send(Message::Disconnect { channel_id }).await;
    }
    debug!(channel = %channel_id, "udp association closed");
}
