//! SOCKS5 server frontend (RFC 1928 + RFC 1929 subset).
//!
//! Negotiates NO AUTH or USERNAME/PASSWORD, accepts CONNECT and UDP
//! ASSOCIATE, and bridges accepted requests into a tunnel session. BIND is
//! answered with reply code 0x07.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tracing::debug;

use crate::channel::ChannelEvent;
use crate::error::{Result, WssocksError};
use crate::messages::{Compression, ConnectTarget, Message, Protocol, UdpAddrs};
use crate::relay::spawn_tcp_channel;
use crate::session::Session;

/// SOCKS protocol version.
pub const SOCKS_VERSION: u8 = 0x05;

const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USERPASS: u8 = 0x02;
const METHOD_NO_ACCEPTABLE: u8 = 0xFF;

/// SOCKS5 commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Connect = 0x01,
    Bind = 0x02,
    UdpAssociate = 0x03,
}

impl TryFrom<u8> for Command {
    type Error = WssocksError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Command::Connect),
            0x02 => Ok(Command::Bind),
            0x03 => Ok(Command::UdpAssociate),
            other => Err(WssocksError::Protocol(format!(
                "unsupported socks command: 0x{other:02x}"
            ))),
        }
    }
}

/// SOCKS5 reply codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplyCode {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TtlExpired = 0x06,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

/// Destination address in a SOCKS request or UDP header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    IPv4([u8; 4]),
    IPv6([u8; 16]),
    Domain(String),
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::IPv4(octets) => write!(f, "{}", std::net::Ipv4Addr::from(*octets)),
            Address::IPv6(octets) => write!(f, "{}", std::net::Ipv6Addr::from(*octets)),
            Address::Domain(domain) => write!(f, "{domain}"),
        }
    }
}

/// A parsed SOCKS5 request.
#[derive(Debug)]
pub struct SocksRequest {
    pub command: Command,
    pub address: Address,
    pub port: u16,
}

/// Username/password required from SOCKS clients (RFC 1929). Configured per
/// token on the reverse side, per listener on the forward side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocksAuth {
    pub username: String,
    pub password: String,
}

/// Map a tunneled egress failure string onto the closest SOCKS5 reply code.
pub fn reply_code_for(error: &str) -> ReplyCode {
    let e = error.to_ascii_lowercase();
    if e.contains("resolve") || e.contains("no such host") || e.contains("dns") {
        ReplyCode::HostUnreachable
    } else if e.contains("refused") {
        ReplyCode::ConnectionRefused
    } else if e.contains("unreachable") {
        ReplyCode::NetworkUnreachable
    } else if e.contains("timed out") || e.contains("timeout") {
        ReplyCode::TtlExpired
    } else {
        ReplyCode::GeneralFailure
    }
}

// ── Handshake parsing ────────────────────────────────────────────────

/// Run method negotiation and (when configured) username/password
/// authentication, then read the request.
pub async fn handshake<S>(stream: &mut S, auth: Option<&SocksAuth>) -> Result<SocksRequest>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let version = stream.read_u8().await?;
    if version != SOCKS_VERSION {
        return Err(WssocksError::Protocol(format!(
            "unsupported socks version: 0x{version:02x}"
        )));
    }
    let nmethods = stream.read_u8().await? as usize;
    let mut methods = vec![0u8; nmethods];
    stream.read_exact(&mut methods).await?;

    let wanted = if auth.is_some() {
        METHOD_USERPASS
    } else {
        METHOD_NO_AUTH
    };
    if !methods.contains(&wanted) {
        stream
            .write_all(&[SOCKS_VERSION, METHOD_NO_ACCEPTABLE])
            .await?;
        return Err(WssocksError::Auth("no acceptable socks method".into()));
    }
    stream.write_all(&[SOCKS_VERSION, wanted]).await?;

    if let Some(auth) = auth {
        let (username, password) = read_userpass(stream).await?;
        let ok = username == auth.username && password == auth.password;
        let status = if ok { 0x00 } else { 0x01 };
        stream.write_all(&[0x01, status]).await?;
        if !ok {
            return Err(WssocksError::Auth(format!(
                "socks credentials rejected for {username}"
            )));
        }
    }

    read_request(stream).await
}

async fn read_userpass<S>(stream: &mut S) -> Result<(String, String)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let version = stream.read_u8().await?;
    if version != 0x01 {
        return Err(WssocksError::Protocol(format!(
            "unsupported userpass version: 0x{version:02x}"
        )));
    }
    let ulen = stream.read_u8().await? as usize;
    let mut ubuf = vec![0u8; ulen];
    stream.read_exact(&mut ubuf).await?;
    let username = String::from_utf8(ubuf)
        .map_err(|_| WssocksError::Protocol("invalid username encoding".into()))?;

    let plen = stream.read_u8().await? as usize;
    let mut pbuf = vec![0u8; plen];
    stream.read_exact(&mut pbuf).await?;
    let password = String::from_utf8(pbuf)
        .map_err(|_| WssocksError::Protocol("invalid password encoding".into()))?;

    Ok((username, password))
}

async fn read_request<S>(stream: &mut S) -> Result<SocksRequest>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        return Err(WssocksError::Protocol(format!(
            "unsupported socks version: 0x{:02x}",
            head[0]
        )));
    }
    let command = Command::try_from(head[1])?;
    let address = read_address(stream, head[3]).await?;
    let port = stream.read_u16().await?;
    Ok(SocksRequest {
        command,
        address,
        port,
    })
}

async fn read_address<S>(stream: &mut S, atyp: u8) -> Result<Address>
where
    S: AsyncRead + Unpin,
{
    match atyp {
        0x01 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            Ok(Address::IPv4(octets))
        }
        0x03 => {
            let len = stream.read_u8().await? as usize;
            let mut buf = vec![0u8; len];
            stream.read_exact(&mut buf).await?;
            let domain = String::from_utf8(buf)
                .map_err(|_| WssocksError::Protocol("invalid domain encoding".into()))?;
            Ok(Address::Domain(domain))
        }
        0x04 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            Ok(Address::IPv6(octets))
        }
        other => Err(WssocksError::Protocol(format!(
            "unsupported address type: 0x{other:02x}"
        ))),
    }
}

/// Send a SOCKS5 reply with a socket-address bind field.
pub async fn send_reply<S>(stream: &mut S, reply: ReplyCode, bind: SocketAddr) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut buf = vec![SOCKS_VERSION, reply as u8, 0x00];
    match bind {
        SocketAddr::V4(v4) => {
            buf.push(0x01);
            buf.extend_from_slice(&v4.ip().octets());
        }
        SocketAddr::V6(v6) => {
            buf.push(0x04);
            buf.extend_from_slice(&v6.ip().octets());
        }
    }
    buf.extend_from_slice(&bind.port().to_be_bytes());
    stream.write_all(&buf).await?;
    Ok(())
}

// ── UDP packet header (RFC 1928 §7) ──────────────────────────────────

/// A datagram relayed between the SOCKS client and the tunnel:
/// `RSV(2) FRAG(1) ATYP(1) ADDR PORT(2) DATA`.
#[derive(Debug, PartialEq, Eq)]
pub struct UdpPacket {
    pub address: Address,
    pub port: u16,
    pub data: Bytes,
}

/// Parse a SOCKS UDP datagram. Fragmented datagrams are dropped per RFC.
pub fn parse_udp_packet(buf: Bytes) -> Result<UdpPacket> {
    if buf.len() < 4 {
        return Err(WssocksError::Protocol("udp packet too short".into()));
    }
    let frag = buf[2];
    if frag != 0 {
        return Err(WssocksError::Protocol(
            "udp fragmentation not supported".into(),
        ));
    }
    let atyp = buf[3];
    let mut pos = 4;
    let address = match atyp {
        0x01 => {
            if buf.len() < pos + 4 {
                return Err(WssocksError::Protocol("udp packet ipv4 truncated".into()));
            }
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&buf[pos..pos + 4]);
            pos += 4;
            Address::IPv4(octets)
        }
        0x03 => {
            if buf.len() < pos + 1 {
                return Err(WssocksError::Protocol("udp packet domain truncated".into()));
            }
            let len = buf[pos] as usize;
            pos += 1;
            if buf.len() < pos + len {
                return Err(WssocksError::Protocol("udp packet domain truncated".into()));
            }
            let domain = String::from_utf8(buf[pos..pos + len].to_vec())
                .map_err(|_| WssocksError::Protocol("invalid domain encoding".into()))?;
            pos += len;
            Address::Domain(domain)
        }
        0x04 => {
            if buf.len() < pos + 16 {
                return Err(WssocksError::Protocol("udp packet ipv6 truncated".into()));
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[pos..pos + 16]);
            pos += 16;
            Address::IPv6(octets)
        }
        other => {
            return Err(WssocksError::Protocol(format!(
                "unsupported address type: 0x{other:02x}"
            )))
        }
    };
    if buf.len() < pos + 2 {
        return Err(WssocksError::Protocol("udp packet port truncated".into()));
    }
    let port = u16::from_be_bytes([buf[pos], buf[pos + 1]]);
    pos += 2;
    Ok(UdpPacket {
        address,
        port,
        data: buf.slice(pos..),
    })
}

/// Serialize a SOCKS UDP datagram.
pub fn build_udp_packet(address: &Address, port: u16, data: &[u8]) -> Vec<u8> {
    let mut buf = vec![0x00, 0x00, 0x00];
    match address {
        Address::IPv4(octets) => {
            buf.push(0x01);
            buf.extend_from_slice(octets);
        }
        Address::IPv6(octets) => {
            buf.push(0x04);
            buf.extend_from_slice(octets);
        }
        Address::Domain(domain) => {
            buf.push(0x03);
            buf.push(domain.len().min(255) as u8);
            buf.extend_from_slice(&domain.as_bytes()[..domain.len().min(255)]);
        }
    }
    buf.extend_from_slice(&port.to_be_bytes());
    buf.extend_from_slice(data);
    buf
}

/// Parse an address string coming back over the tunnel into a reply/header
/// address. Non-IP strings become domains.
fn address_from_str(s: &str) -> Address {
    match s.parse::<std::net::IpAddr>() {
        Ok(std::net::IpAddr::V4(ip)) => Address::IPv4(ip.octets()),
        Ok(std::net::IpAddr::V6(ip)) => Address::IPv6(ip.octets()),
        Err(_) => Address::Domain(s.to_string()),
    }
}

// ── Frontend driver ──────────────────────────────────────────────────

/// Bridge a negotiated request into `session`. Dispatchers run
/// [`handshake`] first so the SOCKS negotiation can complete before a
/// serving session is known.
pub async fn serve_request(
    mut stream: TcpStream,
    request: SocksRequest,
    session: Arc<Session>,
) -> Result<()> {
    match request.command {
        Command::Connect => serve_connect(stream, request, session).await,
        Command::UdpAssociate => serve_udp_associate(stream, session).await,
        Command::Bind => {
            let bind = stream.local_addr()?;
            send_reply(&mut stream, ReplyCode::CommandNotSupported, bind).await?;
            Err(WssocksError::Protocol("bind not supported".into()))
        }
    }
}

async fn serve_connect(
    mut stream: TcpStream,
    request: SocksRequest,
    session: Arc<Session>,
) -> Result<()> {
    let bind = stream.local_addr()?;
    let target = ConnectTarget::Tcp {
        address: request.address.to_string(),
        port: request.port,
    };
    match session.request_connect(target).await {
        Ok((channel_id, inbound)) => {
            send_reply(&mut stream, ReplyCode::Succeeded, bind).await?;
            debug!(channel = %channel_id, target = %format!("{}:{}", request.address, request.port),
                   "socks connect bridged");
            spawn_tcp_channel(session, channel_id, stream, inbound);
            Ok(())
        }
        Err(e) => {
            let code = reply_code_for(&e.to_string());
            send_reply(&mut stream, code, bind).await?;
            Err(e)
        }
    }
}

async fn serve_udp_associate(mut stream: TcpStream, session: Arc<Session>) -> Result<()> {
    let bind_ip = stream.local_addr()?.ip();
    let relay = match UdpSocket::bind((bind_ip, 0)).await {
        Ok(socket) => socket,
        Err(e) => {
            let bind = stream.local_addr()?;
            send_reply(&mut stream, ReplyCode::GeneralFailure, bind).await?;
            return Err(WssocksError::Alloc(format!("udp relay bind: {e}")));
        }
    };
    let relay_addr = relay.local_addr()?;

    let (channel_id, mut inbound) = match session.request_connect(ConnectTarget::Udp).await {
        Ok(open) => open,
        Err(e) => {
            send_reply(&mut stream, reply_code_for(&e.to_string()), relay_addr).await?;
            return Err(e);
        }
    };
    send_reply(&mut stream, ReplyCode::Succeeded, relay_addr).await?;
    debug!(channel = %channel_id, relay = %relay_addr, "udp associate open");

    let mut closed = session.closed();
    let mut dgram = vec![0u8; 65536];
    let mut control = [0u8; 64];
    let mut client: Option<SocketAddr> = None;

    loop {
        tokio::select! {
            _ = closed.changed() => break,

            // The association lives as long as the TCP control connection.
            read = stream.read(&mut control) => {
                match read {
                    Ok(0) | Err(_) => break,
                    Ok(_) => continue,
                }
            }

            result = relay.recv_from(&mut dgram) => {
                let (n, peer) = match result {
                    Ok(ok) => ok,
                    Err(e) => {
                        debug!(channel = %channel_id, error = %e, "udp relay recv error");
                        break;
                    }
                };
                if client.is_none() {
                    client = Some(peer);
                }
                let packet = match parse_udp_packet(Bytes::copy_from_slice(&dgram[..n])) {
                    Ok(packet) => packet,
                    Err(e) => {
                        debug!(channel = %channel_id, error = %e, "dropping bad udp datagram");
                        continue;
                    }
                };
                let frame = Message::Data {
                    protocol: Protocol::Udp,
                    channel_id,
                    compression: Compression::None,
                    data: packet.data.to_vec(),
                    udp: Some(UdpAddrs {
                        src_addr: relay_addr.ip().to_string(),
                        src_port: relay_addr.port(),
                        dst_addr: packet.address.to_string(),
                        dst_port: packet.port,
                    }),
                };
                if session.send(frame).await.is_err() {
                    break;
                }
            }

            event = inbound.recv() => {
                match event {
                    Some(ChannelEvent::Data { data, udp: Some(addrs) }) => {
                        let Some(client) = client else { continue };
                        let header = address_from_str(&addrs.src_addr);
                        let packet = build_udp_packet(&header, addrs.src_port, &data);
                        if let Err(e) = relay.send_to(&packet, client).await {
                            debug!(channel = %channel_id, error = %e, "udp relay send error");
                        }
                    }
                    Some(ChannelEvent::Data { udp: None, .. }) => continue,
                    Some(ChannelEvent::Disconnect) | None => break,
                }
            }
        }
    }

    if session.channels.remove(&channel_id) {
        let _ = session.send(Message::Disconnect { channel_id }).await;
    }
    debug!(channel = %channel_id, "udp associate closed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn handshake_no_auth_connect() {
        let (mut client, mut server) = duplex(1024);

        let driver = tokio::spawn(async move { handshake(&mut server, None).await });

        // greeting: version 5, one method (no auth)
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();
        assert_eq!(choice, [0x05, 0x00]);

        // request: CONNECT example.test:443
        let mut req = vec![0x05, 0x01, 0x00, 0x03, 12];
        req.extend_from_slice(b"example.test");
        req.extend_from_slice(&443u16.to_be_bytes());
        client.write_all(&req).await.unwrap();

        let request = driver.await.unwrap().unwrap();
        assert_eq!(request.command, Command::Connect);
        assert_eq!(request.address, Address::Domain("example.test".into()));
        assert_eq!(request.port, 443);
    }

    #[tokio::test]
    async fn handshake_userpass_rejects_bad_credentials() {
        let (mut client, mut server) = duplex(1024);
        let auth = SocksAuth {
            username: "user".into(),
            password: "secret".into(),
        };

        let driver = tokio::spawn(async move { handshake(&mut server, Some(&auth)).await });

        client.write_all(&[0x05, 0x02, 0x00, 0x02]).await.unwrap();
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();
        assert_eq!(choice, [0x05, 0x02]);

        // RFC 1929: version 1, ulen, user, plen, pass (wrong password)
        client
            .write_all(&[0x01, 0x04, b'u', b's', b'e', b'r', 0x03, b'b', b'a', b'd'])
            .await
            .unwrap();
        let mut status = [0u8; 2];
        client.read_exact(&mut status).await.unwrap();
        assert_eq!(status, [0x01, 0x01]);

        assert!(matches!(
            driver.await.unwrap(),
            Err(WssocksError::Auth(_))
        ));
    }

    #[tokio::test]
    async fn handshake_refuses_when_required_method_missing() {
        let (mut client, mut server) = duplex(1024);
        let auth = SocksAuth {
            username: "u".into(),
            password: "p".into(),
        };
        let driver = tokio::spawn(async move { handshake(&mut server, Some(&auth)).await });

        // Client only offers NO AUTH while the server requires USERPASS.
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();
        assert_eq!(choice, [0x05, 0xFF]);
        assert!(driver.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn handshake_parses_ipv4_and_ipv6() {
        for (atyp, addr_bytes, expected) in [
            (
                0x01u8,
                vec![1u8, 2, 3, 4],
                Address::IPv4([1, 2, 3, 4]),
            ),
            (
                0x04u8,
                vec![0u8; 16],
                Address::IPv6([0u8; 16]),
            ),
        ] {
            let (mut client, mut server) = duplex(1024);
            let driver = tokio::spawn(async move { handshake(&mut server, None).await });
            client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
            let mut choice = [0u8; 2];
            client.read_exact(&mut choice).await.unwrap();

            let mut req = vec![0x05, 0x01, 0x00, atyp];
            req.extend_from_slice(&addr_bytes);
            req.extend_from_slice(&53u16.to_be_bytes());
            client.write_all(&req).await.unwrap();

            let request = driver.await.unwrap().unwrap();
            assert_eq!(request.address, expected);
            assert_eq!(request.port, 53);
        }
    }

    #[test]
    fn udp_packet_roundtrip() {
        let packet = build_udp_packet(&Address::IPv4([8, 8, 8, 8]), 53, &[0xAA; 512]);
        let parsed = parse_udp_packet(Bytes::from(packet)).unwrap();
        assert_eq!(parsed.address, Address::IPv4([8, 8, 8, 8]));
        assert_eq!(parsed.port, 53);
        assert_eq!(parsed.data.len(), 512);

        let packet = build_udp_packet(&Address::Domain("dns.test".into()), 5353, b"q");
        let parsed = parse_udp_packet(Bytes::from(packet)).unwrap();
        assert_eq!(parsed.address, Address::Domain("dns.test".into()));
        assert_eq!(parsed.port, 5353);
    }

    #[test]
    fn udp_packet_drops_fragments() {
        let mut packet = build_udp_packet(&Address::IPv4([1, 1, 1, 1]), 53, b"x");
        packet[2] = 0x01;
        assert!(parse_udp_packet(Bytes::from(packet)).is_err());
    }

    #[test]
    fn reply_code_mapping() {
        assert_eq!(reply_code_for("resolve host: no such host"), ReplyCode::HostUnreachable);
        assert_eq!(reply_code_for("connection refused"), ReplyCode::ConnectionRefused);
        assert_eq!(reply_code_for("network is unreachable"), ReplyCode::NetworkUnreachable);
        assert_eq!(reply_code_for("connect 1.2.3.4:80: timed out"), ReplyCode::TtlExpired);
        assert_eq!(reply_code_for("something else"), ReplyCode::GeneralFailure);
    }
}
