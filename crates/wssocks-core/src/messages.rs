//! Tunnel message types.
//!
//! Every frame starts with a version byte (0x01) and a type byte; the
//! remaining layout is variant-specific. See [`crate::codec`] for the
//! byte-level encoding.

use uuid::Uuid;

/// Wire protocol version. Frames with any other first byte fail the parse.
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Maximum length of a length-prefixed string field (token, address, error).
pub const MAX_STRING_LEN: usize = 255;

/// Frame type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    Auth = 0x01,
    AuthResponse = 0x02,
    Connect = 0x03,
    Data = 0x04,
    ConnectResponse = 0x05,
    Disconnect = 0x06,
    Connector = 0x07,
    ConnectorResponse = 0x08,
}

impl TryFrom<u8> for FrameType {
    type Error = u8;

    fn try_from(v: u8) -> Result<Self, u8> {
        match v {
            0x01 => Ok(Self::Auth),
            0x02 => Ok(Self::AuthResponse),
            0x03 => Ok(Self::Connect),
            0x04 => Ok(Self::Data),
            0x05 => Ok(Self::ConnectResponse),
            0x06 => Ok(Self::Disconnect),
            0x07 => Ok(Self::Connector),
            0x08 => Ok(Self::ConnectorResponse),
            other => Err(other),
        }
    }
}

/// Stream protocol carried by CONNECT and DATA frames.
///
/// `0x00` on the wire means "unspecified" and is only legal in responses,
/// where it maps to `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Protocol {
    Tcp = 0x01,
    Udp = 0x02,
}

impl TryFrom<u8> for Protocol {
    type Error = u8;

    fn try_from(v: u8) -> Result<Self, u8> {
        match v {
            0x01 => Ok(Self::Tcp),
            0x02 => Ok(Self::Udp),
            other => Err(other),
        }
    }
}

/// Connector sub-protocol operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectorOp {
    Add = 0x01,
    Remove = 0x02,
}

impl TryFrom<u8> for ConnectorOp {
    type Error = u8;

    fn try_from(v: u8) -> Result<Self, u8> {
        match v {
            0x01 => Ok(Self::Add),
            0x02 => Ok(Self::Remove),
            other => Err(other),
        }
    }
}

/// DATA payload compression flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Compression {
    #[default]
    None = 0x00,
    Gzip = 0x01,
}

impl TryFrom<u8> for Compression {
    type Error = u8;

    fn try_from(v: u8) -> Result<Self, u8> {
        match v {
            0x00 => Ok(Self::None),
            0x01 => Ok(Self::Gzip),
            other => Err(other),
        }
    }
}

/// Target of a CONNECT request. UDP carries no address; the association is
/// established implicitly and addressed per-datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectTarget {
    Tcp { address: String, port: u16 },
    Udp,
}

impl ConnectTarget {
    pub fn protocol(&self) -> Protocol {
        match self {
            ConnectTarget::Tcp { .. } => Protocol::Tcp,
            ConnectTarget::Udp => Protocol::Udp,
        }
    }
}

/// Per-datagram addressing carried by UDP DATA frames: the sender-side
/// association endpoint and the datagram destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpAddrs {
    pub src_addr: String,
    pub src_port: u16,
    pub dst_addr: String,
    pub dst_port: u16,
}

/// A tunnel message. One constructor per frame type; the codec is a total
/// function over this sum.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Auth {
        token: String,
        reverse: bool,
    },
    AuthResponse {
        success: bool,
        error: Option<String>,
    },
    Connect {
        connect_id: Uuid,
        target: ConnectTarget,
    },
    ConnectResponse {
        success: bool,
        channel_id: Uuid,
        connect_id: Uuid,
        protocol: Option<Protocol>,
        error: Option<String>,
    },
    Data {
        protocol: Protocol,
        channel_id: Uuid,
        compression: Compression,
        data: Vec<u8>,
        /// Present iff `protocol` is UDP.
        udp: Option<UdpAddrs>,
    },
    Disconnect {
        channel_id: Uuid,
    },
    Connector {
        connect_id: Uuid,
        token: String,
        op: ConnectorOp,
    },
    ConnectorResponse {
        success: bool,
        connect_id: Uuid,
        token: Option<String>,
        error: Option<String>,
    },
}

impl Message {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Auth { .. } => "auth",
            Message::AuthResponse { .. } => "auth_response",
            Message::Connect { .. } => "connect",
            Message::ConnectResponse { .. } => "connect_response",
            Message::Data { .. } => "data",
            Message::Disconnect { .. } => "disconnect",
            Message::Connector { .. } => "connector",
            Message::ConnectorResponse { .. } => "connector_response",
        }
    }
}
