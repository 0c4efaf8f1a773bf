//! wssocks-core: shared protocol library for the wssocks tunnel.
//!
//! Provides the binary frame codec, the per-session concurrency fabric
//! (send serializer, request correlation, channel registry), the TCP/UDP
//! relay pumps used on the egress side, and the SOCKS5 server frontend
//! used on the ingress side.

pub mod channel;
pub mod codec;
pub mod error;
pub mod messages;
pub mod relay;
pub mod session;
pub mod socks;

// Re-export commonly used items at crate root.
pub use codec::{pack_message, parse_message};
pub use error::{Result, WssocksError};
pub use messages::{ConnectTarget, ConnectorOp, Message, Protocol, PROTOCOL_VERSION};
pub use session::{Session, SessionRole};
