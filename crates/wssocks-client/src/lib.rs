//! wssocks-client: the client side of the wssocks tunnel.
//!
//! Dials the server over WebSocket, authenticates with a bearer token, and
//! either serves a local SOCKS5 listener (forward mode) or handles CONNECT
//! frames as the egress (reverse mode). Reconnects on session loss unless
//! configured otherwise.

pub mod client;

pub use client::{ClientOptions, WsSocksClient};
