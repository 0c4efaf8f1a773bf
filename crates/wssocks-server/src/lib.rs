//! wssocks-server: the server side of the wssocks tunnel.
//!
//! Accepts WebSocket connections, authenticates them against the token
//! registry, assigns roles (forward egress, reverse ingress, connector
//! bound), runs reverse SOCKS listeners per token, and optionally exposes
//! the HTTP admin API.

pub mod api;
pub mod listener;
pub mod server;
pub mod tokens;

pub use server::{ServerOptions, WsSocksServer};
pub use tokens::{ReverseTokenOptions, TokenRegistry};
