use thiserror::Error;

/// Errors produced by the wssocks protocol layer.
///
/// A single channel's failure never tears down its session; `Resolve`,
/// `Dial` and `Timeout` are per-request and travel back over the tunnel as
/// failed responses. `Protocol` and `Auth` close the session.
#[derive(Debug, Error)]
pub enum WssocksError {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("resolve failed: {0}")]
    Resolve(String),

    #[error("dial failed: {0}")]
    Dial(String),

    #[error("timed out")]
    Timeout,

    #[error("channel gone: {0}")]
    ChannelGone(String),

    #[error("backpressure")]
    Backpressure,

    #[error("cancelled")]
    Cancelled,

    #[error("allocation failed: {0}")]
    Alloc(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, WssocksError>;
