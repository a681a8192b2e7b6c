//! Error types for the wire layer

use thiserror::Error;

/// Result type alias using the wire-layer Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while talking to a backend
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Frame codec error: {0}")]
    Codec(#[from] tokio_util::codec::LinesCodecError),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("Operation timeout after {millis}ms")]
    Timeout { millis: u64 },
}
