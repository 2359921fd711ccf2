use std::path::PathBuf;

/// Failure opening or using a channel transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("invalid connect request: {0}")]
    InvalidRequest(String),
    #[error("connection refused: {0}")]
    Refused(String),
    #[error("connection closed")]
    Closed,
}

/// Failure queueing an outbound message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("channel is not connected")]
    NotConnected,
    #[error("socket task has shut down")]
    Shutdown,
}

/// Failure loading a [`ClientConfig`](crate::ClientConfig).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}
