use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transport is not connected")]
    NotConnected,
    #[error("transport is closed")]
    Closed,
    #[error("outbound queue is full")]
    QueueFull,
    #[error("unsupported host scheme `{0}`")]
    UnsupportedScheme(String),
    #[error("send failed: {0}")]
    Send(String),
}
