use thiserror::Error;

/// Shared lightweight error type for URI and address construction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WarpError {
    /// Malformed URI text.
    #[error("invalid uri: {0}")]
    InvalidUri(&'static str),
    /// A relative node URI was given without a host to resolve it against.
    #[error("no host for relative node uri `{0}`")]
    MissingHost(String),
    /// Address components are individually valid but do not form an address.
    #[error("invalid address: {0}")]
    InvalidAddress(&'static str),
}
