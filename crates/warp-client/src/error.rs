use thiserror::Error;
use warp_core::WarpError;
use warp_transport::TransportError;

use crate::state::DownlinkKind;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClientError {
    #[error(transparent)]
    Address(#[from] WarpError),
    #[error("client is closed")]
    ClientClosed,
    #[error("downlink is closed")]
    DownlinkClosed,
    #[error("downlink type mismatch: lane is linked as {existing:?}, requested {requested:?}")]
    KindMismatch {
        existing: DownlinkKind,
        requested: DownlinkKind,
    },
    #[error("index {index} out of bounds for list of length {len}")]
    IndexOutOfBounds { index: usize, len: usize },
    #[error("value coercion failed: {0}")]
    Coercion(String),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        Self::Coercion(err.to_string())
    }
}
