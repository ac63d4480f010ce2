use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::WarpError;
use crate::uri::Uri;

/// Immutable `(host, node, lane)` triple identifying one lane on one server.
///
/// Ordering is lexicographic on host, then node, then lane, which makes the
/// address usable directly as a nested registry key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address {
    host: Uri,
    node: Uri,
    lane: Uri,
}

impl Address {
    /// Builds an address from already-parsed parts. The host must be absolute.
    pub fn new(host: Uri, node: Uri, lane: Uri) -> Result<Self, WarpError> {
        if !host.is_absolute() {
            return Err(WarpError::InvalidAddress("host must be absolute"));
        }
        if lane.is_absolute() {
            return Err(WarpError::InvalidAddress("lane must be relative"));
        }
        Ok(Self { host, node, lane })
    }

    /// Resolves caller-supplied URI text into an address.
    ///
    /// When `host` is omitted the node URI must be absolute; its endpoint
    /// becomes the host and the remaining path becomes the node.
    pub fn resolve(host: Option<&str>, node: &str, lane: &str) -> Result<Self, WarpError> {
        let node = Uri::parse(node)?;
        let lane = Uri::parse(lane)?;
        let (host, node) = match host {
            Some(host) => {
                let host = Uri::parse(host)?;
                let endpoint = host
                    .endpoint()
                    .ok_or(WarpError::InvalidAddress("host must be absolute"))?;
                (endpoint, node)
            }
            None => {
                let endpoint = node
                    .endpoint()
                    .ok_or_else(|| WarpError::MissingHost(node.to_string()))?;
                let path = node.path();
                if path.is_empty() || path == "/" {
                    return Err(WarpError::InvalidAddress("node uri has no path"));
                }
                (endpoint, Uri::parse(path)?)
            }
        };
        Self::new(host, node, lane)
    }

    pub fn host(&self) -> &Uri {
        &self.host
    }

    pub fn node(&self) -> &Uri {
        &self.node
    }

    pub fn lane(&self) -> &Uri {
        &self.lane
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} node={} lane={}", self.host, self.node, self.lane)
    }
}
