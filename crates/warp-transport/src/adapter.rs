use warp_core::Uri;

use crate::error::TransportError;

/// Coarse per-transport health counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportHealthSnapshot {
    pub outbound_send_ok: u64,
    pub outbound_send_err: u64,
    pub inbound_received: u64,
    pub inbound_dropped: u64,
    pub connect_attempts: u64,
    pub last_error: Option<String>,
}

/// Something observed on a transport since the last poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The session requested by `connect` is open and can carry frames.
    Connected,
    /// One inbound text frame.
    Frame(String),
    /// The session ended or could not be opened.
    Disconnected(String),
}

/// Text-frame transport to a single host, driven by the client runtime.
///
/// Implementations never block: `connect` starts a session attempt whose
/// outcome is reported through `poll`, and `send` only enqueues.
pub trait Transport: Send {
    /// Starts opening a new session. A no-op while a session is live.
    fn connect(&mut self) -> Result<(), TransportError>;

    /// Enqueues one text frame on the live session.
    fn send(&mut self, frame: &str) -> Result<(), TransportError>;

    /// Returns the next pending transport event.
    fn poll(&mut self) -> Option<TransportEvent>;

    /// Ends the current session without reporting `Disconnected`.
    fn close(&mut self);

    /// Whether a session is currently open.
    fn is_connected(&self) -> bool;

    /// Best-effort health counters for operators.
    fn health_snapshot(&self) -> TransportHealthSnapshot {
        TransportHealthSnapshot::default()
    }
}

/// Opens one transport per host URI.
pub trait TransportFactory: Send + Sync {
    fn open(&self, host: &Uri) -> Result<Box<dyn Transport>, TransportError>;
}
