//! WARP wire codec primitives.
//!
//! Defines the envelope taxonomy, JSON text framing, and the structured bodies
//! carried by list and map lane events.

pub mod body;
pub mod envelope;
pub mod error;

pub use envelope::{Envelope, HostMessage, LaneMessage, LinkMessage};
pub use error::CodecError;

/// Structured value carried opaquely in envelope bodies.
pub type Value = serde_json::Value;
