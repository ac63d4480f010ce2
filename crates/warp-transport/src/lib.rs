//! Transport abstractions for WARP hosts.
//!
//! The client runtime only depends on the text-frame [`Transport`] and
//! [`TransportFactory`] traits defined here. [`memory`] provides an
//! in-process implementation for tests and simulations.

pub mod adapter;
pub mod error;
pub mod memory;

pub use adapter::{Transport, TransportEvent, TransportFactory, TransportHealthSnapshot};
pub use error::TransportError;
pub use memory::{MemoryNetwork, MemoryPeer, MemoryTransport};
