//! Core WARP primitives shared across crates.
//!
//! Includes the URI newtype, the (host, node, lane) address triple, and base
//! errors.

pub mod address;
pub mod error;
pub mod uri;

pub use address::Address;
pub use error::WarpError;
pub use uri::Uri;
