//! WARP client runtime.
//!
//! A [`WarpClient`] multiplexes any number of downlinks onto one transport per
//! host. Downlinks that name the same `(host, node, lane)` share a single
//! wire-level link and its cached state; the runtime relinks them after
//! transport loss and replays the cached state to late joiners.
//!
//! The runtime is driven explicitly: call [`WarpClient::poll`] (or spawn a
//! [`ClientRunner`]) to pump transport events and timers. Operations only
//! queue their callbacks; `poll` delivers them outside the client lock, so a
//! downlink opened between two polls can register its observers before it
//! hears anything.

pub mod client;
pub mod config;
pub mod downlink;
pub mod error;
pub mod observer;
pub mod runner;
pub mod state;

mod host;
mod model;

pub use client::WarpClient;
pub use config::ClientConfig;
pub use downlink::{EventDownlink, ListDownlink, MapDownlink, ValueDownlink};
pub use error::ClientError;
pub use observer::{
    ClientEvent, ClientObserver, DownlinkObserver, ListObserver, MapObserver, ObserverId,
    ValueObserver,
};
pub use runner::ClientRunner;
pub use state::{DownlinkKind, LinkOptions, LinkState};
pub use warp_codec::Value;
pub use warp_core::{Address, Uri};
