//! Typed downlink handles.
//!
//! A handle is a lightweight view onto a shared model. Dropping or closing a
//! handle detaches it; the model unlinks when its last handle goes.

/// Methods every handle kind shares.
macro_rules! handle_common {
    () => {
        /// Address this downlink is linked to.
        pub fn address(&self) -> &warp_core::Address {
            self.core.address()
        }

        /// Link state of the shared model.
        pub fn link_state(&self) -> Result<crate::state::LinkState, crate::error::ClientError> {
            self.core.link_state()
        }

        pub fn is_linked(&self) -> bool {
            self.link_state().is_ok_and(crate::state::LinkState::is_linked)
        }

        pub fn is_synced(&self) -> bool {
            self.link_state().is_ok_and(crate::state::LinkState::is_synced)
        }

        /// Sends a raw command to the lane, buffered until the link is up.
        pub fn command(&self, body: warp_codec::Value) -> Result<(), crate::error::ClientError> {
            self.core.command(body)
        }

        /// Detaches this handle. Its observers get `did_close` on the next
        /// poll, and every later operation fails with `DownlinkClosed`.
        pub fn close(&self) {
            self.core.close();
        }

        pub fn is_closed(&self) -> bool {
            self.core.is_closed()
        }
    };
}

mod event;
mod list;
mod map;
mod value;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use warp_core::Address;

use crate::client::ClientShared;
use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::model::{DownlinkModel, Effects, HandleId};
use crate::observer::{DownlinkEvent, RawObserver};
use crate::state::LinkState;

pub use event::EventDownlink;
pub use list::ListDownlink;
pub use map::MapDownlink;
pub use value::ValueDownlink;

/// Observers and liveness of one handle, shared with queued notices.
#[derive(Default)]
pub(crate) struct HandleSlot {
    observers: Mutex<Vec<Arc<dyn RawObserver>>>,
    pub(crate) closed: AtomicBool,
    /// Set once `did_close` has been delivered; nothing follows it.
    retired: AtomicBool,
}

impl HandleSlot {
    pub(crate) fn notify(&self, event: &DownlinkEvent) {
        if self.retired.load(Ordering::SeqCst) {
            return;
        }
        if *event == DownlinkEvent::DidClose {
            self.retired.store(true, Ordering::SeqCst);
        }
        let observers = self
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for observer in observers {
            observer.notify(event);
        }
    }

    fn push(&self, observer: Arc<dyn RawObserver>) {
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }
}

pub(crate) struct HandleCore {
    client: Weak<ClientShared>,
    id: HandleId,
    address: Address,
    slot: Arc<HandleSlot>,
}

impl HandleCore {
    pub(crate) fn new(
        client: Weak<ClientShared>,
        id: HandleId,
        address: Address,
        slot: Arc<HandleSlot>,
    ) -> Self {
        Self {
            client,
            id,
            address,
            slot,
        }
    }

    fn client(&self) -> Result<Arc<ClientShared>, ClientError> {
        if self.is_closed() {
            return Err(ClientError::DownlinkClosed);
        }
        self.client.upgrade().ok_or(ClientError::ClientClosed)
    }

    pub(crate) fn address(&self) -> &Address {
        &self.address
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.slot.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn observe(&self, observer: Arc<dyn RawObserver>) -> Result<(), ClientError> {
        if self.is_closed() {
            return Err(ClientError::DownlinkClosed);
        }
        self.slot.push(observer);
        Ok(())
    }

    pub(crate) fn read<R>(&self, f: impl FnOnce(&DownlinkModel) -> R) -> Result<R, ClientError> {
        self.client()?.read_model(&self.address, f)
    }

    pub(crate) fn update<R>(
        &self,
        f: impl FnOnce(&mut DownlinkModel, &ClientConfig, &mut Effects) -> Result<R, ClientError>,
    ) -> Result<R, ClientError> {
        self.client()?.update_model(&self.address, f)
    }

    pub(crate) fn command(&self, body: warp_codec::Value) -> Result<(), ClientError> {
        self.update(|model, config, fx| {
            model.command(body, config, fx);
            Ok(())
        })
    }

    pub(crate) fn link_state(&self) -> Result<LinkState, ClientError> {
        self.read(DownlinkModel::link_state)
    }

    /// Detaches from the model. Idempotent.
    pub(crate) fn close(&self) {
        if self.slot.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(client) = self.client.upgrade() {
            client.close_handle(self.id);
        }
    }
}

impl Drop for HandleCore {
    fn drop(&mut self) {
        self.close();
    }
}
