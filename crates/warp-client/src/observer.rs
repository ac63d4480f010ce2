//! Observer traits for downlinks and the client.
//!
//! Every method has a no-op default, so observers implement only what they
//! care about. Callbacks are queued while the client lock is held and run on
//! whichever thread next calls `poll` (directly or through a
//! [`crate::ClientRunner`]) after the lock is released, so observers may call
//! back into the client.

use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use tracing::warn;
use warp_codec::Value;
use warp_core::Uri;

/// Lifecycle callbacks shared by every downlink kind.
pub trait DownlinkObserver: Send + Sync {
    /// A `link` or `sync` request is about to be sent.
    fn will_link(&self) {}
    /// The server acknowledged the link.
    fn did_link(&self) {}
    /// A `sync` request is about to be sent.
    fn will_sync(&self) {}
    /// The server finished replaying lane state.
    fn did_sync(&self) {}
    /// Raw body of every inbound `event`, before it is applied.
    fn on_event(&self, _body: &Value) {}
    /// The link was dropped by the server or by transport loss.
    fn did_unlink(&self) {}
    fn did_connect(&self) {}
    fn did_disconnect(&self) {}
    /// The transport failed to connect, or the link timed out.
    fn did_fail(&self, _error: &str) {}
    /// The downlink was closed; no further callbacks follow.
    fn did_close(&self) {}
}

pub trait ValueObserver<V>: DownlinkObserver {
    fn will_set(&self, _new_value: &V) {}
    /// `old_value` is `None` when the lane had no value yet.
    fn did_set(&self, _new_value: &V, _old_value: Option<&V>) {}
}

pub trait ListObserver<V>: DownlinkObserver {
    /// Item at `index` replaced, or appended when `old_value` is `None`.
    fn did_update(&self, _index: usize, _new_value: &V, _old_value: Option<&V>) {}
    fn did_insert(&self, _index: usize, _value: &V) {}
    fn did_remove(&self, _index: usize, _old_value: &V) {}
    fn did_move(&self, _from: usize, _to: usize, _value: &V) {}
    fn did_clear(&self) {}
    fn did_drop(&self, _count: usize) {}
    fn did_take(&self, _count: usize) {}
}

pub trait MapObserver<K, V>: DownlinkObserver {
    fn did_update(&self, _key: &K, _new_value: &V, _old_value: Option<&V>) {}
    fn did_remove(&self, _key: &K, _old_value: &V) {}
    fn did_clear(&self) {}
    fn did_drop(&self, _count: usize) {}
    fn did_take(&self, _count: usize) {}
}

/// Host-level session callbacks registered on the client.
pub trait ClientObserver: Send + Sync {
    fn did_connect(&self, _host: &Uri) {}
    fn did_authenticate(&self, _host: &Uri, _body: &Value) {}
    fn did_deauthenticate(&self, _host: &Uri, _body: &Value) {}
    fn did_disconnect(&self, _host: &Uri) {}
    fn did_fail(&self, _host: &Uri, _error: &str) {}
}

/// Registration token returned by [`crate::WarpClient::observe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObserverId(pub(crate) u64);

/// Host-level notice queued for client observers.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Connected(Uri),
    Authenticated(Uri, Value),
    Deauthenticated(Uri, Value),
    Disconnected(Uri),
    Failed(Uri, String),
}

impl ClientEvent {
    pub fn host(&self) -> &Uri {
        match self {
            Self::Connected(host)
            | Self::Authenticated(host, _)
            | Self::Deauthenticated(host, _)
            | Self::Disconnected(host)
            | Self::Failed(host, _) => host,
        }
    }

    pub(crate) fn dispatch(&self, observer: &dyn ClientObserver) {
        match self {
            Self::Connected(host) => observer.did_connect(host),
            Self::Authenticated(host, body) => observer.did_authenticate(host, body),
            Self::Deauthenticated(host, body) => observer.did_deauthenticate(host, body),
            Self::Disconnected(host) => observer.did_disconnect(host),
            Self::Failed(host, error) => observer.did_fail(host, error),
        }
    }
}

/// Untyped state change produced by applying an event or a local edit.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum StateChange {
    Set {
        old: Option<Value>,
        new: Value,
    },
    ListUpdate {
        index: usize,
        value: Value,
        old: Option<Value>,
    },
    ListInsert {
        index: usize,
        value: Value,
    },
    ListRemove {
        index: usize,
        old: Value,
    },
    ListMove {
        from: usize,
        to: usize,
        value: Value,
    },
    MapUpdate {
        key: Value,
        value: Value,
        old: Option<Value>,
    },
    MapRemove {
        key: Value,
        old: Value,
    },
    Clear,
    Drop(usize),
    Take(usize),
}

/// Untyped notice queued for one downlink handle.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum DownlinkEvent {
    WillLink,
    DidLink,
    WillSync,
    DidSync,
    DidUnlink,
    DidConnect,
    DidDisconnect,
    DidFail(String),
    DidClose,
    Event(Value),
    Change(StateChange),
}

/// Type-erased observer stored on a handle.
pub(crate) trait RawObserver: Send + Sync {
    fn notify(&self, event: &DownlinkEvent);
}

/// Dispatches lifecycle notices. Returns the change for kind-specific
/// handling, or `None` if the notice was consumed.
fn dispatch_lifecycle<'a>(
    observer: &dyn DownlinkObserver,
    event: &'a DownlinkEvent,
) -> Option<&'a StateChange> {
    match event {
        DownlinkEvent::WillLink => observer.will_link(),
        DownlinkEvent::DidLink => observer.did_link(),
        DownlinkEvent::WillSync => observer.will_sync(),
        DownlinkEvent::DidSync => observer.did_sync(),
        DownlinkEvent::DidUnlink => observer.did_unlink(),
        DownlinkEvent::DidConnect => observer.did_connect(),
        DownlinkEvent::DidDisconnect => observer.did_disconnect(),
        DownlinkEvent::DidFail(error) => observer.did_fail(error),
        DownlinkEvent::DidClose => observer.did_close(),
        DownlinkEvent::Event(body) => observer.on_event(body),
        DownlinkEvent::Change(change) => return Some(change),
    }
    None
}

fn coerce<T: DeserializeOwned>(value: &Value) -> Option<T> {
    match T::deserialize(value) {
        Ok(typed) => Some(typed),
        Err(err) => {
            warn!(error = %err, "dropping downlink update that does not match observer type");
            None
        }
    }
}

fn coerce_optional<T: DeserializeOwned>(value: Option<&Value>) -> Option<Option<T>> {
    match value {
        None => Some(None),
        Some(value) => coerce(value).map(Some),
    }
}

pub(crate) struct EventAdapter<O> {
    observer: Arc<O>,
}

impl<O> EventAdapter<O> {
    pub(crate) fn new(observer: Arc<O>) -> Self {
        Self { observer }
    }
}

impl<O: DownlinkObserver + 'static> RawObserver for EventAdapter<O> {
    fn notify(&self, event: &DownlinkEvent) {
        let _ = dispatch_lifecycle(self.observer.as_ref(), event);
    }
}

pub(crate) struct ValueAdapter<V, O> {
    observer: Arc<O>,
    _value: PhantomData<fn() -> V>,
}

impl<V, O> ValueAdapter<V, O> {
    pub(crate) fn new(observer: Arc<O>) -> Self {
        Self {
            observer,
            _value: PhantomData,
        }
    }
}

impl<V, O> RawObserver for ValueAdapter<V, O>
where
    V: DeserializeOwned + 'static,
    O: ValueObserver<V> + 'static,
{
    fn notify(&self, event: &DownlinkEvent) {
        let Some(StateChange::Set { old, new }) = dispatch_lifecycle(self.observer.as_ref(), event)
        else {
            return;
        };
        let Some(new_value) = coerce::<V>(new) else {
            return;
        };
        let Some(old_value) = coerce_optional::<V>(old.as_ref()) else {
            return;
        };
        self.observer.will_set(&new_value);
        self.observer.did_set(&new_value, old_value.as_ref());
    }
}

pub(crate) struct ListAdapter<V, O> {
    observer: Arc<O>,
    _value: PhantomData<fn() -> V>,
}

impl<V, O> ListAdapter<V, O> {
    pub(crate) fn new(observer: Arc<O>) -> Self {
        Self {
            observer,
            _value: PhantomData,
        }
    }
}

impl<V, O> RawObserver for ListAdapter<V, O>
where
    V: DeserializeOwned + 'static,
    O: ListObserver<V> + 'static,
{
    fn notify(&self, event: &DownlinkEvent) {
        let Some(change) = dispatch_lifecycle(self.observer.as_ref(), event) else {
            return;
        };
        let observer = self.observer.as_ref();
        match change {
            StateChange::ListUpdate { index, value, old } => {
                if let (Some(new_value), Some(old_value)) =
                    (coerce::<V>(value), coerce_optional::<V>(old.as_ref()))
                {
                    observer.did_update(*index, &new_value, old_value.as_ref());
                }
            }
            StateChange::ListInsert { index, value } => {
                if let Some(value) = coerce::<V>(value) {
                    observer.did_insert(*index, &value);
                }
            }
            StateChange::ListRemove { index, old } => {
                if let Some(old_value) = coerce::<V>(old) {
                    observer.did_remove(*index, &old_value);
                }
            }
            StateChange::ListMove { from, to, value } => {
                if let Some(value) = coerce::<V>(value) {
                    observer.did_move(*from, *to, &value);
                }
            }
            StateChange::Clear => observer.did_clear(),
            StateChange::Drop(count) => observer.did_drop(*count),
            StateChange::Take(count) => observer.did_take(*count),
            StateChange::Set { .. }
            | StateChange::MapUpdate { .. }
            | StateChange::MapRemove { .. } => {}
        }
    }
}

pub(crate) struct MapAdapter<K, V, O> {
    observer: Arc<O>,
    _entry: PhantomData<fn() -> (K, V)>,
}

impl<K, V, O> MapAdapter<K, V, O> {
    pub(crate) fn new(observer: Arc<O>) -> Self {
        Self {
            observer,
            _entry: PhantomData,
        }
    }
}

impl<K, V, O> RawObserver for MapAdapter<K, V, O>
where
    K: DeserializeOwned + 'static,
    V: DeserializeOwned + 'static,
    O: MapObserver<K, V> + 'static,
{
    fn notify(&self, event: &DownlinkEvent) {
        let Some(change) = dispatch_lifecycle(self.observer.as_ref(), event) else {
            return;
        };
        let observer = self.observer.as_ref();
        match change {
            StateChange::MapUpdate { key, value, old } => {
                if let (Some(key), Some(new_value), Some(old_value)) = (
                    coerce::<K>(key),
                    coerce::<V>(value),
                    coerce_optional::<V>(old.as_ref()),
                ) {
                    observer.did_update(&key, &new_value, old_value.as_ref());
                }
            }
            StateChange::MapRemove { key, old } => {
                if let (Some(key), Some(old_value)) = (coerce::<K>(key), coerce::<V>(old)) {
                    observer.did_remove(&key, &old_value);
                }
            }
            StateChange::Clear => observer.did_clear(),
            StateChange::Drop(count) => observer.did_drop(*count),
            StateChange::Take(count) => observer.did_take(*count),
            StateChange::Set { .. }
            | StateChange::ListUpdate { .. }
            | StateChange::ListInsert { .. }
            | StateChange::ListRemove { .. }
            | StateChange::ListMove { .. } => {}
        }
    }
}
