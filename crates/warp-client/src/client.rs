use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};
use warp_codec::Value;
use warp_core::{Address, Uri, WarpError};
use warp_transport::TransportFactory;

use crate::config::ClientConfig;
use crate::downlink::{EventDownlink, HandleCore, HandleSlot, ListDownlink, MapDownlink, ValueDownlink};
use crate::error::ClientError;
use crate::host::{HostConnection, HostContext, ReconnectTimer};
use crate::model::{DownlinkModel, Effects, HandleId};
use crate::observer::{ClientEvent, ClientObserver, DownlinkEvent, ObserverId};
use crate::state::{DownlinkKind, LinkOptions, LinkState};

struct HandleEntry {
    address: Address,
    slot: Arc<HandleSlot>,
}

enum Queued {
    Downlink(Arc<HandleSlot>, DownlinkEvent),
    Client(ClientEvent),
}

enum Delivery {
    Downlink(Arc<HandleSlot>, DownlinkEvent),
    Client(ClientEvent, Vec<Arc<dyn ClientObserver>>),
}

struct ClientState {
    closed: bool,
    online: bool,
    hosts: BTreeMap<Uri, HostConnection>,
    handles: BTreeMap<HandleId, HandleEntry>,
    next_handle: HandleId,
    observers: Vec<(ObserverId, Arc<dyn ClientObserver>)>,
    next_observer: u64,
    queued: VecDeque<Queued>,
    delivering: bool,
}

impl ClientState {
    /// Resolves effects against the handle table and queues them for delivery.
    fn absorb(&mut self, fx: Effects) {
        for (handle, event) in fx.notices {
            if let Some(entry) = self.handles.get(&handle) {
                self.queued
                    .push_back(Queued::Downlink(Arc::clone(&entry.slot), event));
            }
        }
        for event in fx.client {
            self.queued.push_back(Queued::Client(event));
        }
        for handle in fx.closed {
            self.retire_handle(handle);
        }
    }

    fn retire_handle(&mut self, handle: HandleId) {
        if let Some(entry) = self.handles.remove(&handle) {
            entry.slot.closed.store(true, Ordering::SeqCst);
            self.queued
                .push_back(Queued::Downlink(entry.slot, DownlinkEvent::DidClose));
        }
    }
}

pub(crate) struct ClientShared {
    config: ClientConfig,
    factory: Arc<dyn TransportFactory>,
    state: Mutex<ClientState>,
}

/// Resets the delivery flag even if an observer panics.
struct DeliveryGuard<'a> {
    shared: &'a ClientShared,
}

impl Drop for DeliveryGuard<'_> {
    fn drop(&mut self) {
        self.shared.lock().delivering = false;
    }
}

impl ClientShared {
    fn lock(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn context(&self, now: Instant, online: bool) -> HostContext<'_> {
        HostContext {
            now,
            config: &self.config,
            online,
        }
    }

    /// Delivers queued notices outside the lock. Re-entrant calls from
    /// inside a callback return at once; the outer pass picks up whatever
    /// they queued.
    fn deliver(&self) {
        loop {
            let batch: Vec<Delivery> = {
                let mut guard = self.lock();
                if guard.delivering || guard.queued.is_empty() {
                    return;
                }
                guard.delivering = true;
                let observers: Vec<Arc<dyn ClientObserver>> = guard
                    .observers
                    .iter()
                    .map(|(_, observer)| Arc::clone(observer))
                    .collect();
                guard
                    .queued
                    .drain(..)
                    .map(|queued| match queued {
                        Queued::Downlink(slot, event) => Delivery::Downlink(slot, event),
                        Queued::Client(event) => Delivery::Client(event, observers.clone()),
                    })
                    .collect()
            };
            let _guard = DeliveryGuard { shared: self };
            for delivery in batch {
                match delivery {
                    Delivery::Downlink(slot, event) => slot.notify(&event),
                    Delivery::Client(event, observers) => {
                        for observer in observers {
                            event.dispatch(observer.as_ref());
                        }
                    }
                }
            }
        }
    }

    pub(crate) fn read_model<R>(
        &self,
        address: &Address,
        f: impl FnOnce(&DownlinkModel) -> R,
    ) -> Result<R, ClientError> {
        let guard = self.lock();
        if guard.closed {
            return Err(ClientError::ClientClosed);
        }
        guard
            .hosts
            .get(address.host())
            .and_then(|host| host.model(address.node(), address.lane()))
            .map(f)
            .ok_or(ClientError::DownlinkClosed)
    }

    pub(crate) fn update_model<R>(
        &self,
        address: &Address,
        f: impl FnOnce(&mut DownlinkModel, &ClientConfig, &mut Effects) -> Result<R, ClientError>,
    ) -> Result<R, ClientError> {
        let mut guard = self.lock();
        let state = &mut *guard;
        if state.closed {
            return Err(ClientError::ClientClosed);
        }
        let ctx = self.context(Instant::now(), state.online);
        let mut fx = Effects::default();
        let result = state
            .hosts
            .get_mut(address.host())
            .and_then(|host| {
                host.with_model(ctx, address, &mut fx, |model, fx| f(model, &self.config, fx))
            })
            .unwrap_or(Err(ClientError::DownlinkClosed));
        state.absorb(fx);
        result
    }

    pub(crate) fn close_handle(&self, handle: HandleId) {
        let mut guard = self.lock();
        let state = &mut *guard;
        let Some(entry) = state.handles.get(&handle) else {
            return;
        };
        let address = entry.address.clone();
        let ctx = self.context(Instant::now(), state.online);
        let mut fx = Effects::default();
        if let Some(host) = state.hosts.get_mut(address.host()) {
            host.detach(ctx, handle, &address, &mut fx);
        }
        debug!(address = %address, handle, "downlink closed");
        state.retire_handle(handle);
        state.absorb(fx);
    }
}

/// Handle to a WARP client runtime. Clones share the same runtime.
#[derive(Clone)]
pub struct WarpClient {
    shared: Arc<ClientShared>,
}

impl WarpClient {
    pub fn new(config: ClientConfig, factory: Arc<dyn TransportFactory>) -> Self {
        let online = config.keep_online;
        Self {
            shared: Arc::new(ClientShared {
                config,
                factory,
                state: Mutex::new(ClientState {
                    closed: false,
                    online,
                    hosts: BTreeMap::new(),
                    handles: BTreeMap::new(),
                    next_handle: 1,
                    observers: Vec::new(),
                    next_observer: 1,
                    queued: VecDeque::new(),
                    delivering: false,
                }),
            }),
        }
    }

    /// Client with default configuration.
    pub fn with_factory(factory: impl TransportFactory + 'static) -> Self {
        Self::new(ClientConfig::default(), Arc::new(factory))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    fn open_handle(
        &self,
        kind: DownlinkKind,
        address: Address,
        options: LinkOptions,
    ) -> Result<HandleCore, ClientError> {
        let shared = &self.shared;
        let mut guard = shared.lock();
        let state = &mut *guard;
        if state.closed {
            return Err(ClientError::ClientClosed);
        }
        let host = match state.hosts.entry(address.host().clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let transport = shared.factory.open(entry.key())?;
                info!(host = %entry.key(), "host opened");
                let uri = entry.key().clone();
                entry.insert(HostConnection::new(uri, transport))
            }
        };

        let handle = state.next_handle;
        let ctx = shared.context(Instant::now(), state.online);
        let mut fx = Effects::default();
        host.attach(ctx, handle, &address, kind, &options, &mut fx)?;

        state.next_handle += 1;
        let slot = Arc::new(HandleSlot::default());
        state.handles.insert(
            handle,
            HandleEntry {
                address: address.clone(),
                slot: Arc::clone(&slot),
            },
        );
        state.absorb(fx);
        debug!(address = %address, handle, kind = ?kind, "downlink opened");
        Ok(HandleCore::new(Arc::downgrade(shared), handle, address, slot))
    }

    /// Opens a stateless downlink that only reports events.
    pub fn open_event_downlink(
        &self,
        address: Address,
        options: LinkOptions,
    ) -> Result<EventDownlink, ClientError> {
        self.open_handle(DownlinkKind::Event, address, options)
            .map(EventDownlink::new)
    }

    pub fn open_value_downlink<V>(
        &self,
        address: Address,
        options: LinkOptions,
    ) -> Result<ValueDownlink<V>, ClientError>
    where
        V: Serialize + DeserializeOwned + 'static,
    {
        self.open_handle(DownlinkKind::Value, address, options)
            .map(ValueDownlink::new)
    }

    pub fn open_list_downlink<V>(
        &self,
        address: Address,
        options: LinkOptions,
    ) -> Result<ListDownlink<V>, ClientError>
    where
        V: Serialize + DeserializeOwned + 'static,
    {
        self.open_handle(DownlinkKind::List, address, options)
            .map(ListDownlink::new)
    }

    pub fn open_map_downlink<K, V>(
        &self,
        address: Address,
        options: LinkOptions,
    ) -> Result<MapDownlink<K, V>, ClientError>
    where
        K: Serialize + DeserializeOwned + 'static,
        V: Serialize + DeserializeOwned + 'static,
    {
        self.open_handle(DownlinkKind::Map, address, options)
            .map(MapDownlink::new)
    }

    /// Sends a fire-and-forget command to a lane, queueing it until the host
    /// is connected.
    pub fn command(&self, address: &Address, body: Value) -> Result<(), ClientError> {
        self.with_host(address.host(), |host, ctx, fx| {
            host.command(ctx, address.node().clone(), address.lane().clone(), body, fx);
        })
    }

    /// Presents credentials to `host`, now and on every reconnect.
    pub fn authenticate(&self, host: &Uri, credentials: Value) -> Result<(), ClientError> {
        let host = endpoint(host)?;
        self.with_host(&host, |host, ctx, fx| host.authenticate(ctx, credentials, fx))
    }

    /// Drops stored credentials and sends `deauth` if connected.
    pub fn deauthenticate(&self, host: &Uri, body: Value) -> Result<(), ClientError> {
        let host = endpoint(host)?;
        let shared = &self.shared;
        let mut guard = shared.lock();
        let state = &mut *guard;
        if state.closed {
            return Err(ClientError::ClientClosed);
        }
        let ctx = shared.context(Instant::now(), state.online);
        let mut fx = Effects::default();
        if let Some(connection) = state.hosts.get_mut(&host) {
            connection.deauthenticate(ctx, body, &mut fx);
        }
        state.absorb(fx);
        Ok(())
    }

    fn with_host(
        &self,
        host: &Uri,
        f: impl FnOnce(&mut HostConnection, HostContext<'_>, &mut Effects),
    ) -> Result<(), ClientError> {
        let shared = &self.shared;
        let mut guard = shared.lock();
        let state = &mut *guard;
        if state.closed {
            return Err(ClientError::ClientClosed);
        }
        let connection = match state.hosts.entry(host.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let transport = shared.factory.open(host)?;
                info!(host = %host, "host opened");
                entry.insert(HostConnection::new(host.clone(), transport))
            }
        };
        let ctx = shared.context(Instant::now(), state.online);
        let mut fx = Effects::default();
        f(connection, ctx, &mut fx);
        state.absorb(fx);
        Ok(())
    }

    /// Pumps transport events and timers for every host, then delivers all
    /// queued callbacks on the calling thread.
    pub fn poll(&self, now: Instant) {
        let shared = &self.shared;
        {
            let mut guard = shared.lock();
            let state = &mut *guard;
            if !state.closed {
                let ctx = shared.context(now, state.online);
                let mut fx = Effects::default();
                for host in state.hosts.values_mut() {
                    host.poll_transport(ctx, &mut fx);
                    host.poll_timers(ctx, &mut fx);
                }
                let idle_timeout = shared.config.idle_timeout;
                state.hosts.retain(|uri, host| {
                    if !host.is_expired(now, idle_timeout) {
                        return true;
                    }
                    info!(host = %uri, "host idle, closing");
                    fx.closed.extend(host.close());
                    false
                });
                state.absorb(fx);
            }
        }
        shared.deliver();
    }

    /// Polls at the current instant.
    pub fn tick(&self) {
        self.poll(Instant::now());
    }

    /// Unlinks every downlink, closes every host, and retires every handle.
    /// Terminal and idempotent; safe to call from inside a callback.
    pub fn close(&self) {
        let shared = &self.shared;
        {
            let mut guard = shared.lock();
            let state = &mut *guard;
            if state.closed {
                return;
            }
            state.closed = true;
            let mut fx = Effects::default();
            for host in state.hosts.values_mut() {
                fx.closed.extend(host.close());
            }
            state.hosts.clear();
            fx.closed.extend(state.handles.keys().copied());
            state.absorb(fx);
            info!("client closed");
        }
        shared.deliver();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Goes online or offline. Offline hosts park their reconnect timers;
    /// going online reconnects parked hosts at once.
    pub fn set_online(&self, online: bool) {
        let shared = &self.shared;
        let mut guard = shared.lock();
        let state = &mut *guard;
        if state.closed || state.online == online {
            return;
        }
        state.online = online;
        info!(online, "client online state changed");
        let ctx = shared.context(Instant::now(), online);
        let mut fx = Effects::default();
        for host in state.hosts.values_mut() {
            host.set_online(ctx, &mut fx);
        }
        state.absorb(fx);
    }

    pub fn is_online(&self) -> bool {
        self.shared.lock().online
    }

    pub fn observe(&self, observer: Arc<dyn ClientObserver>) -> ObserverId {
        let mut state = self.shared.lock();
        let id = ObserverId(state.next_observer);
        state.next_observer += 1;
        state.observers.push((id, observer));
        id
    }

    /// Removes a client observer. Returns false if it was not registered.
    pub fn unobserve(&self, id: ObserverId) -> bool {
        let mut state = self.shared.lock();
        let before = state.observers.len();
        state.observers.retain(|(registered, _)| *registered != id);
        state.observers.len() != before
    }

    /// Number of open host connections.
    pub fn host_count(&self) -> usize {
        self.shared.lock().hosts.len()
    }

    /// Number of shared downlink models across all hosts.
    pub fn downlink_count(&self) -> usize {
        self.shared
            .lock()
            .hosts
            .values()
            .map(HostConnection::model_count)
            .sum()
    }

    /// Number of open downlink handles.
    pub fn handle_count(&self) -> usize {
        self.shared.lock().handles.len()
    }

    pub fn is_connected(&self, host: &Uri) -> bool {
        self.shared
            .lock()
            .hosts
            .get(host)
            .is_some_and(HostConnection::is_connected)
    }

    pub fn is_authenticated(&self, host: &Uri) -> bool {
        self.shared
            .lock()
            .hosts
            .get(host)
            .is_some_and(HostConnection::is_authenticated)
    }

    /// Body of the last `authed` received from `host` in its current session.
    pub fn session(&self, host: &Uri) -> Option<Value> {
        self.shared
            .lock()
            .hosts
            .get(host)
            .and_then(|connection| connection.session().cloned())
    }

    /// Link state of the model at `address`, if one exists.
    pub fn link_state(&self, address: &Address) -> Option<LinkState> {
        self.shared
            .lock()
            .hosts
            .get(address.host())
            .and_then(|host| host.model(address.node(), address.lane()))
            .map(DownlinkModel::link_state)
    }

    /// Envelopes queued for `host` while it cannot send.
    pub fn pending_outbound(&self, host: &Uri) -> usize {
        self.shared
            .lock()
            .hosts
            .get(host)
            .map_or(0, HostConnection::outbound_len)
    }

    /// Consecutive failed connection attempts for `host`.
    pub fn reconnect_attempt(&self, host: &Uri) -> Option<u32> {
        self.shared
            .lock()
            .hosts
            .get(host)
            .map(HostConnection::reconnect_attempt)
    }

    /// Whether `host` owes a reconnect that is parked until the client goes
    /// online.
    pub fn is_reconnect_pending(&self, host: &Uri) -> bool {
        self.shared
            .lock()
            .hosts
            .get(host)
            .is_some_and(|connection| connection.reconnect_timer() == ReconnectTimer::Pending)
    }
}

fn endpoint(host: &Uri) -> Result<Uri, ClientError> {
    host.endpoint()
        .ok_or(ClientError::Address(WarpError::InvalidAddress(
            "host must be absolute",
        )))
}
