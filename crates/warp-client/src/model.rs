//! Shared per-address downlink model.
//!
//! A model owns the link state machine and the last known lane state for one
//! `(host, node, lane)`. Every handle opened on that address attaches to the
//! same model; the model never touches the transport directly but records
//! envelopes and notices into an [`Effects`] buffer that its host drains.

use std::collections::{BTreeMap, VecDeque};
use std::mem;
use std::time::Instant;

use tracing::{debug, trace, warn};
use warp_codec::body::{ListAction, MapAction};
use warp_codec::{Envelope, Value};
use warp_core::Address;

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::observer::{ClientEvent, DownlinkEvent, StateChange};
use crate::state::{DownlinkKind, LinkOptions, LinkState};

pub(crate) type HandleId = u64;

/// Side effects produced while the client lock is held.
#[derive(Debug, Default)]
pub(crate) struct Effects {
    /// Envelopes for the host currently being operated on, in send order.
    pub envelopes: Vec<Envelope>,
    /// Per-handle notices in delivery order.
    pub notices: Vec<(HandleId, DownlinkEvent)>,
    /// Host-level notices for client observers.
    pub client: Vec<ClientEvent>,
    /// Handles the runtime closed on its own.
    pub closed: Vec<HandleId>,
}

/// Last known lane state, shaped by downlink kind.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum LaneState {
    Event,
    /// `None` until the lane reports or is given a value; a server `null`
    /// is a value.
    Value(Option<Value>),
    List(Vec<Value>),
    /// Entries keyed by the canonical JSON text of their key.
    Map(BTreeMap<String, (Value, Value)>),
}

pub(crate) fn map_key(key: &Value) -> String {
    key.to_string()
}

impl LaneState {
    fn new(kind: DownlinkKind) -> Self {
        match kind {
            DownlinkKind::Event => Self::Event,
            DownlinkKind::Value => Self::Value(None),
            DownlinkKind::List => Self::List(Vec::new()),
            DownlinkKind::Map => Self::Map(BTreeMap::new()),
        }
    }

    pub(crate) fn kind(&self) -> DownlinkKind {
        match self {
            Self::Event => DownlinkKind::Event,
            Self::Value(_) => DownlinkKind::Value,
            Self::List(_) => DownlinkKind::List,
            Self::Map(_) => DownlinkKind::Map,
        }
    }

    /// Changes that rebuild the current state from empty.
    fn replay(&self) -> Vec<StateChange> {
        match self {
            Self::Event => Vec::new(),
            Self::Value(None) => Vec::new(),
            Self::Value(Some(value)) => vec![StateChange::Set {
                old: None,
                new: value.clone(),
            }],
            Self::List(items) => items
                .iter()
                .enumerate()
                .map(|(index, value)| StateChange::ListInsert {
                    index,
                    value: value.clone(),
                })
                .collect(),
            Self::Map(entries) => entries
                .values()
                .map(|(key, value)| StateChange::MapUpdate {
                    key: key.clone(),
                    value: value.clone(),
                    old: None,
                })
                .collect(),
        }
    }
}

pub(crate) fn apply_list(
    items: &mut Vec<Value>,
    action: &ListAction,
) -> Result<StateChange, ClientError> {
    let len = items.len();
    let out_of_bounds = |index| ClientError::IndexOutOfBounds { index, len };
    let change = match action {
        ListAction::Update { index, value } => {
            let old = match items.get_mut(*index) {
                Some(slot) => Some(mem::replace(slot, value.clone())),
                None if *index == len => {
                    items.push(value.clone());
                    None
                }
                None => return Err(out_of_bounds(*index)),
            };
            StateChange::ListUpdate {
                index: *index,
                value: value.clone(),
                old,
            }
        }
        ListAction::Insert { index, value } => {
            if *index > len {
                return Err(out_of_bounds(*index));
            }
            items.insert(*index, value.clone());
            StateChange::ListInsert {
                index: *index,
                value: value.clone(),
            }
        }
        ListAction::Remove { index } => {
            if *index >= len {
                return Err(out_of_bounds(*index));
            }
            StateChange::ListRemove {
                index: *index,
                old: items.remove(*index),
            }
        }
        ListAction::Move { from, to } => {
            if *from >= len {
                return Err(out_of_bounds(*from));
            }
            if *to >= len {
                return Err(out_of_bounds(*to));
            }
            let value = items.remove(*from);
            items.insert(*to, value.clone());
            StateChange::ListMove {
                from: *from,
                to: *to,
                value,
            }
        }
        ListAction::Clear => {
            items.clear();
            StateChange::Clear
        }
        ListAction::Drop { count } => {
            let count = (*count).min(len);
            items.drain(..count);
            StateChange::Drop(count)
        }
        ListAction::Take { count } => {
            items.truncate(*count);
            StateChange::Take((*count).min(len))
        }
    };
    Ok(change)
}

/// Applies a keyed edit. Removing an absent key changes nothing.
pub(crate) fn apply_map(
    entries: &mut BTreeMap<String, (Value, Value)>,
    action: &MapAction,
) -> Option<StateChange> {
    match action {
        MapAction::Update { key, value } => {
            let old = entries
                .insert(map_key(key), (key.clone(), value.clone()))
                .map(|(_, old)| old);
            Some(StateChange::MapUpdate {
                key: key.clone(),
                value: value.clone(),
                old,
            })
        }
        MapAction::Remove { key } => {
            entries
                .remove(&map_key(key))
                .map(|(key, old)| StateChange::MapRemove { key, old })
        }
        MapAction::Clear => {
            entries.clear();
            Some(StateChange::Clear)
        }
        MapAction::Drop { count } => {
            let count = (*count).min(entries.len());
            match entries.keys().nth(count).cloned() {
                Some(first_kept) => *entries = entries.split_off(&first_kept),
                None => entries.clear(),
            }
            Some(StateChange::Drop(count))
        }
        MapAction::Take { count } => {
            let kept = (*count).min(entries.len());
            if let Some(first_dropped) = entries.keys().nth(*count).cloned() {
                let _dropped = entries.split_off(&first_dropped);
            }
            Some(StateChange::Take(kept))
        }
    }
}

#[derive(Debug)]
pub(crate) struct DownlinkModel {
    address: Address,
    options: LinkOptions,
    link_state: LinkState,
    /// A `sync` has been requested during the current link attempt.
    sync_requested: bool,
    state: LaneState,
    /// Attached handles in attachment order.
    handles: Vec<HandleId>,
    /// Commands issued before the link was acknowledged.
    pending_commands: VecDeque<Value>,
    link_deadline: Option<Instant>,
    relink_at: Option<Instant>,
}

impl DownlinkModel {
    pub(crate) fn new(address: Address, kind: DownlinkKind, options: LinkOptions) -> Self {
        Self {
            address,
            options,
            link_state: LinkState::Unlinked,
            sync_requested: false,
            state: LaneState::new(kind),
            handles: Vec::new(),
            pending_commands: VecDeque::new(),
            link_deadline: None,
            relink_at: None,
        }
    }

    pub(crate) fn address(&self) -> &Address {
        &self.address
    }

    pub(crate) fn kind(&self) -> DownlinkKind {
        self.state.kind()
    }

    pub(crate) fn link_state(&self) -> LinkState {
        self.link_state
    }

    pub(crate) fn options(&self) -> &LinkOptions {
        &self.options
    }

    pub(crate) fn state(&self) -> &LaneState {
        &self.state
    }

    pub(crate) fn handles(&self) -> &[HandleId] {
        &self.handles
    }

    pub(crate) fn has_handles(&self) -> bool {
        !self.handles.is_empty()
    }

    pub(crate) fn pending_commands(&self) -> usize {
        self.pending_commands.len()
    }

    pub(crate) fn broadcast(&self, fx: &mut Effects, event: DownlinkEvent) {
        for handle in &self.handles {
            fx.notices.push((*handle, event.clone()));
        }
    }

    fn set_link_state(&mut self, next: LinkState) {
        debug_assert!(
            self.link_state.can_advance_to(next),
            "illegal link transition {:?} -> {:?}",
            self.link_state,
            next
        );
        self.link_state = next;
    }

    fn reset_link(&mut self) {
        self.link_state = LinkState::Unlinked;
        self.sync_requested = false;
        self.link_deadline = None;
        self.relink_at = None;
    }

    /// Attaches a handle, widening options and replaying cached state to it.
    ///
    /// Returns true if the attach turned on `keep_synced`.
    pub(crate) fn attach(
        &mut self,
        handle: HandleId,
        options: &LinkOptions,
        fx: &mut Effects,
    ) -> bool {
        let newly_synced = self.options.widen(options);
        self.handles.push(handle);
        if self.link_state.is_linked() {
            fx.notices.push((handle, DownlinkEvent::DidLink));
        }
        for change in self.state.replay() {
            fx.notices.push((handle, DownlinkEvent::Change(change)));
        }
        if self.link_state.is_synced() {
            fx.notices.push((handle, DownlinkEvent::DidSync));
        }
        newly_synced
    }

    /// Detaches a handle. Returns true if the model should be discarded.
    pub(crate) fn detach(&mut self, handle: HandleId, fx: &mut Effects) -> bool {
        self.handles.retain(|attached| *attached != handle);
        if self.has_handles() {
            return false;
        }
        self.release_commands(fx);
        if self.link_state != LinkState::Unlinked {
            debug!(address = %self.address, "last downlink closed, unlinking");
            fx.envelopes.push(Envelope::unlink(
                self.address.node().clone(),
                self.address.lane().clone(),
            ));
        }
        self.reset_link();
        !self.options.keep_linked
    }

    /// Sends `link` or `sync` for an unlinked model on a live transport.
    pub(crate) fn link(&mut self, now: Instant, config: &ClientConfig, fx: &mut Effects) {
        if self.link_state != LinkState::Unlinked {
            return;
        }
        self.set_link_state(LinkState::Linking);
        self.sync_requested = self.options.keep_synced;
        self.relink_at = None;
        self.link_deadline = deadline(now, config);

        self.broadcast(fx, DownlinkEvent::WillLink);
        let (node, lane) = (self.address.node().clone(), self.address.lane().clone());
        let LinkOptions {
            prio, rate, body, ..
        } = &self.options;
        let envelope = if self.sync_requested {
            self.broadcast(fx, DownlinkEvent::WillSync);
            Envelope::sync(node, lane, *prio, *rate, body.clone())
        } else {
            Envelope::link(node, lane, *prio, *rate, body.clone())
        };
        debug!(address = %self.address, tag = envelope.tag(), "linking");
        fx.envelopes.push(envelope);
    }

    /// Upgrades a plain link to a sync after `keep_synced` was widened.
    ///
    /// While still linking the `sync` is sent immediately but the state
    /// waits for `linked` before moving on to `Syncing`.
    pub(crate) fn request_sync(&mut self, now: Instant, config: &ClientConfig, fx: &mut Effects) {
        match self.link_state {
            LinkState::Linking if !self.sync_requested => {}
            LinkState::Linked => self.set_link_state(LinkState::Syncing),
            _ => return,
        }
        self.sync_requested = true;
        self.link_deadline = deadline(now, config);
        self.broadcast(fx, DownlinkEvent::WillSync);
        let LinkOptions {
            prio, rate, body, ..
        } = &self.options;
        fx.envelopes.push(Envelope::sync(
            self.address.node().clone(),
            self.address.lane().clone(),
            *prio,
            *rate,
            body.clone(),
        ));
    }

    pub(crate) fn on_linked(&mut self, fx: &mut Effects) {
        if self.link_state != LinkState::Linking {
            debug!(address = %self.address, state = ?self.link_state, "ignoring unexpected linked");
            return;
        }
        self.set_link_state(LinkState::Linked);
        self.broadcast(fx, DownlinkEvent::DidLink);
        self.release_commands(fx);
        if self.sync_requested {
            self.set_link_state(LinkState::Syncing);
        } else {
            self.link_deadline = None;
        }
    }

    pub(crate) fn on_synced(&mut self, fx: &mut Effects) {
        if self.link_state != LinkState::Syncing {
            debug!(address = %self.address, state = ?self.link_state, "ignoring unexpected synced");
            return;
        }
        self.set_link_state(LinkState::Synced);
        self.link_deadline = None;
        self.broadcast(fx, DownlinkEvent::DidSync);
    }

    pub(crate) fn on_event(&mut self, body: Value, fx: &mut Effects) {
        if !self.link_state.is_linked() {
            debug!(address = %self.address, state = ?self.link_state, "dropping event for unlinked lane");
            return;
        }
        trace!(address = %self.address, "event");
        self.broadcast(fx, DownlinkEvent::Event(body.clone()));
        let change = match &mut self.state {
            LaneState::Event => None,
            LaneState::Value(current) => Some(StateChange::Set {
                old: current.replace(body.clone()),
                new: body,
            }),
            LaneState::List(items) => match ListAction::from_body(&body) {
                Ok(action) => match apply_list(items, &action) {
                    Ok(change) => Some(change),
                    Err(err) => {
                        warn!(address = %self.address, error = %err, "ignoring list event");
                        None
                    }
                },
                Err(err) => {
                    warn!(address = %self.address, error = %err, "malformed list event body");
                    None
                }
            },
            LaneState::Map(entries) => match MapAction::from_body(&body) {
                Ok(action) => apply_map(entries, &action),
                Err(err) => {
                    warn!(address = %self.address, error = %err, "malformed map event body");
                    None
                }
            },
        };
        if let Some(change) = change {
            self.broadcast(fx, DownlinkEvent::Change(change));
        }
    }

    /// Handles a server `unlinked`. Returns true if the model should be
    /// discarded because its handles do not keep the link.
    pub(crate) fn on_unlinked(
        &mut self,
        now: Instant,
        config: &ClientConfig,
        fx: &mut Effects,
    ) -> bool {
        if self.link_state == LinkState::Unlinked {
            return false;
        }
        self.reset_link();
        self.broadcast(fx, DownlinkEvent::DidUnlink);
        if !self.has_handles() {
            return false;
        }
        if self.options.keep_linked {
            self.relink_at = Some(now + config.relink_delay);
            return false;
        }
        fx.closed.append(&mut self.handles);
        self.release_commands(fx);
        true
    }

    /// Forces the model unlinked after transport loss. Returns true if the
    /// model should be discarded because its handles do not keep the link.
    pub(crate) fn on_transport_lost(&mut self, fx: &mut Effects) -> bool {
        let was = self.link_state;
        self.reset_link();
        if was != LinkState::Unlinked {
            self.broadcast(fx, DownlinkEvent::DidUnlink);
        }
        if self.options.keep_linked || !self.has_handles() {
            return false;
        }
        fx.closed.append(&mut self.handles);
        self.release_commands(fx);
        true
    }

    /// Sends a command now, or buffers it until `linked` arrives while
    /// handles are waiting on the link.
    pub(crate) fn command(&mut self, body: Value, config: &ClientConfig, fx: &mut Effects) {
        if self.link_state.is_linked() || !self.has_handles() {
            fx.envelopes.push(Envelope::command(
                self.address.node().clone(),
                self.address.lane().clone(),
                body,
            ));
            return;
        }
        if let Some(limit) = config.max_outbound_queue {
            while self.pending_commands.len() >= limit.max(1) {
                self.pending_commands.pop_front();
                warn!(address = %self.address, "pending command queue full, dropping oldest");
            }
        }
        self.pending_commands.push_back(body);
    }

    /// Hands buffered commands to the host queue in issue order.
    fn release_commands(&mut self, fx: &mut Effects) {
        let (node, lane) = (self.address.node(), self.address.lane());
        fx.envelopes.extend(
            self.pending_commands
                .drain(..)
                .map(|body| Envelope::command(node.clone(), lane.clone(), body)),
        );
    }

    /// Optimistically replaces the value and commands the lane to do the same.
    pub(crate) fn set_value(
        &mut self,
        new: Value,
        config: &ClientConfig,
        fx: &mut Effects,
    ) -> Result<(), ClientError> {
        let LaneState::Value(current) = &mut self.state else {
            return Err(self.mismatch(DownlinkKind::Value));
        };
        let old = current.replace(new.clone());
        self.broadcast(
            fx,
            DownlinkEvent::Change(StateChange::Set {
                old,
                new: new.clone(),
            }),
        );
        self.command(new, config, fx);
        Ok(())
    }

    pub(crate) fn edit_list(
        &mut self,
        action: ListAction,
        config: &ClientConfig,
        fx: &mut Effects,
    ) -> Result<StateChange, ClientError> {
        let LaneState::List(items) = &mut self.state else {
            return Err(self.mismatch(DownlinkKind::List));
        };
        let change = apply_list(items, &action)?;
        self.broadcast(fx, DownlinkEvent::Change(change.clone()));
        self.command(action.to_body(), config, fx);
        Ok(change)
    }

    pub(crate) fn edit_map(
        &mut self,
        action: MapAction,
        config: &ClientConfig,
        fx: &mut Effects,
    ) -> Result<Option<StateChange>, ClientError> {
        let LaneState::Map(entries) = &mut self.state else {
            return Err(self.mismatch(DownlinkKind::Map));
        };
        let change = apply_map(entries, &action);
        if let Some(change) = &change {
            self.broadcast(fx, DownlinkEvent::Change(change.clone()));
        }
        self.command(action.to_body(), config, fx);
        Ok(change)
    }

    fn mismatch(&self, requested: DownlinkKind) -> ClientError {
        ClientError::KindMismatch {
            existing: self.kind(),
            requested,
        }
    }

    pub(crate) fn link_timed_out(&self, now: Instant) -> bool {
        self.link_deadline.is_some_and(|deadline| now >= deadline)
    }

    pub(crate) fn relink_due(&self, now: Instant) -> bool {
        self.link_state == LinkState::Unlinked
            && self.has_handles()
            && self.relink_at.is_some_and(|at| now >= at)
    }
}

fn deadline(now: Instant, config: &ClientConfig) -> Option<Instant> {
    (!config.link_timeout.is_zero()).then(|| now + config.link_timeout)
}
