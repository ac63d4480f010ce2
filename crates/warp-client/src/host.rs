//! One physical connection to one WARP host.
//!
//! A host owns its transport, the node/lane registry of models addressed to
//! it, and the FIFO of outbound envelopes that could not be sent yet. It
//! reconnects with capped exponential backoff while any downlink still wants
//! it, and re-issues `link`/`sync` for every wanted model on each new
//! session.

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};
use warp_codec::envelope::{decode_envelope, encode_envelope};
use warp_codec::{Envelope, Value};
use warp_core::{Address, Uri};
use warp_transport::{Transport, TransportError, TransportEvent};

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::model::{DownlinkModel, Effects, HandleId};
use crate::observer::{ClientEvent, DownlinkEvent};
use crate::state::{DownlinkKind, LinkOptions, LinkState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransportState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReconnectTimer {
    /// No reconnect is planned.
    Idle,
    /// Reconnect once `at` has passed.
    Scheduled { at: Instant },
    /// A reconnect is owed but the client is offline.
    Pending,
}

/// Per-call inputs shared by every host operation.
#[derive(Debug, Clone, Copy)]
pub(crate) struct HostContext<'a> {
    pub now: Instant,
    pub config: &'a ClientConfig,
    pub online: bool,
}

pub(crate) struct HostConnection {
    uri: Uri,
    transport: Box<dyn Transport>,
    transport_state: TransportState,
    models: BTreeMap<Uri, BTreeMap<Uri, DownlinkModel>>,
    outbound: VecDeque<Envelope>,
    reconnect_attempt: u32,
    reconnect_timer: ReconnectTimer,
    credentials: Option<Value>,
    authenticated: bool,
    session: Option<Value>,
    idle_since: Option<Instant>,
}

impl HostConnection {
    pub(crate) fn new(uri: Uri, transport: Box<dyn Transport>) -> Self {
        Self {
            uri,
            transport,
            transport_state: TransportState::Disconnected,
            models: BTreeMap::new(),
            outbound: VecDeque::new(),
            reconnect_attempt: 0,
            reconnect_timer: ReconnectTimer::Idle,
            credentials: None,
            authenticated: false,
            session: None,
            idle_since: None,
        }
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.transport_state == TransportState::Connected
    }

    pub(crate) fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub(crate) fn session(&self) -> Option<&Value> {
        self.session.as_ref()
    }

    pub(crate) fn reconnect_timer(&self) -> ReconnectTimer {
        self.reconnect_timer
    }

    pub(crate) fn reconnect_attempt(&self) -> u32 {
        self.reconnect_attempt
    }

    pub(crate) fn outbound_len(&self) -> usize {
        self.outbound.len()
    }

    pub(crate) fn model(&self, node: &Uri, lane: &Uri) -> Option<&DownlinkModel> {
        self.models.get(node)?.get(lane)
    }

    fn model_mut(&mut self, node: &Uri, lane: &Uri) -> Option<&mut DownlinkModel> {
        self.models.get_mut(node)?.get_mut(lane)
    }

    fn remove_model(&mut self, node: &Uri, lane: &Uri) {
        if let Some(lanes) = self.models.get_mut(node) {
            lanes.remove(lane);
            if lanes.is_empty() {
                self.models.remove(node);
            }
        }
    }

    fn models(&self) -> impl Iterator<Item = &DownlinkModel> {
        self.models.values().flat_map(BTreeMap::values)
    }

    fn models_mut(&mut self) -> impl Iterator<Item = &mut DownlinkModel> {
        self.models.values_mut().flat_map(BTreeMap::values_mut)
    }

    pub(crate) fn model_count(&self) -> usize {
        self.models.values().map(BTreeMap::len).sum()
    }

    pub(crate) fn has_handles(&self) -> bool {
        self.models().any(DownlinkModel::has_handles)
    }

    /// Handles of every model, in registry then attachment order.
    pub(crate) fn handle_ids(&self) -> Vec<HandleId> {
        self.models()
            .flat_map(|model| model.handles().iter().copied())
            .collect()
    }

    /// Whether anything still needs this host's transport.
    fn is_wanted(&self) -> bool {
        self.has_handles() || !self.outbound.is_empty()
    }

    fn broadcast_all(&self, fx: &mut Effects, event: DownlinkEvent) {
        for model in self.models() {
            model.broadcast(fx, event.clone());
        }
    }

    /// Starts connecting unless connected, connecting, or backing off.
    fn open(&mut self, ctx: HostContext<'_>, fx: &mut Effects) {
        if self.transport_state != TransportState::Disconnected
            || matches!(self.reconnect_timer, ReconnectTimer::Scheduled { .. })
        {
            return;
        }
        if ctx.online {
            self.connect(ctx, fx);
        } else {
            self.reconnect_timer = ReconnectTimer::Pending;
        }
    }

    fn connect(&mut self, ctx: HostContext<'_>, fx: &mut Effects) {
        info!(host = %self.uri, attempt = self.reconnect_attempt, "connecting");
        self.transport_state = TransportState::Connecting;
        self.reconnect_timer = ReconnectTimer::Idle;
        if let Err(err) = self.transport.connect() {
            self.on_disconnected(ctx, err.to_string(), fx);
        }
    }

    fn on_connected(&mut self, ctx: HostContext<'_>, fx: &mut Effects) {
        if self.transport_state == TransportState::Connected {
            return;
        }
        info!(host = %self.uri, "connected");
        self.transport_state = TransportState::Connected;
        self.reconnect_timer = ReconnectTimer::Idle;
        // With links to make, backoff resets on the first `linked` instead.
        if !self.has_handles() {
            self.reconnect_attempt = 0;
        }
        fx.client.push(ClientEvent::Connected(self.uri.clone()));
        self.broadcast_all(fx, DownlinkEvent::DidConnect);

        if let Some(credentials) = &self.credentials {
            self.outbound
                .push_front(Envelope::auth(credentials.clone()));
        }
        for model in self.models_mut() {
            if model.has_handles() {
                model.link(ctx.now, ctx.config, fx);
            }
        }
        self.drain(ctx, fx);
    }

    fn on_disconnected(&mut self, ctx: HostContext<'_>, reason: String, fx: &mut Effects) {
        let was = self.transport_state;
        if was == TransportState::Disconnected {
            return;
        }
        self.transport_state = TransportState::Disconnected;
        self.authenticated = false;
        self.session = None;
        self.outbound
            .retain(|envelope| matches!(envelope, Envelope::Command(_)));

        let mut discarded = Vec::new();
        for model in self.models_mut() {
            if model.on_transport_lost(fx) {
                discarded.push((model.address().node().clone(), model.address().lane().clone()));
            }
        }
        for (node, lane) in discarded {
            self.remove_model(&node, &lane);
        }
        self.enqueue(ctx, fx);

        if was == TransportState::Connected {
            info!(host = %self.uri, reason = %reason, "disconnected");
            fx.client.push(ClientEvent::Disconnected(self.uri.clone()));
            self.broadcast_all(fx, DownlinkEvent::DidDisconnect);
        } else {
            warn!(host = %self.uri, reason = %reason, "connect failed");
            fx.client
                .push(ClientEvent::Failed(self.uri.clone(), reason.clone()));
            self.broadcast_all(fx, DownlinkEvent::DidFail(reason));
        }

        if self.is_wanted() {
            self.schedule_reconnect(ctx);
        }
    }

    fn schedule_reconnect(&mut self, ctx: HostContext<'_>) {
        let delay = ctx.config.reconnect_delay(self.reconnect_attempt);
        self.reconnect_attempt = self.reconnect_attempt.saturating_add(1);
        self.reconnect_timer = if ctx.online {
            ReconnectTimer::Scheduled {
                at: ctx.now + delay,
            }
        } else {
            ReconnectTimer::Pending
        };
        info!(
            host = %self.uri,
            attempt = self.reconnect_attempt,
            delay_ms = delay.as_millis() as u64,
            online = ctx.online,
            "reconnect scheduled"
        );
    }

    /// Moves produced envelopes onto the outbound queue and sends what the
    /// transport will take.
    fn drain(&mut self, ctx: HostContext<'_>, fx: &mut Effects) {
        self.enqueue(ctx, fx);
        self.flush(ctx, fx);
    }

    fn enqueue(&mut self, ctx: HostContext<'_>, fx: &mut Effects) {
        for envelope in fx.envelopes.drain(..) {
            if let (Envelope::Command(_), Some(limit)) = (&envelope, ctx.config.max_outbound_queue)
            {
                let queued = self
                    .outbound
                    .iter()
                    .filter(|queued| matches!(queued, Envelope::Command(_)))
                    .count();
                if queued >= limit.max(1) {
                    if let Some(oldest) = self
                        .outbound
                        .iter()
                        .position(|queued| matches!(queued, Envelope::Command(_)))
                    {
                        self.outbound.remove(oldest);
                        warn!(host = %self.uri, "outbound queue full, dropping oldest command");
                    }
                }
            }
            self.outbound.push_back(envelope);
        }
    }

    fn flush(&mut self, ctx: HostContext<'_>, fx: &mut Effects) {
        if self.transport_state != TransportState::Connected {
            return;
        }
        while let Some(envelope) = self.outbound.pop_front() {
            let frame = match encode_envelope(&envelope) {
                Ok(frame) => frame,
                Err(err) => {
                    warn!(host = %self.uri, error = %err, "dropping unencodable envelope");
                    continue;
                }
            };
            match self.transport.send(&frame) {
                Ok(()) => {}
                Err(TransportError::QueueFull) => {
                    self.outbound.push_front(envelope);
                    debug!(host = %self.uri, queued = self.outbound.len(), "transport busy, holding outbound");
                    return;
                }
                Err(err) => {
                    self.outbound.push_front(envelope);
                    warn!(host = %self.uri, error = %err, "send failed");
                    self.transport.close();
                    self.on_disconnected(ctx, err.to_string(), fx);
                    return;
                }
            }
            trace!(host = %self.uri, frame = %frame, "sent");
        }
    }

    /// Pumps every pending transport event.
    pub(crate) fn poll_transport(&mut self, ctx: HostContext<'_>, fx: &mut Effects) {
        while let Some(event) = self.transport.poll() {
            match event {
                TransportEvent::Connected => self.on_connected(ctx, fx),
                TransportEvent::Frame(frame) => self.on_frame(ctx, &frame, fx),
                TransportEvent::Disconnected(reason) => self.on_disconnected(ctx, reason, fx),
            }
        }
    }

    fn on_frame(&mut self, ctx: HostContext<'_>, frame: &str, fx: &mut Effects) {
        let envelope = match decode_envelope(frame) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(host = %self.uri, error = %err, "dropping malformed frame");
                return;
            }
        };
        trace!(host = %self.uri, tag = envelope.tag(), "received");
        match envelope {
            Envelope::Authed(msg) => {
                self.authenticated = true;
                self.session = Some(msg.body.clone());
                fx.client
                    .push(ClientEvent::Authenticated(self.uri.clone(), msg.body));
            }
            Envelope::Deauthed(msg) => {
                self.authenticated = false;
                self.session = None;
                fx.client
                    .push(ClientEvent::Deauthenticated(self.uri.clone(), msg.body));
            }
            Envelope::Linked(msg) => {
                if let Some(model) = self.routed_model(&msg.node, &msg.lane) {
                    model.on_linked(fx);
                    self.reconnect_attempt = 0;
                }
            }
            Envelope::Synced(msg) => {
                if let Some(model) = self.routed_model(&msg.node, &msg.lane) {
                    model.on_synced(fx);
                }
            }
            Envelope::Event(msg) => {
                if let Some(model) = self.routed_model(&msg.node, &msg.lane) {
                    model.on_event(msg.body, fx);
                }
            }
            Envelope::Unlinked(msg) => {
                let discard = match self.routed_model(&msg.node, &msg.lane) {
                    Some(model) => model.on_unlinked(ctx.now, ctx.config, fx),
                    None => false,
                };
                if discard {
                    self.remove_model(&msg.node, &msg.lane);
                }
            }
            request => {
                warn!(host = %self.uri, tag = request.tag(), "dropping request envelope from server");
            }
        }
        self.drain(ctx, fx);
    }

    fn routed_model(&mut self, node: &Uri, lane: &Uri) -> Option<&mut DownlinkModel> {
        let uri = self.uri.clone();
        let model = self.model_mut(node, lane);
        if model.is_none() {
            debug!(host = %uri, node = %node, lane = %lane, "dropping envelope for unknown lane");
        }
        model
    }

    /// Fires due reconnects, link timeouts, and relinks.
    pub(crate) fn poll_timers(&mut self, ctx: HostContext<'_>, fx: &mut Effects) {
        if let ReconnectTimer::Scheduled { at } = self.reconnect_timer {
            if ctx.now >= at && self.transport_state == TransportState::Disconnected {
                self.connect(ctx, fx);
            }
        }
        if !self.is_connected() {
            return;
        }

        let timed_out: Vec<Address> = self
            .models()
            .filter(|model| model.link_timed_out(ctx.now))
            .map(|model| model.address().clone())
            .collect();
        if !timed_out.is_empty() {
            for address in &timed_out {
                warn!(host = %self.uri, node = %address.node(), lane = %address.lane(), "link timed out");
                if let Some(model) = self.model(address.node(), address.lane()) {
                    model.broadcast(fx, DownlinkEvent::DidFail("link timed out".to_string()));
                }
            }
            self.transport.close();
            self.on_disconnected(ctx, "link timed out".to_string(), fx);
            return;
        }

        for model in self.models_mut() {
            if model.relink_due(ctx.now) {
                model.link(ctx.now, ctx.config, fx);
            }
        }
        self.drain(ctx, fx);
    }

    /// Whether the client should drop this host now. Starts the idle clock
    /// the first time the host is found unwanted.
    pub(crate) fn is_expired(&mut self, now: Instant, idle_timeout: Duration) -> bool {
        if self.is_wanted() {
            self.idle_since = None;
            return false;
        }
        if self.transport_state == TransportState::Disconnected {
            return true;
        }
        let since = *self.idle_since.get_or_insert(now);
        now.duration_since(since) >= idle_timeout
    }

    pub(crate) fn attach(
        &mut self,
        ctx: HostContext<'_>,
        handle: HandleId,
        address: &Address,
        kind: DownlinkKind,
        options: &LinkOptions,
        fx: &mut Effects,
    ) -> Result<(), ClientError> {
        let connected = self.is_connected();
        match self.model_mut(address.node(), address.lane()) {
            Some(model) => {
                if model.kind() != kind {
                    return Err(ClientError::KindMismatch {
                        existing: model.kind(),
                        requested: kind,
                    });
                }
                let newly_synced = model.attach(handle, options, fx);
                if connected {
                    if model.link_state() == LinkState::Unlinked {
                        model.link(ctx.now, ctx.config, fx);
                    } else if newly_synced {
                        model.request_sync(ctx.now, ctx.config, fx);
                    }
                }
            }
            None => {
                let mut model = DownlinkModel::new(address.clone(), kind, options.clone());
                model.attach(handle, options, fx);
                if connected {
                    model.link(ctx.now, ctx.config, fx);
                }
                self.models
                    .entry(address.node().clone())
                    .or_default()
                    .insert(address.lane().clone(), model);
            }
        }
        self.idle_since = None;
        self.open(ctx, fx);
        self.drain(ctx, fx);
        Ok(())
    }

    pub(crate) fn detach(
        &mut self,
        ctx: HostContext<'_>,
        handle: HandleId,
        address: &Address,
        fx: &mut Effects,
    ) {
        let discard = match self.model_mut(address.node(), address.lane()) {
            Some(model) => model.detach(handle, fx),
            None => false,
        };
        if discard {
            self.remove_model(address.node(), address.lane());
        }
        self.drain(ctx, fx);
        if !self.outbound.is_empty() {
            self.open(ctx, fx);
        }
    }

    /// Runs `f` against the model at `address`, then sends what it produced.
    pub(crate) fn with_model<R>(
        &mut self,
        ctx: HostContext<'_>,
        address: &Address,
        fx: &mut Effects,
        f: impl FnOnce(&mut DownlinkModel, &mut Effects) -> R,
    ) -> Option<R> {
        let model = self.model_mut(address.node(), address.lane())?;
        let result = f(model, fx);
        self.drain(ctx, fx);
        Some(result)
    }

    pub(crate) fn command(
        &mut self,
        ctx: HostContext<'_>,
        node: Uri,
        lane: Uri,
        body: Value,
        fx: &mut Effects,
    ) {
        match self.model_mut(&node, &lane) {
            Some(model) => model.command(body, ctx.config, fx),
            None => fx.envelopes.push(Envelope::command(node, lane, body)),
        }
        self.drain(ctx, fx);
        self.open(ctx, fx);
    }

    /// Stores credentials to present now and at the start of every session.
    pub(crate) fn authenticate(&mut self, ctx: HostContext<'_>, credentials: Value, fx: &mut Effects) {
        self.credentials = Some(credentials.clone());
        if self.is_connected() {
            fx.envelopes.push(Envelope::auth(credentials));
            self.drain(ctx, fx);
        } else {
            self.open(ctx, fx);
        }
    }

    pub(crate) fn deauthenticate(&mut self, ctx: HostContext<'_>, body: Value, fx: &mut Effects) {
        self.credentials = None;
        self.authenticated = false;
        self.session = None;
        if self.is_connected() {
            fx.envelopes.push(Envelope::deauth(body));
            self.drain(ctx, fx);
        }
    }

    /// Reacts to the client going online or offline.
    pub(crate) fn set_online(&mut self, ctx: HostContext<'_>, fx: &mut Effects) {
        match (ctx.online, self.reconnect_timer) {
            (true, ReconnectTimer::Pending) => self.connect(ctx, fx),
            (false, ReconnectTimer::Scheduled { .. }) => {
                self.reconnect_timer = ReconnectTimer::Pending;
            }
            _ => {}
        }
    }

    /// Unlinks every live model and closes the transport. Returns the
    /// handles that were attached.
    pub(crate) fn close(&mut self) -> Vec<HandleId> {
        if self.is_connected() {
            let unlinks: Vec<Envelope> = self
                .models()
                .filter(|model| model.link_state() != LinkState::Unlinked)
                .map(|model| {
                    Envelope::unlink(
                        model.address().node().clone(),
                        model.address().lane().clone(),
                    )
                })
                .collect();
            for envelope in unlinks {
                let sent = encode_envelope(&envelope)
                    .map_err(|err| err.to_string())
                    .and_then(|frame| self.transport.send(&frame).map_err(|err| err.to_string()));
                if let Err(err) = sent {
                    debug!(host = %self.uri, error = %err, "unlink on close failed");
                    break;
                }
            }
        }
        let handles = self.handle_ids();
        self.transport.close();
        self.transport_state = TransportState::Disconnected;
        self.reconnect_timer = ReconnectTimer::Idle;
        self.models.clear();
        self.outbound.clear();
        info!(host = %self.uri, "closed");
        handles
    }
}
