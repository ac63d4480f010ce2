//! In-process transport for tests and simulations.
//!
//! A [`MemoryNetwork`] is a [`TransportFactory`] whose transports talk to
//! scripted peers instead of sockets. Tests hold a [`MemoryPeer`] per host to
//! accept or refuse sessions, push server frames, drop connections, and
//! inspect what the client sent.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::trace;
use warp_codec::envelope::{decode_envelope, encode_envelope};
use warp_codec::Envelope;
use warp_core::Uri;

use crate::adapter::{Transport, TransportEvent, TransportFactory, TransportHealthSnapshot};
use crate::error::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Connecting,
    Connected,
}

#[derive(Debug)]
struct MemoryLink {
    phase: Phase,
    auto_accept: bool,
    fail_sends: bool,
    /// Frames accepted before sends report `QueueFull`; `None` is unlimited.
    send_budget: Option<usize>,
    inbound: VecDeque<TransportEvent>,
    sent: Vec<String>,
    opens: u64,
    closes: u64,
    health: TransportHealthSnapshot,
}

impl MemoryLink {
    fn new(auto_accept: bool) -> Self {
        Self {
            phase: Phase::Idle,
            auto_accept,
            fail_sends: false,
            send_budget: None,
            inbound: VecDeque::new(),
            sent: Vec::new(),
            opens: 0,
            closes: 0,
            health: TransportHealthSnapshot::default(),
        }
    }

    fn open_session(&mut self) {
        self.phase = Phase::Connected;
        self.inbound.push_back(TransportEvent::Connected);
    }

    fn end_session(&mut self, reason: String) -> bool {
        if self.phase == Phase::Idle {
            return false;
        }
        self.phase = Phase::Idle;
        self.health.last_error = Some(reason.clone());
        self.inbound.push_back(TransportEvent::Disconnected(reason));
        true
    }
}

#[derive(Debug)]
struct NetworkState {
    auto_accept: bool,
    links: BTreeMap<String, MemoryLink>,
}

/// Shared registry of scripted hosts.
#[derive(Debug, Clone)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNetwork {
    /// Network whose hosts accept every connection attempt immediately.
    pub fn new() -> Self {
        Self::with_auto_accept(true)
    }

    /// Network whose hosts leave connection attempts pending until
    /// [`MemoryPeer::accept`] or [`MemoryPeer::refuse`] is called.
    pub fn manual() -> Self {
        Self::with_auto_accept(false)
    }

    fn with_auto_accept(auto_accept: bool) -> Self {
        Self {
            state: Arc::new(Mutex::new(NetworkState {
                auto_accept,
                links: BTreeMap::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_link<R>(&self, host: &str, f: impl FnOnce(&mut MemoryLink) -> R) -> R {
        let mut state = self.lock();
        let auto_accept = state.auto_accept;
        let link = state
            .links
            .entry(host.to_string())
            .or_insert_with(|| MemoryLink::new(auto_accept));
        f(link)
    }

    /// Test-side control handle for `host`.
    pub fn peer(&self, host: &str) -> MemoryPeer {
        MemoryPeer {
            network: self.clone(),
            host: host.to_string(),
        }
    }

    /// Hosts for which the client has opened at least one transport.
    pub fn opened_hosts(&self) -> Vec<String> {
        self.lock()
            .links
            .iter()
            .filter(|(_, link)| link.opens > 0)
            .map(|(host, _)| host.clone())
            .collect()
    }
}

impl TransportFactory for MemoryNetwork {
    fn open(&self, host: &Uri) -> Result<Box<dyn Transport>, TransportError> {
        self.with_link(host.as_str(), |link| link.opens += 1);
        Ok(Box::new(MemoryTransport {
            network: self.clone(),
            host: host.as_str().to_string(),
        }))
    }
}

/// Client side of a scripted host.
#[derive(Debug)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    host: String,
}

impl Transport for MemoryTransport {
    fn connect(&mut self) -> Result<(), TransportError> {
        self.network.with_link(&self.host, |link| {
            if link.phase != Phase::Idle {
                return;
            }
            link.health.connect_attempts += 1;
            if link.auto_accept {
                link.open_session();
            } else {
                link.phase = Phase::Connecting;
            }
        });
        Ok(())
    }

    fn send(&mut self, frame: &str) -> Result<(), TransportError> {
        self.network.with_link(&self.host, |link| {
            if link.phase != Phase::Connected {
                link.health.outbound_send_err += 1;
                return Err(TransportError::NotConnected);
            }
            if link.fail_sends {
                link.health.outbound_send_err += 1;
                return Err(TransportError::Send("scripted send failure".to_string()));
            }
            if link.send_budget == Some(0) {
                link.health.outbound_send_err += 1;
                return Err(TransportError::QueueFull);
            }
            if let Some(budget) = &mut link.send_budget {
                *budget -= 1;
            }
            trace!(host = %self.host, frame, "memory transport send");
            link.sent.push(frame.to_string());
            link.health.outbound_send_ok += 1;
            Ok(())
        })
    }

    fn poll(&mut self) -> Option<TransportEvent> {
        self.network.with_link(&self.host, |link| {
            let event = link.inbound.pop_front();
            if matches!(event, Some(TransportEvent::Frame(_))) {
                link.health.inbound_received += 1;
            }
            event
        })
    }

    fn close(&mut self) {
        self.network.with_link(&self.host, |link| {
            link.phase = Phase::Idle;
            link.inbound.clear();
            link.closes += 1;
        });
    }

    fn is_connected(&self) -> bool {
        self.network
            .with_link(&self.host, |link| link.phase == Phase::Connected)
    }

    fn health_snapshot(&self) -> TransportHealthSnapshot {
        self.network.with_link(&self.host, |link| link.health.clone())
    }
}

/// Server-side script for one host.
#[derive(Debug, Clone)]
pub struct MemoryPeer {
    network: MemoryNetwork,
    host: String,
}

impl MemoryPeer {
    /// Completes a pending connection attempt. Returns false if none is pending.
    pub fn accept(&self) -> bool {
        self.network.with_link(&self.host, |link| {
            if link.phase != Phase::Connecting {
                return false;
            }
            link.open_session();
            true
        })
    }

    /// Fails a pending connection attempt.
    pub fn refuse(&self, reason: &str) -> bool {
        self.network.with_link(&self.host, |link| {
            link.phase == Phase::Connecting && link.end_session(reason.to_string())
        })
    }

    /// Drops a live or pending session as if the socket died.
    pub fn drop_connection(&self, reason: &str) -> bool {
        self.network
            .with_link(&self.host, |link| link.end_session(reason.to_string()))
    }

    /// Sets whether future connection attempts open immediately.
    pub fn set_auto_accept(&self, auto_accept: bool) {
        self.network
            .with_link(&self.host, |link| link.auto_accept = auto_accept);
    }

    /// Makes every send on the live session fail.
    pub fn set_fail_sends(&self, fail_sends: bool) {
        self.network
            .with_link(&self.host, |link| link.fail_sends = fail_sends);
    }

    /// Limits how many more frames the session accepts before reporting a
    /// full queue. `None` lifts the limit.
    pub fn set_send_budget(&self, budget: Option<usize>) {
        self.network
            .with_link(&self.host, |link| link.send_budget = budget);
    }

    /// Delivers a raw text frame. Ignored unless a session is open.
    pub fn push_frame(&self, frame: impl Into<String>) -> bool {
        let frame = frame.into();
        self.network.with_link(&self.host, |link| {
            if link.phase != Phase::Connected {
                link.health.inbound_dropped += 1;
                return false;
            }
            link.inbound.push_back(TransportEvent::Frame(frame));
            true
        })
    }

    /// Encodes and delivers one envelope.
    pub fn push(&self, envelope: &Envelope) -> bool {
        match encode_envelope(envelope) {
            Ok(frame) => self.push_frame(frame),
            Err(_) => false,
        }
    }

    /// Drains every frame the client has sent so far.
    pub fn take_sent(&self) -> Vec<String> {
        self.network
            .with_link(&self.host, |link| std::mem::take(&mut link.sent))
    }

    /// Drains sent frames, decoding each one. Undecodable frames are skipped.
    pub fn take_envelopes(&self) -> Vec<Envelope> {
        self.take_sent()
            .iter()
            .filter_map(|frame| decode_envelope(frame).ok())
            .collect()
    }

    pub fn is_connected(&self) -> bool {
        self.network
            .with_link(&self.host, |link| link.phase == Phase::Connected)
    }

    pub fn is_connecting(&self) -> bool {
        self.network
            .with_link(&self.host, |link| link.phase == Phase::Connecting)
    }

    /// Number of connection attempts the client has made.
    pub fn connect_attempts(&self) -> u64 {
        self.network
            .with_link(&self.host, |link| link.health.connect_attempts)
    }

    /// Number of transports the client has opened for this host.
    pub fn open_count(&self) -> u64 {
        self.network.with_link(&self.host, |link| link.opens)
    }

    /// Number of client-initiated closes.
    pub fn close_count(&self) -> u64 {
        self.network.with_link(&self.host, |link| link.closes)
    }
}
