//! WebSocket transport for WARP hosts.
//!
//! Each call to [`Transport::connect`] spawns a worker thread running a
//! current-thread tokio runtime that owns exactly one websocket session.
//! Reconnect policy belongs to the client runtime, so a worker never retries
//! on its own: it reports `Disconnected` and exits.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc as tokio_mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use warp_core::Uri;
use warp_transport::{
    Transport, TransportError, TransportEvent, TransportFactory, TransportHealthSnapshot,
};

#[derive(Debug, Clone)]
pub struct WebSocketTransportConfig {
    /// Bound on frames waiting for the worker to write them.
    pub outbound_queue_capacity: usize,
    /// Abandons a connection attempt that takes longer than this.
    pub connect_timeout: Duration,
    /// Frames longer than this are dropped on receipt.
    pub max_frame_len: Option<usize>,
}

impl Default for WebSocketTransportConfig {
    fn default() -> Self {
        Self {
            outbound_queue_capacity: 1024,
            connect_timeout: Duration::from_secs(10),
            max_frame_len: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum WebSocketTransportError {
    #[error("transport is closed")]
    Closed,
    #[error("transport is not connected")]
    NotConnected,
    #[error("outbound queue is full")]
    QueueFull,
    #[error("unsupported host scheme `{0}`")]
    UnsupportedScheme(String),
}

impl From<WebSocketTransportError> for TransportError {
    fn from(err: WebSocketTransportError) -> Self {
        match err {
            WebSocketTransportError::Closed => TransportError::Closed,
            WebSocketTransportError::NotConnected => TransportError::NotConnected,
            WebSocketTransportError::QueueFull => TransportError::QueueFull,
            WebSocketTransportError::UnsupportedScheme(scheme) => {
                TransportError::UnsupportedScheme(scheme)
            }
        }
    }
}

/// Maps a host URI onto the websocket URL to dial.
///
/// `warp` and `warps` are accepted as aliases of `ws` and `wss`.
pub fn websocket_url(host: &Uri) -> Result<String, WebSocketTransportError> {
    let scheme = host
        .scheme()
        .ok_or_else(|| WebSocketTransportError::UnsupportedScheme(String::new()))?;
    let mapped = match scheme {
        "ws" | "warp" => "ws",
        "wss" | "warps" => "wss",
        other => return Err(WebSocketTransportError::UnsupportedScheme(other.to_string())),
    };
    let rest = &host.as_str()[scheme.len()..];
    Ok(format!("{mapped}{rest}"))
}

#[derive(Debug, Default)]
struct WebSocketMetrics {
    outbound_send_ok: AtomicU64,
    outbound_send_err: AtomicU64,
    inbound_received: AtomicU64,
    inbound_dropped: AtomicU64,
    connect_attempts: AtomicU64,
}

struct Session {
    outbound_tx: tokio_mpsc::Sender<String>,
    events_rx: mpsc::Receiver<TransportEvent>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl Session {
    fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

pub struct WebSocketTransport {
    url: String,
    config: WebSocketTransportConfig,
    session: Option<Session>,
    connected: Arc<AtomicBool>,
    metrics: Arc<WebSocketMetrics>,
    last_error: Arc<Mutex<Option<String>>>,
}

impl WebSocketTransport {
    pub fn new(url: impl Into<String>, config: WebSocketTransportConfig) -> Self {
        Self {
            url: url.into(),
            config,
            session: None,
            connected: Arc::new(AtomicBool::new(false)),
            metrics: Arc::new(WebSocketMetrics::default()),
            last_error: Arc::new(Mutex::new(None)),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn session_live(&self) -> bool {
        self.session
            .as_ref()
            .and_then(|session| session.worker.as_ref())
            .is_some_and(|worker| !worker.is_finished())
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.close();
    }
}

impl Transport for WebSocketTransport {
    fn connect(&mut self) -> Result<(), TransportError> {
        if self.session_live() {
            return Ok(());
        }
        if let Some(mut stale) = self.session.take() {
            stale.shutdown();
        }

        let (outbound_tx, outbound_rx) =
            tokio_mpsc::channel::<String>(self.config.outbound_queue_capacity);
        let (events_tx, events_rx) = mpsc::channel::<TransportEvent>();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        self.metrics.connect_attempts.fetch_add(1, Ordering::Relaxed);

        let worker = SessionWorker {
            url: self.url.clone(),
            config: self.config.clone(),
            connected: Arc::clone(&self.connected),
            metrics: Arc::clone(&self.metrics),
            last_error: Arc::clone(&self.last_error),
            events_tx,
        };
        let handle = thread::spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(err) => {
                    worker.fail(format!("failed to build tokio runtime: {err}"));
                    return;
                }
            };
            runtime.block_on(worker.run(outbound_rx, shutdown_rx));
        });

        self.session = Some(Session {
            outbound_tx,
            events_rx,
            shutdown_tx: Some(shutdown_tx),
            worker: Some(handle),
        });
        Ok(())
    }

    fn send(&mut self, frame: &str) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::Relaxed) {
            return Err(WebSocketTransportError::NotConnected.into());
        }
        let session = self
            .session
            .as_ref()
            .ok_or(WebSocketTransportError::Closed)?;
        session
            .outbound_tx
            .try_send(frame.to_string())
            .map_err(|err| match err {
                tokio_mpsc::error::TrySendError::Full(_) => WebSocketTransportError::QueueFull,
                tokio_mpsc::error::TrySendError::Closed(_) => WebSocketTransportError::Closed,
            })?;
        Ok(())
    }

    fn poll(&mut self) -> Option<TransportEvent> {
        self.session.as_ref()?.events_rx.try_recv().ok()
    }

    fn close(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.shutdown();
        }
        self.connected.store(false, Ordering::Relaxed);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn health_snapshot(&self) -> TransportHealthSnapshot {
        TransportHealthSnapshot {
            outbound_send_ok: self.metrics.outbound_send_ok.load(Ordering::Relaxed),
            outbound_send_err: self.metrics.outbound_send_err.load(Ordering::Relaxed),
            inbound_received: self.metrics.inbound_received.load(Ordering::Relaxed),
            inbound_dropped: self.metrics.inbound_dropped.load(Ordering::Relaxed),
            connect_attempts: self.metrics.connect_attempts.load(Ordering::Relaxed),
            last_error: self
                .last_error
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }
}

struct SessionWorker {
    url: String,
    config: WebSocketTransportConfig,
    connected: Arc<AtomicBool>,
    metrics: Arc<WebSocketMetrics>,
    last_error: Arc<Mutex<Option<String>>>,
    events_tx: mpsc::Sender<TransportEvent>,
}

impl SessionWorker {
    fn fail(&self, reason: String) {
        self.connected.store(false, Ordering::Relaxed);
        *self
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(reason.clone());
        let _ = self.events_tx.send(TransportEvent::Disconnected(reason));
    }

    async fn run(
        self,
        mut outbound_rx: tokio_mpsc::Receiver<String>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) {
        let attempt = tokio::time::timeout(self.config.connect_timeout, connect_async(self.url.as_str()));
        let stream = tokio::select! {
            _ = &mut shutdown_rx => return,
            result = attempt => match result {
                Ok(Ok((stream, _))) => stream,
                Ok(Err(err)) => {
                    warn!(url = %self.url, error = %err, "websocket connect failed");
                    self.fail(err.to_string());
                    return;
                }
                Err(_) => {
                    warn!(url = %self.url, "websocket connect timed out");
                    self.fail("connect timed out".to_string());
                    return;
                }
            },
        };

        info!(url = %self.url, "websocket session open");
        self.connected.store(true, Ordering::Relaxed);
        if self.events_tx.send(TransportEvent::Connected).is_err() {
            return;
        }
        let (mut write, mut read) = stream.split();

        let reason = loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    self.connected.store(false, Ordering::Relaxed);
                    let _ = write.send(Message::Close(None)).await;
                    return;
                }
                maybe_out = outbound_rx.recv() => {
                    let Some(frame) = maybe_out else {
                        break "outbound channel closed".to_string();
                    };
                    if let Err(err) = write.send(Message::Text(frame)).await {
                        self.metrics.outbound_send_err.fetch_add(1, Ordering::Relaxed);
                        break err.to_string();
                    }
                    self.metrics.outbound_send_ok.fetch_add(1, Ordering::Relaxed);
                }
                maybe_in = read.next() => {
                    let frame = match maybe_in {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                            Ok(text) => text,
                            Err(_) => {
                                debug!(url = %self.url, "dropping non-utf8 binary frame");
                                self.metrics.inbound_dropped.fetch_add(1, Ordering::Relaxed);
                                continue;
                            }
                        },
                        Some(Ok(Message::Close(_))) => break "closed by server".to_string(),
                        Some(Ok(_)) => continue,
                        Some(Err(err)) => break err.to_string(),
                        None => break "stream ended".to_string(),
                    };
                    if self.config.max_frame_len.is_some_and(|max| frame.len() > max) {
                        self.metrics.inbound_dropped.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                    self.metrics.inbound_received.fetch_add(1, Ordering::Relaxed);
                    if self.events_tx.send(TransportEvent::Frame(frame)).is_err() {
                        return;
                    }
                }
            }
        };

        info!(url = %self.url, reason = %reason, "websocket session closed");
        self.fail(reason);
    }
}

/// Opens one [`WebSocketTransport`] per host.
#[derive(Debug, Clone, Default)]
pub struct WebSocketTransportFactory {
    config: WebSocketTransportConfig,
}

impl WebSocketTransportFactory {
    pub fn new(config: WebSocketTransportConfig) -> Self {
        Self { config }
    }
}

impl TransportFactory for WebSocketTransportFactory {
    fn open(&self, host: &Uri) -> Result<Box<dyn Transport>, TransportError> {
        let url = websocket_url(host)?;
        debug!(host = %host, url = %url, "opening websocket transport");
        Ok(Box::new(WebSocketTransport::new(url, self.config.clone())))
    }
}
