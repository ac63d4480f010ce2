use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use crate::client::WarpClient;

/// Background thread that polls a client every `tick_interval`.
///
/// Observer callbacks run on the runner thread. The runner stops when it is
/// stopped or dropped, or once the client is closed.
#[derive(Debug)]
pub struct ClientRunner {
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl ClientRunner {
    pub fn spawn(client: WarpClient) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let interval = client.config().tick_interval;
        let worker = thread::spawn(move || {
            debug!(interval_ms = interval.as_millis() as u64, "client runner started");
            while !stop_flag.load(Ordering::SeqCst) {
                client.tick();
                if client.is_closed() {
                    break;
                }
                thread::sleep(interval);
            }
            debug!("client runner stopped");
        });
        Self {
            stop,
            worker: Some(worker),
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|worker| !worker.is_finished())
    }

    /// Stops the thread and waits for it, unless called from a callback on
    /// the runner thread itself.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            if worker.thread().id() != thread::current().id() && worker.join().is_err() {
                warn!("client runner thread panicked");
            }
        }
    }
}

impl Drop for ClientRunner {
    fn drop(&mut self) {
        self.stop();
    }
}
