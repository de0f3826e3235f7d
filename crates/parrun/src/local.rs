//! In-process workers.
//!
//! A worker and its caller talk over a pair of unbounded tokio channels. The
//! caller holds a [`ChannelLink`], the worker holds a [`WorkerPort`].
//! [`ThreadSpawner`] gives each worker its own OS thread and single-threaded
//! runtime; [`TaskSpawner`] runs it as a task on the caller's runtime.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use parwire::WorkerMessage;
use tokio::sync::mpsc;
use tracing::error;
use tracing::warn;

use crate::link;
use crate::link::Spawner;
use crate::link::WorkerLink;
use crate::module::ModuleRegistry;
use crate::worker::WorkerHost;

/// Creates a connected link and port.
///
/// Messages sent on the link arrive at the port and vice versa.
pub fn channel_pair() -> (ChannelLink, WorkerPort) {
    let (to_worker, from_caller) = mpsc::unbounded_channel();
    let (to_caller, from_worker) = mpsc::unbounded_channel();

    let link = ChannelLink {
        tx: Mutex::new(Some(to_worker)),
        rx: tokio::sync::Mutex::new(from_worker),
    };
    let port = WorkerPort { tx: to_caller, rx: from_caller };

    (link, port)
}

/// The caller's end of a channel pair.
pub struct ChannelLink {
    tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

#[async_trait::async_trait]
impl WorkerLink for ChannelLink {
    async fn send(&self, payload: &[u8]) -> link::Result<()> {
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = tx.as_ref().ok_or_else(|| link::Error::Disconnected("link terminated".into()))?;
        tx.send(payload.to_vec())
            .map_err(|_| link::Error::Disconnected("worker exited".into()))
    }

    async fn recv(&self) -> link::Result<Option<Vec<u8>>> {
        let mut rx = self.rx.lock().await;
        Ok(rx.recv().await)
    }

    fn terminate(&self) -> link::Result<()> {
        // Dropping the sender ends the worker's receive loop.
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
        Ok(())
    }
}

/// The worker's end of a channel pair.
pub struct WorkerPort {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl WorkerPort {
    /// Waits for the next request. `None` once the caller terminated the link.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    pub fn outbox(&self) -> Outbox {
        Outbox { tx: self.tx.clone() }
    }
}

/// Posts messages back to the caller. Cheap to clone.
#[derive(Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl Outbox {
    /// Returns false if the caller is gone or the message could not be encoded.
    pub fn post(&self, message: &WorkerMessage) -> bool {
        let bytes = match parwire::encode(message) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "failed to encode worker message");
                return false;
            }
        };
        self.tx.send(bytes).is_ok()
    }
}

/// Runs each worker on its own OS thread.
#[derive(Clone)]
pub struct ThreadSpawner {
    modules: Arc<ModuleRegistry>,
    spawned: Arc<AtomicU64>,
}

impl ThreadSpawner {
    pub fn new(modules: ModuleRegistry) -> Self {
        Self { modules: Arc::new(modules), spawned: Arc::new(AtomicU64::new(0)) }
    }
}

#[async_trait::async_trait]
impl Spawner for ThreadSpawner {
    async fn spawn(&self, entry: &str) -> link::Result<Box<dyn WorkerLink>> {
        let (link, port) = channel_pair();
        let host = WorkerHost::new(Arc::clone(&self.modules));
        let n = self.spawned.fetch_add(1, Ordering::Relaxed);

        std::thread::Builder::new()
            .name(format!("{}-{}", entry, n))
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        // The port drops here, so the caller sees the worker exit before coming online.
                        error!(error = %e, "failed to build worker runtime");
                        return;
                    }
                };
                runtime.block_on(host.serve(port));
            })
            .map_err(|e| link::Error::Spawn(e.to_string()))?;

        Ok(Box::new(link))
    }
}

/// Runs each worker as a task on the current tokio runtime.
#[derive(Clone)]
pub struct TaskSpawner {
    modules: Arc<ModuleRegistry>,
}

impl TaskSpawner {
    pub fn new(modules: ModuleRegistry) -> Self {
        Self { modules: Arc::new(modules) }
    }
}

#[async_trait::async_trait]
impl Spawner for TaskSpawner {
    async fn spawn(&self, _entry: &str) -> link::Result<Box<dyn WorkerLink>> {
        let (link, port) = channel_pair();
        let host = WorkerHost::new(Arc::clone(&self.modules));
        tokio::spawn(host.serve(port));
        Ok(Box::new(link))
    }
}
