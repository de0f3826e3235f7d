//! # Worker Pool
//!
//! Starts workers lazily, lends them to tasks, and retires them when idle.
//!
//! ## Invariants
//! - Live workers plus workers still booting never exceed `max_workers`.
//! - A worker is handed out only after it posted `online`.
//! - Every task holds exactly one slot on exactly one worker until it is released.
//! - A worker is idle when it holds no tasks; idle workers are reused before
//!   anything new is spawned.
//! - Once a worker is removed from the pool, its exit is not reported as a crash.

use std::collections::HashSet;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::Weak;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use parwire::CallResponse;
use parwire::TaskId;
use parwire::WorkerMessage;
use tokio::sync::Notify;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::error::Error;
use crate::error::Result;
use crate::link::Spawner;
use crate::link::WorkerLink;

/// Unique identifier for a worker within one pool.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct WorkerId(pub u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// What `acquire` does once every allowed worker exists and all are busy.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Overflow {
    /// Share a busy worker, chosen as `task_id % worker_count`.
    Oversubscribe,
    /// Wait for a worker to go idle. At most `limit` callers wait; the next
    /// one fails with `Error::PoolExhausted`.
    Queue { limit: usize },
}

#[derive(Clone, Debug)]
pub struct PoolConfig {
    pub max_workers: usize,
    pub idle_timeout: Duration,
    /// Handed to the spawner for every worker.
    pub entry: String,
    pub overflow: Overflow,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: std::thread::available_parallelism().map(NonZeroUsize::get).unwrap_or(4),
            idle_timeout: Duration::from_secs(10),
            entry: "worker".to_string(),
            overflow: Overflow::Oversubscribe,
        }
    }
}

/// A point-in-time view of the pool.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub workers: usize,
    pub busy: usize,
    pub idle: usize,
    pub starting: usize,
    pub waiting: usize,
    pub spawned_total: u64,
}

/// Receives what the pool's pump tasks read from workers.
pub(crate) trait Router: Send + Sync + 'static {
    fn route(&self, worker: WorkerId, response: CallResponse);
    fn worker_exited(&self, worker: WorkerId, reason: String);
}

/// A slot on a worker, held by one task.
#[derive(Clone)]
pub struct Lease {
    pub worker: WorkerId,
    pub link: Arc<dyn WorkerLink>,
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease").field("worker", &self.worker).finish()
    }
}

struct WorkerRecord {
    id: WorkerId,
    link: Arc<dyn WorkerLink>,
    active: HashSet<TaskId>,
    last_used: Instant,
}

impl WorkerRecord {
    fn lease(&mut self, task_id: TaskId) -> Lease {
        self.active.insert(task_id);
        self.last_used = Instant::now();
        Lease { worker: self.id, link: Arc::clone(&self.link) }
    }

    fn expired(&self, now: Instant, timeout: Duration) -> bool {
        self.active.is_empty() && now.saturating_duration_since(self.last_used) >= timeout
    }
}

#[derive(Default)]
struct PoolState {
    workers: Vec<WorkerRecord>,
    starting: usize,
    waiting: usize,
    spawned_total: u64,
}

enum Admission<'a> {
    Spawn,
    Wait(tokio::sync::futures::Notified<'a>),
    Queued(tokio::sync::futures::Notified<'a>),
}

pub struct WorkerPool {
    config: PoolConfig,
    spawner: Arc<dyn Spawner>,
    router: Weak<dyn Router>,
    state: Mutex<PoolState>,
    freed: Notify,
    next_worker: AtomicU64,
}

impl WorkerPool {
    pub(crate) fn new(config: PoolConfig, spawner: Arc<dyn Spawner>, router: Weak<dyn Router>) -> Self {
        Self {
            config,
            spawner,
            router,
            state: Mutex::new(PoolState::default()),
            freed: Notify::new(),
            next_worker: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserves a slot for `task_id`.
    ///
    /// Reuses an idle worker, else starts a new one while under `max_workers`,
    /// else applies the overflow policy.
    pub async fn acquire(&self, task_id: TaskId) -> Result<Lease> {
        loop {
            let admission = {
                let mut state = self.lock();
                if let Some(worker) = state.workers.iter_mut().find(|w| w.active.is_empty()) {
                    return Ok(worker.lease(task_id));
                }

                if state.workers.len() + state.starting < self.config.max_workers {
                    state.starting += 1;
                    Admission::Spawn
                } else {
                    match self.config.overflow {
                        Overflow::Oversubscribe if !state.workers.is_empty() => {
                            let index = (task_id.0 % state.workers.len() as u64) as usize;
                            return Ok(state.workers[index].lease(task_id));
                        }
                        Overflow::Oversubscribe => Admission::Wait(self.freed.notified()),
                        Overflow::Queue { limit } => {
                            if state.waiting >= limit {
                                return Err(Error::PoolExhausted {
                                    max_workers: self.config.max_workers,
                                    waiting: state.waiting,
                                });
                            }
                            state.waiting += 1;
                            Admission::Queued(self.freed.notified())
                        }
                    }
                }
            };

            match admission {
                Admission::Spawn => return self.spawn_for(task_id).await,
                Admission::Wait(notified) => notified.await,
                Admission::Queued(notified) => {
                    let _waiting = WaitingSlot { pool: self };
                    notified.await;
                }
            }
        }
    }

    async fn spawn_for(&self, task_id: TaskId) -> Result<Lease> {
        let mut slot = StartingSlot { pool: self, armed: true };
        let id = WorkerId(self.next_worker.fetch_add(1, Ordering::Relaxed));
        let link = self.boot(id).await?;

        let mut record = WorkerRecord { id, link, active: HashSet::new(), last_used: Instant::now() };
        let lease = record.lease(task_id);
        {
            let mut state = self.lock();
            state.starting -= 1;
            state.spawned_total += 1;
            state.workers.push(record);
            slot.armed = false;
        }

        self.freed.notify_waiters();
        Ok(lease)
    }

    /// Spawns a worker and waits for its `online` message.
    async fn boot(&self, id: WorkerId) -> Result<Arc<dyn WorkerLink>> {
        let link: Arc<dyn WorkerLink> = Arc::from(
            self.spawner
                .spawn(&self.config.entry)
                .await
                .map_err(|e| Error::Spawn(e.to_string()))?,
        );

        let online = match link.recv().await {
            Ok(Some(bytes)) => match parwire::decode::<WorkerMessage>(&bytes) {
                Ok(WorkerMessage::Online) => Ok(()),
                Ok(other) => Err(Error::Protocol(format!("{} sent {:?} before coming online", id, other))),
                Err(e) => Err(e.into()),
            },
            Ok(None) => Err(Error::Spawn(format!("{} exited before coming online", id))),
            Err(e) => Err(Error::Link(e)),
        };

        if let Err(e) = online {
            if let Err(term) = link.terminate() {
                warn!(worker = %id, error = %term, "failed to terminate worker after boot failure");
            }
            return Err(e);
        }

        info!(worker = %id, entry = %self.config.entry, "worker online");
        self.start_pump(id, Arc::clone(&link));
        Ok(link)
    }

    /// Reads everything a worker posts and hands it to the router.
    fn start_pump(&self, id: WorkerId, link: Arc<dyn WorkerLink>) {
        let router = self.router.clone();
        tokio::spawn(async move {
            let reason = loop {
                match link.recv().await {
                    Ok(Some(bytes)) => {
                        let Some(router) = router.upgrade() else {
                            break "client dropped".to_string();
                        };
                        match parwire::decode::<WorkerMessage>(&bytes) {
                            Ok(WorkerMessage::Response(response)) => router.route(id, response),
                            Ok(WorkerMessage::Online) => debug!(worker = %id, "duplicate online message ignored"),
                            Err(e) => warn!(worker = %id, error = %e, "dropping malformed worker message"),
                        }
                    }
                    Ok(None) => break "worker exited".to_string(),
                    Err(e) => break e.to_string(),
                }
            };

            match router.upgrade() {
                Some(router) => router.worker_exited(id, reason),
                None => {
                    let _ = link.terminate();
                }
            }
        });
    }

    /// Frees the slot `task_id` holds. Returns false if it held none.
    pub fn release(&self, task_id: TaskId) -> bool {
        let released = {
            let mut state = self.lock();
            let now = Instant::now();
            state.workers.iter_mut().any(|w| {
                let held = w.active.remove(&task_id);
                if held {
                    w.last_used = now;
                }
                held
            })
        };
        if released {
            self.freed.notify_waiters();
        }
        released
    }

    /// Terminates workers that have been idle for at least the idle timeout.
    ///
    /// Returns how many were retired. Termination failures are logged.
    pub fn sweep(&self) -> usize {
        let expired: Vec<WorkerRecord> = {
            let mut state = self.lock();
            let now = Instant::now();
            let timeout = self.config.idle_timeout;
            let (expired, kept) = std::mem::take(&mut state.workers)
                .into_iter()
                .partition(|w| w.expired(now, timeout));
            state.workers = kept;
            expired
        };

        for worker in &expired {
            debug!(worker = %worker.id, "retiring idle worker");
            if let Err(e) = worker.link.terminate() {
                warn!(worker = %worker.id, error = %e, "failed to terminate idle worker");
            }
        }
        if !expired.is_empty() {
            self.freed.notify_waiters();
        }
        expired.len()
    }

    /// Removes a worker that went away on its own.
    ///
    /// Returns the tasks it was holding, or `None` if the pool had already let it go.
    pub(crate) fn evict(&self, worker: WorkerId) -> Option<Vec<TaskId>> {
        let record = {
            let mut state = self.lock();
            let index = state.workers.iter().position(|w| w.id == worker)?;
            state.workers.remove(index)
        };
        self.freed.notify_waiters();
        Some(record.active.into_iter().collect())
    }

    /// Terminates every worker. Returns the tasks that were still running.
    pub fn shutdown(&self) -> Vec<TaskId> {
        let workers = std::mem::take(&mut self.lock().workers);
        let mut tasks = Vec::new();
        for worker in workers {
            if let Err(e) = worker.link.terminate() {
                warn!(worker = %worker.id, error = %e, "failed to terminate worker on shutdown");
            }
            tasks.extend(worker.active);
        }
        self.freed.notify_waiters();
        tasks
    }

    pub(crate) fn link_of(&self, worker: WorkerId) -> Option<Arc<dyn WorkerLink>> {
        self.lock().workers.iter().find(|w| w.id == worker).map(|w| Arc::clone(&w.link))
    }

    pub fn worker_of(&self, task_id: TaskId) -> Option<WorkerId> {
        self.lock().workers.iter().find(|w| w.active.contains(&task_id)).map(|w| w.id)
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.lock();
        let busy = state.workers.iter().filter(|w| !w.active.is_empty()).count();
        PoolStats {
            workers: state.workers.len(),
            busy,
            idle: state.workers.len() - busy,
            starting: state.starting,
            waiting: state.waiting,
            spawned_total: state.spawned_total,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.lock().workers.len()
    }

    pub fn busy_count(&self) -> usize {
        self.lock().workers.iter().filter(|w| !w.active.is_empty()).count()
    }

    pub fn idle_count(&self) -> usize {
        self.lock().workers.iter().filter(|w| w.active.is_empty()).count()
    }

    pub fn total_spawned(&self) -> u64 {
        self.lock().spawned_total
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let workers = std::mem::take(&mut self.lock().workers);
        for worker in workers {
            let _ = worker.link.terminate();
        }
    }
}

/// Gives back a boot slot if spawning fails or the caller stops waiting.
struct StartingSlot<'a> {
    pool: &'a WorkerPool,
    armed: bool,
}

impl Drop for StartingSlot<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.lock().starting -= 1;
            self.pool.freed.notify_waiters();
        }
    }
}

/// Counts a queued caller for as long as it waits.
struct WaitingSlot<'a> {
    pool: &'a WorkerPool,
}

impl Drop for WaitingSlot<'_> {
    fn drop(&mut self) {
        self.pool.lock().waiting -= 1;
    }
}
