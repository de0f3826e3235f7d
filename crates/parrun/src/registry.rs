//! # Task Registry
//!
//! Tracks every in-flight call on the caller side and routes worker
//! responses to whoever is waiting on them.
//!
//! ## Invariants
//! - Task ids are unique for the lifetime of a registry and never reused.
//! - A task is settled exactly once: by a terminal response, a failure, or a cancel.
//!   Whichever comes first removes the entry; everything after it finds no task.
//! - The first `yield` turns a pending call into a stream. Later yields are
//!   pushed into that stream in arrival order.
//! - A terminal response for a streaming task pushes a final `done` item and
//!   closes the stream. A failure closes it with the error.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use parchan::Channel;
use parwire::CallResponse;
use parwire::ErrorCodec;
use parwire::Reply;
use parwire::TaskId;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::Error;
use crate::error::Result;
use crate::pool::WorkerId;

/// Lifecycle of a registered task.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TaskState {
    /// Registered, request not sent yet.
    Created,
    /// Request sent, nothing heard back.
    Dispatched,
    /// At least one `yield` received.
    Streaming,
}

/// One item of a remote generator's output.
#[derive(Clone, Debug, PartialEq)]
pub struct IterResult {
    pub value: Value,
    /// Set on the final item, whose value is the generator's return value.
    pub done: bool,
}

/// How a call first resolved.
pub(crate) enum First {
    Return(Value),
    Stream(Channel<IterResult, Error>),
}

enum Sink {
    Resolver(oneshot::Sender<Result<First>>),
    Stream(Channel<IterResult, Error>),
}

struct Task {
    script: String,
    function: String,
    worker: Option<WorkerId>,
    state: TaskState,
    sink: Sink,
    generator_started: bool,
}

impl Task {
    fn label(&self) -> String {
        format!("{}.{}", self.script, self.function)
    }

    fn settle(self, outcome: Result<Value>) {
        match (self.sink, outcome) {
            (Sink::Resolver(tx), Ok(value)) => {
                let _ = tx.send(Ok(First::Return(value)));
            }
            (Sink::Resolver(tx), Err(err)) => {
                let _ = tx.send(Err(err));
            }
            (Sink::Stream(channel), Ok(value)) => {
                let _ = channel.try_push(IterResult { value, done: true });
                channel.close();
            }
            (Sink::Stream(channel), Err(err)) => {
                channel.close_with_error(err);
            }
        }
    }
}

/// What routing a response did to its task.
#[derive(Debug, PartialEq)]
pub(crate) enum Routed {
    /// The task is still running.
    Pending,
    /// The task settled and was removed.
    Terminal,
    /// The task started streaming but nobody holds the call any more.
    Abandoned { script: String, function: String },
    /// No such task; the response was dropped.
    Unknown,
}

pub struct TaskRegistry {
    tasks: DashMap<TaskId, Task>,
    next_id: AtomicU64,
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self { tasks: DashMap::new(), next_id: AtomicU64::new(1) }
    }

    /// Hands out the next task id.
    pub fn allocate(&self) -> TaskId {
        TaskId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn register(&self, task_id: TaskId, script: &str, function: &str) -> oneshot::Receiver<Result<First>> {
        let (tx, rx) = oneshot::channel();
        self.tasks.insert(
            task_id,
            Task {
                script: script.to_string(),
                function: function.to_string(),
                worker: None,
                state: TaskState::Created,
                sink: Sink::Resolver(tx),
                generator_started: false,
            },
        );
        rx
    }

    pub(crate) fn dispatched(&self, task_id: TaskId, worker: WorkerId) {
        if let Some(mut task) = self.tasks.get_mut(&task_id) {
            task.worker = Some(worker);
            task.state = TaskState::Dispatched;
        }
    }

    /// Routes one worker response to its task.
    pub(crate) fn route(&self, response: CallResponse) -> Routed {
        let task_id = response.task_id;
        match response.into_reply() {
            Ok(Reply::Yield(value)) => self.route_yield(task_id, value),
            Ok(Reply::Return(value)) => self.settle(task_id, Ok(value)),
            Ok(Reply::Error(wire)) => {
                let Some((_, task)) = self.tasks.remove(&task_id) else {
                    debug!(task = %task_id, "error for unknown task dropped");
                    return Routed::Unknown;
                };
                let mut err = ErrorCodec::from_wire(wire);
                err.push_local_frame(&task.label());
                task.settle(Err(Error::Remote(err)));
                Routed::Terminal
            }
            Err(e) => self.settle(task_id, Err(e.into())),
        }
    }

    fn route_yield(&self, task_id: TaskId, value: Value) -> Routed {
        let Some(mut entry) = self.tasks.get_mut(&task_id) else {
            debug!(task = %task_id, "yield for unknown task dropped");
            return Routed::Unknown;
        };
        let task = entry.value_mut();
        task.state = TaskState::Streaming;
        let item = IterResult { value, done: false };

        if let Sink::Stream(channel) = &task.sink {
            let _ = channel.try_push(item);
            return Routed::Pending;
        }

        let channel = Channel::unbounded();
        let _ = channel.try_push(item);
        if let Sink::Resolver(tx) = std::mem::replace(&mut task.sink, Sink::Stream(channel.clone())) {
            if tx.send(Ok(First::Stream(channel))).is_err() {
                let script = task.script.clone();
                let function = task.function.clone();
                drop(entry);
                self.tasks.remove(&task_id);
                return Routed::Abandoned { script, function };
            }
        }
        Routed::Pending
    }

    fn settle(&self, task_id: TaskId, outcome: Result<Value>) -> Routed {
        match self.tasks.remove(&task_id) {
            Some((_, task)) => {
                task.settle(outcome);
                Routed::Terminal
            }
            None => {
                debug!(task = %task_id, "response for unknown task dropped");
                Routed::Unknown
            }
        }
    }

    /// Settles a task with `error`. Returns false if it had already settled.
    pub(crate) fn fail(&self, task_id: TaskId, error: Error) -> bool {
        self.settle(task_id, Err(error)) == Routed::Terminal
    }

    /// Tears down a task on the caller side.
    ///
    /// A pending call resolves with `Error::Cancelled`; a stream is closed
    /// without a return value. Returns false if the task had already settled.
    pub(crate) fn cancel(&self, task_id: TaskId) -> bool {
        let Some((_, task)) = self.tasks.remove(&task_id) else {
            return false;
        };
        match task.sink {
            Sink::Resolver(tx) => {
                let _ = tx.send(Err(Error::Cancelled(task_id)));
            }
            Sink::Stream(channel) => {
                channel.close();
            }
        }
        true
    }

    /// Marks that the consumer is pulling the next item.
    ///
    /// Returns `Some(true)` if a request has to be sent to produce it,
    /// `Some(false)` if it is the first yield that already arrived with the call,
    /// and `None` if the task has settled.
    pub(crate) fn begin_pull(&self, task_id: TaskId) -> Option<bool> {
        let mut task = self.tasks.get_mut(&task_id)?;
        let started = task.generator_started;
        task.generator_started = true;
        Some(started)
    }

    pub fn state(&self, task_id: TaskId) -> Option<TaskState> {
        self.tasks.get(&task_id).map(|task| task.state)
    }

    pub fn worker_of(&self, task_id: TaskId) -> Option<WorkerId> {
        self.tasks.get(&task_id).and_then(|task| task.worker)
    }

    pub fn contains(&self, task_id: TaskId) -> bool {
        self.tasks.contains_key(&task_id)
    }

    pub(crate) fn remove(&self, task_id: TaskId) -> bool {
        self.tasks.remove(&task_id).is_some()
    }

    /// Number of tasks not yet settled.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
