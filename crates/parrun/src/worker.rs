//! # Worker Host
//!
//! The worker side of the protocol: announces itself, then answers
//! `CallRequest`s against a [`ModuleRegistry`].
//!
//! ## Invariants
//! - `online` is the first message the caller sees.
//! - Each request is handled on its own task, so a slow call never blocks another.
//! - A `call` to a generator runs it to its first yield before replying.
//! - Suspended generators are keyed by task id and dropped once they complete or fail.
//! - A `return` that overtakes the `call` starting its generator is remembered
//!   and applied as soon as that generator is created.
//! - Only calls read off the link but not yet started are tracked for that, so a
//!   `return` for a task that already finished leaves nothing behind.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use dashmap::DashMap;
use futures::FutureExt;
use parwire::CallRequest;
use parwire::CallResponse;
use parwire::ErrorCodec;
use parwire::RemoteError;
use parwire::RequestKind;
use parwire::TaskId;
use parwire::WorkerMessage;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;
use tracing::warn;

use crate::local::WorkerPort;
use crate::module::Generator;
use crate::module::ModuleRegistry;
use crate::module::RemoteFn;
use crate::module::Resume;
use crate::module::Step;

type Suspended = Arc<Mutex<Box<dyn Generator>>>;

#[derive(Clone)]
pub struct WorkerHost {
    modules: Arc<ModuleRegistry>,
    generators: Arc<DashMap<TaskId, Suspended>>,
    /// Calls read off the link whose function has not started yet, with the
    /// value of any `return` that arrived in the meantime.
    starting: Arc<DashMap<TaskId, Option<Value>>>,
}

impl WorkerHost {
    pub fn new(modules: Arc<ModuleRegistry>) -> Self {
        Self {
            modules,
            generators: Arc::new(DashMap::new()),
            starting: Arc::new(DashMap::new()),
        }
    }

    /// Number of generators currently suspended on this worker.
    pub fn suspended(&self) -> usize {
        self.generators.len()
    }

    /// Number of calls received but not started yet.
    pub fn starting(&self) -> usize {
        self.starting.len()
    }

    /// Records a `call` as soon as it is read, before its task gets to run.
    pub(crate) fn admit(&self, request: &CallRequest) {
        if request.kind == RequestKind::Call {
            self.starting.insert(request.task_id, None);
        }
    }

    /// Serves requests until the caller terminates the link.
    pub async fn serve(self, mut port: WorkerPort) {
        let outbox = port.outbox();
        if !outbox.post(&WorkerMessage::Online) {
            return;
        }

        while let Some(bytes) = port.recv().await {
            let request: CallRequest = match parwire::decode(&bytes) {
                Ok(request) => request,
                Err(e) => {
                    warn!(error = %e, "worker dropped malformed request");
                    continue;
                }
            };

            self.admit(&request);
            let host = self.clone();
            let outbox = outbox.clone();
            tokio::spawn(async move {
                let task_id = request.task_id;
                let response = match AssertUnwindSafe(host.handle(request)).catch_unwind().await {
                    Ok(response) => response,
                    Err(panic) => {
                        host.generators.remove(&task_id);
                        host.starting.remove(&task_id);
                        let message = panic_message(panic.as_ref());
                        warn!(task = %task_id, panic = %message, "worker function panicked");
                        let err = RemoteError::new("Error", format!("worker function panicked: {}", message));
                        Some(CallResponse::failed(task_id, ErrorCodec::encode(&err)))
                    }
                };
                if let Some(response) = response {
                    outbox.post(&WorkerMessage::Response(response));
                }
            });
        }

        debug!(suspended = self.generators.len(), "worker link closed");
    }

    /// Answers one request. `None` means no reply is owed.
    pub async fn handle(&self, request: CallRequest) -> Option<CallResponse> {
        let task_id = request.task_id;
        match request.kind {
            RequestKind::Call => self.start(request).await,
            RequestKind::Next => self.step(task_id, Resume::Next(request.resume_value())).await,
            RequestKind::Return => {
                if let Some(mut early) = self.starting.get_mut(&task_id) {
                    *early = Some(request.resume_value());
                    return None;
                }
                // a generator that already finished has nothing left to stop
                self.step(task_id, Resume::Return(request.resume_value())).await
            }
            RequestKind::Throw => {
                let value = request.resume_value();
                let err = ErrorCodec::decode_value(&value)
                    .unwrap_or_else(|| RemoteError::new("Error", value.as_str().map_or_else(|| value.to_string(), String::from)));
                self.step(task_id, Resume::Throw(err)).await
            }
        }
    }

    async fn start(&self, request: CallRequest) -> Option<CallResponse> {
        let task_id = request.task_id;
        let func = match self.modules.resolve(&request.script, &request.function) {
            Ok(func) => func,
            Err(err) => {
                self.starting.remove(&task_id);
                return Some(CallResponse::failed(task_id, ErrorCodec::encode(&err)));
            }
        };

        match func {
            RemoteFn::Call(call) => {
                self.starting.remove(&task_id);
                Some(match call(request.args).await {
                    Ok(value) => CallResponse::returned(task_id, value),
                    Err(err) => CallResponse::failed(task_id, ErrorCodec::to_wire(&err)),
                })
            }
            RemoteFn::Generator(start) => {
                let generator = match start(request.args) {
                    Ok(generator) => generator,
                    Err(err) => {
                        self.starting.remove(&task_id);
                        return Some(CallResponse::failed(task_id, ErrorCodec::to_wire(&err)));
                    }
                };
                // insert before clearing the mark, so a racing `return` sees one or the other
                self.generators.insert(task_id, Arc::new(Mutex::new(generator)));

                if let Some((_, Some(value))) = self.starting.remove(&task_id) {
                    debug!(task = %task_id, "generator cancelled before it started");
                    self.step(task_id, Resume::Return(value)).await;
                    return None;
                }
                self.step(task_id, Resume::Next(Value::Null)).await
            }
        }
    }

    async fn step(&self, task_id: TaskId, input: Resume) -> Option<CallResponse> {
        let Some(generator) = self.generators.get(&task_id).map(|entry| Arc::clone(entry.value())) else {
            return match input {
                Resume::Return(_) => None,
                _ => {
                    let err = RemoteError::reference(format!("no suspended generator for {}", task_id));
                    Some(CallResponse::failed(task_id, ErrorCodec::encode(&err)))
                }
            };
        };

        let result = generator.lock().await.resume(input).await;
        let response = match result {
            Ok(Step::Yield(value)) => CallResponse::yielded(task_id, value, false),
            Ok(Step::Complete(value)) => {
                self.generators.remove(&task_id);
                CallResponse::yielded(task_id, value, true)
            }
            Err(err) => {
                self.generators.remove(&task_id);
                CallResponse::failed(task_id, ErrorCodec::to_wire(&err))
            }
        };
        Some(response)
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
