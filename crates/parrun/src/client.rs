//! # RPC Client
//!
//! The entry point for callers. Owns the worker pool and the task registry,
//! and wires the pool's pump tasks back into the registry.
//!
//! ```ignore
//! let client = RpcClient::builder(ThreadSpawner::new(modules)).max_workers(2).build();
//! let math = client.parallel("math");
//! let greeting = math.invoke("greet", vec![json!("World")]).await?;
//! ```

use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;

use parwire::CallRequest;
use parwire::CallResponse;
use parwire::RequestKind;
use parwire::TaskId;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;
use tracing::warn;

use crate::error::Error;
use crate::error::Result;
use crate::handle::CallHandle;
use crate::handle::RemoteStream;
use crate::handle::TaskRef;
use crate::link::Spawner;
use crate::link::WorkerLink;
use crate::pool::Overflow;
use crate::pool::PoolConfig;
use crate::pool::PoolStats;
use crate::pool::Router;
use crate::pool::WorkerId;
use crate::pool::WorkerPool;
use crate::registry::Routed;
use crate::registry::TaskRegistry;

pub(crate) struct ClientInner {
    pub(crate) pool: WorkerPool,
    pub(crate) registry: TaskRegistry,
}

impl ClientInner {
    /// Frees the task's worker slot and retires whatever went idle for too long.
    fn finish(&self, task_id: TaskId) {
        self.pool.release(task_id);
        self.pool.sweep();
    }

    pub(crate) fn fail(&self, task_id: TaskId, error: Error) {
        if self.registry.fail(task_id, error) {
            self.finish(task_id);
        }
    }

    /// Tears the task down locally and posts a best-effort `return` to its worker.
    pub(crate) fn cancel(&self, task: &TaskRef, value: Value) {
        if !self.registry.cancel(task.task_id) {
            return;
        }
        debug!(task = %task.task_id, worker = %task.lease.worker, "cancelling task");
        let request = CallRequest::resume(task.task_id, &*task.script, &*task.function, RequestKind::Return, value);
        post_detached(Arc::clone(&task.lease.link), &request);
        self.finish(task.task_id);
    }
}

impl Router for ClientInner {
    fn route(&self, worker: WorkerId, response: CallResponse) {
        let task_id = response.task_id;
        // The slot is free before the caller wakes up.
        if response.is_terminal() {
            self.finish(task_id);
        }

        if let Routed::Abandoned { script, function } = self.registry.route(response) {
            debug!(task = %task_id, worker = %worker, "generator abandoned by caller");
            if let Some(link) = self.pool.link_of(worker) {
                let request = CallRequest::resume(task_id, script, function, RequestKind::Return, Value::Null);
                post_detached(link, &request);
            }
            self.finish(task_id);
        }
    }

    fn worker_exited(&self, worker: WorkerId, reason: String) {
        let Some(tasks) = self.pool.evict(worker) else {
            debug!(worker = %worker, "retired worker exited");
            return;
        };

        warn!(worker = %worker, tasks = tasks.len(), reason = %reason, "worker crashed");
        for task_id in tasks {
            self.registry.fail(task_id, Error::WorkerCrashed { worker, reason: reason.clone() });
        }
    }
}

/// Sends a message without waiting for it. Needs a tokio runtime; without one
/// the message is dropped.
fn post_detached(link: Arc<dyn WorkerLink>, request: &CallRequest) {
    let bytes = match parwire::encode(request) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(task = %request.task_id, error = %e, "failed to encode request");
            return;
        }
    };
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        debug!(task = %request.task_id, "no runtime, dropping {:?} request", request.kind);
        return;
    };
    let task_id = request.task_id;
    runtime.spawn(async move {
        if let Err(e) = link.send(&bytes).await {
            debug!(task = %task_id, error = %e, "detached send failed");
        }
    });
}

/// Settles the task if the caller stops before the request is sent.
struct Dispatch<'a> {
    inner: &'a ClientInner,
    task_id: TaskId,
    armed: bool,
}

impl Drop for Dispatch<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.registry.remove(self.task_id);
            self.inner.pool.release(self.task_id);
        }
    }
}

/// Options for [`RpcClient::run`].
#[derive(Clone, Debug)]
pub struct RunOptions {
    /// Function to call. Defaults to `"default"`.
    pub function: String,
    pub timeout: Option<Duration>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self { function: "default".to_string(), timeout: None }
    }
}

impl RunOptions {
    pub fn function(mut self, name: impl Into<String>) -> Self {
        self.function = name.into();
        self
    }

    pub fn timeout(mut self, limit: Duration) -> Self {
        self.timeout = Some(limit);
        self
    }
}

/// Calls functions on a pool of workers.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<ClientInner>,
}

impl RpcClient {
    pub fn new(spawner: impl Spawner, config: PoolConfig) -> Self {
        Self::with_spawner(Arc::new(spawner), config)
    }

    pub fn with_spawner(spawner: Arc<dyn Spawner>, config: PoolConfig) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<ClientInner>| {
            let router: Weak<dyn Router> = weak.clone();
            ClientInner { pool: WorkerPool::new(config, spawner, router), registry: TaskRegistry::new() }
        });
        Self { inner }
    }

    pub fn builder(spawner: impl Spawner) -> ClientBuilder {
        ClientBuilder { spawner: Arc::new(spawner), config: PoolConfig::default() }
    }

    /// A proxy whose calls all go to functions of `script`.
    pub fn parallel(&self, script: impl Into<String>) -> ModuleProxy {
        ModuleProxy { client: self.clone(), script: script.into() }
    }

    /// Dispatches a call and returns its handle once the request is on its way.
    pub async fn call(&self, script: &str, function: &str, args: Vec<Value>) -> Result<CallHandle> {
        self.dispatch(script, function, args, None).await
    }

    /// Runs `options.function` of `script`.
    pub async fn run(&self, script: &str, args: Vec<Value>, options: RunOptions) -> Result<CallHandle> {
        self.dispatch(script, &options.function, args, options.timeout).await
    }

    async fn dispatch(
        &self,
        script: &str,
        function: &str,
        args: Vec<Value>,
        timeout: Option<Duration>,
    ) -> Result<CallHandle> {
        let inner = &*self.inner;
        let task_id = inner.registry.allocate();
        let mut dispatch = Dispatch { inner, task_id, armed: true };

        let mut first = inner.registry.register(task_id, script, function);
        let lease = inner.pool.acquire(task_id).await?;
        inner.registry.dispatched(task_id, lease.worker);
        debug!(task = %task_id, worker = %lease.worker, script, function, "dispatching call");

        let request = CallRequest::call(task_id, script, function, args);
        let bytes = parwire::encode(&request)?;
        if let Err(e) = lease.link.send(&bytes).await {
            // the worker went away after it was leased
            return Err(match first.try_recv() {
                Ok(Err(crash)) => crash,
                _ => Error::WorkerCrashed { worker: lease.worker, reason: e.to_string() },
            });
        }
        dispatch.armed = false;

        let task = TaskRef {
            inner: Arc::clone(&self.inner),
            task_id,
            script: Arc::from(script),
            function: Arc::from(function),
            lease,
        };
        Ok(CallHandle::new(task, first, timeout))
    }

    pub fn stats(&self) -> PoolStats {
        self.inner.pool.stats()
    }

    pub fn config(&self) -> &PoolConfig {
        self.inner.pool.config()
    }

    /// Number of calls that have not settled yet.
    pub fn in_flight(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.inner.registry
    }

    /// Retires idle workers now instead of waiting for the next call to finish.
    pub fn sweep(&self) -> usize {
        self.inner.pool.sweep()
    }

    /// Terminates every worker. Calls still running fail with `Error::Cancelled`.
    pub fn shutdown(&self) {
        for task_id in self.inner.pool.shutdown() {
            self.inner.registry.fail(task_id, Error::Cancelled(task_id));
        }
    }
}

pub struct ClientBuilder {
    spawner: Arc<dyn Spawner>,
    config: PoolConfig,
}

impl ClientBuilder {
    /// Clamped to at least one.
    pub fn max_workers(mut self, max_workers: usize) -> Self {
        self.config.max_workers = max_workers.max(1);
        self
    }

    pub fn idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.config.idle_timeout = idle_timeout;
        self
    }

    pub fn entry(mut self, entry: impl Into<String>) -> Self {
        self.config.entry = entry.into();
        self
    }

    pub fn overflow(mut self, overflow: Overflow) -> Self {
        self.config.overflow = overflow;
        self
    }

    pub fn config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> RpcClient {
        RpcClient::with_spawner(self.spawner, self.config)
    }
}

/// Calls functions of one script.
#[derive(Clone)]
pub struct ModuleProxy {
    client: RpcClient,
    script: String,
}

impl ModuleProxy {
    pub fn script(&self) -> &str {
        &self.script
    }

    pub async fn call(&self, function: &str, args: Vec<Value>) -> Result<CallHandle> {
        self.client.call(&self.script, function, args).await
    }

    /// Calls with serializable arguments. A tuple or array spreads into
    /// positional arguments, `()` means none, anything else is a single argument.
    pub async fn call_with<A: Serialize>(&self, function: &str, args: A) -> Result<CallHandle> {
        let args = match serde_json::to_value(args)? {
            Value::Array(args) => args,
            Value::Null => Vec::new(),
            arg => vec![arg],
        };
        self.call(function, args).await
    }

    /// Calls and waits for the result.
    pub async fn invoke(&self, function: &str, args: Vec<Value>) -> Result<Value> {
        self.call(function, args).await?.await
    }

    /// Calls and iterates the yields.
    pub async fn stream(&self, function: &str, args: Vec<Value>) -> Result<RemoteStream> {
        Ok(self.call(function, args).await?.iterate())
    }

    pub fn function(&self, name: impl Into<String>) -> RemoteFunction {
        RemoteFunction { module: self.clone(), name: name.into() }
    }
}

/// A stub for one remote function.
#[derive(Clone)]
pub struct RemoteFunction {
    module: ModuleProxy,
    name: String,
}

impl RemoteFunction {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn call(&self, args: Vec<Value>) -> Result<CallHandle> {
        self.module.call(&self.name, args).await
    }

    pub async fn invoke(&self, args: Vec<Value>) -> Result<Value> {
        self.module.invoke(&self.name, args).await
    }
}
