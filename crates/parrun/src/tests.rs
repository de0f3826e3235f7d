use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::future::join_all;
use parwire::CallRequest;
use parwire::CallResponse;
use parwire::ErrorCodec;
use parwire::RequestKind;
use parwire::ResponseType;
use parwire::WorkerMessage;
use serde_json::json;

use crate::link;
use crate::local::ChannelLink;
use crate::local::WorkerPort;
use crate::local::channel_pair;
use crate::module::IterGenerator;
use crate::registry::First;
use crate::registry::IterResult;
use crate::registry::Routed;
use crate::*;

// ============================================================================
//  FIXTURES
// ============================================================================

/// Yields whatever is sent in, three times, then returns "echo done".
struct Echo {
    steps: u32,
}

#[async_trait::async_trait]
impl Generator for Echo {
    async fn resume(&mut self, input: Resume) -> anyhow::Result<Step> {
        match input {
            Resume::Next(value) => {
                self.steps += 1;
                if self.steps <= 3 { Ok(Step::Yield(value)) } else { Ok(Step::Complete(json!("echo done"))) }
            }
            Resume::Return(value) => Ok(Step::Complete(value)),
            Resume::Throw(err) => Err(err.into()),
        }
    }
}

fn modules() -> ModuleRegistry {
    let math = Module::new()
        .function_sync("greet", |args| {
            let name = args.first().and_then(Value::as_str).unwrap_or("nobody");
            Ok(json!(format!("Hi, {}", name)))
        })
        .function_sync("add", |args| Ok(json!(args.iter().filter_map(Value::as_i64).sum::<i64>())))
        .function("slow", |args| async move {
            let ms = args.first().and_then(Value::as_u64).unwrap_or(50);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            anyhow::Ok(json!(ms))
        })
        .function_sync("range", |_| Err(RemoteError::range("x").into()))
        .function_sync("boom", |_| -> anyhow::Result<Value> { panic!("kaboom") })
        .generator("letters", |_| Ok(IterGenerator::new(vec![json!("a"), json!("b")].into_iter(), json!("a, b"))))
        .generator("echo", |_| Ok(Echo { steps: 0 }))
        .generator("nothing", |_| Ok(IterGenerator::new(std::iter::empty(), json!("none"))));

    ModuleRegistry::new().register("math", math)
}

/// Spawns in-runtime workers and counts them.
#[derive(Clone)]
struct CountingSpawner {
    inner: TaskSpawner,
    spawned: Arc<AtomicUsize>,
}

impl CountingSpawner {
    fn new() -> Self {
        Self { inner: TaskSpawner::new(modules()), spawned: Arc::new(AtomicUsize::new(0)) }
    }

    fn spawned(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Spawner for CountingSpawner {
    async fn spawn(&self, entry: &str) -> link::Result<Box<dyn WorkerLink>> {
        self.spawned.fetch_add(1, Ordering::SeqCst);
        self.inner.spawn(entry).await
    }
}

/// Spawns workers that run a hand-written script instead of a `WorkerHost`.
struct ScriptedSpawner<F> {
    script: F,
}

#[async_trait::async_trait]
impl<F> Spawner for ScriptedSpawner<F>
where
    F: Fn(WorkerPort) -> BoxFuture<'static, ()> + Send + Sync + 'static,
{
    async fn spawn(&self, _entry: &str) -> link::Result<Box<dyn WorkerLink>> {
        let (link, port) = channel_pair();
        tokio::spawn((self.script)(port));
        Ok(Box::new(link))
    }
}

/// Answers `slow` after 100ms and exits 50ms after receiving `crash`.
fn crashing_worker(mut port: WorkerPort) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        let outbox = port.outbox();
        outbox.post(&WorkerMessage::Online);
        while let Some(bytes) = port.recv().await {
            let Ok(request) = parwire::decode::<CallRequest>(&bytes) else { continue };
            if request.function == "crash" {
                tokio::time::sleep(Duration::from_millis(50)).await;
                return;
            }
            let outbox = outbox.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                outbox.post(&WorkerMessage::Response(CallResponse::returned(request.task_id, json!("ok"))));
            });
        }
    })
}

/// A link whose `terminate` stops the worker but still reports a failure.
struct StubbornLink {
    inner: ChannelLink,
}

#[async_trait::async_trait]
impl WorkerLink for StubbornLink {
    async fn send(&self, payload: &[u8]) -> link::Result<()> {
        self.inner.send(payload).await
    }

    async fn recv(&self) -> link::Result<Option<Vec<u8>>> {
        self.inner.recv().await
    }

    fn terminate(&self) -> link::Result<()> {
        self.inner.terminate()?;
        Err(link::Error::Io("terminate refused".to_string()))
    }
}

struct StubbornSpawner;

#[async_trait::async_trait]
impl Spawner for StubbornSpawner {
    async fn spawn(&self, _entry: &str) -> link::Result<Box<dyn WorkerLink>> {
        let (link, port) = channel_pair();
        tokio::spawn(WorkerHost::new(Arc::new(modules())).serve(port));
        Ok(Box::new(StubbornLink { inner: link }))
    }
}

fn client(spawner: CountingSpawner) -> RpcClient {
    RpcClient::builder(spawner).max_workers(4).build()
}

// ============================================================================
//  WORKER HOST
// ============================================================================

#[tokio::test]
async fn test_host_answers_call() {
    let host = WorkerHost::new(Arc::new(modules()));
    let resp = host.handle(CallRequest::call(TaskId(1), "math", "greet", vec![json!("World")])).await;

    assert_eq!(resp, Some(CallResponse::returned(TaskId(1), json!("Hi, World"))));
}

#[tokio::test]
async fn test_host_missing_function_is_reference_error() {
    let host = WorkerHost::new(Arc::new(modules()));

    for (script, function) in [("math", "nope"), ("physics", "greet")] {
        let resp = host.handle(CallRequest::call(TaskId(1), script, function, vec![])).await.unwrap();
        assert_eq!(resp.kind, ResponseType::Error);
        let err = ErrorCodec::from_wire(resp.error.unwrap());
        assert_eq!(err.kind(), ErrorKind::ReferenceError);
    }
}

#[tokio::test]
async fn test_host_runs_generator_to_first_yield() {
    let host = WorkerHost::new(Arc::new(modules()));
    let id = TaskId(3);
    let next = || CallRequest::resume(id, "math", "letters", RequestKind::Next, Value::Null);

    let first = host.handle(CallRequest::call(id, "math", "letters", vec![])).await;
    assert_eq!(first, Some(CallResponse::yielded(id, json!("a"), false)));
    assert_eq!(host.suspended(), 1);

    assert_eq!(host.handle(next()).await, Some(CallResponse::yielded(id, json!("b"), false)));
    assert_eq!(host.handle(next()).await, Some(CallResponse::yielded(id, json!("a, b"), true)));
    assert_eq!(host.suspended(), 0);

    let after = host.handle(next()).await.unwrap();
    assert_eq!(after.kind, ResponseType::Error);
}

#[tokio::test]
async fn test_host_return_overtaking_call_is_applied() {
    let host = WorkerHost::new(Arc::new(modules()));
    let id = TaskId(5);

    let call = CallRequest::call(id, "math", "letters", vec![]);
    host.admit(&call);

    let early = CallRequest::resume(id, "math", "letters", RequestKind::Return, json!("early"));
    assert_eq!(host.handle(early).await, None);

    assert_eq!(host.handle(call).await, None);
    assert_eq!(host.suspended(), 0);
    assert_eq!(host.starting(), 0);
}

#[tokio::test]
async fn test_host_return_after_generator_finished_leaves_nothing() {
    let host = WorkerHost::new(Arc::new(modules()));

    for n in 1..=100 {
        let id = TaskId(n);
        let call = CallRequest::call(id, "math", "nothing", vec![]);
        host.admit(&call);
        assert_eq!(host.handle(call).await, Some(CallResponse::yielded(id, json!("none"), true)));

        let late = CallRequest::resume(id, "math", "nothing", RequestKind::Return, Value::Null);
        assert_eq!(host.handle(late).await, None);
    }

    assert_eq!(host.suspended(), 0);
    assert_eq!(host.starting(), 0);
}

#[tokio::test]
async fn test_host_start_failures_clear_pending_call() {
    let host = WorkerHost::new(Arc::new(modules()));

    for (n, function) in [(1, "nope"), (2, "range"), (3, "greet")] {
        let call = CallRequest::call(TaskId(n), "math", function, vec![]);
        host.admit(&call);
        host.handle(call).await;
    }

    assert_eq!(host.starting(), 0);
}

#[tokio::test]
async fn test_host_return_for_plain_call_is_forgotten() {
    let host = WorkerHost::new(Arc::new(modules()));
    let id = TaskId(6);

    let call = CallRequest::call(id, "math", "greet", vec![json!("again")]);
    host.admit(&call);

    let stray = CallRequest::resume(id, "math", "greet", RequestKind::Return, Value::Null);
    assert_eq!(host.handle(stray).await, None);

    let resp = host.handle(call).await;
    assert_eq!(resp, Some(CallResponse::returned(id, json!("Hi, again"))));
    assert_eq!(host.starting(), 0);
}

#[tokio::test]
async fn test_host_throw_lands_in_generator() {
    let host = WorkerHost::new(Arc::new(modules()));
    let id = TaskId(7);
    host.handle(CallRequest::call(id, "math", "echo", vec![])).await;

    let payload = ErrorCodec::encode(&RemoteError::type_error("stop")).to_value();
    let resp = host.handle(CallRequest::resume(id, "math", "echo", RequestKind::Throw, payload)).await.unwrap();

    let err = ErrorCodec::from_wire(resp.error.unwrap());
    assert_eq!(err.to_string(), "TypeError: stop");
    assert_eq!(host.suspended(), 0);
}

#[tokio::test]
async fn test_serve_reports_panics_and_exits_on_terminate() {
    let (link, port) = channel_pair();
    tokio::spawn(WorkerHost::new(Arc::new(modules())).serve(port));

    let online: WorkerMessage = parwire::decode(&link.recv().await.unwrap().unwrap()).unwrap();
    assert_eq!(online, WorkerMessage::Online);

    let request = parwire::encode(&CallRequest::call(TaskId(1), "math", "boom", vec![])).unwrap();
    link.send(&request).await.unwrap();

    match parwire::decode(&link.recv().await.unwrap().unwrap()).unwrap() {
        WorkerMessage::Response(resp) => {
            let err = ErrorCodec::from_wire(resp.error.unwrap());
            assert!(err.message().contains("kaboom"), "got {}", err);
        }
        other => panic!("Expected a response, got {:?}", other),
    }

    link.terminate().unwrap();
    assert_eq!(link.recv().await.unwrap(), None);
    assert!(link.send(&request).await.is_err());
}

// ============================================================================
//  REGISTRY
// ============================================================================

#[test]
fn test_registry_ids_are_unique_and_increasing() {
    let reg = TaskRegistry::new();
    let ids: Vec<TaskId> = (0..5).map(|_| reg.allocate()).collect();
    assert_eq!(ids, (1..=5).map(TaskId).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_registry_return_settles_once() {
    let reg = TaskRegistry::new();
    let id = reg.allocate();
    let rx = reg.register(id, "math", "greet");
    assert_eq!(reg.state(id), Some(TaskState::Created));

    reg.dispatched(id, WorkerId(1));
    assert_eq!(reg.state(id), Some(TaskState::Dispatched));
    assert_eq!(reg.worker_of(id), Some(WorkerId(1)));

    assert_eq!(reg.route(CallResponse::returned(id, json!(3))), Routed::Terminal);
    match rx.await.unwrap() {
        Ok(First::Return(value)) => assert_eq!(value, json!(3)),
        _ => panic!("Expected a return"),
    }

    assert!(reg.is_empty());
    assert_eq!(reg.route(CallResponse::returned(id, json!(4))), Routed::Unknown);
}

#[tokio::test]
async fn test_registry_yields_become_stream() {
    let reg = TaskRegistry::new();
    let id = reg.allocate();
    let rx = reg.register(id, "math", "letters");

    assert_eq!(reg.route(CallResponse::yielded(id, json!("a"), false)), Routed::Pending);
    let channel = match rx.await.unwrap() {
        Ok(First::Stream(channel)) => channel,
        _ => panic!("Expected a stream"),
    };
    assert_eq!(reg.state(id), Some(TaskState::Streaming));

    assert_eq!(reg.begin_pull(id), Some(false));
    assert_eq!(reg.begin_pull(id), Some(true));

    assert_eq!(reg.route(CallResponse::yielded(id, json!("b"), false)), Routed::Pending);
    assert_eq!(reg.route(CallResponse::yielded(id, json!("a, b"), true)), Routed::Terminal);
    assert_eq!(reg.begin_pull(id), None);

    let item = |value: Value, done| Some(IterResult { value, done });
    assert_eq!(channel.pop().await.unwrap(), item(json!("a"), false));
    assert_eq!(channel.pop().await.unwrap(), item(json!("b"), false));
    assert_eq!(channel.pop().await.unwrap(), item(json!("a, b"), true));
    assert_eq!(channel.pop().await.unwrap(), None);
}

#[tokio::test]
async fn test_registry_error_gains_local_frame() {
    let reg = TaskRegistry::new();
    let id = reg.allocate();
    let rx = reg.register(id, "math", "check");

    let wire = ErrorCodec::encode(&RemoteError::range("x"));
    assert_eq!(reg.route(CallResponse::failed(id, wire)), Routed::Terminal);

    match rx.await.unwrap() {
        Err(Error::Remote(err)) => {
            assert_eq!(err.kind(), ErrorKind::RangeError);
            assert!(err.stack().unwrap().ends_with("at math.check (local)"));
        }
        _ => panic!("Expected a remote error"),
    }
}

#[tokio::test]
async fn test_registry_error_without_payload_is_protocol_error() {
    let reg = TaskRegistry::new();
    let id = reg.allocate();
    let rx = reg.register(id, "math", "greet");

    let broken = CallResponse { task_id: id, kind: ResponseType::Error, value: None, done: None, error: None };
    assert_eq!(reg.route(broken), Routed::Terminal);
    assert!(matches!(rx.await.unwrap(), Err(Error::Protocol(_))));
}

#[test]
fn test_registry_abandoned_generator() {
    let reg = TaskRegistry::new();
    let id = reg.allocate();
    drop(reg.register(id, "math", "letters"));

    let routed = reg.route(CallResponse::yielded(id, json!("a"), false));
    assert_eq!(routed, Routed::Abandoned { script: "math".into(), function: "letters".into() });
    assert!(!reg.contains(id));
}

#[tokio::test]
async fn test_registry_cancel() {
    let reg = TaskRegistry::new();
    let id = reg.allocate();
    let rx = reg.register(id, "math", "slow");

    assert!(reg.cancel(id));
    assert!(!reg.cancel(id));
    assert!(matches!(rx.await.unwrap(), Err(Error::Cancelled(t)) if t == id));
    assert_eq!(reg.route(CallResponse::returned(id, json!(1))), Routed::Unknown);
}

// ============================================================================
//  POOL
// ============================================================================

#[tokio::test]
async fn test_workers_spawn_lazily_and_are_reused() {
    let spawner = CountingSpawner::new();
    let client = client(spawner.clone());
    let math = client.parallel("math");
    assert_eq!(client.stats().workers, 0);

    for name in ["a", "b", "c"] {
        let greeting = math.invoke("greet", vec![json!(name)]).await.unwrap();
        assert_eq!(greeting, json!(format!("Hi, {}", name)));
    }

    assert_eq!(spawner.spawned(), 1);
    assert_eq!(client.stats(), PoolStats { workers: 1, idle: 1, spawned_total: 1, ..PoolStats::default() });
}

#[tokio::test]
async fn test_concurrency_never_exceeds_max_workers() {
    let spawner = CountingSpawner::new();
    let client = RpcClient::builder(spawner.clone()).max_workers(2).build();
    let math = client.parallel("math");

    let calls = (0..5).map(|_| math.invoke("slow", vec![json!(30)]));
    let results = join_all(calls).await;

    assert!(results.iter().all(|r| matches!(r, Ok(v) if *v == json!(30))));
    assert!(spawner.spawned() <= 2, "spawned {}", spawner.spawned());
    assert!(client.stats().workers <= 2);
    assert_eq!(client.in_flight(), 0);
}

#[tokio::test]
async fn test_full_pool_shares_worker_by_task_id() {
    let spawner = CountingSpawner::new();
    let client = RpcClient::builder(spawner.clone()).max_workers(2).build();
    let math = client.parallel("math");

    let first = math.call("slow", vec![json!(100)]).await.unwrap();
    let second = math.call("slow", vec![json!(100)]).await.unwrap();
    let third = math.call("slow", vec![json!(100)]).await.unwrap();

    let workers = [first.worker(), second.worker()];
    assert_ne!(workers[0], workers[1]);
    assert_eq!(third.worker(), workers[(third.task_id().0 % 2) as usize]);
    assert_eq!(client.stats().spawned_total, 2);
    assert_eq!(spawner.spawned(), 2);

    for handle in [first, second, third] {
        assert_eq!(handle.await.unwrap(), json!(100));
    }
}

#[tokio::test]
async fn test_queue_policy_rejects_when_full() {
    let client = RpcClient::builder(CountingSpawner::new())
        .max_workers(1)
        .overflow(Overflow::Queue { limit: 0 })
        .build();
    let math = client.parallel("math");

    let busy = math.call("slow", vec![json!(50)]).await.unwrap();
    match math.call("greet", vec![]).await {
        Err(Error::PoolExhausted { max_workers, .. }) => assert_eq!(max_workers, 1),
        Err(e) => panic!("Expected PoolExhausted, got {}", e),
        Ok(_) => panic!("Expected PoolExhausted"),
    }
    assert!(!client.registry().contains(TaskId(2)));

    assert_eq!(busy.await.unwrap(), json!(50));
    assert_eq!(math.invoke("greet", vec![json!("later")]).await.unwrap(), json!("Hi, later"));
}

#[tokio::test]
async fn test_queue_policy_waits_for_idle_worker() {
    let spawner = CountingSpawner::new();
    let client = RpcClient::builder(spawner.clone())
        .max_workers(1)
        .overflow(Overflow::Queue { limit: 4 })
        .build();
    let math = client.parallel("math");

    let results = join_all((0..3).map(|_| math.invoke("slow", vec![json!(20)]))).await;

    assert!(results.iter().all(Result::is_ok));
    assert_eq!(spawner.spawned(), 1);
    assert_eq!(client.stats().waiting, 0);
}

#[tokio::test]
async fn test_idle_workers_are_retired() {
    let spawner = CountingSpawner::new();
    let client = RpcClient::builder(spawner.clone()).idle_timeout(Duration::ZERO).build();
    let math = client.parallel("math");

    math.invoke("greet", vec![]).await.unwrap();
    assert_eq!(client.stats().workers, 0);

    math.invoke("greet", vec![]).await.unwrap();
    assert_eq!(spawner.spawned(), 2);
}

#[tokio::test]
async fn test_sweep_keeps_recent_workers() {
    let client = RpcClient::builder(CountingSpawner::new()).idle_timeout(Duration::from_millis(40)).build();
    let math = client.parallel("math");

    math.invoke("greet", vec![]).await.unwrap();
    assert_eq!(client.sweep(), 0);
    assert_eq!(client.stats().workers, 1);

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(client.sweep(), 1);
    assert_eq!(client.stats().workers, 0);
}

#[tokio::test]
async fn test_sweep_swallows_terminate_failures() {
    let client = RpcClient::builder(StubbornSpawner).idle_timeout(Duration::from_millis(20)).build();
    let math = client.parallel("math");

    math.invoke("greet", vec![]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(40)).await;

    assert_eq!(client.sweep(), 1);
    assert_eq!(client.stats().workers, 0);

    assert_eq!(math.invoke("greet", vec![json!("again")]).await.unwrap(), json!("Hi, again"));
    assert_eq!(client.stats().spawned_total, 2);
}

#[tokio::test]
async fn test_crash_fails_only_that_workers_tasks() {
    let spawner = ScriptedSpawner { script: crashing_worker };
    let client = RpcClient::builder(spawner).max_workers(2).build();
    let script = client.parallel("any");

    let doomed = script.call("crash", vec![]).await.unwrap();
    let healthy = script.call("slow", vec![]).await.unwrap();
    assert_ne!(doomed.worker(), healthy.worker());
    let crashed_worker = doomed.worker();

    match doomed.await {
        Err(Error::WorkerCrashed { worker, .. }) => assert_eq!(worker, crashed_worker),
        other => panic!("Expected WorkerCrashed, got {:?}", other),
    }
    assert_eq!(healthy.await.unwrap(), json!("ok"));
    assert_eq!(client.stats().workers, 1);
}

#[tokio::test]
async fn test_worker_exiting_before_online_is_spawn_error() {
    let spawner = ScriptedSpawner { script: |port: WorkerPort| -> BoxFuture<'static, ()> { Box::pin(async move { drop(port) }) } };
    let client = RpcClient::builder(spawner).build();

    let err = client.call("math", "greet", vec![]).await.err().unwrap();
    assert!(matches!(err, Error::Spawn(_)), "got {}", err);
    assert_eq!(client.stats(), PoolStats::default());
    assert_eq!(client.in_flight(), 0);
}

#[tokio::test]
async fn test_worker_gone_before_send_is_crash() {
    let spawner = ScriptedSpawner {
        script: |port: WorkerPort| -> BoxFuture<'static, ()> {
            Box::pin(async move {
                port.outbox().post(&WorkerMessage::Online);
            })
        },
    };
    let client = RpcClient::builder(spawner).build();

    match client.call("math", "greet", vec![]).await {
        Err(Error::WorkerCrashed { worker, .. }) => assert_eq!(worker, WorkerId(1)),
        Err(e) => panic!("Expected WorkerCrashed, got {}", e),
        Ok(_) => panic!("Expected WorkerCrashed"),
    }
    assert_eq!(client.in_flight(), 0);
}

#[tokio::test]
async fn test_response_before_online_is_protocol_error() {
    let spawner = ScriptedSpawner {
        script: |port: WorkerPort| -> BoxFuture<'static, ()> {
            Box::pin(async move {
                port.outbox().post(&WorkerMessage::Response(CallResponse::returned(TaskId(1), json!(1))));
            })
        },
    };
    let client = RpcClient::builder(spawner).build();

    let err = client.call("math", "greet", vec![]).await.err().unwrap();
    assert!(matches!(err, Error::Protocol(_)), "got {}", err);
}

// ============================================================================
//  CALLS AND STREAMS
// ============================================================================

#[tokio::test]
async fn test_remote_error_keeps_type_and_gains_local_frame() {
    let client = client(CountingSpawner::new());

    match client.parallel("math").invoke("range", vec![]).await {
        Err(Error::Remote(err)) => {
            assert_eq!(err.kind(), ErrorKind::RangeError);
            assert_eq!(err.message(), "x");
            assert!(err.stack().unwrap().contains("at math.range (local)"));
        }
        other => panic!("Expected a RangeError, got {:?}", other),
    }
}

#[tokio::test]
async fn test_call_with_spreads_tuples() {
    let client = client(CountingSpawner::new());
    let math = client.parallel("math");

    let sum: i64 = math.call_with("add", (1, 2, 3)).await.unwrap().result_as().await.unwrap();
    assert_eq!(sum, 6);

    let greeting = math.call_with("greet", "you").await.unwrap().await.unwrap();
    assert_eq!(greeting, json!("Hi, you"));

    let nobody = math.function("greet").call(vec![]).await.unwrap().await.unwrap();
    assert_eq!(nobody, json!("Hi, nobody"));
}

#[tokio::test]
async fn test_generator_streams_then_returns() {
    let client = client(CountingSpawner::new());
    let mut letters = client.parallel("math").stream("letters", vec![]).await.unwrap();

    assert_eq!(letters.next().await.unwrap().unwrap(), json!("a"));
    assert_eq!(letters.next().await.unwrap().unwrap(), json!("b"));
    assert!(letters.next().await.is_none());
    assert!(letters.next().await.is_none());

    assert!(letters.is_done());
    assert_eq!(letters.output(), Some(&json!("a, b")));
    assert_eq!(client.in_flight(), 0);
    assert_eq!(client.stats().busy, 0);
}

#[tokio::test]
async fn test_awaiting_generator_gives_return_value() {
    let client = client(CountingSpawner::new());
    let joined = client.parallel("math").invoke("letters", vec![]).await.unwrap();
    assert_eq!(joined, json!("a, b"));
}

#[tokio::test]
async fn test_iterating_plain_call_is_empty() {
    let client = client(CountingSpawner::new());
    let mut stream = client.parallel("math").stream("greet", vec![json!("x")]).await.unwrap();

    assert!(stream.next().await.is_none());
    assert_eq!(stream.output(), Some(&json!("Hi, x")));
}

#[tokio::test]
async fn test_send_values_into_generator() {
    let client = client(CountingSpawner::new());
    let mut echo = client.parallel("math").stream("echo", vec![]).await.unwrap();

    // The first pull only collects the yield the worker ran to eagerly.
    assert_eq!(echo.send(json!(10)).await.unwrap().unwrap(), Value::Null);
    assert_eq!(echo.send(json!(1)).await.unwrap().unwrap(), json!(1));
    assert_eq!(echo.send(json!(2)).await.unwrap().unwrap(), json!(2));
    assert!(echo.next().await.is_none());
    assert_eq!(echo.output(), Some(&json!("echo done")));
}

#[tokio::test]
async fn test_throw_into_stream() {
    let client = client(CountingSpawner::new());
    let mut echo = client.parallel("math").stream("echo", vec![]).await.unwrap();
    echo.next().await.unwrap().unwrap();

    match echo.throw(RemoteError::type_error("stop")).await {
        Some(Err(Error::Remote(err))) => assert_eq!(err.to_string(), "TypeError: stop"),
        other => panic!("Expected the thrown error back, got {:?}", other.map(|r| r.is_ok())),
    }
    assert!(echo.is_done());
    assert!(echo.next().await.is_none());
}

#[tokio::test]
async fn test_throw_after_finish_rejects_locally() {
    let client = client(CountingSpawner::new());
    let mut stream = client.parallel("math").stream("greet", vec![]).await.unwrap();
    assert!(stream.next().await.is_none());

    let thrown = stream.throw(RemoteError::new("Error", "late")).await;
    assert!(matches!(thrown, Some(Err(Error::Remote(ref e))) if e.message() == "late"));
}

#[tokio::test]
async fn test_cancel_stream_early() {
    let client = client(CountingSpawner::new());
    let mut echo = client.parallel("math").stream("echo", vec![]).await.unwrap();
    echo.next().await.unwrap().unwrap();

    assert_eq!(echo.cancel(json!("stopped")), json!("stopped"));
    assert!(echo.next().await.is_none());
    assert_eq!(echo.output(), Some(&json!("stopped")));
    assert_eq!(client.in_flight(), 0);
    assert_eq!(client.stats().busy, 0);
}

#[tokio::test]
async fn test_dropping_stream_cancels_task() {
    let client = client(CountingSpawner::new());
    let mut letters = client.parallel("math").stream("letters", vec![]).await.unwrap();
    letters.next().await.unwrap().unwrap();

    drop(letters);
    assert_eq!(client.in_flight(), 0);
    assert_eq!(client.stats().busy, 0);
}

#[tokio::test]
async fn test_abort_pending_call() {
    let client = client(CountingSpawner::new());
    let handle = client.parallel("math").call("slow", vec![json!(200)]).await.unwrap();
    let task_id = handle.task_id();

    handle.abort();
    assert_eq!(client.stats().busy, 0);
    assert!(matches!(handle.await, Err(Error::Cancelled(t)) if t == task_id));
}

#[tokio::test]
async fn test_run_times_out_and_aborts() {
    let client = client(CountingSpawner::new());
    let options = RunOptions::default().function("slow").timeout(Duration::from_millis(20));

    let handle = client.run("math", vec![json!(500)], options).await.unwrap();
    assert!(matches!(handle.await, Err(Error::Timeout(_))));
    assert_eq!(client.in_flight(), 0);
    assert_eq!(client.stats().busy, 0);
}

#[tokio::test]
async fn test_run_timeout_bounds_each_pull() {
    let client = client(CountingSpawner::new());
    let options = RunOptions::default().function("slow").timeout(Duration::from_millis(20));

    let mut stream = client.run("math", vec![json!(500)], options).await.unwrap().iterate();
    assert!(matches!(stream.next().await, Some(Err(Error::Timeout(_)))));
    assert!(stream.is_done());
    assert!(stream.next().await.is_none());
    assert_eq!(client.in_flight(), 0);
    assert_eq!(client.stats().busy, 0);
}

#[tokio::test]
async fn test_run_defaults_to_default_function() {
    let modules = ModuleRegistry::new().register("job", Module::new().function_sync("default", |_| Ok(json!("ran"))));
    let client = RpcClient::builder(TaskSpawner::new(modules)).build();

    let handle = client.run("job", vec![], RunOptions::default()).await.unwrap();
    assert_eq!(handle.await.unwrap(), json!("ran"));
}

#[tokio::test]
async fn test_shutdown_fails_running_calls() {
    let client = client(CountingSpawner::new());
    let handle = client.parallel("math").call("slow", vec![json!(500)]).await.unwrap();

    client.shutdown();
    assert!(matches!(handle.await, Err(Error::Cancelled(_))));
    assert_eq!(client.stats().workers, 0);
}
