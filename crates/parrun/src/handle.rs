//! # Call Handles
//!
//! What a caller holds while a remote call is in flight.
//!
//! A [`CallHandle`] resolves once: either to a value, or, if the remote
//! function is a generator, to a [`RemoteStream`]. The stream pulls one item
//! per request so the worker never runs ahead of the consumer.
//!
//! ## Invariants
//! - A worker runs a generator to its first yield before answering the call.
//!   The first pull consumes that yield; every later pull sends one request.
//! - Dropping an unfinished stream cancels its task.
//! - Once a stream is done, `next` keeps returning `None`.
//! - A call's timeout bounds the whole `result`, or each pull of its stream.

use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use futures::future::BoxFuture;
use parchan::Channel;
use parwire::CallRequest;
use parwire::ErrorCodec;
use parwire::RemoteError;
use parwire::RequestKind;
use parwire::TaskId;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::warn;

use crate::client::ClientInner;
use crate::error::Error;
use crate::error::Result;
use crate::pool::Lease;
use crate::pool::WorkerId;
use crate::registry::First;
use crate::registry::IterResult;

/// Everything needed to talk to one task after dispatch.
#[derive(Clone)]
pub(crate) struct TaskRef {
    pub(crate) inner: Arc<ClientInner>,
    pub(crate) task_id: TaskId,
    pub(crate) script: Arc<str>,
    pub(crate) function: Arc<str>,
    pub(crate) lease: Lease,
}

impl TaskRef {
    fn cancel(&self, value: Value) {
        self.inner.cancel(self, value);
    }

    /// Sends a generator request. A failed send settles the task with the error.
    async fn send(&self, kind: RequestKind, value: Value) {
        let request = CallRequest::resume(self.task_id, &*self.script, &*self.function, kind, value);
        let sent = match parwire::encode(&request) {
            Ok(bytes) => self.lease.link.send(&bytes).await.map_err(Error::Link),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = sent {
            self.inner.fail(self.task_id, e);
        }
    }
}

/// How a call resolved.
pub enum Outcome {
    Value(Value),
    Stream(RemoteStream),
}

/// A dispatched call.
///
/// Await it for the result. A generator's result is its return value, after
/// all of its yields have been drained. Use [`CallHandle::iterate`] to see the
/// yields instead.
pub struct CallHandle {
    task: TaskRef,
    first: oneshot::Receiver<Result<First>>,
    timeout: Option<Duration>,
}

impl CallHandle {
    pub(crate) fn new(task: TaskRef, first: oneshot::Receiver<Result<First>>, timeout: Option<Duration>) -> Self {
        Self { task, first, timeout }
    }

    pub fn task_id(&self) -> TaskId {
        self.task.task_id
    }

    pub fn worker(&self) -> WorkerId {
        self.task.lease.worker
    }

    /// Fails the call with `Error::Timeout` if it has not settled within `limit`.
    pub fn with_timeout(mut self, limit: Duration) -> Self {
        self.timeout = Some(limit);
        self
    }

    /// Tears down the task locally and asks the worker to stop it.
    ///
    /// The caller sees `Error::Cancelled`. The worker is only asked; work
    /// already running there finishes and its answer is dropped.
    pub fn abort(&self) {
        self.task.cancel(Value::Null);
    }

    /// Waits for the first response and reports what kind of call this was.
    pub async fn resolve(self) -> Result<Outcome> {
        let task_id = self.task.task_id;
        match self.first.await {
            Ok(Ok(First::Return(value))) => Ok(Outcome::Value(value)),
            Ok(Ok(First::Stream(channel))) => Ok(Outcome::Stream(RemoteStream::active(self.task, channel))),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::Cancelled(task_id)),
        }
    }

    pub async fn result(self) -> Result<Value> {
        let Some(limit) = self.timeout else {
            return self.settle().await;
        };

        let task = self.task.clone();
        match tokio::time::timeout(limit, self.settle()).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(task = %task.task_id, timeout = ?limit, "call timed out, aborting");
                task.cancel(Value::Null);
                Err(Error::Timeout(limit))
            }
        }
    }

    pub async fn result_as<T: DeserializeOwned>(self) -> Result<T> {
        Ok(serde_json::from_value(self.result().await?)?)
    }

    async fn settle(self) -> Result<Value> {
        match self.resolve().await? {
            Outcome::Value(value) => Ok(value),
            Outcome::Stream(mut stream) => stream.drain().await,
        }
    }

    /// Iterates the call's yields.
    ///
    /// A call that returns instead of yielding gives an empty stream whose
    /// `output` is the returned value. A timeout on the handle applies to each
    /// pull: one that runs over cancels the task and yields `Error::Timeout`.
    pub fn iterate(self) -> RemoteStream {
        RemoteStream { task: self.task, state: StreamState::Pending(self.first), output: None, timeout: self.timeout }
    }

    /// Iterates the call's yields as a `futures::Stream`.
    pub fn into_stream(self) -> impl Stream<Item = Result<Value>> + Send {
        self.iterate().into_values()
    }
}

impl IntoFuture for CallHandle {
    type Output = Result<Value>;
    type IntoFuture = BoxFuture<'static, Result<Value>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.result())
    }
}

enum StreamState {
    Pending(oneshot::Receiver<Result<First>>),
    Active(Channel<IterResult, Error>),
    Done,
}

enum Pull {
    Next(Value),
    Throw(RemoteError),
}

/// The caller's side of a remote generator.
pub struct RemoteStream {
    task: TaskRef,
    state: StreamState,
    output: Option<Value>,
    timeout: Option<Duration>,
}

impl RemoteStream {
    fn active(task: TaskRef, channel: Channel<IterResult, Error>) -> Self {
        Self { task, state: StreamState::Active(channel), output: None, timeout: None }
    }

    pub fn task_id(&self) -> TaskId {
        self.task.task_id
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, StreamState::Done)
    }

    /// The generator's return value, once it finished.
    pub fn output(&self) -> Option<&Value> {
        self.output.as_ref()
    }

    /// Pulls the next yielded value. `None` once the generator returned.
    pub async fn next(&mut self) -> Option<Result<Value>> {
        self.pull(Pull::Next(Value::Null)).await
    }

    /// Like `next`, handing `value` to the paused yield.
    ///
    /// The very first pull has no paused yield to receive it, so its value is dropped.
    pub async fn send(&mut self, value: Value) -> Option<Result<Value>> {
        self.pull(Pull::Next(value)).await
    }

    /// Raises `error` inside the generator at its paused yield.
    ///
    /// If the task already finished, the error comes straight back.
    pub async fn throw(&mut self, error: RemoteError) -> Option<Result<Value>> {
        self.pull(Pull::Throw(error)).await
    }

    /// Finishes the stream early with `value` as its output.
    ///
    /// Local state is torn down at once; the worker is asked to run the
    /// generator's cleanup but nobody waits for it.
    pub fn cancel(&mut self, value: Value) -> Value {
        if !self.is_done() {
            self.task.cancel(value.clone());
            self.state = StreamState::Done;
            self.output = Some(value.clone());
        }
        value
    }

    /// Pulls until the generator returns and gives back its return value.
    pub async fn drain(&mut self) -> Result<Value> {
        while let Some(item) = self.next().await {
            item?;
        }
        Ok(self.output.clone().unwrap_or(Value::Null))
    }

    pub fn into_values(self) -> impl Stream<Item = Result<Value>> + Send {
        futures::stream::unfold(self, |mut stream| async move {
            let item = stream.next().await?;
            Some((item, stream))
        })
    }

    /// Makes sure the first response arrived and returns the item channel.
    async fn activate(&mut self) -> Result<Option<Channel<IterResult, Error>>> {
        let pending = match &mut self.state {
            StreamState::Active(channel) => return Ok(Some(channel.clone())),
            StreamState::Done => return Ok(None),
            StreamState::Pending(first) => first.await,
        };

        match pending {
            Ok(Ok(First::Stream(channel))) => {
                self.state = StreamState::Active(channel.clone());
                Ok(Some(channel))
            }
            Ok(Ok(First::Return(value))) => {
                self.state = StreamState::Done;
                self.output = Some(value);
                Ok(None)
            }
            Ok(Err(e)) => {
                self.state = StreamState::Done;
                Err(e)
            }
            Err(_) => {
                self.state = StreamState::Done;
                Err(Error::Cancelled(self.task.task_id))
            }
        }
    }

    async fn pull(&mut self, pull: Pull) -> Option<Result<Value>> {
        let Some(limit) = self.timeout else {
            return self.advance(pull).await;
        };

        let outcome = tokio::time::timeout(limit, self.advance(pull)).await;
        match outcome {
            Ok(item) => item,
            Err(_) => {
                warn!(task = %self.task.task_id, timeout = ?limit, "stream pull timed out, cancelling");
                self.task.cancel(Value::Null);
                self.state = StreamState::Done;
                Some(Err(Error::Timeout(limit)))
            }
        }
    }

    async fn advance(&mut self, pull: Pull) -> Option<Result<Value>> {
        let channel = match self.activate().await {
            Ok(Some(channel)) => channel,
            Ok(None) => {
                return match pull {
                    Pull::Throw(error) => Some(Err(Error::Remote(error))),
                    Pull::Next(_) => None,
                };
            }
            Err(e) => return Some(Err(e)),
        };

        let started = self.task.inner.registry.begin_pull(self.task.task_id);
        match (started, pull) {
            (Some(true), Pull::Next(value)) => self.task.send(RequestKind::Next, value).await,
            (Some(false), Pull::Next(_)) => {}
            (Some(started), Pull::Throw(error)) => {
                if !started {
                    // Nobody saw the eager first yield; the throw lands where it paused.
                    let _ = channel.pop().await;
                }
                let payload = ErrorCodec::encode(&error).to_value();
                self.task.send(RequestKind::Throw, payload).await;
            }
            (None, Pull::Throw(error)) => return Some(Err(Error::Remote(error))),
            (None, Pull::Next(_)) => {}
        }

        self.receive(&channel).await
    }

    async fn receive(&mut self, channel: &Channel<IterResult, Error>) -> Option<Result<Value>> {
        match channel.pop().await {
            Ok(Some(IterResult { value, done: false })) => Some(Ok(value)),
            Ok(Some(IterResult { value, done: true })) => {
                self.state = StreamState::Done;
                self.output = Some(value);
                None
            }
            Ok(None) => {
                self.state = StreamState::Done;
                None
            }
            Err(e) => {
                self.state = StreamState::Done;
                Some(Err(e))
            }
        }
    }
}

impl Drop for RemoteStream {
    fn drop(&mut self) {
        if !self.is_done() {
            self.task.cancel(Value::Null);
        }
    }
}
