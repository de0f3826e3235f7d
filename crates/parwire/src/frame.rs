//! # Protocol Frames
//!
//! Defines the request sent to a worker and the messages a worker sends back.
//!
//! ## Invariants
//! - Every response carries the `taskId` of the request it answers.
//! - A `type: "error"` response always carries an `error` payload; `Reply`
//!   rejects frames that do not.
//! - Decoding never panics on unknown data; it returns `Error::Serialization`.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::codec::WireError;
use crate::error::Error;
use crate::error::Result;

/// Correlates a request with its responses across one worker link.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// What the worker should do with a request.
///
/// `Call` starts a function. The other kinds drive a generator that a
/// previous `Call` with the same task id left suspended.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    #[default]
    Call,
    Next,
    Return,
    Throw,
}

/// Caller to worker.
///
/// For `Next` and `Return`, `args[0]` is the value sent into the generator.
/// For `Throw`, `args[0]` is a `WireError`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRequest {
    pub task_id: TaskId,
    pub script: String,
    #[serde(rename = "fn")]
    pub function: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kind: RequestKind,
}

impl CallRequest {
    pub fn call(task_id: TaskId, script: impl Into<String>, function: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            task_id,
            script: script.into(),
            function: function.into(),
            args,
            kind: RequestKind::Call,
        }
    }

    /// Builds a `next`, `return` or `throw` request carrying a single value.
    pub fn resume(
        task_id: TaskId,
        script: impl Into<String>,
        function: impl Into<String>,
        kind: RequestKind,
        value: Value,
    ) -> Self {
        Self {
            task_id,
            script: script.into(),
            function: function.into(),
            args: vec![value],
            kind,
        }
    }

    /// The value sent along with a generator request, `null` if absent.
    pub fn resume_value(&self) -> Value {
        self.args.first().cloned().unwrap_or(Value::Null)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
    Return,
    Yield,
    Error,
}

/// Worker to caller, answering one request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallResponse {
    pub task_id: TaskId,
    #[serde(rename = "type")]
    pub kind: ResponseType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub done: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl CallResponse {
    pub fn returned(task_id: TaskId, value: Value) -> Self {
        Self { task_id, kind: ResponseType::Return, value: Some(value), done: None, error: None }
    }

    pub fn yielded(task_id: TaskId, value: Value, done: bool) -> Self {
        Self { task_id, kind: ResponseType::Yield, value: Some(value), done: Some(done), error: None }
    }

    pub fn failed(task_id: TaskId, error: WireError) -> Self {
        Self { task_id, kind: ResponseType::Error, value: None, done: None, error: Some(error) }
    }

    /// Whether this response ends the task on the caller side.
    ///
    /// A `yield` with `done` set is terminal: it carries the generator's return value.
    pub fn is_terminal(&self) -> bool {
        match self.kind {
            ResponseType::Return | ResponseType::Error => true,
            ResponseType::Yield => self.done.unwrap_or(false),
        }
    }

    /// Converts the flat wire shape into a checked `Reply`.
    pub fn into_reply(self) -> Result<Reply> {
        let value = self.value.unwrap_or(Value::Null);
        match self.kind {
            ResponseType::Return => Ok(Reply::Return(value)),
            ResponseType::Yield if self.done.unwrap_or(false) => Ok(Reply::Return(value)),
            ResponseType::Yield => Ok(Reply::Yield(value)),
            ResponseType::Error => {
                let error = self.error.ok_or_else(|| {
                    Error::ProtocolViolation(format!("{} error response without error payload", self.task_id))
                })?;
                Ok(Reply::Error(error))
            }
        }
    }
}

/// A validated response. A final `yield` is folded into `Return`.
#[derive(Clone, Debug, PartialEq)]
pub enum Reply {
    Return(Value),
    Yield(Value),
    Error(WireError),
}

/// Everything a worker may post to its caller.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "lowercase")]
pub enum WorkerMessage {
    /// The worker finished booting and accepts requests.
    Online,
    Response(CallResponse),
}

/// Encodes a frame as JSON bytes.
pub fn encode<T: Serialize>(frame: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(frame)?)
}

/// Decodes a frame from JSON bytes.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(bytes)?)
}
