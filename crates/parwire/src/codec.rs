//! # Error Codec
//!
//! Carries errors across the worker boundary without losing their shape.
//!
//! ## Philosophy
//!
//! - **Name is the type**: an error travels as `{ name, message, stack, cause, ...extra }`.
//!   On arrival the name selects the matching `ErrorKind`; unknown names become
//!   `ErrorKind::Custom` and keep their original spelling.
//! - **Causes recurse**: each `source()` in a Rust error chain becomes a nested `cause`.
//! - **Extras stay out of the way**: extra fields round-trip, but only name and
//!   message take part in `Display`.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

/// Discriminator stored under `$type` so an encoded error can be told apart
/// from an ordinary object.
pub const ERROR_TAG: &str = "Error";

fn error_tag() -> String {
    ERROR_TAG.to_string()
}

/// An error flattened for transport.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    #[serde(rename = "$type", default = "error_tag")]
    pub tag: String,
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<WireError>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl WireError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            tag: error_tag(),
            name: name.into(),
            message: message.into(),
            stack: None,
            cause: None,
            extra: Map::new(),
        }
    }

    /// Reads a `WireError` back out of an arbitrary value, if it is one.
    pub fn from_value(value: &Value) -> Option<Self> {
        if !is_wire_error(value) {
            return None;
        }
        serde_json::from_value(value.clone()).ok()
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Whether `value` is an object produced by `ErrorCodec`.
pub fn is_wire_error(value: &Value) -> bool {
    let Some(obj) = value.as_object() else { return false };
    obj.get("$type").and_then(Value::as_str) == Some(ERROR_TAG)
        && obj.get("name").is_some_and(Value::is_string)
        && obj.get("message").is_some_and(Value::is_string)
}

/// The locally known error types an error name can map onto.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Error,
    RangeError,
    TypeError,
    SyntaxError,
    ReferenceError,
    EvalError,
    UriError,
    AggregateError,
    /// A name with no local counterpart.
    Custom,
}

impl ErrorKind {
    pub fn from_name(name: &str) -> Self {
        match name {
            "Error" => Self::Error,
            "RangeError" => Self::RangeError,
            "TypeError" => Self::TypeError,
            "SyntaxError" => Self::SyntaxError,
            "ReferenceError" => Self::ReferenceError,
            "EvalError" => Self::EvalError,
            "URIError" => Self::UriError,
            "AggregateError" => Self::AggregateError,
            _ => Self::Custom,
        }
    }

    /// The canonical name, `None` for `Custom`.
    pub fn name(&self) -> Option<&'static str> {
        match self {
            Self::Error => Some("Error"),
            Self::RangeError => Some("RangeError"),
            Self::TypeError => Some("TypeError"),
            Self::SyntaxError => Some("SyntaxError"),
            Self::ReferenceError => Some("ReferenceError"),
            Self::EvalError => Some("EvalError"),
            Self::UriError => Some("URIError"),
            Self::AggregateError => Some("AggregateError"),
            Self::Custom => None,
        }
    }
}

/// An error raised by remote code, either thrown by a worker function or
/// rebuilt on the caller from a `WireError`.
#[derive(Clone, Debug, PartialEq)]
pub struct RemoteError {
    kind: ErrorKind,
    name: String,
    message: String,
    stack: Option<String>,
    cause: Option<Box<RemoteError>>,
    extra: Map<String, Value>,
}

impl RemoteError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            kind: ErrorKind::from_name(&name),
            name,
            message: message.into(),
            stack: None,
            cause: None,
            extra: Map::new(),
        }
    }

    /// Builds an error of a known kind. `Custom` falls back to the name `"Error"`.
    pub fn of(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::new(kind.name().unwrap_or("Error"), message)
    }

    pub fn range(message: impl Into<String>) -> Self {
        Self::of(ErrorKind::RangeError, message)
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::of(ErrorKind::TypeError, message)
    }

    pub fn reference(message: impl Into<String>) -> Self {
        Self::of(ErrorKind::ReferenceError, message)
    }

    pub fn with_cause(mut self, cause: RemoteError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn stack(&self) -> Option<&str> {
        self.stack.as_deref()
    }

    pub fn cause(&self) -> Option<&RemoteError> {
        self.cause.as_deref()
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.extra.get(key)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.extra
    }

    /// Appends a caller-side frame to the stack so the call site shows up
    /// below the remote frames.
    pub fn push_local_frame(&mut self, frame: &str) {
        let line = format!("    at {} (local)", frame);
        self.stack = Some(match self.stack.take() {
            Some(stack) => format!("{}\n{}", stack, line),
            None => format!("{}: {}\n{}", self.name, self.message, line),
        });
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}: {}", self.name, self.message)
        }
    }
}

impl std::error::Error for RemoteError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause.as_deref().map(|c| c as &(dyn std::error::Error + 'static))
    }
}

/// Stateless conversions between local errors and `WireError`.
pub struct ErrorCodec;

impl ErrorCodec {
    /// Encodes an error returned by worker code.
    ///
    /// A `RemoteError` anywhere at the top of the chain is encoded verbatim.
    /// Any other error becomes a generic `Error` whose causes follow `source()`,
    /// with the captured backtrace as its stack.
    pub fn to_wire(err: &anyhow::Error) -> WireError {
        let root: &(dyn std::error::Error + 'static) = err.as_ref();
        let mut wire = Self::encode_dyn(root);

        if wire.stack.is_none() {
            let backtrace = err.backtrace();
            if backtrace.status() == std::backtrace::BacktraceStatus::Captured {
                wire.stack = Some(format!("{}: {}\n{}", wire.name, wire.message, backtrace));
            }
        }
        wire
    }

    /// Encodes a `RemoteError` and its causes.
    pub fn encode(err: &RemoteError) -> WireError {
        WireError {
            tag: error_tag(),
            name: err.name.clone(),
            message: err.message.clone(),
            stack: err.stack.clone(),
            cause: err.cause.as_deref().map(|c| Box::new(Self::encode(c))),
            extra: err.extra.clone(),
        }
    }

    /// Encodes any error, recognising `RemoteError`s along the chain.
    pub fn encode_dyn(err: &(dyn std::error::Error + 'static)) -> WireError {
        if let Some(remote) = err.downcast_ref::<RemoteError>() {
            return Self::encode(remote);
        }
        WireError {
            tag: error_tag(),
            name: "Error".to_string(),
            message: err.to_string(),
            stack: None,
            cause: err.source().map(|s| Box::new(Self::encode_dyn(s))),
            extra: Map::new(),
        }
    }

    /// Rebuilds the error on the receiving side.
    pub fn from_wire(wire: WireError) -> RemoteError {
        RemoteError {
            kind: ErrorKind::from_name(&wire.name),
            name: wire.name,
            message: wire.message,
            stack: wire.stack,
            cause: wire.cause.map(|c| Box::new(Self::from_wire(*c))),
            extra: wire.extra,
        }
    }

    /// Decodes an error that was embedded in an ordinary value.
    pub fn decode_value(value: &Value) -> Option<RemoteError> {
        WireError::from_value(value).map(Self::from_wire)
    }
}
