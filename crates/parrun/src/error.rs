//! Errors surfaced to callers of remote functions.

use std::fmt;
use std::time::Duration;

use parwire::RemoteError;
use parwire::TaskId;

use crate::link;
use crate::pool::WorkerId;

#[derive(Debug, Clone)]
pub enum Error {
    /// An argument, result or frame could not be encoded or decoded.
    Serialization(String),
    /// The remote function threw.
    Remote(RemoteError),
    /// The worker holding the task died before answering.
    WorkerCrashed { worker: WorkerId, reason: String },
    /// Every worker is busy and the wait queue is full.
    PoolExhausted { max_workers: usize, waiting: usize },
    /// The stream was already torn down.
    ChannelClosed,
    /// The spawner could not bring a worker online.
    Spawn(String),
    /// Sending to a worker failed.
    Link(link::Error),
    /// A worker sent a frame that breaks the protocol.
    Protocol(String),
    /// The call did not settle within its deadline and was aborted.
    Timeout(Duration),
    /// The task was aborted on the caller side.
    Cancelled(TaskId),
}

impl Error {
    /// The remote exception, if this error is one.
    pub fn as_remote(&self) -> Option<&RemoteError> {
        match self {
            Self::Remote(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            Self::Remote(e) => write!(f, "Remote error: {}", e),
            Self::WorkerCrashed { worker, reason } => write!(f, "Worker crashed: {} ({})", worker, reason),
            Self::PoolExhausted { max_workers, waiting } => {
                write!(f, "Pool exhausted: {} workers busy, {} callers waiting", max_workers, waiting)
            }
            Self::ChannelClosed => write!(f, "Channel closed"),
            Self::Spawn(msg) => write!(f, "Spawn error: {}", msg),
            Self::Link(e) => write!(f, "Link error: {}", e),
            Self::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            Self::Timeout(d) => write!(f, "Call timed out after {:?}", d),
            Self::Cancelled(task) => write!(f, "Cancelled: {}", task),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Remote(e) => Some(e),
            Self::Link(e) => Some(e),
            _ => None,
        }
    }
}

impl From<RemoteError> for Error {
    fn from(e: RemoteError) -> Self {
        Self::Remote(e)
    }
}

impl From<link::Error> for Error {
    fn from(e: link::Error) -> Self {
        Self::Link(e)
    }
}

impl From<parwire::Error> for Error {
    fn from(e: parwire::Error) -> Self {
        match e {
            parwire::Error::Serialization(msg) => Self::Serialization(msg),
            parwire::Error::ProtocolViolation(msg) => Self::Protocol(msg),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
