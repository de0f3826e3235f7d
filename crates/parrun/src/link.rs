//! # Worker Link
//!
//! A minimal, async interface for moving bytes between a caller and one worker.
//!
//! ## Philosophy
//!
//! - **Byte-Oriented**: A link knows nothing about frames or values. It moves opaque buffers.
//! - **Message-Passing**: `send` posts one message, `recv` yields the next one the worker
//!   posted. There is no request-response pairing at this layer; task ids do that above.
//! - **Exit is a message too**: `recv` returning `Ok(None)` means the worker is gone.

use std::fmt;

/// Errors that occur at the link layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The worker is gone or the link was terminated.
    Disconnected(String),
    /// The worker could not be started.
    Spawn(String),
    /// Generic I/O error or internal link failure.
    Io(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected(msg) => write!(f, "Disconnected: {}", msg),
            Self::Spawn(msg) => write!(f, "Spawn failed: {}", msg),
            Self::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// The caller's end of a connection to one worker.
///
/// This trait is designed to be object-safe (`Arc<dyn WorkerLink>`).
#[async_trait::async_trait]
pub trait WorkerLink: Send + Sync + 'static {
    /// Posts a message to the worker.
    async fn send(&self, payload: &[u8]) -> Result<()>;

    /// Waits for the next message from the worker.
    ///
    /// # invariants
    /// - Returns `Ok(None)` once the worker has exited; later calls keep returning `Ok(None)`.
    /// - Only one task calls `recv` at a time.
    async fn recv(&self) -> Result<Option<Vec<u8>>>;

    /// Stops the worker. Pending messages may be dropped.
    fn terminate(&self) -> Result<()>;
}

/// Starts workers.
///
/// `entry` names what the worker should boot into; how it is interpreted is
/// up to the spawner.
#[async_trait::async_trait]
pub trait Spawner: Send + Sync + 'static {
    async fn spawn(&self, entry: &str) -> Result<Box<dyn WorkerLink>>;
}
