//! # Parrun
//!
//! Call functions that live in worker threads as if they were local.
//!
//! An [`RpcClient`] owns a [`WorkerPool`] and a [`TaskRegistry`]. Each call
//! gets a task id, borrows a worker, and sends a `CallRequest`. The worker's
//! replies are routed back by task id: a single `return` settles the call,
//! a run of `yield`s turns it into a [`RemoteStream`].
//!
//! Workers come from a [`Spawner`]. [`ThreadSpawner`] runs a [`WorkerHost`]
//! on a dedicated OS thread; any other transport only has to move bytes.

pub mod client;
pub mod error;
pub mod handle;
pub mod link;
pub mod local;
pub mod module;
pub mod pool;
pub mod registry;
pub mod telemetry;
pub mod worker;

pub use client::ClientBuilder;
pub use client::ModuleProxy;
pub use client::RemoteFunction;
pub use client::RpcClient;
pub use client::RunOptions;
pub use error::Error;
pub use error::Result;
pub use handle::CallHandle;
pub use handle::Outcome;
pub use handle::RemoteStream;
pub use link::Spawner;
pub use link::WorkerLink;
pub use local::TaskSpawner;
pub use local::ThreadSpawner;
pub use module::Generator;
pub use module::Module;
pub use module::ModuleRegistry;
pub use module::Resume;
pub use module::Step;
pub use pool::Overflow;
pub use pool::PoolConfig;
pub use pool::PoolStats;
pub use pool::WorkerId;
pub use pool::WorkerPool;
pub use registry::TaskRegistry;
pub use registry::TaskState;
pub use worker::WorkerHost;

pub use parwire::ErrorKind;
pub use parwire::RemoteError;
pub use parwire::TaskId;
pub use parwire::Value;

#[cfg(test)]
mod tests;
