//! # Parwire
//!
//! The message vocabulary spoken between a caller and its workers.
//!
//! ## Architecture
//!
//! - **Frames**: `CallRequest` flows to a worker, `WorkerMessage` flows back.
//!   Both are plain JSON, so any transport that moves bytes can carry them.
//! - **Errors**: `ErrorCodec` flattens an error into a `WireError` on the worker
//!   and rebuilds a `RemoteError` on the caller, keeping name, message, stack,
//!   cause chain and extra fields intact.

pub mod codec;
pub mod error;
pub mod frame;

pub use codec::ErrorCodec;
pub use codec::ErrorKind;
pub use codec::RemoteError;
pub use codec::WireError;
pub use codec::is_wire_error;
pub use error::Error;
pub use error::Result;
pub use frame::CallRequest;
pub use frame::CallResponse;
pub use frame::Reply;
pub use frame::RequestKind;
pub use frame::ResponseType;
pub use frame::TaskId;
pub use frame::WorkerMessage;
pub use frame::decode;
pub use frame::encode;

/// The dynamic value type carried in arguments, yields and results.
pub use serde_json::Value;
