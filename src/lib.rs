//! Cross-thread completion bridge between a single-threaded host and a
//! multi-threaded transform engine.
//!
//! A host pins a byte buffer, hands it to a [`ComputeEngine`] as a [`Job`],
//! and gets exactly one completion back on its own execution context through
//! the [`Dispatcher`] of a started [`Service`]. Two hosts ship with the crate:
//! [`LocalHost`], a plain Rust event loop, and (with the `node` feature) the
//! Node.js addon surface.

#[macro_use]
pub mod log;

pub mod bridge;
pub mod config;
pub mod engine;
pub mod error;
pub mod host;

#[cfg(feature = "node")]
mod node;

pub use bridge::dispatch::{Bounded, Dispatch, Dispatcher, HostTask};
pub use bridge::host::{Host, HostContext, ReceiverResult};
pub use bridge::invocation::{CompletionSink, InvocationRecord, InvocationState};
pub use bridge::marshal::{CompletionEvent, Output, OutputBlock};
pub use bridge::pin::BufferRef;
pub use bridge::service::{Service, Submitter};
pub use config::BridgeOptions;
pub use engine::{ComputeEngine, Job, Transform, WhitespaceMinifier, WorkerPoolEngine};
pub use error::{BridgeError, BridgeResult, BufferRole, CompletionError, DispatchError, HostError};
pub use host::local::{LocalBuffer, LocalHost, LocalPromise, LocalReceiver, LocalResult, ReceiverCall};
