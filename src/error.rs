//! Error taxonomy of the bridge.
//!
//! [`BridgeError`] is reported synchronously to the caller of `start`, `stop` or
//! a submission. [`CompletionError`] only ever travels through a completion sink.
//! The two never cross.

use std::fmt;

/// Which of an invocation's buffers an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferRole {
    Source,
    Result,
}

impl fmt::Display for BufferRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferRole::Source => f.write_str("source"),
            BufferRole::Result => f.write_str("result"),
        }
    }
}

/// Synchronous failures: setup and submission.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    #[error("Service is already started")]
    AlreadyStarted,

    #[error("Service is not started")]
    NotStarted,

    #[error("Failed to create completion dispatcher: {0}")]
    DispatchCreateFailed(String),

    #[error("Failed to abort completion dispatcher: {0}")]
    DispatchAbortFailed(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Failed to create reference for {0} buffer")]
    BufferPinFailed(BufferRole),

    #[error("Failed to read source buffer")]
    BufferReadFailed,

    #[error("Failed to allocate {0}")]
    AllocationFailed(&'static str),
}

impl BridgeError {
    /// Stable code thrown alongside the message by host bindings.
    pub fn code(&self) -> &'static str {
        match self {
            BridgeError::AlreadyStarted => "ALREADY_STARTED",
            BridgeError::NotStarted => "NOT_STARTED",
            BridgeError::DispatchCreateFailed(_) => "INTERR_CREATE_JS_RECEIVER_FAILED",
            BridgeError::DispatchAbortFailed(_) => "INTERR_ABORT_JS_RECEIVER_FAILED",
            BridgeError::InvalidArgument(_) => "INVALID_ARGUMENT",
            BridgeError::BufferPinFailed(BufferRole::Source) => "INTERR_CREATE_SRC_BUFFER_REF",
            BridgeError::BufferPinFailed(BufferRole::Result) => "INTERR_CREATE_RES_BUFFER_REF",
            BridgeError::BufferReadFailed => "INTERR_GET_SRC_BUFFER_INFO",
            BridgeError::AllocationFailed(_) => "INTERR_ALLOCATION_FAILED",
        }
    }
}

/// Asynchronous failures, delivered through a completion sink.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompletionError {
    #[error("Failed to release source buffer reference")]
    ReleaseSource,

    #[error("Failed to release result buffer reference")]
    ReleaseResult,

    #[error("Failed to create result buffer")]
    CreateResultBuffer,

    #[error("Output length {written} exceeds result buffer of {capacity} bytes")]
    OutputOverflow { written: usize, capacity: usize },

    #[error("Compute engine failed: {0}")]
    Engine(String),

    #[error("Compute engine dropped the job without completing it")]
    Abandoned,
}

impl CompletionError {
    pub fn code(&self) -> &'static str {
        match self {
            CompletionError::ReleaseSource => "INTERR_RELEASE_SRC_BUFFER_FAILED",
            CompletionError::ReleaseResult => "INTERR_RELEASE_RES_BUFFER_FAILED",
            CompletionError::CreateResultBuffer => "INTERR_CREATE_RES_BUFFER_FAILED",
            CompletionError::OutputOverflow { .. } => "OUTPUT_OVERFLOW",
            CompletionError::Engine(_) => "TRANSFORM_FAILED",
            CompletionError::Abandoned => "TRANSFORM_ABANDONED",
        }
    }
}

/// Failure to hand an event to the host context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("Completion dispatcher is closed")]
    Closed,

    #[error("Completion queue is full")]
    Full,

    #[error("Completion dispatcher was aborted")]
    Aborted,
}

/// A host capability (reference deletion, buffer creation, ...) reported failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct HostError(pub String);

impl HostError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;
