//! The host object model, consumed as a capability set.
//!
//! A host supplies three handle types and a [`HostContext`] that is only
//! reachable on its own execution context. Everything in the bridge that must
//! run on that context (releasing references, settling sinks) takes
//! `&mut dyn HostContext<H>`, so it cannot be called from a worker thread.

use crate::bridge::marshal::OutputBlock;
use crate::error::{CompletionError, HostError};

pub trait Host: Sized + 'static {
    /// A retained (pinned) host buffer. Moving it between threads is fine;
    /// releasing it is not, hence release lives on [`HostContext`].
    type Buffer: Send + 'static;
    /// A settle-once promise handle.
    type Deferred: Send + 'static;
    /// The callback bound at service start for id-style submissions.
    type Receiver: Send + Sync + 'static;
}

/// A deferred that could not be resolved, handed back so it can be rejected.
pub type Unsettled<H> = (<H as Host>::Deferred, HostError);

/// Third argument of a receiver call.
#[derive(Debug)]
pub enum ReceiverResult {
    /// Bytes written into the pre-allocated result buffer.
    Written(usize),
    /// Engine-allocated output the host must adopt as a buffer.
    Owned(OutputBlock),
    /// Nothing to report (the call carries an error).
    Empty,
}

/// Capabilities available while running on the host's execution context.
pub trait HostContext<H: Host> {
    /// Drops the retention taken when the buffer was pinned.
    fn release(&mut self, buffer: H::Buffer) -> Result<(), HostError>;

    /// Resolves with the first `len` bytes of a retained buffer. The retention is
    /// consumed whether or not resolution succeeds.
    fn resolve_pinned(
        &mut self,
        deferred: H::Deferred,
        buffer: H::Buffer,
        len: usize,
    ) -> Result<(), Unsettled<H>>;

    /// Resolves with a new host buffer that takes ownership of `block`.
    fn resolve_owned(&mut self, deferred: H::Deferred, block: OutputBlock)
        -> Result<(), Unsettled<H>>;

    fn reject(&mut self, deferred: H::Deferred, error: &CompletionError);

    /// Invokes the receiver with `(error, id, result)`. Fails only if the result
    /// could not be turned into a host value; the receiver has not run then.
    fn call_receiver(
        &mut self,
        receiver: &H::Receiver,
        error: Option<&CompletionError>,
        id: u64,
        result: ReceiverResult,
    ) -> Result<(), HostError>;
}
