//! Turns a finished computation into exactly one sink delivery.
//!
//! Runs only on the host context. Every pinned reference of the invocation is
//! released here, on success and failure alike; a failure to release or to
//! build the output is reported through the sink instead of the result.

use crate::bridge::host::{Host, HostContext, ReceiverResult};
use crate::bridge::invocation::{CompletionSink, InvocationRecord, RecordParts};
use crate::bridge::pin::BufferRef;
use crate::error::CompletionError;

/// Output allocated by the engine; the host adopts it without copying.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputBlock(Vec<u8>);

impl OutputBlock {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.0
    }
}

impl From<Vec<u8>> for OutputBlock {
    fn from(v: Vec<u8>) -> Self {
        Self(v)
    }
}

impl AsRef<[u8]> for OutputBlock {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl AsMut<[u8]> for OutputBlock {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

/// How the engine produced its result.
#[derive(Debug)]
pub enum Output {
    /// Written into the pre-allocated result buffer; the length used.
    InPlace(usize),
    /// A block the engine allocated.
    Owned(OutputBlock),
}

/// A finished computation travelling to the host context.
pub struct CompletionEvent<H: Host> {
    record: InvocationRecord<H>,
    outcome: Result<Output, CompletionError>,
}

impl<H: Host> CompletionEvent<H> {
    pub fn new(record: InvocationRecord<H>, outcome: Result<Output, CompletionError>) -> Self {
        Self { record, outcome }
    }
}

pub(crate) fn deliver<H: Host>(
    cx: &mut dyn HostContext<H>,
    receiver: Option<&H::Receiver>,
    event: CompletionEvent<H>,
) {
    let CompletionEvent { record, outcome } = event;
    let Some(RecordParts {
        source,
        result,
        sink,
    }) = record.complete()
    else {
        return;
    };

    let mut failure = None;
    if let Err(e) = source.release(cx) {
        crate::tb_warn!(error = %e, "failed to release source buffer reference");
        failure = Some(CompletionError::ReleaseSource);
    }

    match sink {
        CompletionSink::Promise(deferred) => {
            deliver_promise(cx, deferred, result, failure, outcome);
        }
        CompletionSink::Callback { id } => {
            if let Some(r) = result {
                if let Err(e) = r.release(cx) {
                    crate::tb_warn!(id, error = %e, "failed to release result buffer reference");
                    failure.get_or_insert(CompletionError::ReleaseResult);
                }
            }
            let Some(receiver) = receiver else {
                crate::tb_warn!(id, "no receiver bound for callback completion, dropping it");
                return;
            };
            deliver_callback(cx, receiver, id, failure, outcome);
        }
    }
}

fn deliver_promise<H: Host>(
    cx: &mut dyn HostContext<H>,
    deferred: H::Deferred,
    result: Option<BufferRef<H>>,
    failure: Option<CompletionError>,
    outcome: Result<Output, CompletionError>,
) {
    let outcome = match failure {
        Some(e) => Err(e),
        None => outcome,
    };

    let settled = match outcome {
        Ok(Output::InPlace(len)) => match result.and_then(BufferRef::into_handle) {
            Some(handle) => cx.resolve_pinned(deferred, handle, len),
            None => {
                cx.reject(deferred, &CompletionError::CreateResultBuffer);
                Ok(())
            }
        },
        Ok(Output::Owned(block)) => match release_result(cx, result) {
            Ok(()) => cx.resolve_owned(deferred, block),
            Err(e) => {
                cx.reject(deferred, &e);
                Ok(())
            }
        },
        Err(e) => {
            let _ = release_result(cx, result);
            cx.reject(deferred, &e);
            Ok(())
        }
    };

    if let Err((deferred, e)) = settled {
        crate::tb_warn!(error = %e, "failed to build result buffer");
        cx.reject(deferred, &CompletionError::CreateResultBuffer);
    }
}

fn deliver_callback<H: Host>(
    cx: &mut dyn HostContext<H>,
    receiver: &H::Receiver,
    id: u64,
    failure: Option<CompletionError>,
    outcome: Result<Output, CompletionError>,
) {
    let (error, result) = match (failure, outcome) {
        (Some(e), _) | (None, Err(e)) => (Some(e), ReceiverResult::Empty),
        (None, Ok(Output::InPlace(len))) => (None, ReceiverResult::Written(len)),
        (None, Ok(Output::Owned(block))) => (None, ReceiverResult::Owned(block)),
    };

    if let Err(e) = cx.call_receiver(receiver, error.as_ref(), id, result) {
        crate::tb_warn!(id, error = %e, "failed to build receiver arguments");
        let fallback = error.unwrap_or(CompletionError::CreateResultBuffer);
        if let Err(e) = cx.call_receiver(receiver, Some(&fallback), id, ReceiverResult::Empty) {
            crate::tb_warn!(id, error = %e, "dropping completion, error could not be delivered");
        }
    }
}

fn release_result<H: Host>(
    cx: &mut dyn HostContext<H>,
    result: Option<BufferRef<H>>,
) -> Result<(), CompletionError> {
    match result {
        Some(r) => r.release(cx).map_err(|e| {
            crate::tb_warn!(error = %e, "failed to release result buffer reference");
            CompletionError::ReleaseResult
        }),
        None => Ok(()),
    }
}

/// Drops an event that arrived after the service stopped. References are
/// released since we are on the host context; the sink never fires.
pub(crate) fn discard<H: Host>(cx: &mut dyn HostContext<H>, event: CompletionEvent<H>) {
    let Some(RecordParts {
        source,
        result,
        sink,
    }) = event.record.complete()
    else {
        return;
    };

    crate::tb_log!(id = ?sink.id(), "discarding completion after abort");
    if let Err(e) = source.release(cx) {
        crate::tb_warn!(error = %e, "failed to release source buffer reference");
    }
    let _ = release_result(cx, result);
    sink.abandon();
}
