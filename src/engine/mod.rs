//! The compute engine seam.
//!
//! An engine receives a [`Job`], reads its input (and optionally writes its
//! pre-allocated output) on whatever thread it likes, and finishes it with
//! exactly one of [`Job::complete_in_place`], [`Job::complete_with`] or
//! [`Job::fail`]. Finishing consumes the job, so the buffer spans cannot be
//! touched afterwards. A job dropped unfinished reports
//! [`CompletionError::Abandoned`].

use std::sync::Arc;

use crate::bridge::dispatch::Dispatcher;
use crate::bridge::host::Host;
use crate::bridge::invocation::InvocationRecord;
use crate::bridge::marshal::{CompletionEvent, Output, OutputBlock};
use crate::error::CompletionError;

mod minify;
mod pool;

pub use minify::WhitespaceMinifier;
pub use pool::WorkerPoolEngine;

pub trait ComputeEngine<H: Host>: Send + Sync {
    /// Must return without waiting for the job to finish.
    fn transform(&self, job: Job<H>);
}

/// A pure byte transformation, run by [`WorkerPoolEngine`].
pub trait Transform: Send + Sync + 'static {
    fn transform(&self, input: &[u8]) -> Result<Vec<u8>, String>;

    /// Writes the result into `out` and returns its length.
    fn transform_into(&self, input: &[u8], out: &mut [u8]) -> Result<usize, String> {
        let produced = self.transform(input)?;
        let cap = out.len();
        let dst = out.get_mut(..produced.len()).ok_or_else(|| {
            format!("output of {} bytes does not fit in {} bytes", produced.len(), cap)
        })?;
        dst.copy_from_slice(&produced);
        Ok(produced.len())
    }
}

impl<F> Transform for F
where
    F: Fn(&[u8]) -> Result<Vec<u8>, String> + Send + Sync + 'static,
{
    fn transform(&self, input: &[u8]) -> Result<Vec<u8>, String> {
        self(input)
    }
}

/// One submitted invocation, as seen by the engine.
pub struct Job<H: Host> {
    record: Option<InvocationRecord<H>>,
    dispatcher: Arc<Dispatcher<H>>,
}

impl<H: Host> Job<H> {
    pub(crate) fn new(record: InvocationRecord<H>, dispatcher: Arc<Dispatcher<H>>) -> Self {
        Self {
            record: Some(record),
            dispatcher,
        }
    }

    pub fn id(&self) -> Option<u64> {
        self.record.as_ref().and_then(|r| r.id())
    }

    pub fn input(&self) -> &[u8] {
        match &self.record {
            Some(r) => r.input(),
            None => &[],
        }
    }

    /// The pre-allocated result buffer, if the submission supplied one.
    pub fn output_mut(&mut self) -> Option<&mut [u8]> {
        self.record.as_mut().and_then(|r| r.output_mut())
    }

    /// Input and output at once, for engines that stream from one to the other.
    pub fn buffers_mut(&mut self) -> (&[u8], Option<&mut [u8]>) {
        match self.record.as_mut() {
            Some(r) => r.buffers_mut(),
            None => (&[], None),
        }
    }

    /// Reports `written` bytes produced into the pre-allocated output.
    pub fn complete_in_place(mut self, written: usize) {
        let capacity = self.record.as_ref().and_then(|r| r.output_capacity());
        let outcome = match capacity {
            Some(capacity) if written <= capacity => Ok(Output::InPlace(written)),
            Some(capacity) => Err(CompletionError::OutputOverflow { written, capacity }),
            None => Err(CompletionError::Engine(
                "no pre-allocated output buffer to complete in place".into(),
            )),
        };
        self.finish(outcome);
    }

    /// Hands over an engine-allocated result.
    pub fn complete_with(mut self, block: impl Into<OutputBlock>) {
        self.finish(Ok(Output::Owned(block.into())));
    }

    pub fn fail(mut self, message: impl Into<String>) {
        self.finish(Err(CompletionError::Engine(message.into())));
    }

    fn finish(&mut self, outcome: Result<Output, CompletionError>) {
        let Some(record) = self.record.take() else {
            return;
        };
        let id = record.id();
        if let Err(e) = self.dispatcher.enqueue(CompletionEvent::new(record, outcome)) {
            crate::tb_warn!(?id, error = %e, "completion could not be enqueued, invocation leaked");
        }
    }
}

impl<H: Host> Drop for Job<H> {
    fn drop(&mut self) {
        self.finish(Err(CompletionError::Abandoned));
    }
}
