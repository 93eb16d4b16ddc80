use crate::bridge::host::Host;
use crate::bridge::pin::BufferRef;

/// Where an invocation's outcome goes.
pub enum CompletionSink<H: Host> {
    /// Resolved with the output buffer, rejected with an error.
    Promise(H::Deferred),
    /// Reported to the service's receiver as `(error, id, result)`.
    Callback { id: u64 },
}

impl<H: Host> CompletionSink<H> {
    pub fn id(&self) -> Option<u64> {
        match self {
            CompletionSink::Promise(_) => None,
            CompletionSink::Callback { id } => Some(*id),
        }
    }

    /// Gives up on delivery. A deferred is leaked rather than dropped unsettled.
    pub(crate) fn abandon(self) {
        std::mem::forget(self);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum InvocationState {
    Created,
    Submitted,
    Completed,
}

pub(crate) struct RecordParts<H: Host> {
    pub source: BufferRef<H>,
    pub result: Option<BufferRef<H>>,
    pub sink: CompletionSink<H>,
}

/// One in-flight request: its pinned buffers and its sink.
///
/// Consumed exactly once by the marshaller. A record dropped before that
/// (e.g. because its completion could not be enqueued) leaks what it holds.
pub struct InvocationRecord<H: Host> {
    state: InvocationState,
    parts: Option<RecordParts<H>>,
}

impl<H: Host> InvocationRecord<H> {
    pub fn new(
        source: BufferRef<H>,
        result: Option<BufferRef<H>>,
        sink: CompletionSink<H>,
    ) -> Self {
        Self {
            state: InvocationState::Created,
            parts: Some(RecordParts {
                source,
                result,
                sink,
            }),
        }
    }

    pub fn state(&self) -> InvocationState {
        self.state
    }

    pub fn id(&self) -> Option<u64> {
        self.parts.as_ref().and_then(|p| p.sink.id())
    }

    pub fn input_len(&self) -> usize {
        self.parts.as_ref().map(|p| p.source.len()).unwrap_or(0)
    }

    pub(crate) fn mark_submitted(&mut self) {
        debug_assert_eq!(self.state, InvocationState::Created);
        self.state = InvocationState::Submitted;
    }

    pub(crate) fn input(&self) -> &[u8] {
        match &self.parts {
            Some(p) => p.source.as_bytes(),
            None => &[],
        }
    }

    pub(crate) fn output_mut(&mut self) -> Option<&mut [u8]> {
        self.parts
            .as_mut()
            .and_then(|p| p.result.as_mut())
            .map(|r| r.as_bytes_mut())
    }

    pub(crate) fn buffers_mut(&mut self) -> (&[u8], Option<&mut [u8]>) {
        match self.parts.as_mut() {
            Some(p) => (
                p.source.as_bytes(),
                p.result.as_mut().map(|r| r.as_bytes_mut()),
            ),
            None => (&[], None),
        }
    }

    pub(crate) fn output_capacity(&self) -> Option<usize> {
        self.parts
            .as_ref()
            .and_then(|p| p.result.as_ref())
            .map(|r| r.len())
    }

    /// Moves the record to `Completed` and hands out what it owned.
    pub(crate) fn complete(mut self) -> Option<RecordParts<H>> {
        self.state = InvocationState::Completed;
        self.parts.take()
    }
}

impl<H: Host> Drop for InvocationRecord<H> {
    fn drop(&mut self) {
        if let Some(parts) = self.parts.take() {
            crate::tb_warn!(
                id = ?parts.sink.id(),
                state = ?self.state,
                "invocation record dropped before completion, leaking its references"
            );
            std::mem::forget(parts);
        }
    }
}
