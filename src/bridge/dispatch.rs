use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::bridge::host::{Host, HostContext};
use crate::bridge::marshal::{self, CompletionEvent};
use crate::error::DispatchError;

/// Work scheduled onto the host's execution context.
pub type HostTask<H> = Box<dyn FnOnce(&mut dyn HostContext<H>) + Send + 'static>;

/// A non-blocking, thread-safe way to run a task on the host context.
pub trait Dispatch<H: Host>: Send + Sync + 'static {
    /// Must not block and must not panic; callable from any thread.
    fn try_dispatch(&self, task: HostTask<H>) -> Result<(), DispatchError>;

    /// Called once when the owning service stops.
    fn abort(&self) -> Result<(), DispatchError> {
        Ok(())
    }
}

/// Caps the number of tasks handed to `inner` that have not started running.
///
/// For dispatch targets with no queue limit of their own. A capacity of zero
/// means unbounded.
pub struct Bounded<D> {
    inner: D,
    capacity: usize,
    in_flight: Arc<AtomicUsize>,
}

impl<D> Bounded<D> {
    pub fn new(inner: D, capacity: usize) -> Self {
        Self {
            inner,
            capacity,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }
}

/// One unit of a [`Bounded`] budget, returned when dropped.
struct Slot(Arc<AtomicUsize>);

impl Drop for Slot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl<H: Host, D: Dispatch<H>> Dispatch<H> for Bounded<D> {
    fn try_dispatch(&self, task: HostTask<H>) -> Result<(), DispatchError> {
        let cap = self.capacity;
        self.in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (cap == 0 || n < cap).then_some(n + 1)
            })
            .map_err(|_| DispatchError::Full)?;
        let slot = Slot(self.in_flight.clone());

        // A refused task is dropped by `inner`, and the slot with it.
        self.inner.try_dispatch(Box::new(move |cx| {
            drop(slot);
            task(cx)
        }))
    }

    fn abort(&self) -> Result<(), DispatchError> {
        self.inner.abort()
    }
}

/// Completion path from engine threads to the host, with an abort switch.
///
/// Once aborted, `enqueue` fails fast and tasks already queued discard their
/// event instead of delivering it.
pub struct Dispatcher<H: Host> {
    inner: Box<dyn Dispatch<H>>,
    receiver: Option<Arc<H::Receiver>>,
    aborted: Arc<AtomicBool>,
    enqueued: AtomicU64,
}

impl<H: Host> Dispatcher<H> {
    pub fn new(inner: impl Dispatch<H>, receiver: Option<H::Receiver>) -> Self {
        Self {
            inner: Box::new(inner),
            receiver: receiver.map(Arc::new),
            aborted: Arc::new(AtomicBool::new(false)),
            enqueued: AtomicU64::new(0),
        }
    }

    pub fn has_receiver(&self) -> bool {
        self.receiver.is_some()
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// Number of events accepted so far.
    pub fn enqueued(&self) -> u64 {
        self.enqueued.load(Ordering::Relaxed)
    }

    /// Hands a completion to the host. On failure the event is dropped here,
    /// on the calling thread, which leaks its invocation record.
    pub fn enqueue(&self, event: CompletionEvent<H>) -> Result<(), DispatchError> {
        if self.is_aborted() {
            return Err(DispatchError::Aborted);
        }

        let aborted = self.aborted.clone();
        let receiver = self.receiver.clone();

        self.inner.try_dispatch(Box::new(move |cx| {
            if aborted.load(Ordering::Acquire) {
                marshal::discard(cx, event);
            } else {
                marshal::deliver(cx, receiver.as_deref(), event);
            }
        }))?;

        self.enqueued.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Safe to race with `enqueue` from worker threads.
    pub fn abort(&self) -> Result<(), DispatchError> {
        self.aborted.store(true, Ordering::Release);
        self.inner.abort()
    }
}
