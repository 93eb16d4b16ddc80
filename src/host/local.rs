//! A single-threaded host with its own event loop.
//!
//! `LocalHost` plays the role a JavaScript runtime plays for the Node binding:
//! it owns buffers, pins them, runs completion tasks on the thread that owns
//! it and settles promises. It is `!Send`; everything that must happen on the
//! host context needs `&mut LocalHost`.

use std::cell::UnsafeCell;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};

use crate::bridge::dispatch::{Dispatch, HostTask};
use crate::bridge::host::{Host, HostContext, ReceiverResult, Unsettled};
use crate::bridge::invocation::{CompletionSink, InvocationRecord};
use crate::bridge::marshal::OutputBlock;
use crate::bridge::pin::BufferRef;
use crate::bridge::service::Service;
use crate::config::BridgeOptions;
use crate::engine::ComputeEngine;
use crate::error::{BridgeError, BridgeResult, BufferRole, CompletionError, DispatchError, HostError};

static NEXT_HOST_ID: AtomicU64 = AtomicU64::new(1);

struct LocalBytes {
    owner: u64,
    data: UnsafeCell<Box<[u8]>>,
    pins: AtomicUsize,
    // Set while an invocation holds the buffer as its output.
    writer: AtomicBool,
}

// Bytes are touched by the owning host while `pins == 0`, and through a
// `BufferRef` span while pinned. Pinning and reading both need the owner.
// A writer pin excludes every other pin.
unsafe impl Sync for LocalBytes {}

/// A host-owned byte buffer.
#[derive(Clone)]
pub struct LocalBuffer {
    bytes: Arc<LocalBytes>,
    len: usize,
}

impl LocalBuffer {
    fn new(owner: u64, data: Box<[u8]>) -> Self {
        let len = data.len();
        Self {
            bytes: Arc::new(LocalBytes {
                owner,
                data: UnsafeCell::new(data),
                pins: AtomicUsize::new(0),
                writer: AtomicBool::new(false),
            }),
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_pinned(&self) -> bool {
        self.bytes.pins.load(Ordering::Acquire) > 0
    }
}

impl std::fmt::Debug for LocalBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalBuffer")
            .field("len", &self.len)
            .field("pinned", &self.is_pinned())
            .finish()
    }
}

/// Retention on a [`LocalBuffer`].
pub struct LocalPin {
    bytes: Arc<LocalBytes>,
    writer: bool,
}

pub type LocalOutcome = Result<LocalBuffer, CompletionError>;

type Settle = Box<dyn FnOnce(LocalOutcome) + Send>;

/// The settle-once side of a submission, fired on the host thread.
pub enum LocalDeferred {
    Promise(oneshot::Sender<LocalOutcome>),
    Closure(Settle),
}

impl LocalDeferred {
    fn settle(self, outcome: LocalOutcome) {
        match self {
            LocalDeferred::Promise(tx) => {
                let _ = tx.send(outcome);
            }
            LocalDeferred::Closure(f) => f(outcome),
        }
    }
}

impl std::fmt::Debug for LocalDeferred {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LocalDeferred::Promise(_) => f.write_str("LocalDeferred::Promise"),
            LocalDeferred::Closure(_) => f.write_str("LocalDeferred::Closure"),
        }
    }
}

/// The pending side of a promise-style submission.
///
/// Settles on the host thread but can be awaited from anywhere; polling
/// does not drive the host loop.
#[derive(Debug)]
pub struct LocalPromise(oneshot::Receiver<LocalOutcome>);

/// Third argument a [`LocalReceiver`] is called with.
#[derive(Debug)]
pub enum LocalResult {
    Written(usize),
    Buffer(LocalBuffer),
    Empty,
}

#[derive(Debug)]
pub struct ReceiverCall {
    pub error: Option<CompletionError>,
    pub id: u64,
    pub result: LocalResult,
}

pub struct LocalReceiver(Box<dyn Fn(ReceiverCall) + Send + Sync>);

impl LocalReceiver {
    pub fn new(f: impl Fn(ReceiverCall) + Send + Sync + 'static) -> Self {
        Self(Box::new(f))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WaitError {
    #[error("timed out waiting for the promise to settle")]
    Timeout,
    #[error("promise was dropped without being settled")]
    Dropped,
}

/// Countdown switches that make the next N calls of a capability fail.
#[derive(Debug, Default, Clone)]
pub struct Faults {
    pub pin: usize,
    pub release: usize,
    pub buffer: usize,
    pub alloc: usize,
}

fn trip(counter: &mut usize) -> bool {
    if *counter > 0 {
        *counter -= 1;
        true
    } else {
        false
    }
}

enum QueueTx {
    Bounded(mpsc::Sender<HostTask<LocalHost>>),
    Unbounded(mpsc::UnboundedSender<HostTask<LocalHost>>),
}

enum QueueRx {
    Bounded(mpsc::Receiver<HostTask<LocalHost>>),
    Unbounded(mpsc::UnboundedReceiver<HostTask<LocalHost>>),
}

impl QueueRx {
    fn try_recv(&mut self) -> Option<HostTask<LocalHost>> {
        match self {
            QueueRx::Bounded(rx) => rx.try_recv().ok(),
            QueueRx::Unbounded(rx) => rx.try_recv().ok(),
        }
    }

    async fn recv(&mut self) -> Option<HostTask<LocalHost>> {
        match self {
            QueueRx::Bounded(rx) => rx.recv().await,
            QueueRx::Unbounded(rx) => rx.recv().await,
        }
    }
}

/// Enqueues completion tasks onto a [`LocalHost`] from any thread.
#[derive(Clone)]
pub struct LocalDispatch {
    tx: Arc<QueueTx>,
}

impl Dispatch<LocalHost> for LocalDispatch {
    fn try_dispatch(&self, task: HostTask<LocalHost>) -> Result<(), DispatchError> {
        match &*self.tx {
            QueueTx::Bounded(tx) => tx.try_send(task).map_err(|e| match e {
                TrySendError::Full(_) => DispatchError::Full,
                TrySendError::Closed(_) => DispatchError::Closed,
            }),
            QueueTx::Unbounded(tx) => tx.send(task).map_err(|_| DispatchError::Closed),
        }
    }
}

pub struct LocalHost {
    id: u64,
    runtime: tokio::runtime::Runtime,
    tx: Arc<QueueTx>,
    rx: QueueRx,
    outstanding: usize,
    faults: Faults,
    _not_send: PhantomData<*const ()>,
}

impl Host for LocalHost {
    type Buffer = LocalPin;
    type Deferred = LocalDeferred;
    type Receiver = LocalReceiver;
}

impl LocalHost {
    pub fn new(options: &BridgeOptions) -> std::io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()?;

        let (tx, rx) = if options.queue_capacity > 0 {
            let (tx, rx) = mpsc::channel(options.queue_capacity);
            (QueueTx::Bounded(tx), QueueRx::Bounded(rx))
        } else {
            let (tx, rx) = mpsc::unbounded_channel();
            (QueueTx::Unbounded(tx), QueueRx::Unbounded(rx))
        };

        Ok(Self {
            id: NEXT_HOST_ID.fetch_add(1, Ordering::Relaxed),
            runtime,
            tx: Arc::new(tx),
            rx,
            outstanding: 0,
            faults: Faults::default(),
            _not_send: PhantomData,
        })
    }

    /// A dispatch target feeding this host's event loop.
    pub fn dispatcher(&self) -> LocalDispatch {
        LocalDispatch {
            tx: self.tx.clone(),
        }
    }

    pub fn faults(&mut self) -> &mut Faults {
        &mut self.faults
    }

    /// Pins taken and not yet released.
    pub fn outstanding_refs(&self) -> usize {
        self.outstanding
    }

    pub fn alloc(&mut self, len: usize) -> BridgeResult<LocalBuffer> {
        if trip(&mut self.faults.alloc) {
            return Err(BridgeError::AllocationFailed("result buffer"));
        }
        Ok(LocalBuffer::new(self.id, vec![0u8; len].into_boxed_slice()))
    }

    pub fn alloc_from(&mut self, data: &[u8]) -> LocalBuffer {
        LocalBuffer::new(self.id, data.to_vec().into_boxed_slice())
    }

    /// Copies a buffer's bytes out. Refused while an engine may still use it.
    pub fn read(&self, buffer: &LocalBuffer) -> Result<Vec<u8>, HostError> {
        self.check_owner(buffer)?;
        if buffer.is_pinned() {
            return Err(HostError::new("buffer is pinned by an in-flight invocation"));
        }
        // Owner thread and no pins: nothing else can be writing.
        let data = unsafe { &*buffer.bytes.data.get() };
        Ok(data[..buffer.len].to_vec())
    }

    fn check_owner(&self, buffer: &LocalBuffer) -> Result<(), HostError> {
        if buffer.bytes.owner != self.id {
            return Err(HostError::new("buffer belongs to another host"));
        }
        Ok(())
    }

    pub fn pin(&mut self, buffer: &LocalBuffer) -> BridgeResult<BufferRef<LocalHost>> {
        self.pin_as(buffer, BufferRole::Source)
    }

    fn pin_as(&mut self, buffer: &LocalBuffer, role: BufferRole) -> BridgeResult<BufferRef<LocalHost>> {
        self.check_owner(buffer)
            .map_err(|e| BridgeError::InvalidArgument(e.to_string()))?;
        if role == BufferRole::Result && buffer.is_pinned() {
            return Err(BridgeError::InvalidArgument(
                "result buffer is already in use".into(),
            ));
        }
        if buffer.bytes.writer.load(Ordering::Acquire) {
            return Err(BridgeError::InvalidArgument(
                "buffer is the output of an invocation still in flight".into(),
            ));
        }
        if trip(&mut self.faults.pin) {
            return Err(BridgeError::BufferPinFailed(role));
        }

        let bytes = buffer.bytes.clone();
        let writer = role == BufferRole::Result;
        bytes.pins.fetch_add(1, Ordering::AcqRel);
        if writer {
            bytes.writer.store(true, Ordering::Release);
        }
        self.outstanding += 1;

        let ptr = unsafe { (*bytes.data.get()).as_mut_ptr() };
        let len = buffer.len;
        // The boxed slice never moves or shrinks while `bytes` is alive, and
        // `read` refuses while the pin count is non-zero.
        Ok(unsafe { BufferRef::from_raw_parts(LocalPin { bytes, writer }, ptr, len) })
    }

    fn unpin(&mut self, pin: LocalPin) {
        if pin.writer {
            pin.bytes.writer.store(false, Ordering::Release);
        }
        pin.bytes.pins.fetch_sub(1, Ordering::AcqRel);
        self.outstanding -= 1;
    }

    /// A settle-once pair; the deferred side goes into a [`CompletionSink`].
    pub fn promise(&self) -> (LocalDeferred, LocalPromise) {
        let (tx, rx) = oneshot::channel();
        (LocalDeferred::Promise(tx), LocalPromise(rx))
    }

    /// Promise-style submission: the engine allocates the output.
    pub fn submit_promise<E>(
        &mut self,
        service: &Service<LocalHost>,
        engine: &E,
        buffer: &LocalBuffer,
    ) -> BridgeResult<LocalPromise>
    where
        E: ComputeEngine<LocalHost> + ?Sized,
    {
        let submitter = service.submitter()?;
        if buffer.is_empty() {
            return Err(BridgeError::BufferReadFailed);
        }
        let source = self.pin_as(buffer, BufferRole::Source)?;

        let (deferred, promise) = self.promise();
        let record = InvocationRecord::new(source, None, CompletionSink::Promise(deferred));
        submitter.submit(engine, record);
        Ok(promise)
    }

    /// Like [`submit_promise`](Self::submit_promise), but `on_done` is called
    /// with the outcome on the host thread instead of settling a promise.
    /// It runs at most once, after the source has been released, and never
    /// after `stop`.
    pub fn submit_with<E, F>(
        &mut self,
        service: &Service<LocalHost>,
        engine: &E,
        buffer: &LocalBuffer,
        on_done: F,
    ) -> BridgeResult<()>
    where
        E: ComputeEngine<LocalHost> + ?Sized,
        F: FnOnce(LocalOutcome) + Send + 'static,
    {
        let submitter = service.submitter()?;
        if buffer.is_empty() {
            return Err(BridgeError::BufferReadFailed);
        }
        let source = self.pin_as(buffer, BufferRole::Source)?;

        let sink = CompletionSink::Promise(LocalDeferred::Closure(Box::new(on_done)));
        submitter.submit(engine, InvocationRecord::new(source, None, sink));
        Ok(())
    }

    /// Callback-style submission. The returned buffer is the pre-allocated
    /// output; it is readable, and its first `len` bytes valid, once the
    /// receiver has been called with `id`.
    pub fn submit_with_id<E>(
        &mut self,
        service: &Service<LocalHost>,
        engine: &E,
        buffer: &LocalBuffer,
        id: u64,
    ) -> BridgeResult<LocalBuffer>
    where
        E: ComputeEngine<LocalHost> + ?Sized,
    {
        let submitter = service.submitter()?;
        if !submitter.accepts_callbacks() {
            return Err(BridgeError::InvalidArgument(
                "service was started without a receiver".into(),
            ));
        }
        if buffer.is_empty() {
            return Err(BridgeError::BufferReadFailed);
        }

        let source = self.pin_as(buffer, BufferRole::Source)?;
        let pinned_result = self
            .alloc(buffer.len())
            .and_then(|output| Ok((self.pin_as(&output, BufferRole::Result)?, output)));
        let (result, output) = match pinned_result {
            Ok(v) => v,
            Err(e) => {
                let _ = source.release(self);
                return Err(e);
            }
        };

        let record = InvocationRecord::new(source, Some(result), CompletionSink::Callback { id });
        submitter.submit(engine, record);
        Ok(output)
    }

    fn run_task(&mut self, task: HostTask<LocalHost>) {
        let cx: &mut dyn HostContext<LocalHost> = self;
        task(cx);
    }

    /// Runs every task already queued. Returns how many ran.
    pub fn run_pending(&mut self) -> usize {
        let mut ran = 0;
        while let Some(task) = self.rx.try_recv() {
            self.run_task(task);
            ran += 1;
        }
        ran
    }

    /// Waits up to `timeout` for one task and runs it.
    pub fn turn(&mut self, timeout: Duration) -> bool {
        let task = match self.rx.try_recv() {
            Some(task) => Some(task),
            None => {
                let Self { runtime, rx, .. } = self;
                runtime
                    .block_on(async { tokio::time::timeout(timeout, rx.recv()).await })
                    .ok()
                    .flatten()
            }
        };

        match task {
            Some(task) => {
                self.run_task(task);
                true
            }
            None => false,
        }
    }

    /// Turns the loop until `done` holds or `timeout` elapses.
    pub fn run_until(&mut self, timeout: Duration, mut done: impl FnMut(&Self) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while !done(self) {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return false;
            }
            self.turn(left);
        }
        true
    }

    /// Drives the event loop until `promise` settles.
    pub fn block_on_promise(
        &mut self,
        mut promise: LocalPromise,
        timeout: Duration,
    ) -> Result<LocalOutcome, WaitError> {
        let deadline = Instant::now() + timeout;
        loop {
            match promise.0.try_recv() {
                Ok(outcome) => return Ok(outcome),
                Err(oneshot::error::TryRecvError::Closed) => return Err(WaitError::Dropped),
                Err(oneshot::error::TryRecvError::Empty) => {}
            }
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Err(WaitError::Timeout);
            }
            self.turn(left);
        }
    }
}

impl LocalPromise {
    /// The outcome, if the promise has settled already.
    pub fn try_take(&mut self) -> Option<LocalOutcome> {
        self.0.try_recv().ok()
    }
}

impl Future for LocalPromise {
    type Output = Result<LocalOutcome, WaitError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0)
            .poll(cx)
            .map(|r| r.map_err(|_| WaitError::Dropped))
    }
}

impl HostContext<LocalHost> for LocalHost {
    fn release(&mut self, buffer: LocalPin) -> Result<(), HostError> {
        if trip(&mut self.faults.release) {
            std::mem::forget(buffer);
            return Err(HostError::new("reference deletion failed"));
        }
        self.unpin(buffer);
        Ok(())
    }

    fn resolve_pinned(
        &mut self,
        deferred: LocalDeferred,
        buffer: LocalPin,
        len: usize,
    ) -> Result<(), Unsettled<LocalHost>> {
        let bytes = buffer.bytes.clone();
        self.unpin(buffer);
        let view = LocalBuffer { bytes, len };
        deferred.settle(Ok(view));
        Ok(())
    }

    fn resolve_owned(
        &mut self,
        deferred: LocalDeferred,
        block: OutputBlock,
    ) -> Result<(), Unsettled<LocalHost>> {
        if trip(&mut self.faults.buffer) {
            return Err((deferred, HostError::new("buffer creation failed")));
        }
        let buffer = LocalBuffer::new(self.id, block.into_vec().into_boxed_slice());
        deferred.settle(Ok(buffer));
        Ok(())
    }

    fn reject(&mut self, deferred: LocalDeferred, error: &CompletionError) {
        deferred.settle(Err(error.clone()));
    }

    fn call_receiver(
        &mut self,
        receiver: &LocalReceiver,
        error: Option<&CompletionError>,
        id: u64,
        result: ReceiverResult,
    ) -> Result<(), HostError> {
        let result = match result {
            ReceiverResult::Written(n) => LocalResult::Written(n),
            ReceiverResult::Empty => LocalResult::Empty,
            ReceiverResult::Owned(block) => {
                if trip(&mut self.faults.buffer) {
                    return Err(HostError::new("buffer creation failed"));
                }
                LocalResult::Buffer(LocalBuffer::new(self.id, block.into_vec().into_boxed_slice()))
            }
        };

        (receiver.0)(ReceiverCall {
            error: error.cloned(),
            id,
            result,
        });
        Ok(())
    }
}
