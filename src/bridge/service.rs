use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::bridge::dispatch::{Dispatch, Dispatcher};
use crate::bridge::host::Host;
use crate::bridge::invocation::InvocationRecord;
use crate::engine::{ComputeEngine, Job};
use crate::error::{BridgeError, BridgeResult, HostError};

/// The registration of a completion dispatcher: `Stopped -> Started -> Stopped`.
///
/// Hosts that need a process-wide instance keep one in a static; tests build
/// as many independent ones as they like.
pub struct Service<H: Host> {
    slot: Mutex<Option<Arc<Dispatcher<H>>>>,
    active: AtomicBool,
}

impl<H: Host> Default for Service<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: Host> Service<H> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            active: AtomicBool::new(false),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn lock(&self) -> MutexGuard<'_, Option<Arc<Dispatcher<H>>>> {
        // The slot only ever holds a fully built dispatcher, so a poisoned lock
        // still guards consistent state.
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn start<D: Dispatch<H>>(&self, dispatch: D, receiver: Option<H::Receiver>) -> BridgeResult<()> {
        self.try_start(|| Ok(dispatch), receiver)
    }

    /// Builds the dispatch target with `create` and activates it. On failure
    /// the service stays stopped.
    pub fn try_start<D, F>(&self, create: F, receiver: Option<H::Receiver>) -> BridgeResult<()>
    where
        D: Dispatch<H>,
        F: FnOnce() -> Result<D, HostError>,
    {
        let mut slot = self.lock();
        if slot.is_some() {
            return Err(BridgeError::AlreadyStarted);
        }

        let dispatch = create().map_err(|e| BridgeError::DispatchCreateFailed(e.to_string()))?;
        *slot = Some(Arc::new(Dispatcher::new(dispatch, receiver)));
        self.active.store(true, Ordering::Release);

        crate::tb_info!("completion service started");
        Ok(())
    }

    /// Aborts the dispatcher; completions still in flight are discarded.
    /// The service is stopped afterwards even if the abort reported failure.
    pub fn stop(&self) -> BridgeResult<()> {
        let dispatcher = {
            let mut slot = self.lock();
            let Some(dispatcher) = slot.take() else {
                return Err(BridgeError::NotStarted);
            };
            self.active.store(false, Ordering::Release);
            dispatcher
        };

        let result = dispatcher
            .abort()
            .map_err(|e| BridgeError::DispatchAbortFailed(e.to_string()));

        crate::tb_info!(enqueued = dispatcher.enqueued(), "completion service stopped");
        result
    }

    /// A handle for submitting against the currently active dispatcher.
    pub fn submitter(&self) -> BridgeResult<Submitter<H>> {
        self.lock()
            .as_ref()
            .map(|dispatcher| Submitter {
                dispatcher: dispatcher.clone(),
            })
            .ok_or(BridgeError::NotStarted)
    }
}

/// Hands invocation records to a compute engine.
///
/// Obtained before any buffer is pinned, so that a stopped service is reported
/// without having to unwind pins.
pub struct Submitter<H: Host> {
    dispatcher: Arc<Dispatcher<H>>,
}

impl<H: Host> Submitter<H> {
    /// Whether callback-style sinks can be delivered.
    pub fn accepts_callbacks(&self) -> bool {
        self.dispatcher.has_receiver()
    }

    /// Transfers the record to the engine. Returns immediately; the outcome
    /// arrives through the record's sink.
    pub fn submit<E>(&self, engine: &E, mut record: InvocationRecord<H>)
    where
        E: ComputeEngine<H> + ?Sized,
    {
        record.mark_submitted();
        crate::tb_log!(id = ?record.id(), len = record.input_len(), "submitting invocation");
        engine.transform(Job::new(record, self.dispatcher.clone()));
    }
}
