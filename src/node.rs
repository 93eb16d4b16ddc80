//! Node.js addon surface.
//!
//! `startService(callback?, options?)`, `stopService()`, `minify(id, buffer)`
//! and `minifyAsync(buffer)`. Completions are marshalled back onto the
//! JavaScript thread through a neon [`Channel`].

use std::sync::{Arc, Mutex};

use lazy_static::lazy_static;
use neon::prelude::*;
use neon::result::Throw;
use neon::types::Deferred;

use crate::bridge::dispatch::{Bounded, Dispatch, HostTask};
use crate::bridge::host::{Host, HostContext, ReceiverResult, Unsettled};
use crate::bridge::invocation::{CompletionSink, InvocationRecord};
use crate::bridge::marshal::OutputBlock;
use crate::bridge::pin::BufferRef;
use crate::bridge::service::{Service, Submitter};
use crate::config::BridgeOptions;
use crate::engine::{WhitespaceMinifier, WorkerPoolEngine};
use crate::error::{BridgeError, CompletionError, DispatchError, HostError};

pub struct NodeHost;

impl Host for NodeHost {
    type Buffer = Root<JsBuffer>;
    type Deferred = Deferred;
    type Receiver = Root<JsFunction>;
}

type NodeEngine = WorkerPoolEngine<WhitespaceMinifier>;

lazy_static! {
    static ref SERVICE: Service<NodeHost> = Service::new();
    static ref ENGINE: Mutex<Option<Arc<NodeEngine>>> = Mutex::new(None);
}

struct ChannelDispatch {
    channel: Channel,
}

impl Dispatch<NodeHost> for ChannelDispatch {
    fn try_dispatch(&self, task: HostTask<NodeHost>) -> Result<(), DispatchError> {
        self.channel
            .try_send(move |mut cx| {
                let host: &mut dyn HostContext<NodeHost> = &mut cx;
                task(host);
                Ok(())
            })
            .map(|_| ())
            .map_err(|_| DispatchError::Closed)
    }
}

fn completion_error<'a, C: Context<'a>>(
    cx: &mut C,
    error: &CompletionError,
) -> JsResult<'a, JsError> {
    let err = cx.error(error.to_string())?;
    let code = cx.string(error.code());
    err.set(cx, "code", code)?;
    Ok(err)
}

fn throw_bridge<'a, C: Context<'a>, T>(cx: &mut C, error: &BridgeError) -> NeonResult<T> {
    let err = cx.error(error.to_string())?;
    let code = cx.string(error.code());
    err.set(cx, "code", code)?;
    cx.throw(err)
}

impl<'a> HostContext<NodeHost> for TaskContext<'a> {
    fn release(&mut self, buffer: Root<JsBuffer>) -> Result<(), HostError> {
        buffer.drop(self);
        Ok(())
    }

    fn resolve_pinned(
        &mut self,
        deferred: Deferred,
        buffer: Root<JsBuffer>,
        len: usize,
    ) -> Result<(), Unsettled<NodeHost>> {
        let built = self.try_catch(|cx| {
            let full = buffer.into_inner(cx);
            let head = {
                let bytes = full.as_slice(&*cx);
                if bytes.len() == len {
                    None
                } else {
                    Some(bytes.get(..len).map(<[u8]>::to_vec))
                }
            };
            match head {
                None => Ok(full),
                Some(Some(bytes)) => JsBuffer::from_slice(cx, &bytes),
                Some(None) => cx.throw_range_error("written length exceeds the result buffer"),
            }
        });

        match built {
            Ok(out) => {
                deferred.resolve(self, out);
                Ok(())
            }
            Err(_) => Err((deferred, HostError::new("failed to build result buffer"))),
        }
    }

    fn resolve_owned(
        &mut self,
        deferred: Deferred,
        block: OutputBlock,
    ) -> Result<(), Unsettled<NodeHost>> {
        match self.try_catch(|cx| Ok(JsBuffer::external(cx, block))) {
            Ok(out) => {
                deferred.resolve(self, out);
                Ok(())
            }
            Err(_) => Err((deferred, HostError::new("failed to adopt output block"))),
        }
    }

    fn reject(&mut self, deferred: Deferred, error: &CompletionError) {
        // try_catch clears the pending exception; rejecting with one pending panics.
        match self.try_catch(|cx| completion_error(cx, error)) {
            Ok(err) => deferred.reject(self, err),
            Err(thrown) => deferred.reject(self, thrown),
        }
    }

    fn call_receiver(
        &mut self,
        receiver: &Root<JsFunction>,
        error: Option<&CompletionError>,
        id: u64,
        result: ReceiverResult,
    ) -> Result<(), HostError> {
        let args = self
            .try_catch(|cx| {
                let error: Handle<JsValue> = match error {
                    Some(e) => completion_error(cx, e)?.upcast(),
                    None => cx.undefined().upcast(),
                };
                let id: Handle<JsValue> = cx.number(id as f64).upcast();
                let result: Handle<JsValue> = match result {
                    ReceiverResult::Written(n) => cx.number(n as f64).upcast(),
                    ReceiverResult::Owned(block) => JsBuffer::external(cx, block).upcast(),
                    ReceiverResult::Empty => cx.undefined().upcast(),
                };
                Ok([error, id, result])
            })
            .map_err(|_| HostError::new("failed to create receiver arguments"))?;

        let callback = receiver.to_inner(self);
        let this = self.undefined();
        if self.try_catch(|cx| callback.call(cx, this, args)).is_err() {
            crate::tb_warn!(id, "receiver threw while handling a completion");
        }
        Ok(())
    }
}

impl BridgeOptions {
    /// Reads an options object passed from JavaScript. Missing or mistyped
    /// fields keep their defaults.
    pub fn from_neon<'a>(cx: &mut FunctionContext<'a>, idx: usize) -> Result<Self, Throw> {
        let mut out = BridgeOptions::default();

        if idx >= cx.len() {
            return Ok(out);
        }

        let raw = cx.argument::<JsValue>(idx)?;
        if raw.is_a::<JsNull, _>(cx) || raw.is_a::<JsUndefined, _>(cx) {
            return Ok(out);
        }

        let obj = match raw.downcast::<JsObject, _>(cx) {
            Ok(o) => o,
            Err(_) => return Ok(out),
        };

        if let Ok(v) = obj.get::<JsValue, _, _>(cx, "queueCapacity") {
            if let Ok(n) = v.downcast::<JsNumber, _>(cx) {
                let n = n.value(cx);
                if n.is_finite() && n >= 0.0 {
                    out.queue_capacity = n as usize;
                }
            }
        }
        if let Ok(v) = obj.get::<JsValue, _, _>(cx, "engineThreads") {
            if let Ok(n) = v.downcast::<JsNumber, _>(cx) {
                let n = n.value(cx);
                if n.is_finite() && n >= 1.0 {
                    out.engine_threads = n as usize;
                }
            }
        }
        if let Ok(v) = obj.get::<JsValue, _, _>(cx, "receiverName") {
            if let Ok(s) = v.downcast::<JsString, _>(cx) {
                out.receiver_name = s.value(cx);
            }
        }

        Ok(out.sanitized())
    }
}

fn engine<'a>(cx: &mut FunctionContext<'a>) -> NeonResult<Arc<NodeEngine>> {
    let slot = match ENGINE.lock() {
        Ok(slot) => slot,
        Err(e) => return cx.throw_error(e.to_string()),
    };
    match slot.as_ref() {
        Some(engine) => Ok(engine.clone()),
        None => throw_bridge(cx, &BridgeError::NotStarted),
    }
}

/// Builds the engine for a fresh start, replacing one built with a different
/// thread count. The old runtime is shut down without blocking the JS thread.
fn install_engine(opts: &BridgeOptions) -> Result<(), BridgeError> {
    let mut slot = ENGINE
        .lock()
        .map_err(|e| BridgeError::DispatchCreateFailed(e.to_string()))?;
    if slot.as_ref().map_or(false, |engine| engine.matches(opts)) {
        return Ok(());
    }

    let engine = WorkerPoolEngine::new(WhitespaceMinifier, opts)
        .map_err(|e| BridgeError::DispatchCreateFailed(e.to_string()))?;
    if let Some(old) = slot.replace(Arc::new(engine)) {
        crate::tb_info!(threads = old.threads(), "replacing engine");
        if let Ok(old) = Arc::try_unwrap(old) {
            old.shutdown_background();
        }
    }
    Ok(())
}

fn submitter<'a>(cx: &mut FunctionContext<'a>) -> NeonResult<Submitter<NodeHost>> {
    match SERVICE.submitter() {
        Ok(s) => Ok(s),
        Err(e) => throw_bridge(cx, &e),
    }
}

fn pin_buffer<'a>(
    cx: &mut FunctionContext<'a>,
    mut buffer: Handle<'a, JsBuffer>,
) -> BufferRef<NodeHost> {
    let (ptr, len) = {
        let bytes = buffer.as_mut_slice(cx);
        (bytes.as_mut_ptr(), bytes.len())
    };
    let root = buffer.root(cx);
    // Node buffers do not move, and the root keeps the backing store alive.
    unsafe { BufferRef::from_raw_parts(root, ptr, len) }
}

fn unpin_now<'a>(cx: &mut FunctionContext<'a>, pinned: BufferRef<NodeHost>) {
    if let Some(root) = pinned.into_handle() {
        root.drop(cx);
    }
}

fn source_argument<'a>(cx: &mut FunctionContext<'a>, idx: usize) -> JsResult<'a, JsBuffer> {
    let buffer = cx.argument::<JsBuffer>(idx)?;
    if buffer.as_slice(&*cx).is_empty() {
        return throw_bridge(cx, &BridgeError::BufferReadFailed);
    }
    Ok(buffer)
}

fn start_service(mut cx: FunctionContext) -> JsResult<JsUndefined> {
    let receiver = match cx.argument_opt(0) {
        None => None,
        Some(v) if v.is_a::<JsUndefined, _>(&mut cx) || v.is_a::<JsNull, _>(&mut cx) => None,
        Some(v) => match v.downcast::<JsFunction, _>(&mut cx) {
            Ok(f) => Some(f.root(&mut cx)),
            Err(_) => {
                let err = cx.type_error("First argument is not a function")?;
                let code = cx.string("NOTAFN");
                err.set(&mut cx, "code", code)?;
                return cx.throw(err);
            }
        },
    };
    let opts = BridgeOptions::from_neon(&mut cx, 1).unwrap_or_default();

    // Neon channels have no capacity of their own.
    let channel = cx.channel();
    let capacity = opts.queue_capacity;
    let dispatch = || Ok(Bounded::new(ChannelDispatch { channel }, capacity));
    if let Err(e) = SERVICE.try_start(dispatch, receiver) {
        return throw_bridge(&mut cx, &e);
    }
    if let Err(e) = install_engine(&opts) {
        let _ = SERVICE.stop();
        return throw_bridge(&mut cx, &e);
    }
    crate::tb_log!(receiver = %opts.receiver_name, queue = opts.queue_capacity, "node service ready");

    Ok(cx.undefined())
}

fn stop_service(mut cx: FunctionContext) -> JsResult<JsUndefined> {
    if let Err(e) = SERVICE.stop() {
        return throw_bridge(&mut cx, &e);
    }
    Ok(cx.undefined())
}

fn parse_id(cx: &mut FunctionContext) -> NeonResult<u64> {
    let raw = cx.argument::<JsValue>(0)?;
    let id = raw
        .downcast::<JsNumber, _>(cx)
        .ok()
        .map(|n| n.value(cx))
        .filter(|n| n.is_finite() && *n >= 0.0 && n.fract() == 0.0);

    match id {
        Some(n) => Ok(n as u64),
        None => {
            let err = cx.error("Failed to parse ID")?;
            let code = cx.string("GET_ID_FAILED");
            err.set(cx, "code", code)?;
            cx.throw(err)
        }
    }
}

/// `minify(id, buffer)`: returns the pre-allocated result buffer right away;
/// the receiver is later called with `(error, id, writtenLength)`.
fn minify(mut cx: FunctionContext) -> JsResult<JsBuffer> {
    let id = parse_id(&mut cx)?;
    let submitter = submitter(&mut cx)?;
    if !submitter.accepts_callbacks() {
        let err = BridgeError::InvalidArgument("service was started without a receiver".into());
        return throw_bridge(&mut cx, &err);
    }
    let engine = engine(&mut cx)?;

    let source = source_argument(&mut cx, 1)?;
    let len = source.as_slice(&cx).len();
    let source = pin_buffer(&mut cx, source);

    let output = match cx.try_catch(|cx| JsBuffer::new(cx, len)) {
        Ok(b) => b,
        Err(_) => {
            unpin_now(&mut cx, source);
            return throw_bridge(&mut cx, &BridgeError::AllocationFailed("result buffer"));
        }
    };
    let result = pin_buffer(&mut cx, output);

    let record = InvocationRecord::new(source, Some(result), CompletionSink::Callback { id });
    submitter.submit(&*engine, record);
    Ok(output)
}

/// `minifyAsync(buffer)`: resolves with a buffer that adopts the engine's output.
fn minify_async(mut cx: FunctionContext) -> JsResult<JsPromise> {
    let submitter = submitter(&mut cx)?;
    let engine = engine(&mut cx)?;
    let source = source_argument(&mut cx, 0)?;
    let source = pin_buffer(&mut cx, source);

    let (deferred, promise) = cx.promise();
    let record = InvocationRecord::new(source, None, CompletionSink::Promise(deferred));
    submitter.submit(&*engine, record);
    Ok(promise)
}

#[neon::main]
fn main(mut cx: ModuleContext) -> NeonResult<()> {
    crate::log::init();

    cx.export_function("startService", start_service)?;
    cx.export_function("stopService", stop_service)?;
    cx.export_function("minify", minify)?;
    cx.export_function("minifyAsync", minify_async)?;

    Ok(())
}
