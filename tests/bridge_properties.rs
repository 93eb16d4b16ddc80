use std::collections::HashMap;
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;

use rand::Rng;

use transform_bridge::host::local::WaitError;
use transform_bridge::{
    BridgeError, BridgeOptions, BufferRole, CompletionError, ComputeEngine, Job, LocalHost,
    LocalReceiver, LocalResult, ReceiverCall, Service, WhitespaceMinifier, WorkerPoolEngine,
};

const WAIT: Duration = Duration::from_secs(10);

fn options() -> BridgeOptions {
    BridgeOptions {
        engine_threads: 4,
        ..Default::default()
    }
}

fn recording_receiver() -> (LocalReceiver, Arc<Mutex<Vec<ReceiverCall>>>) {
    let calls: Arc<Mutex<Vec<ReceiverCall>>> = Arc::default();
    let sink = calls.clone();
    (
        LocalReceiver::new(move |call| sink.lock().unwrap().push(call)),
        calls,
    )
}

fn identity() -> impl Fn(&[u8]) -> Result<Vec<u8>, String> + Send + Sync + 'static {
    |input: &[u8]| Ok(input.to_vec())
}

/// Holds jobs until the test lets them go.
#[derive(Default)]
struct GatedEngine {
    held: Mutex<Vec<Job<LocalHost>>>,
}

impl GatedEngine {
    fn take_all(&self) -> Vec<Job<LocalHost>> {
        std::mem::take(&mut *self.held.lock().unwrap())
    }

    fn release_all(&self) {
        self.take_all().into_iter().for_each(echo);
    }
}

/// Copies the input into the pre-allocated output, or hands back a copy.
fn echo(mut job: Job<LocalHost>) {
    let written = match job.buffers_mut() {
        (input, Some(out)) => {
            out[..input.len()].copy_from_slice(input);
            Some(input.len())
        }
        (_, None) => None,
    };
    match written {
        Some(n) => job.complete_in_place(n),
        None => {
            let out = job.input().to_vec();
            job.complete_with(out);
        }
    }
}

impl ComputeEngine<LocalHost> for GatedEngine {
    fn transform(&self, job: Job<LocalHost>) {
        self.held.lock().unwrap().push(job);
    }
}

struct DroppingEngine;

impl ComputeEngine<LocalHost> for DroppingEngine {
    fn transform(&self, job: Job<LocalHost>) {
        drop(job);
    }
}

struct OverrunEngine;

impl ComputeEngine<LocalHost> for OverrunEngine {
    fn transform(&self, mut job: Job<LocalHost>) {
        let capacity = job.output_mut().map(|o| o.len()).unwrap_or(0);
        job.complete_in_place(capacity + 1);
    }
}

#[test]
fn every_callback_fires_exactly_once() {
    let opts = options();
    let mut host = LocalHost::new(&opts).unwrap();
    let engine = WorkerPoolEngine::new(WhitespaceMinifier, &opts).unwrap();
    let (receiver, calls) = recording_receiver();
    let service = Service::new();
    service.start(host.dispatcher(), Some(receiver)).unwrap();

    let n = 64;
    for id in 0..n {
        let buf = host.alloc_from(format!("  call   {id}  ").as_bytes());
        host.submit_with_id(&service, &engine, &buf, id).unwrap();
    }

    assert!(host.run_until(WAIT, |_| calls.lock().unwrap().len() >= n as usize));
    // Give stray duplicates a chance to show up.
    while host.turn(Duration::from_millis(50)) {}

    let mut seen: HashMap<u64, usize> = HashMap::new();
    for call in calls.lock().unwrap().iter() {
        assert!(call.error.is_none(), "unexpected error {:?}", call.error);
        *seen.entry(call.id).or_default() += 1;
    }
    assert_eq!(seen.len(), n as usize);
    assert!(seen.values().all(|&c| c == 1));
    assert_eq!(host.outstanding_refs(), 0);
}

#[test]
fn references_balance_for_random_sizes() {
    let opts = options();
    let mut host = LocalHost::new(&opts).unwrap();
    let engine = WorkerPoolEngine::new(identity(), &opts).unwrap();
    let (receiver, calls) = recording_receiver();
    let service = Service::new();
    service.start(host.dispatcher(), Some(receiver)).unwrap();

    let mut rng = rand::thread_rng();
    let mut promises = Vec::new();
    let mut callbacks = 0;
    for id in 0..40u64 {
        let len = rng.gen_range(1..=64 * 1024);
        let data: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
        let buf = host.alloc_from(&data);
        if rng.gen_bool(0.5) {
            promises.push(host.submit_promise(&service, &engine, &buf).unwrap());
        } else {
            host.submit_with_id(&service, &engine, &buf, id).unwrap();
            callbacks += 1;
        }
    }

    for promise in promises {
        host.block_on_promise(promise, WAIT).unwrap().unwrap();
    }
    assert!(host.run_until(WAIT, |_| calls.lock().unwrap().len() >= callbacks));
    assert_eq!(host.outstanding_refs(), 0);
}

#[test]
fn bytes_round_trip_through_both_shapes() {
    let opts = options();
    let mut host = LocalHost::new(&opts).unwrap();
    let engine = WorkerPoolEngine::new(identity(), &opts).unwrap();
    let (receiver, calls) = recording_receiver();
    let service = Service::new();
    service.start(host.dispatcher(), Some(receiver)).unwrap();

    for (id, len) in [1usize, 4096, 1 << 20].into_iter().enumerate() {
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let buf = host.alloc_from(&data);

        let promise = host.submit_promise(&service, &engine, &buf).unwrap();
        let out = host.block_on_promise(promise, WAIT).unwrap().unwrap();
        assert_eq!(host.read(&out).unwrap(), data, "promise, {len} bytes");

        let output = host.submit_with_id(&service, &engine, &buf, id as u64).unwrap();
        assert!(host.run_until(WAIT, |_| calls.lock().unwrap().len() > id));
        {
            let calls = calls.lock().unwrap();
            assert_eq!(calls[id].id, id as u64);
            assert!(matches!(calls[id].result, LocalResult::Written(n) if n == len));
        }
        assert_eq!(host.read(&output).unwrap(), data, "callback, {len} bytes");
    }

    let empty = host.alloc_from(&[]);
    assert_eq!(
        host.submit_promise(&service, &engine, &empty).unwrap_err(),
        BridgeError::BufferReadFailed
    );
    assert_eq!(
        host.submit_with_id(&service, &engine, &empty, 99).unwrap_err(),
        BridgeError::BufferReadFailed
    );
    assert_eq!(host.outstanding_refs(), 0);
}

#[test]
fn service_state_machine() {
    let opts = options();
    let mut host = LocalHost::new(&opts).unwrap();
    let engine = WorkerPoolEngine::new(WhitespaceMinifier, &opts).unwrap();
    let service = Service::<LocalHost>::new();

    assert_eq!(service.stop(), Err(BridgeError::NotStarted));
    service.start(host.dispatcher(), None).unwrap();
    assert_eq!(service.start(host.dispatcher(), None), Err(BridgeError::AlreadyStarted));
    service.stop().unwrap();
    assert_eq!(service.stop(), Err(BridgeError::NotStarted));

    let buf = host.alloc_from(b"x");
    assert_eq!(
        host.submit_promise(&service, &engine, &buf).unwrap_err(),
        BridgeError::NotStarted
    );
    assert_eq!(host.outstanding_refs(), 0);

    service.start(host.dispatcher(), None).unwrap();
    let promise = host.submit_promise(&service, &engine, &buf).unwrap();
    assert!(host.block_on_promise(promise, WAIT).unwrap().is_ok());

    assert!(matches!(
        host.submit_with_id(&service, &engine, &buf, 1),
        Err(BridgeError::InvalidArgument(_))
    ));
    assert_eq!(host.outstanding_refs(), 0);
}

#[test]
fn stop_drops_work_still_in_flight() {
    let opts = options();
    let mut host = LocalHost::new(&opts).unwrap();
    let engine = GatedEngine::default();
    let (receiver, calls) = recording_receiver();
    let service = Service::new();
    service.start(host.dispatcher(), Some(receiver)).unwrap();

    let buf = host.alloc_from(b"in flight");
    let promise = host.submit_promise(&service, &engine, &buf).unwrap();
    host.submit_with_id(&service, &engine, &buf, 5).unwrap();

    service.stop().unwrap();
    engine.release_all();

    assert_eq!(host.run_pending(), 0);
    let waited = host.block_on_promise(promise, Duration::from_millis(100));
    assert_eq!(waited.unwrap_err(), WaitError::Timeout);
    assert!(calls.lock().unwrap().is_empty());
    // Completions that could not be enqueued leak their pins.
    assert_eq!(host.outstanding_refs(), 3);
}

#[test]
fn queued_completions_are_discarded_by_stop() {
    let opts = options();
    let mut host = LocalHost::new(&opts).unwrap();
    let engine = GatedEngine::default();
    let (receiver, calls) = recording_receiver();
    let service = Service::new();
    service.start(host.dispatcher(), Some(receiver)).unwrap();

    let buf = host.alloc_from(b"queued");
    host.submit_with_id(&service, &engine, &buf, 8).unwrap();
    engine.release_all();
    service.stop().unwrap();

    assert_eq!(host.run_pending(), 1);
    assert!(calls.lock().unwrap().is_empty());
    assert_eq!(host.outstanding_refs(), 0);
}

#[test]
fn concurrent_submissions_stay_independent() {
    for k in [1u64, 10, 1000] {
        let opts = options();
        let mut host = LocalHost::new(&opts).unwrap();
        let engine = WorkerPoolEngine::new(WhitespaceMinifier, &opts).unwrap();
        let (receiver, calls) = recording_receiver();
        let service = Service::new();
        service.start(host.dispatcher(), Some(receiver)).unwrap();

        let mut outputs = HashMap::new();
        for id in 0..k {
            let buf = host.alloc_from(format!("\n  payload   {id}\t").as_bytes());
            outputs.insert(id, host.submit_with_id(&service, &engine, &buf, id).unwrap());
        }

        assert!(host.run_until(WAIT, |_| calls.lock().unwrap().len() >= k as usize), "k = {k}");

        let calls = std::mem::take(&mut *calls.lock().unwrap());
        assert_eq!(calls.len(), k as usize);
        for call in calls {
            assert!(call.error.is_none());
            let LocalResult::Written(n) = call.result else {
                panic!("expected a written length for id {}", call.id);
            };
            let out = host.read(&outputs[&call.id]).unwrap();
            assert_eq!(&out[..n], format!("payload {}", call.id).as_bytes());
        }
        assert_eq!(host.outstanding_refs(), 0);
    }
}

#[test]
fn release_failure_rejects_with_release_source() {
    let opts = options();
    let mut host = LocalHost::new(&opts).unwrap();
    let engine = WorkerPoolEngine::new(identity(), &opts).unwrap();
    let service = Service::new();
    service.start(host.dispatcher(), None).unwrap();

    host.faults().release = 1;
    let buf = host.alloc_from(b"abc");
    let promise = host.submit_promise(&service, &engine, &buf).unwrap();
    let outcome = host.block_on_promise(promise, WAIT).unwrap();

    assert_eq!(outcome.unwrap_err(), CompletionError::ReleaseSource);
    assert_eq!(host.outstanding_refs(), 1);
}

#[test]
fn buffer_creation_failure_rejects_with_create_result_buffer() {
    let opts = options();
    let mut host = LocalHost::new(&opts).unwrap();
    let engine = WorkerPoolEngine::new(identity(), &opts).unwrap();
    let service = Service::new();
    service.start(host.dispatcher(), None).unwrap();

    host.faults().buffer = 1;
    let buf = host.alloc_from(b"abc");
    let promise = host.submit_promise(&service, &engine, &buf).unwrap();
    let outcome = host.block_on_promise(promise, WAIT).unwrap();

    assert_eq!(outcome.unwrap_err(), CompletionError::CreateResultBuffer);
    assert_eq!(host.outstanding_refs(), 0);
}

#[test]
fn submission_failures_unwind_their_pins() {
    let opts = options();
    let mut host = LocalHost::new(&opts).unwrap();
    let engine = WorkerPoolEngine::new(identity(), &opts).unwrap();
    let (receiver, _calls) = recording_receiver();
    let service = Service::new();
    service.start(host.dispatcher(), Some(receiver)).unwrap();
    let buf = host.alloc_from(b"abc");

    host.faults().pin = 1;
    assert_eq!(
        host.submit_with_id(&service, &engine, &buf, 1).unwrap_err(),
        BridgeError::BufferPinFailed(BufferRole::Source)
    );

    host.faults().alloc = 1;
    assert!(matches!(
        host.submit_with_id(&service, &engine, &buf, 2),
        Err(BridgeError::AllocationFailed(_))
    ));
    assert_eq!(host.outstanding_refs(), 0);
}

#[test]
fn dropped_jobs_and_overruns_are_reported() {
    let opts = options();
    let mut host = LocalHost::new(&opts).unwrap();
    let (receiver, calls) = recording_receiver();
    let service = Service::new();
    service.start(host.dispatcher(), Some(receiver)).unwrap();
    let buf = host.alloc_from(b"abc");

    let promise = host.submit_promise(&service, &DroppingEngine, &buf).unwrap();
    assert_eq!(
        host.block_on_promise(promise, WAIT).unwrap().unwrap_err(),
        CompletionError::Abandoned
    );

    host.submit_with_id(&service, &OverrunEngine, &buf, 3).unwrap();
    assert!(host.run_until(WAIT, |_| !calls.lock().unwrap().is_empty()));
    let call = calls.lock().unwrap().pop().unwrap();
    assert_eq!(call.id, 3);
    assert_eq!(
        call.error,
        Some(CompletionError::OutputOverflow {
            written: 4,
            capacity: 3
        })
    );
    assert_eq!(host.outstanding_refs(), 0);
}

#[test]
fn output_buffer_cannot_be_resubmitted_while_being_written() {
    let opts = options();
    let mut host = LocalHost::new(&opts).unwrap();
    let engine = GatedEngine::default();
    let (receiver, calls) = recording_receiver();
    let service = Service::new();
    service.start(host.dispatcher(), Some(receiver)).unwrap();

    let buf = host.alloc_from(b"written elsewhere");
    let output = host.submit_with_id(&service, &engine, &buf, 1).unwrap();

    assert!(matches!(
        host.submit_promise(&service, &engine, &output),
        Err(BridgeError::InvalidArgument(_))
    ));
    assert!(matches!(
        host.submit_with_id(&service, &engine, &output, 2),
        Err(BridgeError::InvalidArgument(_))
    ));
    assert!(host.pin(&output).is_err());
    // Sources may be shared between invocations.
    let again = host.submit_promise(&service, &engine, &buf).unwrap();
    assert_eq!(host.outstanding_refs(), 3);

    engine.release_all();
    assert!(host.run_until(WAIT, |_| !calls.lock().unwrap().is_empty()));
    assert!(host.block_on_promise(again, WAIT).unwrap().is_ok());

    let promise = host.submit_promise(&service, &engine, &output).unwrap();
    engine.release_all();
    let out = host.block_on_promise(promise, WAIT).unwrap().unwrap();
    assert_eq!(host.read(&out).unwrap(), b"written elsewhere");
    assert_eq!(host.outstanding_refs(), 0);
}

#[test]
fn promises_can_be_awaited_off_the_host_thread() {
    let opts = options();
    let mut host = LocalHost::new(&opts).unwrap();
    let engine = WorkerPoolEngine::new(identity(), &opts).unwrap();
    let service = Service::new();
    service.start(host.dispatcher(), None).unwrap();

    let buf = host.alloc_from(b"awaited");
    let promise = host.submit_promise(&service, &engine, &buf).unwrap();
    let waiter = thread::spawn(move || {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        rt.block_on(async { tokio::time::timeout(WAIT, promise).await })
    });

    assert!(host.run_until(WAIT, |_| waiter.is_finished()));
    let out = waiter.join().unwrap().unwrap().unwrap().unwrap();
    assert_eq!(host.read(&out).unwrap(), b"awaited");
    assert_eq!(host.outstanding_refs(), 0);

    // Dropping the deferred side unsettled wakes the waiter with an error.
    let (deferred, promise) = host.promise();
    drop(deferred);
    let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
    assert_eq!(rt.block_on(promise).unwrap_err(), WaitError::Dropped);
}

#[test]
fn closure_sinks_run_once_on_the_host_thread() {
    let opts = options();
    let mut host = LocalHost::new(&opts).unwrap();
    let engine = WorkerPoolEngine::new(identity(), &opts).unwrap();
    let service = Service::new();
    service.start(host.dispatcher(), None).unwrap();

    let host_thread = thread::current().id();
    let seen: Arc<Mutex<Vec<(thread::ThreadId, Result<usize, CompletionError>)>>> = Arc::default();
    for text in ["one", "two  ", "three"] {
        let buf = host.alloc_from(text.as_bytes());
        let sink = seen.clone();
        host.submit_with(&service, &engine, &buf, move |outcome| {
            let outcome = outcome.map(|b| b.len());
            sink.lock().unwrap().push((thread::current().id(), outcome));
        })
        .unwrap();
    }

    assert!(host.run_until(WAIT, |_| seen.lock().unwrap().len() >= 3));
    while host.turn(Duration::from_millis(50)) {}
    {
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert!(seen.iter().all(|(t, _)| *t == host_thread));
        let mut lens: Vec<usize> = seen.iter().map(|(_, r)| *r.as_ref().unwrap()).collect();
        lens.sort_unstable();
        assert_eq!(lens, [3, 5, 5]);
    }
    assert_eq!(host.outstanding_refs(), 0);

    // Failures arrive through the closure as well.
    let buf = host.alloc_from(b"gone");
    let sink = seen.clone();
    host.submit_with(&service, &DroppingEngine, &buf, move |outcome| {
        sink.lock().unwrap().push((thread::current().id(), outcome.map(|b| b.len())));
    })
    .unwrap();
    assert!(host.run_until(WAIT, |_| seen.lock().unwrap().len() >= 4));
    assert_eq!(seen.lock().unwrap()[3].1, Err(CompletionError::Abandoned));

    // Nothing fires once the service has stopped.
    let gated = GatedEngine::default();
    let fired = Arc::new(Mutex::new(false));
    let flag = fired.clone();
    host.submit_with(&service, &gated, &buf, move |_| *flag.lock().unwrap() = true)
        .unwrap();
    service.stop().unwrap();
    gated.release_all();
    host.run_pending();
    assert!(!*fired.lock().unwrap());
}

#[test]
fn completions_racing_stop_release_or_leak_every_pin() {
    let opts = options();
    let mut host = LocalHost::new(&opts).unwrap();
    let engine = GatedEngine::default();
    let (receiver, calls) = recording_receiver();
    let service = Service::new();
    service.start(host.dispatcher(), Some(receiver)).unwrap();

    let n = 400usize;
    for id in 0..n as u64 {
        let buf = host.alloc_from(format!("job {id}").as_bytes());
        host.submit_with_id(&service, &engine, &buf, id).unwrap();
    }
    assert_eq!(host.outstanding_refs(), 2 * n);

    let mut jobs = engine.take_all();
    let start = Arc::new(Barrier::new(5));
    let workers: Vec<_> = (0..4)
        .map(|_| {
            let chunk: Vec<_> = jobs.drain(..jobs.len().min(n / 4)).collect();
            let start = start.clone();
            thread::spawn(move || {
                start.wait();
                chunk.into_iter().for_each(echo);
            })
        })
        .collect();

    start.wait();
    let mut ran = 0;
    for _ in 0..8 {
        if host.turn(Duration::from_millis(1)) {
            ran += 1;
        }
    }
    service.stop().unwrap();
    for worker in workers {
        worker.join().unwrap();
    }
    ran += host.run_pending();

    let calls = calls.lock().unwrap();
    let mut seen = HashMap::new();
    for call in calls.iter() {
        assert!(call.error.is_none());
        *seen.entry(call.id).or_insert(0) += 1;
    }
    assert!(seen.values().all(|&c| c == 1), "a receiver fired twice");
    assert!(calls.len() <= ran);
    // Each task that ran released both of its pins; each refused one leaked them.
    assert_eq!(host.outstanding_refs(), 2 * (n - ran));
}
