use std::sync::Arc;

use crate::bridge::host::Host;
use crate::config::BridgeOptions;
use crate::engine::{ComputeEngine, Job, Transform};

/// Runs a [`Transform`] on a dedicated multi-threaded tokio runtime.
///
/// Each job goes to the blocking pool, so transforms may be CPU heavy.
/// Jobs with a pre-allocated output are written in place; the others get an
/// engine-allocated block.
pub struct WorkerPoolEngine<T: Transform> {
    runtime: tokio::runtime::Runtime,
    transform: Arc<T>,
    threads: usize,
}

impl<T: Transform> WorkerPoolEngine<T> {
    pub fn new(transform: T, options: &BridgeOptions) -> std::io::Result<Self> {
        let threads = options.engine_threads.max(1);
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(threads)
            .thread_name("transform-engine")
            .build()?;

        Ok(Self {
            runtime,
            transform: Arc::new(transform),
            threads,
        })
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Whether this engine was built with the thread count `options` asks for.
    pub fn matches(&self, options: &BridgeOptions) -> bool {
        self.threads == options.engine_threads.max(1)
    }

    /// Drops the runtime without waiting. Jobs already running finish on
    /// their own threads; queued ones are dropped and report `Abandoned`.
    pub fn shutdown_background(self) {
        self.runtime.shutdown_background();
    }
}

impl<H: Host, T: Transform> ComputeEngine<H> for WorkerPoolEngine<T> {
    fn transform(&self, job: Job<H>) {
        let transform = self.transform.clone();
        self.runtime.spawn_blocking(move || run_job(&*transform, job));
    }
}

enum Produced {
    InPlace(usize),
    Owned(Vec<u8>),
}

fn run_job<H: Host, T: Transform + ?Sized>(transform: &T, mut job: Job<H>) {
    let produced = {
        let (input, output) = job.buffers_mut();
        match output {
            Some(out) => transform.transform_into(input, out).map(Produced::InPlace),
            None => transform.transform(input).map(Produced::Owned),
        }
    };

    match produced {
        Ok(Produced::InPlace(written)) => job.complete_in_place(written),
        Ok(Produced::Owned(block)) => job.complete_with(block),
        Err(e) => job.fail(e),
    }
}
