use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, ValueEnum};
use tracing::{info, warn};

use transform_bridge::{
    BridgeOptions, LocalHost, LocalReceiver, LocalResult, ReceiverCall, Service, WhitespaceMinifier,
    WorkerPoolEngine,
};

/// Minifies files through the completion bridge and reports the sizes.
#[derive(Parser)]
#[command(name = "transform-bridge-demo")]
#[command(about = "Run files through the transform bridge", long_about = None)]
struct Cli {
    /// Files to minify
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Completion style
    #[arg(short, long, value_enum, default_value_t = Mode::Promise)]
    mode: Mode,

    /// Engine worker threads (defaults to TRANSFORM_BRIDGE_ENGINE_THREADS or the CPU count)
    #[arg(short, long)]
    threads: Option<usize>,

    /// Seconds to wait for all completions
    #[arg(long, default_value_t = 30)]
    timeout: u64,
}

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    /// One promise per file, engine-allocated output
    Promise,
    /// Shared receiver keyed by id, pre-allocated output
    Id,
}

/// Reads every file, setting aside the empty ones: the bridge refuses to
/// submit zero-length input.
fn read_inputs(paths: &[PathBuf]) -> Result<(Vec<(PathBuf, Vec<u8>)>, Vec<PathBuf>)> {
    let mut inputs = Vec::with_capacity(paths.len());
    let mut skipped = Vec::new();
    for path in paths {
        let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        if bytes.is_empty() {
            skipped.push(path.clone());
        } else {
            inputs.push((path.clone(), bytes));
        }
    }
    Ok((inputs, skipped))
}

fn main() -> Result<()> {
    transform_bridge::log::init();

    let cli = Cli::parse();
    let mut opts = BridgeOptions::from_env();
    if let Some(n) = cli.threads.filter(|n| *n > 0) {
        opts.engine_threads = n;
    }

    let (inputs, skipped) = read_inputs(&cli.files)?;
    for path in &skipped {
        warn!(file = %path.display(), "empty file skipped");
        println!("{}: empty, skipped", path.display());
    }
    if inputs.is_empty() {
        return Ok(());
    }

    let mut host = LocalHost::new(&opts).context("building host event loop")?;
    let engine = WorkerPoolEngine::new(WhitespaceMinifier, &opts).context("building engine")?;
    let service = Service::<LocalHost>::new();
    let timeout = Duration::from_secs(cli.timeout);

    info!(files = inputs.len(), threads = opts.engine_threads, "starting");

    match cli.mode {
        Mode::Promise => {
            service.start(host.dispatcher(), None)?;
            let mut pending = Vec::new();
            for (path, bytes) in &inputs {
                let buf = host.alloc_from(bytes);
                let promise = host.submit_promise(&service, &engine, &buf)?;
                pending.push((path, bytes.len(), buf, promise));
            }
            for (path, before, _buf, promise) in pending {
                let out = host
                    .block_on_promise(promise, timeout)?
                    .map_err(|e| anyhow!("{}: {}", path.display(), e))?;
                println!("{}: {} -> {} bytes", path.display(), before, out.len());
            }
        }
        Mode::Id => {
            let calls: Arc<Mutex<Vec<ReceiverCall>>> = Arc::default();
            let sink = calls.clone();
            let receiver = LocalReceiver::new(move |call| {
                if let Ok(mut calls) = sink.lock() {
                    calls.push(call);
                }
            });
            service.start(host.dispatcher(), Some(receiver))?;

            let mut outputs = Vec::new();
            for (id, (_, bytes)) in inputs.iter().enumerate() {
                let buf = host.alloc_from(bytes);
                outputs.push(host.submit_with_id(&service, &engine, &buf, id as u64)?);
            }

            let expected = inputs.len();
            let done = host.run_until(timeout, |_| {
                calls.lock().map(|c| c.len() >= expected).unwrap_or(true)
            });
            if !done {
                bail!("timed out waiting for {} completions", expected);
            }

            let calls = std::mem::take(&mut *calls.lock().map_err(|e| anyhow!("{}", e))?);
            for call in calls {
                let (path, bytes) = &inputs[call.id as usize];
                if let Some(e) = call.error {
                    bail!("{}: {}", path.display(), e);
                }
                let written = match call.result {
                    LocalResult::Written(n) => n,
                    LocalResult::Buffer(b) => b.len(),
                    LocalResult::Empty => 0,
                };
                let out = host.read(&outputs[call.id as usize])?;
                let first_line = out
                    .get(..written)
                    .and_then(|o| o.split(|b| *b == b'\n').next())
                    .unwrap_or(&[]);
                println!(
                    "{}: {} -> {} bytes (first line: {:?})",
                    path.display(),
                    bytes.len(),
                    written,
                    String::from_utf8_lossy(first_line)
                );
            }
        }
    }

    service.stop()?;
    Ok(())
}
