use serde::Deserialize;

pub const ENV_QUEUE_CAPACITY: &str = "TRANSFORM_BRIDGE_QUEUE_CAPACITY";
pub const ENV_ENGINE_THREADS: &str = "TRANSFORM_BRIDGE_ENGINE_THREADS";

/// Knobs shared by the dispatcher and the bundled engine.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BridgeOptions {
    /// Maximum number of completions waiting for the host. `0` means unbounded.
    pub queue_capacity: usize,
    /// Worker threads for [`crate::engine::WorkerPoolEngine`].
    pub engine_threads: usize,
    /// Name of the completion receiver, used for logging and async resource naming.
    pub receiver_name: String,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            queue_capacity: 0,
            engine_threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            receiver_name: "transform-bridge receiver callback".to_string(),
        }
    }
}

impl BridgeOptions {
    /// Parses a JSON options object. Unknown keys are ignored; malformed input
    /// yields the defaults.
    pub fn from_json(text: &str) -> Self {
        serde_json::from_str::<BridgeOptions>(text)
            .map(Self::sanitized)
            .unwrap_or_default()
    }

    /// Defaults overridden by `TRANSFORM_BRIDGE_*` environment variables.
    pub fn from_env() -> Self {
        let mut out = Self::default();
        if let Some(n) = env_usize(ENV_QUEUE_CAPACITY) {
            out.queue_capacity = n;
        }
        if let Some(n) = env_usize(ENV_ENGINE_THREADS) {
            out.engine_threads = n;
        }
        out.sanitized()
    }

    pub(crate) fn sanitized(mut self) -> Self {
        if self.engine_threads == 0 {
            self.engine_threads = Self::default().engine_threads;
        }
        if self.receiver_name.trim().is_empty() {
            self.receiver_name = Self::default().receiver_name;
        }
        self
    }
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok()?.trim().parse().ok()
}
