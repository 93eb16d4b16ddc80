/// Installs a `fmt` subscriber honouring `RUST_LOG`.
///
/// Best-effort: a subscriber that is already installed (e.g. by the embedding
/// application) wins and this call does nothing.
pub fn init() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("transform_bridge=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .try_init();
}

#[macro_export]
macro_rules! tb_log {
    ($($t:tt)*) => {{
        ::tracing::debug!(target: "transform_bridge", $($t)*);
    }};
}

#[macro_export]
macro_rules! tb_info {
    ($($t:tt)*) => {{
        ::tracing::info!(target: "transform_bridge", $($t)*);
    }};
}

#[macro_export]
macro_rules! tb_warn {
    ($($t:tt)*) => {{
        ::tracing::warn!(target: "transform_bridge", $($t)*);
    }};
}
