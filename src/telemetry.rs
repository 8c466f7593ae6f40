use tracing_subscriber::EnvFilter;

/// Install the global `tracing` subscriber, `RUST_LOG` overrides the `info` default
pub fn init_tracing() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_ids(true)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!(e))
}
