use tracing_subscriber::EnvFilter;

/// Install the stderr tracing subscriber, filtered by $LAUNCHER_LOG or $RUST_LOG.
pub(crate) fn initialize_tracing() {
    let filter = EnvFilter::try_new(launcher::clienv::log_filter())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
    tracing::trace!("Tracing initialized");
}
