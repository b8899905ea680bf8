use tracing_subscriber::EnvFilter;

/// Initialize tracing with env filter support.
///
/// Set `RUST_LOG=debug` for verbose output, defaults to `info`.
/// Safe to call more than once; later calls are ignored.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,surrealdb=warn,hyper=warn,reqwest=warn")),
        )
        .try_init();
}

pub fn log_startup() {
    tracing::info!("Wayfarer assistant starting up");
}

pub fn log_shutdown() {
    tracing::info!("Wayfarer assistant shutting down");
}
