use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "phi_worker=info";

/// Install the global fmt subscriber. Output goes to stderr; stdout carries
/// the host protocol when running `serve`.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
