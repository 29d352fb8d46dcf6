use tracing_subscriber::EnvFilter;

/// Installs the global fmt subscriber. `RUST_LOG` overrides the default `info` filter.
///
/// Fails when a subscriber is already installed, so callers that may run twice
/// (tests, binaries linked together) use `logging::init().ok()`.
pub fn init() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
}
