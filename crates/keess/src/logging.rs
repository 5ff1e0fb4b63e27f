//! Logging initialization.
use tracing_subscriber::EnvFilter;

/// Initializes `tracing` logging.
///
/// The filter is taken from the environment variable named by `env` when it
/// is set (e.g. `KEESS_LOG=keess=debug,info`), otherwise from the level
/// given on the command line.
pub fn initialize_logging(env: &str, level: &str) {
    let filter = EnvFilter::try_from_env(env)
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
