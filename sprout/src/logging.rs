//! Logging set up shared by the binaries.
use tracing_subscriber::EnvFilter;

/// Install a fmt subscriber. `RUST_LOG` takes precedence, otherwise the
/// sprout crates log at `level`.
///
/// * `level`: default level such as `info` or `debug`.
pub fn init(level: &str) {
    let default_filter = format!("sprout={level},kit_camera={level},kit_lighting={level}");
    // A second init (tests, repeated binaries in one process) is not an error.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .try_init();
}
