//! Logging setup via `tracing-subscriber`.

use tracing_subscriber::EnvFilter;

/// Initialize the global subscriber.
///
/// `RUST_LOG` wins when set; otherwise `verbose` toggles between debug and
/// info for this crate, with dependencies kept at warn.
pub fn init(verbose: bool) {
    let default = if verbose {
        "warn,clawgate=debug"
    } else {
        "warn,clawgate=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
