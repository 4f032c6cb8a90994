use std::sync::Once;

use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Install the global `tracing` subscriber. The filter comes from `RUST_LOG`
/// when set, otherwise from `levels` (the CLI's `--log-level`). Safe to call
/// more than once; only the first call wins.
pub fn init(levels: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(levels));

    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    });
}
