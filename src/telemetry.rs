use std::sync::OnceLock;

use tracing_subscriber::{EnvFilter, fmt};

/// Initialize the tracing subscriber once per process.
///
/// Honors `RUST_LOG`; defaults to `leakcheck=info`. Embedders that install
/// their own subscriber can simply not call this.
pub fn init_tracing() {
    static INIT: OnceLock<()> = OnceLock::new();

    INIT.get_or_init(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("leakcheck=info"));
        let _ = fmt().with_env_filter(filter).try_init();
    });
}
