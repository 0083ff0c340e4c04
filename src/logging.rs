//! Tracing initialisation: `RUST_LOG` wins when set, otherwise fall
//! back to the configured (or default) level.

use tracing_subscriber::{fmt, EnvFilter};

/// Installs the global tracing subscriber. Safe to call once at
/// process startup; a second call is a no-op logged at `warn`.
pub fn init(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let subscriber = fmt().with_env_filter(filter).with_target(true).finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::warn!("tracing subscriber already initialised, ignoring");
    }
}
