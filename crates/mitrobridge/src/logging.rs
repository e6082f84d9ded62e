//! Log setup for binaries. Libraries only emit `tracing` events.

use tracing_subscriber::EnvFilter;

use crate::config::Config;

/// Installs a formatting subscriber filtered by `RUST_LOG`, falling back to
/// `debug` in debug builds of the extension and `info` otherwise.
///
/// Calling it twice is harmless; the first subscriber stays.
pub fn init(config: &Config) {
    let fallback = if config.debug_mode { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
