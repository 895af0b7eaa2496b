//! Logging setup

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging for hosts that don't install their own subscriber.
///
/// `RUST_LOG` wins when set; otherwise `info` globally, with this crate
/// raised to `debug` when the debug flag is on. Safe to call more than once;
/// an already-installed subscriber is left in place.
pub fn init_logging(debug: bool) {
    let default_filter = if debug { "info,oxidesync=debug" } else { "info" };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
