//! Tracing subscriber setup for the binaries.

use tracing_error::ErrorLayer;
use tracing_subscriber::{EnvFilter, prelude::*};

/// Install the global subscriber.
///
/// Filtering follows `RUST_LOG` and falls back to `info`. The error layer
/// makes [`SpanTrace`](tracing_error::SpanTrace)s captured by this crate's
/// errors carry the active spans.
pub fn init() {
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(filter)
        .with(ErrorLayer::default())
        .init();
}
