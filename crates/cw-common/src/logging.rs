//! Structured logging bootstrap.
//!
//! The library itself only emits `tracing` events; installing a subscriber is
//! the embedding application's call. This module gives hosts (and the test
//! suites) a one-liner that honors the usual environment knobs:
//!
//! - `LOG_FORMAT`: "json" for machine-readable output, anything else for
//!   human-readable text (default).
//! - `RUST_LOG`: standard level filter, e.g. `RUST_LOG=cw_messenger=debug`.

use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

/// Install a global subscriber according to `LOG_FORMAT` / `RUST_LOG`.
///
/// Panics if a global subscriber is already set; call once at startup.
pub fn init_logging() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true)
                    .flatten_event(true),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(true).with_ansi(true))
            .init();
    }
}
