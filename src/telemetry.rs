//! Telemetry initialization.
//!
//! Structured logs go to stderr via `tracing`; the filter comes from
//! `RUST_LOG` (default `warn`). Setting `JVS_LOG_FORMAT=json` switches the
//! human formatter for JSON lines, which is what log shippers want.

use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber. Call once, early in `main`.
///
/// A second call (e.g. from tests) is a no-op.
pub fn init() {
    use tracing_subscriber::layer::SubscriberExt as _;
    use tracing_subscriber::util::SubscriberInitExt as _;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let json = std::env::var("JVS_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init()
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .compact()
                    .with_writer(std::io::stderr),
            )
            .try_init()
    };
    // Already initialized: fine, keep the first subscriber.
    drop(result);
}
