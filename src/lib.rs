pub mod api; // HTTP surface: POST /process, GET /health
pub mod config;
pub mod pipeline;

use tracing_subscriber::EnvFilter;

/// Initialise the global tracing subscriber. `RUST_LOG` overrides the
/// default filter.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .init();
}
