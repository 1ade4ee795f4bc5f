//! Tracing configuration.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Configure stdout tracing from the service log level.
///
/// `RUST_LOG` takes precedence when set, so operators can still scope
/// verbosity per module; otherwise the `LOG_LEVEL` value applies globally.
pub fn configure_tracing(log_level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.to_lowercase()),
    );

    let fmt_layer = tracing_subscriber::fmt::layer();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
