use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Initialize the logging pipeline. Reads `RUST_LOG` if set, falling back
/// to `default_level`. Called once at startup; there is no reload.
pub fn init_telemetry(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_string()));

    Registry::default()
        .with(filter)
        .with(fmt::layer().with_target(false).with_level(true))
        .init();
}
