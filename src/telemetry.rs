//! Log subscriber setup.
//!
//! Everything goes to stderr: a cluster worker's stdout is its control
//! channel to the supervisor. `RUST_LOG` overrides the default `info` filter.

use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Environment;
use crate::error::Error;

const DEFAULT_FILTER: &str = "info";

/// Installs the global subscriber: pretty console output in development,
/// one JSON object per line in production.
pub fn init(env: Environment) -> Result<(), Error> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(true);

    let installed = match env {
        Environment::Development => Registry::default()
            .with(filter)
            .with(fmt_layer.pretty().with_file(true).with_line_number(true))
            .try_init(),
        Environment::Production => Registry::default()
            .with(filter)
            .with(fmt_layer.json().with_current_span(true).with_span_list(false))
            .try_init(),
    };
    installed.map_err(|e| Error::Telemetry(e.to_string()))?;

    tracing::debug!(?env, "logging initialized");
    Ok(())
}
