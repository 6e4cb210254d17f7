use anyhow::{Result, anyhow};
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::AppConfig;

/// Installs the global subscriber. `log_format` may force `json` or
/// `compact`; `auto` picks JSON in production.
pub fn init_tracing(config: &AppConfig) -> Result<()> {
    let filter =
        EnvFilter::try_new(config.log_level.clone()).unwrap_or_else(|_| EnvFilter::new("info"));
    let json = match config.log_format.to_ascii_lowercase().as_str() {
        "json" => true,
        "compact" => false,
        _ => config.is_production(),
    };

    let installed = if json {
        fmt()
            .with_env_filter(filter)
            .json()
            .with_current_span(false)
            .with_target(false)
            .try_init()
    } else {
        fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .try_init()
    };
    installed.map_err(|err| anyhow!("failed to install tracing subscriber: {err}"))
}
