//! Tracing subscriber setup.
//!
//! The filter is read from `LINEAGE_LOG` when set (e.g. `LINEAGE_LOG=debug`
//! or `LINEAGE_LOG=lineage::store=trace`), otherwise from the configured level.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LogFormat, LoggingConfig};
use crate::error::{LineageError, LineageResult};

pub fn init(config: &LoggingConfig) -> LineageResult<()> {
    let env_filter = EnvFilter::try_from_env("LINEAGE_LOG")
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|err| LineageError::Config(format!("invalid log filter: {err}")))?;

    let registry = tracing_subscriber::registry().with(env_filter);

    let result = match config.format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Pretty => registry
            .with(fmt::layer().compact().with_writer(std::io::stderr))
            .try_init(),
    };

    result.map_err(|err| LineageError::Internal(format!("logging already initialized: {err}")))?;
    tracing::debug!(level = %config.level, format = ?config.format, "logging initialized");
    Ok(())
}
