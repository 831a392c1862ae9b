//! Logging initialization for Beacon binaries.
//!
//! Library crates log through the `log` facade; [`init_logging`] forwards those records into a
//! `tracing` subscriber.

use tracing::Subscriber;
use tracing_log::LogTracer;
use tracing_subscriber::{filter::ParseError, fmt, fmt::time::ChronoUtc, EnvFilter};

/// Filter used when `RUST_LOG` is not set.
pub const DEFAULT_LOG_FILTER: &str = "info,beacon=debug,beacon_core=debug,sqlx=warn";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to install the log bridge: {0}")]
    LogTracer(#[from] tracing_log::log::SetLoggerError),
    #[error("invalid log filter: {0}")]
    Filter(#[from] ParseError),
    #[error("failed to install the global subscriber: {0}")]
    Subscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// The filter from `RUST_LOG`, or [`DEFAULT_LOG_FILTER`] when it is unset or invalid.
pub fn env_filter() -> Result<EnvFilter, Error> {
    Ok(EnvFilter::try_from_default_env().or(EnvFilter::try_new(DEFAULT_LOG_FILTER))?)
}

/// Installs the global subscriber. Must be called at most once per process.
pub fn init_logging(json: bool) -> Result<(), Error> {
    LogTracer::init()?;

    let builder = fmt::Subscriber::builder()
        .with_timer(ChronoUtc::rfc_3339())
        .with_env_filter(env_filter()?);

    let subscriber: Box<dyn Subscriber + Send + Sync> = if json {
        Box::new(builder.json().finish())
    } else {
        Box::new(builder.finish())
    };

    Ok(tracing::subscriber::set_global_default(subscriber)?)
}
