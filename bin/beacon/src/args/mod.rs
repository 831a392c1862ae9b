//! Beacon binary options.
use std::time::Duration;

use anyhow::Result;
use beacon_core::{
    block_source::{HttpBlockSource, HttpBlockSourceConfig},
    ingestor::IngestConfig,
    storage::{IngestStore, SqliteStore},
    transform::Strictness,
    utils::RetryPolicy,
};
use clap::Args;
use log::info;
use url::Url;

#[derive(Debug, Args)]
pub struct BeaconArgs {
    /// CometBFT RPC endpoints. The first one is preferred, the others are fallbacks.
    #[arg(long = "rpc-url", env = "BEACON_RPC_URL")]
    #[arg(value_name = "URL", value_delimiter = ',', required = true)]
    pub rpc_urls: Vec<Url>,

    /// Path to the SQLite database file.
    #[arg(long, env = "BEACON_DB_PATH", default_value = "beacon.db")]
    pub db_path: String,

    /// Maximum number of open database connections.
    #[arg(long, env = "BEACON_POOL_SIZE", default_value_t = 10)]
    pub pool_size: u32,

    /// Number of blocks per sub-range handed to a worker.
    #[arg(long, env = "BEACON_BATCH_SIZE", default_value_t = 100)]
    #[arg(value_parser = clap::value_parser!(u64).range(1..))]
    pub batch_size: u64,

    /// Number of sub-ranges ingested concurrently.
    #[arg(long, env = "BEACON_WORKERS", default_value_t = 5)]
    pub workers: usize,

    /// Seconds to wait between checks for new blocks once caught up.
    #[arg(long, env = "BEACON_POLL_INTERVAL_SECS", default_value_t = 5)]
    pub poll_interval_secs: u64,

    /// Per-request timeout for RPC calls, in seconds.
    #[arg(long, env = "BEACON_REQUEST_TIMEOUT_SECS", default_value_t = 10)]
    pub request_timeout_secs: u64,

    /// Page size of the validator set query.
    #[arg(long, env = "BEACON_VALIDATORS_PER_PAGE", default_value_t = 100)]
    pub validators_per_page: u32,

    /// Attempts per RPC request and endpoint before moving on.
    #[arg(long, env = "BEACON_MAX_RETRIES", default_value_t = 3)]
    pub max_retries: u32,

    /// First block to ingest into an empty database.
    #[arg(long, env = "BEACON_START_HEIGHT", default_value_t = 1)]
    #[arg(value_parser = clap::value_parser!(u64).range(1..))]
    pub start_height: u64,

    /// Consecutive failed chain height lookups after which the process exits.
    #[arg(long, env = "BEACON_MAX_HEIGHT_FAILURES", default_value_t = 10)]
    pub max_height_failures: u32,

    /// Reject blocks without a header instead of storing defaults.
    #[arg(long, env = "BEACON_STRICT")]
    pub strict: bool,

    /// Enable JSON logging.
    #[arg(long)]
    #[arg(help = "Output logs in JSON format.")]
    pub json_log: bool,
}

impl BeaconArgs {
    pub fn init_logging(&self) -> Result<(), beacon_tracing::Error> {
        beacon_tracing::init_logging(self.json_log)
    }

    pub fn block_source(&self) -> Result<HttpBlockSource> {
        HttpBlockSource::new(self.into())
    }

    /// Opens the database and brings its schema up to date.
    pub async fn open_store(&self) -> Result<SqliteStore> {
        let store = SqliteStore::open(&self.db_path, self.pool_size).await?;
        store.ensure_schema().await?;
        info!("Using database at {}", self.db_path);
        Ok(store)
    }

    fn strictness(&self) -> Strictness {
        if self.strict {
            Strictness::Strict
        } else {
            Strictness::Lenient
        }
    }
}

impl From<&BeaconArgs> for HttpBlockSourceConfig {
    fn from(args: &BeaconArgs) -> Self {
        let mut config = HttpBlockSourceConfig::new(args.rpc_urls.clone());
        config.request_timeout = Duration::from_secs(args.request_timeout_secs);
        config.validators_per_page = args.validators_per_page;
        config.retry = RetryPolicy {
            max_attempts: args.max_retries.max(1),
            ..RetryPolicy::default()
        };
        config
    }
}

impl From<&BeaconArgs> for IngestConfig {
    fn from(args: &BeaconArgs) -> Self {
        IngestConfig {
            batch_size: args.batch_size,
            workers: args.workers,
            poll_interval: Duration::from_secs(args.poll_interval_secs),
            start_height: args.start_height,
            max_height_failures: args.max_height_failures,
            strictness: args.strictness(),
        }
    }
}
