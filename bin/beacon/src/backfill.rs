use std::sync::Arc;

use anyhow::Result;
use beacon_core::{
    batch::BatchCoordinator, ingestor::IngestConfig, metrics::IngestMetrics, storage::IngestStore,
};
use clap::Parser;
use log::{info, warn};
use tokio_util::sync::CancellationToken;

use crate::args::BeaconArgs;

#[derive(Debug, Parser)]
pub struct Backfill {
    #[clap(flatten)]
    options: BeaconArgs,
    /// First block of the range, inclusive.
    #[clap(long)]
    from: u64,
    /// Last block of the range, inclusive.
    #[clap(long)]
    to: u64,
}

impl Backfill {
    pub async fn run(self) -> Result<()> {
        self.options.init_logging()?;

        if self.from == 0 || self.from > self.to {
            anyhow::bail!("invalid range #{}..=#{}", self.from, self.to);
        }

        let store = Arc::new(self.options.open_store().await?);
        let source = Arc::new(self.options.block_source()?);
        let metrics = Arc::new(IngestMetrics::new()?);
        let config = IngestConfig::from(&self.options);

        let cancellation = CancellationToken::new();
        let coordinator = BatchCoordinator::new(source, store.clone(), metrics)
            .batch_size(config.batch_size)
            .workers(config.workers)
            .strictness(config.strictness)
            .cancellation(cancellation.clone());

        tokio::spawn({
            let cancellation = cancellation.clone();
            async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted, finishing blocks in flight");
                    cancellation.cancel();
                }
            }
        });

        let total = self.to - self.from + 1;
        let committed = coordinator.run(self.from, self.to).await;
        info!(
            "Backfilled {} of {} blocks in #{}..=#{}, watermark at #{}",
            committed,
            total,
            self.from,
            self.to,
            store.watermark().await?
        );

        if committed < total && !cancellation.is_cancelled() {
            anyhow::bail!(
                "{} blocks could not be ingested, see the log for their heights",
                total - committed
            );
        }
        Ok(())
    }
}
