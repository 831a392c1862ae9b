use std::sync::Arc;

use anyhow::Result;
use beacon_core::{ingestor::PollingIngestorBuilder, metrics::IngestMetrics, service::Daemon};
use clap::Parser;
use log::{debug, info};

use crate::args::BeaconArgs;

#[derive(Debug, Parser)]
pub struct Run {
    #[clap(flatten)]
    options: BeaconArgs,
}

impl Run {
    pub async fn run(self) -> Result<()> {
        self.options.init_logging()?;

        let store = Arc::new(self.options.open_store().await?);
        let source = Arc::new(self.options.block_source()?);
        let metrics = Arc::new(IngestMetrics::new()?);

        let ingestor = PollingIngestorBuilder::new(source, store)
            .config((&self.options).into())
            .metrics(metrics.clone())
            .build()?;
        let ingestor_shutdown = ingestor.shutdown_handle();
        ingestor.start();
        info!(
            "Ingesting from {} RPC endpoint(s)",
            self.options.rpc_urls.len()
        );

        let mut sigterm_handle =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        let ctrl_c_handle = tokio::signal::ctrl_c();

        tokio::select! {
            _ = sigterm_handle.recv() => {},
            _ = ctrl_c_handle => {},
            _ = ingestor_shutdown.finished() => {},
        }

        // Graceful shutdown: the block being stored is allowed to finish.
        ingestor_shutdown.shutdown();
        ingestor_shutdown.finished().await;

        info!("Committed {} blocks", metrics.committed_count());
        debug!("Final metrics:\n{}", metrics.render()?);

        match ingestor_shutdown.failure() {
            Some(reason) => Err(anyhow::anyhow!("ingestion stopped: {}", reason)),
            None => Ok(()),
        }
    }
}
