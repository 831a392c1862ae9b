use std::{sync::Arc, time::Duration};

use anyhow::Result;
use log::{debug, error, info, trace, warn};
use tokio::time::sleep;

use crate::{
    batch::BatchCoordinator,
    block_source::BlockSource,
    metrics::IngestMetrics,
    service::{Daemon, FinishHandle, ShutdownHandle},
    storage::IngestStore,
    transform::Strictness,
    types::SequenceUnit,
};

/// Tunables of the ingestion pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestConfig {
    /// Units per sub-range handed to a worker.
    pub batch_size: u64,
    /// Sub-ranges processed concurrently.
    pub workers: usize,
    /// Wait between checks for new blocks once caught up.
    pub poll_interval: Duration,
    /// First height to ingest into an empty store.
    pub start_height: SequenceUnit,
    /// Consecutive failed chain height lookups after which the ingestor gives up.
    pub max_height_failures: u32,
    pub strictness: Strictness,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            workers: 5,
            poll_interval: Duration::from_secs(5),
            start_height: 1,
            max_height_failures: 10,
            strictness: Strictness::Lenient,
        }
    }
}

/// What a single polling cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cycle {
    /// Nothing pending.
    Idle,
    /// Ingested a pending range.
    CatchingUp { committed: u64 },
    /// Could not plan a range.
    Stalled,
}

/// Follows the chain tip, ingesting every block between the stored watermark and the latest
/// height reported by the chain.
#[derive(Debug)]
pub struct PollingIngestor<S, D> {
    source: Arc<S>,
    store: Arc<D>,
    coordinator: BatchCoordinator<S, D>,
    metrics: Arc<IngestMetrics>,
    poll_interval: Duration,
    start_height: SequenceUnit,
    max_height_failures: u32,
    height_failures: u32,
    finish_handle: FinishHandle,
}

#[derive(Debug)]
pub struct PollingIngestorBuilder<S, D> {
    source: Arc<S>,
    store: Arc<D>,
    config: IngestConfig,
    metrics: Option<Arc<IngestMetrics>>,
}

impl<S, D> PollingIngestor<S, D>
where
    S: BlockSource + 'static,
    D: IngestStore + 'static,
{
    pub fn metrics(&self) -> Arc<IngestMetrics> {
        self.metrics.clone()
    }

    /// First unit not yet covered by the watermark, never below the configured start height.
    fn next_unit(&self, watermark: SequenceUnit) -> SequenceUnit {
        watermark.saturating_add(1).max(self.start_height)
    }

    async fn cycle(&mut self) -> Cycle {
        let latest = match self.source.latest_height().await {
            Ok(latest) => {
                self.height_failures = 0;
                latest
            }
            Err(err) => {
                self.height_failures += 1;
                warn!(
                    "Failed to fetch latest block height ({}/{}, {}): {}",
                    self.height_failures,
                    self.max_height_failures,
                    err.kind(),
                    err
                );
                return Cycle::Stalled;
            }
        };
        self.metrics.set_chain_height(latest);

        let watermark = match self.store.watermark().await {
            Ok(watermark) => watermark,
            Err(err) => {
                error!("Failed to read ingestion progress ({}): {}", err.kind(), err);
                return Cycle::Stalled;
            }
        };
        self.metrics.set_watermark(watermark);

        let start = self.next_unit(watermark);
        if start > latest {
            trace!("Block #{} is not available yet", start);
            return Cycle::Idle;
        }

        info!("Catching up blocks #{}..=#{}", start, latest);
        let committed = self.coordinator.run(start, latest).await;

        match self.store.watermark().await {
            Ok(watermark) => {
                self.metrics.set_watermark(watermark);
                info!(
                    "Committed {} of {} blocks, watermark at #{}",
                    committed,
                    latest - start + 1,
                    watermark
                );
            }
            Err(err) => warn!("Failed to read ingestion progress: {}", err),
        }

        Cycle::CatchingUp { committed }
    }

    /// Polls until shutdown is requested or the latest height stays unavailable for
    /// `max_height_failures` cycles.
    ///
    /// A catch-up pass that committed at least one block loops straight into the next cycle.
    /// Every other cycle, including a catch-up pass that committed nothing, waits `poll_interval`
    /// first, so a block failing on every attempt does not turn the loop into a busy retry.
    async fn run(mut self) {
        while !self.finish_handle.is_shutdown_requested() {
            let cycle = self.cycle().await;

            if self.max_height_failures > 0 && self.height_failures >= self.max_height_failures {
                error!(
                    "Latest block height unavailable for {} consecutive cycles, giving up",
                    self.height_failures
                );
                self.finish_handle.fail(format!(
                    "latest block height unavailable for {} consecutive cycles",
                    self.height_failures
                ));
                return;
            }

            if matches!(cycle, Cycle::CatchingUp { committed } if committed > 0) {
                continue;
            }

            tokio::select! {
                _ = self.finish_handle.shutdown_requested() => break,
                _ = sleep(self.poll_interval) => {},
            }
        }

        debug!("Graceful shutdown finished");
        self.finish_handle.finish();
    }
}

impl<S, D> PollingIngestorBuilder<S, D>
where
    S: BlockSource + 'static,
    D: IngestStore + 'static,
{
    pub fn new(source: Arc<S>, store: Arc<D>) -> Self {
        Self {
            source,
            store,
            config: IngestConfig::default(),
            metrics: None,
        }
    }

    pub fn config(mut self, config: IngestConfig) -> Self {
        self.config = config;
        self
    }

    pub fn metrics(mut self, metrics: Arc<IngestMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> Result<PollingIngestor<S, D>> {
        if self.config.start_height == 0 {
            anyhow::bail!("`start_height` must be at least 1");
        }

        let metrics = match self.metrics {
            Some(metrics) => metrics,
            None => Arc::new(IngestMetrics::new()?),
        };
        let finish_handle = FinishHandle::new();

        let coordinator =
            BatchCoordinator::new(self.source.clone(), self.store.clone(), metrics.clone())
                .batch_size(self.config.batch_size)
                .workers(self.config.workers)
                .strictness(self.config.strictness)
                .cancellation(finish_handle.cancellation_token());

        Ok(PollingIngestor {
            source: self.source,
            store: self.store,
            coordinator,
            metrics,
            poll_interval: self.config.poll_interval,
            start_height: self.config.start_height,
            max_height_failures: self.config.max_height_failures,
            height_failures: 0,
            finish_handle,
        })
    }
}

impl<S, D> Daemon for PollingIngestor<S, D>
where
    S: BlockSource + 'static,
    D: IngestStore + 'static,
{
    fn shutdown_handle(&self) -> ShutdownHandle {
        self.finish_handle.shutdown_handle()
    }

    fn start(self) {
        tokio::spawn(self.run());
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::timeout;

    use super::*;
    use crate::{storage::InMemoryStore, test_utils::ScriptedSource};

    const WAIT: Duration = Duration::from_secs(5);

    fn config() -> IngestConfig {
        IngestConfig {
            batch_size: 10,
            workers: 3,
            poll_interval: Duration::from_millis(10),
            ..Default::default()
        }
    }

    async fn wait_for_watermark(store: &InMemoryStore, target: SequenceUnit) {
        timeout(WAIT, async {
            while store.watermark().await.unwrap() < target {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("watermark did not reach target in time");
    }

    #[tokio::test]
    async fn test_follows_the_chain_tip() {
        let source = Arc::new(ScriptedSource::new(35));
        let store = Arc::new(InMemoryStore::new());
        let ingestor = PollingIngestorBuilder::new(source.clone(), store.clone())
            .config(config())
            .build()
            .unwrap();
        let metrics = ingestor.metrics();
        let handle = ingestor.shutdown_handle();
        ingestor.start();

        wait_for_watermark(&store, 35).await;
        source.set_tip(52);
        wait_for_watermark(&store, 52).await;

        handle.shutdown();
        timeout(WAIT, handle.finished()).await.unwrap();
        assert!(handle.failure().is_none());
        assert_eq!(store.heights(), (1..=52).collect::<Vec<_>>());
        assert_eq!(metrics.committed_count(), 52);
    }

    #[tokio::test]
    async fn test_resumes_after_stored_watermark() {
        let source = Arc::new(ScriptedSource::new(100));
        let store = Arc::new(InMemoryStore::with_watermark(57));
        let ingestor = PollingIngestorBuilder::new(source.clone(), store.clone())
            .config(config())
            .build()
            .unwrap();
        let handle = ingestor.shutdown_handle();
        ingestor.start();

        wait_for_watermark(&store, 100).await;
        handle.shutdown();
        timeout(WAIT, handle.finished()).await.unwrap();

        assert_eq!(store.heights(), (58..=100).collect::<Vec<_>>());
        assert_eq!(source.fetch_count(57), 0);
    }

    #[tokio::test]
    async fn test_honours_start_height() {
        let source = Arc::new(ScriptedSource::new(60));
        let store = Arc::new(InMemoryStore::new());
        let ingestor = PollingIngestorBuilder::new(source.clone(), store.clone())
            .config(IngestConfig {
                start_height: 50,
                ..config()
            })
            .build()
            .unwrap();
        let handle = ingestor.shutdown_handle();
        ingestor.start();

        wait_for_watermark(&store, 60).await;
        handle.shutdown();
        timeout(WAIT, handle.finished()).await.unwrap();

        assert_eq!(store.heights(), (50..=60).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_gives_up_when_chain_height_stays_unavailable() {
        let source = Arc::new(ScriptedSource::new(10));
        source.set_tip_unreachable(true);
        let store = Arc::new(InMemoryStore::new());
        let ingestor = PollingIngestorBuilder::new(source, store.clone())
            .config(IngestConfig {
                max_height_failures: 3,
                ..config()
            })
            .build()
            .unwrap();
        let handle = ingestor.shutdown_handle();
        ingestor.start();

        timeout(WAIT, handle.finished()).await.unwrap();
        assert!(handle.failure().is_some());
        assert!(store.heights().is_empty());
    }

    #[tokio::test]
    async fn test_recovers_from_transient_height_failures() {
        let source = Arc::new(ScriptedSource::new(5));
        source.set_tip_unreachable(true);
        let store = Arc::new(InMemoryStore::new());
        let ingestor = PollingIngestorBuilder::new(source.clone(), store.clone())
            .config(IngestConfig {
                max_height_failures: 1_000,
                ..config()
            })
            .build()
            .unwrap();
        let handle = ingestor.shutdown_handle();
        ingestor.start();

        sleep(Duration::from_millis(50)).await;
        source.set_tip_unreachable(false);
        wait_for_watermark(&store, 5).await;

        handle.shutdown();
        timeout(WAIT, handle.finished()).await.unwrap();
        assert!(handle.failure().is_none());
    }

    #[tokio::test]
    async fn test_shutdown_while_idle() {
        let source = Arc::new(ScriptedSource::new(0));
        let store = Arc::new(InMemoryStore::new());
        let ingestor = PollingIngestorBuilder::new(source, store)
            .config(IngestConfig {
                poll_interval: Duration::from_secs(3600),
                ..config()
            })
            .build()
            .unwrap();
        let handle = ingestor.shutdown_handle();
        ingestor.start();

        sleep(Duration::from_millis(20)).await;
        handle.shutdown();
        timeout(WAIT, handle.finished()).await.unwrap();
    }

    #[tokio::test]
    async fn test_fruitless_catch_up_waits_for_the_next_poll() {
        let source = Arc::new(ScriptedSource::new(1).failing_at(1));
        let store = Arc::new(InMemoryStore::new());
        let ingestor = PollingIngestorBuilder::new(source.clone(), store.clone())
            .config(IngestConfig {
                poll_interval: Duration::from_secs(3600),
                ..config()
            })
            .build()
            .unwrap();
        let handle = ingestor.shutdown_handle();
        ingestor.start();

        sleep(Duration::from_millis(50)).await;
        handle.shutdown();
        timeout(WAIT, handle.finished()).await.unwrap();

        assert_eq!(source.fetch_count(1), 1);
        assert!(store.heights().is_empty());
    }

    #[test]
    fn test_rejects_zero_start_height() {
        let result = PollingIngestorBuilder::new(
            Arc::new(ScriptedSource::new(1)),
            Arc::new(InMemoryStore::new()),
        )
        .config(IngestConfig {
            start_height: 0,
            ..Default::default()
        })
        .build();
        assert!(result.is_err());
    }
}
