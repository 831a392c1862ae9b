use std::{ops::RangeInclusive, sync::Arc};

use futures_util::future::join_all;
use log::{debug, error, trace};
use tokio::{
    sync::{mpsc, Mutex},
    task,
};
use tokio_util::sync::CancellationToken;

use crate::{
    block_source::{fetch_unit, BlockSource},
    errors::Error,
    metrics::IngestMetrics,
    storage::IngestStore,
    transform::{transform_with, Strictness},
    types::{Fetched, SequenceUnit},
};

const DEFAULT_BATCH_SIZE: u64 = 100;
const DEFAULT_WORKER_COUNT: usize = 5;

/// Splits `[start, end]` into contiguous sub-ranges of at most `size` units.
pub fn sub_ranges(
    start: SequenceUnit,
    end: SequenceUnit,
    size: u64,
) -> Vec<RangeInclusive<SequenceUnit>> {
    let size = size.max(1);
    let mut ranges = Vec::new();
    let mut first = start;
    while first <= end {
        let last = first.saturating_add(size - 1).min(end);
        ranges.push(first..=last);
        if last == SequenceUnit::MAX {
            break;
        }
        first = last + 1;
    }
    ranges
}

/// Result of processing a single unit that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnitOutcome {
    Committed,
    Absent,
}

/// Ingests explicit height ranges over a bounded pool of workers.
///
/// Each worker takes one sub-range at a time and walks it in increasing order, storing every block
/// in its own transaction. A failed block is logged and skipped; a block the chain has not produced
/// yet ends the sub-range, since every later height is missing as well.
#[derive(Debug)]
pub struct BatchCoordinator<S, D> {
    source: Arc<S>,
    store: Arc<D>,
    metrics: Arc<IngestMetrics>,
    batch_size: u64,
    workers: usize,
    strictness: Strictness,
    cancellation: CancellationToken,
}

impl<S, D> Clone for BatchCoordinator<S, D> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            store: self.store.clone(),
            metrics: self.metrics.clone(),
            batch_size: self.batch_size,
            workers: self.workers,
            strictness: self.strictness,
            cancellation: self.cancellation.clone(),
        }
    }
}

impl<S, D> BatchCoordinator<S, D>
where
    S: BlockSource + 'static,
    D: IngestStore + 'static,
{
    pub fn new(source: Arc<S>, store: Arc<D>, metrics: Arc<IngestMetrics>) -> Self {
        Self {
            source,
            store,
            metrics,
            batch_size: DEFAULT_BATCH_SIZE,
            workers: DEFAULT_WORKER_COUNT,
            strictness: Strictness::default(),
            cancellation: CancellationToken::new(),
        }
    }

    pub fn batch_size(mut self, batch_size: u64) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn strictness(mut self, strictness: Strictness) -> Self {
        self.strictness = strictness;
        self
    }

    /// Workers stop before starting their next unit once `token` is cancelled.
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Ingests every unit in `[start, end]` and returns how many were committed.
    pub async fn run(&self, start: SequenceUnit, end: SequenceUnit) -> u64 {
        let ranges = sub_ranges(start, end, self.batch_size);
        if ranges.is_empty() {
            return 0;
        }
        debug!(
            "Ingesting blocks #{}..=#{} in {} sub-ranges",
            start,
            end,
            ranges.len()
        );

        let (task_tx, task_rx) = mpsc::channel(ranges.len());
        let task_rx = Arc::new(Mutex::new(task_rx));

        let mut workers = Vec::new();
        for _ in 0..self.workers.min(ranges.len()) {
            workers.push(task::spawn(self.clone().worker(task_rx.clone())));
        }

        for range in ranges {
            if task_tx.send(range).await.is_err() {
                break;
            }
        }
        drop(task_tx);

        let mut committed = 0;
        for result in join_all(workers).await {
            match result {
                Ok(count) => committed += count,
                Err(err) => error!("Ingestion worker terminated abnormally: {}", err),
            }
        }
        committed
    }

    async fn worker(self, task_rx: Arc<Mutex<mpsc::Receiver<RangeInclusive<SequenceUnit>>>>) -> u64 {
        let mut committed = 0;
        loop {
            let range = if let Some(range) = task_rx.lock().await.recv().await {
                range
            } else {
                break;
            };

            if self.cancellation.is_cancelled() {
                break;
            }

            committed += self.process_range(range).await;
            self.metrics.batch_processed();
        }
        committed
    }

    async fn process_range(&self, range: RangeInclusive<SequenceUnit>) -> u64 {
        let mut committed = 0;
        for height in range {
            if self.cancellation.is_cancelled() {
                debug!("Stopping before block #{}: shutdown requested", height);
                break;
            }

            match self.process_unit(height).await {
                Ok(UnitOutcome::Committed) => {
                    trace!("Block #{} committed", height);
                    self.metrics.unit_committed();
                    committed += 1;
                }
                Ok(UnitOutcome::Absent) => {
                    trace!("Block #{} not produced yet, ending sub-range", height);
                    self.metrics.unit_absent();
                    break;
                }
                Err(err) => {
                    error!(
                        "Failed to ingest block #{} ({}): {}",
                        height,
                        err.kind(),
                        err
                    );
                    self.metrics.unit_failed(err.kind());
                }
            }
        }
        committed
    }

    async fn process_unit(&self, height: SequenceUnit) -> Result<UnitOutcome, Error> {
        let payload = match fetch_unit(self.source.as_ref(), height).await? {
            Fetched::Produced(payload) => payload,
            Fetched::Absent => return Ok(UnitOutcome::Absent),
        };

        let record = transform_with(&payload, self.strictness)?;
        self.store.persist(&record).await?;
        Ok(UnitOutcome::Committed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        errors::ErrorKind,
        storage::InMemoryStore,
        test_utils::ScriptedSource,
    };

    fn coordinator(
        source: ScriptedSource,
        store: Arc<InMemoryStore>,
    ) -> (BatchCoordinator<ScriptedSource, InMemoryStore>, Arc<IngestMetrics>) {
        let metrics = Arc::new(IngestMetrics::new().unwrap());
        let coordinator = BatchCoordinator::new(Arc::new(source), store, metrics.clone())
            .batch_size(10)
            .workers(4);
        (coordinator, metrics)
    }

    #[test]
    fn test_sub_ranges_cover_the_range() {
        assert_eq!(sub_ranges(1, 25, 10), vec![1..=10, 11..=20, 21..=25]);
        assert_eq!(sub_ranges(5, 5, 10), vec![5..=5]);
        assert!(sub_ranges(6, 5, 10).is_empty());
        assert_eq!(sub_ranges(1, 3, 0), vec![1..=1, 2..=2, 3..=3]);
    }

    #[tokio::test]
    async fn test_failed_unit_does_not_abort_its_sub_range() {
        let store = Arc::new(InMemoryStore::new());
        let (coordinator, metrics) =
            coordinator(ScriptedSource::new(100).malformed_at(42), store.clone());

        let committed = coordinator.run(41, 50).await;

        assert_eq!(committed, 9);
        assert_eq!(store.heights(), vec![41, 43, 44, 45, 46, 47, 48, 49, 50]);
        assert_eq!(store.watermark().await.unwrap(), 50);
        assert_eq!(metrics.failed_count(ErrorKind::Malformed), 1);
    }

    #[tokio::test]
    async fn test_transport_failure_is_skipped() {
        let store = Arc::new(InMemoryStore::new());
        let (coordinator, metrics) =
            coordinator(ScriptedSource::new(20).failing_at(5), store.clone());

        assert_eq!(coordinator.run(1, 10).await, 9);
        assert!(store.record(5).is_none());
        assert_eq!(metrics.failed_count(ErrorKind::Transport), 1);
    }

    #[tokio::test]
    async fn test_missing_validator_set_degrades_voting_power() {
        let store = Arc::new(InMemoryStore::new());
        let source = ScriptedSource::new(10)
            .validators_failing_at(3)
            .validators_missing_at(4);
        let (coordinator, metrics) = coordinator(source, store.clone());

        assert_eq!(coordinator.run(1, 10).await, 10);
        assert_eq!(metrics.committed_count(), 10);

        for height in [3, 4] {
            let record = store.record(height).unwrap();
            assert_eq!(record.block.total_voting_power, 0);
            assert_eq!(record.block.proposer_priority, 0);
            assert!(record.validator_set.is_empty());
            assert!(record.signatures.iter().all(|sig| sig.voting_power == 0));
            assert_eq!(record.block.valid_signatures, 1);
        }
        let healthy = store.record(5).unwrap();
        assert_eq!(healthy.block.total_voting_power, 10);
        assert_eq!(healthy.validator_set.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_sub_ranges_commit_everything() {
        let store = Arc::new(InMemoryStore::new());
        let (coordinator, metrics) = coordinator(ScriptedSource::new(100), store.clone());

        assert_eq!(coordinator.run(1, 100).await, 100);
        assert_eq!(store.heights(), (1..=100).collect::<Vec<_>>());
        assert_eq!(store.watermark().await.unwrap(), 100);
        assert_eq!(metrics.committed_count(), 100);
    }

    #[tokio::test]
    async fn test_absent_unit_ends_the_sub_range() {
        let store = Arc::new(InMemoryStore::new());
        let source = ScriptedSource::new(15);
        let metrics = Arc::new(IngestMetrics::new().unwrap());
        let source = Arc::new(source);
        let coordinator = BatchCoordinator::new(source.clone(), store.clone(), metrics)
            .batch_size(10)
            .workers(2);

        assert_eq!(coordinator.run(1, 30).await, 15);
        assert_eq!(store.watermark().await.unwrap(), 15);
        assert_eq!(source.fetch_count(16), 1);
        assert_eq!(source.fetch_count(17), 0);
        assert_eq!(source.fetch_count(21), 1);
        assert_eq!(source.fetch_count(22), 0);
    }

    #[tokio::test]
    async fn test_resumed_run_matches_uninterrupted_run() {
        let interrupted = Arc::new(InMemoryStore::new());
        let (first, _) = coordinator(ScriptedSource::new(100), interrupted.clone());
        assert_eq!(first.run(1, 57).await, 57);

        let resume_from = interrupted.watermark().await.unwrap() + 1;
        assert_eq!(resume_from, 58);
        let (second, _) = coordinator(ScriptedSource::new(100), interrupted.clone());
        assert_eq!(second.run(resume_from, 100).await, 43);

        let uninterrupted = Arc::new(InMemoryStore::new());
        let (full, _) = coordinator(ScriptedSource::new(100), uninterrupted.clone());
        assert_eq!(full.run(1, 100).await, 100);

        assert_eq!(interrupted.heights(), uninterrupted.heights());
        for height in 1..=100 {
            assert_eq!(interrupted.record(height), uninterrupted.record(height));
        }
        assert_eq!(
            interrupted.watermark().await.unwrap(),
            uninterrupted.watermark().await.unwrap()
        );
    }

    #[tokio::test]
    async fn test_cancelled_run_commits_nothing() {
        let store = Arc::new(InMemoryStore::new());
        let token = CancellationToken::new();
        token.cancel();
        let (coordinator, _) = coordinator(ScriptedSource::new(100), store.clone());

        assert_eq!(coordinator.cancellation(token).run(1, 50).await, 0);
        assert!(store.heights().is_empty());
    }
}
