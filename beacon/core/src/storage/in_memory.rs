use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, PoisonError,
    },
};

use crate::{
    errors::Error,
    storage::IngestStore,
    types::{NormalizedRecord, SequenceUnit},
};

/// An entirely in-memory store useful for development and testing purposes.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    records: Mutex<BTreeMap<SequenceUnit, NormalizedRecord>>,
    watermark: AtomicU64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts from an already advanced watermark, as if units up to `unit` were ingested earlier.
    pub fn with_watermark(unit: SequenceUnit) -> Self {
        Self {
            records: Default::default(),
            watermark: AtomicU64::new(unit),
        }
    }

    pub fn record(&self, unit: SequenceUnit) -> Option<NormalizedRecord> {
        self.lock().get(&unit).cloned()
    }

    /// Heights of every stored record, in increasing order.
    pub fn heights(&self) -> Vec<SequenceUnit> {
        self.lock().keys().copied().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<SequenceUnit, NormalizedRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl IngestStore for InMemoryStore {
    async fn ensure_schema(&self) -> Result<(), Error> {
        Ok(())
    }

    async fn upsert(&self, record: &NormalizedRecord) -> Result<(), Error> {
        self.lock().insert(record.height(), record.clone());
        Ok(())
    }

    async fn commit(&self, unit: SequenceUnit) -> Result<(), Error> {
        self.watermark.fetch_max(unit, Ordering::SeqCst);
        Ok(())
    }

    async fn watermark(&self) -> Result<SequenceUnit, Error> {
        Ok(self.watermark.load(Ordering::SeqCst))
    }
}
