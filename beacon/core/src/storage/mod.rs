use std::future::Future;

use crate::{
    errors::Error,
    types::{NormalizedRecord, SequenceUnit},
};

mod in_memory;
pub use in_memory::InMemoryStore;

mod sql_lite;
pub use sql_lite::SqliteStore;

/// Durable home of normalized records and of the ingestion progress watermark.
///
/// Every write is idempotent: storing the same record twice leaves the same state behind, and the
/// watermark only ever moves forward.
pub trait IngestStore: Send + Sync {
    /// Creates missing tables, columns and indexes. Safe to call on every startup.
    fn ensure_schema(&self) -> impl Future<Output = Result<(), Error>> + Send;

    /// Inserts or updates every row of `record`, all or nothing.
    fn upsert(&self, record: &NormalizedRecord) -> impl Future<Output = Result<(), Error>> + Send;

    /// Advances the watermark to `unit` unless it is already at or past it.
    fn commit(&self, unit: SequenceUnit) -> impl Future<Output = Result<(), Error>> + Send;

    /// Highest fully committed unit, `0` when nothing has been ingested yet.
    fn watermark(&self) -> impl Future<Output = Result<SequenceUnit, Error>> + Send;

    /// Stores `record` and advances the watermark to its height.
    ///
    /// Backends that support it do both in a single transaction.
    fn persist(&self, record: &NormalizedRecord) -> impl Future<Output = Result<(), Error>> + Send {
        async move {
            self.upsert(record).await?;
            self.commit(record.height()).await
        }
    }
}
