use std::{path::Path, str::FromStr, time::Duration};

use log::trace;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    Pool, Sqlite,
};

use crate::errors::Error;

mod schema;
mod storage;


const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite-backed [`IngestStore`](crate::storage::IngestStore).
///
/// Every connection is taken from the pool for the duration of one unit's transaction only.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pub(crate) pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Opens (creating if needed) the database file at `path`.
    pub async fn open(path: &str, pool_size: u32) -> Result<Self, Error> {
        if Path::new(path).exists() {
            trace!("Database file found at: {}", path);
        } else {
            trace!(
                "Database file not found. A new one will be created at: {}",
                path
            );
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(pool_size.max(1))
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    /// A private in-memory database living as long as the returned store.
    pub async fn in_memory() -> Result<Self, Error> {
        // Every connection to `:memory:` is a distinct database, so the pool must never replace
        // its single connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}
