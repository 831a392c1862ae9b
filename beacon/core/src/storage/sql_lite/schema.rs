use std::collections::HashSet;

use log::{debug, trace};
use sqlx::{query, Pool, Row, Sqlite};

use crate::errors::Error;

pub(crate) struct Column {
    pub name: &'static str,
    /// Type and constraints. Must be valid for `ALTER TABLE ... ADD COLUMN`, so every `NOT NULL`
    /// column carries a default.
    pub decl: &'static str,
    /// Statement filling the column for rows that predate it, run right after it is added.
    pub backfill: Option<&'static str>,
}

const fn col(name: &'static str, decl: &'static str) -> Column {
    Column {
        name,
        decl,
        backfill: None,
    }
}

/// A position column. Rows from an older schema are numbered by insertion order within their
/// height, so the unique `(height, position)` index can be built over them.
const fn position(name: &'static str, backfill: &'static str) -> Column {
    Column {
        name,
        decl: "INTEGER NOT NULL DEFAULT 0",
        backfill: Some(backfill),
    }
}

pub(crate) struct TableDef {
    pub name: &'static str,
    /// Primary key definition, only used when the table is created.
    pub key: &'static str,
    pub columns: &'static [Column],
    /// Columns identifying a row for upserts.
    pub conflict: &'static [&'static str],
    pub indexes: &'static [&'static str],
}

impl TableDef {
    /// Key columns living in the primary key definition, followed by every declared column.
    pub(crate) fn insert_columns(&self) -> Vec<&'static str> {
        let declared = self.columns.iter().map(|column| column.name);
        self.conflict
            .iter()
            .copied()
            .filter(|key| !self.columns.iter().any(|column| column.name == *key))
            .chain(declared)
            .collect()
    }

    fn create_sql(&self) -> String {
        let columns = self
            .columns
            .iter()
            .map(|column| format!("{} {}", column.name, column.decl))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({}, {});",
            self.name, self.key, columns
        )
    }

    /// `INSERT ... ON CONFLICT DO UPDATE` binding [`TableDef::insert_columns`] in order.
    pub(crate) fn upsert_sql(&self) -> String {
        let names = self.insert_columns();
        let placeholders = vec!["?"; names.len()].join(", ");
        let updates = names
            .iter()
            .filter(|name| !self.conflict.contains(name))
            .map(|name| format!("{name} = excluded.{name}"))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT({}) DO UPDATE SET {};",
            self.name,
            names.join(", "),
            placeholders,
            self.conflict.join(", "),
            updates
        )
    }
}

pub(crate) const BLOCKS: TableDef = TableDef {
    name: "cosmos_blocks",
    key: "height INTEGER PRIMARY KEY",
    columns: &[
        col("hash", "TEXT NOT NULL DEFAULT ''"),
        col("time", "TEXT NOT NULL DEFAULT ''"),
        col("proposer_address", "TEXT NOT NULL DEFAULT ''"),
        col("chain_id", "TEXT NOT NULL DEFAULT ''"),
        col("num_txs", "INTEGER NOT NULL DEFAULT 0"),
        col("num_evidence", "INTEGER NOT NULL DEFAULT 0"),
        col("total_gas_wanted", "INTEGER NOT NULL DEFAULT 0"),
        col("total_gas_used", "INTEGER NOT NULL DEFAULT 0"),
        col("total_fee", "TEXT NOT NULL DEFAULT '0'"),
        col("last_commit_round", "INTEGER NOT NULL DEFAULT 0"),
        col("last_block_id", "TEXT NOT NULL DEFAULT ''"),
        col("validators_hash", "TEXT NOT NULL DEFAULT ''"),
        col("next_validators_hash", "TEXT NOT NULL DEFAULT ''"),
        col("consensus_hash", "TEXT NOT NULL DEFAULT ''"),
        col("app_hash", "TEXT NOT NULL DEFAULT ''"),
        col("last_results_hash", "TEXT NOT NULL DEFAULT ''"),
        col("evidence_hash", "TEXT NOT NULL DEFAULT ''"),
        col("last_commit_hash", "TEXT NOT NULL DEFAULT ''"),
        col("data_hash", "TEXT NOT NULL DEFAULT ''"),
        col("valid_signatures", "INTEGER NOT NULL DEFAULT 0"),
        col("total_signatures", "INTEGER NOT NULL DEFAULT 0"),
        col("version", "TEXT NOT NULL DEFAULT ''"),
        col("parts_total", "INTEGER NOT NULL DEFAULT 0"),
        col("parts_hash", "TEXT NOT NULL DEFAULT ''"),
        col("total_voting_power", "INTEGER NOT NULL DEFAULT 0"),
        col("proposer_priority", "INTEGER NOT NULL DEFAULT 0"),
    ],
    conflict: &["height"],
    indexes: &[
        "CREATE INDEX IF NOT EXISTS idx_cosmos_blocks_time ON cosmos_blocks (time);",
        "CREATE INDEX IF NOT EXISTS idx_cosmos_blocks_proposer ON cosmos_blocks (proposer_address);",
    ],
};

pub(crate) const TRANSACTIONS: TableDef = TableDef {
    name: "transactions",
    key: "hash TEXT PRIMARY KEY",
    columns: &[
        col("height", "INTEGER NOT NULL DEFAULT 0"),
        col("tx_index", "INTEGER NOT NULL DEFAULT 0"),
        col("size_bytes", "INTEGER NOT NULL DEFAULT 0"),
        col("gas_wanted", "INTEGER NOT NULL DEFAULT 0"),
        col("gas_used", "INTEGER NOT NULL DEFAULT 0"),
        col("fee", "TEXT NOT NULL DEFAULT '0'"),
        col("timestamp", "TEXT NOT NULL DEFAULT ''"),
    ],
    conflict: &["hash"],
    indexes: &["CREATE INDEX IF NOT EXISTS idx_transactions_height ON transactions (height);"],
};

pub(crate) const EVIDENCE: TableDef = TableDef {
    name: "evidence",
    key: "id INTEGER PRIMARY KEY AUTOINCREMENT",
    columns: &[
        col("height", "INTEGER NOT NULL DEFAULT 0"),
        position(
            "evidence_index",
            "UPDATE evidence SET evidence_index = (SELECT COUNT(*) FROM evidence AS earlier \
             WHERE earlier.height = evidence.height AND earlier.rowid < evidence.rowid);",
        ),
        col("evidence_type", "TEXT NOT NULL DEFAULT ''"),
        col("validator_address", "TEXT NOT NULL DEFAULT ''"),
        col("total_voting_power", "INTEGER NOT NULL DEFAULT 0"),
        col("timestamp", "TEXT NOT NULL DEFAULT ''"),
        col("raw_data", "TEXT NOT NULL DEFAULT ''"),
    ],
    conflict: &["height", "evidence_index"],
    indexes: &[
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_evidence_position ON evidence (height, evidence_index);",
    ],
};

pub(crate) const SIGNATURES: TableDef = TableDef {
    name: "signatures",
    key: "id INTEGER PRIMARY KEY AUTOINCREMENT",
    columns: &[
        col("height", "INTEGER NOT NULL DEFAULT 0"),
        position(
            "signature_index",
            "UPDATE signatures SET signature_index = (SELECT COUNT(*) FROM signatures AS earlier \
             WHERE earlier.height = signatures.height AND earlier.rowid < signatures.rowid);",
        ),
        col("validator_address", "TEXT NOT NULL DEFAULT ''"),
        col("timestamp", "TEXT NOT NULL DEFAULT ''"),
        col("signature", "TEXT NOT NULL DEFAULT ''"),
        col("block_id_flag", "INTEGER NOT NULL DEFAULT 0"),
        col("voting_power", "INTEGER NOT NULL DEFAULT 0"),
        col("proposer_priority", "INTEGER NOT NULL DEFAULT 0"),
    ],
    conflict: &["height", "signature_index"],
    indexes: &[
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_signatures_position ON signatures (height, signature_index);",
        "CREATE INDEX IF NOT EXISTS idx_signatures_validator ON signatures (validator_address);",
    ],
};

pub(crate) const VALIDATOR_SETS: TableDef = TableDef {
    name: "validator_sets",
    key: "id INTEGER PRIMARY KEY AUTOINCREMENT",
    columns: &[
        col("height", "INTEGER NOT NULL DEFAULT 0"),
        col("validator_address", "TEXT NOT NULL DEFAULT ''"),
        col("pub_key", "TEXT NOT NULL DEFAULT ''"),
        col("voting_power", "INTEGER NOT NULL DEFAULT 0"),
        col("proposer_priority", "INTEGER NOT NULL DEFAULT 0"),
    ],
    conflict: &["height", "validator_address"],
    indexes: &[
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_validator_sets_member ON validator_sets (height, validator_address);",
    ],
};

pub(crate) const PROGRESS: TableDef = TableDef {
    name: "ingestion_progress",
    key: "id INTEGER PRIMARY KEY CHECK (id = 1)",
    columns: &[
        col("last_block_processed", "INTEGER NOT NULL DEFAULT 0"),
        col("updated_at", "TEXT NOT NULL DEFAULT ''"),
    ],
    conflict: &["id"],
    indexes: &[],
};

pub(crate) const TABLES: [&TableDef; 6] = [
    &BLOCKS,
    &TRANSACTIONS,
    &EVIDENCE,
    &SIGNATURES,
    &VALIDATOR_SETS,
    &PROGRESS,
];

/// Creates every table, adds the columns and indexes an older schema lacks, and seeds the single
/// progress row.
pub(crate) async fn migrate(pool: &Pool<Sqlite>) -> Result<(), Error> {
    for table in TABLES {
        migrate_table(pool, table)
            .await
            .map_err(|err| Error::Schema(format!("table `{}`: {}", table.name, err)))?;
    }

    query(&format!(
        "INSERT OR IGNORE INTO {} (id, last_block_processed, updated_at) VALUES (1, 0, '');",
        PROGRESS.name
    ))
    .execute(pool)
    .await
    .map_err(|err| Error::Schema(format!("seeding progress row: {}", err)))?;

    Ok(())
}

async fn migrate_table(pool: &Pool<Sqlite>, table: &TableDef) -> Result<(), sqlx::Error> {
    query(&table.create_sql()).execute(pool).await?;

    let existing = existing_columns(pool, table.name).await?;
    for column in table.columns {
        if !existing.contains(column.name) {
            debug!("Adding missing column `{}.{}`", table.name, column.name);
            query(&format!(
                "ALTER TABLE {} ADD COLUMN {} {};",
                table.name, column.name, column.decl
            ))
            .execute(pool)
            .await?;

            if let Some(backfill) = column.backfill {
                let filled = query(backfill).execute(pool).await?.rows_affected();
                debug!(
                    "Numbered {} existing rows of `{}.{}`",
                    filled, table.name, column.name
                );
            }
        }
    }

    for index in table.indexes {
        query(index).execute(pool).await?;
    }

    trace!("Table `{}` is up to date", table.name);
    Ok(())
}

pub(crate) async fn existing_columns(
    pool: &Pool<Sqlite>,
    table: &str,
) -> Result<HashSet<String>, sqlx::Error> {
    let rows = query(&format!("PRAGMA table_info({});", table))
        .fetch_all(pool)
        .await?;
    rows.iter().map(|row| row.try_get::<String, _>("name")).collect()
}
