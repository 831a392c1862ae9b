use sqlx::{query, query_scalar, SqliteConnection};

use super::{
    schema::{self, TableDef, BLOCKS, EVIDENCE, PROGRESS, SIGNATURES, TRANSACTIONS, VALIDATOR_SETS},
    SqliteStore,
};
use crate::{
    errors::Error,
    storage::IngestStore,
    types::{NormalizedRecord, SequenceUnit, Timestamp},
};

impl IngestStore for SqliteStore {
    async fn ensure_schema(&self) -> Result<(), Error> {
        schema::migrate(&self.pool).await
    }

    async fn upsert(&self, record: &NormalizedRecord) -> Result<(), Error> {
        let mut tx = self.pool.begin().await?;
        write_record(&mut tx, record).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn commit(&self, unit: SequenceUnit) -> Result<(), Error> {
        let mut conn = self.pool.acquire().await?;
        advance_watermark(&mut conn, unit).await
    }

    async fn watermark(&self) -> Result<SequenceUnit, Error> {
        let stored: Option<i64> = query_scalar(&format!(
            "SELECT last_block_processed FROM {} WHERE id = 1;",
            PROGRESS.name
        ))
        .fetch_optional(&self.pool)
        .await?;

        Ok(stored.unwrap_or_default().max(0) as SequenceUnit)
    }

    async fn persist(&self, record: &NormalizedRecord) -> Result<(), Error> {
        let mut tx = self.pool.begin().await?;
        write_record(&mut tx, record).await?;
        advance_watermark(&mut tx, record.height()).await?;
        tx.commit().await?;
        Ok(())
    }
}

/// SQLite integers are signed 64-bit.
fn sql_int(unit: SequenceUnit) -> Result<i64, Error> {
    i64::try_from(unit).map_err(|err| Error::Persistence(sqlx::Error::Encode(Box::new(err))))
}

async fn advance_watermark(conn: &mut SqliteConnection, unit: SequenceUnit) -> Result<(), Error> {
    query(&format!(
        "UPDATE {} SET last_block_processed = MAX(last_block_processed, ?1), updated_at = ?2 \
         WHERE id = 1;",
        PROGRESS.name
    ))
    .bind(sql_int(unit)?)
    .bind(Timestamp::now().to_sql_string())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn write_record(conn: &mut SqliteConnection, record: &NormalizedRecord) -> Result<(), Error> {
    let height = sql_int(record.height())?;
    let block = &record.block;

    query(&BLOCKS.upsert_sql())
        .bind(height)
        .bind(&block.hash)
        .bind(block.time.to_sql_string())
        .bind(&block.proposer_address)
        .bind(&block.chain_id)
        .bind(block.num_txs)
        .bind(block.num_evidence)
        .bind(block.total_gas_wanted)
        .bind(block.total_gas_used)
        .bind(&block.total_fee)
        .bind(block.last_commit_round)
        .bind(&block.last_block_id)
        .bind(&block.validators_hash)
        .bind(&block.next_validators_hash)
        .bind(&block.consensus_hash)
        .bind(&block.app_hash)
        .bind(&block.last_results_hash)
        .bind(&block.evidence_hash)
        .bind(&block.last_commit_hash)
        .bind(&block.data_hash)
        .bind(block.valid_signatures)
        .bind(block.total_signatures)
        .bind(&block.version)
        .bind(block.parts_total)
        .bind(&block.parts_hash)
        .bind(block.total_voting_power)
        .bind(block.proposer_priority)
        .execute(&mut *conn)
        .await?;

    let sql = TRANSACTIONS.upsert_sql();
    for tx in &record.transactions {
        query(&sql)
            .bind(&tx.hash)
            .bind(height)
            .bind(tx.tx_index)
            .bind(tx.size_bytes)
            .bind(tx.gas_wanted)
            .bind(tx.gas_used)
            .bind(&tx.fee)
            .bind(tx.timestamp.to_sql_string())
            .execute(&mut *conn)
            .await?;
    }

    let sql = EVIDENCE.upsert_sql();
    for evidence in &record.evidence {
        query(&sql)
            .bind(height)
            .bind(evidence.evidence_index)
            .bind(&evidence.evidence_type)
            .bind(&evidence.validator_address)
            .bind(evidence.total_voting_power)
            .bind(evidence.timestamp.to_sql_string())
            .bind(&evidence.raw_data)
            .execute(&mut *conn)
            .await?;
    }

    let sql = SIGNATURES.upsert_sql();
    for sig in &record.signatures {
        query(&sql)
            .bind(height)
            .bind(sig.signature_index)
            .bind(&sig.validator_address)
            .bind(sig.timestamp.to_sql_string())
            .bind(&sig.signature)
            .bind(sig.block_id_flag)
            .bind(sig.voting_power)
            .bind(sig.proposer_priority)
            .execute(&mut *conn)
            .await?;
    }

    let sql = VALIDATOR_SETS.upsert_sql();
    for validator in &record.validator_set {
        query(&sql)
            .bind(height)
            .bind(&validator.validator_address)
            .bind(&validator.pub_key)
            .bind(validator.voting_power)
            .bind(validator.proposer_priority)
            .execute(&mut *conn)
            .await?;
    }

    let hashes: Vec<&str> = record.transactions.iter().map(|tx| tx.hash.as_str()).collect();
    prune_keys(conn, &TRANSACTIONS, "hash", height, &hashes).await?;
    prune_positions(conn, &EVIDENCE, "evidence_index", height, record.evidence.len()).await?;
    prune_positions(
        conn,
        &SIGNATURES,
        "signature_index",
        height,
        record.signatures.len(),
    )
    .await?;
    let members: Vec<&str> = record
        .validator_set
        .iter()
        .map(|validator| validator.validator_address.as_str())
        .collect();
    prune_keys(conn, &VALIDATOR_SETS, "validator_address", height, &members).await?;

    Ok(())
}

/// Drops rows of `height` positioned at or beyond `kept`, left over from an earlier ingestion of
/// the same block.
async fn prune_positions(
    conn: &mut SqliteConnection,
    table: &TableDef,
    column: &str,
    height: i64,
    kept: usize,
) -> Result<(), Error> {
    query(&format!(
        "DELETE FROM {} WHERE height = ?1 AND {} >= ?2;",
        table.name, column
    ))
    .bind(height)
    .bind(sql_int(kept as SequenceUnit)?)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Drops rows of `height` whose `column` is not one of `keys`.
async fn prune_keys(
    conn: &mut SqliteConnection,
    table: &TableDef,
    column: &str,
    height: i64,
    keys: &[&str],
) -> Result<(), Error> {
    let sql = if keys.is_empty() {
        format!("DELETE FROM {} WHERE height = ?;", table.name)
    } else {
        format!(
            "DELETE FROM {} WHERE height = ? AND {} NOT IN ({});",
            table.name,
            column,
            vec!["?"; keys.len()].join(", ")
        )
    };

    let mut statement = query(&sql).bind(height);
    for key in keys {
        statement = statement.bind(*key);
    }
    statement.execute(&mut *conn).await?;
    Ok(())
}
