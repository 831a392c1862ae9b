use std::fmt;

use chrono::{DateTime, NaiveDateTime, Timelike, Utc};
use log::warn;
use serde_json::Value;

/// Block height driving ingestion order.
pub type SequenceUnit = u64;

/// Outcome of a remote lookup that succeeded at the transport level.
#[derive(Debug, Clone, PartialEq)]
pub enum Fetched<T> {
    Produced(T),
    /// The remote has not produced this unit yet.
    Absent,
}

impl<T> Fetched<T> {
    pub fn produced(self) -> Option<T> {
        match self {
            Fetched::Produced(value) => Some(value),
            Fetched::Absent => None,
        }
    }
}

/// Raw data fetched for a single block height.
#[derive(Debug, Clone, PartialEq)]
pub struct RawPayload {
    pub height: SequenceUnit,
    /// The `result` object of the `/block` response.
    pub block: Value,
    /// The `result` object of the `/validators` response, if it could be fetched.
    pub validators: Option<Value>,
}

/// All rows derived from one [`RawPayload`]. Stored atomically.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRecord {
    pub block: BlockSummary,
    pub transactions: Vec<TransactionRow>,
    pub evidence: Vec<EvidenceRow>,
    pub signatures: Vec<SignatureRow>,
    pub validator_set: Vec<ValidatorSetEntry>,
}

impl NormalizedRecord {
    pub fn height(&self) -> SequenceUnit {
        self.block.height
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlockSummary {
    pub height: SequenceUnit,
    pub hash: String,
    pub time: Timestamp,
    pub proposer_address: String,
    pub chain_id: String,
    pub num_txs: i64,
    pub num_evidence: i64,
    pub total_gas_wanted: i64,
    pub total_gas_used: i64,
    pub total_fee: String,
    pub last_commit_round: i64,
    pub last_block_id: String,
    pub validators_hash: String,
    pub next_validators_hash: String,
    pub consensus_hash: String,
    pub app_hash: String,
    pub last_results_hash: String,
    pub evidence_hash: String,
    pub last_commit_hash: String,
    pub data_hash: String,
    pub valid_signatures: i64,
    pub total_signatures: i64,
    pub version: String,
    pub parts_total: i64,
    pub parts_hash: String,
    /// Voting power of the proposer at this height.
    pub total_voting_power: i64,
    pub proposer_priority: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransactionRow {
    pub hash: String,
    pub height: SequenceUnit,
    pub tx_index: i64,
    pub size_bytes: i64,
    pub gas_wanted: i64,
    pub gas_used: i64,
    pub fee: String,
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvidenceRow {
    pub height: SequenceUnit,
    pub evidence_index: i64,
    pub evidence_type: String,
    pub validator_address: String,
    pub total_voting_power: i64,
    pub timestamp: Timestamp,
    pub raw_data: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SignatureRow {
    pub height: SequenceUnit,
    pub signature_index: i64,
    pub validator_address: String,
    pub timestamp: Timestamp,
    pub signature: String,
    pub block_id_flag: i64,
    pub voting_power: i64,
    pub proposer_priority: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidatorSetEntry {
    pub height: SequenceUnit,
    pub validator_address: String,
    pub pub_key: String,
    pub voting_power: i64,
    pub proposer_priority: i64,
}

/// A UTC instant with millisecond precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    const SQL_FORMAT: &'static str = "%Y-%m-%d %H:%M:%S%.3f";

    /// Parses an ISO-8601 timestamp, dropping any digits below the millisecond.
    ///
    /// A trailing zone marker is honoured when present; without one the value is read as UTC.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let parsed = DateTime::parse_from_rfc3339(raw)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                let naive = raw.trim_end_matches('Z');
                NaiveDateTime::parse_from_str(naive, "%Y-%m-%dT%H:%M:%S%.f")
                    .or_else(|_| NaiveDateTime::parse_from_str(naive, "%Y-%m-%dT%H:%M:%S"))
                    .ok()
                    .map(|naive| naive.and_utc())
            })?;

        Some(Self::truncated(parsed))
    }

    /// Like [`Timestamp::parse`], but falls back to the current time instead of failing.
    pub fn parse_or_now(raw: &str) -> Self {
        Self::parse(raw).unwrap_or_else(|| {
            warn!("Unparseable timestamp {:?}, using current time", raw);
            Self::now()
        })
    }

    pub fn now() -> Self {
        Self::truncated(Utc::now())
    }

    pub fn millis(&self) -> u32 {
        self.0.timestamp_subsec_millis()
    }

    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }

    /// Renders the timestamp as `YYYY-MM-DD HH:MM:SS.mmm`.
    pub fn to_sql_string(&self) -> String {
        self.0.format(Self::SQL_FORMAT).to_string()
    }

    fn truncated(dt: DateTime<Utc>) -> Self {
        let nanos = dt.nanosecond() / 1_000_000 * 1_000_000;
        Self(dt.with_nanosecond(nanos).unwrap_or(dt))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_sql_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncates_sub_millisecond_digits() {
        let ts = Timestamp::parse("2024-01-01T00:00:00.123456789Z").unwrap();
        assert_eq!(ts.millis(), 123);
        assert_eq!(ts.to_sql_string(), "2024-01-01 00:00:00.123");

        let ts = Timestamp::parse("2024-01-01T00:00:00.999999Z").unwrap();
        assert_eq!(ts.millis(), 999);
    }

    #[test]
    fn accepts_missing_fraction_and_offsets() {
        let ts = Timestamp::parse("2024-03-05T10:20:30Z").unwrap();
        assert_eq!(ts.to_sql_string(), "2024-03-05 10:20:30.000");

        let ts = Timestamp::parse("2024-03-05T12:20:30.5+02:00").unwrap();
        assert_eq!(ts.to_sql_string(), "2024-03-05 10:20:30.500");

        let ts = Timestamp::parse("2024-03-05T10:20:30.250").unwrap();
        assert_eq!(ts.millis(), 250);
    }

    #[test]
    fn malformed_falls_back_to_now() {
        assert!(Timestamp::parse("yesterday").is_none());

        let before = Timestamp::now();
        let ts = Timestamp::parse_or_now("not-a-time");
        assert!(ts >= before);
        assert_eq!(ts.as_datetime().nanosecond() % 1_000_000, 0);
    }
}
