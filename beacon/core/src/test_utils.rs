use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Mutex,
    },
};

use serde_json::{json, Value};

use crate::{
    block_source::BlockSource,
    errors::Error,
    types::{
        BlockSummary, Fetched, NormalizedRecord, SequenceUnit, SignatureRow, Timestamp,
        TransactionRow, ValidatorSetEntry,
    },
};

/// Base64 of `tx`.
const ENCODED_TX: &str = "dHg=";

/// A `/block` result for `height` with one transaction and two commit signatures.
pub fn block_result(height: SequenceUnit) -> Value {
    json!({
        "block_id": {"hash": format!("HASH{}", height), "parts": {"total": 1, "hash": "P"}},
        "block": {
            "header": {
                "chain_id": "testnet",
                "height": height.to_string(),
                "time": "2024-05-01T12:00:00.987654Z",
                "proposer_address": "VAL1"
            },
            "data": {"txs": [ENCODED_TX]},
            "evidence": {"evidence": []},
            "last_commit": {
                "round": 0,
                "signatures": [
                    {"block_id_flag": 2, "validator_address": "VAL1", "timestamp": "2024-05-01T12:00:00Z", "signature": "c2ln"},
                    {"block_id_flag": 1, "validator_address": "", "timestamp": "0001-01-01T00:00:00Z", "signature": null}
                ]
            }
        }
    })
}

pub fn validators_result() -> Value {
    json!({
        "validators": [
            {"address": "VAL1", "pub_key": {"value": "PK1"}, "voting_power": "10", "proposer_priority": "0"}
        ]
    })
}

/// A fully populated record for `height`, independent of the transformer.
pub fn sample_record(height: SequenceUnit) -> NormalizedRecord {
    let time = Timestamp::parse("2024-05-01T12:00:00.987Z").unwrap();
    NormalizedRecord {
        block: BlockSummary {
            height,
            hash: format!("HASH{}", height),
            time,
            proposer_address: "VAL1".into(),
            chain_id: "testnet".into(),
            num_txs: 1,
            num_evidence: 0,
            total_gas_wanted: 0,
            total_gas_used: 0,
            total_fee: "0".into(),
            last_commit_round: 0,
            last_block_id: format!("HASH{}", height.saturating_sub(1)),
            validators_hash: "VH".into(),
            next_validators_hash: "NVH".into(),
            consensus_hash: "CH".into(),
            app_hash: "AH".into(),
            last_results_hash: "LRH".into(),
            evidence_hash: "EH".into(),
            last_commit_hash: "LCH".into(),
            data_hash: "DH".into(),
            valid_signatures: 1,
            total_signatures: 2,
            version: "11".into(),
            parts_total: 1,
            parts_hash: "P".into(),
            total_voting_power: 10,
            proposer_priority: 0,
        },
        transactions: vec![TransactionRow {
            hash: format!("TX{}", height),
            height,
            tx_index: 0,
            size_bytes: 2,
            gas_wanted: 0,
            gas_used: 0,
            fee: "0".into(),
            timestamp: time,
        }],
        evidence: vec![],
        signatures: (0..2)
            .map(|index| SignatureRow {
                height,
                signature_index: index,
                validator_address: format!("VAL{}", index + 1),
                timestamp: time,
                signature: if index == 0 { "c2ln".into() } else { String::new() },
                block_id_flag: 2 - index,
                voting_power: 10,
                proposer_priority: 0,
            })
            .collect(),
        validator_set: vec![ValidatorSetEntry {
            height,
            validator_address: "VAL1".into(),
            pub_key: "PK1".into(),
            voting_power: 10,
            proposer_priority: 0,
        }],
    }
}

/// A block source serving well-formed blocks up to `tip`, with scripted deviations.
#[derive(Debug, Default)]
pub struct ScriptedSource {
    tip: AtomicU64,
    malformed: HashSet<SequenceUnit>,
    failing: HashSet<SequenceUnit>,
    validators_failing: HashSet<SequenceUnit>,
    validators_missing: HashSet<SequenceUnit>,
    tip_unreachable: AtomicBool,
    fetches: Mutex<HashMap<SequenceUnit, usize>>,
}

impl ScriptedSource {
    pub fn new(tip: SequenceUnit) -> Self {
        Self {
            tip: AtomicU64::new(tip),
            ..Default::default()
        }
    }

    /// Serves a payload without a block container at `height`.
    pub fn malformed_at(mut self, height: SequenceUnit) -> Self {
        self.malformed.insert(height);
        self
    }

    /// Fails the block request at `height` with a non-retryable transport error.
    pub fn failing_at(mut self, height: SequenceUnit) -> Self {
        self.failing.insert(height);
        self
    }

    /// Fails the validator set request at `height` as if every endpoint were down.
    pub fn validators_failing_at(mut self, height: SequenceUnit) -> Self {
        self.validators_failing.insert(height);
        self
    }

    /// Serves no validator set at `height`.
    pub fn validators_missing_at(mut self, height: SequenceUnit) -> Self {
        self.validators_missing.insert(height);
        self
    }

    pub fn set_tip(&self, tip: SequenceUnit) {
        self.tip.store(tip, Ordering::SeqCst);
    }

    pub fn set_tip_unreachable(&self, unreachable: bool) {
        self.tip_unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn fetch_count(&self, height: SequenceUnit) -> usize {
        self.fetches
            .lock()
            .unwrap()
            .get(&height)
            .copied()
            .unwrap_or_default()
    }
}

impl BlockSource for ScriptedSource {
    async fn latest_height(&self) -> Result<SequenceUnit, Error> {
        if self.tip_unreachable.load(Ordering::SeqCst) {
            return Err(Error::AllEndpointsFailed(1));
        }
        Ok(self.tip.load(Ordering::SeqCst))
    }

    async fn fetch_block(&self, height: SequenceUnit) -> Result<Fetched<Value>, Error> {
        *self.fetches.lock().unwrap().entry(height).or_default() += 1;

        if self.failing.contains(&height) {
            return Err(Error::transport("scripted", Some(400), "bad request"));
        }
        if height > self.tip.load(Ordering::SeqCst) {
            return Ok(Fetched::Absent);
        }
        if self.malformed.contains(&height) {
            return Ok(Fetched::Produced(json!({"block_id": {"hash": "X"}})));
        }
        Ok(Fetched::Produced(block_result(height)))
    }

    async fn fetch_validators(&self, height: SequenceUnit) -> Result<Fetched<Value>, Error> {
        if self.validators_failing.contains(&height) {
            return Err(Error::AllEndpointsFailed(1));
        }
        if self.validators_missing.contains(&height) {
            return Ok(Fetched::Absent);
        }
        Ok(Fetched::Produced(validators_result()))
    }
}
