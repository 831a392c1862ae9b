//! Maps raw `/block` and `/validators` results into normalized rows.
//!
//! Transformation is pure: no I/O and no retries. Only a payload without a block container is
//! rejected; every other missing field degrades to an empty string or zero.

use base64::{engine::general_purpose::STANDARD, Engine};
use log::warn;
use serde_json::Value;
use sha2::{Digest, Sha256};

mod wire;

use crate::{
    errors::Error,
    types::{
        BlockSummary, EvidenceRow, NormalizedRecord, RawPayload, SequenceUnit, SignatureRow,
        Timestamp, TransactionRow, ValidatorSetEntry,
    },
};

/// `BLOCK_ID_FLAG_ABSENT`; flags above it are `COMMIT` (2) and `NIL` (3).
const BLOCK_ID_FLAG_ABSENT: i64 = 1;

/// How to treat payloads that have a block container but no header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Strictness {
    /// Missing header fields degrade to defaults.
    #[default]
    Lenient,
    /// A block without a header is rejected as malformed.
    Strict,
}

/// Transforms a payload, degrading missing fields to defaults.
pub fn transform(payload: &RawPayload) -> Result<NormalizedRecord, Error> {
    transform_with(payload, Strictness::Lenient)
}

pub fn transform_with(
    payload: &RawPayload,
    strictness: Strictness,
) -> Result<NormalizedRecord, Error> {
    let height = payload.height;
    let malformed = |reason: String| Error::MalformedPayload { height, reason };

    let result: wire::BlockResult = serde_json::from_value(payload.block.clone())
        .map_err(|err| malformed(format!("undecodable block result: {}", err)))?;
    let block = result
        .block
        .ok_or_else(|| malformed("missing block container".to_string()))?;
    let header = match block.header {
        Some(header) => header,
        None if strictness == Strictness::Strict => {
            return Err(malformed("missing block header".to_string()))
        }
        None => wire::Header::default(),
    };

    let validators = match &payload.validators {
        Some(value) => match serde_json::from_value::<wire::ValidatorsResult>(value.clone()) {
            Ok(result) => result.validators,
            Err(err) => {
                warn!("Ignoring undecodable validator set for block #{}: {}", height, err);
                Vec::new()
            }
        },
        None => Vec::new(),
    };

    let block_time = Timestamp::parse_or_now(&header.time);
    let (proposer_voting_power, proposer_priority) =
        voting_power_of(&validators, &header.proposer_address);

    let signatures = block
        .last_commit
        .signatures
        .iter()
        .enumerate()
        .map(|(index, sig)| {
            let (voting_power, proposer_priority) =
                voting_power_of(&validators, &sig.validator_address);
            SignatureRow {
                height,
                signature_index: index as i64,
                validator_address: sig.validator_address.clone(),
                timestamp: Timestamp::parse_or_now(&sig.timestamp),
                signature: sig.signature.clone(),
                block_id_flag: sig.block_id_flag,
                voting_power,
                proposer_priority,
            }
        })
        .collect::<Vec<_>>();

    let transactions = transactions(height, &block.data.txs, block_time);
    let evidence = block
        .evidence
        .evidence
        .iter()
        .enumerate()
        .map(|(index, raw)| evidence_row(height, index, raw))
        .collect::<Vec<_>>();

    let validator_set = validators
        .iter()
        .map(|validator| ValidatorSetEntry {
            height,
            validator_address: validator.address.clone(),
            pub_key: validator.pub_key.value.clone(),
            voting_power: validator.voting_power,
            proposer_priority: validator.proposer_priority,
        })
        .collect::<Vec<_>>();

    let summary = BlockSummary {
        height,
        hash: result.block_id.hash,
        time: block_time,
        proposer_address: header.proposer_address,
        chain_id: header.chain_id,
        num_txs: block.data.txs.len() as i64,
        num_evidence: evidence.len() as i64,
        // Gas and fee totals are only exposed by `/block_results`.
        total_gas_wanted: 0,
        total_gas_used: 0,
        total_fee: "0".to_string(),
        last_commit_round: block.last_commit.round,
        last_block_id: header.last_block_id.hash,
        validators_hash: header.validators_hash,
        next_validators_hash: header.next_validators_hash,
        consensus_hash: header.consensus_hash,
        app_hash: header.app_hash,
        last_results_hash: header.last_results_hash,
        evidence_hash: header.evidence_hash,
        last_commit_hash: header.last_commit_hash,
        data_hash: header.data_hash,
        valid_signatures: count_valid_signatures(&signatures) as i64,
        total_signatures: signatures.len() as i64,
        version: header.version.block,
        parts_total: result.block_id.parts.total,
        parts_hash: result.block_id.parts.hash,
        total_voting_power: proposer_voting_power,
        proposer_priority,
    };

    Ok(NormalizedRecord {
        block: summary,
        transactions,
        evidence,
        signatures,
        validator_set,
    })
}

/// Whether a commit signature counts towards the block's valid signatures: the validator voted
/// (`COMMIT` or `NIL`) and the signature bytes are present.
pub fn is_valid_signature(block_id_flag: i64, signature: &str) -> bool {
    block_id_flag > BLOCK_ID_FLAG_ABSENT && !signature.is_empty()
}

pub fn count_valid_signatures(signatures: &[SignatureRow]) -> usize {
    signatures
        .iter()
        .filter(|sig| is_valid_signature(sig.block_id_flag, &sig.signature))
        .count()
}

/// `(voting_power, proposer_priority)` of `address` in the validator set, or zeros.
fn voting_power_of(validators: &[wire::Validator], address: &str) -> (i64, i64) {
    if address.is_empty() {
        return (0, 0);
    }
    validators
        .iter()
        .find(|validator| validator.address == address)
        .map(|validator| (validator.voting_power, validator.proposer_priority))
        .unwrap_or_default()
}

fn transactions(height: SequenceUnit, txs: &[Value], time: Timestamp) -> Vec<TransactionRow> {
    txs.iter()
        .enumerate()
        .filter_map(|(index, encoded)| {
            let Some(encoded) = encoded.as_str() else {
                warn!("Skipping non-string tx #{} in block #{}", index, height);
                return None;
            };
            transaction_row(height, index, encoded, time)
        })
        .collect()
}

fn transaction_row(
    height: SequenceUnit,
    index: usize,
    encoded: &str,
    time: Timestamp,
) -> Option<TransactionRow> {
    match STANDARD.decode(encoded) {
        Ok(bytes) => Some(TransactionRow {
            hash: hex::encode_upper(Sha256::digest(&bytes)),
            height,
            tx_index: index as i64,
            size_bytes: bytes.len() as i64,
            gas_wanted: 0,
            gas_used: 0,
            fee: "0".to_string(),
            timestamp: time,
        }),
        Err(err) => {
            warn!("Skipping undecodable tx #{} in block #{}: {}", index, height, err);
            None
        }
    }
}

fn evidence_row(height: SequenceUnit, index: usize, raw: &Value) -> EvidenceRow {
    let text = |pointer: &str| {
        raw.pointer(pointer)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };

    EvidenceRow {
        height,
        evidence_index: index as i64,
        evidence_type: text("/type"),
        validator_address: text("/value/vote_a/validator_address"),
        total_voting_power: raw
            .pointer("/value/total_voting_power")
            .map(wire::value_as_i64)
            .unwrap_or_default(),
        timestamp: Timestamp::parse_or_now(&text("/value/timestamp")),
        raw_data: raw.to_string(),
    }
}
