//! Lenient views of the CometBFT `/block` and `/validators` results.
//!
//! Every field defaults when missing, `null` or of an unexpected type. Integers are accepted either
//! as JSON numbers or as decimal strings (the RPC encodes 64-bit values as strings), and numbers
//! found where a string is expected are kept in their decimal form.

use serde::{Deserialize, Deserializer};
use serde_json::Value;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct BlockResult {
    #[serde(deserialize_with = "null_default")]
    pub block_id: BlockId,
    pub block: Option<Block>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct BlockId {
    #[serde(deserialize_with = "string_like")]
    pub hash: String,
    #[serde(deserialize_with = "null_default")]
    pub parts: PartSetHeader,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct PartSetHeader {
    #[serde(deserialize_with = "int_like")]
    pub total: i64,
    #[serde(deserialize_with = "string_like")]
    pub hash: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct Block {
    pub header: Option<Header>,
    #[serde(deserialize_with = "null_default")]
    pub data: Data,
    #[serde(deserialize_with = "null_default")]
    pub evidence: EvidenceList,
    #[serde(deserialize_with = "null_default")]
    pub last_commit: Commit,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct Header {
    #[serde(deserialize_with = "null_default")]
    pub version: Version,
    #[serde(deserialize_with = "string_like")]
    pub chain_id: String,
    #[serde(deserialize_with = "int_like")]
    pub height: i64,
    #[serde(deserialize_with = "string_like")]
    pub time: String,
    #[serde(deserialize_with = "null_default")]
    pub last_block_id: BlockId,
    #[serde(deserialize_with = "string_like")]
    pub last_commit_hash: String,
    #[serde(deserialize_with = "string_like")]
    pub data_hash: String,
    #[serde(deserialize_with = "string_like")]
    pub validators_hash: String,
    #[serde(deserialize_with = "string_like")]
    pub next_validators_hash: String,
    #[serde(deserialize_with = "string_like")]
    pub consensus_hash: String,
    #[serde(deserialize_with = "string_like")]
    pub app_hash: String,
    #[serde(deserialize_with = "string_like")]
    pub last_results_hash: String,
    #[serde(deserialize_with = "string_like")]
    pub evidence_hash: String,
    #[serde(deserialize_with = "string_like")]
    pub proposer_address: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct Version {
    #[serde(deserialize_with = "string_like")]
    pub block: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct Data {
    #[serde(deserialize_with = "list_like")]
    pub txs: Vec<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct EvidenceList {
    #[serde(deserialize_with = "null_default")]
    pub evidence: Vec<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct Commit {
    #[serde(deserialize_with = "int_like")]
    pub round: i64,
    #[serde(deserialize_with = "null_default")]
    pub signatures: Vec<CommitSig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct CommitSig {
    #[serde(deserialize_with = "int_like")]
    pub block_id_flag: i64,
    #[serde(deserialize_with = "string_like")]
    pub validator_address: String,
    #[serde(deserialize_with = "string_like")]
    pub timestamp: String,
    #[serde(deserialize_with = "string_like")]
    pub signature: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct ValidatorsResult {
    #[serde(deserialize_with = "null_default")]
    pub validators: Vec<Validator>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct Validator {
    #[serde(deserialize_with = "string_like")]
    pub address: String,
    #[serde(deserialize_with = "null_default")]
    pub pub_key: PubKey,
    #[serde(deserialize_with = "int_like")]
    pub voting_power: i64,
    #[serde(deserialize_with = "int_like")]
    pub proposer_priority: i64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct PubKey {
    #[serde(deserialize_with = "string_like")]
    pub value: String,
}

fn null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Reads a number or a numeric string; anything else becomes `0`.
fn int_like<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(value) => value_as_i64(&value),
        None => 0,
    })
}

/// Reads an array as-is; anything else becomes empty.
fn list_like<'de, D>(deserializer: D) -> Result<Vec<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Array(items)) => items,
        _ => Vec::new(),
    })
}

fn string_like<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) => s,
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    })
}

pub(crate) fn value_as_i64(value: &Value) -> i64 {
    match value {
        Value::Number(n) => n.as_i64().unwrap_or_default(),
        Value::String(s) => s.trim().parse().unwrap_or_default(),
        _ => 0,
    }
}
