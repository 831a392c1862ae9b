use std::future::Future;

use log::{trace, warn};
use serde_json::Value;

mod http;
pub use http::{HttpBlockSource, HttpBlockSourceConfig};

use crate::{
    errors::Error,
    types::{Fetched, RawPayload, SequenceUnit},
};

/// Remote provider of raw chain data, addressed by block height.
pub trait BlockSource: Send + Sync {
    /// Height of the most recent block the remote has produced.
    fn latest_height(&self) -> impl Future<Output = Result<SequenceUnit, Error>> + Send;

    /// The `result` object of the block at `height`.
    fn fetch_block(
        &self,
        height: SequenceUnit,
    ) -> impl Future<Output = Result<Fetched<Value>, Error>> + Send;

    /// The `result` object of the validator set at `height`.
    fn fetch_validators(
        &self,
        height: SequenceUnit,
    ) -> impl Future<Output = Result<Fetched<Value>, Error>> + Send;
}

/// Fetches the block at `height` followed by its validator set.
///
/// Failing to obtain the validator set does not fail the unit: the payload is returned without it
/// and voting-power fields later degrade to zero.
pub async fn fetch_unit<S>(source: &S, height: SequenceUnit) -> Result<Fetched<RawPayload>, Error>
where
    S: BlockSource,
{
    let block = match source.fetch_block(height).await? {
        Fetched::Produced(block) => block,
        Fetched::Absent => {
            trace!("Block #{} is not available yet", height);
            return Ok(Fetched::Absent);
        }
    };

    let validators = match source.fetch_validators(height).await {
        Ok(Fetched::Produced(validators)) => Some(validators),
        Ok(Fetched::Absent) => {
            warn!("Validator set for block #{} not available", height);
            None
        }
        Err(err) => {
            warn!(
                "Failed to fetch validator set for block #{} ({}): {}",
                height,
                err.kind(),
                err
            );
            None
        }
    };

    Ok(Fetched::Produced(RawPayload {
        height,
        block,
        validators,
    }))
}
