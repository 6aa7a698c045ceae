//! Block decoding.
//!
//! Raw peer payloads are turned into [`Block`] values by a [`BlockDecoder`].
//! The pipeline treats decoding as opaque: anything that fails here is a
//! [`IndexerError::DecodingError`] for that height and pauses the sync loop.
//!
//! [`JsonBlockDecoder`] reads the canonical JSON rendering of a block:
//!
//! ```json
//! {
//!   "height": 12,
//!   "hash": "<64 hex chars>",
//!   "previous_hash": "<64 hex chars>",
//!   "timestamp": 1700000012,
//!   "block_reward": 1000,
//!   "puzzle_reward": 300,
//!   "stakers": [{ "address": "aleo1...", "stake": 10 }],
//!   "solutions": [{ "id": "puzzle1...", "address": "aleo1...", "target": 2 }],
//!   "transactions": [{
//!     "id": "at1...",
//!     "kind": "execute",
//!     "status": "accepted",
//!     "fee": 100,
//!     "fee_payer": "aleo1...",
//!     "transitions": [{ "id": "au1...", "program_id": "credits.aleo",
//!                       "function_name": "transfer_public" }],
//!     "finalize": [{ "type": "update_key_value", "program_id": "credits.aleo",
//!                    "mapping": "account", "key": "aleo1...", "value": "5u64" }]
//!   }]
//! }
//! ```

use crate::types::Block;
use crate::utils::error::{IndexerError, Result};
use std::collections::HashSet;

/// Turns raw peer bytes into a [`Block`].
pub trait BlockDecoder: Send + Sync {
    /// # Errors
    ///
    /// Returns `DecodingError` when the payload is not a well-formed block.
    fn decode(&self, raw: &[u8]) -> Result<Block>;
}

/// Decoder for the JSON block rendering.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonBlockDecoder;

impl JsonBlockDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn validate(block: &Block) -> Result<()> {
        let mut seen = HashSet::with_capacity(block.transactions.len());
        let mut transitions = HashSet::with_capacity(block.transition_count());
        for tx in &block.transactions {
            if !seen.insert(tx.id.as_str()) {
                return Err(IndexerError::DecodingError(format!(
                    "block {} lists transaction {} twice",
                    block.height, tx.id
                )));
            }
            for transition in &tx.transitions {
                if !transitions.insert(transition.id.as_str()) {
                    return Err(IndexerError::DecodingError(format!(
                        "block {} lists transition {} twice",
                        block.height, transition.id
                    )));
                }
            }
        }

        let mut solutions = HashSet::with_capacity(block.solutions.len());
        for solution in &block.solutions {
            if !solutions.insert(solution.id.as_str()) {
                return Err(IndexerError::DecodingError(format!(
                    "block {} lists solution {} twice",
                    block.height, solution.id
                )));
            }
        }

        Ok(())
    }
}

impl BlockDecoder for JsonBlockDecoder {
    fn decode(&self, raw: &[u8]) -> Result<Block> {
        let block: Block = serde_json::from_slice(raw)
            .map_err(|e| IndexerError::DecodingError(format!("malformed block payload: {e}")))?;
        Self::validate(&block)?;
        Ok(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(transactions: serde_json::Value) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "height": 12,
            "hash": "0c".repeat(32),
            "previous_hash": "0b".repeat(32),
            "timestamp": 1_700_000_012,
            "transactions": transactions,
        }))
        .unwrap()
    }

    #[test]
    fn test_decode_block() {
        let raw = payload(json!([{
            "id": "at1x",
            "kind": "execute",
            "fee": 5,
            "transitions": [{
                "id": "au1x",
                "program_id": "credits.aleo",
                "function_name": "transfer_public"
            }]
        }]));

        let block = JsonBlockDecoder::new().decode(&raw).unwrap();
        assert_eq!(block.height, 12);
        assert_eq!(block.transactions.len(), 1);
        assert_eq!(block.transition_count(), 1);
        assert_eq!(block.total_fees(), 5);
    }

    #[test]
    fn test_garbage_is_decoding_error() {
        let err = JsonBlockDecoder::new().decode(b"\x00\x01not json").unwrap_err();
        assert!(matches!(err, IndexerError::DecodingError(_)));
    }

    #[test]
    fn test_bad_hash_is_decoding_error() {
        let raw = br#"{"height":1,"hash":"zz","previous_hash":"00","timestamp":0}"#;
        let err = JsonBlockDecoder::new().decode(raw).unwrap_err();
        assert!(matches!(err, IndexerError::DecodingError(_)));
    }

    #[test]
    fn test_duplicate_transaction_rejected() {
        let tx = json!({ "id": "at1dup", "kind": "execute" });
        let raw = payload(json!([tx.clone(), tx]));
        let err = JsonBlockDecoder::new().decode(&raw).unwrap_err();
        assert!(err.to_string().contains("at1dup"));
    }

    #[test]
    fn test_duplicate_transition_rejected() {
        let transition = json!({
            "id": "au1dup",
            "program_id": "credits.aleo",
            "function_name": "transfer_public"
        });
        let raw = payload(json!([
            { "id": "at1a", "kind": "execute", "transitions": [transition.clone()] },
            { "id": "at1b", "kind": "execute", "transitions": [transition] }
        ]));
        let err = JsonBlockDecoder::new().decode(&raw).unwrap_err();
        assert!(matches!(err, IndexerError::DecodingError(_)));
        assert!(err.to_string().contains("au1dup"));
    }
}
