//! Decoded block structures.
//!
//! These mirror what the peer reports for a block after decoding: the header
//! fields used for linkage, the confirmed transactions with their transitions
//! and finalize operations, and the inputs of the reward computations.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Length in bytes of a block hash.
pub const HASH_LEN: usize = 32;

/// Opaque fixed-size block identifier.
///
/// Rendered and parsed as lowercase hex (an optional `0x` prefix is accepted
/// when parsing).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct BlockHash(pub [u8; HASH_LEN]);

impl BlockHash {
    /// The all-zero hash, used as the parent of the genesis block.
    pub const ZERO: Self = Self([0u8; HASH_LEN]);

    /// Returns the raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    /// Builds a hash from a byte slice, failing unless it is exactly
    /// [`HASH_LEN`] bytes long.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; HASH_LEN]>::try_from(bytes).ok().map(Self)
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockHash({self})")
    }
}

impl FromStr for BlockHash {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(trimmed).map_err(|e| format!("invalid block hash '{s}': {e}"))?;
        Self::from_slice(&bytes).ok_or_else(|| {
            format!(
                "invalid block hash '{s}': expected {HASH_LEN} bytes, got {}",
                bytes.len()
            )
        })
    }
}

impl Serialize for BlockHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for BlockHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A decoded block as supplied by the peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub height: u64,
    pub hash: BlockHash,
    /// Hash of the parent block. Ignored for the root of the indexed range.
    pub previous_hash: BlockHash,
    /// Unix timestamp in seconds.
    pub timestamp: i64,
    #[serde(default)]
    pub transactions: Vec<Transaction>,
    /// Staking reward distributed to the committee for this block.
    #[serde(default)]
    pub block_reward: u64,
    /// Reward shared between the provers of accepted solutions.
    #[serde(default)]
    pub puzzle_reward: u64,
    /// Committee stake snapshot used by the staking computation.
    #[serde(default)]
    pub stakers: Vec<Staker>,
    #[serde(default)]
    pub solutions: Vec<PuzzleSolution>,
}

impl Block {
    /// Total fees paid by the transactions of this block.
    #[must_use]
    pub fn total_fees(&self) -> u64 {
        self.transactions
            .iter()
            .fold(0u64, |acc, tx| acc.saturating_add(tx.fee))
    }

    /// Number of transitions across all transactions.
    #[must_use]
    pub fn transition_count(&self) -> usize {
        self.transactions.iter().map(|tx| tx.transitions.len()).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Deploy,
    Execute,
    Fee,
}

impl TransactionKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Deploy => "deploy",
            Self::Execute => "execute",
            Self::Fee => "fee",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    #[default]
    Accepted,
    Rejected,
}

impl TransactionStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
        }
    }
}

/// A confirmed transaction inside a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub kind: TransactionKind,
    #[serde(default)]
    pub status: TransactionStatus,
    #[serde(default)]
    pub fee: u64,
    /// Address charged for the fee, when the fee is public.
    #[serde(default)]
    pub fee_payer: Option<String>,
    #[serde(default)]
    pub reject_reason: Option<String>,
    #[serde(default)]
    pub transitions: Vec<Transition>,
    /// Mapping changes confirmed for this transaction, in execution order.
    #[serde(default)]
    pub finalize: Vec<FinalizeOperation>,
}

/// One program execution step. Its index is its position in
/// [`Transaction::transitions`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub id: String,
    pub program_id: String,
    pub function_name: String,
    #[serde(default)]
    pub inputs: Vec<serde_json::Value>,
    #[serde(default)]
    pub outputs: Vec<serde_json::Value>,
}

/// Program mapping change reported for a confirmed transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FinalizeOperation {
    InitializeMapping {
        program_id: String,
        mapping: String,
    },
    UpdateKeyValue {
        program_id: String,
        mapping: String,
        key: String,
        value: String,
    },
    RemoveKeyValue {
        program_id: String,
        mapping: String,
        key: String,
    },
}

impl FinalizeOperation {
    /// The `(program_id, mapping)` pair the operation targets.
    #[must_use]
    pub fn target(&self) -> (&str, &str) {
        match self {
            Self::InitializeMapping {
                program_id,
                mapping,
            }
            | Self::UpdateKeyValue {
                program_id,
                mapping,
                ..
            }
            | Self::RemoveKeyValue {
                program_id,
                mapping,
                ..
            } => (program_id, mapping),
        }
    }
}

/// Committee member stake used for the staking computation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Staker {
    pub address: String,
    pub stake: u64,
}

/// Accepted prover solution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PuzzleSolution {
    pub id: String,
    pub address: String,
    pub target: u64,
}

/// Staking reward earned by `address` at `height`. Append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakeReward {
    pub height: u64,
    pub address: String,
    pub amount: u64,
}

/// Prover reward earned by a solution at `height`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PuzzleReward {
    pub height: u64,
    pub solution_id: String,
    pub address: String,
    pub target: u64,
    pub amount: u64,
}
