//! Error types for the consensus core.

use remora_types::{BlockHash, RoundNumber};
use thiserror::Error;

/// Result type for consensus operations.
pub type ConsensusResult<T> = Result<T, ConsensusError>;

/// Errors that can occur while driving rounds.
///
/// Task loops treat most of these as per-message failures: the offending
/// input is logged and dropped and the loop continues. The DKG variants are
/// fatal to startup of the affected magic block.
#[derive(Debug, Error)]
pub enum ConsensusError {
    /// The chain advanced past the round this operation belongs to.
    #[error("round mismatch: current round {current}, operation on round {requested}")]
    RoundMismatch {
        /// The chain's current round.
        current: RoundNumber,
        /// The round the operation was for.
        requested: RoundNumber,
    },

    /// A block's parent is not available locally.
    #[error("previous block {0} not available")]
    PrevBlockMissing(BlockHash),

    /// The previous round has no usable seed for the beacon message.
    #[error("previous round of {0} has no random seed")]
    PrevSeedMissing(RoundNumber),

    /// The previous round object does not exist.
    #[error("previous round of {0} not available")]
    PrevRoundMissing(RoundNumber),

    /// The transaction pool cannot fill a block yet.
    #[error("not enough transactions to generate a block")]
    InsufficientTxns,

    /// A block references a magic block other than the active one.
    #[error("invalid magic block: {0}")]
    InvalidMagicBlock(String),

    /// A ticket set does not add up to a valid notarization.
    #[error("invalid notarization: {0}")]
    InvalidNotarization(String),

    /// A signature failed verification.
    #[error("invalid signature from {0}")]
    InvalidSignature(String),

    /// A block failed content validation.
    #[error("invalid block: {0}")]
    InvalidBlock(String),

    /// No notarized block of the prior round to extend.
    #[error("no block to extend for round {0}")]
    NoBlockToExtend(RoundNumber),

    /// No DKG summary was persisted for a magic block.
    #[error("no saved secret shares for magic block {0}")]
    NoSavedShares(u64),

    /// The persisted DKG summary does not reach the threshold.
    #[error("not enough secret shares for magic block {magic_block}: have {have}, need {need}")]
    NotEnoughShares {
        /// Magic block the summary belongs to.
        magic_block: u64,
        /// Shares found in the store.
        have: usize,
        /// Threshold required.
        need: usize,
    },

    /// A block is not in the cache.
    #[error("block {0} not found")]
    NotFound(BlockHash),

    /// A channel peer went away; the owning task is shutting down.
    #[error("shutting down")]
    ShuttingDown,

    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}
