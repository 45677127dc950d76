//! Collaborator interfaces the consensus core consumes.
//!
//! The core never talks to a socket, a database, or a signing key
//! directly; nodes plug their implementations in through these traits.
//! Wire codecs are out of scope here, so `ProtocolMessage` is the
//! semantic shape of what travels, not its byte encoding.

use crate::error::ConsensusResult;
use async_trait::async_trait;
use remora_types::{
    Block, BlockHash, Notarization, PublicKey, RoundNumber, Seed, Signature, Transaction,
    VerificationTicket, VrfShare,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Messages exchanged between consensus nodes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ProtocolMessage {
    /// A candidate block for the round it names.
    Proposal(Arc<Block>),
    /// One member's attestation that a block verified.
    Ticket(VerificationTicket),
    /// A quorum of tickets for a block.
    Notarization(Notarization),
    /// A threshold beacon share.
    VrfShare(VrfShare),
    /// Announcement that a round started with the given seed.
    RoundStart {
        round: RoundNumber,
        seed: Seed,
    },
}

/// Source of transactions for block generation.
pub trait TransactionPool: Send + Sync + 'static {
    /// Number of transactions currently pooled. The generator watches this
    /// for changes while backing off.
    fn count(&self) -> usize;

    /// Take up to `n` transactions out of the pool.
    fn take(&self, n: usize) -> Vec<Transaction>;
}

/// Signing and verification of block hashes under member keys.
pub trait Signer: Send + Sync + 'static {
    fn sign(&self, hash: &BlockHash) -> Signature;

    fn verify(&self, hash: &BlockHash, signature: &Signature, party: &PublicKey) -> bool;
}

/// The threshold random beacon, treated as an opaque oracle.
///
/// Shares are produced and verified against the canonical round message;
/// at threshold they combine into a group signature the seed derives from.
pub trait BeaconOracle: Send + Sync + 'static {
    /// Produce this node's share for a round attempt.
    fn share(
        &self,
        round: RoundNumber,
        timeout_count: u32,
        message: &str,
    ) -> ConsensusResult<VrfShare>;

    /// Verify a share against the canonical message.
    fn verify_share(&self, share: &VrfShare, message: &str) -> bool;

    /// Combine a threshold of shares into the hex group signature.
    fn combine(&self, shares: &[VrfShare]) -> ConsensusResult<String>;

    /// The threshold T.
    fn threshold(&self) -> usize;
}

/// The node's view of its peers.
#[async_trait]
pub trait Peers: Send + Sync + 'static {
    /// Send a message to every other consensus node.
    async fn broadcast(&self, message: ProtocolMessage);

    /// Send a message to every other consensus node except one.
    async fn broadcast_except(&self, message: ProtocolMessage, exclude: &PublicKey);

    /// Ask all sharders of the current magic block for a block by hash,
    /// returning whatever they answer with.
    async fn request_block_from_all(&self, hash: BlockHash) -> Vec<Block>;
}

/// Downstream consumer of block state transitions during finalization.
#[async_trait]
pub trait BlockStateHandler: Send + Sync + 'static {
    /// A block is about to be committed; its transactions are final.
    async fn update_pending_block(&self, block: &Block, txns: &[Transaction]);

    /// A block was committed.
    async fn update_finalized_block(&self, block: &Block);
}
