//! Blocks and the tickets and notarizations that certify them.
//!
//! A block's identity fields are fixed at construction; the ticket set and
//! the notarized flag keep changing while the block circulates, so they sit
//! behind their own lock and the block is shared as `Arc<Block>`. The
//! parent pointer is weak and is revalidated through the block cache.

use crate::{BlockHash, PublicKey, RoundNumber, Seed, Signature};
use blake2::digest::Update;
use fastcrypto::traits::EncodeDecodeBase64;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Instant;

/// An opaque transaction carried in a block.
#[derive(Clone, Serialize, Deserialize, Default, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Transaction(pub Vec<u8>);

impl Transaction {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// One member's attestation that a block verified.
///
/// Unique per `(block_hash, signer)`.
#[derive(Clone, Serialize, Deserialize)]
pub struct VerificationTicket {
    pub block_hash: BlockHash,
    pub signer: PublicKey,
    pub signature: Signature,
}

impl fmt::Debug for VerificationTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "T{}({})", self.block_hash, self.signer.encode_base64())
    }
}

/// Proof that at least T committee members verified a block.
///
/// Derived from a block's ticket set; never mutated afterwards.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Notarization {
    pub block_hash: BlockHash,
    pub round: RoundNumber,
    pub tickets: Vec<VerificationTicket>,
}

impl Notarization {
    /// Snapshot a block's ticket set into a notarization message.
    pub fn of(block: &Block) -> Self {
        Self {
            block_hash: block.hash(),
            round: block.round(),
            tickets: block.tickets(),
        }
    }
}

/// Per-round summary persisted once the round is finalized.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockSummary {
    pub hash: BlockHash,
    pub round: RoundNumber,
    pub round_random_seed: Seed,
    pub txn_root: BlockHash,
}

impl BlockSummary {
    pub fn of(block: &Block) -> Self {
        Self {
            hash: block.hash(),
            round: block.round(),
            round_random_seed: block.seed(),
            txn_root: txn_root(block.transactions()),
        }
    }
}

fn txn_root(txns: &[Transaction]) -> BlockHash {
    BlockHash::new(fastcrypto::blake2b_256(|hasher| {
        for t in txns {
            hasher.update(&t.0);
        }
    }))
}

/// A candidate, notarized, or finalized block.
pub struct Block {
    hash: BlockHash,
    round: RoundNumber,
    prev_hash: BlockHash,
    seed: Seed,
    miner: PublicKey,
    /// Proposer's rank in the round permutation; lower is better.
    rank: usize,
    /// Monotone aggregate over the ancestry, used to order notarized blocks.
    chain_weight: u64,
    magic_block_hash: BlockHash,
    transactions: Vec<Transaction>,
    /// Tickets proving the parent's notarization, carried by the proposal.
    prev_tickets: Vec<VerificationTicket>,
    /// Proposer signature over the content hash.
    signature: Signature,

    // Runtime linkage, not part of the block's identity.
    parent: RwLock<Weak<Block>>,
    tickets: RwLock<Vec<VerificationTicket>>,
    notarized: AtomicBool,
    created: Instant,
}

/// Fields describing a block under construction.
pub struct BlockContent {
    pub round: RoundNumber,
    pub prev_hash: BlockHash,
    pub seed: Seed,
    pub miner: PublicKey,
    pub rank: usize,
    pub chain_weight: u64,
    pub magic_block_hash: BlockHash,
    pub transactions: Vec<Transaction>,
    pub prev_tickets: Vec<VerificationTicket>,
}

impl Block {
    /// Build a block, computing its content hash and letting the caller
    /// sign it in the same step.
    pub fn new<F>(content: BlockContent, sign: F) -> Self
    where
        F: FnOnce(&BlockHash) -> Signature,
    {
        let hash = compute_hash(&content);
        let signature = sign(&hash);
        Self {
            hash,
            round: content.round,
            prev_hash: content.prev_hash,
            seed: content.seed,
            miner: content.miner,
            rank: content.rank,
            chain_weight: content.chain_weight,
            magic_block_hash: content.magic_block_hash,
            transactions: content.transactions,
            prev_tickets: content.prev_tickets,
            signature,
            parent: RwLock::new(Weak::new()),
            tickets: RwLock::new(Vec::new()),
            notarized: AtomicBool::new(false),
            created: Instant::now(),
        }
    }

    /// The genesis block: round 0, already notarized and finalized.
    pub fn genesis(hash: BlockHash) -> Self {
        Self {
            hash,
            round: 0,
            prev_hash: BlockHash::default(),
            seed: 0,
            miner: PublicKey::default(),
            rank: 0,
            chain_weight: 0,
            magic_block_hash: BlockHash::default(),
            transactions: Vec::new(),
            prev_tickets: Vec::new(),
            signature: Signature::default(),
            parent: RwLock::new(Weak::new()),
            tickets: RwLock::new(Vec::new()),
            notarized: AtomicBool::new(true),
            created: Instant::now(),
        }
    }

    pub fn hash(&self) -> BlockHash {
        self.hash
    }

    pub fn round(&self) -> RoundNumber {
        self.round
    }

    pub fn prev_hash(&self) -> BlockHash {
        self.prev_hash
    }

    pub fn seed(&self) -> Seed {
        self.seed
    }

    pub fn miner(&self) -> &PublicKey {
        &self.miner
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn chain_weight(&self) -> u64 {
        self.chain_weight
    }

    pub fn magic_block_hash(&self) -> BlockHash {
        self.magic_block_hash
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    pub fn prev_tickets(&self) -> &[VerificationTicket] {
        &self.prev_tickets
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    /// Upgrade the weak parent link, if it is still alive.
    pub fn parent(&self) -> Option<Arc<Block>> {
        self.parent.read().expect("parent lock poisoned").upgrade()
    }

    pub fn set_parent(&self, parent: &Arc<Block>) {
        *self.parent.write().expect("parent lock poisoned") = Arc::downgrade(parent);
    }

    /// Add a verification ticket; returns false for a duplicate signer or
    /// a ticket addressed to a different block.
    pub fn add_ticket(&self, ticket: VerificationTicket) -> bool {
        if ticket.block_hash != self.hash {
            return false;
        }
        let mut tickets = self.tickets.write().expect("tickets lock poisoned");
        if tickets.iter().any(|t| t.signer == ticket.signer) {
            return false;
        }
        tickets.push(ticket);
        true
    }

    /// Merge another ticket set into this block's; returns how many were new.
    pub fn merge_tickets(&self, other: &[VerificationTicket]) -> usize {
        let mut tickets = self.tickets.write().expect("tickets lock poisoned");
        let mut added = 0;
        for ticket in other {
            if ticket.block_hash != self.hash {
                continue;
            }
            if tickets.iter().any(|t| t.signer == ticket.signer) {
                continue;
            }
            tickets.push(ticket.clone());
            added += 1;
        }
        added
    }

    /// Snapshot of the current ticket set.
    pub fn tickets(&self) -> Vec<VerificationTicket> {
        self.tickets.read().expect("tickets lock poisoned").clone()
    }

    pub fn ticket_count(&self) -> usize {
        self.tickets.read().expect("tickets lock poisoned").len()
    }

    pub fn set_notarized(&self) {
        self.notarized.store(true, Ordering::Release);
    }

    pub fn is_notarized(&self) -> bool {
        self.notarized.load(Ordering::Acquire)
    }
}

fn compute_hash(content: &BlockContent) -> BlockHash {
    BlockHash::new(fastcrypto::blake2b_256(|hasher| {
        hasher.update(content.round.to_le_bytes());
        hasher.update(content.prev_hash.as_bytes());
        hasher.update(content.seed.to_le_bytes());
        hasher.update(&content.miner);
        hasher.update((content.rank as u64).to_le_bytes());
        hasher.update(content.magic_block_hash.as_bytes());
        for t in &content.transactions {
            hasher.update(&t.0);
        }
    }))
}

impl PartialEq for Block {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for Block {}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        write!(
            f,
            "{}: B{}(r{}, {}, w{}, {}t)",
            self.hash,
            self.round,
            self.rank,
            self.miner.encode_base64(),
            self.chain_weight,
            self.ticket_count(),
        )
    }
}

/// Plain serialized form: identity fields plus the circulating ticket set.
/// Runtime linkage (parent pointer, creation instant) stays local.
#[derive(Serialize, Deserialize)]
struct BlockWire {
    round: RoundNumber,
    prev_hash: BlockHash,
    seed: Seed,
    miner: PublicKey,
    rank: usize,
    chain_weight: u64,
    magic_block_hash: BlockHash,
    transactions: Vec<Transaction>,
    prev_tickets: Vec<VerificationTicket>,
    signature: Signature,
    tickets: Vec<VerificationTicket>,
    notarized: bool,
}

impl Serialize for Block {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        BlockWire {
            round: self.round,
            prev_hash: self.prev_hash,
            seed: self.seed,
            miner: self.miner.clone(),
            rank: self.rank,
            chain_weight: self.chain_weight,
            magic_block_hash: self.magic_block_hash,
            transactions: self.transactions.clone(),
            prev_tickets: self.prev_tickets.clone(),
            signature: self.signature.clone(),
            tickets: self.tickets(),
            notarized: self.is_notarized(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Block {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let wire = BlockWire::deserialize(deserializer)?;
        // The hash is recomputed from content rather than trusted off the
        // wire; the notarized flag is not, receivers re-check quorum.
        let block = Block::new(
            BlockContent {
                round: wire.round,
                prev_hash: wire.prev_hash,
                seed: wire.seed,
                miner: wire.miner,
                rank: wire.rank,
                chain_weight: wire.chain_weight,
                magic_block_hash: wire.magic_block_hash,
                transactions: wire.transactions,
                prev_tickets: wire.prev_tickets,
            },
            |_| wire.signature,
        );
        block.merge_tickets(&wire.tickets);
        Ok(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fastcrypto::traits::KeyPair;

    fn test_key() -> PublicKey {
        fastcrypto::bls12381::BLS12381KeyPair::generate(&mut rand::thread_rng())
            .public()
            .clone()
    }

    fn test_block(rank: usize) -> Block {
        Block::new(
            BlockContent {
                round: 1,
                prev_hash: BlockHash::new([1u8; 32]),
                seed: 42,
                miner: test_key(),
                rank,
                chain_weight: 4,
                magic_block_hash: BlockHash::new([2u8; 32]),
                transactions: vec![Transaction(b"t0".to_vec())],
                prev_tickets: vec![],
            },
            |_| Signature::default(),
        )
    }

    fn ticket_for(block: &Block, signer: PublicKey) -> VerificationTicket {
        VerificationTicket {
            block_hash: block.hash(),
            signer,
            signature: Signature::default(),
        }
    }

    #[test]
    fn hash_is_content_addressed() {
        let a = test_block(0);
        let b = test_block(1);
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn duplicate_signer_is_rejected() {
        let block = test_block(0);
        let signer = test_key();
        assert!(block.add_ticket(ticket_for(&block, signer.clone())));
        assert!(!block.add_ticket(ticket_for(&block, signer)));
        assert_eq!(block.ticket_count(), 1);
    }

    #[test]
    fn ticket_for_other_block_is_rejected() {
        let block = test_block(0);
        let other = test_block(1);
        assert!(!block.add_ticket(ticket_for(&other, test_key())));
    }

    #[test]
    fn merge_skips_known_signers() {
        let block = test_block(0);
        let s1 = test_key();
        let s2 = test_key();
        block.add_ticket(ticket_for(&block, s1.clone()));
        let added = block.merge_tickets(&[ticket_for(&block, s1), ticket_for(&block, s2)]);
        assert_eq!(added, 1);
        assert_eq!(block.ticket_count(), 2);
    }

    #[test]
    fn parent_link_is_weak() {
        let child = test_block(0);
        {
            let parent = Arc::new(test_block(1));
            child.set_parent(&parent);
            assert!(child.parent().is_some());
        }
        assert!(child.parent().is_none());
    }
}
