//! Process-wide chain state.
//!
//! One instance per process: the round map, the block cache, the active
//! magic block(s), and the latest finalized block. Everything here is a
//! synchronized lookup; the protocol drives the actual transitions.

use crate::cache::BlockCache;
use crate::config::Config;
use crate::error::{ConsensusError, ConsensusResult};
use crate::interfaces::Signer;
use crate::round::Round;
use remora_types::{Block, BlockHash, MagicBlock, PublicKey, RoundNumber, Seed, VerificationTicket};
use blake2::digest::Update;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info};

/// The chain façade.
pub struct Chain {
    config: Config,
    self_id: PublicKey,
    genesis_hash: BlockHash,
    /// Magic blocks sorted by starting round; the last one is current.
    magic_blocks: RwLock<Vec<Arc<MagicBlock>>>,
    cache: BlockCache,
    rounds: Mutex<HashMap<RoundNumber, Arc<Round>>>,
    current_round: AtomicU64,
    latest_finalized: RwLock<Arc<Block>>,
}

impl Chain {
    /// Bootstrap a fresh chain from genesis under the given magic block.
    /// The genesis block is round 0, notarized and finalized by fiat, and
    /// seeds the beacon chain for round 1.
    pub fn bootstrap(config: Config, self_id: PublicKey, magic_block: MagicBlock) -> Arc<Self> {
        let genesis_hash = genesis_hash(&magic_block);
        let genesis = Arc::new(Block::genesis(genesis_hash));
        let chain = Self::with_latest(config, self_id, magic_block, genesis_hash, genesis.clone());
        let round = chain.create_round(0);
        round.set_seed_for_notarized_block(genesis_seed(genesis_hash));
        round.add_notarized(genesis.clone());
        round.finalize(genesis);
        info!(genesis = %genesis_hash, "chain bootstrapped from genesis");
        chain
    }

    /// Recover a chain whose latest finalized block was persisted.
    pub fn restore(
        config: Config,
        self_id: PublicKey,
        magic_block: MagicBlock,
        latest: Arc<Block>,
    ) -> Arc<Self> {
        let genesis_hash = genesis_hash(&magic_block);
        let chain = Self::with_latest(config, self_id, magic_block, genesis_hash, latest.clone());
        let round = chain.create_round(latest.round());
        round.set_seed_for_notarized_block(latest.seed());
        round.add_notarized(latest.clone());
        round.finalize(latest.clone());
        chain.current_round.store(latest.round(), Ordering::Release);
        info!(round = latest.round(), block = %latest.hash(), "chain restored from latest finalized block");
        chain
    }

    fn with_latest(
        config: Config,
        self_id: PublicKey,
        magic_block: MagicBlock,
        genesis_hash: BlockHash,
        latest: Arc<Block>,
    ) -> Arc<Self> {
        let cache = BlockCache::new();
        cache.insert(latest.clone());
        Arc::new(Self {
            config,
            self_id,
            genesis_hash,
            magic_blocks: RwLock::new(vec![Arc::new(magic_block)]),
            cache,
            rounds: Mutex::new(HashMap::new()),
            current_round: AtomicU64::new(latest.round()),
            latest_finalized: RwLock::new(latest),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn self_id(&self) -> &PublicKey {
        &self.self_id
    }

    pub fn genesis_hash(&self) -> BlockHash {
        self.genesis_hash
    }

    // ---- rounds ----

    pub fn round(&self, number: RoundNumber) -> Option<Arc<Round>> {
        self.rounds
            .lock()
            .expect("round map lock poisoned")
            .get(&number)
            .cloned()
    }

    /// Get or create the round object for `number`.
    pub fn create_round(&self, number: RoundNumber) -> Arc<Round> {
        self.rounds
            .lock()
            .expect("round map lock poisoned")
            .entry(number)
            .or_insert_with(|| Arc::new(Round::new(number)))
            .clone()
    }

    /// Drop round objects below `number`.
    pub fn delete_rounds_below(&self, number: RoundNumber) {
        self.rounds
            .lock()
            .expect("round map lock poisoned")
            .retain(|&n, _| n >= number);
    }

    pub fn current_round(&self) -> RoundNumber {
        self.current_round.load(Ordering::Acquire)
    }

    /// Raise the current round; never moves backwards.
    pub fn try_advance_round(&self, number: RoundNumber) {
        self.current_round.fetch_max(number, Ordering::AcqRel);
    }

    // ---- magic blocks ----

    /// The currently active committee definition.
    pub fn magic_block(&self) -> Arc<MagicBlock> {
        let blocks = self.magic_blocks.read().expect("magic block lock poisoned");
        blocks.last().expect("at least one magic block").clone()
    }

    /// The committee active at a given round. Blocks are verified under
    /// the committee of their own round, which matters at magic-block
    /// boundaries.
    pub fn magic_block_for_round(&self, round: RoundNumber) -> Arc<MagicBlock> {
        let blocks = self.magic_blocks.read().expect("magic block lock poisoned");
        blocks
            .iter()
            .rev()
            .find(|mb| mb.starting_round <= round)
            .unwrap_or_else(|| blocks.first().expect("at least one magic block"))
            .clone()
    }

    /// Install a newer committee definition.
    pub fn add_magic_block(&self, magic_block: MagicBlock) {
        let mut blocks = self.magic_blocks.write().expect("magic block lock poisoned");
        blocks.push(Arc::new(magic_block));
        blocks.sort_by_key(|mb| mb.starting_round);
    }

    /// Whether a block names the active magic block.
    pub fn validate_magic_block(&self, block: &Block) -> bool {
        block.magic_block_hash() == self.magic_block().hash
    }

    // ---- blocks ----

    pub fn cache(&self) -> &BlockCache {
        &self.cache
    }

    /// Add a block to the speculative cache.
    pub fn add_block(&self, block: Arc<Block>) -> Arc<Block> {
        let floor = self.latest_finalized().round();
        self.cache.add(block, floor)
    }

    pub fn block(&self, hash: BlockHash) -> Option<Arc<Block>> {
        self.cache.get(hash)
    }

    pub fn latest_finalized(&self) -> Arc<Block> {
        self.latest_finalized
            .read()
            .expect("latest finalized lock poisoned")
            .clone()
    }

    pub fn set_latest_finalized(&self, block: Arc<Block>) {
        let mut latest = self
            .latest_finalized
            .write()
            .expect("latest finalized lock poisoned");
        if block.round() > latest.round() {
            *latest = block;
        }
    }

    /// The block a generator should extend: the heaviest notarized block
    /// of the prior round.
    pub fn block_to_extend(&self, round: &Round) -> Option<Arc<Block>> {
        round.heaviest_notarized_block()
    }

    /// Whether a block's ticket set reaches the committee threshold.
    pub fn is_block_notarized(&self, block: &Block) -> bool {
        let threshold = self.magic_block_for_round(block.round()).threshold();
        block.ticket_count() >= threshold
    }

    /// Verify a ticket set as a notarization of `block_hash` at `round`:
    /// at least T distinct committee members, every signature valid.
    pub fn verify_notarization(
        &self,
        signer: &dyn Signer,
        block_hash: BlockHash,
        round: RoundNumber,
        tickets: &[VerificationTicket],
    ) -> ConsensusResult<()> {
        if round == 0 {
            // Genesis carries no tickets.
            return Ok(());
        }
        let magic_block = self.magic_block_for_round(round);
        let mut signers: HashSet<&PublicKey> = HashSet::new();
        for ticket in tickets {
            if ticket.block_hash != block_hash {
                continue;
            }
            if !magic_block.contains(&ticket.signer) {
                debug!(round, block = %block_hash, "ticket from non-member");
                continue;
            }
            if signers.contains(&ticket.signer) {
                continue;
            }
            if !signer.verify(&ticket.block_hash, &ticket.signature, &ticket.signer) {
                return Err(ConsensusError::InvalidNotarization(format!(
                    "bad ticket signature on {}",
                    block_hash
                )));
            }
            signers.insert(&ticket.signer);
        }
        if signers.len() < magic_block.threshold() {
            return Err(ConsensusError::InvalidNotarization(format!(
                "{} of {} tickets for {}",
                signers.len(),
                magic_block.threshold(),
                block_hash
            )));
        }
        Ok(())
    }
}

/// Derive the genesis block hash from the founding magic block.
fn genesis_hash(magic_block: &MagicBlock) -> BlockHash {
    BlockHash::new(fastcrypto::blake2b_256(|hasher| {
        hasher.update(b"remora-genesis-v1");
        hasher.update(magic_block.hash.as_bytes());
    }))
}

/// A non-zero seed for round 0, so round 1's beacon message can form.
fn genesis_seed(hash: BlockHash) -> Seed {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash.as_bytes()[..8]);
    let seed = (u64::from_le_bytes(bytes) >> 1) as Seed;
    if seed == 0 {
        1
    } else {
        seed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fastcrypto::traits::KeyPair;
    use remora_types::Signature;

    fn keys(n: usize) -> Vec<PublicKey> {
        (0..n)
            .map(|_| {
                fastcrypto::bls12381::BLS12381KeyPair::generate(&mut rand::thread_rng())
                    .public()
                    .clone()
            })
            .collect()
    }

    struct AcceptAll;

    impl Signer for AcceptAll {
        fn sign(&self, _hash: &BlockHash) -> Signature {
            Signature::default()
        }
        fn verify(&self, _hash: &BlockHash, _sig: &Signature, _party: &PublicKey) -> bool {
            true
        }
    }

    fn test_chain() -> (Arc<Chain>, Vec<PublicKey>) {
        let ids = keys(4);
        let mb = MagicBlock::new(1, 0, ids.clone(), vec![], 3);
        let chain = Chain::bootstrap(Config::default(), ids[0].clone(), mb);
        (chain, ids)
    }

    #[test]
    fn bootstrap_finalizes_genesis() {
        let (chain, _) = test_chain();
        let genesis = chain.latest_finalized();
        assert_eq!(genesis.round(), 0);
        assert!(genesis.is_notarized());
        assert!(chain.block(genesis.hash()).is_some());
        let round0 = chain.round(0).unwrap();
        assert!(round0.is_finalized());
        assert!(round0.has_seed());
        assert_ne!(round0.seed(), 0);
    }

    #[test]
    fn create_round_is_idempotent() {
        let (chain, _) = test_chain();
        let a = chain.create_round(3);
        let b = chain.create_round(3);
        assert!(Arc::ptr_eq(&a, &b));
        chain.delete_rounds_below(3);
        assert!(chain.round(0).is_none());
        assert!(chain.round(3).is_some());
    }

    #[test]
    fn magic_block_for_round_picks_the_active_committee() {
        let (chain, _) = test_chain();
        let later = MagicBlock::new(2, 100, keys(4), vec![], 3);
        let later_hash = later.hash;
        chain.add_magic_block(later);
        assert_eq!(chain.magic_block_for_round(50).number, 1);
        assert_eq!(chain.magic_block_for_round(100).number, 2);
        assert_eq!(chain.magic_block().hash, later_hash);
    }

    #[test]
    fn notarization_needs_a_quorum_of_members() {
        let (chain, ids) = test_chain();
        let hash = BlockHash::new([9u8; 32]);
        let ticket = |signer: &PublicKey| VerificationTicket {
            block_hash: hash,
            signer: signer.clone(),
            signature: Signature::default(),
        };

        // two distinct members and one duplicate: below threshold
        let tickets = vec![ticket(&ids[0]), ticket(&ids[1]), ticket(&ids[1])];
        assert!(chain
            .verify_notarization(&AcceptAll, hash, 1, &tickets)
            .is_err());

        // an outsider does not count
        let outsider = keys(1).remove(0);
        let tickets = vec![ticket(&ids[0]), ticket(&ids[1]), ticket(&outsider)];
        assert!(chain
            .verify_notarization(&AcceptAll, hash, 1, &tickets)
            .is_err());

        let tickets = vec![ticket(&ids[0]), ticket(&ids[1]), ticket(&ids[2])];
        assert!(chain
            .verify_notarization(&AcceptAll, hash, 1, &tickets)
            .is_ok());
    }

    #[test]
    fn current_round_never_regresses() {
        let (chain, _) = test_chain();
        chain.try_advance_round(5);
        chain.try_advance_round(3);
        assert_eq!(chain.current_round(), 5);
    }
}
