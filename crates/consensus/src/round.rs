//! Per-round consensus state.
//!
//! A round owns everything that accumulates while the committee works on
//! one block height: proposed and notarized blocks, beacon shares, the
//! rank permutation, and the timeout bookkeeping that drives restarts.
//! All collection mutations are serialized by the round's lock; state and
//! seed are atomics so the hot-path readers never block.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use remora_types::{Block, MagicBlock, Member, PublicKey, RoundNumber, Seed, VrfShare};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

/// Lifecycle of a round. Transitions are monotonic except through
/// `restart`/`reset_state`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum RoundState {
    SharingVrf = 0,
    VrfComplete = 1,
    Generating = 2,
    Generated = 3,
    CollectingProposals = 4,
    VerificationTimedOut = 5,
    Finalizing = 6,
    Finalized = 7,
}

impl RoundState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::SharingVrf,
            1 => Self::VrfComplete,
            2 => Self::Generating,
            3 => Self::Generated,
            4 => Self::CollectingProposals,
            5 => Self::VerificationTimedOut,
            6 => Self::Finalizing,
            _ => Self::Finalized,
        }
    }
}

/// Timeout-count votes and incrementation.
struct TimeoutCounter {
    count: u32,
    /// timeout number -> votes
    votes: HashMap<u32, usize>,
    /// members that already voted this cycle
    voted: HashSet<PublicKey>,
}

impl TimeoutCounter {
    fn new() -> Self {
        Self {
            count: 0,
            votes: HashMap::new(),
            voted: HashSet::new(),
        }
    }

    fn add_vote(&mut self, num: u32, voter: PublicKey) {
        if self.voted.contains(&voter) {
            return;
        }
        *self.votes.entry(num).or_insert(0) += 1;
        self.voted.insert(voter);
    }

    fn increment(&mut self) -> u32 {
        let mut most_votes = 0;
        let mut winner = self.count;
        for (&num, &votes) in &self.votes {
            if votes > most_votes || (votes == most_votes && num > winner) {
                most_votes = votes;
                winner = num;
            }
        }
        self.votes.clear();
        self.voted.clear();
        self.count = (self.count + 1).max(winner + 1);
        self.count
    }

    fn set(&mut self, count: u32) -> bool {
        if count <= self.count {
            return false;
        }
        self.count = count;
        true
    }
}

/// The collector's intake, created once per round instance.
struct VerifyState {
    sender: Option<mpsc::Sender<Arc<Block>>>,
    cancel: Option<watch::Sender<bool>>,
    started: bool,
}

impl VerifyState {
    fn new() -> Self {
        Self {
            sender: None,
            cancel: None,
            started: false,
        }
    }
}

struct Inner {
    /// `perm[set_index]` is the member's rank; empty until computed.
    perm: Vec<usize>,
    /// Proposed blocks, rank ascending.
    proposed: Vec<Arc<Block>>,
    /// Notarized blocks, chain weight descending, at most one per rank.
    notarized: Vec<Arc<Block>>,
    /// The block currently chosen: the generator's own block, the best
    /// verified proposal, or the finalized block once the round ends.
    best: Option<Arc<Block>>,
    /// Beacon shares, one per party.
    shares: HashMap<PublicKey, VrfShare>,
    /// Hex random-beacon output once the group signature combined.
    vrf_output: String,
}

impl Inner {
    fn new() -> Self {
        Self {
            perm: Vec::new(),
            proposed: Vec::new(),
            notarized: Vec::new(),
            best: None,
            shares: HashMap::new(),
            vrf_output: String::new(),
        }
    }
}

/// Per-round state, shared by the chain and the round's tasks.
pub struct Round {
    number: RoundNumber,
    state: AtomicU8,
    seed: AtomicI64,
    has_seed: AtomicBool,
    soft_timeout_count: AtomicU32,
    watchdog_claimed: AtomicBool,
    inner: RwLock<Inner>,
    tc: Mutex<TimeoutCounter>,
    verify: Mutex<VerifyState>,
    vrf_start: Mutex<Option<Instant>>,
}

impl Round {
    pub fn new(number: RoundNumber) -> Self {
        Self {
            number,
            state: AtomicU8::new(RoundState::SharingVrf as u8),
            seed: AtomicI64::new(0),
            has_seed: AtomicBool::new(false),
            soft_timeout_count: AtomicU32::new(0),
            watchdog_claimed: AtomicBool::new(false),
            inner: RwLock::new(Inner::new()),
            tc: Mutex::new(TimeoutCounter::new()),
            verify: Mutex::new(VerifyState::new()),
            vrf_start: Mutex::new(None),
        }
    }

    pub fn number(&self) -> RoundNumber {
        self.number
    }

    // ---- state machine ----

    pub fn state(&self) -> RoundState {
        RoundState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Advance the state; lower states are never re-entered this way.
    pub fn set_state(&self, state: RoundState) {
        self.state.fetch_max(state as u8, Ordering::AcqRel);
    }

    /// Force the state, regardless of ordering. Restart path only.
    pub fn reset_state(&self, state: RoundState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn is_vrf_complete(&self) -> bool {
        self.state() >= RoundState::VrfComplete
    }

    pub fn is_finalizing(&self) -> bool {
        self.state() == RoundState::Finalizing
    }

    pub fn is_finalized(&self) -> bool {
        self.state() == RoundState::Finalized || self.number == 0
    }

    /// One-shot transition into `Finalizing`.
    pub fn set_finalizing(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current >= RoundState::Finalizing as u8 {
                return false;
            }
            match self.state.compare_exchange(
                current,
                RoundState::Finalizing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Pin the round's final block and mark it finalized.
    pub fn finalize(&self, block: Arc<Block>) {
        self.inner.write().expect("round lock poisoned").best = Some(block);
        self.set_state(RoundState::Finalized);
    }

    // ---- seed ----

    pub fn seed(&self) -> Seed {
        self.seed.load(Ordering::Acquire)
    }

    pub fn has_seed(&self) -> bool {
        self.has_seed.load(Ordering::Acquire)
    }

    /// Set the beacon-derived seed. One-shot: the first caller wins and
    /// the round advances to `VrfComplete`; later calls are ignored.
    pub fn set_random_seed(&self, seed: Seed) -> bool {
        let mut inner = self.inner.write().expect("round lock poisoned");
        if self
            .has_seed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.seed.store(seed, Ordering::Release);
        self.set_state(RoundState::VrfComplete);
        inner.perm.clear();
        true
    }

    /// Adopt the seed carried by an imported notarized block. Sets the
    /// seed without advancing the state machine.
    pub fn set_seed_for_notarized_block(&self, seed: Seed) {
        let mut inner = self.inner.write().expect("round lock poisoned");
        self.seed.store(seed, Ordering::Release);
        self.has_seed.store(true, Ordering::Release);
        inner.perm.clear();
    }

    /// Store a fallback seed while the real beacon is still running. Does
    /// not claim the has-seed flag, so the beacon result still lands.
    pub fn set_provisional_seed(&self, seed: Seed) -> bool {
        let mut inner = self.inner.write().expect("round lock poisoned");
        if self.has_seed.load(Ordering::Acquire) {
            return false;
        }
        self.seed.store(seed, Ordering::Release);
        inner.perm.clear();
        true
    }

    // ---- rank permutation ----

    /// Deterministic permutation of committee indices from the seed.
    pub fn compute_member_ranks(&self, committee: &MagicBlock) {
        let seed = self.seed();
        let mut perm: Vec<usize> = (0..committee.size()).collect();
        perm.shuffle(&mut StdRng::seed_from_u64(seed as u64));
        info!(
            round = self.number,
            committee = committee.size(),
            "computed member ranks"
        );
        self.inner.write().expect("round lock poisoned").perm = perm;
    }

    /// A member's rank this round; `None` until ranks are computed.
    pub fn member_rank(&self, member: &Member) -> Option<usize> {
        let inner = self.inner.read().expect("round lock poisoned");
        inner.perm.get(member.set_index).copied()
    }

    /// Rank of an arbitrary member id under the given committee.
    pub fn rank_of(&self, committee: &MagicBlock, id: &PublicKey) -> Option<usize> {
        let set_index = committee.set_index(id)?;
        let inner = self.inner.read().expect("round lock poisoned");
        inner.perm.get(set_index).copied()
    }

    /// The committee ordered by rank, best first. Members without a rank
    /// sort last.
    pub fn members_by_rank(&self, committee: &MagicBlock) -> Vec<Member> {
        let inner = self.inner.read().expect("round lock poisoned");
        let mut members = committee.miners();
        members.sort_by_key(|m| inner.perm.get(m.set_index).copied().unwrap_or(usize::MAX));
        members
    }

    // ---- proposals and notarized blocks ----

    /// Record a proposed block, keeping the set rank-sorted. Idempotent on
    /// hash; returns the stored block and whether it was new.
    pub fn add_proposed(&self, block: Arc<Block>) -> (Arc<Block>, bool) {
        let mut inner = self.inner.write().expect("round lock poisoned");
        Self::add_proposed_locked(&mut inner, block)
    }

    fn add_proposed_locked(inner: &mut Inner, block: Arc<Block>) -> (Arc<Block>, bool) {
        if let Some(existing) = inner.proposed.iter().find(|b| b.hash() == block.hash()) {
            return (existing.clone(), false);
        }
        inner.proposed.push(block.clone());
        inner.proposed.sort_by_key(|b| b.rank());
        (block, true)
    }

    pub fn proposed_blocks(&self) -> Vec<Arc<Block>> {
        self.inner
            .read()
            .expect("round lock poisoned")
            .proposed
            .clone()
    }

    /// Record a notarized block.
    ///
    /// A block already present by hash has the new tickets merged into it;
    /// a different block of the same rank is superseded. The round's best
    /// block moves whenever a lower rank lands. Returns the kept block and
    /// whether the set grew.
    pub fn add_notarized(&self, block: Arc<Block>) -> (Arc<Block>, bool) {
        let mut inner = self.inner.write().expect("round lock poisoned");
        let (block, _) = Self::add_proposed_locked(&mut inner, block);

        if let Some(existing) = inner
            .notarized
            .iter()
            .find(|b| b.hash() == block.hash())
            .cloned()
        {
            if !Arc::ptr_eq(&existing, &block) {
                existing.merge_tickets(&block.tickets());
            }
            return (existing, false);
        }

        if let Some(pos) = inner.notarized.iter().position(|b| b.rank() == block.rank()) {
            let old = inner.notarized.remove(pos);
            info!(
                round = self.number,
                old = %old.hash(),
                new = %block.hash(),
                rank = block.rank(),
                "removing the old notarized block with the same rank"
            );
        }

        block.set_notarized();
        let better = match &inner.best {
            None => true,
            Some(best) => best.rank() > block.rank(),
        };
        if better {
            inner.best = Some(block.clone());
        }
        inner.notarized.push(block.clone());
        inner
            .notarized
            .sort_by(|a, b| b.chain_weight().cmp(&a.chain_weight()));
        (block, true)
    }

    pub fn notarized_blocks(&self) -> Vec<Arc<Block>> {
        self.inner
            .read()
            .expect("round lock poisoned")
            .notarized
            .clone()
    }

    /// The notarized block with the greatest chain weight.
    pub fn heaviest_notarized_block(&self) -> Option<Arc<Block>> {
        self.inner
            .read()
            .expect("round lock poisoned")
            .notarized
            .first()
            .cloned()
    }

    /// The notarized block with the best (lowest) rank.
    pub fn best_ranked_notarized_block(&self) -> Option<Arc<Block>> {
        self.inner
            .read()
            .expect("round lock poisoned")
            .notarized
            .iter()
            .min_by_key(|b| b.rank())
            .cloned()
    }

    pub fn best_block(&self) -> Option<Arc<Block>> {
        self.inner.read().expect("round lock poisoned").best.clone()
    }

    pub fn set_best_block(&self, block: Arc<Block>) {
        self.inner.write().expect("round lock poisoned").best = Some(block);
    }

    // ---- beacon shares ----

    /// Admit a beacon share. Rejected once the threshold is reached or
    /// when the party already contributed.
    pub fn add_vrf_share(&self, share: VrfShare, threshold: usize) -> bool {
        let mut inner = self.inner.write().expect("round lock poisoned");
        if inner.shares.len() >= threshold {
            debug!(round = self.number, "share set already at threshold");
            return false;
        }
        if inner.shares.contains_key(&share.party) {
            debug!(round = self.number, "duplicate vrf share");
            return false;
        }
        inner.shares.insert(share.party.clone(), share);
        true
    }

    /// Record a share that arrived after the threshold, for completeness;
    /// never re-triggers seed derivation.
    pub fn add_additional_vrf_share(&self, share: VrfShare) -> bool {
        let mut inner = self.inner.write().expect("round lock poisoned");
        if inner.shares.contains_key(&share.party) {
            return false;
        }
        inner.shares.insert(share.party.clone(), share);
        true
    }

    pub fn vrf_shares(&self) -> Vec<VrfShare> {
        self.inner
            .read()
            .expect("round lock poisoned")
            .shares
            .values()
            .cloned()
            .collect()
    }

    pub fn share_count(&self) -> usize {
        self.inner.read().expect("round lock poisoned").shares.len()
    }

    pub fn set_vrf_output(&self, output: String) {
        self.inner.write().expect("round lock poisoned").vrf_output = output;
    }

    pub fn vrf_output(&self) -> String {
        self.inner
            .read()
            .expect("round lock poisoned")
            .vrf_output
            .clone()
    }

    // ---- timeout counter ----

    pub fn add_timeout_vote(&self, num: u32, voter: PublicKey) {
        self.tc
            .lock()
            .expect("timeout counter lock poisoned")
            .add_vote(num, voter);
    }

    /// Pick the most voted timeout number (higher number breaks ties),
    /// reset the votes, and raise the count to
    /// `max(current + 1, winner + 1)`.
    pub fn increment_timeout_count(&self) -> u32 {
        self.tc
            .lock()
            .expect("timeout counter lock poisoned")
            .increment()
    }

    /// Raise the count to `count` if greater than the current one.
    pub fn set_timeout_count(&self, count: u32) -> bool {
        self.tc
            .lock()
            .expect("timeout counter lock poisoned")
            .set(count)
    }

    pub fn timeout_count(&self) -> u32 {
        self.tc.lock().expect("timeout counter lock poisoned").count
    }

    pub fn soft_timeout_count(&self) -> u32 {
        self.soft_timeout_count.load(Ordering::Acquire)
    }

    pub fn inc_soft_timeout_count(&self) -> u32 {
        self.soft_timeout_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    // ---- collector plumbing ----

    /// Hand out the collector's receiving ends, exactly once per round
    /// instance. Later callers get `None` and push into the channel
    /// instead.
    pub fn start_verification(
        &self,
        capacity: usize,
    ) -> Option<(mpsc::Receiver<Arc<Block>>, watch::Receiver<bool>)> {
        let mut verify = self.verify.lock().expect("verify lock poisoned");
        if verify.started {
            return None;
        }
        let (tx, rx) = mpsc::channel(capacity);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        verify.sender = Some(tx);
        verify.cancel = Some(cancel_tx);
        verify.started = true;
        Some((rx, cancel_rx))
    }

    /// The proposal intake, while verification is running.
    pub fn block_sender(&self) -> Option<mpsc::Sender<Arc<Block>>> {
        self.verify
            .lock()
            .expect("verify lock poisoned")
            .sender
            .clone()
    }

    /// Stop the collector and close the intake.
    pub fn cancel_verification(&self) {
        let mut verify = self.verify.lock().expect("verify lock poisoned");
        if let Some(cancel) = verify.cancel.take() {
            let _ = cancel.send(true);
        }
        verify.sender = None;
    }

    /// Claim the round's watchdog slot; only the first caller spawns one.
    pub fn claim_watchdog(&self) -> bool {
        !self.watchdog_claimed.swap(true, Ordering::AcqRel)
    }

    // ---- restart ----

    /// Re-initialize for another attempt: proposals, notarized blocks,
    /// shares, seed, and the collector are reset; the timeout counter
    /// survives.
    pub fn restart(&self) {
        {
            let mut inner = self.inner.write().expect("round lock poisoned");
            *inner = Inner::new();
            self.has_seed.store(false, Ordering::Release);
            self.seed.store(0, Ordering::Release);
        }
        *self.verify.lock().expect("verify lock poisoned") = VerifyState::new();
        self.soft_timeout_count.store(0, Ordering::Release);
        self.reset_state(RoundState::SharingVrf);
    }

    // ---- beacon latency bookkeeping ----

    pub fn set_vrf_start_time(&self, at: Instant) {
        *self.vrf_start.lock().expect("vrf start lock poisoned") = Some(at);
    }

    pub fn vrf_start_time(&self) -> Option<Instant> {
        *self.vrf_start.lock().expect("vrf start lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fastcrypto::traits::KeyPair;
    use remora_types::{BlockContent, BlockHash, Signature};

    fn key() -> PublicKey {
        fastcrypto::bls12381::BLS12381KeyPair::generate(&mut rand::thread_rng())
            .public()
            .clone()
    }

    fn block(round: RoundNumber, rank: usize, weight: u64) -> Arc<Block> {
        Arc::new(Block::new(
            BlockContent {
                round,
                prev_hash: BlockHash::default(),
                seed: 1,
                miner: key(),
                rank,
                chain_weight: weight,
                magic_block_hash: BlockHash::default(),
                transactions: vec![],
                prev_tickets: vec![],
            },
            |_| Signature::default(),
        ))
    }

    fn share(round: RoundNumber, tc: u32, party: PublicKey) -> VrfShare {
        VrfShare {
            round,
            timeout_count: tc,
            party,
            share: "aa".into(),
        }
    }

    #[test]
    fn proposed_blocks_are_rank_sorted_and_deduplicated() {
        let round = Round::new(1);
        let b2 = block(1, 2, 1);
        let b0 = block(1, 0, 1);
        let b1 = block(1, 1, 1);
        assert!(round.add_proposed(b2.clone()).1);
        assert!(round.add_proposed(b0).1);
        assert!(round.add_proposed(b1).1);
        assert!(!round.add_proposed(b2).1);

        let ranks: Vec<usize> = round.proposed_blocks().iter().map(|b| b.rank()).collect();
        assert_eq!(ranks, vec![0, 1, 2]);
        assert_eq!(round.proposed_blocks().len(), 3);
    }

    #[test]
    fn add_notarized_twice_merges_tickets() {
        let round = Round::new(1);
        let b = block(1, 0, 10);
        let (kept, grew) = round.add_notarized(b.clone());
        assert!(grew);
        assert!(kept.is_notarized());
        let (again, grew) = round.add_notarized(b);
        assert!(!grew);
        assert!(Arc::ptr_eq(&kept, &again));
        assert_eq!(round.notarized_blocks().len(), 1);
    }

    #[test]
    fn same_rank_notarized_block_is_superseded() {
        let round = Round::new(1);
        let old = block(1, 0, 10);
        let new = block(1, 0, 12);
        round.add_notarized(old.clone());
        let (_, grew) = round.add_notarized(new.clone());
        assert!(grew);
        let notarized = round.notarized_blocks();
        assert_eq!(notarized.len(), 1);
        assert_eq!(notarized[0].hash(), new.hash());
    }

    #[test]
    fn notarized_blocks_have_distinct_ranks_and_weight_order() {
        let round = Round::new(1);
        round.add_notarized(block(1, 2, 5));
        round.add_notarized(block(1, 0, 9));
        round.add_notarized(block(1, 1, 7));
        round.add_notarized(block(1, 1, 8));

        let notarized = round.notarized_blocks();
        let mut ranks: Vec<usize> = notarized.iter().map(|b| b.rank()).collect();
        ranks.sort_unstable();
        ranks.dedup();
        assert_eq!(ranks.len(), notarized.len());

        let weights: Vec<u64> = notarized.iter().map(|b| b.chain_weight()).collect();
        let mut sorted = weights.clone();
        sorted.sort_unstable_by(|a, b| b.cmp(a));
        assert_eq!(weights, sorted);
        assert_eq!(round.heaviest_notarized_block().unwrap().chain_weight(), 9);
    }

    #[test]
    fn best_block_follows_lowest_rank() {
        let round = Round::new(1);
        round.add_notarized(block(1, 3, 5));
        assert_eq!(round.best_block().unwrap().rank(), 3);
        round.add_notarized(block(1, 1, 4));
        assert_eq!(round.best_block().unwrap().rank(), 1);
        round.add_notarized(block(1, 2, 6));
        assert_eq!(round.best_block().unwrap().rank(), 1);
        assert_eq!(round.best_ranked_notarized_block().unwrap().rank(), 1);
    }

    #[test]
    fn vrf_share_admission() {
        let round = Round::new(2);
        let p1 = key();
        assert!(round.add_vrf_share(share(2, 0, p1.clone()), 2));
        // duplicate party
        assert!(!round.add_vrf_share(share(2, 0, p1), 2));
        assert!(round.add_vrf_share(share(2, 0, key()), 2));
        // threshold reached
        assert!(!round.add_vrf_share(share(2, 0, key()), 2));
        assert_eq!(round.share_count(), 2);
        // late shares are only recorded
        assert!(round.add_additional_vrf_share(share(2, 0, key())));
        assert_eq!(round.share_count(), 3);
    }

    #[test]
    fn random_seed_is_one_shot() {
        let round = Round::new(1);
        assert!(round.set_random_seed(42));
        assert!(!round.set_random_seed(43));
        assert_eq!(round.seed(), 42);
        assert_eq!(round.state(), RoundState::VrfComplete);
    }

    #[test]
    fn provisional_seed_yields_to_the_beacon() {
        let round = Round::new(1);
        assert!(round.set_provisional_seed(10));
        assert!(!round.has_seed());
        assert_eq!(round.seed(), 10);
        assert_eq!(round.state(), RoundState::SharingVrf);
        assert!(round.set_random_seed(42));
        assert_eq!(round.seed(), 42);
        assert!(!round.set_provisional_seed(11));
        assert_eq!(round.seed(), 42);
    }

    #[test]
    fn notarized_block_seed_does_not_advance_state() {
        let round = Round::new(5);
        round.set_seed_for_notarized_block(77);
        assert!(round.has_seed());
        assert_eq!(round.seed(), 77);
        assert_eq!(round.state(), RoundState::SharingVrf);
    }

    #[test]
    fn rank_permutation_is_deterministic() {
        let committee = MagicBlock::new(1, 0, (0..4).map(|_| key()).collect(), vec![], 3);
        let a = Round::new(1);
        let b = Round::new(1);
        a.set_random_seed(99);
        b.set_random_seed(99);
        a.compute_member_ranks(&committee);
        b.compute_member_ranks(&committee);
        for member in committee.miners() {
            assert_eq!(a.member_rank(&member), b.member_rank(&member));
        }
        let ranked = a.members_by_rank(&committee);
        let ranks: Vec<usize> = ranked
            .iter()
            .map(|m| a.member_rank(m).unwrap())
            .collect();
        assert_eq!(ranks, vec![0, 1, 2, 3]);
    }

    #[test]
    fn timeout_votes_pick_the_most_voted_number() {
        let round = Round::new(1);
        round.add_timeout_vote(3, key());
        round.add_timeout_vote(3, key());
        round.add_timeout_vote(5, key());
        assert_eq!(round.increment_timeout_count(), 4);

        // higher number wins the tie
        round.add_timeout_vote(6, key());
        round.add_timeout_vote(8, key());
        assert_eq!(round.increment_timeout_count(), 9);

        // no votes: plain increment
        assert_eq!(round.increment_timeout_count(), 10);
    }

    #[test]
    fn timeout_votes_deduplicate_by_voter() {
        let round = Round::new(1);
        let voter = key();
        round.add_timeout_vote(7, voter.clone());
        round.add_timeout_vote(7, voter);
        round.add_timeout_vote(2, key());
        round.add_timeout_vote(2, key());
        // 2 has two votes, 7 only one
        assert_eq!(round.increment_timeout_count(), 3);
    }

    #[test]
    fn set_timeout_count_only_raises() {
        let round = Round::new(1);
        assert!(round.set_timeout_count(4));
        assert!(!round.set_timeout_count(4));
        assert!(!round.set_timeout_count(2));
        assert_eq!(round.timeout_count(), 4);
    }

    #[test]
    fn restart_resets_everything_but_the_timeout_counter() {
        let round = Round::new(1);
        round.set_random_seed(42);
        round.add_notarized(block(1, 0, 3));
        round.add_vrf_share(share(1, 0, key()), 3);
        round.set_timeout_count(2);
        round.inc_soft_timeout_count();

        round.restart();
        assert!(!round.has_seed());
        assert_eq!(round.seed(), 0);
        assert!(round.proposed_blocks().is_empty());
        assert!(round.notarized_blocks().is_empty());
        assert!(round.best_block().is_none());
        assert_eq!(round.share_count(), 0);
        assert_eq!(round.state(), RoundState::SharingVrf);
        assert_eq!(round.soft_timeout_count(), 0);
        assert_eq!(round.timeout_count(), 2);
    }

    #[test]
    fn state_is_monotonic_until_reset() {
        let round = Round::new(1);
        round.set_state(RoundState::CollectingProposals);
        round.set_state(RoundState::Generating);
        assert_eq!(round.state(), RoundState::CollectingProposals);
        round.reset_state(RoundState::SharingVrf);
        assert_eq!(round.state(), RoundState::SharingVrf);
    }

    #[test]
    fn finalizing_is_one_shot() {
        let round = Round::new(1);
        assert!(round.set_finalizing());
        assert!(!round.set_finalizing());
        round.finalize(block(1, 0, 1));
        assert!(round.is_finalized());
        assert!(!round.set_finalizing());
    }

    #[test]
    fn verification_handle_is_created_once() {
        let round = Round::new(1);
        let first = round.start_verification(8);
        assert!(first.is_some());
        assert!(round.start_verification(8).is_none());
        assert!(round.block_sender().is_some());
        round.cancel_verification();
        assert!(round.block_sender().is_none());
        // a restart allows a fresh collector
        round.restart();
        assert!(round.start_verification(8).is_some());
    }
}
