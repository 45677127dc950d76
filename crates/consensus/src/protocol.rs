//! Round orchestration.
//!
//! `Protocol` wires the chain, the beacon, the collaborator traits, and
//! the per-round tasks together: it starts rounds when their seed is
//! known, re-broadcasts beacon shares on soft timeouts, restarts rounds
//! whose verification timed out, and finalizes a round once its successor
//! is notarized.

use crate::beacon::Beacon;
use crate::chain::Chain;
use crate::error::ConsensusResult;
use crate::fetcher::FinalizedBlockFetcher;
use crate::generator::Generator;
use crate::interfaces::{
    BeaconOracle, BlockStateHandler, Peers, ProtocolMessage, Signer, TransactionPool,
};
use crate::round::{Round, RoundState};
use crate::storage::{load_dkg, SummaryStore};
use rand::Rng;
use remora_types::{Block, BlockSummary, RoundNumber, Seed, VrfShare};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Round objects are garbage collected this far behind the latest
/// finalized round.
const ROUND_RETENTION: RoundNumber = 10;

/// The consensus protocol engine for one node.
pub struct Protocol {
    chain: Arc<Chain>,
    pool: Arc<dyn TransactionPool>,
    signer: Arc<dyn Signer>,
    peers: Arc<dyn Peers>,
    state_handler: Arc<dyn BlockStateHandler>,
    store: Arc<dyn SummaryStore>,
    beacon: Beacon,
    fetcher: FinalizedBlockFetcher,
}

impl Protocol {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chain: Arc<Chain>,
        pool: Arc<dyn TransactionPool>,
        signer: Arc<dyn Signer>,
        oracle: Arc<dyn BeaconOracle>,
        peers: Arc<dyn Peers>,
        state_handler: Arc<dyn BlockStateHandler>,
        store: Arc<dyn SummaryStore>,
    ) -> Arc<Self> {
        let dkg_enabled = chain.config().dkg_enabled;
        Arc::new(Self {
            chain,
            pool,
            signer,
            peers,
            state_handler,
            store,
            beacon: Beacon::new(oracle, dkg_enabled),
            fetcher: FinalizedBlockFetcher::new(),
        })
    }

    pub fn chain(&self) -> &Arc<Chain> {
        &self.chain
    }

    pub fn beacon(&self) -> &Beacon {
        &self.beacon
    }

    pub fn fetcher(&self) -> &FinalizedBlockFetcher {
        &self.fetcher
    }

    pub(crate) fn pool(&self) -> &dyn TransactionPool {
        self.pool.as_ref()
    }

    pub(crate) fn signer(&self) -> &dyn Signer {
        self.signer.as_ref()
    }

    pub(crate) fn peers(&self) -> &dyn Peers {
        self.peers.as_ref()
    }

    /// Check startup prerequisites, spawn the fetcher, and begin sharing
    /// beacon shares for the round after the latest finalized block.
    ///
    /// DKG problems (no saved shares, too few) are fatal here.
    pub async fn start(self: &Arc<Self>) -> ConsensusResult<JoinHandle<()>> {
        if self.chain.config().dkg_enabled {
            load_dkg(self.store.as_ref(), &self.chain.magic_block()).await?;
        }
        let fetcher = FinalizedBlockFetcher::spawn(self.clone());

        let next = self.chain.latest_finalized().round() + 1;
        self.chain.try_advance_round(next);
        let round = self.chain.create_round(next);
        self.spawn_round_watchdog(&round);
        if let Err(e) = self.send_vrf_share(&round).await {
            warn!(round = round.number(), error = %e, "initial vrf share not sent");
        }
        Ok(fetcher)
    }

    /// Dispatch one incoming wire message.
    pub async fn handle_message(self: &Arc<Self>, message: ProtocolMessage) {
        match message {
            ProtocolMessage::Proposal(block) => self.handle_proposal(block).await,
            ProtocolMessage::Ticket(ticket) => self.handle_ticket(ticket).await,
            ProtocolMessage::Notarization(notarization) => {
                self.handle_notarization(notarization).await
            }
            ProtocolMessage::VrfShare(share) => self.handle_vrf_share(share).await,
            ProtocolMessage::RoundStart { round, seed } => {
                self.handle_round_start(round, seed).await
            }
        }
    }

    /// A candidate block arrived for verification.
    pub async fn handle_proposal(self: &Arc<Self>, block: Arc<Block>) {
        let number = block.round();
        if number < self.chain.current_round() {
            debug!(
                round = number,
                current_round = self.chain.current_round(),
                block = %block.hash(),
                "stale proposal"
            );
            return;
        }
        let round = self.chain.create_round(number);
        self.add_to_round_verification(&round, block).await;
    }

    /// A beacon share arrived; completing the threshold starts the round.
    pub async fn handle_vrf_share(self: &Arc<Self>, share: VrfShare) {
        if share.round <= self.chain.latest_finalized().round() {
            return;
        }
        let round = self.chain.create_round(share.round);
        if self.beacon.add_share(&self.chain, &round, share).is_some() {
            self.start_round(round).await;
        }
    }

    /// A peer announced a round start. The seed is taken as provisional:
    /// it positions this node to verify proposals, while the beacon's own
    /// completion remains authoritative.
    pub async fn handle_round_start(self: &Arc<Self>, number: RoundNumber, seed: Seed) {
        if number <= self.chain.latest_finalized().round() {
            return;
        }
        let round = self.chain.create_round(number);
        if round.has_seed() {
            return;
        }
        if round.set_provisional_seed(seed) {
            round
                .compute_member_ranks(&self.chain.magic_block_for_round(number));
            self.chain.try_advance_round(number);
            self.spawn_round_watchdog(&round);
        }
    }

    /// Produce and broadcast this node's beacon share for a round, and run
    /// it through the local aggregator as well.
    pub async fn send_vrf_share(self: &Arc<Self>, round: &Arc<Round>) -> ConsensusResult<()> {
        let share = self.beacon.make_share(&self.chain, round)?;
        self.peers
            .broadcast(ProtocolMessage::VrfShare(share.clone()))
            .await;
        if self.beacon.add_share(&self.chain, round, share).is_some() {
            self.start_round(round.clone()).await;
        }
        Ok(())
    }

    /// Drive a round whose seed is set: compute ranks, spawn the generator
    /// when this node ranks among the generators, announce the start.
    pub async fn start_round(self: &Arc<Self>, round: Arc<Round>) {
        let magic_block = self.chain.magic_block_for_round(round.number());
        round.compute_member_ranks(&magic_block);
        self.chain.try_advance_round(round.number());
        self.spawn_round_watchdog(&round);
        self.ensure_collector(&round);

        let self_rank = round.rank_of(&magic_block, self.chain.self_id());
        info!(
            round = round.number(),
            seed = round.seed(),
            rank = ?self_rank,
            "starting round"
        );
        if let Some(rank) = self_rank {
            if rank < self.chain.config().num_generators
                && round.state() < RoundState::Generating
            {
                Generator::spawn(self.clone(), round.clone());
            }
        }
        self.peers
            .broadcast(ProtocolMessage::RoundStart {
                round: round.number(),
                seed: round.seed(),
            })
            .await;
    }

    /// Create-and-start path for a successor round: a provisional seed
    /// drawn from the notarized round gets things moving while the real
    /// beacon runs.
    pub(crate) async fn start_next_round(
        self: &Arc<Self>,
        round: Arc<Round>,
        provisional_seed: Seed,
    ) {
        round.set_provisional_seed(provisional_seed);
        self.start_round(round.clone()).await;
        if let Err(e) = self.send_vrf_share(&round).await {
            debug!(round = round.number(), error = %e, "vrf share for next round not sent");
        }
    }

    /// One watchdog per round instance: re-broadcast the share on soft
    /// timeouts, restart the round once the retries are exhausted.
    fn spawn_round_watchdog(self: &Arc<Self>, round: &Arc<Round>) {
        if !round.claim_watchdog() {
            return;
        }
        let protocol = self.clone();
        let round = round.clone();
        tokio::spawn(async move {
            let soft_timeout = protocol.chain.config().soft_timeout;
            let retries = protocol.chain.config().soft_timeout_retries;
            loop {
                sleep(soft_timeout).await;
                if round.is_finalizing() || round.is_finalized() {
                    break;
                }
                if protocol.chain.current_round() > round.number() {
                    break;
                }
                if round.heaviest_notarized_block().is_some() {
                    break;
                }
                let count = round.inc_soft_timeout_count();
                if count <= retries {
                    debug!(
                        round = round.number(),
                        soft_timeouts = count,
                        "soft timeout, re-sending vrf share"
                    );
                    if let Err(e) = protocol.send_vrf_share(&round).await {
                        debug!(round = round.number(), error = %e, "vrf share re-send failed");
                    }
                } else {
                    warn!(
                        round = round.number(),
                        timeout_count = round.timeout_count(),
                        "round verification timed out, restarting"
                    );
                    protocol.restart_round(&round).await;
                }
            }
        });
    }

    /// Restart a stalled round with a raised timeout count.
    pub(crate) async fn restart_round(self: &Arc<Self>, round: &Arc<Round>) {
        round.set_state(RoundState::VerificationTimedOut);
        round.cancel_verification();
        round.add_timeout_vote(round.timeout_count(), self.chain.self_id().clone());
        round.increment_timeout_count();
        round.restart();
        if let Err(e) = self.send_vrf_share(round).await {
            warn!(round = round.number(), error = %e, "vrf share after restart not sent");
        }
    }

    /// Commit a round: walk the pending ancestry from the latest finalized
    /// block up to the round's best notarized block and apply it in order.
    pub async fn finalize_round(self: &Arc<Self>, round: Arc<Round>) {
        let prior_state = round.state();
        if !round.set_finalizing() {
            debug!(round = round.number(), "already finalizing or finalized");
            return;
        }
        let Some(best) = round.best_ranked_notarized_block() else {
            debug!(round = round.number(), "nothing notarized to finalize");
            round.reset_state(prior_state);
            return;
        };
        let latest = self.chain.latest_finalized();
        if best.round() <= latest.round() {
            round.finalize(best);
            return;
        }

        // Collect newest to oldest, resolving parents through the cache.
        let mut pending = Vec::new();
        let mut cursor = best.clone();
        loop {
            if cursor.hash() == latest.hash() {
                break;
            }
            if cursor.round() <= latest.round() {
                warn!(
                    round = round.number(),
                    block = %best.hash(),
                    "finalization chain does not reach the latest finalized block"
                );
                round.reset_state(prior_state);
                return;
            }
            pending.push(cursor.clone());
            let parent = match cursor.parent() {
                Some(parent) => Some(parent),
                None => self.chain.block(cursor.prev_hash()).map(|parent| {
                    cursor.set_parent(&parent);
                    parent
                }),
            };
            match parent {
                Some(parent) => cursor = parent,
                None => {
                    warn!(
                        block = %cursor.prev_hash(),
                        "missing ancestor, fetching before finalization"
                    );
                    self.fetcher.fetch(cursor.prev_hash()).await;
                    // Allow a later attempt once the ancestor arrives.
                    round.reset_state(prior_state);
                    return;
                }
            }
        }

        for block in pending.iter().rev() {
            self.state_handler
                .update_pending_block(block, block.transactions())
                .await;
            self.state_handler.update_finalized_block(block).await;
            self.chain.set_latest_finalized(block.clone());
            if let Err(e) = self.store.write_round(&BlockSummary::of(block)).await {
                warn!(round = block.round(), error = %e, "round summary not persisted");
            }
            info!(round = block.round(), block = %block.hash(), "finalized block");
        }
        round.finalize(best);

        let latest_round = self.chain.latest_finalized().round();
        self.chain
            .cache()
            .delete_below(latest_round, self.chain.config().cache_grace);
        self.chain
            .delete_rounds_below(latest_round.saturating_sub(ROUND_RETENTION));
    }

    /// Development mode only: hold the generator back by a random delay to
    /// exercise the timeout paths.
    pub(crate) async fn induce_dev_delay(&self) {
        if let Some(max) = self.chain.config().max_induced_delay {
            let ms = rand::thread_rng().gen_range(0..=max.as_millis() as u64);
            sleep(Duration::from_millis(ms)).await;
        }
    }
}
