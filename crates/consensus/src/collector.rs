//! The per-round block collector: accumulate, rank, verify, ticket.
//!
//! One cooperative task per round multiplexes three events: cancellation,
//! the block-time timer, and incoming candidate blocks. Before the timer
//! fires, blocks only accumulate. When it fires, the buffer is sorted by
//! rank and verified in order until one block passes; after that, a new
//! arrival is verified only when its rank beats the current best. The
//! collector never holds a lock across an await.

use crate::error::{ConsensusError, ConsensusResult};
use crate::interfaces::ProtocolMessage;
use crate::protocol::Protocol;
use crate::round::{Round, RoundState};
use remora_types::{Block, VerificationTicket};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Proposal intake depth per round.
pub(crate) const PROPOSAL_CHANNEL_SIZE: usize = 100;

/// The round's collector task.
pub(crate) struct Collector {
    protocol: Arc<Protocol>,
    round: Arc<Round>,
}

impl Collector {
    pub(crate) fn spawn(
        protocol: Arc<Protocol>,
        round: Arc<Round>,
        rx_blocks: mpsc::Receiver<Arc<Block>>,
        rx_cancel: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let block_time = protocol.chain().config().block_time();
        tokio::spawn(async move {
            Collector { protocol, round }
                .run(rx_blocks, rx_cancel, block_time)
                .await;
        })
    }

    async fn run(
        self,
        mut rx_blocks: mpsc::Receiver<Arc<Block>>,
        mut rx_cancel: watch::Receiver<bool>,
        block_time: std::time::Duration,
    ) {
        debug!(round = self.round.number(), "block collector started");
        let timer = sleep(block_time);
        tokio::pin!(timer);
        let mut pending: Vec<Arc<Block>> = Vec::new();
        let mut ranked = false;

        loop {
            tokio::select! {
                changed = rx_cancel.changed() => {
                    if changed.is_err() || *rx_cancel.borrow() {
                        break;
                    }
                }

                // Fires once per round instance; flips into the ranked
                // phase and works through the accumulated buffer.
                () = &mut timer, if !ranked => {
                    ranked = true;
                    pending.sort_by_key(|b| b.rank());
                    for block in pending.drain(..) {
                        if self.verify_and_send(block).await {
                            break;
                        }
                    }
                }

                maybe_block = rx_blocks.recv() => {
                    let Some(block) = maybe_block else { break };
                    if !ranked {
                        pending.push(block);
                        continue;
                    }
                    let best_rank = self.round.best_block().map(|b| b.rank());
                    if best_rank.map_or(true, |rank| block.rank() < rank) {
                        self.verify_and_send(block).await;
                    } else {
                        debug!(
                            round = self.round.number(),
                            block = %block.hash(),
                            rank = block.rank(),
                            best_rank,
                            "proposal rank not better than the current best"
                        );
                    }
                }
            }
        }
        debug!(round = self.round.number(), "block collector stopped");
    }

    /// Verify one block; on success adopt it as the round's best, send the
    /// ticket to everyone but the proposer, and tally it locally.
    async fn verify_and_send(&self, block: Arc<Block>) -> bool {
        let round = &self.round;
        match self.protocol.verify_round_block(round, &block).await {
            Ok(ticket) => {
                round.set_best_block(block.clone());
                if block.miner() != self.protocol.chain().self_id() {
                    self.protocol
                        .peers()
                        .broadcast_except(ProtocolMessage::Ticket(ticket.clone()), block.miner())
                        .await;
                }
                self.protocol
                    .process_verification_ticket(round, &block, ticket)
                    .await;
                true
            }
            Err(ConsensusError::RoundMismatch { current, .. }) => {
                debug!(
                    round = round.number(),
                    block = %block.hash(),
                    current_round = current,
                    "verify round block"
                );
                false
            }
            Err(e) => {
                warn!(
                    round = round.number(),
                    block = %block.hash(),
                    error = %e,
                    "verify round block"
                );
                false
            }
        }
    }
}

impl Protocol {
    /// Make sure the round's collector task is running. The first caller
    /// spawns it; everyone else finds it already there.
    pub(crate) fn ensure_collector(self: &Arc<Self>, round: &Arc<Round>) {
        if let Some((rx_blocks, rx_cancel)) = round.start_verification(PROPOSAL_CHANNEL_SIZE) {
            Collector::spawn(self.clone(), round.clone(), rx_blocks, rx_cancel);
        }
    }

    /// Admit a candidate block to its round's verification pipeline,
    /// starting the collector the first time a block shows up.
    pub async fn add_to_round_verification(
        self: &Arc<Self>,
        round: &Arc<Round>,
        block: Arc<Block>,
    ) {
        if round.is_finalizing() || round.is_finalized() {
            debug!(
                round = block.round(),
                block = %block.hash(),
                finalizing = round.is_finalizing(),
                "round past verification, dropping proposal"
            );
            return;
        }
        if !self.chain().validate_magic_block(&block) {
            warn!(
                round = block.round(),
                block = %block.hash(),
                magic_block = %block.magic_block_hash(),
                "invalid magic block"
            );
            return;
        }
        let block = self.chain().add_block(block);
        round.set_state(RoundState::CollectingProposals);
        round.add_proposed(block.clone());
        self.ensure_collector(round);
        match round.block_sender() {
            Some(sender) => {
                if sender.send(block).await.is_err() {
                    debug!(round = round.number(), "collector intake closed");
                }
            }
            None => debug!(round = round.number(), "verification cancelled, proposal dropped"),
        }
    }

    /// Stop the round's collector; a notarized winner exists.
    pub fn cancel_round_verification(&self, round: &Round) {
        round.cancel_verification();
    }

    /// Verify a candidate block for its round and produce this node's
    /// verification ticket.
    pub(crate) async fn verify_round_block(
        self: &Arc<Self>,
        round: &Arc<Round>,
        block: &Arc<Block>,
    ) -> ConsensusResult<VerificationTicket> {
        let chain = self.chain();
        if chain.current_round() != round.number() {
            return Err(ConsensusError::RoundMismatch {
                current: chain.current_round(),
                requested: round.number(),
            });
        }
        if block.miner() == chain.self_id() {
            // Our own proposal: self-vote.
            return self.sign_block(block);
        }

        let parent = match block.parent() {
            Some(parent) => parent,
            None => match chain.block(block.prev_hash()) {
                Some(parent) => {
                    block.set_parent(&parent);
                    parent
                }
                None => {
                    self.fetcher().fetch(block.prev_hash()).await;
                    return Err(ConsensusError::PrevBlockMissing(block.prev_hash()));
                }
            },
        };

        // The parent's notarization is checked against the tickets carried
        // by this proposal; the notarization message itself may not have
        // reached us yet.
        chain.verify_notarization(
            self.signer(),
            parent.hash(),
            parent.round(),
            block.prev_tickets(),
        )?;

        self.validate_block(round, block, &parent)?;
        Ok(self.make_ticket(block))
    }

    /// Self-vote on a block this node proposed.
    fn sign_block(self: &Arc<Self>, block: &Arc<Block>) -> ConsensusResult<VerificationTicket> {
        if !self.chain().validate_magic_block(block) {
            return Err(ConsensusError::InvalidMagicBlock(format!(
                "block {} names magic block {}",
                block.hash(),
                block.magic_block_hash()
            )));
        }
        Ok(self.make_ticket(block))
    }

    fn validate_block(
        self: &Arc<Self>,
        round: &Arc<Round>,
        block: &Arc<Block>,
        parent: &Arc<Block>,
    ) -> ConsensusResult<()> {
        let chain = self.chain();
        if !chain.validate_magic_block(block) {
            return Err(ConsensusError::InvalidMagicBlock(format!(
                "block {} names magic block {}",
                block.hash(),
                block.magic_block_hash()
            )));
        }
        if block.round() != parent.round() + 1 {
            return Err(ConsensusError::InvalidBlock(format!(
                "round {} does not extend parent round {}",
                block.round(),
                parent.round()
            )));
        }
        let magic_block = chain.magic_block_for_round(block.round());
        if !magic_block.contains(block.miner()) {
            return Err(ConsensusError::InvalidBlock(
                "proposer is not a committee member".into(),
            ));
        }
        if block.rank() >= magic_block.size() {
            return Err(ConsensusError::InvalidBlock(format!(
                "rank {} out of range for a committee of {}",
                block.rank(),
                magic_block.size()
            )));
        }
        if !self
            .signer()
            .verify(&block.hash(), block.signature(), block.miner())
        {
            return Err(ConsensusError::InvalidSignature(format!(
                "proposer signature on {}",
                block.hash()
            )));
        }
        if let Some(expected) = round.rank_of(&magic_block, block.miner()) {
            if expected != block.rank() {
                return Err(ConsensusError::InvalidBlock(format!(
                    "claimed rank {} but ranks {}",
                    block.rank(),
                    expected
                )));
            }
        }
        if round.has_seed() && block.seed() != round.seed() {
            return Err(ConsensusError::InvalidBlock(format!(
                "block seed {} does not match round seed {}",
                block.seed(),
                round.seed()
            )));
        }
        let expected_weight =
            parent.chain_weight() + (magic_block.size() - block.rank()) as u64;
        if block.chain_weight() != expected_weight {
            return Err(ConsensusError::InvalidBlock(format!(
                "chain weight {} where {} expected",
                block.chain_weight(),
                expected_weight
            )));
        }
        Ok(())
    }

    fn make_ticket(&self, block: &Block) -> VerificationTicket {
        let hash = block.hash();
        VerificationTicket {
            block_hash: hash,
            signer: self.chain().self_id().clone(),
            signature: self.signer().sign(&hash),
        }
    }
}
