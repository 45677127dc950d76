//! The leader role: generate a block extending the best block of the
//! prior round.
//!
//! When the pool cannot fill a block the generator backs off with a
//! doubling delay, capped at one second, until the pool count changes.
//! Every checkpoint re-checks that the chain has not advanced past the
//! round; once it has, generation is abandoned with a round mismatch.

use crate::error::{ConsensusError, ConsensusResult};
use crate::interfaces::ProtocolMessage;
use crate::protocol::Protocol;
use crate::round::{Round, RoundState};
use remora_types::{Block, BlockContent};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info};

const INITIAL_TXN_BACKOFF: Duration = Duration::from_millis(128);
const MAX_TXN_BACKOFF: Duration = Duration::from_secs(1);

/// One round's block generator.
pub(crate) struct Generator {
    protocol: Arc<Protocol>,
    round: Arc<Round>,
}

impl Generator {
    pub(crate) fn spawn(protocol: Arc<Protocol>, round: Arc<Round>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let number = round.number();
            let generator = Generator { protocol, round };
            match generator.run().await {
                Ok(()) => {}
                Err(ConsensusError::RoundMismatch { current, .. }) => {
                    debug!(round = number, current_round = current, "generate block");
                }
                Err(e) => error!(round = number, error = %e, "generate block"),
            }
        })
    }

    async fn run(&self) -> ConsensusResult<()> {
        let chain = self.protocol.chain();
        let number = self.round.number();
        let prior = chain
            .round(number.wrapping_sub(1))
            .ok_or(ConsensusError::PrevRoundMissing(number))?;
        let parent = chain
            .block_to_extend(&prior)
            .ok_or(ConsensusError::NoBlockToExtend(number))?;

        self.protocol.induce_dev_delay().await;
        self.round.set_state(RoundState::Generating);

        let block = loop {
            if chain.current_round() > number {
                return Err(ConsensusError::RoundMismatch {
                    current: chain.current_round(),
                    requested: number,
                });
            }
            let pool_count = self.protocol.pool().count();
            match self.build_block(&parent) {
                Ok(block) => break block,
                Err(ConsensusError::InsufficientTxns) => {
                    self.wait_for_transactions(pool_count).await?;
                }
                Err(e) => return Err(e),
            }
        };

        if chain.current_round() > number {
            return Err(ConsensusError::RoundMismatch {
                current: chain.current_round(),
                requested: number,
            });
        }
        self.round.set_state(RoundState::Generated);
        let block = chain.add_block(Arc::new(block));
        info!(
            round = number,
            block = %block.hash(),
            txns = block.transactions().len(),
            "generated block"
        );
        self.protocol
            .add_to_round_verification(&self.round, block.clone())
            .await;
        self.protocol
            .peers()
            .broadcast(ProtocolMessage::Proposal(block))
            .await;
        Ok(())
    }

    fn build_block(&self, parent: &Arc<Block>) -> ConsensusResult<Block> {
        let chain = self.protocol.chain();
        let transactions = self.protocol.pool().take(chain.config().block_size);
        if transactions.is_empty() {
            return Err(ConsensusError::InsufficientTxns);
        }
        let magic_block = chain.magic_block_for_round(self.round.number());
        let rank = self
            .round
            .rank_of(&magic_block, chain.self_id())
            .ok_or_else(|| ConsensusError::InvalidBlock("member ranks not computed".into()))?;
        let chain_weight = parent.chain_weight() + (magic_block.size() - rank) as u64;
        Ok(Block::new(
            BlockContent {
                round: self.round.number(),
                prev_hash: parent.hash(),
                seed: self.round.seed(),
                miner: chain.self_id().clone(),
                rank,
                chain_weight,
                magic_block_hash: magic_block.hash,
                transactions,
                prev_tickets: parent.tickets(),
            },
            |hash| self.protocol.signer().sign(hash),
        ))
    }

    /// Sleep 128 ms, doubling up to 1 s, until the pool count moves away
    /// from `pool_count` or the chain advances past this round.
    async fn wait_for_transactions(&self, pool_count: usize) -> ConsensusResult<()> {
        let chain = self.protocol.chain();
        let number = self.round.number();
        let mut delay = INITIAL_TXN_BACKOFF;
        loop {
            if self.protocol.pool().count() != pool_count {
                return Ok(());
            }
            if chain.current_round() > number {
                return Err(ConsensusError::RoundMismatch {
                    current: chain.current_round(),
                    requested: number,
                });
            }
            sleep(delay).await;
            debug!(
                round = number,
                delay_ms = delay.as_millis() as u64,
                txn_count = pool_count,
                "waiting for transactions"
            );
            delay = (delay * 2).min(MAX_TXN_BACKOFF);
        }
    }
}
