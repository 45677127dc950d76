//! Ticket aggregation into notarizations, and what a notarization sets in
//! motion: the successor round starts and the prior round finalizes.
//!
//! Tickets keep accumulating even after a block is notarized; knowing how
//! many verifications exist saves re-broadcasts later. Only the ticket
//! that crosses the quorum drives the state transitions.

use crate::beacon;
use crate::interfaces::ProtocolMessage;
use crate::protocol::Protocol;
use crate::round::Round;
use remora_types::{Block, Notarization, VerificationTicket};
use std::sync::Arc;
use tracing::{debug, info, warn};

impl Protocol {
    /// A verification ticket arrived from the network.
    pub async fn handle_ticket(self: &Arc<Self>, ticket: VerificationTicket) {
        let Some(block) = self.chain().block(ticket.block_hash) else {
            debug!(block = %ticket.block_hash, "ticket for unknown block");
            return;
        };
        let Some(round) = self.chain().round(block.round()) else {
            debug!(round = block.round(), "ticket for unknown round");
            return;
        };
        self.process_verification_ticket(&round, &block, ticket)
            .await;
    }

    /// Tally one ticket for a block; crossing the quorum notarizes it.
    pub async fn process_verification_ticket(
        self: &Arc<Self>,
        round: &Arc<Round>,
        block: &Arc<Block>,
        ticket: VerificationTicket,
    ) {
        if ticket.signer != *self.chain().self_id() {
            let magic_block = self.chain().magic_block_for_round(block.round());
            if !magic_block.contains(&ticket.signer) {
                debug!(block = %block.hash(), "ticket from non-member");
                return;
            }
            if !self
                .signer()
                .verify(&ticket.block_hash, &ticket.signature, &ticket.signer)
            {
                warn!(block = %block.hash(), "ticket signature invalid");
                return;
            }
        }

        let was_notarized = self.chain().is_block_notarized(block);
        if !block.add_ticket(ticket) {
            return;
        }
        if was_notarized {
            // Already over the quorum; the extra ticket is just recorded.
            return;
        }
        if self.chain().is_block_notarized(block) {
            self.block_notarized(round, block, true).await;
        }
    }

    /// A block crossed the notarization quorum, locally (`announce`) or
    /// via a received notarization/fetched block.
    pub(crate) async fn block_notarized(
        self: &Arc<Self>,
        round: &Arc<Round>,
        block: &Arc<Block>,
        announce: bool,
    ) {
        self.cancel_round_verification(round);
        let (block, _grew) = round.add_notarized(block.clone());
        info!(
            round = round.number(),
            block = %block.hash(),
            tickets = block.ticket_count(),
            "block notarized"
        );
        if announce {
            self.peers()
                .broadcast(ProtocolMessage::Notarization(Notarization::of(&block)))
                .await;
        }

        let next = round.number() + 1;
        if self.chain().round(next).is_none() {
            let next_round = self.chain().create_round(next);
            let provisional_seed = beacon::draw_seed(round.seed());
            // Detached task: the successor round must not be cancelled
            // along with this round's verification.
            let protocol = self.clone();
            tokio::spawn(async move {
                protocol.start_next_round(next_round, provisional_seed).await;
            });
        }

        if round.number() > 0 {
            if let Some(prior) = self.chain().round(round.number() - 1) {
                if prior.best_block().is_some() {
                    let protocol = self.clone();
                    tokio::spawn(async move {
                        protocol.finalize_round(prior).await;
                    });
                }
            }
        }
    }

    /// A full notarization message arrived.
    pub async fn handle_notarization(self: &Arc<Self>, notarization: Notarization) {
        let Some(block) = self.chain().block(notarization.block_hash) else {
            debug!(
                block = %notarization.block_hash,
                round = notarization.round,
                "notarization for missing block, fetching"
            );
            self.fetcher().fetch(notarization.block_hash).await;
            return;
        };
        if let Err(e) = self.chain().verify_notarization(
            self.signer(),
            notarization.block_hash,
            notarization.round,
            &notarization.tickets,
        ) {
            warn!(block = %notarization.block_hash, error = %e, "dropping notarization");
            return;
        }
        block.merge_tickets(&notarization.tickets);
        let round = self.chain().create_round(notarization.round);
        let already = block.is_notarized();
        if !already {
            self.block_notarized(&round, &block, false).await;
        } else {
            round.add_notarized(block);
        }
    }

    /// The fetcher landed a notarized block; re-drive round creation and
    /// finalization from it.
    pub(crate) async fn notarized_block_fetched(self: &Arc<Self>, block: Arc<Block>) {
        info!(round = block.round(), block = %block.hash(), "fetched notarized block");
        let round = self.chain().create_round(block.round());
        if !round.has_seed() {
            round.set_seed_for_notarized_block(block.seed());
        }
        self.block_notarized(&round, &block, false).await;
    }
}
