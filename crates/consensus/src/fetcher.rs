//! Finalized-block fetcher: bounded, de-duplicated gap recovery.
//!
//! A single long-lived task owns the in-flight map. `fetch` requests are
//! ignored while the same hash is already in flight and younger than the
//! configured lifetime; a periodic tick evicts expired entries so a stuck
//! request can be retried. The channels are bounded and apply
//! back-pressure to callers.

use crate::protocol::Protocol;
use remora_types::{Block, BlockHash};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, warn};

const FETCH_CHANNEL_SIZE: usize = 100;

type HashReceivers = (mpsc::Receiver<BlockHash>, mpsc::Receiver<BlockHash>);

/// Handle to the fetch pipeline.
pub struct FinalizedBlockFetcher {
    tx_add: mpsc::Sender<BlockHash>,
    tx_got: mpsc::Sender<BlockHash>,
    receivers: Mutex<Option<HashReceivers>>,
}

impl FinalizedBlockFetcher {
    pub(crate) fn new() -> Self {
        let (tx_add, rx_add) = mpsc::channel(FETCH_CHANNEL_SIZE);
        let (tx_got, rx_got) = mpsc::channel(FETCH_CHANNEL_SIZE);
        Self {
            tx_add,
            tx_got,
            receivers: Mutex::new(Some((rx_add, rx_got))),
        }
    }

    /// Ask for a finalized block by hash. Blocks when the pipeline is
    /// saturated; duplicate requests inside the lifetime window are
    /// dropped by the worker.
    pub async fn fetch(&self, hash: BlockHash) {
        let _ = self.tx_add.send(hash).await;
    }

    /// Tell the fetcher the block arrived through some other path.
    pub async fn arrived(&self, hash: BlockHash) {
        let _ = self.tx_got.send(hash).await;
    }

    /// Start the worker task. Called once, by `Protocol::start`.
    pub(crate) fn spawn(protocol: Arc<Protocol>) -> JoinHandle<()> {
        let (rx_add, rx_got) = protocol
            .fetcher()
            .receivers
            .lock()
            .expect("fetcher lock poisoned")
            .take()
            .expect("fetcher worker already started");
        tokio::spawn(run(protocol, rx_add, rx_got))
    }
}

async fn run(
    protocol: Arc<Protocol>,
    mut rx_add: mpsc::Receiver<BlockHash>,
    mut rx_got: mpsc::Receiver<BlockHash>,
) {
    let lifetime = protocol.chain().config().fb_fetching_lifetime;
    let mut tick = interval_at(Instant::now() + lifetime, lifetime);
    let mut in_flight: HashMap<BlockHash, Instant> = HashMap::new();
    info!("finalized block fetcher started");

    loop {
        tokio::select! {
            // the block has been fetched or received another way
            maybe_hash = rx_got.recv() => {
                let Some(hash) = maybe_hash else { break };
                in_flight.remove(&hash);
            }

            // fetch a new block
            maybe_hash = rx_add.recv() => {
                let Some(hash) = maybe_hash else { break };
                let now = Instant::now();
                if let Some(requested) = in_flight.get(&hash) {
                    if now.duration_since(*requested) < lifetime {
                        continue; // already fetching
                    }
                }
                in_flight.insert(hash, now);
                let protocol = protocol.clone();
                tokio::spawn(async move {
                    protocol.fetch_finalized_block(hash).await;
                });
            }

            // evict requests older than the lifetime
            _ = tick.tick() => {
                let now = Instant::now();
                in_flight.retain(|_, requested| now.duration_since(*requested) < lifetime);
            }
        }
    }
    info!("finalized block fetcher stopped");
}

impl Protocol {
    /// One fetch attempt: ask every sharder, keep the best-supported
    /// answer, validate its notarization, and land it on its round.
    pub(crate) async fn fetch_finalized_block(self: &Arc<Self>, hash: BlockHash) {
        let chain = self.chain();
        if chain.block(hash).is_some() {
            self.fetcher().arrived(hash).await;
            return;
        }
        info!(
            block = %hash,
            current_round = chain.current_round(),
            "fetching finalized block from sharders"
        );

        let responses = self.peers().request_block_from_all(hash).await;
        let mut by_hash: Vec<(Arc<Block>, usize)> = Vec::new();
        for block in responses {
            match by_hash.iter_mut().find(|(b, _)| b.hash() == block.hash()) {
                Some((_, votes)) => *votes += 1,
                None => by_hash.push((Arc::new(block), 1)),
            }
        }
        // highest round first, then the most popular response
        by_hash.sort_by(|(a, a_votes), (b, b_votes)| {
            b.round().cmp(&a.round()).then(b_votes.cmp(a_votes))
        });
        let Some((block, votes)) = by_hash.into_iter().next() else {
            warn!(block = %hash, "no finalized block returned by sharders");
            return; // retried after the lifetime window
        };
        debug!(block = %block.hash(), votes, "fetched block candidate");

        if let Err(e) = chain.verify_notarization(
            self.signer(),
            block.hash(),
            block.round(),
            &block.tickets(),
        ) {
            warn!(block = %block.hash(), error = %e, "fetched block fails notarization");
            return;
        }

        let stored = chain.add_block(block.clone());
        let round = chain.create_round(stored.round());
        if !round.has_seed() {
            round.set_seed_for_notarized_block(stored.seed());
        }
        let (kept, _) = round.add_notarized(stored.clone());
        if Arc::ptr_eq(&kept, &stored) {
            self.notarized_block_fetched(kept).await;
        }
        self.fetcher().arrived(hash).await;
    }
}
