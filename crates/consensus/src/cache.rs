//! In-memory, hash-addressed block store.
//!
//! The cache is speculative: it holds candidate, notarized, and finalized
//! blocks alike. Adding a block links it to its parent when the parent is
//! already cached; the link may stay unresolved until the parent shows up
//! or a fetch brings it in.

use remora_types::{Block, BlockHash, RoundNumber};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

/// Hash-addressed store of recent and speculative blocks.
pub struct BlockCache {
    blocks: Mutex<HashMap<BlockHash, Arc<Block>>>,
}

impl BlockCache {
    pub fn new() -> Self {
        Self {
            blocks: Mutex::new(HashMap::new()),
        }
    }

    /// Add a block. No-op when the block's round is at or below `floor`
    /// (the latest finalized round) or when the hash is already present;
    /// the stored block is returned either way.
    pub fn add(&self, block: Arc<Block>, floor: RoundNumber) -> Arc<Block> {
        if block.round() <= floor {
            return block;
        }
        let mut blocks = self.blocks.lock().expect("cache lock poisoned");
        if let Some(existing) = blocks.get(&block.hash()) {
            return existing.clone();
        }
        if block.parent().is_none() {
            match blocks.get(&block.prev_hash()) {
                Some(parent) => block.set_parent(parent),
                None => debug!(
                    round = block.round(),
                    block = %block.hash(),
                    prev_block = %block.prev_hash(),
                    "previous block not present"
                ),
            }
        }
        blocks.insert(block.hash(), block.clone());
        block
    }

    /// Insert unconditionally. Bootstrap path only (genesis, restored
    /// latest finalized block); `add` refuses rounds at the floor.
    pub(crate) fn insert(&self, block: Arc<Block>) {
        self.blocks
            .lock()
            .expect("cache lock poisoned")
            .insert(block.hash(), block);
    }

    pub fn get(&self, hash: BlockHash) -> Option<Arc<Block>> {
        self.blocks
            .lock()
            .expect("cache lock poisoned")
            .get(&hash)
            .cloned()
    }

    /// All cached blocks of a round.
    pub fn get_by_round(&self, round: RoundNumber) -> Vec<Arc<Block>> {
        self.blocks
            .lock()
            .expect("cache lock poisoned")
            .values()
            .filter(|b| b.round() == round)
            .cloned()
            .collect()
    }

    pub fn delete(&self, hash: BlockHash) {
        self.blocks.lock().expect("cache lock poisoned").remove(&hash);
    }

    /// Evict blocks below `round` that are also older than `grace`.
    pub fn delete_below(&self, round: RoundNumber, grace: Duration) {
        let mut blocks = self.blocks.lock().expect("cache lock poisoned");
        blocks.retain(|_, b| b.round() >= round || b.created().elapsed() < grace);
    }

    pub fn len(&self) -> usize {
        self.blocks.lock().expect("cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for BlockCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use remora_types::{BlockContent, PublicKey, Signature};

    fn block(round: RoundNumber, prev_hash: BlockHash, rank: usize) -> Arc<Block> {
        Arc::new(Block::new(
            BlockContent {
                round,
                prev_hash,
                seed: 7,
                miner: PublicKey::default(),
                rank,
                chain_weight: round,
                magic_block_hash: BlockHash::default(),
                transactions: vec![],
                prev_tickets: vec![],
            },
            |_| Signature::default(),
        ))
    }

    #[test]
    fn add_links_parent_from_cache() {
        let cache = BlockCache::new();
        let parent = cache.add(block(1, BlockHash::default(), 0), 0);
        let child = cache.add(block(2, parent.hash(), 0), 0);
        assert!(child.parent().is_some());
        assert_eq!(child.parent().unwrap().hash(), parent.hash());
    }

    #[test]
    fn add_below_floor_is_a_no_op() {
        let cache = BlockCache::new();
        cache.add(block(3, BlockHash::default(), 0), 3);
        assert!(cache.is_empty());
    }

    #[test]
    fn add_is_idempotent_on_hash() {
        let cache = BlockCache::new();
        let a = cache.add(block(1, BlockHash::default(), 0), 0);
        let b = cache.add(block(1, BlockHash::default(), 0), 0);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn get_by_round_filters() {
        let cache = BlockCache::new();
        cache.add(block(1, BlockHash::default(), 0), 0);
        cache.add(block(1, BlockHash::default(), 1), 0);
        cache.add(block(2, BlockHash::default(), 0), 0);
        assert_eq!(cache.get_by_round(1).len(), 2);
        assert_eq!(cache.get_by_round(2).len(), 1);
        assert!(cache.get_by_round(5).is_empty());
    }

    #[test]
    fn delete_below_honors_grace() {
        let cache = BlockCache::new();
        let old = cache.add(block(1, BlockHash::default(), 0), 0);
        cache.add(block(5, BlockHash::default(), 0), 0);

        // Fresh blocks survive even below the round cutoff.
        cache.delete_below(4, Duration::from_secs(60));
        assert_eq!(cache.len(), 2);

        // With no grace they are evicted.
        cache.delete_below(4, Duration::ZERO);
        assert_eq!(cache.len(), 1);
        assert!(cache.get(old.hash()).is_none());
    }
}
