//! Persisted summaries: per-round block summaries and per-magic-block DKG
//! summaries.
//!
//! The round engine never owns a database; it writes summaries through
//! the `SummaryStore` seam and reads saved DKG shares back at startup.
//! `MemoryStore` backs tests and single-process runs.

use crate::error::{ConsensusError, ConsensusResult};
use async_trait::async_trait;
use remora_types::{BlockSummary, MagicBlock, RoundNumber};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

/// Saved DKG state for one magic block: the secret shares this node holds,
/// keyed by hex party id.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DkgSummary {
    pub magic_block_number: u64,
    pub secret_shares: HashMap<String, String>,
}

/// Store for round and DKG summaries.
#[async_trait]
pub trait SummaryStore: Send + Sync + 'static {
    async fn read_round(&self, number: RoundNumber) -> ConsensusResult<Option<BlockSummary>>;

    async fn write_round(&self, summary: &BlockSummary) -> ConsensusResult<()>;

    async fn read_dkg(&self, magic_block_number: u64) -> ConsensusResult<Option<DkgSummary>>;

    async fn write_dkg(&self, summary: &DkgSummary) -> ConsensusResult<()>;
}

/// Load and sanity-check the saved DKG shares for a magic block. Fatal to
/// startup of that magic block when shares are missing or short of the
/// threshold.
pub async fn load_dkg(
    store: &dyn SummaryStore,
    magic_block: &MagicBlock,
) -> ConsensusResult<DkgSummary> {
    let summary = store
        .read_dkg(magic_block.number)
        .await?
        .ok_or(ConsensusError::NoSavedShares(magic_block.number))?;
    if summary.secret_shares.is_empty() {
        return Err(ConsensusError::NoSavedShares(magic_block.number));
    }
    if summary.secret_shares.len() < magic_block.threshold() {
        return Err(ConsensusError::NotEnoughShares {
            magic_block: magic_block.number,
            have: summary.secret_shares.len(),
            need: magic_block.threshold(),
        });
    }
    Ok(summary)
}

/// In-memory summary store.
#[derive(Default)]
pub struct MemoryStore {
    rounds: Mutex<HashMap<RoundNumber, BlockSummary>>,
    dkgs: Mutex<HashMap<u64, DkgSummary>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SummaryStore for MemoryStore {
    async fn read_round(&self, number: RoundNumber) -> ConsensusResult<Option<BlockSummary>> {
        Ok(self
            .rounds
            .lock()
            .expect("store lock poisoned")
            .get(&number)
            .cloned())
    }

    async fn write_round(&self, summary: &BlockSummary) -> ConsensusResult<()> {
        self.rounds
            .lock()
            .expect("store lock poisoned")
            .insert(summary.round, summary.clone());
        Ok(())
    }

    async fn read_dkg(&self, magic_block_number: u64) -> ConsensusResult<Option<DkgSummary>> {
        Ok(self
            .dkgs
            .lock()
            .expect("store lock poisoned")
            .get(&magic_block_number)
            .cloned())
    }

    async fn write_dkg(&self, summary: &DkgSummary) -> ConsensusResult<()> {
        self.dkgs
            .lock()
            .expect("store lock poisoned")
            .insert(summary.magic_block_number, summary.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fastcrypto::traits::KeyPair;
    use remora_types::{BlockHash, PublicKey};

    fn committee(n: usize, t: usize) -> MagicBlock {
        let ids: Vec<PublicKey> = (0..n)
            .map(|_| {
                fastcrypto::bls12381::BLS12381KeyPair::generate(&mut rand::thread_rng())
                    .public()
                    .clone()
            })
            .collect();
        MagicBlock::new(7, 0, ids, vec![], t)
    }

    #[tokio::test]
    async fn round_summaries_round_trip() {
        let store = MemoryStore::new();
        let summary = BlockSummary {
            hash: BlockHash::new([1u8; 32]),
            round: 5,
            round_random_seed: 42,
            txn_root: BlockHash::new([2u8; 32]),
        };
        store.write_round(&summary).await.unwrap();
        assert_eq!(store.read_round(5).await.unwrap(), Some(summary));
        assert_eq!(store.read_round(6).await.unwrap(), None);
    }

    #[tokio::test]
    async fn load_dkg_requires_saved_shares() {
        let store = MemoryStore::new();
        let mb = committee(4, 3);
        assert!(matches!(
            load_dkg(&store, &mb).await,
            Err(ConsensusError::NoSavedShares(7))
        ));
    }

    #[tokio::test]
    async fn load_dkg_requires_threshold_shares() {
        let store = MemoryStore::new();
        let mb = committee(4, 3);
        let mut summary = DkgSummary {
            magic_block_number: 7,
            secret_shares: HashMap::new(),
        };
        summary.secret_shares.insert("p1".into(), "s1".into());
        summary.secret_shares.insert("p2".into(), "s2".into());
        store.write_dkg(&summary).await.unwrap();
        assert!(matches!(
            load_dkg(&store, &mb).await,
            Err(ConsensusError::NotEnoughShares {
                magic_block: 7,
                have: 2,
                need: 3
            })
        ));

        summary.secret_shares.insert("p3".into(), "s3".into());
        store.write_dkg(&summary).await.unwrap();
        assert_eq!(load_dkg(&store, &mb).await.unwrap(), summary);
    }
}
