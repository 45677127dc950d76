//! The magic block: committee membership and thresholds.
//!
//! A magic block defines who participates in consensus from a given round
//! onward. The miner committee is an ordered list; a member's position in
//! that list (its set index) is what the per-round rank permutation is
//! applied to.

use crate::{BlockHash, PublicKey, RoundNumber};
use blake2::digest::Update;
use fastcrypto::traits::EncodeDecodeBase64;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A single committee member.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Member {
    /// The member's consensus identity.
    pub id: PublicKey,
    /// Position in the committee's ordered membership.
    pub set_index: usize,
}

impl fmt::Debug for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "M{}({})", self.set_index, self.id.encode_base64())
    }
}

/// Committee definition active for a range of rounds.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MagicBlock {
    /// Sequence number of this magic block.
    pub number: u64,
    /// First round this committee is active for.
    pub starting_round: RoundNumber,
    /// Content hash over the membership and thresholds.
    pub hash: BlockHash,
    /// Miner committee, ordered by set index.
    miners: Vec<Member>,
    /// Sharders observing the chain under this committee.
    sharders: Vec<Member>,
    /// Notarization / beacon threshold T.
    threshold: usize,
}

impl MagicBlock {
    pub fn new(
        number: u64,
        starting_round: RoundNumber,
        miner_ids: Vec<PublicKey>,
        sharder_ids: Vec<PublicKey>,
        threshold: usize,
    ) -> Self {
        let miners = Self::index(miner_ids);
        let sharders = Self::index(sharder_ids);
        let hash = Self::compute_hash(number, starting_round, &miners, &sharders, threshold);
        Self {
            number,
            starting_round,
            hash,
            miners,
            sharders,
            threshold,
        }
    }

    fn index(ids: Vec<PublicKey>) -> Vec<Member> {
        ids.into_iter()
            .enumerate()
            .map(|(set_index, id)| Member { id, set_index })
            .collect()
    }

    fn compute_hash(
        number: u64,
        starting_round: RoundNumber,
        miners: &[Member],
        sharders: &[Member],
        threshold: usize,
    ) -> BlockHash {
        BlockHash::new(fastcrypto::blake2b_256(|hasher| {
            hasher.update(number.to_le_bytes());
            hasher.update(starting_round.to_le_bytes());
            hasher.update((threshold as u64).to_le_bytes());
            for m in miners {
                hasher.update(&m.id);
            }
            for s in sharders {
                hasher.update(&s.id);
            }
        }))
    }

    /// Committee size N.
    pub fn size(&self) -> usize {
        self.miners.len()
    }

    /// Notarization / beacon threshold T.
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Copy-on-read access to the miner committee: callers get an
    /// independent vec they can sort or filter without holding anything.
    pub fn miners(&self) -> Vec<Member> {
        self.miners.clone()
    }

    /// Copy-on-read access to the sharders.
    pub fn sharders(&self) -> Vec<Member> {
        self.sharders.clone()
    }

    pub fn member(&self, id: &PublicKey) -> Option<&Member> {
        self.miners.iter().find(|m| &m.id == id)
    }

    pub fn contains(&self, id: &PublicKey) -> bool {
        self.member(id).is_some()
    }

    pub fn set_index(&self, id: &PublicKey) -> Option<usize> {
        self.member(id).map(|m| m.set_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fastcrypto::traits::KeyPair;

    fn keys(n: usize) -> Vec<PublicKey> {
        (0..n)
            .map(|_| {
                fastcrypto::bls12381::BLS12381KeyPair::generate(&mut rand::thread_rng())
                    .public()
                    .clone()
            })
            .collect()
    }

    #[test]
    fn membership_is_indexed_in_order() {
        let ids = keys(4);
        let mb = MagicBlock::new(1, 0, ids.clone(), vec![], 3);
        assert_eq!(mb.size(), 4);
        for (i, id) in ids.iter().enumerate() {
            assert_eq!(mb.set_index(id), Some(i));
        }
        assert!(!mb.contains(&keys(1)[0]));
    }

    #[test]
    fn hash_covers_membership() {
        let ids = keys(3);
        let a = MagicBlock::new(1, 0, ids.clone(), vec![], 2);
        let b = MagicBlock::new(1, 0, ids, vec![], 3);
        assert_ne!(a.hash, b.hash);
    }
}
