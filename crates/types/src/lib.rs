//! Value types for the remora round engine.
//!
//! Everything that crosses a component boundary lives here: blocks and the
//! tickets/notarizations that certify them, VRF shares, and the magic-block
//! committee definition. The consensus crate builds its state machines on
//! top of these.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

pub mod block;
pub mod committee;
pub mod vrf;

pub use block::{Block, BlockContent, BlockSummary, Notarization, Transaction, VerificationTicket};
pub use committee::{MagicBlock, Member};
pub use vrf::VrfShare;

use serde::{Deserialize, Serialize};
use std::fmt;

/// A round number. Round 0 is the genesis round.
pub type RoundNumber = u64;

/// The shared random seed of a round. Zero means "not set"; the owning
/// round object carries the authoritative has-seed flag alongside.
pub type Seed = i64;

/// Identity of a committee member.
pub type PublicKey = fastcrypto::bls12381::BLS12381PublicKey;

/// A signature over a block hash or beacon message.
pub type Signature = fastcrypto::bls12381::BLS12381Signature;

/// An aggregate of member signatures.
pub type AggregateSignature = fastcrypto::bls12381::BLS12381AggregateSignature;

/// Content hash identifying a block.
#[derive(Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockHash([u8; 32]);

impl BlockHash {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl From<BlockHash> for fastcrypto::Digest {
    fn from(h: BlockHash) -> Self {
        fastcrypto::Digest::new(h.0)
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "{}", base64::encode(self.0))
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        let encoded = base64::encode(self.0);
        let display_str = encoded.get(0..16).unwrap_or(&encoded);
        write!(f, "{}", display_str)
    }
}
