//! BLS-backed implementations of the signing and beacon seams.
//!
//! The threshold scheme itself is opaque to the round engine; this module
//! provides the production-shaped wiring over BLS12-381 aggregate
//! signatures plus the hex plumbing the beacon output uses.

use crate::error::{ConsensusError, ConsensusResult};
use crate::interfaces::{BeaconOracle, Signer};
use fastcrypto::traits::{AggregateAuthenticator as _, KeyPair as _, Signer as _, ToFromBytes};
use fastcrypto::Verifier;
use remora_types::{
    AggregateSignature, BlockHash, MagicBlock, PublicKey, RoundNumber, Signature, VrfShare,
};
use std::fmt::Write as _;
use std::sync::Arc;

/// A member's BLS signing identity.
pub struct BlsSigner {
    keypair: fastcrypto::bls12381::BLS12381KeyPair,
}

impl BlsSigner {
    pub fn new(keypair: fastcrypto::bls12381::BLS12381KeyPair) -> Self {
        Self { keypair }
    }

    pub fn public_key(&self) -> PublicKey {
        self.keypair.public().clone()
    }
}

impl Signer for BlsSigner {
    fn sign(&self, hash: &BlockHash) -> Signature {
        self.keypair.sign(hash.as_bytes())
    }

    fn verify(&self, hash: &BlockHash, signature: &Signature, party: &PublicKey) -> bool {
        party.verify(hash.as_bytes(), signature).is_ok()
    }
}

/// Beacon oracle over plain BLS aggregation: each share is a signature on
/// the canonical round message, and the group signature is the aggregate
/// of the first threshold of them, ordered by party for determinism.
pub struct AggregateBeacon {
    keypair: fastcrypto::bls12381::BLS12381KeyPair,
    committee: Arc<MagicBlock>,
}

impl AggregateBeacon {
    pub fn new(keypair: fastcrypto::bls12381::BLS12381KeyPair, committee: Arc<MagicBlock>) -> Self {
        Self { keypair, committee }
    }
}

impl BeaconOracle for AggregateBeacon {
    fn share(
        &self,
        round: RoundNumber,
        timeout_count: u32,
        message: &str,
    ) -> ConsensusResult<VrfShare> {
        let signature = self.keypair.sign(message.as_bytes());
        Ok(VrfShare {
            round,
            timeout_count,
            party: self.keypair.public().clone(),
            share: encode_hex(signature.as_bytes()),
        })
    }

    fn verify_share(&self, share: &VrfShare, message: &str) -> bool {
        let Some(bytes) = decode_hex(&share.share) else {
            return false;
        };
        let Ok(signature) = Signature::from_bytes(&bytes) else {
            return false;
        };
        share.party.verify(message.as_bytes(), &signature).is_ok()
    }

    fn combine(&self, shares: &[VrfShare]) -> ConsensusResult<String> {
        let mut shares: Vec<&VrfShare> = shares.iter().collect();
        shares.sort_by_key(|s| s.party.as_bytes().to_vec());
        let signatures = shares
            .iter()
            .map(|s| {
                let bytes = decode_hex(&s.share).ok_or_else(|| {
                    ConsensusError::InvalidSignature(format!("malformed share from {:?}", s.party))
                })?;
                Signature::from_bytes(&bytes).map_err(|_| {
                    ConsensusError::InvalidSignature(format!("malformed share from {:?}", s.party))
                })
            })
            .collect::<ConsensusResult<Vec<Signature>>>()?;
        let group = AggregateSignature::aggregate(signatures)
            .map_err(|e| ConsensusError::InvalidSignature(e.to_string()))?;
        Ok(encode_hex(group.as_bytes()))
    }

    fn threshold(&self) -> usize {
        self.committee.threshold()
    }
}

/// Lowercase hex encoding.
pub(crate) fn encode_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{:02x}", b);
    }
    out
}

/// Strict lowercase/uppercase hex decoding; `None` on any malformed input.
pub(crate) fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(s.get(i..i + 2)?, 16).ok())
        .collect()
}
