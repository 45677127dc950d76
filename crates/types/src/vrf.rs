//! Threshold beacon share sent by each member at the start of a round.

use crate::{PublicKey, RoundNumber};
use fastcrypto::traits::EncodeDecodeBase64;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One member's signature share over the canonical round message.
///
/// `timeout_count` pins the share to a specific attempt of the round; a
/// share whose count disagrees with the round's current timeout count is
/// not usable for seed derivation.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VrfShare {
    pub round: RoundNumber,
    pub timeout_count: u32,
    pub party: PublicKey,
    /// Hex-encoded signature share, opaque to the round engine.
    pub share: String,
}

impl fmt::Debug for VrfShare {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        write!(
            f,
            "V{}@{}({})",
            self.round,
            self.timeout_count,
            self.party.encode_base64()
        )
    }
}
