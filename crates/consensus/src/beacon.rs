//! The round random beacon: share admission, threshold combination, and
//! seed derivation.
//!
//! Every share is checked against the canonical round message, which
//! chains on the previous round's seed. At threshold the shares combine
//! into a group signature; the round seed is the first sixteen hex
//! characters of its hash. The round's `VrfComplete` gate makes seed
//! derivation fire exactly once however many late shares trickle in.

use crate::chain::Chain;
use crate::crypto::encode_hex;
use crate::error::{ConsensusError, ConsensusResult};
use crate::interfaces::BeaconOracle;
use crate::round::Round;
use blake2::digest::Update;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use remora_types::{Seed, VrfShare};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Collects VRF shares for rounds and derives their seeds.
pub struct Beacon {
    oracle: Arc<dyn BeaconOracle>,
    dkg_enabled: bool,
}

impl Beacon {
    pub fn new(oracle: Arc<dyn BeaconOracle>, dkg_enabled: bool) -> Self {
        Self {
            oracle,
            dkg_enabled,
        }
    }

    pub fn threshold(&self) -> usize {
        self.oracle.threshold()
    }

    /// The canonical message members sign for a round attempt:
    /// round number, timeout count, and the previous round's seed in hex.
    pub fn round_message(&self, chain: &Chain, round: &Round) -> ConsensusResult<String> {
        let number = round.number();
        let prev = chain
            .round(number.wrapping_sub(1))
            .ok_or(ConsensusError::PrevRoundMissing(number))?;
        let prev_seed = prev.seed();
        if prev_seed == 0 {
            return Err(ConsensusError::PrevSeedMissing(number));
        }
        Ok(format!(
            "{}{}{:x}",
            number,
            round.timeout_count(),
            prev_seed
        ))
    }

    /// Produce this node's share for the round's current attempt.
    pub fn make_share(&self, chain: &Chain, round: &Round) -> ConsensusResult<VrfShare> {
        round.set_vrf_start_time(Instant::now());
        if !self.dkg_enabled {
            // Without a DKG the share content is a fixed domain constant;
            // the committee still exchanges a threshold of them.
            return self.oracle.share(
                round.number(),
                round.timeout_count(),
                NO_DKG_DOMAIN,
            );
        }
        let message = self.round_message(chain, round)?;
        self.oracle
            .share(round.number(), round.timeout_count(), &message)
    }

    /// Admit one share. Returns the derived `(seed, beacon_output)` when
    /// this share completed the threshold, `None` otherwise.
    pub fn add_share(
        &self,
        chain: &Chain,
        round: &Round,
        share: VrfShare,
    ) -> Option<(Seed, String)> {
        // Every share's timeout count doubles as a restart vote,
        // regardless of whether the share itself is usable.
        round.add_timeout_vote(share.timeout_count, share.party.clone());

        if !chain
            .magic_block_for_round(share.round)
            .contains(&share.party)
        {
            warn!(round = share.round, party = ?share.party, "vrf share from non-member");
            return None;
        }

        if self.dkg_enabled {
            let message = match self.round_message(chain, round) {
                Ok(message) => message,
                Err(e) => {
                    warn!(round = round.number(), error = %e, "cannot form beacon message");
                    return None;
                }
            };
            if !self.oracle.verify_share(&share, &message) {
                warn!(
                    round = share.round,
                    share_tc = share.timeout_count,
                    round_tc = round.timeout_count(),
                    party = ?share.party,
                    "failed to verify vrf share"
                );
                return None;
            }
        }

        if share.timeout_count != round.timeout_count() {
            // Same shares come back during soft timeouts; only those of
            // the current attempt count toward the seed.
            debug!(
                round = share.round,
                share_tc = share.timeout_count,
                round_tc = round.timeout_count(),
                "vrf share timeout count mismatch"
            );
            return None;
        }

        let threshold = self.oracle.threshold();
        if round.share_count() >= threshold {
            round.add_additional_vrf_share(share);
            return self.try_complete(chain, round);
        }
        if !round.add_vrf_share(share, threshold) {
            return None;
        }
        self.try_complete(chain, round)
    }

    /// Combine and derive the seed once the threshold is met. The round's
    /// `VrfComplete` gate keeps this exactly-once.
    fn try_complete(&self, chain: &Chain, round: &Round) -> Option<(Seed, String)> {
        if round.is_vrf_complete() {
            debug!(round = round.number(), "beacon already complete");
            return None;
        }
        let shares = round.vrf_shares();
        if shares.len() < self.oracle.threshold() {
            return None;
        }

        let (seed, output) = if self.dkg_enabled {
            let group = match self.oracle.combine(&shares) {
                Ok(group) => group,
                Err(e) => {
                    warn!(round = round.number(), error = %e, "failed to combine vrf shares");
                    return None;
                }
            };
            let output = encode_hex(&fastcrypto::blake2b_256(|hasher| {
                hasher.update(group.as_bytes());
            }));
            let seed = match seed_from_output(&output) {
                Some(seed) => seed,
                None => {
                    warn!(round = round.number(), output, "unusable beacon output");
                    return None;
                }
            };
            (seed, output)
        } else {
            let prev_seed = chain.round(round.number().wrapping_sub(1))?.seed();
            (draw_seed(prev_seed), String::new())
        };

        if !round.set_random_seed(seed) {
            return None;
        }
        round.set_vrf_output(output.clone());
        if let Some(started) = round.vrf_start_time() {
            info!(
                round = round.number(),
                seed,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "beacon complete"
            );
        }
        Some((seed, output))
    }
}

/// Domain constant signed when no DKG is configured.
const NO_DKG_DOMAIN: &str = "remora-no-dkg";

/// First sixteen hex characters of the beacon output, as a seed.
fn seed_from_output(output: &str) -> Option<Seed> {
    u64::from_str_radix(output.get(..16)?, 16)
        .ok()
        .map(|seed| seed as Seed)
}

/// The non-DKG fallback: a deterministic draw seeded by the previous
/// round's seed. Also used for the provisional seed of a freshly created
/// successor round.
pub fn draw_seed(prev: Seed) -> Seed {
    let mut rng = StdRng::seed_from_u64(prev as u64);
    (rng.gen::<u64>() >> 1) as Seed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::crypto::AggregateBeacon;
    use fastcrypto::traits::KeyPair;
    use remora_types::{MagicBlock, PublicKey};

    struct Net {
        chain: Arc<Chain>,
        beacons: Vec<Beacon>,
    }

    fn net(n: usize, t: usize, dkg_enabled: bool) -> Net {
        let keypairs: Vec<_> = (0..n)
            .map(|_| fastcrypto::bls12381::BLS12381KeyPair::generate(&mut rand::thread_rng()))
            .collect();
        let keys: Vec<PublicKey> = keypairs.iter().map(|kp| kp.public().clone()).collect();
        let magic_block = Arc::new(MagicBlock::new(1, 0, keys.clone(), vec![], t));
        let config = Config {
            dkg_enabled,
            ..Config::default()
        };
        let chain = Chain::bootstrap(config, keys[0].clone(), (*magic_block).clone());
        let beacons = keypairs
            .into_iter()
            .map(|kp| {
                Beacon::new(
                    Arc::new(AggregateBeacon::new(kp, magic_block.clone())),
                    dkg_enabled,
                )
            })
            .collect();
        Net { chain, beacons }
    }

    fn shares_for(net: &Net, round: &Round) -> Vec<VrfShare> {
        net.beacons
            .iter()
            .map(|b| b.make_share(&net.chain, round).unwrap())
            .collect()
    }

    #[test]
    fn message_requires_previous_seed() {
        let net = net(4, 3, true);
        let round2 = net.chain.create_round(2);
        // round 1 does not exist yet
        assert!(matches!(
            net.beacons[0].round_message(&net.chain, &round2),
            Err(ConsensusError::PrevRoundMissing(2))
        ));
        let round1 = net.chain.create_round(1);
        assert!(matches!(
            net.beacons[0].round_message(&net.chain, &round1),
            Ok(_)
        ));
        // round 1 exists but has no seed
        assert!(matches!(
            net.beacons[0].round_message(&net.chain, &round2),
            Err(ConsensusError::PrevSeedMissing(2))
        ));
    }

    #[test]
    fn seed_fires_exactly_once_at_threshold() {
        let net = net(4, 3, true);
        let round = net.chain.create_round(1);
        let shares = shares_for(&net, &round);

        let me = &net.beacons[0];
        assert!(me.add_share(&net.chain, &round, shares[0].clone()).is_none());
        assert!(me.add_share(&net.chain, &round, shares[1].clone()).is_none());
        let completed = me.add_share(&net.chain, &round, shares[2].clone());
        let (seed, output) = completed.expect("third share completes the beacon");
        assert_ne!(seed, 0);
        assert_eq!(round.seed(), seed);
        assert!(round.is_vrf_complete());
        assert_eq!(round.vrf_output(), output);

        // the fourth share is recorded but nothing re-fires
        assert!(me.add_share(&net.chain, &round, shares[3].clone()).is_none());
        assert_eq!(round.share_count(), 4);
    }

    #[test]
    fn seed_is_deterministic_across_members() {
        let net = net(4, 3, true);
        let shares = {
            let round = net.chain.create_round(1);
            shares_for(&net, &round)
        };

        let mut seeds = Vec::new();
        for member in 0..2 {
            let round = Arc::new(Round::new(1));
            let me = &net.beacons[member];
            let mut result = None;
            for share in &shares[..3] {
                result = me.add_share(&net.chain, &round, share.clone()).or(result);
            }
            seeds.push(result.expect("beacon completes").0);
        }
        assert_eq!(seeds[0], seeds[1]);
    }

    #[test]
    fn duplicate_and_mismatched_shares_are_dropped() {
        let net = net(4, 3, true);
        let round = net.chain.create_round(1);
        let shares = shares_for(&net, &round);
        let me = &net.beacons[0];

        assert!(me.add_share(&net.chain, &round, shares[0].clone()).is_none());
        assert!(me.add_share(&net.chain, &round, shares[0].clone()).is_none());
        assert_eq!(round.share_count(), 1);

        // a share pinned to a different timeout count does not land
        let mut stale = shares[1].clone();
        stale.timeout_count = 7;
        assert!(me.add_share(&net.chain, &round, stale).is_none());
        assert_eq!(round.share_count(), 1);

        // a corrupted share fails verification
        let mut bad = shares[1].clone();
        bad.share = shares[2].share.clone();
        assert!(me.add_share(&net.chain, &round, bad).is_none());
        assert_eq!(round.share_count(), 1);
    }

    #[test]
    fn share_timeout_counts_become_restart_votes() {
        let net = net(4, 3, true);
        let round = net.chain.create_round(1);
        let shares = shares_for(&net, &round);
        let me = &net.beacons[0];

        let mut stale = shares[1].clone();
        stale.timeout_count = 3;
        me.add_share(&net.chain, &round, stale);
        let mut stale = shares[2].clone();
        stale.timeout_count = 3;
        me.add_share(&net.chain, &round, stale);
        // two votes for 3: restart jumps past it
        assert_eq!(round.increment_timeout_count(), 4);
    }

    #[test]
    fn non_dkg_seed_draws_from_previous_round() {
        let net = net(4, 3, false);
        let round = net.chain.create_round(1);
        let shares = shares_for(&net, &round);
        let me = &net.beacons[0];
        let mut result = None;
        for share in &shares[..3] {
            result = me.add_share(&net.chain, &round, share.clone()).or(result);
        }
        let (seed, output) = result.expect("beacon completes");
        let prev_seed = net.chain.round(0).unwrap().seed();
        assert_eq!(seed, draw_seed(prev_seed));
        assert!(output.is_empty());
    }
}
