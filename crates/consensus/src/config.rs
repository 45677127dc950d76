//! Configuration for the round engine.
//!
//! All timing in the protocol hangs off a single knob: the network relay
//! delta. The scheduler's accumulation window is three deltas; everything
//! else (soft timeouts, fetcher lifetime) is configured directly.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a consensus node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Upper bound on network relay latency between miners (delta).
    pub delta: Duration,
    /// Number of transactions that fill a block.
    pub block_size: usize,
    /// Whether the threshold beacon runs a real DKG. When false the seed
    /// degenerates to a deterministic draw from the previous round's seed.
    pub dkg_enabled: bool,
    /// How long a finalized-block fetch stays de-duplicated before it may
    /// be retried.
    pub fb_fetching_lifetime: Duration,
    /// How many of the best-ranked members generate a block each round.
    pub num_generators: usize,
    /// Soft timeout: how long to wait for round progress before
    /// re-broadcasting the VRF share.
    pub soft_timeout: Duration,
    /// Soft timeouts tolerated before the round restarts with a higher
    /// timeout count.
    pub soft_timeout_retries: u32,
    /// Grace window blocks survive in the cache after falling below the
    /// latest finalized round.
    pub cache_grace: Duration,
    /// Development mode: induce a random delay up to this bound before
    /// proposing, to exercise timeout paths.
    pub max_induced_delay: Option<Duration>,
}

impl Config {
    /// The scheduler's accumulation window: three network relay deltas.
    pub fn block_time(&self) -> Duration {
        3 * self.delta
    }

    /// Load configuration from environment variables, falling back to the
    /// defaults for anything unset.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("REMORA_DELTA_MS") {
            if let Ok(ms) = val.parse() {
                config.delta = Duration::from_millis(ms);
            }
        }
        if let Ok(val) = std::env::var("REMORA_BLOCK_SIZE") {
            if let Ok(size) = val.parse() {
                config.block_size = size;
            }
        }
        if let Ok(val) = std::env::var("REMORA_DKG_ENABLED") {
            config.dkg_enabled = val.to_lowercase() == "true";
        }
        if let Ok(val) = std::env::var("REMORA_FB_FETCHING_LIFETIME_MS") {
            if let Ok(ms) = val.parse() {
                config.fb_fetching_lifetime = Duration::from_millis(ms);
            }
        }
        if let Ok(val) = std::env::var("REMORA_NUM_GENERATORS") {
            if let Ok(n) = val.parse() {
                config.num_generators = n;
            }
        }
        if let Ok(val) = std::env::var("REMORA_SOFT_TIMEOUT_MS") {
            if let Ok(ms) = val.parse() {
                config.soft_timeout = Duration::from_millis(ms);
            }
        }
        if let Ok(val) = std::env::var("REMORA_MAX_INDUCED_DELAY_MS") {
            if let Ok(ms) = val.parse::<u64>() {
                config.max_induced_delay = (ms > 0).then(|| Duration::from_millis(ms));
            }
        }

        config
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            delta: Duration::from_millis(200),
            block_size: 5_000,
            dkg_enabled: true,
            fb_fetching_lifetime: Duration::from_secs(10),
            num_generators: 2,
            soft_timeout: Duration::from_millis(1_500),
            soft_timeout_retries: 3,
            cache_grace: Duration::from_secs(60),
            max_induced_delay: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_time_is_three_deltas() {
        let config = Config {
            delta: Duration::from_millis(250),
            ..Config::default()
        };
        assert_eq!(config.block_time(), Duration::from_millis(750));
    }

    #[test]
    fn default_config() {
        let config = Config::default();
        assert!(config.dkg_enabled);
        assert_eq!(config.block_time(), Duration::from_millis(600));
        assert!(config.max_induced_delay.is_none());
    }
}
