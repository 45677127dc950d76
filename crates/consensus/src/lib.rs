//! The remora consensus core: a round-driven block-production and
//! notarization engine for a permissioned-BFT chain.
//!
//! # Architecture
//!
//! For each round, the committee runs a threshold random beacon to derive
//! a shared seed, ranks itself deterministically from that seed, and lets
//! the best-ranked members propose blocks. Every member verifies the
//! candidates in rank order after an accumulation window and answers with
//! a verification ticket; a threshold of tickets notarizes a block. A
//! notarization starts the next round and finalizes the round before it.
//!
//! - [`round::Round`] holds per-round state: proposals, notarized blocks,
//!   beacon shares, the rank permutation, timeout votes.
//! - [`beacon::Beacon`] admits VRF shares and derives the round seed.
//! - The collector (one task per round) accumulates proposals until the
//!   block-time timer fires, then verifies them in rank order.
//! - The notarization logic tallies tickets, starts round `R+1`, and
//!   schedules finalization of `R-1`.
//! - [`fetcher::FinalizedBlockFetcher`] recovers gaps by fetching missing
//!   finalized blocks from sharders, de-duplicating in-flight requests.
//! - [`chain::Chain`] is the process-wide façade over the round map, the
//!   block cache, and the magic-block committee definitions.
//!
//! All I/O happens behind the traits in [`interfaces`]; the engine itself
//! never opens a socket or a database.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

pub mod beacon;
pub mod cache;
pub mod chain;
pub mod collector;
pub mod config;
pub mod crypto;
pub mod error;
pub mod fetcher;
pub mod generator;
pub mod interfaces;
pub mod notarizer;
pub mod protocol;
pub mod round;
pub mod storage;

pub use beacon::Beacon;
pub use cache::BlockCache;
pub use chain::Chain;
pub use config::Config;
pub use crypto::{AggregateBeacon, BlsSigner};
pub use error::{ConsensusError, ConsensusResult};
pub use fetcher::FinalizedBlockFetcher;
pub use interfaces::{
    BeaconOracle, BlockStateHandler, Peers, ProtocolMessage, Signer, TransactionPool,
};
pub use protocol::Protocol;
pub use round::{Round, RoundState};
pub use storage::{load_dkg, DkgSummary, MemoryStore, SummaryStore};
