//! # Staking indexer
//!
//! A daemon that follows the tail of a Bitcoin chain and extracts the
//! transactions relevant to a BTC staking protocol: staking deposits
//! committed through an `OP_RETURN` tag, unbonding transactions spending a
//! known staking output through the unbonding path, and withdrawals
//! spending either a known staking output or a known unbonding output.
//!
//! The pipeline is split into two long-running tasks connected by a
//! bounded channel of [`types::ChainUpdate`]s:
//!
//! - the [`scanner::BtcPoller`] follows the node, keeps a sliding window
//!   of unconfirmed blocks and decides which blocks are k-deep, and
//! - the [`indexer::StakingIndexer`] classifies every transaction of each
//!   confirmed block, persists the resulting records atomically per block
//!   and publishes events to the downstream consumer.

pub mod bitcoin_client;
pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod indexer;
pub mod metrics;
pub mod params;
pub mod scanner;
pub mod shutdown;
pub mod staking;
pub mod storage;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod types;

/// Package version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
