//! # Indexer storage
//!
//! This module contains the `DbRead` and `DbWrite` traits representing
//! the interface between the indexer and its persistent index.
//!
//! The canonical implementation is the sled-backed
//! [`persistent::IndexerStore`]; [`memory::Store`] provides a shared
//! in-memory implementation for tests.

#[cfg(any(test, feature = "testing"))]
pub mod memory;
pub mod model;
pub mod persistent;

use std::future::Future;

use bitcoin::Txid;

use crate::error::Error;
use crate::storage::model::BlockCommit;
use crate::storage::model::StakingRecord;
use crate::storage::model::UnbondingRecord;

/// Key under which the last processed height is stored in the meta table.
pub const META_LAST_PROCESSED_HEIGHT: &str = "last_processed_height";
/// Key under which the confirmed TVL is stored in the meta table.
pub const META_CONFIRMED_TVL: &str = "confirmed_tvl";

/// Represents the ability to read the indexer store.
pub trait DbRead {
    /// Get the staking record with the given transaction hash.
    fn get_staking_tx(
        &self,
        txid: &Txid,
    ) -> impl Future<Output = Result<Option<StakingRecord>, Error>> + Send;

    /// Get the unbonding record with the given transaction hash.
    fn get_unbonding_tx(
        &self,
        txid: &Txid,
    ) -> impl Future<Output = Result<Option<UnbondingRecord>, Error>> + Send;

    /// Whether the transaction hash is present in either table.
    fn tx_exists(&self, txid: &Txid) -> impl Future<Output = Result<bool, Error>> + Send;

    /// The height of the last block committed to the store, if any.
    fn last_processed_height(&self)
        -> impl Future<Output = Result<Option<u64>, Error>> + Send;

    /// The confirmed TVL: the sum of staking values over non-overflow
    /// records at or below the last processed height.
    fn confirmed_tvl(&self) -> impl Future<Output = Result<u64, Error>> + Send;

    /// All staking records, in store order. Used by the export and dump
    /// tooling.
    fn staking_txs(&self) -> impl Future<Output = Result<Vec<StakingRecord>, Error>> + Send;
}

/// Represents the ability to write to the indexer store.
pub trait DbWrite {
    /// Atomically persist everything a confirmed block produced: its
    /// staking and unbonding records, the new last processed height and
    /// the new confirmed TVL.
    ///
    /// Records whose key already exists are left untouched, so replaying
    /// a block after a restart is harmless.
    fn commit_block(
        &self,
        commit: &BlockCommit,
    ) -> impl Future<Output = Result<(), Error>> + Send;
}
