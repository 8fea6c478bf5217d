//! In-memory store implementation, used for testing.

use std::collections::BTreeMap;
use std::sync::Arc;

use bitcoin::hashes::Hash as _;
use bitcoin::Txid;
use tokio::sync::Mutex;

use crate::error::Error;
use crate::storage::model::BlockCommit;
use crate::storage::model::StakingRecord;
use crate::storage::model::UnbondingRecord;
use crate::storage::DbRead;
use crate::storage::DbWrite;

/// A handle to the raw in-memory store.
pub type SharedStore = Arc<Mutex<Store>>;

/// The in-memory store.
#[derive(Debug, Default)]
pub struct Store {
    /// Staking records by transaction hash.
    pub staking_txs: BTreeMap<[u8; 32], StakingRecord>,
    /// Unbonding records by transaction hash.
    pub unbonding_txs: BTreeMap<[u8; 32], UnbondingRecord>,
    /// Height of the last committed block.
    pub last_processed_height: Option<u64>,
    /// Confirmed TVL after the last committed block.
    pub confirmed_tvl: u64,
}

impl Store {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new empty store wrapped in an `Arc<Mutex<...>>`.
    pub fn new_shared() -> SharedStore {
        Arc::new(Mutex::new(Self::new()))
    }
}

impl DbRead for SharedStore {
    async fn get_staking_tx(&self, txid: &Txid) -> Result<Option<StakingRecord>, Error> {
        Ok(self.lock().await.staking_txs.get(&txid.to_byte_array()).copied())
    }

    async fn get_unbonding_tx(&self, txid: &Txid) -> Result<Option<UnbondingRecord>, Error> {
        Ok(self.lock().await.unbonding_txs.get(&txid.to_byte_array()).copied())
    }

    async fn tx_exists(&self, txid: &Txid) -> Result<bool, Error> {
        let store = self.lock().await;
        let key = txid.to_byte_array();
        Ok(store.staking_txs.contains_key(&key) || store.unbonding_txs.contains_key(&key))
    }

    async fn last_processed_height(&self) -> Result<Option<u64>, Error> {
        Ok(self.lock().await.last_processed_height)
    }

    async fn confirmed_tvl(&self) -> Result<u64, Error> {
        Ok(self.lock().await.confirmed_tvl)
    }

    async fn staking_txs(&self) -> Result<Vec<StakingRecord>, Error> {
        Ok(self.lock().await.staking_txs.values().copied().collect())
    }
}

impl DbWrite for SharedStore {
    async fn commit_block(&self, commit: &BlockCommit) -> Result<(), Error> {
        let mut store = self.lock().await;
        for record in &commit.staking {
            store
                .staking_txs
                .entry(record.txid.to_byte_array())
                .or_insert(*record);
        }
        for record in &commit.unbonding {
            store
                .unbonding_txs
                .entry(record.txid.to_byte_array())
                .or_insert(*record);
        }
        store.last_processed_height = Some(commit.height);
        store.confirmed_tvl = commit.confirmed_tvl;
        Ok(())
    }
}
