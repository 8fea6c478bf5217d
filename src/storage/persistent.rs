//! Sled-backed store implementation.
//!
//! Three trees back the three logical tables: `staking_txs` and
//! `unbonding_txs` keyed by the 32-byte transaction hash, and `meta`
//! keyed by short strings. A block commit is a single multi-tree
//! transaction, so a crash can never leave a half-written block.

use std::path::Path;

use bitcoin::hashes::Hash as _;
use bitcoin::Txid;
use sled::transaction::TransactionError;
use sled::Transactional as _;

use crate::error::Error;
use crate::storage::model;
use crate::storage::model::BlockCommit;
use crate::storage::model::StakingRecord;
use crate::storage::model::UnbondingRecord;
use crate::storage::DbRead;
use crate::storage::DbWrite;
use crate::storage::META_CONFIRMED_TVL;
use crate::storage::META_LAST_PROCESSED_HEIGHT;

/// The persistent indexer store.
#[derive(Debug, Clone)]
pub struct IndexerStore {
    db: sled::Db,
    staking: sled::Tree,
    unbonding: sled::Tree,
    meta: sled::Tree,
}

impl IndexerStore {
    /// Open (or create) the store under the given directory.
    pub fn open(path: &Path) -> Result<Self, Error> {
        let db = sled::open(path)?;
        Ok(Self {
            staking: db.open_tree("staking_txs")?,
            unbonding: db.open_tree("unbonding_txs")?,
            meta: db.open_tree("meta")?,
            db,
        })
    }

    fn get_meta_u64(&self, key: &str) -> Result<Option<u64>, Error> {
        self.meta
            .get(key)?
            .map(|bytes| model::decode_u64(&bytes))
            .transpose()
    }
}

impl DbRead for IndexerStore {
    async fn get_staking_tx(&self, txid: &Txid) -> Result<Option<StakingRecord>, Error> {
        self.staking
            .get(txid.to_byte_array())?
            .map(|bytes| StakingRecord::decode(&bytes))
            .transpose()
    }

    async fn get_unbonding_tx(&self, txid: &Txid) -> Result<Option<UnbondingRecord>, Error> {
        self.unbonding
            .get(txid.to_byte_array())?
            .map(|bytes| UnbondingRecord::decode(&bytes))
            .transpose()
    }

    async fn tx_exists(&self, txid: &Txid) -> Result<bool, Error> {
        let key = txid.to_byte_array();
        Ok(self.staking.contains_key(key)? || self.unbonding.contains_key(key)?)
    }

    async fn last_processed_height(&self) -> Result<Option<u64>, Error> {
        self.get_meta_u64(META_LAST_PROCESSED_HEIGHT)
    }

    async fn confirmed_tvl(&self) -> Result<u64, Error> {
        Ok(self.get_meta_u64(META_CONFIRMED_TVL)?.unwrap_or(0))
    }

    async fn staking_txs(&self) -> Result<Vec<StakingRecord>, Error> {
        self.staking
            .iter()
            .map(|item| {
                let (_, bytes) = item?;
                StakingRecord::decode(&bytes)
            })
            .collect()
    }
}

impl DbWrite for IndexerStore {
    async fn commit_block(&self, commit: &BlockCommit) -> Result<(), Error> {
        (&self.staking, &self.unbonding, &self.meta)
            .transaction(|(staking, unbonding, meta)| {
                for record in &commit.staking {
                    let key = record.txid.to_byte_array();
                    if staking.get(key)?.is_none() {
                        staking.insert(&key[..], record.encode())?;
                    }
                }
                for record in &commit.unbonding {
                    let key = record.txid.to_byte_array();
                    if unbonding.get(key)?.is_none() {
                        unbonding.insert(&key[..], record.encode())?;
                    }
                }
                meta.insert(
                    META_LAST_PROCESSED_HEIGHT,
                    &model::encode_u64(commit.height)[..],
                )?;
                meta.insert(
                    META_CONFIRMED_TVL,
                    &model::encode_u64(commit.confirmed_tvl)[..],
                )?;
                Ok(())
            })
            .map_err(|err: TransactionError<Error>| match err {
                TransactionError::Abort(err) => err,
                TransactionError::Storage(err) => Error::Sled(err),
            })?;

        self.db.flush_async().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng as _;

    use super::*;
    use crate::testing::datagen;

    #[test_log::test(tokio::test)]
    async fn commit_persists_across_a_reopen() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(40);
        let dir = tempfile::tempdir().expect("tempdir");
        let staking = datagen::random_staking_record(&mut rng, 150);
        let unbonding = UnbondingRecord {
            txid: datagen::random_txid(&mut rng),
            staking_txid: staking.txid,
        };
        let commit = BlockCommit {
            height: 151,
            confirmed_tvl: staking.staking_value,
            staking: vec![staking],
            unbonding: vec![unbonding],
        };

        {
            let store = IndexerStore::open(dir.path()).expect("open");
            store.commit_block(&commit).await.expect("commit");
        }

        let store = IndexerStore::open(dir.path()).expect("reopen");
        assert_eq!(
            store.get_staking_tx(&staking.txid).await.expect("read"),
            Some(staking)
        );
        assert_eq!(
            store.get_unbonding_tx(&unbonding.txid).await.expect("read"),
            Some(unbonding)
        );
        assert_eq!(
            store.last_processed_height().await.expect("read"),
            Some(151)
        );
        assert_eq!(store.confirmed_tvl().await.expect("read"), staking.staking_value);
        assert!(store.tx_exists(&staking.txid).await.expect("read"));
        assert!(store.tx_exists(&unbonding.txid).await.expect("read"));
    }

    #[test_log::test(tokio::test)]
    async fn replaying_a_commit_does_not_duplicate_records() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(41);
        let dir = tempfile::tempdir().expect("tempdir");
        let store = IndexerStore::open(dir.path()).expect("open");
        let staking = datagen::random_staking_record(&mut rng, 200);
        let commit = BlockCommit {
            height: 200,
            confirmed_tvl: staking.staking_value,
            staking: vec![staking],
            unbonding: Vec::new(),
        };

        store.commit_block(&commit).await.expect("commit");
        store.commit_block(&commit).await.expect("replay");

        assert_eq!(store.staking_txs().await.expect("list").len(), 1);
        assert_eq!(store.last_processed_height().await.expect("read"), Some(200));
    }

    #[test_log::test(tokio::test)]
    async fn an_empty_store_reports_no_height_and_zero_tvl() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = IndexerStore::open(dir.path()).expect("open");
        assert_eq!(store.last_processed_height().await.expect("read"), None);
        assert_eq!(store.confirmed_tvl().await.expect("read"), 0);
    }
}
