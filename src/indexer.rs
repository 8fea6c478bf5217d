//! # Indexer engine
//!
//! The engine consumes confirmed [`ChainUpdate`]s in order and runs every
//! transaction through the classifier. A transaction can be:
//!
//! - a staking transaction (a tagged commitment plus a matching Taproot
//!   output),
//! - a spender of a known staking output, in which case it is exactly one
//!   of an unbonding transaction or a withdrawal,
//! - a spender of a known unbonding output, which is a withdrawal.
//!
//! The first two cases are independent: a single transaction may create a
//! new staking output while spending an earlier one. The unbonding-table
//! lookup only runs when no staking spend matched.
//!
//! Everything a block produces is committed to the store in one atomic
//! write together with the new last processed height, and only then are
//! the block's events published. Per-transaction invalidity is counted
//! and logged, never fatal; store failures stop the engine.

use bitcoin::consensus::encode::serialize as consensus_serialize;
use bitcoin::OutPoint;
use bitcoin::Transaction;
use bitcoin::Txid;
use tokio::sync::mpsc;

use crate::error::Error;
use crate::events;
use crate::events::ActiveStakingEvent;
use crate::events::BtcInfoEvent;
use crate::events::Event;
use crate::events::EventSink;
use crate::events::UnbondingStakingEvent;
use crate::events::WithdrawStakingEvent;
use crate::metrics::Metrics;
use crate::params::GlobalParams;
use crate::params::ParamsVersions;
use crate::shutdown::ShutdownListener;
use crate::staking;
use crate::staking::ParsedStakingTx;
use crate::storage::model::BlockCommit;
use crate::storage::model::StakingRecord;
use crate::storage::model::UnbondingRecord;
use crate::storage::DbRead;
use crate::storage::DbWrite;
use crate::types::ChainUpdate;
use crate::types::IndexedBlock;

/// The indexer engine.
pub struct StakingIndexer<Store, Sink> {
    store: Store,
    sink: Sink,
    metrics: Metrics,
    params: ParamsVersions,
    base_height: u64,
    chain_updates: mpsc::Receiver<ChainUpdate>,
    shutdown: ShutdownListener,
    confirmed_tvl: u64,
    last_processed_height: Option<u64>,
}

/// Everything one confirmed block produced, gathered before the atomic
/// commit. Classification of later transactions in the same block
/// consults these pending records in addition to the store.
#[derive(Debug, Default)]
struct BlockOutcome {
    staking: Vec<StakingRecord>,
    unbonding: Vec<UnbondingRecord>,
    events: Vec<Event>,
    tvl_delta: u64,
}

impl<S, K> StakingIndexer<S, K>
where
    S: DbRead + DbWrite,
    K: EventSink,
{
    /// Create an engine, loading its aggregates from the store.
    pub async fn new(
        store: S,
        sink: K,
        metrics: Metrics,
        params: ParamsVersions,
        base_height: u64,
        chain_updates: mpsc::Receiver<ChainUpdate>,
        shutdown: ShutdownListener,
    ) -> Result<Self, Error> {
        let confirmed_tvl = store.confirmed_tvl().await?;
        let last_processed_height = store.last_processed_height().await?;
        Ok(Self {
            store,
            sink,
            metrics,
            params,
            base_height,
            chain_updates,
            shutdown,
            confirmed_tvl,
            last_processed_height,
        })
    }

    /// Check that a requested start height neither skips unprocessed
    /// blocks nor re-enters territory below the base height.
    pub fn validate_start_height(&self, start_height: u64) -> Result<(), Error> {
        if start_height < self.base_height {
            return Err(Error::StartHeightBeforeBase {
                start: start_height,
                base: self.base_height,
            });
        }
        match self.last_processed_height {
            None if start_height != self.base_height => {
                Err(Error::StartHeightOnEmptyStore { base: self.base_height })
            }
            Some(last) if start_height > last + 1 => Err(Error::StartHeightTooHigh {
                start: start_height,
                max: last + 1,
            }),
            _ => Ok(()),
        }
    }

    /// A start height that passes [`Self::validate_start_height`]: the
    /// next unprocessed height, or the base height on an empty store.
    pub fn get_start_height(&self) -> u64 {
        self.last_processed_height
            .map(|height| height + 1)
            .unwrap_or(self.base_height)
    }

    /// Run the engine until the update channel closes or shutdown fires.
    #[tracing::instrument(skip_all, name = "staking-indexer")]
    pub async fn run(mut self) -> Result<(), Error> {
        let mut term = self.shutdown.clone();

        let run = async {
            while let Some(update) = self.chain_updates.recv().await {
                self.handle_chain_update(update).await?;
            }
            tracing::info!("chain update channel closed");
            Ok::<_, Error>(())
        };

        tokio::select! {
            _ = term.wait() => {
                tracing::info!("staking indexer received shutdown signal");
            }
            result = run => {
                result?;
            }
        }

        tracing::info!("shutting down the staking indexer");

        Ok(())
    }

    async fn handle_chain_update(&mut self, update: ChainUpdate) -> Result<(), Error> {
        for block in &update.confirmed {
            self.handle_confirmed_block(block).await?;
        }
        if !update.unconfirmed.is_empty() {
            self.publish_btc_info(&update.unconfirmed).await;
        }
        Ok(())
    }

    /// Classify every transaction of a confirmed block, commit the
    /// results atomically and publish the block's events in order.
    #[tracing::instrument(skip_all, fields(height = block.height))]
    async fn handle_confirmed_block(&mut self, block: &IndexedBlock) -> Result<(), Error> {
        let height = u64::try_from(block.height)
            .map_err(|_| Error::NegativeBlockHeight(block.height))?;
        let params = self.params.params_at(height)?.clone();

        let mut outcome = BlockOutcome::default();
        for tx in &block.txs {
            self.classify_tx(tx, block, height, &params, &mut outcome).await?;
        }

        let commit = BlockCommit {
            height,
            confirmed_tvl: self.confirmed_tvl + outcome.tvl_delta,
            staking: outcome.staking,
            unbonding: outcome.unbonding,
        };
        self.store.commit_block(&commit).await?;
        self.confirmed_tvl = commit.confirmed_tvl;
        self.last_processed_height = Some(height);

        for event in &outcome.events {
            events::publish(&self.sink, event).await?;
        }

        self.metrics.set_last_processed_height(height);
        self.metrics.set_confirmed_tvl(self.confirmed_tvl);

        Ok(())
    }

    /// The per-transaction decision procedure.
    async fn classify_tx(
        &self,
        tx: &Transaction,
        block: &IndexedBlock,
        height: u64,
        params: &GlobalParams,
        outcome: &mut BlockOutcome,
    ) -> Result<(), Error> {
        let txid = tx.compute_txid();

        if self.is_tx_processed(&txid, outcome).await? {
            tracing::debug!(%txid, "transaction already recorded, skipping");
            return Ok(());
        }

        if let Some(parsed) = staking::try_parse_staking_tx(tx, params)? {
            match self.process_staking_tx(tx, txid, &parsed, height, block, params, outcome) {
                Ok(()) => {}
                Err(err) if err.is_invalid_staking() => {
                    self.metrics.incr_invalid_staking_txs();
                    tracing::error!(%txid, error = %err, "found an invalid staking tx");
                    return Ok(());
                }
                Err(err) => return Err(err),
            }
            // No early return: the same transaction may also spend an
            // earlier staking output.
        }

        if let Some(staking_record) = self.find_spent_staking(tx, outcome).await? {
            let staking_params = self
                .params
                .params_at(staking_record.inclusion_height)?
                .clone();

            match self.is_valid_unbonding(tx, &staking_record, &staking_params) {
                Ok(true) => {
                    let result = self
                        .process_unbonding_tx(
                            tx,
                            txid,
                            &staking_record,
                            height,
                            block,
                            &staking_params,
                            outcome,
                        )
                        .await;
                    match result {
                        Ok(()) => {}
                        Err(Error::DuplicateTransaction(dup)) => {
                            // Can happen when the indexer replays blocks
                            // after a restart.
                            tracing::warn!(txid = %dup, "found a duplicate unbonding tx");
                        }
                        Err(err) => return Err(err),
                    }
                }
                Ok(false) => {
                    self.process_withdraw_tx(txid, &staking_record.txid, None, height, outcome);
                }
                Err(err) if err.is_invalid_unbonding() => {
                    self.metrics.incr_invalid_unbonding_txs();
                    tracing::error!(%txid, error = %err, "found an invalid unbonding tx");
                }
                Err(err) => return Err(err),
            }
            // A spender of a staking output is never also checked
            // against the unbonding table.
            return Ok(());
        }

        if let Some(unbonding_record) = self.find_spent_unbonding(tx, outcome).await? {
            self.process_withdraw_tx(
                txid,
                &unbonding_record.staking_txid,
                Some(&unbonding_record.txid),
                height,
                outcome,
            );
        }

        Ok(())
    }

    async fn is_tx_processed(
        &self,
        txid: &Txid,
        outcome: &BlockOutcome,
    ) -> Result<bool, Error> {
        let pending = outcome.staking.iter().any(|r| r.txid == *txid)
            || outcome.unbonding.iter().any(|r| r.txid == *txid);
        if pending {
            return Ok(true);
        }
        self.store.tx_exists(txid).await
    }

    /// The staking record whose staking output this transaction spends,
    /// if any. Records pending in the current block count too.
    async fn find_spent_staking(
        &self,
        tx: &Transaction,
        outcome: &BlockOutcome,
    ) -> Result<Option<StakingRecord>, Error> {
        for input in &tx.input {
            let candidate = input.previous_output.txid;
            let record = match outcome.staking.iter().find(|r| r.txid == candidate) {
                Some(record) => Some(*record),
                None => self.store.get_staking_tx(&candidate).await?,
            };
            if let Some(record) = record {
                if input.previous_output.vout == record.staking_output_index {
                    return Ok(Some(record));
                }
            }
        }
        Ok(None)
    }

    /// The unbonding record whose output this transaction spends, if any.
    async fn find_spent_unbonding(
        &self,
        tx: &Transaction,
        outcome: &BlockOutcome,
    ) -> Result<Option<UnbondingRecord>, Error> {
        for input in &tx.input {
            let candidate = input.previous_output.txid;
            let record = match outcome.unbonding.iter().find(|r| r.txid == candidate) {
                Some(record) => Some(*record),
                None => self.store.get_unbonding_tx(&candidate).await?,
            };
            if let Some(record) = record {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    /// Decide whether a transaction spending `record`'s staking output is
    /// a valid unbonding transaction.
    ///
    /// `Ok(false)` means the spender does not use the unbonding path (a
    /// withdrawal). An unbonding-shaped spender with a wrong output value
    /// is an error the caller counts and skips.
    fn is_valid_unbonding(
        &self,
        tx: &Transaction,
        record: &StakingRecord,
        params: &GlobalParams,
    ) -> Result<bool, Error> {
        if tx.input.len() != 1 || tx.output.len() != 1 {
            return Ok(false);
        }
        let staking_outpoint = OutPoint {
            txid: record.txid,
            vout: record.staking_output_index,
        };
        if tx.input[0].previous_output != staking_outpoint {
            return Ok(false);
        }

        if record.staking_value <= params.unbonding_fee {
            return Err(Error::UnbondingValueTooLow {
                staking_value: record.staking_value,
                fee: params.unbonding_fee,
            });
        }
        let expected_value = record.staking_value - params.unbonding_fee;

        let expected_script = staking::build_unbonding_script_pubkey(
            &record.staker_pk,
            &record.finality_provider_pk,
            &params.covenant_x_only_pks(),
            params.covenant_quorum,
            params.unbonding_time,
        )?;
        if tx.output[0].script_pubkey != expected_script {
            // The spender does not use the unbonding path.
            return Ok(false);
        }
        if tx.output[0].value.to_sat() != expected_value {
            return Err(Error::UnbondingValueMismatch {
                got: tx.output[0].value.to_sat(),
                expected: expected_value,
            });
        }

        Ok(true)
    }

    #[allow(clippy::too_many_arguments)]
    fn process_staking_tx(
        &self,
        tx: &Transaction,
        txid: Txid,
        parsed: &ParsedStakingTx,
        height: u64,
        block: &IndexedBlock,
        params: &GlobalParams,
        outcome: &mut BlockOutcome,
    ) -> Result<(), Error> {
        validate_staking_tx(params, parsed)?;

        let is_overflow =
            self.confirmed_tvl + outcome.tvl_delta + parsed.staking_value > params.staking_cap;

        tracing::info!(%txid, height, value = parsed.staking_value, is_overflow, "found a staking tx");

        outcome.events.push(Event::Staking(ActiveStakingEvent {
            staking_tx_hash_hex: txid.to_string(),
            staker_pk_hex: hex::encode(parsed.staker_pk.serialize()),
            finality_provider_pk_hex: hex::encode(parsed.finality_provider_pk.serialize()),
            staking_value: parsed.staking_value,
            staking_start_height: height,
            staking_start_timestamp: i64::from(block.header.time),
            staking_time: parsed.staking_time,
            staking_output_index: parsed.staking_output_index,
            staking_tx_hex: hex::encode(consensus_serialize(tx)),
            is_overflow,
        }));
        outcome.staking.push(StakingRecord {
            txid,
            staking_output_index: parsed.staking_output_index,
            inclusion_height: height,
            staker_pk: parsed.staker_pk,
            staking_time: parsed.staking_time,
            finality_provider_pk: parsed.finality_provider_pk,
            staking_value: parsed.staking_value,
            is_overflow,
        });
        if !is_overflow {
            outcome.tvl_delta += parsed.staking_value;
        }

        self.metrics.incr_staking_txs();

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn process_unbonding_tx(
        &self,
        tx: &Transaction,
        txid: Txid,
        staking_record: &StakingRecord,
        height: u64,
        block: &IndexedBlock,
        params: &GlobalParams,
        outcome: &mut BlockOutcome,
    ) -> Result<(), Error> {
        if self.store.get_unbonding_tx(&txid).await?.is_some() {
            return Err(Error::DuplicateTransaction(txid));
        }

        tracing::info!(
            %txid,
            height,
            staking_txid = %staking_record.txid,
            "found an unbonding tx"
        );

        outcome.events.push(Event::Unbonding(UnbondingStakingEvent {
            staking_tx_hash_hex: staking_record.txid.to_string(),
            unbonding_tx_hash_hex: txid.to_string(),
            unbonding_start_height: height,
            unbonding_start_timestamp: i64::from(block.header.time),
            unbonding_time: params.unbonding_time,
            // A valid unbonding tx always has exactly one output.
            unbonding_output_index: 0,
            unbonding_tx_hex: hex::encode(consensus_serialize(tx)),
        }));
        outcome.unbonding.push(UnbondingRecord {
            txid,
            staking_txid: staking_record.txid,
        });

        self.metrics.incr_unbonding_txs();

        Ok(())
    }

    fn process_withdraw_tx(
        &self,
        txid: Txid,
        staking_txid: &Txid,
        unbonding_txid: Option<&Txid>,
        height: u64,
        outcome: &mut BlockOutcome,
    ) {
        match unbonding_txid {
            None => {
                tracing::info!(%txid, height, staking_txid = %staking_txid, "found a withdraw tx from staking");
                self.metrics.incr_withdraw_from_staking();
            }
            Some(unbonding_txid) => {
                tracing::info!(
                    %txid,
                    height,
                    staking_txid = %staking_txid,
                    unbonding_txid = %unbonding_txid,
                    "found a withdraw tx from unbonding"
                );
                self.metrics.incr_withdraw_from_unbonding();
            }
        }

        outcome.events.push(Event::Withdraw(WithdrawStakingEvent {
            staking_tx_hash_hex: staking_txid.to_string(),
        }));
    }

    /// Forward the unconfirmed tail as a best-effort info event; failures
    /// are logged, not propagated.
    async fn publish_btc_info(&self, unconfirmed: &[IndexedBlock]) {
        let unconfirmed_heights: Vec<u64> =
            unconfirmed.iter().map(|b| b.height.max(0) as u64).collect();
        let event = Event::BtcInfo(BtcInfoEvent {
            tip_height: unconfirmed_heights.last().copied().unwrap_or_default(),
            last_confirmed_height: self.last_processed_height.unwrap_or_default(),
            unconfirmed_heights,
        });
        if let Err(err) = events::publish(&self.sink, &event).await {
            tracing::warn!(error = %err, "failed to publish the btc info event");
        }
    }
}

/// Check the staking commitment against the economic bounds of the
/// active parameters.
fn validate_staking_tx(params: &GlobalParams, parsed: &ParsedStakingTx) -> Result<(), Error> {
    if parsed.staking_value < params.min_staking_amount {
        return Err(Error::StakingAmountTooLow {
            got: parsed.staking_value,
            min: params.min_staking_amount,
        });
    }
    if parsed.staking_value > params.max_staking_amount {
        return Err(Error::StakingAmountTooHigh {
            got: parsed.staking_value,
            max: params.max_staking_amount,
        });
    }
    if parsed.staking_time < params.min_staking_time {
        return Err(Error::StakingTimeTooLow {
            got: parsed.staking_time,
            min: params.min_staking_time,
        });
    }
    if parsed.staking_time > params.max_staking_time {
        return Err(Error::StakingTimeTooHigh {
            got: parsed.staking_time,
            max: params.max_staking_time,
        });
    }
    Ok(())
}
