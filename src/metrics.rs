//! Metrics reported by the indexer.
//!
//! The handle is injected into the components that report, rather than
//! having them write to process-wide singletons. All counters go through
//! the `metrics` facade; `start` wires up the prometheus exporter.

use crate::error::Error;

const STAKING_TXS_TOTAL: &str = "staking_indexer_staking_txs_total";
const INVALID_STAKING_TXS_TOTAL: &str = "staking_indexer_invalid_staking_txs_total";
const UNBONDING_TXS_TOTAL: &str = "staking_indexer_unbonding_txs_total";
const INVALID_UNBONDING_TXS_TOTAL: &str = "staking_indexer_invalid_unbonding_txs_total";
const WITHDRAW_FROM_STAKING_TOTAL: &str = "staking_indexer_withdraw_txs_from_staking_total";
const WITHDRAW_FROM_UNBONDING_TOTAL: &str = "staking_indexer_withdraw_txs_from_unbonding_total";
const LAST_PROCESSED_HEIGHT: &str = "staking_indexer_last_processed_btc_height";
const START_HEIGHT: &str = "staking_indexer_start_btc_height";
const CONFIRMED_TVL: &str = "staking_indexer_confirmed_tvl_sats";

/// Handle for reporting indexer metrics.
#[derive(Debug, Clone, Default)]
pub struct Metrics;

impl Metrics {
    /// Create a metrics handle.
    pub fn new() -> Self {
        Self
    }

    /// A staking transaction was accepted.
    pub fn incr_staking_txs(&self) {
        metrics::counter!(STAKING_TXS_TOTAL).increment(1);
    }

    /// A recognized staking commitment failed validation.
    pub fn incr_invalid_staking_txs(&self) {
        metrics::counter!(INVALID_STAKING_TXS_TOTAL).increment(1);
    }

    /// An unbonding transaction was accepted.
    pub fn incr_unbonding_txs(&self) {
        metrics::counter!(UNBONDING_TXS_TOTAL).increment(1);
    }

    /// A spender unlocked the unbonding path with a wrong value.
    pub fn incr_invalid_unbonding_txs(&self) {
        metrics::counter!(INVALID_UNBONDING_TXS_TOTAL).increment(1);
    }

    /// A withdrawal from a staking output was observed.
    pub fn incr_withdraw_from_staking(&self) {
        metrics::counter!(WITHDRAW_FROM_STAKING_TOTAL).increment(1);
    }

    /// A withdrawal from an unbonding output was observed.
    pub fn incr_withdraw_from_unbonding(&self) {
        metrics::counter!(WITHDRAW_FROM_UNBONDING_TOTAL).increment(1);
    }

    /// The height the indexer started from.
    pub fn set_start_height(&self, height: u64) {
        metrics::gauge!(START_HEIGHT).set(height as f64);
    }

    /// The height of the last committed block.
    pub fn set_last_processed_height(&self, height: u64) {
        metrics::gauge!(LAST_PROCESSED_HEIGHT).set(height as f64);
    }

    /// The confirmed TVL after the last committed block.
    pub fn set_confirmed_tvl(&self, tvl: u64) {
        metrics::gauge!(CONFIRMED_TVL).set(tvl as f64);
    }
}

/// Install the prometheus exporter on the given listen address.
pub fn install_prometheus_exporter(addr: std::net::SocketAddr) -> Result<(), Error> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|err| Error::MetricsExporter(err.to_string()))
}
