//! Events published to the downstream consumer.
//!
//! Delivery is at-least-once: a restart may replay events the consumer
//! has already seen, so every event carries the identifiers needed to
//! deduplicate.

use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;

use serde::Serialize;

use crate::error::Error;

/// A staking transaction was confirmed and accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveStakingEvent {
    /// Hash of the staking transaction, hex encoded.
    pub staking_tx_hash_hex: String,
    /// The staker's x-only public key, hex encoded.
    pub staker_pk_hex: String,
    /// The finality provider's x-only public key, hex encoded.
    pub finality_provider_pk_hex: String,
    /// The staking value in satoshis.
    pub staking_value: u64,
    /// Height of the block including the transaction.
    pub staking_start_height: u64,
    /// Timestamp of the including block.
    pub staking_start_timestamp: i64,
    /// The committed staking time in blocks.
    pub staking_time: u16,
    /// Index of the staking output.
    pub staking_output_index: u32,
    /// The raw staking transaction, hex encoded.
    pub staking_tx_hex: String,
    /// Whether the stake landed above the staking cap.
    pub is_overflow: bool,
}

/// A known staking output was spent through the unbonding path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnbondingStakingEvent {
    /// Hash of the staking transaction being unbonded, hex encoded.
    pub staking_tx_hash_hex: String,
    /// Hash of the unbonding transaction, hex encoded.
    pub unbonding_tx_hash_hex: String,
    /// Height of the block including the unbonding transaction.
    pub unbonding_start_height: u64,
    /// Timestamp of the including block.
    pub unbonding_start_timestamp: i64,
    /// The unbonding timelock in blocks, from the parameters active at
    /// the staking transaction's inclusion height.
    pub unbonding_time: u16,
    /// Index of the unbonding output. A valid unbonding transaction has
    /// exactly one output.
    pub unbonding_output_index: u32,
    /// The raw unbonding transaction, hex encoded.
    pub unbonding_tx_hex: String,
}

/// A known staking or unbonding output was withdrawn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WithdrawStakingEvent {
    /// Hash of the staking transaction whose value was withdrawn, hex
    /// encoded.
    pub staking_tx_hash_hex: String,
}

/// Best-effort information about the unconfirmed tail of the chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BtcInfoEvent {
    /// Height of the current chain tip.
    pub tip_height: u64,
    /// Height of the last confirmed (processed) block.
    pub last_confirmed_height: u64,
    /// Heights of the unconfirmed blocks, ascending.
    pub unconfirmed_heights: Vec<u64>,
}

/// Any event the indexer publishes, in production order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// See [`ActiveStakingEvent`].
    Staking(ActiveStakingEvent),
    /// See [`UnbondingStakingEvent`].
    Unbonding(UnbondingStakingEvent),
    /// See [`WithdrawStakingEvent`].
    Withdraw(WithdrawStakingEvent),
    /// See [`BtcInfoEvent`].
    BtcInfo(BtcInfoEvent),
}

/// Capability to push events to the downstream event bus.
pub trait EventSink {
    /// Push a staking event.
    fn push_staking_event(
        &self,
        event: &ActiveStakingEvent,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Push an unbonding event.
    fn push_unbonding_event(
        &self,
        event: &UnbondingStakingEvent,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Push a withdraw event.
    fn push_withdraw_event(
        &self,
        event: &WithdrawStakingEvent,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Push a chain-info event.
    fn push_btc_info_event(
        &self,
        event: &BtcInfoEvent,
    ) -> impl Future<Output = Result<(), Error>> + Send;
}

/// Dispatch an event to the matching sink method.
pub async fn publish<S: EventSink>(sink: &S, event: &Event) -> Result<(), Error> {
    match event {
        Event::Staking(event) => sink.push_staking_event(event).await,
        Event::Unbonding(event) => sink.push_unbonding_event(event).await,
        Event::Withdraw(event) => sink.push_withdraw_event(event).await,
        Event::BtcInfo(event) => sink.push_btc_info_event(event).await,
    }
}

/// A sink that only logs events. Useful when no queue is wired up.
#[derive(Debug, Clone, Default)]
pub struct LogSink;

impl EventSink for LogSink {
    async fn push_staking_event(&self, event: &ActiveStakingEvent) -> Result<(), Error> {
        tracing::info!(
            tx_hash = %event.staking_tx_hash_hex,
            value = event.staking_value,
            is_overflow = event.is_overflow,
            "staking event"
        );
        Ok(())
    }

    async fn push_unbonding_event(&self, event: &UnbondingStakingEvent) -> Result<(), Error> {
        tracing::info!(
            tx_hash = %event.unbonding_tx_hash_hex,
            staking_tx_hash = %event.staking_tx_hash_hex,
            "unbonding event"
        );
        Ok(())
    }

    async fn push_withdraw_event(&self, event: &WithdrawStakingEvent) -> Result<(), Error> {
        tracing::info!(staking_tx_hash = %event.staking_tx_hash_hex, "withdraw event");
        Ok(())
    }

    async fn push_btc_info_event(&self, event: &BtcInfoEvent) -> Result<(), Error> {
        tracing::debug!(
            tip_height = event.tip_height,
            last_confirmed_height = event.last_confirmed_height,
            "btc info event"
        );
        Ok(())
    }
}

/// A sink that records every event in order. Test only, but kept under
/// the `testing` feature so integration harnesses can use it too.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    events: Arc<Mutex<Vec<Event>>>,
}

impl RecordingSink {
    /// Create an empty recording sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// All events pushed so far, in push order.
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().map(|events| events.clone()).unwrap_or_default()
    }

    fn record(&self, event: Event) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

impl EventSink for RecordingSink {
    async fn push_staking_event(&self, event: &ActiveStakingEvent) -> Result<(), Error> {
        self.record(Event::Staking(event.clone()));
        Ok(())
    }

    async fn push_unbonding_event(&self, event: &UnbondingStakingEvent) -> Result<(), Error> {
        self.record(Event::Unbonding(event.clone()));
        Ok(())
    }

    async fn push_withdraw_event(&self, event: &WithdrawStakingEvent) -> Result<(), Error> {
        self.record(Event::Withdraw(event.clone()));
        Ok(())
    }

    async fn push_btc_info_event(&self, event: &BtcInfoEvent) -> Result<(), Error> {
        self.record(Event::BtcInfo(event.clone()));
        Ok(())
    }
}
