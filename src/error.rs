//! Top-level error type used throughout the indexer.

use bitcoin::Txid;

/// Top-level indexer error
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The staking amount committed by a staking transaction is below the
    /// minimum allowed by the active parameter version.
    #[error("staking amount too low: got {got}, minimum {min}")]
    StakingAmountTooLow {
        /// The committed amount in satoshis.
        got: u64,
        /// The minimum allowed amount.
        min: u64,
    },

    /// The staking amount committed by a staking transaction is above the
    /// maximum allowed by the active parameter version.
    #[error("staking amount too high: got {got}, maximum {max}")]
    StakingAmountTooHigh {
        /// The committed amount in satoshis.
        got: u64,
        /// The maximum allowed amount.
        max: u64,
    },

    /// The staking time committed by a staking transaction is below the
    /// minimum allowed by the active parameter version.
    #[error("staking time too low: got {got}, minimum {min}")]
    StakingTimeTooLow {
        /// The committed staking time in blocks.
        got: u16,
        /// The minimum allowed staking time.
        min: u16,
    },

    /// The staking time committed by a staking transaction is above the
    /// maximum allowed by the active parameter version.
    #[error("staking time too high: got {got}, maximum {max}")]
    StakingTimeTooHigh {
        /// The committed staking time in blocks.
        got: u16,
        /// The maximum allowed staking time.
        max: u16,
    },

    /// A spending transaction unlocks the unbonding path but its output
    /// value does not equal the staking value minus the unbonding fee.
    #[error("unbonding output value {got} is not the expected {expected}")]
    UnbondingValueMismatch {
        /// The value of the spender's single output.
        got: u64,
        /// Staking value minus the unbonding fee.
        expected: u64,
    },

    /// The staking value does not cover the unbonding fee, so no valid
    /// unbonding transaction can exist for the staking output.
    #[error("staking value {staking_value} does not cover the unbonding fee {fee}")]
    UnbondingValueTooLow {
        /// The recorded staking value.
        staking_value: u64,
        /// The unbonding fee from the parameters active at staking time.
        fee: u64,
    },

    /// Script reconstruction failed for the supplied global parameters.
    #[error("invalid global parameters: {0}")]
    InvalidGlobalParameters(&'static str),

    /// A transaction hash is already present in the store.
    #[error("duplicate transaction {0}")]
    DuplicateTransaction(Txid),

    /// A stored value failed to decode, or expected metadata is missing.
    #[error("store corruption: {0}")]
    StoreCorruption(String),

    /// A block does not connect to the current cache tip.
    #[error("block at height {height} does not link to the previous block")]
    ChainLinkageBroken {
        /// Height of the offending block.
        height: i32,
    },

    /// A reorg reached below the last confirmed height; this is beyond
    /// the tolerance given by the confirmation depth.
    #[error("reorg at height {height} reaches below the last confirmed height {last_confirmed}")]
    ReorgBelowConfirmed {
        /// Height at which the fork was observed.
        height: u64,
        /// Height of the last block already emitted as confirmed.
        last_confirmed: u64,
    },

    /// The chain update channel closed while the peer was still running.
    #[error("the chain update channel is closed")]
    ChainUpdateChannelClosed,

    /// The requested start height is below the configured base height.
    #[error("start height {start} is lower than the base height {base}")]
    StartHeightBeforeBase {
        /// Requested start height.
        start: u64,
        /// Configured base height.
        base: u64,
    },

    /// The requested start height would skip unprocessed blocks.
    #[error("start height {start} is higher than the last processed height + 1 ({max})")]
    StartHeightTooHigh {
        /// Requested start height.
        start: u64,
        /// Last processed height plus one.
        max: u64,
    },

    /// The store is empty, so the indexer must start from the base height.
    #[error("the database is empty, the start height must equal the base height {base}")]
    StartHeightOnEmptyStore {
        /// Configured base height.
        base: u64,
    },

    /// The start height is above the current node tip.
    #[error("start height {start} is higher than the current tip height {tip}")]
    StartHeightAboveTip {
        /// Requested start height.
        start: u64,
        /// Current node tip height.
        tip: u64,
    },

    /// A block height from the chain was negative.
    #[error("unexpected negative block height {0}")]
    NegativeBlockHeight(i32),

    /// A block height from the node does not fit the indexer's signed
    /// height type.
    #[error("block height {0} is out of range")]
    BlockHeightOutOfRange(u64),

    /// No parameter version is active at the given height.
    #[error("no parameter version is active at height {0}")]
    NoParamsForHeight(u64),

    /// The parameters file failed validation.
    #[error("invalid parameters file: {0}")]
    ParamsValidation(String),

    /// Error from the underlying sled database.
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    /// Error from bitcoin-core RPC.
    #[error("bitcoin-core RPC error: {0}")]
    BitcoinCoreRpc(#[from] bitcoincore_rpc::Error),

    /// Error from the bitcoin-core ZMQ subscription.
    #[error("bitcoin-core ZMQ error: {0}")]
    BitcoinCoreZmq(#[from] bitcoincore_zmq::Error),

    /// A spawned blocking task failed to complete.
    #[error("blocking task failed: {0}")]
    TaskJoin(String),

    /// An event could not be delivered to the downstream consumer.
    #[error("failed to publish event: {0}")]
    EventPublish(String),

    /// Invalid public key bytes.
    #[error("invalid public key: {0}")]
    PublicKey(#[from] bitcoin::secp256k1::Error),

    /// Error reading a file.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Error parsing JSON.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Error reading the configuration.
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Error decoding a hex string.
    #[error("hex decode error: {0}")]
    HexDecode(#[from] hex::FromHexError),

    /// Error installing the prometheus exporter.
    #[error("failed to install the metrics exporter: {0}")]
    MetricsExporter(String),

    /// The home directory already holds a configuration.
    #[error("home directory {} is already initialized, use --force to overwrite", .0.display())]
    HomeAlreadyInitialized(std::path::PathBuf),

    /// A height range where the start exceeds the end.
    #[error("invalid height range {from}..{to}")]
    InvalidHeightRange {
        /// First height of the range.
        from: u64,
        /// Last height of the range.
        to: u64,
    },
}

impl Error {
    /// Whether this error marks a recognized staking commitment whose
    /// economic parameters are out of range. Such transactions are
    /// counted and skipped, never fatal.
    pub fn is_invalid_staking(&self) -> bool {
        matches!(
            self,
            Error::StakingAmountTooLow { .. }
                | Error::StakingAmountTooHigh { .. }
                | Error::StakingTimeTooLow { .. }
                | Error::StakingTimeTooHigh { .. }
        )
    }

    /// Whether this error marks a spending transaction that unlocks the
    /// unbonding path with a wrong value. Counted and skipped.
    pub fn is_invalid_unbonding(&self) -> bool {
        matches!(
            self,
            Error::UnbondingValueMismatch { .. } | Error::UnbondingValueTooLow { .. }
        )
    }
}
