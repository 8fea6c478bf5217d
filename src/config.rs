//! Runtime configuration for the indexer.
//!
//! Settings are read from an optional `config.toml` in the home
//! directory, with `STAKING_INDEXER_`-prefixed environment variables
//! taking precedence (`STAKING_INDEXER_BITCOIN__RPC_URL` and friends).

use std::net::SocketAddr;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;

use crate::error::Error;

/// Name of the configuration file inside the home directory.
pub const CONFIG_FILE_NAME: &str = "config.toml";
/// Name of the data directory inside the home directory.
pub const DATA_DIR_NAME: &str = "data";
/// Name of the log directory inside the home directory.
pub const LOG_DIR_NAME: &str = "logs";

/// Top-level runtime settings.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Bitcoin node connectivity.
    pub bitcoin: BitcoinSettings,
    /// Chain follower settings.
    pub scanner: ScannerSettings,
    /// Storage settings.
    #[serde(default)]
    pub storage: StorageSettings,
    /// Metrics settings.
    #[serde(default)]
    pub metrics: MetricsSettings,
}

/// How to reach the Bitcoin node.
#[derive(Debug, Clone, Deserialize)]
pub struct BitcoinSettings {
    /// URL of the bitcoin-core RPC endpoint.
    pub rpc_url: String,
    /// RPC username.
    pub rpc_username: String,
    /// RPC password.
    pub rpc_password: String,
    /// ZMQ endpoint publishing `rawblock` notifications.
    pub zmq_endpoint: String,
    /// The network the node is on.
    pub network: bitcoin::Network,
}

/// Chain follower settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ScannerSettings {
    /// The lowest height the indexer will ever process. Start heights
    /// below this are rejected.
    pub base_height: u64,
    /// Capacity of the bounded channel between the poller and the
    /// indexer.
    pub chain_update_buffer: usize,
}

/// Storage settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageSettings {
    /// Where to keep the database. Defaults to `<home>/data`.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

/// Metrics settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetricsSettings {
    /// Listen address for the prometheus exporter. Disabled when unset.
    #[serde(default)]
    pub listen_addr: Option<SocketAddr>,
}

impl Settings {
    /// Load settings for the given home directory.
    pub fn new(home: &Path) -> Result<Self, Error> {
        let settings = config::Config::builder()
            .set_default("bitcoin.rpc_url", "http://127.0.0.1:18443")?
            .set_default("bitcoin.rpc_username", "user")?
            .set_default("bitcoin.rpc_password", "pass")?
            .set_default("bitcoin.zmq_endpoint", "tcp://127.0.0.1:29000")?
            .set_default("bitcoin.network", "regtest")?
            .set_default("scanner.base_height", 0u64)?
            .set_default("scanner.chain_update_buffer", 100u64)?
            .add_source(
                config::File::from(home.join(CONFIG_FILE_NAME)).required(false),
            )
            .add_source(
                config::Environment::with_prefix("STAKING_INDEXER").separator("__"),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    /// The directory holding the persistent store.
    pub fn data_dir(&self, home: &Path) -> PathBuf {
        self.storage
            .data_dir
            .clone()
            .unwrap_or_else(|| home.join(DATA_DIR_NAME))
    }
}

/// The default home directory, `~/.staking-indexer`.
pub fn default_home() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".staking-indexer")
}

/// The configuration template written by `init`.
pub const DEFAULT_CONFIG_TEMPLATE: &str = r#"# Staking indexer configuration.

[bitcoin]
rpc_url = "http://127.0.0.1:18443"
rpc_username = "user"
rpc_password = "pass"
zmq_endpoint = "tcp://127.0.0.1:29000"
# One of: bitcoin, testnet, signet, regtest.
network = "regtest"

[scanner]
# The lowest height the indexer will ever process.
base_height = 0
# Capacity of the channel between the chain follower and the indexer.
chain_update_buffer = 100

[storage]
# data_dir = "/path/to/data"

[metrics]
# listen_addr = "127.0.0.1:9090"
"#;
