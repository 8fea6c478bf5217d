//! Command-line interface of the indexer daemon.

use std::path::Path;
use std::path::PathBuf;

use bitcoin::consensus::encode::serialize as consensus_serialize;
use clap::Parser;
use clap::Subcommand;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::bitcoin_client::zmq_block_stream;
use crate::bitcoin_client::BitcoinCoreClient;
use crate::bitcoin_client::BitcoinInteract as _;
use crate::config;
use crate::config::Settings;
use crate::error::Error;
use crate::events::LogSink;
use crate::indexer::StakingIndexer;
use crate::metrics;
use crate::metrics::Metrics;
use crate::params;
use crate::scanner::BtcPoller;
use crate::shutdown;
use crate::storage::persistent::IndexerStore;
use crate::storage::DbRead as _;

/// The staking indexer daemon.
#[derive(Debug, Parser)]
#[command(name = "staking-indexer", version = crate::VERSION)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the indexer.
    Start {
        /// Path to the indexer home directory.
        #[arg(long, default_value_os_t = config::default_home())]
        home: PathBuf,
        /// Path to the global parameters file.
        #[arg(long)]
        params_path: PathBuf,
        /// The height to start indexing from. Defaults to the next
        /// unprocessed height.
        #[arg(long)]
        start_height: Option<u64>,
    },
    /// Initialize the indexer home directory.
    Init {
        /// Path to where the home directory will be initialized.
        #[arg(long, default_value_os_t = config::default_home())]
        home: PathBuf,
        /// Overwrite an existing configuration.
        #[arg(long)]
        force: bool,
    },
    /// Output a range of BTC headers into a JSON file.
    BtcHeaders {
        /// First height of the range, inclusive.
        from: u64,
        /// Last height of the range, inclusive.
        to: u64,
        /// Path to the output file.
        #[arg(long, default_value = "btc-headers.json")]
        output: PathBuf,
        /// Also record each header's height.
        #[arg(long)]
        with_height: bool,
        /// Path to the indexer home directory.
        #[arg(long, default_value_os_t = config::default_home())]
        home: PathBuf,
    },
    /// Export staking transactions in a height range to a CSV file.
    Export {
        /// First inclusion height, inclusive.
        start_height: u64,
        /// Last inclusion height, inclusive.
        end_height: u64,
        /// Path to the output file.
        #[arg(long, default_value = "transactions.csv")]
        output: PathBuf,
        /// Path to the indexer home directory.
        #[arg(long, default_value_os_t = config::default_home())]
        home: PathBuf,
    },
    /// Dump the staking records from the store as JSON.
    Dump {
        /// Path to the indexer home directory.
        #[arg(long, default_value_os_t = config::default_home())]
        home: PathBuf,
    },
}

/// Parse the command line and run the selected command.
pub async fn run() -> Result<(), Error> {
    match Cli::parse().command {
        Command::Start { home, params_path, start_height } => {
            start(&home, &params_path, start_height).await
        }
        Command::Init { home, force } => init(&home, force),
        Command::BtcHeaders { from, to, output, with_height, home } => {
            btc_headers(&home, from, to, &output, with_height).await
        }
        Command::Export { start_height, end_height, output, home } => {
            export(&home, start_height, end_height, &output).await
        }
        Command::Dump { home } => dump(&home).await,
    }
}

async fn start(
    home: &Path,
    params_path: &Path,
    start_height_flag: Option<u64>,
) -> Result<(), Error> {
    let settings = Settings::new(home)?;
    let registry = params::load_params(params_path, settings.bitcoin.network)?;

    if let Some(addr) = settings.metrics.listen_addr {
        metrics::install_prometheus_exporter(addr)?;
    }

    let store = IndexerStore::open(&settings.data_dir(home))?;
    let client = BitcoinCoreClient::new(&settings.bitcoin)?;
    let blocks = zmq_block_stream(&settings.bitcoin.zmq_endpoint)?;

    let (signal, listener) = shutdown::channel();
    let (update_tx, update_rx) =
        mpsc::channel(settings.scanner.chain_update_buffer.max(1));

    let metrics_handle = Metrics::new();
    let engine = StakingIndexer::new(
        store,
        LogSink,
        metrics_handle.clone(),
        registry.clone(),
        settings.scanner.base_height,
        update_rx,
        listener.clone(),
    )
    .await?;

    let start_height = start_height_flag.unwrap_or_else(|| engine.get_start_height());
    engine.validate_start_height(start_height)?;
    metrics_handle.set_start_height(start_height);

    let poller = BtcPoller::new(
        client,
        blocks,
        registry.confirmation_depth(),
        registry.activation_height(),
        update_tx,
        listener,
    );

    tracing::info!(start_height, "starting the staking indexer");

    let mut poller_task = tokio::spawn(poller.run(start_height));
    let mut engine_task = tokio::spawn(engine.run());

    let mut first_error = None;
    let mut poller_done = false;
    let mut engine_done = false;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received interrupt");
        }
        result = &mut poller_task => {
            poller_done = true;
            collect_task_result(&mut first_error, result);
        }
        result = &mut engine_task => {
            engine_done = true;
            collect_task_result(&mut first_error, result);
        }
    }

    // Whichever task is still running observes the signal and finishes
    // its current step.
    signal.signal();
    if !poller_done {
        collect_task_result(&mut first_error, (&mut poller_task).await);
    }
    if !engine_done {
        collect_task_result(&mut first_error, (&mut engine_task).await);
    }

    match first_error {
        Some(err) => Err(err),
        None => {
            tracing::info!("the staking indexer is stopped");
            Ok(())
        }
    }
}

fn collect_task_result(
    slot: &mut Option<Error>,
    result: Result<Result<(), Error>, tokio::task::JoinError>,
) {
    let outcome = match result {
        Ok(outcome) => outcome,
        Err(err) => Err(Error::TaskJoin(err.to_string())),
    };
    if let Err(err) = outcome {
        tracing::error!(error = %err, "task failed");
        if slot.is_none() {
            *slot = Some(err);
        }
    }
}

fn init(home: &Path, force: bool) -> Result<(), Error> {
    let config_path = home.join(config::CONFIG_FILE_NAME);
    if config_path.exists() && !force {
        return Err(Error::HomeAlreadyInitialized(home.to_path_buf()));
    }

    std::fs::create_dir_all(home)?;
    std::fs::create_dir_all(home.join(config::DATA_DIR_NAME))?;
    std::fs::create_dir_all(home.join(config::LOG_DIR_NAME))?;
    std::fs::write(&config_path, config::DEFAULT_CONFIG_TEMPLATE)?;

    tracing::info!(home = %home.display(), "initialized the indexer home directory");

    Ok(())
}

#[derive(Debug, Serialize)]
struct ExportedHeader {
    /// The consensus-encoded header, hex encoded.
    header: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    height: Option<u64>,
}

#[derive(Debug, Serialize)]
struct ExportedHeaders {
    btc_headers: Vec<ExportedHeader>,
}

async fn btc_headers(
    home: &Path,
    from: u64,
    to: u64,
    output: &Path,
    with_height: bool,
) -> Result<(), Error> {
    if from > to {
        return Err(Error::InvalidHeightRange { from, to });
    }

    let settings = Settings::new(home)?;
    let client = BitcoinCoreClient::new(&settings.bitcoin)?;

    let mut headers = Vec::with_capacity((to - from + 1) as usize);
    for height in from..=to {
        let header = client.get_block_header_by_height(height).await?;
        headers.push(ExportedHeader {
            header: hex::encode(consensus_serialize(&header)),
            height: with_height.then_some(height),
        });
    }

    std::fs::write(
        output,
        serde_json::to_string_pretty(&ExportedHeaders { btc_headers: headers })?,
    )?;
    tracing::info!(from, to, output = %output.display(), "exported headers");

    Ok(())
}

async fn export(
    home: &Path,
    start_height: u64,
    end_height: u64,
    output: &Path,
) -> Result<(), Error> {
    if start_height > end_height {
        return Err(Error::InvalidHeightRange { from: start_height, to: end_height });
    }

    let settings = Settings::new(home)?;
    let store = IndexerStore::open(&settings.data_dir(home))?;

    let mut contents = String::from(
        "txid,staker_pk,finality_provider_pk,staking_value,staking_time,inclusion_height,is_overflow\n",
    );
    let mut exported = 0usize;
    for record in store.staking_txs().await? {
        if record.inclusion_height < start_height || record.inclusion_height > end_height {
            continue;
        }
        contents.push_str(&format!(
            "{},{},{},{},{},{},{}\n",
            record.txid,
            hex::encode(record.staker_pk.serialize()),
            hex::encode(record.finality_provider_pk.serialize()),
            record.staking_value,
            record.staking_time,
            record.inclusion_height,
            record.is_overflow,
        ));
        exported += 1;
    }

    std::fs::write(output, contents)?;
    tracing::info!(exported, output = %output.display(), "exported staking transactions");

    Ok(())
}

async fn dump(home: &Path) -> Result<(), Error> {
    let settings = Settings::new(home)?;
    let store = IndexerStore::open(&settings.data_dir(home))?;

    let records = store.staking_txs().await?;
    println!("{}", serde_json::to_string_pretty(&records)?);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_refuses_to_overwrite_without_force() {
        let dir = tempfile::tempdir().expect("tempdir");
        init(dir.path(), false).expect("first init");
        assert!(dir.path().join(config::CONFIG_FILE_NAME).exists());
        assert!(dir.path().join(config::DATA_DIR_NAME).is_dir());

        let err = init(dir.path(), false).expect_err("second init must fail");
        assert!(matches!(err, Error::HomeAlreadyInitialized(_)));

        init(dir.path(), true).expect("forced init");
    }

    #[test_log::test(tokio::test)]
    async fn export_filters_by_inclusion_height() {
        use rand::SeedableRng as _;

        use crate::storage::model::BlockCommit;
        use crate::storage::DbWrite as _;
        use crate::testing::datagen;

        let mut rng = rand::rngs::StdRng::seed_from_u64(80);
        let home = tempfile::tempdir().expect("tempdir");
        init(home.path(), false).expect("init home");

        let settings = Settings::new(home.path()).expect("settings");
        let store = IndexerStore::open(&settings.data_dir(home.path())).expect("open store");
        for height in [100, 150, 200] {
            let record = datagen::random_staking_record(&mut rng, height);
            let commit = BlockCommit {
                height,
                confirmed_tvl: 0,
                staking: vec![record],
                unbonding: Vec::new(),
            };
            store.commit_block(&commit).await.expect("commit");
        }
        drop(store);

        let output = home.path().join("transactions.csv");
        export(home.path(), 120, 180, &output).await.expect("export");

        let contents = std::fs::read_to_string(&output).expect("read output");
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].contains(",150,"));
    }
}
