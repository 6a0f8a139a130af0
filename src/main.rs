use std::{path::PathBuf, sync::Arc};

use clap::{Parser, Subcommand};
use minuet::{
    error::Error,
    shutdown::ShutdownManager,
    storage::Store,
    sync::session::Session,
    wallet::{UtxoTracker, seed_from_passphrase},
};
use serde::Deserialize;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt::init();

    let args = Cli::parse();
    let config = Config::new(&args.config)?;

    match args.command {
        Command::Run(_) => run(config).await,
        Command::Addresses => addresses(config),
    }
}

async fn run(config: Config) -> Result<(), Error> {
    let db_path = config
        .data_dir
        .unwrap_or_else(|| PathBuf::from("./data/minuet"));

    info!("using db path: {db_path:?}");

    let store = Arc::new(Store::open(db_path)?);

    let tracker = Arc::new(UtxoTracker::new(
        &seed_from_passphrase(&config.wallet.passphrase),
        config.sync.network.kind(),
    )?);

    let mut session = Session::new(config.sync, store)?;
    session.register_scanner("utxo-tracker", tracker.clone())?;

    let session = Arc::new(session);
    session.start().await;

    let mut shutdown = ShutdownManager::new();
    shutdown.wait().await;

    info!("shutting down...");
    session.stop();

    info!(
        height = session.check_height(),
        balance = %tracker.spendable_balance(),
        utxos = tracker.utxos().len(),
        "final sync state"
    );

    Ok(())
}

fn addresses(config: Config) -> Result<(), Error> {
    let tracker = UtxoTracker::new(
        &seed_from_passphrase(&config.wallet.passphrase),
        config.sync.network.kind(),
    )?;

    for key in tracker.watched_keys() {
        println!("{:>3} {}", key.index, hex::encode(key.pubkey_hash));
    }

    Ok(())
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Sync against the configured node until interrupted
    Run(Args),
    /// Dump the watched key fingerprints
    Addresses,
}

#[derive(Debug, clap::Args)]
pub struct Args {}

#[derive(Debug, Parser)]
#[clap(name = "minuet")]
#[clap(bin_name = "minuet")]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    config: Option<std::path::PathBuf>,
}

#[derive(Deserialize, Debug)]
pub struct Config {
    pub data_dir: Option<PathBuf>,
    pub wallet: WalletConfig,
    pub sync: minuet::sync::Config,
}

#[derive(Deserialize, Debug)]
pub struct WalletConfig {
    pub passphrase: String,
}

impl Config {
    pub fn new(config_path: &Option<std::path::PathBuf>) -> Result<Self, config::ConfigError> {
        let mut s = config::Config::builder();

        s = s.add_source(config::File::with_name("minuet.toml").required(false));

        if let Some(explicit) = config_path.as_ref().and_then(|x| x.to_str()) {
            s = s.add_source(config::File::with_name(explicit).required(true));
        }

        s = s.add_source(config::Environment::with_prefix("MINUET").separator("_"));

        s.build()?.try_deserialize()
    }
}
