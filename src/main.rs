use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use utxo_indexer::config::{CoinConfig, Config, DEFAULT_CONFIG_PATH};
use utxo_indexer::core::params::DEFAULT_BATCH_SIZE;
use utxo_indexer::jobs::{self, Schedule};
use utxo_indexer::monitor::{self, MonitorNotifier};
use utxo_indexer::notify::ZmqSubscriber;
use utxo_indexer::rpc::{ChainSource, RpcClient};
use utxo_indexer::store::SledStore;
use utxo_indexer::sync::{IndexOptions, Indexer};
use utxo_indexer::validate::{BlockValidator, TxValidator, ValidateOptions};
use utxo_indexer::{Error, Result};

#[derive(Parser)]
#[command(name = "utxo-indexer", version)]
#[command(about = "Index a UTXO chain from its node and keep the index consistent with it")]
struct Cli {
    /// JSON config describing the database, RPC tuning and every coin
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: String,
    /// Coin section of the config to use
    #[arg(long, global = true, default_value = "btc")]
    coin: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Backfill a height range, or sync to the node's tip and keep following it
    Index {
        #[arg(long)]
        start: Option<u64>,
        #[arg(long)]
        end: Option<u64>,
        /// Resume from the store's tip and follow the node afterwards
        #[arg(long)]
        sync: bool,
        #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
        batch: u64,
        /// Allow rewriting blocks below the store's canonical tip
        #[arg(long)]
        recover: bool,
        /// Also run the block validator in this process every SECS seconds
        #[arg(long, value_name = "SECS")]
        validate_blocks_every: Option<u64>,
        /// Also run the transaction validator in this process every SECS seconds
        #[arg(long, value_name = "SECS")]
        validate_txs_every: Option<u64>,
        /// Also run the height check and orphan cleanup in this process
        #[arg(long)]
        monitor: bool,
    },
    /// Check stored blocks against the node and repair differences.
    /// Needs the store to itself; alongside a running `index`, use `--validate-blocks-every`
    ValidateBlocks,
    /// Delete pending transactions that left the mempool unmined
    ValidateTxs,
    /// Compare store and node heights and clean up orphans on an interval
    Monitor,
    /// Delete orphaned blocks once and exit
    PruneOrphans,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("utxo_indexer=info".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!("❌ Cannot start runtime: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = rt.block_on(run(cli)) {
        tracing::error!("❌ {}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load(&cli.config)?;
    let coin = config.coin(&cli.coin)?.clone();

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            tracing::info!("🛑 Shutting down gracefully...");
            cancel.cancel();
        }) {
            return Err(Error::Pipeline(format!("cannot install signal handler: {}", e)));
        }
    }

    let db_path = coin.db_path(&config.db);
    tracing::info!("📦 Opening {} store at {}", coin.name, db_path.display());
    let store = Arc::new(SledStore::open(&db_path, &config.db)?);
    let source = Arc::new(RpcClient::new(&coin.rpc, &config.rpc, &coin.name)?);
    let info = source.get_chain_info().await?;
    tracing::info!("🔗 Node {} on {} at #{}", coin.rpc.url, info.chain, info.blocks);

    let result = match cli.command {
        Commands::Index { start, end, sync, batch, recover, validate_blocks_every, validate_txs_every, monitor } => {
            let options = IndexOptions {
                start,
                end,
                sync,
                batch,
                recover,
                rpc_threads: config.rpc.threads,
                db_threads: config.db.threads,
            };
            let schedule = Schedule {
                validate_blocks: validate_blocks_every.map(Duration::from_secs),
                validate_txs: validate_txs_every.map(Duration::from_secs),
                monitor,
            };
            let maintenance = validate_options(&config, &coin);
            index(store.clone(), source, &coin, options, schedule, maintenance, &cancel).await
        }
        Commands::ValidateBlocks => {
            let validator = BlockValidator::new(store.clone(), source, validate_options(&config, &coin));
            validator.run(&cancel).await.map(|report| {
                tracing::info!("Blocks #{}..=#{}: {} checked, {} repaired, cursor {:?}",
                    report.start, report.end, report.checked, report.repaired, report.cursor);
            })
        }
        Commands::ValidateTxs => {
            let validator = TxValidator::new(store.clone(), source, validate_options(&config, &coin));
            validator.run(&cancel).await.map(|report| {
                tracing::info!("{} pending, {} in mempool, {} deleted, cursor {:?}",
                    report.pending, report.mempool, report.deleted, report.cursor);
            })
        }
        Commands::Monitor => {
            monitor::run(store.clone(), source, cancel.clone()).await;
            Ok(())
        }
        Commands::PruneOrphans => monitor::prune_orphans(store.as_ref()).await.map(|_| ()),
    };

    if let Err(e) = store.flush().await {
        tracing::warn!("⚠️ Store flush failed: {}", e);
    }
    result
}

async fn index(
    store: Arc<SledStore>,
    source: Arc<RpcClient>,
    coin: &CoinConfig,
    options: IndexOptions,
    schedule: Schedule,
    maintenance: ValidateOptions,
    cancel: &CancellationToken,
) -> Result<()> {
    let jobs_cancel = cancel.child_token();
    let mut tasks = JoinSet::new();
    jobs::spawn(&mut tasks, store.clone(), source.clone(), maintenance, &schedule, &jobs_cancel);

    let result = ingest(store, source, coin, options, cancel).await;
    if !schedule.is_empty() {
        tracing::info!("Stopping maintenance jobs");
    }
    jobs_cancel.cancel();
    while let Some(res) = tasks.join_next().await {
        if let Err(e) = res {
            tracing::error!("❌ Maintenance job failed: {}", e);
        }
    }
    result
}

async fn ingest(
    store: Arc<SledStore>,
    source: Arc<RpcClient>,
    coin: &CoinConfig,
    options: IndexOptions,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut indexer = Indexer::new(store, source, options);
    if let Some(url) = &coin.monitor_url {
        indexer = indexer.with_monitor(MonitorNotifier::new(url, &coin.name));
    }

    indexer.backfill(cancel).await?;
    if cancel.is_cancelled() || !indexer.follows_tip() {
        return Ok(());
    }
    match &coin.zmq {
        Some(zmq) => {
            tracing::info!("👀 Following the tip of {} via {}", coin.name, zmq.sub_url);
            indexer.follow(ZmqSubscriber::new(zmq), cancel).await
        }
        None => {
            tracing::warn!("⚠️ No zmq section for {}, not following the tip", coin.name);
            Ok(())
        }
    }
}

fn validate_options(config: &Config, coin: &CoinConfig) -> ValidateOptions {
    ValidateOptions {
        rpc_threads: config.rpc.threads,
        db_threads: config.db.threads,
        revalidate_offset: coin.revalidate_offset(),
        ..Default::default()
    }
}
