use bitcoin::Transaction;
use clap::{Args, Parser, Subcommand};
use frbtc_state_sync::config::{ConfigError, IndexerConfig};
use frbtc_state_sync::outpoint::{self, ResolveError};
use frbtc_state_sync::protostone::{self, DecodeError};
use frbtc_state_sync::rpc::{AlkanesRpcClient, ChainRpc, RpcError};
use frbtc_state_sync::store::{
	AggregationStore, FileStore, MemoryCache, MemoryStore, RecordKind, StreamKey,
};
use frbtc_state_sync::sync::{
	FileLeaseService, LeaseService, LeaseWait, LoggingEventHandler, MemoryLeaseService,
	SyncCoordinator, SyncError, SyncStatus, TotalsReader,
};
use frbtc_state_sync::trace::TraceMode;
use frbtc_state_sync::utils::{FRBTC_DECIMALS, format_token_amount};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(author, version, about = "Index frBTC wraps and unwraps from alkanes execution traces")]
struct Cli {
	#[command(flatten)]
	options: Options,

	#[command(subcommand)]
	command: Command,
}

#[derive(Debug, Args)]
struct Options {
	/// JSON config file. Flags and environment variables override its values.
	#[arg(long, global = true, env = "FRBTC_CONFIG")]
	config: Option<PathBuf>,

	/// JSON-RPC endpoint serving esplora and alkanes methods.
	#[arg(long, global = true, env = "FRBTC_RPC_URL")]
	rpc_url: Option<String>,

	/// Signer address whose history carries the wraps and unwraps.
	#[arg(long, global = true, env = "FRBTC_ADDRESS")]
	address: Option<String>,

	/// Directory of the file store. Without one, state lives in memory for this process only.
	#[arg(long, global = true, env = "FRBTC_DATA_DIR")]
	data_dir: Option<PathBuf>,

	/// Trace strategy: auto, outpoint or block.
	#[arg(long, global = true, env = "FRBTC_TRACE_MODE")]
	trace_mode: Option<TraceMode>,

	#[arg(long, global = true, env = "FRBTC_MAX_PAGINATION_ROUNDS")]
	max_pagination_rounds: Option<u32>,

	/// Seconds to wait for a held lease. 0 returns immediately.
	#[arg(long, global = true, env = "FRBTC_LEASE_WAIT")]
	lease_wait: Option<u64>,
}

#[derive(Debug, Subcommand)]
enum Command {
	/// Sync one stream, or every stream under the full-sync lease
	Sync {
		#[arg(long)]
		stream: Option<StreamKey>,
	},
	/// Sync every stream on a fixed interval
	Watch {
		/// Seconds between runs
		#[arg(long, env = "FRBTC_WATCH_INTERVAL")]
		interval: Option<u64>,
	},
	/// Print wrap/unwrap totals
	Totals,
	/// List wrap or unwrap records, newest first
	Records {
		#[arg(long, default_value_t = RecordKind::Wrap)]
		kind: RecordKind,
		#[arg(long, default_value_t = 50)]
		limit: usize,
		#[arg(long, default_value_t = 0)]
		offset: usize,
	},
	/// List snapshots of a stream, newest first
	Snapshots {
		#[arg(long, default_value_t = StreamKey::Supply)]
		stream: StreamKey,
		#[arg(long, default_value_t = 20)]
		limit: usize,
	},
	/// Delete a stream's state, or every stream's, forcing a replay from genesis
	Reset {
		#[arg(long)]
		stream: Option<StreamKey>,
	},
	/// Decode the protostones of a transaction, given as raw hex or as a txid to fetch
	Decode { transaction: String },
}

#[derive(Debug, thiserror::Error)]
enum CliError {
	#[error(transparent)]
	Config(#[from] ConfigError),

	#[error(transparent)]
	Sync(#[from] SyncError),

	#[error(transparent)]
	Rpc(#[from] RpcError),

	#[error("Decode error: {0}")]
	Decode(#[from] DecodeError),

	#[error(transparent)]
	Resolve(#[from] ResolveError),

	#[error("Hex decode error: {0}")]
	Hex(#[from] hex::FromHexError),

	#[error("Transaction decode error: {0}")]
	Consensus(#[from] bitcoin::consensus::encode::Error),

	#[error("JSON error: {0}")]
	Json(#[from] serde_json::Error),
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
	tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::from_default_env()
				.add_directive(tracing::Level::INFO.into()),
		)
		.with_target(false)
		.with_thread_ids(false)
		.with_thread_names(false)
		.with_file(false)
		.with_line_number(false)
		.with_timer(tracing_subscriber::fmt::time::time())
		.with_writer(std::io::stderr)
		.init();

	let cli = Cli::parse();
	if let Err(e) = run(cli).await {
		error!("{}", e);
		std::process::exit(1);
	}
}

async fn run(cli: Cli) -> Result<(), CliError> {
	let config = load_config(&cli.options).await?;

	if let Command::Decode { transaction } = &cli.command {
		return decode(&config, transaction).await;
	}

	config.validate()?;
	let wait = config.lease.wait();
	let watch_interval = config.watch_interval_secs;
	let coordinator = Arc::new(build_coordinator(config).await?);

	match cli.command {
		Command::Sync { stream: Some(stream) } => {
			let status = coordinator.sync_stream(stream, wait).await?;
			log_status(&status);
			print_json(&status)
		}
		Command::Sync { stream: None } => {
			let statuses = coordinator.sync_all(wait).await?;
			statuses.iter().for_each(log_status);
			print_json(&statuses)
		}
		Command::Watch { interval } => watch(&coordinator, wait, interval.unwrap_or(watch_interval)).await,
		Command::Totals => {
			let totals = TotalsReader::new(coordinator).totals().await?;
			info!(
				"Wrapped {} frBTC in {} wraps, unwrapped {} frBTC in {} unwraps, supply {} frBTC at height {}",
				format_token_amount(totals.value.total_wrapped.get(), FRBTC_DECIMALS),
				totals.value.wrap_count,
				format_token_amount(totals.value.total_unwrapped.get(), FRBTC_DECIMALS),
				totals.value.unwrap_count,
				format_token_amount(totals.value.net_supply().get(), FRBTC_DECIMALS),
				totals.value.last_block_height
			);
			print_json(&totals)
		}
		Command::Records {
			kind,
			limit,
			offset,
		} => print_json(&TotalsReader::new(coordinator).records(kind, limit, offset).await?),
		Command::Snapshots { stream, limit } => {
			print_json(&TotalsReader::new(coordinator).snapshots(stream, limit).await?)
		}
		Command::Reset { stream: Some(stream) } => print_json(&coordinator.reset_stream(stream).await?),
		Command::Reset { stream: None } => print_json(&coordinator.reset_all().await?),
		Command::Decode { .. } => Ok(()),
	}
}

async fn load_config(options: &Options) -> Result<IndexerConfig, CliError> {
	let mut config = match &options.config {
		Some(path) => {
			info!("Loading config from {}", path.display());
			IndexerConfig::from_json_file(path).await?
		}
		None => IndexerConfig::default(),
	};

	if let Some(rpc_url) = &options.rpc_url {
		config.rpc_url = rpc_url.clone();
	}
	if let Some(address) = &options.address {
		config.tracked_address = address.clone();
	}
	if let Some(data_dir) = &options.data_dir {
		config.data_dir = Some(data_dir.clone());
	}
	if let Some(trace_mode) = options.trace_mode {
		config.trace_mode = trace_mode;
	}
	if let Some(rounds) = options.max_pagination_rounds {
		config.max_pagination_rounds = rounds;
	}
	if let Some(lease_wait) = options.lease_wait {
		config.lease.max_wait_secs = lease_wait;
	}
	Ok(config)
}

async fn build_coordinator(config: IndexerConfig) -> Result<SyncCoordinator, CliError> {
	let rpc = Arc::new(AlkanesRpcClient::new(config.rpc_url.clone())?);
	info!("Created RPC client for {}", config.rpc_url);

	// leases live next to the store so every process on the directory sees them
	let (store, leases): (Arc<dyn AggregationStore>, Arc<dyn LeaseService>) = match &config.data_dir {
		Some(data_dir) => (
			Arc::new(FileStore::new(data_dir.clone())),
			Arc::new(FileLeaseService::new(data_dir.clone())),
		),
		None => {
			warn!("No data directory configured, state is kept in memory");
			(
				Arc::new(MemoryStore::new()),
				Arc::new(MemoryLeaseService::new()),
			)
		}
	};

	let coordinator = SyncCoordinator::new(
		rpc,
		store,
		leases,
		Arc::new(MemoryCache::new()),
		config,
	);
	coordinator
		.register_handler(Box::new(LoggingEventHandler))
		.await;
	Ok(coordinator)
}

async fn watch(
	coordinator: &SyncCoordinator,
	wait: LeaseWait,
	interval_secs: u64,
) -> Result<(), CliError> {
	info!("Watching, syncing every {}s", interval_secs);
	let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
	interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

	loop {
		interval.tick().await;
		match coordinator.sync_all(wait).await {
			Ok(statuses) => statuses.iter().for_each(log_status),
			Err(e) => error!("Sync failed, retrying next interval: {}", e),
		}
	}
}

async fn decode(config: &IndexerConfig, input: &str) -> Result<(), CliError> {
	let raw = match input.parse::<bitcoin::Txid>() {
		Ok(txid) => {
			let rpc = AlkanesRpcClient::new(config.rpc_url.clone())?;
			rpc.get_raw_transaction(&txid).await?
		}
		Err(_) => hex::decode(input.trim())?,
	};

	let transaction: Transaction = bitcoin::consensus::deserialize(&raw)?;
	let txid = transaction.compute_txid();
	let raw_outputs_count = u32::try_from(transaction.output.len())
		.map_err(|_| DecodeError::Transaction("too many outputs".to_string()))?;
	let protostones = protostone::decode_transaction(&transaction)?;

	#[derive(Serialize)]
	struct Decoded {
		outpoint: outpoint::VirtualOutpoint,
		#[serde(flatten)]
		protostone: protostone::Protostone,
	}

	let decoded = protostones
		.into_iter()
		.map(|protostone| {
			Ok(Decoded {
				outpoint: outpoint::resolve(txid, raw_outputs_count, protostone.index)?,
				protostone,
			})
		})
		.collect::<Result<Vec<_>, CliError>>()?;

	info!("Decoded {} protostones from {}", decoded.len(), txid);
	print_json(&decoded)
}

fn log_status(status: &SyncStatus) {
	match status {
		SyncStatus::Completed(report) => info!(
			"{} ({:?}): watermark {}, {} new wraps, {} new unwraps, {} failed traces",
			report.stream,
			report.source,
			report.watermark.last_block_height,
			report.new_wraps,
			report.new_unwraps,
			report.failed_count
		),
		SyncStatus::InProgress {
			lease_key,
			held_until,
		} => info!(
			"Sync already in progress under lease {} (held until {:?})",
			lease_key, held_until
		),
	}
}

fn print_json<T: Serialize>(value: &T) -> Result<(), CliError> {
	println!("{}", serde_json::to_string_pretty(value)?);
	Ok(())
}
