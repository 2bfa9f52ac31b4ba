//! Fixtures shared by unit tests.

use crate::alkane::AlkaneId;
use crate::amount::Amount;
use crate::config::{IndexerConfig, LeaseConfig};
use crate::outpoint::{self, VirtualOutpoint};
use crate::protostone::encode;
use crate::rpc::{CandidateTransaction, ChainRpc, RpcError, TraceBundle};
use crate::store::{
	AggregationStore, FlowRecord, MemoryCache, RecordKind, RecordTotals, Snapshot, StoreError,
	StreamKey, SyncWatermark,
};
use crate::sync::{
	Lease, LeaseError, LeaseService, MemoryLeaseService, SyncCoordinator, SyncError, SyncEvent,
	SyncEventHandler,
};
use crate::trace::{RawAmount, TraceEvent, Transfer};
use bitcoin::hashes::Hash;
use bitcoin::{OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness};
use chrono::{TimeZone, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

pub const TRACKED_ADDRESS: &str = "bc1qsubfrost";

pub fn txid(n: u8) -> Txid {
	Txid::from_byte_array([n; 32])
}

pub fn record(
	kind: RecordKind,
	txid: Txid,
	output_index: u32,
	amount: u128,
	block_height: u64,
) -> FlowRecord {
	FlowRecord {
		kind,
		txid,
		output_index,
		sequence: 0,
		amount: Amount::new(amount),
		block_height,
		counterparty_address: None,
		timestamp: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
	}
}

/// A confirmed candidate whose first output pays the tracked address.
pub fn candidate(txid: Txid, raw_outputs_count: u32, block_height: u64) -> CandidateTransaction {
	let output_addresses = (0..raw_outputs_count)
		.map(|index| match index {
			0 => Some(TRACKED_ADDRESS.to_string()),
			1 => Some("bc1qrecipient".to_string()),
			n => Some(format!("bc1qchange{}", n)),
		})
		.collect();

	CandidateTransaction {
		txid,
		raw_outputs_count,
		block_height: Some(block_height),
		block_time: Some(Utc.timestamp_opt(1_700_000_000, 0).unwrap()),
		input_addresses: vec![Some("bc1qsender".to_string())],
		output_addresses,
		aux_payload: None,
	}
}

fn tracked_transfer(amount: u128, to: Option<AlkaneId>) -> Transfer {
	Transfer {
		token_id: AlkaneId::new(32, 0),
		amount: RawAmount::Known(Amount::new(amount)),
		from: None,
		to,
	}
}

/// A transfer of the tracked token to the null id.
pub fn burn_transfer(amount: u128) -> Transfer {
	tracked_transfer(amount, Some(AlkaneId::NULL))
}

pub fn receive_intent(amount: u128) -> TraceEvent {
	TraceEvent::ReceiveIntent {
		incoming_transfers: vec![tracked_transfer(amount, None)],
	}
}

pub fn value_transfer(amount: u128) -> TraceEvent {
	TraceEvent::ValueTransfer {
		transfers: vec![burn_transfer(amount)],
		to: None,
	}
}

/// Config for coordinator tests: tracked address set, runs never wait for a lease.
pub fn test_config() -> IndexerConfig {
	IndexerConfig {
		tracked_address: TRACKED_ADDRESS.to_string(),
		lease: LeaseConfig {
			max_wait_secs: 0,
			..LeaseConfig::default()
		},
		..IndexerConfig::default()
	}
}

pub fn coordinator(
	rpc: Arc<MockRpc>,
	store: Arc<dyn AggregationStore>,
	config: IndexerConfig,
) -> SyncCoordinator {
	SyncCoordinator::new(
		rpc,
		store,
		Arc::new(MemoryLeaseService::new()),
		Arc::new(MemoryCache::new()),
		config,
	)
}

#[derive(Default)]
struct MockState {
	/// Address history, newest first.
	history: Vec<CandidateTransaction>,
	page_size: usize,
	raw: HashMap<Txid, Vec<u8>>,
	traces: HashMap<VirtualOutpoint, Vec<TraceEvent>>,
	failing_traces: HashSet<VirtualOutpoint>,
	blocks: HashMap<VirtualOutpoint, u64>,
	garbled_bundles: HashSet<VirtualOutpoint>,
	failing_blocks: HashSet<u64>,
	history_fails: bool,
	chain_height: u64,
	balance: u64,
}

/// In-memory chain and trace service.
pub struct MockRpc {
	state: Mutex<MockState>,
	history_calls: AtomicUsize,
	block_calls: AtomicUsize,
	pause_height: AtomicBool,
	paused: Notify,
	resumed: Notify,
}

impl MockRpc {
	pub fn new() -> Self {
		Self {
			state: Mutex::new(MockState {
				page_size: 25,
				..MockState::default()
			}),
			history_calls: AtomicUsize::new(0),
			block_calls: AtomicUsize::new(0),
			pause_height: AtomicBool::new(false),
			paused: Notify::new(),
			resumed: Notify::new(),
		}
	}

	fn with_state<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
		f(&mut self.state.lock().unwrap())
	}

	/// Add a transaction with `outputs` real outputs, the last one carrying `protostones`
	/// protostones. Confirmed transactions raise the chain height to their block.
	pub fn add_transaction(
		&self,
		n: u8,
		outputs: u32,
		protostones: usize,
		block_height: Option<u64>,
	) -> CandidateTransaction {
		let plain_outputs = if protostones > 0 {
			outputs.saturating_sub(1)
		} else {
			outputs
		};
		let mut output: Vec<TxOut> = (0..plain_outputs)
			.map(|_| TxOut {
				value: bitcoin::Amount::from_sat(546),
				script_pubkey: ScriptBuf::new(),
			})
			.collect();
		let mut output_addresses: Vec<Option<String>> = (0..plain_outputs)
			.map(|index| {
				Some(if index == 0 {
					"bc1qrecipient".to_string()
				} else {
					TRACKED_ADDRESS.to_string()
				})
			})
			.collect();

		let aux_payload = (protostones > 0).then(|| {
			let calls: Vec<_> = (0..protostones).map(|_| encode::call(77)).collect();
			encode::script(&calls)
		});
		if let Some(script) = &aux_payload {
			output.push(TxOut {
				value: bitcoin::Amount::ZERO,
				script_pubkey: script.clone(),
			});
			output_addresses.push(None);
		}

		let transaction = Transaction {
			version: bitcoin::transaction::Version::TWO,
			lock_time: bitcoin::absolute::LockTime::ZERO,
			input: vec![TxIn {
				previous_output: OutPoint {
					txid: txid(n),
					vout: 0,
				},
				script_sig: ScriptBuf::new(),
				sequence: Sequence::MAX,
				witness: Witness::new(),
			}],
			output,
		};

		let candidate = CandidateTransaction {
			txid: txid(n),
			raw_outputs_count: outputs,
			block_height,
			block_time: block_height
				.map(|height| Utc.timestamp_opt(1_700_000_000 + height as i64 * 600, 0).unwrap()),
			input_addresses: vec![Some("bc1qsender".to_string())],
			output_addresses,
			aux_payload,
		};

		self.with_state(|state| {
			state
				.raw
				.insert(candidate.txid, bitcoin::consensus::serialize(&transaction));
			if let Some(height) = block_height {
				state.chain_height = state.chain_height.max(height);
				for index in 0..protostones {
					if let Ok(outpoint) = outpoint::resolve(candidate.txid, outputs, index) {
						state.blocks.insert(outpoint, height);
					}
				}
			}
			state.history.push(candidate.clone());
			// unconfirmed first, then newest block first
			state
				.history
				.sort_by_key(|tx| std::cmp::Reverse(tx.block_height.unwrap_or(u64::MAX)));
		});
		candidate
	}

	/// A confirmed transaction whose single protostone mints `amount`.
	pub fn add_wrap(&self, n: u8, outputs: u32, block_height: u64, amount: u128) -> VirtualOutpoint {
		self.add_traced(n, outputs, block_height, receive_intent(amount))
	}

	/// A confirmed transaction whose single protostone burns `amount`.
	pub fn add_unwrap(&self, n: u8, outputs: u32, block_height: u64, amount: u128) -> VirtualOutpoint {
		self.add_traced(n, outputs, block_height, value_transfer(amount))
	}

	fn add_traced(&self, n: u8, outputs: u32, block_height: u64, event: TraceEvent) -> VirtualOutpoint {
		let candidate = self.add_transaction(n, outputs, 1, Some(block_height));
		let outpoint = VirtualOutpoint {
			txid: candidate.txid,
			output_index: outputs + 1,
		};
		self.set_trace(outpoint, vec![event]);
		outpoint
	}

	pub fn set_raw(&self, txid: Txid, raw: Vec<u8>) {
		self.with_state(|state| {
			state.raw.insert(txid, raw);
		});
	}

	pub fn set_trace(&self, outpoint: VirtualOutpoint, events: Vec<TraceEvent>) {
		self.with_state(|state| {
			state.traces.insert(outpoint, events);
		});
	}

	pub fn fail_trace(&self, outpoint: VirtualOutpoint) {
		self.with_state(|state| {
			state.failing_traces.insert(outpoint);
		});
	}

	pub fn heal_trace(&self, outpoint: VirtualOutpoint) {
		self.with_state(|state| {
			state.failing_traces.remove(&outpoint);
		});
	}

	/// Include `outpoint` in the block trace of `height`.
	pub fn set_block(&self, outpoint: VirtualOutpoint, height: u64) {
		self.with_state(|state| {
			state.blocks.insert(outpoint, height);
		});
	}

	/// Make the block trace bundle of `outpoint` unparseable.
	pub fn garble_block_trace(&self, outpoint: VirtualOutpoint) {
		self.with_state(|state| {
			state.garbled_bundles.insert(outpoint);
		});
	}

	pub fn fail_block(&self, height: u64) {
		self.with_state(|state| {
			state.failing_blocks.insert(height);
		});
	}

	pub fn fail_history(&self) {
		self.with_state(|state| state.history_fails = true);
	}

	pub fn set_page_size(&self, page_size: usize) {
		self.with_state(|state| state.page_size = page_size);
	}

	pub fn set_chain_height(&self, height: u64) {
		self.with_state(|state| state.chain_height = height);
	}

	pub fn set_balance(&self, sats: u64) {
		self.with_state(|state| state.balance = sats);
	}

	pub fn history_calls(&self) -> usize {
		self.history_calls.load(Ordering::SeqCst)
	}

	pub fn block_calls(&self) -> usize {
		self.block_calls.load(Ordering::SeqCst)
	}

	/// Hold the next `get_chain_height` call until [`MockRpc::resume`].
	pub fn pause_next_height(&self) {
		self.pause_height.store(true, Ordering::SeqCst);
	}

	pub async fn wait_until_paused(&self) {
		self.paused.notified().await;
	}

	pub fn resume(&self) {
		self.resumed.notify_one();
	}
}

#[async_trait::async_trait]
impl ChainRpc for MockRpc {
	async fn get_address_transactions(
		&self,
		_address: &str,
		cursor: Option<&Txid>,
	) -> Result<Vec<CandidateTransaction>, RpcError> {
		self.history_calls.fetch_add(1, Ordering::SeqCst);
		self.with_state(|state| {
			if state.history_fails {
				return Err(RpcError::Malformed("history unavailable".to_string()));
			}
			let start = match cursor {
				Some(cursor) => state
					.history
					.iter()
					.position(|tx| &tx.txid == cursor)
					.map_or(state.history.len(), |position| position + 1),
				None => 0,
			};
			Ok(state
				.history
				.iter()
				.skip(start)
				.take(state.page_size)
				.cloned()
				.collect())
		})
	}

	async fn get_raw_transaction(&self, txid: &Txid) -> Result<Vec<u8>, RpcError> {
		self.with_state(|state| state.raw.get(txid).cloned().ok_or(RpcError::NoData))
	}

	async fn trace_outpoint(&self, outpoint: &VirtualOutpoint) -> Result<Vec<TraceEvent>, RpcError> {
		self.with_state(|state| {
			if state.failing_traces.contains(outpoint) {
				return Err(RpcError::Rpc {
					code: -32000,
					message: format!("trace of {} timed out", outpoint),
				});
			}
			Ok(state.traces.get(outpoint).cloned().unwrap_or_default())
		})
	}

	async fn trace_block(&self, height: u64) -> Result<Vec<TraceBundle>, RpcError> {
		self.block_calls.fetch_add(1, Ordering::SeqCst);
		self.with_state(|state| {
			if state.failing_blocks.contains(&height) {
				return Err(RpcError::Rpc {
					code: -32000,
					message: format!("block {} not indexed", height),
				});
			}
			Ok(state
				.blocks
				.iter()
				.filter(|(_, block)| **block == height)
				.map(|(outpoint, _)| TraceBundle {
					txid: outpoint.txid,
					vout: outpoint.output_index,
					events: if state.garbled_bundles.contains(outpoint) {
						Err(format!("unexpected trace payload for {}", outpoint))
					} else {
						Ok(state.traces.get(outpoint).cloned().unwrap_or_default())
					},
				})
				.collect())
		})
	}

	async fn get_chain_height(&self) -> Result<u64, RpcError> {
		if self.pause_height.swap(false, Ordering::SeqCst) {
			self.paused.notify_one();
			self.resumed.notified().await;
		}
		Ok(self.with_state(|state| state.chain_height))
	}

	async fn get_address_balance(&self, _address: &str) -> Result<u64, RpcError> {
		Ok(self.with_state(|state| state.balance))
	}
}

/// A store whose backend cannot be reached.
pub struct UnavailableStore;

fn unavailable<T>() -> Result<T, StoreError> {
	Err(StoreError::Unavailable("connection refused".to_string()))
}

#[async_trait::async_trait]
impl AggregationStore for UnavailableStore {
	async fn get_watermark(&self, _stream: StreamKey) -> Result<Option<SyncWatermark>, StoreError> {
		unavailable()
	}

	async fn upsert_watermark(&self, _watermark: &SyncWatermark) -> Result<(), StoreError> {
		unavailable()
	}

	async fn append_records(
		&self,
		_kind: RecordKind,
		_records: &[FlowRecord],
	) -> Result<Vec<FlowRecord>, StoreError> {
		unavailable()
	}

	async fn list_records(
		&self,
		_kind: RecordKind,
		_limit: usize,
		_offset: usize,
	) -> Result<Vec<FlowRecord>, StoreError> {
		unavailable()
	}

	async fn count_records(&self, _kind: RecordKind) -> Result<u64, StoreError> {
		unavailable()
	}

	async fn record_totals(&self, _kind: RecordKind) -> Result<RecordTotals, StoreError> {
		unavailable()
	}

	async fn delete_all(&self, _stream: StreamKey) -> Result<u64, StoreError> {
		unavailable()
	}

	async fn append_snapshot(&self, _snapshot: &Snapshot) -> Result<bool, StoreError> {
		unavailable()
	}

	async fn list_snapshots(
		&self,
		_stream: StreamKey,
		_limit: usize,
	) -> Result<Vec<Snapshot>, StoreError> {
		unavailable()
	}
}

/// A lease service that cannot be reached.
pub struct UnavailableLeases;

#[async_trait::async_trait]
impl LeaseService for UnavailableLeases {
	async fn try_acquire(
		&self,
		_key: &str,
		_holder_token: &str,
		_ttl: Duration,
	) -> Result<Option<Lease>, LeaseError> {
		Err(LeaseError::Unavailable("connection refused".to_string()))
	}

	async fn release(&self, _lease: &Lease) -> Result<bool, LeaseError> {
		Err(LeaseError::Unavailable("connection refused".to_string()))
	}

	async fn current(&self, _key: &str) -> Result<Option<Lease>, LeaseError> {
		Err(LeaseError::Unavailable("connection refused".to_string()))
	}
}

/// Records the kind of every event it sees.
#[derive(Clone, Default)]
pub struct CollectingHandler {
	seen: Arc<Mutex<Vec<&'static str>>>,
}

impl CollectingHandler {
	pub fn names(&self) -> Vec<&'static str> {
		self.seen.lock().unwrap().clone()
	}
}

#[async_trait::async_trait]
impl SyncEventHandler for CollectingHandler {
	async fn handle(&mut self, event: &SyncEvent) -> Result<(), SyncError> {
		let name = match event {
			SyncEvent::RunStarted { .. } => "run_started",
			SyncEvent::ProtostonesDecoded { .. } => "protostones_decoded",
			SyncEvent::DecodeFailed { .. } => "decode_failed",
			SyncEvent::TraceFailed(_) => "trace_failed",
			SyncEvent::RecordDetected(_) => "record_detected",
			SyncEvent::ReviewFlagged(_) => "review_flagged",
			SyncEvent::SyncCompleted { .. } => "sync_completed",
			SyncEvent::SyncError { .. } => "sync_error",
		};
		self.seen.lock().unwrap().push(name);
		Ok(())
	}

	fn name(&self) -> &'static str {
		"collecting"
	}
}
