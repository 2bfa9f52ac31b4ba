//! Incremental sync coordinator.
//!
//! The coordinator owns the run loop of each stream: take the stream's lease, read its
//! watermark, scan the tracked address's history above the watermark, decode, resolve, fetch
//! and classify, persist, then release the lease. It is the only component that writes shared
//! state.
//!
//! When the store or the lease service cannot be reached, a run computes its result directly
//! against RPC from genesis and persists nothing. Such results carry [`Source::Live`].

use super::events::{EventDispatcher, SyncEvent, SyncEventHandler};
use super::lease::{self, FULL_SYNC_LEASE, Lease, LeaseService, LeaseWait};
use super::progress_tracker::{SyncProgressTracker, SyncStats};
use super::{
	ResetAllOutcome, ResetOutcome, RunState, Source, SyncError, SyncReport, SyncStatus,
};
use crate::amount::Amount;
use crate::config::IndexerConfig;
use crate::outpoint::{self, VirtualOutpoint};
use crate::rpc::{CandidateTransaction, ChainRpc};
use crate::store::{
	AggregationStore, Cache, FlowRecord, RecordKind, Snapshot, StreamKey, SyncWatermark,
};
use crate::trace::{ClassificationContext, Classifier, ReviewItem, TraceFailure, TraceRequest};
use bitcoin::Txid;
use chrono::Utc;
use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Everything one scan of the address history produced.
struct ScanOutcome {
	chain_height: u64,
	/// Highest height among the candidates that were scanned.
	highest_height: Option<u64>,
	truncated: bool,
	records: Vec<FlowRecord>,
	review: Vec<ReviewItem>,
	failures: Vec<TraceFailure>,
	decode_failures: usize,
	/// Heights of candidates whose raw transaction could not be fetched.
	retry_heights: Vec<u64>,
	stats: SyncStats,
}

impl ScanOutcome {
	/// Where the watermark may move after persisting this scan.
	///
	/// Failed items are retried next run, so the watermark stops one below the lowest of them.
	/// A truncated scan leaves the watermark where it was.
	fn next_watermark(&self, current: u64) -> u64 {
		if self.truncated {
			return current;
		}

		let mut target = self.highest_height.unwrap_or(current);
		let lowest_retry = self
			.failures
			.iter()
			.map(|failure| failure.block_height)
			.chain(self.retry_heights.iter().copied())
			.min();
		if let Some(lowest) = lowest_retry {
			target = target.min(lowest.saturating_sub(1));
		}
		target.max(current)
	}

	fn into_report(
		self,
		stream: StreamKey,
		source: Source,
		watermark: SyncWatermark,
		inserted: &[FlowRecord],
		snapshot: Option<Snapshot>,
	) -> SyncReport {
		SyncReport {
			stream,
			source,
			watermark,
			chain_height: self.chain_height,
			new_wraps: count_kind(inserted, RecordKind::Wrap),
			new_unwraps: count_kind(inserted, RecordKind::Unwrap),
			failed_count: self.failures.len(),
			failures: self.failures,
			decode_failures: self.decode_failures,
			review: self.review,
			truncated: self.truncated,
			snapshot,
			stats: self.stats,
		}
	}
}

fn count_kind(records: &[FlowRecord], kind: RecordKind) -> usize {
	records.iter().filter(|record| record.kind == kind).count()
}

/// Result of a live computation: the report plus the records it found, newest first.
pub struct LiveComputation {
	pub report: SyncReport,
	pub records: Vec<FlowRecord>,
}

enum DecodeOutcome {
	Decoded(Vec<(VirtualOutpoint, Option<u32>)>),
	/// The payload is malformed; the transaction is skipped for good.
	Invalid(String),
	/// The raw transaction could not be fetched; the transaction is retried next run.
	Unavailable(String),
}

pub struct SyncCoordinator {
	rpc: Arc<dyn ChainRpc>,
	store: Arc<dyn AggregationStore>,
	leases: Arc<dyn LeaseService>,
	cache: Arc<dyn Cache>,
	config: IndexerConfig,
	classifier: Classifier,
	dispatcher: Mutex<EventDispatcher>,
	states: Mutex<HashMap<StreamKey, RunState>>,
}

impl SyncCoordinator {
	pub fn new(
		rpc: Arc<dyn ChainRpc>,
		store: Arc<dyn AggregationStore>,
		leases: Arc<dyn LeaseService>,
		cache: Arc<dyn Cache>,
		config: IndexerConfig,
	) -> Self {
		Self {
			rpc,
			store,
			leases,
			cache,
			classifier: Classifier::new(config.classifier.clone()),
			config,
			dispatcher: Mutex::new(EventDispatcher::new()),
			states: Mutex::new(HashMap::new()),
		}
	}

	pub async fn register_handler(&self, handler: Box<dyn SyncEventHandler>) {
		self.dispatcher.lock().await.register_handler(handler);
	}

	pub fn config(&self) -> &IndexerConfig {
		&self.config
	}

	pub fn store(&self) -> &Arc<dyn AggregationStore> {
		&self.store
	}

	pub fn cache(&self) -> &Arc<dyn Cache> {
		&self.cache
	}

	pub fn leases(&self) -> &Arc<dyn LeaseService> {
		&self.leases
	}

	/// Current run state of `stream` in this process.
	pub async fn state(&self, stream: StreamKey) -> RunState {
		self.states
			.lock()
			.await
			.get(&stream)
			.copied()
			.unwrap_or_default()
	}

	async fn set_state(&self, stream: StreamKey, state: RunState) -> RunState {
		self.states
			.lock()
			.await
			.insert(stream, state)
			.unwrap_or_default()
	}

	async fn emit(&self, event: SyncEvent) {
		self.dispatcher.lock().await.dispatch(&event).await;
	}

	/// Sync one stream. `supply` is derived from the wrap/unwrap run.
	pub async fn sync_stream(
		&self,
		stream: StreamKey,
		wait: LeaseWait,
	) -> Result<SyncStatus, SyncError> {
		match stream {
			StreamKey::WrapUnwrap | StreamKey::Supply => self.sync_wrap_unwrap(wait).await,
			StreamKey::LockedBalance => self.sync_locked_balance(wait).await,
		}
	}

	pub async fn sync_wrap_unwrap(&self, wait: LeaseWait) -> Result<SyncStatus, SyncError> {
		self.run_leased(StreamKey::WrapUnwrap, wait).await
	}

	pub async fn sync_locked_balance(&self, wait: LeaseWait) -> Result<SyncStatus, SyncError> {
		self.run_leased(StreamKey::LockedBalance, wait).await
	}

	/// Sync every stream under the umbrella `full-sync` lease.
	pub async fn sync_all(&self, wait: LeaseWait) -> Result<Vec<SyncStatus>, SyncError> {
		let umbrella = match lease::acquire(
			self.leases.as_ref(),
			FULL_SYNC_LEASE,
			self.config.lease.ttl(),
			wait,
		)
		.await
		{
			Ok(Some(lease)) => Some(lease),
			Ok(None) => return Ok(vec![self.in_progress(FULL_SYNC_LEASE).await]),
			Err(e) => {
				warn!("Running full sync without the {} lease: {}", FULL_SYNC_LEASE, e);
				None
			}
		};

		let result = async {
			let wrap_unwrap = self.sync_wrap_unwrap(wait).await?;
			let locked_balance = self.sync_locked_balance(wait).await?;
			Ok::<_, SyncError>(vec![wrap_unwrap, locked_balance])
		}
		.await;

		if let Some(lease) = &umbrella {
			self.release(lease).await;
		}
		result
	}

	async fn run_leased(&self, stream: StreamKey, wait: LeaseWait) -> Result<SyncStatus, SyncError> {
		let previous = self.set_state(stream, RunState::Leasing).await;

		let lease = match lease::acquire(
			self.leases.as_ref(),
			stream.as_str(),
			self.config.lease.ttl(),
			wait,
		)
		.await
		{
			Ok(Some(lease)) => lease,
			Ok(None) => {
				info!("Sync of {} already in progress", stream);
				self.set_state(stream, previous).await;
				return Ok(self.in_progress(stream.as_str()).await);
			}
			Err(e) => {
				warn!("Lease service unavailable, computing {} live: {}", stream, e);
				self.set_state(stream, RunState::Idle).await;
				return self.live_status(stream).await;
			}
		};

		let result = match stream {
			StreamKey::WrapUnwrap | StreamKey::Supply => self.run_wrap_unwrap().await,
			StreamKey::LockedBalance => self.run_locked_balance().await,
		};
		self.release(&lease).await;

		match result {
			Ok(report) => {
				self.set_state(stream, RunState::Idle).await;
				Ok(SyncStatus::Completed(report))
			}
			Err(e) if e.is_store_unavailable() => {
				warn!("Store unavailable, computing {} live: {}", stream, e);
				self.set_state(stream, RunState::Idle).await;
				self.live_status(stream).await
			}
			Err(e) => {
				error!("Sync of {} failed: {}", stream, e);
				self.set_state(stream, RunState::Failed).await;
				self.emit(SyncEvent::SyncError {
					stream,
					error: e.to_string(),
				})
				.await;
				Err(e)
			}
		}
	}

	async fn release(&self, lease: &Lease) {
		match self.leases.release(lease).await {
			Ok(true) => debug!("Released lease {}", lease.key),
			Ok(false) => warn!("Lease {} expired before it was released", lease.key),
			Err(e) => warn!("Failed to release lease {}: {}", lease.key, e),
		}
	}

	async fn in_progress(&self, lease_key: &str) -> SyncStatus {
		let held_until = match self.leases.current(lease_key).await {
			Ok(lease) => lease.map(|lease| lease.expires_at),
			Err(_) => None,
		};
		SyncStatus::InProgress {
			lease_key: lease_key.to_string(),
			held_until,
		}
	}

	async fn live_status(&self, stream: StreamKey) -> Result<SyncStatus, SyncError> {
		let report = match stream {
			StreamKey::WrapUnwrap | StreamKey::Supply => self.compute_live().await?.report,
			StreamKey::LockedBalance => self.compute_live_locked_balance().await?,
		};
		Ok(SyncStatus::Completed(report))
	}

	async fn run_wrap_unwrap(&self) -> Result<SyncReport, SyncError> {
		let stream = StreamKey::WrapUnwrap;
		self.set_state(stream, RunState::Running).await;

		let mut watermark = self
			.store
			.get_watermark(stream)
			.await?
			.unwrap_or_else(|| SyncWatermark::genesis(stream));
		let from_height = watermark.last_block_height;
		self.emit(SyncEvent::RunStarted {
			stream,
			from_height,
		})
		.await;

		let scan = self.scan(from_height).await?;

		self.set_state(stream, RunState::Persisting).await;
		let (wraps, unwraps): (Vec<FlowRecord>, Vec<FlowRecord>) = scan
			.records
			.iter()
			.cloned()
			.partition(|record| record.kind == RecordKind::Wrap);
		let mut inserted = self.store.append_records(RecordKind::Wrap, &wraps).await?;
		inserted.extend(
			self.store
				.append_records(RecordKind::Unwrap, &unwraps)
				.await?,
		);
		// totals also cover records left behind by an interrupted run
		for kind in [RecordKind::Wrap, RecordKind::Unwrap] {
			watermark.set_totals(kind, self.store.record_totals(kind).await?);
		}

		watermark.last_block_height = scan.next_watermark(from_height);
		watermark.updated_at = Utc::now();
		self.store.upsert_watermark(&watermark).await?;

		let snapshot = self.record_supply(&watermark).await?;

		self.emit(SyncEvent::SyncCompleted {
			stream,
			last_block_height: watermark.last_block_height,
		})
		.await;
		info!("{}", scan.stats.summary());
		info!(
			"Persisted {} new records, {} trace failures, watermark at {}",
			inserted.len(),
			scan.failures.len(),
			watermark.last_block_height
		);

		Ok(scan.into_report(stream, Source::Store, watermark, &inserted, snapshot))
	}

	/// Append a supply snapshot for the new totals and move the supply watermark along.
	async fn record_supply(&self, totals: &SyncWatermark) -> Result<Option<Snapshot>, SyncError> {
		let Some(snapshot) = supply_snapshot(totals) else {
			return Ok(None);
		};
		let appended = self.store.append_snapshot(&snapshot).await?;

		let mut supply = self
			.store
			.get_watermark(StreamKey::Supply)
			.await?
			.unwrap_or_else(|| SyncWatermark::genesis(StreamKey::Supply));
		supply.last_block_height = supply.last_block_height.max(totals.last_block_height);
		supply.total_wrapped = totals.total_wrapped;
		supply.total_unwrapped = totals.total_unwrapped;
		supply.wrap_count = totals.wrap_count;
		supply.unwrap_count = totals.unwrap_count;
		supply.updated_at = Utc::now();
		self.store.upsert_watermark(&supply).await?;

		Ok(appended.then_some(snapshot))
	}

	async fn run_locked_balance(&self) -> Result<SyncReport, SyncError> {
		let stream = StreamKey::LockedBalance;
		self.set_state(stream, RunState::Running).await;

		let mut watermark = self
			.store
			.get_watermark(stream)
			.await?
			.unwrap_or_else(|| SyncWatermark::genesis(stream));
		let from_height = watermark.last_block_height;
		self.emit(SyncEvent::RunStarted {
			stream,
			from_height,
		})
		.await;

		let chain_height = self.rpc.get_chain_height().await?;

		self.set_state(stream, RunState::Persisting).await;
		let mut snapshot = None;
		if chain_height > from_height {
			let candidate = self.balance_snapshot(chain_height).await?;
			if self.store.append_snapshot(&candidate).await? {
				snapshot = Some(candidate);
			}
			watermark.last_block_height = chain_height;
			watermark.updated_at = Utc::now();
			self.store.upsert_watermark(&watermark).await?;
		} else {
			debug!("Locked balance already recorded at height {}", chain_height);
		}

		self.emit(SyncEvent::SyncCompleted {
			stream,
			last_block_height: watermark.last_block_height,
		})
		.await;

		Ok(balance_report(
			Source::Store,
			watermark,
			from_height,
			chain_height,
			snapshot,
		))
	}

	async fn balance_snapshot(&self, chain_height: u64) -> Result<Snapshot, SyncError> {
		let balance = self
			.rpc
			.get_address_balance(&self.config.tracked_address)
			.await?;
		Ok(Snapshot {
			stream: StreamKey::LockedBalance,
			block_height: chain_height,
			value: Amount::from(balance),
			captured_at: Utc::now(),
		})
	}

	/// Compute wrap/unwrap totals from genesis directly against RPC. Nothing is persisted.
	pub async fn compute_live(&self) -> Result<LiveComputation, SyncError> {
		let stream = StreamKey::WrapUnwrap;
		let scan = self.scan(0).await?;

		let mut watermark = SyncWatermark::genesis(stream);
		let mut keys = HashSet::new();
		let mut records: Vec<FlowRecord> = scan
			.records
			.iter()
			.filter(|record| !record.amount.is_zero() && keys.insert(record.key()))
			.cloned()
			.collect();
		for record in &records {
			watermark.apply(record);
		}
		watermark.last_block_height = scan.next_watermark(0);
		records.sort_by_key(|record| (Reverse(record.block_height), record.key()));

		let snapshot = supply_snapshot(&watermark);
		let report = scan.into_report(stream, Source::Live, watermark, &records, snapshot);
		Ok(LiveComputation { report, records })
	}

	async fn compute_live_locked_balance(&self) -> Result<SyncReport, SyncError> {
		let chain_height = self.rpc.get_chain_height().await?;
		let snapshot = self.balance_snapshot(chain_height).await?;

		let mut watermark = SyncWatermark::genesis(StreamKey::LockedBalance);
		watermark.last_block_height = chain_height;
		Ok(balance_report(
			Source::Live,
			watermark,
			0,
			chain_height,
			Some(snapshot),
		))
	}

	/// The latest snapshot of `stream` computed live.
	pub async fn live_snapshot(&self, stream: StreamKey) -> Result<Option<Snapshot>, SyncError> {
		match stream {
			StreamKey::LockedBalance => Ok(self.compute_live_locked_balance().await?.snapshot),
			StreamKey::WrapUnwrap | StreamKey::Supply => Ok(self.compute_live().await?.report.snapshot),
		}
	}

	/// Delete the watermark, records and snapshots of `stream` and clear the cache.
	///
	/// Does not wait for a running sync; `had_active_lease` reports whether one held the lease.
	pub async fn reset_stream(&self, stream: StreamKey) -> Result<ResetOutcome, SyncError> {
		let outcome = self.reset_store(stream).await?;
		let cleared = self.cache.clear().await;
		info!(
			"Reset {}: {} entries deleted, {} cache keys cleared",
			stream, outcome.deleted_record_count, cleared
		);
		Ok(outcome)
	}

	pub async fn reset_all(&self) -> Result<ResetAllOutcome, SyncError> {
		let mut per_stream = Vec::with_capacity(StreamKey::ALL.len());
		for stream in StreamKey::ALL {
			per_stream.push(self.reset_store(stream).await?);
		}
		let cache_keys_cleared = self.cache.clear().await;
		info!(
			"Reset all streams, {} cache keys cleared",
			cache_keys_cleared
		);

		Ok(ResetAllOutcome {
			per_stream,
			cache_keys_cleared,
		})
	}

	async fn reset_store(&self, stream: StreamKey) -> Result<ResetOutcome, SyncError> {
		let had_active_lease = match self.leases.current(stream.as_str()).await {
			Ok(lease) => lease.is_some(),
			Err(e) => {
				warn!("Could not check lease {}: {}", stream, e);
				false
			}
		};
		if had_active_lease {
			warn!("Resetting {} while a sync holds its lease", stream);
		}

		let deleted_record_count = self.store.delete_all(stream).await?;
		Ok(ResetOutcome {
			stream,
			deleted_record_count,
			had_active_lease,
		})
	}

	/// Scan history above `from_height` and classify every trace found.
	async fn scan(&self, from_height: u64) -> Result<ScanOutcome, SyncError> {
		let mut tracker = SyncProgressTracker::new(from_height);
		let chain_height = self.rpc.get_chain_height().await?;
		let (candidates, truncated) = self.collect_candidates(from_height, chain_height).await?;

		let mut decode_failures = 0;
		let mut retry_heights = Vec::new();
		let mut requests = Vec::new();
		let mut origins: HashMap<VirtualOutpoint, (usize, Option<u32>)> = HashMap::new();

		for (position, candidate) in candidates.iter().enumerate() {
			let Some(block_height) = candidate.block_height else {
				continue;
			};
			tracker.record_transaction(block_height);
			tracker.log_progress(false);

			let outpoints = match self.decode(candidate).await {
				DecodeOutcome::Decoded(outpoints) => outpoints,
				DecodeOutcome::Invalid(error) => {
					decode_failures += 1;
					self.emit(SyncEvent::DecodeFailed {
						txid: candidate.txid,
						error,
					})
					.await;
					continue;
				}
				DecodeOutcome::Unavailable(error) => {
					decode_failures += 1;
					retry_heights.push(block_height);
					self.emit(SyncEvent::DecodeFailed {
						txid: candidate.txid,
						error,
					})
					.await;
					continue;
				}
			};
			if outpoints.is_empty() {
				continue;
			}

			tracker.record_protostones(outpoints.len());
			self.emit(SyncEvent::ProtostonesDecoded {
				txid: candidate.txid,
				block_height,
				count: outpoints.len(),
			})
			.await;

			for (outpoint, pointer) in outpoints {
				requests.push(TraceRequest {
					outpoint,
					block_height,
				});
				origins.insert(outpoint, (position, pointer));
			}
		}

		let strategy = self.config.trace_mode.strategy(from_height == 0);
		debug!(
			"Fetching {} traces with the {} strategy",
			requests.len(),
			strategy.name()
		);
		let report = strategy.fetch(self.rpc.as_ref(), &requests).await;
		tracker.record_traces(report.traces.len());
		for failure in &report.failures {
			self.emit(SyncEvent::TraceFailed(failure.clone())).await;
		}

		let mut records = Vec::new();
		let mut review = Vec::new();
		for trace in &report.traces {
			let Some(&(position, pointer)) = origins.get(&trace.request.outpoint) else {
				continue;
			};
			let ctx = ClassificationContext {
				candidate: &candidates[position],
				outpoint: trace.request.outpoint,
				pointer,
				tracked_address: &self.config.tracked_address,
			};
			let classification = self.classifier.classify(&ctx, &trace.events);
			records.extend(classification.records);
			review.extend(classification.review);
		}
		tracker.record_detections(records.len());

		for record in &records {
			self.emit(SyncEvent::RecordDetected(record.clone())).await;
		}
		for item in &review {
			self.emit(SyncEvent::ReviewFlagged(item.clone())).await;
		}
		tracker.log_progress(true);

		Ok(ScanOutcome {
			chain_height,
			highest_height: candidates
				.iter()
				.filter_map(|candidate| candidate.block_height)
				.max(),
			truncated,
			records,
			review,
			failures: report.failures,
			decode_failures,
			retry_heights,
			stats: tracker.get_stats(),
		})
	}

	/// Page through the address history, newest first, until a page reaches `from_height`.
	///
	/// Returns confirmed candidates with `from_height < height <= chain_height`, oldest first,
	/// and whether the pagination cap cut the scan short.
	async fn collect_candidates(
		&self,
		from_height: u64,
		chain_height: u64,
	) -> Result<(Vec<CandidateTransaction>, bool), SyncError> {
		let mut candidates = Vec::new();
		let mut seen: HashSet<Txid> = HashSet::new();
		let mut cursor: Option<Txid> = None;
		let mut rounds = 0;
		let mut truncated = false;

		loop {
			let page = self
				.rpc
				.get_address_transactions(&self.config.tracked_address, cursor.as_ref())
				.await?;
			rounds += 1;

			let Some(last) = page.last() else {
				break;
			};
			cursor = Some(last.txid);

			let mut reached_watermark = false;
			for tx in page {
				match tx.block_height {
					None => debug!("Skipping unconfirmed {}", tx.txid),
					Some(height) if height <= from_height => reached_watermark = true,
					Some(height) if height > chain_height => debug!(
						"Skipping {} at height {}, above indexed height {}",
						tx.txid, height, chain_height
					),
					Some(_) => {
						if seen.insert(tx.txid) {
							candidates.push(tx);
						}
					}
				}
			}

			if reached_watermark {
				break;
			}
			if rounds >= self.config.max_pagination_rounds {
				warn!(
					"Stopped history scan after {} pages; watermark will not advance",
					rounds
				);
				truncated = true;
				break;
			}
		}

		candidates.sort_by_key(|candidate| candidate.block_height);
		Ok((candidates, truncated))
	}

	async fn decode(&self, candidate: &CandidateTransaction) -> DecodeOutcome {
		if candidate.aux_payload.is_none() {
			return DecodeOutcome::Decoded(Vec::new());
		}

		let raw = match self.rpc.get_raw_transaction(&candidate.txid).await {
			Ok(raw) => raw,
			Err(e) => return DecodeOutcome::Unavailable(e.to_string()),
		};
		let protostones = match self.rpc.decode_embedded_message(&raw) {
			Ok(protostones) => protostones,
			Err(e) => return DecodeOutcome::Invalid(e.to_string()),
		};

		protostones
			.iter()
			.map(|protostone| {
				outpoint::resolve(
					candidate.txid,
					candidate.raw_outputs_count,
					protostone.index,
				)
				.map(|outpoint| (outpoint, protostone.pointer))
			})
			.collect::<Result<Vec<_>, _>>()
			.map_or_else(
				|e| DecodeOutcome::Invalid(e.to_string()),
				DecodeOutcome::Decoded,
			)
	}
}

fn supply_snapshot(totals: &SyncWatermark) -> Option<Snapshot> {
	(totals.last_block_height > 0).then(|| Snapshot {
		stream: StreamKey::Supply,
		block_height: totals.last_block_height,
		value: totals.net_supply(),
		captured_at: Utc::now(),
	})
}

fn balance_report(
	source: Source,
	watermark: SyncWatermark,
	from_height: u64,
	chain_height: u64,
	snapshot: Option<Snapshot>,
) -> SyncReport {
	SyncReport {
		stream: StreamKey::LockedBalance,
		source,
		watermark,
		chain_height,
		new_wraps: 0,
		new_unwraps: 0,
		failed_count: 0,
		failures: Vec::new(),
		decode_failures: 0,
		review: Vec::new(),
		truncated: false,
		snapshot,
		stats: SyncStats {
			start_height: from_height,
			highest_processed_height: chain_height.max(from_height),
			..SyncStats::default()
		},
	}
}
