use super::progress_tracker::SyncStats;
use crate::outpoint::ResolveError;
use crate::rpc::RpcError;
use crate::store::{Snapshot, StoreError, StreamKey, SyncWatermark};
use crate::trace::{ReviewItem, TraceFailure};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Error types for sync runs
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
	#[error("RPC error: {0}")]
	RpcError(#[from] RpcError),

	#[error("Store error: {0}")]
	StoreError(#[from] StoreError),

	#[error("Resolve error: {0}")]
	ResolveError(#[from] ResolveError),
}

impl SyncError {
	/// Whether the run should fall back to live computation.
	pub fn is_store_unavailable(&self) -> bool {
		matches!(self, SyncError::StoreError(StoreError::Unavailable(_)))
	}
}

/// Observable state of one stream's coordinator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
	#[default]
	Idle,
	Leasing,
	Running,
	Persisting,
	Failed,
}

/// Where an answer came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
	Cache,
	Store,
	/// Computed directly against RPC, nothing persisted.
	Live,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SyncStatus {
	Completed(SyncReport),
	/// Another holder owns the lease.
	InProgress {
		lease_key: String,
		held_until: Option<DateTime<Utc>>,
	},
}

impl SyncStatus {
	pub fn report(&self) -> Option<&SyncReport> {
		match self {
			SyncStatus::Completed(report) => Some(report),
			SyncStatus::InProgress { .. } => None,
		}
	}
}

/// Outcome of one completed run.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
	pub stream: StreamKey,
	pub source: Source,
	pub watermark: SyncWatermark,
	pub chain_height: u64,
	pub new_wraps: usize,
	pub new_unwraps: usize,
	pub failed_count: usize,
	pub failures: Vec<TraceFailure>,
	pub decode_failures: usize,
	pub review: Vec<ReviewItem>,
	/// The pagination cap cut the history scan short; the watermark was held back.
	pub truncated: bool,
	pub snapshot: Option<Snapshot>,
	pub stats: SyncStats,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResetOutcome {
	pub stream: StreamKey,
	pub deleted_record_count: u64,
	pub had_active_lease: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResetAllOutcome {
	pub per_stream: Vec<ResetOutcome>,
	pub cache_keys_cleared: usize,
}
