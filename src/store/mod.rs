//! Aggregation store and cache.
//!
//! The store keeps per-event wrap/unwrap records, one watermark per logical stream and
//! append-only snapshots. It is consumed through the [`AggregationStore`] trait; this crate
//! ships an in-memory implementation and a JSON file implementation. Read paths are fronted by
//! a short-TTL [`Cache`].

/// TTL cache for read paths
pub mod cache;
/// JSON document store in a data directory
pub mod file;
/// In-memory store
pub mod memory;
mod state;

pub use cache::{Cache, MemoryCache};
pub use file::FileStore;
pub use memory::MemoryStore;

use crate::amount::Amount;
use bitcoin::Txid;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Logical data streams, each with its own watermark and lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StreamKey {
	WrapUnwrap,
	LockedBalance,
	Supply,
}

impl StreamKey {
	pub const ALL: [StreamKey; 3] = [
		StreamKey::WrapUnwrap,
		StreamKey::LockedBalance,
		StreamKey::Supply,
	];

	pub fn as_str(&self) -> &'static str {
		match self {
			StreamKey::WrapUnwrap => "wrap-unwrap",
			StreamKey::LockedBalance => "locked-balance",
			StreamKey::Supply => "supply",
		}
	}
}

impl fmt::Display for StreamKey {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for StreamKey {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		StreamKey::ALL
			.into_iter()
			.find(|stream| stream.as_str() == s)
			.ok_or_else(|| format!("unknown stream `{}`", s))
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
	/// Mint of the tracked token.
	Wrap,
	/// Burn of the tracked token.
	Unwrap,
}

impl RecordKind {
	pub fn as_str(&self) -> &'static str {
		match self {
			RecordKind::Wrap => "wrap",
			RecordKind::Unwrap => "unwrap",
		}
	}
}

impl fmt::Display for RecordKind {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for RecordKind {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"wrap" => Ok(RecordKind::Wrap),
			"unwrap" => Ok(RecordKind::Unwrap),
			_ => Err(format!("unknown record kind `{}`", s)),
		}
	}
}

/// Uniqueness key of a record. Appending a record whose key exists is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey {
	pub kind: RecordKind,
	pub txid: Txid,
	pub output_index: u32,
	pub sequence: u32,
}

/// A wrap or unwrap detected in a trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowRecord {
	pub kind: RecordKind,
	pub txid: Txid,
	/// Virtual output index of the protostone whose trace produced this record.
	pub output_index: u32,
	/// Ordinal of this qualifying event within its trace.
	pub sequence: u32,
	pub amount: Amount,
	pub block_height: u64,
	pub counterparty_address: Option<String>,
	pub timestamp: DateTime<Utc>,
}

impl FlowRecord {
	pub fn key(&self) -> RecordKey {
		RecordKey {
			kind: self.kind,
			txid: self.txid,
			output_index: self.output_index,
			sequence: self.sequence,
		}
	}
}

/// Number and sum of the stored records of one kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordTotals {
	pub count: u64,
	pub sum: Amount,
}

/// Persisted cursor and running totals of one stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncWatermark {
	pub stream: StreamKey,
	pub last_block_height: u64,
	pub total_wrapped: Amount,
	pub total_unwrapped: Amount,
	pub wrap_count: u64,
	pub unwrap_count: u64,
	pub updated_at: DateTime<Utc>,
}

impl SyncWatermark {
	/// The state of a stream that has never been synced.
	pub fn genesis(stream: StreamKey) -> Self {
		Self {
			stream,
			last_block_height: 0,
			total_wrapped: Amount::ZERO,
			total_unwrapped: Amount::ZERO,
			wrap_count: 0,
			unwrap_count: 0,
			updated_at: Utc::now(),
		}
	}

	/// Fold a newly persisted record into the running totals.
	pub fn apply(&mut self, record: &FlowRecord) {
		match record.kind {
			RecordKind::Wrap => {
				self.total_wrapped = self.total_wrapped.saturating_add(record.amount);
				self.wrap_count += 1;
			}
			RecordKind::Unwrap => {
				self.total_unwrapped = self.total_unwrapped.saturating_add(record.amount);
				self.unwrap_count += 1;
			}
		}
	}

	/// Overwrite the totals of `kind` with values recounted from stored records.
	pub fn set_totals(&mut self, kind: RecordKind, totals: RecordTotals) {
		match kind {
			RecordKind::Wrap => {
				self.wrap_count = totals.count;
				self.total_wrapped = totals.sum;
			}
			RecordKind::Unwrap => {
				self.unwrap_count = totals.count;
				self.total_unwrapped = totals.sum;
			}
		}
	}

	/// Outstanding supply of the tracked token.
	pub fn net_supply(&self) -> Amount {
		self.total_wrapped.saturating_sub(self.total_unwrapped)
	}
}

/// Point-in-time aggregate of a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
	pub stream: StreamKey,
	pub block_height: u64,
	pub value: Amount,
	pub captured_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
	/// The backing store cannot be reached. Callers fall back to live computation.
	#[error("store unavailable: {0}")]
	Unavailable(String),

	#[error("store data corrupt: {0}")]
	Corrupt(String),
}

/// Durable storage for records, watermarks and snapshots.
#[async_trait::async_trait]
pub trait AggregationStore: Send + Sync {
	async fn get_watermark(&self, stream: StreamKey) -> Result<Option<SyncWatermark>, StoreError>;

	async fn upsert_watermark(&self, watermark: &SyncWatermark) -> Result<(), StoreError>;

	/// Append records of `kind`, skipping any whose key already exists.
	///
	/// Returns the records that were actually inserted.
	async fn append_records(
		&self,
		kind: RecordKind,
		records: &[FlowRecord],
	) -> Result<Vec<FlowRecord>, StoreError>;

	/// Records of `kind`, newest block first.
	async fn list_records(
		&self,
		kind: RecordKind,
		limit: usize,
		offset: usize,
	) -> Result<Vec<FlowRecord>, StoreError>;

	async fn count_records(&self, kind: RecordKind) -> Result<u64, StoreError>;

	/// Count and amount sum over every stored record of `kind`.
	async fn record_totals(&self, kind: RecordKind) -> Result<RecordTotals, StoreError>;

	/// Delete the watermark and every record or snapshot owned by `stream`.
	///
	/// Deleting `wrap-unwrap` also deletes the `supply` stream derived from it.
	///
	/// Returns the number of records and snapshots deleted.
	async fn delete_all(&self, stream: StreamKey) -> Result<u64, StoreError>;

	/// Append a snapshot. Returns `false` if one already exists at that height.
	async fn append_snapshot(&self, snapshot: &Snapshot) -> Result<bool, StoreError>;

	/// Snapshots of `stream`, highest block first.
	async fn list_snapshots(
		&self,
		stream: StreamKey,
		limit: usize,
	) -> Result<Vec<Snapshot>, StoreError>;
}
