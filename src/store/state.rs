use super::{FlowRecord, RecordKey, RecordKind, RecordTotals, Snapshot, StreamKey, SyncWatermark};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::HashSet;
use tracing::warn;

/// Store contents shared by the memory and file stores.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub(super) struct StoreState {
	#[serde(default)]
	watermarks: Vec<SyncWatermark>,
	#[serde(default)]
	records: Vec<FlowRecord>,
	#[serde(default)]
	snapshots: Vec<Snapshot>,
	#[serde(skip)]
	keys: HashSet<RecordKey>,
}

impl StoreState {
	/// Rebuild the record key index after deserialization.
	pub fn reindex(&mut self) {
		self.keys = self.records.iter().map(FlowRecord::key).collect();
	}

	pub fn watermark(&self, stream: StreamKey) -> Option<SyncWatermark> {
		self.watermarks
			.iter()
			.find(|watermark| watermark.stream == stream)
			.cloned()
	}

	pub fn upsert_watermark(&mut self, watermark: &SyncWatermark) {
		match self
			.watermarks
			.iter_mut()
			.find(|existing| existing.stream == watermark.stream)
		{
			Some(existing) => *existing = watermark.clone(),
			None => self.watermarks.push(watermark.clone()),
		}
	}

	pub fn append_records(&mut self, kind: RecordKind, records: &[FlowRecord]) -> Vec<FlowRecord> {
		let mut inserted = Vec::new();

		for record in records {
			if record.kind != kind {
				warn!(
					"Ignoring {} record {}:{} appended as {}",
					record.kind, record.txid, record.output_index, kind
				);
				continue;
			}
			if record.amount.is_zero() {
				warn!(
					"Ignoring zero-amount {} record {}:{}",
					record.kind, record.txid, record.output_index
				);
				continue;
			}
			if self.keys.insert(record.key()) {
				self.records.push(record.clone());
				inserted.push(record.clone());
			}
		}

		inserted
	}

	pub fn list_records(&self, kind: RecordKind, limit: usize, offset: usize) -> Vec<FlowRecord> {
		let mut records: Vec<&FlowRecord> = self
			.records
			.iter()
			.filter(|record| record.kind == kind)
			.collect();
		records.sort_by_key(|record| (Reverse(record.block_height), record.key()));

		records
			.into_iter()
			.skip(offset)
			.take(limit)
			.cloned()
			.collect()
	}

	pub fn count_records(&self, kind: RecordKind) -> u64 {
		self.records.iter().filter(|record| record.kind == kind).count() as u64
	}

	pub fn record_totals(&self, kind: RecordKind) -> RecordTotals {
		self.records
			.iter()
			.filter(|record| record.kind == kind)
			.fold(RecordTotals::default(), |totals, record| RecordTotals {
				count: totals.count + 1,
				sum: totals.sum.saturating_add(record.amount),
			})
	}

	pub fn delete_all(&mut self, stream: StreamKey) -> u64 {
		self.watermarks.retain(|watermark| watermark.stream != stream);

		let deleted = match stream {
			StreamKey::WrapUnwrap => {
				let deleted = self.records.len();
				self.records.clear();
				self.keys.clear();
				// supply is derived from the wrap/unwrap totals
				deleted + self.delete_all(StreamKey::Supply) as usize
			}
			StreamKey::LockedBalance | StreamKey::Supply => {
				let before = self.snapshots.len();
				self.snapshots.retain(|snapshot| snapshot.stream != stream);
				before - self.snapshots.len()
			}
		};

		deleted as u64
	}

	pub fn append_snapshot(&mut self, snapshot: &Snapshot) -> bool {
		let exists = self.snapshots.iter().any(|existing| {
			existing.stream == snapshot.stream && existing.block_height == snapshot.block_height
		});
		if !exists {
			self.snapshots.push(snapshot.clone());
		}
		!exists
	}

	pub fn list_snapshots(&self, stream: StreamKey, limit: usize) -> Vec<Snapshot> {
		let mut snapshots: Vec<&Snapshot> = self
			.snapshots
			.iter()
			.filter(|snapshot| snapshot.stream == stream)
			.collect();
		snapshots.sort_by_key(|snapshot| Reverse(snapshot.block_height));
		snapshots.into_iter().take(limit).cloned().collect()
	}
}
