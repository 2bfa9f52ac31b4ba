use super::state::StoreState;
use super::{
	AggregationStore, FlowRecord, RecordKind, RecordTotals, Snapshot, StoreError, StreamKey,
	SyncWatermark,
};
use tokio::sync::RwLock;

/// Process-local store. Contents are lost on exit.
#[derive(Debug, Default)]
pub struct MemoryStore {
	state: RwLock<StoreState>,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait::async_trait]
impl AggregationStore for MemoryStore {
	async fn get_watermark(&self, stream: StreamKey) -> Result<Option<SyncWatermark>, StoreError> {
		Ok(self.state.read().await.watermark(stream))
	}

	async fn upsert_watermark(&self, watermark: &SyncWatermark) -> Result<(), StoreError> {
		self.state.write().await.upsert_watermark(watermark);
		Ok(())
	}

	async fn append_records(
		&self,
		kind: RecordKind,
		records: &[FlowRecord],
	) -> Result<Vec<FlowRecord>, StoreError> {
		Ok(self.state.write().await.append_records(kind, records))
	}

	async fn list_records(
		&self,
		kind: RecordKind,
		limit: usize,
		offset: usize,
	) -> Result<Vec<FlowRecord>, StoreError> {
		Ok(self.state.read().await.list_records(kind, limit, offset))
	}

	async fn count_records(&self, kind: RecordKind) -> Result<u64, StoreError> {
		Ok(self.state.read().await.count_records(kind))
	}

	async fn record_totals(&self, kind: RecordKind) -> Result<RecordTotals, StoreError> {
		Ok(self.state.read().await.record_totals(kind))
	}

	async fn delete_all(&self, stream: StreamKey) -> Result<u64, StoreError> {
		Ok(self.state.write().await.delete_all(stream))
	}

	async fn append_snapshot(&self, snapshot: &Snapshot) -> Result<bool, StoreError> {
		Ok(self.state.write().await.append_snapshot(snapshot))
	}

	async fn list_snapshots(
		&self,
		stream: StreamKey,
		limit: usize,
	) -> Result<Vec<Snapshot>, StoreError> {
		Ok(self.state.read().await.list_snapshots(stream, limit))
	}
}
