//! Cache-first read path.
//!
//! Reads try the cache, then the store. When the store is unavailable the answer is computed
//! live against RPC and is not cached.

use super::{Source, SyncCoordinator, SyncError};
use crate::store::cache::{get_json, set_json};
use crate::store::{FlowRecord, RecordKind, Snapshot, StoreError, StreamKey, SyncWatermark};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// A value with where it came from and whether a sync was running when it was read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Served<T> {
	pub value: T,
	pub source: Source,
	pub sync_in_progress: bool,
}

pub struct TotalsReader {
	coordinator: Arc<SyncCoordinator>,
}

impl TotalsReader {
	pub fn new(coordinator: Arc<SyncCoordinator>) -> Self {
		Self { coordinator }
	}

	/// Wrap/unwrap totals and the height they cover.
	pub async fn totals(&self) -> Result<Served<SyncWatermark>, SyncError> {
		let stream = StreamKey::WrapUnwrap;
		let ttl = self.coordinator.config().cache.totals_ttl();
		self.serve("totals".to_string(), ttl, stream, async {
			let watermark = self.coordinator.store().get_watermark(stream).await?;
			Ok::<_, SyncError>(watermark.unwrap_or_else(|| SyncWatermark::genesis(stream)))
		})
		.await
		.or_else_live(|| async {
			let live = self.coordinator.compute_live().await?;
			Ok::<_, SyncError>(live.report.watermark)
		})
		.await
	}

	/// Records of `kind`, newest block first.
	pub async fn records(
		&self,
		kind: RecordKind,
		limit: usize,
		offset: usize,
	) -> Result<Served<Vec<FlowRecord>>, SyncError> {
		let key = format!("records:{}:{}:{}", kind, limit, offset);
		let ttl = self.coordinator.config().cache.records_ttl();
		self.serve(key, ttl, StreamKey::WrapUnwrap, async {
			let records = self
				.coordinator
				.store()
				.list_records(kind, limit, offset)
				.await?;
			Ok::<_, SyncError>(records)
		})
		.await
		.or_else_live(|| async {
			let live = self.coordinator.compute_live().await?;
			Ok::<_, SyncError>(live
				.records
				.into_iter()
				.filter(|record| record.kind == kind)
				.skip(offset)
				.take(limit)
				.collect::<Vec<_>>())
		})
		.await
	}

	/// Snapshots of `stream`, highest block first.
	pub async fn snapshots(
		&self,
		stream: StreamKey,
		limit: usize,
	) -> Result<Served<Vec<Snapshot>>, SyncError> {
		let key = format!("snapshots:{}:{}", stream, limit);
		let ttl = self.coordinator.config().cache.snapshots_ttl();
		self.serve(key, ttl, stream, async {
			let snapshots = self.coordinator.store().list_snapshots(stream, limit).await?;
			Ok::<_, SyncError>(snapshots)
		})
		.await
		.or_else_live(|| async {
			let snapshot = self.coordinator.live_snapshot(stream).await?;
			Ok::<_, SyncError>(snapshot.into_iter().take(limit).collect::<Vec<_>>())
		})
		.await
	}

	async fn serve<T, F>(
		&self,
		key: String,
		ttl: Duration,
		stream: StreamKey,
		load: F,
	) -> Pending<T>
	where
		T: Serialize + DeserializeOwned,
		F: Future<Output = Result<T, SyncError>>,
	{
		let sync_in_progress = self.sync_in_progress(stream).await;
		let cache = self.coordinator.cache().as_ref();

		if let Some(value) = get_json::<T>(cache, &key).await {
			debug!("Serving {} from cache", key);
			return Pending::Served(Served {
				value,
				source: Source::Cache,
				sync_in_progress,
			});
		}

		match load.await {
			Ok(value) => {
				set_json(cache, &key, &value, ttl).await;
				Pending::Served(Served {
					value,
					source: Source::Store,
					sync_in_progress,
				})
			}
			Err(SyncError::StoreError(StoreError::Unavailable(reason))) => {
				warn!("Store unavailable for {}, computing live: {}", key, reason);
				Pending::Live { sync_in_progress }
			}
			Err(e) => Pending::Failed(e),
		}
	}

	async fn sync_in_progress(&self, stream: StreamKey) -> bool {
		let key = match stream {
			StreamKey::Supply => StreamKey::WrapUnwrap,
			other => other,
		};
		match self.coordinator.leases().current(key.as_str()).await {
			Ok(lease) => lease.is_some(),
			Err(_) => false,
		}
	}
}

/// Outcome of the cache and store lookups.
enum Pending<T> {
	Served(Served<T>),
	Live { sync_in_progress: bool },
	Failed(SyncError),
}

impl<T> Pending<T> {
	async fn or_else_live<F, Fut>(self, compute: F) -> Result<Served<T>, SyncError>
	where
		F: FnOnce() -> Fut,
		Fut: Future<Output = Result<T, SyncError>>,
	{
		match self {
			Pending::Served(served) => Ok(served),
			Pending::Live { sync_in_progress } => Ok(Served {
				value: compute().await?,
				source: Source::Live,
				sync_in_progress,
			}),
			Pending::Failed(e) => Err(e),
		}
	}
}
