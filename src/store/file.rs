//! File-backed aggregation store.
//!
//! The whole store is a single JSON document in the data directory. Every mutation rewrites
//! the document through a temporary file and a rename, so a crash leaves either the old or
//! the new document in place. I/O failures surface as [`StoreError::Unavailable`], which lets
//! callers fall back to live computation.
//!
//! Processes sharing the directory serialize their access through a lock file created with
//! `create_new`. A lock file older than [`STALE_LOCK`] is left over from a crashed process and
//! is broken.

use super::state::StoreState;
use super::{
	AggregationStore, FlowRecord, RecordKind, RecordTotals, Snapshot, StoreError, StreamKey,
	SyncWatermark,
};
use backoff::ExponentialBackoffBuilder;
use backoff::future::retry;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const STORE_FILENAME: &str = "aggregation_store.json";
const LOCK_FILENAME: &str = "aggregation_store.lock";
const LOCK_WAIT: Duration = Duration::from_secs(10);
const STALE_LOCK: Duration = Duration::from_secs(60);

/// Holds the store lock file until dropped.
struct DocumentLock {
	path: PathBuf,
}

impl Drop for DocumentLock {
	fn drop(&mut self) {
		if let Err(e) = std::fs::remove_file(&self.path) {
			warn!("Failed to remove store lock {:?}: {}", self.path, e);
		}
	}
}

async fn lock_is_stale(path: &Path) -> bool {
	tokio::fs::metadata(path)
		.await
		.and_then(|metadata| metadata.modified())
		.ok()
		.and_then(|modified| modified.elapsed().ok())
		.is_some_and(|age| age > STALE_LOCK)
}

pub struct FileStore {
	data_dir: PathBuf,
	// in-process half of the document lock
	lock: Mutex<()>,
}

impl FileStore {
	pub fn new(data_dir: PathBuf) -> Self {
		Self {
			data_dir,
			lock: Mutex::new(()),
		}
	}

	fn store_filename(&self) -> PathBuf {
		self.data_dir.join(STORE_FILENAME)
	}

	/// Take the lock file shared with other processes using this directory.
	async fn lock_document(&self) -> Result<DocumentLock, StoreError> {
		let path = self.data_dir.join(LOCK_FILENAME);
		let backoff = ExponentialBackoffBuilder::new()
			.with_initial_interval(Duration::from_millis(5))
			.with_max_interval(Duration::from_millis(200))
			.with_max_elapsed_time(Some(LOCK_WAIT))
			.build();

		retry(backoff, || async {
			let created = tokio::fs::OpenOptions::new()
				.write(true)
				.create_new(true)
				.open(&path)
				.await;
			match created {
				Ok(_) => Ok(DocumentLock { path: path.clone() }),
				Err(e) if e.kind() == ErrorKind::AlreadyExists => {
					if lock_is_stale(&path).await {
						warn!("Breaking stale store lock {:?}", path);
						if let Err(e) = tokio::fs::remove_file(&path).await {
							debug!("Failed to remove stale store lock {:?}: {}", path, e);
						}
					}
					Err(backoff::Error::transient(StoreError::Unavailable(format!(
						"Store {:?} is locked by another process",
						self.data_dir
					))))
				}
				Err(e) if e.kind() == ErrorKind::NotFound => {
					Err(backoff::Error::permanent(StoreError::Unavailable(format!(
						"Data directory {:?} does not exist",
						self.data_dir
					))))
				}
				Err(e) => Err(backoff::Error::permanent(StoreError::Unavailable(format!(
					"Failed to lock store {:?}: {}",
					path, e
				)))),
			}
		})
		.await
	}

	async fn load(&self) -> Result<StoreState, StoreError> {
		let filename = self.store_filename();

		let content = match tokio::fs::read_to_string(&filename).await {
			Ok(content) => content,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
				if !tokio::fs::try_exists(&self.data_dir).await.unwrap_or(false) {
					return Err(StoreError::Unavailable(format!(
						"Data directory {:?} does not exist",
						self.data_dir
					)));
				}
				debug!("No store document at {:?}, starting empty", filename);
				return Ok(StoreState::default());
			}
			Err(e) => {
				return Err(StoreError::Unavailable(format!(
					"Failed to read store file {:?}: {}",
					filename, e
				)));
			}
		};

		let mut state: StoreState = serde_json::from_str(&content).map_err(|e| {
			StoreError::Corrupt(format!("Failed to parse store file {:?}: {}", filename, e))
		})?;
		state.reindex();

		Ok(state)
	}

	async fn save(&self, state: &StoreState) -> Result<(), StoreError> {
		let filename = self.store_filename();
		let temp_filename = filename.with_extension("json.tmp");

		let content = serde_json::to_string_pretty(state)
			.map_err(|e| StoreError::Corrupt(format!("Failed to serialize store: {}", e)))?;

		tokio::fs::write(&temp_filename, content)
			.await
			.map_err(|e| {
				StoreError::Unavailable(format!(
					"Failed to write store file {:?}: {}",
					temp_filename, e
				))
			})?;
		tokio::fs::rename(&temp_filename, &filename)
			.await
			.map_err(|e| {
				StoreError::Unavailable(format!(
					"Failed to replace store file {:?}: {}",
					filename, e
				))
			})?;

		Ok(())
	}

	async fn read<T>(&self, f: impl FnOnce(&StoreState) -> T) -> Result<T, StoreError> {
		let _guard = self.lock.lock().await;
		let _document = self.lock_document().await?;
		let state = self.load().await?;
		Ok(f(&state))
	}

	async fn update<T>(&self, f: impl FnOnce(&mut StoreState) -> T) -> Result<T, StoreError> {
		let _guard = self.lock.lock().await;
		let _document = self.lock_document().await?;
		let mut state = self.load().await?;
		let result = f(&mut state);
		self.save(&state).await?;
		Ok(result)
	}
}

#[async_trait::async_trait]
impl AggregationStore for FileStore {
	async fn get_watermark(&self, stream: StreamKey) -> Result<Option<SyncWatermark>, StoreError> {
		self.read(|state| state.watermark(stream)).await
	}

	async fn upsert_watermark(&self, watermark: &SyncWatermark) -> Result<(), StoreError> {
		self.update(|state| state.upsert_watermark(watermark)).await?;
		info!(
			"Saved {} watermark at height {}",
			watermark.stream, watermark.last_block_height
		);
		Ok(())
	}

	async fn append_records(
		&self,
		kind: RecordKind,
		records: &[FlowRecord],
	) -> Result<Vec<FlowRecord>, StoreError> {
		let inserted = self
			.update(|state| state.append_records(kind, records))
			.await?;
		debug!(
			"Appended {} of {} {} records",
			inserted.len(),
			records.len(),
			kind
		);
		Ok(inserted)
	}

	async fn list_records(
		&self,
		kind: RecordKind,
		limit: usize,
		offset: usize,
	) -> Result<Vec<FlowRecord>, StoreError> {
		self.read(|state| state.list_records(kind, limit, offset))
			.await
	}

	async fn count_records(&self, kind: RecordKind) -> Result<u64, StoreError> {
		self.read(|state| state.count_records(kind)).await
	}

	async fn record_totals(&self, kind: RecordKind) -> Result<RecordTotals, StoreError> {
		self.read(|state| state.record_totals(kind)).await
	}

	async fn delete_all(&self, stream: StreamKey) -> Result<u64, StoreError> {
		let deleted = self.update(|state| state.delete_all(stream)).await?;
		info!("Deleted {} entries of stream {}", deleted, stream);
		Ok(deleted)
	}

	async fn append_snapshot(&self, snapshot: &Snapshot) -> Result<bool, StoreError> {
		self.update(|state| state.append_snapshot(snapshot)).await
	}

	async fn list_snapshots(
		&self,
		stream: StreamKey,
		limit: usize,
	) -> Result<Vec<Snapshot>, StoreError> {
		self.read(|state| state.list_snapshots(stream, limit)).await
	}
}
