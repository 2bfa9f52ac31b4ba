//! Event system for sync runs.
//!
//! The coordinator emits events as a run decodes transactions, fetches traces and detects
//! records. Registered handlers receive every event, which keeps logging, metrics or alerting
//! out of the pipeline itself.

use super::SyncError;
use crate::store::{FlowRecord, StreamKey};
use crate::trace::{ReviewItem, TraceFailure};
use bitcoin::Txid;
use tracing::{debug, error, info, warn};

/// Events that occur during a sync run
pub enum SyncEvent {
	/// A run took its lease and is scanning from `from_height`
	RunStarted { stream: StreamKey, from_height: u64 },
	/// Protostones were found in a candidate transaction
	ProtostonesDecoded {
		txid: Txid,
		block_height: u64,
		count: usize,
	},
	/// A candidate could not be decoded and was skipped
	DecodeFailed { txid: Txid, error: String },
	/// A trace could not be fetched and will be retried next run
	TraceFailed(TraceFailure),
	/// A wrap or unwrap was detected
	RecordDetected(FlowRecord),
	/// A qualifying transfer needs manual review
	ReviewFlagged(ReviewItem),
	/// A run persisted its results
	SyncCompleted {
		stream: StreamKey,
		last_block_height: u64,
	},
	/// A run failed
	SyncError { stream: StreamKey, error: String },
}

/// Trait for handling sync events.
#[async_trait::async_trait]
pub trait SyncEventHandler: Send + Sync {
	/// Handle a sync event.
	async fn handle(&mut self, event: &SyncEvent) -> Result<(), SyncError>;

	/// Get the name of this handler for logging and diagnostics.
	fn name(&self) -> &'static str;
}

/// Event dispatcher that manages multiple event handlers.
#[derive(Default)]
pub struct EventDispatcher {
	handlers: Vec<Box<dyn SyncEventHandler>>,
}

impl EventDispatcher {
	/// Create a new, empty event dispatcher.
	pub fn new() -> Self {
		Self {
			handlers: Vec::new(),
		}
	}

	/// Register a new event handler.
	///
	/// Handlers are called in the order they are registered.
	pub fn register_handler(&mut self, handler: Box<dyn SyncEventHandler>) {
		self.handlers.push(handler);
	}

	/// Dispatch an event to all registered handlers.
	///
	/// Errors from handlers are logged, but do not stop other handlers from running.
	pub async fn dispatch(&mut self, event: &SyncEvent) {
		for handler in &mut self.handlers {
			if let Err(e) = handler.handle(event).await {
				error!("Handler {} failed to process event: {}", handler.name(), e);
			}
		}
	}
}

/// Writes every event to the log.
pub struct LoggingEventHandler;

#[async_trait::async_trait]
impl SyncEventHandler for LoggingEventHandler {
	async fn handle(&mut self, event: &SyncEvent) -> Result<(), SyncError> {
		match event {
			SyncEvent::RunStarted {
				stream,
				from_height,
			} => info!("Syncing {} from height {}", stream, from_height),
			SyncEvent::ProtostonesDecoded {
				txid,
				block_height,
				count,
			} => debug!(
				"Decoded {} protostones in {} at height {}",
				count, txid, block_height
			),
			SyncEvent::DecodeFailed { txid, error } => {
				warn!("Skipping {}: {}", txid, error)
			}
			SyncEvent::TraceFailed(failure) => warn!(
				"Trace of {} at height {} failed: {}",
				failure.outpoint, failure.block_height, failure.error
			),
			SyncEvent::RecordDetected(record) => info!(
				"Detected {} of {} at {}:{} (height {})",
				record.kind, record.amount, record.txid, record.output_index, record.block_height
			),
			SyncEvent::ReviewFlagged(item) => warn!(
				"{} at {} needs review, amount {}",
				item.kind, item.outpoint, item.raw_amount
			),
			SyncEvent::SyncCompleted {
				stream,
				last_block_height,
			} => info!("Synced {} to height {}", stream, last_block_height),
			SyncEvent::SyncError { stream, error } => error!("Sync of {} failed: {}", stream, error),
		}
		Ok(())
	}

	fn name(&self) -> &'static str {
		"logging"
	}
}
