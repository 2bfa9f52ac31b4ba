//! Progress tracking for sync runs.
//!
//! The tracker counts what a run scanned, decoded, traced and detected, and logs progress as the
//! scan moves through the chain.

use serde::Serialize;
use std::collections::HashSet;
use tracing::info;

/// Service for tracking synchronization progress
#[derive(Debug, Clone)]
pub struct SyncProgressTracker {
	/// Watermark the run started from
	start_height: u64,
	/// The highest block height we've processed
	highest_processed_height: u64,
	/// Track if we've seen any candidate transactions
	has_processed_data: bool,
	/// Distinct block heights with candidate transactions
	processed_heights: HashSet<u64>,
	transactions_scanned: usize,
	protostones_decoded: usize,
	traces_fetched: usize,
	records_detected: usize,
	/// Last height at which we logged progress
	last_logged_height: u64,
}

impl SyncProgressTracker {
	/// Create a new progress tracker starting from the given height.
	pub fn new(start_height: u64) -> Self {
		Self {
			start_height,
			highest_processed_height: start_height,
			has_processed_data: false,
			processed_heights: HashSet::new(),
			transactions_scanned: 0,
			protostones_decoded: 0,
			traces_fetched: 0,
			records_detected: 0,
			last_logged_height: start_height,
		}
	}

	/// Record a scanned candidate transaction at the given height
	pub fn record_transaction(&mut self, height: u64) {
		self.highest_processed_height = self.highest_processed_height.max(height);
		self.has_processed_data = true;
		self.processed_heights.insert(height);
		self.transactions_scanned += 1;
	}

	pub fn record_protostones(&mut self, count: usize) {
		self.protostones_decoded += count;
	}

	pub fn record_traces(&mut self, count: usize) {
		self.traces_fetched += count;
	}

	pub fn record_detections(&mut self, count: usize) {
		self.records_detected += count;
	}

	/// Log progress every 1000 blocks or when forced
	pub fn log_progress(&mut self, force: bool) {
		let blocks_since_last_log = self
			.highest_processed_height
			.saturating_sub(self.last_logged_height);
		let should_log = force || blocks_since_last_log >= 1000;

		if should_log && self.has_processed_data {
			info!(
				"Sync progress: {} transactions, {} protostones decoded up to height {}",
				self.transactions_scanned, self.protostones_decoded, self.highest_processed_height
			);
			self.last_logged_height = self.highest_processed_height;
		}
	}

	/// Get sync statistics as a SyncStats struct
	pub fn get_stats(&self) -> SyncStats {
		SyncStats {
			start_height: self.start_height,
			highest_processed_height: self.highest_processed_height,
			blocks_with_candidates: self.processed_heights.len(),
			transactions_scanned: self.transactions_scanned,
			protostones_decoded: self.protostones_decoded,
			traces_fetched: self.traces_fetched,
			records_detected: self.records_detected,
		}
	}
}

/// Statistics about one sync run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
	pub start_height: u64,
	pub highest_processed_height: u64,
	pub blocks_with_candidates: usize,
	pub transactions_scanned: usize,
	pub protostones_decoded: usize,
	pub traces_fetched: usize,
	pub records_detected: usize,
}

impl SyncStats {
	/// Get a human-readable summary of the sync statistics
	pub fn summary(&self) -> String {
		format!(
			"Sync from {} to {}: {} transactions in {} blocks, {} protostones, {} traces, {} records",
			self.start_height,
			self.highest_processed_height,
			self.transactions_scanned,
			self.blocks_with_candidates,
			self.protostones_decoded,
			self.traces_fetched,
			self.records_detected
		)
	}
}
