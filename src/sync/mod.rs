//! Sync coordination: leases, the incremental run loop, progress and events, and the read path.

/// Incremental run loop with live fallback and reset
pub mod coordinator;
/// Event system for sync runs
pub mod events;
/// Leases shared through a data directory
pub mod file_lease;
/// Run leases
pub mod lease;
/// Progress tracking for sync runs
pub mod progress_tracker;
/// Cache-first read path
pub mod reader;
mod types;

pub use coordinator::{LiveComputation, SyncCoordinator};
pub use events::{EventDispatcher, LoggingEventHandler, SyncEvent, SyncEventHandler};
pub use file_lease::FileLeaseService;
pub use lease::{FULL_SYNC_LEASE, Lease, LeaseError, LeaseService, LeaseWait, MemoryLeaseService};
pub use progress_tracker::{SyncProgressTracker, SyncStats};
pub use reader::{Served, TotalsReader};
pub use types::*;
