//! frBTC wrap/unwrap indexer.
//!
//! Scans the transaction history of the frBTC signer address, decodes the protostones embedded in
//! each transaction, fetches their execution traces and classifies mints and burns of the tracked
//! token. Results are persisted incrementally behind a per-stream watermark and served through a
//! cache-first read path.

/// Alkane identifiers
pub mod alkane;
/// 128-bit token amounts
pub mod amount;
pub mod config;
/// Virtual outpoint resolution
pub mod outpoint;
/// Runestone protostone decoding
pub mod protostone;
pub mod rpc;
pub mod store;
pub mod sync;
/// Trace events, fetching and classification
pub mod trace;
/// Formatting helpers
pub mod utils;

#[cfg(test)]
mod test_support;
