//! Parallel trace fetching with per-item error isolation.
//!
//! A fetch never fails as a whole. Each requested outpoint ends up either in
//! [`FetchReport::traces`] or in [`FetchReport::failures`].

use super::TraceEvent;
use crate::outpoint::VirtualOutpoint;
use crate::rpc::{ChainRpc, TraceBundle};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

/// A virtual outpoint to trace, with the height of its transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceRequest {
	pub outpoint: VirtualOutpoint,
	pub block_height: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedTrace {
	pub request: TraceRequest,
	pub events: Vec<TraceEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraceFailure {
	pub outpoint: VirtualOutpoint,
	pub block_height: u64,
	pub error: String,
}

#[derive(Debug, Default)]
pub struct FetchReport {
	pub traces: Vec<FetchedTrace>,
	pub failures: Vec<TraceFailure>,
}

/// Trait for different trace fetching strategies
#[async_trait::async_trait]
pub trait TraceStrategy: Send + Sync {
	/// Fetch traces for every request, concurrently.
	async fn fetch(&self, rpc: &dyn ChainRpc, requests: &[TraceRequest]) -> FetchReport;

	/// Get the name of this strategy
	fn name(&self) -> &'static str;
}

/// One `trace_outpoint` call per request.
pub struct OutpointTraceStrategy;

#[async_trait::async_trait]
impl TraceStrategy for OutpointTraceStrategy {
	async fn fetch(&self, rpc: &dyn ChainRpc, requests: &[TraceRequest]) -> FetchReport {
		let results = join_all(requests.iter().map(|request| async move {
			(request, rpc.trace_outpoint(&request.outpoint).await)
		}))
		.await;

		let mut report = FetchReport::default();
		for (request, result) in results {
			match result {
				Ok(events) => {
					debug!("Traced {}: {} events", request.outpoint, events.len());
					report.traces.push(FetchedTrace {
						request: *request,
						events,
					});
				}
				Err(e) => {
					warn!("Failed to trace {}: {}", request.outpoint, e);
					report.failures.push(TraceFailure {
						outpoint: request.outpoint,
						block_height: request.block_height,
						error: e.to_string(),
					});
				}
			}
		}
		report
	}

	fn name(&self) -> &'static str {
		"outpoint"
	}
}

/// One `trace_block` call per distinct height, matched back to the requested outpoints.
///
/// A failed block fails every request in it. A bundle whose trace could not be parsed fails
/// only its own request. A requested outpoint missing from a successful block trace has no
/// events.
pub struct BlockTraceStrategy;

#[async_trait::async_trait]
impl TraceStrategy for BlockTraceStrategy {
	async fn fetch(&self, rpc: &dyn ChainRpc, requests: &[TraceRequest]) -> FetchReport {
		let heights: BTreeSet<u64> = requests
			.iter()
			.map(|request| request.block_height)
			.collect();

		let blocks: HashMap<u64, Result<Vec<TraceBundle>, String>> =
			join_all(heights.into_iter().map(|height| async move {
				let result = rpc.trace_block(height).await.map_err(|e| {
					warn!("Failed to trace block {}: {}", height, e);
					e.to_string()
				});
				(height, result)
			}))
			.await
			.into_iter()
			.collect();

		let mut report = FetchReport::default();
		for request in requests {
			match blocks.get(&request.block_height) {
				Some(Ok(bundles)) => {
					let bundle = bundles.iter().find(|bundle| {
						bundle.txid == request.outpoint.txid
							&& bundle.vout == request.outpoint.output_index
					});
					match bundle.map(|bundle| &bundle.events) {
						Some(Err(error)) => {
							warn!("Unreadable trace of {}: {}", request.outpoint, error);
							report.failures.push(TraceFailure {
								outpoint: request.outpoint,
								block_height: request.block_height,
								error: error.clone(),
							});
						}
						found => report.traces.push(FetchedTrace {
							request: *request,
							events: found
								.and_then(|events| events.as_ref().ok())
								.cloned()
								.unwrap_or_default(),
						}),
					}
				}
				Some(Err(error)) => report.failures.push(TraceFailure {
					outpoint: request.outpoint,
					block_height: request.block_height,
					error: error.clone(),
				}),
				None => report.failures.push(TraceFailure {
					outpoint: request.outpoint,
					block_height: request.block_height,
					error: "block was not traced".to_string(),
				}),
			}
		}
		report
	}

	fn name(&self) -> &'static str {
		"block"
	}
}

/// Configured trace strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceMode {
	/// Block traces for a scan from genesis, outpoint traces for incremental runs.
	#[default]
	Auto,
	Outpoint,
	Block,
}

impl TraceMode {
	pub fn strategy(self, from_genesis: bool) -> Box<dyn TraceStrategy> {
		match self {
			TraceMode::Outpoint => Box::new(OutpointTraceStrategy),
			TraceMode::Block => Box::new(BlockTraceStrategy),
			TraceMode::Auto if from_genesis => Box::new(BlockTraceStrategy),
			TraceMode::Auto => Box::new(OutpointTraceStrategy),
		}
	}
}

impl fmt::Display for TraceMode {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.write_str(match self {
			TraceMode::Auto => "auto",
			TraceMode::Outpoint => "outpoint",
			TraceMode::Block => "block",
		})
	}
}

impl FromStr for TraceMode {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"auto" => Ok(TraceMode::Auto),
			"outpoint" => Ok(TraceMode::Outpoint),
			"block" => Ok(TraceMode::Block),
			_ => Err(format!("unknown trace mode `{}`", s)),
		}
	}
}
