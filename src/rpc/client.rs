//!
//! JSON-RPC client for an alkanes-enabled indexer.
//!
//! The endpoint multiplexes esplora lookups (`esplora_*`), trace calls (`alkanes_*`) and the
//! indexer tip (`metashrew_height`) behind one JSON-RPC 2.0 URL.

use super::types::{EsploraAddress, EsploraTransaction};
use super::{CandidateTransaction, ChainRpc, RpcError, TraceBundle};
use crate::outpoint::VirtualOutpoint;
use crate::trace::{self, TraceEvent};
use bitcoin::Txid;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

pub struct AlkanesRpcClient {
	/// The underlying HTTP client.
	http_client: Client,
	/// The JSON-RPC endpoint.
	rpc_url: String,
	request_id: AtomicU64,
}

#[derive(Debug, Deserialize)]
struct RawTraceBundle {
	txid: Txid,
	vout: u32,
	#[serde(default, alias = "trace")]
	events: Value,
}

impl AlkanesRpcClient {
	/// Create a new client for the JSON-RPC endpoint at `rpc_url`.
	pub fn new(rpc_url: String) -> Result<Self, RpcError> {
		let http_client = Client::builder().timeout(Duration::from_secs(30)).build()?;

		Ok(Self {
			http_client,
			rpc_url,
			request_id: AtomicU64::new(1),
		})
	}

	/// Execute a JSON-RPC call and return its `result`.
	///
	/// A missing or null `result` is returned as [`Value::Null`].
	pub async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
		debug!("RPC {} {}", method, params);
		let request_body = json!({
			"jsonrpc": "2.0",
			"id": self.request_id.fetch_add(1, Ordering::Relaxed),
			"method": method,
			"params": params,
		});

		let response = self
			.http_client
			.post(&self.rpc_url)
			.header("Content-Type", "application/json")
			.json(&request_body)
			.send()
			.await?;

		if !response.status().is_success() {
			return Err(RpcError::Malformed(format!(
				"HTTP error: {}",
				response.status()
			)));
		}

		let mut response_json: Value = response.json().await?;

		if let Some(error) = response_json.get("error").filter(|error| !error.is_null()) {
			return Err(RpcError::Rpc {
				code: error.get("code").and_then(Value::as_i64).unwrap_or_default(),
				message: error
					.get("message")
					.and_then(Value::as_str)
					.map(str::to_string)
					.unwrap_or_else(|| error.to_string()),
			});
		}

		Ok(response_json
			.get_mut("result")
			.map(Value::take)
			.unwrap_or(Value::Null))
	}

	async fn call_as<T: serde::de::DeserializeOwned>(
		&self,
		method: &str,
		params: Value,
	) -> Result<T, RpcError> {
		match self.call(method, params).await? {
			Value::Null => Err(RpcError::NoData),
			result => Ok(serde_json::from_value(result)?),
		}
	}
}

fn parse_height(value: &Value) -> Result<u64, RpcError> {
	match value {
		Value::Number(number) => number.as_u64(),
		Value::String(s) => s.trim().parse().ok(),
		_ => None,
	}
	.ok_or_else(|| RpcError::Malformed(format!("unexpected height: {}", value)))
}

/// Split a block trace into bundles. A bundle whose events cannot be parsed keeps its error.
fn parse_block_trace(result: Value) -> Result<Vec<TraceBundle>, RpcError> {
	let bundles: Vec<RawTraceBundle> = match result {
		Value::Null => Vec::new(),
		result => serde_json::from_value(result)?,
	};

	Ok(bundles
		.into_iter()
		.map(|bundle| TraceBundle {
			events: trace::parse_trace(&bundle.events).map_err(|e| e.to_string()),
			txid: bundle.txid,
			vout: bundle.vout,
		})
		.collect())
}

#[async_trait::async_trait]
impl ChainRpc for AlkanesRpcClient {
	async fn get_address_transactions(
		&self,
		address: &str,
		cursor: Option<&Txid>,
	) -> Result<Vec<CandidateTransaction>, RpcError> {
		let params = match cursor {
			Some(txid) => json!([address, txid.to_string()]),
			None => json!([address]),
		};

		let page: Vec<EsploraTransaction> = match self.call("esplora_address::txs:chain", params).await? {
			Value::Null => Vec::new(),
			result => serde_json::from_value(result)?,
		};

		page.into_iter().map(CandidateTransaction::try_from).collect()
	}

	async fn get_raw_transaction(&self, txid: &Txid) -> Result<Vec<u8>, RpcError> {
		let raw: String = self
			.call_as("esplora_tx::hex", json!([txid.to_string()]))
			.await?;
		Ok(hex::decode(raw.trim())?)
	}

	async fn trace_outpoint(&self, outpoint: &VirtualOutpoint) -> Result<Vec<TraceEvent>, RpcError> {
		let result = self
			.call(
				"alkanes_trace",
				json!([{"txid": outpoint.txid.to_string(), "vout": outpoint.output_index}]),
			)
			.await?;
		trace::parse_trace(&result)
	}

	async fn trace_block(&self, height: u64) -> Result<Vec<TraceBundle>, RpcError> {
		let result = self.call("alkanes_traceblock", json!([height])).await?;
		parse_block_trace(result)
	}

	async fn get_chain_height(&self) -> Result<u64, RpcError> {
		match self.call("metashrew_height", json!([])).await? {
			Value::Null => Err(RpcError::NoData),
			result => parse_height(&result),
		}
	}

	async fn get_address_balance(&self, address: &str) -> Result<u64, RpcError> {
		let info: EsploraAddress = self.call_as("esplora_address", json!([address])).await?;
		Ok(info
			.chain_stats
			.funded_txo_sum
			.saturating_sub(info.chain_stats.spent_txo_sum))
	}
}
