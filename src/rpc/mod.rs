//! Chain and trace RPC surface.
//!
//! The indexer consumes chain data through [`ChainRpc`]. [`AlkanesRpcClient`] implements it
//! against a JSON-RPC endpoint exposing esplora lookups and alkanes traces.

mod client;
mod types;

pub use client::AlkanesRpcClient;
pub use types::*;

use crate::outpoint::VirtualOutpoint;
use crate::protostone::{self, DecodeError, Protostone};
use crate::trace::TraceEvent;
use bitcoin::Txid;

#[async_trait::async_trait]
pub trait ChainRpc: Send + Sync {
	/// One page of the address's transaction history, newest first.
	///
	/// `cursor` is the last txid of the previous page.
	async fn get_address_transactions(
		&self,
		address: &str,
		cursor: Option<&Txid>,
	) -> Result<Vec<CandidateTransaction>, RpcError>;

	/// Consensus-serialized transaction bytes.
	async fn get_raw_transaction(&self, txid: &Txid) -> Result<Vec<u8>, RpcError>;

	fn decode_embedded_message(&self, raw_transaction: &[u8]) -> Result<Vec<Protostone>, DecodeError> {
		protostone::decode_raw_transaction(raw_transaction)
	}

	async fn trace_outpoint(&self, outpoint: &VirtualOutpoint) -> Result<Vec<TraceEvent>, RpcError>;

	/// Traces of every protostone executed in the block.
	async fn trace_block(&self, height: u64) -> Result<Vec<TraceBundle>, RpcError>;

	/// Height of the latest block the trace service has indexed.
	async fn get_chain_height(&self) -> Result<u64, RpcError>;

	/// Confirmed balance of `address` in satoshis.
	async fn get_address_balance(&self, address: &str) -> Result<u64, RpcError>;
}
