use crate::protostone;
use crate::trace::TraceEvent;
use bitcoin::{ScriptBuf, Txid};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A confirmed or unconfirmed transaction touching the tracked address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CandidateTransaction {
	pub txid: Txid,
	/// Number of real outputs, including any `OP_RETURN`.
	pub raw_outputs_count: u32,
	/// `None` while unconfirmed.
	pub block_height: Option<u64>,
	pub block_time: Option<DateTime<Utc>>,
	pub input_addresses: Vec<Option<String>>,
	pub output_addresses: Vec<Option<String>>,
	/// First runestone output script, if the transaction carries one.
	pub aux_payload: Option<ScriptBuf>,
}

impl CandidateTransaction {
	pub fn is_confirmed(&self) -> bool {
		self.block_height.is_some()
	}
}

/// Trace of one virtual outpoint, as returned by a block trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceBundle {
	pub txid: Txid,
	pub vout: u32,
	/// Parsed events, or why this bundle's trace could not be parsed.
	pub events: Result<Vec<TraceEvent>, String>,
}

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
	#[error("HTTP error: {0}")]
	HttpError(#[from] reqwest::Error),

	#[error("JSON parse error: {0}")]
	JsonError(#[from] serde_json::Error),

	#[error("Hex decode error: {0}")]
	HexError(#[from] hex::FromHexError),

	#[error("RPC error {code}: {message}")]
	Rpc { code: i64, message: String },

	#[error("No data returned")]
	NoData,

	#[error("Malformed response: {0}")]
	Malformed(String),
}

// Esplora wire shapes. Only the fields the indexer reads are modelled.

#[derive(Debug, Deserialize)]
pub(super) struct EsploraTransaction {
	pub txid: Txid,
	#[serde(default)]
	pub vin: Vec<EsploraInput>,
	#[serde(default)]
	pub vout: Vec<EsploraOutput>,
	#[serde(default)]
	pub status: EsploraStatus,
}

#[derive(Debug, Deserialize)]
pub(super) struct EsploraInput {
	pub prevout: Option<EsploraOutput>,
}

#[derive(Debug, Deserialize)]
pub(super) struct EsploraOutput {
	#[serde(default)]
	pub scriptpubkey: String,
	pub scriptpubkey_address: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct EsploraStatus {
	#[serde(default)]
	pub confirmed: bool,
	pub block_height: Option<u64>,
	pub block_time: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub(super) struct EsploraAddress {
	pub chain_stats: EsploraAddressStats,
}

#[derive(Debug, Deserialize)]
pub(super) struct EsploraAddressStats {
	pub funded_txo_sum: u64,
	pub spent_txo_sum: u64,
}

impl TryFrom<EsploraTransaction> for CandidateTransaction {
	type Error = RpcError;

	fn try_from(tx: EsploraTransaction) -> Result<Self, Self::Error> {
		let raw_outputs_count = u32::try_from(tx.vout.len())
			.map_err(|_| RpcError::Malformed(format!("{} has too many outputs", tx.txid)))?;

		let mut aux_payload = None;
		for output in &tx.vout {
			let script = ScriptBuf::from_bytes(hex::decode(&output.scriptpubkey)?);
			if protostone::is_runestone(&script) {
				aux_payload = Some(script);
				break;
			}
		}

		let block_height = if tx.status.confirmed {
			tx.status.block_height
		} else {
			None
		};

		Ok(CandidateTransaction {
			txid: tx.txid,
			raw_outputs_count,
			block_height,
			block_time: tx
				.status
				.block_time
				.and_then(|time| DateTime::from_timestamp(time, 0)),
			input_addresses: tx
				.vin
				.into_iter()
				.map(|input| input.prevout.and_then(|prevout| prevout.scriptpubkey_address))
				.collect(),
			output_addresses: tx
				.vout
				.into_iter()
				.map(|output| output.scriptpubkey_address)
				.collect(),
			aux_payload,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::protostone::encode;
	use serde_json::json;

	#[test]
	fn esplora_transaction_to_candidate() {
		let runestone = encode::script(&[encode::call(77)]);
		let tx: EsploraTransaction = serde_json::from_value(json!({
			"txid": "1111111111111111111111111111111111111111111111111111111111111111",
			"vin": [
				{"prevout": {"scriptpubkey": "0014aa", "scriptpubkey_address": "bc1qsender"}},
				{"prevout": null}
			],
			"vout": [
				{"scriptpubkey": "0014bb", "scriptpubkey_address": "bc1qsubfrost"},
				{"scriptpubkey": hex::encode(runestone.as_bytes())},
				{"scriptpubkey": "0014cc", "scriptpubkey_address": "bc1qchange"}
			],
			"status": {"confirmed": true, "block_height": 880001, "block_time": 1700000000}
		}))
		.unwrap();

		let candidate = CandidateTransaction::try_from(tx).unwrap();
		assert_eq!(candidate.raw_outputs_count, 3);
		assert_eq!(candidate.block_height, Some(880001));
		assert_eq!(
			candidate.input_addresses,
			vec![Some("bc1qsender".to_string()), None]
		);
		assert_eq!(candidate.output_addresses[1], None);
		assert_eq!(candidate.aux_payload, Some(runestone));
		assert_eq!(
			candidate.block_time.map(|time| time.timestamp()),
			Some(1_700_000_000)
		);
	}

	#[test]
	fn unconfirmed_transactions_have_no_height() {
		let tx: EsploraTransaction = serde_json::from_value(json!({
			"txid": "2222222222222222222222222222222222222222222222222222222222222222",
			"vout": [{"scriptpubkey": "6a"}],
			"status": {"confirmed": false, "block_height": 5}
		}))
		.unwrap();

		let candidate = CandidateTransaction::try_from(tx).unwrap();
		assert!(!candidate.is_confirmed());
		// a bare OP_RETURN is not a runestone
		assert_eq!(candidate.aux_payload, None);
	}

	#[test]
	fn bad_script_hex_is_rejected() {
		let tx: EsploraTransaction = serde_json::from_value(json!({
			"txid": "3333333333333333333333333333333333333333333333333333333333333333",
			"vout": [{"scriptpubkey": "zz"}]
		}))
		.unwrap();

		assert!(matches!(
			CandidateTransaction::try_from(tx),
			Err(RpcError::HexError(_))
		));
	}
}
