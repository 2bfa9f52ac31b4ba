//! Trace event model.
//!
//! The trace service returns a JSON list of events of the form
//! `{"event": "<kind>", "data": {...}}`. Only two kinds matter for wrap/unwrap accounting;
//! every other kind is kept as [`TraceEvent::Other`] so newer event types never fail a trace.
//!
//! ```json
//! {"event": "receive_intent", "data": {"incoming_alkanes": [{"id": "32:0", "value": "100000000"}]}}
//! {"event": "value_transfer", "data": {"transfers": [{"id": {"block": 32, "tx": 0}, "value": {"hi": 0, "lo": 25000000}, "to": "0:0"}]}}
//! ```

use crate::alkane::AlkaneId;
use crate::amount::Amount;
use crate::rpc::RpcError;
use serde_json::Value;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
	/// Alkanes entering the execution context.
	ReceiveIntent { incoming_transfers: Vec<Transfer> },
	/// Alkanes moved out of the execution context. `to` applies to transfers without their own
	/// destination.
	ValueTransfer {
		transfers: Vec<Transfer>,
		to: Option<AlkaneId>,
	},
	Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
	pub token_id: AlkaneId,
	pub amount: RawAmount,
	pub from: Option<AlkaneId>,
	pub to: Option<AlkaneId>,
}

/// An amount as found on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawAmount {
	Known(Amount),
	/// The encoding was not one of the supported shapes; carries the raw JSON.
	Unrecognized(String),
}

impl RawAmount {
	pub fn known(&self) -> Option<Amount> {
		match self {
			RawAmount::Known(amount) => Some(*amount),
			RawAmount::Unrecognized(_) => None,
		}
	}
}

impl From<Amount> for RawAmount {
	fn from(amount: Amount) -> Self {
		RawAmount::Known(amount)
	}
}

impl TraceEvent {
	pub fn from_value(value: &Value) -> TraceEvent {
		let kind = value
			.get("event")
			.and_then(Value::as_str)
			.unwrap_or_default();
		let data = value.get("data").unwrap_or(&Value::Null);

		match kind {
			"receive_intent" => TraceEvent::ReceiveIntent {
				incoming_transfers: parse_transfers(data.get("incoming_alkanes")),
			},
			"value_transfer" => TraceEvent::ValueTransfer {
				transfers: parse_transfers(data.get("transfers")),
				to: data.get("to").and_then(parse_alkane_id),
			},
			other => TraceEvent::Other(other.to_string()),
		}
	}
}

/// Parse a trace response. Null, empty and `0x` responses carry no events.
pub fn parse_trace(value: &Value) -> Result<Vec<TraceEvent>, RpcError> {
	match value {
		Value::Null => Ok(Vec::new()),
		Value::String(s) if s.is_empty() || s == "0x" => Ok(Vec::new()),
		Value::Array(events) => Ok(events.iter().map(TraceEvent::from_value).collect()),
		Value::Object(object) => match object.get("events") {
			Some(events) => parse_trace(events),
			None => Err(RpcError::Malformed(format!("trace object without events: {}", value))),
		},
		other => Err(RpcError::Malformed(format!("unexpected trace payload: {}", other))),
	}
}

fn parse_transfers(value: Option<&Value>) -> Vec<Transfer> {
	let Some(Value::Array(items)) = value else {
		return Vec::new();
	};

	items
		.iter()
		.filter_map(|item| {
			let Some(token_id) = item.get("id").and_then(parse_alkane_id) else {
				debug!("Skipping transfer without a usable alkane id: {}", item);
				return None;
			};

			Some(Transfer {
				token_id,
				amount: item
					.get("value")
					.map(parse_amount)
					.unwrap_or_else(|| RawAmount::Unrecognized("missing".to_string())),
				from: item.get("from").and_then(parse_alkane_id),
				to: item.get("to").and_then(parse_alkane_id),
			})
		})
		.collect()
}

/// Normalize any supported amount encoding.
pub fn parse_amount(value: &Value) -> RawAmount {
	let known = match value {
		Value::Number(number) => number.as_u64().map(Amount::from),
		Value::String(s) => Amount::parse_str(s),
		Value::Object(object) => match (object.get("hi"), object.get("lo")) {
			(Some(hi), Some(lo)) => parse_word(hi)
				.zip(parse_word(lo))
				.map(|(hi, lo)| Amount::from_parts(hi, lo)),
			_ => None,
		},
		_ => None,
	};

	match known {
		Some(amount) => RawAmount::Known(amount),
		None => RawAmount::Unrecognized(value.to_string()),
	}
}

fn parse_word(value: &Value) -> Option<u64> {
	match value {
		Value::Number(number) => number.as_u64(),
		Value::String(s) => Amount::parse_str(s).and_then(|amount| u64::try_from(amount.get()).ok()),
		_ => None,
	}
}

fn parse_alkane_id(value: &Value) -> Option<AlkaneId> {
	match value {
		Value::String(s) => s.parse().ok(),
		Value::Object(object) => {
			let block = parse_amount(object.get("block")?).known()?;
			let tx = parse_amount(object.get("tx")?).known()?;
			Some(AlkaneId::new(block.get(), tx.get()))
		}
		_ => None,
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use pretty_assertions::assert_eq;
	use serde_json::json;

	#[test]
	fn split_words_recombine() {
		assert_eq!(
			parse_amount(&json!({"hi": 1, "lo": 0})),
			RawAmount::Known(Amount::new(1u128 << 64))
		);
		assert_eq!(
			parse_amount(&json!({"hi": "0", "lo": "100000000"})),
			RawAmount::Known(Amount::new(100_000_000))
		);
	}

	#[test]
	fn plain_and_string_amounts() {
		assert_eq!(parse_amount(&json!(50_000_000)), Amount::new(50_000_000).into());
		assert_eq!(parse_amount(&json!("0x2faf080")), Amount::new(50_000_000).into());
	}

	#[test]
	fn unsupported_amounts_are_unrecognized() {
		assert!(matches!(parse_amount(&json!(-5)), RawAmount::Unrecognized(_)));
		assert!(matches!(parse_amount(&json!(1.5)), RawAmount::Unrecognized(_)));
		assert!(matches!(parse_amount(&json!({"lo": 1})), RawAmount::Unrecognized(_)));
		assert!(matches!(parse_amount(&json!([1, 2])), RawAmount::Unrecognized(_)));
	}

	#[test]
	fn parses_known_event_shapes() {
		let events = parse_trace(&json!([
			{"event": "invoke", "data": {}},
			{"event": "receive_intent", "data": {"incoming_alkanes": [
				{"id": {"block": "0x20", "tx": "0x0"}, "value": "100"}
			]}},
			{"event": "value_transfer", "data": {
				"to": "0:0",
				"transfers": [{"id": "32:0", "value": {"hi": 0, "lo": 40}}]
			}},
		]))
		.unwrap();

		assert_eq!(
			events,
			vec![
				TraceEvent::Other("invoke".to_string()),
				TraceEvent::ReceiveIntent {
					incoming_transfers: vec![Transfer {
						token_id: AlkaneId::new(32, 0),
						amount: Amount::new(100).into(),
						from: None,
						to: None,
					}],
				},
				TraceEvent::ValueTransfer {
					transfers: vec![Transfer {
						token_id: AlkaneId::new(32, 0),
						amount: Amount::new(40).into(),
						from: None,
						to: None,
					}],
					to: Some(AlkaneId::NULL),
				},
			]
		);
	}

	#[test]
	fn empty_responses_have_no_events() {
		assert!(parse_trace(&Value::Null).unwrap().is_empty());
		assert!(parse_trace(&json!("0x")).unwrap().is_empty());
		assert!(parse_trace(&json!("")).unwrap().is_empty());
		assert!(parse_trace(&json!([])).unwrap().is_empty());
		assert!(parse_trace(&json!({"events": []})).unwrap().is_empty());
	}

	#[test]
	fn garbage_is_malformed() {
		assert!(matches!(parse_trace(&json!("0xdeadbeef")), Err(RpcError::Malformed(_))));
		assert!(matches!(parse_trace(&json!(7)), Err(RpcError::Malformed(_))));
	}

	#[test]
	fn transfers_without_ids_are_dropped() {
		let event = TraceEvent::from_value(&json!({
			"event": "receive_intent",
			"data": {"incoming_alkanes": [{"value": 5}, {"id": "32:0"}]}
		}));
		assert_eq!(
			event,
			TraceEvent::ReceiveIntent {
				incoming_transfers: vec![Transfer {
					token_id: AlkaneId::new(32, 0),
					amount: RawAmount::Unrecognized("missing".to_string()),
					from: None,
					to: None,
				}],
			}
		);
	}
}
