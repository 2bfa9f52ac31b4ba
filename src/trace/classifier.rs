//! Wrap/unwrap classification of trace events.
//!
//! A wrap is the tracked token entering the execution context through a `ReceiveIntent`. An
//! unwrap is a `ValueTransfer` of the tracked token to the null alkane. Every qualifying
//! transfer in a trace yields one record; transfers whose amount cannot be read become review
//! items instead.

use super::{RawAmount, TraceEvent, Transfer};
use crate::alkane::AlkaneId;
use crate::outpoint::VirtualOutpoint;
use crate::rpc::CandidateTransaction;
use crate::store::{FlowRecord, RecordKind};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
	/// Token whose wraps and unwraps are recorded.
	pub tracked_token: AlkaneId,
	/// Destination that marks a transfer as a burn.
	pub null_id: AlkaneId,
	/// Only count incoming transfers without a non-null origin as mints.
	pub require_null_origin: bool,
}

impl Default for ClassifierConfig {
	fn default() -> Self {
		Self {
			tracked_token: AlkaneId::new(32, 0),
			null_id: AlkaneId::NULL,
			require_null_origin: false,
		}
	}
}

/// What the classifier knows about the trace beyond its events.
pub struct ClassificationContext<'a> {
	pub candidate: &'a CandidateTransaction,
	pub outpoint: VirtualOutpoint,
	/// Pointer output of the protostone that was traced.
	pub pointer: Option<u32>,
	pub tracked_address: &'a str,
}

impl ClassificationContext<'_> {
	fn block_height(&self) -> u64 {
		self.candidate.block_height.unwrap_or_default()
	}

	fn sender(&self) -> Option<String> {
		self.candidate.input_addresses.iter().flatten().next().cloned()
	}

	fn recipient(&self) -> Option<String> {
		let pointed = self
			.pointer
			.and_then(|pointer| self.candidate.output_addresses.get(pointer as usize))
			.cloned()
			.flatten();

		pointed.or_else(|| {
			self.candidate
				.output_addresses
				.iter()
				.flatten()
				.find(|address| address.as_str() != self.tracked_address)
				.cloned()
		})
	}
}

/// A qualifying transfer whose amount encoding was not recognized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReviewItem {
	pub outpoint: VirtualOutpoint,
	pub block_height: u64,
	pub kind: RecordKind,
	pub raw_amount: String,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct Classification {
	pub records: Vec<FlowRecord>,
	pub review: Vec<ReviewItem>,
}

pub struct Classifier {
	config: ClassifierConfig,
}

impl Classifier {
	pub fn new(config: ClassifierConfig) -> Self {
		Self { config }
	}

	pub fn classify(&self, ctx: &ClassificationContext<'_>, events: &[TraceEvent]) -> Classification {
		let mut classification = Classification::default();

		for event in events {
			match event {
				TraceEvent::ReceiveIntent { incoming_transfers } => {
					for transfer in incoming_transfers {
						if self.is_mint(transfer) {
							self.emit(ctx, RecordKind::Wrap, &transfer.amount, &mut classification);
						}
					}
				}
				TraceEvent::ValueTransfer { transfers, to } => {
					for transfer in transfers {
						if self.is_burn(transfer, *to) {
							self.emit(ctx, RecordKind::Unwrap, &transfer.amount, &mut classification);
						}
					}
				}
				TraceEvent::Other(_) => {}
			}
		}

		classification
	}

	fn is_mint(&self, transfer: &Transfer) -> bool {
		if transfer.token_id != self.config.tracked_token {
			return false;
		}
		!self.config.require_null_origin
			|| transfer
				.from
				.is_none_or(|from| from == self.config.null_id)
	}

	fn is_burn(&self, transfer: &Transfer, event_to: Option<AlkaneId>) -> bool {
		transfer.token_id == self.config.tracked_token
			&& transfer.to.or(event_to) == Some(self.config.null_id)
	}

	fn emit(
		&self,
		ctx: &ClassificationContext<'_>,
		kind: RecordKind,
		amount: &RawAmount,
		classification: &mut Classification,
	) {
		let amount = match amount {
			RawAmount::Known(amount) if amount.is_zero() => return,
			RawAmount::Known(amount) => *amount,
			RawAmount::Unrecognized(raw) => {
				warn!(
					"Unrecognized {} amount at {}: {}",
					kind, ctx.outpoint, raw
				);
				classification.review.push(ReviewItem {
					outpoint: ctx.outpoint,
					block_height: ctx.block_height(),
					kind,
					raw_amount: raw.clone(),
				});
				return;
			}
		};

		let counterparty_address = match kind {
			RecordKind::Wrap => ctx.sender(),
			RecordKind::Unwrap => ctx.recipient(),
		};

		classification.records.push(FlowRecord {
			kind,
			txid: ctx.outpoint.txid,
			output_index: ctx.outpoint.output_index,
			sequence: classification.records.len() as u32,
			amount,
			block_height: ctx.block_height(),
			counterparty_address,
			timestamp: ctx.candidate.block_time.unwrap_or_else(Utc::now),
		});
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::amount::Amount;
	use crate::test_support::{
		TRACKED_ADDRESS, burn_transfer, candidate, receive_intent, txid, value_transfer,
	};
	use pretty_assertions::assert_eq;

	fn context(candidate: &CandidateTransaction, pointer: Option<u32>) -> ClassificationContext<'_> {
		ClassificationContext {
			candidate,
			outpoint: VirtualOutpoint {
				txid: candidate.txid,
				output_index: candidate.raw_outputs_count + 1,
			},
			pointer,
			tracked_address: TRACKED_ADDRESS,
		}
	}

	#[test]
	fn receive_intent_is_a_wrap() {
		let tx = candidate(txid(1), 3, 100);
		let classification = Classifier::new(ClassifierConfig::default())
			.classify(&context(&tx, None), &[receive_intent(50_000_000)]);

		assert!(classification.review.is_empty());
		assert_eq!(classification.records.len(), 1);
		let record = &classification.records[0];
		assert_eq!(record.kind, RecordKind::Wrap);
		assert_eq!(record.amount, Amount::new(50_000_000));
		assert_eq!(record.output_index, 4);
		assert_eq!(record.block_height, 100);
		assert_eq!(record.counterparty_address.as_deref(), Some("bc1qsender"));
	}

	#[test]
	fn transfer_to_null_is_an_unwrap() {
		let tx = candidate(txid(2), 2, 101);
		let classification = Classifier::new(ClassifierConfig::default())
			.classify(&context(&tx, None), &[value_transfer(25_000_000)]);

		assert_eq!(classification.records.len(), 1);
		let record = &classification.records[0];
		assert_eq!(record.kind, RecordKind::Unwrap);
		assert_eq!(record.amount, Amount::new(25_000_000));
		// first output that is not the tracked address
		assert_eq!(record.counterparty_address.as_deref(), Some("bc1qrecipient"));
	}

	#[test]
	fn pointer_output_is_the_unwrap_recipient() {
		let mut tx = candidate(txid(3), 3, 102);
		tx.output_addresses[2] = Some("bc1qpointed".to_string());
		let classification = Classifier::new(ClassifierConfig::default())
			.classify(&context(&tx, Some(2)), &[value_transfer(1)]);

		assert_eq!(
			classification.records[0].counterparty_address.as_deref(),
			Some("bc1qpointed")
		);
	}

	#[test]
	fn every_qualifying_event_is_emitted() {
		let tx = candidate(txid(4), 3, 103);
		let classification = Classifier::new(ClassifierConfig::default()).classify(
			&context(&tx, None),
			&[
				receive_intent(10),
				TraceEvent::Other("invoke".to_string()),
				receive_intent(20),
				value_transfer(5),
			],
		);

		let summary: Vec<_> = classification
			.records
			.iter()
			.map(|record| (record.kind, record.amount.get(), record.sequence))
			.collect();
		assert_eq!(
			summary,
			vec![
				(RecordKind::Wrap, 10, 0),
				(RecordKind::Wrap, 20, 1),
				(RecordKind::Unwrap, 5, 2),
			]
		);
	}

	#[test]
	fn ignores_other_tokens_zero_amounts_and_live_destinations() {
		let tx = candidate(txid(5), 3, 104);
		let other_token = TraceEvent::ReceiveIntent {
			incoming_transfers: vec![Transfer {
				token_id: AlkaneId::new(2, 1),
				amount: Amount::new(10).into(),
				from: None,
				to: None,
			}],
		};
		let no_destination = TraceEvent::ValueTransfer {
			transfers: vec![Transfer {
				to: None,
				..burn_transfer(10)
			}],
			to: None,
		};
		let mut not_null = burn_transfer(10);
		not_null.to = Some(AlkaneId::new(2, 0));

		let classification = Classifier::new(ClassifierConfig::default()).classify(
			&context(&tx, None),
			&[
				other_token,
				receive_intent(0),
				TraceEvent::ValueTransfer {
					transfers: vec![Transfer {
						to: None,
						..burn_transfer(10)
					}],
					to: Some(AlkaneId::new(4, 4)),
				},
				no_destination,
				TraceEvent::ValueTransfer {
					transfers: vec![not_null],
					to: Some(AlkaneId::NULL),
				},
			],
		);

		assert_eq!(classification, Classification::default());
	}

	#[test]
	fn event_level_destination_applies_to_bare_transfers() {
		let tx = candidate(txid(6), 3, 105);
		let event = TraceEvent::ValueTransfer {
			transfers: vec![Transfer {
				to: None,
				..burn_transfer(9)
			}],
			to: Some(AlkaneId::NULL),
		};

		let classification =
			Classifier::new(ClassifierConfig::default()).classify(&context(&tx, None), &[event]);
		assert_eq!(classification.records.len(), 1);
	}

	#[test]
	fn unrecognized_amounts_go_to_review() {
		let tx = candidate(txid(7), 3, 106);
		let event = TraceEvent::ReceiveIntent {
			incoming_transfers: vec![Transfer {
				token_id: AlkaneId::new(32, 0),
				amount: RawAmount::Unrecognized("-1".to_string()),
				from: None,
				to: None,
			}],
		};

		let classification =
			Classifier::new(ClassifierConfig::default()).classify(&context(&tx, None), &[event]);

		assert!(classification.records.is_empty());
		assert_eq!(
			classification.review,
			vec![ReviewItem {
				outpoint: context(&tx, None).outpoint,
				block_height: 106,
				kind: RecordKind::Wrap,
				raw_amount: "-1".to_string(),
			}]
		);
	}

	#[test]
	fn null_origin_requirement() {
		let tx = candidate(txid(8), 3, 107);
		let from_contract = TraceEvent::ReceiveIntent {
			incoming_transfers: vec![Transfer {
				token_id: AlkaneId::new(32, 0),
				amount: Amount::new(10).into(),
				from: Some(AlkaneId::new(2, 3)),
				to: None,
			}],
		};

		let lenient = Classifier::new(ClassifierConfig::default());
		let strict = Classifier::new(ClassifierConfig {
			require_null_origin: true,
			..ClassifierConfig::default()
		});

		assert_eq!(
			lenient
				.classify(&context(&tx, None), &[from_contract.clone()])
				.records
				.len(),
			1
		);
		assert!(
			strict
				.classify(&context(&tx, None), &[from_contract])
				.records
				.is_empty()
		);
		assert_eq!(
			strict
				.classify(&context(&tx, None), &[receive_intent(10)])
				.records
				.len(),
			1
		);
	}

	#[test]
	fn tracked_token_is_configurable() {
		let tx = candidate(txid(9), 3, 108);
		let classifier = Classifier::new(ClassifierConfig {
			tracked_token: AlkaneId::new(2, 1),
			..ClassifierConfig::default()
		});

		assert!(
			classifier
				.classify(&context(&tx, None), &[receive_intent(10)])
				.records
				.is_empty()
		);
	}
}
