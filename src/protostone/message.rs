use super::DecodeError;
use crate::alkane::AlkaneId;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};

pub(super) const BODY: u128 = 0;

/// Allocation of an amount of one alkane to an output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Edict {
	pub id: AlkaneId,
	pub amount: u128,
	pub output: u32,
}

/// A tag/value field list followed by an optional edict body.
///
/// Used both for the runestone itself and for the fields of each protostone.
pub(super) struct Message {
	pub fields: HashMap<u128, VecDeque<u128>>,
	pub edicts: Vec<Edict>,
}

impl Message {
	pub fn from_integers(integers: &[u128]) -> Result<Self, DecodeError> {
		let mut fields = HashMap::<u128, VecDeque<u128>>::new();
		let mut edicts = Vec::new();

		let mut i = 0;
		while i < integers.len() {
			let tag = integers[i];

			if tag == BODY {
				let body = &integers[i + 1..];
				if body.len() % 4 != 0 {
					return Err(DecodeError::TrailingIntegers(body.len() % 4));
				}

				let mut id = AlkaneId::default();
				for chunk in body.chunks_exact(4) {
					id = id.next(chunk[0], chunk[1]).ok_or(DecodeError::EdictId)?;
					let output =
						u32::try_from(chunk[3]).map_err(|_| DecodeError::EdictOutput(chunk[3]))?;
					edicts.push(Edict {
						id,
						amount: chunk[2],
						output,
					});
				}
				break;
			}

			let Some(&value) = integers.get(i + 1) else {
				return Err(DecodeError::TruncatedField(tag));
			};

			fields.entry(tag).or_default().push_back(value);
			i += 2;
		}

		Ok(Self { fields, edicts })
	}

	pub fn take_first(&mut self, tag: u128) -> Option<u128> {
		self.fields.get_mut(&tag).and_then(VecDeque::pop_front)
	}

	pub fn take_all(&mut self, tag: u128) -> Vec<u128> {
		self.fields
			.remove(&tag)
			.map(Vec::from)
			.unwrap_or_default()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn fields_then_body() {
		let mut message =
			Message::from_integers(&[91, 2, 81, 7, 81, 8, BODY, 2, 1, 500, 0, 0, 1, 20, 1])
				.unwrap();

		assert_eq!(message.take_first(91), Some(2));
		assert_eq!(message.take_all(81), vec![7, 8]);
		assert_eq!(
			message.edicts,
			vec![
				Edict {
					id: AlkaneId::new(2, 1),
					amount: 500,
					output: 0,
				},
				Edict {
					id: AlkaneId::new(2, 2),
					amount: 20,
					output: 1,
				},
			]
		);
	}

	#[test]
	fn truncated_field_is_an_error() {
		assert!(matches!(
			Message::from_integers(&[91, 2, 93]),
			Err(DecodeError::TruncatedField(93))
		));
	}

	#[test]
	fn partial_edict_is_an_error() {
		assert!(matches!(
			Message::from_integers(&[BODY, 2, 1, 500]),
			Err(DecodeError::TrailingIntegers(3))
		));
	}
}
