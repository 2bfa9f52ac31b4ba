//! Protostone decoding.
//!
//! Protostones are sub-operations carried inside the protocol field (tag `16383`) of a
//! runestone, the `OP_RETURN OP_13 <pushes...>` output of a Bitcoin transaction. Each protocol
//! value packs 15 bytes of a second varint stream, which is itself a list of
//! `[protocol tag, field count, fields...]` groups, one group per protostone.
//!
//! Decoding is pure. A transaction without a runestone, or a runestone without a protocol
//! field, carries zero protostones.

mod message;
pub mod varint;

pub use message::Edict;

use bitcoin::opcodes;
use bitcoin::script::{Instruction, Script};
use bitcoin::Transaction;
use message::Message;
use serde::Serialize;

/// The runestone protocol identifier following `OP_RETURN`.
pub const MAGIC_NUMBER: opcodes::Opcode = opcodes::all::OP_PUSHNUM_13;

/// Runestone tag holding the protostone stream.
pub const PROTOCOL_TAG: u128 = 16383;

/// Bytes of protostone payload carried by each protocol or message integer.
const BYTES_PER_INTEGER: usize = 15;

mod tag {
	pub const MESSAGE: u128 = 81;
	pub const BURN: u128 = 83;
	pub const POINTER: u128 = 91;
	pub const REFUND: u128 = 93;
	pub const FROM: u128 = 95;
	pub const CENOTAPH: u128 = 126;
}

/// One decoded sub-operation of a transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Protostone {
	/// Position of this protostone within the transaction's protocol field.
	pub index: usize,
	pub protocol_tag: u128,
	pub edicts: Vec<Edict>,
	pub pointer: Option<u32>,
	pub refund: Option<u32>,
	pub from: Option<u32>,
	pub burn: Option<u128>,
	pub cenotaph: bool,
	#[serde(with = "hex_bytes")]
	pub message: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
	#[error("failed to deserialize transaction: {0}")]
	Transaction(String),
	#[error("runestone payload contains a non-push opcode")]
	Opcode,
	#[error("runestone script is invalid")]
	InvalidScript,
	#[error("varint error: {0}")]
	Varint(#[from] varint::Error),
	#[error("field with tag {0} has no value")]
	TruncatedField(u128),
	#[error("edict body has {0} trailing integers")]
	TrailingIntegers(usize),
	#[error("edict alkane id overflows")]
	EdictId,
	#[error("edict output {0} is out of range")]
	EdictOutput(u128),
	#[error("protostone {index} declares {declared} fields but only {available} remain")]
	TruncatedProtostone {
		index: usize,
		declared: u128,
		available: usize,
	},
}

/// Decode the protostones of a consensus-encoded transaction.
pub fn decode_raw_transaction(raw: &[u8]) -> Result<Vec<Protostone>, DecodeError> {
	let transaction: Transaction = bitcoin::consensus::deserialize(raw)
		.map_err(|e| DecodeError::Transaction(e.to_string()))?;
	decode_transaction(&transaction)
}

/// Decode the protostones of the first runestone output of `transaction`.
pub fn decode_transaction(transaction: &Transaction) -> Result<Vec<Protostone>, DecodeError> {
	transaction
		.output
		.iter()
		.find(|output| is_runestone(&output.script_pubkey))
		.map(|output| decode_script(&output.script_pubkey))
		.unwrap_or_else(|| Ok(Vec::new()))
}

/// Whether `script` starts with the runestone marker.
pub fn is_runestone(script: &Script) -> bool {
	let mut instructions = script.instructions();
	instructions.next() == Some(Ok(Instruction::Op(opcodes::all::OP_RETURN)))
		&& instructions.next() == Some(Ok(Instruction::Op(MAGIC_NUMBER)))
}

/// Decode the protostones carried by a single output script.
pub fn decode_script(script: &Script) -> Result<Vec<Protostone>, DecodeError> {
	let Some(payload) = payload(script)? else {
		return Ok(Vec::new());
	};

	let integers = varint::decode_all(&payload)?;
	let mut runestone = Message::from_integers(&integers)?;
	let protocol = runestone.take_all(PROTOCOL_TAG);

	if protocol.is_empty() {
		return Ok(Vec::new());
	}

	decode_protocol(&protocol)
}

fn payload(script: &Script) -> Result<Option<Vec<u8>>, DecodeError> {
	if !is_runestone(script) {
		return Ok(None);
	}

	// concatenate every data push after the marker
	let mut payload = Vec::new();
	for result in script.instructions().skip(2) {
		match result {
			Ok(Instruction::PushBytes(push)) => payload.extend_from_slice(push.as_bytes()),
			Ok(Instruction::Op(_)) => return Err(DecodeError::Opcode),
			Err(_) => return Err(DecodeError::InvalidScript),
		}
	}

	Ok(Some(payload))
}

fn join_integers(values: &[u128]) -> Vec<u8> {
	values
		.iter()
		.flat_map(|value| value.to_le_bytes().into_iter().take(BYTES_PER_INTEGER))
		.collect()
}

fn decode_protocol(values: &[u128]) -> Result<Vec<Protostone>, DecodeError> {
	// padding in the last packed integer decodes as zero varints, which end the stream
	let stream = varint::decode_all(&join_integers(values))?;

	let mut protostones = Vec::new();
	let mut i = 0;
	while i < stream.len() {
		let protocol_tag = stream[i];
		if protocol_tag == 0 {
			break;
		}

		let index = protostones.len();
		let declared = stream.get(i + 1).copied().unwrap_or_default();
		let start = i + 2;
		let available = stream.len().saturating_sub(start);
		let end = usize::try_from(declared)
			.ok()
			.and_then(|length| start.checked_add(length))
			.filter(|end| *end <= stream.len())
			.ok_or(DecodeError::TruncatedProtostone {
				index,
				declared,
				available,
			})?;

		protostones.push(Protostone::from_fields(index, protocol_tag, &stream[start..end])?);
		i = end;
	}

	Ok(protostones)
}

impl Protostone {
	fn from_fields(index: usize, protocol_tag: u128, fields: &[u128]) -> Result<Self, DecodeError> {
		let mut message = Message::from_integers(fields)?;

		let mut bytes = join_integers(&message.take_all(tag::MESSAGE));
		while bytes.last() == Some(&0) {
			bytes.pop();
		}

		Ok(Self {
			index,
			protocol_tag,
			pointer: message
				.take_first(tag::POINTER)
				.and_then(|pointer| u32::try_from(pointer).ok()),
			refund: message
				.take_first(tag::REFUND)
				.and_then(|refund| u32::try_from(refund).ok()),
			from: message
				.take_first(tag::FROM)
				.and_then(|from| u32::try_from(from).ok()),
			burn: message.take_first(tag::BURN),
			cenotaph: message.take_first(tag::CENOTAPH).is_some(),
			message: bytes,
			edicts: message.edicts,
		})
	}
}

mod hex_bytes {
	use serde::Serializer;

	pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&hex::encode(bytes))
	}
}

/// Encoder used to build fixtures.
#[cfg(test)]
pub(crate) mod encode {
	use super::*;
	use bitcoin::script::{self, PushBytes};
	use bitcoin::ScriptBuf;

	fn pack(chunk: &[u8]) -> u128 {
		let mut buffer = [0u8; 16];
		buffer[..chunk.len()].copy_from_slice(chunk);
		u128::from_le_bytes(buffer)
	}

	fn fields(protostone: &Protostone) -> Vec<u128> {
		let mut fields = Vec::new();
		if let Some(burn) = protostone.burn {
			fields.extend([tag::BURN, burn]);
		}
		if let Some(pointer) = protostone.pointer {
			fields.extend([tag::POINTER, pointer.into()]);
		}
		if let Some(refund) = protostone.refund {
			fields.extend([tag::REFUND, refund.into()]);
		}
		if let Some(from) = protostone.from {
			fields.extend([tag::FROM, from.into()]);
		}
		for chunk in protostone.message.chunks(BYTES_PER_INTEGER) {
			fields.extend([tag::MESSAGE, pack(chunk)]);
		}
		if !protostone.edicts.is_empty() {
			fields.push(message::BODY);
			let mut edicts = protostone.edicts.clone();
			edicts.sort_by_key(|edict| edict.id);
			let mut previous = crate::alkane::AlkaneId::default();
			for edict in edicts {
				let block = edict.id.block - previous.block;
				let tx = if block == 0 {
					edict.id.tx - previous.tx
				} else {
					edict.id.tx
				};
				fields.extend([block, tx, edict.amount, edict.output.into()]);
				previous = edict.id;
			}
		}
		fields
	}

	/// Runestone script carrying `protostones` in its protocol field.
	pub(crate) fn script(protostones: &[Protostone]) -> ScriptBuf {
		let mut stream = Vec::new();
		for protostone in protostones {
			let fields = fields(protostone);
			varint::encode_to_vec(protostone.protocol_tag, &mut stream);
			varint::encode_to_vec(fields.len() as u128, &mut stream);
			for field in fields {
				varint::encode_to_vec(field, &mut stream);
			}
		}

		let mut payload = Vec::new();
		for chunk in stream.chunks(BYTES_PER_INTEGER) {
			varint::encode_to_vec(PROTOCOL_TAG, &mut payload);
			varint::encode_to_vec(pack(chunk), &mut payload);
		}

		runestone_script(&payload)
	}

	pub(crate) fn runestone_script(payload: &[u8]) -> ScriptBuf {
		let push: &PushBytes = payload.try_into().unwrap();
		script::Builder::new()
			.push_opcode(opcodes::all::OP_RETURN)
			.push_opcode(MAGIC_NUMBER)
			.push_slice(push)
			.into_script()
	}

	/// A minimal protostone calling into alkane `2:0` with the given opcode.
	pub(crate) fn call(opcode: u8) -> Protostone {
		Protostone {
			protocol_tag: 1,
			pointer: Some(0),
			refund: Some(0),
			message: vec![2, 0, opcode],
			..Protostone::default()
		}
	}
}
