//! LEB128 varints over `u128`.

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
	#[error("varint is longer than 19 bytes")]
	Overlong,
	#[error("varint overflows u128")]
	Overflow,
	#[error("varint is unterminated")]
	Unterminated,
}

pub fn encode_to_vec(mut n: u128, v: &mut Vec<u8>) {
	while n >> 7 > 0 {
		v.push(n.to_le_bytes()[0] | 0b1000_0000);
		n >>= 7;
	}
	v.push(n.to_le_bytes()[0]);
}

pub fn encode(n: u128) -> Vec<u8> {
	let mut v = Vec::new();
	encode_to_vec(n, &mut v);
	v
}

/// Decode one varint, returning the value and the number of bytes consumed.
pub fn decode(buffer: &[u8]) -> Result<(u128, usize), Error> {
	let mut n = 0u128;

	for (i, &byte) in buffer.iter().enumerate() {
		if i > 18 {
			return Err(Error::Overlong);
		}

		let value = u128::from(byte) & 0b0111_1111;

		if i == 18 && value & 0b0111_1100 != 0 {
			return Err(Error::Overflow);
		}

		n |= value << (7 * i);

		if byte & 0b1000_0000 == 0 {
			return Ok((n, i + 1));
		}
	}

	Err(Error::Unterminated)
}

/// Decode a buffer consisting entirely of varints.
pub fn decode_all(buffer: &[u8]) -> Result<Vec<u128>, Error> {
	let mut integers = Vec::new();
	let mut i = 0;

	while i < buffer.len() {
		let (integer, length) = decode(&buffer[i..])?;
		integers.push(integer);
		i += length;
	}

	Ok(integers)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn small_values_are_single_bytes() {
		assert_eq!(encode(0), [0x00]);
		assert_eq!(encode(127), [0x7f]);
		assert_eq!(encode(128), [0x80, 0x01]);
		assert_eq!(decode(&[0x80, 0x01]), Ok((128, 2)));
	}

	#[test]
	fn max_value_decodes() {
		let encoded = encode(u128::MAX);
		assert_eq!(encoded.len(), 19);
		assert_eq!(decode(&encoded), Ok((u128::MAX, 19)));
	}

	#[test]
	fn rejects_malformed_input() {
		assert_eq!(decode(&[0x80]), Err(Error::Unterminated));
		assert_eq!(decode(&[0x80; 20]), Err(Error::Overlong));

		let mut overflow = vec![0xff; 18];
		overflow.push(0x7f);
		assert_eq!(decode(&overflow), Err(Error::Overflow));
	}

	#[test]
	fn decodes_sequences() {
		let mut buffer = Vec::new();
		for n in [1u128, 300, 16383, 0] {
			encode_to_vec(n, &mut buffer);
		}
		assert_eq!(decode_all(&buffer), Ok(vec![1, 300, 16383, 0]));
	}
}
