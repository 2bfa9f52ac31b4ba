//! Unsigned 128-bit token amounts.
//!
//! Trace payloads carry amounts either as plain integers, as decimal or `0x` hex strings, or
//! split into two 64-bit words. All of them normalize to [`Amount`].

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Amount(u128);

impl Amount {
	pub const ZERO: Amount = Amount(0);

	pub const fn new(value: u128) -> Self {
		Self(value)
	}

	/// Recombine a value split into high and low 64-bit words.
	pub const fn from_parts(hi: u64, lo: u64) -> Self {
		Self(((hi as u128) << 64) | lo as u128)
	}

	pub const fn get(self) -> u128 {
		self.0
	}

	pub const fn is_zero(self) -> bool {
		self.0 == 0
	}

	pub fn saturating_add(self, other: Amount) -> Amount {
		Amount(self.0.saturating_add(other.0))
	}

	pub fn saturating_sub(self, other: Amount) -> Amount {
		Amount(self.0.saturating_sub(other.0))
	}

	/// Parse a decimal or `0x`-prefixed hex string.
	pub fn parse_str(s: &str) -> Option<Self> {
		let s = s.trim();
		let value = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
			Some("") => 0,
			Some(hex) => u128::from_str_radix(hex, 16).ok()?,
			None => s.parse::<u128>().ok()?,
		};
		Some(Self(value))
	}
}

impl From<u64> for Amount {
	fn from(value: u64) -> Self {
		Self(value.into())
	}
}

impl From<u128> for Amount {
	fn from(value: u128) -> Self {
		Self(value)
	}
}

impl fmt::Display for Amount {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

// Decimal strings keep the full 128-bit range intact through JSON consumers.
impl Serialize for Amount {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.collect_str(&self.0)
	}
}

impl<'de> Deserialize<'de> for Amount {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		struct AmountVisitor;

		impl Visitor<'_> for AmountVisitor {
			type Value = Amount;

			fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
				f.write_str("an unsigned integer or a decimal/hex string")
			}

			fn visit_u64<E: de::Error>(self, value: u64) -> Result<Amount, E> {
				Ok(Amount::from(value))
			}

			fn visit_u128<E: de::Error>(self, value: u128) -> Result<Amount, E> {
				Ok(Amount(value))
			}

			fn visit_str<E: de::Error>(self, value: &str) -> Result<Amount, E> {
				Amount::parse_str(value)
					.ok_or_else(|| E::custom(format!("invalid amount `{}`", value)))
			}
		}

		deserializer.deserialize_any(AmountVisitor)
	}
}
