//! Alkane identifiers.
//!
//! An alkane is addressed by the `(block, tx)` pair of its creation. The pair `0:0` is reserved
//! and means "no holder"; transfers routed to it are burns.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Identifier of an alkane token or contract.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AlkaneId {
	pub block: u128,
	pub tx: u128,
}

impl AlkaneId {
	/// The sentinel identifier meaning "no holder".
	pub const NULL: AlkaneId = AlkaneId::new(0, 0);

	pub const fn new(block: u128, tx: u128) -> Self {
		Self { block, tx }
	}

	/// Apply a delta-encoded `(block, tx)` step, as used by edicts.
	///
	/// A non-zero block delta resets the tx component; a zero block delta is relative to the
	/// current tx.
	pub fn next(self, block: u128, tx: u128) -> Option<Self> {
		Some(Self {
			block: self.block.checked_add(block)?,
			tx: if block == 0 {
				self.tx.checked_add(tx)?
			} else {
				tx
			},
		})
	}
}

impl fmt::Display for AlkaneId {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{}:{}", self.block, self.tx)
	}
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid alkane id `{0}`, expected `<block>:<tx>`")]
pub struct ParseAlkaneIdError(String);

impl FromStr for AlkaneId {
	type Err = ParseAlkaneIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let (block, tx) = s
			.split_once(':')
			.ok_or_else(|| ParseAlkaneIdError(s.to_string()))?;

		Ok(Self {
			block: block
				.trim()
				.parse()
				.map_err(|_| ParseAlkaneIdError(s.to_string()))?,
			tx: tx
				.trim()
				.parse()
				.map_err(|_| ParseAlkaneIdError(s.to_string()))?,
		})
	}
}

impl Serialize for AlkaneId {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.collect_str(self)
	}
}

impl<'de> Deserialize<'de> for AlkaneId {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let s = String::deserialize(deserializer)?;
		s.parse().map_err(serde::de::Error::custom)
	}
}
