//! Virtual outpoint resolution.
//!
//! Protostones do not own real outputs. The trace service addresses the `i`-th protostone of
//! a transaction with `n` real outputs as output `n + 1 + i`.

use bitcoin::Txid;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VirtualOutpoint {
	pub txid: Txid,
	pub output_index: u32,
}

impl fmt::Display for VirtualOutpoint {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{}:{}", self.txid, self.output_index)
	}
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
	#[error("virtual output for protostone {index} of {txid} ({outputs} outputs) overflows u32")]
	Overflow {
		txid: Txid,
		outputs: u32,
		index: usize,
	},
}

/// Resolve the virtual outpoint of protostone `protostone_index`.
pub fn resolve(
	txid: Txid,
	raw_outputs_count: u32,
	protostone_index: usize,
) -> Result<VirtualOutpoint, ResolveError> {
	let output_index = u32::try_from(protostone_index)
		.ok()
		.and_then(|index| raw_outputs_count.checked_add(1)?.checked_add(index))
		.ok_or(ResolveError::Overflow {
			txid,
			outputs: raw_outputs_count,
			index: protostone_index,
		})?;

	Ok(VirtualOutpoint { txid, output_index })
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::test_support::txid;

	#[test]
	fn three_outputs_two_protostones() {
		let outpoints: Vec<VirtualOutpoint> = (0..2)
			.map(|index| resolve(txid(1), 3, index).unwrap())
			.collect();
		assert_eq!(
			outpoints
				.iter()
				.map(|outpoint| outpoint.output_index)
				.collect::<Vec<_>>(),
			vec![4, 5]
		);
		assert!(outpoints.iter().all(|outpoint| outpoint.txid == txid(1)));
	}

	#[test]
	fn first_protostone_skips_one_past_the_real_outputs() {
		assert_eq!(resolve(txid(2), 0, 0).unwrap().output_index, 1);
		assert_eq!(resolve(txid(2), 2, 0).unwrap().output_index, 3);
	}

	#[test]
	fn overflow_is_rejected() {
		assert!(matches!(
			resolve(txid(4), u32::MAX, 0),
			Err(ResolveError::Overflow { .. })
		));
		assert!(resolve(txid(4), u32::MAX - 2, 1).is_ok());
		assert!(resolve(txid(4), 0, usize::MAX).is_err());
	}

	#[test]
	fn display_is_txid_colon_vout() {
		let outpoint = resolve(txid(5), 3, 0).unwrap();
		assert_eq!(outpoint.to_string(), format!("{}:4", txid(5)));
	}
}
