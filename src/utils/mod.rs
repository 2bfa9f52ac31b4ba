//! Formatting helpers.

/// Decimal places of frBTC, matching BTC.
pub const FRBTC_DECIMALS: u32 = 8;

/// Render a base-unit amount with `decimals` fractional digits, without going through floats.
pub fn format_token_amount(amount: u128, decimals: u32) -> String {
	if decimals == 0 {
		return amount.to_string();
	}
	let digits = format!("{:0>width$}", amount, width = decimals as usize + 1);
	let (whole, fraction) = digits.split_at(digits.len() - decimals as usize);
	format!("{}.{}", whole, fraction)
}
