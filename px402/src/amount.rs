//! Conversion between atomic token units and human-readable decimals.
//!
//! Payment protocols disagree on amount encoding: the atomic-unit protocol
//! carries pure-integer strings in the token's smallest unit, while the
//! decimal fallback protocol carries human decimal strings. Everything
//! inside the proxy normalizes to [`Decimal`] in human units.

use alloy_primitives::U256;
use rust_decimal::Decimal;

/// Errors from amount parsing and conversion.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AmountError {
    /// The input was expected to be a pure integer in atomic units.
    ///
    /// A decimal point, sign, or any non-digit character is a format
    /// violation, not something to round away.
    #[error("'{0}' is not a valid atomic amount (expected a pure integer string)")]
    NotAtomic(String),

    /// The input could not be parsed as a decimal amount.
    #[error("'{0}' is not a valid decimal amount")]
    NotDecimal(String),

    /// The amount does not fit the target representation.
    #[error("amount '{0}' is out of range")]
    OutOfRange(String),
}

/// Parses an atomic-unit integer string into a human-decimal amount.
///
/// `"1000000"` at 6 decimals yields `1.0`. The input must be a pure
/// unsigned integer: `"1.5"` or `"-3"` are rejected with
/// [`AmountError::NotAtomic`].
///
/// # Errors
///
/// Returns [`AmountError`] on any format violation or overflow.
pub fn atomic_to_decimal(atomic: &str, decimals: u8) -> Result<Decimal, AmountError> {
    if atomic.is_empty() || !atomic.bytes().all(|b| b.is_ascii_digit()) {
        return Err(AmountError::NotAtomic(atomic.to_owned()));
    }
    let units: i128 = atomic
        .parse()
        .map_err(|_| AmountError::OutOfRange(atomic.to_owned()))?;
    Decimal::try_from_i128_with_scale(units, u32::from(decimals))
        .map_err(|_| AmountError::OutOfRange(atomic.to_owned()))
}

/// Converts a human-decimal amount into atomic units.
///
/// # Errors
///
/// Returns [`AmountError::OutOfRange`] if the amount is negative or has
/// more fractional digits than the token supports.
pub fn decimal_to_atomic(amount: Decimal, decimals: u8) -> Result<U256, AmountError> {
    if amount.is_sign_negative() {
        return Err(AmountError::OutOfRange(amount.to_string()));
    }
    let mut scaled = amount;
    scaled.rescale(u32::from(decimals));
    if scaled.normalize() != amount.normalize() {
        // Rescaling truncated fractional digits the token cannot represent.
        return Err(AmountError::OutOfRange(amount.to_string()));
    }
    let units: u128 = scaled
        .mantissa()
        .try_into()
        .map_err(|_| AmountError::OutOfRange(amount.to_string()))?;
    Ok(U256::from(units))
}

/// Parses a human-decimal amount string (the fallback protocol's encoding).
///
/// # Errors
///
/// Returns [`AmountError::NotDecimal`] if the string is not a non-negative
/// decimal number.
pub fn parse_decimal(amount: &str) -> Result<Decimal, AmountError> {
    let parsed: Decimal = amount
        .trim()
        .parse()
        .map_err(|_| AmountError::NotDecimal(amount.to_owned()))?;
    if parsed.is_sign_negative() {
        return Err(AmountError::NotDecimal(amount.to_owned()));
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atomic_one_usdc_is_decimal_one() {
        let amount = atomic_to_decimal("1000000", 6).unwrap();
        assert_eq!(amount, Decimal::ONE);
    }

    #[test]
    fn test_atomic_sub_unit() {
        let amount = atomic_to_decimal("1500", 6).unwrap();
        assert_eq!(amount, "0.0015".parse::<Decimal>().unwrap());
    }

    #[test]
    fn test_decimal_point_is_a_format_violation() {
        assert!(matches!(
            atomic_to_decimal("1.0", 6),
            Err(AmountError::NotAtomic(_))
        ));
    }

    #[test]
    fn test_sign_and_empty_rejected() {
        assert!(atomic_to_decimal("-5", 6).is_err());
        assert!(atomic_to_decimal("", 6).is_err());
        assert!(atomic_to_decimal("12e3", 6).is_err());
    }

    #[test]
    fn test_decimal_to_atomic_roundtrip() {
        let atomic = decimal_to_atomic("2.5".parse().unwrap(), 6).unwrap();
        assert_eq!(atomic, U256::from(2_500_000u64));
    }

    #[test]
    fn test_decimal_to_atomic_rejects_excess_precision() {
        assert!(decimal_to_atomic("0.0000001".parse().unwrap(), 6).is_err());
    }

    #[test]
    fn test_parse_decimal_rejects_negative() {
        assert!(parse_decimal("-1.0").is_err());
        assert_eq!(parse_decimal(" 1.25 ").unwrap(), "1.25".parse().unwrap());
    }
}
