//! Fixed-point arithmetic at scale 10^12
//!
//! Every consensus quantity (speeds, block-time factor, rewards, stake)
//! is an unsigned integer scaled by [`UNIT`]. Multiplication and division
//! truncate toward zero so that independent validators agree bit-for-bit.

use num_bigint::BigUint;
use num_traits::{ToPrimitive, Zero};

/// 1.0 in fixed-point
pub const UNIT: u64 = 1_000_000_000_000;

/// UNIT as an arbitrary-precision integer
pub fn unit() -> BigUint {
    BigUint::from(UNIT)
}

/// `n` whole units
pub fn units(n: u64) -> BigUint {
    BigUint::from(n) * UNIT
}

/// Fixed-point value from a `u128` already scaled by UNIT
pub fn from_raw(raw: u128) -> BigUint {
    BigUint::from(raw)
}

/// x * y / UNIT
pub fn mul_trunc(x: &BigUint, y: &BigUint) -> BigUint {
    (x * y) / UNIT
}

/// x * UNIT / y. Division by zero yields zero.
pub fn div_trunc(x: &BigUint, y: &BigUint) -> BigUint {
    if y.is_zero() {
        return BigUint::zero();
    }
    (x * UNIT) / y
}

/// Integer part
pub fn trunc(x: &BigUint) -> BigUint {
    x / UNIT
}

/// Nearest `f64` of the raw integer (not divided by UNIT)
pub fn to_f64(x: &BigUint) -> f64 {
    x.to_f64().unwrap_or(f64::INFINITY)
}

/// Human-readable decimal with 12 fractional digits, used in logs
pub fn display(x: &BigUint) -> String {
    let int = x / UNIT;
    let frac = x % UNIT;
    format!("{}.{:012}", int, frac.to_u64().unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mul_div_truncate() {
        let a = units(3);
        let b = BigUint::from(UNIT / 2);
        assert_eq!(mul_trunc(&a, &b), BigUint::from(3 * UNIT / 2));
        // 1 / 3 = 0.333333333333
        assert_eq!(div_trunc(&units(1), &units(3)), BigUint::from(333_333_333_333u64));
        assert_eq!(trunc(&BigUint::from(2_999_999_999_999u64)), BigUint::from(2u32));
    }

    #[test]
    fn test_div_by_zero() {
        assert!(div_trunc(&units(5), &BigUint::zero()).is_zero());
    }

    #[test]
    fn test_display() {
        assert_eq!(display(&BigUint::from(1_500_000_000_000u64)), "1.500000000000");
        assert_eq!(display(&units(40)), "40.000000000000");
    }
}
