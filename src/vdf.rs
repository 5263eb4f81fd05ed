//! Sloth VDF: sequential modular square roots
//!
//! Works over a prime `p ≡ 3 (mod 4)` where a square root of a quadratic
//! residue is a single exponentiation `x^((p+1)/4)`.
//!
//! - **generate**: `steps` square roots in a row. Each root needs the previous
//!   one, so the work cannot be spread over cores.
//! - **verify**: `steps` squarings, far cheaper than the roots.
//!
//! ```text
//! x ──√──▶ y₁ ──√──▶ y₂ ── … ──▶ y_t        (slow)
//! y_t ──²──▶ … ──²──▶ ±x                    (fast)
//! ```
//!
//! Proofs travel as fixed-width little-endian byte strings.

use num_bigint::BigUint;
use num_integer::Integer;
use num_traits::{One, Zero};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// 1024-bit Sloth prime, ≡ 3 mod 4
pub const DEFAULT_PRIME: &str = "170082004324204494273811327264862981553264701145937538369570764779791492622392118654022654452947093285873855529044371650895045691292912712699015605832276411308653107069798639938826015099738961427172366594187783204437869906954750443653318078358839409699824714551430573905637228307966826784684174483831608534979";

/// Default proof width in bytes
pub const DEFAULT_PROOF_WIDTH: usize = 128;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("value needs {needed} bytes, width is {width}")]
    Overflow { needed: usize, width: usize },
    #[error("buffer is {len} bytes, expected {width}")]
    WidthMismatch { len: usize, width: usize },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VdfError {
    #[error("modulus is not a decimal integer: {0}")]
    Parse(String),
    #[error("modulus must be a prime ≡ 3 mod 4")]
    BadModulus,
}

/// Decode a little-endian buffer of exactly `width` bytes
pub fn decode_le(bytes: &[u8], width: usize) -> Result<BigUint, CodecError> {
    if bytes.len() != width {
        return Err(CodecError::WidthMismatch { len: bytes.len(), width });
    }
    Ok(BigUint::from_bytes_le(bytes))
}

/// Encode into exactly `width` little-endian bytes, zero padded
pub fn encode_le(value: &BigUint, width: usize) -> Result<Vec<u8>, CodecError> {
    let mut bytes = if value.is_zero() { Vec::new() } else { value.to_bytes_le() };
    if bytes.len() > width {
        return Err(CodecError::Overflow { needed: bytes.len(), width });
    }
    bytes.resize(width, 0);
    Ok(bytes)
}

/// Sloth permutation over a fixed prime
#[derive(Debug, Clone)]
pub struct SlothVdf {
    prime: BigUint,
    /// (p - 1) / 2, Euler criterion exponent
    residue_exp: BigUint,
    /// (p + 1) / 4, square root exponent
    root_exp: BigUint,
}

impl SlothVdf {
    pub fn new(prime: BigUint) -> Result<Self, VdfError> {
        let four = BigUint::from(4u32);
        if prime <= BigUint::from(3u32) || &prime % &four != BigUint::from(3u32) {
            return Err(VdfError::BadModulus);
        }
        let residue_exp = (&prime - 1u32) >> 1;
        let root_exp = (&prime + 1u32) >> 2;
        Ok(Self { prime, residue_exp, root_exp })
    }

    pub fn from_decimal(prime: &str) -> Result<Self, VdfError> {
        let p = BigUint::parse_bytes(prime.trim().as_bytes(), 10)
            .ok_or_else(|| VdfError::Parse(prime.to_string()))?;
        Self::new(p)
    }

    pub fn prime(&self) -> &BigUint {
        &self.prime
    }

    fn is_quadratic_residue(&self, x: &BigUint) -> bool {
        x.modpow(&self.residue_exp, &self.prime).is_one()
    }

    fn negate(&self, x: &BigUint) -> BigUint {
        (&self.prime - x).mod_floor(&self.prime)
    }

    fn sqrt_step(&self, x: BigUint) -> BigUint {
        let x = if self.is_quadratic_residue(&x) { x } else { self.negate(&x) };
        x.modpow(&self.root_exp, &self.prime)
    }

    /// `steps` sequential square roots of `challenge mod p`
    pub fn generate(&self, challenge: &BigUint, steps: u64) -> BigUint {
        let mut x = challenge % &self.prime;
        for _ in 0..steps {
            x = self.sqrt_step(x);
        }
        x
    }

    /// Same as [`generate`](Self::generate), but gives up between two roots
    /// once `cancel` fires.
    pub fn generate_cancellable(
        &self,
        challenge: &BigUint,
        steps: u64,
        cancel: &CancellationToken,
    ) -> Option<BigUint> {
        let mut x = challenge % &self.prime;
        for _ in 0..steps {
            if cancel.is_cancelled() {
                return None;
            }
            x = self.sqrt_step(x);
        }
        Some(x)
    }

    /// Proofs must be canonical (`< p`); `proof + k·p` is a different
    /// encoding of the same work and is refused.
    pub fn verify(&self, challenge: &BigUint, steps: u64, proof: &BigUint) -> bool {
        if proof >= &self.prime {
            return false;
        }
        let x = challenge % &self.prime;
        let mut y = proof.clone();
        for _ in 0..steps {
            y = (&y * &y) % &self.prime;
        }
        if !self.is_quadratic_residue(&y) {
            y = self.negate(&y);
        }
        y == x || y == self.negate(&x)
    }

    pub fn generate_bytes(&self, challenge: &[u8], steps: u64, width: usize) -> Result<Vec<u8>, CodecError> {
        let x = decode_le(challenge, width)?;
        encode_le(&self.generate(&x, steps), width)
    }

    /// False on any width mismatch
    pub fn verify_bytes(&self, challenge: &[u8], steps: u64, proof: &[u8], width: usize) -> bool {
        match (decode_le(challenge, width), decode_le(proof, width)) {
            (Ok(x), Ok(y)) => self.verify(&x, steps, &y),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn big(s: &str) -> BigUint {
        BigUint::parse_bytes(s.as_bytes(), 10).unwrap()
    }

    #[test]
    fn test_small_prime() {
        let vdf = SlothVdf::new(BigUint::from(23u32)).unwrap();
        let x = BigUint::from(10u32);
        let y = vdf.generate(&x, 50);
        assert!(vdf.verify(&x, 50, &y));
        assert!(!vdf.verify(&BigUint::from(11u32), 50, &y));
    }

    #[test]
    fn test_128_bit_prime() {
        let vdf = SlothVdf::from_decimal("73237431696005972674723595250817150843").unwrap();
        let x = big("808080818080808080818080");
        let y = vdf.generate(&x, 2000);
        assert!(vdf.verify(&x, 2000, &y));
        assert!(!vdf.verify(&x, 1999, &y));
        assert!(!vdf.verify(&(&x + 1u32), 2000, &y));
    }

    #[test]
    fn test_default_prime_bytes() {
        let vdf = SlothVdf::from_decimal(DEFAULT_PRIME).unwrap();
        let mut challenge = vec![0u8; DEFAULT_PROOF_WIDTH];
        challenge[..4].copy_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        let proof = vdf.generate_bytes(&challenge, 20, DEFAULT_PROOF_WIDTH).unwrap();
        assert_eq!(proof.len(), DEFAULT_PROOF_WIDTH);
        assert!(vdf.verify_bytes(&challenge, 20, &proof, DEFAULT_PROOF_WIDTH));
        assert!(!vdf.verify_bytes(&challenge, 20, &proof[..64], DEFAULT_PROOF_WIDTH));
    }

    #[test]
    fn test_rejects_bad_modulus() {
        // 13 ≡ 1 mod 4
        assert_eq!(SlothVdf::new(BigUint::from(13u32)).unwrap_err(), VdfError::BadModulus);
        assert!(matches!(SlothVdf::from_decimal("abc"), Err(VdfError::Parse(_))));
    }

    #[test]
    fn test_zero_steps() {
        let vdf = SlothVdf::new(BigUint::from(23u32)).unwrap();
        let x = BigUint::from(30u32);
        assert_eq!(vdf.generate(&x, 0), BigUint::from(7u32));
        assert!(vdf.verify(&x, 0, &BigUint::from(7u32)));
    }

    #[test]
    fn test_cancelled_generation() {
        let vdf = SlothVdf::new(BigUint::from(23u32)).unwrap();
        let token = CancellationToken::new();
        token.cancel();
        assert!(vdf.generate_cancellable(&BigUint::from(10u32), 5, &token).is_none());
        let fresh = CancellationToken::new();
        assert_eq!(
            vdf.generate_cancellable(&BigUint::from(10u32), 5, &fresh),
            Some(vdf.generate(&BigUint::from(10u32), 5))
        );
    }

    #[test]
    fn test_unreduced_proof_refused() {
        let vdf = SlothVdf::from_decimal("170141183460469231731687303715884105727").unwrap();
        let challenge = vec![0x5au8; 16];
        let proof = vdf.generate_bytes(&challenge, 40, 16).unwrap();
        assert!(vdf.verify_bytes(&challenge, 40, &proof, 16));

        // same residue, different bytes
        let twin = encode_le(&(decode_le(&proof, 16).unwrap() + vdf.prime()), 16).unwrap();
        assert_ne!(twin, proof);
        assert!(!vdf.verify_bytes(&challenge, 40, &twin, 16));
        assert!(!vdf.verify(&BigUint::from(10u32), 0, &(BigUint::from(10u32) + vdf.prime())));
    }

    #[test]
    fn test_codec_widths() {
        let v = BigUint::from(0x0102u32);
        assert_eq!(encode_le(&v, 8).unwrap(), vec![2, 1, 0, 0, 0, 0, 0, 0]);
        assert_eq!(decode_le(&[2, 1, 0, 0, 0, 0, 0, 0], 8).unwrap(), v);
        assert_eq!(
            encode_le(&BigUint::from(u64::MAX), 4),
            Err(CodecError::Overflow { needed: 8, width: 4 })
        );
        assert_eq!(decode_le(&[1, 2, 3], 8), Err(CodecError::WidthMismatch { len: 3, width: 8 }));
        assert_eq!(encode_le(&BigUint::zero(), 16).unwrap(), vec![0u8; 16]);
    }
}
