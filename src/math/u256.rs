//! 256-bit unsigned integer on 8 little-endian 32-bit limbs
//!
//! The limb width matches the GPU kernels, so scalar state can be copied
//! between host and device without repacking.

use anyhow::{anyhow, Result};
use std::cmp::Ordering;

/// Unsigned 256-bit integer, 8 x u32 limbs, least significant limb first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct U256 {
    pub limbs: [u32; 8],
}

impl U256 {
    pub const ZERO: Self = Self { limbs: [0; 8] };
    pub const ONE: Self = Self {
        limbs: [1, 0, 0, 0, 0, 0, 0, 0],
    };

    #[inline]
    pub const fn new(limbs: [u32; 8]) -> Self {
        Self { limbs }
    }

    #[inline]
    pub fn from_u64(value: u64) -> Self {
        let mut limbs = [0u32; 8];
        limbs[0] = value as u32;
        limbs[1] = (value >> 32) as u32;
        Self { limbs }
    }

    #[inline]
    pub fn from_u128(value: u128) -> Self {
        let mut limbs = [0u32; 8];
        for (i, limb) in limbs.iter_mut().enumerate().take(4) {
            *limb = (value >> (32 * i)) as u32;
        }
        Self { limbs }
    }

    /// Low 64 bits, discarding the rest.
    #[inline]
    pub fn low_u64(&self) -> u64 {
        (self.limbs[0] as u64) | ((self.limbs[1] as u64) << 32)
    }

    /// Low 128 bits, saturating when higher limbs are set.
    pub fn to_u128_saturating(&self) -> u128 {
        if self.limbs[4..].iter().any(|&l| l != 0) {
            return u128::MAX;
        }
        let mut v = 0u128;
        for i in (0..4).rev() {
            v = (v << 32) | self.limbs[i] as u128;
        }
        v
    }

    /// Integer square root (floor).
    pub fn isqrt(&self) -> Self {
        if self.is_zero() {
            return Self::ZERO;
        }
        let mut result = Self::ZERO;
        let top_bit = self.highest_bit().expect("non-zero") / 2;
        for bit in (0..=top_bit).rev() {
            let mut candidate = result;
            candidate.set_bit(bit, true);
            let sq = candidate.mul_wide(&candidate);
            // candidate^2 <= self iff the high half is clear and the low
            // half compares at most equal
            let high_clear = sq[8..].iter().all(|&l| l == 0);
            let mut low = [0u32; 8];
            low.copy_from_slice(&sq[..8]);
            if high_clear && Self::new(low) <= *self {
                result = candidate;
            }
        }
        result
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.limbs.iter().all(|&l| l == 0)
    }

    /// Bit at position `pos` (0 = least significant). Out-of-range bits read 0.
    #[inline]
    pub fn bit(&self, pos: usize) -> bool {
        if pos >= 256 {
            return false;
        }
        (self.limbs[pos / 32] >> (pos % 32)) & 1 == 1
    }

    #[inline]
    pub fn set_bit(&mut self, pos: usize, value: bool) {
        if pos >= 256 {
            return;
        }
        if value {
            self.limbs[pos / 32] |= 1 << (pos % 32);
        } else {
            self.limbs[pos / 32] &= !(1 << (pos % 32));
        }
    }

    /// Position of the highest set bit, or None for zero.
    pub fn highest_bit(&self) -> Option<usize> {
        for i in (0..8).rev() {
            if self.limbs[i] != 0 {
                return Some(i * 32 + (31 - self.limbs[i].leading_zeros() as usize));
            }
        }
        None
    }

    /// Number of significant bits (0 for zero).
    #[inline]
    pub fn bits(&self) -> usize {
        self.highest_bit().map_or(0, |b| b + 1)
    }

    /// Carry-chain addition. Returns (sum, carry).
    pub fn overflowing_add(&self, other: &Self) -> (Self, bool) {
        let mut r = [0u32; 8];
        let mut carry = 0u64;
        for i in 0..8 {
            let sum = self.limbs[i] as u64 + other.limbs[i] as u64 + carry;
            r[i] = sum as u32;
            carry = sum >> 32;
        }
        (Self { limbs: r }, carry != 0)
    }

    /// Borrow-chain subtraction. Returns (difference, borrow).
    pub fn overflowing_sub(&self, other: &Self) -> (Self, bool) {
        let mut r = [0u32; 8];
        let mut borrow = 0i64;
        for i in 0..8 {
            let diff = self.limbs[i] as i64 - other.limbs[i] as i64 - borrow;
            if diff < 0 {
                r[i] = (diff + (1i64 << 32)) as u32;
                borrow = 1;
            } else {
                r[i] = diff as u32;
                borrow = 0;
            }
        }
        (Self { limbs: r }, borrow != 0)
    }

    #[inline]
    pub fn wrapping_add(&self, other: &Self) -> Self {
        self.overflowing_add(other).0
    }

    #[inline]
    pub fn wrapping_sub(&self, other: &Self) -> Self {
        self.overflowing_sub(other).0
    }

    /// Schoolbook 8x8 limb product to 16 limbs.
    pub fn mul_wide(&self, other: &Self) -> [u32; 16] {
        let mut t = [0u32; 16];
        for i in 0..8 {
            let mut carry = 0u64;
            for j in 0..8 {
                // a*b + t + carry never overflows u64 for 32-bit operands
                let prod =
                    self.limbs[i] as u64 * other.limbs[j] as u64 + t[i + j] as u64 + carry;
                t[i + j] = prod as u32;
                carry = prod >> 32;
            }
            t[i + 8] = carry as u32;
        }
        t
    }

    /// Long division by a 64-bit divisor. Returns (quotient, remainder).
    ///
    /// Panics on division by zero, which callers rule out at the input
    /// boundary.
    pub fn div_rem_u64(&self, divisor: u64) -> (Self, u64) {
        assert!(divisor != 0, "division by zero");
        let mut q = [0u32; 8];
        let mut rem = 0u128;
        for i in (0..8).rev() {
            let acc = (rem << 32) | self.limbs[i] as u128;
            q[i] = (acc / divisor as u128) as u32;
            rem = acc % divisor as u128;
        }
        (Self { limbs: q }, rem as u64)
    }

    /// Shift left by `n` bits, wrapping at 2^256.
    pub fn shl(&self, n: usize) -> Self {
        if n >= 256 {
            return Self::ZERO;
        }
        let limb_shift = n / 32;
        let bit_shift = n % 32;
        let mut r = [0u32; 8];
        for i in (limb_shift..8).rev() {
            let mut v = (self.limbs[i - limb_shift] as u64) << bit_shift;
            if bit_shift > 0 && i > limb_shift {
                v |= (self.limbs[i - limb_shift - 1] as u64) >> (32 - bit_shift);
            }
            r[i] = v as u32;
        }
        Self { limbs: r }
    }

    /// Big-endian 32-byte serialization.
    pub fn to_be_bytes(&self) -> [u8; 32] {
        let mut bytes = [0u8; 32];
        for i in 0..8 {
            bytes[(7 - i) * 4..(8 - i) * 4].copy_from_slice(&self.limbs[i].to_be_bytes());
        }
        bytes
    }

    /// Parse big-endian 32-byte form.
    pub fn from_be_bytes(bytes: &[u8; 32]) -> Self {
        let mut limbs = [0u32; 8];
        for i in 0..8 {
            let off = (7 - i) * 4;
            limbs[i] = u32::from_be_bytes([
                bytes[off],
                bytes[off + 1],
                bytes[off + 2],
                bytes[off + 3],
            ]);
        }
        Self { limbs }
    }

    /// Parse a hex string: optional 0x prefix, leading zeros optional,
    /// at most 64 digits.
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        let s = hex_str
            .trim()
            .trim_start_matches("0x")
            .trim_start_matches("0X");
        if s.is_empty() || s.len() > 64 {
            return Err(anyhow!("invalid 256-bit hex value: {hex_str:?}"));
        }
        let padded = format!("{s:0>64}");
        let bytes = hex::decode(&padded).map_err(|e| anyhow!("invalid hex {hex_str:?}: {e}"))?;
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self::from_be_bytes(&arr))
    }

    /// Lower-case hex with leading zeros trimmed ("0" for zero).
    pub fn to_hex(&self) -> String {
        let full = hex::encode(self.to_be_bytes());
        let trimmed = full.trim_start_matches('0');
        if trimmed.is_empty() {
            "0".to_string()
        } else {
            trimmed.to_string()
        }
    }

    /// Addition modulo an arbitrary modulus. Operands must already be
    /// reduced below the modulus.
    pub fn add_mod(&self, other: &Self, modulus: &Self) -> Self {
        let (sum, carry) = self.overflowing_add(other);
        if carry || sum >= *modulus {
            sum.wrapping_sub(modulus)
        } else {
            sum
        }
    }

    /// Subtraction modulo an arbitrary modulus.
    pub fn sub_mod(&self, other: &Self, modulus: &Self) -> Self {
        let (diff, borrow) = self.overflowing_sub(other);
        if borrow {
            diff.wrapping_add(modulus)
        } else {
            diff
        }
    }

    /// Full modular multiplication via double-and-add over the multiplier
    /// bits. O(256) modular additions; fine for the rare recovery paths
    /// that need arithmetic mod the group order.
    pub fn mul_mod(&self, other: &Self, modulus: &Self) -> Self {
        let mut acc = Self::ZERO;
        let base = if *self >= *modulus {
            self.wrapping_sub(modulus)
        } else {
            *self
        };
        for bit in (0..other.bits()).rev() {
            acc = acc.add_mod(&acc, modulus);
            if other.bit(bit) {
                acc = acc.add_mod(&base, modulus);
            }
        }
        acc
    }

    /// `self * factor mod modulus` via shift-and-add over the factor bits.
    ///
    /// Used for the small multipliers in the endomorphism key recovery;
    /// not a general modular multiplication.
    pub fn mul_u64_mod(&self, factor: u64, modulus: &Self) -> Self {
        let mut acc = Self::ZERO;
        let base = if *self >= *modulus {
            // operand not reduced; one subtraction is enough for our callers
            self.wrapping_sub(modulus)
        } else {
            *self
        };
        for bit in (0..64).rev() {
            acc = acc.add_mod(&acc, modulus);
            if (factor >> bit) & 1 == 1 {
                acc = acc.add_mod(&base, modulus);
            }
        }
        acc
    }
}

impl PartialOrd for U256 {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for U256 {
    fn cmp(&self, other: &Self) -> Ordering {
        for i in (0..8).rev() {
            match self.limbs[i].cmp(&other.limbs[i]) {
                Ordering::Equal => continue,
                ord => return ord,
            }
        }
        Ordering::Equal
    }
}

impl std::fmt::Display for U256 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{}", self.to_hex())
    }
}

impl From<u64> for U256 {
    fn from(value: u64) -> Self {
        Self::from_u64(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_sub_round_trip() {
        let a = U256::from_hex("ffffffffffffffffffffffffffffffff").unwrap();
        let b = U256::from_u64(0xdeadbeef);
        let sum = a.wrapping_add(&b);
        assert_eq!(sum.wrapping_sub(&b), a);
    }

    #[test]
    fn carry_propagates_across_limbs() {
        let a = U256::from_hex("ffffffff").unwrap();
        let sum = a.wrapping_add(&U256::ONE);
        assert_eq!(sum.limbs[0], 0);
        assert_eq!(sum.limbs[1], 1);
    }

    #[test]
    fn overflow_reports_carry() {
        let max = U256::new([u32::MAX; 8]);
        let (wrapped, carry) = max.overflowing_add(&U256::ONE);
        assert!(carry);
        assert!(wrapped.is_zero());
    }

    #[test]
    fn byte_round_trip_is_big_endian() {
        let x = U256::from_hex("0102030405060708090a0b0c0d0e0f10").unwrap();
        let bytes = x.to_be_bytes();
        assert_eq!(bytes.len(), 32);
        assert_eq!(bytes[31], 0x10);
        assert_eq!(bytes[16], 0x01);
        assert_eq!(U256::from_be_bytes(&bytes), x);
    }

    #[test]
    fn hex_accepts_prefix_and_leading_zeros() {
        let a = U256::from_hex("0x00ff").unwrap();
        let b = U256::from_hex("ff").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_hex(), "ff");
    }

    #[test]
    fn hex_rejects_garbage() {
        assert!(U256::from_hex("").is_err());
        assert!(U256::from_hex("zz").is_err());
        assert!(U256::from_hex(&"f".repeat(65)).is_err());
    }

    #[test]
    fn mul_wide_matches_num_bigint() {
        use num_bigint::BigUint;
        let a = U256::from_hex("fedcba9876543210fedcba9876543210fedcba9876543210").unwrap();
        let b = U256::from_hex("123456789abcdef0123456789abcdef").unwrap();
        let t = a.mul_wide(&b);

        let big_a = BigUint::from_bytes_be(&a.to_be_bytes());
        let big_b = BigUint::from_bytes_be(&b.to_be_bytes());
        let expected = &big_a * &big_b;

        let mut product = BigUint::default();
        for i in (0..16).rev() {
            product = (product << 32) + BigUint::from(t[i]);
        }
        assert_eq!(product, expected);
    }

    #[test]
    fn div_rem_small() {
        let n = U256::from_u64(1_000_003);
        let (q, r) = n.div_rem_u64(1000);
        assert_eq!(q.low_u64(), 1000);
        assert_eq!(r, 3);
    }

    #[test]
    fn div_rem_large_matches_num_bigint() {
        use num_bigint::BigUint;
        let n = U256::from_hex("3fffffffffffffffffffffffffffffffffffffff").unwrap();
        let d = 0xdeadbeefcafeu64;
        let (q, r) = n.div_rem_u64(d);

        let big_n = BigUint::from_bytes_be(&n.to_be_bytes());
        let big_q = BigUint::from_bytes_be(&q.to_be_bytes());
        assert_eq!(&big_q * d + r, big_n);
    }

    #[test]
    fn bit_access() {
        let mut x = U256::ZERO;
        x.set_bit(65, true);
        assert!(x.bit(65));
        assert_eq!(x.highest_bit(), Some(65));
        assert_eq!(x.bits(), 66);
        x.set_bit(65, false);
        assert!(x.is_zero());
    }

    #[test]
    fn shl_crosses_limbs() {
        let x = U256::from_u64(0x8000_0001);
        let shifted = x.shl(33);
        let expected = U256::from_hex("10000000200000000").unwrap();
        assert_eq!(shifted, expected);
    }

    #[test]
    fn mod_helpers_stay_reduced() {
        let m = U256::from_u64(97);
        let a = U256::from_u64(90);
        let b = U256::from_u64(20);
        assert_eq!(a.add_mod(&b, &m).low_u64(), 13);
        assert_eq!(b.sub_mod(&a, &m).low_u64(), 27);
        assert_eq!(a.mul_u64_mod(20, &m).low_u64(), (90 * 20) % 97);
    }

    #[test]
    fn isqrt_exact_and_floor() {
        assert_eq!(U256::from_u64(0).isqrt(), U256::ZERO);
        assert_eq!(U256::from_u64(1).isqrt(), U256::ONE);
        assert_eq!(U256::from_u64(144).isqrt().low_u64(), 12);
        assert_eq!(U256::from_u64(145).isqrt().low_u64(), 12);
        let big = U256::from_hex("100000000000000000000000000000000").unwrap(); // 2^128
        assert_eq!(big.isqrt(), U256::from_u64(1).shl(64));
    }

    #[test]
    fn u128_round_trip_and_saturation() {
        let v = U256::from_u128(0x0123_4567_89AB_CDEF_1122_3344_5566_7788);
        assert_eq!(
            v.to_u128_saturating(),
            0x0123_4567_89AB_CDEF_1122_3344_5566_7788
        );
        let huge = U256::from_u64(1).shl(200);
        assert_eq!(huge.to_u128_saturating(), u128::MAX);
    }

    #[test]
    fn ordering_is_numeric() {
        let small = U256::from_u64(5);
        let big = U256::from_hex("100000000000000000").unwrap();
        assert!(small < big);
        assert_eq!(small.cmp(&small), Ordering::Equal);
    }
}
