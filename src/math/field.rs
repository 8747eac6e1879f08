//! secp256k1 field element arithmetic (mod p)
//! p = 0xFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFEFFFFFC2F

use super::u256::U256;
use std::ops::{Add, Mul, Neg, Sub};

/// Prime field element for secp256k1.
///
/// Wraps a canonical [`U256`] in [0, p). The dedicated type keeps field
/// values from being mixed with plain scalars.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct Fe {
    pub(crate) n: U256,
}

/// Field prime p = 2^256 - 2^32 - 977, little-endian limbs.
pub const P: U256 = U256::new([
    0xFFFFFC2F, 0xFFFFFFFE, 0xFFFFFFFF, 0xFFFFFFFF, 0xFFFFFFFF, 0xFFFFFFFF, 0xFFFFFFFF,
    0xFFFFFFFF,
]);

// p = 2^256 - K_FOLD where K_FOLD = 2^32 + 977
const K_LOW: u64 = 977;

impl Fe {
    pub const ZERO: Self = Self { n: U256::ZERO };
    pub const ONE: Self = Self { n: U256::ONE };

    /// Curve equation constant b = 7.
    pub const SEVEN: Self = Self {
        n: U256::new([7, 0, 0, 0, 0, 0, 0, 0]),
    };

    /// Wrap a value already known to be canonical.
    #[inline]
    pub(crate) const fn from_raw(n: U256) -> Self {
        Self { n }
    }

    /// Reduce an arbitrary 256-bit value into the field.
    pub fn from_u256(n: U256) -> Self {
        let mut v = n;
        while v >= P {
            v = v.wrapping_sub(&P);
        }
        Self { n: v }
    }

    #[inline]
    pub fn from_be_bytes(bytes: &[u8; 32]) -> Self {
        Self::from_u256(U256::from_be_bytes(bytes))
    }

    #[inline]
    pub fn to_be_bytes(&self) -> [u8; 32] {
        self.n.to_be_bytes()
    }

    #[inline]
    pub fn as_u256(&self) -> &U256 {
        &self.n
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.n.is_zero()
    }

    #[inline]
    pub fn is_odd(&self) -> bool {
        self.n.limbs[0] & 1 == 1
    }

    /// Modular addition, single correction by p.
    pub fn add(&self, other: &Self) -> Self {
        let (sum, carry) = self.n.overflowing_add(&other.n);
        let n = if carry || sum >= P {
            sum.wrapping_sub(&P)
        } else {
            sum
        };
        Self { n }
    }

    /// Modular subtraction, single correction by p.
    pub fn sub(&self, other: &Self) -> Self {
        let (diff, borrow) = self.n.overflowing_sub(&other.n);
        let n = if borrow { diff.wrapping_add(&P) } else { diff };
        Self { n }
    }

    pub fn neg(&self) -> Self {
        if self.is_zero() {
            *self
        } else {
            Self {
                n: P.wrapping_sub(&self.n),
            }
        }
    }

    pub fn double(&self) -> Self {
        self.add(self)
    }

    /// Modular multiplication: schoolbook 512-bit product, then the
    /// secp256k1 fold by 2^32 + 977.
    pub fn mul(&self, other: &Self) -> Self {
        let t = self.n.mul_wide(&other.n);
        Self::reduce_wide(&t)
    }

    #[inline]
    pub fn sqr(&self) -> Self {
        Fe::mul(self, self)
    }

    /// Reduce a 16-limb product mod p.
    ///
    /// t_lo + t_hi * 2^256 == t_lo + t_hi * (2^32 + 977)  (mod p)
    fn reduce_wide(t: &[u32; 16]) -> Self {
        const MASK: u64 = 0xFFFF_FFFF;

        let mut r = [0u64; 9];
        for i in 0..8 {
            r[i] = t[i] as u64;
        }

        // r += t_hi * 977
        let mut carry = 0u64;
        for i in 0..8 {
            let v = r[i] + t[i + 8] as u64 * K_LOW + carry;
            r[i] = v & MASK;
            carry = v >> 32;
        }
        r[8] = carry;

        // r += t_hi << 32
        carry = 0;
        for i in 0..8 {
            let v = r[i + 1] + t[i + 8] as u64 + carry;
            r[i + 1] = v & MASK;
            carry = v >> 32;
        }
        debug_assert_eq!(carry, 0, "fold overflow limb exceeded 32 bits");

        // fold the small overflow limb until it vanishes
        while r[8] != 0 {
            let overflow = r[8];
            r[8] = 0;

            let v = r[0] + overflow * K_LOW;
            r[0] = v & MASK;
            let mut c = v >> 32;

            let v = r[1] + overflow + c;
            r[1] = v & MASK;
            c = v >> 32;

            for limb in r.iter_mut().take(8).skip(2) {
                let v = *limb + c;
                *limb = v & MASK;
                c = v >> 32;
            }
            r[8] = c;
        }

        let mut limbs = [0u32; 8];
        for i in 0..8 {
            limbs[i] = r[i] as u32;
        }
        Self::from_u256(U256::new(limbs))
    }

    /// Modular inverse via Fermat: a^(p-2).
    ///
    /// Uses the libsecp256k1 addition chain; x_k below denotes
    /// a^(2^k - 1).
    ///
    /// Inverting zero is a programming error on valid curve inputs.
    pub fn inv(&self) -> Self {
        debug_assert!(!self.is_zero(), "field inverse of zero");

        let x2 = Fe::mul(&self.sqr(), self);
        let x3 = Fe::mul(&x2.sqr(), self);
        let x6 = Fe::mul(&sqr_n(&x3, 3), &x3);
        let x9 = Fe::mul(&sqr_n(&x6, 3), &x3);
        let x11 = Fe::mul(&sqr_n(&x9, 2), &x2);
        let x22 = Fe::mul(&sqr_n(&x11, 11), &x11);
        let x44 = Fe::mul(&sqr_n(&x22, 22), &x22);
        let x88 = Fe::mul(&sqr_n(&x44, 44), &x44);
        let x176 = Fe::mul(&sqr_n(&x88, 88), &x88);
        let x220 = Fe::mul(&sqr_n(&x176, 44), &x44);
        let x223 = Fe::mul(&sqr_n(&x220, 3), &x3);

        // tail for the exponent's low word ...fffffc2d
        let t = Fe::mul(&sqr_n(&x223, 23), &x22);
        let t = Fe::mul(&sqr_n(&t, 5), self);
        let t = Fe::mul(&sqr_n(&t, 3), &x2);
        Fe::mul(&sqr_n(&t, 2), self)
    }

    /// Square root when one exists: a^((p+1)/4) since p ≡ 3 (mod 4).
    pub fn sqrt(&self) -> Option<Self> {
        let x2 = Fe::mul(&self.sqr(), self);
        let x3 = Fe::mul(&x2.sqr(), self);
        let x6 = Fe::mul(&sqr_n(&x3, 3), &x3);
        let x9 = Fe::mul(&sqr_n(&x6, 3), &x3);
        let x11 = Fe::mul(&sqr_n(&x9, 2), &x2);
        let x22 = Fe::mul(&sqr_n(&x11, 11), &x11);
        let x44 = Fe::mul(&sqr_n(&x22, 22), &x22);
        let x88 = Fe::mul(&sqr_n(&x44, 44), &x44);
        let x176 = Fe::mul(&sqr_n(&x88, 88), &x88);
        let x220 = Fe::mul(&sqr_n(&x176, 44), &x44);
        let x223 = Fe::mul(&sqr_n(&x220, 3), &x3);

        // tail for the exponent's low word ...bfffff0c
        let t = Fe::mul(&sqr_n(&x223, 23), &x22);
        let t = Fe::mul(&sqr_n(&t, 6), &x2);
        let t = sqr_n(&t, 2);
        let candidate = Fe::mul(&t, self);

        if candidate.sqr() == *self {
            Some(candidate)
        } else {
            None
        }
    }
}

#[inline]
fn sqr_n(x: &Fe, n: usize) -> Fe {
    let mut acc = *x;
    for _ in 0..n {
        acc = acc.sqr();
    }
    acc
}

impl Add for Fe {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Fe::add(&self, &other)
    }
}

impl Sub for Fe {
    type Output = Self;
    fn sub(self, other: Self) -> Self {
        Fe::sub(&self, &other)
    }
}

impl Mul for Fe {
    type Output = Self;
    fn mul(self, other: Self) -> Self {
        Fe::mul(&self, &other)
    }
}

impl Neg for Fe {
    type Output = Self;
    fn neg(self) -> Self {
        Fe::neg(&self)
    }
}
