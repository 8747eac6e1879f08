//! secp256k1 group arithmetic in Jacobian coordinates
//!
//! y^2 = x^3 + 7 over Fp. Jacobian (X, Y, Z) represents the affine point
//! (X/Z^2, Y/Z^3); Z = 0 is the point at infinity.

use super::field::Fe;
use super::u256::U256;
use anyhow::{anyhow, bail, Result};

/// Group order n.
pub const N: U256 = U256::new([
    0xD0364141, 0xBFD25E8C, 0xAF48A03B, 0xBAAEDCE6, 0xFFFFFFFE, 0xFFFFFFFF, 0xFFFFFFFF,
    0xFFFFFFFF,
]);

/// Cube root of unity in Fp; x-coordinate multiplier of the endomorphism.
pub const BETA: Fe = Fe::from_raw(U256::new([
    0x719501EE, 0xC1396C28, 0x12F58995, 0x9CF04975, 0xAC3434E9, 0x6E64479E, 0x657C0710,
    0x7AE96A2B,
]));

/// Cube root of unity mod n; phi(P) = LAMBDA * P.
pub const LAMBDA: U256 = U256::new([
    0x1B23BD72, 0xDF02967C, 0x20816678, 0x122E22EA, 0x8812645A, 0xA5261C02, 0xC05C30E0,
    0x5363AD4C,
]);

const GX: Fe = Fe::from_raw(U256::new([
    0x16F81798, 0x59F2815B, 0x2DCE28D9, 0x029BFCDB, 0xCE870B07, 0x55A06295, 0xF9DCBBAC,
    0x79BE667E,
]));

const GY: Fe = Fe::from_raw(U256::new([
    0xFB10D4B8, 0x9C47D08F, 0xA6855419, 0xFD17B448, 0x0E1108A8, 0x5DA4FBFC, 0x26A3C465,
    0x483ADA77,
]));

/// Affine curve point, or the distinguished point at infinity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AffinePoint {
    pub x: Fe,
    pub y: Fe,
    pub infinity: bool,
}

impl AffinePoint {
    pub const INFINITY: Self = Self {
        x: Fe::ZERO,
        y: Fe::ZERO,
        infinity: true,
    };

    pub fn new(x: Fe, y: Fe) -> Self {
        Self {
            x,
            y,
            infinity: false,
        }
    }

    pub fn is_on_curve(&self) -> bool {
        if self.infinity {
            return true;
        }
        let lhs = self.y.sqr();
        let rhs = self.x.sqr().mul(&self.x).add(&Fe::SEVEN);
        lhs == rhs
    }

    /// Endomorphism phi: (x, y) -> (beta*x, y), with phi(P) = LAMBDA*P.
    pub fn endomorphism(&self) -> Self {
        if self.infinity {
            return *self;
        }
        Self::new(self.x.mul(&BETA), self.y)
    }

    pub fn negate(&self) -> Self {
        if self.infinity {
            return *self;
        }
        Self::new(self.x, self.y.neg())
    }

    /// SEC1 compressed form: 02/03 prefix + big-endian X.
    pub fn to_compressed(&self) -> [u8; 33] {
        let mut out = [0u8; 33];
        out[0] = if self.y.is_odd() { 0x03 } else { 0x02 };
        out[1..].copy_from_slice(&self.x.to_be_bytes());
        out
    }

    /// SEC1 uncompressed form: 04 prefix + X + Y.
    pub fn to_uncompressed(&self) -> [u8; 65] {
        let mut out = [0u8; 65];
        out[0] = 0x04;
        out[1..33].copy_from_slice(&self.x.to_be_bytes());
        out[33..].copy_from_slice(&self.y.to_be_bytes());
        out
    }

    /// Parse a SEC1-encoded point (33 or 65 bytes), validating the curve
    /// equation. Compressed points are decompressed via the field square
    /// root.
    pub fn from_sec1(bytes: &[u8]) -> Result<Self> {
        match bytes.len() {
            33 => {
                let parity_odd = match bytes[0] {
                    0x02 => false,
                    0x03 => true,
                    b => bail!("invalid compressed point prefix 0x{b:02x}"),
                };
                let mut x_bytes = [0u8; 32];
                x_bytes.copy_from_slice(&bytes[1..]);
                let x = Fe::from_be_bytes(&x_bytes);
                let y_sq = x.sqr().mul(&x).add(&Fe::SEVEN);
                let y = y_sq
                    .sqrt()
                    .ok_or_else(|| anyhow!("x coordinate is not on the curve"))?;
                let y = if y.is_odd() == parity_odd { y } else { y.neg() };
                Ok(Self::new(x, y))
            }
            65 => {
                if bytes[0] != 0x04 {
                    bail!("invalid uncompressed point prefix 0x{:02x}", bytes[0]);
                }
                let mut x_bytes = [0u8; 32];
                let mut y_bytes = [0u8; 32];
                x_bytes.copy_from_slice(&bytes[1..33]);
                y_bytes.copy_from_slice(&bytes[33..]);
                let point = Self::new(Fe::from_be_bytes(&x_bytes), Fe::from_be_bytes(&y_bytes));
                if !point.is_on_curve() {
                    bail!("point is not on the curve");
                }
                Ok(point)
            }
            n => bail!("invalid SEC1 point length {n}"),
        }
    }
}

/// Jacobian curve point. Z = 0 encodes infinity.
#[derive(Clone, Copy, Debug)]
pub struct JacobianPoint {
    pub x: Fe,
    pub y: Fe,
    pub z: Fe,
}

impl JacobianPoint {
    pub const INFINITY: Self = Self {
        x: Fe::ONE,
        y: Fe::ONE,
        z: Fe::ZERO,
    };

    /// Base point G.
    pub const GENERATOR: Self = Self {
        x: GX,
        y: GY,
        z: Fe::ONE,
    };

    #[inline]
    pub fn is_infinity(&self) -> bool {
        self.z.is_zero()
    }

    pub fn from_affine(p: &AffinePoint) -> Self {
        if p.infinity {
            Self::INFINITY
        } else {
            Self {
                x: p.x,
                y: p.y,
                z: Fe::ONE,
            }
        }
    }

    /// Point doubling, a = 0 short Weierstrass formulas.
    pub fn double(&self) -> Self {
        if self.is_infinity() || self.y.is_zero() {
            return Self::INFINITY;
        }

        let a = self.x.sqr();
        let b = self.y.sqr();
        let c = b.sqr();

        // d = 2*((x + b)^2 - a - c)
        let d = self.x.add(&b).sqr().sub(&a).sub(&c).double();
        let e = a.double().add(&a);
        let f = e.sqr();

        let x3 = f.sub(&d.double());
        let c8 = c.double().double().double();
        let y3 = e.mul(&d.sub(&x3)).sub(&c8);
        let z3 = self.y.mul(&self.z).double();

        Self {
            x: x3,
            y: y3,
            z: z3,
        }
    }

    /// Full Jacobian + Jacobian addition.
    pub fn add(&self, other: &Self) -> Self {
        if self.is_infinity() {
            return *other;
        }
        if other.is_infinity() {
            return *self;
        }

        let z1z1 = self.z.sqr();
        let z2z2 = other.z.sqr();
        let u1 = self.x.mul(&z2z2);
        let u2 = other.x.mul(&z1z1);
        let s1 = self.y.mul(&z2z2).mul(&other.z);
        let s2 = other.y.mul(&z1z1).mul(&self.z);

        let h = u2.sub(&u1);
        let r = s2.sub(&s1);

        if h.is_zero() {
            return if r.is_zero() {
                self.double()
            } else {
                // P = -Q
                Self::INFINITY
            };
        }

        let h2 = h.sqr();
        let h3 = h2.mul(&h);
        let u1h2 = u1.mul(&h2);

        let x3 = r.sqr().sub(&h3).sub(&u1h2.double());
        let y3 = r.mul(&u1h2.sub(&x3)).sub(&s1.mul(&h3));
        let z3 = h.mul(&self.z).mul(&other.z);

        Self {
            x: x3,
            y: y3,
            z: z3,
        }
    }

    /// Mixed addition with an affine operand (Z2 = 1); one point per giant
    /// step, so this is the hot path.
    pub fn add_affine(&self, other: &AffinePoint) -> Self {
        if other.infinity {
            return *self;
        }
        if self.is_infinity() {
            return Self::from_affine(other);
        }

        let z1z1 = self.z.sqr();
        let u2 = other.x.mul(&z1z1);
        let s2 = other.y.mul(&z1z1).mul(&self.z);

        let h = u2.sub(&self.x);
        let r = s2.sub(&self.y);

        if h.is_zero() {
            return if r.is_zero() {
                self.double()
            } else {
                Self::INFINITY
            };
        }

        let h2 = h.sqr();
        let h3 = h2.mul(&h);
        let u1h2 = self.x.mul(&h2);

        let x3 = r.sqr().sub(&h3).sub(&u1h2.double());
        let y3 = r.mul(&u1h2.sub(&x3)).sub(&self.y.mul(&h3));
        let z3 = h.mul(&self.z);

        Self {
            x: x3,
            y: y3,
            z: z3,
        }
    }

    pub fn negate(&self) -> Self {
        Self {
            x: self.x,
            y: self.y.neg(),
            z: self.z,
        }
    }

    /// Double-and-add scalar multiplication, bit 0 upward. Always runs the
    /// full 256 iterations.
    pub fn scalar_mul(k: &U256, p: &Self) -> Self {
        let mut result = Self::INFINITY;
        let mut addend = *p;
        for i in 0..256 {
            if k.bit(i) {
                result = result.add(&addend);
            }
            addend = addend.double();
        }
        result
    }

    /// k * G.
    pub fn mul_generator(k: &U256) -> Self {
        Self::scalar_mul(k, &Self::GENERATOR)
    }

    /// Convert to affine with a single field inversion.
    pub fn to_affine(&self) -> AffinePoint {
        if self.is_infinity() {
            return AffinePoint::INFINITY;
        }
        let z_inv = self.z.inv();
        let z_inv2 = z_inv.sqr();
        let z_inv3 = z_inv2.mul(&z_inv);
        AffinePoint::new(self.x.mul(&z_inv2), self.y.mul(&z_inv3))
    }
}

/// Batch Jacobian-to-affine conversion using Montgomery's trick: one field
/// inversion for the whole slice plus 3 multiplications per point.
pub fn batch_to_affine(points: &[JacobianPoint]) -> Vec<AffinePoint> {
    let n = points.len();
    let mut out = vec![AffinePoint::INFINITY; n];
    if n == 0 {
        return out;
    }

    // prefix products of the non-zero Z coordinates
    let mut prefix = vec![Fe::ONE; n];
    let mut acc = Fe::ONE;
    for (i, p) in points.iter().enumerate() {
        prefix[i] = acc;
        if !p.is_infinity() {
            acc = acc.mul(&p.z);
        }
    }

    let mut inv_acc = acc.inv();
    for i in (0..n).rev() {
        let p = &points[i];
        if p.is_infinity() {
            continue;
        }
        let z_inv = inv_acc.mul(&prefix[i]);
        inv_acc = inv_acc.mul(&p.z);

        let z_inv2 = z_inv.sqr();
        let z_inv3 = z_inv2.mul(&z_inv);
        out[i] = AffinePoint::new(p.x.mul(&z_inv2), p.y.mul(&z_inv3));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn g_affine() -> AffinePoint {
        JacobianPoint::GENERATOR.to_affine()
    }

    #[test]
    fn generator_is_on_curve() {
        assert!(g_affine().is_on_curve());
    }

    #[test]
    fn double_equals_add_self() {
        let g = JacobianPoint::GENERATOR;
        let doubled = g.double().to_affine();
        let added = g.add(&g).to_affine();
        assert_eq!(doubled, added);
        assert!(doubled.is_on_curve());
    }

    #[test]
    fn add_inverse_is_infinity() {
        let g = JacobianPoint::GENERATOR;
        let sum = g.add(&g.negate());
        assert!(sum.is_infinity());
    }

    #[test]
    fn scalar_mul_distributes_over_addition() {
        let a = U256::from_u64(123_456);
        let b = U256::from_u64(654_321);
        let sum = a.wrapping_add(&b);

        let lhs = JacobianPoint::mul_generator(&sum).to_affine();
        let rhs = JacobianPoint::mul_generator(&a)
            .add(&JacobianPoint::mul_generator(&b))
            .to_affine();
        assert_eq!(lhs, rhs);
    }

    #[test]
    fn small_multiples_chain() {
        // k*G computed by repeated addition matches scalar_mul
        let g = JacobianPoint::GENERATOR;
        let mut acc = g;
        for k in 2u64..50 {
            acc = acc.add(&g);
            let direct = JacobianPoint::mul_generator(&U256::from_u64(k));
            assert_eq!(acc.to_affine(), direct.to_affine());
        }
    }

    #[test]
    fn scalar_mul_order_gives_infinity() {
        let result = JacobianPoint::mul_generator(&N);
        assert!(result.is_infinity());
    }

    #[test]
    fn endomorphism_matches_lambda_mul() {
        let p = JacobianPoint::mul_generator(&U256::from_u64(987_654_321)).to_affine();
        let phi = p.endomorphism();
        let expected = JacobianPoint::scalar_mul(&LAMBDA, &JacobianPoint::from_affine(&p));
        assert_eq!(phi, expected.to_affine());
        assert!(phi.is_on_curve());
    }

    #[test]
    fn mixed_add_matches_full_add() {
        let a = JacobianPoint::mul_generator(&U256::from_u64(1111));
        let b = JacobianPoint::mul_generator(&U256::from_u64(2222));
        let b_affine = b.to_affine();
        assert_eq!(a.add(&b).to_affine(), a.add_affine(&b_affine).to_affine());
    }

    #[test]
    fn batch_to_affine_matches_single() {
        let points: Vec<JacobianPoint> = (1u64..20)
            .map(|k| JacobianPoint::mul_generator(&U256::from_u64(k * 7)))
            .collect();
        let batch = batch_to_affine(&points);
        for (b, p) in batch.iter().zip(&points) {
            assert_eq!(*b, p.to_affine());
        }
    }

    #[test]
    fn batch_to_affine_skips_infinity() {
        let points = vec![
            JacobianPoint::mul_generator(&U256::from_u64(3)),
            JacobianPoint::INFINITY,
            JacobianPoint::mul_generator(&U256::from_u64(5)),
        ];
        let batch = batch_to_affine(&points);
        assert!(!batch[0].infinity);
        assert!(batch[1].infinity);
        assert_eq!(batch[2], points[2].to_affine());
    }

    #[test]
    fn sec1_compressed_round_trip() {
        let p = JacobianPoint::mul_generator(&U256::from_u64(0xCAFE)).to_affine();
        let encoded = p.to_compressed();
        let decoded = AffinePoint::from_sec1(&encoded).unwrap();
        assert_eq!(decoded, p);
    }

    #[test]
    fn sec1_uncompressed_round_trip() {
        let p = JacobianPoint::mul_generator(&U256::from_u64(0xBEEF)).to_affine();
        let encoded = p.to_uncompressed();
        let decoded = AffinePoint::from_sec1(&encoded).unwrap();
        assert_eq!(decoded, p);
    }

    #[test]
    fn sec1_rejects_off_curve() {
        let mut bad = JacobianPoint::GENERATOR.to_affine().to_uncompressed();
        bad[64] ^= 1;
        assert!(AffinePoint::from_sec1(&bad).is_err());
    }
}
