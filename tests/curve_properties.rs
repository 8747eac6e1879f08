//! Arithmetic properties of the field and group layers, cross-checked
//! against k256 as a golden reference.

use bsgs::{AffinePoint, Fe, JacobianPoint, U256};
use k256::elliptic_curve::ops::MulByGenerator;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::{ProjectivePoint, Scalar};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn random_u256(rng: &mut StdRng) -> U256 {
    let mut bytes = [0u8; 32];
    rng.fill(&mut bytes);
    U256::from_be_bytes(&bytes)
}

fn random_fe(rng: &mut StdRng) -> Fe {
    Fe::from_u256(random_u256(rng))
}

fn k256_pubkey(k: u64) -> ([u8; 32], [u8; 32]) {
    let scalar = Scalar::from(k);
    let point = ProjectivePoint::mul_by_generator(&scalar).to_affine();
    let encoded = point.to_encoded_point(false);
    let mut x = [0u8; 32];
    let mut y = [0u8; 32];
    x.copy_from_slice(encoded.x().unwrap());
    y.copy_from_slice(encoded.y().unwrap());
    (x, y)
}

#[test]
fn field_add_sub_cancels() {
    let mut rng = StdRng::seed_from_u64(11);
    for _ in 0..500 {
        let a = random_fe(&mut rng);
        let b = random_fe(&mut rng);
        assert_eq!(a.add(&b).sub(&b), a);
    }
}

#[test]
fn field_inverse_identity() {
    let mut rng = StdRng::seed_from_u64(12);
    for _ in 0..100 {
        let a = random_fe(&mut rng);
        if a.is_zero() {
            continue;
        }
        assert_eq!(a.mul(&a.inv()), Fe::ONE);
    }
}

#[test]
fn scalar_multiples_satisfy_curve_equation() {
    let mut rng = StdRng::seed_from_u64(13);
    for _ in 0..25 {
        let k = random_u256(&mut rng);
        let point = JacobianPoint::mul_generator(&k).to_affine();
        if point.infinity {
            continue;
        }
        assert!(point.is_on_curve(), "k*G must satisfy y^2 = x^3 + 7");
    }
}

#[test]
fn scalar_mul_is_additive_homomorphism() {
    let mut rng = StdRng::seed_from_u64(14);
    for _ in 0..20 {
        let a = U256::from_u64(rng.gen::<u64>());
        let b = U256::from_u64(rng.gen::<u64>());
        let sum = a.wrapping_add(&b);

        let lhs = JacobianPoint::mul_generator(&sum).to_affine();
        let rhs = JacobianPoint::mul_generator(&a)
            .add(&JacobianPoint::mul_generator(&b))
            .to_affine();
        assert_eq!(lhs, rhs, "(a+b)G must equal aG + bG");
    }
}

#[test]
fn doubling_equals_self_addition() {
    let mut rng = StdRng::seed_from_u64(15);
    for _ in 0..20 {
        let p = JacobianPoint::mul_generator(&U256::from_u64(rng.gen::<u64>() | 1));
        assert_eq!(p.double().to_affine(), p.add(&p).to_affine());
    }
}

#[test]
fn byte_serialization_is_big_endian_round_trip() {
    let mut rng = StdRng::seed_from_u64(16);
    for _ in 0..200 {
        let x = random_u256(&mut rng);
        let bytes = x.to_be_bytes();
        assert_eq!(bytes.len(), 32);
        assert_eq!(U256::from_be_bytes(&bytes), x);
    }
    // spot-check endianness against a known value
    let one = U256::ONE.to_be_bytes();
    assert_eq!(one[31], 1);
    assert!(one[..31].iter().all(|&b| b == 0));
}

#[test]
fn generator_multiples_match_k256() {
    let mut rng = StdRng::seed_from_u64(17);
    for _ in 0..30 {
        let k: u64 = rng.gen_range(1..u64::MAX);
        let ours = JacobianPoint::mul_generator(&U256::from_u64(k)).to_affine();
        let (x, y) = k256_pubkey(k);
        assert_eq!(ours.x.to_be_bytes(), x, "x mismatch for k={k}");
        assert_eq!(ours.y.to_be_bytes(), y, "y mismatch for k={k}");
    }
}

#[test]
fn sec1_parsing_matches_k256_encoding() {
    let mut rng = StdRng::seed_from_u64(18);
    for _ in 0..20 {
        let k: u64 = rng.gen_range(1..u64::MAX);
        let scalar = Scalar::from(k);
        let point = ProjectivePoint::mul_by_generator(&scalar).to_affine();

        let compressed = point.to_encoded_point(true);
        let ours = AffinePoint::from_sec1(compressed.as_bytes()).unwrap();
        let expected = JacobianPoint::mul_generator(&U256::from_u64(k)).to_affine();
        assert_eq!(ours, expected);
    }
}

#[test]
fn field_mul_matches_num_bigint_reference() {
    use num_bigint::BigUint;
    // p = 2^256 - 2^32 - 977
    let p = (BigUint::from(1u8) << 256u32) - (BigUint::from(1u8) << 32u32) - BigUint::from(977u32);
    let mut rng = StdRng::seed_from_u64(19);
    for _ in 0..200 {
        let a = random_fe(&mut rng);
        let b = random_fe(&mut rng);
        let ours = BigUint::from_bytes_be(&a.mul(&b).to_be_bytes());
        let theirs = BigUint::from_bytes_be(&a.to_be_bytes())
            * BigUint::from_bytes_be(&b.to_be_bytes())
            % &p;
        assert_eq!(ours, theirs);
    }
}
