//! Field, group, and big-integer arithmetic for secp256k1

pub mod curve;
pub mod field;
pub mod u256;

pub use curve::{batch_to_affine, AffinePoint, JacobianPoint, BETA, LAMBDA, N};
pub use field::{Fe, P};
pub use u256::U256;
