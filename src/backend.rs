//! Pluggable point-walk backends
//!
//! The engine's hot loop is a strided walk: start, start+D, start+2D, ...
//! normalized to affine for probing. That walk is the only piece that
//! differs between CPU and GPU, so it sits behind a small trait instead of
//! an engine-wide interface hierarchy; probing, verification, and
//! scheduling stay in one place.

use crate::math::{batch_to_affine, AffinePoint, JacobianPoint};
use anyhow::Result;

/// Computes consecutive strided points in affine form.
pub trait StepperBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Return `count` affine points: start, start+step, start+2*step, ...
    ///
    /// The first element is `start` itself.
    fn walk(
        &self,
        start: &JacobianPoint,
        step: &AffinePoint,
        count: usize,
    ) -> Result<Vec<AffinePoint>>;
}

/// CPU walker: incremental mixed Jacobian additions, normalized with one
/// batched inversion per [`CpuBackend::batch_size`] points.
pub struct CpuBackend {
    batch_size: usize,
}

impl CpuBackend {
    pub fn new() -> Self {
        Self { batch_size: 512 }
    }

    pub fn with_batch_size(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl StepperBackend for CpuBackend {
    fn name(&self) -> &str {
        "cpu"
    }

    fn walk(
        &self,
        start: &JacobianPoint,
        step: &AffinePoint,
        count: usize,
    ) -> Result<Vec<AffinePoint>> {
        let mut out = Vec::with_capacity(count);
        let mut current = *start;
        let mut batch = Vec::with_capacity(self.batch_size.min(count));

        let mut remaining = count;
        while remaining > 0 {
            batch.clear();
            let take = self.batch_size.min(remaining);
            for _ in 0..take {
                batch.push(current);
                current = current.add_affine(step);
            }
            out.extend(batch_to_affine(&batch));
            remaining -= take;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::U256;

    #[test]
    fn walk_matches_direct_multiplication() {
        let backend = CpuBackend::with_batch_size(7);
        let start = JacobianPoint::mul_generator(&U256::from_u64(1000));
        let step = JacobianPoint::mul_generator(&U256::from_u64(5)).to_affine();

        let walked = backend.walk(&start, &step, 23).unwrap();
        assert_eq!(walked.len(), 23);
        for (i, point) in walked.iter().enumerate() {
            let expected =
                JacobianPoint::mul_generator(&U256::from_u64(1000 + 5 * i as u64)).to_affine();
            assert_eq!(*point, expected, "walk diverged at offset {i}");
        }
    }

    #[test]
    fn walk_through_negative_stride() {
        let backend = CpuBackend::new();
        let start = JacobianPoint::mul_generator(&U256::from_u64(100));
        let step = JacobianPoint::mul_generator(&U256::from_u64(30))
            .negate()
            .to_affine();

        // 100, 70, 40, 10 then crossing into negative multiples
        let walked = backend.walk(&start, &step, 5).unwrap();
        assert_eq!(
            walked[3],
            JacobianPoint::mul_generator(&U256::from_u64(10)).to_affine()
        );
        // 100 - 4*30 = -20; x equals that of 20*G, y negated
        let twenty = JacobianPoint::mul_generator(&U256::from_u64(20)).to_affine();
        assert_eq!(walked[4].x, twenty.x);
        assert_eq!(walked[4].y, twenty.y.neg());
    }

    #[test]
    fn walk_crossing_infinity() {
        let backend = CpuBackend::new();
        let start = JacobianPoint::mul_generator(&U256::from_u64(2));
        let step = JacobianPoint::GENERATOR.negate().to_affine();

        // 2G, G, O, -G
        let walked = backend.walk(&start, &step, 4).unwrap();
        assert!(!walked[1].infinity);
        assert!(walked[2].infinity);
        assert_eq!(walked[3].x, JacobianPoint::GENERATOR.to_affine().x);
    }
}
