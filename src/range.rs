//! Scalar search ranges and work partitioning

use crate::math::U256;
use anyhow::{anyhow, bail, Result};
use std::time::Duration;

/// Inclusive scalar interval [start, end].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeyRange {
    pub start: U256,
    pub end: U256,
}

impl KeyRange {
    pub fn new(start: U256, end: U256) -> Result<Self> {
        if start > end {
            bail!(
                "inconsistent range: start 0x{} > end 0x{}",
                start.to_hex(),
                end.to_hex()
            );
        }
        Ok(Self { start, end })
    }

    /// Puzzle-style range for a bit count: [2^(n-1), 2^n - 1].
    pub fn for_bits(bit_count: u32) -> Result<Self> {
        if bit_count == 0 || bit_count > 256 {
            bail!("bit count must be between 1 and 256, got {bit_count}");
        }
        let mut start = U256::ZERO;
        start.set_bit(bit_count as usize - 1, true);
        let mut end = U256::ZERO;
        for i in 0..bit_count as usize {
            end.set_bit(i, true);
        }
        Ok(Self { start, end })
    }

    /// Parse a "lo:hi" hex pair; 0x prefixes and leading zeros optional.
    pub fn parse(spec: &str) -> Result<Self> {
        let (lo, hi) = spec
            .split_once(':')
            .ok_or_else(|| anyhow!("range must be lo:hi, got {spec:?}"))?;
        Self::new(U256::from_hex(lo)?, U256::from_hex(hi)?)
    }

    /// Number of scalars in the range. Wraps to zero only for the full
    /// 256-bit domain, which no caller constructs.
    pub fn size(&self) -> U256 {
        self.end.wrapping_sub(&self.start).wrapping_add(&U256::ONE)
    }

    pub fn contains(&self, key: &U256) -> bool {
        *key >= self.start && *key <= self.end
    }
}

impl std::fmt::Display for KeyRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.start.to_hex(), self.end.to_hex())
    }
}

/// Splits scalar ranges into disjoint covering chunks.
pub struct RangePartitioner;

impl RangePartitioner {
    /// Split into `n` near-equal parts; the remainder is distributed to
    /// the first (size mod n) chunks. Fewer than `n` chunks come back when
    /// the range has fewer than `n` scalars.
    pub fn split_equal(range: &KeyRange, n: usize) -> Vec<KeyRange> {
        if n == 0 {
            return Vec::new();
        }
        let size = range.size();
        let (quotient, remainder) = size.div_rem_u64(n as u64);

        let mut parts = Vec::with_capacity(n);
        let mut cursor = range.start;
        for i in 0..n as u64 {
            let mut chunk = quotient;
            if i < remainder {
                chunk = chunk.wrapping_add(&U256::ONE);
            }
            if chunk.is_zero() {
                continue;
            }
            let chunk_end = cursor.wrapping_add(&chunk).wrapping_sub(&U256::ONE);
            parts.push(KeyRange {
                start: cursor,
                end: chunk_end,
            });
            if chunk_end == range.end {
                break;
            }
            cursor = chunk_end.wrapping_add(&U256::ONE);
        }
        parts
    }

    /// Split into chunks of `chunk_size` scalars; the last chunk may be
    /// shorter.
    pub fn split_by_size(range: &KeyRange, chunk_size: &U256) -> Vec<KeyRange> {
        if chunk_size.is_zero() {
            return Vec::new();
        }
        let mut parts = Vec::new();
        let mut cursor = range.start;
        loop {
            let remaining = range.end.wrapping_sub(&cursor);
            let span = chunk_size.wrapping_sub(&U256::ONE);
            let chunk_end = if remaining < span {
                range.end
            } else {
                cursor.wrapping_add(&span)
            };
            parts.push(KeyRange {
                start: cursor,
                end: chunk_end,
            });
            if chunk_end == range.end {
                break;
            }
            cursor = chunk_end.wrapping_add(&U256::ONE);
        }
        parts
    }

    /// Chunk size targeting `target_chunk_time` of work per dispatch at
    /// the measured aggregate rate.
    pub fn optimal_chunk_size(
        range: &KeyRange,
        num_workers: usize,
        target_chunk_time: Duration,
        measured_keys_per_second: u64,
    ) -> U256 {
        let per_worker = measured_keys_per_second.max(1) / num_workers.max(1) as u64;
        let keys = (per_worker.max(1) as u128) * (target_chunk_time.as_millis().max(1)) / 1000;
        let candidate = U256::from_u64(keys.min(u64::MAX as u128) as u64).max(U256::ONE);
        candidate.min(range.size())
    }
}
