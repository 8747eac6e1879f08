//! Bloom prefilters for the baby-step table
//!
//! Three variants: a flat single-layer filter, a cascading stack of
//! geometrically shrinking filters, and a partitioned filter whose shards
//! carry independent locks so a multi-threaded build contends on at most
//! one mutex per insert.
//!
//! The probe positions all derive from one 64-bit FNV-1a hash; position i
//! is (h ^ i*GOLDEN) mod B. No cryptographic strength needed, only
//! approximate pairwise independence on uniform input.

use anyhow::{bail, Context, Result};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

const GOLDEN: u64 = 0x9E37_79B9_7F4A_7C15;

const FNV64_OFFSET: u64 = 0xCBF2_9CE4_8422_2325;
const FNV64_PRIME: u64 = 0x0000_0100_0000_01B3;

const FNV32_OFFSET: u32 = 0x811C_9DC5;
const FNV32_PRIME: u32 = 0x0100_0193;

/// 64-bit FNV-1a; source of all bloom probe positions.
#[inline]
pub fn fnv1a64(data: &[u8]) -> u64 {
    let mut h = FNV64_OFFSET;
    for &b in data {
        h ^= b as u64;
        h = h.wrapping_mul(FNV64_PRIME);
    }
    h
}

/// 32-bit fingerprint of an affine X coordinate, FNV-1a over its
/// big-endian bytes. This is the xhash of the baby-step records.
#[inline]
pub fn fingerprint(x_bytes: &[u8; 32]) -> u32 {
    let mut h = FNV32_OFFSET;
    for &b in x_bytes {
        h ^= b as u32;
        h = h.wrapping_mul(FNV32_PRIME);
    }
    h
}

#[inline]
fn probe_position(h64: u64, i: usize, num_bits: u64) -> u64 {
    (h64 ^ (i as u64).wrapping_mul(GOLDEN)) % num_bits
}

/// Query counters, updated with relaxed ordering; a snapshot across both
/// is approximate.
#[derive(Debug, Default)]
pub struct BloomStats {
    pub queries: AtomicU64,
    pub positives: AtomicU64,
}

impl BloomStats {
    pub fn actual_positive_rate(&self) -> f64 {
        let q = self.queries.load(Ordering::Relaxed);
        if q == 0 {
            return 0.0;
        }
        self.positives.load(Ordering::Relaxed) as f64 / q as f64
    }
}

/// Flat bloom filter over u64 hashes.
#[derive(Debug)]
pub struct BloomFilter {
    bits: Vec<u8>,
    num_bits: u64,
    num_hashes: u32,
    items_added: u64,
    stats: BloomStats,
}

impl BloomFilter {
    /// Size the filter for `expected_items` at the target false-positive
    /// rate.
    pub fn with_capacity(expected_items: u64, fp_rate: f64) -> Self {
        let num_bits = Self::optimal_bits(expected_items, fp_rate);
        let num_hashes = Self::optimal_hashes(num_bits, expected_items);
        Self::from_dimensions(num_bits, num_hashes)
    }

    pub fn from_dimensions(num_bits: u64, num_hashes: u32) -> Self {
        let num_bits = num_bits.max(64);
        let num_hashes = num_hashes.clamp(1, 32);
        Self {
            bits: vec![0u8; num_bits.div_ceil(8) as usize],
            num_bits,
            num_hashes,
            items_added: 0,
            stats: BloomStats::default(),
        }
    }

    /// ceil(-n * ln(p) / ln(2)^2)
    pub fn optimal_bits(items: u64, fp_rate: f64) -> u64 {
        let p = fp_rate.clamp(1e-12, 0.5);
        let n = items.max(1) as f64;
        (-n * p.ln() / (std::f64::consts::LN_2 * std::f64::consts::LN_2)).ceil() as u64
    }

    /// round(B/n * ln(2))
    pub fn optimal_hashes(bits: u64, items: u64) -> u32 {
        let k = (bits as f64 / items.max(1) as f64 * std::f64::consts::LN_2).round();
        (k as u32).clamp(1, 32)
    }

    pub fn add(&mut self, h64: u64) {
        for i in 0..self.num_hashes as usize {
            let pos = probe_position(h64, i, self.num_bits);
            self.bits[(pos / 8) as usize] |= 1 << (pos % 8);
        }
        self.items_added += 1;
    }

    /// False iff definitely absent.
    pub fn test(&self, h64: u64) -> bool {
        self.stats.queries.fetch_add(1, Ordering::Relaxed);
        for i in 0..self.num_hashes as usize {
            let pos = probe_position(h64, i, self.num_bits);
            if self.bits[(pos / 8) as usize] >> (pos % 8) & 1 == 0 {
                return false;
            }
        }
        self.stats.positives.fetch_add(1, Ordering::Relaxed);
        true
    }

    pub fn clear(&mut self) {
        self.bits.fill(0);
        self.items_added = 0;
    }

    pub fn num_bits(&self) -> u64 {
        self.num_bits
    }

    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    pub fn items_added(&self) -> u64 {
        self.items_added
    }

    pub fn memory_usage(&self) -> usize {
        self.bits.len()
    }

    pub fn stats(&self) -> &BloomStats {
        &self.stats
    }

    /// Predicted false-positive rate at the current fill level.
    pub fn expected_fp_rate(&self) -> f64 {
        let k = self.num_hashes as f64;
        let n = self.items_added as f64;
        let m = self.num_bits as f64;
        (1.0 - (-k * n / m).exp()).powf(k)
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_all(&self.num_bits.to_le_bytes())?;
        w.write_all(&self.num_hashes.to_le_bytes())?;
        w.write_all(&self.items_added.to_le_bytes())?;
        w.write_all(&self.bits)?;
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let mut u64_buf = [0u8; 8];
        let mut u32_buf = [0u8; 4];

        r.read_exact(&mut u64_buf).context("bloom header truncated")?;
        let num_bits = u64::from_le_bytes(u64_buf);
        r.read_exact(&mut u32_buf).context("bloom header truncated")?;
        let num_hashes = u32::from_le_bytes(u32_buf);
        r.read_exact(&mut u64_buf).context("bloom header truncated")?;
        let items_added = u64::from_le_bytes(u64_buf);

        if num_bits == 0 || num_bits > 1 << 43 || !(1..=32).contains(&num_hashes) {
            bail!("bloom header out of range: {num_bits} bits / {num_hashes} hashes");
        }

        let mut bits = vec![0u8; num_bits.div_ceil(8) as usize];
        r.read_exact(&mut bits).context("bloom bit array truncated")?;

        Ok(Self {
            bits,
            num_bits,
            num_hashes,
            items_added,
            stats: BloomStats::default(),
        })
    }
}

/// Stack of bloom filters with geometrically decreasing size; the combined
/// false-positive probability is roughly the product of the levels'.
#[derive(Debug)]
pub struct CascadingBloomFilter {
    levels: Vec<BloomFilter>,
}

impl CascadingBloomFilter {
    pub fn with_capacity(expected_items: u64, num_levels: usize, base_fp_rate: f64) -> Self {
        let num_levels = num_levels.max(1);
        let levels = (0..num_levels)
            .map(|i| {
                let bits = (BloomFilter::optimal_bits(expected_items, base_fp_rate) >> i).max(64);
                let hashes = BloomFilter::optimal_hashes(bits, expected_items) + i as u32;
                BloomFilter::from_dimensions(bits, hashes)
            })
            .collect();
        Self { levels }
    }

    pub fn add(&mut self, h64: u64) {
        for level in &mut self.levels {
            level.add(h64);
        }
    }

    /// A miss at any level short-circuits.
    pub fn test(&self, h64: u64) -> bool {
        self.levels.iter().all(|level| level.test(h64))
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    pub fn level(&self, idx: usize) -> &BloomFilter {
        &self.levels[idx]
    }

    pub fn memory_usage(&self) -> usize {
        self.levels.iter().map(BloomFilter::memory_usage).sum()
    }

    pub fn combined_fp_rate(&self) -> f64 {
        self.levels.iter().map(BloomFilter::expected_fp_rate).product()
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_all(&(self.levels.len() as u32).to_le_bytes())?;
        for level in &self.levels {
            level.write_to(w)?;
        }
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let mut u32_buf = [0u8; 4];
        r.read_exact(&mut u32_buf).context("cascade header truncated")?;
        let count = u32::from_le_bytes(u32_buf);
        if count == 0 || count > 16 {
            bail!("cascade level count out of range: {count}");
        }
        let levels = (0..count)
            .map(|_| BloomFilter::read_from(r))
            .collect::<Result<_>>()?;
        Ok(Self { levels })
    }
}

/// Sharded filter for concurrent build. The shard is chosen by the top
/// 8 bits of the hash, so an insert locks exactly one of 256 mutexes.
pub struct PartitionedBloomFilter {
    shards: Vec<Mutex<BloomFilter>>,
    shard_shift: u32,
}

impl PartitionedBloomFilter {
    pub fn with_capacity(expected_items: u64, num_shards: usize, fp_rate: f64) -> Self {
        let num_shards = num_shards.clamp(1, 1 << 16).next_power_of_two();
        let per_shard = (expected_items / num_shards as u64).max(1);
        let shards = (0..num_shards)
            .map(|_| Mutex::new(BloomFilter::with_capacity(per_shard, fp_rate)))
            .collect();
        Self {
            shards,
            shard_shift: 64 - num_shards.trailing_zeros(),
        }
    }

    #[inline]
    fn shard_index(&self, h64: u64) -> usize {
        if self.shard_shift >= 64 {
            0
        } else {
            (h64 >> self.shard_shift) as usize
        }
    }

    pub fn add(&self, h64: u64) {
        let mut shard = self.shards[self.shard_index(h64)]
            .lock()
            .expect("bloom shard mutex poisoned");
        shard.add(h64);
    }

    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    pub fn memory_usage(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().expect("bloom shard mutex poisoned").memory_usage())
            .sum()
    }

    /// Drop the locks once the build is done; probes on the frozen filter
    /// are plain reads.
    pub fn freeze(self) -> FrozenPartitionedBloom {
        FrozenPartitionedBloom {
            shards: self
                .shards
                .into_iter()
                .map(|s| s.into_inner().expect("bloom shard mutex poisoned"))
                .collect(),
            shard_shift: self.shard_shift,
        }
    }
}

/// Immutable partitioned filter; see [`PartitionedBloomFilter::freeze`].
pub struct FrozenPartitionedBloom {
    shards: Vec<BloomFilter>,
    shard_shift: u32,
}

impl FrozenPartitionedBloom {
    pub fn test(&self, h64: u64) -> bool {
        let idx = if self.shard_shift >= 64 {
            0
        } else {
            (h64 >> self.shard_shift) as usize
        };
        self.shards[idx].test(h64)
    }

    pub fn memory_usage(&self) -> usize {
        self.shards.iter().map(BloomFilter::memory_usage).sum()
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_all(&(self.shards.len() as u32).to_le_bytes())?;
        w.write_all(&self.shard_shift.to_le_bytes())?;
        for shard in &self.shards {
            shard.write_to(w)?;
        }
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let mut u32_buf = [0u8; 4];
        r.read_exact(&mut u32_buf).context("partition header truncated")?;
        let count = u32::from_le_bytes(u32_buf);
        r.read_exact(&mut u32_buf).context("partition header truncated")?;
        let shard_shift = u32::from_le_bytes(u32_buf);
        if count == 0 || count > 1 << 16 || !count.is_power_of_two() {
            bail!("partition shard count out of range: {count}");
        }
        let shards = (0..count)
            .map(|_| BloomFilter::read_from(r))
            .collect::<Result<_>>()?;
        Ok(Self {
            shards,
            shard_shift,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn no_false_negatives() {
        let mut filter = BloomFilter::with_capacity(10_000, 0.001);
        let hashes: Vec<u64> = (0..10_000u64).map(|i| fnv1a64(&i.to_le_bytes())).collect();
        for &h in &hashes {
            filter.add(h);
        }
        for &h in &hashes {
            assert!(filter.test(h));
        }
    }

    #[test]
    fn false_positive_rate_near_target() {
        let mut filter = BloomFilter::with_capacity(10_000, 0.01);
        for i in 0..10_000u64 {
            filter.add(fnv1a64(&i.to_le_bytes()));
        }
        let mut false_hits = 0u32;
        let probes = 20_000u64;
        for i in 0..probes {
            if filter.test(fnv1a64(&(1_000_000 + i).to_le_bytes())) {
                false_hits += 1;
            }
        }
        let rate = false_hits as f64 / probes as f64;
        assert!(rate < 0.05, "observed fp rate {rate} too far above target");
    }

    #[test]
    fn optimal_parameter_formulas() {
        // classic reference values: n=1M, p=0.01 -> ~9.59M bits, 7 hashes
        let bits = BloomFilter::optimal_bits(1_000_000, 0.01);
        assert!((9_500_000..9_700_000).contains(&bits));
        assert_eq!(BloomFilter::optimal_hashes(bits, 1_000_000), 7);
    }

    #[test]
    fn stats_count_queries() {
        let mut filter = BloomFilter::with_capacity(100, 0.01);
        filter.add(fnv1a64(b"hit"));
        filter.test(fnv1a64(b"hit"));
        filter.test(fnv1a64(b"miss-a"));
        filter.test(fnv1a64(b"miss-b"));
        assert_eq!(filter.stats().queries.load(Ordering::Relaxed), 3);
        assert!(filter.stats().actual_positive_rate() > 0.0);
    }

    #[test]
    fn serialization_round_trip() {
        let mut filter = BloomFilter::with_capacity(1000, 0.001);
        for i in 0..1000u64 {
            filter.add(fnv1a64(&i.to_le_bytes()));
        }
        let mut buf = Vec::new();
        filter.write_to(&mut buf).unwrap();
        let restored = BloomFilter::read_from(&mut buf.as_slice()).unwrap();
        assert_eq!(restored.num_bits(), filter.num_bits());
        assert_eq!(restored.items_added(), 1000);
        for i in 0..1000u64 {
            assert!(restored.test(fnv1a64(&i.to_le_bytes())));
        }
    }

    #[test]
    fn cascade_shrinks_and_short_circuits() {
        let mut cascade = CascadingBloomFilter::with_capacity(5_000, 3, 0.01);
        assert_eq!(cascade.num_levels(), 3);
        assert!(cascade.level(0).num_bits() > cascade.level(2).num_bits());

        for i in 0..5_000u64 {
            cascade.add(fnv1a64(&i.to_le_bytes()));
        }
        for i in 0..5_000u64 {
            assert!(cascade.test(fnv1a64(&i.to_le_bytes())));
        }
        assert!(cascade.combined_fp_rate() < cascade.level(0).expected_fp_rate() * 1.01);
    }

    #[test]
    fn partitioned_concurrent_insert() {
        let filter = Arc::new(PartitionedBloomFilter::with_capacity(40_000, 256, 0.001));
        let mut handles = Vec::new();
        for t in 0..4u64 {
            let filter = Arc::clone(&filter);
            handles.push(std::thread::spawn(move || {
                for i in (t * 10_000)..((t + 1) * 10_000) {
                    filter.add(fnv1a64(&i.to_le_bytes()));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let frozen = Arc::into_inner(filter).unwrap().freeze();
        for i in 0..40_000u64 {
            assert!(frozen.test(fnv1a64(&i.to_le_bytes())));
        }
    }

    #[test]
    fn fingerprint_is_stable() {
        let x = [0xABu8; 32];
        assert_eq!(fingerprint(&x), fingerprint(&x));
        let mut y = x;
        y[31] ^= 1;
        assert_ne!(fingerprint(&x), fingerprint(&y));
    }
}
