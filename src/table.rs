//! Baby-step table: bloom prefilter plus fingerprint probe index
//!
//! The table stores the affine X coordinates of i*G for i in [1, m], a
//! bloom filter over their 64-bit hashes, and a dense (xhash, index) probe
//! index sorted by the 32-bit fingerprint. A lookup is: bloom test, then
//! binary search on the fingerprint, then exact X comparison. The bloom
//! and the fingerprint can both lie positively; the byte compare cannot,
//! so false negatives are impossible.
//!
//! The table is immutable once built; probes are lock-free reads.

use crate::bloom::{
    fingerprint, fnv1a64, BloomFilter, CascadingBloomFilter, FrozenPartitionedBloom,
    PartitionedBloomFilter,
};
use crate::math::{batch_to_affine, JacobianPoint, U256};
use crate::pool::{TaskPriority, ThreadPool};
use anyhow::{bail, Context, Result};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex};
use tracing::{debug, info};

/// Montgomery-trick batch width for the build phase.
const BUILD_BATCH: usize = 1024;

const TABLE_MAGIC: u32 = 0x42535442; // "BSTB"
const TABLE_VERSION: u16 = 1;

/// One probe-index entry: fingerprint of an X coordinate and the row it
/// lives at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FingerprintRecord {
    pub xhash: u32,
    pub index: u32,
}

/// Which prefilter the table carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum BloomKind {
    #[default]
    Single,
    Cascading,
    Partitioned,
}

/// Prefilter sizing, in the units the search parameters use.
#[derive(Clone, Copy, Debug)]
pub struct BloomConfig {
    pub kind: BloomKind,
    pub bits_per_item: u32,
    pub hash_count: u32,
}

impl Default for BloomConfig {
    fn default() -> Self {
        Self {
            kind: BloomKind::Single,
            bits_per_item: 14,
            hash_count: 10,
        }
    }
}

enum Prefilter {
    Single(BloomFilter),
    Cascading(CascadingBloomFilter),
    Partitioned(FrozenPartitionedBloom),
}

impl Prefilter {
    fn test(&self, h64: u64) -> bool {
        match self {
            Prefilter::Single(f) => f.test(h64),
            Prefilter::Cascading(f) => f.test(h64),
            Prefilter::Partitioned(f) => f.test(h64),
        }
    }

    fn memory_usage(&self) -> usize {
        match self {
            Prefilter::Single(f) => f.memory_usage(),
            Prefilter::Cascading(f) => f.memory_usage(),
            Prefilter::Partitioned(f) => f.memory_usage(),
        }
    }

    fn kind_tag(&self) -> u8 {
        match self {
            Prefilter::Single(_) => 0,
            Prefilter::Cascading(_) => 1,
            Prefilter::Partitioned(_) => 2,
        }
    }
}

struct Segment {
    first_index: u64,
    xs: Vec<[u8; 32]>,
    records: Vec<FingerprintRecord>,
    hashes: Vec<u64>,
}

/// Immutable baby-step lookup structure.
pub struct BabyStepTable {
    m: u64,
    xs: Vec<[u8; 32]>,
    records: Vec<FingerprintRecord>,
    bloom: Prefilter,
}

impl BabyStepTable {
    /// Build the table for baby scalars 1..=m on the given pool.
    ///
    /// Workers walk disjoint sub-ranges with one incremental point
    /// addition per step and normalize to affine in batches (one field
    /// inversion per [`BUILD_BATCH`] points).
    pub fn build(m: u64, config: &BloomConfig, pool: &ThreadPool) -> Result<Self> {
        if m == 0 {
            bail!("baby-step table size must be at least 1");
        }
        if m > u32::MAX as u64 {
            bail!("baby-step table size {m} exceeds the u32 index space");
        }

        info!(
            "building baby-step table: m={m}, bloom={:?} ({} bits/item, {} hashes)",
            config.kind, config.bits_per_item, config.hash_count
        );

        let partitioned = match config.kind {
            BloomKind::Partitioned => Some(Arc::new(PartitionedBloomFilter::with_capacity(
                m,
                256,
                fp_rate_for_bits(config.bits_per_item),
            ))),
            _ => None,
        };

        let num_segments = pool.size().min(m as usize).max(1);
        let base = m / num_segments as u64;
        let extra = m % num_segments as u64;

        let segments: Arc<Mutex<Vec<Option<Segment>>>> =
            Arc::new(Mutex::new((0..num_segments).map(|_| None).collect()));
        let latch = Arc::new((Mutex::new(num_segments), Condvar::new()));

        let mut start = 1u64; // baby scalars are 1-based
        for seg_idx in 0..num_segments {
            let count = base + if (seg_idx as u64) < extra { 1 } else { 0 };
            let first_scalar = start;
            start += count;

            let segments = Arc::clone(&segments);
            let latch = Arc::clone(&latch);
            let partitioned = partitioned.clone();
            pool.submit(TaskPriority::High, move || {
                let segment = build_segment(first_scalar, count, partitioned.as_deref());
                // release the filter before signalling so the builder can
                // unwrap the Arc as soon as the latch opens
                drop(partitioned);
                segments.lock().expect("segment collection poisoned")[seg_idx] = Some(segment);
                let (remaining, done) = &*latch;
                let mut left = remaining.lock().expect("latch poisoned");
                *left -= 1;
                if *left == 0 {
                    done.notify_all();
                }
            });
        }

        {
            let (remaining, done) = &*latch;
            let mut left = remaining.lock().expect("latch poisoned");
            while *left > 0 {
                left = done.wait(left).expect("latch poisoned");
            }
        }

        let mut xs = Vec::with_capacity(m as usize);
        let mut records = Vec::with_capacity(m as usize);
        let mut hashes: Vec<u64> = Vec::new();

        let mut collected = segments
            .lock()
            .expect("segment collection poisoned")
            .drain(..)
            .map(|s| s.expect("missing build segment"))
            .collect::<Vec<_>>();
        collected.sort_by_key(|s| s.first_index);

        for segment in collected {
            debug_assert_eq!(segment.first_index as usize, xs.len() + 1);
            xs.extend(segment.xs);
            records.extend(segment.records);
            hashes.extend(segment.hashes);
        }

        let partitioned = partitioned.map(|arc| {
            Arc::into_inner(arc).expect("build tasks still hold the partitioned filter")
        });
        let bloom = match (config.kind, partitioned) {
            (BloomKind::Partitioned, Some(filter)) => Prefilter::Partitioned(filter.freeze()),
            (BloomKind::Single, _) => {
                let mut filter = BloomFilter::from_dimensions(
                    m.saturating_mul(config.bits_per_item as u64),
                    config.hash_count,
                );
                for &h in &hashes {
                    filter.add(h);
                }
                Prefilter::Single(filter)
            }
            (BloomKind::Cascading, _) => {
                let mut filter = CascadingBloomFilter::with_capacity(
                    m,
                    3,
                    fp_rate_for_bits(config.bits_per_item),
                );
                for &h in &hashes {
                    filter.add(h);
                }
                Prefilter::Cascading(filter)
            }
            (BloomKind::Partitioned, None) => unreachable!(),
        };

        records.sort_unstable_by_key(|r| (r.xhash, r.index));

        let table = Self {
            m,
            xs,
            records,
            bloom,
        };
        info!(
            "baby-step table ready: {} points, {} MiB",
            table.m,
            table.memory_usage() / (1024 * 1024)
        );
        Ok(table)
    }

    /// Baby scalar count m. Stored points are i*G for i in [1, m].
    pub fn m(&self) -> u64 {
        self.m
    }

    /// Look up an affine X coordinate (big-endian bytes).
    ///
    /// Returns the baby scalar i in [1, m] with (i*G).x equal to the
    /// input, or None. X-only matching means the caller learns i up to
    /// point negation and verifies the candidate key itself.
    pub fn lookup_x(&self, x_bytes: &[u8; 32]) -> Option<u64> {
        if !self.bloom.test(fnv1a64(x_bytes)) {
            return None;
        }

        let xhash = fingerprint(x_bytes);
        let start = self.records.partition_point(|r| r.xhash < xhash);
        for record in &self.records[start..] {
            if record.xhash != xhash {
                break;
            }
            if &self.xs[record.index as usize] == x_bytes {
                return Some(record.index as u64 + 1);
            }
        }
        None
    }

    pub fn memory_usage(&self) -> usize {
        self.xs.len() * 32 + self.records.len() * 8 + self.bloom.memory_usage()
    }

    /// Estimated build memory for sizing decisions, in bytes.
    pub fn estimated_memory(m: u64, config: &BloomConfig) -> u64 {
        let bloom_bytes = match config.kind {
            BloomKind::Cascading => {
                // three levels at 1x + 0.5x + 0.25x of the base size
                m.saturating_mul(config.bits_per_item as u64) * 7 / 4 / 8
            }
            _ => m.saturating_mul(config.bits_per_item as u64) / 8,
        };
        m.saturating_mul(40) + bloom_bytes
    }

    /// Persist to disk so a large build survives restarts.
    pub fn save(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("tmp");
        {
            let file = File::create(&tmp)
                .with_context(|| format!("create table file {}", tmp.display()))?;
            let mut w = BufWriter::new(file);

            w.write_all(&TABLE_MAGIC.to_le_bytes())?;
            w.write_all(&TABLE_VERSION.to_le_bytes())?;
            w.write_all(&[self.bloom.kind_tag(), 0])?;
            w.write_all(&self.m.to_le_bytes())?;

            for x in &self.xs {
                w.write_all(x)?;
            }
            for record in &self.records {
                w.write_all(&record.xhash.to_le_bytes())?;
                w.write_all(&record.index.to_le_bytes())?;
            }
            match &self.bloom {
                Prefilter::Single(f) => f.write_to(&mut w)?,
                Prefilter::Cascading(f) => f.write_to(&mut w)?,
                Prefilter::Partitioned(f) => f.write_to(&mut w)?,
            }
            w.flush()?;
        }
        std::fs::rename(&tmp, path)
            .with_context(|| format!("rename table file into {}", path.display()))?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file =
            File::open(path).with_context(|| format!("open table file {}", path.display()))?;
        let mut r = BufReader::new(file);

        let mut u32_buf = [0u8; 4];
        let mut u16_buf = [0u8; 2];
        let mut u64_buf = [0u8; 8];

        r.read_exact(&mut u32_buf).context("table header truncated")?;
        if u32::from_le_bytes(u32_buf) != TABLE_MAGIC {
            bail!("not a baby-step table file: bad magic");
        }
        r.read_exact(&mut u16_buf).context("table header truncated")?;
        let version = u16::from_le_bytes(u16_buf);
        if version != TABLE_VERSION {
            bail!("unsupported table version {version}");
        }
        r.read_exact(&mut u16_buf).context("table header truncated")?;
        let kind_tag = u16_buf[0];
        r.read_exact(&mut u64_buf).context("table header truncated")?;
        let m = u64::from_le_bytes(u64_buf);
        if m == 0 || m > u32::MAX as u64 {
            bail!("table size {m} out of range");
        }

        let mut xs = vec![[0u8; 32]; m as usize];
        for x in &mut xs {
            r.read_exact(x).context("table X rows truncated")?;
        }

        let mut records = Vec::with_capacity(m as usize);
        for _ in 0..m {
            r.read_exact(&mut u32_buf).context("table records truncated")?;
            let xhash = u32::from_le_bytes(u32_buf);
            r.read_exact(&mut u32_buf).context("table records truncated")?;
            let index = u32::from_le_bytes(u32_buf);
            if index as u64 >= m {
                bail!("table record index {index} out of range");
            }
            records.push(FingerprintRecord { xhash, index });
        }

        let bloom = match kind_tag {
            0 => Prefilter::Single(BloomFilter::read_from(&mut r)?),
            1 => Prefilter::Cascading(CascadingBloomFilter::read_from(&mut r)?),
            2 => Prefilter::Partitioned(FrozenPartitionedBloom::read_from(&mut r)?),
            t => bail!("unknown bloom kind tag {t}"),
        };

        debug!("loaded baby-step table: m={m}");
        Ok(Self {
            m,
            xs,
            records,
            bloom,
        })
    }
}

/// Compute one worker's slice of baby points.
fn build_segment(
    first_scalar: u64,
    count: u64,
    partitioned: Option<&PartitionedBloomFilter>,
) -> Segment {
    let g = JacobianPoint::GENERATOR.to_affine();
    let mut current = JacobianPoint::mul_generator(&U256::from_u64(first_scalar));

    let mut xs = Vec::with_capacity(count as usize);
    let mut records = Vec::with_capacity(count as usize);
    let mut hashes = if partitioned.is_some() {
        Vec::new()
    } else {
        Vec::with_capacity(count as usize)
    };

    let mut produced = 0u64;
    let mut batch = Vec::with_capacity(BUILD_BATCH);
    while produced < count {
        batch.clear();
        let take = BUILD_BATCH.min((count - produced) as usize);
        for _ in 0..take {
            batch.push(current);
            current = current.add_affine(&g);
        }

        for (offset, point) in batch_to_affine(&batch).iter().enumerate() {
            let index = (first_scalar - 1) + produced + offset as u64;
            let x_bytes = point.x.to_be_bytes();
            let h64 = fnv1a64(&x_bytes);
            match partitioned {
                Some(filter) => filter.add(h64),
                None => hashes.push(h64),
            }
            records.push(FingerprintRecord {
                xhash: fingerprint(&x_bytes),
                index: index as u32,
            });
            xs.push(x_bytes);
        }
        produced += take as u64;
    }

    Segment {
        first_index: first_scalar,
        xs,
        records,
        hashes,
    }
}

fn fp_rate_for_bits(bits_per_item: u32) -> f64 {
    // invert optimal_bits: p = exp(-bits * ln(2)^2)
    (-(bits_per_item.max(1) as f64) * std::f64::consts::LN_2 * std::f64::consts::LN_2).exp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::JacobianPoint;

    fn build_table(m: u64, kind: BloomKind) -> BabyStepTable {
        let pool = ThreadPool::new(4);
        let config = BloomConfig {
            kind,
            ..BloomConfig::default()
        };
        BabyStepTable::build(m, &config, &pool).unwrap()
    }

    #[test]
    fn lookup_finds_every_baby_point() {
        let table = build_table(500, BloomKind::Single);
        for i in 1u64..=500 {
            let point = JacobianPoint::mul_generator(&U256::from_u64(i)).to_affine();
            assert_eq!(
                table.lookup_x(&point.x.to_be_bytes()),
                Some(i),
                "baby point {i} must be found"
            );
        }
    }

    #[test]
    fn lookup_misses_outside_table() {
        let table = build_table(100, BloomKind::Single);
        for i in 101u64..200 {
            let point = JacobianPoint::mul_generator(&U256::from_u64(i)).to_affine();
            assert_eq!(table.lookup_x(&point.x.to_be_bytes()), None);
        }
    }

    #[test]
    fn partitioned_and_cascading_agree_with_single() {
        let single = build_table(200, BloomKind::Single);
        let cascading = build_table(200, BloomKind::Cascading);
        let partitioned = build_table(200, BloomKind::Partitioned);
        for i in 1u64..=200 {
            let point = JacobianPoint::mul_generator(&U256::from_u64(i)).to_affine();
            let x = point.x.to_be_bytes();
            assert_eq!(single.lookup_x(&x), Some(i));
            assert_eq!(cascading.lookup_x(&x), Some(i));
            assert_eq!(partitioned.lookup_x(&x), Some(i));
        }
    }

    #[test]
    fn save_load_round_trip() {
        let table = build_table(64, BloomKind::Cascading);
        let path = std::env::temp_dir().join(format!("bsgs-table-{}.bin", std::process::id()));
        table.save(&path).unwrap();
        let restored = BabyStepTable::load(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(restored.m(), 64);
        for i in 1u64..=64 {
            let point = JacobianPoint::mul_generator(&U256::from_u64(i)).to_affine();
            assert_eq!(restored.lookup_x(&point.x.to_be_bytes()), Some(i));
        }
    }

    #[test]
    fn rejects_zero_size() {
        let pool = ThreadPool::new(1);
        assert!(BabyStepTable::build(0, &BloomConfig::default(), &pool).is_err());
    }
}
