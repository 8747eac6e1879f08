//! Checkpoint persistence
//!
//! Binary snapshot of a paused or running search: parameters, targets,
//! cursors, and results, closed by a CRC-32 trailer. Written through a
//! temp file and an atomic rename so observers never see a torn file.
//!
//! In addition to the required fields, the progress section records the
//! backward cursor (for the bothways mode) and the random-mode permutation
//! seed; both are needed to resume those modes deterministically.

use crate::engine::SearchMode;
use crate::math::U256;
use crate::range::KeyRange;
use crate::targets::{Compression, Target};
use anyhow::{bail, Context, Result};
use std::io::Write;
use std::path::Path;

pub const CHECKPOINT_MAGIC: u32 = 0x4B48434B; // "KHCK"
pub const CHECKPOINT_VERSION: u16 = 1;

const TAG_HASH160: u8 = 0;
const TAG_PUBKEY: u8 = 1;

/// Cursor and counter state at snapshot time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CheckpointProgress {
    /// Next unclaimed giant-step chunk boundary (forward direction, or the
    /// permutation cursor in random mode).
    pub next_giant_step: u64,
    /// Next unclaimed boundary for the backward cursor; only meaningful
    /// for the backward and bothways modes.
    pub next_giant_step_back: u64,
    /// Seed of the random-mode chunk permutation.
    pub rng_seed: u64,
    pub keys_checked: u64,
    pub elapsed_ms: u64,
}

/// One persisted result row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckpointResult {
    pub private_key: [u8; 32],
    pub target_hash: [u8; 20],
    pub found_at_ms: u64,
}

/// Complete snapshot contents.
#[derive(Clone, Debug)]
pub struct CheckpointData {
    pub mode: SearchMode,
    pub compression: Compression,
    pub m: u64,
    pub k_factor: u32,
    pub range: KeyRange,
    pub targets: Vec<Target>,
    pub progress: CheckpointProgress,
    pub results: Vec<CheckpointResult>,
}

impl CheckpointData {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(128 + self.targets.len() * 34 + self.results.len() * 60);

        buf.extend_from_slice(&CHECKPOINT_MAGIC.to_le_bytes());
        buf.extend_from_slice(&CHECKPOINT_VERSION.to_le_bytes());
        buf.push(self.mode.tag());
        buf.push(self.compression.tag());
        buf.extend_from_slice(&self.m.to_le_bytes());
        buf.extend_from_slice(&self.k_factor.to_le_bytes());
        buf.extend_from_slice(&self.range.start.to_be_bytes());
        buf.extend_from_slice(&self.range.end.to_be_bytes());
        buf.extend_from_slice(&(self.targets.len() as u32).to_le_bytes());

        for target in &self.targets {
            match target {
                Target::Hash160(h) => {
                    buf.push(TAG_HASH160);
                    buf.extend_from_slice(h);
                }
                Target::PubKey(p) => {
                    buf.push(TAG_PUBKEY);
                    buf.extend_from_slice(&p.to_compressed());
                }
            }
        }

        buf.extend_from_slice(&self.progress.next_giant_step.to_le_bytes());
        buf.extend_from_slice(&self.progress.keys_checked.to_le_bytes());
        buf.extend_from_slice(&self.progress.elapsed_ms.to_le_bytes());
        buf.extend_from_slice(&(self.results.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.progress.next_giant_step_back.to_le_bytes());
        buf.extend_from_slice(&self.progress.rng_seed.to_le_bytes());

        for result in &self.results {
            buf.extend_from_slice(&result.private_key);
            buf.extend_from_slice(&result.target_hash);
            buf.extend_from_slice(&result.found_at_ms.to_le_bytes());
        }

        let crc = crc32(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 4 + 2 + 2 + 8 + 4 + 64 + 4 + 32 + 4 {
            bail!("checkpoint truncated: {} bytes", bytes.len());
        }

        let (body, trailer) = bytes.split_at(bytes.len() - 4);
        let stored_crc = u32::from_le_bytes(trailer.try_into().expect("4-byte trailer"));
        let actual_crc = crc32(body);
        if stored_crc != actual_crc {
            bail!("checkpoint CRC mismatch: stored {stored_crc:08x}, computed {actual_crc:08x}");
        }

        let mut cursor = Reader { bytes: body, pos: 0 };

        let magic = cursor.u32()?;
        if magic != CHECKPOINT_MAGIC {
            bail!("not a checkpoint file: bad magic {magic:08x}");
        }
        let version = cursor.u16()?;
        if version != CHECKPOINT_VERSION {
            bail!("unsupported checkpoint version {version}");
        }
        let mode = SearchMode::from_tag(cursor.u8()?)?;
        let compression = Compression::from_tag(cursor.u8()?)?;
        let m = cursor.u64()?;
        let k_factor = cursor.u32()?;
        let range_lo = U256::from_be_bytes(&cursor.array::<32>()?);
        let range_hi = U256::from_be_bytes(&cursor.array::<32>()?);
        let range = KeyRange::new(range_lo, range_hi).context("checkpoint range")?;

        let target_count = cursor.u32()?;
        if target_count > 1 << 20 {
            bail!("checkpoint target count {target_count} out of range");
        }
        let mut targets = Vec::with_capacity(target_count as usize);
        for _ in 0..target_count {
            match cursor.u8()? {
                TAG_HASH160 => targets.push(Target::Hash160(cursor.array::<20>()?)),
                TAG_PUBKEY => {
                    let encoded = cursor.array::<33>()?;
                    let point = crate::math::AffinePoint::from_sec1(&encoded)
                        .context("checkpoint pubkey target")?;
                    targets.push(Target::PubKey(point));
                }
                t => bail!("unknown target tag {t}"),
            }
        }

        let next_giant_step = cursor.u64()?;
        let keys_checked = cursor.u64()?;
        let elapsed_ms = cursor.u64()?;
        let result_count = cursor.u32()?;
        let next_giant_step_back = cursor.u64()?;
        let rng_seed = cursor.u64()?;

        if result_count > 1 << 20 {
            bail!("checkpoint result count {result_count} out of range");
        }
        let mut results = Vec::with_capacity(result_count as usize);
        for _ in 0..result_count {
            results.push(CheckpointResult {
                private_key: cursor.array::<32>()?,
                target_hash: cursor.array::<20>()?,
                found_at_ms: cursor.u64()?,
            });
        }

        Ok(Self {
            mode,
            compression,
            m,
            k_factor,
            range,
            targets,
            progress: CheckpointProgress {
                next_giant_step,
                next_giant_step_back,
                rng_seed,
                keys_checked,
                elapsed_ms,
            },
            results,
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        atomic_write(path, &self.encode())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("read checkpoint {}", path.display()))?;
        Self::decode(&bytes)
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn take(&mut self, n: usize) -> Result<&[u8]> {
        if self.pos + n > self.bytes.len() {
            bail!("checkpoint truncated at offset {}", self.pos);
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().expect("sized slice")))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().expect("sized slice")))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().expect("sized slice")))
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        Ok(self.take(N)?.try_into().expect("sized slice"))
    }
}

/// CRC-32 (IEEE, reflected), the polynomial every zip/png reader expects.
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            if crc & 1 == 1 {
                crc = (crc >> 1) ^ 0xEDB8_8320;
            } else {
                crc >>= 1;
            }
        }
    }
    !crc
}

/// Write a file through a temp sibling and an atomic rename.
pub(crate) fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = std::fs::File::create(&tmp)
            .with_context(|| format!("create {}", tmp.display()))?;
        file.write_all(bytes)
            .with_context(|| format!("write {}", tmp.display()))?;
        file.sync_all().ok();
    }
    std::fs::rename(&tmp, path)
        .with_context(|| format!("rename {} into place", tmp.display()))?;
    Ok(())
}
