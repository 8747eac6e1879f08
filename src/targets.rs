//! Search targets: public keys or address hashes
//!
//! The engine accepts a tagged variant per target. A public key enables
//! the BSGS walk; a bare hash160 only supports the exhaustive scan, since
//! baby-step/giant-step needs the point itself. Address strings are
//! decoded through the `bitcoin` crate.

use crate::math::AffinePoint;
use anyhow::{anyhow, bail, Context, Result};
use bitcoin::address::NetworkUnchecked;
use bitcoin::hashes::{hash160, Hash};
use std::fmt;
use std::path::Path;

/// Which pubkey serializations candidate points are matched under.
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum, Default)]
pub enum Compression {
    #[default]
    Compressed,
    Uncompressed,
    Both,
}

impl Compression {
    pub(crate) fn tag(self) -> u8 {
        match self {
            Compression::Compressed => 0,
            Compression::Uncompressed => 1,
            Compression::Both => 2,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Result<Self> {
        Ok(match tag {
            0 => Compression::Compressed,
            1 => Compression::Uncompressed,
            2 => Compression::Both,
            t => bail!("unknown compression tag {t}"),
        })
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Compression::Compressed => "compressed",
            Compression::Uncompressed => "uncompressed",
            Compression::Both => "both",
        };
        f.write_str(name)
    }
}

/// One search target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Target {
    /// Full public key; supports the BSGS walk.
    PubKey(AffinePoint),
    /// RIPEMD160(SHA256(pubkey)); scan mode only.
    Hash160([u8; 20]),
}

impl Target {
    /// Parse one targets-file line: hex pubkey (66 or 130 chars), hex
    /// hash160 (40 chars), or an address string.
    pub fn parse(input: &str) -> Result<Self> {
        let s = input.trim().trim_start_matches("0x");
        if s.is_empty() {
            bail!("empty target");
        }

        if s.len() == 66 || s.len() == 130 {
            let bytes = hex::decode(s).with_context(|| format!("invalid pubkey hex {s:?}"))?;
            let point = AffinePoint::from_sec1(&bytes)
                .with_context(|| format!("invalid public key {s:?}"))?;
            return Ok(Target::PubKey(point));
        }

        if s.len() == 40 {
            if let Ok(bytes) = hex::decode(s) {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(&bytes);
                return Ok(Target::Hash160(hash));
            }
        }

        Self::from_address(input.trim())
    }

    /// Decode a Base58Check or Bech32 address to its hash160.
    pub fn from_address(address: &str) -> Result<Self> {
        let parsed: bitcoin::Address<NetworkUnchecked> = address
            .parse()
            .map_err(|e| anyhow!("unparseable target {address:?}: {e}"))?;
        let script = parsed.assume_checked().script_pubkey();
        let bytes = script.as_bytes();

        let hash_slice = if script.is_p2pkh() {
            &bytes[3..23]
        } else if script.is_p2wpkh() {
            &bytes[2..22]
        } else {
            bail!("address {address:?} does not commit to a pubkey hash");
        };

        let mut hash = [0u8; 20];
        hash.copy_from_slice(hash_slice);
        Ok(Target::Hash160(hash))
    }

    /// Load a targets file: one target per line, blank lines and
    /// #-comments ignored.
    pub fn load_file(path: &Path) -> Result<Vec<Self>> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("read targets file {}", path.display()))?;
        let mut targets = Vec::new();
        for (line_no, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let target = Self::parse(line)
                .with_context(|| format!("targets file line {}", line_no + 1))?;
            targets.push(target);
        }
        if targets.is_empty() {
            bail!("targets file {} contains no targets", path.display());
        }
        Ok(targets)
    }

    pub fn is_pubkey(&self) -> bool {
        matches!(self, Target::PubKey(_))
    }

    /// The hash160 this target verifies against, for checkpoint records.
    pub fn id_hash(&self, compression: Compression) -> [u8; 20] {
        match self {
            Target::Hash160(h) => *h,
            Target::PubKey(p) => {
                let encoded: &[u8] = match compression {
                    Compression::Uncompressed => &p.to_uncompressed(),
                    _ => &p.to_compressed(),
                };
                hash160_of(encoded)
            }
        }
    }

    /// Does a candidate point satisfy this target under the configured
    /// compression?
    pub fn matches_point(&self, point: &AffinePoint, compression: Compression) -> bool {
        match self {
            Target::PubKey(p) => point == p,
            Target::Hash160(expected) => {
                let compressed = matches!(
                    compression,
                    Compression::Compressed | Compression::Both
                ) && hash160_of(&point.to_compressed()) == *expected;
                if compressed {
                    return true;
                }
                matches!(
                    compression,
                    Compression::Uncompressed | Compression::Both
                ) && hash160_of(&point.to_uncompressed()) == *expected
            }
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::PubKey(p) => write!(f, "pubkey:{}", hex::encode(p.to_compressed())),
            Target::Hash160(h) => write!(f, "hash160:{}", hex::encode(h)),
        }
    }
}

/// RIPEMD160(SHA256(data)).
pub fn hash160_of(data: &[u8]) -> [u8; 20] {
    let hash = hash160::Hash::hash(data);
    let mut out = [0u8; 20];
    out.copy_from_slice(hash.as_ref());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::{JacobianPoint, U256};

    #[test]
    fn parses_compressed_pubkey() {
        let point = JacobianPoint::mul_generator(&U256::from_u64(0x1234)).to_affine();
        let hex_str = hex::encode(point.to_compressed());
        match Target::parse(&hex_str).unwrap() {
            Target::PubKey(p) => assert_eq!(p, point),
            other => panic!("expected pubkey target, got {other}"),
        }
    }

    #[test]
    fn parses_uncompressed_pubkey() {
        let point = JacobianPoint::mul_generator(&U256::from_u64(99)).to_affine();
        let hex_str = hex::encode(point.to_uncompressed());
        match Target::parse(&hex_str).unwrap() {
            Target::PubKey(p) => assert_eq!(p, point),
            other => panic!("expected pubkey target, got {other}"),
        }
    }

    #[test]
    fn parses_hash160_hex() {
        let target = Target::parse("751e76e8199196d454941c45d1b3a323f1433bd6").unwrap();
        assert!(matches!(target, Target::Hash160(_)));
    }

    #[test]
    fn parses_p2pkh_address() {
        // hash160 of the generator's compressed pubkey (key = 1)
        let target = Target::from_address("1BgGZ9tcN4rm9KBzDn7KprQz87SZ26SAMH").unwrap();
        let g = JacobianPoint::GENERATOR.to_affine();
        assert_eq!(
            target,
            Target::Hash160(hash160_of(&g.to_compressed()))
        );
    }

    #[test]
    fn parses_p2wpkh_address() {
        let target = Target::from_address("bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4").unwrap();
        assert!(matches!(target, Target::Hash160(_)));
    }

    #[test]
    fn rejects_garbage() {
        assert!(Target::parse("").is_err());
        assert!(Target::parse("not-a-target").is_err());
        assert!(Target::parse(&"f".repeat(66)).is_err()); // not on curve prefix
    }

    #[test]
    fn matches_point_by_hash() {
        let point = JacobianPoint::mul_generator(&U256::from_u64(7777)).to_affine();
        let target = Target::Hash160(hash160_of(&point.to_compressed()));
        assert!(target.matches_point(&point, Compression::Compressed));
        assert!(target.matches_point(&point, Compression::Both));
        assert!(!target.matches_point(&point, Compression::Uncompressed));
    }

    #[test]
    fn matches_point_exact_pubkey() {
        let point = JacobianPoint::mul_generator(&U256::from_u64(42)).to_affine();
        let target = Target::PubKey(point);
        assert!(target.matches_point(&point, Compression::Compressed));
        let other = JacobianPoint::mul_generator(&U256::from_u64(43)).to_affine();
        assert!(!target.matches_point(&other, Compression::Compressed));
    }
}
