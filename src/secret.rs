//! Wipe-on-drop container for recovered private keys

use crate::math::U256;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// A recovered private key. The backing bytes are zeroed when the value is
/// dropped; cloning copies into a fresh wiped-on-drop buffer.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey {
    bytes: [u8; 32],
}

impl SecretKey {
    pub fn from_u256(k: &U256) -> Self {
        Self {
            bytes: k.to_be_bytes(),
        }
    }

    pub fn from_be_bytes(bytes: [u8; 32]) -> Self {
        Self { bytes }
    }

    /// Big-endian bytes, full width.
    pub fn as_be_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }

    pub fn to_u256(&self) -> U256 {
        U256::from_be_bytes(&self.bytes)
    }

    /// Lower-case hex with leading zeros trimmed.
    pub fn to_hex(&self) -> String {
        self.to_u256().to_hex()
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // never leak key material through debug logging
        f.write_str("SecretKey(..)")
    }
}
