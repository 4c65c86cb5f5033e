//! Integrity checksums for spool records.

use std::fmt;

/// A 64-bit XXH3 checksum stored alongside every spool record.
///
/// A record whose payload no longer matches its checksum was torn by an
/// interrupted write or damaged afterwards.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordChecksum(u64);

impl RecordChecksum {
    /// Size of the encoded checksum in bytes.
    pub const LEN: usize = 8;

    /// Computes the checksum of a record payload.
    pub fn of(payload: &[u8]) -> Self {
        Self(xxhash_rust::xxh3::xxh3_64(payload))
    }

    /// Decodes a checksum from its little-endian on-disk form.
    pub fn from_le_bytes(bytes: [u8; Self::LEN]) -> Self {
        Self(u64::from_le_bytes(bytes))
    }

    /// Encodes the checksum in its little-endian on-disk form.
    pub fn to_le_bytes(self) -> [u8; Self::LEN] {
        self.0.to_le_bytes()
    }

    /// Returns `true` if `payload` hashes to this checksum.
    pub fn verify(self, payload: &[u8]) -> bool {
        Self::of(payload) == self
    }
}

impl fmt::Display for RecordChecksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl fmt::Debug for RecordChecksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordChecksum({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic() {
        assert_eq!(RecordChecksum::of(b"record"), RecordChecksum::of(b"record"));
        assert_ne!(RecordChecksum::of(b"record"), RecordChecksum::of(b"recore"));
    }

    #[test]
    fn verify_detects_damage() {
        let sum = RecordChecksum::of(b"payload");
        assert!(sum.verify(b"payload"));
        assert!(!sum.verify(b"paylo"));
    }

    #[test]
    fn byte_roundtrip() {
        let sum = RecordChecksum::of(b"bytes");
        assert_eq!(RecordChecksum::from_le_bytes(sum.to_le_bytes()), sum);
    }

    #[test]
    fn display_is_sixteen_hex_digits() {
        let s = RecordChecksum::of(b"x").to_string();
        assert_eq!(s.len(), 16);
        assert!(s.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
