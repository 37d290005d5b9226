use crc::{Crc, CRC_64_ECMA_182};

static CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

/// Streaming CRC-64 used for the per-entry checksums in the WAL, the value
/// log, and the index edit log.
pub struct Hasher {
    digest: crc::Digest<'static, u64>,
}

impl Hasher {
    pub fn new() -> Self {
        Self {
            digest: CRC64.digest(),
        }
    }

    /// Feeds bytes into the checksum.
    pub fn write(&mut self, bytes: &[u8]) {
        self.digest.update(bytes);
    }

    /// Finalizes and returns the checksum.
    pub fn checksum(self) -> u64 {
        self.digest.finalize()
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_is_deterministic() {
        let mut a = Hasher::new();
        a.write(b"key1");
        a.write(b"value1");

        let mut b = Hasher::new();
        b.write(b"key1");
        b.write(b"value1");

        assert_eq!(a.checksum(), b.checksum());
    }

    #[test]
    fn test_checksum_detects_changes() {
        let mut a = Hasher::new();
        a.write(b"key1");
        a.write(b"value1");

        let mut b = Hasher::new();
        b.write(b"key1");
        b.write(b"value2");

        assert_ne!(a.checksum(), b.checksum());
    }

    #[test]
    fn test_split_writes_match_single_write() {
        let mut split = Hasher::new();
        split.write(b"key1");
        split.write(b"value1");

        let mut single = Hasher::new();
        single.write(b"key1value1");

        assert_eq!(split.checksum(), single.checksum());
    }
}
