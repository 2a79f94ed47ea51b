use std::fmt;

use crc::{Algorithm, Crc};

pub const CRC_64_ECMA: Algorithm<u64> = crc::CRC_64_ECMA_182;

/// Rolling crc64 checksum used for WAL entry trailers and the log-wide
/// header checksum.
pub struct Hasher {
    rolling_checksum: u64,
    crc64: Crc<u64>,
}

impl fmt::Debug for Hasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hasher")
            .field("rolling_checksum", &self.rolling_checksum)
            .finish()
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

impl Hasher {
    /// Creates a new `Hasher` with an initial rolling checksum.
    pub fn new() -> Self {
        Self {
            rolling_checksum: 0,
            crc64: Crc::<u64>::new(&CRC_64_ECMA),
        }
    }

    /// Folds a chunk of bytes into the rolling checksum.
    pub fn write(&mut self, data: &[u8]) {
        self.rolling_checksum ^= self.crc64.checksum(data);
    }

    /// Returns the current rolling checksum.
    pub fn checksum(&self) -> u64 {
        self.rolling_checksum
    }

    /// Resets the rolling checksum to its initial state.
    pub fn reset(&mut self) {
        self.rolling_checksum = 0;
    }
}
