use adler2::Adler32;
use flate2::Crc;
use serde::{Deserialize, Serialize};

/// Initial value of the lzo CRC-32 running checksum.
pub const CRC32_INIT_VALUE: u32 = 0;

/// Initial value of the lzo Adler-32 running checksum.
pub const ADLER32_INIT_VALUE: u32 = 1;

/// Checksum algorithm selected by the header flags for one side of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumKind {
    #[default]
    None,
    Crc32,
    Adler32,
}

impl ChecksumKind {
    pub fn is_none(self) -> bool {
        self == ChecksumKind::None
    }

    /// Compute the checksum of `data`, or `None` for [`ChecksumKind::None`].
    pub fn compute(self, data: &[u8]) -> Option<u32> {
        match self {
            ChecksumKind::None => None,
            ChecksumKind::Crc32 => Some(crc32(data)),
            ChecksumKind::Adler32 => Some(adler32(data)),
        }
    }
}

/// CRC-32 (zlib polynomial) seeded with [`CRC32_INIT_VALUE`].
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc = Crc::new();
    crc.update(data);
    crc.sum()
}

/// Adler-32 seeded with [`ADLER32_INIT_VALUE`].
pub fn adler32(data: &[u8]) -> u32 {
    let mut adler = Adler32::from_checksum(ADLER32_INIT_VALUE);
    adler.write_slice(data);
    adler.checksum()
}

/// Expected and computed values of a failed checksum comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChecksumMismatch {
    pub expected: u32,
    pub actual: u32,
}

/// Compares block checksums unless verification is disabled for the session.
///
/// When disabled, nothing is computed. Callers still read the stored checksum
/// fields so the stream stays positioned on the block layout.
#[derive(Debug, Clone, Copy)]
pub struct ChecksumVerifier {
    disabled: bool,
}

impl ChecksumVerifier {
    pub fn new(disabled: bool) -> Self {
        Self { disabled }
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    pub fn verify(
        &self,
        kind: ChecksumKind,
        expected: u32,
        data: &[u8],
    ) -> Result<(), ChecksumMismatch> {
        if self.disabled {
            return Ok(());
        }
        match kind.compute(data) {
            Some(actual) if actual != expected => Err(ChecksumMismatch { expected, actual }),
            _ => Ok(()),
        }
    }
}
