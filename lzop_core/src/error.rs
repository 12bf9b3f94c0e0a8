//! Error types for LZOP header parsing, index loading, and block decoding.
//!
//! Errors fall into three classes:
//!
//! | Class  | Variants | Handling |
//! |--------|----------|----------|
//! | Header | `BadMagic`, `UnsupportedVersion`, `IncompatibleLibraryVersion`, `UnsupportedMethod`, `UnsupportedFlags`, `HeaderChecksumMismatch`, `TruncatedHeader` | fatal for the file |
//! | Block  | `CorruptLength`, `BlockTooLarge`, `TruncatedBlock`, `CorruptBlock`, `InputChecksumMismatch`, `OutputChecksumMismatch`, `DecompressionFailed` | skipped by resynchronizing on the next indexed block |
//! | Index  | `IndexIo`, `MalformedIndex` | the file is scanned unsplit |
//!
//! Every variant carries the offsets and values needed to log it without
//! re-formatting at the call site.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("file is too short for an lzop header: {len} bytes")]
    TruncatedHeader { len: usize },

    #[error("invalid lzop magic: {found:02x?}")]
    BadMagic { found: [u8; 9] },

    #[error("compressed with a later lzop version: {version:#06x} must be at most {max:#06x}")]
    UnsupportedVersion { version: u16, max: u16 },

    #[error("compressed with an incompatible lzo library version: {version:#06x} must be at least {min:#06x}")]
    IncompatibleLibraryVersion { version: u16, min: u16 },

    #[error("invalid compression method: {method}")]
    UnsupportedMethod { method: u8 },

    #[error("unsupported header flags: {flags:#010x}")]
    UnsupportedFlags { flags: u32 },

    #[error("invalid header checksum: computed {actual:#010x}, expected {expected:#010x}")]
    HeaderChecksumMismatch { expected: u32, actual: u32 },

    #[error("corrupt block at offset {offset}: invalid uncompressed length {length}")]
    CorruptLength { offset: u64, length: i32 },

    #[error("block at offset {offset}: size {length} is greater than the maximum block size {max}")]
    BlockTooLarge { offset: u64, length: u32, max: u32 },

    #[error("last block missing at offset {offset}: expected {expected} bytes")]
    TruncatedBlock { offset: u64, expected: u32 },

    #[error("corrupt block at offset {offset}: expected {expected} bytes but could only read {actual}")]
    CorruptBlock { offset: u64, expected: u32, actual: usize },

    #[error("checksum of compressed block at offset {offset} failed: expected {expected:#010x}, got {actual:#010x}")]
    InputChecksumMismatch { offset: u64, expected: u32, actual: u32 },

    #[error("checksum of decompressed block at offset {offset} failed: expected {expected:#010x}, got {actual:#010x}")]
    OutputChecksumMismatch { offset: u64, expected: u32, actual: u32 },

    #[error("decompression failed for block at offset {offset}: produced {actual} bytes, expected {expected} ({reason})")]
    DecompressionFailed {
        offset: u64,
        expected: usize,
        actual: usize,
        reason: String,
    },

    #[error("error while reading index file {path:?}: {source}")]
    IndexIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("index file {path:?} is not strictly increasing at entry {position}")]
    MalformedIndex { path: PathBuf, position: usize },

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Errors that invalidate the whole file because the header cannot be trusted.
    pub fn is_header_level(&self) -> bool {
        matches!(
            self,
            Error::TruncatedHeader { .. }
                | Error::BadMagic { .. }
                | Error::UnsupportedVersion { .. }
                | Error::IncompatibleLibraryVersion { .. }
                | Error::UnsupportedMethod { .. }
                | Error::UnsupportedFlags { .. }
                | Error::HeaderChecksumMismatch { .. }
        )
    }

    /// Errors confined to one block; a scan can resume at the next block boundary.
    pub fn is_block_level(&self) -> bool {
        matches!(
            self,
            Error::CorruptLength { .. }
                | Error::BlockTooLarge { .. }
                | Error::TruncatedBlock { .. }
                | Error::CorruptBlock { .. }
                | Error::InputChecksumMismatch { .. }
                | Error::OutputChecksumMismatch { .. }
                | Error::DecompressionFailed { .. }
        )
    }

    /// File offset the error refers to, when it is tied to a block.
    pub fn offset(&self) -> Option<u64> {
        match self {
            Error::CorruptLength { offset, .. }
            | Error::BlockTooLarge { offset, .. }
            | Error::TruncatedBlock { offset, .. }
            | Error::CorruptBlock { offset, .. }
            | Error::InputChecksumMismatch { offset, .. }
            | Error::OutputChecksumMismatch { offset, .. }
            | Error::DecompressionFailed { offset, .. } => Some(*offset),
            _ => None,
        }
    }
}
