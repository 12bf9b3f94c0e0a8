//! Reading lzop files in independent, parallel ranges.
//!
//! A file is cut into byte ranges. The range at offset 0 parses the
//! [`ContainerHeader`]; a companion `.index` file of block offsets lets every
//! other range seek to its first block and decode only the blocks starting
//! inside it. Files without an index are decoded by a single range.

pub mod checksum;
pub mod codec;
pub mod config;
pub mod decoder;
pub mod error;
pub mod format;
pub mod index;
pub mod range;
pub mod scan;
pub mod source;
pub mod split;
pub mod writer;

pub use checksum::{ChecksumKind, ChecksumVerifier};
pub use codec::Codec;
pub use config::{ErrorPolicy, ScanConfig};
pub use decoder::{BlockDecoder, BlockStatus};
pub use error::{Error, Result};
pub use format::{CompressionMethod, ContainerHeader, HEADER_SIZE, MAGIC};
pub use index::{BlockIndex, FsIndexStore, IndexStore};
pub use range::{BlockSink, DataRange, RangeReport, RangeRole, WriteSink};
pub use scan::{FileDesc, HeaderCache, RangeOrchestrator, RangeQueue, RangeScheduler};
pub use source::{FileRangeStream, RangeStream, ScanRange};
pub use writer::{WriteSummary, Writer, WriterOptions};
