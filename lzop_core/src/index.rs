//! Companion block index (`<datafile>.index`).
//!
//! The index body is a flat run of big-endian `u64` block start offsets with no
//! header or footer. A missing index is not an error: the data file is then
//! read from start to end by a single range.

use std::fs::File;
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::format::{ContainerHeader, HEADER_SIZE, MAX_BLOCK_SIZE};
use crate::source::{FileRangeStream, RangeStream, ScanRange};

/// Suffix appended to a data file's name to locate its index.
pub const INDEX_SUFFIX: &str = ".index";

const INDEX_ENTRY_SIZE: usize = 8;
const TARGET_READ_SIZE: usize = 10 * 1024;

/// Ascending, duplicate-free block start offsets of one file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockIndex {
    offsets: Vec<u64>,
}

impl BlockIndex {
    /// Wrap `offsets`, or report the first position where they stop strictly increasing.
    pub fn new(offsets: Vec<u64>) -> std::result::Result<Self, usize> {
        match offsets.windows(2).position(|w| w[0] >= w[1]) {
            Some(i) => Err(i + 1),
            None => Ok(Self { offsets }),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn offsets(&self) -> &[u64] {
        &self.offsets
    }

    /// First block start strictly greater than `offset`.
    pub fn first_after(&self, offset: u64) -> Option<u64> {
        let pos = self.offsets.partition_point(|&o| o <= offset);
        self.offsets.get(pos).copied()
    }

    /// First block start greater than or equal to `offset`.
    pub fn first_at_or_after(&self, offset: u64) -> Option<u64> {
        let pos = self.offsets.partition_point(|&o| o < offset);
        self.offsets.get(pos).copied()
    }
}

/// Path of the index file belonging to `data_file`.
pub fn index_path(data_file: &Path) -> PathBuf {
    let mut name = data_file.as_os_str().to_owned();
    name.push(INDEX_SUFFIX);
    PathBuf::from(name)
}

/// Opens index files for data files.
pub trait IndexStore: Send + Sync {
    /// `Ok(None)` when the data file has no index.
    fn open_index(&self, data_file: &Path) -> io::Result<Option<Box<dyn Read + '_>>>;
}

/// Index files next to their data files on the local filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsIndexStore;

impl IndexStore for FsIndexStore {
    fn open_index(&self, data_file: &Path) -> io::Result<Option<Box<dyn Read + '_>>> {
        match File::open(index_path(data_file)) {
            Ok(file) => Ok(Some(Box::new(file))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Decode every complete 8-byte entry from `reader`.
///
/// Reads may return any number of bytes, so the 0-7 bytes left over from one
/// read are carried into the next. Dangling bytes at the very end are dropped.
pub fn read_offsets(mut reader: impl Read) -> io::Result<Vec<u64>> {
    let mut offsets = Vec::new();
    let mut buffer = [0u8; TARGET_READ_SIZE];
    let mut unprocessed = 0usize;

    loop {
        let n = match reader.read(&mut buffer[unprocessed..]) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        let filled = unprocessed + n;
        let read_until = filled - filled % INDEX_ENTRY_SIZE;
        for chunk in buffer[..read_until].chunks_exact(INDEX_ENTRY_SIZE) {
            let mut entry = [0u8; INDEX_ENTRY_SIZE];
            entry.copy_from_slice(chunk);
            offsets.push(u64::from_be_bytes(entry));
        }
        buffer.copy_within(read_until..filled, 0);
        unprocessed = filled - read_until;
    }

    if unprocessed > 0 {
        tracing::debug!(dangling = unprocessed, "ignoring trailing partial index entry");
    }
    Ok(offsets)
}

/// Load the block index for `data_file` from `store`.
///
/// Returns an empty index when no index file exists.
pub fn read_index(store: &dyn IndexStore, data_file: &Path) -> Result<BlockIndex> {
    let path = index_path(data_file);
    let reader = match store.open_index(data_file) {
        Ok(Some(reader)) => reader,
        Ok(None) => {
            tracing::warn!(
                file = %data_file.display(),
                "no index file, split scans are not possible"
            );
            return Ok(BlockIndex::default());
        }
        Err(source) => return Err(Error::IndexIo { path, source }),
    };
    let offsets = read_offsets(reader).map_err(|source| Error::IndexIo {
        path: path.clone(),
        source,
    })?;
    BlockIndex::new(offsets).map_err(|position| Error::MalformedIndex { path, position })
}

/// Write `offsets` as an index body.
pub fn write_index(path: impl AsRef<Path>, offsets: &[u64]) -> io::Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    for offset in offsets {
        out.write_all(&offset.to_be_bytes())?;
    }
    out.flush()
}

/// Walk the block prefixes of a whole file and collect every block start.
///
/// Payloads are skipped without being read or verified.
pub fn build_index<R: Read + Seek>(mut reader: R) -> Result<Vec<u64>> {
    reader.seek(SeekFrom::Start(0))?;
    let mut span = Vec::with_capacity(HEADER_SIZE);
    (&mut reader).take(HEADER_SIZE as u64).read_to_end(&mut span)?;
    let header = ContainerHeader::parse(&span)?;

    let start = header.header_size as u64;
    let mut stream = FileRangeStream::new(reader, ScanRange::new(start, u64::MAX - start))?;
    let mut offsets = Vec::new();
    while !stream.is_at_file_end() {
        let block_start = stream.file_offset();
        let uncompressed = stream.read_u32()?;
        if uncompressed == 0 {
            break;
        }
        if uncompressed as i32 <= 0 {
            return Err(Error::CorruptLength {
                offset: block_start,
                length: uncompressed as i32,
            });
        }
        let compressed = stream.read_u32()?;
        if compressed > MAX_BLOCK_SIZE {
            return Err(Error::BlockTooLarge {
                offset: block_start,
                length: compressed,
                max: MAX_BLOCK_SIZE,
            });
        }
        let mut skip = compressed as u64;
        if !header.output_checksum.is_none() {
            skip += 4;
        }
        if compressed < uncompressed && !header.input_checksum.is_none() {
            skip += 4;
        }
        stream.skip(skip)?;
        offsets.push(block_start);
    }
    tracing::debug!(blocks = offsets.len(), "built block index");
    Ok(offsets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Cursor;

    /// Hands out index bodies from memory.
    #[derive(Default)]
    struct MemoryIndexStore {
        bodies: HashMap<PathBuf, Vec<u8>>,
    }

    impl IndexStore for MemoryIndexStore {
        fn open_index(&self, data_file: &Path) -> io::Result<Option<Box<dyn Read + '_>>> {
            Ok(self
                .bodies
                .get(data_file)
                .map(|body| Box::new(Cursor::new(body.as_slice())) as Box<dyn Read + '_>))
        }
    }

    /// Returns at most `step` bytes per read, then optionally fails.
    struct Trickle {
        data: Vec<u8>,
        pos: usize,
        step: usize,
        fail_at_end: bool,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.pos >= self.data.len() {
                if self.fail_at_end {
                    return Err(io::Error::new(io::ErrorKind::Other, "connection reset"));
                }
                return Ok(0);
            }
            let n = self.step.min(buf.len()).min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    fn encode(offsets: &[u64]) -> Vec<u8> {
        offsets.iter().flat_map(|o| o.to_be_bytes()).collect()
    }

    #[test]
    fn offsets_survive_unaligned_reads() {
        let offsets: Vec<u64> = (0..3000).map(|i| 40 + i * 1_000_003).collect();
        let reader = Trickle {
            data: encode(&offsets),
            pos: 0,
            step: 13,
            fail_at_end: false,
        };
        assert_eq!(read_offsets(reader).unwrap(), offsets);
    }

    #[test]
    fn dangling_tail_is_dropped() {
        let mut body = encode(&[100, 500]);
        body.extend_from_slice(&[0, 0, 1]);
        assert_eq!(read_offsets(body.as_slice()).unwrap(), vec![100, 500]);
        assert!(read_offsets(&[1u8, 2, 3][..]).unwrap().is_empty());
    }

    #[test]
    fn missing_index_is_empty() {
        let store = MemoryIndexStore::default();
        let index = read_index(&store, Path::new("/data/a.lzo")).unwrap();
        assert!(index.is_empty());
    }

    #[test]
    fn empty_index_file_is_not_an_error() {
        let mut store = MemoryIndexStore::default();
        store.bodies.insert(PathBuf::from("/data/a.lzo"), Vec::new());
        assert!(read_index(&store, Path::new("/data/a.lzo")).unwrap().is_empty());
    }

    #[test]
    fn unsorted_index_is_malformed() {
        let mut store = MemoryIndexStore::default();
        store
            .bodies
            .insert(PathBuf::from("/data/a.lzo"), encode(&[100, 500, 500, 900]));
        let err = read_index(&store, Path::new("/data/a.lzo")).unwrap_err();
        assert!(matches!(err, Error::MalformedIndex { position: 2, .. }));
    }

    #[test]
    fn read_failure_is_index_io() {
        struct FailingStore;
        impl IndexStore for FailingStore {
            fn open_index(&self, _: &Path) -> io::Result<Option<Box<dyn Read + '_>>> {
                Ok(Some(Box::new(Trickle {
                    data: encode(&[1, 2]),
                    pos: 0,
                    step: 4,
                    fail_at_end: true,
                })))
            }
        }
        let err = read_index(&FailingStore, Path::new("/data/a.lzo")).unwrap_err();
        match err {
            Error::IndexIo { path, .. } => assert_eq!(path, PathBuf::from("/data/a.lzo.index")),
            other => panic!("expected IndexIo, got {other}"),
        }
    }

    #[test]
    fn filesystem_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("events.lzo");
        assert!(read_index(&FsIndexStore, &data).unwrap().is_empty());

        write_index(index_path(&data), &[38, 1024, 9000]).unwrap();
        let index = read_index(&FsIndexStore, &data).unwrap();
        assert_eq!(index.offsets(), &[38, 1024, 9000]);
    }

    #[test]
    fn first_after_is_strict() {
        let index = BlockIndex::new(vec![100, 500, 900]).unwrap();
        assert_eq!(index.first_after(0), Some(100));
        assert_eq!(index.first_after(100), Some(500));
        assert_eq!(index.first_after(899), Some(900));
        assert_eq!(index.first_after(900), None);
        assert_eq!(BlockIndex::default().first_after(0), None);
        assert_eq!(index.first_at_or_after(100), Some(100));
        assert_eq!(index.first_at_or_after(101), Some(500));
        assert_eq!(index.first_at_or_after(901), None);
    }
}
