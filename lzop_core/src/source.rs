use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

/// A contiguous byte span of a file assigned to one scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScanRange {
    pub offset: u64,
    pub len: u64,
}

impl ScanRange {
    pub fn new(offset: u64, len: u64) -> Self {
        Self { offset, len }
    }

    /// Exclusive end offset, clamped to `u64::MAX`.
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.len)
    }
}

/// Byte source for one assigned range of a file.
///
/// Reads are sequential. A stream may deliver bytes past the end of its range
/// (so the block straddling the boundary can be completed) but never past the
/// end of the file.
pub trait RangeStream {
    /// The range this stream was opened for.
    fn scan_range(&self) -> ScanRange;

    /// Absolute file offset of the next unread byte.
    fn file_offset(&self) -> u64;

    /// Read up to `n` bytes. Fewer are returned only when the stream cannot go further.
    fn read_bytes(&mut self, n: usize) -> io::Result<&[u8]>;

    /// Advance `n` bytes; `UnexpectedEof` if the stream ends first.
    fn skip(&mut self, n: u64) -> io::Result<()>;

    fn is_at_file_end(&self) -> bool;

    /// Upper bound of bytes the caller may read beyond the range end.
    fn set_read_past_size(&mut self, _max: u64) {}

    fn is_at_range_end(&self) -> bool {
        self.file_offset() >= self.scan_range().end()
    }

    /// Read a big-endian 32-bit value.
    fn read_u32(&mut self) -> io::Result<u32> {
        let bytes = self.read_bytes(4)?;
        match <[u8; 4]>::try_from(bytes) {
            Ok(b) => Ok(u32::from_be_bytes(b)),
            Err(_) => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("needed 4 bytes, stream ended after {}", bytes.len()),
            )),
        }
    }
}

impl<S: RangeStream + ?Sized> RangeStream for &mut S {
    fn scan_range(&self) -> ScanRange {
        (**self).scan_range()
    }

    fn file_offset(&self) -> u64 {
        (**self).file_offset()
    }

    fn read_bytes(&mut self, n: usize) -> io::Result<&[u8]> {
        (**self).read_bytes(n)
    }

    fn skip(&mut self, n: u64) -> io::Result<()> {
        (**self).skip(n)
    }

    fn is_at_file_end(&self) -> bool {
        (**self).is_at_file_end()
    }

    fn set_read_past_size(&mut self, max: u64) {
        (**self).set_read_past_size(max)
    }
}

/// [`RangeStream`] over any seekable reader: files, or `Cursor`s in tests.
pub struct FileRangeStream<R> {
    inner: R,
    range: ScanRange,
    pos: u64,
    file_len: u64,
    read_past: u64,
    buf: Vec<u8>,
}

impl FileRangeStream<File> {
    /// Open `path` positioned at the start of `range`.
    pub fn open(path: impl AsRef<Path>, range: ScanRange) -> io::Result<Self> {
        Self::new(File::open(path)?, range)
    }
}

impl<R: Read + Seek> FileRangeStream<R> {
    pub fn new(mut inner: R, range: ScanRange) -> io::Result<Self> {
        let file_len = inner.seek(SeekFrom::End(0))?;
        let pos = range.offset.min(file_len);
        inner.seek(SeekFrom::Start(pos))?;
        Ok(Self {
            inner,
            range,
            pos,
            file_len,
            read_past: 0,
            buf: Vec::new(),
        })
    }

    pub fn file_len(&self) -> u64 {
        self.file_len
    }

    /// Furthest offset this stream will deliver.
    fn limit(&self) -> u64 {
        self.range
            .end()
            .saturating_add(self.read_past)
            .min(self.file_len)
    }
}

impl<R: Read + Seek> RangeStream for FileRangeStream<R> {
    fn scan_range(&self) -> ScanRange {
        self.range
    }

    fn file_offset(&self) -> u64 {
        self.pos
    }

    fn read_bytes(&mut self, n: usize) -> io::Result<&[u8]> {
        let available = self.limit().saturating_sub(self.pos);
        let take = (n as u64).min(available) as usize;
        self.buf.resize(take, 0);
        self.inner.read_exact(&mut self.buf)?;
        self.pos += take as u64;
        Ok(&self.buf)
    }

    fn skip(&mut self, n: u64) -> io::Result<()> {
        let target = self.pos.saturating_add(n);
        if target > self.limit() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("cannot skip {n} bytes from offset {}", self.pos),
            ));
        }
        self.inner.seek(SeekFrom::Start(target))?;
        self.pos = target;
        Ok(())
    }

    fn is_at_file_end(&self) -> bool {
        self.pos >= self.file_len
    }

    fn set_read_past_size(&mut self, max: u64) {
        self.read_past = max;
    }
}
