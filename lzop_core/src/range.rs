use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;

use crate::codec::Codec;
use crate::config::{ErrorPolicy, ScanConfig};
use crate::decoder::{BlockDecoder, BlockStatus};
use crate::error::{Error, Result};
use crate::format::{ContainerHeader, MAX_BLOCK_HEADER_SIZE, MAX_BLOCK_SIZE};
use crate::source::RangeStream;
use crate::split;

/// Receives decoded blocks in file order.
pub trait BlockSink {
    fn consume(&mut self, block: Bytes) -> io::Result<()>;
}

impl BlockSink for Vec<u8> {
    fn consume(&mut self, block: Bytes) -> io::Result<()> {
        self.extend_from_slice(&block);
        Ok(())
    }
}

impl BlockSink for Vec<Bytes> {
    fn consume(&mut self, block: Bytes) -> io::Result<()> {
        self.push(block);
        Ok(())
    }
}

/// Adapts any [`Write`] into a [`BlockSink`].
pub struct WriteSink<W>(pub W);

impl<W: Write> BlockSink for WriteSink<W> {
    fn consume(&mut self, block: Bytes) -> io::Result<()> {
        self.0.write_all(&block)
    }
}

/// Which role a range played.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeRole {
    /// Parsed the header, loaded the index, and issued the data ranges.
    HeaderOnly,
    /// Decoded the blocks the range owns.
    Data,
}

/// Summary of one finished range.
#[derive(Debug)]
pub struct RangeReport {
    pub role: RangeRole,
    pub blocks: usize,
    pub bytes: u64,
    /// Block errors that were skipped by resynchronizing, in order.
    pub recovered: Vec<Error>,
}

impl RangeReport {
    pub fn header_only() -> Self {
        Self {
            role: RangeRole::HeaderOnly,
            blocks: 0,
            bytes: 0,
            recovered: Vec::new(),
        }
    }
}

/// An open data range: decodes the blocks whose start lies inside the range.
///
/// The range starting at offset 0 begins right after the header. Any other
/// range first moves to the first indexed block start after its offset and
/// ends immediately if there is none. Decoding continues while the next block
/// starts at or before the range end, so the block straddling the end is
/// completed here and skipped by the following range.
///
/// Bytes come out through [`DataRange::next_chunk`], the [`Iterator`] impl
/// (one item per block), or the [`Read`] impl.
pub struct DataRange<S> {
    file: PathBuf,
    header: Arc<ContainerHeader>,
    stream: S,
    decoder: BlockDecoder,
    policy: ErrorPolicy,
    recovered: Vec<Error>,
    bytes: u64,
}

impl<S: RangeStream> DataRange<S> {
    pub fn open(
        file: &Path,
        header: Arc<ContainerHeader>,
        codec: Arc<dyn Codec>,
        config: ScanConfig,
        mut stream: S,
    ) -> Result<Self> {
        stream.set_read_past_size(u64::from(MAX_BLOCK_SIZE + MAX_BLOCK_HEADER_SIZE));
        let decoder = BlockDecoder::new(Arc::clone(&header), codec, config);
        let mut range = Self {
            file: file.to_path_buf(),
            header,
            stream,
            decoder,
            policy: config.error_policy,
            recovered: Vec::new(),
            bytes: 0,
        };

        let start = if range.stream.scan_range().offset == 0 {
            range
                .stream
                .skip(range.header.header_size as u64)
                .map(|()| true)
                .map_err(Error::from)
        } else {
            split::find_first_block(&range.header.block_offsets, &mut range.stream)
        };
        match start {
            Ok(true) => {}
            Ok(false) => range.decoder.mark_end_of_stream(),
            Err(e) if range.policy == ErrorPolicy::Skip => {
                tracing::warn!(
                    file = %range.file.display(),
                    offset = range.stream.file_offset(),
                    error = %e,
                    "could not position range on a block boundary"
                );
                range.recovered.push(e);
                range.decoder.mark_end_of_stream();
            }
            Err(e) => return Err(e),
        }
        Ok(range)
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    pub fn stream(&self) -> &S {
        &self.stream
    }

    /// Block errors skipped so far.
    pub fn recovered(&self) -> &[Error] {
        &self.recovered
    }

    pub fn is_finished(&self) -> bool {
        self.decoder.is_end_of_stream() && self.decoder.bytes_remaining() == 0
    }

    /// Up to `max` decoded bytes (`0` = the rest of the current block), or
    /// `None` once the range is exhausted. Chunks never span two blocks.
    pub fn next_chunk(&mut self, max: usize) -> Result<Option<Bytes>> {
        if !self.fill()? {
            return Ok(None);
        }
        let chunk = self.decoder.take(max);
        self.bytes += chunk.len() as u64;
        Ok(Some(chunk))
    }

    /// Push every remaining block into `sink`.
    pub fn drain_into<K: BlockSink + ?Sized>(mut self, sink: &mut K) -> Result<RangeReport> {
        while let Some(block) = self.next_chunk(0)? {
            sink.consume(block)?;
        }
        Ok(self.into_report())
    }

    pub fn into_report(self) -> RangeReport {
        RangeReport {
            role: RangeRole::Data,
            blocks: self.decoder.blocks_decoded(),
            bytes: self.bytes,
            recovered: self.recovered,
        }
    }

    /// Make sure the current block has bytes left, decoding the next one if needed.
    fn fill(&mut self) -> Result<bool> {
        loop {
            if self.decoder.bytes_remaining() > 0 {
                return Ok(true);
            }
            if self.decoder.is_end_of_stream() {
                return Ok(false);
            }
            if self.stream.file_offset() > self.stream.scan_range().end() {
                self.decoder.mark_end_of_stream();
                return Ok(false);
            }
            match self.decoder.decode_next(&mut self.stream) {
                Ok(BlockStatus::Decoded(_)) => {}
                Ok(BlockStatus::EndOfStream) => return Ok(false),
                Err(e) if self.policy == ErrorPolicy::Skip => self.resync(e),
                Err(e) => {
                    self.decoder.mark_end_of_stream();
                    return Err(e);
                }
            }
        }
    }

    /// Skip past a bad block to the next indexed boundary, or end the range.
    fn resync(&mut self, err: Error) {
        let position = self.stream.file_offset();
        let bad_block = err.offset().unwrap_or(position);
        tracing::warn!(
            file = %self.file.display(),
            offset = bad_block,
            error = %err,
            "skipping unreadable lzo block"
        );
        self.recovered.push(err);

        let header = Arc::clone(&self.header);
        let from = position.max(bad_block + 1);
        match split::skip_to_block(&header.block_offsets, &mut self.stream, from) {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(
                    file = %self.file.display(),
                    offset = self.stream.file_offset(),
                    "no further block boundary in range, ending scan early"
                );
                self.decoder.mark_end_of_stream();
            }
            Err(e) => {
                tracing::warn!(
                    file = %self.file.display(),
                    error = %e,
                    "resynchronization failed, ending scan early"
                );
                self.recovered.push(e);
                self.decoder.mark_end_of_stream();
            }
        }
    }
}

impl<S: RangeStream> Iterator for DataRange<S> {
    type Item = Result<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_chunk(0).transpose()
    }
}

impl<S: RangeStream> Read for DataRange<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        match self.next_chunk(buf.len()) {
            Ok(Some(chunk)) => {
                buf[..chunk.len()].copy_from_slice(&chunk);
                Ok(chunk.len())
            }
            Ok(None) => Ok(0),
            Err(Error::Io(e)) => Err(e),
            Err(e) => Err(io::Error::new(io::ErrorKind::InvalidData, e)),
        }
    }
}
