use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context};

use crate::checksum::ChecksumKind;
use crate::codec::Codec;
use crate::format::{checksum_flags, ContainerHeader, DEFAULT_BLOCK_SIZE, MAX_BLOCK_SIZE};

/// Settings for a new lzop file.
#[derive(Debug, Clone)]
pub struct WriterOptions {
    /// Raw bytes per block; the last block may be shorter.
    pub block_size: u32,
    /// Checksum over each block's decompressed bytes.
    pub output_checksum: ChecksumKind,
    /// Checksum over each block's compressed bytes. Not written for stored blocks.
    pub input_checksum: ChecksumKind,
    /// Protect the header with CRC-32 instead of Adler-32.
    pub header_crc32: bool,
    pub level: u8,
    /// Original file name recorded in the header.
    pub name: Vec<u8>,
    /// Modification time in seconds since the epoch.
    pub mtime: u64,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            output_checksum: ChecksumKind::Adler32,
            input_checksum: ChecksumKind::None,
            header_crc32: false,
            level: 3,
            name: Vec::new(),
            mtime: 0,
        }
    }
}

/// What [`Writer::finish`] hands back.
#[derive(Debug)]
pub struct WriteSummary<W> {
    pub inner: W,
    /// Start offset of every block, ready to be written as a `.index` file.
    pub block_offsets: Vec<u64>,
    pub raw_bytes: u64,
    /// Total file length including header and end marker.
    pub file_bytes: u64,
}

/// Streaming writer for lzop files.
///
/// # Write contract
/// Call [`Writer::write`] any number of times with arbitrary-sized slices.
/// Whenever `block_size` raw bytes have accumulated they are compressed into
/// one independent block. [`Writer::finish`] flushes the partial last block
/// and appends the end marker.
///
/// # Layout written
/// ```text
/// [HEADER]
/// [BLOCK 0] [BLOCK 1] ... [BLOCK N-1]   each: lengths, checksums, payload
/// [0u32]                                 end marker
/// ```
/// A block that does not shrink under compression is stored raw, which the
/// reader recognizes by equal lengths.
pub struct Writer<W: Write> {
    out: W,
    codec: Arc<dyn Codec>,
    header: ContainerHeader,
    block_size: usize,
    pending: Vec<u8>,
    block_offsets: Vec<u64>,
    current_offset: u64,
    raw_bytes: u64,
}

impl Writer<BufWriter<File>> {
    /// Create a new lzop file at `path`, overwriting any existing file.
    pub fn create(
        path: impl AsRef<Path>,
        codec: Arc<dyn Codec>,
        options: WriterOptions,
    ) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
        Self::new(BufWriter::new(file), codec, options)
    }
}

impl<W: Write> Writer<W> {
    /// Write the header to `out` and start accepting data.
    pub fn new(mut out: W, codec: Arc<dyn Codec>, options: WriterOptions) -> anyhow::Result<Self> {
        if options.block_size == 0 || options.block_size > MAX_BLOCK_SIZE {
            bail!(
                "block size {} outside 1..={MAX_BLOCK_SIZE}",
                options.block_size
            );
        }
        let flags = checksum_flags(
            options.output_checksum,
            options.input_checksum,
            options.header_crc32,
        );
        let mut header = ContainerHeader::new(codec.method(), options.level, flags, &options.name);
        header.mtime_low = options.mtime as u32;
        header.mtime_high = (options.mtime >> 32) as u32;

        let header_bytes = header.to_bytes();
        out.write_all(&header_bytes)?;
        let block_size = options.block_size as usize;
        Ok(Self {
            out,
            codec,
            header,
            block_size,
            pending: Vec::with_capacity(block_size),
            block_offsets: Vec::new(),
            current_offset: header_bytes.len() as u64,
            raw_bytes: 0,
        })
    }

    pub fn header(&self) -> &ContainerHeader {
        &self.header
    }

    /// Buffer `data` and flush complete blocks as they fill up.
    pub fn write(&mut self, mut data: &[u8]) -> anyhow::Result<()> {
        while !data.is_empty() {
            let room = self.block_size - self.pending.len();
            let (head, rest) = data.split_at(room.min(data.len()));
            self.pending.extend_from_slice(head);
            data = rest;
            if self.pending.len() == self.block_size {
                let raw = std::mem::take(&mut self.pending);
                self.flush_block(&raw)?;
                self.pending = raw;
                self.pending.clear();
            }
        }
        Ok(())
    }

    /// Compress `raw` as a single block and write it out.
    fn flush_block(&mut self, raw: &[u8]) -> anyhow::Result<()> {
        let compressed = self.codec.compress_block(raw)?;
        let payload = if compressed.len() < raw.len() {
            compressed.as_slice()
        } else {
            raw
        };

        let mut prefix = Vec::with_capacity(16);
        prefix.extend_from_slice(&(raw.len() as u32).to_be_bytes());
        prefix.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        if let Some(sum) = self.header.output_checksum.compute(raw) {
            prefix.extend_from_slice(&sum.to_be_bytes());
        }
        if payload.len() < raw.len() {
            if let Some(sum) = self.header.input_checksum.compute(payload) {
                prefix.extend_from_slice(&sum.to_be_bytes());
            }
        }

        self.out.write_all(&prefix)?;
        self.out.write_all(payload)?;
        self.block_offsets.push(self.current_offset);
        self.current_offset += (prefix.len() + payload.len()) as u64;
        self.raw_bytes += raw.len() as u64;
        Ok(())
    }

    /// Flush the partial last block, append the end marker, and flush `out`.
    pub fn finish(mut self) -> anyhow::Result<WriteSummary<W>> {
        if !self.pending.is_empty() {
            let remaining = std::mem::take(&mut self.pending);
            self.flush_block(&remaining)?;
        }
        self.out.write_all(&0u32.to_be_bytes())?;
        self.out.flush()?;
        Ok(WriteSummary {
            inner: self.out,
            block_offsets: self.block_offsets,
            raw_bytes: self.raw_bytes,
            file_bytes: self.current_offset + 4,
        })
    }
}
