use std::io;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use crate::checksum::ChecksumVerifier;
use crate::codec::Codec;
use crate::config::{ErrorPolicy, ScanConfig};
use crate::error::{Error, Result};
use crate::format::{ContainerHeader, MAX_BLOCK_SIZE};
use crate::source::RangeStream;

/// Outcome of decoding one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    /// A block of this many decompressed bytes is ready.
    Decoded(usize),
    /// The end marker (or end of file) was reached; no more blocks follow.
    EndOfStream,
}

/// Reads, verifies, and decompresses blocks from one range's stream.
///
/// # Block layout
/// ```text
/// [uncompressed_len:u32] [compressed_len:u32]
/// [output checksum:u32]?   present when the header selects one
/// [input checksum:u32]?    present when selected and the block is compressed
/// [payload: compressed_len bytes]
/// ```
/// An `uncompressed_len` of zero ends the file.
///
/// Decoded bytes are handed out as [`Bytes`]. Stored blocks are copied into a
/// scratch [`BytesMut`] whose allocation is reused once the consumer has
/// dropped its handles to earlier blocks; handles the consumer keeps remain
/// valid for as long as it holds them.
pub struct BlockDecoder {
    header: Arc<ContainerHeader>,
    codec: Arc<dyn Codec>,
    verifier: ChecksumVerifier,
    policy: ErrorPolicy,
    scratch: BytesMut,
    current: Bytes,
    end_of_stream: bool,
    blocks_decoded: usize,
}

impl BlockDecoder {
    pub fn new(header: Arc<ContainerHeader>, codec: Arc<dyn Codec>, config: ScanConfig) -> Self {
        Self {
            header,
            codec,
            verifier: ChecksumVerifier::new(config.disable_checksums),
            policy: config.error_policy,
            scratch: BytesMut::new(),
            current: Bytes::new(),
            end_of_stream: false,
            blocks_decoded: 0,
        }
    }

    pub fn header(&self) -> &ContainerHeader {
        &self.header
    }

    /// Decompressed bytes of the current block not yet taken.
    pub fn bytes_remaining(&self) -> usize {
        self.current.len()
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.end_of_stream
    }

    pub fn blocks_decoded(&self) -> usize {
        self.blocks_decoded
    }

    /// Stop decoding: later calls report end of stream without reading.
    pub fn mark_end_of_stream(&mut self) {
        self.end_of_stream = true;
        self.current = Bytes::new();
    }

    /// Take up to `max` bytes of the current block; `0` takes all of them.
    pub fn take(&mut self, max: usize) -> Bytes {
        if max == 0 || max >= self.current.len() {
            std::mem::take(&mut self.current)
        } else {
            self.current.split_to(max)
        }
    }

    /// Decode the next block from `stream`, replacing any untaken bytes.
    pub fn decode_next<S: RangeStream + ?Sized>(&mut self, stream: &mut S) -> Result<BlockStatus> {
        if self.end_of_stream {
            return Ok(BlockStatus::EndOfStream);
        }
        self.current = Bytes::new();

        if stream.is_at_file_end() {
            self.end_of_stream = true;
            return Ok(BlockStatus::EndOfStream);
        }

        let offset = stream.file_offset();
        let uncompressed = read_field(stream, offset)? as i32;
        if uncompressed == 0 {
            self.end_of_stream = true;
            return Ok(BlockStatus::EndOfStream);
        }
        if uncompressed < 0 {
            return Err(Error::CorruptLength { offset, length: uncompressed });
        }
        let uncompressed = uncompressed as u32;
        if uncompressed > MAX_BLOCK_SIZE {
            return Err(Error::BlockTooLarge {
                offset,
                length: uncompressed,
                max: MAX_BLOCK_SIZE,
            });
        }

        let compressed = read_field(stream, offset)?;
        if compressed > MAX_BLOCK_SIZE {
            return Err(Error::BlockTooLarge {
                offset,
                length: compressed,
                max: MAX_BLOCK_SIZE,
            });
        }

        let output_kind = self.header.output_checksum;
        let output_checksum = if output_kind.is_none() {
            None
        } else {
            Some(read_field(stream, offset)?)
        };

        let input_kind = self.header.input_checksum;
        let stored = compressed == uncompressed;
        let input_check = if compressed < uncompressed && !input_kind.is_none() {
            Some((input_kind, read_field(stream, offset)?))
        } else if stored {
            // Stored payloads carry only the checksum of the decompressed side.
            output_checksum.map(|sum| (output_kind, sum))
        } else {
            None
        };

        let payload = stream.read_bytes(compressed as usize)?;
        if payload.is_empty() && compressed != 0 {
            self.end_of_stream = true;
            if self.policy == ErrorPolicy::Abort {
                return Err(Error::TruncatedBlock { offset, expected: compressed });
            }
            tracing::debug!(offset, expected = compressed, "last block missing at end of file");
            return Ok(BlockStatus::EndOfStream);
        }
        if payload.len() != compressed as usize {
            return Err(Error::CorruptBlock {
                offset,
                expected: compressed,
                actual: payload.len(),
            });
        }

        if let Some((kind, expected)) = input_check {
            self.verifier
                .verify(kind, expected, payload)
                .map_err(|m| Error::InputChecksumMismatch {
                    offset,
                    expected: m.expected,
                    actual: m.actual,
                })?;
        }

        if stored {
            self.scratch.reserve(payload.len());
            self.scratch.extend_from_slice(payload);
            self.current = self.scratch.split().freeze();
            self.blocks_decoded += 1;
            return Ok(BlockStatus::Decoded(self.current.len()));
        }

        let expected_len = uncompressed as usize;
        let raw = match self.codec.decompress_block(payload, expected_len) {
            Ok(raw) if raw.len() == expected_len => raw,
            Ok(raw) => {
                self.discard_scratch();
                return Err(Error::DecompressionFailed {
                    offset,
                    expected: expected_len,
                    actual: raw.len(),
                    reason: "output length differs from block header".to_string(),
                });
            }
            Err(e) => {
                self.discard_scratch();
                return Err(Error::DecompressionFailed {
                    offset,
                    expected: expected_len,
                    actual: 0,
                    reason: format!("{e:#}"),
                });
            }
        };

        if let Some(expected) = output_checksum {
            if let Err(m) = self.verifier.verify(output_kind, expected, &raw) {
                self.discard_scratch();
                return Err(Error::OutputChecksumMismatch {
                    offset,
                    expected: m.expected,
                    actual: m.actual,
                });
            }
        }

        tracing::trace!(offset, compressed, uncompressed, "decompressed block");
        self.current = Bytes::from(raw);
        self.blocks_decoded += 1;
        Ok(BlockStatus::Decoded(expected_len))
    }

    /// Drop the scratch allocation so repeated failures do not pin memory.
    fn discard_scratch(&mut self) {
        self.scratch = BytesMut::new();
    }
}

fn read_field<S: RangeStream + ?Sized>(stream: &mut S, offset: u64) -> Result<u32> {
    stream.read_u32().map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => Error::TruncatedBlock { offset, expected: 4 },
        _ => Error::Io(e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::ChecksumKind;
    use crate::format::{checksum_flags, CompressionMethod};
    use crate::source::{FileRangeStream, ScanRange};
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Run-length codec: `[count, byte]` pairs.
    #[derive(Default)]
    struct RunLengthCodec {
        decompress_calls: AtomicUsize,
    }

    impl Codec for RunLengthCodec {
        fn method(&self) -> CompressionMethod {
            CompressionMethod::Lzo1x1
        }

        fn name(&self) -> &'static str {
            "rle"
        }

        fn compress_block(&self, raw: &[u8]) -> anyhow::Result<Vec<u8>> {
            let mut out = Vec::new();
            for run in raw.chunk_by(|a, b| a == b) {
                for part in run.chunks(255) {
                    out.push(part.len() as u8);
                    out.push(part[0]);
                }
            }
            Ok(out)
        }

        fn decompress_block(&self, compressed: &[u8], _raw_len: usize) -> anyhow::Result<Vec<u8>> {
            self.decompress_calls.fetch_add(1, Ordering::SeqCst);
            if compressed.len() % 2 != 0 {
                anyhow::bail!("odd run-length payload");
            }
            Ok(compressed
                .chunks(2)
                .flat_map(|pair| std::iter::repeat(pair[1]).take(pair[0] as usize))
                .collect())
        }
    }

    fn header(output: ChecksumKind, input: ChecksumKind) -> Arc<ContainerHeader> {
        let flags = checksum_flags(output, input, false);
        Arc::new(ContainerHeader::new(CompressionMethod::Lzo1x1, 1, flags, b""))
    }

    /// Encode one block the way the writer lays it out.
    fn block(header: &ContainerHeader, raw: &[u8], payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(raw.len() as u32).to_be_bytes());
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        if let Some(sum) = header.output_checksum.compute(raw) {
            out.extend_from_slice(&sum.to_be_bytes());
        }
        if payload.len() < raw.len() {
            if let Some(sum) = header.input_checksum.compute(payload) {
                out.extend_from_slice(&sum.to_be_bytes());
            }
        }
        out.extend_from_slice(payload);
        out
    }

    fn stream(data: Vec<u8>) -> FileRangeStream<Cursor<Vec<u8>>> {
        let len = data.len() as u64;
        FileRangeStream::new(Cursor::new(data), ScanRange::new(0, len)).unwrap()
    }

    fn decoder(header: Arc<ContainerHeader>, codec: Arc<RunLengthCodec>, config: ScanConfig) -> BlockDecoder {
        BlockDecoder::new(header, codec, config)
    }

    const VERIFY: ScanConfig = ScanConfig {
        disable_checksums: false,
        error_policy: ErrorPolicy::Skip,
    };

    #[test]
    fn end_marker_produces_nothing_and_is_sticky() {
        let h = header(ChecksumKind::None, ChecksumKind::None);
        let mut data = 0u32.to_be_bytes().to_vec();
        data.extend_from_slice(b"trailing bytes after the end marker");
        let mut s = stream(data);
        let mut d = decoder(h, Arc::default(), ScanConfig::default());

        assert_eq!(d.decode_next(&mut s).unwrap(), BlockStatus::EndOfStream);
        assert_eq!(d.bytes_remaining(), 0);
        assert_eq!(s.file_offset(), 4);

        assert_eq!(d.decode_next(&mut s).unwrap(), BlockStatus::EndOfStream);
        assert_eq!(s.file_offset(), 4);
        assert!(d.is_end_of_stream());
    }

    #[test]
    fn stored_block_round_trips() {
        let h = header(ChecksumKind::Crc32, ChecksumKind::Adler32);
        let raw = b"stored verbatim because it does not compress".to_vec();
        let mut data = block(&h, &raw, &raw);
        data.extend_from_slice(&0u32.to_be_bytes());
        let codec = Arc::new(RunLengthCodec::default());
        let mut d = decoder(h, codec.clone(), VERIFY);
        let mut s = stream(data);

        assert_eq!(d.decode_next(&mut s).unwrap(), BlockStatus::Decoded(raw.len()));
        assert_eq!(d.take(0), Bytes::from(raw));
        assert_eq!(codec.decompress_calls.load(Ordering::SeqCst), 0);
        assert_eq!(d.decode_next(&mut s).unwrap(), BlockStatus::EndOfStream);
    }

    #[test]
    fn compressed_block_decodes() {
        let h = header(ChecksumKind::Adler32, ChecksumKind::Crc32);
        let codec = Arc::new(RunLengthCodec::default());
        let raw = [vec![b'a'; 300], vec![b'b'; 20]].concat();
        let payload = codec.compress_block(&raw).unwrap();
        let data = block(&h, &raw, &payload);
        let mut d = decoder(h, codec.clone(), VERIFY);
        let mut s = stream(data);

        assert_eq!(d.decode_next(&mut s).unwrap(), BlockStatus::Decoded(320));
        assert_eq!(d.take(0).as_ref(), raw.as_slice());
        assert_eq!(codec.decompress_calls.load(Ordering::SeqCst), 1);
        // Stream ended without an end marker.
        assert_eq!(d.decode_next(&mut s).unwrap(), BlockStatus::EndOfStream);
    }

    #[test]
    fn corrupt_payload_fails_input_checksum_before_decompressing() {
        let h = header(ChecksumKind::Crc32, ChecksumKind::Crc32);
        let codec = Arc::new(RunLengthCodec::default());
        let raw = vec![b'z'; 1000];
        let payload = codec.compress_block(&raw).unwrap();
        let mut data = block(&h, &raw, &payload);
        let last = data.len() - 1;
        data[last] ^= 0x01;
        let mut d = decoder(h, codec.clone(), VERIFY);

        let err = d.decode_next(&mut stream(data)).unwrap_err();
        assert!(matches!(err, Error::InputChecksumMismatch { offset: 0, .. }), "{err}");
        assert!(err.is_block_level());
        assert_eq!(codec.decompress_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn output_checksum_mismatch() {
        let h = header(ChecksumKind::Adler32, ChecksumKind::None);
        let codec = Arc::new(RunLengthCodec::default());
        let raw = vec![7u8; 64];
        let payload = codec.compress_block(&raw).unwrap();
        let mut data = block(&h, &raw, &payload);
        // Output checksum sits right after the two lengths.
        data[8] ^= 0xff;
        let mut d = decoder(h, codec, VERIFY);

        let err = d.decode_next(&mut stream(data)).unwrap_err();
        assert!(matches!(err, Error::OutputChecksumMismatch { .. }), "{err}");
    }

    #[test]
    fn disabled_checksums_ignore_bad_values() {
        let h = header(ChecksumKind::Crc32, ChecksumKind::Crc32);
        let codec = Arc::new(RunLengthCodec::default());
        let raw = vec![9u8; 64];
        let payload = codec.compress_block(&raw).unwrap();
        let mut data = block(&h, &raw, &payload);
        data[8] ^= 0xff;
        data[12] ^= 0xff;
        let mut d = decoder(h, codec, ScanConfig::default());

        assert_eq!(d.decode_next(&mut stream(data)).unwrap(), BlockStatus::Decoded(64));
    }

    #[test]
    fn wrong_decompressed_length_fails() {
        let h = header(ChecksumKind::None, ChecksumKind::None);
        let codec = Arc::new(RunLengthCodec::default());
        // Declares 50 bytes but the payload expands to 40.
        let mut data = Vec::new();
        data.extend_from_slice(&50u32.to_be_bytes());
        data.extend_from_slice(&2u32.to_be_bytes());
        data.extend_from_slice(&[40, b'q']);
        let mut d = decoder(h, codec, VERIFY);

        let err = d.decode_next(&mut stream(data)).unwrap_err();
        assert!(
            matches!(err, Error::DecompressionFailed { expected: 50, actual: 40, .. }),
            "{err}"
        );
    }

    #[test]
    fn codec_failure_is_decompression_failed() {
        let h = header(ChecksumKind::None, ChecksumKind::None);
        let mut data = Vec::new();
        data.extend_from_slice(&50u32.to_be_bytes());
        data.extend_from_slice(&3u32.to_be_bytes());
        data.extend_from_slice(&[1, 2, 3]);
        let mut d = decoder(h, Arc::default(), VERIFY);

        let err = d.decode_next(&mut stream(data)).unwrap_err();
        match err {
            Error::DecompressionFailed { reason, .. } => assert!(reason.contains("odd")),
            other => panic!("unexpected {other}"),
        }
    }

    #[test]
    fn length_validation() {
        let h = header(ChecksumKind::None, ChecksumKind::None);

        let data = (-5i32).to_be_bytes().to_vec();
        let err = decoder(h.clone(), Arc::default(), VERIFY)
            .decode_next(&mut stream(data))
            .unwrap_err();
        assert!(matches!(err, Error::CorruptLength { length: -5, .. }));

        let mut data = 100u32.to_be_bytes().to_vec();
        data.extend_from_slice(&(MAX_BLOCK_SIZE + 1).to_be_bytes());
        let err = decoder(h, Arc::default(), VERIFY)
            .decode_next(&mut stream(data))
            .unwrap_err();
        assert!(matches!(err, Error::BlockTooLarge { length, .. } if length == MAX_BLOCK_SIZE + 1));
    }

    #[test]
    fn missing_last_block_depends_on_policy() {
        let h = header(ChecksumKind::None, ChecksumKind::None);
        let mut data = 10u32.to_be_bytes().to_vec();
        data.extend_from_slice(&10u32.to_be_bytes());

        let mut lenient = decoder(h.clone(), Arc::default(), ScanConfig::default());
        assert_eq!(
            lenient.decode_next(&mut stream(data.clone())).unwrap(),
            BlockStatus::EndOfStream
        );

        let strict_config = ScanConfig::default().with_error_policy(ErrorPolicy::Abort);
        let mut strict = decoder(h, Arc::default(), strict_config);
        let err = strict.decode_next(&mut stream(data)).unwrap_err();
        assert!(matches!(err, Error::TruncatedBlock { offset: 0, expected: 10 }));
    }

    #[test]
    fn short_payload_is_corrupt() {
        let h = header(ChecksumKind::None, ChecksumKind::None);
        let mut data = 10u32.to_be_bytes().to_vec();
        data.extend_from_slice(&10u32.to_be_bytes());
        data.extend_from_slice(b"abc");
        let err = decoder(h, Arc::default(), VERIFY)
            .decode_next(&mut stream(data))
            .unwrap_err();
        assert!(matches!(err, Error::CorruptBlock { expected: 10, actual: 3, .. }));
    }

    #[test]
    fn partial_takes_never_cross_the_block() {
        let h = header(ChecksumKind::None, ChecksumKind::None);
        let raw = b"0123456789".to_vec();
        let mut d = decoder(h.clone(), Arc::default(), VERIFY);
        let mut s = stream(block(&h, &raw, &raw));
        d.decode_next(&mut s).unwrap();

        assert_eq!(d.take(4).as_ref(), b"0123");
        assert_eq!(d.bytes_remaining(), 6);
        assert_eq!(d.take(100).as_ref(), b"456789");
        assert_eq!(d.bytes_remaining(), 0);
    }

    #[test]
    fn retained_blocks_stay_valid() {
        let h = header(ChecksumKind::None, ChecksumKind::None);
        let first = b"first stored block".to_vec();
        let second = b"second stored blk!".to_vec();
        let mut data = block(&h, &first, &first);
        data.extend(block(&h, &second, &second));
        let mut d = decoder(h, Arc::default(), VERIFY);
        let mut s = stream(data);

        d.decode_next(&mut s).unwrap();
        let kept = d.take(0);
        d.decode_next(&mut s).unwrap();
        let next = d.take(0);
        assert_eq!(kept.as_ref(), first.as_slice());
        assert_eq!(next.as_ref(), second.as_slice());
    }
}
