use crate::checksum::ChecksumKind;
use crate::error::{Error, Result};
use crate::index::BlockIndex;

/// Magic bytes at the start of every lzop file.
pub const MAGIC: [u8; 9] = [0x89, 0x4c, 0x5a, 0x4f, 0x00, 0x0d, 0x0a, 0x1a, 0x0a];

/// Smallest possible header: every fixed field plus an empty name.
///   magic[9] + version:u16 + lib_version:u16 + version_needed:u16
///   + method:u8 + level:u8 + flags:u32 + mode:u32 + mtime:u32 + mtime_high:u32
///   + name_len:u8 + checksum:u32
///   = 9 + 2 + 2 + 2 + 1 + 1 + 4 + 4 + 4 + 4 + 1 + 4 = 38
pub const MIN_HEADER_SIZE: usize = 38;

/// Upper bound of a header without an extra field (name of 255 bytes).
/// The header-only range reads this many bytes.
pub const HEADER_SIZE: usize = MIN_HEADER_SIZE + 255;

/// Latest lzop format version this reader understands.
pub const LZOP_VERSION: u16 = 0x1040;

/// Oldest lzo library version whose output this reader accepts.
pub const MIN_LZO_LIB_VERSION: u16 = 0x0100;

/// Version written into the `version_needed` field by [`crate::Writer`].
pub const VERSION_NEEDED_TO_EXTRACT: u16 = 0x0940;

/// Library version written by [`crate::Writer`].
pub const WRITER_LIB_VERSION: u16 = 0x20a0;

/// Largest block (compressed or uncompressed) a well-formed file contains.
pub const MAX_BLOCK_SIZE: u32 = 64 * 1024 * 1024;

/// Largest per-block prefix: two lengths and two checksums.
pub const MAX_BLOCK_HEADER_SIZE: u32 = 4 * 4;

/// Default raw bytes per block written by [`crate::Writer`]: 256 KB, as lzop does.
pub const DEFAULT_BLOCK_SIZE: u32 = 256 * 1024;

// ── Flags ──────────────────────────────────────────────────────────────────

pub const F_ADLER32_D: u32 = 0x0000_0001;
pub const F_ADLER32_C: u32 = 0x0000_0002;
pub const F_STDIN: u32 = 0x0000_0004;
pub const F_STDOUT: u32 = 0x0000_0008;
pub const F_NAME_DEFAULT: u32 = 0x0000_0010;
pub const F_DOSISH: u32 = 0x0000_0020;
pub const F_H_EXTRA_FIELD: u32 = 0x0000_0040;
pub const F_H_GMTDIFF: u32 = 0x0000_0080;
pub const F_CRC32_D: u32 = 0x0000_0100;
pub const F_CRC32_C: u32 = 0x0000_0200;
pub const F_MULTIPART: u32 = 0x0000_0400;
pub const F_H_FILTER: u32 = 0x0000_0800;
pub const F_H_CRC32: u32 = 0x0000_1000;
pub const F_H_PATH: u32 = 0x0000_2000;
pub const F_MASK: u32 = 0x0000_3fff;
pub const F_OS_MASK: u32 = 0xff00_0000;
pub const F_CS_MASK: u32 = 0x00f0_0000;
pub const F_RESERVED: u32 = !(F_MASK | F_OS_MASK | F_CS_MASK);

/// Flags that make a file unreadable by this decoder.
pub const F_UNSUPPORTED: u32 = F_RESERVED | F_MULTIPART | F_H_FILTER;

// ── Methods ────────────────────────────────────────────────────────────────

/// Compression method byte. Every method is decoded with lzo1x.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionMethod {
    Lzo1x1 = 1,
    Lzo1x1_15 = 2,
    Lzo1x999 = 3,
}

impl CompressionMethod {
    pub fn id(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            CompressionMethod::Lzo1x1 => "LZO1X-1",
            CompressionMethod::Lzo1x1_15 => "LZO1X-1(15)",
            CompressionMethod::Lzo1x999 => "LZO1X-999",
        }
    }
}

impl TryFrom<u8> for CompressionMethod {
    type Error = Error;

    fn try_from(method: u8) -> Result<Self> {
        match method {
            1 => Ok(CompressionMethod::Lzo1x1),
            2 => Ok(CompressionMethod::Lzo1x1_15),
            3 => Ok(CompressionMethod::Lzo1x999),
            _ => Err(Error::UnsupportedMethod { method }),
        }
    }
}

/// Assemble header flags for the given checksum selection.
pub fn checksum_flags(output: ChecksumKind, input: ChecksumKind, header_crc32: bool) -> u32 {
    let mut flags = match output {
        ChecksumKind::None => 0,
        ChecksumKind::Adler32 => F_ADLER32_D,
        ChecksumKind::Crc32 => F_CRC32_D,
    };
    flags |= match input {
        ChecksumKind::None => 0,
        ChecksumKind::Adler32 => F_ADLER32_C,
        ChecksumKind::Crc32 => F_CRC32_C,
    };
    if header_crc32 {
        flags |= F_H_CRC32;
    }
    flags
}

fn output_checksum_kind(flags: u32) -> ChecksumKind {
    if flags & F_CRC32_D != 0 {
        ChecksumKind::Crc32
    } else if flags & F_ADLER32_D != 0 {
        ChecksumKind::Adler32
    } else {
        ChecksumKind::None
    }
}

fn input_checksum_kind(flags: u32) -> ChecksumKind {
    if flags & F_CRC32_C != 0 {
        ChecksumKind::Crc32
    } else if flags & F_ADLER32_C != 0 {
        ChecksumKind::Adler32
    } else {
        ChecksumKind::None
    }
}

/// The header checksum is always present: CRC-32 when `F_H_CRC32` is set, Adler-32 otherwise.
fn header_checksum(flags: u32, data: &[u8]) -> u32 {
    let kind = if flags & F_H_CRC32 != 0 {
        ChecksumKind::Crc32
    } else {
        ChecksumKind::Adler32
    };
    kind.compute(data).unwrap_or_default()
}

// ── Header ─────────────────────────────────────────────────────────────────

/// Decoded lzop file header plus the block index loaded for the file.
///
/// Immutable once parsed; ranges of the same file share one instance through
/// [`crate::HeaderCache`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHeader {
    /// Bytes from the start of the file to the first block.
    pub header_size: usize,
    pub version: u16,
    pub lib_version: u16,
    pub version_needed: u16,
    pub method: CompressionMethod,
    pub level: u8,
    pub flags: u32,
    pub mode: u32,
    pub mtime_low: u32,
    pub mtime_high: u32,
    /// Original file name as stored; not necessarily UTF-8.
    pub name: Vec<u8>,
    /// Contents of the optional extra field when it fit in the parsed span.
    /// Never validated.
    pub extra_field: Option<Vec<u8>>,
    /// Checksum covering decompressed block data.
    pub output_checksum: ChecksumKind,
    /// Checksum covering compressed block data.
    pub input_checksum: ChecksumKind,
    /// Block start offsets from the companion index; empty when unsplittable.
    pub block_offsets: BlockIndex,
}

impl ContainerHeader {
    /// Build a header for writing. The name is truncated to 255 bytes.
    pub fn new(method: CompressionMethod, level: u8, flags: u32, name: &[u8]) -> Self {
        let name = name[..name.len().min(255)].to_vec();
        let mut header = Self {
            header_size: 0,
            version: 0x1030,
            lib_version: WRITER_LIB_VERSION,
            version_needed: VERSION_NEEDED_TO_EXTRACT,
            method,
            level,
            flags,
            mode: 0o100644,
            mtime_low: 0,
            mtime_high: 0,
            name,
            extra_field: None,
            output_checksum: output_checksum_kind(flags),
            input_checksum: input_checksum_kind(flags),
            block_offsets: BlockIndex::default(),
        };
        header.header_size = header.encoded_len();
        header
    }

    /// Parse a header from the leading bytes of a file.
    ///
    /// `span` must hold at least [`MIN_HEADER_SIZE`] bytes plus the name and the
    /// extra field's length; trailing bytes past the header are ignored. The returned header has an empty block index.
    pub fn parse(span: &[u8]) -> Result<Self> {
        if span.len() < MIN_HEADER_SIZE {
            return Err(Error::TruncatedHeader { len: span.len() });
        }
        if span[..MAGIC.len()] != MAGIC {
            let mut found = [0u8; 9];
            found.copy_from_slice(&span[..MAGIC.len()]);
            return Err(Error::BadMagic { found });
        }

        let mut cur = HeaderCursor::new(span, MAGIC.len());

        let version = cur.u16()?;
        if version > LZOP_VERSION {
            return Err(Error::UnsupportedVersion { version, max: LZOP_VERSION });
        }
        let lib_version = cur.u16()?;
        if lib_version < MIN_LZO_LIB_VERSION {
            return Err(Error::IncompatibleLibraryVersion {
                version: lib_version,
                min: MIN_LZO_LIB_VERSION,
            });
        }
        let version_needed = cur.u16()?;
        if version_needed > LZOP_VERSION {
            return Err(Error::UnsupportedVersion {
                version: version_needed,
                max: LZOP_VERSION,
            });
        }
        let method = CompressionMethod::try_from(cur.u8()?)?;
        let level = cur.u8()?;

        let flags = cur.u32()?;
        if flags & F_UNSUPPORTED != 0 {
            return Err(Error::UnsupportedFlags { flags });
        }

        let mode = cur.u32()?;
        let mtime_low = cur.u32()?;
        let mtime_high = cur.u32()?;

        let name_len = cur.u8()? as usize;
        let name = cur.take(name_len)?.to_vec();

        let actual = header_checksum(flags, &span[MAGIC.len()..cur.pos]);
        let expected = cur.u32()?;
        if actual != expected {
            return Err(Error::HeaderChecksumMismatch { expected, actual });
        }

        // Only the extra field's length is needed to locate the first block, so
        // its body and checksum may lie past the end of `span`.
        let (header_size, extra_field) = if flags & F_H_EXTRA_FIELD != 0 {
            let len = cur.u32()? as usize;
            let start = cur.pos;
            let data = span.get(start..start.saturating_add(len)).map(<[u8]>::to_vec);
            (start.saturating_add(len).saturating_add(4), data)
        } else {
            (cur.pos, None)
        };

        tracing::debug!(
            version = format_args!("{:#06x}", version),
            lib_version = format_args!("{:#06x}", lib_version),
            version_needed = format_args!("{:#06x}", version_needed),
            method = method.name(),
            level,
            flags = format_args!("{:#010x}", flags),
            header_size,
            "parsed lzop header"
        );

        Ok(Self {
            header_size,
            version,
            lib_version,
            version_needed,
            method,
            level,
            flags,
            mode,
            mtime_low,
            mtime_high,
            name,
            extra_field,
            output_checksum: output_checksum_kind(flags),
            input_checksum: input_checksum_kind(flags),
            block_offsets: BlockIndex::default(),
        })
    }

    /// Serialize the structural fields. The block index is not part of the header.
    pub fn to_bytes(&self) -> Vec<u8> {
        let name = &self.name[..self.name.len().min(255)];
        let mut buf = Vec::with_capacity(MIN_HEADER_SIZE + name.len());
        buf.extend_from_slice(&MAGIC);
        buf.extend_from_slice(&self.version.to_be_bytes());
        buf.extend_from_slice(&self.lib_version.to_be_bytes());
        buf.extend_from_slice(&self.version_needed.to_be_bytes());
        buf.push(self.method.id());
        buf.push(self.level);
        buf.extend_from_slice(&self.flags.to_be_bytes());
        buf.extend_from_slice(&self.mode.to_be_bytes());
        buf.extend_from_slice(&self.mtime_low.to_be_bytes());
        buf.extend_from_slice(&self.mtime_high.to_be_bytes());
        buf.push(name.len() as u8);
        buf.extend_from_slice(name);
        let checksum = header_checksum(self.flags, &buf[MAGIC.len()..]);
        buf.extend_from_slice(&checksum.to_be_bytes());

        if self.flags & F_H_EXTRA_FIELD != 0 {
            let extra = self.extra_field.as_deref().unwrap_or_default();
            buf.extend_from_slice(&(extra.len() as u32).to_be_bytes());
            buf.extend_from_slice(extra);
            buf.extend_from_slice(&header_checksum(self.flags, extra).to_be_bytes());
        }
        buf
    }

    fn encoded_len(&self) -> usize {
        let mut len = MIN_HEADER_SIZE + self.name.len().min(255);
        if self.flags & F_H_EXTRA_FIELD != 0 {
            len += 8 + self.extra_field.as_ref().map_or(0, Vec::len);
        }
        len
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    /// A file is splittable when an index of block offsets was found.
    pub fn is_splittable(&self) -> bool {
        !self.block_offsets.is_empty()
    }

    pub fn name_lossy(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }
}

/// Bounds-checked big-endian reader over the header span.
struct HeaderCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> HeaderCursor<'a> {
    fn new(buf: &'a [u8], pos: usize) -> Self {
        Self { buf, pos }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or(Error::TruncatedHeader { len: self.buf.len() })?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(flags: u32) -> ContainerHeader {
        ContainerHeader::new(CompressionMethod::Lzo1x1, 5, flags, b"access.log")
    }

    /// Rewrite the flags of an encoded header and fix up its checksum.
    fn with_flags(bytes: &[u8], flags: u32) -> Vec<u8> {
        let mut out = bytes.to_vec();
        out[17..21].copy_from_slice(&flags.to_be_bytes());
        let name_len = out[33] as usize;
        let sum_at = 34 + name_len;
        let sum = header_checksum(flags, &out[MAGIC.len()..sum_at]);
        out[sum_at..sum_at + 4].copy_from_slice(&sum.to_be_bytes());
        out
    }

    #[test]
    fn parse_reads_every_field() {
        let flags = checksum_flags(ChecksumKind::Adler32, ChecksumKind::Crc32, true);
        let bytes = sample(flags).to_bytes();
        let header = ContainerHeader::parse(&bytes).unwrap();
        assert_eq!(header.header_size, bytes.len());
        assert_eq!(header.header_size, MIN_HEADER_SIZE + "access.log".len());
        assert_eq!(header.method, CompressionMethod::Lzo1x1);
        assert_eq!(header.level, 5);
        assert_eq!(header.output_checksum, ChecksumKind::Adler32);
        assert_eq!(header.input_checksum, ChecksumKind::Crc32);
        assert_eq!(header.name_lossy(), "access.log");
        assert!(!header.is_splittable());
    }

    #[test]
    fn crc32_bit_wins_over_adler() {
        let flags = F_ADLER32_D | F_CRC32_D | F_ADLER32_C;
        let header = ContainerHeader::parse(&sample(flags).to_bytes()).unwrap();
        assert_eq!(header.output_checksum, ChecksumKind::Crc32);
        assert_eq!(header.input_checksum, ChecksumKind::Adler32);
    }

    #[test]
    fn trailing_bytes_are_ignored() {
        let mut bytes = sample(0).to_bytes();
        let header_len = bytes.len();
        bytes.extend_from_slice(&[0xAB; 200]);
        let header = ContainerHeader::parse(&bytes).unwrap();
        assert_eq!(header.header_size, header_len);
    }

    #[test]
    fn short_span_is_truncated() {
        let bytes = sample(0).to_bytes();
        let err = ContainerHeader::parse(&bytes[..MIN_HEADER_SIZE - 1]).unwrap_err();
        assert!(matches!(err, Error::TruncatedHeader { len } if len == MIN_HEADER_SIZE - 1));

        // Long enough for the fixed part, too short for the declared name.
        let err = ContainerHeader::parse(&bytes[..MIN_HEADER_SIZE + 2]).unwrap_err();
        assert!(matches!(err, Error::TruncatedHeader { .. }));
    }

    #[test]
    fn bad_magic() {
        let mut bytes = sample(0).to_bytes();
        bytes[1] = b'X';
        let err = ContainerHeader::parse(&bytes).unwrap_err();
        assert!(matches!(err, Error::BadMagic { found } if found[1] == b'X'));
        assert!(err.is_header_level());
    }

    #[test]
    fn version_checks() {
        let mut header = sample(0);
        header.version = LZOP_VERSION + 1;
        let err = ContainerHeader::parse(&header.to_bytes()).unwrap_err();
        assert!(matches!(err, Error::UnsupportedVersion { version, .. } if version == LZOP_VERSION + 1));

        let mut header = sample(0);
        header.lib_version = MIN_LZO_LIB_VERSION - 1;
        let err = ContainerHeader::parse(&header.to_bytes()).unwrap_err();
        assert!(matches!(err, Error::IncompatibleLibraryVersion { .. }));

        let mut header = sample(0);
        header.version_needed = 0xffff;
        let err = ContainerHeader::parse(&header.to_bytes()).unwrap_err();
        assert!(matches!(err, Error::UnsupportedVersion { version: 0xffff, .. }));
    }

    #[test]
    fn method_out_of_range() {
        for method in [0u8, 4, 0xff] {
            let mut bytes = sample(0).to_bytes();
            bytes[15] = method;
            let err = ContainerHeader::parse(&bytes).unwrap_err();
            assert!(matches!(err, Error::UnsupportedMethod { method: m } if m == method));
        }
    }

    #[test]
    fn each_unsupported_flag_bit_is_rejected() {
        let bytes = sample(0).to_bytes();
        let bits = (0..32)
            .map(|bit| 1u32 << bit)
            .filter(|bit| bit & F_UNSUPPORTED != 0);
        let mut checked = 0;
        for bit in bits {
            let err = ContainerHeader::parse(&with_flags(&bytes, bit)).unwrap_err();
            assert!(
                matches!(err, Error::UnsupportedFlags { flags } if flags == bit),
                "bit {bit:#010x} should be rejected, got {err}"
            );
            checked += 1;
        }
        assert!(checked > 2);
    }

    #[test]
    fn header_checksum_bit_flip() {
        for flags in [0, F_H_CRC32] {
            let bytes = sample(flags).to_bytes();
            let mut corrupt = bytes.clone();
            let sum_at = bytes.len() - 4;
            corrupt[sum_at + 2] ^= 0x10;
            let err = ContainerHeader::parse(&corrupt).unwrap_err();
            assert!(matches!(err, Error::HeaderChecksumMismatch { .. }));
            // The untouched copy still parses.
            assert!(ContainerHeader::parse(&bytes).is_ok());
        }
    }

    #[test]
    fn extra_field_is_skipped() {
        let mut header = sample(F_H_EXTRA_FIELD);
        header.extra_field = Some(b"extra-bytes".to_vec());
        header.header_size = header.encoded_len();
        let mut bytes = header.to_bytes();
        bytes.extend_from_slice(&[0, 0, 0, 0]);
        let parsed = ContainerHeader::parse(&bytes).unwrap();
        assert_eq!(parsed.header_size, bytes.len() - 4);
        assert_eq!(parsed.extra_field.as_deref(), Some(&b"extra-bytes"[..]));
        assert_eq!(parsed, header);
    }

    #[test]
    fn extra_field_past_the_span_still_sizes_the_header() {
        let mut header = ContainerHeader::new(CompressionMethod::Lzo1x1, 1, F_H_EXTRA_FIELD, &[b'n'; 250]);
        header.extra_field = Some(vec![0x5a; 16]);
        header.header_size = header.encoded_len();
        let bytes = header.to_bytes();
        assert!(bytes.len() > HEADER_SIZE);

        let parsed = ContainerHeader::parse(&bytes[..HEADER_SIZE]).unwrap();
        assert_eq!(parsed.header_size, bytes.len());
        assert_eq!(parsed.extra_field, None);
        assert_eq!(parsed.name.len(), 250);

        // The length itself must be readable.
        let err = ContainerHeader::parse(&bytes[..MIN_HEADER_SIZE + 250 + 2]).unwrap_err();
        assert!(matches!(err, Error::TruncatedHeader { .. }));
    }

    #[test]
    fn long_names_are_truncated() {
        let header = ContainerHeader::new(CompressionMethod::Lzo1x999, 9, 0, &[b'n'; 400]);
        assert_eq!(header.name.len(), 255);
        assert_eq!(header.header_size, HEADER_SIZE);
        let parsed = ContainerHeader::parse(&header.to_bytes()).unwrap();
        assert_eq!(parsed, header);
    }
}
