use crate::format::CompressionMethod;

/// Block compression abstraction.
///
/// Each `Codec` implementation:
/// - Is identified by the method byte stored in the lzop header.
/// - Compresses and decompresses single blocks with no cross-block state, so
///   any indexed block can be decoded on its own.
/// - Decompresses in one shot; the output length is known up front from the
///   block prefix.
pub trait Codec: Send + Sync {
    /// Method byte written into headers produced with this codec.
    fn method(&self) -> CompressionMethod;

    /// Human-readable codec name for CLI display.
    fn name(&self) -> &'static str;

    /// Compress a single independent block.
    fn compress_block(&self, raw: &[u8]) -> anyhow::Result<Vec<u8>>;

    /// Decompress a single block whose declared uncompressed length is `raw_len`.
    ///
    /// Returning a buffer of a different length is treated by the decoder as a
    /// failed decompression.
    fn decompress_block(&self, compressed: &[u8], raw_len: usize) -> anyhow::Result<Vec<u8>>;
}
