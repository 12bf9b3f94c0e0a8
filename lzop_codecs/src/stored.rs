use lzop_core::format::CompressionMethod;
use lzop_core::Codec;

/// No-op codec: every block comes out of the writer stored.
///
/// Useful for:
/// - Verifying the container round-trip independently of LZO.
/// - Data that is already compressed, where LZO would only expand it.
///
/// Readers need no special support; stored blocks are recognized by their
/// equal lengths and never reach a codec.
pub struct StoredCodec;

impl Codec for StoredCodec {
    fn method(&self) -> CompressionMethod {
        CompressionMethod::Lzo1x1
    }

    fn name(&self) -> &'static str {
        "stored"
    }

    fn compress_block(&self, raw: &[u8]) -> anyhow::Result<Vec<u8>> {
        Ok(raw.to_vec())
    }

    fn decompress_block(&self, compressed: &[u8], _raw_len: usize) -> anyhow::Result<Vec<u8>> {
        Ok(compressed.to_vec())
    }
}
