use lzop_core::format::CompressionMethod;
use lzop_core::Codec;

/// LZO1X block codec backed by `lzokay-native`.
///
/// All three lzop methods share the LZO1X bitstream, so one decompressor
/// serves them all. The method only changes the byte recorded in headers this
/// codec writes.
pub struct Lzo1xCodec {
    method: CompressionMethod,
}

impl Default for Lzo1xCodec {
    fn default() -> Self {
        Self {
            method: CompressionMethod::Lzo1x1,
        }
    }
}

impl Lzo1xCodec {
    pub fn new(method: CompressionMethod) -> Self {
        Self { method }
    }
}

impl Codec for Lzo1xCodec {
    fn method(&self) -> CompressionMethod {
        self.method
    }

    fn name(&self) -> &'static str {
        self.method.name()
    }

    fn compress_block(&self, raw: &[u8]) -> anyhow::Result<Vec<u8>> {
        lzokay_native::compress(raw).map_err(|e| anyhow::anyhow!("lzo compress error: {:?}", e))
    }

    fn decompress_block(&self, compressed: &[u8], raw_len: usize) -> anyhow::Result<Vec<u8>> {
        lzokay_native::decompress_all(compressed, Some(raw_len))
            .map_err(|e| anyhow::anyhow!("lzo decompress error: {:?}", e))
    }
}
