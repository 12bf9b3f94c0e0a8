mod lzo1x;
mod stored;

pub use lzo1x::Lzo1xCodec;
pub use stored::StoredCodec;

use lzop_core::format::CompressionMethod;
use lzop_core::Codec;
use std::sync::Arc;

/// Resolve the decompressor for the method byte of a parsed header.
pub fn codec_for_method(method: CompressionMethod) -> Arc<dyn Codec> {
    Arc::new(Lzo1xCodec::new(method))
}

/// Resolve a codec by the name used on the command line.
pub fn codec_by_name(name: &str) -> anyhow::Result<Arc<dyn Codec>> {
    match name {
        "stored" | "none" => Ok(Arc::new(StoredCodec)),
        "lzo" | "lzo1x_1" | "lzo1x-1" => Ok(Arc::new(Lzo1xCodec::new(CompressionMethod::Lzo1x1))),
        "lzo1x_1_15" | "lzo1x-1(15)" => Ok(Arc::new(Lzo1xCodec::new(CompressionMethod::Lzo1x1_15))),
        "lzo1x_999" | "lzo1x-999" => Ok(Arc::new(Lzo1xCodec::new(CompressionMethod::Lzo1x999))),
        other => anyhow::bail!(
            "unknown codec '{}'. Valid options: lzo1x_1, lzo1x_1_15, lzo1x_999, stored",
            other
        ),
    }
}
