//! Compression providers for collection data blobs.
//!
//! Providers are stateless codecs. Decompressing input that was not
//! produced by the same codec fails with an integrity error instead of
//! returning garbage.

use crate::config::CompressionType;
use crate::error::{CoreError, CoreResult};
use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;
use std::io::{Read, Write};
use std::sync::Arc;

/// A stateless compression codec.
pub trait CompressionProvider: Send + Sync {
    /// Returns which codec this is.
    fn compression_type(&self) -> CompressionType;

    /// Compresses `data`.
    fn compress(&self, data: &[u8]) -> CoreResult<Vec<u8>>;

    /// Decompresses `data` produced by [`compress`](Self::compress).
    ///
    /// # Errors
    ///
    /// Returns an integrity error if `data` is not a valid stream for this
    /// codec.
    fn decompress(&self, data: &[u8]) -> CoreResult<Vec<u8>>;
}

/// Gzip-framed compression.
#[derive(Debug, Clone, Copy)]
pub struct GzipCompression {
    level: Compression,
}

impl GzipCompression {
    /// Creates a gzip codec at the given level (0-9).
    #[must_use]
    pub fn with_level(level: u32) -> Self {
        Self {
            level: Compression::new(level.min(9)),
        }
    }
}

impl Default for GzipCompression {
    fn default() -> Self {
        Self {
            level: Compression::default(),
        }
    }
}

impl CompressionProvider for GzipCompression {
    fn compression_type(&self) -> CompressionType {
        CompressionType::GZip
    }

    fn compress(&self, data: &[u8]) -> CoreResult<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), self.level);
        encoder.write_all(data)?;
        Ok(encoder.finish()?)
    }

    fn decompress(&self, data: &[u8]) -> CoreResult<Vec<u8>> {
        if data.is_empty() {
            return Err(CoreError::integrity("empty gzip stream"));
        }
        let mut out = Vec::new();
        GzDecoder::new(data)
            .read_to_end(&mut out)
            .map_err(|e| CoreError::integrity(format!("invalid gzip stream: {e}")))?;
        Ok(out)
    }
}

/// Zlib-framed deflate compression.
///
/// The zlib container carries an Adler-32 trailer, so corrupted or
/// uncompressed input is detected on decompression.
#[derive(Debug, Clone, Copy)]
pub struct DeflateCompression {
    level: Compression,
}

impl DeflateCompression {
    /// Creates a deflate codec at the given level (0-9).
    #[must_use]
    pub fn with_level(level: u32) -> Self {
        Self {
            level: Compression::new(level.min(9)),
        }
    }
}

impl Default for DeflateCompression {
    fn default() -> Self {
        Self {
            level: Compression::default(),
        }
    }
}

impl CompressionProvider for DeflateCompression {
    fn compression_type(&self) -> CompressionType {
        CompressionType::Deflate
    }

    fn compress(&self, data: &[u8]) -> CoreResult<Vec<u8>> {
        let mut encoder = ZlibEncoder::new(Vec::new(), self.level);
        encoder.write_all(data)?;
        Ok(encoder.finish()?)
    }

    fn decompress(&self, data: &[u8]) -> CoreResult<Vec<u8>> {
        if data.is_empty() {
            return Err(CoreError::integrity("empty deflate stream"));
        }
        let mut out = Vec::new();
        ZlibDecoder::new(data)
            .read_to_end(&mut out)
            .map_err(|e| CoreError::integrity(format!("invalid deflate stream: {e}")))?;
        Ok(out)
    }
}

/// Pass-through codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCompression;

impl CompressionProvider for NoCompression {
    fn compression_type(&self) -> CompressionType {
        CompressionType::None
    }

    fn compress(&self, data: &[u8]) -> CoreResult<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8]) -> CoreResult<Vec<u8>> {
        Ok(data.to_vec())
    }
}

/// Returns the provider for a configured compression type.
#[must_use]
pub fn provider_for(compression: CompressionType) -> Arc<dyn CompressionProvider> {
    match compression {
        CompressionType::None => Arc::new(NoCompression),
        CompressionType::GZip => Arc::new(GzipCompression::default()),
        CompressionType::Deflate => Arc::new(DeflateCompression::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use proptest::prelude::*;

    #[test]
    fn gzip_shrinks_repetitive_data() {
        let data = b"vellum ".repeat(500);
        let gzip = GzipCompression::default();
        let compressed = gzip.compress(&data).unwrap();

        assert!(compressed.len() < data.len());
        assert_eq!(&compressed[..2], &[0x1f, 0x8b]);
        assert_eq!(gzip.decompress(&compressed).unwrap(), data);
    }

    #[test]
    fn deflate_uses_zlib_header() {
        let deflate = DeflateCompression::default();
        let compressed = deflate.compress(b"hello hello hello").unwrap();
        assert_eq!(compressed[0] & 0x0f, 8);
        assert_eq!(deflate.decompress(&compressed).unwrap(), b"hello hello hello");
    }

    #[test]
    fn uncompressed_input_is_rejected() {
        for provider in [
            provider_for(CompressionType::GZip),
            provider_for(CompressionType::Deflate),
        ] {
            let err = provider.decompress(b"not compressed at all").unwrap_err();
            assert_eq!(err.kind(), ErrorKind::IntegrityFailure);
            assert!(provider.decompress(&[]).is_err());
        }
    }

    #[test]
    fn corrupted_deflate_trailer_is_detected() {
        let deflate = DeflateCompression::default();
        let mut compressed = deflate.compress(b"some payload worth checking").unwrap();
        let last = compressed.len() - 1;
        compressed[last] ^= 0xFF;
        assert!(deflate.decompress(&compressed).is_err());
    }

    #[test]
    fn no_compression_is_identity() {
        let none = provider_for(CompressionType::None);
        assert_eq!(none.compression_type(), CompressionType::None);
        assert_eq!(none.compress(b"abc").unwrap(), b"abc");
        assert_eq!(none.decompress(b"abc").unwrap(), b"abc");
    }

    proptest! {
        #[test]
        fn roundtrip(data in proptest::collection::vec(any::<u8>(), 0..4096)) {
            for provider in [GzipCompression::with_level(6), GzipCompression::with_level(1)] {
                let packed = provider.compress(&data).unwrap();
                prop_assert_eq!(provider.decompress(&packed).unwrap(), data.clone());
            }
            let deflate = DeflateCompression::default();
            let packed = deflate.compress(&data).unwrap();
            prop_assert_eq!(deflate.decompress(&packed).unwrap(), data);
        }
    }
}
