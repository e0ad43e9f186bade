//! Page compression boundary.
//!
//! The page writer and the compactor treat compression as an opaque stream
//! transform selected by the tag stored in each page header. The format knows
//! nothing about an algorithm beyond that tag.

use crate::error::{DenError, Result};
use std::io::{self, Read, Write};

/// Compression tag stored in a page header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum CompressionType {
    /// Records stored as serialized.
    #[default]
    None = 0,
    /// Gzip (deflate) stream.
    Gzip = 1,
    /// LZ4 frame stream.
    Lz4 = 2,
    /// Snappy framed stream. Reserved, no codec ships with Den.
    Snappy = 3,
    /// Zstandard stream.
    Zstd = 4,
}

impl CompressionType {
    /// Creates a CompressionType from its on-disk tag.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::Gzip),
            2 => Some(Self::Lz4),
            3 => Some(Self::Snappy),
            4 => Some(Self::Zstd),
            _ => None,
        }
    }

    /// Returns the on-disk tag.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Returns true if pages with this tag need a decode pass before reading.
    pub fn is_compressed(self) -> bool {
        self != Self::None
    }
}

/// A compress/decompress stream capability.
pub trait StreamCodec: Send + Sync {
    /// Tag written into page headers produced by this codec.
    fn compression_type(&self) -> CompressionType;

    /// Compresses everything readable from `reader` into `writer`.
    ///
    /// Returns the number of bytes written.
    fn compress_stream(&self, reader: &mut dyn Read, writer: &mut dyn Write) -> Result<u64>;

    /// Decompresses everything readable from `reader` into `writer`.
    ///
    /// Returns the number of bytes written.
    fn decompress_stream(&self, reader: &mut dyn Read, writer: &mut dyn Write) -> Result<u64>;
}

/// Pass-through codec for uncompressed pages.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCompression;

/// Gzip codec backed by `flate2`.
#[derive(Debug, Clone, Copy)]
pub struct GzipCodec {
    level: u32,
}

/// LZ4 frame codec backed by `lz4`.
#[derive(Debug, Clone, Copy)]
pub struct Lz4Codec {
    level: u32,
}

/// Zstandard codec backed by `zstd`.
#[derive(Debug, Clone, Copy)]
pub struct ZstdCodec {
    level: i32,
}

impl Default for GzipCodec {
    fn default() -> Self {
        Self { level: 6 }
    }
}

impl Default for Lz4Codec {
    fn default() -> Self {
        Self { level: 4 }
    }
}

impl Default for ZstdCodec {
    fn default() -> Self {
        Self { level: 3 }
    }
}

static NO_COMPRESSION: NoCompression = NoCompression;
static GZIP: GzipCodec = GzipCodec { level: 6 };
static LZ4: Lz4Codec = Lz4Codec { level: 4 };
static ZSTD: ZstdCodec = ZstdCodec { level: 3 };

/// Resolves the codec for a page compression tag.
///
/// # Errors
///
/// Returns `DenError::UnsupportedCompression` for tags without a codec.
pub fn codec_for(kind: CompressionType) -> Result<&'static dyn StreamCodec> {
    match kind {
        CompressionType::None => Ok(&NO_COMPRESSION),
        CompressionType::Gzip => Ok(&GZIP),
        CompressionType::Lz4 => Ok(&LZ4),
        CompressionType::Zstd => Ok(&ZSTD),
        CompressionType::Snappy => Err(DenError::UnsupportedCompression(kind.as_u8())),
    }
}

/// Compresses a byte slice with the codec for `kind`.
pub fn compress_bytes(kind: CompressionType, data: &[u8]) -> Result<Vec<u8>> {
    let codec = codec_for(kind)?;
    let mut out = Vec::with_capacity(data.len() / 2);
    let mut input = data;
    codec.compress_stream(&mut input, &mut out)?;
    Ok(out)
}

/// Decompresses a byte slice with the codec for `kind`.
pub fn decompress_bytes(kind: CompressionType, data: &[u8], size_hint: usize) -> Result<Vec<u8>> {
    let codec = codec_for(kind)?;
    let mut out = Vec::with_capacity(size_hint);
    let mut input = data;
    codec.decompress_stream(&mut input, &mut out)?;
    Ok(out)
}

fn compress_err(codec: &str, e: io::Error) -> DenError {
    DenError::CompressionError(format!("{codec}: {e}"))
}

/// Counts bytes passed through to the inner writer.
struct CountingWriter<W> {
    inner: W,
    written: u64,
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl StreamCodec for NoCompression {
    fn compression_type(&self) -> CompressionType {
        CompressionType::None
    }

    fn compress_stream(&self, reader: &mut dyn Read, writer: &mut dyn Write) -> Result<u64> {
        Ok(io::copy(reader, writer)?)
    }

    fn decompress_stream(&self, reader: &mut dyn Read, writer: &mut dyn Write) -> Result<u64> {
        Ok(io::copy(reader, writer)?)
    }
}

impl StreamCodec for GzipCodec {
    fn compression_type(&self) -> CompressionType {
        CompressionType::Gzip
    }

    fn compress_stream(&self, reader: &mut dyn Read, writer: &mut dyn Write) -> Result<u64> {
        let counter = CountingWriter {
            inner: writer,
            written: 0,
        };
        let mut encoder =
            flate2::write::GzEncoder::new(counter, flate2::Compression::new(self.level));
        io::copy(reader, &mut encoder).map_err(|e| compress_err("gzip", e))?;
        let counter = encoder.finish().map_err(|e| compress_err("gzip", e))?;
        Ok(counter.written)
    }

    fn decompress_stream(&self, reader: &mut dyn Read, writer: &mut dyn Write) -> Result<u64> {
        let mut decoder = flate2::read::GzDecoder::new(reader);
        io::copy(&mut decoder, writer).map_err(|e| compress_err("gzip", e))
    }
}

impl StreamCodec for Lz4Codec {
    fn compression_type(&self) -> CompressionType {
        CompressionType::Lz4
    }

    fn compress_stream(&self, reader: &mut dyn Read, writer: &mut dyn Write) -> Result<u64> {
        let counter = CountingWriter {
            inner: writer,
            written: 0,
        };
        let mut encoder = lz4::EncoderBuilder::new()
            .level(self.level)
            .build(counter)
            .map_err(|e| compress_err("lz4", e))?;
        io::copy(reader, &mut encoder).map_err(|e| compress_err("lz4", e))?;
        let (counter, result) = encoder.finish();
        result.map_err(|e| compress_err("lz4", e))?;
        Ok(counter.written)
    }

    fn decompress_stream(&self, reader: &mut dyn Read, writer: &mut dyn Write) -> Result<u64> {
        let mut decoder = lz4::Decoder::new(reader).map_err(|e| compress_err("lz4", e))?;
        io::copy(&mut decoder, writer).map_err(|e| compress_err("lz4", e))
    }
}

impl StreamCodec for ZstdCodec {
    fn compression_type(&self) -> CompressionType {
        CompressionType::Zstd
    }

    fn compress_stream(&self, reader: &mut dyn Read, writer: &mut dyn Write) -> Result<u64> {
        let mut counter = CountingWriter {
            inner: writer,
            written: 0,
        };
        zstd::stream::copy_encode(reader, &mut counter, self.level)
            .map_err(|e| compress_err("zstd", e))?;
        Ok(counter.written)
    }

    fn decompress_stream(&self, reader: &mut dyn Read, writer: &mut dyn Write) -> Result<u64> {
        let mut counter = CountingWriter {
            inner: writer,
            written: 0,
        };
        zstd::stream::copy_decode(reader, &mut counter).map_err(|e| compress_err("zstd", e))?;
        Ok(counter.written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<u8> {
        (0..4096u32)
            .flat_map(|i| format!("GET /index.html {} 200\n", i % 17).into_bytes())
            .collect()
    }

    #[test]
    fn test_tag_mapping() {
        for tag in 0..=4u8 {
            let kind = CompressionType::from_u8(tag).unwrap();
            assert_eq!(kind.as_u8(), tag);
        }
        assert_eq!(CompressionType::from_u8(5), None);
        assert!(!CompressionType::None.is_compressed());
        assert!(CompressionType::Zstd.is_compressed());
    }

    #[test]
    fn test_codecs_restore_input() {
        let data = sample();
        for kind in [
            CompressionType::None,
            CompressionType::Gzip,
            CompressionType::Lz4,
            CompressionType::Zstd,
        ] {
            let packed = compress_bytes(kind, &data).unwrap();
            if kind.is_compressed() {
                assert!(packed.len() < data.len(), "{kind:?} did not shrink input");
            }
            let unpacked = decompress_bytes(kind, &packed, data.len()).unwrap();
            assert_eq!(unpacked, data, "{kind:?}");
        }
    }

    #[test]
    fn test_snappy_is_unsupported() {
        assert!(matches!(
            codec_for(CompressionType::Snappy),
            Err(DenError::UnsupportedCompression(3))
        ));
    }

    #[test]
    fn test_corrupt_stream_reports_compression_error() {
        let garbage = vec![0x42u8; 64];
        let result = decompress_bytes(CompressionType::Gzip, &garbage, 64);
        assert!(matches!(result, Err(DenError::CompressionError(_))));
    }
}
