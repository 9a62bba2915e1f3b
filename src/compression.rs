//! Block payload codecs
//!
//! The codec is opaque to the cache layer: a block is decompressed into
//! big-endian element bytes before type conversion happens in [`crate::chunk`].

use crate::error::{Result, VolumeError};
use flate2::read::{GzDecoder, GzEncoder};
use flate2::Compression as FlateCompression;
use serde::{Deserialize, Serialize};
use std::io::Read;

/// Compression entry of an N5 `attributes.json`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CompressionMethod {
    #[default]
    Raw,
    Gzip {
        #[serde(default = "default_gzip_level")]
        level: i32,
    },
    Zstd {
        #[serde(default = "default_zstd_level")]
        level: i32,
    },
}

fn default_gzip_level() -> i32 {
    -1
}

fn default_zstd_level() -> i32 {
    3
}

/// Trait for compression/decompression of block payloads
pub trait Compressor: Send + Sync {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    fn decompress(&self, data: &[u8], expected_size: Option<usize>) -> Result<Vec<u8>>;

    fn method(&self) -> CompressionMethod;
}

#[derive(Debug, Default)]
pub struct RawCompressor;

impl Compressor for RawCompressor {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8], _expected_size: Option<usize>) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn method(&self) -> CompressionMethod {
        CompressionMethod::Raw
    }
}

/// Gzip compression; level `-1` selects the library default.
#[derive(Debug)]
pub struct GzipCompressor {
    level: i32,
}

impl GzipCompressor {
    pub fn new(level: i32) -> Self {
        Self { level }
    }

    fn flate_level(&self) -> FlateCompression {
        match self.level {
            n if n < 0 => FlateCompression::default(),
            n => FlateCompression::new(n.min(9) as u32),
        }
    }
}

impl Compressor for GzipCompressor {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(data, self.flate_level());
        let mut compressed = Vec::new();
        encoder
            .read_to_end(&mut compressed)
            .map_err(|e| VolumeError::Codec(e.to_string()))?;
        Ok(compressed)
    }

    fn decompress(&self, data: &[u8], expected_size: Option<usize>) -> Result<Vec<u8>> {
        let mut decoder = GzDecoder::new(data);
        let mut decompressed = match expected_size {
            Some(size) => Vec::with_capacity(size),
            None => Vec::new(),
        };
        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| VolumeError::Codec(e.to_string()))?;
        Ok(decompressed)
    }

    fn method(&self) -> CompressionMethod {
        CompressionMethod::Gzip { level: self.level }
    }
}

#[derive(Debug)]
pub struct ZstdCompressor {
    level: i32,
}

impl ZstdCompressor {
    pub fn new(level: i32) -> Self {
        Self { level }
    }
}

impl Compressor for ZstdCompressor {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        zstd::encode_all(data, self.level).map_err(|e| VolumeError::Codec(e.to_string()))
    }

    fn decompress(&self, data: &[u8], _expected_size: Option<usize>) -> Result<Vec<u8>> {
        zstd::decode_all(data).map_err(|e| VolumeError::Codec(e.to_string()))
    }

    fn method(&self) -> CompressionMethod {
        CompressionMethod::Zstd { level: self.level }
    }
}

/// Get a compressor for a given method
pub fn get_compressor(method: CompressionMethod) -> Box<dyn Compressor> {
    match method {
        CompressionMethod::Raw => Box::new(RawCompressor),
        CompressionMethod::Gzip { level } => Box::new(GzipCompressor::new(level)),
        CompressionMethod::Zstd { level } => Box::new(ZstdCompressor::new(level)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_is_identity() {
        let compressor = RawCompressor;
        let data = b"raw block";
        assert_eq!(compressor.compress(data).unwrap(), data);
        assert_eq!(compressor.decompress(data, None).unwrap(), data);
    }

    #[test]
    fn test_gzip() {
        let compressor = get_compressor(CompressionMethod::Gzip { level: -1 });
        let data = [0u8, 0, 0, 7].repeat(256);
        let compressed = compressor.compress(&data).unwrap();
        assert!(compressed.len() < data.len());
        let decompressed = compressor.decompress(&compressed, Some(data.len())).unwrap();
        assert_eq!(decompressed, data);
    }

    #[test]
    fn test_zstd() {
        let compressor = get_compressor(CompressionMethod::Zstd { level: 3 });
        let data = b"label label label ".repeat(64);
        let compressed = compressor.compress(&data).unwrap();
        assert!(compressed.len() < data.len());
        assert_eq!(compressor.decompress(&compressed, None).unwrap(), data);
    }

    #[test]
    fn test_corrupt_gzip_is_codec_error() {
        let compressor = GzipCompressor::new(6);
        let err = compressor.decompress(b"definitely not gzip", None).unwrap_err();
        assert!(matches!(err, VolumeError::Codec(_)));
    }

    #[test]
    fn test_n5_compression_json() {
        let gzip: CompressionMethod =
            serde_json::from_str(r#"{"type":"gzip","level":-1}"#).unwrap();
        assert_eq!(gzip, CompressionMethod::Gzip { level: -1 });
        let raw: CompressionMethod = serde_json::from_str(r#"{"type":"raw"}"#).unwrap();
        assert_eq!(raw, CompressionMethod::Raw);
        let zstd: CompressionMethod = serde_json::from_str(r#"{"type":"zstd"}"#).unwrap();
        assert_eq!(zstd, CompressionMethod::Zstd { level: 3 });
    }
}
