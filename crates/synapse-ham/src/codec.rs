//! # Gist Codec
//!
//! zlib compression of serialized gists at a fixed level. Decompression
//! failures surface as [`HamError::Corruption`], distinct from the
//! authentication failures the crypto layer raises.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::error::HamError;

/// Fixed compression level for all stored gists
const COMPRESSION_LEVEL: u32 = 6;

/// Compress a serialized gist
pub fn compress(data: &[u8]) -> Result<Vec<u8>, HamError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(COMPRESSION_LEVEL));
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Decompress a stored gist payload
pub fn decompress(data: &[u8]) -> Result<Vec<u8>, HamError> {
    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| HamError::Corruption(e.to_string()))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let data = b"summary text repeated repeated repeated repeated";
        let compressed = compress(data).unwrap();
        assert_eq!(decompress(&compressed).unwrap(), data);
    }

    #[test]
    fn test_compression_shrinks_repetitive_input() {
        let data = "gist ".repeat(200);
        let compressed = compress(data.as_bytes()).unwrap();
        assert!(compressed.len() < data.len());
    }

    #[test]
    fn test_garbage_is_corruption() {
        let result = decompress(b"definitely not zlib");
        assert!(matches!(result, Err(HamError::Corruption(_))));
    }
}
