//! Compression gate for message bodies.
//!
//! Bodies larger than [`COMPRESS_THRESHOLD`] are gzip-compressed before
//! framing; the head carries a flag so the reader knows to inflate.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::Result;

/// Encoded bodies above this many bytes are compressed.
pub const COMPRESS_THRESHOLD: usize = 2048;

pub fn should_compress(body_len: usize) -> bool {
    body_len > COMPRESS_THRESHOLD
}

pub fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::with_capacity(data.len() * 2);
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold() {
        assert!(!should_compress(COMPRESS_THRESHOLD));
        assert!(should_compress(COMPRESS_THRESHOLD + 1));
    }

    #[test]
    fn test_compress_shrinks_repetitive_data() {
        let data = vec![b'x'; 10 * 1024];
        let compressed = compress(&data).unwrap();
        assert!(compressed.len() < data.len());
        assert_eq!(decompress(&compressed).unwrap(), data);
    }

    #[test]
    fn test_decompress_garbage_fails() {
        assert!(decompress(b"definitely not gzip").is_err());
    }
}
