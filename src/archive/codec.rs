//! Block codecs for stored files.
//!
//! LZ4 and LZ4HC share the LZ4 block format, so both decode with the same
//! routine; the tag only records how the data was produced.

use flate2::read::{DeflateDecoder, DeflateEncoder};
use flate2::Compression;
use std::io::Read;

use super::{ArchiveError, CompressionType};

/// Compress `data` with the given codec.
pub fn compress(kind: CompressionType, data: &[u8]) -> Result<Vec<u8>, ArchiveError> {
    match kind {
        CompressionType::None => Ok(data.to_vec()),
        CompressionType::Lz4 | CompressionType::Lz4Hc => Ok(lz4_flex::block::compress(data)),
        CompressionType::Rfc1951 => {
            let mut encoder = DeflateEncoder::new(data, Compression::best());
            let mut out = Vec::with_capacity(data.len() / 2);
            encoder.read_to_end(&mut out)?;
            Ok(out)
        }
    }
}

/// Decompress `data`, which must expand to exactly `original_size` bytes.
pub fn decompress(
    kind: CompressionType,
    data: &[u8],
    original_size: usize,
) -> Result<Vec<u8>, ArchiveError> {
    let out = match kind {
        CompressionType::None => data.to_vec(),
        CompressionType::Lz4 | CompressionType::Lz4Hc => {
            lz4_flex::block::decompress(data, original_size)
                .map_err(|e| ArchiveError::Decompress(e.to_string()))?
        }
        CompressionType::Rfc1951 => {
            // One byte past the declared size is enough to detect a lie
            let mut decoder = DeflateDecoder::new(data).take(original_size as u64 + 1);
            let mut out = Vec::with_capacity(original_size);
            decoder
                .read_to_end(&mut out)
                .map_err(|e| ArchiveError::Decompress(e.to_string()))?;
            out
        }
    };

    if out.len() != original_size {
        return Err(ArchiveError::Decompress(format!(
            "expected {} bytes, got {}",
            original_size,
            out.len()
        )));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_codec_restores_input() -> Result<(), ArchiveError> {
        let data = b"superpack superpack superpack superpack 0123456789".repeat(40);
        for kind in [
            CompressionType::None,
            CompressionType::Lz4,
            CompressionType::Lz4Hc,
            CompressionType::Rfc1951,
        ] {
            let packed = compress(kind, &data)?;
            if kind != CompressionType::None {
                assert!(packed.len() < data.len(), "{} did not shrink", kind.as_str());
            }
            assert_eq!(decompress(kind, &packed, data.len())?, data);
        }
        Ok(())
    }

    #[test]
    fn test_wrong_size_is_error() -> Result<(), ArchiveError> {
        let packed = compress(CompressionType::Rfc1951, b"hello world")?;
        assert!(decompress(CompressionType::Rfc1951, &packed, 5).is_err());
        assert!(decompress(CompressionType::Lz4, b"\xff\xff\xff", 100).is_err());
        Ok(())
    }

    #[test]
    fn test_deflate_output_is_bounded() -> Result<(), ArchiveError> {
        let bomb = compress(CompressionType::Rfc1951, &vec![0u8; 8 << 20])?;
        assert!(bomb.len() < 64 << 10);
        match decompress(CompressionType::Rfc1951, &bomb, 1024) {
            Err(ArchiveError::Decompress(message)) => assert!(message.contains("got 1025"), "{}", message),
            other => panic!("unexpected result: {:?}", other.map(|v| v.len())),
        }
        Ok(())
    }
}
