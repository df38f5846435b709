//! Decompression dispatch for the block/grain payloads found in the
//! supported formats.
//!
//! Every caller knows the exact uncompressed size of the unit it is
//! reading (a cluster, a grain, a backup block), so each algorithm is
//! required to produce exactly that many bytes. A mismatch means the
//! metadata and the payload disagree.

use std::io::Read;

use flate2::bufread::{DeflateDecoder, ZlibDecoder};

use crate::errors::{Error, Result};

/// The compression algorithms used by the supported formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    /// Raw deflate, no zlib wrapper (QCOW2 clusters, VMDK grains).
    ZlibRaw,
    /// Deflate with a zlib wrapper.
    Zlib,
    /// LZ4 block format (VBK storage blocks).
    Lz4,
    /// Zstandard (QCOW2 clusters with the zstd compression type).
    Zstd,
}

/// Decompress `input` into exactly `expected` bytes.
///
/// The input buffer may carry trailing padding after the compressed
/// payload (QCOW2 rounds compressed clusters up to 512-byte sectors);
/// the decoders stop once `expected` bytes have been produced.
pub fn decompress(algo: Compression, input: &[u8], expected: usize) -> Result<Vec<u8>> {
    match algo {
        Compression::ZlibRaw => {
            let mut out = vec![0u8; expected];
            let mut decoder = DeflateDecoder::new(input);
            decoder
                .read_exact(&mut out)
                .map_err(|e| Error::corrupt(format!("deflate stream truncated: {}", e)))?;
            Ok(out)
        }
        Compression::Zlib => {
            let mut out = vec![0u8; expected];
            let mut decoder = ZlibDecoder::new(input);
            decoder
                .read_exact(&mut out)
                .map_err(|e| Error::corrupt(format!("zlib stream truncated: {}", e)))?;
            Ok(out)
        }
        Compression::Lz4 => {
            let out = lz4_flex::block::decompress(input, expected)
                .map_err(|e| Error::corrupt(format!("lz4 block invalid: {}", e)))?;
            if out.len() != expected {
                return Err(Error::corrupt(format!(
                    "lz4 block decompressed to {} bytes, expected {}",
                    out.len(),
                    expected
                )));
            }
            Ok(out)
        }
        Compression::Zstd => {
            let mut out = vec![0u8; expected];
            let mut decoder = zstd::stream::read::Decoder::new(input)
                .map_err(|e| Error::corrupt(format!("zstd stream invalid: {}", e)))?;
            decoder
                .read_exact(&mut out)
                .map_err(|e| Error::corrupt(format!("zstd stream truncated: {}", e)))?;
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::{DeflateEncoder, ZlibEncoder};
    use flate2::Compression as Level;
    use std::io::Write;

    fn sample() -> Vec<u8> {
        (0u8..=255).cycle().take(4096).collect()
    }

    #[test]
    fn test_zlib_raw_round_trip() {
        let data = sample();
        let mut encoder = DeflateEncoder::new(Vec::new(), Level::default());
        encoder.write_all(&data).unwrap();
        let mut compressed = encoder.finish().unwrap();
        // QCOW2 pads compressed clusters to full sectors.
        compressed.resize(compressed.len().div_ceil(512) * 512, 0);

        assert_eq!(decompress(Compression::ZlibRaw, &compressed, 4096).unwrap(), data);
    }

    #[test]
    fn test_zlib_wrapped_round_trip() {
        let data = sample();
        let mut encoder = ZlibEncoder::new(Vec::new(), Level::default());
        encoder.write_all(&data).unwrap();
        let compressed = encoder.finish().unwrap();

        assert_eq!(decompress(Compression::Zlib, &compressed, 4096).unwrap(), data);
    }

    #[test]
    fn test_lz4_round_trip() {
        let data = sample();
        let compressed = lz4_flex::block::compress(&data);
        assert_eq!(decompress(Compression::Lz4, &compressed, 4096).unwrap(), data);
    }

    #[test]
    fn test_zstd_round_trip() {
        let data = sample();
        let compressed = zstd::stream::encode_all(&data[..], 3).unwrap();
        assert_eq!(decompress(Compression::Zstd, &compressed, 4096).unwrap(), data);
    }

    #[test]
    fn test_short_stream_is_corrupt_metadata() {
        let data = sample();
        let mut encoder = DeflateEncoder::new(Vec::new(), Level::default());
        encoder.write_all(&data[..100]).unwrap();
        let compressed = encoder.finish().unwrap();

        match decompress(Compression::ZlibRaw, &compressed, 4096) {
            Err(Error::CorruptMetadata(_)) => (),
            other => panic!("expected CorruptMetadata, got {:?}", other),
        }
    }

    #[test]
    fn test_lz4_size_mismatch_is_corrupt_metadata() {
        let compressed = lz4_flex::block::compress(&sample());
        assert!(matches!(
            decompress(Compression::Lz4, &compressed, 100),
            Err(Error::CorruptMetadata(_))
        ));
    }
}
