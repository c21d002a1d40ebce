//! Decompression of framed blocks.
//!
//! Every compressed object is a sequence of frames, each led by a 9-byte
//! header: a two-byte algorithm tag plus a method byte, then two 3-byte
//! little-endian lengths (compressed, uncompressed — header excluded).
//! Multi-frame objects decompress by concatenation. The algorithm comes from
//! the frame tag, not from the file-level `fCompress` setting: streamer data
//! in particular is zlib-framed regardless of what the file says.

use std::io::Read;

use tracing::trace;

use crate::chunk::{Chunk, Cursor};
use crate::error::{Error, Result};

/// Compression algorithms a file may declare at the file level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    None,
    Zlib,
    Lzma,
    OldCompression,
    Lz4,
    Zstd,
    Unknown(u8),
}

/// File-level compression setting, `algorithm * 100 + level`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Compression {
    pub algorithm: Algorithm,
    pub level: u8,
}

impl Compression {
    pub fn from_code(code: i32) -> Compression {
        let algorithm = match code / 100 {
            0 => Algorithm::None,
            1 => Algorithm::Zlib,
            2 => Algorithm::Lzma,
            3 => Algorithm::OldCompression,
            4 => Algorithm::Lz4,
            5 => Algorithm::Zstd,
            other => Algorithm::Unknown(other as u8),
        };
        Compression {
            algorithm,
            level: (code % 100) as u8,
        }
    }
}

const FRAME_HEADER_LEN: u64 = 9;
const LZ4_CHECKSUM_LEN: usize = 8;

fn three_le(bytes: &[u8]) -> u64 {
    bytes[0] as u64 | (bytes[1] as u64) << 8 | (bytes[2] as u64) << 16
}

/// Decompress `compressed_bytes` starting at `cursor`, producing exactly
/// `uncompressed_bytes` in a fresh chunk at `[0, uncompressed_bytes)`.
///
/// The caller pairs the returned chunk with a cursor whose origin is minus
/// the enclosing key length, so that displacements inside the decompressed
/// buffer reproduce the offsets ROOT wrote for back-references.
pub fn decompress(
    chunk: &Chunk,
    cursor: Cursor,
    compressed_bytes: u64,
    uncompressed_bytes: u64,
) -> Result<Chunk> {
    let path = chunk.file_path().to_string();
    let mut cursor = cursor;
    let end = cursor.index() + compressed_bytes;
    let mut out: Vec<u8> = Vec::with_capacity(uncompressed_bytes as usize);

    while (out.len() as u64) < uncompressed_bytes {
        if cursor.index() + FRAME_HEADER_LEN > end {
            return Err(Error::Format {
                reason: format!(
                    "ran out of compressed frames after {} of {} bytes",
                    out.len(),
                    uncompressed_bytes
                ),
                path,
            });
        }
        let header = cursor.bytes(chunk, FRAME_HEADER_LEN)?;
        let tag = [header[0], header[1]];
        let block_compressed = three_le(&header[3..6]);
        let block_uncompressed = three_le(&header[6..9]);
        trace!(
            tag = %String::from_utf8_lossy(&tag),
            block_compressed,
            block_uncompressed,
            "decompressing frame"
        );

        let block = cursor.bytes(chunk, block_compressed)?;
        let decoded = match &tag {
            b"ZL" => decode_zlib(&block, &path)?,
            b"XZ" => decode_lzma(&block, &path)?,
            b"L4" => decode_lz4(&block, block_uncompressed as usize, &path)?,
            b"ZS" => decode_zstd(&block, block_uncompressed as usize, &path)?,
            b"CS" => {
                return Err(Error::Unsupported {
                    feature: "legacy 'CS' compression".into(),
                    path,
                })
            }
            other => {
                return Err(Error::Format {
                    reason: format!(
                        "unrecognized compressed-block tag {:?}",
                        String::from_utf8_lossy(other)
                    ),
                    path,
                })
            }
        };

        if decoded.len() as u64 != block_uncompressed {
            return Err(Error::Format {
                reason: format!(
                    "compressed block declared {} bytes but decoded to {}",
                    block_uncompressed,
                    decoded.len()
                ),
                path,
            });
        }
        out.extend_from_slice(&decoded);
    }

    if out.len() as u64 != uncompressed_bytes {
        return Err(Error::Format {
            reason: format!(
                "decompression produced {} bytes, expected {}",
                out.len(),
                uncompressed_bytes
            ),
            path,
        });
    }
    Ok(Chunk::wrap(chunk.path_arc(), out))
}

fn decode_zlib(block: &[u8], path: &str) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    flate2::read::ZlibDecoder::new(block)
        .read_to_end(&mut out)
        .map_err(|err| Error::Format {
            reason: format!("zlib: {}", err),
            path: path.to_string(),
        })?;
    Ok(out)
}

fn decode_lzma(block: &[u8], path: &str) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    xz2::read::XzDecoder::new(block)
        .read_to_end(&mut out)
        .map_err(|err| Error::Format {
            reason: format!("lzma: {}", err),
            path: path.to_string(),
        })?;
    Ok(out)
}

fn decode_lz4(block: &[u8], uncompressed: usize, path: &str) -> Result<Vec<u8>> {
    if block.len() < LZ4_CHECKSUM_LEN {
        return Err(Error::Format {
            reason: "lz4 block shorter than its checksum".into(),
            path: path.to_string(),
        });
    }
    let expected = u64::from_be_bytes(block[..LZ4_CHECKSUM_LEN].try_into().expect("8 bytes"));
    let out = lz4_flex::block::decompress(&block[LZ4_CHECKSUM_LEN..], uncompressed).map_err(
        |err| Error::Format {
            reason: format!("lz4: {}", err),
            path: path.to_string(),
        },
    )?;
    let actual = xxhash_rust::xxh64::xxh64(&out, 0);
    if actual != expected {
        return Err(Error::Format {
            reason: format!(
                "lz4 checksum mismatch: block says {:#018x}, payload hashes to {:#018x}",
                expected, actual
            ),
            path: path.to_string(),
        });
    }
    Ok(out)
}

fn decode_zstd(block: &[u8], uncompressed: usize, path: &str) -> Result<Vec<u8>> {
    zstd::bulk::decompress(block, uncompressed).map_err(|err| Error::Format {
        reason: format!("zstd: {}", err),
        path: path.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(tag: &[u8; 2], payload: &[u8], uncompressed: usize) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(tag);
        out.push(8); // method byte, ignored on read
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes()[..3]);
        out.extend_from_slice(&(uncompressed as u32).to_le_bytes()[..3]);
        out.extend_from_slice(payload);
        out
    }

    fn run(frames: Vec<u8>, uncompressed: u64) -> Result<Vec<u8>> {
        let compressed = frames.len() as u64;
        let chunk = Chunk::wrap("test".into(), frames);
        let out = decompress(&chunk, Cursor::new(0), compressed, uncompressed)?;
        Ok(out.raw_data()?.to_vec())
    }

    #[test]
    fn zlib_frame_round_trip() {
        use flate2::write::ZlibEncoder;
        use std::io::Write;

        let original = b"the streamers are always zlib, no matter what the file says";
        let mut encoder = ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(original).unwrap();
        let payload = encoder.finish().unwrap();

        let out = run(frame(b"ZL", &payload, original.len()), original.len() as u64).unwrap();
        assert_eq!(out, original);
    }

    #[test]
    fn zstd_frame_round_trip() {
        let original: Vec<u8> = (0..255u8).cycle().take(4096).collect();
        let payload = zstd::bulk::compress(&original, 3).unwrap();
        let out = run(frame(b"ZS", &payload, original.len()), original.len() as u64).unwrap();
        assert_eq!(out, original);
    }

    #[test]
    fn lz4_frame_requires_matching_checksum() {
        let original = b"four score and seven baskets ago".repeat(8);
        let compressed = lz4_flex::block::compress(&original);
        let checksum = xxhash_rust::xxh64::xxh64(&original, 0);

        let mut payload = checksum.to_be_bytes().to_vec();
        payload.extend_from_slice(&compressed);
        let out = run(frame(b"L4", &payload, original.len()), original.len() as u64).unwrap();
        assert_eq!(out, original);

        let mut bad = (checksum ^ 1).to_be_bytes().to_vec();
        bad.extend_from_slice(&compressed);
        let err = run(frame(b"L4", &bad, original.len()), original.len() as u64).unwrap_err();
        assert!(err.to_string().contains("checksum"));
    }

    #[test]
    fn multi_frame_objects_concatenate() {
        use flate2::write::ZlibEncoder;
        use std::io::Write;

        let first = b"0123456789";
        let second = b"abcdefghij";
        let mut frames = Vec::new();
        for part in [&first[..], &second[..]] {
            let mut encoder = ZlibEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(part).unwrap();
            frames.extend_from_slice(&frame(b"ZL", &encoder.finish().unwrap(), part.len()));
        }
        let out = run(frames, 20).unwrap();
        assert_eq!(out, b"0123456789abcdefghij");
    }

    #[test]
    fn legacy_cs_is_refused() {
        let err = run(frame(b"CS", b"xxxx", 4), 4).unwrap_err();
        assert!(matches!(err, Error::Unsupported { .. }));
    }

    #[test]
    fn compression_codes_decode() {
        assert_eq!(
            Compression::from_code(101),
            Compression {
                algorithm: Algorithm::Zlib,
                level: 1
            }
        );
        assert_eq!(Compression::from_code(505).algorithm, Algorithm::Zstd);
        assert_eq!(Compression::from_code(207).algorithm, Algorithm::Lzma);
    }
}
