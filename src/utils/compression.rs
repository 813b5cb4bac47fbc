use crate::config::MAX_MSG_DATA_SIZE;
use crate::error::{ProtocolError, Result};
use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// Algorithm behind the compressed flag of a message head
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionKind {
    #[default]
    Zlib,
    Gzip,
    Lz4,
    Zstd,
}

/// Default output cap for decompression, aligned with the payload limit
pub const MAX_DECOMPRESSION_SIZE: usize = MAX_MSG_DATA_SIZE as usize;

/// Compresses data using the specified compression algorithm
///
/// # Errors
/// Returns `ProtocolError::CompressionFailure` if compression fails
pub fn compress(data: &[u8], kind: &CompressionKind) -> Result<Vec<u8>> {
    match kind {
        CompressionKind::Zlib => {
            let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
            enc.write_all(data)
                .map_err(|_| ProtocolError::CompressionFailure)?;
            enc.finish().map_err(|_| ProtocolError::CompressionFailure)
        }
        CompressionKind::Gzip => {
            let mut enc = GzEncoder::new(Vec::new(), Compression::default());
            enc.write_all(data)
                .map_err(|_| ProtocolError::CompressionFailure)?;
            enc.finish().map_err(|_| ProtocolError::CompressionFailure)
        }
        CompressionKind::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
        CompressionKind::Zstd => {
            let mut out = Vec::new();
            zstd::stream::copy_encode(data, &mut out, 1)
                .map_err(|_| ProtocolError::CompressionFailure)?;
            Ok(out)
        }
    }
}

/// Decompresses data with the default output cap
pub fn decompress(data: &[u8], kind: &CompressionKind) -> Result<Vec<u8>> {
    decompress_with_limit(data, kind, MAX_DECOMPRESSION_SIZE)
}

/// Decompresses data that was compressed with the specified algorithm
///
/// Output larger than `limit` is rejected so a small frame cannot expand
/// into an unbounded allocation.
///
/// # Errors
/// Returns `ProtocolError::DecompressionFailure` if:
/// - Decompression fails
/// - Output size exceeds `limit`
pub fn decompress_with_limit(data: &[u8], kind: &CompressionKind, limit: usize) -> Result<Vec<u8>> {
    match *kind {
        CompressionKind::Zlib => read_limited(ZlibDecoder::new(data), limit),
        CompressionKind::Gzip => read_limited(GzDecoder::new(data), limit),
        CompressionKind::Lz4 => {
            // lz4_flex prepends the uncompressed size as 4 bytes little-endian
            if data.len() < 4 {
                return Err(ProtocolError::DecompressionFailure);
            }

            let claimed_size = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
            if claimed_size > limit {
                return Err(ProtocolError::DecompressionFailure);
            }

            let decompressed = lz4_flex::decompress_size_prepended(data)
                .map_err(|_| ProtocolError::DecompressionFailure)?;

            if decompressed.len() > limit {
                return Err(ProtocolError::DecompressionFailure);
            }
            Ok(decompressed)
        }
        CompressionKind::Zstd => {
            let reader = zstd::stream::Decoder::new(data)
                .map_err(|_| ProtocolError::DecompressionFailure)?;
            read_limited(reader, limit)
        }
    }
}

fn read_limited<R: Read>(mut reader: R, limit: usize) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut buffer = [0u8; 8192];
    loop {
        match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => {
                out.extend_from_slice(&buffer[..n]);
                if out.len() > limit {
                    return Err(ProtocolError::DecompressionFailure);
                }
            }
            Err(_) => return Err(ProtocolError::DecompressionFailure),
        }
    }
    Ok(out)
}

/// Compress `data` when it is at least `threshold_bytes` long.
///
/// Returns `None` below the threshold. A threshold of zero disables compression.
pub fn maybe_compress(
    data: &[u8],
    kind: &CompressionKind,
    threshold_bytes: usize,
) -> Result<Option<Vec<u8>>> {
    if threshold_bytes == 0 || data.len() < threshold_bytes {
        return Ok(None);
    }
    compress(data, kind).map(Some)
}
