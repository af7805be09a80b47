//! Transparent chunk compression (C2).

use crate::error::CoreError;
use serde::{Deserialize, Serialize};

/// Compression algorithms. `None` is the identity transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompressionAlgorithm {
    /// No compression.
    None,
    /// Zstandard at the given level (valid range `1..=19`).
    Zstd {
        /// Compression level.
        level: i32,
    },
}

impl Default for CompressionAlgorithm {
    fn default() -> Self {
        CompressionAlgorithm::Zstd { level: 3 }
    }
}

impl CompressionAlgorithm {
    /// Validate the level range for algorithms that have one.
    pub fn validate(&self) -> Result<(), CoreError> {
        match self {
            CompressionAlgorithm::None => Ok(()),
            CompressionAlgorithm::Zstd { level } => {
                if (1..=19).contains(level) {
                    Ok(())
                } else {
                    Err(CoreError::ConfigInvalid(format!(
                        "zstd level must be in 1..=19, got {level}"
                    )))
                }
            }
        }
    }
}

/// Compress `data` under `algo`. Returns the input unchanged when empty.
pub fn compress(data: &[u8], algo: CompressionAlgorithm) -> Result<Vec<u8>, CoreError> {
    if data.is_empty() {
        return Ok(Vec::new());
    }
    match algo {
        CompressionAlgorithm::None => Ok(data.to_vec()),
        CompressionAlgorithm::Zstd { level } => {
            zstd::encode_all(data, level).map_err(|e| CoreError::CompressionFailure(e.to_string()))
        }
    }
}

/// Decompress `data` under `algo`. Returns the input unchanged when empty.
pub fn decompress(data: &[u8], algo: CompressionAlgorithm) -> Result<Vec<u8>, CoreError> {
    if data.is_empty() {
        return Ok(Vec::new());
    }
    match algo {
        CompressionAlgorithm::None => Ok(data.to_vec()),
        CompressionAlgorithm::Zstd { .. } => {
            zstd::decode_all(data).map_err(|e| CoreError::DecompressionFailure(e.to_string()))
        }
    }
}

const ALREADY_COMPRESSED_CONTENT_TYPES: &[&str] = &[
    "image/jpeg",
    "image/png",
    "image/gif",
    "image/webp",
    "video/mp4",
    "video/webm",
    "video/quicktime",
    "audio/mpeg",
    "audio/mp4",
    "audio/ogg",
    "application/zip",
    "application/gzip",
    "application/x-gzip",
    "application/x-bzip2",
    "application/x-xz",
    "application/x-7z-compressed",
    "application/x-rar-compressed",
    "application/pdf",
];

/// Magic byte prefixes for formats that are already compressed.
const MAGIC_PREFIXES: &[&[u8]] = &[
    &[0x50, 0x4B, 0x03, 0x04], // ZIP
    &[0x1F, 0x8B],             // GZIP
    &[0x28, 0xB5, 0x2F, 0xFD], // ZSTD
    &[0xFD, 0x37, 0x7A, 0x58], // XZ
];

/// Heuristic deciding whether a chunk is worth attempting to compress.
///
/// Skips data under 512 bytes, data whose declared content type is already
/// compressed, and data whose leading bytes match a known compressed-format
/// magic number.
pub fn should_compress(data: &[u8], content_type: Option<&str>) -> bool {
    if data.len() < 512 {
        return false;
    }
    if let Some(ct) = content_type {
        if ALREADY_COMPRESSED_CONTENT_TYPES.contains(&ct) {
            return false;
        }
    }
    for magic in MAGIC_PREFIXES {
        if data.starts_with(magic) {
            return false;
        }
    }
    true
}
