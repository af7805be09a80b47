//! Named pipeline presets (C8) and the validation rules `PipelineConfig`
//! enforces beyond its own per-field checks.

use crate::chunker::{ChunkerAlgorithm, ChunkerConfig, DEFAULT_AVG_SIZE, DEFAULT_MAX_SIZE, DEFAULT_MIN_SIZE};
use crate::compression::CompressionAlgorithm;
use crate::encryption::EncryptionAlgorithm;
use crate::error::CoreError;
use crate::pipeline::PipelineConfig;

/// A named, pre-validated configuration profile. Aliases map to the same
/// profile so deployments can use whichever name reads best for their use
/// case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preset {
    /// Balanced defaults: content-defined chunking, zstd-3, no encryption.
    /// Aliases: `default`.
    Smart,
    /// Favors ratio over metadata overhead for data written once and rarely
    /// read: larger average chunk size, zstd-19, cross-tenant dedup enabled.
    /// Aliases: `cold`.
    Archive,
    /// Favors throughput above all: no content-defined chunking, no
    /// compression, no dedup; encryption stays on since the data is at
    /// rest regardless of processing speed. Aliases: `performance`, `fast`.
    Hpc,
    /// Stores objects verbatim: no chunking, compression, or encryption.
    /// Aliases: `none`.
    Passthrough,
    /// Favors auditability over ratio: encryption mandatory, no
    /// cross-tenant dedup (so no tenant can infer another tenant's content
    /// from a shared ref count), conservative compression, PQ envelope flag
    /// on for key material at rest.
    /// Aliases: `compliance`.
    Enterprise,
    /// `Smart`'s chunking and compression with the PQ envelope flag on:
    /// tenant key material is wrapped for a post-quantum-capable adversary
    /// at rest (see `pq.rs`).
    Pq,
}

impl Preset {
    /// Resolve a preset name, accepting any of its documented aliases.
    /// Matching is case-insensitive.
    pub fn from_name(name: &str) -> Result<Self, CoreError> {
        match name.to_ascii_lowercase().as_str() {
            "smart" | "default" => Ok(Preset::Smart),
            "archive" | "cold" => Ok(Preset::Archive),
            "hpc" | "performance" | "fast" => Ok(Preset::Hpc),
            "passthrough" | "none" => Ok(Preset::Passthrough),
            "enterprise" | "compliance" => Ok(Preset::Enterprise),
            "pq" => Ok(Preset::Pq),
            other => Err(CoreError::ConfigInvalid(format!("unknown preset: {other}"))),
        }
    }

    /// Build the validated `PipelineConfig` this preset describes.
    pub fn to_config(self) -> PipelineConfig {
        match self {
            Preset::Smart => PipelineConfig::default(),
            Preset::Archive => PipelineConfig {
                chunker: ChunkerConfig {
                    algorithm: ChunkerAlgorithm::ContentDefined,
                    min_size: DEFAULT_MIN_SIZE * 4,
                    avg_size: DEFAULT_AVG_SIZE * 4,
                    max_size: DEFAULT_MAX_SIZE * 4,
                    ..ChunkerConfig::default()
                },
                compression: CompressionAlgorithm::Zstd { level: 19 },
                compression_enabled: true,
                encryption: EncryptionAlgorithm::Aes256Gcm,
                encryption_enabled: false,
                dedup_enabled: true,
                cross_tenant_dedup: true,
                passthrough: false,
                pq_envelope: false,
            },
            Preset::Hpc => PipelineConfig {
                // "No chunking" for a config shape that still runs the chunk
                // pipeline (encryption needs a chunk key): a single fixed-size
                // chunk as large as the chunker will allow, so a typical
                // object never gets split.
                chunker: ChunkerConfig {
                    algorithm: ChunkerAlgorithm::Fixed,
                    fixed_chunk_size: 1 << 40, // 1 TiB: larger than any real object
                    ..ChunkerConfig::default()
                },
                compression: CompressionAlgorithm::None,
                compression_enabled: false,
                encryption: EncryptionAlgorithm::Aes256Gcm,
                encryption_enabled: true,
                dedup_enabled: false,
                cross_tenant_dedup: false,
                passthrough: false,
                pq_envelope: false,
            },
            Preset::Passthrough => PipelineConfig {
                passthrough: true,
                dedup_enabled: false,
                cross_tenant_dedup: false,
                compression_enabled: false,
                encryption_enabled: false,
                ..PipelineConfig::default()
            },
            Preset::Enterprise => PipelineConfig {
                chunker: ChunkerConfig::default(),
                compression: CompressionAlgorithm::Zstd { level: 9 },
                compression_enabled: true,
                encryption: EncryptionAlgorithm::XChaCha20Poly1305,
                encryption_enabled: true,
                dedup_enabled: true,
                cross_tenant_dedup: false,
                passthrough: false,
                pq_envelope: true,
            },
            Preset::Pq => PipelineConfig {
                chunker: ChunkerConfig::default(),
                compression: CompressionAlgorithm::default(),
                compression_enabled: true,
                encryption: EncryptionAlgorithm::Aes256Gcm,
                encryption_enabled: true,
                dedup_enabled: true,
                cross_tenant_dedup: false,
                passthrough: false,
                pq_envelope: true,
            },
        }
    }
}

/// Resolve a preset by name and validate the resulting configuration,
/// matching the rules `PipelineConfig::validate` enforces: chunking must be
/// internally consistent, compression level (if enabled) must be in range,
/// and cross-tenant dedup requires dedup to be enabled at all.
pub fn resolve_preset(name: &str) -> Result<PipelineConfig, CoreError> {
    let config = Preset::from_name(name)?.to_config();
    config.validate()?;
    Ok(config)
}
