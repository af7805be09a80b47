//! Data reduction pipeline: chunk -> compress -> encrypt, and its inverse.
//!
//! The pipeline is a pure data transform: it does not consult the global
//! content index and does not decide what to store where. `ProcessingBackend`
//! (`backend.rs`) wraps it with dedup and storage decisions.

use crate::chunker::{Chunk, Chunker, ChunkerConfig};
use crate::compression::{compress, decompress, should_compress, CompressionAlgorithm};
use crate::encryption::{decrypt, encrypt, EncryptionAlgorithm};
use crate::error::CoreError;
use crate::fingerprint::Fingerprint;
use crate::key_manager::{KeyManager, TenantKey};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::instrument;

/// Configuration shared by `Pipeline` and `ProcessingBackend`. Presets in
/// `config.rs` build validated instances of this type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Content-defined or fixed-size chunking parameters.
    pub chunker: ChunkerConfig,
    /// Compression algorithm applied to chunks that pass `should_compress`.
    pub compression: CompressionAlgorithm,
    /// Whether compression is attempted at all.
    pub compression_enabled: bool,
    /// AEAD algorithm applied to chunks when `encryption_enabled`.
    pub encryption: EncryptionAlgorithm,
    /// Whether encryption is applied. Requires a tenant key at call time.
    pub encryption_enabled: bool,
    /// Whether duplicate chunks are eliminated against the global content index.
    pub dedup_enabled: bool,
    /// Whether dedup is allowed to match chunks from other tenants.
    pub cross_tenant_dedup: bool,
    /// Store the object verbatim, skipping chunking, compression, and
    /// encryption entirely.
    pub passthrough: bool,
    /// Whether tenant/master key material for this configuration should be
    /// wrapped in a post-quantum hybrid envelope (`pq.rs`) at rest. This is
    /// a key-management flag, not a chunk-processing stage: chunk data
    /// itself is never encrypted with the PQ envelope, only the keys that
    /// protect it, so `Pipeline::process`/`reconstruct` do not consult it.
    pub pq_envelope: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chunker: ChunkerConfig::default(),
            compression: CompressionAlgorithm::default(),
            compression_enabled: true,
            encryption: EncryptionAlgorithm::default(),
            encryption_enabled: false,
            dedup_enabled: true,
            cross_tenant_dedup: false,
            passthrough: false,
            pq_envelope: false,
        }
    }
}

impl PipelineConfig {
    /// Validate the sub-configurations and the rules that span them
    /// (dedup/cross-tenant dedup require chunking to be meaningful).
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.passthrough {
            return Ok(());
        }
        self.chunker.validate()?;
        if self.compression_enabled {
            self.compression.validate()?;
        }
        if self.cross_tenant_dedup && !self.dedup_enabled {
            return Err(CoreError::ConfigInvalid(
                "cross_tenant_dedup requires dedup_enabled".into(),
            ));
        }
        Ok(())
    }
}

/// A fully processed chunk, ready to be handed to a `ChunkStore` by the
/// processing backend.
#[derive(Debug, Clone)]
pub struct ProcessedChunk {
    /// 0-based position within the object.
    pub index: u32,
    /// `SHA256` of the original, unprocessed chunk bytes. The GCI's
    /// deduplication key.
    pub plaintext_fingerprint: Fingerprint,
    /// Bytes after compression (if any) and encryption (if any).
    pub data_after_processing: Bytes,
    /// AEAD nonce. Empty when `encrypted` is false.
    pub nonce: Vec<u8>,
    /// Whether compression was applied. False if compression was skipped or
    /// if the compressed form was not strictly smaller than the input.
    pub compressed: bool,
    /// Whether encryption was applied.
    pub encrypted: bool,
    /// `SHA256(data_after_processing)`.
    pub ciphertext_fingerprint: Fingerprint,
    /// Original, unprocessed chunk size in bytes.
    pub original_size: u64,
    /// `data_after_processing.len()`.
    pub processed_size: u64,
}

/// Result of processing a whole object.
#[derive(Debug, Clone)]
pub struct ProcessResult {
    /// `SHA256` over the entire, unchunked input.
    pub content_fingerprint: Fingerprint,
    /// Total input size in bytes.
    pub original_size: u64,
    /// Sum of `processed_size` across all chunks.
    pub processed_size: u64,
    /// Chunks in ascending index order.
    pub chunks: Vec<ProcessedChunk>,
}

/// Stateless chunk -> compress -> encrypt transform and its inverse.
pub struct Pipeline {
    config: PipelineConfig,
    chunker: Option<Chunker>,
}

impl Pipeline {
    /// Build a pipeline from a validated config.
    pub fn new(config: PipelineConfig) -> Result<Self, CoreError> {
        config.validate()?;
        let chunker = if config.passthrough {
            None
        } else {
            Some(Chunker::new(config.chunker.clone())?)
        };
        Ok(Self { config, chunker })
    }

    /// The configuration this pipeline was built from.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Process a whole object: chunk, then per chunk, compress and encrypt.
    /// `tenant_key` is required whenever encryption is enabled; `content_type`
    /// feeds the compression heuristic.
    #[instrument(skip(self, data, tenant_key), fields(input_bytes = data.len()))]
    pub fn process(
        &self,
        data: &[u8],
        tenant_key: Option<&TenantKey>,
        content_type: Option<&str>,
    ) -> Result<ProcessResult, CoreError> {
        let content_fingerprint = Fingerprint::of(data);

        if self.config.passthrough {
            let chunk = ProcessedChunk {
                index: 0,
                plaintext_fingerprint: content_fingerprint,
                data_after_processing: Bytes::copy_from_slice(data),
                nonce: Vec::new(),
                compressed: false,
                encrypted: false,
                ciphertext_fingerprint: content_fingerprint,
                original_size: data.len() as u64,
                processed_size: data.len() as u64,
            };
            return Ok(ProcessResult {
                content_fingerprint,
                original_size: data.len() as u64,
                processed_size: data.len() as u64,
                chunks: vec![chunk],
            });
        }

        if self.config.encryption_enabled && tenant_key.is_none() {
            return Err(CoreError::MissingKey);
        }

        let chunker = self.chunker.as_ref().expect("chunker present when not passthrough");
        let raw_chunks = chunker.chunk_bytes(data);
        let mut chunks = Vec::with_capacity(raw_chunks.len());
        let mut processed_size = 0u64;
        for chunk in raw_chunks {
            let pc = self.process_chunk(chunk, tenant_key, content_type)?;
            processed_size += pc.processed_size;
            chunks.push(pc);
        }

        Ok(ProcessResult {
            content_fingerprint,
            original_size: data.len() as u64,
            processed_size,
            chunks,
        })
    }

    fn process_chunk(
        &self,
        chunk: Chunk,
        tenant_key: Option<&TenantKey>,
        content_type: Option<&str>,
    ) -> Result<ProcessedChunk, CoreError> {
        let original_size = chunk.size as u64;
        let plaintext_fingerprint = chunk.plaintext_fingerprint;

        let (after_compression, compressed) = if self.config.compression_enabled
            && should_compress(&chunk.data, content_type)
        {
            let candidate = compress(&chunk.data, self.config.compression)?;
            if candidate.len() < chunk.data.len() {
                (candidate, true)
            } else {
                (chunk.data.to_vec(), false)
            }
        } else {
            (chunk.data.to_vec(), false)
        };

        let (data_after_processing, nonce, encrypted) = if self.config.encryption_enabled {
            let tenant_key = tenant_key.ok_or(CoreError::MissingKey)?;
            let chunk_key = KeyManager::derive_chunk_key(tenant_key, &plaintext_fingerprint);
            let (ciphertext, nonce) = encrypt(&after_compression, &chunk_key, self.config.encryption)?;
            (ciphertext, nonce, true)
        } else {
            (after_compression, Vec::new(), false)
        };

        let ciphertext_fingerprint = Fingerprint::of(&data_after_processing);
        let processed_size = data_after_processing.len() as u64;

        Ok(ProcessedChunk {
            index: chunk.index,
            plaintext_fingerprint,
            data_after_processing: Bytes::from(data_after_processing),
            nonce,
            compressed,
            encrypted,
            ciphertext_fingerprint,
            original_size,
            processed_size,
        })
    }

    /// Invert `process`: decrypt, then decompress, every chunk in ascending
    /// index order, concatenating the results. Aborts on the first chunk
    /// that fails to decrypt or decompress.
    pub fn reconstruct(
        &self,
        chunks: &[ProcessedChunk],
        tenant_key: Option<&TenantKey>,
    ) -> Result<Vec<u8>, CoreError> {
        if self.config.passthrough {
            let chunk = chunks.first().ok_or_else(|| CoreError::ChunkingFailure {
                offset: 0,
                reason: "no chunks to reconstruct".into(),
            })?;
            return Ok(chunk.data_after_processing.to_vec());
        }

        let mut ordered: Vec<&ProcessedChunk> = chunks.iter().collect();
        ordered.sort_by_key(|c| c.index);

        let mut output = Vec::new();
        for pc in ordered {
            let decrypted = if pc.encrypted {
                let tenant_key = tenant_key.ok_or(CoreError::MissingKey)?;
                let chunk_key = KeyManager::derive_chunk_key(tenant_key, &pc.plaintext_fingerprint);
                decrypt(&pc.data_after_processing, &pc.nonce, &chunk_key, self.config.encryption)?
            } else {
                pc.data_after_processing.to_vec()
            };
            let decompressed = if pc.compressed {
                decompress(&decrypted, self.config.compression)?
            } else {
                decrypted
            };
            output.extend_from_slice(&decompressed);
        }
        Ok(output)
    }
}
