//! Processing backend (C7): binds `Pipeline` + `KeyManager` + an optional
//! `GlobalContentIndex` + a `ChunkStore` into `upload`/`download`, with
//! atomic usage counters.

use crate::error::CoreError;
use crate::fingerprint::Fingerprint;
use crate::gci::{GlobalContentIndex, NewChunkEntry, TenantChunkRef};
use crate::key_manager::KeyManager;
use crate::pipeline::{Pipeline, PipelineConfig, ProcessedChunk};
use crate::store::ChunkStore;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// On-wire reference to one stored chunk: the unit an `ObjectMetadata`
/// record's chunk list is made of.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRef {
    /// 0-based position within the object.
    pub seq: u32,
    /// Plaintext content fingerprint.
    pub pt_hash: Fingerprint,
    /// Fingerprint of the bytes actually written to the chunk store.
    pub ct_hash: Fingerprint,
    /// Deterministic storage location,
    /// `"{tenant}/{object_key}/v{key_version}/chunk-{seq}"` for a newly
    /// stored chunk, or the original owner's location on a dedup hit.
    pub location: String,
    /// Size of the bytes written to the chunk store.
    pub size: u64,
    /// Base64-encoded AEAD nonce. Empty string when not encrypted.
    pub nonce: String,
    /// Whether compression was applied.
    pub compressed: bool,
    /// Whether encryption was applied.
    pub encrypted: bool,
}

/// Summary metadata for one uploaded object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectMetadata {
    /// Owning tenant.
    pub tenant_id: String,
    /// Bucket/namespace within the tenant.
    pub bucket: String,
    /// Object key within the bucket.
    pub object_key: String,
    /// `SHA256` over the entire, unchunked object.
    pub content_fingerprint: Fingerprint,
    /// Original object size in bytes.
    pub total_size: u64,
    /// Sum of stored chunk sizes after compression/encryption.
    pub processed_size: u64,
    /// Number of chunks the object was split into.
    pub chunk_count: u32,
    /// Tenant key version used for encryption, if encryption was enabled.
    pub key_version: Option<u32>,
    /// Unix seconds this object was uploaded.
    pub created_at: u64,
}

/// Result of `ProcessingBackend::upload`.
#[derive(Debug, Clone)]
pub struct UploadResult {
    /// Summary metadata for the uploaded object.
    pub object_metadata: ObjectMetadata,
    /// Ordered chunk references, for persisting alongside the object.
    pub chunk_refs: Vec<ChunkRef>,
}

/// Point-in-time snapshot of `ProcessingBackend`'s usage counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct BackendStatsSnapshot {
    /// Total input bytes processed across all uploads.
    pub bytes_processed: u64,
    /// Total bytes actually written to the chunk store (post dedup).
    pub bytes_stored: u64,
    /// Total chunks processed across all uploads.
    pub chunks_processed: u64,
    /// Total chunks elided by deduplication.
    pub chunks_deduplicated: u64,
}

#[derive(Default)]
struct BackendStats {
    bytes_processed: AtomicU64,
    bytes_stored: AtomicU64,
    chunks_processed: AtomicU64,
    chunks_deduplicated: AtomicU64,
}

impl BackendStats {
    fn snapshot(&self) -> BackendStatsSnapshot {
        BackendStatsSnapshot {
            bytes_processed: self.bytes_processed.load(Ordering::Relaxed),
            bytes_stored: self.bytes_stored.load(Ordering::Relaxed),
            chunks_processed: self.chunks_processed.load(Ordering::Relaxed),
            chunks_deduplicated: self.chunks_deduplicated.load(Ordering::Relaxed),
        }
    }
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Namespaces a plaintext fingerprint to a tenant so that GCI lookups never
/// observe cross-tenant collisions when cross-tenant dedup is disabled. When
/// it is enabled, the fingerprint itself is the shared lookup key.
fn dedup_key(fingerprint: &Fingerprint, tenant_id: &str, cross_tenant: bool) -> Fingerprint {
    if cross_tenant {
        *fingerprint
    } else {
        Fingerprint::of(format!("{tenant_id}:{fingerprint}").as_bytes())
    }
}

/// Where `place_chunk` decided a processed chunk ended up: the storage
/// location to record in its `ChunkRef`, whether this call is the one that
/// wrote the bytes (`false` on a dedup hit), and the nonce/ciphertext
/// fingerprint/size of the bytes actually sitting at `location`. On a dedup
/// hit these always describe the *first* upload that stored this content,
/// never the current call's own freshly random encryption output, since
/// that ciphertext was never written anywhere.
struct PlacedChunk {
    location: String,
    is_new: bool,
    nonce: Vec<u8>,
    ciphertext_fingerprint: Fingerprint,
    stored_size: u64,
}

/// Binds a `Pipeline`, a `KeyManager`, an optional `GlobalContentIndex`, and
/// a `ChunkStore` into the object-level `upload`/`download` operations.
pub struct ProcessingBackend {
    pipeline: Pipeline,
    key_manager: Arc<KeyManager>,
    gci: Option<Arc<GlobalContentIndex>>,
    chunk_store: Arc<dyn ChunkStore>,
    stats: BackendStats,
}

impl ProcessingBackend {
    /// Build a backend from a validated pipeline configuration.
    pub fn new(
        pipeline_config: PipelineConfig,
        key_manager: Arc<KeyManager>,
        gci: Option<Arc<GlobalContentIndex>>,
        chunk_store: Arc<dyn ChunkStore>,
    ) -> Result<Self, CoreError> {
        Ok(Self {
            pipeline: Pipeline::new(pipeline_config)?,
            key_manager,
            gci,
            chunk_store,
            stats: BackendStats::default(),
        })
    }

    /// The pipeline configuration this backend was built from.
    pub fn config(&self) -> &PipelineConfig {
        self.pipeline.config()
    }

    /// Current usage counters.
    pub fn stats(&self) -> BackendStatsSnapshot {
        self.stats.snapshot()
    }

    /// Upload one object: chunk, dedup against the content index, compress,
    /// encrypt, and write new chunks to the chunk store. Aborts on the first
    /// failure; a failure to increment a ref count during a dedup hit is
    /// logged and treated as non-fatal, since the chunk itself is already
    /// durable.
    #[instrument(skip(self, data, cancel), fields(tenant_id, object_key, input_bytes = data.len()))]
    pub fn upload(
        &self,
        tenant_id: &str,
        bucket: &str,
        object_key: &str,
        data: &[u8],
        content_type: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<UploadResult, CoreError> {
        self.stats.bytes_processed.fetch_add(data.len() as u64, Ordering::Relaxed);

        let (tenant_key, key_version) = if self.pipeline.config().encryption_enabled {
            let (key, version) = self.key_manager.get_tenant_key(tenant_id)?;
            (Some(key), Some(version))
        } else {
            (None, None)
        };

        let result = self.pipeline.process(data, tenant_key.as_ref(), content_type)?;
        let cross_tenant = self.pipeline.config().cross_tenant_dedup;
        let dedup_enabled = self.pipeline.config().dedup_enabled;

        let mut chunk_refs = Vec::with_capacity(result.chunks.len());
        let mut offset = 0u64;
        let mut physical_size = 0u64;

        for pc in &result.chunks {
            if cancel.is_cancelled() {
                return Err(CoreError::IndexUnavailable("upload cancelled".into()));
            }
            self.stats.chunks_processed.fetch_add(1, Ordering::Relaxed);

            let placed = self.place_chunk(
                tenant_id,
                object_key,
                key_version.unwrap_or(1),
                dedup_enabled,
                cross_tenant,
                pc,
                cancel,
            )?;
            if placed.is_new {
                physical_size += pc.processed_size;
            }

            if let Some(gci) = &self.gci {
                gci.add_tenant_chunk_ref(
                    TenantChunkRef {
                        tenant_id: tenant_id.to_string(),
                        bucket: bucket.to_string(),
                        object_key: object_key.to_string(),
                        chunk_index: pc.index,
                        chunk_offset: offset,
                        plaintext_fingerprint: pc.plaintext_fingerprint,
                        key_version: key_version.unwrap_or(1),
                        ciphertext_fingerprint: pc.encrypted.then_some(placed.ciphertext_fingerprint),
                    },
                    cancel,
                )?;
            }
            offset += pc.original_size;

            chunk_refs.push(ChunkRef {
                seq: pc.index,
                pt_hash: pc.plaintext_fingerprint,
                ct_hash: placed.ciphertext_fingerprint,
                location: placed.location,
                size: placed.stored_size,
                nonce: STANDARD.encode(&placed.nonce),
                compressed: pc.compressed,
                encrypted: pc.encrypted,
            });
        }

        let object_metadata = ObjectMetadata {
            tenant_id: tenant_id.to_string(),
            bucket: bucket.to_string(),
            object_key: object_key.to_string(),
            content_fingerprint: result.content_fingerprint,
            total_size: result.original_size,
            processed_size: result.processed_size,
            chunk_count: chunk_refs.len() as u32,
            key_version,
            created_at: now_unix(),
        };

        if let Some(gci) = &self.gci {
            let dedup_ratio = if physical_size > 0 {
                result.original_size as f64 / physical_size as f64
            } else {
                1.0
            };
            let existing = gci.get_object_metadata(tenant_id, bucket, object_key, cancel)?;
            let created_at = existing.map(|e| e.created_at).unwrap_or(object_metadata.created_at);
            gci.save_object_metadata(
                crate::gci::ObjectMetadataRecord {
                    tenant_id: tenant_id.to_string(),
                    bucket_name: bucket.to_string(),
                    object_key: object_key.to_string(),
                    total_size: result.original_size,
                    chunk_count: chunk_refs.len() as u32,
                    content_hash: result.content_fingerprint.to_hex(),
                    content_type: content_type.map(str::to_string),
                    logical_size: result.original_size,
                    physical_size,
                    dedup_ratio,
                    pipeline_config: serde_json::to_value(self.pipeline.config())
                        .unwrap_or(serde_json::Value::Null),
                    created_at,
                    updated_at: object_metadata.created_at,
                },
                cancel,
            )?;
        }

        Ok(UploadResult {
            object_metadata,
            chunk_refs,
        })
    }

    /// Fetch the persisted denormalized metadata row for an object, if a
    /// content index is configured and a row has been saved for it.
    pub fn get_object_metadata(
        &self,
        tenant_id: &str,
        bucket: &str,
        object_key: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<crate::gci::ObjectMetadataRecord>, CoreError> {
        match &self.gci {
            Some(gci) => gci.get_object_metadata(tenant_id, bucket, object_key, cancel),
            None => Ok(None),
        }
    }

    /// Decide whether `pc` is already stored (dedup hit) or needs writing.
    fn place_chunk(
        &self,
        tenant_id: &str,
        object_key: &str,
        key_version: u32,
        dedup_enabled: bool,
        cross_tenant: bool,
        pc: &ProcessedChunk,
        cancel: &CancellationToken,
    ) -> Result<PlacedChunk, CoreError> {
        let Some(gci) = self.gci.as_ref() else {
            let location = format!("{tenant_id}/{object_key}/v{key_version}/chunk-{}", pc.index);
            self.store_new_chunk(&location, pc, None, cancel)?;
            return Ok(PlacedChunk {
                location,
                is_new: true,
                nonce: pc.nonce.clone(),
                ciphertext_fingerprint: pc.ciphertext_fingerprint,
                stored_size: pc.processed_size,
            });
        };

        if !dedup_enabled {
            let location = format!("{tenant_id}/{object_key}/v{key_version}/chunk-{}", pc.index);
            self.store_new_chunk(&location, pc, Some(gci), cancel)?;
            return Ok(PlacedChunk {
                location,
                is_new: true,
                nonce: pc.nonce.clone(),
                ciphertext_fingerprint: pc.ciphertext_fingerprint,
                stored_size: pc.processed_size,
            });
        }

        let key = dedup_key(&pc.plaintext_fingerprint, tenant_id, cross_tenant);
        if let Some(existing) = gci.lookup(&key, cancel)? {
            self.stats.chunks_deduplicated.fetch_add(1, Ordering::Relaxed);
            // Best-effort: a failure to bump the ref count does not
            // invalidate the chunk, which is already durable.
            if let Err(e) = gci.increment_ref(&key, cancel) {
                tracing::warn!(error = %e, "ref count increment failed on dedup hit");
            }
            return Ok(PlacedChunk {
                location: existing.storage_key,
                is_new: false,
                nonce: existing.nonce,
                ciphertext_fingerprint: existing.ciphertext_fingerprint,
                stored_size: existing.stored_size,
            });
        }

        let location = format!("{tenant_id}/{object_key}/v{key_version}/chunk-{}", pc.index);
        self.chunk_store.put(&location, &pc.data_after_processing, cancel)?;
        self.stats.bytes_stored.fetch_add(pc.processed_size, Ordering::Relaxed);
        gci.insert(
            NewChunkEntry {
                fingerprint: key,
                backend_id: "local".to_string(),
                storage_key: location.clone(),
                size: pc.original_size,
                compressed_size: pc.compressed.then_some(pc.processed_size),
                compression_algo: pc.compressed.then_some(self.pipeline.config().compression),
                ciphertext_fingerprint: pc.ciphertext_fingerprint,
                nonce: pc.nonce.clone(),
                stored_size: pc.processed_size,
            },
            cancel,
        )?;
        Ok(PlacedChunk {
            location,
            is_new: true,
            nonce: pc.nonce.clone(),
            ciphertext_fingerprint: pc.ciphertext_fingerprint,
            stored_size: pc.processed_size,
        })
    }

    fn store_new_chunk(
        &self,
        location: &str,
        pc: &ProcessedChunk,
        gci: Option<&Arc<GlobalContentIndex>>,
        cancel: &CancellationToken,
    ) -> Result<(), CoreError> {
        self.chunk_store.put(location, &pc.data_after_processing, cancel)?;
        self.stats.bytes_stored.fetch_add(pc.processed_size, Ordering::Relaxed);
        if let Some(gci) = gci {
            gci.insert(
                NewChunkEntry {
                    fingerprint: pc.plaintext_fingerprint,
                    backend_id: "local".to_string(),
                    storage_key: location.to_string(),
                    size: pc.original_size,
                    compressed_size: pc.compressed.then_some(pc.processed_size),
                    compression_algo: pc.compressed.then_some(self.pipeline.config().compression),
                    ciphertext_fingerprint: pc.ciphertext_fingerprint,
                    nonce: pc.nonce.clone(),
                    stored_size: pc.processed_size,
                },
                cancel,
            )?;
        }
        Ok(())
    }

    /// Download one object: fetch every referenced chunk, then reconstruct.
    /// Aborts on the first chunk that fails to fetch, decrypt, or decompress.
    /// `key_version` must be the version recorded in the object's
    /// `ObjectMetadata` at upload time — not necessarily the tenant's
    /// current version, since rotation may have advanced it since.
    #[instrument(skip(self, chunk_refs, cancel), fields(tenant_id))]
    pub fn download(
        &self,
        tenant_id: &str,
        key_version: Option<u32>,
        chunk_refs: &[ChunkRef],
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, CoreError> {
        let tenant_key = if self.pipeline.config().encryption_enabled {
            let version = key_version.unwrap_or_else(|| self.key_manager.get_current_version(tenant_id));
            Some(self.key_manager.derive_tenant_key(tenant_id, version)?)
        } else {
            None
        };

        let mut processed_chunks = Vec::with_capacity(chunk_refs.len());
        for cr in chunk_refs {
            if cancel.is_cancelled() {
                return Err(CoreError::IndexUnavailable("download cancelled".into()));
            }
            let bytes = self.chunk_store.get(&cr.location, cancel)?;
            let nonce = if cr.nonce.is_empty() {
                Vec::new()
            } else {
                STANDARD
                    .decode(&cr.nonce)
                    .map_err(|e| CoreError::ConfigInvalid(format!("invalid nonce encoding: {e}")))?
            };
            processed_chunks.push(ProcessedChunk {
                index: cr.seq,
                plaintext_fingerprint: cr.pt_hash,
                data_after_processing: Bytes::from(bytes),
                nonce,
                compressed: cr.compressed,
                encrypted: cr.encrypted,
                ciphertext_fingerprint: cr.ct_hash,
                original_size: 0,
                processed_size: cr.size,
            });
        }

        self.pipeline.reconstruct(&processed_chunks, tenant_key.as_ref())
    }
}
