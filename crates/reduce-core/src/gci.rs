//! Global Content Index (C6): content-addressed, reference-counted registry
//! of stored chunks, plus the per-object list of chunk references a tenant
//! holds against it.

use crate::compression::CompressionAlgorithm;
use crate::error::CoreError;
use crate::fingerprint::Fingerprint;
use crate::store::IndexStore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

/// One row of the global content index: a single distinct stored chunk,
/// shared by every tenant/object that references it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GciEntry {
    /// Plaintext content fingerprint; the primary key.
    pub plaintext_fingerprint: Fingerprint,
    /// Logical backend identifier the bytes live in.
    pub backend_id: String,
    /// Backend-specific storage key/location.
    pub storage_key: String,
    /// Plaintext size in bytes.
    pub size: u64,
    /// Stored (possibly compressed) size in bytes, if compression was applied.
    pub compressed_size: Option<u64>,
    /// Compression algorithm applied before storage, if any.
    pub compression_algo: Option<CompressionAlgorithm>,
    /// `SHA256` of the bytes actually sitting at `storage_key` (post
    /// compression and encryption). A dedup hit must report this, not the
    /// fingerprint of whatever ciphertext the hitting upload itself
    /// produced before the dedup check ran.
    pub ciphertext_fingerprint: Fingerprint,
    /// AEAD nonce the stored bytes were sealed under, empty if not
    /// encrypted. The chunk at `storage_key` only decrypts against this
    /// exact nonce; a later upload of the same plaintext draws its own
    /// random nonce but must never use it in place of this one.
    pub nonce: Vec<u8>,
    /// Size in bytes of the data actually written to the chunk store,
    /// independent of whether `compressed_size` is set.
    pub stored_size: u64,
    /// Number of tenant chunk references currently pointing at this entry.
    pub ref_count: u64,
    /// Unix seconds this entry was first inserted.
    pub first_seen_at: u64,
    /// Unix seconds this entry was last looked up or referenced.
    pub last_accessed_at: u64,
    /// Set once `ref_count` drops to zero; a background sweep (out of
    /// scope here) would reclaim storage for such entries.
    pub marked_for_deletion: bool,
    /// Unix seconds at which this entry was marked for deletion.
    pub marked_at: Option<u64>,
}

/// The denormalized, per-object metadata row persisted alongside the
/// per-chunk references: everything a caller needs to report on or
/// reconstruct one object without re-walking its chunks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectMetadataRecord {
    /// Owning tenant.
    pub tenant_id: String,
    /// Bucket/namespace within the tenant.
    pub bucket_name: String,
    /// Object key within the bucket.
    pub object_key: String,
    /// Original, unchunked object size in bytes.
    pub total_size: u64,
    /// Number of chunks the object was split into.
    pub chunk_count: u32,
    /// `SHA256` over the entire, unchunked object, as lowercase hex.
    pub content_hash: String,
    /// Caller-supplied MIME type, if known. Feeds the compression heuristic
    /// at upload time and is persisted here for later reporting.
    pub content_type: Option<String>,
    /// Sum of every chunk's original size, counting duplicates once per
    /// reference (i.e. what this object alone would cost with no dedup).
    pub logical_size: u64,
    /// Sum of the processed sizes of only the chunks this object's upload
    /// actually wrote (dedup hits contribute nothing here).
    pub physical_size: u64,
    /// `logical_size / physical_size`, or `1.0` when `physical_size == 0`.
    pub dedup_ratio: f64,
    /// The validated `PipelineConfig` this object was processed under,
    /// serialized as JSON so a heterogeneous `IndexStore` backend does not
    /// need to know the config schema to store it.
    pub pipeline_config: serde_json::Value,
    /// Unix seconds this row was first written.
    pub created_at: u64,
    /// Unix seconds this row was last updated (re-upload of the same key).
    pub updated_at: u64,
}

/// A single tenant's reference to one chunk of one object, keyed by
/// `(tenant_id, bucket, object_key, chunk_index)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantChunkRef {
    /// Owning tenant.
    pub tenant_id: String,
    /// Bucket/namespace within the tenant.
    pub bucket: String,
    /// Object key within the bucket.
    pub object_key: String,
    /// Position of this chunk within the object, zero-based.
    pub chunk_index: u32,
    /// Byte offset of this chunk within the reconstructed object.
    pub chunk_offset: u64,
    /// Plaintext fingerprint identifying the GCI entry this ref points to.
    pub plaintext_fingerprint: Fingerprint,
    /// Tenant key version this chunk was encrypted under.
    pub key_version: u32,
    /// Ciphertext fingerprint, if the chunk was encrypted.
    pub ciphertext_fingerprint: Option<Fingerprint>,
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Bounded cache configuration for the GCI. Unlike the key manager's strict
/// LRU, this cache is approximate: when full it evicts roughly half its
/// entries rather than tracking exact recency per entry, trading precision
/// for a cheaper eviction path on a much hotter lookup path.
#[derive(Debug, Clone, Copy)]
pub struct GciCacheConfig {
    /// Maximum number of cached entries before an eviction sweep runs.
    pub capacity: usize,
}

impl Default for GciCacheConfig {
    fn default() -> Self {
        Self { capacity: 100_000 }
    }
}

struct Cache {
    entries: HashMap<Fingerprint, GciEntry>,
    config: GciCacheConfig,
}

impl Cache {
    fn new(config: GciCacheConfig) -> Self {
        Self {
            entries: HashMap::new(),
            config,
        }
    }

    fn get(&self, fp: &Fingerprint) -> Option<GciEntry> {
        self.entries.get(fp).cloned()
    }

    fn put(&mut self, entry: GciEntry) {
        if self.entries.len() >= self.config.capacity && !self.entries.contains_key(&entry.plaintext_fingerprint) {
            self.evict_half();
        }
        self.entries.insert(entry.plaintext_fingerprint, entry);
    }

    fn evict_half(&mut self) {
        let target = self.entries.len() / 2;
        let drop_keys: Vec<Fingerprint> = self.entries.keys().take(target).copied().collect();
        for k in drop_keys {
            self.entries.remove(&k);
        }
        debug!(remaining = self.entries.len(), "GCI cache evicted half");
    }

    fn invalidate(&mut self, fp: &Fingerprint) {
        self.entries.remove(fp);
    }

    fn update_if_present<F: FnOnce(&mut GciEntry)>(&mut self, fp: &Fingerprint, f: F) {
        if let Some(entry) = self.entries.get_mut(fp) {
            f(entry);
        }
    }
}

/// Everything `GlobalContentIndex::insert` needs to record a brand-new
/// chunk. Bundled into a struct rather than passed positionally since the
/// stored nonce and ciphertext fingerprint must survive byte-for-byte into
/// any later dedup hit against this entry.
pub struct NewChunkEntry {
    /// Plaintext content fingerprint; the primary key.
    pub fingerprint: Fingerprint,
    /// Logical backend identifier the bytes live in.
    pub backend_id: String,
    /// Backend-specific storage key/location.
    pub storage_key: String,
    /// Plaintext size in bytes.
    pub size: u64,
    /// Stored size in bytes, if compression was applied.
    pub compressed_size: Option<u64>,
    /// Compression algorithm applied before storage, if any.
    pub compression_algo: Option<CompressionAlgorithm>,
    /// `SHA256` of the bytes written to the chunk store.
    pub ciphertext_fingerprint: Fingerprint,
    /// AEAD nonce the stored bytes were sealed under, empty if not encrypted.
    pub nonce: Vec<u8>,
    /// Size in bytes of the data actually written to the chunk store.
    pub stored_size: u64,
}

/// Façade over an `IndexStore` with a write-through, approximate-LRU cache.
pub struct GlobalContentIndex {
    store: Arc<dyn IndexStore>,
    cache: RwLock<Cache>,
}

impl GlobalContentIndex {
    /// Build a content index over `store` with the given cache bound.
    pub fn new(store: Arc<dyn IndexStore>, cache_config: GciCacheConfig) -> Self {
        Self {
            store,
            cache: RwLock::new(Cache::new(cache_config)),
        }
    }

    /// Look up one entry, preferring the cache.
    #[instrument(skip(self, cancel))]
    pub fn lookup(
        &self,
        fingerprint: &Fingerprint,
        cancel: &CancellationToken,
    ) -> Result<Option<GciEntry>, CoreError> {
        if let Some(hit) = self.cache.read().unwrap().get(fingerprint) {
            return Ok(Some(hit));
        }
        let fetched = self.store.get_entry(fingerprint, cancel)?;
        if let Some(entry) = &fetched {
            self.cache.write().unwrap().put(entry.clone());
        }
        Ok(fetched)
    }

    /// Look up many entries at once, filling the cache with hits found in
    /// the backing store.
    pub fn lookup_batch(
        &self,
        fingerprints: &[Fingerprint],
        cancel: &CancellationToken,
    ) -> Result<HashMap<Fingerprint, GciEntry>, CoreError> {
        let mut result = HashMap::new();
        let mut misses = Vec::new();
        {
            let cache = self.cache.read().unwrap();
            for fp in fingerprints {
                match cache.get(fp) {
                    Some(entry) => {
                        result.insert(*fp, entry);
                    }
                    None => misses.push(*fp),
                }
            }
        }
        if !misses.is_empty() {
            let fetched = self.store.get_entries_batch(&misses, cancel)?;
            let mut cache = self.cache.write().unwrap();
            for (fp, entry) in fetched {
                cache.put(entry.clone());
                result.insert(fp, entry);
            }
        }
        Ok(result)
    }

    /// Insert a brand-new chunk, or increment the ref count of an existing
    /// one with the same fingerprint. Write-through: the cache is updated
    /// with the authoritative post-upsert entry.
    #[instrument(skip(self, new_chunk, cancel))]
    pub fn insert(
        &self,
        new_chunk: NewChunkEntry,
        cancel: &CancellationToken,
    ) -> Result<GciEntry, CoreError> {
        let now = now_unix();
        let entry = GciEntry {
            plaintext_fingerprint: new_chunk.fingerprint,
            backend_id: new_chunk.backend_id,
            storage_key: new_chunk.storage_key,
            size: new_chunk.size,
            compressed_size: new_chunk.compressed_size,
            compression_algo: new_chunk.compression_algo,
            ciphertext_fingerprint: new_chunk.ciphertext_fingerprint,
            nonce: new_chunk.nonce,
            stored_size: new_chunk.stored_size,
            ref_count: 1,
            first_seen_at: now,
            last_accessed_at: now,
            marked_for_deletion: false,
            marked_at: None,
        };
        let stored = self.store.upsert_entry(entry, cancel)?;
        self.cache.write().unwrap().put(stored.clone());
        Ok(stored)
    }

    /// Increment the ref count for an existing entry. The cache entry, if
    /// present, is updated in place rather than invalidated.
    pub fn increment_ref(
        &self,
        fingerprint: &Fingerprint,
        cancel: &CancellationToken,
    ) -> Result<u64, CoreError> {
        let count = self.store.increment_chunk_ref(fingerprint, cancel)?;
        self.cache.write().unwrap().update_if_present(fingerprint, |e| {
            e.ref_count = count;
            e.last_accessed_at = now_unix();
            e.marked_for_deletion = false;
            e.marked_at = None;
        });
        Ok(count)
    }

    /// Decrement the ref count for an existing entry, marking it for
    /// deletion at zero. The cache entry is invalidated so a subsequent
    /// lookup sees the authoritative marked-for-deletion state.
    pub fn decrement_ref(
        &self,
        fingerprint: &Fingerprint,
        cancel: &CancellationToken,
    ) -> Result<u64, CoreError> {
        let count = self.store.decrement_chunk_ref(fingerprint, cancel)?;
        self.cache.write().unwrap().invalidate(fingerprint);
        Ok(count)
    }

    /// Record that a tenant's object references a chunk.
    pub fn add_tenant_chunk_ref(
        &self,
        chunk_ref: TenantChunkRef,
        cancel: &CancellationToken,
    ) -> Result<(), CoreError> {
        self.store.add_tenant_chunk_ref(chunk_ref, cancel)
    }

    /// All chunk references for an object, in chunk order.
    pub fn get_object_chunks(
        &self,
        tenant_id: &str,
        bucket: &str,
        object_key: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<TenantChunkRef>, CoreError> {
        self.store.get_object_chunks(tenant_id, bucket, object_key, cancel)
    }

    /// Delete an object's chunk references and decrement the ref count of
    /// every chunk it referenced, in one store-level transaction. Cache
    /// entries for the affected fingerprints are invalidated.
    #[instrument(skip(self, cancel))]
    pub fn delete_object_chunks(
        &self,
        tenant_id: &str,
        bucket: &str,
        object_key: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<Fingerprint>, CoreError> {
        let affected = self.store.delete_object_chunks(tenant_id, bucket, object_key, cancel)?;
        let mut cache = self.cache.write().unwrap();
        for fp in &affected {
            cache.invalidate(fp);
        }
        Ok(affected)
    }

    /// `(logical_bytes, physical_bytes, ratio)` for a tenant's stored data.
    pub fn get_tenant_dedup_ratio(
        &self,
        tenant_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(u64, u64, f64), CoreError> {
        self.store.get_tenant_dedup_ratio(tenant_id, cancel)
    }

    /// Upsert the denormalized per-object metadata row. Not cached: unlike
    /// chunk entries, object metadata is read rarely (reporting, audits)
    /// relative to how often chunks are looked up during upload/download.
    pub fn save_object_metadata(
        &self,
        record: ObjectMetadataRecord,
        cancel: &CancellationToken,
    ) -> Result<(), CoreError> {
        self.store.save_object_metadata(record, cancel)
    }

    /// Fetch the per-object row for `(tenant_id, bucket, object_key)`, if one
    /// has been saved.
    pub fn get_object_metadata(
        &self,
        tenant_id: &str,
        bucket: &str,
        object_key: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<ObjectMetadataRecord>, CoreError> {
        self.store.get_object_metadata(tenant_id, bucket, object_key, cancel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryIndexStore;

    fn gci() -> GlobalContentIndex {
        GlobalContentIndex::new(
            Arc::new(InMemoryIndexStore::new()),
            GciCacheConfig { capacity: 4 },
        )
    }

    fn new_chunk(fp: Fingerprint, location: &str, size: u64) -> NewChunkEntry {
        NewChunkEntry {
            fingerprint: fp,
            backend_id: "local".into(),
            storage_key: location.into(),
            size,
            compressed_size: None,
            compression_algo: None,
            ciphertext_fingerprint: fp,
            nonce: Vec::new(),
            stored_size: size,
        }
    }

    #[test]
    fn insert_then_lookup_hits_cache() {
        let index = gci();
        let cancel = CancellationToken::new();
        let fp = Fingerprint::of(b"payload");
        index.insert(new_chunk(fp, "loc-1", 7), &cancel).unwrap();
        let found = index.lookup(&fp, &cancel).unwrap().unwrap();
        assert_eq!(found.ref_count, 1);
        assert_eq!(found.storage_key, "loc-1");
    }

    #[test]
    fn second_insert_of_same_fingerprint_increments_ref_count() {
        let index = gci();
        let cancel = CancellationToken::new();
        let fp = Fingerprint::of(b"payload");
        index.insert(new_chunk(fp, "loc-1", 7), &cancel).unwrap();
        let second = index.insert(new_chunk(fp, "loc-1", 7), &cancel).unwrap();
        assert_eq!(second.ref_count, 2);
    }

    #[test]
    fn second_insert_keeps_the_first_insert_s_nonce_and_ciphertext_fingerprint() {
        let index = gci();
        let cancel = CancellationToken::new();
        let fp = Fingerprint::of(b"payload");
        let mut first = new_chunk(fp, "loc-1", 7);
        first.nonce = vec![1, 2, 3];
        first.ciphertext_fingerprint = Fingerprint::of(b"first ciphertext");
        index.insert(first, &cancel).unwrap();

        let mut second = new_chunk(fp, "loc-1", 7);
        second.nonce = vec![9, 9, 9];
        second.ciphertext_fingerprint = Fingerprint::of(b"second ciphertext");
        let stored = index.insert(second, &cancel).unwrap();

        assert_eq!(stored.nonce, vec![1, 2, 3]);
        assert_eq!(stored.ciphertext_fingerprint, Fingerprint::of(b"first ciphertext"));
    }

    #[test]
    fn decrement_to_zero_marks_for_deletion_and_invalidates_cache() {
        let index = gci();
        let cancel = CancellationToken::new();
        let fp = Fingerprint::of(b"payload");
        index.insert(new_chunk(fp, "loc-1", 7), &cancel).unwrap();
        let count = index.decrement_ref(&fp, &cancel).unwrap();
        assert_eq!(count, 0);
        let found = index.lookup(&fp, &cancel).unwrap().unwrap();
        assert!(found.marked_for_deletion);
    }

    #[test]
    fn delete_object_chunks_decrements_every_referenced_fingerprint() {
        let index = gci();
        let cancel = CancellationToken::new();
        let fp_a = Fingerprint::of(b"chunk-a");
        let fp_b = Fingerprint::of(b"chunk-b");
        index.insert(new_chunk(fp_a, "loc-a", 10), &cancel).unwrap();
        index.insert(new_chunk(fp_b, "loc-b", 10), &cancel).unwrap();
        for (idx, fp) in [fp_a, fp_b].into_iter().enumerate() {
            index
                .add_tenant_chunk_ref(
                    TenantChunkRef {
                        tenant_id: "t1".into(),
                        bucket: "b1".into(),
                        object_key: "obj".into(),
                        chunk_index: idx as u32,
                        chunk_offset: (idx as u64) * 10,
                        plaintext_fingerprint: fp,
                        key_version: 1,
                        ciphertext_fingerprint: None,
                    },
                    &cancel,
                )
                .unwrap();
        }
        let affected = index.delete_object_chunks("t1", "b1", "obj", &cancel).unwrap();
        assert_eq!(affected.len(), 2);
        assert!(index.get_object_chunks("t1", "b1", "obj", &cancel).unwrap().is_empty());
        assert_eq!(index.lookup(&fp_a, &cancel).unwrap().unwrap().ref_count, 0);
    }

    #[test]
    fn cache_evicts_roughly_half_when_full() {
        let index = gci();
        let cancel = CancellationToken::new();
        for i in 0..4u8 {
            let fp = Fingerprint::of(&[i]);
            index.insert(new_chunk(fp, "loc", 1), &cancel).unwrap();
        }
        let fp5 = Fingerprint::of(&[5u8]);
        index.insert(new_chunk(fp5, "loc", 1), &cancel).unwrap();
        assert!(index.cache.read().unwrap().entries.len() <= 4);
    }

    #[test]
    fn cross_tenant_dedup_reports_ref_count_two() {
        let index = gci();
        let cancel = CancellationToken::new();
        let fp = Fingerprint::of(b"shared-block");
        index.insert(new_chunk(fp, "loc", 32), &cancel).unwrap();
        let second = index.insert(new_chunk(fp, "loc", 32), &cancel).unwrap();
        assert_eq!(second.ref_count, 2);
    }

    #[test]
    fn object_metadata_round_trips() {
        let index = gci();
        let cancel = CancellationToken::new();
        let record = ObjectMetadataRecord {
            tenant_id: "t1".into(),
            bucket_name: "b1".into(),
            object_key: "obj".into(),
            total_size: 100,
            chunk_count: 2,
            content_hash: Fingerprint::of(b"whole object").to_hex(),
            content_type: Some("text/plain".into()),
            logical_size: 100,
            physical_size: 50,
            dedup_ratio: 2.0,
            pipeline_config: serde_json::json!({"preset": "smart"}),
            created_at: 1,
            updated_at: 1,
        };
        index.save_object_metadata(record.clone(), &cancel).unwrap();
        let fetched = index.get_object_metadata("t1", "b1", "obj", &cancel).unwrap().unwrap();
        assert_eq!(fetched.chunk_count, 2);
        assert_eq!(fetched.dedup_ratio, 2.0);
    }

    #[test]
    fn missing_object_metadata_returns_none() {
        let index = gci();
        let cancel = CancellationToken::new();
        assert!(index.get_object_metadata("t1", "b1", "nope", &cancel).unwrap().is_none());
    }
}
