//! External collaborator traits: `ChunkStore` (chunk bytes) and `IndexStore`
//! (the global content index and its derived tables).
//!
//! Both are modeled as object-safe, `Send + Sync` traits so that a real
//! backend and an in-memory mock satisfy the same capability set, following
//! the fingerprint-store pattern the teacher uses for its own distributed
//! index bridge.

use crate::error::CoreError;
use crate::fingerprint::Fingerprint;
use crate::gci::{GciEntry, ObjectMetadataRecord, TenantChunkRef};
use std::collections::HashMap;
use std::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Stores and retrieves opaque ciphertext bytes by location key. Ownership
/// of the bytes at a location belongs exclusively to the `ChunkStore`.
pub trait ChunkStore: Send + Sync {
    /// Write `bytes` at `location`. Idempotent put semantics are not
    /// required; this core writes once per new chunk.
    fn put(&self, location: &str, bytes: &[u8], cancel: &CancellationToken) -> Result<(), CoreError>;

    /// Fetch the bytes stored at `location`.
    fn get(&self, location: &str, cancel: &CancellationToken) -> Result<Vec<u8>, CoreError>;
}

/// Transactional CRUD over the GCI tables: the global content index,
/// tenant chunk references, and per-object dedup statistics.
///
/// Every method carries a `cancel` token, matching `ChunkStore`: any of
/// these calls is a potential suspension point against a real transactional
/// store and must return promptly on cancellation rather than after
/// finishing whatever step it is on.
pub trait IndexStore: Send + Sync {
    /// Fetch one entry by fingerprint.
    fn get_entry(
        &self,
        fingerprint: &Fingerprint,
        cancel: &CancellationToken,
    ) -> Result<Option<GciEntry>, CoreError>;

    /// Fetch many entries by fingerprint in one round trip.
    fn get_entries_batch(
        &self,
        fingerprints: &[Fingerprint],
        cancel: &CancellationToken,
    ) -> Result<HashMap<Fingerprint, GciEntry>, CoreError>;

    /// Insert a new entry, or — if one already exists for the fingerprint —
    /// increment its ref count, bump `last_accessed_at`, and clear
    /// `marked_for_deletion`.
    fn upsert_entry(&self, entry: GciEntry, cancel: &CancellationToken) -> Result<GciEntry, CoreError>;

    /// Increment the ref count for an existing entry.
    fn increment_chunk_ref(
        &self,
        fingerprint: &Fingerprint,
        cancel: &CancellationToken,
    ) -> Result<u64, CoreError>;

    /// Decrement the ref count for an existing entry; marks for deletion at
    /// zero. Returns the new count.
    fn decrement_chunk_ref(
        &self,
        fingerprint: &Fingerprint,
        cancel: &CancellationToken,
    ) -> Result<u64, CoreError>;

    /// Upsert by the unique key `(tenant_id, bucket, object_key, chunk_index)`.
    fn add_tenant_chunk_ref(
        &self,
        chunk_ref: TenantChunkRef,
        cancel: &CancellationToken,
    ) -> Result<(), CoreError>;

    /// All chunk refs for an object, ordered by `chunk_index`.
    fn get_object_chunks(
        &self,
        tenant_id: &str,
        bucket: &str,
        object_key: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<TenantChunkRef>, CoreError>;

    /// In one transaction: read all fingerprints for the object, delete its
    /// tenant refs and object metadata, then decrement the ref count of
    /// every fingerprint that was referenced. Returns the fingerprints
    /// whose ref count was decremented (the caller must invalidate cache
    /// entries for these).
    fn delete_object_chunks(
        &self,
        tenant_id: &str,
        bucket: &str,
        object_key: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<Fingerprint>, CoreError>;

    /// `(logical_bytes, physical_bytes, ratio)` for a tenant, where logical
    /// bytes counts every reference and physical bytes counts each distinct
    /// fingerprint once.
    fn get_tenant_dedup_ratio(
        &self,
        tenant_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(u64, u64, f64), CoreError>;

    /// Upsert the denormalized per-object row keyed by
    /// `(tenant_id, bucket_name, object_key)`.
    fn save_object_metadata(
        &self,
        record: ObjectMetadataRecord,
        cancel: &CancellationToken,
    ) -> Result<(), CoreError>;

    /// Fetch the per-object row for `(tenant_id, bucket, object_key)`, if any.
    fn get_object_metadata(
        &self,
        tenant_id: &str,
        bucket: &str,
        object_key: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<ObjectMetadataRecord>, CoreError>;
}

fn check_cancelled(cancel: &CancellationToken) -> Result<(), CoreError> {
    if cancel.is_cancelled() {
        Err(CoreError::IndexUnavailable("cancelled".into()))
    } else {
        Ok(())
    }
}

#[derive(Default)]
struct InMemoryIndexState {
    entries: HashMap<Fingerprint, GciEntry>,
    tenant_refs: HashMap<(String, String, String), Vec<TenantChunkRef>>,
    object_metadata: HashMap<(String, String, String), ObjectMetadataRecord>,
}

/// An in-memory `IndexStore`, used by tests and by callers with no real
/// backend yet. Not durable; transactions are modeled by holding the single
/// internal lock for the whole operation.
#[derive(Default)]
pub struct InMemoryIndexStore {
    state: RwLock<InMemoryIndexState>,
}

impl InMemoryIndexStore {
    /// Construct an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl IndexStore for InMemoryIndexStore {
    fn get_entry(
        &self,
        fingerprint: &Fingerprint,
        cancel: &CancellationToken,
    ) -> Result<Option<GciEntry>, CoreError> {
        check_cancelled(cancel)?;
        Ok(self.state.read().unwrap().entries.get(fingerprint).cloned())
    }

    fn get_entries_batch(
        &self,
        fingerprints: &[Fingerprint],
        cancel: &CancellationToken,
    ) -> Result<HashMap<Fingerprint, GciEntry>, CoreError> {
        check_cancelled(cancel)?;
        let state = self.state.read().unwrap();
        Ok(fingerprints
            .iter()
            .filter_map(|fp| state.entries.get(fp).map(|e| (*fp, e.clone())))
            .collect())
    }

    fn upsert_entry(&self, entry: GciEntry, cancel: &CancellationToken) -> Result<GciEntry, CoreError> {
        check_cancelled(cancel)?;
        let mut state = self.state.write().unwrap();
        let result = match state.entries.get_mut(&entry.plaintext_fingerprint) {
            Some(existing) => {
                existing.ref_count += 1;
                existing.last_accessed_at = entry.last_accessed_at;
                existing.marked_for_deletion = false;
                existing.marked_at = None;
                existing.clone()
            }
            None => {
                state
                    .entries
                    .insert(entry.plaintext_fingerprint, entry.clone());
                entry
            }
        };
        Ok(result)
    }

    fn increment_chunk_ref(
        &self,
        fingerprint: &Fingerprint,
        cancel: &CancellationToken,
    ) -> Result<u64, CoreError> {
        check_cancelled(cancel)?;
        let mut state = self.state.write().unwrap();
        let entry = state
            .entries
            .get_mut(fingerprint)
            .ok_or_else(|| CoreError::IndexConflict(format!("no entry for {fingerprint}")))?;
        entry.ref_count += 1;
        entry.marked_for_deletion = false;
        entry.marked_at = None;
        Ok(entry.ref_count)
    }

    fn decrement_chunk_ref(
        &self,
        fingerprint: &Fingerprint,
        cancel: &CancellationToken,
    ) -> Result<u64, CoreError> {
        check_cancelled(cancel)?;
        let mut state = self.state.write().unwrap();
        let entry = state
            .entries
            .get_mut(fingerprint)
            .ok_or_else(|| CoreError::IndexConflict(format!("no entry for {fingerprint}")))?;
        if entry.ref_count > 0 {
            entry.ref_count -= 1;
        }
        if entry.ref_count == 0 {
            entry.marked_for_deletion = true;
            entry.marked_at = Some(entry.last_accessed_at);
            debug!(%fingerprint, "entry marked for deletion");
        }
        Ok(entry.ref_count)
    }

    fn add_tenant_chunk_ref(
        &self,
        chunk_ref: TenantChunkRef,
        cancel: &CancellationToken,
    ) -> Result<(), CoreError> {
        check_cancelled(cancel)?;
        let mut state = self.state.write().unwrap();
        let key = (
            chunk_ref.tenant_id.clone(),
            chunk_ref.bucket.clone(),
            chunk_ref.object_key.clone(),
        );
        let refs = state.tenant_refs.entry(key).or_default();
        if let Some(existing) = refs.iter_mut().find(|r| r.chunk_index == chunk_ref.chunk_index) {
            *existing = chunk_ref;
        } else {
            refs.push(chunk_ref);
        }
        Ok(())
    }

    fn get_object_chunks(
        &self,
        tenant_id: &str,
        bucket: &str,
        object_key: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<TenantChunkRef>, CoreError> {
        check_cancelled(cancel)?;
        let state = self.state.read().unwrap();
        let key = (tenant_id.to_string(), bucket.to_string(), object_key.to_string());
        let mut refs = state.tenant_refs.get(&key).cloned().unwrap_or_default();
        refs.sort_by_key(|r| r.chunk_index);
        Ok(refs)
    }

    fn delete_object_chunks(
        &self,
        tenant_id: &str,
        bucket: &str,
        object_key: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<Fingerprint>, CoreError> {
        check_cancelled(cancel)?;
        let mut state = self.state.write().unwrap();
        let key = (tenant_id.to_string(), bucket.to_string(), object_key.to_string());
        let refs = state.tenant_refs.remove(&key).unwrap_or_default();
        let mut affected = Vec::with_capacity(refs.len());
        for r in &refs {
            if let Some(entry) = state.entries.get_mut(&r.plaintext_fingerprint) {
                if entry.ref_count > 0 {
                    entry.ref_count -= 1;
                }
                if entry.ref_count == 0 {
                    entry.marked_for_deletion = true;
                    entry.marked_at = Some(entry.last_accessed_at);
                }
            }
            affected.push(r.plaintext_fingerprint);
        }
        Ok(affected)
    }

    fn get_tenant_dedup_ratio(
        &self,
        tenant_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(u64, u64, f64), CoreError> {
        check_cancelled(cancel)?;
        let state = self.state.read().unwrap();
        let mut logical_bytes = 0u64;
        let mut seen = std::collections::HashSet::new();
        let mut physical_bytes = 0u64;
        for ((t, _, _), refs) in state.tenant_refs.iter() {
            if t != tenant_id {
                continue;
            }
            for r in refs {
                if let Some(entry) = state.entries.get(&r.plaintext_fingerprint) {
                    logical_bytes += entry.size;
                    if seen.insert(r.plaintext_fingerprint) {
                        physical_bytes += entry.size;
                    }
                }
            }
        }
        let ratio = if physical_bytes > 0 {
            logical_bytes as f64 / physical_bytes as f64
        } else {
            1.0
        };
        Ok((logical_bytes, physical_bytes, ratio))
    }

    fn save_object_metadata(
        &self,
        record: ObjectMetadataRecord,
        cancel: &CancellationToken,
    ) -> Result<(), CoreError> {
        check_cancelled(cancel)?;
        let mut state = self.state.write().unwrap();
        let key = (
            record.tenant_id.clone(),
            record.bucket_name.clone(),
            record.object_key.clone(),
        );
        state.object_metadata.insert(key, record);
        Ok(())
    }

    fn get_object_metadata(
        &self,
        tenant_id: &str,
        bucket: &str,
        object_key: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<ObjectMetadataRecord>, CoreError> {
        check_cancelled(cancel)?;
        let state = self.state.read().unwrap();
        let key = (tenant_id.to_string(), bucket.to_string(), object_key.to_string());
        Ok(state.object_metadata.get(&key).cloned())
    }
}

/// An in-memory `ChunkStore`, used by tests and by callers with no real
/// backend yet.
#[derive(Default)]
pub struct InMemoryChunkStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemoryChunkStore {
    /// Construct an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl ChunkStore for InMemoryChunkStore {
    fn put(&self, location: &str, bytes: &[u8], cancel: &CancellationToken) -> Result<(), CoreError> {
        if cancel.is_cancelled() {
            return Err(CoreError::IndexUnavailable("cancelled".into()));
        }
        self.blobs
            .write()
            .unwrap()
            .insert(location.to_string(), bytes.to_vec());
        Ok(())
    }

    fn get(&self, location: &str, cancel: &CancellationToken) -> Result<Vec<u8>, CoreError> {
        if cancel.is_cancelled() {
            return Err(CoreError::IndexUnavailable("cancelled".into()));
        }
        self.blobs
            .read()
            .unwrap()
            .get(location)
            .cloned()
            .ok_or_else(|| CoreError::ChunkNotFound(location.to_string()))
    }
}
