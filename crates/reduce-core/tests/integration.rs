//! Cross-component scenarios from the specification's testable-properties
//! section: end-to-end upload/download through `ProcessingBackend`,
//! multi-tenant isolation, cross-tenant dedup via the GCI, tamper
//! detection, and key rotation. Unlike the per-module unit tests, these
//! exercise the full chunk -> dedup -> compress -> encrypt -> store chain
//! together.

use reduce_core::gci::GciCacheConfig;
use reduce_core::key_manager::{KeyManagerConfig, MasterKey};
use reduce_core::pq;
use reduce_core::store::{InMemoryChunkStore, InMemoryIndexStore};
use reduce_core::{resolve_preset, CoreError, GlobalContentIndex, KeyManager, ProcessingBackend};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn backend_with_preset(preset: &str, gci: bool) -> ProcessingBackend {
    let config = resolve_preset(preset).unwrap();
    let key_manager = Arc::new(KeyManager::new(
        MasterKey::new([11u8; 32]).unwrap(),
        KeyManagerConfig::default(),
    ));
    let gci = gci.then(|| {
        Arc::new(GlobalContentIndex::new(
            Arc::new(InMemoryIndexStore::new()),
            GciCacheConfig::default(),
        ))
    });
    ProcessingBackend::new(config, key_manager, gci, Arc::new(InMemoryChunkStore::new())).unwrap()
}

#[test]
fn scenario_small_plaintext_roundtrip_smart_preset() {
    let backend = backend_with_preset("smart", true);
    let cancel = CancellationToken::new();
    let data = b"Hello, this is test data for the processing backend!";
    let upload = backend
        .upload("test-tenant", "bucket", "obj-1", data, None, &cancel)
        .unwrap();
    assert!(!upload.chunk_refs.is_empty());
    let back = backend
        .download("test-tenant", upload.object_metadata.key_version, &upload.chunk_refs, &cancel)
        .unwrap();
    assert_eq!(back, data);
}

#[test]
fn scenario_large_compressible_roundtrip() {
    let backend = backend_with_preset("smart", true);
    let cancel = CancellationToken::new();
    let data: Vec<u8> = b"This is repeated test data. ".repeat(20_000);
    let upload = backend
        .upload("test-tenant", "bucket", "obj-big", &data, None, &cancel)
        .unwrap();
    assert!(upload.object_metadata.processed_size < upload.object_metadata.total_size);
    let back = backend
        .download("test-tenant", upload.object_metadata.key_version, &upload.chunk_refs, &cancel)
        .unwrap();
    assert_eq!(back, data);
}

#[test]
fn scenario_multi_tenant_isolation() {
    let config = resolve_preset("enterprise").unwrap();
    let key_manager = Arc::new(KeyManager::new(
        MasterKey::new([22u8; 32]).unwrap(),
        KeyManagerConfig::default(),
    ));
    let gci = Arc::new(GlobalContentIndex::new(
        Arc::new(InMemoryIndexStore::new()),
        GciCacheConfig::default(),
    ));
    let backend = ProcessingBackend::new(
        config,
        key_manager,
        Some(gci),
        Arc::new(InMemoryChunkStore::new()),
    )
    .unwrap();
    let cancel = CancellationToken::new();
    let data = b"Same data, different tenants";

    let a = backend.upload("tenant-1", "bucket", "obj", data, None, &cancel).unwrap();
    let b = backend.upload("tenant-2", "bucket", "obj", data, None, &cancel).unwrap();
    assert_ne!(a.chunk_refs[0].ct_hash, b.chunk_refs[0].ct_hash);
    assert_eq!(
        backend.download("tenant-1", a.object_metadata.key_version, &a.chunk_refs, &cancel).unwrap(),
        data
    );
    assert_eq!(
        backend.download("tenant-2", b.object_metadata.key_version, &b.chunk_refs, &cancel).unwrap(),
        data
    );
}

#[test]
fn scenario_gci_cross_tenant_dedup_archive_preset() {
    let backend = backend_with_preset("archive", true);
    let cancel = CancellationToken::new();
    let data: Vec<u8> = vec![0x5Au8; 32];

    let a = backend.upload("tenant-1", "bucket", "obj-a", &data, None, &cancel).unwrap();
    let b = backend.upload("tenant-2", "bucket", "obj-b", &data, None, &cancel).unwrap();

    assert_eq!(a.chunk_refs[0].location, b.chunk_refs[0].location);
    let stats = backend.stats();
    assert_eq!(stats.chunks_deduplicated, 1);
}

#[test]
fn scenario_tamper_detection_fails_authentication() {
    let backend = backend_with_preset("enterprise", false);
    let cancel = CancellationToken::new();
    let mut upload = backend
        .upload("tenant-a", "bucket", "obj", b"some secret bytes to protect", None, &cancel)
        .unwrap();
    let first = &mut upload.chunk_refs[0];
    // `location` is the deterministic synthesized id for a freshly-stored
    // chunk; tamper the stored bytes directly by re-uploading over it
    // through a fresh chunk store is not available here, so instead flip a
    // bit in the decoded ciphertext that `download` will fetch: simulate by
    // corrupting the nonce, which the AEAD tag binds to just as strongly.
    first.nonce = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA".to_string();
    let result = backend.download("tenant-a", upload.object_metadata.key_version, &upload.chunk_refs, &cancel);
    assert!(matches!(result, Err(CoreError::AuthenticationFailure)));
}

#[test]
fn scenario_key_rotation_both_versions_decrypt() {
    let config = resolve_preset("enterprise").unwrap();
    let key_manager = Arc::new(KeyManager::new(
        MasterKey::new([33u8; 32]).unwrap(),
        KeyManagerConfig::default(),
    ));
    let backend = ProcessingBackend::new(
        config,
        key_manager.clone(),
        None,
        Arc::new(InMemoryChunkStore::new()),
    )
    .unwrap();
    let cancel = CancellationToken::new();
    let data = b"rotate me";

    let before = backend.upload("tenant-a", "bucket", "obj", data, None, &cancel).unwrap();
    assert_eq!(before.object_metadata.key_version, Some(1));

    let new_version = key_manager.rotate("tenant-a");
    assert_eq!(new_version, 2);
    let (_, current) = key_manager.get_tenant_key("tenant-a").unwrap();
    assert_eq!(current, 2);

    let after = backend.upload("tenant-a", "bucket", "obj", data, None, &cancel).unwrap();
    assert_eq!(after.object_metadata.key_version, Some(2));
    assert_ne!(before.chunk_refs[0].ct_hash, after.chunk_refs[0].ct_hash);

    assert_eq!(
        backend
            .download("tenant-a", before.object_metadata.key_version, &before.chunk_refs, &cancel)
            .unwrap(),
        data
    );
    assert_eq!(
        backend
            .download("tenant-a", after.object_metadata.key_version, &after.chunk_refs, &cancel)
            .unwrap(),
        data
    );
}

#[test]
fn scenario_hpc_preset_disables_chunking_compression_dedup_but_keeps_encryption() {
    let backend = backend_with_preset("hpc", false);
    let cancel = CancellationToken::new();
    let data = b"throughput over ratio";
    let upload = backend.upload("tenant-a", "bucket", "obj", data, None, &cancel).unwrap();
    assert_eq!(upload.chunk_refs.len(), 1, "hpc preset should not split a small object");
    assert!(upload.chunk_refs.iter().all(|c| !c.compressed && c.encrypted));
    let back = backend
        .download("tenant-a", upload.object_metadata.key_version, &upload.chunk_refs, &cancel)
        .unwrap();
    assert_eq!(back, data);
}

#[test]
fn scenario_passthrough_preset_stores_verbatim() {
    let backend = backend_with_preset("passthrough", false);
    let cancel = CancellationToken::new();
    let data = b"stored exactly as given, no chunking at all";
    let upload = backend.upload("tenant-a", "bucket", "obj", data, None, &cancel).unwrap();
    assert_eq!(upload.chunk_refs.len(), 1);
    let back = backend
        .download("tenant-a", upload.object_metadata.key_version, &upload.chunk_refs, &cancel)
        .unwrap();
    assert_eq!(back, data);
}

#[test]
fn scenario_object_metadata_persists_dedup_ratio_across_uploads() {
    let backend = backend_with_preset("archive", true);
    let cancel = CancellationToken::new();
    let data: Vec<u8> = vec![0x5Au8; 32];

    backend.upload("tenant-1", "bucket", "obj-a", &data, Some("text/plain"), &cancel).unwrap();
    let first = backend.get_object_metadata("tenant-1", "bucket", "obj-a", &cancel).unwrap().unwrap();
    assert_eq!(first.chunk_count, 1);
    assert_eq!(first.logical_size, 32);
    assert_eq!(first.physical_size, first.logical_size);
    assert_eq!(first.dedup_ratio, 1.0);
    assert_eq!(first.content_type.as_deref(), Some("text/plain"));

    // A second tenant uploading identical content dedups against tenant-1's
    // chunk (cross-tenant dedup is on for the archive preset), so its own
    // object metadata row reports the saving even though no new bytes land
    // in the chunk store for it.
    backend.upload("tenant-2", "bucket", "obj-b", &data, None, &cancel).unwrap();
    let second = backend.get_object_metadata("tenant-2", "bucket", "obj-b", &cancel).unwrap().unwrap();
    assert_eq!(second.physical_size, 0);
    assert_eq!(second.dedup_ratio, 1.0, "zero physical bytes falls back to a 1.0 ratio rather than dividing by zero");

    // Re-uploading under the same key updates the row rather than duplicating it,
    // and keeps the original `created_at`.
    backend.upload("tenant-1", "bucket", "obj-a", &data, Some("text/plain"), &cancel).unwrap();
    let updated = backend.get_object_metadata("tenant-1", "bucket", "obj-a", &cancel).unwrap().unwrap();
    assert_eq!(updated.created_at, first.created_at);
}

#[test]
fn scenario_post_quantum_envelope_wraps_a_tenant_key() {
    // The PQ envelope is independent of the chunk pipeline: it is meant for
    // wrapping key material (or any small payload) at rest, not chunk data.
    let (public_key, secret_key) = pq::generate_keypair().unwrap();
    let config = resolve_preset("enterprise").unwrap();
    let key_manager = KeyManager::new(MasterKey::new([44u8; 32]).unwrap(), KeyManagerConfig::default());
    let (tenant_key, _version) = key_manager.get_tenant_key("tenant-a").unwrap();

    let envelope = pq::seal(&public_key, tenant_key.as_bytes()).unwrap();
    let opened = pq::open(&secret_key, &envelope).unwrap();
    assert_eq!(opened.as_slice(), tenant_key.as_bytes().as_slice());
    let _ = config;
}
