#![warn(missing_docs)]

//! Tenant object reduction core: content-defined chunking, optional
//! compression, convergent/random authenticated encryption, and a global
//! content index for cross-chunk deduplication, bound together by a
//! processing backend that turns tenant object bytes into durable,
//! content-addressed chunks and back.

pub mod backend;
pub mod chunker;
pub mod compression;
pub mod config;
pub mod encryption;
pub mod error;
pub mod fingerprint;
pub mod gci;
pub mod key_manager;
pub mod pipeline;
pub mod pq;
pub mod store;

pub use backend::{ChunkRef, ObjectMetadata, ProcessingBackend, UploadResult};
pub use config::{resolve_preset, Preset};
pub use error::CoreError;
pub use fingerprint::Fingerprint;
pub use gci::{GciEntry, GlobalContentIndex, ObjectMetadataRecord, TenantChunkRef};
pub use key_manager::{KeyManager, MasterKey, TenantKey};
pub use pipeline::{Pipeline, PipelineConfig, ProcessedChunk, ProcessResult};
pub use store::{ChunkStore, IndexStore, InMemoryChunkStore, InMemoryIndexStore};
