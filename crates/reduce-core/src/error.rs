//! Error types for the tenant object reduction core.

/// All errors that can occur while chunking, compressing, encrypting,
/// deriving keys, or consulting the content index.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// A `PipelineConfig` or preset failed validation at construction time.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
    /// Upstream reader/writer error during chunking or reconstruction.
    #[error("io failure at offset {offset}: {source}")]
    IoFailure {
        /// Byte offset within the stream at which the error occurred.
        offset: u64,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The content-defined chunker could not make progress.
    #[error("chunking failure at offset {offset}: {reason}")]
    ChunkingFailure {
        /// Offset at which chunking failed.
        offset: u64,
        /// Reason for the failure.
        reason: String,
    },
    /// Compression reported an error.
    #[error("compression failed: {0}")]
    CompressionFailure(String),
    /// Decompression reported an error.
    #[error("decompression failed: {0}")]
    DecompressionFailure(String),
    /// AEAD encryption could not produce ciphertext.
    #[error("encryption failed: {0}")]
    EncryptionFailure(String),
    /// AEAD authentication failed on decrypt. Always fatal; never retry with
    /// the same key.
    #[error("authentication failure: ciphertext or tag does not match the key")]
    AuthenticationFailure,
    /// A key of the wrong length was supplied to an AEAD algorithm.
    #[error("invalid key size: expected {expected} bytes, got {actual}")]
    InvalidKeySize {
        /// Expected key length in bytes.
        expected: usize,
        /// Actual key length supplied.
        actual: usize,
    },
    /// A nonce of the wrong length was supplied to an AEAD algorithm.
    #[error("invalid nonce size: expected {expected} bytes, got {actual}")]
    InvalidNonceSize {
        /// Expected nonce length in bytes.
        expected: usize,
        /// Actual nonce length supplied.
        actual: usize,
    },
    /// HKDF or RNG failed while deriving a key.
    #[error("key derivation failed: {0}")]
    KeyDerivationFailure(String),
    /// Encryption is enabled but no master key was configured.
    #[error("missing encryption key: encryption is enabled but no master key was set")]
    MissingKey,
    /// The IndexStore is transiently unreachable.
    #[error("index store unavailable: {0}")]
    IndexUnavailable(String),
    /// The IndexStore rejected a write due to a conflicting concurrent change.
    #[error("index conflict: {0}")]
    IndexConflict(String),
    /// The ChunkStore has no bytes for a location referenced by a manifest.
    #[error("chunk not found at location {0:?}")]
    ChunkNotFound(String),
    /// ML-KEM key or ciphertext packing/unpacking failed.
    #[error("post-quantum key error: {0}")]
    PQKeyError(String),
}
