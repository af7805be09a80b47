//! AEAD encryption: AES-256-GCM, XChaCha20-Poly1305, and a `none` passthrough.

use crate::error::CoreError;
use aes_gcm::{aead::Aead, Aes256Gcm, KeyInit};
use chacha20poly1305::XChaCha20Poly1305;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// A 256-bit (32-byte) symmetric key, used for both tenant keys and
/// per-chunk convergent/random keys. Zeroized on drop; `Debug` redacts the
/// bytes.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey(pub [u8; 32]);

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EncryptionKey([REDACTED])")
    }
}

impl EncryptionKey {
    /// Build a key from a byte slice, validating its length.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CoreError> {
        if bytes.len() != 32 {
            return Err(CoreError::InvalidKeySize {
                expected: 32,
                actual: bytes.len(),
            });
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(bytes);
        Ok(Self(key))
    }
}

/// AEAD algorithms supported by the encryptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EncryptionAlgorithm {
    /// Identity passthrough: ciphertext == plaintext, empty nonce.
    None,
    /// AES-256-GCM: 32-byte key, 12-byte nonce, 16-byte tag.
    Aes256Gcm,
    /// XChaCha20-Poly1305: 32-byte key, 24-byte nonce, 16-byte tag.
    XChaCha20Poly1305,
}

impl Default for EncryptionAlgorithm {
    fn default() -> Self {
        EncryptionAlgorithm::Aes256Gcm
    }
}

impl EncryptionAlgorithm {
    /// Expected nonce length for this algorithm, in bytes.
    pub fn nonce_len(&self) -> usize {
        match self {
            EncryptionAlgorithm::None => 0,
            EncryptionAlgorithm::Aes256Gcm => 12,
            EncryptionAlgorithm::XChaCha20Poly1305 => 24,
        }
    }
}

/// Draw a cryptographically secure random nonce of the algorithm's length.
pub fn random_nonce(algo: EncryptionAlgorithm) -> Vec<u8> {
    let mut bytes = vec![0u8; algo.nonce_len()];
    if !bytes.is_empty() {
        rand::thread_rng().fill_bytes(&mut bytes);
    }
    bytes
}

/// Encrypt `plaintext` under `key` with `algo`. A fresh random nonce is
/// drawn for every call. Returns `(ciphertext, nonce)`; `nonce` is empty
/// when `algo == None`.
pub fn encrypt(
    plaintext: &[u8],
    key: &EncryptionKey,
    algo: EncryptionAlgorithm,
) -> Result<(Vec<u8>, Vec<u8>), CoreError> {
    let nonce = random_nonce(algo);
    let ciphertext = match algo {
        EncryptionAlgorithm::None => plaintext.to_vec(),
        EncryptionAlgorithm::Aes256Gcm => {
            let cipher = Aes256Gcm::new_from_slice(&key.0).map_err(|_| CoreError::InvalidKeySize {
                expected: 32,
                actual: key.0.len(),
            })?;
            let n = aes_gcm::Nonce::from_slice(&nonce);
            cipher
                .encrypt(n, plaintext)
                .map_err(|e| CoreError::EncryptionFailure(e.to_string()))?
        }
        EncryptionAlgorithm::XChaCha20Poly1305 => {
            let cipher =
                XChaCha20Poly1305::new_from_slice(&key.0).map_err(|_| CoreError::InvalidKeySize {
                    expected: 32,
                    actual: key.0.len(),
                })?;
            let n = chacha20poly1305::XNonce::from_slice(&nonce);
            cipher
                .encrypt(n, plaintext)
                .map_err(|e| CoreError::EncryptionFailure(e.to_string()))?
        }
    };
    Ok((ciphertext, nonce))
}

/// Decrypt `ciphertext` under `key`, `nonce`, and `algo`. Any tag mismatch
/// or ciphertext modification fails with `AuthenticationFailure`.
pub fn decrypt(
    ciphertext: &[u8],
    nonce: &[u8],
    key: &EncryptionKey,
    algo: EncryptionAlgorithm,
) -> Result<Vec<u8>, CoreError> {
    if nonce.len() != algo.nonce_len() {
        return Err(CoreError::InvalidNonceSize {
            expected: algo.nonce_len(),
            actual: nonce.len(),
        });
    }
    match algo {
        EncryptionAlgorithm::None => Ok(ciphertext.to_vec()),
        EncryptionAlgorithm::Aes256Gcm => {
            let cipher = Aes256Gcm::new_from_slice(&key.0).map_err(|_| CoreError::InvalidKeySize {
                expected: 32,
                actual: key.0.len(),
            })?;
            let n = aes_gcm::Nonce::from_slice(nonce);
            cipher
                .decrypt(n, ciphertext)
                .map_err(|_| CoreError::AuthenticationFailure)
        }
        EncryptionAlgorithm::XChaCha20Poly1305 => {
            let cipher =
                XChaCha20Poly1305::new_from_slice(&key.0).map_err(|_| CoreError::InvalidKeySize {
                    expected: 32,
                    actual: key.0.len(),
                })?;
            let n = chacha20poly1305::XNonce::from_slice(nonce);
            cipher
                .decrypt(n, ciphertext)
                .map_err(|_| CoreError::AuthenticationFailure)
        }
    }
}
