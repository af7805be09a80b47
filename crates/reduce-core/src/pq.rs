//! Post-quantum hybrid envelope (C9): ML-KEM-768 key encapsulation plus
//! AES-256-GCM payload encryption. Used to seal small payloads (typically a
//! tenant key or master key, not chunk data) against a quantum-capable
//! adversary at rest. Optional: only the `pq` preset turns it on.

use crate::encryption::{decrypt, encrypt, EncryptionAlgorithm, EncryptionKey};
use crate::error::CoreError;
use saorsa_pqc::api::kem::{ml_kem_768, Ciphertext, PublicKey, SecretKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Identifies the hybrid scheme this envelope was sealed under. Persisted
/// so a future algorithm change can be distinguished from existing data.
pub const ALGORITHM_ID_ML_KEM_768_AES256GCM: u8 = 1;

/// The 32-byte secret two ML-KEM-768 parties agree on. Zeroized on drop;
/// never serialized.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; 32]);

impl SharedSecret {
    fn derive_aead_key(&self) -> EncryptionKey {
        let mut hasher = Sha256::new();
        hasher.update(self.0);
        let digest = hasher.finalize();
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        EncryptionKey(bytes)
    }
}

/// ML-KEM-768 public (encapsulation) key.
pub struct PqPublicKey(PublicKey);

/// ML-KEM-768 secret (decapsulation) key. The underlying crate does not
/// expose a zeroizing representation for this type, so it is dropped
/// ordinarily rather than wiped; callers holding it long-term should keep
/// it behind the same access discipline as a `MasterKey`.
pub struct PqSecretKey(SecretKey);

/// Generate a fresh ML-KEM-768 keypair.
pub fn generate_keypair() -> Result<(PqPublicKey, PqSecretKey), CoreError> {
    let kem = ml_kem_768();
    let (public_key, secret_key) = kem
        .generate_keypair()
        .map_err(|e| CoreError::PQKeyError(format!("keypair generation failed: {e:?}")))?;
    Ok((PqPublicKey(public_key), PqSecretKey(secret_key)))
}

/// Encapsulate a fresh shared secret to `public_key`. Returns the KEM
/// ciphertext to ship alongside the payload and the shared secret to
/// derive the AEAD key from locally.
pub fn encapsulate(public_key: &PqPublicKey) -> Result<(Vec<u8>, SharedSecret), CoreError> {
    let kem = ml_kem_768();
    let (shared_secret, ciphertext) = kem
        .encapsulate(&public_key.0)
        .map_err(|e| CoreError::PQKeyError(format!("encapsulation failed: {e:?}")))?;
    let shared_bytes = shared_secret.to_bytes();
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&shared_bytes[..32]);
    Ok((ciphertext.to_bytes(), SharedSecret(bytes)))
}

/// Recover the shared secret `encapsulate` produced, from the matching
/// secret key and the KEM ciphertext bytes it returned.
pub fn decapsulate(secret_key: &PqSecretKey, kem_ciphertext: &[u8]) -> Result<SharedSecret, CoreError> {
    let kem = ml_kem_768();
    let ciphertext = Ciphertext::try_from(kem_ciphertext)
        .map_err(|e| CoreError::PQKeyError(format!("malformed KEM ciphertext: {e:?}")))?;
    let shared_secret = kem
        .decapsulate(&secret_key.0, &ciphertext)
        .map_err(|e| CoreError::PQKeyError(format!("decapsulation failed: {e:?}")))?;
    let shared_bytes = shared_secret.to_bytes();
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&shared_bytes[..32]);
    Ok(SharedSecret(bytes))
}

/// A sealed payload: an ML-KEM-768 ciphertext plus the AES-256-GCM
/// encryption of the payload under a key derived from the resulting shared
/// secret. The wire layout named by the specification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PqEnvelope {
    /// Always `ALGORITHM_ID_ML_KEM_768_AES256GCM` today; present for future
    /// algorithm agility.
    pub algorithm_id: u8,
    /// The ML-KEM-768 ciphertext encapsulating the shared secret.
    pub kem_ciphertext: Vec<u8>,
    /// The 12-byte AES-256-GCM nonce.
    pub nonce: Vec<u8>,
    /// The AES-256-GCM ciphertext (payload length + 16-byte tag).
    pub aead_ciphertext: Vec<u8>,
}

/// Seal `plaintext` to `public_key`: encapsulate a fresh shared secret,
/// derive an AEAD key from it, encrypt, and zero the shared secret.
pub fn seal(public_key: &PqPublicKey, plaintext: &[u8]) -> Result<PqEnvelope, CoreError> {
    let (kem_ciphertext, shared_secret) = encapsulate(public_key)?;
    let aead_key = shared_secret.derive_aead_key();
    let (aead_ciphertext, nonce) = encrypt(plaintext, &aead_key, EncryptionAlgorithm::Aes256Gcm)?;
    Ok(PqEnvelope {
        algorithm_id: ALGORITHM_ID_ML_KEM_768_AES256GCM,
        kem_ciphertext,
        nonce,
        aead_ciphertext,
    })
}

/// Open an envelope `seal` produced, recovering the original plaintext.
/// Any tampering with `aead_ciphertext` or a mismatched `secret_key`
/// surfaces as `CoreError::AuthenticationFailure`, exactly as a direct
/// AEAD call would.
pub fn open(secret_key: &PqSecretKey, envelope: &PqEnvelope) -> Result<Vec<u8>, CoreError> {
    if envelope.algorithm_id != ALGORITHM_ID_ML_KEM_768_AES256GCM {
        return Err(CoreError::PQKeyError(format!(
            "unsupported envelope algorithm id {}",
            envelope.algorithm_id
        )));
    }
    let shared_secret = decapsulate(secret_key, &envelope.kem_ciphertext)?;
    let aead_key = shared_secret.derive_aead_key();
    decrypt(
        &envelope.aead_ciphertext,
        &envelope.nonce,
        &aead_key,
        EncryptionAlgorithm::Aes256Gcm,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_and_open_roundtrip() {
        let (pk, sk) = generate_keypair().unwrap();
        let plaintext = b"tenant master key material";
        let envelope = seal(&pk, plaintext).unwrap();
        let opened = open(&sk, &envelope).unwrap();
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn two_seals_of_the_same_plaintext_differ() {
        let (pk, _sk) = generate_keypair().unwrap();
        let a = seal(&pk, b"same payload").unwrap();
        let b = seal(&pk, b"same payload").unwrap();
        assert_ne!(a.kem_ciphertext, b.kem_ciphertext);
        assert_ne!(a.aead_ciphertext, b.aead_ciphertext);
    }

    #[test]
    fn tampered_aead_ciphertext_fails_authentication() {
        let (pk, sk) = generate_keypair().unwrap();
        let mut envelope = seal(&pk, b"protect me").unwrap();
        envelope.aead_ciphertext[0] ^= 0xFF;
        assert!(matches!(open(&sk, &envelope), Err(CoreError::AuthenticationFailure)));
    }

    #[test]
    fn wrong_secret_key_fails_to_open() {
        let (pk, _sk_a) = generate_keypair().unwrap();
        let (_pk_b, sk_b) = generate_keypair().unwrap();
        let envelope = seal(&pk, b"only the right key can read this").unwrap();
        assert!(open(&sk_b, &envelope).is_err());
    }

    #[test]
    fn unsupported_algorithm_id_is_rejected() {
        let (pk, sk) = generate_keypair().unwrap();
        let mut envelope = seal(&pk, b"payload").unwrap();
        envelope.algorithm_id = 0xFF;
        assert!(matches!(open(&sk, &envelope), Err(CoreError::PQKeyError(_))));
    }
}
