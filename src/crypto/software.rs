//! Bundled software crypto provider.
//!
//! SHA-256 hashing, AES-256-GCM content encryption and key wrap,
//! HKDF-SHA256 password-based KEK derivation, Ed25519 signatures. Segment
//! encryption derives a fresh nonce per segment from the base IV and a
//! monotonic counter; key wrap uses a random nonce prepended to the blob.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::crypto::CryptoContext;
use crate::domain::constants::{GCM_IV_LENGTH, GCM_TAG_LENGTH};
use crate::domain::types::{CryptoAlgorithm, CryptoMode};
use crate::infra::error::{EnvelopeError, EnvelopeResult};

const KEK_DERIVATION_INFO: &[u8] = b"cms-envelope password kek v1";

fn gcm_cipher(key: &[u8; 32]) -> Aes256Gcm {
    Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key))
}

/// Incremental SHA-256 hash context.
pub struct Sha256Context {
    hasher: Sha256,
    digest: Option<Vec<u8>>,
}

impl Sha256Context {
    #[must_use]
    pub fn new() -> Self {
        Self {
            hasher: Sha256::new(),
            digest: None,
        }
    }
}

impl Default for Sha256Context {
    fn default() -> Self {
        Self::new()
    }
}

impl CryptoContext for Sha256Context {
    fn algorithm(&self) -> CryptoAlgorithm {
        CryptoAlgorithm::Sha256
    }

    fn update(&mut self, data: &[u8]) -> EnvelopeResult<()> {
        if self.digest.is_some() {
            return Err(EnvelopeError::CryptoError(
                "hash context already finalized".to_string(),
            ));
        }
        self.hasher.update(data);
        Ok(())
    }

    fn finalize_digest(&mut self) -> EnvelopeResult<Vec<u8>> {
        if let Some(digest) = &self.digest {
            return Ok(digest.clone());
        }
        let digest = self.hasher.finalize_reset().to_vec();
        self.digest = Some(digest.clone());
        Ok(digest)
    }
}

/// Symmetric session-key context for segmented content encryption.
///
/// Seal and open sides keep independent counters so one context instance is
/// only ever used in a single direction.
pub struct SessionKeyContext {
    key: Zeroizing<[u8; 32]>,
    base_iv: [u8; GCM_IV_LENGTH],
    seal_counter: u64,
    open_counter: u64,
}

impl SessionKeyContext {
    /// Generate a fresh random session key and base IV.
    pub fn generate() -> EnvelopeResult<Self> {
        let mut key = Zeroizing::new([0u8; 32]);
        let mut base_iv = [0u8; GCM_IV_LENGTH];
        OsRng.fill_bytes(key.as_mut());
        OsRng.fill_bytes(&mut base_iv);
        Ok(Self {
            key,
            base_iv,
            seal_counter: 0,
            open_counter: 0,
        })
    }

    /// Rebuild a session context from raw key material and the IV recovered
    /// from the wire.
    pub fn from_key_material(key: &[u8], base_iv: &[u8]) -> EnvelopeResult<Self> {
        if key.len() != 32 {
            return Err(EnvelopeError::InvalidInput(format!(
                "session key must be 32 bytes, got {}",
                key.len()
            )));
        }
        if base_iv.len() != GCM_IV_LENGTH {
            return Err(EnvelopeError::BadData(format!(
                "content-encryption IV must be {GCM_IV_LENGTH} bytes, got {}",
                base_iv.len()
            )));
        }
        let mut key_array = Zeroizing::new([0u8; 32]);
        key_array.copy_from_slice(key);
        let mut iv_array = [0u8; GCM_IV_LENGTH];
        iv_array.copy_from_slice(base_iv);
        Ok(Self {
            key: key_array,
            base_iv: iv_array,
            seal_counter: 0,
            open_counter: 0,
        })
    }

    fn segment_nonce(&self, counter: u64) -> [u8; GCM_IV_LENGTH] {
        let mut nonce = self.base_iv;
        for (slot, byte) in nonce[GCM_IV_LENGTH - 8..]
            .iter_mut()
            .zip(counter.to_be_bytes())
        {
            *slot ^= byte;
        }
        nonce
    }
}

impl CryptoContext for SessionKeyContext {
    fn algorithm(&self) -> CryptoAlgorithm {
        CryptoAlgorithm::Aes256Gcm
    }

    fn mode(&self) -> CryptoMode {
        CryptoMode::Gcm
    }

    fn base_iv(&self) -> EnvelopeResult<Vec<u8>> {
        Ok(self.base_iv.to_vec())
    }

    fn seal_segment(&mut self, plaintext: &[u8]) -> EnvelopeResult<Vec<u8>> {
        let nonce = self.segment_nonce(self.seal_counter);
        let ciphertext = gcm_cipher(&self.key)
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| EnvelopeError::CryptoError("GCM seal failed".to_string()))?;
        self.seal_counter += 1;
        Ok(ciphertext)
    }

    fn open_segment(&mut self, ciphertext: &[u8]) -> EnvelopeResult<Vec<u8>> {
        if ciphertext.len() < GCM_TAG_LENGTH {
            return Err(EnvelopeError::BadData(format!(
                "encrypted segment of {} bytes is shorter than the GCM tag",
                ciphertext.len()
            )));
        }
        let nonce = self.segment_nonce(self.open_counter);
        let plaintext = gcm_cipher(&self.key)
            .decrypt(Nonce::from_slice(&nonce), ciphertext)
            .map_err(|_| {
                EnvelopeError::WrongKey("GCM tag check failed on content segment".to_string())
            })?;
        self.open_counter += 1;
        Ok(plaintext)
    }

    fn export_key(&self) -> EnvelopeResult<Vec<u8>> {
        Ok(self.key.to_vec())
    }
}

/// Key-encryption-key context for one recipient. Wraps and unwraps session
/// keys; never touches payload bytes.
pub struct KekContext {
    kek: Zeroizing<[u8; 32]>,
    algorithm: CryptoAlgorithm,
    key_id: Vec<u8>,
}

impl KekContext {
    /// KEK from raw 32-byte conventional key material.
    pub fn from_key(key_id: impl Into<Vec<u8>>, key: &[u8]) -> EnvelopeResult<Self> {
        if key.len() != 32 {
            return Err(EnvelopeError::InvalidInput(format!(
                "key-encryption key must be 32 bytes, got {}",
                key.len()
            )));
        }
        let mut kek = Zeroizing::new([0u8; 32]);
        kek.copy_from_slice(key);
        Ok(Self {
            kek,
            algorithm: CryptoAlgorithm::Aes256Gcm,
            key_id: key_id.into(),
        })
    }

    /// KEK derived from a password with HKDF-SHA256, salted by the recipient
    /// key id so identical passwords for different recipients derive
    /// different keys.
    pub fn from_password(key_id: impl Into<Vec<u8>>, password: &[u8]) -> EnvelopeResult<Self> {
        let key_id = key_id.into();
        let hkdf = Hkdf::<Sha256>::new(Some(&key_id), password);
        let mut kek = Zeroizing::new([0u8; 32]);
        hkdf.expand(KEK_DERIVATION_INFO, kek.as_mut())
            .map_err(|_| EnvelopeError::CryptoError("HKDF expand failed".to_string()))?;
        Ok(Self {
            kek,
            algorithm: CryptoAlgorithm::HkdfSha256,
            key_id,
        })
    }
}

impl CryptoContext for KekContext {
    fn algorithm(&self) -> CryptoAlgorithm {
        self.algorithm
    }

    fn mode(&self) -> CryptoMode {
        CryptoMode::Gcm
    }

    fn key_id(&self) -> &[u8] {
        &self.key_id
    }

    fn wrap_key(&self, key: &[u8]) -> EnvelopeResult<Vec<u8>> {
        let mut nonce = [0u8; GCM_IV_LENGTH];
        OsRng.fill_bytes(&mut nonce);
        let sealed = gcm_cipher(&self.kek)
            .encrypt(Nonce::from_slice(&nonce), key)
            .map_err(|_| EnvelopeError::CryptoError("key wrap failed".to_string()))?;
        let mut wrapped = nonce.to_vec();
        wrapped.extend_from_slice(&sealed);
        Ok(wrapped)
    }

    fn unwrap_key(&self, wrapped: &[u8]) -> EnvelopeResult<Vec<u8>> {
        if wrapped.len() < GCM_IV_LENGTH + GCM_TAG_LENGTH {
            return Err(EnvelopeError::BadData(format!(
                "wrapped key blob of {} bytes is too short",
                wrapped.len()
            )));
        }
        let (nonce, sealed) = wrapped.split_at(GCM_IV_LENGTH);
        gcm_cipher(&self.kek)
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| EnvelopeError::WrongKey("key unwrap failed".to_string()))
    }
}

/// Ed25519 signing context. The key id is the SHA-256 of the public key.
pub struct Ed25519SignContext {
    key: SigningKey,
    key_id: Vec<u8>,
}

impl Ed25519SignContext {
    /// Generate a fresh signing key.
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    /// Build from a 32-byte seed.
    pub fn from_seed(seed: &[u8]) -> EnvelopeResult<Self> {
        let seed: &[u8; 32] = seed.try_into().map_err(|_| {
            EnvelopeError::InvalidInput("Ed25519 seed must be 32 bytes".to_string())
        })?;
        Ok(Self::from_signing_key(SigningKey::from_bytes(seed)))
    }

    fn from_signing_key(key: SigningKey) -> Self {
        let key_id = Sha256::digest(key.verifying_key().as_bytes()).to_vec();
        Self { key, key_id }
    }

    /// Verifying half of this key, for handing to the deenveloping side.
    #[must_use]
    pub fn verifier(&self) -> Ed25519VerifyContext {
        Ed25519VerifyContext::from_verifying_key(self.key.verifying_key())
    }
}

impl CryptoContext for Ed25519SignContext {
    fn algorithm(&self) -> CryptoAlgorithm {
        CryptoAlgorithm::Ed25519
    }

    fn key_id(&self) -> &[u8] {
        &self.key_id
    }

    fn sign(&mut self, digest: &[u8]) -> EnvelopeResult<Vec<u8>> {
        Ok(self.key.sign(digest).to_bytes().to_vec())
    }
}

/// Ed25519 verification context.
pub struct Ed25519VerifyContext {
    key: VerifyingKey,
    key_id: Vec<u8>,
}

impl Ed25519VerifyContext {
    pub fn from_public_key(bytes: &[u8]) -> EnvelopeResult<Self> {
        let bytes: &[u8; 32] = bytes.try_into().map_err(|_| {
            EnvelopeError::InvalidInput("Ed25519 public key must be 32 bytes".to_string())
        })?;
        let key = VerifyingKey::from_bytes(bytes).map_err(|e| {
            EnvelopeError::InvalidInput(format!("invalid Ed25519 public key: {e}"))
        })?;
        Ok(Self::from_verifying_key(key))
    }

    fn from_verifying_key(key: VerifyingKey) -> Self {
        let key_id = Sha256::digest(key.as_bytes()).to_vec();
        Self { key, key_id }
    }

    /// Raw public key bytes, for transport outside the envelope.
    #[must_use]
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.key.to_bytes()
    }
}

impl CryptoContext for Ed25519VerifyContext {
    fn algorithm(&self) -> CryptoAlgorithm {
        CryptoAlgorithm::Ed25519
    }

    fn key_id(&self) -> &[u8] {
        &self.key_id
    }

    fn verify(&self, digest: &[u8], signature: &[u8]) -> EnvelopeResult<bool> {
        let signature = match Signature::from_slice(signature) {
            Ok(sig) => sig,
            Err(_) => return Ok(false),
        };
        Ok(self.key.verify(digest, &signature).is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_finalize_is_idempotent() {
        let mut ctx = Sha256Context::new();
        ctx.update(b"hello ").unwrap();
        ctx.update(b"world").unwrap();
        let first = ctx.finalize_digest().unwrap();
        let second = ctx.finalize_digest().unwrap();
        assert_eq!(first, second);
        assert_eq!(first, Sha256::digest(b"hello world").to_vec());
        assert!(ctx.update(b"more").is_err());
    }

    #[test]
    fn segment_seal_open_in_order() {
        let mut sealer = SessionKeyContext::generate().unwrap();
        let key = sealer.export_key().unwrap();
        let iv = sealer.base_iv().unwrap();
        let mut opener = SessionKeyContext::from_key_material(&key, &iv).unwrap();

        for chunk in [&b"first segment"[..], b"second", b""] {
            let sealed = sealer.seal_segment(chunk).unwrap();
            assert_eq!(sealed.len(), chunk.len() + GCM_TAG_LENGTH);
            assert_eq!(opener.open_segment(&sealed).unwrap(), chunk);
        }
    }

    #[test]
    fn wrong_session_key_is_detected() {
        let mut sealer = SessionKeyContext::generate().unwrap();
        let iv = sealer.base_iv().unwrap();
        let sealed = sealer.seal_segment(b"secret").unwrap();

        let other = SessionKeyContext::generate().unwrap();
        let mut opener =
            SessionKeyContext::from_key_material(&other.export_key().unwrap(), &iv).unwrap();
        assert!(matches!(
            opener.open_segment(&sealed),
            Err(EnvelopeError::WrongKey(_))
        ));
    }

    #[test]
    fn key_wrap_roundtrip_and_wrong_password() {
        let kek = KekContext::from_password(b"recipient-1".to_vec(), b"hunter2").unwrap();
        let session = SessionKeyContext::generate().unwrap();
        let raw = session.export_key().unwrap();
        let wrapped = kek.wrap_key(&raw).unwrap();
        assert_eq!(kek.unwrap_key(&wrapped).unwrap(), raw);

        let wrong = KekContext::from_password(b"recipient-1".to_vec(), b"hunter3").unwrap();
        assert!(matches!(
            wrong.unwrap_key(&wrapped),
            Err(EnvelopeError::WrongKey(_))
        ));
    }

    #[test]
    fn password_kek_salted_by_key_id() {
        let a = KekContext::from_password(b"a".to_vec(), b"same password").unwrap();
        let b = KekContext::from_password(b"b".to_vec(), b"same password").unwrap();
        let wrapped = a.wrap_key(&[7u8; 32]).unwrap();
        assert!(b.unwrap_key(&wrapped).is_err());
    }

    #[test]
    fn sign_verify_roundtrip() {
        let mut signer = Ed25519SignContext::from_seed(&[42u8; 32]).unwrap();
        let verifier = signer.verifier();
        assert_eq!(signer.key_id(), verifier.key_id());

        let digest = Sha256::digest(b"ten bytes!").to_vec();
        let signature = signer.sign(&digest).unwrap();
        assert!(verifier.verify(&digest, &signature).unwrap());
        assert!(!verifier.verify(&digest, &[0u8; 64]).unwrap());
        let other_digest = Sha256::digest(b"different").to_vec();
        assert!(!verifier.verify(&other_digest, &signature).unwrap());
    }
}
