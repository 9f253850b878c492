//! Crypto-context abstraction consumed by the envelope engine.
//!
//! The engine never touches algorithms directly: every cryptographic
//! operation goes through a [`CryptoContext`] behind a reference-counted
//! [`CryptoHandle`]. Cloning a handle retains the context, dropping releases
//! it, so every error exit path in the engine releases its references
//! automatically. That is the ownership-tracking discipline the engine is
//! built around.
//!
//! [`software`] provides the bundled provider (SHA-256, AES-256-GCM,
//! HKDF-SHA256 key derivation, Ed25519 signatures).

pub mod software;

use std::cell::RefCell;
use std::rc::Rc;

use crate::domain::types::{CryptoAlgorithm, CryptoMode};
use crate::infra::error::{EnvelopeError, EnvelopeResult};

/// Shared, reference-counted crypto context. Envelope contexts are
/// single-threaded by design, so plain `Rc` suffices.
pub type CryptoHandle = Rc<RefCell<dyn CryptoContext>>;

/// Wrap a concrete context into a handle.
pub fn handle<C: CryptoContext + 'static>(context: C) -> CryptoHandle {
    Rc::new(RefCell::new(context))
}

fn unsupported(operation: &str, algorithm: CryptoAlgorithm) -> EnvelopeError {
    EnvelopeError::CryptoError(format!(
        "operation {operation} is not supported by a {algorithm} context"
    ))
}

/// One cryptographic capability bound into an envelope.
///
/// Contexts are capability-specific; operations outside a context's
/// capability fail with a crypto error. Default methods exist so each
/// provider implements only what it supports.
pub trait CryptoContext {
    /// Algorithm this context implements.
    fn algorithm(&self) -> CryptoAlgorithm;

    /// Cipher mode, where one applies.
    fn mode(&self) -> CryptoMode {
        CryptoMode::None
    }

    /// Identifier written into RecipientInfo/SignerInfo structures so the
    /// deenveloping side can locate the matching key.
    fn key_id(&self) -> &[u8] {
        &[]
    }

    /// Feed payload bytes into a hash context.
    fn update(&mut self, _data: &[u8]) -> EnvelopeResult<()> {
        Err(unsupported("update", self.algorithm()))
    }

    /// Finalize a hash context. Idempotent: repeated calls return the same
    /// digest.
    fn finalize_digest(&mut self) -> EnvelopeResult<Vec<u8>> {
        Err(unsupported("finalize_digest", self.algorithm()))
    }

    /// Produce a signature over a finalized digest.
    fn sign(&mut self, _digest: &[u8]) -> EnvelopeResult<Vec<u8>> {
        Err(unsupported("sign", self.algorithm()))
    }

    /// Verify a signature over a digest.
    fn verify(&self, _digest: &[u8], _signature: &[u8]) -> EnvelopeResult<bool> {
        Err(unsupported("verify", self.algorithm()))
    }

    /// Base IV written into the EncryptedContentInfo algorithm parameters.
    fn base_iv(&self) -> EnvelopeResult<Vec<u8>> {
        Err(unsupported("base_iv", self.algorithm()))
    }

    /// Seal one payload segment (content-encryption contexts).
    fn seal_segment(&mut self, _plaintext: &[u8]) -> EnvelopeResult<Vec<u8>> {
        Err(unsupported("seal_segment", self.algorithm()))
    }

    /// Open one payload segment. Fails with `WrongKey` when the key does not
    /// authenticate the segment.
    fn open_segment(&mut self, _ciphertext: &[u8]) -> EnvelopeResult<Vec<u8>> {
        Err(unsupported("open_segment", self.algorithm()))
    }

    /// Wrap foreign key material under this context's key (KEK contexts).
    fn wrap_key(&self, _key: &[u8]) -> EnvelopeResult<Vec<u8>> {
        Err(unsupported("wrap_key", self.algorithm()))
    }

    /// Unwrap key material wrapped with `wrap_key`. Fails with `WrongKey`
    /// when this context's key cannot open the blob.
    fn unwrap_key(&self, _wrapped: &[u8]) -> EnvelopeResult<Vec<u8>> {
        Err(unsupported("unwrap_key", self.algorithm()))
    }

    /// Export this context's raw key material for wrapping under a KEK
    /// (session-key contexts only). The caller must zeroize the returned
    /// buffer; the engine always does.
    fn export_key(&self) -> EnvelopeResult<Vec<u8>> {
        Err(unsupported("export_key", self.algorithm()))
    }
}
