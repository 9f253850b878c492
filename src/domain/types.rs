//! Core domain enumerations and type-safe wrappers for the envelope engine.
//!
//! These types carry no behavior beyond validation and display; all state
//! transitions live in the `engine` module.

use std::fmt;

use crate::domain::constants;
use crate::infra::error::{EnvelopeError, EnvelopeResult};

/// What the envelope is for. Exactly one usage is active per context and it
/// is immutable once structural output has been committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Usage {
    /// Plain data wrapping, no cryptographic transform.
    #[default]
    None,
    /// EnvelopedData / EncryptedData output.
    Encrypt,
    /// SignedData output (hash + signature).
    Sign,
    /// DigestedData output (hash only, no signer).
    Hash,
}

impl Usage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Usage::None => "none",
            Usage::Encrypt => "encrypt",
            Usage::Sign => "sign",
            Usage::Hash => "hash",
        }
    }
}

/// Envelope format family. Cryptlib, CMS and S/MIME all share the CMS wire
/// profile here; they differ only in configuration defaults. PGP is
/// enumerated for completeness but rejected at configuration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnvelopeFormat {
    #[default]
    Cms,
    Cryptlib,
    Smime,
    Pgp,
}

impl EnvelopeFormat {
    /// Validate that this format is supported by the engine.
    pub fn validate(self) -> EnvelopeResult<Self> {
        match self {
            EnvelopeFormat::Pgp => Err(EnvelopeError::BadData(
                "PGP format envelopes are not supported".to_string(),
            )),
            other => Ok(other),
        }
    }
}

/// Outer content type of an envelope, dispatched on the header OID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Data,
    SignedData,
    EnvelopedData,
    EncryptedData,
    DigestedData,
}

impl ContentType {
    /// DER value bytes of this content type's OID.
    pub fn oid(&self) -> &'static [u8] {
        match self {
            ContentType::Data => constants::OID_DATA,
            ContentType::SignedData => constants::OID_SIGNED_DATA,
            ContentType::EnvelopedData => constants::OID_ENVELOPED_DATA,
            ContentType::EncryptedData => constants::OID_ENCRYPTED_DATA,
            ContentType::DigestedData => constants::OID_DIGESTED_DATA,
        }
    }

    /// Match an OID value against the known content types.
    pub fn from_oid(oid: &[u8]) -> Option<Self> {
        match oid {
            o if o == constants::OID_DATA => Some(ContentType::Data),
            o if o == constants::OID_SIGNED_DATA => Some(ContentType::SignedData),
            o if o == constants::OID_ENVELOPED_DATA => Some(ContentType::EnvelopedData),
            o if o == constants::OID_ENCRYPTED_DATA => Some(ContentType::EncryptedData),
            o if o == constants::OID_DIGESTED_DATA => Some(ContentType::DigestedData),
            _ => None,
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ContentType::Data => "data",
            ContentType::SignedData => "signedData",
            ContentType::EnvelopedData => "envelopedData",
            ContentType::EncryptedData => "encryptedData",
            ContentType::DigestedData => "digestedData",
        };
        write!(f, "{name}")
    }
}

/// A size that may be unknown in advance. `Unknown` forces indefinite-length
/// encoding for the enclosing structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SizeHint {
    #[default]
    Unknown,
    Known(u64),
}

/// Cryptographic algorithm identifiers understood by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoAlgorithm {
    Sha256,
    Aes256Gcm,
    Ed25519,
    HkdfSha256,
}

impl CryptoAlgorithm {
    /// DER value bytes of this algorithm's OID.
    pub fn oid(&self) -> &'static [u8] {
        match self {
            CryptoAlgorithm::Sha256 => constants::OID_SHA256,
            CryptoAlgorithm::Aes256Gcm => constants::OID_AES256_GCM,
            CryptoAlgorithm::Ed25519 => constants::OID_ED25519,
            CryptoAlgorithm::HkdfSha256 => constants::OID_HKDF_SHA256,
        }
    }

    pub fn from_oid(oid: &[u8]) -> Option<Self> {
        match oid {
            o if o == constants::OID_SHA256 => Some(CryptoAlgorithm::Sha256),
            o if o == constants::OID_AES256_GCM => Some(CryptoAlgorithm::Aes256Gcm),
            o if o == constants::OID_ED25519 => Some(CryptoAlgorithm::Ed25519),
            o if o == constants::OID_HKDF_SHA256 => Some(CryptoAlgorithm::HkdfSha256),
            _ => None,
        }
    }
}

impl fmt::Display for CryptoAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CryptoAlgorithm::Sha256 => "sha256",
            CryptoAlgorithm::Aes256Gcm => "aes256-gcm",
            CryptoAlgorithm::Ed25519 => "ed25519",
            CryptoAlgorithm::HkdfSha256 => "hkdf-sha256",
        };
        write!(f, "{name}")
    }
}

/// Cipher mode of operation. Kept separate from the algorithm so resource
/// validation can check both independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CryptoMode {
    /// No mode applies (hashes, signatures, KDFs).
    #[default]
    None,
    /// Authenticated GCM mode.
    Gcm,
}

/// Stable identifier of an action inside its owning `ActionList`.
///
/// Identifiers are indices into the list's backing storage; actions are never
/// removed, so an id stays valid for the life of the envelope context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ActionId(pub(crate) usize);

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "action#{}", self.0)
    }
}

/// Stable identifier of an entry inside the envelope's content list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryId(pub(crate) usize);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "entry#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_oid_roundtrip() {
        for ct in [
            ContentType::Data,
            ContentType::SignedData,
            ContentType::EnvelopedData,
            ContentType::EncryptedData,
            ContentType::DigestedData,
        ] {
            assert_eq!(ContentType::from_oid(ct.oid()), Some(ct));
        }
        assert_eq!(ContentType::from_oid(&[0x2a, 0x03]), None);
    }

    #[test]
    fn pgp_format_rejected() {
        assert!(EnvelopeFormat::Pgp.validate().is_err());
        assert!(EnvelopeFormat::Cms.validate().is_ok());
        assert!(EnvelopeFormat::Smime.validate().is_ok());
    }
}
