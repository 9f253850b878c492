//! Centralized constants for commonly repeated BER/DER tag bytes and CMS OIDs.
//! Keep this intentionally small; only broadly reused literals should live here.

// === ASN.1 tag constants ===

/// ASN.1 SEQUENCE tag (constructed)
pub const ASN1_SEQUENCE_TAG: u8 = 0x30;

/// ASN.1 SET tag (constructed)
pub const ASN1_SET_TAG: u8 = 0x31;

/// ASN.1 INTEGER tag
pub const ASN1_INTEGER_TAG: u8 = 0x02;

/// ASN.1 OBJECT IDENTIFIER tag
pub const ASN1_OID_TAG: u8 = 0x06;

/// ASN.1 OCTET STRING tag (primitive)
pub const ASN1_OCTET_STRING_TAG: u8 = 0x04;

/// ASN.1 OCTET STRING tag (constructed, used for segmented payload runs)
pub const ASN1_OCTET_STRING_CONSTRUCTED_TAG: u8 = 0x24;

/// ASN.1 NULL value (tag + zero length)
pub const ASN1_NULL: &[u8] = &[0x05, 0x00];

/// ASN.1 context-specific [0] constructed tag
pub const ASN1_CONTEXT_0_TAG: u8 = 0xA0;

/// BER indefinite-length octet
pub const BER_INDEFINITE_LENGTH: u8 = 0x80;

/// BER end-of-contents octets (one nesting level)
pub const BER_EOC: &[u8] = &[0x00, 0x00];

/// DER long form length encoding: 1-byte length follows
pub const DER_LONG_FORM_1_BYTE: u8 = 0x81;

/// DER long form length encoding: 2-byte length follows
pub const DER_LONG_FORM_2_BYTE: u8 = 0x82;

/// DER long form length encoding: 3-byte length follows
pub const DER_LONG_FORM_3_BYTE: u8 = 0x83;

// === CMS/PKCS#7 content-type OIDs (DER value bytes, without tag/length) ===

/// PKCS#7 `Data` OID (1.2.840.113549.1.7.1)
pub const OID_DATA: &[u8] = &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x07, 0x01];

/// PKCS#7 `SignedData` OID (1.2.840.113549.1.7.2)
pub const OID_SIGNED_DATA: &[u8] = &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x07, 0x02];

/// PKCS#7 `EnvelopedData` OID (1.2.840.113549.1.7.3)
pub const OID_ENVELOPED_DATA: &[u8] = &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x07, 0x03];

/// PKCS#7 `DigestedData` OID (1.2.840.113549.1.7.5)
pub const OID_DIGESTED_DATA: &[u8] = &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x07, 0x05];

/// PKCS#7 `EncryptedData` OID (1.2.840.113549.1.7.6)
pub const OID_ENCRYPTED_DATA: &[u8] = &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x07, 0x06];

// === Algorithm OIDs ===

/// SHA-256 algorithm OID (2.16.840.1.101.3.4.2.1)
pub const OID_SHA256: &[u8] = &[0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01];

/// AES-256-GCM algorithm OID (2.16.840.1.101.3.4.1.46)
pub const OID_AES256_GCM: &[u8] = &[0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x01, 0x2e];

/// Ed25519 signature algorithm OID (1.3.101.112)
pub const OID_ED25519: &[u8] = &[0x2b, 0x65, 0x70];

/// HKDF-with-SHA256 OID (1.2.840.113549.1.9.16.3.28), marks password recipients
pub const OID_HKDF_SHA256: &[u8] = &[
    0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x09, 0x10, 0x03, 0x1c,
];

// === Structure versions ===

/// CMS version 0 INTEGER (tag + length + value)
pub const CMS_VERSION_0: &[u8] = &[0x02, 0x01, 0x00];

/// CMS version 1 INTEGER (tag + length + value)
pub const CMS_VERSION_1: &[u8] = &[0x02, 0x01, 0x01];

// === Engine limits ===

/// Hard cap on any single definite length the parser will accept.
/// Anything larger is a malformed or hostile structure.
pub const MAX_DEFINITE_LENGTH: usize = 1 << 24;

/// Default bounded main-buffer capacity.
pub const DEFAULT_BUFFER_LIMIT: usize = 32 * 1024;

/// Default payload segment size (plaintext bytes per wire segment).
pub const DEFAULT_SEGMENT_SIZE: usize = 4096;

/// GCM nonce length used for content encryption and key wrap.
pub const GCM_IV_LENGTH: usize = 12;

/// GCM authentication tag length appended to every sealed segment.
pub const GCM_TAG_LENGTH: usize = 16;

/// SHA-256 digest length.
pub const SHA256_DIGEST_LENGTH: usize = 32;

/// Ed25519 signature length.
pub const ED25519_SIGNATURE_LENGTH: usize = 64;
