//! Error types and result definitions for envelope processing.
//!
//! The flow-control statuses (`Underflow`, `Overflow`, `ResourceRequired`,
//! `SoftUnderflow`) share the enum with the fatal errors so callers match on
//! a single type; `is_flow_control` distinguishes the two classes.

use thiserror::Error;

/// Result type for envelope operations
pub type EnvelopeResult<T> = Result<T, EnvelopeError>;

/// Status and error taxonomy for envelope processing
#[derive(Error, Debug, miette::Diagnostic)]
pub enum EnvelopeError {
    /// More input is needed before this call can make progress. Retry the
    /// same call after pushing more data.
    #[error("need more input to make progress")]
    Underflow,

    /// The output buffer is full. Drain it with pop before pushing more.
    #[error("output buffer full, drain with pop before pushing more")]
    Overflow,

    /// Deenveloping needs an external key or password before it can continue.
    /// Inspect the pending content-list entries and call supply_resource.
    #[error("external resource required: {0}")]
    ResourceRequired(String),

    /// The trailer needs more input, but payload bytes are still retrievable
    /// with pop. Do not tear down the envelope.
    #[error("trailer incomplete but payload data is still available")]
    SoftUnderflow,

    /// Malformed structure. Fatal for this envelope context.
    #[error("malformed envelope structure: {0}")]
    BadData(String),

    /// An action was never paired with its controller at commit time.
    /// Configuration error, fatal.
    #[error("orphaned action at commit: {0}")]
    Orphan(String),

    /// A supplied resource cryptographically fails to open the content.
    /// Recoverable: retry supply_resource with a different handle.
    #[error("supplied key cannot open the secured content: {0}")]
    WrongKey(String),

    /// The caller supplied the wrong kind of resource for a content-list
    /// entry. Recoverable at the content-list level.
    #[error("resource mismatch: {0}")]
    ResourceMismatch(String),

    /// A structural element declares a length that can never fit inside the
    /// configured buffer limit. Waiting for input cannot resolve it, so this
    /// is fatal.
    #[error("buffer allocation limit exceeded")]
    Nomem,

    /// Cryptographic operation failure outside the WrongKey case.
    #[error("cryptographic error: {0}")]
    CryptoError(String),

    /// Invalid caller-supplied input or configuration.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Configuration file error.
    #[error("configuration error: {0}")]
    ConfigurationError(String),

    /// IO error (file-based façade and CLI only).
    #[error("IO error: {0}")]
    IoError(String),
}

impl EnvelopeError {
    /// True for the expected control-flow outcomes that the caller resolves
    /// by retrying (after more input, a drain, or a supplied resource).
    /// Everything else is an error proper.
    pub fn is_flow_control(&self) -> bool {
        matches!(
            self,
            EnvelopeError::Underflow
                | EnvelopeError::Overflow
                | EnvelopeError::ResourceRequired(_)
                | EnvelopeError::SoftUnderflow
        )
    }

    /// True when the envelope context can no longer be used and should be
    /// destroyed.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EnvelopeError::BadData(_) | EnvelopeError::Orphan(_) | EnvelopeError::Nomem
        )
    }
}

impl From<std::io::Error> for EnvelopeError {
    fn from(error: std::io::Error) -> Self {
        EnvelopeError::IoError(error.to_string())
    }
}
