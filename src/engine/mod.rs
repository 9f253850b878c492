//! The streaming envelope engine.
//!
//! [`envelope::EnvelopeContext`] is the public entry point; the submodules
//! hold the bounded buffers and the direction-specific state machines.

pub mod buffer;
pub mod envelope;

pub(crate) mod emit;
pub(crate) mod parse;
