//! Domain model for CMS envelope processing.
//!
//! Holds the vocabulary shared by both directions of the engine:
//! - Content types, usages and algorithm identifiers
//! - Wire-format constants (tags, OIDs, limits)
//! - Action list management (enveloping)
//! - Content list management (deenveloping)

pub mod action;
pub mod constants;
pub mod content_list;
pub mod types;
