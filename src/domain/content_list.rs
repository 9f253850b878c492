//! Content list management for deenveloping.
//!
//! While parsing, every structural field that needs an external resource (a
//! password, a key, a verification key) appends a [`ContentListEntry`]. The
//! caller iterates the pending entries to learn what the envelope needs,
//! then supplies a matching crypto handle. Entries are append-only and
//! ordered by arrival.

use crate::crypto::CryptoHandle;
use crate::domain::types::{CryptoAlgorithm, CryptoMode, EntryId};
use crate::infra::error::{EnvelopeError, EnvelopeResult};

/// Kind of external resource an entry requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequiredResource {
    PrivateKey,
    Password,
    SessionKey,
    ConventionalKey,
    PublicKey,
    Signature,
}

impl RequiredResource {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequiredResource::PrivateKey => "private key",
            RequiredResource::Password => "password",
            RequiredResource::SessionKey => "session key",
            RequiredResource::ConventionalKey => "conventional key",
            RequiredResource::PublicKey => "public key",
            RequiredResource::Signature => "signature",
        }
    }
}

/// One pending external-resource requirement discovered during parsing.
pub struct ContentListEntry {
    pub required: RequiredResource,
    /// Key identifier recovered from the wire, for locating the right key.
    pub key_id: Vec<u8>,
    /// Algorithm recorded in the triggering structural field.
    pub algorithm: CryptoAlgorithm,
    pub mode: CryptoMode,
    /// IV from the EncryptedContentInfo, where one applies.
    pub iv: Option<Vec<u8>>,
    /// Opaque payload carried by the field: a wrapped session key for
    /// recipients, signature bytes for signers.
    pub payload: Vec<u8>,
    /// Handle supplied by the caller, held until its first use so wrong-key
    /// failures are detected lazily.
    pub supplied: Option<CryptoHandle>,
    /// Set once the resource has been consumed successfully.
    pub satisfied: bool,
}

impl ContentListEntry {
    /// Whether this entry still needs the caller to act.
    pub fn is_pending(&self) -> bool {
        !self.satisfied && self.supplied.is_none()
    }
}

/// Append-only list of pending resource requirements.
#[derive(Default)]
pub struct ContentList {
    entries: Vec<ContentListEntry>,
}

impl ContentList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// O(1) tail append.
    pub fn append(&mut self, entry: ContentListEntry) -> EntryId {
        let id = EntryId(self.entries.len());
        self.entries.push(entry);
        id
    }

    /// First entry still awaiting a resource, in arrival order.
    pub fn first_pending(&self) -> Option<EntryId> {
        self.next_pending_after(None)
    }

    /// Next pending entry after the given one; `None` starts from the front.
    pub fn next_pending_after(&self, after: Option<EntryId>) -> Option<EntryId> {
        let start = after.map_or(0, |id| id.0 + 1);
        self.entries[start..]
            .iter()
            .position(ContentListEntry::is_pending)
            .map(|offset| EntryId(start + offset))
    }

    pub fn get(&self, id: EntryId) -> EnvelopeResult<&ContentListEntry> {
        self.entries
            .get(id.0)
            .ok_or_else(|| EnvelopeError::InvalidInput(format!("unknown {id}")))
    }

    pub fn get_mut(&mut self, id: EntryId) -> EnvelopeResult<&mut ContentListEntry> {
        self.entries
            .get_mut(id.0)
            .ok_or_else(|| EnvelopeError::InvalidInput(format!("unknown {id}")))
    }

    pub fn iter(&self) -> impl Iterator<Item = (EntryId, &ContentListEntry)> {
        self.entries
            .iter()
            .enumerate()
            .map(|(index, entry)| (EntryId(index), entry))
    }

    /// Attach a caller-supplied handle to an entry after validating that its
    /// algorithm and mode match the recorded metadata. The handle is not
    /// used yet; wrong-key failures surface on first use, at which point the
    /// engine detaches the handle again so the caller can retry.
    pub fn satisfy(&mut self, id: EntryId, handle: CryptoHandle) -> EnvelopeResult<()> {
        let entry = self.get_mut(id)?;
        if entry.satisfied {
            return Err(EnvelopeError::InvalidInput(format!(
                "{id} has already been satisfied"
            )));
        }
        let (algorithm, mode) = {
            let ctx = handle.borrow();
            (ctx.algorithm(), ctx.mode())
        };
        // Signature entries take a verification key; its algorithm is the
        // signature algorithm, not the entry's digest algorithm.
        let expected_algorithm = match entry.required {
            RequiredResource::PublicKey | RequiredResource::Signature => CryptoAlgorithm::Ed25519,
            _ => entry.algorithm,
        };
        if algorithm != expected_algorithm {
            return Err(EnvelopeError::ResourceMismatch(format!(
                "{} entry expects a {} handle, got {}",
                entry.required.as_str(),
                expected_algorithm,
                algorithm
            )));
        }
        if entry.required != RequiredResource::PublicKey
            && entry.required != RequiredResource::Signature
            && mode != entry.mode
        {
            return Err(EnvelopeError::ResourceMismatch(format!(
                "{} entry expects mode {:?}, got {:?}",
                entry.required.as_str(),
                entry.mode,
                mode
            )));
        }
        entry.supplied = Some(handle);
        Ok(())
    }

    /// Detach a handle whose first use failed, returning the entry to the
    /// pending set.
    pub fn reject_supplied(&mut self, id: EntryId) {
        if let Some(entry) = self.entries.get_mut(id.0) {
            entry.supplied = None;
        }
    }

    /// Mark an entry's resource as consumed.
    pub fn mark_satisfied(&mut self, id: EntryId) {
        if let Some(entry) = self.entries.get_mut(id.0) {
            entry.satisfied = true;
        }
    }
}
