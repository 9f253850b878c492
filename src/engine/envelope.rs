//! Envelope context: the top-level façade over the streaming state machines.
//!
//! One context serves one enveloping or deenveloping operation. Callers
//! configure it (usage, actions), then repeatedly `push` input and `pop`
//! output until `is_complete`. The context suspends by returning a
//! flow-control status and resumes from exactly the byte it stopped at; all
//! owned state is consistent at every state-machine boundary, so dropping
//! the context mid-stream is always safe.

use zeroize::Zeroize;

use crate::crypto::software::{Sha256Context, SessionKeyContext};
use crate::crypto::{handle, CryptoHandle};
use crate::domain::action::{ActionKind, ActionList};
use crate::domain::constants;
use crate::domain::content_list::{ContentList, ContentListEntry, RequiredResource};
use crate::domain::types::{ActionId, ContentType, EntryId, EnvelopeFormat, SizeHint, Usage};
use crate::engine::buffer::{AuxBuffer, EnvelopeBuffer};
use crate::engine::emit::{self, EmitPostambleState, EmitState};
use crate::engine::parse::{self, ParsePostambleState, ParseState};
use crate::infra::error::{EnvelopeError, EnvelopeResult};

/// Per-context configuration, fixed at creation.
#[derive(Debug, Clone)]
pub struct EnvelopeOptions {
    pub format: EnvelopeFormat,
    /// Hard cap on the main wire buffer.
    pub buffer_limit: usize,
    /// Plaintext bytes per emitted wire segment.
    pub segment_size: usize,
    /// Declared payload size; `Unknown` streams with indefinite lengths.
    pub payload_size: SizeHint,
    /// Emit a SignedData without the content itself.
    pub detached_signature: bool,
}

impl Default for EnvelopeOptions {
    fn default() -> Self {
        Self {
            format: EnvelopeFormat::Cms,
            buffer_limit: constants::DEFAULT_BUFFER_LIMIT,
            segment_size: constants::DEFAULT_SEGMENT_SIZE,
            payload_size: SizeHint::Unknown,
            detached_signature: false,
        }
    }
}

impl EnvelopeOptions {
    pub(crate) fn validate(&self) -> EnvelopeResult<()> {
        self.format.validate()?;
        if self.segment_size == 0 || self.segment_size > constants::MAX_DEFINITE_LENGTH {
            return Err(EnvelopeError::InvalidInput(format!(
                "segment size {} is out of range",
                self.segment_size
            )));
        }
        // The buffer must fit a whole wire segment plus structural overhead.
        if self.buffer_limit < self.segment_size + 64 {
            return Err(EnvelopeError::InvalidInput(format!(
                "buffer limit {} cannot hold a {}-byte segment",
                self.buffer_limit, self.segment_size
            )));
        }
        Ok(())
    }
}

/// Direction-specific machine state.
pub(crate) enum Mode {
    Emit(EmitState),
    Parse(ParseState),
}

/// One enveloping or deenveloping operation.
pub struct EnvelopeContext {
    pub(crate) options: EnvelopeOptions,
    pub(crate) usage: Usage,
    pub(crate) buffer: EnvelopeBuffer,
    pub(crate) aux: AuxBuffer,
    pub(crate) mode: Mode,
    /// Pre-content actions: key exchange.
    pub(crate) pre_actions: ActionList,
    /// Main content actions: encryption and hashing.
    pub(crate) actions: ActionList,
    /// Post-content actions: signatures.
    pub(crate) post_actions: ActionList,
    /// Pending external-resource requirements (deenveloping).
    pub(crate) content_list: ContentList,
    /// Plaintext staged for the next wire segment (enveloping).
    pub(crate) segment_stage: Vec<u8>,
    /// True when the current segment boundary must be re-established before
    /// more payload may be written.
    pub(crate) segment_complete: bool,
    /// Boundary up to which pop may release buffered wire bytes.
    pub(crate) segment_data_end: usize,
    /// Total payload bytes accepted so far.
    pub(crate) payload_bytes: u64,
    /// Set once configuration is frozen and structural output has begun.
    pub(crate) committed: bool,
    /// Digest supplied by the caller for verifying a detached signature.
    pub(crate) detached_digest: Option<Vec<u8>>,
    /// Certificate blobs to emit alongside the signer infos.
    pub(crate) attached_certs: Vec<Vec<u8>>,
}

impl EnvelopeContext {
    /// Create an enveloping context for the given usage.
    pub fn new_enveloping(usage: Usage, options: EnvelopeOptions) -> EnvelopeResult<Self> {
        options.validate()?;
        if options.detached_signature && usage != Usage::Sign {
            return Err(EnvelopeError::InvalidInput(
                "detached signatures require sign usage".to_string(),
            ));
        }
        let buffer = EnvelopeBuffer::new(options.buffer_limit);
        Ok(Self {
            options,
            usage,
            buffer,
            aux: AuxBuffer::new(),
            mode: Mode::Emit(EmitState::new()),
            pre_actions: ActionList::new(),
            actions: ActionList::new(),
            post_actions: ActionList::new(),
            content_list: ContentList::new(),
            segment_stage: Vec::new(),
            segment_complete: false,
            segment_data_end: 0,
            payload_bytes: 0,
            committed: false,
            detached_digest: None,
            attached_certs: Vec::new(),
        })
    }

    /// Create a deenveloping context. The usage is discovered from the outer
    /// header once enough input has been pushed.
    pub fn new_deenveloping(options: EnvelopeOptions) -> EnvelopeResult<Self> {
        options.validate()?;
        let buffer = EnvelopeBuffer::new(options.buffer_limit);
        Ok(Self {
            options,
            usage: Usage::None,
            buffer,
            aux: AuxBuffer::new(),
            mode: Mode::Parse(ParseState::new()),
            pre_actions: ActionList::new(),
            actions: ActionList::new(),
            post_actions: ActionList::new(),
            content_list: ContentList::new(),
            segment_stage: Vec::new(),
            segment_complete: false,
            segment_data_end: 0,
            payload_bytes: 0,
            committed: false,
            detached_digest: None,
            attached_certs: Vec::new(),
        })
    }

    pub fn usage(&self) -> Usage {
        self.usage
    }

    /// Outer content type: chosen by usage when enveloping, discovered from
    /// the header when deenveloping.
    pub fn content_type(&self) -> Option<ContentType> {
        match &self.mode {
            Mode::Emit(_) => Some(emit::content_type_for(self)),
            Mode::Parse(state) => state.content_type,
        }
    }

    /// True once the whole structure has been emitted or consumed and no
    /// buffered bytes remain.
    pub fn is_complete(&self) -> bool {
        match &self.mode {
            Mode::Emit(state) => {
                state.postamble == EmitPostambleState::Done && self.buffer.is_empty()
            }
            Mode::Parse(state) => {
                state.postamble == ParsePostambleState::Done && state.recovered.is_empty()
            }
        }
    }

    /// Whether the parsed SignedData carries no content of its own.
    pub fn is_detached_signature(&self) -> bool {
        match &self.mode {
            Mode::Emit(_) => self.options.detached_signature,
            Mode::Parse(state) => state.detached,
        }
    }

    /// Certificate blobs: recovered from the optional certificate set when
    /// deenveloping, attached by the caller when enveloping.
    pub fn certificates(&self) -> &[Vec<u8>] {
        match &self.mode {
            Mode::Parse(state) => &state.certs,
            Mode::Emit(_) => &self.attached_certs,
        }
    }

    /// Attach an encoded certificate for emission in a SignedData envelope.
    /// Configuration-time only.
    pub fn attach_certificate(&mut self, encoded: Vec<u8>) -> EnvelopeResult<()> {
        if self.committed {
            return Err(EnvelopeError::InvalidInput(
                "certificates cannot be attached after enveloping has started".to_string(),
            ));
        }
        if !matches!(self.mode, Mode::Emit(_)) || self.usage != Usage::Sign {
            return Err(EnvelopeError::InvalidInput(
                "certificates only attach to a signing envelope".to_string(),
            ));
        }
        self.attached_certs.push(encoded);
        Ok(())
    }

    /// Bind a cryptographic action to the envelope. Configuration-time only:
    /// fails once structural output has been committed.
    pub fn add_action(&mut self, kind: ActionKind, handle: CryptoHandle) -> EnvelopeResult<ActionId> {
        if self.committed {
            return Err(EnvelopeError::InvalidInput(
                "actions cannot be added after enveloping has started".to_string(),
            ));
        }
        if matches!(self.mode, Mode::Parse(_)) {
            return Err(EnvelopeError::InvalidInput(
                "deenveloping contexts receive resources via supply_resource".to_string(),
            ));
        }
        let allowed = match self.usage {
            Usage::None => false,
            Usage::Encrypt => matches!(
                kind,
                ActionKind::KeyExchangePkc
                    | ActionKind::KeyExchangeConventional
                    | ActionKind::Encrypt
            ),
            Usage::Sign => matches!(kind, ActionKind::Hash | ActionKind::Sign),
            Usage::Hash => matches!(kind, ActionKind::Hash),
        };
        if !allowed {
            return Err(EnvelopeError::InvalidInput(format!(
                "a {kind:?} action does not fit usage {}",
                self.usage.as_str()
            )));
        }
        let id = match kind {
            ActionKind::KeyExchangePkc | ActionKind::KeyExchangeConventional => {
                self.pre_actions.add(kind, handle)
            }
            ActionKind::Encrypt | ActionKind::Hash => self.actions.add(kind, handle),
            ActionKind::Sign => self.post_actions.add(kind, handle),
        };
        log::debug!("added {kind:?} action {id} for usage {}", self.usage.as_str());
        Ok(id)
    }

    /// Supply input bytes. Enveloping: plaintext payload, where an empty
    /// slice marks the end of the payload. Deenveloping: wire bytes, where
    /// an empty slice queries progress without supplying anything.
    pub fn push(&mut self, data: &[u8]) -> EnvelopeResult<usize> {
        match self.mode {
            Mode::Emit(_) => self.push_emit(data),
            Mode::Parse(_) => self.push_parse(data),
        }
    }

    /// Retrieve up to `max_bytes` of output. Enveloping: wire bytes.
    /// Deenveloping: recovered payload.
    pub fn pop(&mut self, max_bytes: usize) -> EnvelopeResult<Vec<u8>> {
        match self.mode {
            Mode::Emit(_) => self.pop_emit(max_bytes),
            Mode::Parse(_) => self.pop_parse(max_bytes),
        }
    }

    /// First pending external-resource requirement, if any.
    pub fn first_pending_resource(&self) -> Option<EntryId> {
        self.content_list.first_pending()
    }

    /// Next pending requirement after `id`.
    pub fn next_pending_resource(&self, id: EntryId) -> Option<EntryId> {
        self.content_list.next_pending_after(Some(id))
    }

    /// Inspect a content-list entry.
    pub fn entry(&self, id: EntryId) -> EnvelopeResult<&ContentListEntry> {
        self.content_list.get(id)
    }

    /// Supply the resource a content-list entry asked for.
    ///
    /// Key material is validated against the entry's metadata immediately
    /// but only used (and a wrong key only detected) when the engine next
    /// needs it. Verification keys are used immediately, since verification
    /// is their first and only use.
    pub fn supply_resource(&mut self, id: EntryId, handle: CryptoHandle) -> EnvelopeResult<()> {
        self.content_list.satisfy(id, handle)?;
        let required = self.content_list.get(id)?.required;
        match required {
            RequiredResource::PublicKey | RequiredResource::Signature => {
                self.verify_signer_entry(id)
            }
            _ => Ok(()),
        }
    }

    /// Digest of the detached content, needed to verify a detached
    /// signature.
    pub fn supply_detached_digest(&mut self, digest: &[u8]) -> EnvelopeResult<()> {
        if !self.is_detached_signature() {
            return Err(EnvelopeError::InvalidInput(
                "envelope does not carry a detached signature".to_string(),
            ));
        }
        self.detached_digest = Some(digest.to_vec());
        Ok(())
    }

    // === Enveloping side ===

    fn push_emit(&mut self, data: &[u8]) -> EnvelopeResult<usize> {
        self.commit()?;
        emit::drive_preamble(self)?;
        if data.is_empty() {
            self.end_payload()?;
            emit::drive_postamble(self)?;
            return Ok(0);
        }
        let payload_ended = match &self.mode {
            Mode::Emit(state) => state.payload_ended,
            Mode::Parse(_) => unreachable!(),
        };
        if payload_ended {
            return Err(EnvelopeError::InvalidInput(
                "payload already marked complete".to_string(),
            ));
        }
        if let SizeHint::Known(total) = self.options.payload_size {
            if self.payload_bytes + data.len() as u64 > total {
                return Err(EnvelopeError::InvalidInput(format!(
                    "payload exceeds the declared size of {total} bytes"
                )));
            }
        }

        let mut consumed = 0;
        while consumed < data.len() {
            let room = self.options.segment_size - self.segment_stage.len();
            let take = room.min(data.len() - consumed);
            self.segment_stage
                .extend_from_slice(&data[consumed..consumed + take]);
            consumed += take;
            self.segment_complete = false;
            if self.segment_stage.len() == self.options.segment_size
                && !emit::flush_segment(self)?
            {
                break;
            }
        }
        self.payload_bytes += consumed as u64;
        if consumed == 0 {
            return Err(EnvelopeError::Overflow);
        }
        Ok(consumed)
    }

    fn end_payload(&mut self) -> EnvelopeResult<()> {
        let state = match &mut self.mode {
            Mode::Emit(state) => state,
            Mode::Parse(_) => unreachable!(),
        };
        if state.payload_ended {
            return Ok(());
        }
        if let SizeHint::Known(total) = self.options.payload_size {
            if self.payload_bytes != total {
                return Err(EnvelopeError::InvalidInput(format!(
                    "payload ended at {} bytes but {total} were declared",
                    self.payload_bytes
                )));
            }
        }
        // Final (possibly short or empty) segment.
        if !self.segment_stage.is_empty() && !emit::flush_segment(self)? {
            return Err(EnvelopeError::Overflow);
        }
        let state = match &mut self.mode {
            Mode::Emit(state) => state,
            Mode::Parse(_) => unreachable!(),
        };
        state.payload_ended = true;
        self.segment_complete = true;
        Ok(())
    }

    fn pop_emit(&mut self, max_bytes: usize) -> EnvelopeResult<Vec<u8>> {
        // Preamble progress may be pending if the caller pops before the
        // first push; postamble progress if the payload has ended.
        self.commit()?;
        match emit::drive_preamble(self) {
            Ok(()) => {}
            Err(err) if err.is_flow_control() => {}
            Err(err) => return Err(err),
        }
        let payload_ended = match &self.mode {
            Mode::Emit(state) => state.payload_ended,
            Mode::Parse(_) => unreachable!(),
        };
        if payload_ended {
            match emit::drive_postamble(self) {
                Ok(()) => {}
                Err(err) if err.is_flow_control() => {}
                Err(err) => return Err(err),
            }
        }

        let take = max_bytes.min(self.segment_data_end);
        let out = self.buffer.as_slice()[..take].to_vec();
        self.buffer.consume(take);
        self.segment_data_end -= take;

        // Freed space may let a suspended trailer finish.
        if payload_ended {
            match emit::drive_postamble(self) {
                Ok(()) => {}
                Err(err) if err.is_flow_control() => {}
                Err(err) => return Err(err),
            }
        }
        Ok(out)
    }

    /// Freeze configuration: run algorithm-specific pre-flight, pair
    /// orphaned actions where a default pairing exists, then validate every
    /// action list. An unpaired action here is an orphan error.
    fn commit(&mut self) -> EnvelopeResult<()> {
        if self.committed {
            return Ok(());
        }
        match self.usage {
            Usage::None => {}
            Usage::Hash => {
                if self.actions.find(ActionKind::Hash).is_none() {
                    let id = self.actions.add(ActionKind::Hash, handle(Sha256Context::new()));
                    log::debug!("created default hash action {id}");
                }
                // A lone hash is the whole point of a DigestedData envelope.
                for id in self.actions.of_kind(ActionKind::Hash) {
                    self.actions.clear_controller_requirement(id);
                }
            }
            Usage::Sign => {
                // Pair each unassociated signer with an unclaimed hash,
                // creating the hash when none was configured explicitly.
                let signers = self.post_actions.of_kind(ActionKind::Sign);
                if signers.is_empty() {
                    return Err(EnvelopeError::Orphan(
                        "sign usage requires at least one sign action".to_string(),
                    ));
                }
                for signer in signers {
                    if self.post_actions.get(signer).associated.is_some() {
                        continue;
                    }
                    let unclaimed = self.actions.ids().find(|id| {
                        let action = self.actions.get(*id);
                        action.kind == ActionKind::Hash && action.needs_controller
                    });
                    let hash = match unclaimed {
                        Some(id) => id,
                        None => {
                            let id =
                                self.actions.add(ActionKind::Hash, handle(Sha256Context::new()));
                            log::debug!("created default hash action {id} for {signer}");
                            id
                        }
                    };
                    self.actions.clear_controller_requirement(hash);
                    self.post_actions.get_mut(signer).associated = Some(hash);
                }
            }
            Usage::Encrypt => {
                // Resolve the shared session-key action, creating it if the
                // caller configured key exchange only.
                let encrypt = match self.actions.find(ActionKind::Encrypt) {
                    Some(id) => id,
                    None => {
                        let id = self
                            .actions
                            .add(ActionKind::Encrypt, handle(SessionKeyContext::generate()?));
                        log::debug!("created session-key action {id}");
                        id
                    }
                };
                let exchanges: Vec<ActionId> = self
                    .pre_actions
                    .ids()
                    .filter(|id| self.pre_actions.get(*id).associated.is_none())
                    .collect();
                for exchange in exchanges {
                    self.pre_actions.get_mut(exchange).associated = Some(encrypt);
                }
                // With no key exchange the session key is pre-shared
                // (EncryptedData); either way the encrypt action now has its
                // controller.
                self.actions.clear_controller_requirement(encrypt);
            }
        }
        self.pre_actions.validate()?;
        self.actions.validate()?;
        self.post_actions.validate()?;
        self.committed = true;
        log::debug!(
            "committed {} envelope: {} pre, {} main, {} post actions",
            self.usage.as_str(),
            self.pre_actions.len(),
            self.actions.len(),
            self.post_actions.len()
        );
        Ok(())
    }

    // === Deenveloping side ===

    fn push_parse(&mut self, data: &[u8]) -> EnvelopeResult<usize> {
        let taken = self.buffer.push_slice(data);
        match parse::drive(self) {
            Ok(()) => Ok(taken),
            Err(err) if err.is_flow_control() => {
                if taken > 0 {
                    Ok(taken)
                } else {
                    Err(err)
                }
            }
            Err(err) => Err(err),
        }
    }

    fn pop_parse(&mut self, max_bytes: usize) -> EnvelopeResult<Vec<u8>> {
        let status = match parse::drive(self) {
            Ok(()) => None,
            Err(err) if err.is_flow_control() => Some(err),
            Err(err) => return Err(err),
        };
        let state = match &mut self.mode {
            Mode::Parse(state) => state,
            Mode::Emit(_) => unreachable!(),
        };
        let take = max_bytes.min(state.recovered.len());
        if take > 0 {
            let out = state.recovered[..take].to_vec();
            state.recovered.copy_within(take.., 0);
            let remaining = state.recovered.len() - take;
            state.recovered[remaining..].zeroize();
            state.recovered.truncate(remaining);
            return Ok(out);
        }
        if state.postamble == ParsePostambleState::Done {
            return Ok(Vec::new());
        }
        Err(status.unwrap_or(EnvelopeError::Underflow))
    }

    /// Verify a parsed SignerInfo against the supplied verification key.
    /// This is the supplied handle's first use, so a mismatch surfaces as
    /// `WrongKey` and detaches the handle for a retry.
    fn verify_signer_entry(&mut self, id: EntryId) -> EnvelopeResult<()> {
        let digest = match &self.detached_digest {
            Some(digest) => digest.clone(),
            None => {
                let hash = self.actions.find(ActionKind::Hash).ok_or_else(|| {
                    EnvelopeError::BadData(
                        "signer info without a matching digest algorithm".to_string(),
                    )
                })?;
                self.actions.get(hash).handle.borrow_mut().finalize_digest()?
            }
        };
        let entry = self.content_list.get(id)?;
        let handle = entry
            .supplied
            .clone()
            .ok_or_else(|| EnvelopeError::InvalidInput(format!("{id} has no supplied handle")))?;
        let signature = entry.payload.clone();
        let verified = handle.borrow().verify(&digest, &signature)?;
        if verified {
            self.content_list.mark_satisfied(id);
            log::debug!("signature on {id} verified");
            Ok(())
        } else {
            self.content_list.reject_supplied(id);
            Err(EnvelopeError::WrongKey(
                "signature verification failed with the supplied key".to_string(),
            ))
        }
    }
}

impl Drop for EnvelopeContext {
    fn drop(&mut self) {
        // Buffers zeroize themselves; the plaintext stage is ours.
        self.segment_stage.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_validation() {
        assert!(EnvelopeOptions::default().validate().is_ok());
        let bad = EnvelopeOptions {
            segment_size: 0,
            ..EnvelopeOptions::default()
        };
        assert!(bad.validate().is_err());
        let tiny = EnvelopeOptions {
            buffer_limit: 128,
            segment_size: 4096,
            ..EnvelopeOptions::default()
        };
        assert!(tiny.validate().is_err());
        let pgp = EnvelopeOptions {
            format: EnvelopeFormat::Pgp,
            ..EnvelopeOptions::default()
        };
        assert!(pgp.validate().is_err());
    }

    #[test]
    fn actions_rejected_after_commit() {
        let mut ctx = EnvelopeContext::new_enveloping(Usage::None, EnvelopeOptions::default())
            .expect("context");
        ctx.push(b"payload").expect("push");
        let err = ctx
            .add_action(ActionKind::Hash, handle(Sha256Context::new()))
            .unwrap_err();
        assert!(matches!(err, EnvelopeError::InvalidInput(_)));
    }

    #[test]
    fn orphan_hash_without_signer_fails_at_commit() {
        let mut ctx = EnvelopeContext::new_enveloping(Usage::Sign, EnvelopeOptions::default())
            .expect("context");
        ctx.add_action(ActionKind::Hash, handle(Sha256Context::new()))
            .expect("hash action");
        // No sign action configured: the hash can never be controlled.
        let err = ctx.push(b"data").unwrap_err();
        assert!(matches!(err, EnvelopeError::Orphan(_)));
    }

    #[test]
    fn usage_action_compatibility() {
        let mut ctx = EnvelopeContext::new_enveloping(Usage::None, EnvelopeOptions::default())
            .expect("context");
        let err = ctx
            .add_action(ActionKind::Hash, handle(Sha256Context::new()))
            .unwrap_err();
        assert!(matches!(err, EnvelopeError::InvalidInput(_)));

        let mut ctx = EnvelopeContext::new_enveloping(Usage::Sign, EnvelopeOptions::default())
            .expect("context");
        let err = ctx
            .add_action(
                ActionKind::Encrypt,
                handle(SessionKeyContext::generate().unwrap()),
            )
            .unwrap_err();
        assert!(matches!(err, EnvelopeError::InvalidInput(_)));
    }
}
