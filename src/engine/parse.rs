//! Deenveloping state machine: header parsing, payload recovery and trailer
//! verification.
//!
//! The driver advances in steps. Every step either consumes a complete
//! structural element from the main buffer (compacting immediately) or
//! fails without consuming anything, so a suspension at any point resumes
//! by retrying the same step once more input, buffer space or a resource
//! arrives. Encrypted segments are only consumed once they decrypt, which
//! keeps a wrong-key retry byte-exact.

use zeroize::Zeroize;

use crate::codec::{self, Length};
use crate::crypto::software::{SessionKeyContext, Sha256Context};
use crate::crypto::{handle, CryptoHandle};
use crate::domain::action::ActionKind;
use crate::domain::constants;
use crate::domain::content_list::{ContentListEntry, RequiredResource};
use crate::domain::types::{ContentType, CryptoAlgorithm, CryptoMode, EntryId, Usage};
use crate::engine::envelope::{EnvelopeContext, Mode};
use crate::infra::error::{EnvelopeError, EnvelopeResult};

/// Deenveloping preamble phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ParsePreambleState {
    /// Outer ContentInfo: type OID and the [0] wrapper.
    Outer,
    /// Content-specific body header up to the start of the payload.
    BodyHeader,
    /// SET OF RecipientInfo (EnvelopedData only).
    Recipients,
    /// EncryptedContentInfo header (EnvelopedData / EncryptedData).
    EncrContentHeader,
    /// Waiting for a usable content-decryption key.
    EncrKey,
    Done,
}

/// Deenveloping postamble phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ParsePostambleState {
    /// Consuming the end-of-contents pairs that close the payload nesting.
    None,
    /// Optional certificate set ahead of the signer infos.
    CertSet,
    /// SET OF SignerInfo header.
    SetSig,
    /// Signer infos (signed), or the digest value (digested).
    Sig,
    /// Remaining end-of-contents pairs down to the outer ContentInfo.
    Eoc,
    Done,
}

/// Mutable machine state for a deenveloping context.
pub(crate) struct ParseState {
    pub preamble: ParsePreambleState,
    pub postamble: ParsePostambleState,
    /// Discovered from the outer header OID.
    pub content_type: Option<ContentType>,
    /// Recovered plaintext awaiting pop.
    pub recovered: Vec<u8>,
    /// Certificate blobs from the optional certificate set.
    pub certs: Vec<Vec<u8>>,
    /// SignedData without encapsulated content.
    pub detached: bool,
    pub payload_ended: bool,
    /// IV recovered from the EncryptedContentInfo algorithm parameters.
    pub content_iv: Option<Vec<u8>>,
    /// Active content-decryption context, once a key resolved.
    pub decrypt: Option<CryptoHandle>,
    /// Entry the decryption key came from; detached again on a wrong key.
    pub decrypt_entry: Option<EntryId>,
    /// End-of-contents pairs between the payload and the trailer content.
    pub close_remaining: usize,
    /// End-of-contents pairs after the trailer content.
    pub eoc_remaining: usize,
    pub cert_set_open: bool,
}

impl ParseState {
    pub(crate) fn new() -> Self {
        Self {
            preamble: ParsePreambleState::Outer,
            postamble: ParsePostambleState::None,
            content_type: None,
            recovered: Vec::new(),
            certs: Vec::new(),
            detached: false,
            payload_ended: false,
            content_iv: None,
            decrypt: None,
            decrypt_entry: None,
            close_remaining: 0,
            eoc_remaining: 0,
            cert_set_open: false,
        }
    }
}

impl Drop for ParseState {
    fn drop(&mut self) {
        self.recovered.zeroize();
    }
}

fn state(ctx: &mut EnvelopeContext) -> &mut ParseState {
    match &mut ctx.mode {
        Mode::Parse(state) => state,
        Mode::Emit(_) => unreachable!("parse driver on an emit context"),
    }
}

/// Map `Underflow` raised inside a complete definite-length body to
/// `BadData`: the element is fully buffered, so short inner fields mean the
/// structure itself is broken, and waiting for input would never resolve it.
fn in_body<T>(result: EnvelopeResult<T>) -> EnvelopeResult<T> {
    result.map_err(|err| match err {
        EnvelopeError::Underflow => EnvelopeError::BadData(
            "truncated field inside a definite-length element".to_string(),
        ),
        other => other,
    })
}

/// A definite-length element larger than the wire buffer can never be
/// buffered whole, so waiting for more input would stall forever.
fn require_buffer_fits(ctx: &EnvelopeContext, total: usize) -> EnvelopeResult<()> {
    if total > ctx.options.buffer_limit {
        return Err(EnvelopeError::Nomem);
    }
    Ok(())
}

/// Drive the parser as far as the buffered input allows.
///
/// `Underflow` in the trailer is reported as `SoftUnderflow` while recovered
/// payload is still waiting to be popped: the payload itself is complete,
/// only the trailer needs more input.
pub(crate) fn drive(ctx: &mut EnvelopeContext) -> EnvelopeResult<()> {
    match drive_steps(ctx) {
        Err(EnvelopeError::Underflow) => {
            let st = state(ctx);
            if st.payload_ended
                && st.postamble != ParsePostambleState::Done
                && !st.recovered.is_empty()
            {
                Err(EnvelopeError::SoftUnderflow)
            } else {
                Err(EnvelopeError::Underflow)
            }
        }
        other => other,
    }
}

fn drive_steps(ctx: &mut EnvelopeContext) -> EnvelopeResult<()> {
    loop {
        if state(ctx).preamble != ParsePreambleState::Done {
            step_preamble(ctx)?;
        } else if !state(ctx).payload_ended {
            step_payload(ctx)?;
        } else if state(ctx).postamble != ParsePostambleState::Done {
            step_postamble(ctx)?;
        } else {
            return Ok(());
        }
    }
}

// === Preamble ===

fn step_preamble(ctx: &mut EnvelopeContext) -> EnvelopeResult<()> {
    match state(ctx).preamble {
        ParsePreambleState::Outer => step_outer(ctx),
        ParsePreambleState::BodyHeader => step_body_header(ctx),
        ParsePreambleState::Recipients => step_recipient(ctx),
        ParsePreambleState::EncrContentHeader => step_encryption_header(ctx),
        ParsePreambleState::EncrKey => step_encryption_key(ctx),
        ParsePreambleState::Done => Ok(()),
    }
}

fn expect_indefinite(buf: &[u8], tag: u8) -> EnvelopeResult<usize> {
    let (length, used) = codec::expect_header(buf, tag)?;
    if !length.is_indefinite() {
        return Err(EnvelopeError::BadData(format!(
            "element 0x{tag:02x} must use indefinite length in a streamed envelope"
        )));
    }
    Ok(used)
}

fn step_outer(ctx: &mut EnvelopeContext) -> EnvelopeResult<()> {
    let (content_type, used) = {
        let buf = ctx.buffer.as_slice();
        let mut pos = 0;
        pos += expect_indefinite(&buf[pos..], constants::ASN1_SEQUENCE_TAG)?;
        let (oid, n) = codec::read_oid(&buf[pos..])?;
        let content_type = ContentType::from_oid(oid).ok_or_else(|| {
            EnvelopeError::BadData("unrecognized outer content-type OID".to_string())
        })?;
        pos += n;
        pos += expect_indefinite(&buf[pos..], constants::ASN1_CONTEXT_0_TAG)?;
        (content_type, pos)
    };
    ctx.buffer.consume(used);
    ctx.usage = match content_type {
        ContentType::Data => Usage::None,
        ContentType::SignedData => Usage::Sign,
        ContentType::EnvelopedData | ContentType::EncryptedData => Usage::Encrypt,
        ContentType::DigestedData => Usage::Hash,
    };
    let st = state(ctx);
    st.content_type = Some(content_type);
    st.preamble = ParsePreambleState::BodyHeader;
    log::debug!("parsed {content_type} envelope header");
    Ok(())
}

fn step_body_header(ctx: &mut EnvelopeContext) -> EnvelopeResult<()> {
    match ctx.usage {
        Usage::None => {
            let used = expect_indefinite(
                ctx.buffer.as_slice(),
                constants::ASN1_OCTET_STRING_CONSTRUCTED_TAG,
            )?;
            ctx.buffer.consume(used);
            state(ctx).preamble = ParsePreambleState::Done;
            Ok(())
        }
        Usage::Sign => step_signed_body_header(ctx),
        Usage::Hash => step_digested_body_header(ctx),
        Usage::Encrypt => {
            let enveloped = state(ctx).content_type == Some(ContentType::EnvelopedData);
            let used = {
                let buf = ctx.buffer.as_slice();
                let mut pos = 0;
                pos += expect_indefinite(&buf[pos..], constants::ASN1_SEQUENCE_TAG)?;
                let (_version, n) = codec::read_small_integer(&buf[pos..])?;
                pos += n;
                if enveloped {
                    pos += expect_indefinite(&buf[pos..], constants::ASN1_SET_TAG)?;
                }
                pos
            };
            ctx.buffer.consume(used);
            state(ctx).preamble = if enveloped {
                ParsePreambleState::Recipients
            } else {
                ParsePreambleState::EncrContentHeader
            };
            Ok(())
        }
    }
}

fn step_signed_body_header(ctx: &mut EnvelopeContext) -> EnvelopeResult<()> {
    let (hash_count, detached, used) = {
        let buf = ctx.buffer.as_slice();
        let mut pos = 0;
        pos += expect_indefinite(&buf[pos..], constants::ASN1_SEQUENCE_TAG)?;
        let (_version, n) = codec::read_small_integer(&buf[pos..])?;
        pos += n;
        // digestAlgorithms SET: definite, the set of algorithms is known
        // when the header is built.
        let (length, n) = codec::expect_header(&buf[pos..], constants::ASN1_SET_TAG)?;
        let body_len = match length {
            Length::Definite(len) => len,
            Length::Indefinite => {
                return Err(EnvelopeError::BadData(
                    "digestAlgorithms SET must use definite length".to_string(),
                ))
            }
        };
        if buf.len() < pos + n + body_len {
            return Err(EnvelopeError::Underflow);
        }
        let set_body = &buf[pos + n..pos + n + body_len];
        let mut hash_count = 0usize;
        let mut set_pos = 0;
        while set_pos < set_body.len() {
            let (oid, _params, alg_used) =
                in_body(codec::read_algorithm_identifier(&set_body[set_pos..]))?;
            if CryptoAlgorithm::from_oid(oid) != Some(CryptoAlgorithm::Sha256) {
                return Err(EnvelopeError::BadData(
                    "unsupported digest algorithm in SignedData".to_string(),
                ));
            }
            hash_count += 1;
            set_pos += alg_used;
        }
        pos += n + body_len;
        // encapContentInfo.
        pos += expect_indefinite(&buf[pos..], constants::ASN1_SEQUENCE_TAG)?;
        let (oid, n) = codec::read_oid(&buf[pos..])?;
        if oid != constants::OID_DATA {
            return Err(EnvelopeError::BadData(
                "encapsulated content must be plain data".to_string(),
            ));
        }
        pos += n;
        let (eoc, n) = codec::check_end_of_contents(&buf[pos..])?;
        let detached = if eoc {
            pos += n;
            true
        } else {
            pos += expect_indefinite(&buf[pos..], constants::ASN1_CONTEXT_0_TAG)?;
            pos += expect_indefinite(&buf[pos..], constants::ASN1_OCTET_STRING_CONSTRUCTED_TAG)?;
            false
        };
        (hash_count, detached, pos)
    };
    ctx.buffer.consume(used);
    for _ in 0..hash_count {
        let id = ctx
            .actions
            .add(ActionKind::Hash, handle(Sha256Context::new()));
        ctx.actions.clear_controller_requirement(id);
    }
    let st = state(ctx);
    st.preamble = ParsePreambleState::Done;
    if detached {
        st.detached = true;
        st.payload_ended = true;
        st.close_remaining = 0;
        log::debug!("signed envelope carries a detached signature");
    }
    Ok(())
}

fn step_digested_body_header(ctx: &mut EnvelopeContext) -> EnvelopeResult<()> {
    let used = {
        let buf = ctx.buffer.as_slice();
        let mut pos = 0;
        pos += expect_indefinite(&buf[pos..], constants::ASN1_SEQUENCE_TAG)?;
        let (_version, n) = codec::read_small_integer(&buf[pos..])?;
        pos += n;
        let (oid, _params, n) = codec::read_algorithm_identifier(&buf[pos..])?;
        if CryptoAlgorithm::from_oid(oid) != Some(CryptoAlgorithm::Sha256) {
            return Err(EnvelopeError::BadData(
                "unsupported digest algorithm in DigestedData".to_string(),
            ));
        }
        pos += n;
        pos += expect_indefinite(&buf[pos..], constants::ASN1_SEQUENCE_TAG)?;
        let (oid, n) = codec::read_oid(&buf[pos..])?;
        if oid != constants::OID_DATA {
            return Err(EnvelopeError::BadData(
                "encapsulated content must be plain data".to_string(),
            ));
        }
        pos += n;
        pos += expect_indefinite(&buf[pos..], constants::ASN1_CONTEXT_0_TAG)?;
        pos += expect_indefinite(&buf[pos..], constants::ASN1_OCTET_STRING_CONSTRUCTED_TAG)?;
        pos
    };
    ctx.buffer.consume(used);
    let id = ctx
        .actions
        .add(ActionKind::Hash, handle(Sha256Context::new()));
    ctx.actions.clear_controller_requirement(id);
    state(ctx).preamble = ParsePreambleState::Done;
    Ok(())
}

/// One RecipientInfo per step; end-of-contents closes the SET.
fn step_recipient(ctx: &mut EnvelopeContext) -> EnvelopeResult<()> {
    {
        let buf = ctx.buffer.as_slice();
        let (eoc, n) = codec::check_end_of_contents(buf)?;
        if eoc {
            ctx.buffer.consume(n);
            state(ctx).preamble = ParsePreambleState::EncrContentHeader;
            return Ok(());
        }
    }
    let (required, algorithm, key_id, wrapped, used) = {
        let buf = ctx.buffer.as_slice();
        let (length, hdr) = codec::expect_header(buf, constants::ASN1_SEQUENCE_TAG)?;
        let body_len = match length {
            Length::Definite(len) => len,
            Length::Indefinite => {
                return Err(EnvelopeError::BadData(
                    "RecipientInfo must use definite length".to_string(),
                ))
            }
        };
        require_buffer_fits(ctx, hdr + body_len)?;
        if buf.len() < hdr + body_len {
            return Err(EnvelopeError::Underflow);
        }
        let body = &buf[hdr..hdr + body_len];
        let mut pos = 0;
        let (_version, n) = in_body(codec::read_small_integer(body))?;
        pos += n;
        let (key_id, n) = in_body(codec::read_octet_string(&body[pos..]))?;
        pos += n;
        let (oid, _params, n) = in_body(codec::read_algorithm_identifier(&body[pos..]))?;
        pos += n;
        let (wrapped, n) = in_body(codec::read_octet_string(&body[pos..]))?;
        pos += n;
        if pos != body_len {
            return Err(EnvelopeError::BadData(
                "trailing bytes inside RecipientInfo".to_string(),
            ));
        }
        let algorithm = CryptoAlgorithm::from_oid(oid).ok_or_else(|| {
            EnvelopeError::BadData("unrecognized key-encryption algorithm".to_string())
        })?;
        let required = match algorithm {
            CryptoAlgorithm::HkdfSha256 => RequiredResource::Password,
            CryptoAlgorithm::Aes256Gcm => RequiredResource::ConventionalKey,
            _ => {
                return Err(EnvelopeError::BadData(format!(
                    "{algorithm} cannot encrypt a session key"
                )))
            }
        };
        (
            required,
            algorithm,
            key_id.to_vec(),
            wrapped.to_vec(),
            hdr + body_len,
        )
    };
    ctx.buffer.consume(used);
    let id = ctx.content_list.append(ContentListEntry {
        required,
        key_id,
        algorithm,
        mode: CryptoMode::Gcm,
        iv: None,
        payload: wrapped,
        supplied: None,
        satisfied: false,
    });
    log::debug!("recipient info recorded as {id} ({})", required.as_str());
    Ok(())
}

fn step_encryption_header(ctx: &mut EnvelopeContext) -> EnvelopeResult<()> {
    let (iv, used) = {
        let buf = ctx.buffer.as_slice();
        let mut pos = 0;
        pos += expect_indefinite(&buf[pos..], constants::ASN1_SEQUENCE_TAG)?;
        let (oid, n) = codec::read_oid(&buf[pos..])?;
        if oid != constants::OID_DATA {
            return Err(EnvelopeError::BadData(
                "encrypted content must wrap plain data".to_string(),
            ));
        }
        pos += n;
        let (oid, params, n) = codec::read_algorithm_identifier(&buf[pos..])?;
        if CryptoAlgorithm::from_oid(oid) != Some(CryptoAlgorithm::Aes256Gcm) {
            return Err(EnvelopeError::BadData(
                "unsupported content-encryption algorithm".to_string(),
            ));
        }
        let iv = params
            .ok_or_else(|| {
                EnvelopeError::BadData("content-encryption algorithm is missing its IV".to_string())
            })?
            .to_vec();
        pos += n;
        pos += expect_indefinite(&buf[pos..], constants::ASN1_CONTEXT_0_TAG)?;
        (iv, pos)
    };
    ctx.buffer.consume(used);
    let content_type = state(ctx).content_type;
    state(ctx).content_iv = Some(iv.clone());
    // EncryptedData carries no recipients; the session key itself is the
    // pending resource.
    if content_type == Some(ContentType::EncryptedData) && ctx.content_list.is_empty() {
        let id = ctx.content_list.append(ContentListEntry {
            required: RequiredResource::SessionKey,
            key_id: Vec::new(),
            algorithm: CryptoAlgorithm::Aes256Gcm,
            mode: CryptoMode::Gcm,
            iv: Some(iv),
            payload: Vec::new(),
            supplied: None,
            satisfied: false,
        });
        log::debug!("encrypted content needs a pre-shared session key ({id})");
    }
    state(ctx).preamble = ParsePreambleState::EncrKey;
    Ok(())
}

/// Resolve the content-decryption key from the supplied resources. Stays in
/// this state, reporting `ResourceRequired`, until one of the content-list
/// entries has a usable handle attached.
fn step_encryption_key(ctx: &mut EnvelopeContext) -> EnvelopeResult<()> {
    if state(ctx).decrypt.is_some() {
        state(ctx).preamble = ParsePreambleState::Done;
        return Ok(());
    }
    let iv = state(ctx)
        .content_iv
        .clone()
        .ok_or_else(|| EnvelopeError::BadData("no content-encryption IV".to_string()))?;

    let candidates: Vec<(EntryId, RequiredResource, CryptoHandle, Vec<u8>)> = ctx
        .content_list
        .iter()
        .filter(|(_, entry)| !entry.satisfied)
        .filter_map(|(id, entry)| {
            entry
                .supplied
                .clone()
                .map(|supplied| (id, entry.required, supplied, entry.payload.clone()))
        })
        .collect();

    for (id, required, supplied, wrapped) in candidates {
        match required {
            RequiredResource::SessionKey => {
                // The supplied handle is the session context itself; a wrong
                // key only shows on the first segment.
                let st = state(ctx);
                st.decrypt = Some(supplied);
                st.decrypt_entry = Some(id);
                st.preamble = ParsePreambleState::Done;
                return Ok(());
            }
            RequiredResource::Password | RequiredResource::ConventionalKey => {
                match supplied.borrow().unwrap_key(&wrapped) {
                    Ok(mut raw) => {
                        let session = SessionKeyContext::from_key_material(&raw, &iv);
                        raw.zeroize();
                        let session = session?;
                        ctx.content_list.mark_satisfied(id);
                        let st = state(ctx);
                        st.decrypt = Some(handle(session));
                        st.decrypt_entry = Some(id);
                        st.preamble = ParsePreambleState::Done;
                        log::debug!("session key recovered via {id}");
                        return Ok(());
                    }
                    Err(EnvelopeError::WrongKey(message)) => {
                        ctx.content_list.reject_supplied(id);
                        return Err(EnvelopeError::WrongKey(message));
                    }
                    Err(other) => return Err(other),
                }
            }
            _ => {}
        }
    }
    Err(EnvelopeError::ResourceRequired(
        "a key for the encrypted content".to_string(),
    ))
}

// === Payload ===

fn step_payload(ctx: &mut EnvelopeContext) -> EnvelopeResult<()> {
    {
        let buf = ctx.buffer.as_slice();
        let (eoc, n) = codec::check_end_of_contents(buf)?;
        if eoc {
            ctx.buffer.consume(n);
            let usage = ctx.usage;
            let st = state(ctx);
            st.payload_ended = true;
            // Signed and digested payloads sit two levels deeper ([0] and
            // the inner ContentInfo) than the trailer content.
            st.close_remaining = match usage {
                Usage::Sign | Usage::Hash => 2,
                Usage::None | Usage::Encrypt => 0,
            };
            log::debug!("payload complete after {} bytes", ctx.payload_bytes);
            return Ok(());
        }
    }
    // Recovered output is bounded by the same limit as the wire buffer;
    // the caller must pop before more segments are decoded.
    if !state(ctx).recovered.is_empty()
        && state(ctx).recovered.len() >= ctx.options.buffer_limit
    {
        return Err(EnvelopeError::Overflow);
    }

    let (segment, used) = {
        let buf = ctx.buffer.as_slice();
        let (length, hdr) = codec::expect_header(buf, constants::ASN1_OCTET_STRING_TAG)?;
        let body_len = match length {
            Length::Definite(len) => len,
            Length::Indefinite => {
                return Err(EnvelopeError::BadData(
                    "payload segments must use definite length".to_string(),
                ))
            }
        };
        require_buffer_fits(ctx, hdr + body_len)?;
        if buf.len() < hdr + body_len {
            return Err(EnvelopeError::Underflow);
        }
        (buf[hdr..hdr + body_len].to_vec(), hdr + body_len)
    };
    let plaintext = if ctx.usage == Usage::Encrypt {
        let decrypt = match state(ctx).decrypt.clone() {
            Some(decrypt) => decrypt,
            None => {
                // A detached (wrong) key leaves the segment buffered; go back
                // to key resolution so a replacement can be picked up.
                state(ctx).preamble = ParsePreambleState::EncrKey;
                return Ok(());
            }
        };
        let opened = decrypt.borrow_mut().open_segment(&segment);
        match opened {
            Ok(plaintext) => plaintext,
            Err(EnvelopeError::WrongKey(message)) => {
                // Detach the offending key and leave the segment buffered so
                // a retry with the right key re-reads the same bytes.
                let entry = state(ctx).decrypt_entry.take();
                state(ctx).decrypt = None;
                if let Some(id) = entry {
                    ctx.content_list.reject_supplied(id);
                }
                return Err(EnvelopeError::WrongKey(message));
            }
            Err(other) => return Err(other),
        }
    } else {
        segment
    };
    ctx.buffer.consume(used);
    if let Some(id) = state(ctx).decrypt_entry {
        ctx.content_list.mark_satisfied(id);
    }
    for id in ctx.actions.of_kind(ActionKind::Hash) {
        ctx.actions.get(id).handle.borrow_mut().update(&plaintext)?;
    }
    ctx.payload_bytes += plaintext.len() as u64;
    state(ctx).recovered.extend_from_slice(&plaintext);
    Ok(())
}

// === Postamble ===

fn step_postamble(ctx: &mut EnvelopeContext) -> EnvelopeResult<()> {
    match state(ctx).postamble {
        ParsePostambleState::None => step_trailer_start(ctx),
        ParsePostambleState::CertSet => step_cert_set(ctx),
        ParsePostambleState::SetSig => {
            let used = expect_indefinite(ctx.buffer.as_slice(), constants::ASN1_SET_TAG)?;
            ctx.buffer.consume(used);
            state(ctx).postamble = ParsePostambleState::Sig;
            Ok(())
        }
        ParsePostambleState::Sig => match ctx.usage {
            Usage::Sign => step_signer_info(ctx),
            Usage::Hash => step_digest_value(ctx),
            _ => Err(EnvelopeError::BadData(
                "trailer content in an unsigned envelope".to_string(),
            )),
        },
        ParsePostambleState::Eoc => step_final_eoc(ctx),
        ParsePostambleState::Done => Ok(()),
    }
}

fn read_required_eoc(ctx: &mut EnvelopeContext) -> EnvelopeResult<()> {
    let (eoc, n) = codec::check_end_of_contents(ctx.buffer.as_slice())?;
    if !eoc {
        return Err(EnvelopeError::BadData(
            "expected end-of-contents octets".to_string(),
        ));
    }
    ctx.buffer.consume(n);
    Ok(())
}

fn step_trailer_start(ctx: &mut EnvelopeContext) -> EnvelopeResult<()> {
    if state(ctx).close_remaining > 0 {
        read_required_eoc(ctx)?;
        state(ctx).close_remaining -= 1;
        return Ok(());
    }
    let usage = ctx.usage;
    let st = state(ctx);
    st.postamble = match usage {
        Usage::Sign => ParsePostambleState::CertSet,
        Usage::Hash => ParsePostambleState::Sig,
        Usage::None => {
            st.eoc_remaining = 2;
            ParsePostambleState::Eoc
        }
        Usage::Encrypt => {
            st.eoc_remaining = 4;
            ParsePostambleState::Eoc
        }
    };
    Ok(())
}

/// Optional [0] IMPLICIT certificate set: one OCTET STRING per certificate.
fn step_cert_set(ctx: &mut EnvelopeContext) -> EnvelopeResult<()> {
    if !state(ctx).cert_set_open {
        let tag = codec::peek_tag(ctx.buffer.as_slice())?;
        if tag != constants::ASN1_CONTEXT_0_TAG {
            state(ctx).postamble = ParsePostambleState::SetSig;
            return Ok(());
        }
        let used = expect_indefinite(ctx.buffer.as_slice(), constants::ASN1_CONTEXT_0_TAG)?;
        ctx.buffer.consume(used);
        state(ctx).cert_set_open = true;
        return Ok(());
    }
    {
        let buf = ctx.buffer.as_slice();
        let (eoc, n) = codec::check_end_of_contents(buf)?;
        if eoc {
            ctx.buffer.consume(n);
            let st = state(ctx);
            st.cert_set_open = false;
            st.postamble = ParsePostambleState::SetSig;
            return Ok(());
        }
    }
    let (cert, used) = {
        let buf = ctx.buffer.as_slice();
        let (value, used) = codec::read_octet_string(buf)?;
        (value.to_vec(), used)
    };
    ctx.buffer.consume(used);
    state(ctx).certs.push(cert);
    Ok(())
}

/// One SignerInfo per step; end-of-contents closes the SET. Each signer
/// becomes a pending verification entry; the signature is checked when the
/// caller supplies the matching public key.
fn step_signer_info(ctx: &mut EnvelopeContext) -> EnvelopeResult<()> {
    {
        let buf = ctx.buffer.as_slice();
        let (eoc, n) = codec::check_end_of_contents(buf)?;
        if eoc {
            ctx.buffer.consume(n);
            let st = state(ctx);
            st.eoc_remaining = 3;
            st.postamble = ParsePostambleState::Eoc;
            return Ok(());
        }
    }
    let (key_id, signature, used) = {
        let buf = ctx.buffer.as_slice();
        let (length, hdr) = codec::expect_header(buf, constants::ASN1_SEQUENCE_TAG)?;
        let body_len = match length {
            Length::Definite(len) => len,
            Length::Indefinite => {
                return Err(EnvelopeError::BadData(
                    "SignerInfo must use definite length".to_string(),
                ))
            }
        };
        require_buffer_fits(ctx, hdr + body_len)?;
        if buf.len() < hdr + body_len {
            return Err(EnvelopeError::Underflow);
        }
        let body = &buf[hdr..hdr + body_len];
        let mut pos = 0;
        let (_version, n) = in_body(codec::read_small_integer(body))?;
        pos += n;
        let (key_id, n) = in_body(codec::read_octet_string(&body[pos..]))?;
        pos += n;
        let (digest_oid, _params, n) = in_body(codec::read_algorithm_identifier(&body[pos..]))?;
        if CryptoAlgorithm::from_oid(digest_oid) != Some(CryptoAlgorithm::Sha256) {
            return Err(EnvelopeError::BadData(
                "unsupported digest algorithm in SignerInfo".to_string(),
            ));
        }
        pos += n;
        let (sig_oid, _params, n) = in_body(codec::read_algorithm_identifier(&body[pos..]))?;
        if CryptoAlgorithm::from_oid(sig_oid) != Some(CryptoAlgorithm::Ed25519) {
            return Err(EnvelopeError::BadData(
                "unsupported signature algorithm in SignerInfo".to_string(),
            ));
        }
        pos += n;
        let (signature, n) = in_body(codec::read_octet_string(&body[pos..]))?;
        if signature.len() != constants::ED25519_SIGNATURE_LENGTH {
            return Err(EnvelopeError::BadData(format!(
                "{}-byte signature in an Ed25519 SignerInfo",
                signature.len()
            )));
        }
        pos += n;
        if pos != body_len {
            return Err(EnvelopeError::BadData(
                "trailing bytes inside SignerInfo".to_string(),
            ));
        }
        (key_id.to_vec(), signature.to_vec(), hdr + body_len)
    };
    ctx.buffer.consume(used);
    let id = ctx.content_list.append(ContentListEntry {
        required: RequiredResource::Signature,
        key_id,
        algorithm: CryptoAlgorithm::Ed25519,
        mode: CryptoMode::None,
        iv: None,
        payload: signature,
        supplied: None,
        satisfied: false,
    });
    log::debug!("signer info recorded as {id}");
    Ok(())
}

/// Digest value of a DigestedData envelope. Compared against the recomputed
/// content digest immediately; this is the whole verification.
fn step_digest_value(ctx: &mut EnvelopeContext) -> EnvelopeResult<()> {
    let (claimed, used) = {
        let buf = ctx.buffer.as_slice();
        let (value, used) = codec::read_octet_string(buf)?;
        (value.to_vec(), used)
    };
    if claimed.len() != constants::SHA256_DIGEST_LENGTH {
        return Err(EnvelopeError::BadData(format!(
            "{}-byte digest value for a SHA-256 digest",
            claimed.len()
        )));
    }
    let hash_id = ctx
        .actions
        .find(ActionKind::Hash)
        .ok_or_else(|| EnvelopeError::BadData("no digest algorithm was parsed".to_string()))?;
    let computed = ctx
        .actions
        .get(hash_id)
        .handle
        .borrow_mut()
        .finalize_digest()?;
    if claimed != computed {
        return Err(EnvelopeError::BadData(
            "content digest does not match the digest value".to_string(),
        ));
    }
    ctx.buffer.consume(used);
    let st = state(ctx);
    st.eoc_remaining = 3;
    st.postamble = ParsePostambleState::Eoc;
    log::debug!("content digest verified");
    Ok(())
}

fn step_final_eoc(ctx: &mut EnvelopeContext) -> EnvelopeResult<()> {
    while state(ctx).eoc_remaining > 0 {
        read_required_eoc(ctx)?;
        state(ctx).eoc_remaining -= 1;
    }
    state(ctx).postamble = ParsePostambleState::Done;
    log::debug!("envelope fully parsed");
    Ok(())
}
