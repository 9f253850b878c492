//! Enveloping state machines: preamble emission, payload segmentation and
//! trailer emission.
//!
//! Each drive function makes maximal progress and suspends by returning
//! `Overflow` with all state preserved; the caller drains the buffer with
//! pop and re-invokes. Variable-length components (wrapped keys, signer
//! infos) are staged whole in the aux buffer and drained in as many steps
//! as free space allows, resuming mid-list through the position pointers
//! kept on the state, never recomputed.

use zeroize::Zeroize;

use crate::codec::{self, Length};
use crate::domain::action::ActionKind;
use crate::domain::constants;
use crate::domain::types::{ActionId, ContentType, SizeHint, Usage};
use crate::engine::envelope::{EnvelopeContext, Mode};
use crate::infra::error::{EnvelopeError, EnvelopeResult};

/// Enveloping preamble phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EmitPreambleState {
    None,
    Header,
    KeyInfo,
    EncrInfo,
    Done,
}

/// Enveloping postamble phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EmitPostambleState {
    None,
    Header,
    Signature,
    Eoc,
    Done,
}

/// Mutable machine state for an enveloping context.
pub(crate) struct EmitState {
    pub preamble: EmitPreambleState,
    pub postamble: EmitPostambleState,
    /// Next key-exchange action to export in KeyInfo.
    pub key_info_pos: usize,
    /// Next signer (or the digest, for hash usage) to emit in Signature.
    pub signature_pos: usize,
    /// Indefinite-length nesting levels still open on the wire.
    pub indef_depth: usize,
    /// True while the recipient SET header has been written but not closed.
    pub set_open: bool,
    pub payload_ended: bool,
}

impl EmitState {
    pub(crate) fn new() -> Self {
        Self {
            preamble: EmitPreambleState::None,
            postamble: EmitPostambleState::None,
            key_info_pos: 0,
            signature_pos: 0,
            indef_depth: 0,
            set_open: false,
            payload_ended: false,
        }
    }
}

fn state(ctx: &mut EnvelopeContext) -> &mut EmitState {
    match &mut ctx.mode {
        Mode::Emit(state) => state,
        Mode::Parse(_) => unreachable!("emit driver on a parse context"),
    }
}

/// Outer content type implied by the context's usage and configuration.
pub(crate) fn content_type_for(ctx: &EnvelopeContext) -> ContentType {
    match ctx.usage {
        Usage::None => ContentType::Data,
        Usage::Sign => ContentType::SignedData,
        Usage::Hash => ContentType::DigestedData,
        Usage::Encrypt => {
            if ctx.pre_actions.is_empty() {
                ContentType::EncryptedData
            } else {
                ContentType::EnvelopedData
            }
        }
    }
}

/// Drive the preamble until `Done` or a flow-control suspension.
/// Re-invocation after `Done` performs no writes.
pub(crate) fn drive_preamble(ctx: &mut EnvelopeContext) -> EnvelopeResult<()> {
    loop {
        match state(ctx).preamble {
            EmitPreambleState::None => {
                // Configuration was frozen at commit; nothing left to
                // resolve here.
                state(ctx).preamble = EmitPreambleState::Header;
            }
            EmitPreambleState::Header => emit_header(ctx)?,
            EmitPreambleState::KeyInfo => emit_key_info(ctx)?,
            EmitPreambleState::EncrInfo => emit_encryption_info(ctx)?,
            EmitPreambleState::Done => return Ok(()),
        }
    }
}

/// Emit the outer content-type header. Written in one atomic append so a
/// suspended attempt can simply be retried.
fn emit_header(ctx: &mut EnvelopeContext) -> EnvelopeResult<()> {
    let content_type = content_type_for(ctx);
    let mut out = Vec::new();
    let mut opened = 0usize;

    codec::write_header(&mut out, constants::ASN1_SEQUENCE_TAG, Length::Indefinite);
    codec::write_oid(&mut out, content_type.oid());
    codec::write_header(&mut out, constants::ASN1_CONTEXT_0_TAG, Length::Indefinite);
    opened += 2;

    match ctx.usage {
        Usage::None => {
            codec::write_header(
                &mut out,
                constants::ASN1_OCTET_STRING_CONSTRUCTED_TAG,
                Length::Indefinite,
            );
            opened += 1;
        }
        Usage::Sign => {
            codec::write_header(&mut out, constants::ASN1_SEQUENCE_TAG, Length::Indefinite);
            out.extend_from_slice(constants::CMS_VERSION_1);
            opened += 1;
            // digestAlgorithms: definite SET, sizes are known up front.
            let mut algorithms = Vec::new();
            for _ in ctx.actions.of_kind(ActionKind::Hash) {
                codec::write_algorithm_identifier(&mut algorithms, constants::OID_SHA256);
            }
            codec::write_header(
                &mut out,
                constants::ASN1_SET_TAG,
                Length::Definite(algorithms.len()),
            );
            out.extend_from_slice(&algorithms);
            // encapContentInfo.
            codec::write_header(&mut out, constants::ASN1_SEQUENCE_TAG, Length::Indefinite);
            codec::write_oid(&mut out, constants::OID_DATA);
            if ctx.options.detached_signature {
                // Detached: the content stays external, close immediately.
                codec::write_end_of_contents(&mut out);
            } else {
                codec::write_header(&mut out, constants::ASN1_CONTEXT_0_TAG, Length::Indefinite);
                codec::write_header(
                    &mut out,
                    constants::ASN1_OCTET_STRING_CONSTRUCTED_TAG,
                    Length::Indefinite,
                );
                opened += 3;
            }
        }
        Usage::Hash => {
            codec::write_header(&mut out, constants::ASN1_SEQUENCE_TAG, Length::Indefinite);
            out.extend_from_slice(constants::CMS_VERSION_0);
            codec::write_algorithm_identifier(&mut out, constants::OID_SHA256);
            codec::write_header(&mut out, constants::ASN1_SEQUENCE_TAG, Length::Indefinite);
            codec::write_oid(&mut out, constants::OID_DATA);
            codec::write_header(&mut out, constants::ASN1_CONTEXT_0_TAG, Length::Indefinite);
            codec::write_header(
                &mut out,
                constants::ASN1_OCTET_STRING_CONSTRUCTED_TAG,
                Length::Indefinite,
            );
            opened += 4;
        }
        Usage::Encrypt => {
            codec::write_header(&mut out, constants::ASN1_SEQUENCE_TAG, Length::Indefinite);
            out.extend_from_slice(constants::CMS_VERSION_0);
            opened += 1;
        }
    }

    ctx.buffer.push_all(&out)?;
    log::debug!("emitted {content_type} header, {} bytes", out.len());
    let usage = ctx.usage;
    let has_recipients = !ctx.pre_actions.is_empty();
    let st = state(ctx);
    st.indef_depth += opened;
    st.preamble = match usage {
        Usage::Encrypt if has_recipients => EmitPreambleState::KeyInfo,
        Usage::Encrypt => EmitPreambleState::EncrInfo,
        _ => EmitPreambleState::Done,
    };
    if st.preamble == EmitPreambleState::Done {
        ctx.segment_complete = true;
    }
    ctx.segment_data_end = ctx.buffer.write_pos();
    Ok(())
}

/// Emit one RecipientInfo per key-exchange action, resuming mid-list from
/// the first unexported action after a suspension.
fn emit_key_info(ctx: &mut EnvelopeContext) -> EnvelopeResult<()> {
    // A previous suspension may have left a partially drained blob.
    if !ctx.aux.is_empty() {
        let done = ctx.aux.drain_into(&mut ctx.buffer);
        ctx.segment_data_end = ctx.buffer.write_pos();
        if !done {
            return Err(EnvelopeError::Overflow);
        }
    }
    if !state(ctx).set_open {
        ctx.buffer.push_all(&[
            constants::ASN1_SET_TAG,
            constants::BER_INDEFINITE_LENGTH,
        ])?;
        state(ctx).set_open = true;
        ctx.segment_data_end = ctx.buffer.write_pos();
    }

    let exchanges: Vec<ActionId> = ctx.pre_actions.ids().collect();
    while state(ctx).key_info_pos < exchanges.len() {
        let id = exchanges[state(ctx).key_info_pos];
        let blob = build_recipient_info(ctx, id)?;
        {
            let action = ctx.pre_actions.get_mut(id);
            action.encoded_size = SizeHint::Known(blob.len() as u64);
            action.emitted = true;
        }
        ctx.aux.stage(&blob);
        state(ctx).key_info_pos += 1;
        let done = ctx.aux.drain_into(&mut ctx.buffer);
        ctx.segment_data_end = ctx.buffer.write_pos();
        if !done {
            return Err(EnvelopeError::Overflow);
        }
        log::debug!("emitted recipient info {id}, {} bytes", blob.len());
    }

    let mut eoc = Vec::new();
    codec::write_end_of_contents(&mut eoc);
    ctx.buffer.push_all(&eoc)?;
    ctx.segment_data_end = ctx.buffer.write_pos();
    let st = state(ctx);
    st.set_open = false;
    st.preamble = EmitPreambleState::EncrInfo;
    Ok(())
}

/// RecipientInfo: version, key id, key-encryption algorithm, wrapped key.
fn build_recipient_info(ctx: &EnvelopeContext, id: ActionId) -> EnvelopeResult<Vec<u8>> {
    let exchange = ctx.pre_actions.get(id);
    let session_id = exchange.associated.ok_or_else(|| {
        EnvelopeError::Orphan(format!("{id} has no associated session-key action"))
    })?;
    let mut raw_key = ctx.actions.get(session_id).handle.borrow().export_key()?;
    let kek = exchange.handle.borrow();
    let wrapped = kek.wrap_key(&raw_key);
    raw_key.zeroize();
    let wrapped = wrapped?;

    let mut body = Vec::new();
    body.extend_from_slice(constants::CMS_VERSION_0);
    codec::write_octet_string(&mut body, kek.key_id());
    codec::write_algorithm_identifier(&mut body, kek.algorithm().oid());
    codec::write_octet_string(&mut body, &wrapped);

    let mut blob = Vec::new();
    codec::write_header(
        &mut blob,
        constants::ASN1_SEQUENCE_TAG,
        Length::Definite(body.len()),
    );
    blob.extend_from_slice(&body);
    Ok(blob)
}

/// Emit the EncryptedContentInfo header and open the encrypted-content
/// container.
fn emit_encryption_info(ctx: &mut EnvelopeContext) -> EnvelopeResult<()> {
    let session_id = ctx
        .actions
        .find(ActionKind::Encrypt)
        .ok_or_else(|| EnvelopeError::Orphan("no session-key action at EncrInfo".to_string()))?;
    let (algorithm_oid, iv) = {
        let session = ctx.actions.get(session_id).handle.borrow();
        (session.algorithm().oid(), session.base_iv()?)
    };

    let mut out = Vec::new();
    codec::write_header(&mut out, constants::ASN1_SEQUENCE_TAG, Length::Indefinite);
    codec::write_oid(&mut out, constants::OID_DATA);
    codec::write_algorithm_identifier_iv(&mut out, algorithm_oid, &iv);
    codec::write_header(&mut out, constants::ASN1_CONTEXT_0_TAG, Length::Indefinite);
    ctx.buffer.push_all(&out)?;

    let st = state(ctx);
    st.indef_depth += 2;
    st.preamble = EmitPreambleState::Done;
    ctx.segment_complete = true;
    ctx.segment_data_end = ctx.buffer.write_pos();
    log::debug!("emitted encrypted-content info, {} bytes", out.len());
    Ok(())
}

/// Transform and emit the staged payload segment. Returns false (leaving
/// the stage untouched) when the buffer cannot hold the wire segment yet.
pub(crate) fn flush_segment(ctx: &mut EnvelopeContext) -> EnvelopeResult<bool> {
    if ctx.segment_stage.is_empty() {
        return Ok(true);
    }
    if state(ctx).preamble != EmitPreambleState::Done {
        return Ok(false);
    }

    // Hashing sees plaintext regardless of what goes on the wire.
    for id in ctx.actions.of_kind(ActionKind::Hash) {
        ctx.actions
            .get(id)
            .handle
            .borrow_mut()
            .update(&ctx.segment_stage)?;
    }

    if ctx.options.detached_signature {
        ctx.segment_stage.zeroize();
        ctx.segment_stage.clear();
        ctx.segment_complete = true;
        return Ok(true);
    }

    let wire = if ctx.usage == Usage::Encrypt {
        let session_id = ctx
            .actions
            .find(ActionKind::Encrypt)
            .ok_or_else(|| EnvelopeError::Orphan("no session-key action".to_string()))?;
        ctx.actions
            .get(session_id)
            .handle
            .borrow_mut()
            .seal_segment(&ctx.segment_stage)?
    } else {
        ctx.segment_stage.clone()
    };

    let mut blob = Vec::new();
    codec::write_octet_string(&mut blob, &wire);
    if blob.len() > ctx.buffer.free_space() {
        return Ok(false);
    }
    ctx.buffer.push_all(&blob)?;
    ctx.segment_stage.zeroize();
    ctx.segment_stage.clear();
    ctx.segment_complete = true;
    ctx.segment_data_end = ctx.buffer.write_pos();
    Ok(true)
}

/// Drive the postamble until `Done` or a flow-control suspension. The pop
/// boundary only advances once `Done` is reached, so a partially written
/// trailer is never exposed as final output.
pub(crate) fn drive_postamble(ctx: &mut EnvelopeContext) -> EnvelopeResult<()> {
    loop {
        match state(ctx).postamble {
            EmitPostambleState::None => {
                let st = state(ctx);
                if st.preamble != EmitPreambleState::Done || !st.payload_ended {
                    return Ok(());
                }
                st.postamble = EmitPostambleState::Header;
            }
            EmitPostambleState::Header => emit_trailer_header(ctx)?,
            EmitPostambleState::Signature => emit_signatures(ctx)?,
            EmitPostambleState::Eoc => emit_remaining_eoc(ctx)?,
            EmitPostambleState::Done => return Ok(()),
        }
    }
}

/// Close the payload container and, for signed content, open the SET of
/// SignerInfo (emitting any attached certificates first).
fn emit_trailer_header(ctx: &mut EnvelopeContext) -> EnvelopeResult<()> {
    let mut out = Vec::new();
    let mut closed = 0usize;
    let mut opened = 0usize;
    match ctx.usage {
        Usage::None | Usage::Encrypt => {
            // Close the segment run (plain) or encrypted-content holder.
            codec::write_end_of_contents(&mut out);
            closed += 1;
        }
        Usage::Sign => {
            if !ctx.options.detached_signature {
                // Close octet run, inner [0], inner ContentInfo.
                for _ in 0..3 {
                    codec::write_end_of_contents(&mut out);
                }
                closed += 3;
            }
            if !ctx.attached_certs.is_empty() {
                codec::write_header(&mut out, constants::ASN1_CONTEXT_0_TAG, Length::Indefinite);
                for cert in &ctx.attached_certs {
                    codec::write_octet_string(&mut out, cert);
                }
                codec::write_end_of_contents(&mut out);
            }
            codec::write_header(&mut out, constants::ASN1_SET_TAG, Length::Indefinite);
            opened += 1;
        }
        Usage::Hash => {
            for _ in 0..3 {
                codec::write_end_of_contents(&mut out);
            }
            closed += 3;
        }
    }
    ctx.buffer.push_all(&out)?;
    let usage = ctx.usage;
    let st = state(ctx);
    st.indef_depth += opened;
    st.indef_depth -= closed;
    st.postamble = match usage {
        Usage::Sign | Usage::Hash => EmitPostambleState::Signature,
        _ => EmitPostambleState::Eoc,
    };
    Ok(())
}

/// Emit one SignerInfo per sign action (or the digest value for hash
/// usage), resumable exactly as in KeyInfo.
fn emit_signatures(ctx: &mut EnvelopeContext) -> EnvelopeResult<()> {
    if !ctx.aux.is_empty() && !ctx.aux.drain_into(&mut ctx.buffer) {
        return Err(EnvelopeError::Overflow);
    }

    match ctx.usage {
        Usage::Sign => {
            let signers: Vec<ActionId> = ctx.post_actions.of_kind(ActionKind::Sign);
            while state(ctx).signature_pos < signers.len() {
                let id = signers[state(ctx).signature_pos];
                let blob = build_signer_info(ctx, id)?;
                {
                    let action = ctx.post_actions.get_mut(id);
                    action.encoded_size = SizeHint::Known(blob.len() as u64);
                    action.emitted = true;
                }
                ctx.aux.stage(&blob);
                state(ctx).signature_pos += 1;
                if !ctx.aux.drain_into(&mut ctx.buffer) {
                    return Err(EnvelopeError::Overflow);
                }
                log::debug!("emitted signer info {id}, {} bytes", blob.len());
            }
            // Close the SET of SignerInfo.
            let mut eoc = Vec::new();
            codec::write_end_of_contents(&mut eoc);
            ctx.buffer.push_all(&eoc)?;
            state(ctx).indef_depth -= 1;
        }
        Usage::Hash => {
            if state(ctx).signature_pos == 0 {
                let hash_id = ctx.actions.find(ActionKind::Hash).ok_or_else(|| {
                    EnvelopeError::Orphan("no hash action at digest emission".to_string())
                })?;
                let digest = ctx
                    .actions
                    .get(hash_id)
                    .handle
                    .borrow_mut()
                    .finalize_digest()?;
                let mut blob = Vec::new();
                codec::write_octet_string(&mut blob, &digest);
                ctx.aux.stage(&blob);
                state(ctx).signature_pos = 1;
                if !ctx.aux.drain_into(&mut ctx.buffer) {
                    return Err(EnvelopeError::Overflow);
                }
            }
        }
        _ => {}
    }
    state(ctx).postamble = EmitPostambleState::Eoc;
    Ok(())
}

/// SignerInfo: version, signer key id, digest algorithm, signature
/// algorithm, signature value. Requires the associated hash action to have
/// been finalized.
fn build_signer_info(ctx: &EnvelopeContext, id: ActionId) -> EnvelopeResult<Vec<u8>> {
    let signer = ctx.post_actions.get(id);
    let hash_id = signer
        .associated
        .ok_or_else(|| EnvelopeError::Orphan(format!("{id} has no associated hash action")))?;
    let digest = ctx
        .actions
        .get(hash_id)
        .handle
        .borrow_mut()
        .finalize_digest()?;
    let mut handle = signer.handle.borrow_mut();
    let signature = handle.sign(&digest)?;

    let mut body = Vec::new();
    body.extend_from_slice(constants::CMS_VERSION_1);
    codec::write_octet_string(&mut body, handle.key_id());
    codec::write_algorithm_identifier(&mut body, constants::OID_SHA256);
    codec::write_algorithm_identifier(&mut body, handle.algorithm().oid());
    codec::write_octet_string(&mut body, &signature);

    let mut blob = Vec::new();
    codec::write_header(
        &mut blob,
        constants::ASN1_SEQUENCE_TAG,
        Length::Definite(body.len()),
    );
    blob.extend_from_slice(&body);
    Ok(blob)
}

/// Emit one end-of-contents pair per indefinite-length nesting level still
/// open, then advance the pop boundary over the finished trailer.
fn emit_remaining_eoc(ctx: &mut EnvelopeContext) -> EnvelopeResult<()> {
    let depth = state(ctx).indef_depth;
    let mut out = Vec::new();
    for _ in 0..depth {
        codec::write_end_of_contents(&mut out);
    }
    ctx.buffer.push_all(&out)?;
    let st = state(ctx);
    st.indef_depth = 0;
    st.postamble = EmitPostambleState::Done;
    ctx.segment_data_end = ctx.buffer.write_pos();
    log::debug!("envelope trailer complete, {depth} levels closed");
    Ok(())
}
