//! Streaming CMS/PKCS#7 Envelope Engine
//!
//! A resumable push/pop engine for CMS envelopes: SignedData, EnvelopedData,
//! EncryptedData, DigestedData and plain Data. Payloads stream through a
//! bounded buffer in segments, so envelopes of any size process in constant
//! memory; every operation suspends cleanly on underflow, overflow or a
//! missing key and resumes from the exact byte it stopped at.
//!
//! ```no_run
//! use cms_envelope::{envelope_data, EnvelopeContext, EnvelopeOptions, Usage};
//!
//! let mut ctx = EnvelopeContext::new_enveloping(Usage::None, EnvelopeOptions::default())?;
//! let wire = envelope_data(&mut ctx, b"hello")?;
//! # Ok::<(), cms_envelope::EnvelopeError>(())
//! ```

pub mod codec;
pub mod crypto;
pub mod domain;
pub mod engine;
pub mod infra;

pub use crypto::{handle, CryptoContext, CryptoHandle};
pub use domain::action::ActionKind;
pub use domain::content_list::{ContentListEntry, RequiredResource};
pub use domain::types::{
    ActionId, ContentType, CryptoAlgorithm, CryptoMode, EntryId, EnvelopeFormat, SizeHint, Usage,
};
pub use engine::envelope::{EnvelopeContext, EnvelopeOptions};
pub use infra::config::{ConfigManager, EnvelopeConfiguration};
pub use infra::error::{EnvelopeError, EnvelopeResult};

/// One-shot enveloping: push the whole payload through a configured context
/// and collect the wire output.
///
/// The context must already carry its actions; this helper only drives the
/// push/pop loop that a streaming caller would run by hand.
pub fn envelope_data(ctx: &mut EnvelopeContext, payload: &[u8]) -> EnvelopeResult<Vec<u8>> {
    let mut wire = Vec::new();
    let mut offset = 0;
    loop {
        let pushed = if offset < payload.len() {
            ctx.push(&payload[offset..])
        } else {
            // Empty push marks the end of the payload.
            ctx.push(&[])
        };
        match pushed {
            Ok(taken) => offset += taken,
            Err(err) if err.is_flow_control() => {}
            Err(err) => return Err(err),
        }
        loop {
            let chunk = ctx.pop(4096)?;
            if chunk.is_empty() {
                break;
            }
            wire.extend_from_slice(&chunk);
        }
        if ctx.is_complete() {
            return Ok(wire);
        }
    }
}

/// One-shot deenveloping: feed complete wire bytes through a context,
/// resolving resource requests through `resolve`, and collect the recovered
/// payload.
///
/// `resolve` is called once per pending content-list entry; returning
/// `Ok(None)` leaves the entry pending. When no progress can be made (input
/// exhausted, nothing popped, no resource supplied) the last flow-control
/// status is returned so the caller sees what the envelope is waiting for.
pub fn deenvelope_data<F>(
    ctx: &mut EnvelopeContext,
    wire: &[u8],
    mut resolve: F,
) -> EnvelopeResult<Vec<u8>>
where
    F: FnMut(&ContentListEntry) -> EnvelopeResult<Option<CryptoHandle>>,
{
    let mut payload = Vec::new();
    let mut offset = 0;
    loop {
        let mut progressed = false;
        let mut status = None;

        let pushed = ctx.push(&wire[offset..]);
        match pushed {
            Ok(taken) => {
                if taken > 0 {
                    progressed = true;
                }
                offset += taken;
            }
            Err(err) if err.is_flow_control() => status = Some(err),
            Err(err) => return Err(err),
        }

        loop {
            match ctx.pop(4096) {
                Ok(chunk) if chunk.is_empty() => break,
                Ok(chunk) => {
                    payload.extend_from_slice(&chunk);
                    progressed = true;
                }
                Err(err) if err.is_flow_control() => {
                    status = Some(err);
                    break;
                }
                Err(err) => return Err(err),
            }
        }

        let mut pending = ctx.first_pending_resource();
        while let Some(id) = pending {
            let supplied = resolve(ctx.entry(id)?)?;
            if let Some(resource) = supplied {
                ctx.supply_resource(id, resource)?;
                progressed = true;
            }
            pending = ctx.next_pending_resource(id);
        }

        if ctx.is_complete() {
            return Ok(payload);
        }
        if !progressed {
            return Err(status.unwrap_or(EnvelopeError::Underflow));
        }
    }
}
