//! Streaming behavior: chunked input, bounded buffers and resumability.

use proptest::prelude::*;

use cms_envelope::crypto::software::{Ed25519SignContext, KekContext};
use cms_envelope::{
    deenvelope_data, envelope_data, handle, ActionKind, EnvelopeContext, EnvelopeError,
    EnvelopeOptions, Usage,
};

fn drain(ctx: &mut EnvelopeContext, out: &mut Vec<u8>, max: usize) {
    loop {
        match ctx.pop(max) {
            Ok(chunk) if chunk.is_empty() => break,
            Ok(chunk) => out.extend_from_slice(&chunk),
            Err(err) if err.is_flow_control() => break,
            Err(err) => panic!("unexpected error while draining: {err}"),
        }
    }
}

fn patterned_payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[test]
fn parse_one_byte_at_a_time() {
    let signer = Ed25519SignContext::from_seed(&[11u8; 32]).unwrap();
    let payload = patterned_payload(10_000);
    let mut ctx =
        EnvelopeContext::new_enveloping(Usage::Sign, EnvelopeOptions::default()).unwrap();
    ctx.add_action(ActionKind::Sign, handle(signer)).unwrap();
    let wire = envelope_data(&mut ctx, &payload).unwrap();

    let mut ctx = EnvelopeContext::new_deenveloping(EnvelopeOptions::default()).unwrap();
    let mut recovered = Vec::new();
    for byte in &wire {
        loop {
            match ctx.push(std::slice::from_ref(byte)) {
                Ok(1) => break,
                Ok(_) => unreachable!("single byte partially consumed"),
                Err(err) if err.is_flow_control() => drain(&mut ctx, &mut recovered, 512),
                Err(err) => panic!("parse failed mid-stream: {err}"),
            }
        }
        drain(&mut ctx, &mut recovered, 512);
    }
    drain(&mut ctx, &mut recovered, 512);
    assert!(ctx.is_complete());
    assert_eq!(recovered, payload);
}

#[test]
fn emit_with_tiny_buffer_and_small_pops() {
    // A buffer barely larger than one segment forces repeated suspension in
    // every emission state.
    let options = EnvelopeOptions {
        segment_size: 256,
        buffer_limit: 512,
        ..EnvelopeOptions::default()
    };
    let payload = patterned_payload(5_000);
    let signer = Ed25519SignContext::from_seed(&[12u8; 32]).unwrap();
    let mut ctx = EnvelopeContext::new_enveloping(Usage::Sign, options).unwrap();
    ctx.add_action(ActionKind::Sign, handle(signer)).unwrap();

    let mut wire = Vec::new();
    let mut offset = 0;
    while !ctx.is_complete() {
        let result = if offset < payload.len() {
            ctx.push(&payload[offset..])
        } else {
            ctx.push(&[])
        };
        match result {
            Ok(taken) => offset += taken,
            Err(err) if err.is_flow_control() => {}
            Err(err) => panic!("emit failed: {err}"),
        }
        drain(&mut ctx, &mut wire, 7);
    }
    assert_eq!(offset, payload.len());

    let mut ctx = EnvelopeContext::new_deenveloping(EnvelopeOptions::default()).unwrap();
    let recovered = deenvelope_data(&mut ctx, &wire, |_| Ok(None)).unwrap();
    assert_eq!(recovered, payload);
}

#[test]
fn parse_backpressure_until_popped() {
    // Without pops the parser must stop recovering payload once the limit is
    // reached, then resume exactly where it stopped.
    let options = EnvelopeOptions {
        segment_size: 256,
        buffer_limit: 1024,
        ..EnvelopeOptions::default()
    };
    let payload = patterned_payload(8_000);
    let mut ctx = EnvelopeContext::new_enveloping(Usage::None, options.clone()).unwrap();
    let wire = envelope_data(&mut ctx, &payload).unwrap();

    let mut ctx = EnvelopeContext::new_deenveloping(options).unwrap();
    let mut offset = 0;
    let mut recovered = Vec::new();
    let mut stalled = false;
    while !ctx.is_complete() {
        if offset < wire.len() {
            match ctx.push(&wire[offset..]) {
                Ok(taken) => {
                    if taken == 0 {
                        stalled = true;
                    }
                    offset += taken;
                }
                Err(err) if err.is_flow_control() => stalled = true,
                Err(err) => panic!("parse failed: {err}"),
            }
        }
        if stalled || offset >= wire.len() {
            drain(&mut ctx, &mut recovered, 512);
            stalled = false;
        }
    }
    assert_eq!(recovered, payload);
}

#[test]
fn truncated_trailer_reports_soft_underflow_with_payload_available() {
    let signer = Ed25519SignContext::from_seed(&[13u8; 32]).unwrap();
    let payload = patterned_payload(2_000);
    let mut ctx =
        EnvelopeContext::new_enveloping(Usage::Sign, EnvelopeOptions::default()).unwrap();
    ctx.add_action(ActionKind::Sign, handle(signer)).unwrap();
    let wire = envelope_data(&mut ctx, &payload).unwrap();

    // Everything but the last 20 bytes: the payload is complete, the trailer
    // breaks off inside the SignerInfo.
    let cut = wire.len() - 20;
    let mut ctx = EnvelopeContext::new_deenveloping(EnvelopeOptions::default()).unwrap();
    let mut offset = 0;
    while offset < cut {
        offset += ctx.push(&wire[offset..cut]).unwrap();
    }
    let err = ctx.push(&[]).unwrap_err();
    assert!(matches!(err, EnvelopeError::SoftUnderflow));
    assert!(err.is_flow_control());
    assert!(!ctx.is_complete());

    // The recovered payload stays fully retrievable despite the stalled
    // trailer.
    let mut recovered = Vec::new();
    drain(&mut ctx, &mut recovered, 512);
    assert_eq!(recovered, payload);

    // Feeding the missing bytes finishes the trailer.
    ctx.push(&wire[cut..]).unwrap();
    assert!(ctx.is_complete());
    assert!(ctx.first_pending_resource().is_some());
}

#[test]
fn segment_larger_than_the_buffer_is_fatal() {
    // 4096-byte wire segments can never be buffered whole under a 1 KiB
    // limit; the parser must fail fast instead of waiting for input that
    // cannot help.
    let payload = patterned_payload(5_000);
    let mut ctx =
        EnvelopeContext::new_enveloping(Usage::None, EnvelopeOptions::default()).unwrap();
    let wire = envelope_data(&mut ctx, &payload).unwrap();

    let options = EnvelopeOptions {
        segment_size: 256,
        buffer_limit: 1024,
        ..EnvelopeOptions::default()
    };
    let mut ctx = EnvelopeContext::new_deenveloping(options).unwrap();
    let mut offset = 0;
    let err = loop {
        match ctx.push(&wire[offset..]) {
            Ok(taken) => offset += taken,
            Err(err) => break err,
        }
    };
    assert!(matches!(err, EnvelopeError::Nomem));
    assert!(err.is_fatal());
}

#[test]
fn resource_supplied_mid_stream() {
    // The pending entry appears while the wire is still arriving; supplying
    // the password mid-stream lets decryption continue seamlessly.
    let payload = patterned_payload(6_000);
    let mut ctx =
        EnvelopeContext::new_enveloping(Usage::Encrypt, EnvelopeOptions::default()).unwrap();
    let kek = KekContext::from_password(b"r1".to_vec(), b"pw").unwrap();
    ctx.add_action(ActionKind::KeyExchangeConventional, handle(kek))
        .unwrap();
    let wire = envelope_data(&mut ctx, &payload).unwrap();

    let mut ctx = EnvelopeContext::new_deenveloping(EnvelopeOptions::default()).unwrap();
    let mut recovered = Vec::new();
    let mut supplied = false;
    for chunk in wire.chunks(64) {
        let mut chunk = chunk;
        while !chunk.is_empty() {
            match ctx.push(chunk) {
                Ok(taken) => chunk = &chunk[taken..],
                Err(err) if err.is_flow_control() => {}
                Err(err) => panic!("parse failed: {err}"),
            }
            if !supplied {
                if let Some(id) = ctx.first_pending_resource() {
                    let key_id = ctx.entry(id).unwrap().key_id.clone();
                    ctx.supply_resource(
                        id,
                        handle(KekContext::from_password(key_id, b"pw").unwrap()),
                    )
                    .unwrap();
                    supplied = true;
                }
            }
            drain(&mut ctx, &mut recovered, 512);
        }
    }
    drain(&mut ctx, &mut recovered, 512);
    assert!(supplied);
    assert!(ctx.is_complete());
    assert_eq!(recovered, payload);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn chunking_is_invariant(
        payload_len in 0usize..6_000,
        chunk_size in 1usize..97,
    ) {
        let payload = patterned_payload(payload_len);
        let mut ctx =
            EnvelopeContext::new_enveloping(Usage::None, EnvelopeOptions::default()).unwrap();
        let wire = envelope_data(&mut ctx, &payload).unwrap();

        let mut ctx = EnvelopeContext::new_deenveloping(EnvelopeOptions::default()).unwrap();
        let mut recovered = Vec::new();
        for chunk in wire.chunks(chunk_size) {
            let mut chunk = chunk;
            while !chunk.is_empty() {
                match ctx.push(chunk) {
                    Ok(taken) => chunk = &chunk[taken..],
                    Err(err) if err.is_flow_control() => {}
                    Err(err) => panic!("parse failed: {err}"),
                }
                drain(&mut ctx, &mut recovered, 512);
            }
        }
        drain(&mut ctx, &mut recovered, 512);
        prop_assert!(ctx.is_complete());
        prop_assert_eq!(recovered, payload);
    }
}
