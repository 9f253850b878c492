//! Content-list behavior: pending-resource discovery, wrong-key recovery and
//! resource validation.

use cms_envelope::crypto::software::{
    Ed25519SignContext, KekContext, SessionKeyContext, Sha256Context,
};
use cms_envelope::{
    envelope_data, handle, ActionKind, CryptoContext, EnvelopeContext, EnvelopeError,
    EnvelopeOptions, RequiredResource, Usage,
};

const PAYLOAD: &[u8] = b"material protected by the envelope";

fn sealed_with_password(password: &[u8]) -> Vec<u8> {
    let mut ctx =
        EnvelopeContext::new_enveloping(Usage::Encrypt, EnvelopeOptions::default()).unwrap();
    let kek = KekContext::from_password(b"alice".to_vec(), password).unwrap();
    ctx.add_action(ActionKind::KeyExchangeConventional, handle(kek))
        .unwrap();
    envelope_data(&mut ctx, PAYLOAD).unwrap()
}

fn pop_all(ctx: &mut EnvelopeContext) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        match ctx.pop(512) {
            Ok(chunk) if chunk.is_empty() => break,
            Ok(chunk) => out.extend_from_slice(&chunk),
            Err(err) if err.is_flow_control() => break,
            Err(err) => panic!("unexpected error: {err}"),
        }
    }
    out
}

#[test]
fn wrong_password_detected_lazily_and_recoverable() {
    let wire = sealed_with_password(b"right");
    let mut ctx = EnvelopeContext::new_deenveloping(EnvelopeOptions::default()).unwrap();
    ctx.push(&wire).unwrap();

    let id = ctx.first_pending_resource().expect("password entry");
    let key_id = ctx.entry(id).unwrap().key_id.clone();

    // Supplying a wrong password succeeds: the key is only checked on use.
    let wrong = KekContext::from_password(key_id.clone(), b"wrong").unwrap();
    ctx.supply_resource(id, handle(wrong)).unwrap();

    // The next drive attempt unwraps the session key and fails.
    let err = ctx.push(&[]).unwrap_err();
    assert!(matches!(err, EnvelopeError::WrongKey(_)));
    assert!(!err.is_fatal());

    // The entry is pending again; the right password completes the open.
    assert_eq!(ctx.first_pending_resource(), Some(id));
    let right = KekContext::from_password(key_id, b"right").unwrap();
    ctx.supply_resource(id, handle(right)).unwrap();
    ctx.push(&[]).unwrap();
    assert_eq!(pop_all(&mut ctx), PAYLOAD);
    assert!(ctx.is_complete());
}

#[test]
fn wrong_session_key_detected_on_first_segment() {
    let session = SessionKeyContext::generate().unwrap();
    let raw_key = session.export_key().unwrap();
    let mut ctx =
        EnvelopeContext::new_enveloping(Usage::Encrypt, EnvelopeOptions::default()).unwrap();
    ctx.add_action(ActionKind::Encrypt, handle(session)).unwrap();
    let wire = envelope_data(&mut ctx, PAYLOAD).unwrap();

    let mut ctx = EnvelopeContext::new_deenveloping(EnvelopeOptions::default()).unwrap();
    ctx.push(&wire).unwrap();
    let id = ctx.first_pending_resource().expect("session-key entry");
    let iv = ctx.entry(id).unwrap().iv.clone().unwrap();

    let other = SessionKeyContext::generate().unwrap();
    let wrong =
        SessionKeyContext::from_key_material(&other.export_key().unwrap(), &iv).unwrap();
    ctx.supply_resource(id, handle(wrong)).unwrap();
    let err = ctx.push(&[]).unwrap_err();
    assert!(matches!(err, EnvelopeError::WrongKey(_)));

    assert_eq!(ctx.first_pending_resource(), Some(id));
    let right = SessionKeyContext::from_key_material(&raw_key, &iv).unwrap();
    ctx.supply_resource(id, handle(right)).unwrap();
    ctx.push(&[]).unwrap();
    assert_eq!(pop_all(&mut ctx), PAYLOAD);
}

#[test]
fn missing_recipient_key_reported_consistently() {
    let wire = sealed_with_password(b"pw");
    let mut ctx = EnvelopeContext::new_deenveloping(EnvelopeOptions::default()).unwrap();
    ctx.push(&wire).unwrap();
    assert!(ctx.first_pending_resource().is_some());

    // Without supply_resource every subsequent call reports the same
    // pending-resource status; nothing degrades into Underflow or BadData.
    for _ in 0..3 {
        let err = ctx.push(&[]).unwrap_err();
        assert!(matches!(err, EnvelopeError::ResourceRequired(_)));
        assert!(err.is_flow_control());
        let err = ctx.pop(512).unwrap_err();
        assert!(matches!(err, EnvelopeError::ResourceRequired(_)));
    }
    assert!(!ctx.is_complete());
}

#[test]
fn any_recipient_can_open_a_multi_recipient_envelope() {
    let raw_kek = [0x21; 32];
    let mut ctx =
        EnvelopeContext::new_enveloping(Usage::Encrypt, EnvelopeOptions::default()).unwrap();
    ctx.add_action(
        ActionKind::KeyExchangeConventional,
        handle(KekContext::from_password(b"first".to_vec(), b"pw-one").unwrap()),
    )
    .unwrap();
    ctx.add_action(
        ActionKind::KeyExchangeConventional,
        handle(KekContext::from_key(b"second".to_vec(), &raw_kek).unwrap()),
    )
    .unwrap();
    let wire = envelope_data(&mut ctx, PAYLOAD).unwrap();

    // Open with only the second recipient's key.
    let mut ctx = EnvelopeContext::new_deenveloping(EnvelopeOptions::default()).unwrap();
    ctx.push(&wire).unwrap();

    let first = ctx.first_pending_resource().expect("two entries pending");
    let second = ctx.next_pending_resource(first).expect("second entry");
    assert_eq!(
        ctx.entry(first).unwrap().required,
        RequiredResource::Password
    );
    assert_eq!(
        ctx.entry(second).unwrap().required,
        RequiredResource::ConventionalKey
    );
    assert_eq!(ctx.entry(second).unwrap().key_id, b"second");

    let kek = KekContext::from_key(b"second".to_vec(), &raw_kek).unwrap();
    ctx.supply_resource(second, handle(kek)).unwrap();
    ctx.push(&[]).unwrap();
    assert_eq!(pop_all(&mut ctx), PAYLOAD);
    assert!(ctx.is_complete());
    // The other recipient's entry simply stays pending.
    assert_eq!(ctx.first_pending_resource(), Some(first));
}

#[test]
fn mismatched_resource_kind_rejected_up_front() {
    let wire = sealed_with_password(b"pw");
    let mut ctx = EnvelopeContext::new_deenveloping(EnvelopeOptions::default()).unwrap();
    ctx.push(&wire).unwrap();

    let id = ctx.first_pending_resource().unwrap();
    let err = ctx
        .supply_resource(id, handle(Sha256Context::new()))
        .unwrap_err();
    assert!(matches!(err, EnvelopeError::ResourceMismatch(_)));
    // Still pending: nothing was attached.
    assert_eq!(ctx.first_pending_resource(), Some(id));
}

#[test]
fn wrong_verification_key_recoverable() {
    let signer = Ed25519SignContext::from_seed(&[5u8; 32]).unwrap();
    let verifier = signer.verifier();
    let mut ctx =
        EnvelopeContext::new_enveloping(Usage::Sign, EnvelopeOptions::default()).unwrap();
    ctx.add_action(ActionKind::Sign, handle(signer)).unwrap();
    let wire = envelope_data(&mut ctx, PAYLOAD).unwrap();

    let mut ctx = EnvelopeContext::new_deenveloping(EnvelopeOptions::default()).unwrap();
    ctx.push(&wire).unwrap();
    pop_all(&mut ctx);

    let id = ctx.first_pending_resource().expect("signer entry");
    let stranger = Ed25519SignContext::from_seed(&[6u8; 32]).unwrap().verifier();
    let err = ctx.supply_resource(id, handle(stranger)).unwrap_err();
    assert!(matches!(err, EnvelopeError::WrongKey(_)));

    // Retry with the right key.
    assert_eq!(ctx.first_pending_resource(), Some(id));
    ctx.supply_resource(id, handle(verifier)).unwrap();
    assert!(ctx.first_pending_resource().is_none());
}

#[test]
fn signer_key_id_matches_the_wire_entry() {
    let signer = Ed25519SignContext::from_seed(&[8u8; 32]).unwrap();
    let expected_key_id = signer.key_id().to_vec();
    let mut ctx =
        EnvelopeContext::new_enveloping(Usage::Sign, EnvelopeOptions::default()).unwrap();
    ctx.add_action(ActionKind::Sign, handle(signer)).unwrap();
    let wire = envelope_data(&mut ctx, PAYLOAD).unwrap();

    let mut ctx = EnvelopeContext::new_deenveloping(EnvelopeOptions::default()).unwrap();
    ctx.push(&wire).unwrap();
    pop_all(&mut ctx);
    let id = ctx.first_pending_resource().unwrap();
    assert_eq!(ctx.entry(id).unwrap().key_id, expected_key_id);
}

#[test]
fn orphan_signer_configuration_rejected() {
    // Sign usage with no sign action can never produce a valid envelope.
    let mut ctx =
        EnvelopeContext::new_enveloping(Usage::Sign, EnvelopeOptions::default()).unwrap();
    let err = ctx.push(PAYLOAD).unwrap_err();
    assert!(matches!(err, EnvelopeError::Orphan(_)));
    assert!(err.is_fatal());
}
