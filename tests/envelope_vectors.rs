//! Cross-language protocol vectors and envelope invariants.
//!
//! The golden values here are shared with other UAM implementations:
//! canonical JSON byte images are pinned as exact bytes, identity vectors
//! derive from the fixed seed `000102...1f`, and Ed25519 determinism pins
//! the signature bytes themselves.

use serde_json::json;

use uam::{
    canonicalize, create_envelope, decrypt_box, verify_envelope, EnvelopeOptions, Keypair,
    MessageEnvelope, MessageType, UamError, MAX_ENVELOPE_SIZE,
};

fn fixed_seed_keypair() -> Keypair {
    let mut seed = [0u8; 32];
    for (i, b) in seed.iter_mut().enumerate() {
        *b = i as u8;
    }
    Keypair::from_seed(&seed)
}

#[test]
fn canonical_bytes_for_simple_object() {
    let canon = canonicalize(&json!({"b": 2, "a": 1, "signature": "x"})).unwrap();
    assert_eq!(canon, br#"{"a":1,"b":2}"#.to_vec());
}

#[test]
fn canonicalization_is_order_and_null_insensitive() {
    let shuffled = canonicalize(&json!({
        "payload": "cGF5bG9hZA",
        "from": "alice::x.y",
        "to": "bob::x.y",
        "thread_id": null,
    }))
    .unwrap();
    let ordered = canonicalize(&json!({
        "from": "alice::x.y",
        "to": "bob::x.y",
        "payload": "cGF5bG9hZA",
    }))
    .unwrap();
    assert_eq!(shuffled, ordered);
}

#[test]
fn fixed_seed_fingerprint_vector() {
    let kp = fixed_seed_keypair();
    assert_eq!(
        kp.fingerprint(),
        "56475aa75463474c0285df5dbf2bcab73da651358839e9b77481b2eab107708c"
    );
}

#[test]
fn fixed_seed_signature_vector() {
    let kp = fixed_seed_keypair();
    let canon = canonicalize(&json!({"b": 2, "a": 1})).unwrap();
    assert_eq!(
        kp.sign(&canon),
        "tyCxuVUlb4K_qkfx0Oezd20JsD5w1ZaVe8wM0LJnA-GV7kH6gzjV6j3Wb6NEfl1tsyQA1GRESM6w_RNgwaUfCw"
    );
}

#[test]
fn envelope_verifies_and_decrypts_end_to_end() {
    let alice = Keypair::generate();
    let bob = Keypair::generate();

    let envelope = create_envelope(
        "alice::x.y",
        "bob::x.y",
        MessageType::Message,
        b"round trip",
        &alice,
        &bob.verifying_key(),
        EnvelopeOptions::default(),
    )
    .unwrap();

    verify_envelope(&envelope, &alice.verifying_key()).unwrap();
    assert_eq!(
        decrypt_box(&envelope.payload, &bob, &alice.verifying_key()).unwrap(),
        b"round trip"
    );

    let wire = envelope.to_wire();
    let size = serde_json::to_vec(&wire).unwrap().len();
    assert!(size <= MAX_ENVELOPE_SIZE);

    let restored = MessageEnvelope::from_wire(&wire).unwrap();
    assert_eq!(restored, envelope);
}

#[test]
fn tampered_payload_fails_signature_check() {
    let alice = Keypair::generate();
    let bob = Keypair::generate();

    let mut envelope = create_envelope(
        "alice::x.y",
        "bob::x.y",
        MessageType::Message,
        b"authentic",
        &alice,
        &bob.verifying_key(),
        EnvelopeOptions::default(),
    )
    .unwrap();
    envelope.payload = "tampered".into();

    assert!(matches!(
        verify_envelope(&envelope, &alice.verifying_key()),
        Err(UamError::SignatureVerification)
    ));
}

#[test]
fn wrong_sender_key_fails_signature_check() {
    let alice = Keypair::generate();
    let bob = Keypair::generate();
    let eve = Keypair::generate();

    let envelope = create_envelope(
        "alice::x.y",
        "bob::x.y",
        MessageType::Message,
        b"authentic",
        &alice,
        &bob.verifying_key(),
        EnvelopeOptions::default(),
    )
    .unwrap();

    assert!(verify_envelope(&envelope, &eve.verifying_key()).is_err());
}

#[test]
fn wire_size_cap_enforced_near_boundary() {
    let alice = Keypair::generate();
    let bob = Keypair::generate();

    // Well under the cap: fine
    let small = create_envelope(
        "alice::x.y",
        "bob::x.y",
        MessageType::Message,
        &vec![b'x'; 1024],
        &alice,
        &bob.verifying_key(),
        EnvelopeOptions::default(),
    );
    assert!(small.is_ok());

    // Base64 expansion plus envelope overhead pushes 64 KiB of plaintext
    // past the wire cap
    let too_big = create_envelope(
        "alice::x.y",
        "bob::x.y",
        MessageType::Message,
        &vec![b'x'; MAX_ENVELOPE_SIZE],
        &alice,
        &bob.verifying_key(),
        EnvelopeOptions::default(),
    );
    assert!(matches!(too_big, Err(UamError::EnvelopeTooLarge { .. })));
}

#[test]
fn handshake_request_opens_without_sender_key() {
    let alice = Keypair::generate();
    let bob = Keypair::generate();

    let envelope = create_envelope(
        "alice::x.y",
        "bob::x.y",
        MessageType::HandshakeRequest,
        b"contact card bytes",
        &alice,
        &bob.verifying_key(),
        EnvelopeOptions::default(),
    )
    .unwrap();

    // SealedBox: bob alone can open it, no sender key required
    assert_eq!(
        uam::decrypt_sealed(&envelope.payload, &bob).unwrap(),
        b"contact card bytes"
    );
    // The outer signature still authenticates alice
    verify_envelope(&envelope, &alice.verifying_key()).unwrap();
}
