//! # Cryptographic Primitives
//!
//! This module wraps the crate's crypto stack for everything UAM signs and
//! encrypts:
//!
//! - **Identity**: Ed25519 keypairs derived from a 32-byte seed
//! - **Signatures**: Ed25519 over a canonical JSON byte image
//! - **Payload encryption**: NaCl Box (authenticated, both parties known)
//!   and SealedBox (anonymous sender) over Curve25519 keys derived from the
//!   Ed25519 identity keys
//! - **Fingerprints**: SHA-256 of the 32 verify-key bytes
//!
//! ## Canonical JSON
//!
//! [`canonicalize`] produces the signature input: the `signature` key and
//! null-valued entries are dropped at the top level, object keys are sorted
//! recursively, output is compact, and all non-ASCII is `\uXXXX`-escaped.
//! The byte output is cross-language stable; test vectors are pinned as hex.
//!
//! ## Key conversion
//!
//! Box/SealedBox operate on Curve25519 keys. The conversions here match
//! libsodium's `crypto_sign_ed25519_sk_to_curve25519` (clamped SHA-512
//! prefix of the seed) and `crypto_sign_ed25519_pk_to_curve25519`
//! (birational map to Montgomery form), so ciphertexts interoperate with
//! any libsodium-based peer.

use std::collections::BTreeMap;

use base64::alphabet;
use base64::engine::{DecodePaddingMode, Engine, GeneralPurpose, GeneralPurposeConfig};
use crypto_box::aead::Aead;
use crypto_box::SalsaBox;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{Result, UamError};

/// Length of a NaCl Box nonce.
pub const NONCE_LEN: usize = 24;

/// URL-safe base64, unpadded on encode, padding-indifferent on decode.
const B64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// URL-safe base64 encode, padding stripped.
pub fn b64_encode(data: &[u8]) -> String {
    B64.encode(data)
}

/// URL-safe base64 decode, tolerating missing padding.
pub fn b64_decode(s: &str) -> Result<Vec<u8>> {
    B64.decode(s.trim_end_matches('='))
        .map_err(|e| UamError::Encryption(format!("invalid base64: {e}")))
}

// ============================================================================
// Keypair
// ============================================================================

/// An agent's Ed25519 identity keypair.
///
/// Only the 32-byte seed is ever persisted; the signing and verify keys are
/// re-derived deterministically. The verify key doubles as the agent's
/// public identity, fingerprinted via SHA-256.
#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    /// Generate a fresh keypair from the OS CSPRNG.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Rebuild a keypair from its 32-byte seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// Rebuild a keypair from a base64-encoded seed.
    pub fn from_seed_b64(s: &str) -> Result<Self> {
        let bytes = b64_decode(s)?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| UamError::KeyStore("seed must be exactly 32 bytes".into()))?;
        Ok(Self::from_seed(&seed))
    }

    /// The 32-byte seed (the only persisted form).
    pub fn seed(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// The seed as URL-safe base64.
    pub fn seed_b64(&self) -> String {
        b64_encode(&self.seed())
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// The verify key as URL-safe base64 (the wire form of the public key).
    pub fn public_key_b64(&self) -> String {
        b64_encode(self.signing_key.verifying_key().as_bytes())
    }

    /// SHA-256 hex fingerprint of the verify key.
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.signing_key.verifying_key())
    }

    /// Sign raw bytes, returning the 64-byte signature as base64.
    pub fn sign(&self, data: &[u8]) -> String {
        b64_encode(&self.signing_key.sign(data).to_bytes())
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

/// Decode a base64 verify key into a checked Ed25519 point.
pub fn deserialize_verify_key(s: &str) -> Result<VerifyingKey> {
    let bytes = b64_decode(s)?;
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| UamError::Encryption("verify key must be 32 bytes".into()))?;
    VerifyingKey::from_bytes(&arr)
        .map_err(|_| UamError::Encryption("not a valid Ed25519 public key".into()))
}

/// Lowercase SHA-256 hex of the 32 verify-key bytes.
///
/// This 64-character string is the agent's content-addressed identity label.
pub fn fingerprint(verify_key: &VerifyingKey) -> String {
    hex::encode(Sha256::digest(verify_key.as_bytes()))
}

// ============================================================================
// Canonical JSON
// ============================================================================

/// Produce the deterministic byte image of a JSON object for signing.
///
/// - Drops the top-level `"signature"` key.
/// - Drops top-level entries whose value is null.
/// - Sorts object keys at every level (byte order).
/// - Compact separators, all non-ASCII escaped as `\uXXXX`.
///
/// Nested nulls are preserved: the drop rules apply only to the signable
/// field set itself, never inside `metadata` or other opaque subtrees.
pub fn canonicalize(value: &Value) -> Result<Vec<u8>> {
    let obj = value
        .as_object()
        .ok_or_else(|| UamError::InvalidEnvelope("canonicalize expects a JSON object".into()))?;

    let filtered: BTreeMap<&str, &Value> = obj
        .iter()
        .filter(|(k, v)| k.as_str() != "signature" && !v.is_null())
        .map(|(k, v)| (k.as_str(), v))
        .collect();

    let mut out = Vec::with_capacity(128);
    out.push(b'{');
    let mut first = true;
    for (key, val) in filtered {
        if !first {
            out.push(b',');
        }
        first = false;
        write_json_string(key, &mut out);
        out.push(b':');
        write_value(val, &mut out);
    }
    out.push(b'}');
    Ok(out)
}

fn write_value(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Null => out.extend_from_slice(b"null"),
        Value::Bool(true) => out.extend_from_slice(b"true"),
        Value::Bool(false) => out.extend_from_slice(b"false"),
        Value::Number(n) => out.extend_from_slice(n.to_string().as_bytes()),
        Value::String(s) => write_json_string(s, out),
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_value(item, out);
            }
            out.push(b']');
        }
        Value::Object(map) => {
            let sorted: BTreeMap<&str, &Value> =
                map.iter().map(|(k, v)| (k.as_str(), v)).collect();
            out.push(b'{');
            let mut first = true;
            for (key, val) in sorted {
                if !first {
                    out.push(b',');
                }
                first = false;
                write_json_string(key, out);
                out.push(b':');
                write_value(val, out);
            }
            out.push(b'}');
        }
    }
}

/// JSON-encode a string with every character outside `0x20..=0x7e` escaped.
/// Astral code points become UTF-16 surrogate pairs.
fn write_json_string(s: &str, out: &mut Vec<u8>) {
    out.push(b'"');
    for c in s.chars() {
        match c {
            '"' => out.extend_from_slice(b"\\\""),
            '\\' => out.extend_from_slice(b"\\\\"),
            '\n' => out.extend_from_slice(b"\\n"),
            '\r' => out.extend_from_slice(b"\\r"),
            '\t' => out.extend_from_slice(b"\\t"),
            '\u{08}' => out.extend_from_slice(b"\\b"),
            '\u{0c}' => out.extend_from_slice(b"\\f"),
            c if (' '..='~').contains(&c) => out.push(c as u8),
            c => {
                let mut units = [0u16; 2];
                for unit in c.encode_utf16(&mut units) {
                    out.extend_from_slice(format!("\\u{:04x}", unit).as_bytes());
                }
            }
        }
    }
    out.push(b'"');
}

// ============================================================================
// Signing and verification
// ============================================================================

/// Sign raw bytes with an Ed25519 keypair; returns base64.
pub fn sign_message(data: &[u8], keypair: &Keypair) -> String {
    keypair.sign(data)
}

/// Verify an Ed25519 signature (base64) over raw bytes.
pub fn verify_signature(data: &[u8], signature_b64: &str, verify_key: &VerifyingKey) -> Result<()> {
    let sig_bytes = b64_decode(signature_b64).map_err(|_| UamError::SignatureVerification)?;
    let sig_arr: [u8; 64] = sig_bytes
        .try_into()
        .map_err(|_| UamError::SignatureVerification)?;
    let sig = Signature::from_bytes(&sig_arr);
    verify_key
        .verify(data, &sig)
        .map_err(|_| UamError::SignatureVerification)
}

/// 24 OS-random bytes as base64. Used for the envelope nonce field.
pub fn generate_nonce() -> String {
    let mut bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut bytes);
    b64_encode(&bytes)
}

// ============================================================================
// NaCl Box (authenticated, both parties known)
// ============================================================================

fn box_secret(keypair: &Keypair) -> crypto_box::SecretKey {
    // Clamped SHA-512 prefix of the seed, as libsodium's sk_to_curve25519.
    crypto_box::SecretKey::from(keypair.signing_key.to_scalar_bytes())
}

fn box_public(verify_key: &VerifyingKey) -> crypto_box::PublicKey {
    crypto_box::PublicKey::from(verify_key.to_montgomery().to_bytes())
}

/// Encrypt with NaCl Box. Returns `base64(nonce || ciphertext)`, the
/// historic "box easy" representation.
pub fn encrypt_box(
    plaintext: &[u8],
    sender: &Keypair,
    recipient_verify_key: &VerifyingKey,
) -> Result<String> {
    let salsa = SalsaBox::new(&box_public(recipient_verify_key), &box_secret(sender));
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = crypto_box::Nonce::from(nonce_bytes);
    let ciphertext = salsa
        .encrypt(&nonce, plaintext)
        .map_err(|_| UamError::Encryption("box encryption failed".into()))?;

    let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    combined.extend_from_slice(&nonce_bytes);
    combined.extend_from_slice(&ciphertext);
    Ok(b64_encode(&combined))
}

/// Decrypt NaCl Box ciphertext produced by [`encrypt_box`].
pub fn decrypt_box(
    ciphertext_b64: &str,
    recipient: &Keypair,
    sender_verify_key: &VerifyingKey,
) -> Result<Vec<u8>> {
    let combined = b64_decode(ciphertext_b64).map_err(|_| UamError::Decryption)?;
    if combined.len() < NONCE_LEN {
        return Err(UamError::Decryption);
    }
    let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
    let nonce_arr: [u8; NONCE_LEN] = nonce_bytes.try_into().map_err(|_| UamError::Decryption)?;
    let nonce = crypto_box::Nonce::from(nonce_arr);

    let salsa = SalsaBox::new(&box_public(sender_verify_key), &box_secret(recipient));
    salsa
        .decrypt(&nonce, ciphertext)
        .map_err(|_| UamError::Decryption)
}

// ============================================================================
// NaCl SealedBox (anonymous sender)
//
// Used for handshake.request payloads: the sender may have no established
// relationship with the recipient yet, so encryption only needs the
// recipient's public key. The envelope signature still authenticates the
// sender.
// ============================================================================

/// Encrypt with SealedBox (ephemeral sender key). Returns base64.
pub fn encrypt_sealed(plaintext: &[u8], recipient_verify_key: &VerifyingKey) -> Result<String> {
    let sealed = box_public(recipient_verify_key)
        .seal(&mut OsRng, plaintext)
        .map_err(|_| UamError::Encryption("sealed box encryption failed".into()))?;
    Ok(b64_encode(&sealed))
}

/// Open a SealedBox ciphertext with the recipient's identity keypair.
pub fn decrypt_sealed(ciphertext_b64: &str, recipient: &Keypair) -> Result<Vec<u8>> {
    let sealed = b64_decode(ciphertext_b64).map_err(|_| UamError::Decryption)?;
    box_secret(recipient).unseal(&sealed).map_err(|_| UamError::Decryption)
}
