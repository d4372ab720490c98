//! # Message Envelopes
//!
//! Every UAM message travels inside a signed, encrypted envelope. Internal
//! field names use `from_address` / `to_address`; the wire JSON uses
//! `from` / `to`.
//!
//! ## Signature scope
//!
//! The signature covers the canonical byte image of all required fields plus
//! any *present* optional field. `signature` itself, absent optionals, and
//! `attachments` are outside the scope — attachments can be added or
//! reordered by intermediaries without invalidating the envelope
//! (extension-safe evolution).
//!
//! ## Payload encryption
//!
//! `handshake.request` payloads use SealedBox (the sender may still be
//! anonymous to the recipient); every other type uses NaCl Box keyed by
//! both parties' identity keys.

use ed25519_dalek::VerifyingKey;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::address::Address;
use crate::crypto::{
    canonicalize, encrypt_box, encrypt_sealed, generate_nonce, sign_message, verify_signature,
    Keypair,
};
use crate::error::{Result, UamError};

/// Current protocol version carried in `uam_version`.
pub const UAM_VERSION: &str = "0.1";

/// Maximum serialized envelope size in bytes (64 KiB).
pub const MAX_ENVELOPE_SIZE: usize = 65_536;

/// Required wire-format field names.
const REQUIRED_WIRE_FIELDS: [&str; 9] = [
    "uam_version",
    "message_id",
    "from",
    "to",
    "timestamp",
    "type",
    "nonce",
    "payload",
    "signature",
];

// ============================================================================
// Message types
// ============================================================================

/// All UAM wire message types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageType {
    Message,
    HandshakeRequest,
    HandshakeAccept,
    HandshakeDeny,
    ReceiptDelivered,
    ReceiptRead,
    ReceiptFailed,
    SessionRequest,
    SessionAccept,
    SessionDecline,
    SessionEnd,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Message => "message",
            MessageType::HandshakeRequest => "handshake.request",
            MessageType::HandshakeAccept => "handshake.accept",
            MessageType::HandshakeDeny => "handshake.deny",
            MessageType::ReceiptDelivered => "receipt.delivered",
            MessageType::ReceiptRead => "receipt.read",
            MessageType::ReceiptFailed => "receipt.failed",
            MessageType::SessionRequest => "session.request",
            MessageType::SessionAccept => "session.accept",
            MessageType::SessionDecline => "session.decline",
            MessageType::SessionEnd => "session.end",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        Ok(match s {
            "message" => MessageType::Message,
            "handshake.request" => MessageType::HandshakeRequest,
            "handshake.accept" => MessageType::HandshakeAccept,
            "handshake.deny" => MessageType::HandshakeDeny,
            "receipt.delivered" => MessageType::ReceiptDelivered,
            "receipt.read" => MessageType::ReceiptRead,
            "receipt.failed" => MessageType::ReceiptFailed,
            "session.request" => MessageType::SessionRequest,
            "session.accept" => MessageType::SessionAccept,
            "session.decline" => MessageType::SessionDecline,
            "session.end" => MessageType::SessionEnd,
            other => {
                return Err(UamError::InvalidEnvelope(format!(
                    "unknown message type: {other:?}"
                )))
            }
        })
    }

    pub fn is_handshake(&self) -> bool {
        matches!(
            self,
            MessageType::HandshakeRequest | MessageType::HandshakeAccept | MessageType::HandshakeDeny
        )
    }

    pub fn is_receipt(&self) -> bool {
        matches!(
            self,
            MessageType::ReceiptDelivered | MessageType::ReceiptRead | MessageType::ReceiptFailed
        )
    }

    pub fn is_session(&self) -> bool {
        matches!(
            self,
            MessageType::SessionRequest
                | MessageType::SessionAccept
                | MessageType::SessionDecline
                | MessageType::SessionEnd
        )
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Envelope
// ============================================================================

/// A signed, encrypted UAM message envelope.
#[derive(Clone, Debug, PartialEq)]
pub struct MessageEnvelope {
    pub uam_version: String,
    pub message_id: String,
    pub from_address: String,
    pub to_address: String,
    /// ISO-8601 UTC timestamp with millisecond precision (`...Z`).
    pub timestamp: String,
    pub message_type: MessageType,
    /// 24 random bytes, URL-safe base64 unpadded.
    pub nonce: String,
    /// Ciphertext, URL-safe base64 unpadded.
    pub payload: String,
    /// 64-byte Ed25519 signature, URL-safe base64 unpadded.
    pub signature: String,

    pub thread_id: Option<String>,
    pub reply_to: Option<String>,
    pub expires: Option<String>,
    pub media_type: Option<String>,
    /// Opaque JSON subtree. Preserved byte-for-byte through
    /// canonicalization, never interpreted.
    pub metadata: Option<Value>,

    /// Wire-only, outside the signature scope.
    pub attachments: Option<Vec<Value>>,
}

/// Optional envelope fields for [`create_envelope`].
#[derive(Clone, Debug, Default)]
pub struct EnvelopeOptions {
    pub thread_id: Option<String>,
    pub reply_to: Option<String>,
    pub expires: Option<String>,
    pub media_type: Option<String>,
    pub metadata: Option<Value>,
    pub attachments: Option<Vec<Value>>,
}

/// Canonical UTC timestamp: `YYYY-MM-DDTHH:MM:SS.mmmZ`.
pub fn utc_timestamp() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

impl MessageEnvelope {
    /// Build the dict used for signature computation: required fields plus
    /// present optionals, wire names, no `signature`, no `attachments`.
    fn signable_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("uam_version".into(), json!(self.uam_version));
        map.insert("message_id".into(), json!(self.message_id));
        map.insert("from".into(), json!(self.from_address));
        map.insert("to".into(), json!(self.to_address));
        map.insert("timestamp".into(), json!(self.timestamp));
        map.insert("type".into(), json!(self.message_type.as_str()));
        map.insert("nonce".into(), json!(self.nonce));
        map.insert("payload".into(), json!(self.payload));
        if let Some(v) = &self.thread_id {
            map.insert("thread_id".into(), json!(v));
        }
        if let Some(v) = &self.reply_to {
            map.insert("reply_to".into(), json!(v));
        }
        if let Some(v) = &self.expires {
            map.insert("expires".into(), json!(v));
        }
        if let Some(v) = &self.media_type {
            map.insert("media_type".into(), json!(v));
        }
        if let Some(v) = &self.metadata {
            map.insert("metadata".into(), v.clone());
        }
        Value::Object(map)
    }

    /// The canonical bytes the signature covers.
    pub fn signable_bytes(&self) -> Result<Vec<u8>> {
        canonicalize(&self.signable_value())
    }

    /// Convert to the wire-format JSON object (`from`/`to` names, optional
    /// fields omitted when absent, `attachments` appended unsigned).
    pub fn to_wire(&self) -> Value {
        let mut value = self.signable_value();
        let map = value.as_object_mut().expect("signable value is an object");
        map.insert("signature".into(), json!(self.signature));
        if let Some(att) = &self.attachments {
            map.insert("attachments".into(), Value::Array(att.clone()));
        }
        value
    }

    /// Restore an envelope from a wire-format JSON object.
    ///
    /// Missing required fields are reported in sorted order.
    pub fn from_wire(wire: &Value) -> Result<MessageEnvelope> {
        let obj = wire
            .as_object()
            .ok_or_else(|| UamError::InvalidEnvelope("wire envelope must be an object".into()))?;

        let mut missing: Vec<&str> = REQUIRED_WIRE_FIELDS
            .iter()
            .copied()
            .filter(|f| !obj.contains_key(*f))
            .collect();
        if !missing.is_empty() {
            missing.sort_unstable();
            return Err(UamError::InvalidEnvelope(format!(
                "missing required fields: {missing:?}"
            )));
        }

        let get_str = |key: &str| -> Result<String> {
            obj.get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| UamError::InvalidEnvelope(format!("field {key:?} must be a string")))
        };
        let get_opt_str = |key: &str| -> Option<String> {
            obj.get(key).and_then(Value::as_str).map(str::to_string)
        };

        Ok(MessageEnvelope {
            uam_version: get_str("uam_version")?,
            message_id: get_str("message_id")?,
            from_address: get_str("from")?,
            to_address: get_str("to")?,
            timestamp: get_str("timestamp")?,
            message_type: MessageType::parse(&get_str("type")?)?,
            nonce: get_str("nonce")?,
            payload: get_str("payload")?,
            signature: get_str("signature")?,
            thread_id: get_opt_str("thread_id"),
            reply_to: get_opt_str("reply_to"),
            expires: get_opt_str("expires"),
            media_type: get_opt_str("media_type"),
            metadata: obj.get("metadata").filter(|v| !v.is_null()).cloned(),
            attachments: obj
                .get("attachments")
                .and_then(Value::as_array)
                .map(|a| a.to_vec()),
        })
    }
}

/// Check that the serialized envelope fits the wire cap.
pub fn validate_envelope_size(envelope: &MessageEnvelope) -> Result<()> {
    let size = serde_json::to_vec(&envelope.to_wire())
        .map_err(|e| UamError::InvalidEnvelope(e.to_string()))?
        .len();
    if size > MAX_ENVELOPE_SIZE {
        return Err(UamError::EnvelopeTooLarge {
            size,
            max: MAX_ENVELOPE_SIZE,
        });
    }
    Ok(())
}

/// Create a signed, encrypted message envelope.
///
/// Steps: validate both addresses, generate identifiers, encrypt the
/// payload (SealedBox for `handshake.request`, Box otherwise), sign the
/// canonical image, and enforce the size cap.
pub fn create_envelope(
    from_address: &str,
    to_address: &str,
    message_type: MessageType,
    payload_plaintext: &[u8],
    signing: &Keypair,
    recipient_verify_key: &VerifyingKey,
    options: EnvelopeOptions,
) -> Result<MessageEnvelope> {
    Address::parse(from_address)?;
    Address::parse(to_address)?;

    let message_id = Uuid::new_v4().to_string();
    let nonce = generate_nonce();
    let timestamp = utc_timestamp();

    let payload = if message_type == MessageType::HandshakeRequest {
        encrypt_sealed(payload_plaintext, recipient_verify_key)?
    } else {
        encrypt_box(payload_plaintext, signing, recipient_verify_key)?
    };

    let mut envelope = MessageEnvelope {
        uam_version: UAM_VERSION.to_string(),
        message_id,
        from_address: from_address.to_string(),
        to_address: to_address.to_string(),
        timestamp,
        message_type,
        nonce,
        payload,
        signature: String::new(),
        thread_id: options.thread_id,
        reply_to: options.reply_to,
        expires: options.expires,
        media_type: options.media_type,
        metadata: options.metadata,
        attachments: options.attachments,
    };

    envelope.signature = sign_message(&envelope.signable_bytes()?, signing);

    validate_envelope_size(&envelope)?;
    Ok(envelope)
}

/// Verify the envelope signature under the sender's declared verify key.
pub fn verify_envelope(envelope: &MessageEnvelope, sender_verify_key: &VerifyingKey) -> Result<()> {
    verify_signature(
        &envelope.signable_bytes()?,
        &envelope.signature,
        sender_verify_key,
    )
}
