//! # Error Taxonomy
//!
//! All fallible operations in the crate return [`UamError`]. Each variant is
//! one error *kind*; callers match on the kind, not on message text.
//!
//! Propagation rules:
//!
//! - Outbound paths (`send`, `connect`, `approve`, ...) fail fast and surface
//!   the error to the caller.
//! - The inbound path (`inbox`) is fail-quiet per message: signature and
//!   decryption failures drop the offending envelope and never abort the poll.
//! - [`UamError::KeyPinning`] is always a hard failure. A pinned key never
//!   changes silently.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, UamError>;

#[derive(Error, Debug)]
pub enum UamError {
    /// Address string failed the `agent::domain` grammar.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Wire envelope failed schema validation (missing fields, bad types).
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),

    /// Serialized envelope exceeds the 64 KiB wire cap.
    #[error("envelope size {size} bytes exceeds maximum {max} bytes")]
    EnvelopeTooLarge { size: usize, max: usize },

    /// Ed25519 signature did not verify.
    #[error("signature verification failed")]
    SignatureVerification,

    /// Payload encryption failed.
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Payload decryption failed (wrong keys or tampered ciphertext).
    #[error("decryption failed")]
    Decryption,

    /// Contact card missing required fields or carrying an invalid address.
    #[error("invalid contact card: {0}")]
    InvalidContactCard(String),

    /// A locked (trusted/pinned/verified) contact's key does not match the
    /// key being written or resolved. TOFU violation; the operation aborts.
    #[error("key pinning violation for {address}: stored key does not match {candidate}")]
    KeyPinning { address: String, candidate: String },

    /// No resolver tier produced a public key for the address.
    #[error("cannot resolve address: {0}")]
    Resolution(String),

    /// Network or push-channel failure in a transport.
    #[error("transport error: {0}")]
    Transport(String),

    /// Relay registration failed or no bearer token is available.
    #[error("registration failed: {0}")]
    Registration(String),

    /// Key material could not be loaded, generated, or persisted.
    #[error("key store error: {0}")]
    KeyStore(String),

    /// Contact book storage failure.
    #[error("contact book error: {0}")]
    Storage(String),

    /// The agent is misconfigured (e.g. dotless domain without a Tier-3
    /// registry, or an unknown trust policy string).
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<rusqlite::Error> for UamError {
    fn from(err: rusqlite::Error) -> Self {
        UamError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for UamError {
    fn from(err: serde_json::Error) -> Self {
        UamError::InvalidEnvelope(err.to_string())
    }
}

impl UamError {
    /// True for errors the inbox path swallows (per-message fail-quiet).
    pub fn is_silent_drop(&self) -> bool {
        matches!(
            self,
            UamError::SignatureVerification | UamError::Decryption
        )
    }
}
