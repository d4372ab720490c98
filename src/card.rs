//! # Contact Cards
//!
//! A contact card is a self-signed identity document: it advertises an
//! agent's address, public key, relay endpoint, and optional metadata, and
//! is signed with the agent's own key so any recipient can verify it using
//! nothing but the embedded `public_key`.
//!
//! `payload_formats`, `fingerprint`, and `relays` ride outside the
//! signature scope: any party may append a relay list or recompute the
//! fingerprint without invalidating the card.

use serde_json::{json, Map, Value};

use crate::address::Address;
use crate::crypto::{
    canonicalize, deserialize_verify_key, sign_message, verify_signature, Keypair,
};
use crate::envelope::UAM_VERSION;
use crate::error::{Result, UamError};

/// Default advertised payload formats.
const DEFAULT_PAYLOAD_FORMATS: [&str; 2] = ["text/plain", "text/markdown"];

/// Required fields in a serialized card.
const REQUIRED_FIELDS: [&str; 6] = [
    "version",
    "address",
    "display_name",
    "relay",
    "public_key",
    "signature",
];

/// A self-signed agent identity card.
#[derive(Clone, Debug, PartialEq)]
pub struct ContactCard {
    pub version: String,
    pub address: String,
    pub display_name: String,
    pub relay: String,
    /// Base64 Ed25519 verify key; also the verification key for `signature`.
    pub public_key: String,
    pub signature: String,

    pub description: Option<String>,
    pub system: Option<String>,
    pub connection_endpoint: Option<String>,
    pub verified_domain: Option<String>,

    // Out-of-signature fields
    pub payload_formats: Option<Vec<String>>,
    /// SHA-256 hex of the verify-key bytes, auto-computed on creation.
    pub fingerprint: Option<String>,
    /// Ordered relay URLs for multi-relay failover.
    pub relays: Option<Vec<String>>,
}

/// Optional card fields for [`create_contact_card`].
#[derive(Clone, Debug, Default)]
pub struct ContactCardOptions {
    pub description: Option<String>,
    pub system: Option<String>,
    pub connection_endpoint: Option<String>,
    pub verified_domain: Option<String>,
    pub payload_formats: Option<Vec<String>>,
    pub relays: Option<Vec<String>>,
}

impl ContactCard {
    /// The dict the signature covers: required fields plus present
    /// optionals, excluding `signature`, `payload_formats`, `fingerprint`,
    /// and `relays`.
    fn signable_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("version".into(), json!(self.version));
        map.insert("address".into(), json!(self.address));
        map.insert("display_name".into(), json!(self.display_name));
        map.insert("relay".into(), json!(self.relay));
        map.insert("public_key".into(), json!(self.public_key));
        if let Some(v) = &self.description {
            map.insert("description".into(), json!(v));
        }
        if let Some(v) = &self.system {
            map.insert("system".into(), json!(v));
        }
        if let Some(v) = &self.connection_endpoint {
            map.insert("connection_endpoint".into(), json!(v));
        }
        if let Some(v) = &self.verified_domain {
            map.insert("verified_domain".into(), json!(v));
        }
        Value::Object(map)
    }

    /// Serialize to a plain JSON object, omitting absent optionals.
    pub fn to_value(&self) -> Value {
        let mut value = self.signable_value();
        let map = value.as_object_mut().expect("signable value is an object");
        map.insert("signature".into(), json!(self.signature));
        if let Some(v) = &self.payload_formats {
            map.insert("payload_formats".into(), json!(v));
        }
        if let Some(v) = &self.fingerprint {
            map.insert("fingerprint".into(), json!(v));
        }
        if let Some(v) = &self.relays {
            map.insert("relays".into(), json!(v));
        }
        value
    }

    /// Deserialize from a JSON object.
    ///
    /// When `verify` is true (the normal path for untrusted input) the
    /// card signature is checked immediately after deserialization.
    pub fn from_value(value: &Value, verify: bool) -> Result<ContactCard> {
        let obj = value
            .as_object()
            .ok_or_else(|| UamError::InvalidContactCard("card must be a JSON object".into()))?;

        let mut missing: Vec<&str> = REQUIRED_FIELDS
            .iter()
            .copied()
            .filter(|f| !obj.contains_key(*f))
            .collect();
        if !missing.is_empty() {
            missing.sort_unstable();
            return Err(UamError::InvalidContactCard(format!(
                "missing required fields: {missing:?}"
            )));
        }

        let get_str = |key: &str| -> Result<String> {
            obj.get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| {
                    UamError::InvalidContactCard(format!("field {key:?} must be a string"))
                })
        };
        let get_opt_str = |key: &str| -> Option<String> {
            obj.get(key).and_then(Value::as_str).map(str::to_string)
        };
        let get_str_list = |key: &str| -> Option<Vec<String>> {
            obj.get(key).and_then(Value::as_array).map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
        };

        let card = ContactCard {
            version: get_str("version")?,
            address: get_str("address")?,
            display_name: get_str("display_name")?,
            relay: get_str("relay")?,
            public_key: get_str("public_key")?,
            signature: get_str("signature")?,
            description: get_opt_str("description"),
            system: get_opt_str("system"),
            connection_endpoint: get_opt_str("connection_endpoint"),
            verified_domain: get_opt_str("verified_domain"),
            payload_formats: get_str_list("payload_formats"),
            fingerprint: get_opt_str("fingerprint"),
            relays: get_str_list("relays"),
        };

        if verify {
            verify_contact_card(&card)?;
        }
        Ok(card)
    }
}

/// Create a self-signed contact card for the given identity.
///
/// Fills `payload_formats` with the defaults when unspecified and always
/// computes `fingerprint` from the signing key.
pub fn create_contact_card(
    address: &str,
    display_name: &str,
    relay: &str,
    signing: &Keypair,
    options: ContactCardOptions,
) -> Result<ContactCard> {
    Address::parse(address)?;

    let payload_formats = options.payload_formats.unwrap_or_else(|| {
        DEFAULT_PAYLOAD_FORMATS.iter().map(|s| s.to_string()).collect()
    });

    let mut card = ContactCard {
        version: UAM_VERSION.to_string(),
        address: address.to_string(),
        display_name: display_name.to_string(),
        relay: relay.to_string(),
        public_key: signing.public_key_b64(),
        signature: String::new(),
        description: options.description,
        system: options.system,
        connection_endpoint: options.connection_endpoint,
        verified_domain: options.verified_domain,
        payload_formats: Some(payload_formats),
        fingerprint: Some(signing.fingerprint()),
        relays: options.relays,
    };

    card.signature = sign_message(&canonicalize(&card.signable_value())?, signing);
    Ok(card)
}

/// Verify a card's self-signature using its embedded public key.
pub fn verify_contact_card(card: &ContactCard) -> Result<()> {
    Address::parse(&card.address)
        .map_err(|e| UamError::InvalidContactCard(format!("invalid address in card: {e}")))?;

    let vk = deserialize_verify_key(&card.public_key)
        .map_err(|_| UamError::InvalidContactCard("invalid public key in card".into()))?;

    verify_signature(&canonicalize(&card.signable_value())?, &card.signature, &vk)
}
