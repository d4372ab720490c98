//! # Agent
//!
//! The top-level orchestrator. An [`Agent`] composes the key store,
//! contact book, resolver, handshake manager, and a transport into the
//! user-level operations: `send`, `inbox`, `pending`/`approve`/`deny`,
//! `block`/`unblock`, and `close`.
//!
//! ## Construction
//!
//! ```ignore
//! let agent = Agent::builder("alice")
//!     .relay_url("https://relay.example.net")
//!     .trust_policy(TrustPolicy::ApprovalRequired)
//!     .connect()
//!     .await?;
//!
//! let message_id = agent.send("bob::relay.example.net", "hello").await?;
//! for msg in agent.inbox(50).await? {
//!     println!("{} says: {}", msg.from_address, msg.content);
//! }
//! ```
//!
//! ## Inbound policy
//!
//! The inbox path is deliberately fail-quiet per message: envelopes that
//! fail parsing, signature verification, or decryption are dropped with a
//! log line so one malformed or malicious envelope cannot poison a poll.
//! Outbound paths always surface their errors.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use ed25519_dalek::VerifyingKey;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::address::Address;
use crate::book::{ContactBook, ContactUpdate, PendingHandshake, TrustState};
use crate::card::ContactCard;
use crate::config::{AgentConfig, ConfigOverrides, TransportKind, TrustPolicy};
use crate::crypto::{b64_encode, decrypt_box, deserialize_verify_key, Keypair};
use crate::envelope::{
    create_envelope, verify_envelope, EnvelopeOptions, MessageEnvelope, MessageType,
};
use crate::error::{Result, UamError};
use crate::handshake::{HandshakeManager, LocalIdentity};
use crate::keystore::KeyStore;
use crate::registry::ChainResolver;
use crate::resolver::{Resolver, SmartResolver};
use crate::transport::{HttpTransport, Transport, WebSocketTransport};

/// Pending handshakes older than this are swept with a `receipt.failed`.
const PENDING_EXPIRY_DAYS: u32 = 7;

/// Per-relay timeout during multi-relay failover.
const FAILOVER_TIMEOUT: Duration = Duration::from_secs(10);

/// Relay registration timeout.
const REGISTER_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// ReceivedMessage
// ============================================================================

/// A decrypted, signature-verified inbound message. Immutable data object.
#[derive(Clone, Debug, PartialEq)]
pub struct ReceivedMessage {
    pub message_id: String,
    pub from_address: String,
    pub to_address: String,
    /// Decrypted plaintext.
    pub content: String,
    pub timestamp: String,
    pub message_type: MessageType,
    pub thread_id: Option<String>,
    pub reply_to: Option<String>,
    pub media_type: Option<String>,
    /// The signature checked out (always true for returned messages).
    pub verified: bool,
}

impl std::fmt::Display for ReceivedMessage {
    /// Human-readable summary that deliberately omits `content`: callers
    /// feeding messages into an LLM context must extract `.content`
    /// explicitly, never via formatting.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Message from {} at {}", self.from_address, self.timestamp)
    }
}

/// Optional per-send parameters.
#[derive(Clone, Debug, Default)]
pub struct SendOptions {
    pub thread_id: Option<String>,
    pub attachments: Option<Vec<Value>>,
}

// ============================================================================
// Builder
// ============================================================================

/// Configures and connects an [`Agent`].
///
/// The `transport`, `resolver`, `token`, and `in_memory_contacts` hooks
/// exist for embedding and testing; production agents normally configure
/// only the relay and policy and let `connect` wire the rest.
pub struct AgentBuilder {
    name: String,
    overrides: ConfigOverrides,
    transport: Option<Arc<dyn Transport>>,
    resolver: Option<Arc<dyn Resolver>>,
    registry: Option<Arc<ChainResolver>>,
    token: Option<String>,
    in_memory_contacts: bool,
}

impl AgentBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            overrides: ConfigOverrides::default(),
            transport: None,
            resolver: None,
            registry: None,
            token: None,
            in_memory_contacts: false,
        }
    }

    pub fn relay_url(mut self, url: impl Into<String>) -> Self {
        self.overrides.relay_url = Some(url.into());
        self
    }

    pub fn relay_domain(mut self, domain: impl Into<String>) -> Self {
        self.overrides.relay_domain = Some(domain.into());
        self
    }

    pub fn key_dir(mut self, dir: impl Into<std::path::PathBuf>) -> Self {
        self.overrides.key_dir = Some(dir.into());
        self
    }

    pub fn data_dir(mut self, dir: impl Into<std::path::PathBuf>) -> Self {
        self.overrides.data_dir = Some(dir.into());
        self
    }

    pub fn display_name(mut self, name: impl Into<String>) -> Self {
        self.overrides.display_name = Some(name.into());
        self
    }

    pub fn transport_kind(mut self, kind: TransportKind) -> Self {
        self.overrides.transport = Some(kind);
        self
    }

    pub fn trust_policy(mut self, policy: TrustPolicy) -> Self {
        self.overrides.trust_policy = Some(policy);
        self
    }

    pub fn auto_register(mut self, enabled: bool) -> Self {
        self.overrides.auto_register = Some(enabled);
        self
    }

    /// Use a caller-supplied transport instead of building one.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Use a caller-supplied resolver instead of the tiered default.
    pub fn resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Attach an on-chain registry for Tier-3 (dotless) domains.
    pub fn registry(mut self, registry: Arc<ChainResolver>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Supply a bearer token directly, skipping the token file and
    /// auto-registration.
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Keep the contact book in memory (tests, ephemeral agents).
    pub fn in_memory_contacts(mut self) -> Self {
        self.in_memory_contacts = true;
        self
    }

    /// Resolve configuration, load keys, obtain a token (registering with
    /// the relay when allowed), connect the transport, open the contact
    /// book, and sweep expired pending handshakes.
    pub async fn connect(self) -> Result<Agent> {
        let config = AgentConfig::build(&self.name, self.overrides)?;

        let keystore = KeyStore::new(&config.key_dir);
        let keypair = keystore.load_or_generate(&config.name)?;

        let (address, token) = match self.token {
            Some(token) => (config.address(), token),
            None => match keystore.load_token(&config.name) {
                Some(token) => (config.address(), token),
                None if config.auto_register => {
                    let (address, token) = register_with_relay(&config, &keypair).await?;
                    keystore.save_token(&config.name, &token)?;
                    (address, token)
                }
                None => {
                    return Err(UamError::Registration(
                        "no stored token and auto-register is disabled; register manually \
                         or enable auto_register"
                            .into(),
                    ))
                }
            },
        };

        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => match config.transport {
                TransportKind::Http => {
                    Arc::new(HttpTransport::new(&config.relay_url, &token, &address))
                }
                TransportKind::WebSocket => {
                    Arc::new(WebSocketTransport::new(&config.relay_ws_url, &token))
                }
            },
        };
        transport.connect().await?;

        let book = Arc::new(if self.in_memory_contacts {
            ContactBook::open_in_memory()?
        } else {
            ContactBook::open(&config.data_dir)?
        });

        let resolver: Arc<dyn Resolver> = match self.resolver {
            Some(resolver) => resolver,
            None => {
                let mut smart = SmartResolver::new(&config.relay_domain);
                if let Some(registry) = self.registry {
                    smart = smart.with_registry(registry);
                }
                Arc::new(smart)
            }
        };

        let handshake = HandshakeManager::new(
            book.clone(),
            config.trust_policy,
            transport.clone(),
            LocalIdentity {
                address: address.clone(),
                display_name: config.display_name.clone(),
                relay: config.relay_ws_url.clone(),
                keypair: keypair.clone(),
            },
        );

        let agent = Agent {
            config,
            address,
            token,
            keypair,
            transport,
            resolver,
            book,
            handshake,
            http: reqwest::Client::new(),
            inflight_handshakes: tokio::sync::Mutex::new(HashSet::new()),
        };

        agent.sweep_expired_pending().await;
        info!(address = %agent.address, "agent connected");
        Ok(agent)
    }
}

// ============================================================================
// Agent
// ============================================================================

/// A connected UAM agent.
pub struct Agent {
    config: AgentConfig,
    address: String,
    token: String,
    keypair: Keypair,
    transport: Arc<dyn Transport>,
    resolver: Arc<dyn Resolver>,
    book: Arc<ContactBook>,
    handshake: HandshakeManager,
    http: reqwest::Client,
    /// Per-address latch deduplicating concurrent first-contact handshakes.
    inflight_handshakes: tokio::sync::Mutex<HashSet<String>>,
}

impl Agent {
    pub fn builder(name: impl Into<String>) -> AgentBuilder {
        AgentBuilder::new(name)
    }

    /// The agent's full `name::domain` address.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Base64 Ed25519 verify key.
    pub fn public_key(&self) -> String {
        self.keypair.public_key_b64()
    }

    /// SHA-256 hex fingerprint of the verify key.
    pub fn fingerprint(&self) -> String {
        self.keypair.fingerprint()
    }

    /// The local trust store.
    pub fn contact_book(&self) -> &Arc<ContactBook> {
        &self.book
    }

    /// A freshly signed contact card for this agent.
    pub fn contact_card(&self) -> Result<ContactCard> {
        self.handshake.own_card()
    }

    /// Close the contact book and disconnect the transport. Idempotent.
    pub async fn close(&self) -> Result<()> {
        self.book.close();
        self.transport.disconnect().await
    }

    // -- Messaging -----------------------------------------------------------

    /// Send an encrypted, signed text message. Returns the message id.
    pub async fn send(&self, to_address: &str, text: &str) -> Result<String> {
        self.send_with(to_address, text, SendOptions::default()).await
    }

    /// [`send`](Agent::send) with thread and attachment parameters.
    pub async fn send_with(
        &self,
        to_address: &str,
        text: &str,
        options: SendOptions,
    ) -> Result<String> {
        let to = Address::parse(to_address)?;
        let full = to.full();

        // First contact is decided before resolution caches the key
        let first_contact = !self.book.is_known(&full);
        let recipient_vk = self.resolve_recipient_key(&to).await?;
        if first_contact {
            self.initiate_handshake_once(&full, &recipient_vk).await?;
        }

        let envelope = create_envelope(
            &self.address,
            &full,
            MessageType::Message,
            text.as_bytes(),
            &self.keypair,
            &recipient_vk,
            EnvelopeOptions {
                thread_id: options.thread_id,
                media_type: Some("text/plain".into()),
                attachments: options.attachments,
                ..Default::default()
            },
        )?;
        let message_id = envelope.message_id.clone();
        let wire = envelope.to_wire();

        // Multi-relay failover when the recipient lives elsewhere
        let own_relay = normalize_relay_url(&self.config.relay_url);
        match self.book.get_relay_urls(&full)? {
            Some(urls) if urls.len() == 1 && normalize_relay_url(&urls[0]) == own_relay => {
                self.transport.send(&wire).await?;
            }
            Some(urls) if !urls.is_empty() => {
                self.send_with_failover(&wire, &urls).await?;
            }
            _ => {
                self.transport.send(&wire).await?;
            }
        }
        Ok(message_id)
    }

    /// Poll, verify, decrypt, and return pending messages.
    ///
    /// Handshake, receipt, and session envelopes are routed internally and
    /// never returned. Per-message failures drop silently.
    pub async fn inbox(&self, limit: usize) -> Result<Vec<ReceivedMessage>> {
        self.sweep_expired_pending().await;

        let raw_messages = self.transport.receive(limit).await?;
        let mut result = Vec::new();
        for raw in raw_messages {
            match self.process_inbound(&raw).await {
                Ok(Some(message)) => {
                    self.send_read_receipt(&message).await;
                    result.push(message);
                }
                Ok(None) => {}
                Err(e) => {
                    debug!(error = %e, "dropped inbound envelope");
                }
            }
        }
        Ok(result)
    }

    // -- Trust management ----------------------------------------------------

    /// Handshake requests awaiting local approval.
    pub async fn pending(&self) -> Result<Vec<PendingHandshake>> {
        self.book.get_pending()
    }

    /// Approve a pending handshake: store the contact as `trusted`, drop
    /// the queue entry, and reply `handshake.accept`.
    pub async fn approve(&self, address: &str) -> Result<()> {
        let entry = self
            .book
            .get_pending_for(address)?
            .ok_or_else(|| UamError::Storage(format!("no pending handshake from {address}")))?;

        let card_value: Value = serde_json::from_str(&entry.contact_card)
            .map_err(|e| UamError::InvalidContactCard(e.to_string()))?;
        let card = ContactCard::from_value(&card_value, true)?;

        self.book.add_contact(
            ContactUpdate::new(&card.address, &card.public_key, TrustState::Trusted)
                .display_name(&card.display_name)
                .trust_source("explicit-approval")
                .relay(&card.relay),
        )?;
        self.book.remove_pending(address)?;

        let sender_vk = deserialize_verify_key(&card.public_key)?;
        self.handshake.send_accept(address, &sender_vk).await
    }

    /// Deny a pending handshake: drop the queue entry and reply
    /// `handshake.deny`.
    pub async fn deny(&self, address: &str) -> Result<()> {
        let entry = self
            .book
            .get_pending_for(address)?
            .ok_or_else(|| UamError::Storage(format!("no pending handshake from {address}")))?;

        let card_value: Value = serde_json::from_str(&entry.contact_card)
            .map_err(|e| UamError::InvalidContactCard(e.to_string()))?;
        let card = ContactCard::from_value(&card_value, false)?;

        self.book.remove_pending(address)?;

        let sender_vk = deserialize_verify_key(&card.public_key)?;
        self.handshake.send_deny(address, &sender_vk, "denied").await
    }

    /// Block an exact address or a `*::domain` pattern.
    pub async fn block(&self, pattern: &str) -> Result<()> {
        self.book.add_block(pattern)
    }

    pub async fn unblock(&self, pattern: &str) -> Result<()> {
        self.book.remove_block(pattern)
    }

    // -- Key resolution ------------------------------------------------------

    /// Resolve the recipient's verify key: contact book first (zero I/O),
    /// else the resolver, caching the result as `unverified`.
    ///
    /// After a network resolution the book is re-checked; a key conflict
    /// against a meanwhile-locked contact is a hard `KeyPinning` failure.
    async fn resolve_recipient_key(&self, to: &Address) -> Result<VerifyingKey> {
        let full = to.full();
        if let Some(stored) = self.book.get_public_key(&full)? {
            return deserialize_verify_key(&stored);
        }

        let resolved = self
            .resolver
            .resolve_public_key(to, &self.token, &self.config.relay_url)
            .await?;

        match self.book.get_contact(&full)? {
            Some(existing) if existing.trust_state.is_locked() => {
                if existing.public_key != resolved {
                    return Err(UamError::KeyPinning {
                        address: full,
                        candidate: resolved,
                    });
                }
            }
            _ => {
                self.book.add_contact(ContactUpdate::new(
                    &full,
                    &resolved,
                    TrustState::Unverified,
                ))?;
            }
        }
        deserialize_verify_key(&resolved)
    }

    /// Emit at most one handshake request per unknown recipient, however
    /// many sends race on it.
    async fn initiate_handshake_once(&self, full: &str, recipient_vk: &VerifyingKey) -> Result<()> {
        {
            let mut latch = self.inflight_handshakes.lock().await;
            if latch.contains(full) {
                return Ok(());
            }
            if let Some(state) = self.book.get_trust_state(full)? {
                // Another path already progressed past first contact
                if state != TrustState::Unknown && state != TrustState::Unverified {
                    return Ok(());
                }
            }
            latch.insert(full.to_string());
        }

        let outcome = async {
            let wire = self.handshake.create_request(full, recipient_vk)?;
            self.transport.send(&wire).await?;
            self.book.add_contact(ContactUpdate::new(
                full,
                b64_encode(recipient_vk.as_bytes()),
                TrustState::HandshakeSent,
            ))?;
            debug!(to = full, "handshake request sent");
            Ok(())
        }
        .await;

        self.inflight_handshakes.lock().await.remove(full);
        outcome
    }

    // -- Inbound pipeline ----------------------------------------------------

    /// Process one inbound wire envelope. `Ok(None)` means the envelope was
    /// consumed internally or dropped by policy.
    async fn process_inbound(&self, raw: &Value) -> Result<Option<ReceivedMessage>> {
        let envelope = MessageEnvelope::from_wire(raw)?;

        // Block gate runs before any crypto
        if self.book.is_blocked(&envelope.from_address) {
            debug!(from = %envelope.from_address, "dropped message from blocked sender");
            return Ok(None);
        }

        let sender_vk = match self.sender_verify_key(&envelope.from_address).await {
            Some(vk) => vk,
            None => {
                warn!(
                    from = %envelope.from_address,
                    message_id = %envelope.message_id,
                    "cannot resolve sender key, dropping message"
                );
                return Ok(None);
            }
        };

        if verify_envelope(&envelope, &sender_vk).is_err() {
            warn!(
                from = %envelope.from_address,
                message_id = %envelope.message_id,
                "invalid signature, dropping message"
            );
            return Ok(None);
        }

        if envelope.message_type.is_handshake() {
            if let Err(e) = self.handshake.handle_inbound(&envelope, &sender_vk).await {
                warn!(from = %envelope.from_address, error = %e, "handshake handling failed");
            }
            return Ok(None);
        }

        if envelope.message_type.is_receipt() || envelope.message_type.is_session() {
            debug!(
                from = %envelope.from_address,
                kind = %envelope.message_type,
                "protocol envelope routed internally"
            );
            return Ok(None);
        }

        // Trust-policy gate for user messages
        if !self.passes_trust_gate(&envelope.from_address)? {
            info!(
                from = %envelope.from_address,
                policy = %self.config.trust_policy,
                "filtered message from unapproved sender"
            );
            return Ok(None);
        }

        let plaintext = match decrypt_box(&envelope.payload, &self.keypair, &sender_vk) {
            Ok(bytes) => bytes,
            Err(_) => {
                warn!(
                    from = %envelope.from_address,
                    message_id = %envelope.message_id,
                    "decryption failed, dropping message"
                );
                return Ok(None);
            }
        };
        let content = match String::from_utf8(plaintext) {
            Ok(content) => content,
            Err(_) => {
                warn!(message_id = %envelope.message_id, "payload is not UTF-8, dropping");
                return Ok(None);
            }
        };

        Ok(Some(ReceivedMessage {
            message_id: envelope.message_id,
            from_address: envelope.from_address,
            to_address: envelope.to_address,
            content,
            timestamp: envelope.timestamp,
            message_type: envelope.message_type,
            thread_id: envelope.thread_id,
            reply_to: envelope.reply_to,
            media_type: envelope.media_type,
            verified: true,
        }))
    }

    fn passes_trust_gate(&self, from_address: &str) -> Result<bool> {
        match self.config.trust_policy {
            TrustPolicy::AutoAccept => Ok(true),
            TrustPolicy::RequireVerify => Ok(matches!(
                self.book.get_trust_state(from_address)?,
                Some(TrustState::Verified)
            )),
            TrustPolicy::ApprovalRequired | TrustPolicy::AllowlistOnly => {
                self.book.is_trusted_for_inbox(from_address)
            }
        }
    }

    async fn sender_verify_key(&self, from_address: &str) -> Option<VerifyingKey> {
        if let Ok(Some(stored)) = self.book.get_public_key(from_address) {
            return deserialize_verify_key(&stored).ok();
        }
        let parsed = Address::parse(from_address).ok()?;
        let resolved = self
            .resolver
            .resolve_public_key(&parsed, &self.token, &self.config.relay_url)
            .await
            .ok()?;
        deserialize_verify_key(&resolved).ok()
    }

    // -- Receipts and sweeps -------------------------------------------------

    /// Fire-and-forget `receipt.read`, for plain messages only. Any
    /// non-`message` type produces no auto-response, so rerouted protocol
    /// traffic can never loop.
    async fn send_read_receipt(&self, message: &ReceivedMessage) {
        if message.message_type != MessageType::Message {
            return;
        }

        let outcome: Result<()> = async {
            let stored = self
                .book
                .get_public_key(&message.from_address)?
                .ok_or_else(|| {
                    UamError::Resolution(format!("no key cached for {}", message.from_address))
                })?;
            let sender_vk = deserialize_verify_key(&stored)?;

            let payload = serde_json::to_vec(&json!({ "message_id": message.message_id }))
                .map_err(|e| UamError::InvalidEnvelope(e.to_string()))?;
            let envelope = create_envelope(
                &self.address,
                &message.from_address,
                MessageType::ReceiptRead,
                &payload,
                &self.keypair,
                &sender_vk,
                EnvelopeOptions::default(),
            )?;
            self.transport.send(&envelope.to_wire()).await
        }
        .await;

        if let Err(e) = outcome {
            debug!(
                to = %message.from_address,
                message_id = %message.message_id,
                error = %e,
                "read receipt not sent"
            );
        }
    }

    /// Sweep pending handshakes older than the expiry window, emitting a
    /// best-effort `receipt.failed` for each before deleting it.
    async fn sweep_expired_pending(&self) {
        let expired = match self.book.expired_pending(PENDING_EXPIRY_DAYS) {
            Ok(expired) => expired,
            Err(e) => {
                warn!(error = %e, "pending sweep query failed");
                return;
            }
        };

        for entry in expired {
            if let Err(e) = self.send_handshake_expired(&entry).await {
                warn!(to = %entry.address, error = %e, "receipt.failed not delivered");
            }
            if let Err(e) = self.book.remove_pending(&entry.address) {
                warn!(address = %entry.address, error = %e, "could not drop expired pending entry");
            }
        }
    }

    async fn send_handshake_expired(&self, entry: &PendingHandshake) -> Result<()> {
        let card_value: Value = serde_json::from_str(&entry.contact_card)
            .map_err(|e| UamError::InvalidContactCard(e.to_string()))?;
        let card = ContactCard::from_value(&card_value, false)?;
        let recipient_vk = deserialize_verify_key(&card.public_key)?;

        let payload = serde_json::to_vec(&json!({
            "reason": "handshake_expired",
            "original_from": entry.address,
        }))
        .map_err(|e| UamError::InvalidEnvelope(e.to_string()))?;

        let envelope = create_envelope(
            &self.address,
            &entry.address,
            MessageType::ReceiptFailed,
            &payload,
            &self.keypair,
            &recipient_vk,
            EnvelopeOptions::default(),
        )?;
        self.transport.send(&envelope.to_wire()).await?;
        info!(to = %entry.address, "sent receipt.failed for expired handshake");
        Ok(())
    }

    // -- Multi-relay failover ------------------------------------------------

    /// Try each relay URL in order; first 2xx wins, all failures surface
    /// the last error.
    async fn send_with_failover(&self, wire: &Value, relay_urls: &[String]) -> Result<()> {
        let mut last_error = UamError::Transport("no relay urls to try".into());
        for url in relay_urls {
            let send_url = format!("{}/api/v1/send", normalize_relay_url(url));
            let attempt = self
                .http
                .post(&send_url)
                .timeout(FAILOVER_TIMEOUT)
                .bearer_auth(&self.token)
                .json(&json!({ "envelope": wire }))
                .send()
                .await;

            match attempt {
                Ok(resp) if resp.status().is_success() => {
                    debug!(relay = %url, "envelope delivered via failover relay");
                    return Ok(());
                }
                Ok(resp) => {
                    warn!(relay = %url, status = %resp.status(), "relay rejected envelope, trying next");
                    last_error =
                        UamError::Transport(format!("relay {url} rejected send: {}", resp.status()));
                }
                Err(e) => {
                    warn!(relay = %url, error = %e, "relay unreachable, trying next");
                    last_error = UamError::Transport(format!("relay {url} unreachable: {e}"));
                }
            }
        }
        Err(last_error)
    }
}

/// Normalize a relay URL for HTTP posting: trailing slash stripped, `/ws`
/// suffix removed, WebSocket schemes mapped onto HTTP.
fn normalize_relay_url(url: &str) -> String {
    let mut base = url.trim_end_matches('/').to_string();
    if let Some(stripped) = base.strip_suffix("/ws") {
        base = stripped.to_string();
    }
    base.replacen("wss://", "https://", 1)
        .replacen("ws://", "http://", 1)
}

/// `POST /api/v1/register` with the agent's name and public key. 409 means
/// the name is taken under a different key.
async fn register_with_relay(config: &AgentConfig, keypair: &Keypair) -> Result<(String, String)> {
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{}/api/v1/register", config.relay_url))
        .timeout(REGISTER_TIMEOUT)
        .json(&json!({
            "agent_name": config.name,
            "public_key": keypair.public_key_b64(),
        }))
        .send()
        .await
        .map_err(|e| UamError::Registration(format!("relay unreachable: {e}")))?;

    if resp.status() == reqwest::StatusCode::CONFLICT {
        return Err(UamError::Registration(format!(
            "address already registered with a different key: {}",
            config.address()
        )));
    }
    if !resp.status().is_success() {
        return Err(UamError::Registration(format!(
            "registration failed with status {}",
            resp.status()
        )));
    }

    let body: Value = resp
        .json()
        .await
        .map_err(|e| UamError::Registration(format!("malformed registration response: {e}")))?;
    let address = body
        .get("address")
        .and_then(Value::as_str)
        .ok_or_else(|| UamError::Registration("registration response missing address".into()))?;
    let token = body
        .get("token")
        .and_then(Value::as_str)
        .ok_or_else(|| UamError::Registration("registration response missing token".into()))?;
    Ok((address.to_string(), token.to_string()))
}
