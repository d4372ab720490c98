//! # Handshake Flow
//!
//! Three-phase trust negotiation on first contact:
//!
//! 1. `handshake.request` — the initiator sends its contact card,
//!    SealedBox-encrypted (the recipient may not know the sender yet)
//! 2. `handshake.accept` — the recipient stores the contact and replies
//!    with its own card
//! 3. `handshake.deny` — the recipient rejects
//!
//! The manager mutates the [`ContactBook`] to record decisions and emits
//! reply envelopes through a [`Transport`] handle. It never holds a
//! reference back to the agent.
//!
//! Policy table for an inbound request:
//!
//! | Policy | Action | Resulting state |
//! |--------|--------|-----------------|
//! | auto-accept | store contact, reply accept | `provisional` |
//! | allowlist-only | reply deny | none |
//! | approval-required | queue for review | pending |
//! | require-verify | queue for review | pending |
//!
//! A request whose card key conflicts with a locked stored key is denied
//! and surfaces as a [`UamError::KeyPinning`]; the stored key is never
//! replaced.

use std::sync::Arc;

use ed25519_dalek::VerifyingKey;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::book::{ContactBook, ContactUpdate, TrustState};
use crate::card::{create_contact_card, ContactCard, ContactCardOptions};
use crate::config::TrustPolicy;
use crate::crypto::{b64_encode, decrypt_sealed, Keypair};
use crate::envelope::{create_envelope, EnvelopeOptions, MessageEnvelope, MessageType};
use crate::error::{Result, UamError};
use crate::transport::Transport;

/// The local agent's identity as the handshake layer needs it.
#[derive(Clone)]
pub struct LocalIdentity {
    pub address: String,
    pub display_name: String,
    /// Relay endpoint advertised in outgoing contact cards.
    pub relay: String,
    pub keypair: Keypair,
}

/// Drives the first-contact handshake flow against the contact book.
pub struct HandshakeManager {
    book: Arc<ContactBook>,
    policy: TrustPolicy,
    transport: Arc<dyn Transport>,
    identity: LocalIdentity,
}

impl HandshakeManager {
    pub fn new(
        book: Arc<ContactBook>,
        policy: TrustPolicy,
        transport: Arc<dyn Transport>,
        identity: LocalIdentity,
    ) -> Self {
        Self {
            book,
            policy,
            transport,
            identity,
        }
    }

    pub fn policy(&self) -> TrustPolicy {
        self.policy
    }

    /// The local agent's signed contact card.
    pub fn own_card(&self) -> Result<ContactCard> {
        create_contact_card(
            &self.identity.address,
            &self.identity.display_name,
            &self.identity.relay,
            &self.identity.keypair,
            ContactCardOptions::default(),
        )
    }

    /// Build a `handshake.request` wire envelope carrying our contact card.
    pub fn create_request(&self, to_address: &str, recipient_vk: &VerifyingKey) -> Result<Value> {
        let card_json = serde_json::to_vec(&self.own_card()?.to_value())
            .map_err(|e| UamError::InvalidContactCard(e.to_string()))?;

        let envelope = create_envelope(
            &self.identity.address,
            to_address,
            MessageType::HandshakeRequest,
            &card_json,
            &self.identity.keypair,
            recipient_vk,
            EnvelopeOptions::default(),
        )?;
        Ok(envelope.to_wire())
    }

    /// Route an inbound handshake envelope. The caller has already
    /// verified the envelope signature.
    pub async fn handle_inbound(
        &self,
        envelope: &MessageEnvelope,
        sender_vk: &VerifyingKey,
    ) -> Result<()> {
        match envelope.message_type {
            MessageType::HandshakeRequest => self.handle_request(envelope, sender_vk).await,
            MessageType::HandshakeAccept => self.handle_accept(envelope, sender_vk),
            MessageType::HandshakeDeny => {
                warn!(
                    from = %envelope.from_address,
                    message_id = %envelope.message_id,
                    "handshake denied by peer"
                );
                Ok(())
            }
            other => Err(UamError::InvalidEnvelope(format!(
                "{other} is not a handshake type"
            ))),
        }
    }

    /// Inbound `handshake.request`: decrypt the card, apply the policy.
    async fn handle_request(
        &self,
        envelope: &MessageEnvelope,
        sender_vk: &VerifyingKey,
    ) -> Result<()> {
        let plaintext = decrypt_sealed(&envelope.payload, &self.identity.keypair)?;
        let card_value: Value = serde_json::from_slice(&plaintext)
            .map_err(|e| UamError::InvalidContactCard(format!("card is not JSON: {e}")))?;
        let card = ContactCard::from_value(&card_value, true)?;

        match self.policy {
            TrustPolicy::AutoAccept => {
                let stored = self.book.add_contact(
                    ContactUpdate::new(&card.address, &card.public_key, TrustState::Provisional)
                        .display_name(&card.display_name)
                        .trust_source("auto-accepted-provisional")
                        .relay(&card.relay),
                );
                match stored {
                    Err(err @ UamError::KeyPinning { .. }) => {
                        // Key conflict against a locked row: deny, keep the book
                        warn!(
                            from = %envelope.from_address,
                            "handshake request key conflicts with pinned contact, denying"
                        );
                        self.send_deny(&envelope.from_address, sender_vk, "key-mismatch")
                            .await?;
                        return Err(err);
                    }
                    Err(other) => return Err(other),
                    Ok(()) => {}
                }
                self.send_accept(&envelope.from_address, sender_vk).await?;
                info!(from = %envelope.from_address, "auto-accepted handshake");
            }
            TrustPolicy::AllowlistOnly => {
                self.send_deny(&envelope.from_address, sender_vk, "allowlist-only")
                    .await?;
                info!(from = %envelope.from_address, "handshake auto-denied (allowlist-only)");
            }
            TrustPolicy::ApprovalRequired | TrustPolicy::RequireVerify => {
                let card_json = serde_json::to_string(&card_value)
                    .map_err(|e| UamError::InvalidContactCard(e.to_string()))?;
                self.book.add_pending(&envelope.from_address, &card_json)?;
                info!(
                    from = %envelope.from_address,
                    policy = %self.policy,
                    "handshake queued for approval"
                );
            }
        }
        Ok(())
    }

    /// Inbound `handshake.accept`: pin the peer (TOFU lock).
    fn handle_accept(&self, envelope: &MessageEnvelope, sender_vk: &VerifyingKey) -> Result<()> {
        self.book.add_contact(ContactUpdate::new(
            &envelope.from_address,
            b64_encode(sender_vk.as_bytes()),
            TrustState::Pinned,
        ))?;
        self.book.set_pinned_at(&envelope.from_address)?;
        info!(from = %envelope.from_address, "handshake accepted, contact pinned");
        Ok(())
    }

    /// Emit `handshake.accept`, embedding our own card so the peer can
    /// store it (mirrors the request format).
    pub async fn send_accept(&self, to_address: &str, recipient_vk: &VerifyingKey) -> Result<()> {
        let payload = serde_json::to_vec(&json!({
            "status": "accepted",
            "contact_card": self.own_card()?.to_value(),
        }))
        .map_err(|e| UamError::InvalidContactCard(e.to_string()))?;

        let envelope = create_envelope(
            &self.identity.address,
            to_address,
            MessageType::HandshakeAccept,
            &payload,
            &self.identity.keypair,
            recipient_vk,
            EnvelopeOptions::default(),
        )?;
        self.transport.send(&envelope.to_wire()).await
    }

    /// Emit `handshake.deny` with a reason tag.
    pub async fn send_deny(
        &self,
        to_address: &str,
        recipient_vk: &VerifyingKey,
        reason: &str,
    ) -> Result<()> {
        let payload = serde_json::to_vec(&json!({
            "status": "denied",
            "reason": reason,
        }))
        .map_err(|e| UamError::InvalidContactCard(e.to_string()))?;

        let envelope = create_envelope(
            &self.identity.address,
            to_address,
            MessageType::HandshakeDeny,
            &payload,
            &self.identity.keypair,
            recipient_vk,
            EnvelopeOptions::default(),
        )?;
        self.transport.send(&envelope.to_wire()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::card::verify_contact_card;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Captures every envelope instead of sending it anywhere.
    struct CaptureTransport {
        sent: Mutex<Vec<Value>>,
    }

    impl CaptureTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
            })
        }

        fn sent_types(&self) -> Vec<String> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|w| w["type"].as_str().unwrap_or("").to_string())
                .collect()
        }
    }

    #[async_trait]
    impl Transport for CaptureTransport {
        async fn connect(&self) -> Result<()> {
            Ok(())
        }
        async fn disconnect(&self) -> Result<()> {
            Ok(())
        }
        async fn send(&self, envelope: &Value) -> Result<()> {
            self.sent.lock().unwrap().push(envelope.clone());
            Ok(())
        }
        async fn receive(&self, _limit: usize) -> Result<Vec<Value>> {
            Ok(Vec::new())
        }
        async fn listen(&self, _handler: Arc<dyn crate::transport::InboundHandler>) -> Result<()> {
            Ok(())
        }
    }

    fn manager(policy: TrustPolicy) -> (HandshakeManager, Arc<CaptureTransport>, Keypair) {
        let keypair = Keypair::generate();
        let transport = CaptureTransport::new();
        let manager = HandshakeManager::new(
            Arc::new(ContactBook::open_in_memory().unwrap()),
            policy,
            transport.clone(),
            LocalIdentity {
                address: "bob::relay.example.net".into(),
                display_name: "Bob".into(),
                relay: "wss://relay.example.net/ws".into(),
                keypair: keypair.clone(),
            },
        );
        (manager, transport, keypair)
    }

    /// A request envelope from a fresh peer, addressed to `bob`.
    fn request_from(sender: &Keypair, sender_addr: &str, bob_vk: &VerifyingKey) -> MessageEnvelope {
        let peer_manager = HandshakeManager::new(
            Arc::new(ContactBook::open_in_memory().unwrap()),
            TrustPolicy::AutoAccept,
            CaptureTransport::new(),
            LocalIdentity {
                address: sender_addr.into(),
                display_name: sender_addr.split("::").next().unwrap().into(),
                relay: "wss://relay.example.net/ws".into(),
                keypair: sender.clone(),
            },
        );
        let wire = peer_manager
            .create_request("bob::relay.example.net", bob_vk)
            .unwrap();
        MessageEnvelope::from_wire(&wire).unwrap()
    }

    #[tokio::test]
    async fn request_wire_shape() {
        let (manager, _, bob) = manager(TrustPolicy::AutoAccept);
        let peer = Keypair::generate();
        let wire = manager
            .create_request("alice::relay.example.net", &peer.verifying_key())
            .unwrap();
        assert_eq!(wire["type"], "handshake.request");
        assert_eq!(wire["from"], "bob::relay.example.net");
        assert_eq!(wire["to"], "alice::relay.example.net");
        // receiver can decrypt the card with only their own key
        let envelope = MessageEnvelope::from_wire(&wire).unwrap();
        let card_bytes = decrypt_sealed(&envelope.payload, &peer).unwrap();
        let card = ContactCard::from_value(&serde_json::from_slice(&card_bytes).unwrap(), true).unwrap();
        assert_eq!(card.address, "bob::relay.example.net");
        assert_eq!(card.public_key, bob.public_key_b64());
    }

    #[tokio::test]
    async fn auto_accept_stores_provisional_and_replies() {
        let (manager, transport, bob) = manager(TrustPolicy::AutoAccept);
        let alice = Keypair::generate();
        let request = request_from(&alice, "alice::relay.example.net", &bob.verifying_key());

        manager
            .handle_inbound(&request, &alice.verifying_key())
            .await
            .unwrap();

        let record = manager
            .book
            .get_contact("alice::relay.example.net")
            .unwrap()
            .unwrap();
        assert_eq!(record.trust_state, TrustState::Provisional);
        assert_eq!(record.trust_source.as_deref(), Some("auto-accepted-provisional"));
        assert_eq!(transport.sent_types(), vec!["handshake.accept"]);
    }

    #[tokio::test]
    async fn allowlist_only_denies_without_storing() {
        let (manager, transport, bob) = manager(TrustPolicy::AllowlistOnly);
        let alice = Keypair::generate();
        let request = request_from(&alice, "alice::relay.example.net", &bob.verifying_key());

        manager
            .handle_inbound(&request, &alice.verifying_key())
            .await
            .unwrap();

        assert!(!manager.book.is_known("alice::relay.example.net"));
        assert!(manager.book.get_pending().unwrap().is_empty());
        assert_eq!(transport.sent_types(), vec!["handshake.deny"]);
    }

    #[tokio::test]
    async fn approval_required_queues_pending() {
        for policy in [TrustPolicy::ApprovalRequired, TrustPolicy::RequireVerify] {
            let (manager, transport, bob) = manager(policy);
            let alice = Keypair::generate();
            let request = request_from(&alice, "alice::relay.example.net", &bob.verifying_key());

            manager
                .handle_inbound(&request, &alice.verifying_key())
                .await
                .unwrap();

            let pending = manager.book.get_pending().unwrap();
            assert_eq!(pending.len(), 1);
            assert_eq!(pending[0].address, "alice::relay.example.net");
            assert!(!manager.book.is_known("alice::relay.example.net"));
            assert!(transport.sent_types().is_empty());

            // the stored card re-parses and re-verifies
            let card_value: Value = serde_json::from_str(&pending[0].contact_card).unwrap();
            let card = ContactCard::from_value(&card_value, true).unwrap();
            assert!(verify_contact_card(&card).is_ok());
        }
    }

    #[tokio::test]
    async fn accept_pins_contact_with_timestamp() {
        let (manager, _, _) = manager(TrustPolicy::AutoAccept);
        let alice = Keypair::generate();
        // a handshake.accept arriving from alice
        let accept = create_envelope(
            "alice::relay.example.net",
            "bob::relay.example.net",
            MessageType::HandshakeAccept,
            b"{\"status\":\"accepted\"}",
            &alice,
            &manager.identity.keypair.verifying_key(),
            EnvelopeOptions::default(),
        )
        .unwrap();

        manager
            .handle_inbound(&accept, &alice.verifying_key())
            .await
            .unwrap();

        let record = manager
            .book
            .get_contact("alice::relay.example.net")
            .unwrap()
            .unwrap();
        assert_eq!(record.trust_state, TrustState::Pinned);
        assert_eq!(record.public_key, alice.public_key_b64());
        assert!(record.pinned_at.is_some());
    }

    #[tokio::test]
    async fn deny_is_logged_without_state_change() {
        let (manager, transport, _) = manager(TrustPolicy::AutoAccept);
        let alice = Keypair::generate();
        let deny = create_envelope(
            "alice::relay.example.net",
            "bob::relay.example.net",
            MessageType::HandshakeDeny,
            b"{\"status\":\"denied\"}",
            &alice,
            &manager.identity.keypair.verifying_key(),
            EnvelopeOptions::default(),
        )
        .unwrap();

        manager
            .handle_inbound(&deny, &alice.verifying_key())
            .await
            .unwrap();
        assert!(!manager.book.is_known("alice::relay.example.net"));
        assert!(transport.sent_types().is_empty());
    }

    #[tokio::test]
    async fn key_conflict_request_denied_and_book_untouched() {
        let (manager, transport, bob) = manager(TrustPolicy::AutoAccept);

        // alice is already pinned under her real key
        let real_alice = Keypair::generate();
        manager
            .book
            .add_contact(ContactUpdate::new(
                "alice::relay.example.net",
                real_alice.public_key_b64(),
                TrustState::Pinned,
            ))
            .unwrap();

        // an imposter replays alice's address with a different key
        let imposter = Keypair::generate();
        let request = request_from(&imposter, "alice::relay.example.net", &bob.verifying_key());

        let err = manager
            .handle_inbound(&request, &imposter.verifying_key())
            .await
            .unwrap_err();
        assert!(matches!(err, UamError::KeyPinning { .. }));

        // stored key unchanged, deny emitted
        assert_eq!(
            manager
                .book
                .get_public_key("alice::relay.example.net")
                .unwrap()
                .as_deref(),
            Some(real_alice.public_key_b64().as_str())
        );
        assert_eq!(transport.sent_types(), vec!["handshake.deny"]);
    }

    #[tokio::test]
    async fn non_handshake_type_rejected() {
        let (manager, _, _) = manager(TrustPolicy::AutoAccept);
        let alice = Keypair::generate();
        let message = create_envelope(
            "alice::relay.example.net",
            "bob::relay.example.net",
            MessageType::Message,
            b"hi",
            &alice,
            &manager.identity.keypair.verifying_key(),
            EnvelopeOptions::default(),
        )
        .unwrap();
        assert!(manager
            .handle_inbound(&message, &alice.verifying_key())
            .await
            .is_err());
    }
}
