//! End-to-end messaging scenarios over an in-memory relay.
//!
//! Two agents share a memory-backed "relay" (per-address envelope queues)
//! and a map-backed resolver, exercising the full pipeline: handshake on
//! first contact, envelope signing and encryption, trust gating, block
//! patterns, read receipts, and the pending-handshake expiry sweep.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tempfile::TempDir;

use uam::{
    Address, Agent, InboundHandler, Resolver, Transport, TrustPolicy, TrustState, UamError,
};

// ============================================================================
// In-memory relay harness
// ============================================================================

/// Store-and-forward queues keyed by recipient address.
struct MemoryRelay {
    queues: Mutex<HashMap<String, VecDeque<Value>>>,
}

impl MemoryRelay {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            queues: Mutex::new(HashMap::new()),
        })
    }

    fn deliver(&self, wire: &Value) {
        let to = wire["to"].as_str().expect("wire envelope has to").to_string();
        self.queues
            .lock()
            .unwrap()
            .entry(to)
            .or_default()
            .push_back(wire.clone());
    }

    fn take(&self, address: &str, limit: usize) -> Vec<Value> {
        let mut queues = self.queues.lock().unwrap();
        let queue = queues.entry(address.to_string()).or_default();
        let n = limit.min(queue.len());
        queue.drain(..n).collect()
    }

    /// Peek without consuming (queue inspection in assertions).
    fn snapshot(&self, address: &str) -> Vec<Value> {
        self.queues
            .lock()
            .unwrap()
            .get(address)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }
}

struct RelayTransport {
    relay: Arc<MemoryRelay>,
    address: String,
}

#[async_trait]
impl Transport for RelayTransport {
    async fn connect(&self) -> Result<(), UamError> {
        Ok(())
    }
    async fn disconnect(&self) -> Result<(), UamError> {
        Ok(())
    }
    async fn send(&self, envelope: &Value) -> Result<(), UamError> {
        self.relay.deliver(envelope);
        Ok(())
    }
    async fn receive(&self, limit: usize) -> Result<Vec<Value>, UamError> {
        Ok(self.relay.take(&self.address, limit))
    }
    async fn listen(&self, _handler: Arc<dyn InboundHandler>) -> Result<(), UamError> {
        Err(UamError::Transport("pull transport".into()))
    }
}

/// Resolver backed by a shared address → public-key map.
struct MapResolver {
    keys: Mutex<HashMap<String, String>>,
}

impl MapResolver {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            keys: Mutex::new(HashMap::new()),
        })
    }

    fn insert(&self, address: &str, public_key: String) {
        self.keys.lock().unwrap().insert(address.to_string(), public_key);
    }
}

#[async_trait]
impl Resolver for MapResolver {
    async fn resolve_public_key(
        &self,
        address: &Address,
        _token: &str,
        _relay_url: &str,
    ) -> Result<String, UamError> {
        self.keys
            .lock()
            .unwrap()
            .get(&address.full())
            .cloned()
            .ok_or_else(|| UamError::Resolution(format!("unknown address: {address}")))
    }
}

struct Net {
    relay: Arc<MemoryRelay>,
    resolver: Arc<MapResolver>,
    keys: TempDir,
}

impl Net {
    fn new() -> Self {
        Self {
            relay: MemoryRelay::new(),
            resolver: MapResolver::new(),
            keys: TempDir::new().unwrap(),
        }
    }

    async fn agent(&self, name: &str, policy: TrustPolicy) -> Agent {
        let address = format!("{name}::test.relay");
        let transport = Arc::new(RelayTransport {
            relay: self.relay.clone(),
            address: address.clone(),
        });
        let agent = Agent::builder(name)
            .relay_url("https://test.relay")
            .key_dir(self.keys.path().join(name))
            .token("test-token")
            .trust_policy(policy)
            .transport(transport)
            .resolver(self.resolver.clone())
            .in_memory_contacts()
            .connect()
            .await
            .expect("agent connects");
        self.resolver.insert(&address, agent.public_key());
        agent
    }
}

fn types_in(queue: &[Value]) -> Vec<String> {
    queue
        .iter()
        .map(|w| w["type"].as_str().unwrap_or("").to_string())
        .collect()
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn first_contact_send_and_receive() {
    let net = Net::new();
    let alice = net.agent("alice", TrustPolicy::AutoAccept).await;
    let bob = net.agent("bob", TrustPolicy::AutoAccept).await;

    let message_id = alice.send("bob::test.relay", "hello").await.unwrap();
    assert!(!message_id.is_empty());

    // Handshake request precedes the message on the wire
    assert_eq!(
        types_in(&net.relay.snapshot("bob::test.relay")),
        vec!["handshake.request", "message"]
    );
    assert_eq!(
        alice
            .contact_book()
            .get_trust_state("bob::test.relay")
            .unwrap(),
        Some(TrustState::HandshakeSent)
    );

    // Bob receives exactly the decrypted user message
    let inbox = bob.inbox(50).await.unwrap();
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].content, "hello");
    assert_eq!(inbox[0].from_address, "alice::test.relay");
    assert!(inbox[0].verified);

    // Bob auto-accepted: alice is provisional in his book
    assert_eq!(
        bob.contact_book()
            .get_trust_state("alice::test.relay")
            .unwrap(),
        Some(TrustState::Provisional)
    );

    // Alice's poll consumes the accept (pinning bob) and the read receipt
    let alice_inbox = alice.inbox(50).await.unwrap();
    assert!(alice_inbox.is_empty());
    let bob_record = alice
        .contact_book()
        .get_contact("bob::test.relay")
        .unwrap()
        .unwrap();
    assert_eq!(bob_record.trust_state, TrustState::Pinned);
    assert!(bob_record.pinned_at.is_some());
}

#[tokio::test]
async fn second_send_skips_handshake() {
    let net = Net::new();
    let alice = net.agent("alice", TrustPolicy::AutoAccept).await;
    let _bob = net.agent("bob", TrustPolicy::AutoAccept).await;

    alice.send("bob::test.relay", "one").await.unwrap();
    alice.send("bob::test.relay", "two").await.unwrap();

    assert_eq!(
        types_in(&net.relay.snapshot("bob::test.relay")),
        vec!["handshake.request", "message", "message"]
    );
}

#[tokio::test]
async fn concurrent_sends_emit_one_handshake() {
    let net = Net::new();
    let alice = net.agent("alice", TrustPolicy::AutoAccept).await;
    let _bob = net.agent("bob", TrustPolicy::AutoAccept).await;

    let (a, b, c) = tokio::join!(
        alice.send("bob::test.relay", "m1"),
        alice.send("bob::test.relay", "m2"),
        alice.send("bob::test.relay", "m3"),
    );
    a.unwrap();
    b.unwrap();
    c.unwrap();

    let queued = types_in(&net.relay.snapshot("bob::test.relay"));
    let handshakes = queued.iter().filter(|t| *t == "handshake.request").count();
    let messages = queued.iter().filter(|t| *t == "message").count();
    assert_eq!(handshakes, 1, "exactly one handshake for a new peer: {queued:?}");
    assert_eq!(messages, 3);
}

#[tokio::test]
async fn allowlist_only_denies_strangers() {
    let net = Net::new();
    let alice = net.agent("alice", TrustPolicy::AutoAccept).await;
    let bob = net.agent("bob", TrustPolicy::AllowlistOnly).await;

    alice.send("bob::test.relay", "let me in").await.unwrap();

    let inbox = bob.inbox(50).await.unwrap();
    assert!(inbox.is_empty(), "stranger's message must be filtered");
    assert!(!bob.contact_book().is_known("alice::test.relay"));
    assert!(bob.pending().await.unwrap().is_empty());

    // The deny reached alice's queue
    let alice_queue = types_in(&net.relay.snapshot("alice::test.relay"));
    assert!(alice_queue.contains(&"handshake.deny".to_string()), "{alice_queue:?}");
}

#[tokio::test]
async fn approval_required_flow() {
    let net = Net::new();
    let alice = net.agent("alice", TrustPolicy::AutoAccept).await;
    let bob = net.agent("bob", TrustPolicy::ApprovalRequired).await;

    alice.send("bob::test.relay", "first message").await.unwrap();

    // Message is held back until approval
    assert!(bob.inbox(50).await.unwrap().is_empty());
    let pending = bob.pending().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].address, "alice::test.relay");

    bob.approve("alice::test.relay").await.unwrap();
    let record = bob
        .contact_book()
        .get_contact("alice::test.relay")
        .unwrap()
        .unwrap();
    assert_eq!(record.trust_state, TrustState::Trusted);
    assert_eq!(record.trust_source.as_deref(), Some("explicit-approval"));
    assert!(bob.pending().await.unwrap().is_empty());

    // Alice's poll pins bob via the accept
    alice.inbox(50).await.unwrap();
    assert_eq!(
        alice
            .contact_book()
            .get_trust_state("bob::test.relay")
            .unwrap(),
        Some(TrustState::Pinned)
    );

    // Approved sender now passes the gate
    alice.send("bob::test.relay", "second message").await.unwrap();
    let inbox = bob.inbox(50).await.unwrap();
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].content, "second message");
}

#[tokio::test]
async fn deny_drops_pending_without_contact() {
    let net = Net::new();
    let alice = net.agent("alice", TrustPolicy::AutoAccept).await;
    let bob = net.agent("bob", TrustPolicy::ApprovalRequired).await;

    alice.send("bob::test.relay", "hi").await.unwrap();
    bob.inbox(50).await.unwrap();
    assert_eq!(bob.pending().await.unwrap().len(), 1);

    bob.deny("alice::test.relay").await.unwrap();
    assert!(bob.pending().await.unwrap().is_empty());
    assert!(!bob.contact_book().is_known("alice::test.relay"));

    let alice_queue = types_in(&net.relay.snapshot("alice::test.relay"));
    assert!(alice_queue.contains(&"handshake.deny".to_string()));

    // Approving or denying again errors: nothing is pending
    assert!(bob.approve("alice::test.relay").await.is_err());
    assert!(bob.deny("alice::test.relay").await.is_err());
}

#[tokio::test]
async fn blocked_senders_never_surface() {
    let net = Net::new();
    let alice = net.agent("alice", TrustPolicy::AutoAccept).await;
    let carol = net.agent("carol", TrustPolicy::AutoAccept).await;
    let bob = net.agent("bob", TrustPolicy::AutoAccept).await;

    // Establish contact first, then block
    alice.send("bob::test.relay", "pre-block").await.unwrap();
    bob.inbox(50).await.unwrap();

    bob.block("alice::test.relay").await.unwrap();
    bob.block("*::test.relay").await.unwrap();
    bob.unblock("*::test.relay").await.unwrap();

    alice.send("bob::test.relay", "post-block").await.unwrap();
    assert!(bob.inbox(50).await.unwrap().is_empty());

    // Domain wildcard blocks a never-seen sender too
    bob.block("*::test.relay").await.unwrap();
    carol.send("bob::test.relay", "wildcard").await.unwrap();
    assert!(bob.inbox(50).await.unwrap().is_empty());
}

#[tokio::test]
async fn receipts_and_handshakes_trigger_no_receipts() {
    let net = Net::new();
    let alice = net.agent("alice", TrustPolicy::AutoAccept).await;
    let bob = net.agent("bob", TrustPolicy::AutoAccept).await;

    alice.send("bob::test.relay", "hello").await.unwrap();
    bob.inbox(50).await.unwrap(); // emits accept + read receipt to alice

    let before = types_in(&net.relay.snapshot("alice::test.relay"));
    assert!(before.contains(&"receipt.read".to_string()), "{before:?}");

    // Alice consumes accept + receipt; none of them may generate traffic
    alice.inbox(50).await.unwrap();
    assert!(net.relay.snapshot("bob::test.relay").is_empty());

    // And polling again is quiescent in both directions
    bob.inbox(50).await.unwrap();
    alice.inbox(50).await.unwrap();
    assert!(net.relay.snapshot("alice::test.relay").is_empty());
    assert!(net.relay.snapshot("bob::test.relay").is_empty());
}

#[tokio::test]
async fn expired_pending_swept_with_failure_receipt() {
    let net = Net::new();
    let alice = net.agent("alice", TrustPolicy::AutoAccept).await;
    let bob = net.agent("bob", TrustPolicy::ApprovalRequired).await;

    alice.send("bob::test.relay", "knock knock").await.unwrap();
    bob.inbox(50).await.unwrap();
    assert_eq!(bob.pending().await.unwrap().len(), 1);

    // Age the entry past the 7-day window; the next poll sweeps it
    bob.contact_book()
        .backdate_pending("alice::test.relay", 8)
        .unwrap();
    bob.inbox(50).await.unwrap();

    assert!(bob.pending().await.unwrap().is_empty());
    let alice_queue = net.relay.snapshot("alice::test.relay");
    let failed: Vec<&Value> = alice_queue
        .iter()
        .filter(|w| w["type"] == "receipt.failed")
        .collect();
    assert_eq!(failed.len(), 1, "{:?}", types_in(&alice_queue));
}

#[tokio::test]
async fn tampered_envelope_dropped_silently() {
    let net = Net::new();
    let alice = net.agent("alice", TrustPolicy::AutoAccept).await;
    let bob = net.agent("bob", TrustPolicy::AutoAccept).await;

    alice.send("bob::test.relay", "original").await.unwrap();

    // Corrupt the queued message payload in-flight
    {
        let mut queues = net.relay.queues.lock().unwrap();
        let queue = queues.get_mut("bob::test.relay").unwrap();
        for wire in queue.iter_mut() {
            if wire["type"] == "message" {
                wire["payload"] = Value::String("dGFtcGVyZWQ".into());
            }
        }
    }

    // The poll succeeds and simply omits the corrupted envelope
    assert!(bob.inbox(50).await.unwrap().is_empty());
}

#[tokio::test]
async fn thread_id_and_metadata_survive_delivery() {
    let net = Net::new();
    let alice = net.agent("alice", TrustPolicy::AutoAccept).await;
    let bob = net.agent("bob", TrustPolicy::AutoAccept).await;

    alice
        .send_with(
            "bob::test.relay",
            "threaded",
            uam::SendOptions {
                thread_id: Some("thread-42".into()),
                attachments: None,
            },
        )
        .await
        .unwrap();

    let inbox = bob.inbox(50).await.unwrap();
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].thread_id.as_deref(), Some("thread-42"));
    assert_eq!(inbox[0].media_type.as_deref(), Some("text/plain"));
}

#[tokio::test]
async fn contact_card_is_self_verifying() {
    let net = Net::new();
    let alice = net.agent("alice", TrustPolicy::AutoAccept).await;

    let card = alice.contact_card().unwrap();
    assert_eq!(card.address, "alice::test.relay");
    assert_eq!(card.public_key, alice.public_key());
    uam::verify_contact_card(&card).unwrap();
}

#[tokio::test]
async fn close_is_idempotent() {
    let net = Net::new();
    let alice = net.agent("alice", TrustPolicy::AutoAccept).await;
    alice.close().await.unwrap();
    alice.close().await.unwrap();
    // operations needing the book now fail cleanly
    assert!(alice.send("bob::test.relay", "x").await.is_err());
}
