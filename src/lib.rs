//! # UAM - Universal Agent Messaging Protocol Core
//!
//! UAM lets autonomous software agents exchange end-to-end encrypted,
//! signed messages across independently operated relay servers:
//!
//! - **Addresses**: `agent::domain` identifiers with strict normalization
//! - **Envelopes**: Ed25519-signed, NaCl-Box/SealedBox-encrypted wrappers
//!   with a cross-language canonical JSON signature image
//! - **Trust**: trust-on-first-use key pinning driven by a three-phase
//!   handshake and a policy-governed contact book
//! - **Resolution**: relay API, DNS TXT + HTTPS well-known, and on-chain
//!   registry tiers for mapping addresses to public keys
//! - **Transports**: a pull (HTTP) and a push (WebSocket) relay channel
//!   behind one trait seam
//!
//! ## Quick Start
//!
//! ```ignore
//! let agent = Agent::builder("alice").connect().await?;
//!
//! // First send to an unknown peer initiates the handshake automatically
//! agent.send("bob::relay.example.net", "hello bob").await?;
//!
//! for msg in agent.inbox(50).await? {
//!     println!("{}: {}", msg.from_address, msg.content);
//! }
//! agent.close().await?;
//! ```
//!
//! ## Security Model
//!
//! - Every envelope is signed over a canonical byte image; inbound
//!   envelopes failing verification or decryption are silently dropped
//!   (pollution defense - one bad envelope never aborts a poll)
//! - Payloads are encrypted to the recipient's Curve25519 key derived
//!   from their Ed25519 identity; handshake requests use SealedBox so
//!   strangers can make first contact
//! - After the first successful handshake the peer's key is pinned; any
//!   later key change is a hard failure, never a silent overwrite
//! - Static identity keys: no forward secrecy, no revocation (out of
//!   scope by design)
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `agent` | High-level API composing all components |
//! | `address` | `agent::domain` parsing and normalization |
//! | `crypto` | Canonical JSON, Ed25519, NaCl Box/SealedBox, fingerprints |
//! | `envelope` | Signed encrypted message envelopes, wire mapping |
//! | `card` | Self-signed contact cards |
//! | `keystore` | Seed and bearer-token persistence |
//! | `book` | SQLite contact book: trust states, pending queue, blocks |
//! | `resolver` | Tiered address-to-key resolution |
//! | `registry` | On-chain name registry reads (Tier 3) |
//! | `transport` | HTTP pull and WebSocket push relay transports |
//! | `handshake` | Three-phase first-contact trust negotiation |
//! | `config` | Agent configuration and policy selection |

mod address;
mod agent;
mod book;
mod card;
mod config;
mod crypto;
mod envelope;
mod error;
mod handshake;
mod keystore;
mod registry;
mod resolver;
mod transport;

pub use address::Address;
pub use agent::{Agent, AgentBuilder, ReceivedMessage, SendOptions};
pub use book::{
    BlockedPattern, ContactBook, ContactRecord, ContactUpdate, PendingHandshake, TrustState,
};
pub use card::{create_contact_card, verify_contact_card, ContactCard, ContactCardOptions};
pub use config::{AgentConfig, ConfigOverrides, TransportKind, TrustPolicy};
pub use crypto::{
    b64_decode, b64_encode, canonicalize, decrypt_box, decrypt_sealed, deserialize_verify_key,
    encrypt_box, encrypt_sealed, fingerprint, generate_nonce, sign_message, verify_signature,
    Keypair,
};
pub use envelope::{
    create_envelope, validate_envelope_size, verify_envelope, EnvelopeOptions, MessageEnvelope,
    MessageType, MAX_ENVELOPE_SIZE, UAM_VERSION,
};
pub use error::{Result, UamError};
pub use handshake::{HandshakeManager, LocalIdentity};
pub use keystore::{KeyStore, SEED_ENV_VAR};
pub use registry::{ChainResolver, RegistryRecord};
pub use resolver::{
    extract_public_key, extract_well_known_key, generate_txt_record, is_public_host,
    parse_uam_txt, DnsResolver, RelayResolver, Resolver, SmartResolver,
};
pub use transport::{HttpTransport, InboundHandler, Transport, WebSocketTransport};
