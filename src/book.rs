//! # Contact Book
//!
//! SQLite-backed local trust store: known contacts with their pinned keys
//! and trust state, the pending-handshake queue, and block patterns.
//!
//! ## Caching
//!
//! On open, every known address and every block pattern is loaded into
//! memory so `is_known` and `is_blocked` are O(1) with no I/O. Cache
//! mutations happen inside the same critical section as the corresponding
//! durable write; a single mutex over connection + caches gives the
//! required serialization.
//!
//! ## TOFU guard
//!
//! `add_contact` is the single write path for contact rows, and it refuses
//! to change the stored key of a `trusted`, `pinned`, or `verified`
//! contact. A key mismatch against a locked row is a hard
//! [`UamError::KeyPinning`] failure, never a silent overwrite.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::error::{Result, UamError};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS contacts (
    address      TEXT PRIMARY KEY,
    public_key   TEXT NOT NULL,
    display_name TEXT,
    trust_state  TEXT NOT NULL DEFAULT 'unknown',
    trust_source TEXT,
    relay        TEXT,
    relays_json  TEXT,
    pinned_at    TEXT,
    first_seen   TEXT NOT NULL DEFAULT (datetime('now')),
    last_seen    TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS pending_handshakes (
    address      TEXT PRIMARY KEY,
    contact_card TEXT NOT NULL,
    received_at  TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS blocked_patterns (
    pattern     TEXT PRIMARY KEY,
    blocked_at  TEXT NOT NULL DEFAULT (datetime('now'))
);
";

/// Current schema version stamped into `PRAGMA user_version`.
const SCHEMA_VERSION: i64 = 3;

// ============================================================================
// Trust states
// ============================================================================

/// Trust lifecycle of a contact row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TrustState {
    Unknown,
    /// Key resolved from the network, no handshake yet.
    Unverified,
    /// We initiated a handshake, awaiting the peer's accept.
    HandshakeSent,
    /// Peer's handshake auto-accepted; upgrades to trusted/pinned later.
    Provisional,
    /// Explicitly approved by the local user.
    Trusted,
    /// TOFU lock: the peer's accept landed and the key is pinned.
    Pinned,
    /// Fingerprint manually verified out-of-band.
    Verified,
}

impl TrustState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrustState::Unknown => "unknown",
            TrustState::Unverified => "unverified",
            TrustState::HandshakeSent => "handshake-sent",
            TrustState::Provisional => "provisional",
            TrustState::Trusted => "trusted",
            TrustState::Pinned => "pinned",
            TrustState::Verified => "verified",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        Ok(match s {
            "unknown" => TrustState::Unknown,
            "unverified" => TrustState::Unverified,
            "handshake-sent" => TrustState::HandshakeSent,
            "provisional" => TrustState::Provisional,
            "trusted" => TrustState::Trusted,
            "pinned" => TrustState::Pinned,
            "verified" => TrustState::Verified,
            other => return Err(UamError::Storage(format!("unknown trust state: {other:?}"))),
        })
    }

    /// Locked states never accept a different key through `add_contact`.
    pub fn is_locked(&self) -> bool {
        matches!(
            self,
            TrustState::Trusted | TrustState::Pinned | TrustState::Verified
        )
    }
}

impl std::fmt::Display for TrustState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Row types
// ============================================================================

/// A contact row as stored.
#[derive(Clone, Debug)]
pub struct ContactRecord {
    pub address: String,
    pub public_key: String,
    pub display_name: Option<String>,
    pub trust_state: TrustState,
    pub trust_source: Option<String>,
    pub relay: Option<String>,
    pub relays: Option<Vec<String>>,
    pub pinned_at: Option<String>,
    pub first_seen: String,
    pub last_seen: String,
}

/// A queued inbound handshake awaiting local approval.
#[derive(Clone, Debug)]
pub struct PendingHandshake {
    pub address: String,
    pub contact_card: String,
    pub received_at: String,
}

/// A block pattern row.
#[derive(Clone, Debug)]
pub struct BlockedPattern {
    pub pattern: String,
    pub blocked_at: String,
}

/// Parameters for an `add_contact` upsert.
///
/// `trust_source`, `relay`, and `relays` follow the coalescing rule: a
/// `None` here preserves whatever the row already holds, so incidental
/// updates never demote provenance.
#[derive(Clone, Debug)]
pub struct ContactUpdate {
    pub address: String,
    pub public_key: String,
    pub trust_state: TrustState,
    pub display_name: Option<String>,
    pub trust_source: Option<String>,
    pub relay: Option<String>,
    pub relays: Option<Vec<String>>,
}

impl ContactUpdate {
    pub fn new(address: impl Into<String>, public_key: impl Into<String>, trust_state: TrustState) -> Self {
        Self {
            address: address.into(),
            public_key: public_key.into(),
            trust_state,
            display_name: None,
            trust_source: None,
            relay: None,
            relays: None,
        }
    }

    pub fn display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn trust_source(mut self, source: impl Into<String>) -> Self {
        self.trust_source = Some(source.into());
        self
    }

    pub fn relay(mut self, relay: impl Into<String>) -> Self {
        self.relay = Some(relay.into());
        self
    }

    pub fn relays(mut self, relays: Vec<String>) -> Self {
        self.relays = Some(relays);
        self
    }
}

// ============================================================================
// ContactBook
// ============================================================================

struct Inner {
    conn: Option<Connection>,
    known: HashSet<String>,
    blocked_exact: HashSet<String>,
    blocked_domains: HashSet<String>,
}

impl Inner {
    fn conn(&self) -> Result<&Connection> {
        self.conn
            .as_ref()
            .ok_or_else(|| UamError::Storage("contact book is closed".into()))
    }
}

/// Durable local trust store with in-memory lookup caches.
pub struct ContactBook {
    inner: Mutex<Inner>,
}

impl ContactBook {
    /// Open (creating if needed) the contact database under
    /// `{data_dir}/contacts/contacts.db` and load the caches.
    pub fn open(data_dir: impl AsRef<Path>) -> Result<ContactBook> {
        let db_path = data_dir.as_ref().join("contacts").join("contacts.db");
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| UamError::Storage(format!("cannot create contact dir: {e}")))?;
        }
        let conn = Connection::open(&db_path)?;
        Self::init(conn)
    }

    /// Open an in-memory contact book (tests and ephemeral agents).
    pub fn open_in_memory() -> Result<ContactBook> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<ContactBook> {
        conn.execute_batch(SCHEMA)?;
        let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if version < SCHEMA_VERSION {
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        }

        let mut known = HashSet::new();
        {
            let mut stmt = conn.prepare("SELECT address FROM contacts")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            for row in rows {
                known.insert(row?);
            }
        }

        let mut blocked_exact = HashSet::new();
        let mut blocked_domains = HashSet::new();
        {
            let mut stmt = conn.prepare("SELECT pattern FROM blocked_patterns")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            for row in rows {
                cache_block_pattern(&row?, &mut blocked_exact, &mut blocked_domains);
            }
        }

        Ok(ContactBook {
            inner: Mutex::new(Inner {
                conn: Some(conn),
                known,
                blocked_exact,
                blocked_domains,
            }),
        })
    }

    /// Close the database. Idempotent; later calls on other methods fail
    /// with a storage error.
    pub fn close(&self) {
        let mut inner = self.inner.lock().expect("contact book lock poisoned");
        if let Some(conn) = inner.conn.take() {
            // Connection::close returns the connection on failure; dropping
            // it then is the best remaining option.
            let _ = conn.close();
        }
    }

    // -- Cached lookups ------------------------------------------------------

    /// Whether the address has a contact row. In-memory, no I/O.
    pub fn is_known(&self, address: &str) -> bool {
        let inner = self.inner.lock().expect("contact book lock poisoned");
        inner.known.contains(address)
    }

    /// Whether the address matches an exact or `*::domain` block pattern.
    pub fn is_blocked(&self, address: &str) -> bool {
        let inner = self.inner.lock().expect("contact book lock poisoned");
        if inner.blocked_exact.contains(address) {
            return true;
        }
        if let Some((_, domain)) = address.split_once("::") {
            return inner.blocked_domains.contains(domain);
        }
        false
    }

    // -- Contacts ------------------------------------------------------------

    /// Insert or update a contact.
    ///
    /// Updates `public_key`, `display_name`, `trust_state`, and `last_seen`;
    /// preserves `trust_source`/`relay`/`relays_json` when the update passes
    /// `None`. Refuses key changes against locked rows (TOFU).
    pub fn add_contact(&self, update: ContactUpdate) -> Result<()> {
        let mut inner = self.inner.lock().expect("contact book lock poisoned");
        let conn = inner.conn()?;

        let existing: Option<(String, String)> = conn
            .query_row(
                "SELECT public_key, trust_state FROM contacts WHERE address = ?1",
                params![update.address],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        if let Some((stored_key, stored_state)) = existing {
            let stored_state = TrustState::parse(&stored_state)?;
            if stored_state.is_locked() && stored_key != update.public_key {
                return Err(UamError::KeyPinning {
                    address: update.address,
                    candidate: update.public_key,
                });
            }
        }

        let relays_json = match &update.relays {
            Some(relays) => Some(
                serde_json::to_string(relays)
                    .map_err(|e| UamError::Storage(e.to_string()))?,
            ),
            None => None,
        };

        conn.execute(
            "INSERT INTO contacts (address, public_key, display_name, trust_state, trust_source, relay, relays_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(address) DO UPDATE SET
                 public_key = excluded.public_key,
                 display_name = excluded.display_name,
                 trust_state = excluded.trust_state,
                 trust_source = COALESCE(excluded.trust_source, contacts.trust_source),
                 relay = COALESCE(excluded.relay, contacts.relay),
                 relays_json = COALESCE(excluded.relays_json, contacts.relays_json),
                 last_seen = datetime('now')",
            params![
                update.address,
                update.public_key,
                update.display_name,
                update.trust_state.as_str(),
                update.trust_source,
                update.relay,
                relays_json,
            ],
        )?;

        inner.known.insert(update.address);
        Ok(())
    }

    /// Look up the stored public key for an address.
    pub fn get_public_key(&self, address: &str) -> Result<Option<String>> {
        let inner = self.inner.lock().expect("contact book lock poisoned");
        let conn = inner.conn()?;
        Ok(conn
            .query_row(
                "SELECT public_key FROM contacts WHERE address = ?1",
                params![address],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Fetch a full contact row.
    pub fn get_contact(&self, address: &str) -> Result<Option<ContactRecord>> {
        let inner = self.inner.lock().expect("contact book lock poisoned");
        let conn = inner.conn()?;
        conn.query_row(
            "SELECT address, public_key, display_name, trust_state, trust_source,
                    relay, relays_json, pinned_at, first_seen, last_seen
             FROM contacts WHERE address = ?1",
            params![address],
            row_to_contact,
        )
        .optional()?
        .map(|r| r.map_err(UamError::Storage))
        .transpose()
    }

    /// Ordered relay URLs for a contact: the `relays` list when present,
    /// else the single `relay` wrapped in a list, else `None`.
    pub fn get_relay_urls(&self, address: &str) -> Result<Option<Vec<String>>> {
        let inner = self.inner.lock().expect("contact book lock poisoned");
        let conn = inner.conn()?;
        let row: Option<(Option<String>, Option<String>)> = conn
            .query_row(
                "SELECT relay, relays_json FROM contacts WHERE address = ?1",
                params![address],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((relay, relays_json)) = row else {
            return Ok(None);
        };
        if let Some(json) = relays_json {
            let relays: Vec<String> =
                serde_json::from_str(&json).map_err(|e| UamError::Storage(e.to_string()))?;
            return Ok(Some(relays));
        }
        Ok(relay.map(|r| vec![r]))
    }

    /// All contacts, most recently seen first.
    pub fn list_contacts(&self) -> Result<Vec<ContactRecord>> {
        let inner = self.inner.lock().expect("contact book lock poisoned");
        let conn = inner.conn()?;
        let mut stmt = conn.prepare(
            "SELECT address, public_key, display_name, trust_state, trust_source,
                    relay, relays_json, pinned_at, first_seen, last_seen
             FROM contacts ORDER BY last_seen DESC",
        )?;
        let rows = stmt.query_map([], row_to_contact)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?.map_err(UamError::Storage)?);
        }
        Ok(out)
    }

    /// Delete a contact row. Returns true if a row existed.
    pub fn remove_contact(&self, address: &str) -> Result<bool> {
        let mut inner = self.inner.lock().expect("contact book lock poisoned");
        let conn = inner.conn()?;
        let changed = conn.execute("DELETE FROM contacts WHERE address = ?1", params![address])?;
        inner.known.remove(address);
        Ok(changed > 0)
    }

    pub fn get_trust_state(&self, address: &str) -> Result<Option<TrustState>> {
        let inner = self.inner.lock().expect("contact book lock poisoned");
        let conn = inner.conn()?;
        let state: Option<String> = conn
            .query_row(
                "SELECT trust_state FROM contacts WHERE address = ?1",
                params![address],
                |row| row.get(0),
            )
            .optional()?;
        state.map(|s| TrustState::parse(&s)).transpose()
    }

    /// Stamp `pinned_at` for a contact. The first stamp wins; later calls
    /// preserve the original TOFU-lock moment.
    pub fn set_pinned_at(&self, address: &str) -> Result<()> {
        let inner = self.inner.lock().expect("contact book lock poisoned");
        let conn = inner.conn()?;
        conn.execute(
            "UPDATE contacts SET pinned_at = COALESCE(pinned_at, datetime('now')) WHERE address = ?1",
            params![address],
        )?;
        Ok(())
    }

    /// Whether inbound messages from this sender pass the default trust
    /// gate (`trusted`, `verified`, or `pinned`).
    pub fn is_trusted_for_inbox(&self, address: &str) -> Result<bool> {
        Ok(matches!(
            self.get_trust_state(address)?,
            Some(state) if state.is_locked()
        ))
    }

    // -- Pending handshakes --------------------------------------------------

    /// Queue (or refresh) a pending inbound handshake.
    pub fn add_pending(&self, address: &str, contact_card_json: &str) -> Result<()> {
        let inner = self.inner.lock().expect("contact book lock poisoned");
        let conn = inner.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO pending_handshakes (address, contact_card) VALUES (?1, ?2)",
            params![address, contact_card_json],
        )?;
        Ok(())
    }

    pub fn get_pending(&self) -> Result<Vec<PendingHandshake>> {
        let inner = self.inner.lock().expect("contact book lock poisoned");
        let conn = inner.conn()?;
        let mut stmt =
            conn.prepare("SELECT address, contact_card, received_at FROM pending_handshakes")?;
        let rows = stmt.query_map([], |row| {
            Ok(PendingHandshake {
                address: row.get(0)?,
                contact_card: row.get(1)?,
                received_at: row.get(2)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    pub fn get_pending_for(&self, address: &str) -> Result<Option<PendingHandshake>> {
        let inner = self.inner.lock().expect("contact book lock poisoned");
        let conn = inner.conn()?;
        Ok(conn
            .query_row(
                "SELECT address, contact_card, received_at FROM pending_handshakes WHERE address = ?1",
                params![address],
                |row| {
                    Ok(PendingHandshake {
                        address: row.get(0)?,
                        contact_card: row.get(1)?,
                        received_at: row.get(2)?,
                    })
                },
            )
            .optional()?)
    }

    pub fn remove_pending(&self, address: &str) -> Result<()> {
        let inner = self.inner.lock().expect("contact book lock poisoned");
        let conn = inner.conn()?;
        conn.execute(
            "DELETE FROM pending_handshakes WHERE address = ?1",
            params![address],
        )?;
        Ok(())
    }

    /// Pending entries older than `days` days, due for the expiry sweep.
    pub fn expired_pending(&self, days: u32) -> Result<Vec<PendingHandshake>> {
        let inner = self.inner.lock().expect("contact book lock poisoned");
        let conn = inner.conn()?;
        let mut stmt = conn.prepare(
            "SELECT address, contact_card, received_at FROM pending_handshakes
             WHERE datetime(received_at, '+' || ?1 || ' days') < datetime('now')",
        )?;
        let rows = stmt.query_map(params![days.to_string()], |row| {
            Ok(PendingHandshake {
                address: row.get(0)?,
                contact_card: row.get(1)?,
                received_at: row.get(2)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Rewrite a pending entry's `received_at` as `days` days in the past.
    /// Test scaffolding for the expiry sweep.
    #[doc(hidden)]
    pub fn backdate_pending(&self, address: &str, days: u32) -> Result<()> {
        let inner = self.inner.lock().expect("contact book lock poisoned");
        let conn = inner.conn()?;
        conn.execute(
            "UPDATE pending_handshakes
             SET received_at = datetime('now', '-' || ?2 || ' days')
             WHERE address = ?1",
            params![address, days.to_string()],
        )?;
        Ok(())
    }

    // -- Block patterns ------------------------------------------------------

    /// Block an exact `agent::domain` or a `*::domain` wildcard.
    pub fn add_block(&self, pattern: &str) -> Result<()> {
        let mut inner = self.inner.lock().expect("contact book lock poisoned");
        let conn = inner.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO blocked_patterns (pattern) VALUES (?1)",
            params![pattern],
        )?;
        let Inner {
            blocked_exact,
            blocked_domains,
            ..
        } = &mut *inner;
        cache_block_pattern(pattern, blocked_exact, blocked_domains);
        debug!(pattern, "block pattern added");
        Ok(())
    }

    pub fn remove_block(&self, pattern: &str) -> Result<()> {
        let mut inner = self.inner.lock().expect("contact book lock poisoned");
        let conn = inner.conn()?;
        conn.execute(
            "DELETE FROM blocked_patterns WHERE pattern = ?1",
            params![pattern],
        )?;
        if let Some(domain) = pattern.strip_prefix("*::") {
            inner.blocked_domains.remove(domain);
        } else {
            inner.blocked_exact.remove(pattern);
        }
        Ok(())
    }

    pub fn list_blocked(&self) -> Result<Vec<BlockedPattern>> {
        let inner = self.inner.lock().expect("contact book lock poisoned");
        let conn = inner.conn()?;
        let mut stmt = conn
            .prepare("SELECT pattern, blocked_at FROM blocked_patterns ORDER BY blocked_at DESC")?;
        let rows = stmt.query_map([], |row| {
            Ok(BlockedPattern {
                pattern: row.get(0)?,
                blocked_at: row.get(1)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }
}

fn cache_block_pattern(
    pattern: &str,
    blocked_exact: &mut HashSet<String>,
    blocked_domains: &mut HashSet<String>,
) {
    if let Some(domain) = pattern.strip_prefix("*::") {
        blocked_domains.insert(domain.to_string());
    } else {
        blocked_exact.insert(pattern.to_string());
    }
}

type ContactRowResult = std::result::Result<ContactRecord, String>;

fn row_to_contact(row: &rusqlite::Row<'_>) -> rusqlite::Result<ContactRowResult> {
    let trust_state_raw: String = row.get(3)?;
    let relays_json: Option<String> = row.get(6)?;

    let trust_state = match TrustState::parse(&trust_state_raw) {
        Ok(state) => state,
        Err(e) => return Ok(Err(e.to_string())),
    };
    let relays = match relays_json {
        Some(json) => match serde_json::from_str(&json) {
            Ok(relays) => Some(relays),
            Err(e) => return Ok(Err(e.to_string())),
        },
        None => None,
    };

    Ok(Ok(ContactRecord {
        address: row.get(0)?,
        public_key: row.get(1)?,
        display_name: row.get(2)?,
        trust_state,
        trust_source: row.get(4)?,
        relay: row.get(5)?,
        relays,
        pinned_at: row.get(7)?,
        first_seen: row.get(8)?,
        last_seen: row.get(9)?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book() -> ContactBook {
        ContactBook::open_in_memory().unwrap()
    }

    #[test]
    fn add_and_lookup_contact() {
        let book = book();
        assert!(!book.is_known("alice::example.net"));
        book.add_contact(
            ContactUpdate::new("alice::example.net", "PK1", TrustState::Unverified)
                .display_name("Alice"),
        )
        .unwrap();

        assert!(book.is_known("alice::example.net"));
        assert_eq!(
            book.get_public_key("alice::example.net").unwrap().as_deref(),
            Some("PK1")
        );
        let record = book.get_contact("alice::example.net").unwrap().unwrap();
        assert_eq!(record.trust_state, TrustState::Unverified);
        assert_eq!(record.display_name.as_deref(), Some("Alice"));
        assert!(record.pinned_at.is_none());
    }

    #[test]
    fn upsert_preserves_provenance_on_none() {
        let book = book();
        book.add_contact(
            ContactUpdate::new("alice::example.net", "PK1", TrustState::Provisional)
                .trust_source("auto-accepted")
                .relay("wss://relay-a.example/ws")
                .relays(vec!["wss://relay-a.example/ws".into(), "wss://relay-b.example/ws".into()]),
        )
        .unwrap();

        // Incidental update with no provenance fields
        book.add_contact(ContactUpdate::new(
            "alice::example.net",
            "PK1",
            TrustState::Trusted,
        ))
        .unwrap();

        let record = book.get_contact("alice::example.net").unwrap().unwrap();
        assert_eq!(record.trust_state, TrustState::Trusted);
        assert_eq!(record.trust_source.as_deref(), Some("auto-accepted"));
        assert_eq!(record.relay.as_deref(), Some("wss://relay-a.example/ws"));
        assert_eq!(record.relays.as_ref().map(Vec::len), Some(2));
    }

    #[test]
    fn pinned_key_never_silently_overwritten() {
        let book = book();
        book.add_contact(ContactUpdate::new(
            "mallory::evil.example",
            "REAL_KEY",
            TrustState::Pinned,
        ))
        .unwrap();

        let err = book
            .add_contact(ContactUpdate::new(
                "mallory::evil.example",
                "FAKE_KEY",
                TrustState::Unverified,
            ))
            .unwrap_err();
        assert!(matches!(err, UamError::KeyPinning { .. }));

        // stored key untouched
        assert_eq!(
            book.get_public_key("mallory::evil.example").unwrap().as_deref(),
            Some("REAL_KEY")
        );
    }

    #[test]
    fn trusted_and_verified_rows_also_locked() {
        let book = book();
        for (addr, state) in [
            ("a::x.example", TrustState::Trusted),
            ("b::x.example", TrustState::Verified),
        ] {
            book.add_contact(ContactUpdate::new(addr, "K1", state)).unwrap();
            assert!(book
                .add_contact(ContactUpdate::new(addr, "K2", TrustState::Unverified))
                .is_err());
        }
    }

    #[test]
    fn locked_row_accepts_same_key_state_upgrade() {
        let book = book();
        book.add_contact(ContactUpdate::new("a::x.example", "K1", TrustState::Trusted)).unwrap();
        book.add_contact(ContactUpdate::new("a::x.example", "K1", TrustState::Verified)).unwrap();
        assert_eq!(
            book.get_trust_state("a::x.example").unwrap(),
            Some(TrustState::Verified)
        );
    }

    #[test]
    fn unlocked_row_accepts_key_change() {
        let book = book();
        book.add_contact(ContactUpdate::new("a::x.example", "K1", TrustState::Unverified)).unwrap();
        book.add_contact(ContactUpdate::new("a::x.example", "K2", TrustState::Unverified)).unwrap();
        assert_eq!(
            book.get_public_key("a::x.example").unwrap().as_deref(),
            Some("K2")
        );
    }

    #[test]
    fn pinned_at_first_stamp_wins() {
        let book = book();
        book.add_contact(ContactUpdate::new("a::x.example", "K1", TrustState::Pinned)).unwrap();
        book.set_pinned_at("a::x.example").unwrap();
        let first = book.get_contact("a::x.example").unwrap().unwrap().pinned_at;
        assert!(first.is_some());
        book.set_pinned_at("a::x.example").unwrap();
        let second = book.get_contact("a::x.example").unwrap().unwrap().pinned_at;
        assert_eq!(first, second);
    }

    #[test]
    fn inbox_trust_gate() {
        let book = book();
        book.add_contact(ContactUpdate::new("t::x.example", "K", TrustState::Trusted)).unwrap();
        book.add_contact(ContactUpdate::new("p::x.example", "K", TrustState::Pinned)).unwrap();
        book.add_contact(ContactUpdate::new("v::x.example", "K", TrustState::Verified)).unwrap();
        book.add_contact(ContactUpdate::new("u::x.example", "K", TrustState::Unverified)).unwrap();

        assert!(book.is_trusted_for_inbox("t::x.example").unwrap());
        assert!(book.is_trusted_for_inbox("p::x.example").unwrap());
        assert!(book.is_trusted_for_inbox("v::x.example").unwrap());
        assert!(!book.is_trusted_for_inbox("u::x.example").unwrap());
        assert!(!book.is_trusted_for_inbox("ghost::x.example").unwrap());
    }

    #[test]
    fn relay_urls_resolution_order() {
        let book = book();
        book.add_contact(
            ContactUpdate::new("single::x.example", "K", TrustState::Unverified)
                .relay("wss://one.example/ws"),
        )
        .unwrap();
        book.add_contact(
            ContactUpdate::new("multi::x.example", "K", TrustState::Unverified)
                .relay("wss://one.example/ws")
                .relays(vec!["wss://one.example/ws".into(), "wss://two.example/ws".into()]),
        )
        .unwrap();
        book.add_contact(ContactUpdate::new("bare::x.example", "K", TrustState::Unverified))
            .unwrap();

        assert_eq!(
            book.get_relay_urls("single::x.example").unwrap(),
            Some(vec!["wss://one.example/ws".to_string()])
        );
        assert_eq!(
            book.get_relay_urls("multi::x.example").unwrap().map(|v| v.len()),
            Some(2)
        );
        assert_eq!(book.get_relay_urls("bare::x.example").unwrap(), None);
        assert_eq!(book.get_relay_urls("ghost::x.example").unwrap(), None);
    }

    #[test]
    fn pending_lifecycle() {
        let book = book();
        book.add_pending("alice::example.net", r#"{"card":1}"#).unwrap();
        let pending = book.get_pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].address, "alice::example.net");

        assert!(book.get_pending_for("alice::example.net").unwrap().is_some());
        book.remove_pending("alice::example.net").unwrap();
        assert!(book.get_pending().unwrap().is_empty());
        assert!(book.get_pending_for("alice::example.net").unwrap().is_none());
    }

    #[test]
    fn pending_replace_refreshes_card() {
        let book = book();
        book.add_pending("a::x.example", "v1").unwrap();
        book.add_pending("a::x.example", "v2").unwrap();
        let pending = book.get_pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].contact_card, "v2");
    }

    #[test]
    fn expired_pending_sweep_boundary() {
        let book = book();
        book.add_pending("fresh::x.example", "{}").unwrap();
        book.add_pending("stale::x.example", "{}").unwrap();
        book.backdate_pending("stale::x.example", 8).unwrap();

        let expired = book.expired_pending(7).unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].address, "stale::x.example");
    }

    #[test]
    fn block_patterns_exact_and_domain() {
        let book = book();
        book.add_block("spammer::evil.example").unwrap();
        book.add_block("*::bulk.example").unwrap();

        assert!(book.is_blocked("spammer::evil.example"));
        assert!(!book.is_blocked("other::evil.example"));
        assert!(book.is_blocked("anyone::bulk.example"));
        assert!(book.is_blocked("else::bulk.example"));
        assert!(!book.is_blocked("anyone::fine.example"));

        book.remove_block("*::bulk.example").unwrap();
        assert!(!book.is_blocked("anyone::bulk.example"));
        book.remove_block("spammer::evil.example").unwrap();
        assert!(!book.is_blocked("spammer::evil.example"));
    }

    #[test]
    fn list_blocked_returns_rows() {
        let book = book();
        book.add_block("*::evil.example").unwrap();
        book.add_block("x::y.example").unwrap();
        let listed = book.list_blocked().unwrap();
        assert_eq!(listed.len(), 2);
        let patterns: Vec<&str> = listed.iter().map(|b| b.pattern.as_str()).collect();
        assert!(patterns.contains(&"*::evil.example"));
        assert!(patterns.contains(&"x::y.example"));
    }

    #[test]
    fn caches_rebuilt_on_open() {
        let dir = tempfile::tempdir().unwrap();
        {
            let book = ContactBook::open(dir.path()).unwrap();
            book.add_contact(ContactUpdate::new("a::x.example", "K", TrustState::Pinned)).unwrap();
            book.add_block("*::evil.example").unwrap();
            book.close();
        }
        let book = ContactBook::open(dir.path()).unwrap();
        assert!(book.is_known("a::x.example"));
        assert!(book.is_blocked("someone::evil.example"));
    }

    #[test]
    fn remove_contact_updates_cache() {
        let book = book();
        book.add_contact(ContactUpdate::new("a::x.example", "K", TrustState::Unverified)).unwrap();
        assert!(book.remove_contact("a::x.example").unwrap());
        assert!(!book.is_known("a::x.example"));
        assert!(!book.remove_contact("a::x.example").unwrap());
    }

    #[test]
    fn closed_book_errors() {
        let book = book();
        book.close();
        assert!(book.get_public_key("a::b.example").is_err());
        assert!(book
            .add_contact(ContactUpdate::new("a::b.example", "K", TrustState::Unknown))
            .is_err());
        // close is idempotent
        book.close();
    }

    #[test]
    fn list_contacts_ordered_by_last_seen() {
        let book = book();
        book.add_contact(ContactUpdate::new("a::x.example", "K", TrustState::Unverified)).unwrap();
        book.add_contact(ContactUpdate::new("b::x.example", "K", TrustState::Unverified)).unwrap();
        let all = book.list_contacts().unwrap();
        assert_eq!(all.len(), 2);
    }
}
