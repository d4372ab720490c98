//! # UAM Addresses
//!
//! A UAM address names one agent on one domain: `agent::domain`
//! (e.g. `alice::relay.example.net`). Parsing is the single place the
//! grammar is enforced; every other module works with an already-validated
//! [`Address`].
//!
//! Grammar (after trimming and lowercasing):
//!
//! - `agent`: `[a-z0-9]` or `[a-z0-9][a-z0-9_-]{0,62}[a-z0-9]`, at most 64 chars
//! - `domain`: `[a-z0-9]` optionally followed by up to 253 of `[a-z0-9.-]`
//!   and a final `[a-z0-9]`
//! - full rendered form at most 128 chars

/// Maximum length of the agent component.
const MAX_AGENT_LEN: usize = 64;

/// Maximum length of the full `agent::domain` string.
const MAX_ADDRESS_LEN: usize = 128;

use crate::error::{Result, UamError};

/// A parsed, normalized UAM address. Components are always lowercase.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address {
    agent: String,
    domain: String,
}

impl Address {
    /// Parse and validate a raw address string.
    ///
    /// Trims surrounding whitespace and lowercases before validating, so
    /// `" Alice::Example.NET "` parses to `alice::example.net`.
    pub fn parse(raw: &str) -> Result<Address> {
        let normalized = raw.trim().to_ascii_lowercase();
        if normalized.len() > MAX_ADDRESS_LEN {
            return Err(UamError::InvalidAddress(format!(
                "address exceeds {MAX_ADDRESS_LEN} characters: {raw:?}"
            )));
        }

        let (agent, domain) = normalized
            .split_once("::")
            .ok_or_else(|| UamError::InvalidAddress(format!("missing '::' separator: {raw:?}")))?;

        if agent.len() > MAX_AGENT_LEN {
            return Err(UamError::InvalidAddress(format!(
                "agent name exceeds {MAX_AGENT_LEN} characters: {raw:?}"
            )));
        }
        if !valid_agent(agent) {
            return Err(UamError::InvalidAddress(format!("invalid agent name: {raw:?}")));
        }
        if !valid_domain(domain) {
            return Err(UamError::InvalidAddress(format!("invalid domain: {raw:?}")));
        }

        Ok(Address {
            agent: agent.to_string(),
            domain: domain.to_string(),
        })
    }

    /// The agent component (left of `::`).
    pub fn agent(&self) -> &str {
        &self.agent
    }

    /// The domain component (right of `::`).
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// The fully-qualified `agent::domain` string.
    pub fn full(&self) -> String {
        format!("{}::{}", self.agent, self.domain)
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}::{}", self.agent, self.domain)
    }
}

impl std::str::FromStr for Address {
    type Err = UamError;

    fn from_str(s: &str) -> Result<Address> {
        Address::parse(s)
    }
}

fn is_agent_inner(c: u8) -> bool {
    c.is_ascii_lowercase() || c.is_ascii_digit() || c == b'_' || c == b'-'
}

fn is_alnum(c: u8) -> bool {
    c.is_ascii_lowercase() || c.is_ascii_digit()
}

/// `[a-z0-9]([a-z0-9_-]{0,62}[a-z0-9])?`
fn valid_agent(s: &str) -> bool {
    let bytes = s.as_bytes();
    match bytes {
        [] => false,
        [only] => is_alnum(*only),
        [first, inner @ .., last] => {
            is_alnum(*first)
                && is_alnum(*last)
                && inner.len() <= 62
                && inner.iter().all(|&c| is_agent_inner(c))
        }
    }
}

fn is_domain_inner(c: u8) -> bool {
    c.is_ascii_lowercase() || c.is_ascii_digit() || c == b'.' || c == b'-'
}

/// `[a-z0-9]([a-z0-9.-]{0,253}[a-z0-9])?`
fn valid_domain(s: &str) -> bool {
    let bytes = s.as_bytes();
    match bytes {
        [] => false,
        [only] => is_alnum(*only),
        [first, inner @ .., last] => {
            is_alnum(*first)
                && is_alnum(*last)
                && inner.len() <= 253
                && inner.iter().all(|&c| is_domain_inner(c))
        }
    }
}
