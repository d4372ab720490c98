//! # Agent Configuration
//!
//! All knobs an [`crate::agent::Agent`] needs, with derivations mirroring
//! the deployed relay conventions:
//!
//! - `relay_ws_url` derives from `relay_url` (`https`→`wss`, `/ws` suffix)
//! - `relay_domain` derives from the relay URL host
//! - key and data directories default to `~/.uam`
//!
//! Environment overrides (highest priority): `UAM_RELAY_URL`,
//! `UAM_RELAY_DOMAIN`, `UAM_TRUST_POLICY`, `UAM_HOME`.

use std::path::PathBuf;

use crate::error::{Result, UamError};

/// Default public relay.
pub const DEFAULT_RELAY_URL: &str = "https://relay.youam.network";

/// Env var overriding the relay URL.
pub const RELAY_URL_ENV: &str = "UAM_RELAY_URL";
/// Env var overriding the relay domain.
pub const RELAY_DOMAIN_ENV: &str = "UAM_RELAY_DOMAIN";
/// Env var overriding the trust policy.
pub const TRUST_POLICY_ENV: &str = "UAM_TRUST_POLICY";
/// Env var overriding the `~/.uam` home directory.
pub const HOME_ENV: &str = "UAM_HOME";

// ============================================================================
// Policy and transport selection
// ============================================================================

/// Agent-wide rule for inbound handshake requests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrustPolicy {
    /// Store the contact as provisional and accept immediately.
    AutoAccept,
    /// Queue requests for manual `approve`/`deny`.
    ApprovalRequired,
    /// Deny everyone who is not already approved.
    AllowlistOnly,
    /// Queue requests; only manually verified contacts pass the inbox gate.
    RequireVerify,
}

impl TrustPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrustPolicy::AutoAccept => "auto-accept",
            TrustPolicy::ApprovalRequired => "approval-required",
            TrustPolicy::AllowlistOnly => "allowlist-only",
            TrustPolicy::RequireVerify => "require-verify",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        Ok(match s {
            "auto-accept" => TrustPolicy::AutoAccept,
            "approval-required" => TrustPolicy::ApprovalRequired,
            "allowlist-only" => TrustPolicy::AllowlistOnly,
            "require-verify" => TrustPolicy::RequireVerify,
            other => {
                return Err(UamError::Config(format!(
                    "invalid trust policy {other:?}; expected one of auto-accept, \
                     approval-required, allowlist-only, require-verify"
                )))
            }
        })
    }
}

impl std::fmt::Display for TrustPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which concrete transport the agent builds on connect.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportKind {
    /// Stateless request/response polling over the relay HTTP API.
    Http,
    /// Persistent push channel over the relay WebSocket.
    WebSocket,
}

impl TransportKind {
    pub fn parse(s: &str) -> Result<Self> {
        Ok(match s {
            "http" => TransportKind::Http,
            "websocket" => TransportKind::WebSocket,
            other => {
                return Err(UamError::Config(format!(
                    "invalid transport {other:?}; expected http or websocket"
                )))
            }
        })
    }
}

// ============================================================================
// AgentConfig
// ============================================================================

/// Resolved configuration for one agent.
#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub name: String,
    pub relay_url: String,
    pub relay_ws_url: String,
    pub relay_domain: String,
    pub key_dir: PathBuf,
    pub data_dir: PathBuf,
    pub display_name: String,
    pub transport: TransportKind,
    pub trust_policy: TrustPolicy,
    pub auto_register: bool,
}

/// Unresolved inputs; `build` applies env overrides and derivations.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub relay_url: Option<String>,
    pub relay_ws_url: Option<String>,
    pub relay_domain: Option<String>,
    pub key_dir: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub display_name: Option<String>,
    pub transport: Option<TransportKind>,
    pub trust_policy: Option<TrustPolicy>,
    pub auto_register: Option<bool>,
}

impl AgentConfig {
    /// Resolve the effective configuration for `name`.
    ///
    /// Priority, highest first: environment variable, explicit override,
    /// derivation from another field, built-in default.
    pub fn build(name: &str, overrides: ConfigOverrides) -> Result<AgentConfig> {
        let relay_url = std::env::var(RELAY_URL_ENV)
            .ok()
            .or(overrides.relay_url)
            .unwrap_or_else(|| DEFAULT_RELAY_URL.to_string());

        let relay_ws_url = overrides
            .relay_ws_url
            .unwrap_or_else(|| derive_ws_url(&relay_url));

        let relay_domain = std::env::var(RELAY_DOMAIN_ENV)
            .ok()
            .or(overrides.relay_domain)
            .unwrap_or_else(|| host_of(&relay_url));

        let home = std::env::var(HOME_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_home());

        let key_dir = overrides.key_dir.unwrap_or_else(|| home.join("keys"));
        let data_dir = overrides.data_dir.unwrap_or_else(|| home.clone());

        let trust_policy = match std::env::var(TRUST_POLICY_ENV) {
            Ok(raw) => TrustPolicy::parse(&raw)?,
            Err(_) => overrides.trust_policy.unwrap_or(TrustPolicy::AutoAccept),
        };

        Ok(AgentConfig {
            name: name.to_string(),
            relay_url,
            relay_ws_url,
            relay_domain,
            key_dir,
            data_dir,
            display_name: overrides.display_name.unwrap_or_else(|| name.to_string()),
            transport: overrides.transport.unwrap_or(TransportKind::WebSocket),
            trust_policy,
            auto_register: overrides.auto_register.unwrap_or(true),
        })
    }

    /// The agent's full address under its home relay.
    pub fn address(&self) -> String {
        format!("{}::{}", self.name, self.relay_domain)
    }
}

/// `https://x` → `wss://x/ws`, `http://x` → `ws://x/ws`; idempotent on a
/// URL that already ends with `/ws`.
pub fn derive_ws_url(relay_url: &str) -> String {
    let ws = relay_url
        .replacen("https://", "wss://", 1)
        .replacen("http://", "ws://", 1);
    if ws.ends_with("/ws") {
        ws
    } else {
        format!("{}/ws", ws.trim_end_matches('/'))
    }
}

/// Hostname portion of a URL, without scheme, port, or path.
pub fn host_of(url: &str) -> String {
    let rest = url.split("://").nth(1).unwrap_or(url);
    let host_port = rest.split('/').next().unwrap_or(rest);
    host_port.split(':').next().unwrap_or(host_port).to_string()
}

fn default_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(".uam")
}
