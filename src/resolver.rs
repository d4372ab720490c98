//! # Address Resolution
//!
//! Maps a UAM address to the owner's Ed25519 public key. Three pluggable
//! tiers sit behind the [`Resolver`] trait:
//!
//! | Tier | Selector | Mechanism |
//! |------|----------|-----------|
//! | 1 | domain == home relay domain | relay HTTP API |
//! | 2 | domain contains a dot | DNS TXT at `_uam.{domain}`, HTTPS `.well-known` fallback |
//! | 3 | dotless domain | on-chain name registry (see [`crate::registry`]) |
//!
//! [`SmartResolver`] performs the dispatch. Tier 3 is optional; a dotless
//! domain without a configured registry is a configuration error, not a
//! resolution miss.
//!
//! ## DNS TXT format
//!
//! `_uam.{domain}` TXT: `v=uam1; key=ed25519:{base64}; relay={url}`.
//! Tag names are case-insensitive; unknown tags are preserved for forward
//! compatibility.
//!
//! ## SSRF guard
//!
//! The HTTPS fallback refuses domains that resolve to private, loopback,
//! or link-local addresses (fail-closed: resolution failure counts as
//! non-public).

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use serde_json::Value;
use tracing::{debug, warn};

use crate::address::Address;
use crate::error::{Result, UamError};
use crate::registry::ChainResolver;

/// Timeout for a single DNS or HTTPS resolution attempt.
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Pluggable address-to-public-key resolution.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Resolve an address to its base64 Ed25519 public key.
    async fn resolve_public_key(
        &self,
        address: &Address,
        token: &str,
        relay_url: &str,
    ) -> Result<String>;
}

// ============================================================================
// Tier 1: relay HTTP API
// ============================================================================

/// Resolves through the relay's open public-key endpoint
/// (`GET /api/v1/agents/{address}/public-key`). Unauthenticated so agents
/// can discover recipients before their first handshake.
pub struct RelayResolver {
    http: reqwest::Client,
}

impl RelayResolver {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }
}

impl Default for RelayResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Resolver for RelayResolver {
    async fn resolve_public_key(
        &self,
        address: &Address,
        _token: &str,
        relay_url: &str,
    ) -> Result<String> {
        let url = format!("{relay_url}/api/v1/agents/{}/public-key", address.full());
        let resp = self
            .http
            .get(&url)
            .timeout(LOOKUP_TIMEOUT)
            .send()
            .await
            .map_err(|e| UamError::Resolution(format!("relay lookup failed: {e}")))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(UamError::Resolution(format!("agent not found: {}", address.full())));
        }
        if !resp.status().is_success() {
            return Err(UamError::Resolution(format!(
                "relay lookup returned {} for {}",
                resp.status(),
                address.full()
            )));
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| UamError::Resolution(format!("malformed relay response: {e}")))?;
        body.get("public_key")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| UamError::Resolution("relay response missing public_key".into()))
    }
}

// ============================================================================
// Tier 2: DNS TXT + HTTPS well-known fallback
// ============================================================================

/// Parse a UAM TXT record value into lowercase-tag/value pairs.
pub fn parse_uam_txt(txt_value: &str) -> HashMap<String, String> {
    let mut tags = HashMap::new();
    for part in txt_value.split(';') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if let Some((tag, value)) = part.split_once('=') {
            tags.insert(tag.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }
    tags
}

/// Extract the base64 public key from parsed TXT tags, stripping the
/// `ed25519:` prefix. `None` when the tag is absent or mis-prefixed.
pub fn extract_public_key(tags: &HashMap<String, String>) -> Option<String> {
    tags.get("key")?
        .strip_prefix("ed25519:")
        .filter(|k| !k.is_empty())
        .map(str::to_string)
}

/// The TXT record value an agent should publish at `_uam.{domain}`.
pub fn generate_txt_record(public_key: &str, relay_url: &str) -> String {
    format!("v=uam1; key=ed25519:{public_key}; relay={relay_url}")
}

/// Resolves through DNS TXT records, falling back to
/// `https://{domain}/.well-known/uam.json`.
pub struct DnsResolver {
    dns: TokioAsyncResolver,
    http: reqwest::Client,
}

impl DnsResolver {
    pub fn new() -> Self {
        let dns = TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|e| {
            debug!(error = %e, "no system resolver config, using defaults");
            TokioAsyncResolver::tokio(Default::default(), Default::default())
        });
        Self {
            dns,
            http: reqwest::Client::new(),
        }
    }

    /// TXT values at `_uam.{domain}` that begin with `v=uam1`. DNS errors
    /// collapse to an empty list so the caller falls through to HTTPS.
    async fn query_uam_txt(&self, domain: &str) -> Vec<String> {
        let name = format!("_uam.{domain}.");
        let lookup = match tokio::time::timeout(LOOKUP_TIMEOUT, self.dns.txt_lookup(name)).await {
            Ok(Ok(lookup)) => lookup,
            Ok(Err(e)) => {
                debug!(domain, error = %e, "TXT lookup failed");
                return Vec::new();
            }
            Err(_) => {
                debug!(domain, "TXT lookup timed out");
                return Vec::new();
            }
        };

        lookup
            .iter()
            .map(|txt| {
                // Multi-string TXT records concatenate (values > 255 bytes)
                txt.txt_data()
                    .iter()
                    .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
                    .collect::<String>()
            })
            .filter(|value| value.trim().starts_with("v=uam1"))
            .collect()
    }

    /// Resolve via `https://{domain}/.well-known/uam.json`, after the
    /// public-IP check.
    async fn resolve_via_https(&self, agent: &str, domain: &str) -> Option<String> {
        if !is_public_host(domain).await {
            warn!(domain, "host is not publicly routable, skipping well-known fetch");
            return None;
        }

        let url = format!("https://{domain}/.well-known/uam.json");
        let resp = self
            .http
            .get(&url)
            .timeout(LOOKUP_TIMEOUT)
            .send()
            .await
            .ok()?;
        if !resp.status().is_success() {
            return None;
        }
        let body: Value = resp.json().await.ok()?;
        extract_well_known_key(&body, agent)
    }
}

impl Default for DnsResolver {
    fn default() -> Self {
        Self::new()
    }
}

/// Pull `agents[name].key` out of a parsed `uam.json` document, stripping
/// the `ed25519:` prefix.
pub fn extract_well_known_key(doc: &Value, agent: &str) -> Option<String> {
    if doc.get("v").and_then(Value::as_str) != Some("uam1") {
        return None;
    }
    let key = doc.get("agents")?.get(agent)?.get("key")?.as_str()?;
    let key = key.strip_prefix("ed25519:").unwrap_or(key);
    if key.is_empty() {
        None
    } else {
        Some(key.to_string())
    }
}

#[async_trait]
impl Resolver for DnsResolver {
    async fn resolve_public_key(
        &self,
        address: &Address,
        _token: &str,
        _relay_url: &str,
    ) -> Result<String> {
        for record in self.query_uam_txt(address.domain()).await {
            let tags = parse_uam_txt(&record);
            if tags.get("v").map(String::as_str) == Some("uam1") {
                if let Some(key) = extract_public_key(&tags) {
                    debug!(address = %address, "resolved via DNS TXT");
                    return Ok(key);
                }
            }
        }

        if let Some(key) = self.resolve_via_https(address.agent(), address.domain()).await {
            debug!(address = %address, "resolved via .well-known fallback");
            return Ok(key);
        }

        Err(UamError::Resolution(format!(
            "no DNS TXT record or well-known entry for {}",
            address.full()
        )))
    }
}

/// Whether `host` resolves exclusively to publicly routable addresses.
/// Fail-closed: resolution failure or any private/loopback/link-local
/// address returns false.
pub async fn is_public_host(host: &str) -> bool {
    let lookup = match tokio::net::lookup_host((host, 443)).await {
        Ok(addrs) => addrs.collect::<Vec<_>>(),
        Err(_) => return false,
    };
    if lookup.is_empty() {
        return false;
    }
    lookup.iter().all(|addr| is_public_ip(addr.ip()))
}

fn is_public_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified())
        }
        IpAddr::V6(v6) => {
            let segs = v6.segments();
            let link_local = (segs[0] & 0xffc0) == 0xfe80;
            let unique_local = (segs[0] & 0xfe00) == 0xfc00;
            !(v6.is_loopback() || v6.is_unspecified() || link_local || unique_local)
        }
    }
}

// ============================================================================
// SmartResolver: tier dispatch by domain shape
// ============================================================================

/// Routes resolution by domain format:
///
/// - domain equals the configured relay domain → Tier 1
/// - domain contains a dot → Tier 2
/// - dotless domain → Tier 3, or a configuration error when absent
pub struct SmartResolver {
    relay_domain: String,
    tier1: RelayResolver,
    tier2: DnsResolver,
    tier3: Option<Arc<ChainResolver>>,
}

impl SmartResolver {
    pub fn new(relay_domain: impl Into<String>) -> Self {
        Self {
            relay_domain: relay_domain.into(),
            tier1: RelayResolver::new(),
            tier2: DnsResolver::new(),
            tier3: None,
        }
    }

    /// Attach an on-chain registry for dotless (Tier 3) domains.
    pub fn with_registry(mut self, registry: Arc<ChainResolver>) -> Self {
        self.tier3 = Some(registry);
        self
    }
}

#[async_trait]
impl Resolver for SmartResolver {
    async fn resolve_public_key(
        &self,
        address: &Address,
        token: &str,
        relay_url: &str,
    ) -> Result<String> {
        let domain = address.domain();

        if domain == self.relay_domain {
            return self.tier1.resolve_public_key(address, token, relay_url).await;
        }
        if domain.contains('.') {
            return self.tier2.resolve_public_key(address, token, relay_url).await;
        }
        match &self.tier3 {
            Some(registry) => registry.resolve_public_key(address, token, relay_url).await,
            None => Err(UamError::Config(format!(
                "dotless domain {domain:?} requires an on-chain registry, none configured"
            ))),
        }
    }
}
