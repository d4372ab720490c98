//! # On-Chain Name Registry (Tier 3)
//!
//! Resolves dotless domains through the UAM name registry contract. Only
//! two view functions are consumed:
//!
//! - `resolve(string) -> (address owner, string publicKey, string relayUrl, uint256 expiry)`
//! - `available(string) -> bool`
//!
//! Reads go over plain `eth_call` JSON-RPC; call data is ABI-encoded by
//! hand (one dynamic string argument), which keeps the chain surface to a
//! single HTTP POST. Results are cached for one hour per name to bound
//! RPC load.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tiny_keccak::{Hasher, Keccak};
use tracing::debug;

use crate::address::Address;
use crate::error::{Result, UamError};
use crate::resolver::Resolver;

/// How long a resolved name stays cached.
const CACHE_TTL: Duration = Duration::from_secs(3600);

/// Maximum cached names.
const CACHE_CAPACITY: usize = 256;

/// RPC request timeout.
const RPC_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// JSON-RPC primitives
// ============================================================================

#[derive(Serialize)]
struct JsonRpcRequest<P: Serialize> {
    jsonrpc: &'static str,
    id: u64,
    method: &'static str,
    params: P,
}

#[derive(Deserialize)]
struct JsonRpcResponse {
    result: Option<String>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

// ============================================================================
// ABI helpers
// ============================================================================

fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak::v256();
    let mut out = [0u8; 32];
    hasher.update(data);
    hasher.finalize(&mut out);
    out
}

/// First 4 bytes of `keccak256(signature)`.
fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

/// ABI-encode a call taking a single `string` argument.
fn encode_string_call(sig: &str, arg: &str) -> Vec<u8> {
    let bytes = arg.as_bytes();
    let mut data = Vec::with_capacity(4 + 64 + bytes.len().div_ceil(32) * 32);
    data.extend_from_slice(&selector(sig));
    // head: offset of the dynamic string (always 0x20 for one argument)
    data.extend_from_slice(&encode_u256(32));
    // tail: length + right-padded contents
    data.extend_from_slice(&encode_u256(bytes.len() as u64));
    data.extend_from_slice(bytes);
    let pad = bytes.len().div_ceil(32) * 32 - bytes.len();
    data.extend(std::iter::repeat(0u8).take(pad));
    data
}

fn encode_u256(value: u64) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[24..].copy_from_slice(&value.to_be_bytes());
    word
}

fn read_word(data: &[u8], index: usize) -> Result<&[u8]> {
    data.get(index * 32..(index + 1) * 32)
        .ok_or_else(|| UamError::Resolution("truncated ABI return data".into()))
}

fn read_u64(word: &[u8]) -> Result<u64> {
    if word[..24].iter().any(|&b| b != 0) {
        return Err(UamError::Resolution("ABI word exceeds u64".into()));
    }
    Ok(u64::from_be_bytes(
        word[24..].try_into().expect("word slice is 8 bytes"),
    ))
}

fn read_string_at(data: &[u8], offset: usize) -> Result<String> {
    let len_word = data
        .get(offset..offset + 32)
        .ok_or_else(|| UamError::Resolution("truncated ABI string".into()))?;
    let len = read_u64(len_word)? as usize;
    let bytes = data
        .get(offset + 32..offset + 32 + len)
        .ok_or_else(|| UamError::Resolution("truncated ABI string body".into()))?;
    String::from_utf8(bytes.to_vec())
        .map_err(|_| UamError::Resolution("ABI string is not UTF-8".into()))
}

/// A decoded `resolve(name)` record.
#[derive(Clone, Debug, PartialEq)]
pub struct RegistryRecord {
    /// Owner account, `0x`-prefixed hex.
    pub owner: String,
    pub public_key: String,
    pub relay_url: String,
    pub expiry: u64,
}

/// Decode the `(address, string, string, uint256)` return tuple.
fn decode_resolve_return(data: &[u8]) -> Result<RegistryRecord> {
    let owner_word = read_word(data, 0)?;
    let owner = format!("0x{}", hex::encode(&owner_word[12..]));
    let pk_offset = read_u64(read_word(data, 1)?)? as usize;
    let relay_offset = read_u64(read_word(data, 2)?)? as usize;
    let expiry = read_u64(read_word(data, 3)?)?;

    Ok(RegistryRecord {
        owner,
        public_key: read_string_at(data, pk_offset)?,
        relay_url: read_string_at(data, relay_offset)?,
        expiry,
    })
}

fn decode_bool_return(data: &[u8]) -> Result<bool> {
    Ok(read_u64(read_word(data, 0)?)? != 0)
}

fn decode_hex_result(result: &str) -> Result<Vec<u8>> {
    hex::decode(result.trim_start_matches("0x"))
        .map_err(|e| UamError::Resolution(format!("malformed eth_call result: {e}")))
}

// ============================================================================
// ChainResolver
// ============================================================================

/// Tier-3 resolver reading the on-chain name registry.
pub struct ChainResolver {
    rpc_url: String,
    contract_address: String,
    http: reqwest::Client,
    cache: Mutex<LruCache<String, (String, Instant)>>,
    cache_ttl: Duration,
}

impl ChainResolver {
    pub fn new(rpc_url: impl Into<String>, contract_address: impl Into<String>) -> Self {
        Self {
            rpc_url: rpc_url.into(),
            contract_address: contract_address.into(),
            http: reqwest::Client::new(),
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(CACHE_CAPACITY).expect("capacity is non-zero"),
            )),
            cache_ttl: CACHE_TTL,
        }
    }

    #[doc(hidden)]
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Drop a cached name, or everything when `None`.
    pub fn invalidate_cache(&self, name: Option<&str>) {
        let mut cache = self.cache.lock().expect("registry cache lock poisoned");
        match name {
            Some(name) => {
                cache.pop(name);
            }
            None => cache.clear(),
        }
    }

    async fn eth_call(&self, data: &[u8]) -> Result<Vec<u8>> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id: 1,
            method: "eth_call",
            params: json!([
                {
                    "to": self.contract_address,
                    "data": format!("0x{}", hex::encode(data)),
                },
                "latest"
            ]),
        };

        let resp = self
            .http
            .post(&self.rpc_url)
            .timeout(RPC_TIMEOUT)
            .json(&request)
            .send()
            .await
            .map_err(|e| UamError::Resolution(format!("registry RPC failed: {e}")))?;

        let body: JsonRpcResponse = resp
            .json()
            .await
            .map_err(|e| UamError::Resolution(format!("malformed RPC response: {e}")))?;

        if let Some(err) = body.error {
            // Reverts (unregistered names) surface as RPC errors
            return Err(UamError::Resolution(format!(
                "registry call reverted ({}): {}",
                err.code, err.message
            )));
        }
        let result = body
            .result
            .ok_or_else(|| UamError::Resolution("RPC response missing result".into()))?;
        decode_hex_result(&result)
    }

    /// Read the full registry record for a name (uncached).
    pub async fn resolve_record(&self, name: &str) -> Result<RegistryRecord> {
        let data = self.eth_call(&encode_string_call("resolve(string)", name)).await?;
        decode_resolve_return(&data)
    }

    /// Whether a name is still unregistered.
    pub async fn available(&self, name: &str) -> Result<bool> {
        let data = self.eth_call(&encode_string_call("available(string)", name)).await?;
        decode_bool_return(&data)
    }
}

#[async_trait]
impl Resolver for ChainResolver {
    async fn resolve_public_key(
        &self,
        address: &Address,
        _token: &str,
        _relay_url: &str,
    ) -> Result<String> {
        // For Tier 3 the domain IS the namespace name
        let name = address.domain().to_string();

        {
            let mut cache = self.cache.lock().expect("registry cache lock poisoned");
            let cached = cache.get(&name).cloned();
            if let Some((key, expires)) = cached {
                if expires > Instant::now() {
                    debug!(name, "registry cache hit");
                    return Ok(key);
                }
                cache.pop(&name);
            }
        }

        let record = self.resolve_record(&name).await?;
        if record.public_key.is_empty() {
            return Err(UamError::Resolution(format!(
                "name {name:?} has no public key registered"
            )));
        }

        let mut cache = self.cache.lock().expect("registry cache lock poisoned");
        cache.put(
            name.clone(),
            (record.public_key.clone(), Instant::now() + self.cache_ttl),
        );
        debug!(name, "resolved via on-chain registry");
        Ok(record.public_key)
    }
}
