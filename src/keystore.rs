//! # Key Store
//!
//! Persists the agent's identity seed and relay bearer token in a
//! per-agent layout under the key directory:
//!
//! - `{name}.key`   — base64 seed, owner-only permissions
//! - `{name}.pub`   — base64 verify key (informational)
//! - `{name}.token` — relay bearer token (legacy `{name}.api_key` is read
//!   as a fallback)
//!
//! The `UAM_AGENT_SEED` environment variable supplies the seed as base64
//! and bypasses disk entirely; nothing is written in that mode.
//!
//! On POSIX the private files are chmod 0600 and a broader mode on load
//! produces a warning. Elsewhere permission handling is best-effort.

use std::path::{Path, PathBuf};

use tracing::warn;

use crate::crypto::Keypair;
use crate::error::{Result, UamError};

/// Environment override: base64-encoded 32-byte seed.
pub const SEED_ENV_VAR: &str = "UAM_AGENT_SEED";

pub struct KeyStore {
    key_dir: PathBuf,
}

impl KeyStore {
    pub fn new(key_dir: impl Into<PathBuf>) -> Self {
        Self {
            key_dir: key_dir.into(),
        }
    }

    pub fn key_dir(&self) -> &Path {
        &self.key_dir
    }

    fn key_path(&self, name: &str) -> PathBuf {
        self.key_dir.join(format!("{name}.key"))
    }

    fn pub_path(&self, name: &str) -> PathBuf {
        self.key_dir.join(format!("{name}.pub"))
    }

    fn token_path(&self, name: &str) -> PathBuf {
        self.key_dir.join(format!("{name}.token"))
    }

    /// Load the agent's keypair, generating and persisting one on first run.
    ///
    /// Resolution order: `UAM_AGENT_SEED` env override (no disk I/O),
    /// existing `{name}.key`, fresh generation.
    pub fn load_or_generate(&self, name: &str) -> Result<Keypair> {
        if let Ok(seed_b64) = std::env::var(SEED_ENV_VAR) {
            return Keypair::from_seed_b64(seed_b64.trim()).map_err(|e| {
                UamError::KeyStore(format!("invalid {SEED_ENV_VAR} value: {e}"))
            });
        }

        let key_path = self.key_path(name);
        if key_path.exists() {
            check_permissions(&key_path);
            let seed_b64 = std::fs::read_to_string(&key_path)
                .map_err(|e| UamError::KeyStore(format!("cannot read {}: {e}", key_path.display())))?;
            return Keypair::from_seed_b64(seed_b64.trim());
        }

        std::fs::create_dir_all(&self.key_dir)
            .map_err(|e| UamError::KeyStore(format!("cannot create key dir: {e}")))?;

        let keypair = Keypair::generate();
        write_private(&key_path, &keypair.seed_b64())?;
        std::fs::write(self.pub_path(name), keypair.public_key_b64())
            .map_err(|e| UamError::KeyStore(format!("cannot write public key: {e}")))?;
        Ok(keypair)
    }

    /// Persist the relay bearer token alongside the keypair.
    pub fn save_token(&self, name: &str, token: &str) -> Result<()> {
        std::fs::create_dir_all(&self.key_dir)
            .map_err(|e| UamError::KeyStore(format!("cannot create key dir: {e}")))?;
        write_private(&self.token_path(name), token)
    }

    /// Load a previously saved token. Checks the legacy `.api_key` name too.
    pub fn load_token(&self, name: &str) -> Option<String> {
        let token_path = self.token_path(name);
        if let Ok(token) = std::fs::read_to_string(&token_path) {
            return Some(token.trim().to_string());
        }
        let legacy = self.key_dir.join(format!("{name}.api_key"));
        std::fs::read_to_string(legacy)
            .ok()
            .map(|t| t.trim().to_string())
    }
}

fn write_private(path: &Path, contents: &str) -> Result<()> {
    std::fs::write(path, contents)
        .map_err(|e| UamError::KeyStore(format!("cannot write {}: {e}", path.display())))?;
    set_owner_only(path);
    Ok(())
}

#[cfg(unix)]
fn set_owner_only(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)) {
        warn!(path = %path.display(), error = %e, "failed to restrict key file permissions");
    }
}

#[cfg(not(unix))]
fn set_owner_only(path: &Path) {
    warn!(
        path = %path.display(),
        "cannot restrict key file permissions on this platform; protect the key directory manually"
    );
}

#[cfg(unix)]
fn check_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(meta) = std::fs::metadata(path) {
        let mode = meta.permissions().mode() & 0o777;
        if mode & 0o077 != 0 {
            warn!(
                path = %path.display(),
                mode = format!("{mode:o}"),
                "key file is readable by other users; run chmod 600 on it"
            );
        }
    }
}

#[cfg(not(unix))]
fn check_permissions(_path: &Path) {}
