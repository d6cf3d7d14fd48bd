//! Docker `config.json` credential files.

use base64::Engine;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use super::{CredentialOrigin, Credentials, KeyringEntry, Privilege};
use crate::error::CredentialError;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DockerConfig {
    #[serde(default)]
    auths: BTreeMap<String, AuthEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct AuthEntry {
    /// Base64-encoded "username:password"
    auth: Option<String>,
    username: Option<String>,
    password: Option<String>,
    identitytoken: Option<String>,
}

impl DockerConfig {
    pub fn load(path: &Path) -> Result<Self, CredentialError> {
        let contents = fs::read_to_string(path).map_err(|source| CredentialError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&contents, path)
    }

    pub fn from_json(contents: &str, path: &Path) -> Result<Self, CredentialError> {
        serde_json::from_str(contents).map_err(|e| CredentialError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Keyring entries for every registry in the file. Explicitly configured
    /// credentials are trusted for writes.
    pub fn entries(&self, path: &Path) -> Result<Vec<KeyringEntry>, CredentialError> {
        let mut entries = Vec::new();
        for (registry, entry) in &self.auths {
            match entry.credentials(registry, path)? {
                Some(credentials) => entries.push(KeyringEntry::new(
                    registry,
                    credentials,
                    Privilege::ReadWrite,
                    CredentialOrigin::Explicit,
                )),
                None if entry.identitytoken.is_some() => {
                    log::warn!(
                        "Skipping identity token for {} in {}: token exchange is not supported",
                        registry,
                        path.display()
                    );
                }
                None => {
                    log::debug!("No usable credentials for {} in {}", registry, path.display());
                }
            }
        }
        Ok(entries)
    }

    pub fn registries(&self) -> Vec<String> {
        self.auths.keys().cloned().collect()
    }
}

impl AuthEntry {
    fn credentials(&self, registry: &str, path: &Path) -> Result<Option<Credentials>, CredentialError> {
        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            return Ok(Some(Credentials::new(username.clone(), password.clone())));
        }

        let Some(auth) = self.auth.as_deref().filter(|a| !a.is_empty()) else {
            return Ok(None);
        };

        let parse_error = |message: String| CredentialError::Parse {
            path: path.to_path_buf(),
            message: format!("auth for {}: {}", registry, message),
        };

        let decoded = base64::engine::general_purpose::STANDARD
            .decode(auth)
            .map_err(|e| parse_error(e.to_string()))?;
        let decoded = String::from_utf8(decoded).map_err(|e| parse_error(e.to_string()))?;
        let (username, password) = decoded
            .split_once(':')
            .ok_or_else(|| parse_error("expected username:password".to_string()))?;

        Ok(Some(Credentials::new(username, password)))
    }
}
