//! Registry credential resolution.
//!
//! A [`Keyring`] maps host-and-path prefixes to credentials. It is assembled once
//! by the [`CredentialResolver`] from explicitly configured docker config files
//! and an optional fallback [`CredentialSource`], and is immutable afterwards.
//!
//! Precedence:
//! 1. Explicit files are authoritative for every host they mention.
//! 2. The fallback is only asked about hosts no explicit file covers, and only
//!    entries with at least the required privilege are kept.
//! 3. Anything left is anonymous.

mod docker_config;
mod secret_server;

pub use docker_config::DockerConfig;
pub use secret_server::SecretServerSource;

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::CredentialError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Privilege {
    ReadOnly,
    ReadWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialOrigin {
    Explicit,
    Fallback,
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyringEntry {
    /// Normalized `host[/path]` prefix.
    pub prefix: String,
    pub credentials: Credentials,
    pub privilege: Privilege,
    pub origin: CredentialOrigin,
}

impl KeyringEntry {
    pub fn new(
        prefix: &str,
        credentials: Credentials,
        privilege: Privilege,
        origin: CredentialOrigin,
    ) -> Self {
        Self {
            prefix: normalize_prefix(prefix),
            credentials,
            privilege,
            origin,
        }
    }

    pub fn host(&self) -> &str {
        self.prefix.split('/').next().unwrap_or(&self.prefix)
    }

    /// A prefix matches on a path boundary only; `registry.io` never covers
    /// `registry.io:5000`.
    fn matches(&self, locator: &str) -> bool {
        match locator.strip_prefix(self.prefix.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Keyring {
    entries: Vec<KeyringEntry>,
}

impl Keyring {
    pub fn new(entries: Vec<KeyringEntry>) -> Self {
        Self { entries }
    }

    /// A keyring without entries; every lookup is anonymous.
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[KeyringEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Best entry for `reference`: longest matching prefix, explicit before
    /// fallback, earlier before later.
    pub fn get(&self, reference: &str) -> Option<&KeyringEntry> {
        let locator = normalize_prefix(reference);
        let mut best: Option<&KeyringEntry> = None;
        for entry in self.entries.iter().filter(|e| e.matches(&locator)) {
            let better = match best {
                None => true,
                Some(current) => {
                    entry.prefix.len() > current.prefix.len()
                        || (entry.prefix.len() == current.prefix.len()
                            && entry.origin == CredentialOrigin::Explicit
                            && current.origin == CredentialOrigin::Fallback)
                }
            };
            if better {
                best = Some(entry);
            }
        }
        best
    }
}

/// Secondary credential store queried for hosts the explicit files do not cover.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    fn name(&self) -> &str;

    async fn lookup(
        &self,
        host: &str,
        min_privilege: Privilege,
    ) -> Result<Vec<KeyringEntry>, CredentialError>;
}

pub struct CredentialResolver {
    config_files: Vec<PathBuf>,
    fallback: Option<Arc<dyn CredentialSource>>,
    min_privilege: Privilege,
}

impl Default for CredentialResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialResolver {
    pub fn new() -> Self {
        Self {
            config_files: Vec::new(),
            fallback: None,
            min_privilege: Privilege::ReadOnly,
        }
    }

    pub fn with_config_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_files.push(path.into());
        self
    }

    pub fn with_fallback(mut self, source: Arc<dyn CredentialSource>) -> Self {
        self.fallback = Some(source);
        self
    }

    pub fn with_min_privilege(mut self, privilege: Privilege) -> Self {
        self.min_privilege = privilege;
        self
    }

    /// Builds the keyring for `hosts`.
    pub async fn resolve(&self, hosts: &[String]) -> Result<Keyring, CredentialError> {
        let mut entries = Vec::new();
        for path in &self.config_files {
            let config = DockerConfig::load(path)?;
            let explicit = config.entries(path)?;
            log::debug!(
                "Loaded credentials for [{}] from {}",
                config.registries().join(", "),
                path.display()
            );
            entries.extend(explicit);
        }

        let covered: BTreeSet<String> = entries.iter().map(|e| e.host().to_string()).collect();

        if let Some(fallback) = &self.fallback {
            let wanted: BTreeSet<String> = hosts.iter().map(|h| normalize_host(h)).collect();
            for host in wanted.iter().filter(|h| !covered.contains(*h)) {
                let found = fallback.lookup(host, self.min_privilege).await?;
                for mut entry in found {
                    if entry.privilege < self.min_privilege {
                        log::debug!(
                            "Ignoring {} credentials for {} from {}: privilege {:?} is below {:?}",
                            entry.credentials.username,
                            entry.prefix,
                            fallback.name(),
                            entry.privilege,
                            self.min_privilege
                        );
                        continue;
                    }
                    if covered.contains(entry.host()) {
                        log::warn!(
                            "Ignoring {} credentials for {}: explicit configuration takes precedence",
                            fallback.name(),
                            entry.prefix
                        );
                        continue;
                    }
                    entry.origin = CredentialOrigin::Fallback;
                    entries.push(entry);
                }
            }
        }

        for host in hosts {
            let host = normalize_host(host);
            if !entries.iter().any(|e| e.host() == host) {
                log::info!("No credentials found for {}, using anonymous access", host);
            }
        }

        Ok(Keyring::new(entries))
    }
}

/// Lowercases the host and maps docker hub aliases onto `index.docker.io`.
pub fn normalize_host(host: &str) -> String {
    let host = host.trim().to_lowercase();
    let host = host
        .split_once("://")
        .map(|(_, rest)| rest.to_string())
        .unwrap_or(host);
    let host = host.split('/').next().unwrap_or_default().to_string();
    if host == "docker.io" || host == "registry-1.docker.io" {
        "index.docker.io".to_string()
    } else {
        host
    }
}

/// Strips scheme and trailing slashes, normalizes the host part and drops the
/// `/v1`/`/v2` API suffixes docker configs commonly carry.
pub fn normalize_prefix(raw: &str) -> String {
    let raw = raw.trim();
    let rest = raw.split_once("://").map(|(_, r)| r).unwrap_or(raw);
    let rest = rest.trim_end_matches('/');
    let (host, path) = match rest.split_once('/') {
        Some((host, path)) => (host, path.trim_matches('/')),
        None => (rest, ""),
    };

    let host = normalize_host(host);
    if path.is_empty() || path == "v1" || path == "v2" {
        host
    } else {
        format!("{}/{}", host, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::ArtifactReference;
    use std::fs;
    use tempfile::tempdir;

    struct StaticSource {
        entries: Vec<KeyringEntry>,
    }

    #[async_trait]
    impl CredentialSource for StaticSource {
        fn name(&self) -> &str {
            "static"
        }

        async fn lookup(
            &self,
            host: &str,
            _min_privilege: Privilege,
        ) -> Result<Vec<KeyringEntry>, CredentialError> {
            Ok(self
                .entries
                .iter()
                .filter(|e| e.host() == host)
                .cloned()
                .collect())
        }
    }

    fn entry(prefix: &str, user: &str, privilege: Privilege, origin: CredentialOrigin) -> KeyringEntry {
        KeyringEntry::new(prefix, Credentials::new(user, "secret"), privilege, origin)
    }

    #[test]
    fn test_normalize_prefix() {
        assert_eq!(normalize_prefix("https://index.docker.io/v1/"), "index.docker.io");
        assert_eq!(normalize_prefix("docker.io"), "index.docker.io");
        assert_eq!(normalize_prefix("Registry.IO/team/"), "registry.io/team");
        assert_eq!(normalize_prefix("localhost:5000"), "localhost:5000");
    }

    #[test]
    fn test_longest_prefix_wins() {
        let keyring = Keyring::new(vec![
            entry("registry.io", "host", Privilege::ReadWrite, CredentialOrigin::Explicit),
            entry("registry.io/team", "team", Privilege::ReadWrite, CredentialOrigin::Fallback),
        ]);

        let found = keyring.get("registry.io/team/component-descriptors/foo:1.0.0").unwrap();
        assert_eq!(found.credentials.username, "team");

        let found = keyring.get("registry.io/other/foo:1.0.0").unwrap();
        assert_eq!(found.credentials.username, "host");

        // A prefix must end on a path boundary.
        let found = keyring.get("registry.io/teams/foo").unwrap();
        assert_eq!(found.credentials.username, "host");

        assert!(keyring.get("other.io/foo").is_none());
    }

    #[test]
    fn test_other_port_is_another_host() {
        let keyring = Keyring::new(vec![entry(
            "registry.io",
            "default-port",
            Privilege::ReadWrite,
            CredentialOrigin::Explicit,
        )]);

        let reference =
            ArtifactReference::for_component("registry.io:5000/c", "example/foo", "1.0.0").unwrap();
        assert!(keyring.get(&reference.locator()).is_none());
        assert!(keyring.get("registry.io:5000/x").is_none());

        let reference =
            ArtifactReference::for_component("registry.io/c", "example/foo", "1.0.0").unwrap();
        assert_eq!(
            keyring.get(&reference.locator()).unwrap().credentials.username,
            "default-port"
        );
    }

    #[test]
    fn test_tie_prefers_explicit() {
        let keyring = Keyring::new(vec![
            entry("registry.io", "fallback", Privilege::ReadWrite, CredentialOrigin::Fallback),
            entry("registry.io", "explicit", Privilege::ReadWrite, CredentialOrigin::Explicit),
        ]);
        assert_eq!(keyring.get("registry.io/x").unwrap().credentials.username, "explicit");
    }

    #[test]
    fn test_debug_redacts_password() {
        let creds = Credentials::new("user", "hunter2");
        let printed = format!("{:?}", creds);
        assert!(printed.contains("user"));
        assert!(!printed.contains("hunter2"));
    }

    #[tokio::test]
    async fn test_explicit_credentials_are_never_overridden() {
        let dir = tempdir().unwrap();
        let config = dir.path().join("config.json");
        fs::write(
            &config,
            r#"{"auths": {"registry.io": {"username": "explicit", "password": "pw"}}}"#,
        )
        .unwrap();

        let fallback = Arc::new(StaticSource {
            entries: vec![
                entry("registry.io/team", "fallback", Privilege::ReadWrite, CredentialOrigin::Fallback),
                entry("other.io", "other", Privilege::ReadWrite, CredentialOrigin::Fallback),
            ],
        });

        let keyring = CredentialResolver::new()
            .with_config_file(&config)
            .with_fallback(fallback)
            .with_min_privilege(Privilege::ReadWrite)
            .resolve(&["registry.io".to_string(), "other.io".to_string()])
            .await
            .unwrap();

        let found = keyring.get("registry.io/team/foo:1.0.0").unwrap();
        assert_eq!(found.credentials.username, "explicit");
        assert_eq!(found.origin, CredentialOrigin::Explicit);

        let found = keyring.get("other.io/foo").unwrap();
        assert_eq!(found.credentials.username, "other");
        assert_eq!(found.origin, CredentialOrigin::Fallback);
    }

    #[tokio::test]
    async fn test_fallback_privilege_is_enforced() {
        let fallback = Arc::new(StaticSource {
            entries: vec![entry(
                "registry.io",
                "reader",
                Privilege::ReadOnly,
                CredentialOrigin::Fallback,
            )],
        });

        let keyring = CredentialResolver::new()
            .with_fallback(fallback)
            .with_min_privilege(Privilege::ReadWrite)
            .resolve(&["registry.io".to_string()])
            .await
            .unwrap();
        assert!(keyring.get("registry.io/foo").is_none());
    }

    #[tokio::test]
    async fn test_no_sources_is_anonymous() {
        let keyring = CredentialResolver::new()
            .resolve(&["registry.io".to_string()])
            .await
            .unwrap();
        assert!(keyring.is_empty());
    }
}
