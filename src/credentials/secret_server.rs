//! Fallback credentials from a local concourse-style secret file.
//!
//! ```yaml
//! container_registry:
//!   team-registry:
//!     username: robot
//!     password: secret
//!     host: registry.io
//!     image_reference_prefixes:
//!       - registry.io/team
//!     privileges: readwrite
//! ```

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

use super::{normalize_host, CredentialOrigin, CredentialSource, Credentials, KeyringEntry, Privilege};
use crate::error::CredentialError;

#[derive(Debug, Default, Deserialize)]
struct SecretFile {
    #[serde(default)]
    container_registry: BTreeMap<String, RegistrySecret>,
}

#[derive(Debug, Deserialize)]
struct RegistrySecret {
    username: String,
    password: String,
    #[serde(default)]
    host: Option<String>,
    #[serde(default)]
    image_reference_prefixes: Vec<String>,
    #[serde(default = "default_privilege")]
    privileges: Privilege,
}

fn default_privilege() -> Privilege {
    Privilege::ReadOnly
}

pub struct SecretServerSource {
    path: PathBuf,
}

impl SecretServerSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn read(&self, host: &str) -> Result<SecretFile, CredentialError> {
        let lookup_error = |message: String| CredentialError::Lookup {
            host: host.to_string(),
            source_name: self.name().to_string(),
            message,
        };
        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| lookup_error(format!("{}: {}", self.path.display(), e)))?;
        serde_yaml::from_str(&contents)
            .map_err(|e| lookup_error(format!("{}: {}", self.path.display(), e)))
    }
}

#[async_trait]
impl CredentialSource for SecretServerSource {
    fn name(&self) -> &str {
        "secret-server"
    }

    async fn lookup(
        &self,
        host: &str,
        min_privilege: Privilege,
    ) -> Result<Vec<KeyringEntry>, CredentialError> {
        let file = self.read(host).await?;
        let host = normalize_host(host);

        let mut entries = Vec::new();
        for (name, secret) in file.container_registry {
            if secret.privileges < min_privilege {
                log::trace!("Secret {} lacks {:?} privileges", name, min_privilege);
                continue;
            }

            let prefixes = if secret.image_reference_prefixes.is_empty() {
                secret.host.iter().cloned().collect()
            } else {
                secret.image_reference_prefixes.clone()
            };

            for prefix in prefixes {
                let entry = KeyringEntry::new(
                    &prefix,
                    Credentials::new(secret.username.clone(), secret.password.clone()),
                    secret.privileges,
                    CredentialOrigin::Fallback,
                );
                if entry.host() == host {
                    log::debug!("Using secret {} for {}", name, entry.prefix);
                    entries.push(entry);
                }
            }
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use std::fs;

    const SECRETS: &str = r#"
container_registry:
  reader:
    username: reader
    password: r
    host: registry.io
    privileges: readonly
  writer:
    username: writer
    password: w
    image_reference_prefixes:
      - registry.io/team
      - eu.gcr.io/project
    privileges: readwrite
"#;

    #[tokio::test]
    async fn test_lookup_filters_by_host_and_privilege() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("secrets.yaml");
        fs::write(&path, SECRETS).unwrap();
        let source = SecretServerSource::new(&path);

        let read = source.lookup("registry.io", Privilege::ReadOnly).await.unwrap();
        assert_eq!(read.len(), 2);

        let write = source.lookup("registry.io", Privilege::ReadWrite).await.unwrap();
        assert_eq!(write.len(), 1);
        assert_eq!(write[0].prefix, "registry.io/team");
        assert_eq!(write[0].credentials.username, "writer");

        let gcr = source.lookup("eu.gcr.io", Privilege::ReadWrite).await.unwrap();
        assert_eq!(gcr[0].prefix, "eu.gcr.io/project");

        assert!(source.lookup("other.io", Privilege::ReadOnly).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_file_is_a_lookup_error() {
        let source = SecretServerSource::new("/nonexistent/secrets.yaml");
        let err = source.lookup("registry.io", Privilege::ReadOnly).await.unwrap_err();
        assert!(matches!(err, CredentialError::Lookup { .. }));
    }
}
