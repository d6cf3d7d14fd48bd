use std::fmt;

use crate::error::RegistryError;

/// Path segment inserted between a repository context and the component name.
pub const COMPONENT_DESCRIPTORS_PATH: &str = "component-descriptors";

/// Registry location of a published component descriptor, e.g.
/// `example-registry.io/components/component-descriptors/example/foo:1.0.0`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactReference {
    /// `http` or `https` when the base URL carried a scheme.
    pub scheme: Option<String>,
    pub host: String,
    pub repository: String,
    pub tag: String,
}

impl ArtifactReference {
    /// Derives the reference for `name:version` below `base_url`.
    pub fn for_component(base_url: &str, name: &str, version: &str) -> Result<Self, RegistryError> {
        let invalid = |message: &str| RegistryError::InvalidReference {
            reference: format!("{}/{}/{}:{}", base_url, COMPONENT_DESCRIPTORS_PATH, name, version),
            message: message.to_string(),
        };

        let (scheme, rest) = match base_url.split_once("://") {
            Some((scheme, rest)) => (Some(scheme.to_ascii_lowercase()), rest),
            None => (None, base_url),
        };
        if let Some(scheme) = &scheme {
            if scheme != "http" && scheme != "https" {
                return Err(invalid("only http and https base URLs are supported"));
            }
        }

        let rest = rest.trim_end_matches('/');
        let (host, base_path) = match rest.split_once('/') {
            Some((host, path)) => (host, path.trim_matches('/')),
            None => (rest, ""),
        };
        if host.is_empty() {
            return Err(invalid("base URL has no host"));
        }

        let name = name.trim_matches('/');
        if name.is_empty() {
            return Err(invalid("component name must not be empty"));
        }
        if version.is_empty() || version.contains('/') || version.contains(':') {
            return Err(invalid("version must be a valid tag"));
        }

        let repository = if base_path.is_empty() {
            format!("{}/{}", COMPONENT_DESCRIPTORS_PATH, name)
        } else {
            format!("{}/{}/{}", base_path, COMPONENT_DESCRIPTORS_PATH, name)
        };

        Ok(Self {
            scheme,
            host: host.to_string(),
            repository,
            tag: version.to_string(),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// `host/repository:tag` without any scheme, as understood by registry clients.
    pub fn registry_path(&self) -> String {
        format!("{}/{}:{}", self.host, self.repository, self.tag)
    }

    /// Host and repository without the tag; used for keyring prefix matching.
    pub fn locator(&self) -> String {
        format!("{}/{}", self.host, self.repository)
    }

    pub fn plain_http(&self) -> bool {
        self.scheme.as_deref() == Some("http")
    }
}

impl fmt::Display for ArtifactReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scheme {
            Some(scheme) => write!(f, "{}://{}", scheme, self.registry_path()),
            None => write!(f, "{}", self.registry_path()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_component() {
        let reference =
            ArtifactReference::for_component("example-registry.io/components", "example/foo", "1.0.0")
                .unwrap();
        assert_eq!(reference.host(), "example-registry.io");
        assert_eq!(
            reference.to_string(),
            "example-registry.io/components/component-descriptors/example/foo:1.0.0"
        );
        assert!(!reference.plain_http());
    }

    #[test]
    fn test_scheme_is_kept_in_display() {
        let reference =
            ArtifactReference::for_component("https://registry.io/", "example/foo", "1.0.0").unwrap();
        assert_eq!(
            reference.to_string(),
            "https://registry.io/component-descriptors/example/foo:1.0.0"
        );
        assert_eq!(
            reference.registry_path(),
            "registry.io/component-descriptors/example/foo:1.0.0"
        );

        let plain =
            ArtifactReference::for_component("http://localhost:5000/c", "foo", "0.1.0").unwrap();
        assert!(plain.plain_http());
        assert_eq!(plain.host(), "localhost:5000");
        assert_eq!(plain.locator(), "localhost:5000/c/component-descriptors/foo");
    }

    #[test]
    fn test_invalid_references() {
        assert!(ArtifactReference::for_component("ftp://registry.io", "foo", "1.0.0").is_err());
        assert!(ArtifactReference::for_component("", "foo", "1.0.0").is_err());
        assert!(ArtifactReference::for_component("registry.io", "", "1.0.0").is_err());
        assert!(ArtifactReference::for_component("registry.io", "foo", "1.0/0").is_err());
    }
}
