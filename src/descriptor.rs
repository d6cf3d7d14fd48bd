//! Component descriptor model (schema `v2`).
//!
//! The descriptor is decoded structurally with serde; nothing beyond the shape
//! and a handful of archive invariants is validated here.
//!
//! Resource access is a tagged variant. Known access kinds decode into
//! [`KnownAccess`]; anything else is kept verbatim as [`UnknownAccess`] so it
//! survives a decode/encode round trip and can be rejected loudly by consumers
//! that need to dereference it.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

pub const SCHEMA_VERSION: &str = "v2";
pub const OCI_REGISTRY_TYPE: &str = "ociRegistry";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentDescriptor {
    pub meta: Metadata,
    pub component: Component,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub schema_version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Component {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// Append-only history; the last element is the effective context.
    #[serde(default)]
    pub repository_contexts: Vec<RepositoryContext>,
    #[serde(default)]
    pub sources: Vec<Resource>,
    #[serde(default)]
    pub component_references: Vec<ComponentReference>,
    #[serde(default)]
    pub resources: Vec<Resource>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<Label>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryContext {
    #[serde(rename = "type")]
    pub context_type: String,
    pub base_url: String,
}

impl RepositoryContext {
    pub fn oci_registry(base_url: &str) -> Self {
        Self {
            context_type: OCI_REGISTRY_TYPE.to_string(),
            base_url: base_url.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Relation {
    Local,
    External,
}

/// A resource or source entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_identity: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relation: Option<Relation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<Label>,
    pub access: Access,
}

impl Resource {
    pub fn identity(&self) -> ResourceIdentity {
        ResourceIdentity {
            name: self.name.clone(),
            version: self.version.clone(),
            extra_identity: self.extra_identity.clone(),
        }
    }

    /// Declared relation, or `local` when the access is a local filesystem blob.
    pub fn relation(&self) -> Relation {
        self.relation.unwrap_or_else(|| {
            if self.access.local_blob().is_some() {
                Relation::Local
            } else {
                Relation::External
            }
        })
    }

    pub fn is_local(&self) -> bool {
        self.relation() == Relation::Local
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentReference {
    pub name: String,
    pub component_name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_identity: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<Label>,
}

impl ComponentReference {
    pub fn identity(&self) -> ResourceIdentity {
        ResourceIdentity {
            name: self.name.clone(),
            version: self.version.clone(),
            extra_identity: self.extra_identity.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Access {
    Known(KnownAccess),
    Unknown(UnknownAccess),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum KnownAccess {
    #[serde(rename_all = "camelCase")]
    LocalFilesystemBlob {
        filename: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        media_type: Option<String>,
    },
    LocalOciBlob {
        digest: String,
    },
    #[serde(rename_all = "camelCase")]
    OciRegistry {
        image_reference: String,
    },
    Web {
        url: String,
    },
    #[serde(rename_all = "camelCase")]
    Github {
        repo_url: String,
        #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
        git_ref: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        commit: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    S3 {
        bucket_name: String,
        object_key: String,
    },
}

/// Access of a type this crate does not model, preserved field by field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnknownAccess {
    #[serde(rename = "type")]
    pub access_type: String,
    #[serde(flatten)]
    pub fields: BTreeMap<String, serde_json::Value>,
}

const KNOWN_ACCESS_TYPES: &[&str] = &[
    "localFilesystemBlob",
    "localOciBlob",
    "ociRegistry",
    "web",
    "github",
    "s3",
];

impl Access {
    pub fn local_filesystem_blob(filename: &str, media_type: Option<String>) -> Self {
        Access::Known(KnownAccess::LocalFilesystemBlob {
            filename: filename.to_string(),
            media_type,
        })
    }

    pub fn local_oci_blob(digest: &str) -> Self {
        Access::Known(KnownAccess::LocalOciBlob {
            digest: digest.to_string(),
        })
    }

    pub fn oci_registry(image_reference: &str) -> Self {
        Access::Known(KnownAccess::OciRegistry {
            image_reference: image_reference.to_string(),
        })
    }

    pub fn access_type(&self) -> &str {
        match self {
            Access::Known(KnownAccess::LocalFilesystemBlob { .. }) => "localFilesystemBlob",
            Access::Known(KnownAccess::LocalOciBlob { .. }) => "localOciBlob",
            Access::Known(KnownAccess::OciRegistry { .. }) => "ociRegistry",
            Access::Known(KnownAccess::Web { .. }) => "web",
            Access::Known(KnownAccess::Github { .. }) => "github",
            Access::Known(KnownAccess::S3 { .. }) => "s3",
            Access::Unknown(unknown) => &unknown.access_type,
        }
    }

    /// File name and optional media type of a local filesystem blob access.
    pub fn local_blob(&self) -> Option<(&str, Option<&str>)> {
        match self {
            Access::Known(KnownAccess::LocalFilesystemBlob {
                filename,
                media_type,
            }) => Some((filename.as_str(), media_type.as_deref())),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceIdentity {
    pub name: String,
    pub version: String,
    pub extra_identity: BTreeMap<String, String>,
}

impl fmt::Display for ResourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.version)?;
        for (key, value) in &self.extra_identity {
            write!(f, ",{}={}", key, value)?;
        }
        Ok(())
    }
}

/// Name and version of a component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ComponentIdentity {
    pub name: String,
    pub version: String,
}

impl ComponentIdentity {
    pub fn new(name: &str, version: &str) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
        }
    }
}

impl fmt::Display for ComponentIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.version)
    }
}

impl ComponentDescriptor {
    pub fn new(name: &str, version: &str) -> Self {
        Self {
            meta: Metadata {
                schema_version: SCHEMA_VERSION.to_string(),
            },
            component: Component {
                name: name.to_string(),
                version: version.to_string(),
                provider: None,
                repository_contexts: Vec::new(),
                sources: Vec::new(),
                component_references: Vec::new(),
                resources: Vec::new(),
                labels: Vec::new(),
            },
        }
    }

    pub fn from_yaml(data: &[u8]) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_slice(data)
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    /// Compact JSON with struct field order; stable across runs.
    pub fn to_canonical_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn identity(&self) -> ComponentIdentity {
        ComponentIdentity::new(&self.component.name, &self.component.version)
    }

    pub fn effective_repository_context(&self) -> Option<&RepositoryContext> {
        self.component.repository_contexts.last()
    }

    /// Appends `base_url` to the context history, making it the effective
    /// repository context. Repeating the current context still appends.
    pub fn push_repository_context(&mut self, base_url: &str) {
        self.component
            .repository_contexts
            .push(RepositoryContext::oci_registry(base_url));
    }

    /// Resources and sources, in that order.
    pub fn artifacts(&self) -> impl Iterator<Item = &Resource> {
        self.component
            .resources
            .iter()
            .chain(self.component.sources.iter())
    }

    /// Structural checks: identity present, supported schema, unique entry
    /// identities, well-formed known access types.
    pub fn validate(&self) -> Result<(), String> {
        if self.meta.schema_version != SCHEMA_VERSION {
            return Err(format!(
                "unsupported schema version '{}' (expected '{}')",
                self.meta.schema_version, SCHEMA_VERSION
            ));
        }
        if self.component.name.trim().is_empty() {
            return Err("component name must not be empty".to_string());
        }
        if self.component.version.trim().is_empty() {
            return Err("component version must not be empty".to_string());
        }

        check_unique("resource", self.component.resources.iter().map(Resource::identity))?;
        check_unique("source", self.component.sources.iter().map(Resource::identity))?;
        check_unique(
            "component reference",
            self.component
                .component_references
                .iter()
                .map(ComponentReference::identity),
        )?;

        for entry in self.artifacts() {
            if let Access::Unknown(unknown) = &entry.access {
                if KNOWN_ACCESS_TYPES.contains(&unknown.access_type.as_str()) {
                    return Err(format!(
                        "malformed '{}' access for {}",
                        unknown.access_type,
                        entry.identity()
                    ));
                }
            }
            if entry.relation == Some(Relation::External) && entry.access.local_blob().is_some() {
                return Err(format!(
                    "{} is external but points at a local blob",
                    entry.identity()
                ));
            }
        }

        Ok(())
    }
}

fn check_unique<I>(kind: &str, identities: I) -> Result<(), String>
where
    I: Iterator<Item = ResourceIdentity>,
{
    let mut seen = HashSet::new();
    for identity in identities {
        if !seen.insert(identity.clone()) {
            return Err(format!("duplicate {} identity {}", kind, identity));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const DESCRIPTOR: &str = r#"
meta:
  schemaVersion: v2
component:
  name: example/foo
  version: 1.0.0
  provider: internal
  repositoryContexts:
  - type: ociRegistry
    baseUrl: old-registry.io/components
  - type: ociRegistry
    baseUrl: example-registry.io/components
  sources:
  - name: repo
    version: 1.0.0
    type: git
    access:
      type: github
      repoUrl: github.com/example/foo
      ref: refs/tags/v1.0.0
  componentReferences:
  - name: bar
    componentName: example/bar
    version: 2.0.0
  resources:
  - name: cli-binary-linux
    version: 1.0.0
    type: executable
    extraIdentity:
      os: linux
    access:
      type: localFilesystemBlob
      filename: sha256.abc
  - name: image
    version: 1.0.0
    type: ociImage
    relation: external
    access:
      type: ociRegistry
      imageReference: example-registry.io/image:1.0.0
  - name: custom
    version: 1.0.0
    type: blob
    relation: external
    access:
      type: vendorBucket
      bucket: things
      region: eu
"#;

    #[test]
    fn test_decode_descriptor() {
        let cd = ComponentDescriptor::from_yaml(DESCRIPTOR.as_bytes()).unwrap();
        assert_eq!(cd.identity(), ComponentIdentity::new("example/foo", "1.0.0"));
        assert_eq!(cd.component.resources.len(), 3);
        assert_eq!(cd.component.sources.len(), 1);
        assert_eq!(cd.component.component_references.len(), 1);
        assert!(cd.validate().is_ok());

        let binary = &cd.component.resources[0];
        assert_eq!(binary.relation(), Relation::Local);
        assert_eq!(binary.access.local_blob(), Some(("sha256.abc", None)));

        let image = &cd.component.resources[1];
        assert_eq!(image.relation(), Relation::External);
        assert_eq!(image.access.access_type(), "ociRegistry");

        let source = &cd.component.sources[0];
        assert!(matches!(
            &source.access,
            Access::Known(KnownAccess::Github { git_ref: Some(r), .. }) if r == "refs/tags/v1.0.0"
        ));
    }

    #[test]
    fn test_unknown_access_round_trip() {
        let cd = ComponentDescriptor::from_yaml(DESCRIPTOR.as_bytes()).unwrap();
        let custom = &cd.component.resources[2];
        match &custom.access {
            Access::Unknown(unknown) => {
                assert_eq!(unknown.access_type, "vendorBucket");
                assert_eq!(unknown.fields["bucket"], serde_json::json!("things"));
            }
            other => panic!("expected unknown access, got {:?}", other),
        }

        let encoded = cd.to_yaml().unwrap();
        let decoded = ComponentDescriptor::from_yaml(encoded.as_bytes()).unwrap();
        assert_eq!(cd, decoded);
    }

    #[test]
    fn test_effective_repository_context() {
        let mut cd = ComponentDescriptor::from_yaml(DESCRIPTOR.as_bytes()).unwrap();
        assert_eq!(
            cd.effective_repository_context().unwrap().base_url,
            "example-registry.io/components"
        );

        cd.push_repository_context("https://new-registry.io/c");
        assert_eq!(cd.component.repository_contexts.len(), 3);
        assert_eq!(
            cd.effective_repository_context().unwrap().base_url,
            "https://new-registry.io/c"
        );

        cd.push_repository_context("https://new-registry.io/c");
        assert_eq!(cd.component.repository_contexts.len(), 4);
        assert_eq!(
            cd.component.repository_contexts[2],
            cd.component.repository_contexts[3]
        );
    }

    #[test]
    fn test_duplicate_identity_rejected() {
        let mut cd = ComponentDescriptor::from_yaml(DESCRIPTOR.as_bytes()).unwrap();
        let duplicate = cd.component.resources[1].clone();
        cd.component.resources.push(duplicate);
        let err = cd.validate().unwrap_err();
        assert!(err.contains("duplicate resource identity"));
    }

    #[test]
    fn test_extra_identity_distinguishes_resources() {
        let mut cd = ComponentDescriptor::from_yaml(DESCRIPTOR.as_bytes()).unwrap();
        let mut darwin = cd.component.resources[0].clone();
        darwin
            .extra_identity
            .insert("os".to_string(), "darwin".to_string());
        cd.component.resources.push(darwin);
        assert!(cd.validate().is_ok());
    }

    #[test]
    fn test_malformed_known_access_rejected() {
        let yaml = DESCRIPTOR.replace("filename: sha256.abc", "file: sha256.abc");
        let cd = ComponentDescriptor::from_yaml(yaml.as_bytes()).unwrap();
        let err = cd.validate().unwrap_err();
        assert!(err.contains("malformed 'localFilesystemBlob' access"));
    }

    #[test]
    fn test_canonical_json_is_stable() {
        let cd = ComponentDescriptor::from_yaml(DESCRIPTOR.as_bytes()).unwrap();
        let first = cd.to_canonical_json().unwrap();
        let second = ComponentDescriptor::from_yaml(cd.to_yaml().unwrap().as_bytes())
            .unwrap()
            .to_canonical_json()
            .unwrap();
        assert_eq!(first, second);
    }
}
