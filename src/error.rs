//! Error types for each stage of the component publishing pipeline.
//!
//! Every stage has its own enum so callers can tell a malformed archive from a
//! rejected credential or a flaky registry without string matching:
//! - [`ArchiveError`]: loading, exporting and mutating component archives.
//! - [`CacheError`]: the content-addressed blob cache.
//! - [`BuildError`]: turning an archive into an OCI manifest.
//! - [`CredentialError`]: reading credential files and fallback sources.
//! - [`RegistryError`]: the registry transport.
//! - [`PushError`]: the push pipeline, wrapping the above with component context.
//! - [`BundleError`]: the common transport format (CTF) bundle.

use std::path::PathBuf;
use thiserror::Error;

use crate::descriptor::ComponentIdentity;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("{} not found", path.display())]
    NotFound { path: PathBuf },

    #[error("invalid component descriptor {}: {source}", path.display())]
    InvalidDescriptor {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid component archive: {0}")]
    Structural(String),

    #[error("IO error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode component descriptor: {0}")]
    Encode(#[source] serde_yaml::Error),
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("IO error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("blob {digest} not found in cache")]
    NotFound { digest: String },

    #[error("cache entry {digest} is corrupted: content hashes to {actual}")]
    Corrupted { digest: String, actual: String },

    #[error("content does not match digest: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("invalid digest format: {0}")]
    InvalidDigest(String),
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("failed to read blob {} for {entry}: {source}", path.display())]
    BlobRead {
        entry: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize {what}: {message}")]
    Serialization { what: &'static str, message: String },

    #[error("{entry} is local but its access type '{access_type}' cannot be materialized")]
    UnsupportedAccess { entry: String, access_type: String },

    #[error("{entry} references blob {digest} which is not in the cache")]
    MissingBlob { entry: String, digest: String },

    #[error(transparent)]
    Cache(#[from] CacheError),
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("failed to read credential file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse credential file {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },

    #[error("credential lookup for {host} via {source_name} failed: {message}")]
    Lookup {
        host: String,
        source_name: String,
        message: String,
    },
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("authentication failed during {operation} of {reference}: {message}")]
    Auth {
        reference: String,
        operation: &'static str,
        message: String,
    },

    #[error("{operation} of {reference} failed: {message}")]
    Transport {
        reference: String,
        operation: &'static str,
        message: String,
    },

    #[error("invalid registry reference {reference}: {message}")]
    InvalidReference { reference: String, message: String },
}

impl RegistryError {
    pub fn is_auth(&self) -> bool {
        matches!(self, RegistryError::Auth { .. })
    }
}

#[derive(Debug, Error)]
pub enum PushError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("unable to build oci artifact for {component}: {source}")]
    ManifestBuild {
        component: ComponentIdentity,
        #[source]
        source: BuildError,
    },

    #[error("cache error while pushing {component}: {source}")]
    Cache {
        component: ComponentIdentity,
        #[source]
        source: CacheError,
    },

    #[error("authentication error while pushing {component}: {source}")]
    Auth {
        component: ComponentIdentity,
        #[source]
        source: RegistryError,
    },

    #[error("registry error while pushing {component}: {source}")]
    Registry {
        component: ComponentIdentity,
        #[source]
        source: RegistryError,
    },

    #[error("unable to read component archive for {component}: {source}")]
    Archive {
        component: ComponentIdentity,
        #[source]
        source: ArchiveError,
    },

    #[error("push of {component} was cancelled")]
    Cancelled { component: ComponentIdentity },

    #[error("push of {component} was interrupted: {message}")]
    Interrupted {
        component: ComponentIdentity,
        message: String,
    },
}

impl PushError {
    /// Wraps a transport failure, keeping authentication problems distinct.
    pub fn from_registry(component: ComponentIdentity, source: RegistryError) -> Self {
        if source.is_auth() {
            PushError::Auth { component, source }
        } else {
            PushError::Registry { component, source }
        }
    }
}

#[derive(Debug, Error)]
pub enum BundleError {
    #[error("IO error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed transport bundle: {0}")]
    Malformed(String),

    #[error("transport bundle is sealed")]
    Sealed,

    #[error("{identity} is already in the bundle with different content ({existing}, new {new})")]
    Conflict {
        identity: ComponentIdentity,
        existing: String,
        new: String,
    },

    #[error("blob {digest} is missing from the bundle")]
    MissingBlob { digest: String },

    #[error(transparent)]
    Archive(#[from] ArchiveError),
}
