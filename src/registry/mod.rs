//! Registry transport seam.
//!
//! The push pipeline hands a fully materialized artifact (config, layers and the
//! serialized manifest) to a [`Registry`]. Implementations upload the config and
//! layer blobs first and the manifest last; a manifest is only visible once all
//! of its blobs are. Uploads are idempotent, so retrying after a partial failure
//! completes the artifact.

#[cfg(any(test, feature = "test-utils"))]
mod memory;
mod oci;

#[cfg(any(test, feature = "test-utils"))]
pub use memory::MemoryRegistry;
pub use oci::OciRegistry;

use async_trait::async_trait;

use crate::credentials::Credentials;
use crate::error::RegistryError;
use crate::reference::ArtifactReference;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobUpload {
    pub digest: String,
    pub media_type: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ArtifactUpload {
    pub config: BlobUpload,
    pub layers: Vec<BlobUpload>,
    pub manifest: Vec<u8>,
    pub manifest_digest: String,
}

impl ArtifactUpload {
    /// Config first, then layers in manifest order.
    pub fn blobs(&self) -> impl Iterator<Item = &BlobUpload> {
        std::iter::once(&self.config).chain(self.layers.iter())
    }
}

#[async_trait]
pub trait Registry: Send + Sync {
    fn name(&self) -> &str;

    /// Uploads all blobs and then the manifest, returning the manifest digest
    /// the registry stored.
    async fn push(
        &self,
        reference: &ArtifactReference,
        upload: &ArtifactUpload,
        auth: Option<&Credentials>,
    ) -> Result<String, RegistryError>;
}
