use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::{ArtifactUpload, Registry};
use crate::credentials::Credentials;
use crate::digest::sha256_digest;
use crate::error::RegistryError;
use crate::reference::ArtifactReference;

#[derive(Default)]
struct State {
    blobs: HashMap<String, Vec<u8>>,
    manifests: BTreeMap<String, (String, Vec<u8>)>,
    blob_writes: usize,
    manifest_writes: usize,
    pushes: usize,
    required_auth: Option<Credentials>,
    fail_after_blob_writes: Option<usize>,
    failing_patterns: Vec<String>,
}

/// In-process registry for tests. Stores blobs by digest and
/// manifests by reference, and can be told to require credentials or to fail.
#[derive(Default)]
pub struct MemoryRegistry {
    state: Mutex<State>,
    latency: Option<Duration>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

/// Counts a push as in flight until dropped, including when the push future
/// is dropped mid-way.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects every push that does not present exactly these credentials.
    pub fn with_required_auth(mut self, credentials: Credentials) -> Self {
        self.state.get_mut().required_auth = Some(credentials);
        self
    }

    /// Fails the blob write that would exceed `count` successful writes.
    pub fn fail_after_blob_writes(mut self, count: usize) -> Self {
        self.state.get_mut().fail_after_blob_writes = Some(count);
        self
    }

    /// Fails pushes whose reference contains `pattern`, before anything is stored.
    pub fn fail_pushes_matching(mut self, pattern: &str) -> Self {
        self.state.get_mut().failing_patterns.push(pattern.to_string());
        self
    }

    /// Delays every push before it touches storage.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.fail_after_blob_writes = None;
        state.failing_patterns.clear();
    }

    pub fn blob_writes(&self) -> usize {
        self.state.lock().blob_writes
    }

    pub fn manifest_writes(&self) -> usize {
        self.state.lock().manifest_writes
    }

    /// Number of push calls that reached the registry, successful or not.
    pub fn pushes(&self) -> usize {
        self.state.lock().pushes
    }

    pub fn has_blob(&self, digest: &str) -> bool {
        self.state.lock().blobs.contains_key(digest)
    }

    pub fn blob(&self, digest: &str) -> Option<Vec<u8>> {
        self.state.lock().blobs.get(digest).cloned()
    }

    /// Digest and bytes of the manifest stored at `host/repository:tag`.
    pub fn manifest(&self, registry_path: &str) -> Option<(String, Vec<u8>)> {
        self.state.lock().manifests.get(registry_path).cloned()
    }

    pub fn manifest_count(&self) -> usize {
        self.state.lock().manifests.len()
    }

    /// Highest number of pushes that were running at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn enter(&self) -> InFlight<'_> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);
        InFlight(&self.in_flight)
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    fn name(&self) -> &str {
        "memory"
    }

    async fn push(
        &self,
        reference: &ArtifactReference,
        upload: &ArtifactUpload,
        auth: Option<&Credentials>,
    ) -> Result<String, RegistryError> {
        let _in_flight = self.enter();
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.lock();
        state.pushes += 1;

        if let Some(required) = &state.required_auth {
            if auth != Some(required) {
                return Err(RegistryError::Auth {
                    reference: reference.to_string(),
                    operation: "push",
                    message: "401 unauthorized".to_string(),
                });
            }
        }

        let name = reference.to_string();
        if state.failing_patterns.iter().any(|p| name.contains(p.as_str())) {
            return Err(RegistryError::Transport {
                reference: name,
                operation: "push",
                message: "injected failure".to_string(),
            });
        }

        for blob in upload.blobs() {
            if state.blobs.contains_key(&blob.digest) {
                continue;
            }
            if sha256_digest(&blob.data) != blob.digest {
                return Err(RegistryError::Transport {
                    reference: name,
                    operation: "blob upload",
                    message: format!("digest mismatch for {}", blob.digest),
                });
            }
            if state.fail_after_blob_writes == Some(state.blob_writes) {
                return Err(RegistryError::Transport {
                    reference: name,
                    operation: "blob upload",
                    message: "connection reset".to_string(),
                });
            }
            state.blobs.insert(blob.digest.clone(), blob.data.clone());
            state.blob_writes += 1;
        }

        let key = reference.registry_path();
        let unchanged = state
            .manifests
            .get(&key)
            .is_some_and(|(digest, _)| digest == &upload.manifest_digest);
        if !unchanged {
            state.manifests.insert(
                key,
                (upload.manifest_digest.clone(), upload.manifest.clone()),
            );
            state.manifest_writes += 1;
        }

        Ok(upload.manifest_digest.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::BlobUpload;

    fn blob(data: &[u8]) -> BlobUpload {
        BlobUpload {
            digest: sha256_digest(data),
            media_type: "application/octet-stream".to_string(),
            data: data.to_vec(),
        }
    }

    fn upload() -> ArtifactUpload {
        let manifest = b"{\"schemaVersion\":2}".to_vec();
        ArtifactUpload {
            config: blob(b"config"),
            layers: vec![blob(b"layer")],
            manifest_digest: sha256_digest(&manifest),
            manifest,
        }
    }

    fn reference() -> ArtifactReference {
        ArtifactReference::for_component("registry.io", "example/foo", "1.0.0").unwrap()
    }

    #[tokio::test]
    async fn test_push_is_idempotent() {
        let registry = MemoryRegistry::new();
        let upload = upload();

        registry.push(&reference(), &upload, None).await.unwrap();
        registry.push(&reference(), &upload, None).await.unwrap();

        assert_eq!(registry.blob_writes(), 2);
        assert_eq!(registry.manifest_writes(), 1);
        assert!(registry.has_blob(&upload.config.digest));
        assert!(registry.manifest(&reference().registry_path()).is_some());
    }

    #[tokio::test]
    async fn test_required_auth() {
        let creds = Credentials::new("user", "pw");
        let registry = MemoryRegistry::new().with_required_auth(creds.clone());

        let err = registry.push(&reference(), &upload(), None).await.unwrap_err();
        assert!(err.is_auth());
        assert_eq!(registry.blob_writes(), 0);

        registry.push(&reference(), &upload(), Some(&creds)).await.unwrap();
    }

    #[tokio::test]
    async fn test_partial_failure_never_publishes_manifest() {
        let registry = MemoryRegistry::new().fail_after_blob_writes(1);
        let upload = upload();

        assert!(registry.push(&reference(), &upload, None).await.is_err());
        assert_eq!(registry.blob_writes(), 1);
        assert_eq!(registry.manifest_count(), 0);

        registry.clear_failures();
        registry.push(&reference(), &upload, None).await.unwrap();
        assert_eq!(registry.blob_writes(), 2);
        assert_eq!(registry.manifest_count(), 1);
    }
}
