pub mod archive;
pub mod cache;
pub mod cancel;
pub mod commands;
pub mod config;
pub mod credentials;
pub mod ctf;
pub mod descriptor;
pub mod digest;
pub mod error;
pub mod manifest;
pub mod notifier;
pub mod push;
pub mod reference;
pub mod registry;
pub mod tarball;

// Re-exports for easy access
pub use archive::{ComponentArchive, ExportFormat};
pub use cache::BlobCache;
pub use cancel::{CancelHandle, CancelSignal};
pub use credentials::{CredentialResolver, Credentials, Keyring};
pub use ctf::TransportBundle;
pub use descriptor::ComponentDescriptor;
pub use manifest::{ComponentManifest, ManifestBuilder};
pub use notifier::Notifier;
pub use push::{PushOptions, PushPipeline};
pub use reference::ArtifactReference;
pub use registry::{OciRegistry, Registry};
#[cfg(any(test, feature = "test-utils"))]
pub use registry::MemoryRegistry;
