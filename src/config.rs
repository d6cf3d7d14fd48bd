use std::path::{Path, PathBuf};

/// Overrides the default OCI cache directory.
pub const CACHE_DIR_ENV: &str = "COMPONENT_CLI_CACHE_DIR";

const DEFAULT_REPLICATION_CONCURRENCY: usize = 4;

/// Cache root: the explicit path, then `$COMPONENT_CLI_CACHE_DIR`, then
/// `<user cache dir>/component-cli/oci`.
pub fn cache_dir(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    if let Some(path) = std::env::var_os(CACHE_DIR_ENV).filter(|p| !p.is_empty()) {
        return Some(PathBuf::from(path));
    }
    dirs::cache_dir().map(|dir| dir.join("component-cli").join("oci"))
}

#[derive(Debug, Clone, Default)]
pub struct TransportSettings {
    /// Talk plain HTTP to registries whose base URL is `http://` or has no scheme.
    pub allow_plain_http: bool,
}

#[derive(Debug, Clone)]
pub struct ReplicationSettings {
    /// Components pushed at the same time.
    pub concurrency: usize,
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_REPLICATION_CONCURRENCY,
        }
    }
}

impl ReplicationSettings {
    pub fn with_concurrency(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
        }
    }
}
