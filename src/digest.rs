//! Content digests and the file names derived from them.
//!
//! Every stored blob is identified only by its `sha256:<hex>` digest. On disk the
//! colon is replaced so names stay portable (`sha256.<hex>`).

use sha2::{Digest, Sha256};

use crate::error::CacheError;

pub const SHA256_PREFIX: &str = "sha256:";
const FILE_NAME_PREFIX: &str = "sha256.";

/// Computes the `sha256:<hex>` digest of `data`.
pub fn sha256_digest(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{}{}", SHA256_PREFIX, hex::encode(hasher.finalize()))
}

/// Checks the digest format and returns its hex part.
pub fn validate(digest: &str) -> Result<&str, CacheError> {
    let hex_part = digest
        .strip_prefix(SHA256_PREFIX)
        .ok_or_else(|| CacheError::InvalidDigest(format!("{} must start with sha256:", digest)))?;

    if hex_part.len() != 64 {
        return Err(CacheError::InvalidDigest(format!(
            "{} must have 64 hex characters",
            digest
        )));
    }

    if !hex_part
        .chars()
        .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
    {
        return Err(CacheError::InvalidDigest(format!(
            "{} must contain only lowercase hex characters",
            digest
        )));
    }

    Ok(hex_part)
}

/// File name used for a blob inside archives and bundles, e.g. `sha256.abc…`.
pub fn blob_file_name(digest: &str) -> String {
    match digest.strip_prefix(SHA256_PREFIX) {
        Some(hex_part) => format!("{}{}", FILE_NAME_PREFIX, hex_part),
        None => digest.replace(':', "."),
    }
}

/// Inverse of [`blob_file_name`]. Accepts an optional extension such as `.tar`.
pub fn digest_from_file_name(name: &str) -> Option<String> {
    let hex_part = name.strip_prefix(FILE_NAME_PREFIX)?;
    let hex_part = hex_part.split('.').next()?;
    let digest = format!("{}{}", SHA256_PREFIX, hex_part);
    validate(&digest).ok()?;
    Some(digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_digest() {
        assert_eq!(
            sha256_digest(b""),
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        let digest = sha256_digest(b"hello world");
        assert!(digest.starts_with("sha256:"));
        assert_eq!(digest.len(), 7 + 64);
    }

    #[test]
    fn test_validate() {
        let digest = sha256_digest(b"data");
        assert!(validate(&digest).is_ok());
        assert!(validate("md5:123456").is_err());
        assert!(validate("sha256:123").is_err());
        assert!(validate(&digest.to_uppercase().replace("SHA256", "sha256")).is_err());
    }

    #[test]
    fn test_blob_file_name_round_trip() {
        let digest = sha256_digest(b"blob");
        let name = blob_file_name(&digest);
        assert!(name.starts_with("sha256."));
        assert!(!name.contains(':'));
        assert_eq!(digest_from_file_name(&name), Some(digest.clone()));
        assert_eq!(
            digest_from_file_name(&format!("{}.tar", name)),
            Some(digest)
        );
        assert_eq!(digest_from_file_name("component-descriptor.yaml"), None);
    }
}
