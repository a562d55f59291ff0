//! Subresource Integrity (SRI) parsing and verification for fetched tarballs.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use sha2::{Digest, Sha256, Sha384, Sha512};

use crate::error::StoreError;

/// Hash algorithms accepted in SRI strings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha384 => "sha384",
            HashAlgorithm::Sha512 => "sha512",
        }
    }

    /// Base64 digest of content under this algorithm.
    fn digest_b64(&self, content: &[u8]) -> String {
        match self {
            HashAlgorithm::Sha256 => BASE64.encode(Sha256::digest(content)),
            HashAlgorithm::Sha384 => BASE64.encode(Sha384::digest(content)),
            HashAlgorithm::Sha512 => BASE64.encode(Sha512::digest(content)),
        }
    }
}

/// One parsed `<algorithm>-<base64 hash>` SRI entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IntegrityHash {
    pub algorithm: HashAlgorithm,
    pub hash: String,
}

impl IntegrityHash {
    /// Parse a single SRI entry. Multi-hash strings are split by the caller.
    pub fn parse(sri: &str) -> Option<Self> {
        let (algo, hash) = sri.trim().split_once('-')?;
        let algorithm = match algo {
            "sha256" => HashAlgorithm::Sha256,
            "sha384" => HashAlgorithm::Sha384,
            "sha512" => HashAlgorithm::Sha512,
            _ => return None,
        };
        if hash.is_empty() {
            return None;
        }
        Some(Self { algorithm, hash: hash.to_string() })
    }

    pub fn matches(&self, content: &[u8]) -> bool {
        self.algorithm.digest_b64(content) == self.hash
    }

    pub fn as_sri(&self) -> String {
        format!("{}-{}", self.algorithm.name(), self.hash)
    }
}

/// Compute the SRI for content (sha512, the npm registry default).
pub fn compute_integrity(content: &[u8]) -> String {
    IntegrityHash {
        algorithm: HashAlgorithm::Sha512,
        hash: HashAlgorithm::Sha512.digest_b64(content),
    }
    .as_sri()
}

/// Verify content against an expected SRI string. The string may carry
/// several space-separated hashes; any matching entry passes.
/// Fails with `IntegrityMismatch` rather than returning a bool, so the
/// failure carries what was expected and what was computed.
pub fn verify_integrity(content: &[u8], expected: &str, context: &str) -> Result<(), StoreError> {
    for sri in expected.split_whitespace() {
        if let Some(parsed) = IntegrityHash::parse(sri) {
            if parsed.matches(content) {
                return Ok(());
            }
        }
    }
    Err(StoreError::IntegrityMismatch {
        expected: expected.to_string(),
        computed: compute_integrity(content),
        context: context.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let parsed = IntegrityHash::parse("sha512-abc123==").unwrap();
        assert_eq!(parsed.algorithm, HashAlgorithm::Sha512);
        assert_eq!(parsed.hash, "abc123==");
        assert!(IntegrityHash::parse("md5-nope").is_none());
        assert!(IntegrityHash::parse("sha256-").is_none());
    }

    #[test]
    fn test_verify_round_trip() {
        let content = b"tarball bytes";
        let sri = compute_integrity(content);
        assert!(sri.starts_with("sha512-"));
        assert!(verify_integrity(content, &sri, "test").is_ok());

        let err = verify_integrity(b"tampered bytes", &sri, "test").unwrap_err();
        match err {
            StoreError::IntegrityMismatch { expected, computed, .. } => {
                assert_eq!(expected, sri);
                assert_ne!(computed, sri);
            }
            _ => panic!("expected IntegrityMismatch"),
        }
    }

    #[test]
    fn test_multi_hash_sri() {
        let content = b"content";
        let sha512 = compute_integrity(content);
        let combined = format!("sha256-bogus {}", sha512);
        assert!(verify_integrity(content, &combined, "test").is_ok());
    }
}
