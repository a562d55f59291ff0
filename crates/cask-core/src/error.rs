//! Structured error types for cask operations.
//! The same enum is serialized into server error bodies and rehydrated
//! by the remote client, so local and remote failures share one shape.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Main error type for store operations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StoreError {
    /// Alias + bare specifier could not be resolved to a package identity
    Resolution {
        pkg_spec: String,
        reason: String,
    },
    /// Network/HTTP failure reaching a registry
    RegistryFetch {
        status: Option<u16>,
        url: String,
        hint: String,
        pkg_name: String,
        reason: String,
    },
    /// Computed content hash disagrees with the asserted/expected hash
    IntegrityMismatch {
        expected: String,
        computed: String,
        context: String,
    },
    /// Side-effects upload targets a package not yet in the integrity index
    UploadNotFound {
        files_index_file: String,
    },
    /// Server configured to reject uploads
    UploadForbidden,
    /// Server configured to ignore stop requests
    StopForbidden,
    /// Store pruning is never permitted from a network caller
    PruneForbidden,
    /// Protocol-level: only POST is accepted
    MethodNotAllowed {
        method: String,
    },
    /// Protocol-level: no such route
    RouteNotFound {
        path: String,
    },
    /// Package is not in the store and offline mode forbids fetching
    NoOfflineCopy {
        pkg_name: String,
    },
    /// Content hash not present in the content store
    ContentMissing {
        hash: String,
    },
    /// Store controller has been closed
    Closed,
    /// I/O failure
    Io {
        operation: String,
        path: Option<String>,
        reason: String,
    },
    /// Transport or serialization failure between client and server
    Protocol {
        reason: String,
    },
}

impl StoreError {
    /// Stable machine-readable error code (e.g. `ERR_CASK_FETCH_404`).
    pub fn code(&self) -> String {
        match self {
            StoreError::Resolution { .. } => "ERR_CASK_RESOLUTION".to_string(),
            StoreError::RegistryFetch { status, .. } => match status {
                Some(s) => format!("ERR_CASK_FETCH_{}", s),
                None => "ERR_CASK_FETCH".to_string(),
            },
            StoreError::IntegrityMismatch { .. } => "ERR_CASK_INTEGRITY_MISMATCH".to_string(),
            StoreError::UploadNotFound { .. } => "ERR_CASK_UPLOAD_NOT_FOUND".to_string(),
            StoreError::UploadForbidden => "ERR_CASK_UPLOAD_FORBIDDEN".to_string(),
            StoreError::StopForbidden => "ERR_CASK_STOP_FORBIDDEN".to_string(),
            StoreError::PruneForbidden => "ERR_CASK_PRUNE_FORBIDDEN".to_string(),
            StoreError::MethodNotAllowed { .. } => "ERR_CASK_METHOD_NOT_ALLOWED".to_string(),
            StoreError::RouteNotFound { .. } => "ERR_CASK_ROUTE_NOT_FOUND".to_string(),
            StoreError::NoOfflineCopy { .. } => "ERR_CASK_NO_OFFLINE_COPY".to_string(),
            StoreError::ContentMissing { .. } => "ERR_CASK_CONTENT_MISSING".to_string(),
            StoreError::Closed => "ERR_CASK_CLOSED".to_string(),
            StoreError::Io { .. } => "ERR_CASK_IO".to_string(),
            StoreError::Protocol { .. } => "ERR_CASK_PROTOCOL".to_string(),
        }
    }

    /// HTTP status the server responds with for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            StoreError::RegistryFetch { status, .. } => status.unwrap_or(500),
            StoreError::UploadNotFound { .. } => 404,
            StoreError::UploadForbidden
            | StoreError::StopForbidden
            | StoreError::PruneForbidden => 403,
            StoreError::MethodNotAllowed { .. } => 405,
            StoreError::RouteNotFound { .. } => 404,
            _ => 500,
        }
    }

    /// Registry fetch error with the standard hint text for the status.
    pub fn registry_fetch(status: u16, url: &str, pkg_name: &str) -> StoreError {
        let hint = match status {
            404 => format!(
                "{} is not in the registry, or you have no permission to fetch it.\n\n\
                 No authorization header was set for the request.",
                pkg_name
            ),
            401 | 403 => format!(
                "You do not have permission to fetch {}. Check your auth token.",
                pkg_name
            ),
            _ => format!("The registry returned HTTP {} for {}.", status, pkg_name),
        };
        StoreError::RegistryFetch {
            status: Some(status),
            url: url.to_string(),
            hint,
            pkg_name: pkg_name.to_string(),
            reason: format!("GET {}: {} - {}", url, status_text(status), status),
        }
    }
}

fn status_text(status: u16) -> &'static str {
    match status {
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "HTTP Error",
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Resolution { pkg_spec, reason } => {
                write!(f, "Cannot resolve {}: {}", pkg_spec, reason)
            }
            StoreError::RegistryFetch { reason, .. } => write!(f, "{}", reason),
            StoreError::IntegrityMismatch { expected, computed, context } => {
                write!(
                    f,
                    "Integrity check failed for {}: expected {}, got {}",
                    context, expected, computed
                )
            }
            StoreError::UploadNotFound { files_index_file } => {
                write!(
                    f,
                    "Cannot upload side effects: no files index at {} (fetch the package first)",
                    files_index_file
                )
            }
            StoreError::UploadForbidden => write!(f, "Store server does not accept uploads"),
            StoreError::StopForbidden => write!(f, "Store server ignores stop requests"),
            StoreError::PruneForbidden => {
                write!(f, "Store pruning is not permitted from a remote caller")
            }
            StoreError::MethodNotAllowed { method } => {
                write!(f, "Only POST is allowed, got {}", method)
            }
            StoreError::RouteNotFound { path } => write!(f, "Unknown route: {}", path),
            StoreError::NoOfflineCopy { pkg_name } => {
                write!(f, "{} is not in the store and offline mode is enabled", pkg_name)
            }
            StoreError::ContentMissing { hash } => {
                write!(f, "Content {} not found in store", hash)
            }
            StoreError::Closed => write!(f, "Store controller is closed"),
            StoreError::Io { operation, path, reason } => {
                write!(f, "I/O error in {}: {}", operation, reason)?;
                if let Some(path) = path {
                    write!(f, " (path: {})", path)?;
                }
                Ok(())
            }
            StoreError::Protocol { reason } => write!(f, "Store protocol error: {}", reason),
        }
    }
}

impl std::error::Error for StoreError {}

/// Convert std::io::Error to StoreError, tagging the failing operation.
pub fn io_error(operation: &str, path: Option<&std::path::Path>, source: std::io::Error) -> StoreError {
    StoreError::Io {
        operation: operation.to_string(),
        path: path.map(|p| p.to_string_lossy().to_string()),
        reason: source.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_error_fields() {
        let err = StoreError::registry_fetch(
            404,
            "https://registry.example.com/not-an-existing-package",
            "not-an-existing-package",
        );
        assert_eq!(err.code(), "ERR_CASK_FETCH_404");
        assert_eq!(err.http_status(), 404);
        match err {
            StoreError::RegistryFetch { status, hint, pkg_name, reason, .. } => {
                assert_eq!(status, Some(404));
                assert!(!hint.is_empty());
                assert_eq!(pkg_name, "not-an-existing-package");
                assert!(reason.contains("Not Found - 404"));
            }
            _ => panic!("expected RegistryFetch"),
        }
    }

    #[test]
    fn test_wire_round_trip() {
        let err = StoreError::registry_fetch(503, "https://r.example.com/x", "x");
        let json = serde_json::to_string(&err).unwrap();
        let back: StoreError = serde_json::from_str(&json).unwrap();
        assert_eq!(back.code(), err.code());
        assert_eq!(back.to_string(), err.to_string());
    }

    #[test]
    fn test_display() {
        let err = StoreError::UploadNotFound {
            files_index_file: "/store/index/fake-pkg.json".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("fake-pkg"));
        assert!(msg.contains("fetch the package first"));
        assert_eq!(err.http_status(), 404);
    }
}
