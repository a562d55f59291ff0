//! Integrity index: one JSON record per package identity, holding the
//! files index and any side-effects cache entries. Records are only
//! mutated by successful fetch/upload operations and are always written
//! with write-then-rename so a reader never sees a partial record.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{io_error, StoreError};

/// One file inside a package: content hash plus metadata.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileIndexEntry {
    pub hash: String,
    pub mode: u32,
    pub size: u64,
}

/// Files added/modified by a package's install-time side effects under
/// one build environment (cache key).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SideEffectsEntry {
    #[serde(default)]
    pub added: HashMap<String, FileIndexEntry>,
    #[serde(default)]
    pub modified: HashMap<String, FileIndexEntry>,
}

/// Persisted record for one package identity.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageIndex {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub files: HashMap<String, FileIndexEntry>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub side_effects: HashMap<String, SideEffectsEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetched_at: Option<String>,
}

impl PackageIndex {
    pub fn new(name: &str, version: &str, files: HashMap<String, FileIndexEntry>) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
            files,
            side_effects: HashMap::new(),
            fetched_at: Some(Utc::now().to_rfc3339()),
        }
    }
}

/// Split an identity `host/name/version` (scoped: `host/@scope/name/version`)
/// into (host, name, version).
pub fn parse_identity(id: &str) -> Option<(&str, String, &str)> {
    let parts: Vec<&str> = id.split('/').filter(|s| !s.is_empty()).collect();
    match parts.as_slice() {
        [host, name, version] if !name.starts_with('@') => {
            Some((host, (*name).to_string(), version))
        }
        [host, scope, name, version] if scope.starts_with('@') => {
            Some((host, format!("{}/{}", scope, name), version))
        }
        _ => None,
    }
}

/// Package name from an identity, for error reporting.
pub fn pkg_name_from_identity(id: &str) -> String {
    parse_identity(id)
        .map(|(_, name, _)| name)
        .unwrap_or_else(|| id.to_string())
}

/// Deterministic index file path for an identity:
/// `<index_dir>/<host>/<name>/<version>.json`.
pub fn index_file_path(index_dir: &Path, id: &str) -> Result<PathBuf, StoreError> {
    let (host, name, version) = parse_identity(id).ok_or_else(|| StoreError::Resolution {
        pkg_spec: id.to_string(),
        reason: "not a valid package identity".to_string(),
    })?;
    for part in [host, name.as_str(), version] {
        if part.contains("..") || part.contains('\\') {
            return Err(StoreError::Resolution {
                pkg_spec: id.to_string(),
                reason: "identity contains path traversal".to_string(),
            });
        }
    }
    Ok(index_dir
        .join(host)
        .join(name)
        .join(format!("{}.json", version)))
}

/// Read a package index record.
pub fn read_package_index(path: &Path) -> Result<PackageIndex, StoreError> {
    let bytes = fs::read(path).map_err(|e| io_error("read index", Some(path), e))?;
    serde_json::from_slice(&bytes).map_err(|e| StoreError::Io {
        operation: "parse index".to_string(),
        path: Some(path.to_string_lossy().to_string()),
        reason: e.to_string(),
    })
}

/// Write a package index record atomically (temp file + rename).
pub fn write_package_index(path: &Path, index: &PackageIndex) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| io_error("write index", Some(parent), e))?;
    }
    let bytes = serde_json::to_vec_pretty(index).map_err(|e| StoreError::Io {
        operation: "serialize index".to_string(),
        path: Some(path.to_string_lossy().to_string()),
        reason: e.to_string(),
    })?;
    let tmp = path.with_extension(format!("json.tmp-{}", std::process::id()));
    fs::write(&tmp, &bytes).map_err(|e| io_error("write index", Some(&tmp), e))?;
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        io_error("write index", Some(path), e)
    })?;
    Ok(())
}

/// All index records under `index_dir` (used by prune).
pub fn list_index_files(index_dir: &Path) -> Result<Vec<PathBuf>, StoreError> {
    let mut out = Vec::new();
    if !index_dir.is_dir() {
        return Ok(out);
    }
    let files = crate::util::walk_files(index_dir)
        .map_err(|e| io_error("list index", Some(index_dir), e))?;
    for (rel, path) in files {
        if rel.ends_with(".json") {
            out.push(path);
        }
    }
    Ok(out)
}
