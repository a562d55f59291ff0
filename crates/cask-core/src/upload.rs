//! Side-effects upload: record the files a package's install-time
//! scripts added or modified in a given build environment, so identical
//! environments can reuse the result.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::cas::ContentStore;
use crate::error::{io_error, StoreError};
use crate::index::{read_package_index, write_package_index, FileIndexEntry, SideEffectsEntry};
use crate::util::walk_files;

/// Options for one upload: which environment produced the side effects,
/// and which index record they belong to.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadOptions {
    /// Cache key naming the build environment (engine) used.
    pub side_effects_cache_key: String,
    /// Path of the package's existing files index record.
    pub files_index_file: String,
}

/// Scan `built_dir`, diff against the package's files index, and record
/// added/modified files under the side-effects cache key. The package
/// must have been fetched first: a missing index file is
/// `UploadNotFound`, and nothing is written in that case.
pub fn upload_side_effects(
    cas: &ContentStore,
    built_dir: &Path,
    opts: &UploadOptions,
) -> Result<(), StoreError> {
    let index_path = Path::new(&opts.files_index_file);
    if !index_path.is_file() {
        return Err(StoreError::UploadNotFound {
            files_index_file: opts.files_index_file.clone(),
        });
    }

    let mut index = read_package_index(index_path)?;
    let mut entry = SideEffectsEntry::default();

    let listed =
        walk_files(built_dir).map_err(|e| io_error("scan built package", Some(built_dir), e))?;
    for (rel, path) in listed {
        let data = std::fs::read(&path).map_err(|e| io_error("read built file", Some(&path), e))?;
        let hash = cas.put_file(&data)?;
        let file_entry = FileIndexEntry {
            hash,
            mode: file_mode(&path),
            size: data.len() as u64,
        };
        match index.files.get(&rel) {
            None => {
                entry.added.insert(rel, file_entry);
            }
            Some(existing) if existing.hash != file_entry.hash => {
                entry.modified.insert(rel, file_entry);
            }
            Some(_) => {} // unchanged
        }
    }

    index
        .side_effects
        .insert(opts.side_effects_cache_key.clone(), entry);
    write_package_index(index_path, &index)
}

#[cfg(unix)]
fn file_mode(path: &Path) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path).map(|m| m.permissions().mode() & 0o777).unwrap_or(0o644)
}

#[cfg(not(unix))]
fn file_mode(_path: &Path) -> u32 {
    0o644
}
