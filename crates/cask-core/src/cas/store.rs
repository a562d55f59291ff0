//! On-disk content-addressable blob store.
//!
//! Blobs live under `files/<first 2 hex chars>/<remaining hex chars>`
//! of the store directory. Writes are temp-file + rename, so a crash
//! mid-write never leaves a corrupt entry visible under its final hash.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use sha2::{Digest, Sha256};

use crate::error::{io_error, StoreError};

static TMP_WRITE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Compute the content hash (SHA256 hex) of a byte slice.
/// A pure function of the bytes: the store key for this content.
pub fn content_hash(content: &[u8]) -> String {
    format!("{:x}", Sha256::digest(content))
}

/// Content-addressable blob store rooted at one store directory.
#[derive(Debug)]
pub struct ContentStore {
    files_dir: PathBuf,
}

impl ContentStore {
    /// Open (creating if needed) the blob store under `store_dir/files`.
    pub fn open(store_dir: &Path) -> Result<Self, StoreError> {
        let files_dir = store_dir.join("files");
        fs::create_dir_all(&files_dir).map_err(|e| io_error("open store", Some(&files_dir), e))?;
        Ok(Self { files_dir })
    }

    /// Path a blob with this hash lives at.
    fn blob_path(&self, hash: &str) -> PathBuf {
        if hash.len() < 3 {
            return self.files_dir.join("invalid").join(hash);
        }
        self.files_dir.join(&hash[0..2]).join(&hash[2..])
    }

    /// Write content into the store; returns its content hash.
    /// Idempotent: content that already exists is not rewritten.
    pub fn put_file(&self, content: &[u8]) -> Result<String, StoreError> {
        let hash = content_hash(content);
        let dest = self.blob_path(&hash);
        if dest.exists() {
            return Ok(hash);
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| io_error("put_file", Some(parent), e))?;
        }

        // Unique temp name per write: concurrent puts of the same
        // content must not clobber each other's temp files.
        let n = TMP_WRITE_COUNTER.fetch_add(1, Ordering::Relaxed);
        let tmp = dest.with_extension(format!("tmp-{}-{}", std::process::id(), n));
        {
            let mut file =
                File::create(&tmp).map_err(|e| io_error("put_file", Some(&tmp), e))?;
            file.write_all(content)
                .map_err(|e| io_error("put_file", Some(&tmp), e))?;
            file.sync_all().map_err(|e| io_error("put_file", Some(&tmp), e))?;
        }
        if let Err(e) = fs::rename(&tmp, &dest) {
            let _ = fs::remove_file(&tmp);
            // A concurrent writer may have won the rename; content is
            // identical by construction, so an existing dest is fine.
            if !dest.exists() {
                return Err(io_error("put_file", Some(&dest), e));
            }
        }
        Ok(hash)
    }

    /// Write content while asserting its hash. Fails with
    /// `IntegrityMismatch` (and writes nothing) if the assertion is wrong.
    pub fn put_file_asserting(&self, content: &[u8], asserted: &str) -> Result<String, StoreError> {
        let computed = content_hash(content);
        if computed != asserted {
            return Err(StoreError::IntegrityMismatch {
                expected: asserted.to_string(),
                computed,
                context: "content store write".to_string(),
            });
        }
        self.put_file(content)
    }

    /// Whether a blob with this hash exists.
    pub fn has_content(&self, hash: &str) -> bool {
        self.blob_path(hash).is_file()
    }

    /// Read a blob back by hash.
    pub fn read_content(&self, hash: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.blob_path(hash);
        if !path.is_file() {
            return Err(StoreError::ContentMissing { hash: hash.to_string() });
        }
        fs::read(&path).map_err(|e| io_error("read_content", Some(&path), e))
    }

    /// Remove a blob by hash. Used only by prune; missing blobs are a no-op.
    pub fn remove_content(&self, hash: &str) -> Result<u64, StoreError> {
        let path = self.blob_path(hash);
        let size = match fs::metadata(&path) {
            Ok(m) => m.len(),
            Err(_) => return Ok(0),
        };
        fs::remove_file(&path).map_err(|e| io_error("remove_content", Some(&path), e))?;
        Ok(size)
    }

    /// All blob hashes currently on disk.
    pub fn list_hashes(&self) -> Result<Vec<String>, StoreError> {
        let mut hashes = Vec::new();
        let shards = match fs::read_dir(&self.files_dir) {
            Ok(rd) => rd,
            Err(e) => return Err(io_error("list_hashes", Some(&self.files_dir), e)),
        };
        for shard in shards.flatten() {
            if !shard.path().is_dir() {
                continue;
            }
            let prefix = shard.file_name().to_string_lossy().to_string();
            if let Ok(entries) = fs::read_dir(shard.path()) {
                for entry in entries.flatten() {
                    let name = entry.file_name().to_string_lossy().to_string();
                    // Skip leftover temp files from interrupted writes.
                    if name.contains(".tmp-") {
                        continue;
                    }
                    hashes.push(format!("{}{}", prefix, name));
                }
            }
        }
        Ok(hashes)
    }
}
