//! Package fetcher: download a tarball (or read a local directory),
//! verify integrity, unpack, and hash every file into the content
//! store, producing the files index for the integrity index.

use std::collections::HashMap;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use flate2::read::GzDecoder;
use rand::Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tar::Archive;

use crate::cas::{verify_integrity, ContentStore};
use crate::config::RetryPolicy;
use crate::error::{io_error, StoreError};
use crate::index::{pkg_name_from_identity, FileIndexEntry};
use crate::resolve::Resolution;

/// Where a fetch result was produced from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolvedFrom {
    Remote,
    Store,
    LocalDir,
}

/// Output of one fetch: the files index plus provenance.
#[derive(Clone, Debug)]
pub struct FetchedPackage {
    pub files: HashMap<String, FileIndexEntry>,
    pub resolved_from: ResolvedFrom,
}

/// Downloads and unpacks package content. Retry behavior comes entirely
/// from the caller-supplied policy; nothing here is hardcoded.
pub struct Fetcher {
    client: reqwest::Client,
    retry: RetryPolicy,
    auth_token: Option<String>,
}

impl Fetcher {
    pub fn new(retry: RetryPolicy, auth_token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            retry,
            auth_token,
        }
    }

    /// Fetch a resolved package into the content store.
    pub async fn fetch(
        &self,
        cas: &Arc<ContentStore>,
        id: &str,
        resolution: &Resolution,
    ) -> Result<FetchedPackage, StoreError> {
        if let Some(dir) = &resolution.directory {
            let cas = Arc::clone(cas);
            let dir = PathBuf::from(dir);
            let files = tokio::task::spawn_blocking(move || store_local_dir(&cas, &dir))
                .await
                .map_err(|e| StoreError::Protocol { reason: e.to_string() })??;
            return Ok(FetchedPackage { files, resolved_from: ResolvedFrom::LocalDir });
        }

        let tarball = resolution.tarball.as_deref().ok_or_else(|| StoreError::Resolution {
            pkg_spec: id.to_string(),
            reason: "resolution has neither tarball nor directory".to_string(),
        })?;
        let pkg_name = pkg_name_from_identity(id);
        let bytes = self.download_with_retry(tarball, &pkg_name).await?;
        if let Some(expected) = &resolution.integrity {
            verify_integrity(&bytes, expected, &format!("{} tarball", pkg_name))?;
        }

        let cas = Arc::clone(cas);
        let files = tokio::task::spawn_blocking(move || unpack_and_store(&cas, &bytes))
            .await
            .map_err(|e| StoreError::Protocol { reason: e.to_string() })??;
        Ok(FetchedPackage { files, resolved_from: ResolvedFrom::Remote })
    }

    /// Download with exponential backoff + jitter. Retryable failures
    /// (timeouts, connection errors, 5xx, 429) are retried up to the
    /// configured limit; other HTTP errors surface immediately.
    async fn download_with_retry(&self, url: &str, pkg_name: &str) -> Result<Vec<u8>, StoreError> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.try_download(url, pkg_name).await {
                Ok(bytes) => return Ok(bytes),
                Err(err) => {
                    if attempt > self.retry.retries || !is_retryable(&err) {
                        return Err(err);
                    }
                    let jitter = rand::thread_rng().gen_range(0..100);
                    let delay = self.retry.delay_ms(attempt) + jitter;
                    tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                }
            }
        }
    }

    async fn try_download(&self, url: &str, pkg_name: &str) -> Result<Vec<u8>, StoreError> {
        let mut req = self.client.get(url);
        if let Some(token) = self.auth_token.as_deref().filter(|t| !t.is_empty()) {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await.map_err(|e| StoreError::RegistryFetch {
            status: None,
            url: url.to_string(),
            hint: format!("Could not reach the registry for {}.", pkg_name),
            pkg_name: pkg_name.to_string(),
            reason: e.to_string(),
        })?;
        let status = resp.status().as_u16();
        if status != 200 {
            return Err(StoreError::registry_fetch(status, url, pkg_name));
        }
        let body = resp.bytes().await.map_err(|e| StoreError::RegistryFetch {
            status: None,
            url: url.to_string(),
            hint: format!("The download for {} was interrupted.", pkg_name),
            pkg_name: pkg_name.to_string(),
            reason: e.to_string(),
        })?;
        Ok(body.to_vec())
    }
}

fn is_retryable(err: &StoreError) -> bool {
    match err {
        StoreError::RegistryFetch { status, .. } => match status {
            // Transport-level failures (timeout, reset) carry no status.
            None => true,
            Some(s) => *s >= 500 || *s == 429,
        },
        _ => false,
    }
}

/// Unpack a gzipped tarball, strip one leading path component, and hash
/// every file into the content store in parallel. Returns the files index.
pub(crate) fn unpack_and_store(
    cas: &ContentStore,
    tarball: &[u8],
) -> Result<HashMap<String, FileIndexEntry>, StoreError> {
    let dec = GzDecoder::new(tarball);
    let mut archive = Archive::new(dec);

    let mut pending: Vec<(String, u32, Vec<u8>)> = Vec::new();
    let entries = archive
        .entries()
        .map_err(|e| StoreError::Io {
            operation: "unpack tarball".to_string(),
            path: None,
            reason: e.to_string(),
        })?;
    for entry in entries {
        let mut entry = entry.map_err(|e| StoreError::Io {
            operation: "unpack tarball".to_string(),
            path: None,
            reason: e.to_string(),
        })?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry.path().map_err(|e| StoreError::Io {
            operation: "unpack tarball".to_string(),
            path: None,
            reason: e.to_string(),
        })?;
        let path_str = path.to_string_lossy();
        // npm tarballs nest everything under one top-level directory
        // (usually `package/`); strip it.
        let parts: Vec<&str> = path_str.split('/').filter(|s| !s.is_empty()).collect();
        if parts.len() < 2 {
            continue;
        }
        let rel = parts[1..].join("/");
        let mode = entry.header().mode().unwrap_or(0o644);
        let mut data = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut data).map_err(|e| StoreError::Io {
            operation: "unpack tarball".to_string(),
            path: Some(rel.clone()),
            reason: e.to_string(),
        })?;
        pending.push((rel, mode, data));
    }

    let results: Vec<Result<(String, FileIndexEntry), StoreError>> = pending
        .into_par_iter()
        .map(|(rel, mode, data)| {
            let hash = cas.put_file(&data)?;
            Ok((rel, FileIndexEntry { hash, mode, size: data.len() as u64 }))
        })
        .collect();

    let mut files = HashMap::new();
    for result in results {
        let (rel, entry) = result?;
        files.insert(rel, entry);
    }
    Ok(files)
}

/// Hash a local package directory into the content store.
fn store_local_dir(
    cas: &ContentStore,
    dir: &std::path::Path,
) -> Result<HashMap<String, FileIndexEntry>, StoreError> {
    let listed = crate::util::walk_files(dir).map_err(|e| io_error("read package dir", Some(dir), e))?;
    let results: Vec<Result<(String, FileIndexEntry), StoreError>> = listed
        .into_par_iter()
        .map(|(rel, path)| {
            let data = std::fs::read(&path).map_err(|e| io_error("read package file", Some(&path), e))?;
            let mode = file_mode(&path);
            let hash = cas.put_file(&data)?;
            Ok((rel, FileIndexEntry { hash, mode, size: data.len() as u64 }))
        })
        .collect();
    let mut files = HashMap::new();
    for result in results {
        let (rel, entry) = result?;
        files.insert(rel, entry);
    }
    Ok(files)
}

#[cfg(unix)]
fn file_mode(path: &std::path::Path) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path).map(|m| m.permissions().mode() & 0o777).unwrap_or(0o644)
}

#[cfg(not(unix))]
fn file_mode(_path: &std::path::Path) -> u32 {
    0o644
}
