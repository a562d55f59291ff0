//! Store controller: the public API for requesting, fetching, and
//! uploading package content. `PackageStore` is the in-process
//! implementation; `client::RemoteStore` implements the same trait over
//! the server protocol, and callers cannot tell the two apart.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{OnceCell, Semaphore};

use crate::cas::ContentStore;
use crate::config::StoreConfig;
use crate::dedupe::RequestDedupe;
use crate::error::{io_error, StoreError};
use crate::fetcher::{Fetcher, ResolvedFrom};
use crate::index::{
    index_file_path, list_index_files, parse_identity, pkg_name_from_identity,
    read_package_index, write_package_index, FileIndexEntry, PackageIndex,
};
use crate::resolve::{Resolution, Resolver, WantedPackage};
use crate::upload::{upload_side_effects, UploadOptions};

/// A package manifest, as fetched. Packages without a manifest yield `None`.
pub type BundledManifest = serde_json::Value;

/// Options for `request_package`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestOptions {
    /// Bypass the store-hit check and re-fetch.
    #[serde(default)]
    pub force: bool,
    /// Populate the bundled manifest eagerly instead of lazily.
    #[serde(default)]
    pub fetch_raw_manifest: bool,
}

/// An already-resolved package: identity plus resolution descriptor.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PkgDescriptor {
    pub id: String,
    pub resolution: Resolution,
}

/// Parameters for `fetch_package`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchPackageParams {
    pub pkg: PkgDescriptor,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub fetch_raw_manifest: bool,
    /// Where the caller intends to link the package. Informational:
    /// the store never writes outside its own directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lockfile_dir: Option<String>,
}

/// Body of a `/resolve` request.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveRequest {
    pub wanted: WantedPackage,
    #[serde(default)]
    pub opts: RequestOptions,
}

/// Body of an `/upload` request.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRequest {
    pub built_dir: String,
    pub opts: UploadOptions,
}

/// Body of a `/manifest` response.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestResponse {
    pub manifest: Option<BundledManifest>,
}

/// Second round-trip request for the deferred manifest segment.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestRequest {
    pub id: String,
    pub files_index_file: String,
}

/// What a prune removed.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PruneReport {
    pub removed_blobs: u64,
    pub freed_bytes: u64,
}

/// Lazily evaluated, memoized bundled manifest. `get` may be awaited
/// any number of times; the underlying read/parse (or the second
/// round-trip, for remote results) happens at most once.
#[derive(Clone, Debug)]
pub struct ManifestHandle {
    cell: Arc<OnceCell<Option<BundledManifest>>>,
    source: ManifestSource,
}

#[derive(Clone, Debug)]
enum ManifestSource {
    /// Parse the package's manifest out of the content store.
    Cas { cas: Arc<ContentStore>, hash: Option<String> },
    /// Fetch the manifest from the store server (second round-trip).
    Remote { client: reqwest::Client, url: String, request: ManifestRequest },
    /// Nothing to fetch; the cell was seeded at construction.
    Seeded,
}

impl ManifestHandle {
    pub(crate) fn from_cas(cas: Arc<ContentStore>, hash: Option<String>) -> Self {
        Self {
            cell: Arc::new(OnceCell::new()),
            source: ManifestSource::Cas { cas, hash },
        }
    }

    pub(crate) fn remote(client: reqwest::Client, url: String, request: ManifestRequest) -> Self {
        Self {
            cell: Arc::new(OnceCell::new()),
            source: ManifestSource::Remote { client, url, request },
        }
    }

    /// Handle whose value is already known (eager manifest).
    pub fn seeded(manifest: Option<BundledManifest>) -> Self {
        Self {
            cell: Arc::new(OnceCell::new_with(Some(manifest))),
            source: ManifestSource::Seeded,
        }
    }

    pub async fn get(&self) -> Result<Option<BundledManifest>, StoreError> {
        self.cell
            .get_or_try_init(|| async {
                match &self.source {
                    ManifestSource::Cas { cas, hash } => match hash {
                        Some(hash) => {
                            let bytes = cas.read_content(hash)?;
                            let manifest =
                                serde_json::from_slice(&bytes).map_err(|e| StoreError::Io {
                                    operation: "parse manifest".to_string(),
                                    path: None,
                                    reason: e.to_string(),
                                })?;
                            Ok(Some(manifest))
                        }
                        None => Ok(None),
                    },
                    ManifestSource::Remote { client, url, request } => {
                        crate::client::post_manifest(client, url, request).await
                    }
                    ManifestSource::Seeded => Ok(None),
                }
            })
            .await
            .map(|manifest| manifest.clone())
    }
}

/// Result of a package request: where to find the files now, plus a
/// deferred handle for the manifest.
#[derive(Clone, Debug)]
pub struct FetchResult {
    pub id: String,
    pub resolved_from: ResolvedFrom,
    pub files_index: HashMap<String, FileIndexEntry>,
    pub files_index_file: PathBuf,
    manifest: ManifestHandle,
}

impl FetchResult {
    pub(crate) fn new(
        id: String,
        resolved_from: ResolvedFrom,
        files_index: HashMap<String, FileIndexEntry>,
        files_index_file: PathBuf,
        manifest: ManifestHandle,
    ) -> Self {
        Self { id, resolved_from, files_index, files_index_file, manifest }
    }

    /// Await the bundled manifest. Deferred and memoized: callers that
    /// only need file placement never pay for manifest parsing, and
    /// awaiting twice never re-triggers work.
    pub async fn fetching(&self) -> Result<Option<BundledManifest>, StoreError> {
        self.manifest.get().await
    }
}

/// Serializable form of `FetchResult` for the wire protocol.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchResultWire {
    pub id: String,
    pub resolved_from: ResolvedFrom,
    pub files_index: HashMap<String, FileIndexEntry>,
    pub files_index_file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest: Option<BundledManifest>,
}

impl FetchResult {
    pub fn to_wire(&self, manifest: Option<BundledManifest>) -> FetchResultWire {
        FetchResultWire {
            id: self.id.clone(),
            resolved_from: self.resolved_from,
            files_index: self.files_index.clone(),
            files_index_file: self.files_index_file.to_string_lossy().to_string(),
            manifest,
        }
    }
}

/// The unified store API, identical for in-process and remote-backed
/// controllers.
#[async_trait]
pub trait StoreController: Send + Sync {
    /// Resolve an alias+specifier and return its cached or fetched content.
    async fn request_package(
        &self,
        wanted: &WantedPackage,
        opts: &RequestOptions,
    ) -> Result<FetchResult, StoreError>;

    /// Fetch an already-resolved package.
    async fn fetch_package(&self, params: &FetchPackageParams) -> Result<FetchResult, StoreError>;

    /// The deferred manifest segment for a previous fetch result.
    async fn bundled_manifest(
        &self,
        request: &ManifestRequest,
    ) -> Result<Option<BundledManifest>, StoreError>;

    /// Record install-time side effects for an already-fetched package.
    async fn upload(&self, built_dir: &Path, opts: &UploadOptions) -> Result<(), StoreError>;

    /// Remove content blobs referenced by no index record. Local-only;
    /// never exposed over the wire.
    async fn prune(&self) -> Result<PruneReport, StoreError>;

    /// Release held resources. Idempotent.
    async fn close(&self);
}

/// In-process store controller over one store directory.
pub struct PackageStore {
    cas: Arc<ContentStore>,
    index_dir: PathBuf,
    resolver: Arc<dyn Resolver>,
    fetcher: Fetcher,
    dedupe: RequestDedupe<Result<FetchResult, StoreError>>,
    network_permits: Arc<Semaphore>,
    workspace_permits: Arc<Semaphore>,
    config: StoreConfig,
    closed: AtomicBool,
}

/// Open a store directory and build the in-process controller.
/// The instance owns the content store and integrity index exclusively;
/// concurrent processes sharing one store directory must go through the
/// server, or accept last-writer-wins on index records.
pub fn create_package_store(
    resolver: Arc<dyn Resolver>,
    config: StoreConfig,
) -> Result<PackageStore, StoreError> {
    let cas = Arc::new(ContentStore::open(&config.store_dir)?);
    let index_dir = config.store_dir.join("index");
    fs::create_dir_all(&index_dir).map_err(|e| io_error("open store", Some(&index_dir), e))?;
    Ok(PackageStore {
        cas,
        index_dir,
        resolver,
        fetcher: Fetcher::new(config.retry.clone(), config.auth_token.clone()),
        dedupe: RequestDedupe::new(),
        network_permits: Arc::new(Semaphore::new(config.network_concurrency.max(1))),
        workspace_permits: Arc::new(Semaphore::new(config.workspace_concurrency.max(1))),
        config,
        closed: AtomicBool::new(false),
    })
}

impl PackageStore {
    pub fn store_dir(&self) -> &Path {
        &self.config.store_dir
    }

    /// Read the index record and, with `verify_store_integrity`, check
    /// that every referenced blob still exists. An invalid record is
    /// treated as a miss, not an error.
    fn load_valid_index(&self, index_path: &Path) -> Option<PackageIndex> {
        let index = read_package_index(index_path).ok()?;
        if self.config.verify_store_integrity {
            for entry in index.files.values() {
                if !self.cas.has_content(&entry.hash) {
                    return None;
                }
            }
        }
        Some(index)
    }

    fn result_from_index(
        &self,
        id: &str,
        index_path: &Path,
        index: PackageIndex,
        resolved_from: ResolvedFrom,
        eager_manifest: Option<BundledManifest>,
    ) -> FetchResult {
        let manifest = match eager_manifest {
            Some(manifest) => ManifestHandle::seeded(Some(manifest)),
            None => {
                let hash = index.files.get("package.json").map(|e| e.hash.clone());
                ManifestHandle::from_cas(Arc::clone(&self.cas), hash)
            }
        };
        FetchResult::new(
            id.to_string(),
            resolved_from,
            index.files,
            index_path.to_path_buf(),
            manifest,
        )
    }

    async fn fetch_resolved(
        &self,
        id: &str,
        resolution: &Resolution,
        force: bool,
        fetch_raw_manifest: bool,
        eager_manifest: Option<BundledManifest>,
    ) -> Result<FetchResult, StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        let index_path = index_file_path(&self.index_dir, id)?;

        if !force {
            if let Some(index) = self.load_valid_index(&index_path) {
                return Ok(self.result_from_index(
                    id,
                    &index_path,
                    index,
                    ResolvedFrom::Store,
                    eager_manifest,
                ));
            }
        }
        if self.config.offline && resolution.directory.is_none() {
            return Err(StoreError::NoOfflineCopy { pkg_name: pkg_name_from_identity(id) });
        }

        let result = self
            .dedupe
            .run(id, async {
                // A fetch may have completed between our store check and
                // joining the in-flight entry: re-check before downloading.
                if !force {
                    if let Some(index) = self.load_valid_index(&index_path) {
                        return Ok(self.result_from_index(
                            id,
                            &index_path,
                            index,
                            ResolvedFrom::Store,
                            eager_manifest.clone(),
                        ));
                    }
                }

                // Local-dir imports are disk-bound; they queue on the
                // workspace pool instead of the network pool.
                let pool = if resolution.directory.is_some() {
                    &self.workspace_permits
                } else {
                    &self.network_permits
                };
                let permit = Arc::clone(pool)
                    .acquire_owned()
                    .await
                    .map_err(|_| StoreError::Closed)?;
                let fetched = self.fetcher.fetch(&self.cas, id, resolution).await;
                drop(permit);
                let fetched = fetched?;

                let (_, name, version) =
                    parse_identity(id).ok_or_else(|| StoreError::Resolution {
                        pkg_spec: id.to_string(),
                        reason: "not a valid package identity".to_string(),
                    })?;
                let index = PackageIndex::new(&name, version, fetched.files);
                write_package_index(&index_path, &index)?;
                Ok(self.result_from_index(
                    id,
                    &index_path,
                    index,
                    fetched.resolved_from,
                    eager_manifest.clone(),
                ))
            })
            .await?;

        if fetch_raw_manifest {
            // Force-populate the memoized manifest so callers get it eagerly.
            result.fetching().await?;
        }
        Ok(result)
    }
}

#[async_trait]
impl StoreController for PackageStore {
    async fn request_package(
        &self,
        wanted: &WantedPackage,
        opts: &RequestOptions,
    ) -> Result<FetchResult, StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        let resolved = self.resolver.resolve(wanted).await?;
        self.fetch_resolved(
            &resolved.id,
            &resolved.resolution,
            opts.force,
            opts.fetch_raw_manifest,
            resolved.manifest,
        )
        .await
    }

    async fn fetch_package(&self, params: &FetchPackageParams) -> Result<FetchResult, StoreError> {
        self.fetch_resolved(
            &params.pkg.id,
            &params.pkg.resolution,
            params.force,
            params.fetch_raw_manifest,
            None,
        )
        .await
    }

    async fn bundled_manifest(
        &self,
        request: &ManifestRequest,
    ) -> Result<Option<BundledManifest>, StoreError> {
        let index = read_package_index(Path::new(&request.files_index_file))?;
        let hash = index.files.get("package.json").map(|e| e.hash.clone());
        ManifestHandle::from_cas(Arc::clone(&self.cas), hash).get().await
    }

    async fn upload(&self, built_dir: &Path, opts: &UploadOptions) -> Result<(), StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        if !self.config.side_effects_cache {
            return Err(StoreError::UploadForbidden);
        }
        let _permit = Arc::clone(&self.workspace_permits)
            .acquire_owned()
            .await
            .map_err(|_| StoreError::Closed)?;
        let cas = Arc::clone(&self.cas);
        let built_dir = built_dir.to_path_buf();
        let opts = opts.clone();
        tokio::task::spawn_blocking(move || upload_side_effects(&cas, &built_dir, &opts))
            .await
            .map_err(|e| StoreError::Protocol { reason: e.to_string() })?
    }

    async fn prune(&self) -> Result<PruneReport, StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        let cas = Arc::clone(&self.cas);
        let index_dir = self.index_dir.clone();
        tokio::task::spawn_blocking(move || prune_store(&cas, &index_dir))
            .await
            .map_err(|e| StoreError::Protocol { reason: e.to_string() })?
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return; // already closed
        }
        self.network_permits.close();
        self.workspace_permits.close();
        self.dedupe.clear();
    }
}

/// Remove every content blob referenced by no index record.
fn prune_store(cas: &ContentStore, index_dir: &Path) -> Result<PruneReport, StoreError> {
    let mut referenced: std::collections::HashSet<String> = std::collections::HashSet::new();
    for index_file in list_index_files(index_dir)? {
        let index = match read_package_index(&index_file) {
            Ok(index) => index,
            // Unreadable records keep their blobs: prune must never
            // delete content it cannot prove unreferenced.
            Err(_) => continue,
        };
        for entry in index.files.values() {
            referenced.insert(entry.hash.clone());
        }
        for side_effects in index.side_effects.values() {
            for entry in side_effects.added.values().chain(side_effects.modified.values()) {
                referenced.insert(entry.hash.clone());
            }
        }
    }

    let mut report = PruneReport::default();
    for hash in cas.list_hashes()? {
        if !referenced.contains(&hash) {
            report.freed_bytes += cas.remove_content(&hash)?;
            report.removed_blobs += 1;
        }
    }
    Ok(report)
}
