//! Remote store controller: talks to a `server::StoreServer` over the
//! POST+JSON protocol and implements the same `StoreController` trait
//! as the in-process store. Server errors arrive as serialized
//! `StoreError` values and are rehydrated here, so callers see the
//! exact error the store produced.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::resolve::WantedPackage;
use crate::store::{
    BundledManifest, FetchPackageParams, FetchResult, FetchResultWire, ManifestHandle,
    ManifestRequest, ManifestResponse, PruneReport, RequestOptions, ResolveRequest,
    StoreController, UploadRequest,
};
use crate::upload::UploadOptions;

/// Store controller backed by a running store server.
pub struct RemoteStore {
    client: reqwest::Client,
    remote_prefix: String,
}

/// Connect to a store server, e.g. `http://127.0.0.1:5813`. No request
/// is made here; the first operation reports connection failures.
pub fn connect_store_controller(remote_prefix: &str) -> RemoteStore {
    RemoteStore {
        client: reqwest::Client::new(),
        remote_prefix: remote_prefix.trim_end_matches('/').to_string(),
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    error: StoreError,
}

async fn post_url<B, R>(client: &reqwest::Client, url: &str, body: &B) -> Result<R, StoreError>
where
    B: Serialize + ?Sized,
    R: DeserializeOwned,
{
    let response = client
        .post(url)
        .json(body)
        .send()
        .await
        .map_err(|e| StoreError::Protocol { reason: format!("POST {url}: {e}") })?;
    let status = response.status();
    let bytes = response
        .bytes()
        .await
        .map_err(|e| StoreError::Protocol { reason: format!("POST {url}: {e}") })?;
    if !status.is_success() {
        return match serde_json::from_slice::<ErrorBody>(&bytes) {
            Ok(body) => Err(body.error),
            Err(_) => Err(StoreError::Protocol {
                reason: format!("POST {url}: unexpected status {status}"),
            }),
        };
    }
    serde_json::from_slice(&bytes).map_err(|e| StoreError::Protocol {
        reason: format!("POST {url}: invalid response body: {e}"),
    })
}

/// Second round-trip for a deferred manifest. Used by the memoized
/// manifest handle of remote fetch results.
pub(crate) async fn post_manifest(
    client: &reqwest::Client,
    url: &str,
    request: &ManifestRequest,
) -> Result<Option<BundledManifest>, StoreError> {
    let response: ManifestResponse = post_url(client, url, request).await?;
    Ok(response.manifest)
}

impl RemoteStore {
    fn url(&self, route: &str) -> String {
        format!("{}{}", self.remote_prefix, route)
    }

    async fn post<B, R>(&self, route: &str, body: &B) -> Result<R, StoreError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        post_url(&self.client, &self.url(route), body).await
    }

    fn from_wire(&self, wire: FetchResultWire) -> FetchResult {
        let manifest = match wire.manifest {
            Some(manifest) => ManifestHandle::seeded(Some(manifest)),
            None => ManifestHandle::remote(
                self.client.clone(),
                self.url("/manifest"),
                ManifestRequest {
                    id: wire.id.clone(),
                    files_index_file: wire.files_index_file.clone(),
                },
            ),
        };
        FetchResult::new(
            wire.id,
            wire.resolved_from,
            wire.files_index,
            PathBuf::from(wire.files_index_file),
            manifest,
        )
    }
}

#[async_trait]
impl StoreController for RemoteStore {
    async fn request_package(
        &self,
        wanted: &WantedPackage,
        opts: &RequestOptions,
    ) -> Result<FetchResult, StoreError> {
        let request = ResolveRequest { wanted: wanted.clone(), opts: opts.clone() };
        let wire: FetchResultWire = self.post("/resolve", &request).await?;
        Ok(self.from_wire(wire))
    }

    async fn fetch_package(&self, params: &FetchPackageParams) -> Result<FetchResult, StoreError> {
        let wire: FetchResultWire = self.post("/fetch", params).await?;
        Ok(self.from_wire(wire))
    }

    async fn bundled_manifest(
        &self,
        request: &ManifestRequest,
    ) -> Result<Option<BundledManifest>, StoreError> {
        post_manifest(&self.client, &self.url("/manifest"), request).await
    }

    async fn upload(&self, built_dir: &Path, opts: &UploadOptions) -> Result<(), StoreError> {
        let request = UploadRequest {
            built_dir: built_dir.to_string_lossy().to_string(),
            opts: opts.clone(),
        };
        let _: serde_json::Value = self.post("/upload", &request).await?;
        Ok(())
    }

    async fn prune(&self) -> Result<PruneReport, StoreError> {
        // Mirrors the server's stance without a round-trip.
        Err(StoreError::PruneForbidden)
    }

    async fn close(&self) {
        // The server outlives its clients; nothing to release here.
    }
}

/// `Arc` convenience so call sites can hold either controller behind
/// one type.
pub fn arc_remote(remote_prefix: &str) -> Arc<dyn StoreController> {
    Arc::new(connect_store_controller(remote_prefix))
}
