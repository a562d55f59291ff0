//! End-to-end tests: a store server backed by a real package store,
//! driven through the remote client, against an in-process registry
//! fixture that serves a generated tarball and counts downloads.

use std::convert::Infallible;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use flate2::write::GzEncoder;
use flate2::Compression;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, StatusCode};

use cask_core::index::read_package_index;
use cask_core::{
    compute_integrity, connect_store_controller, create_package_store, create_server,
    RegistryResolver, RemoteStore, RequestOptions, ResolvedFrom, ServerSettings, StoreConfig,
    StoreController, StoreError, StoreServer, UploadOptions, WantedPackage,
};

const PKG_JSON: &[u8] = br#"{"name":"fake-pkg","version":"1.0.0"}"#;
const PKG_INDEX_JS: &[u8] = b"module.exports = 42\n";

fn make_tarball(files: &[(&str, &[u8])]) -> Vec<u8> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (path, content) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, format!("package/{}", path), *content)
            .unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

struct FixtureRegistry {
    url: String,
    tarball_hits: Arc<AtomicUsize>,
}

struct RegistryFixtureState {
    tarball: Vec<u8>,
    manifest: serde_json::Value,
    hits: Arc<AtomicUsize>,
}

fn registry_handle(req: Request<Body>, state: &RegistryFixtureState) -> Response<Body> {
    if req.method() != Method::GET {
        let mut resp = Response::new(Body::empty());
        *resp.status_mut() = StatusCode::METHOD_NOT_ALLOWED;
        return resp;
    }
    match req.uri().path() {
        "/fake-pkg/1.0.0" | "/fake-pkg/latest" => {
            Response::new(Body::from(state.manifest.to_string()))
        }
        "/fake-pkg/-/fake-pkg-1.0.0.tgz" => {
            state.hits.fetch_add(1, Ordering::SeqCst);
            Response::new(Body::from(state.tarball.clone()))
        }
        _ => {
            let mut resp = Response::new(Body::empty());
            *resp.status_mut() = StatusCode::NOT_FOUND;
            resp
        }
    }
}

/// Serve a single fake package the way an npm registry would.
fn start_registry(tarball: Vec<u8>) -> FixtureRegistry {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.set_nonblocking(true).unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());

    let hits = Arc::new(AtomicUsize::new(0));
    let manifest = serde_json::json!({
        "name": "fake-pkg",
        "version": "1.0.0",
        "dist": {
            "tarball": format!("{}/fake-pkg/-/fake-pkg-1.0.0.tgz", url),
            "integrity": compute_integrity(&tarball),
        },
    });
    let state = Arc::new(RegistryFixtureState {
        tarball,
        manifest,
        hits: Arc::clone(&hits),
    });

    let make_svc = make_service_fn(move |_conn| {
        let state = Arc::clone(&state);
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let state = Arc::clone(&state);
                async move { Ok::<_, Infallible>(registry_handle(req, &state)) }
            }))
        }
    });
    let server = hyper::Server::from_tcp(listener).unwrap().serve(make_svc);
    tokio::spawn(async move {
        let _ = server.await;
    });
    FixtureRegistry { url, tarball_hits: hits }
}

async fn start_store_server(
    store_root: &Path,
    registry_url: &str,
    settings: ServerSettings,
) -> (StoreServer, RemoteStore) {
    let config = StoreConfig {
        store_dir: store_root.join("store"),
        registry: registry_url.to_string(),
        ..StoreConfig::default()
    };
    let resolver = Arc::new(RegistryResolver::new(registry_url, None));
    let store = create_package_store(resolver, config).unwrap();
    let server = create_server(Arc::new(store), settings).await.unwrap();
    server.wait_for_listen().await;
    let client = connect_store_controller(&format!("http://{}", server.addr()));
    (server, client)
}

fn loopback_settings() -> ServerSettings {
    ServerSettings::new("127.0.0.1", 0)
}

fn wanted(alias: &str) -> WantedPackage {
    WantedPackage {
        alias: alias.to_string(),
        bare_specifier: "1.0.0".to_string(),
    }
}

#[tokio::test]
async fn test_resolve_and_fetch_through_server() {
    let registry =
        start_registry(make_tarball(&[("package.json", PKG_JSON), ("index.js", PKG_INDEX_JS)]));
    let tmp = tempfile::tempdir().unwrap();
    let (server, client) =
        start_store_server(tmp.path(), &registry.url, loopback_settings()).await;

    let result = client
        .request_package(&wanted("fake-pkg"), &RequestOptions::default())
        .await
        .unwrap();
    assert_eq!(result.resolved_from, ResolvedFrom::Remote);
    assert!(result.files_index.contains_key("package.json"));
    assert!(result.files_index.contains_key("index.js"));

    // The manifest arrives on a second round-trip and is memoized.
    let manifest = result.fetching().await.unwrap().unwrap();
    assert_eq!(manifest["name"], "fake-pkg");
    assert_eq!(manifest["version"], "1.0.0");

    server.close().await;
}

#[tokio::test]
async fn test_store_hit_skips_the_registry() {
    let registry =
        start_registry(make_tarball(&[("package.json", PKG_JSON), ("index.js", PKG_INDEX_JS)]));
    let tmp = tempfile::tempdir().unwrap();
    let (server, client) =
        start_store_server(tmp.path(), &registry.url, loopback_settings()).await;

    let first = client
        .request_package(&wanted("fake-pkg"), &RequestOptions::default())
        .await
        .unwrap();
    assert_eq!(first.resolved_from, ResolvedFrom::Remote);
    let second = client
        .request_package(&wanted("fake-pkg"), &RequestOptions::default())
        .await
        .unwrap();
    assert_eq!(second.resolved_from, ResolvedFrom::Store);
    assert_eq!(registry.tarball_hits.load(Ordering::SeqCst), 1);

    server.close().await;
}

#[tokio::test]
async fn test_concurrent_requests_download_once() {
    let registry =
        start_registry(make_tarball(&[("package.json", PKG_JSON), ("index.js", PKG_INDEX_JS)]));
    let tmp = tempfile::tempdir().unwrap();
    let (server, client) =
        start_store_server(tmp.path(), &registry.url, loopback_settings()).await;
    let client = Arc::new(client);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let client = Arc::clone(&client);
        handles.push(tokio::spawn(async move {
            client
                .request_package(&wanted("fake-pkg"), &RequestOptions::default())
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    assert_eq!(registry.tarball_hits.load(Ordering::SeqCst), 1);

    server.close().await;
}

#[tokio::test]
async fn test_missing_package_propagates_registry_error() {
    let registry =
        start_registry(make_tarball(&[("package.json", PKG_JSON), ("index.js", PKG_INDEX_JS)]));
    let tmp = tempfile::tempdir().unwrap();
    let (server, client) =
        start_store_server(tmp.path(), &registry.url, loopback_settings()).await;

    let err = client
        .request_package(&wanted("not-an-existing-package"), &RequestOptions::default())
        .await
        .unwrap_err();
    match &err {
        StoreError::RegistryFetch { status, hint, pkg_name, .. } => {
            assert_eq!(*status, Some(404));
            assert_eq!(pkg_name, "not-an-existing-package");
            assert!(!hint.is_empty());
        }
        other => panic!("expected RegistryFetch, got {:?}", other),
    }
    assert_eq!(err.code(), "ERR_CASK_FETCH_404");

    server.close().await;
}

#[tokio::test]
async fn test_only_post_is_accepted() {
    let registry =
        start_registry(make_tarball(&[("package.json", PKG_JSON), ("index.js", PKG_INDEX_JS)]));
    let tmp = tempfile::tempdir().unwrap();
    let (server, _client) =
        start_store_server(tmp.path(), &registry.url, loopback_settings()).await;

    let http = reqwest::Client::new();
    let base = format!("http://{}", server.addr());
    for method in [
        reqwest::Method::GET,
        reqwest::Method::PUT,
        reqwest::Method::PATCH,
        reqwest::Method::DELETE,
    ] {
        let resp = http
            .request(method.clone(), format!("{}/resolve", base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 405, "method {}", method);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert!(body["error"].is_object(), "method {}", method);
    }

    server.close().await;
}

#[tokio::test]
async fn test_unknown_route_is_404() {
    let registry =
        start_registry(make_tarball(&[("package.json", PKG_JSON), ("index.js", PKG_INDEX_JS)]));
    let tmp = tempfile::tempdir().unwrap();
    let (server, _client) =
        start_store_server(tmp.path(), &registry.url, loopback_settings()).await;

    let http = reqwest::Client::new();
    let resp = http
        .post(format!("http://{}/a-random-endpoint", server.addr()))
        .json(&serde_json::json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 404);

    server.close().await;
}

#[tokio::test]
async fn test_prune_is_refused_over_the_wire() {
    let registry =
        start_registry(make_tarball(&[("package.json", PKG_JSON), ("index.js", PKG_INDEX_JS)]));
    let tmp = tempfile::tempdir().unwrap();
    let (server, client) =
        start_store_server(tmp.path(), &registry.url, loopback_settings()).await;

    assert!(matches!(client.prune().await, Err(StoreError::PruneForbidden)));

    let http = reqwest::Client::new();
    let resp = http
        .post(format!("http://{}/prune", server.addr()))
        .json(&serde_json::json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 403);

    server.close().await;
}

#[tokio::test]
async fn test_stop_request_shuts_the_server_down() {
    let registry =
        start_registry(make_tarball(&[("package.json", PKG_JSON), ("index.js", PKG_INDEX_JS)]));
    let tmp = tempfile::tempdir().unwrap();
    let (server, client) =
        start_store_server(tmp.path(), &registry.url, loopback_settings()).await;
    let base = format!("http://{}", server.addr());

    let http = reqwest::Client::new();
    let resp = http
        .post(format!("{}/stop", base))
        .json(&serde_json::json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);

    server.wait_closed().await;
    let err = client
        .request_package(&wanted("fake-pkg"), &RequestOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Protocol { .. }));
}

#[tokio::test]
async fn test_ignored_stop_keeps_the_server_alive() {
    let registry =
        start_registry(make_tarball(&[("package.json", PKG_JSON), ("index.js", PKG_INDEX_JS)]));
    let tmp = tempfile::tempdir().unwrap();
    let mut settings = loopback_settings();
    settings.ignore_stop_requests = true;
    let (server, client) = start_store_server(tmp.path(), &registry.url, settings).await;

    let http = reqwest::Client::new();
    let resp = http
        .post(format!("http://{}/stop", server.addr()))
        .json(&serde_json::json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 403);

    // Still serving.
    let result = client
        .request_package(&wanted("fake-pkg"), &RequestOptions::default())
        .await
        .unwrap();
    assert_eq!(result.resolved_from, ResolvedFrom::Remote);

    server.close().await;
}

fn write_built_dir(dir: &Path) {
    fs::create_dir_all(dir).unwrap();
    fs::write(dir.join("package.json"), PKG_JSON).unwrap();
    fs::write(dir.join("index.js"), PKG_INDEX_JS).unwrap();
    fs::write(dir.join("side-effect.js"), b"console.log('built')\n").unwrap();
    let mut f = fs::File::create(dir.join("side-effect.txt")).unwrap();
    f.write_all(b"built artifact\n").unwrap();
}

#[tokio::test]
async fn test_upload_records_side_effects() {
    let registry =
        start_registry(make_tarball(&[("package.json", PKG_JSON), ("index.js", PKG_INDEX_JS)]));
    let tmp = tempfile::tempdir().unwrap();
    let (server, client) =
        start_store_server(tmp.path(), &registry.url, loopback_settings()).await;

    let result = client
        .request_package(&wanted("fake-pkg"), &RequestOptions::default())
        .await
        .unwrap();

    let built_dir = tmp.path().join("built");
    write_built_dir(&built_dir);
    client
        .upload(
            &built_dir,
            &UploadOptions {
                side_effects_cache_key: "client-engine".to_string(),
                files_index_file: result.files_index_file.to_string_lossy().to_string(),
            },
        )
        .await
        .unwrap();

    let index = read_package_index(&result.files_index_file).unwrap();
    let entry = index.side_effects.get("client-engine").unwrap();
    let mut added: Vec<&str> = entry.added.keys().map(|k| k.as_str()).collect();
    added.sort_unstable();
    assert_eq!(added, ["side-effect.js", "side-effect.txt"]);
    assert!(entry.modified.is_empty());

    server.close().await;
}

#[tokio::test]
async fn test_disabled_upload_writes_nothing() {
    let registry =
        start_registry(make_tarball(&[("package.json", PKG_JSON), ("index.js", PKG_INDEX_JS)]));
    let tmp = tempfile::tempdir().unwrap();
    let mut settings = loopback_settings();
    settings.ignore_upload_requests = true;
    let (server, client) = start_store_server(tmp.path(), &registry.url, settings).await;

    let built_dir = tmp.path().join("built");
    write_built_dir(&built_dir);
    let files_index_file = tmp.path().join("store/index/fake/fake-pkg/1.0.0.json");
    let err = client
        .upload(
            &built_dir,
            &UploadOptions {
                side_effects_cache_key: "client-engine".to_string(),
                files_index_file: files_index_file.to_string_lossy().to_string(),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::UploadForbidden));
    assert!(!files_index_file.exists());

    server.close().await;
}

#[tokio::test]
async fn test_upload_for_unfetched_package_is_not_found() {
    let registry =
        start_registry(make_tarball(&[("package.json", PKG_JSON), ("index.js", PKG_INDEX_JS)]));
    let tmp = tempfile::tempdir().unwrap();
    let (server, client) =
        start_store_server(tmp.path(), &registry.url, loopback_settings()).await;

    let built_dir = tmp.path().join("built");
    write_built_dir(&built_dir);
    let files_index_file = tmp.path().join("store/index/fake/never-fetched/1.0.0.json");
    let err = client
        .upload(
            &built_dir,
            &UploadOptions {
                side_effects_cache_key: "client-engine".to_string(),
                files_index_file: files_index_file.to_string_lossy().to_string(),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::UploadNotFound { .. }));
    assert!(!files_index_file.exists());

    server.close().await;
}

#[tokio::test]
async fn test_fetch_package_with_explicit_resolution() {
    let registry =
        start_registry(make_tarball(&[("package.json", PKG_JSON), ("index.js", PKG_INDEX_JS)]));
    let tmp = tempfile::tempdir().unwrap();
    let (server, client) =
        start_store_server(tmp.path(), &registry.url, loopback_settings()).await;

    let host = registry.url.trim_start_matches("http://").to_string();
    let params = cask_core::FetchPackageParams {
        pkg: cask_core::PkgDescriptor {
            id: format!("{}/fake-pkg/1.0.0", host),
            resolution: cask_core::Resolution {
                tarball: Some(format!("{}/fake-pkg/-/fake-pkg-1.0.0.tgz", registry.url)),
                integrity: None,
                directory: None,
            },
        },
        force: false,
        fetch_raw_manifest: true,
        lockfile_dir: None,
    };
    let result = client.fetch_package(&params).await.unwrap();
    assert_eq!(result.resolved_from, ResolvedFrom::Remote);
    // fetchRawManifest: the manifest came back inline, no extra round-trip.
    let manifest = result.fetching().await.unwrap().unwrap();
    assert_eq!(manifest["name"], "fake-pkg");

    server.close().await;
}
