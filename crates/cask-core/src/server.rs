//! HTTP store server. Exposes a `StoreController` over a small
//! POST+JSON protocol so that other processes (or hosts) can share one
//! store. Every route is POST; errors travel as serialized `StoreError`
//! values so the client can surface the exact same error the local
//! controller would have produced.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde::Serialize;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;

use crate::config::ServerSettings;
use crate::error::StoreError;
use crate::store::{
    FetchPackageParams, ManifestRequest, ManifestResponse, ResolveRequest, StoreController,
    UploadRequest,
};

/// Lifecycle of a server instance. Transitions are one-way:
/// Starting -> Listening -> Closing -> Closed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerState {
    Starting,
    Listening,
    Closing,
    Closed,
}

struct ServerContext {
    store: Arc<dyn StoreController>,
    settings: ServerSettings,
    stop: Arc<Notify>,
}

/// A running store server. Dropping the handle does not stop the
/// server; call `close` (or POST /stop) for a graceful shutdown.
pub struct StoreServer {
    addr: SocketAddr,
    state: watch::Receiver<ServerState>,
    state_tx: Arc<watch::Sender<ServerState>>,
    stop: Arc<Notify>,
    join: Mutex<Option<JoinHandle<()>>>,
}

/// Bind and start serving. Returns once the listener is accepting
/// connections; `addr` carries the actual port when 0 was requested.
pub async fn create_server(
    store: Arc<dyn StoreController>,
    settings: ServerSettings,
) -> Result<StoreServer, StoreError> {
    let (state_tx, state_rx) = watch::channel(ServerState::Starting);
    let state_tx = Arc::new(state_tx);
    let stop = Arc::new(Notify::new());

    let bind_addr: SocketAddr = format!("{}:{}", settings.hostname, settings.port)
        .parse()
        .map_err(|_| StoreError::Protocol {
            reason: format!("invalid listen address {}:{}", settings.hostname, settings.port),
        })?;

    let ctx = Arc::new(ServerContext {
        store: Arc::clone(&store),
        settings,
        stop: Arc::clone(&stop),
    });
    let make_svc = make_service_fn(move |_conn| {
        let ctx = Arc::clone(&ctx);
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let ctx = Arc::clone(&ctx);
                async move { Ok::<_, Infallible>(handle(req, ctx).await) }
            }))
        }
    });

    let server = Server::try_bind(&bind_addr)
        .map_err(|e| StoreError::Protocol {
            reason: format!("cannot bind {bind_addr}: {e}"),
        })?
        .serve(make_svc);
    let addr = server.local_addr();

    let shutdown_signal = Arc::clone(&stop);
    let graceful = server.with_graceful_shutdown(async move {
        shutdown_signal.notified().await;
    });

    let _ = state_tx.send(ServerState::Listening);
    let task_state = Arc::clone(&state_tx);
    let join = tokio::spawn(async move {
        let result = graceful.await;
        // The store is owned by this server instance; release it with
        // the listener so in-flight permits are not leaked.
        store.close().await;
        let _ = task_state.send(ServerState::Closed);
        drop(result);
    });

    Ok(StoreServer {
        addr,
        state: state_rx,
        state_tx,
        stop,
        join: Mutex::new(Some(join)),
    })
}

impl StoreServer {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    /// Resolves once the listener is accepting connections. Instant
    /// for servers built by `create_server`, which only returns in the
    /// Listening state.
    pub async fn wait_for_listen(&self) {
        let mut state = self.state.clone();
        while *state.borrow() == ServerState::Starting {
            if state.changed().await.is_err() {
                return;
            }
        }
    }

    /// Resolves once the server has fully shut down, whether via
    /// `close` or a POST /stop from a client.
    pub async fn wait_closed(&self) {
        let mut state = self.state.clone();
        while *state.borrow() != ServerState::Closed {
            if state.changed().await.is_err() {
                return;
            }
        }
    }

    /// Graceful shutdown: stop accepting, drain in-flight requests,
    /// close the store. Idempotent.
    pub async fn close(&self) {
        let _ = self.state_tx.send_if_modified(|state| {
            if *state == ServerState::Listening {
                *state = ServerState::Closing;
                true
            } else {
                false
            }
        });
        self.stop.notify_waiters();
        self.stop.notify_one();
        let handle = self.join.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        } else {
            self.wait_closed().await;
        }
    }
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Body> {
    let bytes = serde_json::to_vec(body).unwrap_or_else(|_| b"{}".to_vec());
    let mut response = Response::new(Body::from(bytes));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn error_response(err: &StoreError) -> Response<Body> {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    json_response(status, &serde_json::json!({ "error": err }))
}

async fn read_body<T: serde::de::DeserializeOwned>(req: Request<Body>) -> Result<T, StoreError> {
    let bytes = hyper::body::to_bytes(req.into_body())
        .await
        .map_err(|e| StoreError::Protocol { reason: format!("cannot read request body: {e}") })?;
    serde_json::from_slice(&bytes)
        .map_err(|e| StoreError::Protocol { reason: format!("invalid request body: {e}") })
}

async fn handle(req: Request<Body>, ctx: Arc<ServerContext>) -> Response<Body> {
    if req.method() != Method::POST {
        return error_response(&StoreError::MethodNotAllowed {
            method: req.method().to_string(),
        });
    }
    let path = req.uri().path().to_string();
    let result = match path.as_str() {
        "/resolve" => handle_resolve(req, &ctx).await,
        "/fetch" => handle_fetch(req, &ctx).await,
        "/manifest" => handle_manifest(req, &ctx).await,
        "/upload" => handle_upload(req, &ctx).await,
        "/stop" => {
            if ctx.settings.ignore_stop_requests {
                Err(StoreError::StopForbidden)
            } else {
                ctx.stop.notify_one();
                ctx.stop.notify_waiters();
                Ok(json_response(StatusCode::OK, &serde_json::json!({ "ok": true })))
            }
        }
        // Pruning is destructive for every other client of this store,
        // so the wire never exposes it.
        "/prune" => Err(StoreError::PruneForbidden),
        _ => Err(StoreError::RouteNotFound { path }),
    };
    result.unwrap_or_else(|err| error_response(&err))
}

async fn handle_resolve(
    req: Request<Body>,
    ctx: &ServerContext,
) -> Result<Response<Body>, StoreError> {
    let request: ResolveRequest = read_body(req).await?;
    let result = ctx.store.request_package(&request.wanted, &request.opts).await?;
    let manifest = if request.opts.fetch_raw_manifest {
        result.fetching().await?
    } else {
        None
    };
    Ok(json_response(StatusCode::OK, &result.to_wire(manifest)))
}

async fn handle_fetch(
    req: Request<Body>,
    ctx: &ServerContext,
) -> Result<Response<Body>, StoreError> {
    let params: FetchPackageParams = read_body(req).await?;
    let result = ctx.store.fetch_package(&params).await?;
    let manifest = if params.fetch_raw_manifest {
        result.fetching().await?
    } else {
        None
    };
    Ok(json_response(StatusCode::OK, &result.to_wire(manifest)))
}

async fn handle_manifest(
    req: Request<Body>,
    ctx: &ServerContext,
) -> Result<Response<Body>, StoreError> {
    let request: ManifestRequest = read_body(req).await?;
    let manifest = ctx.store.bundled_manifest(&request).await?;
    Ok(json_response(StatusCode::OK, &ManifestResponse { manifest }))
}

async fn handle_upload(
    req: Request<Body>,
    ctx: &ServerContext,
) -> Result<Response<Body>, StoreError> {
    if ctx.settings.ignore_upload_requests {
        // Refused before the body is even parsed; no store mutation.
        return Err(StoreError::UploadForbidden);
    }
    let request: UploadRequest = read_body(req).await?;
    ctx.store.upload(Path::new(&request.built_dir), &request.opts).await?;
    Ok(json_response(StatusCode::OK, &serde_json::json!({ "ok": true })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::resolve::StaticResolver;
    use crate::store::create_package_store;
    use std::collections::HashMap;

    fn empty_store(tmp: &Path) -> Arc<dyn StoreController> {
        let config = StoreConfig {
            store_dir: tmp.join("store"),
            ..StoreConfig::default()
        };
        let resolver = Arc::new(StaticResolver::new(HashMap::new()));
        Arc::new(create_package_store(resolver, config).unwrap())
    }

    fn test_ctx(tmp: &Path, settings: ServerSettings) -> Arc<ServerContext> {
        Arc::new(ServerContext {
            store: empty_store(tmp),
            settings,
            stop: Arc::new(Notify::new()),
        })
    }

    fn post(path: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(path)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_non_post_is_405() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = test_ctx(tmp.path(), ServerSettings::default());
        for method in [Method::GET, Method::PUT, Method::PATCH, Method::DELETE] {
            let req = Request::builder()
                .method(method)
                .uri("/resolve")
                .body(Body::empty())
                .unwrap();
            let resp = handle(req, Arc::clone(&ctx)).await;
            assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
        }
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = test_ctx(tmp.path(), ServerSettings::default());
        let resp = handle(post("/a-random-endpoint", "{}"), ctx).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_prune_is_always_403() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = test_ctx(tmp.path(), ServerSettings::default());
        let resp = handle(post("/prune", "{}"), ctx).await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_stop_respects_ignore_flag() {
        let tmp = tempfile::tempdir().unwrap();
        let mut settings = ServerSettings::default();
        settings.ignore_stop_requests = true;
        let ctx = test_ctx(tmp.path(), settings);
        let resp = handle(post("/stop", "{}"), Arc::clone(&ctx)).await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        let ctx = test_ctx(tmp.path(), ServerSettings::default());
        let resp = handle(post("/stop", "{}"), ctx).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_upload_disabled_is_403() {
        let tmp = tempfile::tempdir().unwrap();
        let mut settings = ServerSettings::default();
        settings.ignore_upload_requests = true;
        let ctx = test_ctx(tmp.path(), settings);
        let resp = handle(post("/upload", "{}"), ctx).await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }
}
