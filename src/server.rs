use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use http::{Method, Request, Response, StatusCode};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::cache::filesystem::FilesystemBackend;
use crate::cache::memory::MemoryBackend;
use crate::cache::sleddb::SledBackend;
use crate::cache::{CacheBackend, CacheType};
use crate::config::Bootstrap;
use crate::error::ProxyError;
use crate::locks::KeyLockRegistry;
use crate::metrics;
use crate::origins::tsjson::TsJsonClient;
use crate::origins::OriginClient;
use crate::proxy::delta::delta_proxy_request;
use crate::proxy::object::object_proxy_request;
use crate::proxy::{
    error_response, proxy_only, EngineContext, EngineResponse, RequestSnapshot, UpstreamClient,
};

struct OriginRoute {
    name: String,
    is_default: bool,
    ctx: EngineContext,
}

struct AppState {
    cfg: Arc<Bootstrap>,
    routes: Vec<OriginRoute>,
    backends: Vec<Arc<dyn CacheBackend>>,
}

pub async fn run(cfg: Arc<Bootstrap>) -> Result<()> {
    let state = Arc::new(build_state(Arc::clone(&cfg))?);

    let addr = cfg.server.addr.clone();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    log::info!("listening on {addr}");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        log::info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let mut shutdown = shutdown_rx.clone();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => {
                let (stream, _) = match accepted {
                    Ok(v) => v,
                    Err(err) => {
                        log::warn!("accept failed: {err}");
                        continue;
                    }
                };
                let io = TokioIo::new(stream);
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let service = service_fn(move |req| handle(req, Arc::clone(&state)));
                    let builder = ConnBuilder::new(TokioExecutor::new());
                    if let Err(err) = builder.serve_connection(io, service).await {
                        log::debug!("connection error: {err}");
                    }
                });
            }
        }
    }

    for backend in &state.backends {
        backend.close();
    }
    Ok(())
}

fn build_state(cfg: Arc<Bootstrap>) -> Result<AppState> {
    let mut backends_by_name: HashMap<String, Arc<dyn CacheBackend>> = HashMap::new();
    for cache in &cfg.caches {
        let opts = cache.index_options();
        let backend: Arc<dyn CacheBackend> = match cache.cache_type {
            CacheType::Memory => MemoryBackend::new(&cache.name, opts),
            CacheType::Filesystem => {
                FilesystemBackend::new(&cache.name, Path::new(&cache.cache_path), opts)
                    .map_err(|err| anyhow!("cache {}: {err}", cache.name))?
            }
            CacheType::Sled => SledBackend::new(&cache.name, Path::new(&cache.cache_path), opts)
                .map_err(|err| anyhow!("cache {}: {err}", cache.name))?,
        };
        backends_by_name.insert(cache.name.clone(), backend);
    }

    let locks = KeyLockRegistry::new();
    let mut routes = Vec::with_capacity(cfg.origins.len());
    for origin in &cfg.origins {
        let cache = backends_by_name
            .get(&origin.cache_name)
            .cloned()
            .ok_or_else(|| anyhow!("origin {}: unknown cache", origin.name))?;
        let upstream = UpstreamClient::new(
            Duration::from_secs(origin.keep_alive_timeout_secs.max(1)),
            origin.max_idle_conns.max(1),
        );
        let ctx = EngineContext {
            client: Arc::new(TsJsonClient::new(origin.clone())),
            cache,
            locks: Arc::clone(&locks),
            upstream,
        };
        routes.push(OriginRoute {
            name: origin.name.clone(),
            is_default: origin.is_default,
            ctx,
        });
    }

    Ok(AppState {
        cfg,
        routes,
        backends: backends_by_name.into_values().collect(),
    })
}

async fn handle(
    req: Request<Incoming>,
    state: Arc<AppState>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    if req.uri().path() == "/metrics" {
        return Ok(metrics_response());
    }

    let Some((route, path)) = resolve_route(&state, req.uri().path()) else {
        return Ok(text_response(StatusCode::NOT_FOUND, "no origin configured"));
    };

    let mut snapshot =
        RequestSnapshot::new(req.method().clone(), req.uri(), req.headers().clone());
    snapshot.path = path;

    let is_head = snapshot.method == Method::HEAD;
    if is_head {
        snapshot.method = Method::GET;
    }

    let started = Instant::now();
    let deadline = state.cfg.server.request_timeout;
    let engine_resp = match tokio::time::timeout(deadline, dispatch(route, &snapshot)).await {
        Ok(resp) => resp,
        Err(_) => error_response(&ProxyError::DeadlineExceeded),
    };

    let origin_cfg = route.ctx.client.configuration();
    metrics::record_request(
        &origin_cfg.name,
        &origin_cfg.origin_type,
        snapshot.method.as_str(),
        engine_resp.cache_status.as_str(),
        engine_resp.status.as_u16(),
        &snapshot.path,
        started.elapsed(),
    );

    Ok(into_http_response(engine_resp, is_head))
}

async fn dispatch(route: &OriginRoute, snapshot: &RequestSnapshot) -> EngineResponse {
    if snapshot.method != Method::GET {
        return proxy_only(&route.ctx, snapshot).await;
    }
    if route.ctx.client.is_range_path(&snapshot.path) {
        delta_proxy_request(&route.ctx, snapshot).await
    } else {
        object_proxy_request(&route.ctx, snapshot, false).await
    }
}

// `/{origin}/...` routes to the named origin; everything else goes to the
// default one.
fn resolve_route<'a>(state: &'a AppState, path: &str) -> Option<(&'a OriginRoute, String)> {
    let trimmed = path.trim_start_matches('/');
    if let Some((first, rest)) = trimmed.split_once('/') {
        if let Some(route) = state.routes.iter().find(|r| r.name == first) {
            return Some((route, format!("/{rest}")));
        }
    } else if let Some(route) = state.routes.iter().find(|r| r.name == trimmed) {
        return Some((route, "/".to_string()));
    }
    state
        .routes
        .iter()
        .find(|r| r.is_default)
        .or_else(|| state.routes.first())
        .map(|r| (r, path.to_string()))
}

fn into_http_response(resp: EngineResponse, is_head: bool) -> Response<Full<Bytes>> {
    let mut builder = Response::builder().status(resp.status);
    if let Some(headers) = builder.headers_mut() {
        *headers = resp.headers;
    }
    let body = if is_head { Bytes::new() } else { resp.body };
    builder
        .body(Full::new(body))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}

fn metrics_response() -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "text/plain; version=0.0.4")
        .body(Full::new(Bytes::from(metrics::exposition())))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}

fn text_response(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "text/plain")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}
