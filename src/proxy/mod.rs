use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;

use crate::cache::{CacheBackend, LookupStatus};
use crate::error::ProxyError;
use crate::locks::KeyLockRegistry;
use crate::origins::OriginClient;

pub mod delta;
pub mod document;
pub mod object;
pub mod ranges;

/// A client request reduced to the parts the engines clone and mutate.
/// Query parameters are kept as raw tokens, never decoded.
#[derive(Debug, Clone)]
pub struct RequestSnapshot {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: HeaderMap,
}

impl RequestSnapshot {
    pub fn new(method: Method, uri: &Uri, headers: HeaderMap) -> Self {
        let query = uri
            .query()
            .unwrap_or_default()
            .split('&')
            .filter(|p| !p.is_empty())
            .map(|p| match p.split_once('=') {
                Some((k, v)) => (k.to_string(), v.to_string()),
                None => (p.to_string(), String::new()),
            })
            .collect();
        Self {
            method,
            path: uri.path().to_string(),
            query,
            headers,
        }
    }

    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn set_query(&mut self, key: &str, value: String) {
        match self.query.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = value,
            None => self.query.push((key.to_string(), value)),
        }
    }

    pub fn query_string(&self) -> String {
        self.query
            .iter()
            .map(|(k, v)| {
                if v.is_empty() {
                    k.clone()
                } else {
                    format!("{k}={v}")
                }
            })
            .collect::<Vec<_>>()
            .join("&")
    }

    /// Joins this request onto an origin base URL.
    pub fn uri_for(&self, base: &str) -> Result<Uri> {
        let base = base.trim_end_matches('/');
        let qs = self.query_string();
        let uri = if qs.is_empty() {
            format!("{base}{}", self.path)
        } else {
            format!("{base}{}?{qs}", self.path)
        };
        uri.parse().with_context(|| format!("build upstream uri {uri}"))
    }
}

#[derive(Clone)]
pub struct UpstreamClient {
    client: Client<HttpConnector, Full<Bytes>>,
}

impl UpstreamClient {
    pub fn new(keep_alive: Duration, max_idle_conns: usize) -> Self {
        let connector = HttpConnector::new();
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(keep_alive)
            .pool_max_idle_per_host(max_idle_conns)
            .build(connector);
        Self { client }
    }

    pub async fn fetch(
        &self,
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        deadline: Duration,
    ) -> Result<(StatusCode, HeaderMap, Bytes), ProxyError> {
        let mut req = http::Request::builder().method(method).uri(uri);
        for (k, v) in headers.iter() {
            req = req.header(k, v);
        }
        let req = req
            .body(Full::new(Bytes::new()))
            .map_err(|err| ProxyError::Origin {
                status: 502,
                message: err.to_string(),
            })?;

        let resp = match tokio::time::timeout(deadline, self.client.request(req)).await {
            Err(_) => return Err(ProxyError::DeadlineExceeded),
            Ok(Err(err)) => {
                return Err(ProxyError::Origin {
                    status: 502,
                    message: err.to_string(),
                })
            }
            Ok(Ok(resp)) => resp,
        };

        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp
            .into_body()
            .collect()
            .await
            .map_err(|err| ProxyError::Origin {
                status: 502,
                message: err.to_string(),
            })?
            .to_bytes();
        Ok((status, headers, body))
    }
}

/// Everything a single request handler needs: the origin dialect, the
/// backing cache, the lock registry, and the pooled upstream client. One
/// context exists per configured origin; the backend and lock registry
/// are process-wide.
#[derive(Clone)]
pub struct EngineContext {
    pub client: Arc<dyn OriginClient>,
    pub cache: Arc<dyn CacheBackend>,
    pub locks: Arc<KeyLockRegistry>,
    pub upstream: UpstreamClient,
}

impl EngineContext {
    pub async fn fetch_origin(
        &self,
        snapshot: &RequestSnapshot,
    ) -> Result<(StatusCode, HeaderMap, Bytes), ProxyError> {
        let cfg = self.client.configuration();
        let uri = snapshot
            .uri_for(&cfg.origin_url)
            .map_err(|err| ProxyError::Origin {
                status: 502,
                message: err.to_string(),
            })?;
        self.upstream
            .fetch(
                snapshot.method.clone(),
                uri,
                snapshot.headers.clone(),
                cfg.timeout(),
            )
            .await
    }
}

/// What an engine hands back to the server layer.
#[derive(Debug)]
pub struct EngineResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub cache_status: LookupStatus,
}

impl EngineResponse {
    pub fn new(
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
        cache_status: LookupStatus,
    ) -> Self {
        Self {
            status,
            headers,
            body,
            cache_status,
        }
    }
}

/// Straight pass-through for requests the cache cannot help with.
pub async fn proxy_only(ctx: &EngineContext, snapshot: &RequestSnapshot) -> EngineResponse {
    match ctx.fetch_origin(snapshot).await {
        Ok((status, headers, body)) => {
            EngineResponse::new(status, headers, body, LookupStatus::ProxyOnly)
        }
        Err(err) => error_response(&err),
    }
}

pub fn error_response(err: &ProxyError) -> EngineResponse {
    let (status, cache_status) = match err {
        ProxyError::Origin { status, .. } => (
            StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY),
            LookupStatus::Error,
        ),
        ProxyError::DeadlineExceeded | ProxyError::Cancelled => {
            (StatusCode::GATEWAY_TIMEOUT, LookupStatus::Error)
        }
        ProxyError::QueryParse(_) => (StatusCode::BAD_REQUEST, LookupStatus::Error),
    };
    EngineResponse::new(status, HeaderMap::new(), Bytes::new(), cache_status)
}
