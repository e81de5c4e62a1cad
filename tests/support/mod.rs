#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Method, Response, StatusCode, Uri};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;

use chronocache::cache::memory::MemoryBackend;
use chronocache::cache::index::IndexOptions;
use chronocache::config::OriginConfig;
use chronocache::locks::KeyLockRegistry;
use chronocache::origins::tsjson::TsJsonClient;
use chronocache::proxy::{EngineContext, RequestSnapshot, UpstreamClient};

/// A request as seen by the mock origin.
#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: HeaderMap,
}

impl SeenRequest {
    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

pub struct MockServer {
    addr: SocketAddr,
    seen: Arc<Mutex<Vec<SeenRequest>>>,
    shutdown: Option<tokio::sync::oneshot::Sender<()>>,
}

impl MockServer {
    pub async fn start<F>(handler: F) -> Self
    where
        F: Fn(&SeenRequest) -> Response<Full<Bytes>> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock");
        let addr = listener.local_addr().expect("local addr");
        let (shutdown, mut rx) = tokio::sync::oneshot::channel();
        let handler = Arc::new(handler);
        let seen: Arc<Mutex<Vec<SeenRequest>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_srv = Arc::clone(&seen);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut rx => break,
                    res = listener.accept() => {
                        let (stream, _) = match res { Ok(v) => v, Err(_) => break };
                        let io = TokioIo::new(stream);
                        let handler = Arc::clone(&handler);
                        let seen = Arc::clone(&seen_srv);
                        tokio::spawn(async move {
                            let service = service_fn(move |req: http::Request<Incoming>| {
                                let recorded = record(&req);
                                seen.lock().expect("seen requests").push(recorded.clone());
                                let resp = handler(&recorded);
                                async move { Ok::<_, hyper::Error>(resp) }
                            });
                            let builder = ConnBuilder::new(TokioExecutor::new());
                            let _ = builder.serve_connection(io, service).await;
                        });
                    }
                }
            }
        });

        Self {
            addr,
            seen,
            shutdown: Some(shutdown),
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn seen(&self) -> Vec<SeenRequest> {
        self.seen.lock().expect("seen requests").clone()
    }

    pub fn request_count(&self) -> usize {
        self.seen.lock().expect("seen requests").len()
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

fn record(req: &http::Request<Incoming>) -> SeenRequest {
    let query = req
        .uri()
        .query()
        .unwrap_or_default()
        .split('&')
        .filter(|p| !p.is_empty())
        .map(|p| match p.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (p.to_string(), String::new()),
        })
        .collect();
    SeenRequest {
        method: req.method().clone(),
        path: req.uri().path().to_string(),
        query,
        headers: req.headers().clone(),
    }
}

pub fn origin_config(origin_url: &str) -> OriginConfig {
    let yaml = format!(
        "name: test\norigin_url: {origin_url}\ncache_name: default\norigin_timeout_secs: 5\nfast_forward_disable: true\n"
    );
    serde_yaml::from_str(&yaml).expect("origin config")
}

pub fn engine_ctx(config: OriginConfig) -> EngineContext {
    EngineContext {
        client: Arc::new(TsJsonClient::new(config)),
        cache: MemoryBackend::new("default", IndexOptions::default()),
        locks: KeyLockRegistry::new(),
        upstream: UpstreamClient::new(Duration::from_secs(30), 8),
    }
}

pub fn snapshot(path_and_query: &str) -> RequestSnapshot {
    let uri: Uri = format!("http://proxy.local{path_and_query}")
        .parse()
        .expect("uri");
    RequestSnapshot::new(Method::GET, &uri, HeaderMap::new())
}

pub fn range_snapshot(q: &str, start: i64, end: i64, step: i64) -> RequestSnapshot {
    snapshot(&format!(
        "/api/query_range?q={q}&start={start}&end={end}&step={step}"
    ))
}

/// A sparse-envelope origin body densely populated over `[start, end]`.
pub fn series_body(start: i64, end: i64, step: i64) -> String {
    let points: Vec<String> = (start..=end)
        .step_by(step as usize)
        .map(|t| format!("[{t},{}.0]", t % 100))
        .collect();
    format!("{{\"data\":[{}],\"step\":{step}}}", points.join(","))
}

pub fn json_response(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .expect("response")
}

pub fn series_response(seen: &SeenRequest) -> Response<Full<Bytes>> {
    let start: i64 = seen
        .query_value("start")
        .and_then(|v| v.parse().ok())
        .expect("start param");
    let end: i64 = seen
        .query_value("end")
        .and_then(|v| v.parse().ok())
        .expect("end param");
    let step: i64 = seen
        .query_value("step")
        .and_then(|v| v.parse().ok())
        .expect("step param");
    json_response(StatusCode::OK, series_body(start, end, step))
}
