//! Connection pool for backend HTTP connections
//!
//! One pooled hyper client forwards proxied requests; a second, dedicated
//! client with an empty body type serves liveness pings so probes never
//! contend with request bodies for the same connections.

use crate::backend::BackendHandle;
use http_body_util::{combinators::BoxBody, BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::header::HOST;
use hyper::{Request, Response, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Error type for connection pool operations
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),

    #[error("request build error: {0}")]
    RequestBuild(String),
}

impl PoolError {
    /// True when the backend could not be reached at all
    pub fn is_connect(&self) -> bool {
        match self {
            PoolError::Client(e) => e.is_connect(),
            PoolError::RequestBuild(_) => false,
        }
    }
}

/// Statistics for the connection pool
#[derive(Debug, Default)]
pub struct PoolStats {
    pub total_requests: AtomicU64,
    pub health_checks: AtomicU64,
}

impl PoolStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_health_check(&self) {
        self.health_checks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_health_checks(&self) -> u64 {
        self.health_checks.load(Ordering::Relaxed)
    }
}

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per host
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Pooled HTTP clients shared by every request the front door forwards
pub struct ConnectionPool {
    client: Client<HttpConnector, Incoming>,
    health_client: Client<HttpConnector, Empty<Bytes>>,
    stats: Arc<PoolStats>,
    config: PoolConfig,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector.clone());

        let health_client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Connection pool initialized"
        );

        Self {
            client,
            health_client,
            stats: Arc::new(PoolStats::default()),
            config,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Forward a request to `backend`, keeping method, path, query, headers
    /// and body as received. The response comes back untouched.
    pub async fn send_request(
        &self,
        req: Request<Incoming>,
        backend: &BackendHandle,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, PoolError> {
        let backend_req = build_backend_request(req, backend)?;

        self.stats.record_request();

        let response = self.client.request(backend_req).await?;

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }

    /// GET `path` on `backend` and report whether it answered 2xx
    pub async fn check_backend(&self, backend: &BackendHandle, path: &str) -> bool {
        let uri = format!("http://{}{}", backend.authority(), path);

        let req = match Request::builder()
            .method("GET")
            .uri(&uri)
            .header("Connection", "keep-alive")
            .body(Empty::<Bytes>::new())
        {
            Ok(r) => r,
            Err(_) => return false,
        };

        self.stats.record_health_check();

        match self.health_client.request(req).await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}

/// Path and query of `uri` when it names an origin path (`/...`)
pub(crate) fn origin_path(uri: &Uri) -> Option<&str> {
    uri.path_and_query()
        .map(|pq| pq.as_str())
        .filter(|pq| pq.starts_with('/'))
}

/// Re-target `req` at `backend`. Only the scheme and authority of the URI change.
///
/// HTTP/2 requests carry the client's authority in the URI rather than a
/// `Host` header; it is written into `Host` so the backend sees the same
/// value an HTTP/1.1 client would have sent.
pub(crate) fn build_backend_request<B>(
    req: Request<B>,
    backend: &BackendHandle,
) -> Result<Request<B>, PoolError> {
    let path_and_query = origin_path(req.uri())
        .ok_or_else(|| PoolError::RequestBuild(format!("no origin path in '{}'", req.uri())))?;

    let uri = format!("http://{}{}", backend.authority(), path_and_query);

    let (parts, body) = req.into_parts();
    let mut builder = Request::builder().method(parts.method).uri(&uri);

    if !parts.headers.contains_key(HOST) {
        if let Some(authority) = parts.uri.authority() {
            builder = builder.header(HOST, authority.as_str());
        }
    }

    for (key, value) in parts.headers.iter() {
        builder = builder.header(key, value);
    }

    builder
        .body(body)
        .map_err(|e| PoolError::RequestBuild(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> BackendHandle {
        BackendHandle::new(0, "10.1.2.3:8080".parse().unwrap())
    }

    #[test]
    fn test_pool_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.max_idle_per_host, 10);
        assert_eq!(config.idle_timeout, Duration::from_secs(90));
    }

    #[test]
    fn test_pool_stats() {
        let stats = PoolStats::default();

        assert_eq!(stats.get_total_requests(), 0);
        assert_eq!(stats.get_health_checks(), 0);

        stats.record_request();
        stats.record_request();
        stats.record_health_check();
        assert_eq!(stats.get_total_requests(), 2);
        assert_eq!(stats.get_health_checks(), 1);
    }

    #[tokio::test]
    async fn test_pool_creation() {
        let pool = ConnectionPool::new(PoolConfig {
            max_idle_per_host: 5,
            idle_timeout: Duration::from_secs(30),
        });
        assert_eq!(pool.config().max_idle_per_host, 5);
        assert_eq!(pool.config().idle_timeout, Duration::from_secs(30));
        assert_eq!(pool.stats().get_total_requests(), 0);
    }

    #[test]
    fn test_backend_request_keeps_everything_but_authority() {
        let req = Request::builder()
            .method("PATCH")
            .uri("http://frontdoor.example.com/compile/doc?engine=lualatex&draft=1")
            .header("host", "frontdoor.example.com")
            .header("x-custom", "a")
            .header("x-custom", "b")
            .body("payload")
            .unwrap();

        let out = build_backend_request(req, &backend()).unwrap();

        assert_eq!(out.method(), "PATCH");
        assert_eq!(
            out.uri().to_string(),
            "http://10.1.2.3:8080/compile/doc?engine=lualatex&draft=1"
        );
        assert_eq!(out.headers().get("host").unwrap(), "frontdoor.example.com");
        let custom: Vec<_> = out.headers().get_all("x-custom").iter().collect();
        assert_eq!(custom, vec!["a", "b"]);
        assert_eq!(*out.body(), "payload");
    }

    #[test]
    fn test_backend_request_host_from_authority() {
        let req = Request::builder()
            .version(hyper::Version::HTTP_2)
            .uri("http://frontdoor.example.com:8443/render?page=2")
            .body(())
            .unwrap();

        let out = build_backend_request(req, &backend()).unwrap();

        assert_eq!(out.uri().to_string(), "http://10.1.2.3:8080/render?page=2");
        assert_eq!(out.headers().get(HOST).unwrap(), "frontdoor.example.com:8443");
        assert_eq!(out.headers().get_all(HOST).iter().count(), 1);
    }

    #[test]
    fn test_backend_request_keeps_existing_host() {
        let req = Request::builder()
            .uri("http://ignored.example.com/x")
            .header("host", "client.example.com")
            .body(())
            .unwrap();

        let out = build_backend_request(req, &backend()).unwrap();
        let hosts: Vec<_> = out.headers().get_all(HOST).iter().collect();
        assert_eq!(hosts, vec!["client.example.com"]);
    }

    #[test]
    fn test_backend_request_origin_form_without_host() {
        let req = Request::builder().uri("/x").body(()).unwrap();

        let out = build_backend_request(req, &backend()).unwrap();
        assert!(out.headers().get(HOST).is_none());
    }

    #[test]
    fn test_backend_request_rejects_authority_form() {
        let req = Request::builder()
            .method("CONNECT")
            .uri("example.com:443")
            .body(())
            .unwrap();

        assert!(matches!(
            build_backend_request(req, &backend()),
            Err(PoolError::RequestBuild(_))
        ));
    }

    #[test]
    fn test_origin_path() {
        let uri: Uri = "/a/b?c=d".parse().unwrap();
        assert_eq!(origin_path(&uri), Some("/a/b?c=d"));

        let uri: Uri = "http://host:1/x".parse().unwrap();
        assert_eq!(origin_path(&uri), Some("/x"));

        let uri: Uri = "*".parse().unwrap();
        assert_eq!(origin_path(&uri), None);
    }

    #[tokio::test]
    async fn test_check_backend_unreachable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let pool = ConnectionPool::new(PoolConfig::default());
        let handle = BackendHandle::new(0, addr.to_string().parse().unwrap());

        assert!(!pool.check_backend(&handle, "/").await);
        assert_eq!(pool.stats().get_health_checks(), 1);
    }
}
