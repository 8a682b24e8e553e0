use crate::backend::{BackendHandle, BackendPool};
use crate::config::Config;
use crate::error::{json_error_response, ConfigError, ProxyErrorCode};
use crate::lifecycle::{ExternallyManaged, LifecycleManager};
use crate::pool::{origin_path, ConnectionPool, PoolConfig, PoolError};
use crate::strategy::{SelectionStrategy, UniformRandom};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";

pub const DEFAULT_LIVENESS_PATH: &str = "/health";

type ProxyResponse = Response<BoxBody<Bytes, hyper::Error>>;

/// Request counters. Relaxed atomics, read for logging only.
#[derive(Debug)]
pub struct FrontDoorStats {
    liveness_hits: AtomicU64,
    forwarded: Box<[AtomicU64]>,
    failures: AtomicU64,
}

impl FrontDoorStats {
    fn new(backends: usize) -> Self {
        Self {
            liveness_hits: AtomicU64::new(0),
            forwarded: (0..backends).map(|_| AtomicU64::new(0)).collect(),
            failures: AtomicU64::new(0),
        }
    }

    pub fn liveness_hits(&self) -> u64 {
        self.liveness_hits.load(Ordering::Relaxed)
    }

    /// Requests answered by each backend, in pool order
    pub fn forwarded(&self) -> Vec<u64> {
        self.forwarded
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .collect()
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    fn record_forwarded(&self, index: usize) {
        if let Some(counter) = self.forwarded.get(index) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Answers liveness probes and forwards every other request to one backend
/// picked by the selection strategy.
pub struct FrontDoor {
    liveness_path: String,
    backends: BackendPool,
    strategy: Arc<dyn SelectionStrategy>,
    client: Arc<ConnectionPool>,
    lifecycle: Arc<dyn LifecycleManager>,
    request_timeout: Option<Duration>,
    stats: FrontDoorStats,
}

impl FrontDoor {
    pub fn new(
        backends: BackendPool,
        client: Arc<ConnectionPool>,
        lifecycle: Arc<dyn LifecycleManager>,
    ) -> Self {
        let stats = FrontDoorStats::new(backends.len());
        Self {
            liveness_path: DEFAULT_LIVENESS_PATH.to_string(),
            backends,
            strategy: Arc::new(UniformRandom),
            client,
            lifecycle,
            request_timeout: None,
            stats,
        }
    }

    /// Build the pool, client and lifecycle manager described by `config`
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let backends = config.pool.build()?;

        let client = Arc::new(ConnectionPool::new(PoolConfig {
            max_idle_per_host: config.server.pool_max_idle_per_host,
            idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
        }));

        let lifecycle = Arc::new(ExternallyManaged::new(
            Arc::clone(&client),
            config.monitor.ping_path.clone(),
            config.monitor.timeout(),
        ));

        let mut front_door = Self::new(backends, client, lifecycle)
            .with_liveness_path(config.server.liveness_path.clone())
            .with_strategy(config.pool.strategy.build());

        if let Some(timeout) = config.server.request_timeout() {
            front_door = front_door.with_request_timeout(timeout);
        }

        Ok(front_door)
    }

    pub fn with_liveness_path(mut self, path: impl Into<String>) -> Self {
        self.liveness_path = path.into();
        self
    }

    pub fn with_strategy(mut self, strategy: Arc<dyn SelectionStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn backends(&self) -> &BackendPool {
        &self.backends
    }

    pub fn lifecycle(&self) -> Arc<dyn LifecycleManager> {
        Arc::clone(&self.lifecycle)
    }

    pub fn client(&self) -> &Arc<ConnectionPool> {
        &self.client
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    pub fn liveness_path(&self) -> &str {
        &self.liveness_path
    }

    pub fn stats(&self) -> &FrontDoorStats {
        &self.stats
    }

    pub async fn handle(&self, req: Request<Incoming>) -> ProxyResponse {
        // Liveness is answered before any backend is chosen
        if req.uri().path() == self.liveness_path {
            self.stats.liveness_hits.fetch_add(1, Ordering::Relaxed);
            return liveness_response();
        }

        let request_id = req
            .headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        if req.method() == Method::CONNECT || origin_path(req.uri()).is_none() {
            debug!(method = %req.method(), uri = %req.uri(), request_id, "Rejecting request without an origin path");
            return json_error_response(
                ProxyErrorCode::MalformedRequest,
                "Request target must be an origin path",
            );
        }

        let backend = self.strategy.pick(&self.backends);

        debug!(
            backend = %backend,
            method = %req.method(),
            uri = %req.uri(),
            request_id,
            "Forwarding request"
        );

        if let Err(e) = self.lifecycle.ensure_running(backend).await {
            self.stats.failures.fetch_add(1, Ordering::Relaxed);
            error!(backend = %backend, request_id, error = %e, "Backend not running");
            return json_error_response(ProxyErrorCode::BackendStartFailed, "Backend unavailable");
        }

        let started = Instant::now();

        if is_upgrade_request(&req) {
            return self.forward_upgrade(req, backend, &request_id).await;
        }

        match self.send(req, backend, &request_id).await {
            Ok(response) => {
                self.stats.record_forwarded(backend.index());
                debug!(
                    backend = %backend,
                    request_id,
                    status = response.status().as_u16(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Backend responded"
                );
                response
            }
            Err(response) => response,
        }
    }

    /// Send `req` to `backend` under the configured timeout. The timeout
    /// covers the response head; failures come back as error responses.
    async fn send(
        &self,
        req: Request<Incoming>,
        backend: &BackendHandle,
        request_id: &str,
    ) -> Result<ProxyResponse, ProxyResponse> {
        let forward = self.client.send_request(req, backend);
        let result = match self.request_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, forward).await {
                Ok(result) => result,
                Err(_) => {
                    self.stats.failures.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        backend = %backend,
                        request_id,
                        timeout_ms = timeout.as_millis() as u64,
                        "Request timed out"
                    );
                    return Err(json_error_response(
                        ProxyErrorCode::RequestTimeout,
                        format!("Request timed out after {} ms", timeout.as_millis()),
                    ));
                }
            },
            None => forward.await,
        };

        result.map_err(|e| self.forward_failed(e, backend, request_id))
    }

    fn forward_failed(&self, e: PoolError, backend: &BackendHandle, request_id: &str) -> ProxyResponse {
        self.stats.failures.fetch_add(1, Ordering::Relaxed);

        if let PoolError::RequestBuild(_) = e {
            warn!(backend = %backend, request_id, error = %e, "Could not build backend request");
            return json_error_response(ProxyErrorCode::MalformedRequest, "Request cannot be forwarded");
        }

        // Log detailed error internally, return generic message externally
        error!(
            backend = %backend,
            request_id,
            connect = e.is_connect(),
            error = %e,
            "Failed to forward request"
        );
        json_error_response(ProxyErrorCode::ConnectionFailed, "Failed to reach backend")
    }

    /// Forward an upgrade request. On `101` both sides are upgraded and bytes
    /// are copied until either closes; any other answer is returned as is.
    async fn forward_upgrade(
        &self,
        mut req: Request<Incoming>,
        backend: &BackendHandle,
        request_id: &str,
    ) -> ProxyResponse {
        let client_upgrade = hyper::upgrade::on(&mut req);

        let mut response = match self.send(req, backend, request_id).await {
            Ok(response) => response,
            Err(response) => return response,
        };
        self.stats.record_forwarded(backend.index());

        if response.status() != StatusCode::SWITCHING_PROTOCOLS {
            debug!(backend = %backend, request_id, status = response.status().as_u16(), "Backend declined upgrade");
            return response;
        }

        info!(backend = %backend, request_id, "Connection upgraded");

        let backend_upgrade = hyper::upgrade::on(&mut response);
        let backend_name = backend.to_string();
        let request_id = request_id.to_string();

        tokio::spawn(async move {
            match tokio::try_join!(client_upgrade, backend_upgrade) {
                Ok((client, upstream)) => {
                    let mut client_io = TokioIo::new(client);
                    let mut upstream_io = TokioIo::new(upstream);
                    match tokio::io::copy_bidirectional(&mut client_io, &mut upstream_io).await {
                        Ok((client_to_backend, backend_to_client)) => {
                            debug!(
                                backend = backend_name,
                                request_id,
                                client_to_backend,
                                backend_to_client,
                                "Upgraded connection closed"
                            );
                        }
                        Err(e) => {
                            debug!(backend = backend_name, request_id, error = %e, "Upgraded connection closed with error");
                        }
                    }
                }
                Err(e) => {
                    error!(backend = backend_name, request_id, error = %e, "Failed to complete upgrade");
                }
            }
        });

        response
    }
}

fn liveness_response() -> ProxyResponse {
    Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .body(Full::new(Bytes::from_static(b"ok")).map_err(|never| match never {}).boxed())
        .expect("valid response builder")
}

/// Check for `Connection: upgrade` together with an `Upgrade` header
fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    has_upgrade_connection && req.headers().contains_key(hyper::header::UPGRADE)
}

/// Accept loop serving a [`FrontDoor`]
pub struct ProxyServer {
    bind_addr: SocketAddr,
    front_door: Arc<FrontDoor>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        front_door: Arc<FrontDoor>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            front_door,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(
            addr = %local_addr,
            backends = self.front_door.backends().len(),
            strategy = self.front_door.strategy_name(),
            "Front door listening (HTTP/1.1 and HTTP/2)"
        );

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let front_door = Arc::clone(&self.front_door);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, front_door).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    // A dropped sender counts as shutdown
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Front door shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    front_door: Arc<FrontDoor>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let front_door = Arc::clone(&front_door);
        async move { Ok::<_, Infallible>(front_door.handle(req).await) }
    });

    // Unparsable requests are answered with 400 by hyper itself
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error from {}: {}", addr, e))?;

    Ok(())
}
