//! Connection pool for backend HTTP connections
//!
//! One pooled hyper client carries proxied traffic; a second, separately
//! pooled client carries readiness probes so probe connections never sit in
//! front of proxied requests.

use crate::error::GatewayBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
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
    /// Error from the HTTP client (connect refused, reset, DNS, ...)
    #[error("client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    /// Error building a request
    #[error("request build error: {0}")]
    RequestBuild(String),
}

/// Statistics for the connection pool
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Total number of requests made through the pool
    pub total_requests: AtomicU64,
    /// Total number of readiness probes
    pub probes: AtomicU64,
}

impl PoolStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_probe(&self) {
        self.probes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_probes(&self) -> u64 {
        self.probes.load(Ordering::Relaxed)
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

/// A connection pool for HTTP connections to the backend
pub struct ConnectionPool {
    /// Main client for proxying requests
    client: Client<HttpConnector, GatewayBody>,
    /// Dedicated client for readiness probes (uses Empty body type)
    probe_client: Client<HttpConnector, Empty<Bytes>>,
    stats: Arc<PoolStats>,
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

        let probe_client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(1)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Connection pool initialized"
        );

        Self {
            client,
            probe_client,
            stats: Arc::new(PoolStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Send a request whose URI is already absolute (`http://host:port/path`).
    ///
    /// The response body is handed back unbuffered; frames reach the caller
    /// as the backend produces them.
    pub async fn send(&self, req: Request<GatewayBody>) -> Result<Response<GatewayBody>, PoolError> {
        if req.uri().authority().is_none() {
            return Err(PoolError::RequestBuild(format!(
                "request URI {} has no authority",
                req.uri()
            )));
        }

        self.stats.record_request();

        let response = self.client.request(req).await?;
        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }

    /// Probe `uri` with a GET; true only for a 2xx answer within `timeout`
    pub async fn probe(&self, uri: &Uri, timeout: Duration) -> bool {
        let req = match Request::builder()
            .method("GET")
            .uri(uri.clone())
            .header("Connection", "keep-alive")
            .body(Empty::<Bytes>::new())
        {
            Ok(r) => r,
            Err(_) => return false,
        };

        self.stats.record_probe();

        match tokio::time::timeout(timeout, self.probe_client.request(req)).await {
            Ok(Ok(response)) => {
                let status = response.status();
                debug!(%uri, %status, "Readiness probe answered");
                status.is_success()
            }
            Ok(Err(e)) => {
                debug!(%uri, error = %e, "Readiness probe failed");
                false
            }
            Err(_) => {
                debug!(%uri, timeout_ms = timeout.as_millis() as u64, "Readiness probe timed out");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::full_body;

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
        assert_eq!(stats.get_probes(), 0);

        stats.record_request();
        stats.record_request();
        stats.record_probe();
        assert_eq!(stats.get_total_requests(), 2);
        assert_eq!(stats.get_probes(), 1);
    }

    #[tokio::test]
    async fn test_send_requires_absolute_uri() {
        let pool = ConnectionPool::new(PoolConfig::default());
        let req = Request::builder().uri("/relative").body(full_body("")).unwrap();

        assert!(matches!(pool.send(req).await, Err(PoolError::RequestBuild(_))));
        assert_eq!(pool.stats().get_total_requests(), 0);
    }

    #[tokio::test]
    async fn test_send_to_closed_port_is_client_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let pool = ConnectionPool::new(PoolConfig::default());
        let req = Request::builder()
            .uri(format!("http://127.0.0.1:{}/", port))
            .body(full_body(""))
            .unwrap();

        assert!(matches!(pool.send(req).await, Err(PoolError::Client(_))));
    }

    #[tokio::test]
    async fn test_probe_closed_port_is_not_ready() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let pool = ConnectionPool::new(PoolConfig::default());
        let uri: Uri = format!("http://127.0.0.1:{}/", port).parse().unwrap();

        assert!(!pool.probe(&uri, Duration::from_millis(500)).await);
        assert_eq!(pool.stats().get_probes(), 1);
    }
}
