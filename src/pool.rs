//! Shared HTTP client connection pool for upstream requests
//!
//! One pool is created at startup and used for every proxied request and
//! every readiness probe; it is dropped at shutdown.

use http_body_util::{combinators::BoxBody, BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, HOST};
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tracing::debug;

/// Response headers stripped before relaying: meaningful only to the
/// upstream transport leg, the gateway recomputes framing itself.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "content-encoding",
    "transfer-encoding",
    "connection",
    "keep-alive",
];

/// Error type for upstream requests
#[derive(Debug)]
pub enum PoolError {
    /// Error from the HTTP client (connect refused, timeout, reset)
    Client(hyper_util::client::legacy::Error),
    /// Error building the upstream request
    RequestBuild(String),
}

impl std::fmt::Display for PoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolError::Client(e) => write!(f, "upstream error: {}", e),
            PoolError::RequestBuild(s) => write!(f, "request build error: {}", s),
        }
    }
}

impl std::error::Error for PoolError {}

impl From<hyper_util::client::legacy::Error> for PoolError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        PoolError::Client(err)
    }
}

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per backend
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

/// A connection pool for HTTP connections to backend servers
pub struct ConnectionPool {
    /// Main client for proxying requests
    client: Client<HttpConnector, Incoming>,
    /// Dedicated client for health probes (uses Empty body type)
    health_client: Client<HttpConnector, Empty<Bytes>>,
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
            config,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Forward a request to a backend.
    ///
    /// `path_and_query` is the already-resolved forwarded path plus the
    /// original query string. The Host header is rewritten to the
    /// backend's authority; everything else passes through unmodified.
    /// Hop-by-hop headers are stripped from the response.
    pub async fn send_request(
        &self,
        req: Request<Incoming>,
        host: &str,
        port: u16,
        path_and_query: &str,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, PoolError> {
        let authority = format!("{}:{}", host, port);
        let uri = format!("http://{}{}", authority, path_and_query);

        let (parts, body) = req.into_parts();
        let mut builder = Request::builder().method(parts.method).uri(&uri);

        for (key, value) in parts.headers.iter() {
            if key != HOST {
                builder = builder.header(key, value);
            }
        }
        builder = builder.header(
            HOST,
            HeaderValue::from_str(&authority)
                .map_err(|e| PoolError::RequestBuild(e.to_string()))?,
        );

        let upstream_req = builder
            .body(body)
            .map_err(|e| PoolError::RequestBuild(e.to_string()))?;

        let response = self.client.request(upstream_req).await?;

        let (mut parts, body) = response.into_parts();
        for header in HOP_BY_HOP_HEADERS {
            parts.headers.remove(*header);
        }

        Ok(Response::from_parts(parts, body.boxed()))
    }

    /// Probe a backend endpoint; healthy means HTTP 200 exactly, other
    /// 2xx answers do not count. Uses the dedicated health client for
    /// connection reuse.
    pub async fn check_backend(&self, host: &str, port: u16, path: &str) -> bool {
        let uri = format!("http://{}:{}{}", host, port, path);

        let req = match Request::builder()
            .method("GET")
            .uri(&uri)
            .header("Connection", "keep-alive")
            .body(Empty::<Bytes>::new())
        {
            Ok(r) => r,
            Err(_) => return false,
        };

        match self.health_client.request(req).await {
            Ok(response) => response.status() == StatusCode::OK,
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.max_idle_per_host, 10);
        assert_eq!(config.idle_timeout, Duration::from_secs(90));
    }

    #[test]
    fn test_pool_creation() {
        let config = PoolConfig {
            max_idle_per_host: 5,
            idle_timeout: Duration::from_secs(30),
        };

        let pool = ConnectionPool::new(config);
        assert_eq!(pool.config().max_idle_per_host, 5);
        assert_eq!(pool.config().idle_timeout, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_check_backend_refused() {
        let pool = ConnectionPool::new(PoolConfig::default());
        // Nothing listens here
        assert!(!pool.check_backend("127.0.0.1", 1, "/health").await);
    }

    #[tokio::test]
    async fn test_check_backend_requires_200_exactly() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        async fn spawn_stub(response: &'static [u8]) -> u16 {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();
            tokio::spawn(async move {
                loop {
                    let Ok((mut stream, _)) = listener.accept().await else {
                        break;
                    };
                    tokio::spawn(async move {
                        let mut buf = [0u8; 1024];
                        let _ = stream.read(&mut buf).await;
                        let _ = stream.write_all(response).await;
                    });
                }
            });
            port
        }

        let pool = ConnectionPool::new(PoolConfig::default());

        let ok = spawn_stub(
            b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok",
        )
        .await;
        assert!(pool.check_backend("127.0.0.1", ok, "/health").await);

        // 204 is a 2xx answer but not a health pass
        let no_content =
            spawn_stub(b"HTTP/1.1 204 No Content\r\nconnection: close\r\n\r\n").await;
        assert!(!pool.check_backend("127.0.0.1", no_content, "/health").await);
    }
}
