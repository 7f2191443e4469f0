//! The gateway's HTTP front door
//!
//! Accepts connections, serves the gateway's own introspection endpoints
//! (`/health`, `/routers`), and hands everything else to the prefix
//! router: plain requests go through the connection pool, upgrade
//! requests go to the WebSocket relay.

use crate::config::Config;
use crate::error::{json_error_response, ProxyErrorCode};
use crate::pool::ConnectionPool;
use crate::relay;
use crate::router::RouteTable;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// The main gateway server
pub struct ProxyServer {
    bind_addr: SocketAddr,
    config: Arc<Config>,
    table: Arc<RouteTable>,
    pool: Arc<ConnectionPool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        config: Arc<Config>,
        table: Arc<RouteTable>,
        pool: Arc<ConnectionPool>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            config,
            table,
            pool,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Gateway listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let config = Arc::clone(&self.config);
                            let table = Arc::clone(&self.table);
                            let pool = Arc::clone(&self.pool);

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, config, table, pool).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Gateway shutting down");
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
    config: Arc<Config>,
    table: Arc<RouteTable>,
    pool: Arc<ConnectionPool>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let config = Arc::clone(&config);
        let table = Arc::clone(&table);
        let pool = Arc::clone(&pool);
        async move { handle_request(req, config, table, pool, addr).await }
    });

    // auto::Builder supports both HTTP/1.1 and HTTP/2; the upgrade-aware
    // connection keeps WebSocket support on HTTP/1.1
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    config: Arc<Config>,
    table: Arc<RouteTable>,
    pool: Arc<ConnectionPool>,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    // Generate or propagate request ID
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let path = req.uri().path().to_string();

    // The gateway's own endpoints win over any catch-all backend
    if req.method() == hyper::Method::GET {
        if path == "/health" {
            return Ok(json_response(StatusCode::OK, &health_document(&config)));
        }
        if path == "/routers" {
            return Ok(json_response(StatusCode::OK, &routers_document(&config)));
        }
    }

    // Overwrite forwarding headers rather than appending: the gateway is
    // the first trusted hop, so client-provided values are not honored.
    let headers = req.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

    debug!(method = %req.method(), path, request_id, "Incoming request");

    // Resolve the owning backend before touching the body; upgrades are
    // answered even when unroutable (the relay closes with a policy code)
    let query = req.uri().query().map(String::from);
    let route = table
        .resolve(&path)
        .map(|(router, forwarded)| (router.clone(), join_query(&forwarded, query.as_deref())));

    if is_upgrade_request(&req) {
        return relay::handle_upgrade(req, route).await;
    }

    let Some((router, path_and_query)) = route else {
        debug!(path, request_id, "No matching route");
        return Ok(json_error_response(
            ProxyErrorCode::RouteNotFound,
            format!("No route for path {}", path),
        ));
    };

    debug!(backend = %router.name, forwarded = %path_and_query, request_id, "Forwarding request");

    match pool
        .send_request(req, &router.host, router.port, &path_and_query)
        .await
    {
        Ok(response) => Ok(response),
        Err(e) => {
            warn!(backend = %router.name, authority = %router.authority(), error = %e, "Backend unreachable");
            Ok(json_error_response(
                ProxyErrorCode::UpstreamUnreachable,
                format!("Backend {} is unreachable", router.name),
            ))
        }
    }
}

/// The `/health` document: gateway liveness plus the routing table
fn health_document(config: &Config) -> serde_json::Value {
    let routers: Vec<serde_json::Value> = config
        .routers
        .iter()
        .map(|r| {
            serde_json::json!({
                "name": r.name,
                "host": r.host,
                "port": r.port,
                "prefix": r.prefix,
            })
        })
        .collect();
    serde_json::json!({ "status": "ok", "routers": routers })
}

/// The `/routers` document: the full effective configuration
fn routers_document(config: &Config) -> serde_json::Value {
    serde_json::json!({
        "main": config.main,
        "routers": config.routers,
    })
}

fn json_response(
    status: StatusCode,
    value: &serde_json::Value,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(
            Full::new(Bytes::from(value.to_string()))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid response builder")
}

/// Append the original query string to a forwarded path
fn join_query(path: &str, query: Option<&str>) -> String {
    match query {
        Some(q) => format!("{}?{}", path, q),
        None => path.to_string(),
    }
}

fn is_upgrade_request(req: &Request<Incoming>) -> bool {
    // Connection: Upgrade (case-insensitive value check) plus an Upgrade header
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    let has_upgrade_header = req.headers().contains_key(hyper::header::UPGRADE);

    has_upgrade_connection && has_upgrade_header
}
