//! Startup readiness gate
//!
//! Blocks the launch sequence until every backend answers its health
//! endpoint, or fails the whole startup when the deadline passes.

use crate::config::RouteDescriptor;
use crate::error::GatewayError;
use crate::pool::ConnectionPool;
use std::collections::BTreeSet;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Per-probe timeout; one slow backend must not eat the whole deadline
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Health endpoint every backend is required to expose
const HEALTH_PATH: &str = "/health";

/// Poll every backend's `/health` until all answer 200 or the deadline
/// expires. On timeout the error names only the still-unhealthy
/// backends. The caller is responsible for stopping launched processes.
pub async fn wait_until_healthy(
    pool: &ConnectionPool,
    routers: &[RouteDescriptor],
    timeout: Duration,
    poll_interval: Duration,
) -> Result<(), GatewayError> {
    let deadline = Instant::now() + timeout;
    let mut pending: BTreeSet<&str> = routers.iter().map(|r| r.name.as_str()).collect();

    info!(
        backends = pending.len(),
        timeout_secs = timeout.as_secs_f64(),
        "Waiting for backends to become healthy"
    );

    loop {
        let mut became_healthy = Vec::new();
        for router in routers {
            if !pending.contains(router.name.as_str()) {
                continue;
            }
            let healthy = tokio::time::timeout(
                PROBE_TIMEOUT,
                pool.check_backend(&router.host, router.port, HEALTH_PATH),
            )
            .await
            .unwrap_or(false);

            if healthy {
                debug!(backend = %router.name, "Backend is healthy");
                became_healthy.push(router.name.as_str());
            }
        }
        for name in became_healthy {
            pending.remove(name);
        }

        if pending.is_empty() {
            info!("All backends healthy");
            return Ok(());
        }

        if Instant::now() >= deadline {
            return Err(GatewayError::Readiness(
                pending.into_iter().map(String::from).collect(),
            ));
        }

        tokio::time::sleep(poll_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolConfig;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn descriptor(name: &str, port: u16) -> RouteDescriptor {
        RouteDescriptor {
            name: name.to_string(),
            command: "sh -c 'sleep 60'".to_string(),
            host: "127.0.0.1".to_string(),
            port,
            prefix: Some(format!("/{}", name)),
            log_target: None,
            extra_args: Vec::new(),
        }
    }

    /// Minimal health responder: answers every request with 200
    async fn spawn_health_stub() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = stream.read(&mut buf).await;
                    let _ = stream
                        .write_all(
                            b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok",
                        )
                        .await;
                });
            }
        });
        port
    }

    /// Responder that always answers 503
    async fn spawn_unhealthy_stub() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = stream.read(&mut buf).await;
                    let _ = stream
                        .write_all(
                            b"HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
                        )
                        .await;
                });
            }
        });
        port
    }

    #[tokio::test]
    async fn test_all_healthy() {
        let pool = ConnectionPool::new(PoolConfig::default());
        let a = spawn_health_stub().await;
        let b = spawn_health_stub().await;

        let routers = vec![descriptor("a", a), descriptor("b", b)];
        wait_until_healthy(
            &pool,
            &routers,
            Duration::from_secs(2),
            Duration::from_millis(100),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_timeout_names_only_unhealthy_backends() {
        let pool = ConnectionPool::new(PoolConfig::default());
        let a = spawn_health_stub().await;
        let b = spawn_health_stub().await;

        // Third backend never answers (no listener on this port)
        let routers = vec![
            descriptor("a", a),
            descriptor("b", b),
            descriptor("c", 1),
        ];

        let err = wait_until_healthy(
            &pool,
            &routers,
            Duration::from_secs(2),
            Duration::from_millis(500),
        )
        .await
        .unwrap_err();

        match err {
            GatewayError::Readiness(pending) => {
                assert_eq!(pending, vec!["c".to_string()]);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_non_200_keeps_backend_pending() {
        let pool = ConnectionPool::new(PoolConfig::default());
        let a = spawn_unhealthy_stub().await;

        let err = wait_until_healthy(
            &pool,
            &[descriptor("a", a)],
            Duration::from_millis(600),
            Duration::from_millis(200),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, GatewayError::Readiness(ref p) if p == &["a".to_string()]));
    }
}
