//! Routegate - a multi-process application gateway
//!
//! This library provides a gateway that:
//! - Launches a set of backend server processes from one configuration
//! - Waits for every backend's `/health` endpoint before serving
//! - Routes HTTP traffic by longest matching path prefix
//! - Proxies plain requests through a pooled HTTP client
//! - Relays WebSocket sessions frame-by-frame in both directions
//! - Tears the whole process group down on shutdown

pub mod config;
pub mod error;
pub mod logconf;
pub mod pool;
pub mod process;
pub mod proxy;
pub mod readiness;
pub mod relay;
pub mod router;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
