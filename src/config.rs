use crate::error::GatewayError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// How long a backend gets to answer the `--describe` probe.
const DESCRIBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    /// Gateway listen settings
    #[serde(default)]
    pub main: GatewayConfig,

    /// Backend route descriptors
    #[serde(default)]
    pub routers: Vec<RouteDescriptor>,
}

/// Listen configuration for the gateway itself
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GatewayConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_gateway_host")]
    pub host: String,

    /// Listen port (default: 8000)
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Runtime worker thread hint (default: 4)
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Accepted for compatibility; route reloading is not supported
    #[serde(default)]
    pub reload: bool,

    /// Log level directive (default: info)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_gateway_host(),
            port: default_gateway_port(),
            workers: default_workers(),
            reload: false,
            log_level: default_log_level(),
        }
    }
}

/// Static configuration for a single backend.
///
/// # Security Warning
///
/// The `command` field is executed directly when the supervisor launches
/// the backend. Configuration files must be protected with appropriate
/// file permissions; a malicious config file can execute arbitrary code
/// with the permissions of the gateway process.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RouteDescriptor {
    /// Unique, stable backend name
    pub name: String,

    /// Executable plus leading arguments, parsed with shell-words.
    /// The supervisor appends `--host`, `--port`, `--log-level` and
    /// `--log-config` when launching.
    pub command: String,

    /// Address the backend listens on (default: 127.0.0.1)
    #[serde(default = "default_backend_host")]
    pub host: String,

    /// Port the backend listens on
    pub port: u16,

    /// Path prefix owned by this backend. `None` means "ask the backend
    /// via `--describe` before launch"; an empty string after
    /// normalization marks the default/catch-all route.
    #[serde(default)]
    pub prefix: Option<String>,

    /// Log file for this backend (default: logs/{name}.log)
    pub log_target: Option<String>,

    /// Extra arguments appended to the launch command
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl RouteDescriptor {
    /// The log file path for this backend
    pub fn log_file(&self) -> String {
        self.log_target
            .clone()
            .unwrap_or_else(|| format!("logs/{}.log", self.name))
    }

    /// The backend's base address as `host:port`
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Whether this descriptor is the default/catch-all route.
    /// Only meaningful after prefix resolution.
    pub fn is_default(&self) -> bool {
        matches!(self.prefix.as_deref(), Some(""))
    }

    fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("router requires a non-empty 'name' field".to_string());
        }
        if self.command.trim().is_empty() {
            return Err(format!(
                "router '{}': 'command' must not be empty",
                self.name
            ));
        }
        if self.port == 0 {
            return Err(format!(
                "router '{}': 'port' must be greater than 0",
                self.name
            ));
        }
        Ok(())
    }
}

/// Normalize a raw prefix string.
///
/// Empty or "/" becomes "" (the default route). Anything else gets
/// exactly one leading slash and no trailing slash.
pub fn normalize_prefix(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "/" {
        return String::new();
    }
    let mut prefix = format!("/{}", trimmed.trim_start_matches('/'));
    while prefix.len() > 1 && prefix.ends_with('/') {
        prefix.pop();
    }
    prefix
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, GatewayError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let mut config: Config = serde_json::from_str(&content)
            .map_err(|e| GatewayError::Config(format!("malformed {}: {}", path.display(), e)))?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Normalize all explicitly configured prefixes in place
    fn normalize(&mut self) {
        for router in &mut self.routers {
            if let Some(raw) = router.prefix.take() {
                router.prefix = Some(normalize_prefix(&raw));
            }
        }
    }

    /// Validate required fields and whatever prefixes are already known
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.routers.is_empty() {
            return Err(GatewayError::Config(
                "configuration contains no routers".to_string(),
            ));
        }

        let mut errors = Vec::new();
        let mut names = HashSet::new();
        for router in &self.routers {
            if let Err(e) = router.validate() {
                errors.push(e);
            }
            if !names.insert(router.name.as_str()) {
                errors.push(format!("duplicate router name '{}'", router.name));
            }
        }
        if !errors.is_empty() {
            return Err(GatewayError::Config(format!(
                "configuration errors:\n  - {}",
                errors.join("\n  - ")
            )));
        }

        validate_prefixes(&self.routers)
    }
}

/// Enforce the routing invariant: at most one default (root) prefix, all
/// other prefixes unique and non-empty. Descriptors whose prefix is still
/// unresolved are skipped.
pub fn validate_prefixes(routers: &[RouteDescriptor]) -> Result<(), GatewayError> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut default_owner: Option<&str> = None;

    for router in routers {
        let Some(prefix) = router.prefix.as_deref() else {
            continue;
        };
        if prefix.is_empty() {
            if let Some(owner) = default_owner {
                return Err(GatewayError::Config(format!(
                    "routers '{}' and '{}' both claim the default route",
                    owner, router.name
                )));
            }
            default_owner = Some(&router.name);
        } else if !seen.insert(prefix) {
            return Err(GatewayError::Config(format!(
                "prefix '{}' is claimed by more than one router",
                prefix
            )));
        }
    }
    Ok(())
}

/// Resolve every unset prefix by asking the backend to describe itself.
///
/// The backend's launch command is run once with a single `--describe`
/// argument and is expected to print a JSON document containing a
/// `prefix` field. Failures are not fatal: the descriptor falls back to
/// the root prefix with a warning. Runs once at startup, before any
/// backend process is launched.
pub async fn resolve_prefixes(routers: &mut [RouteDescriptor]) {
    for router in routers.iter_mut() {
        if router.prefix.is_some() {
            continue;
        }
        let prefix = match describe_prefix(router).await {
            Ok(raw) => {
                let normalized = normalize_prefix(&raw);
                debug!(router = %router.name, prefix = %normalized, "Resolved prefix via --describe");
                normalized
            }
            Err(e) => {
                warn!(
                    router = %router.name,
                    error = %e,
                    "Failed to resolve prefix, defaulting to root"
                );
                String::new()
            }
        };
        router.prefix = Some(prefix);
    }
}

async fn describe_prefix(router: &RouteDescriptor) -> anyhow::Result<String> {
    let argv = shell_words::split(&router.command)
        .map_err(|e| anyhow::anyhow!("invalid launch command: {}", e))?;
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| anyhow::anyhow!("empty launch command"))?;

    let output = tokio::time::timeout(
        DESCRIBE_TIMEOUT,
        Command::new(program)
            .args(args)
            .arg("--describe")
            .stdin(Stdio::null())
            .output(),
    )
    .await
    .map_err(|_| anyhow::anyhow!("--describe timed out"))??;

    if !output.status.success() {
        anyhow::bail!("--describe exited with {}", output.status);
    }

    let doc: serde_json::Value = serde_json::from_slice(&output.stdout)?;
    doc.get("prefix")
        .and_then(|v| v.as_str())
        .map(String::from)
        .ok_or_else(|| anyhow::anyhow!("--describe output has no 'prefix' field"))
}

// Default value functions
fn default_gateway_host() -> String {
    "0.0.0.0".to_string()
}

fn default_gateway_port() -> u16 {
    8000
}

fn default_workers() -> usize {
    4
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_backend_host() -> String {
    "127.0.0.1".to_string()
}
