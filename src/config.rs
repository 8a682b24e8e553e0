use crate::backend::{BackendHandle, BackendPool};
use crate::error::ConfigError;
use crate::strategy::LoadBalanceStrategy;
use hyper::http::uri::Authority;
use serde::Deserialize;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration for the front door
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener and forwarding settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Backend pool definition
    #[serde(default)]
    pub pool: PoolSection,

    /// Background health monitor
    #[serde(default)]
    pub monitor: MonitorConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Listen port (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Path answered directly without contacting a backend (default: /health)
    #[serde(default = "default_liveness_path")]
    pub liveness_path: String,

    /// Per-request forwarding timeout in seconds. No timeout when unset.
    pub request_timeout_secs: Option<u64>,

    /// Maximum idle connections per backend host (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }

    /// True when `handle` would connect back to this listener
    fn is_own_listener(&self, handle: &BackendHandle) -> bool {
        let authority = handle.authority();
        if authority.port_u16() != Some(self.port) {
            return false;
        }

        let host = authority.host();
        if host.eq_ignore_ascii_case(&self.bind) {
            return true;
        }

        let bind_local = match parse_host_ip(&self.bind) {
            Some(ip) => ip.is_unspecified() || ip.is_loopback(),
            None => self.bind.eq_ignore_ascii_case("localhost"),
        };
        let backend_local = match parse_host_ip(host) {
            Some(ip) => ip.is_unspecified() || ip.is_loopback(),
            None => host.eq_ignore_ascii_case("localhost"),
        };
        bind_local && backend_local
    }
}

fn parse_host_ip(host: &str) -> Option<IpAddr> {
    host.trim_start_matches('[').trim_end_matches(']').parse().ok()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            liveness_path: default_liveness_path(),
            request_timeout_secs: None,
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

/// Backend pool definition.
///
/// Either list every backend in `addresses`, or give `instance_count` and let
/// instance `i` resolve to `host:(base_port + i)`.
#[derive(Debug, Deserialize, Clone)]
pub struct PoolSection {
    /// Number of backend instances (N)
    pub instance_count: Option<usize>,

    /// Host shared by all instances when `addresses` is empty
    #[serde(default = "default_backend_host")]
    pub host: String,

    /// Port of instance 0 when `addresses` is empty
    #[serde(default = "default_base_port")]
    pub base_port: u16,

    /// Explicit `host:port` for each instance
    #[serde(default)]
    pub addresses: Vec<String>,

    /// Selection policy: "random" (default) or "round-robin"
    #[serde(default)]
    pub strategy: LoadBalanceStrategy,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            instance_count: None,
            host: default_backend_host(),
            base_port: default_base_port(),
            addresses: Vec::new(),
            strategy: LoadBalanceStrategy::default(),
        }
    }
}

impl PoolSection {
    /// Resolve the configured instances into backend handles
    pub fn resolve(&self) -> Result<Vec<BackendHandle>, ConfigError> {
        if !self.addresses.is_empty() {
            if let Some(count) = self.instance_count {
                if count != self.addresses.len() {
                    return Err(ConfigError::CountMismatch {
                        instance_count: count,
                        addresses: self.addresses.len(),
                    });
                }
            }

            return self
                .addresses
                .iter()
                .enumerate()
                .map(|(index, addr)| parse_handle(index, addr))
                .collect();
        }

        let count = self.instance_count.unwrap_or(0);
        (0..count)
            .map(|index| {
                let port = u16::try_from(index)
                    .ok()
                    .and_then(|offset| self.base_port.checked_add(offset))
                    .filter(|port| *port > 0)
                    .ok_or(ConfigError::PortOutOfRange {
                        base_port: self.base_port,
                        index,
                    })?;
                parse_handle(index, &format!("{}:{}", self.host, port))
            })
            .collect()
    }

    /// Build the immutable pool. Fails when no instance is configured.
    pub fn build(&self) -> Result<BackendPool, ConfigError> {
        BackendPool::new(self.resolve()?)
    }
}

fn parse_handle(index: usize, addr: &str) -> Result<BackendHandle, ConfigError> {
    let authority: Authority = addr.parse().map_err(|_| ConfigError::InvalidAddress {
        index,
        address: addr.to_string(),
    })?;

    if authority.port_u16().is_none() {
        return Err(ConfigError::InvalidAddress {
            index,
            address: addr.to_string(),
        });
    }

    Ok(BackendHandle::new(index, authority))
}

/// Settings for the background health monitor
#[derive(Debug, Deserialize, Clone)]
pub struct MonitorConfig {
    /// Run the monitor (default: false)
    #[serde(default)]
    pub enabled: bool,

    /// Milliseconds between probe rounds
    #[serde(default = "default_monitor_interval")]
    pub interval_ms: u64,

    /// Milliseconds before a single probe is counted as failed
    #[serde(default = "default_monitor_timeout")]
    pub timeout_ms: u64,

    /// Path probed on each backend
    #[serde(default = "default_ping_path")]
    pub ping_path: String,

    /// Consecutive failures before a backend is reported unhealthy
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Consecutive successes before a backend is reported healthy again
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
}

impl MonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_ms: default_monitor_interval(),
            timeout_ms: default_monitor_timeout(),
            ping_path: default_ping_path(),
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
        }
    }
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    8080
}

fn default_liveness_path() -> String {
    "/health".to_string()
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_backend_host() -> String {
    "127.0.0.1".to_string()
}

fn default_base_port() -> u16 {
    8080 // port the container image listens on
}

fn default_monitor_interval() -> u64 {
    5000
}

fn default_monitor_timeout() -> u64 {
    2000
}

fn default_ping_path() -> String {
    "/".to_string()
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_success_threshold() -> u32 {
    1
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration, reporting every problem at once
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if !self.server.liveness_path.starts_with('/') {
            errors.push(format!(
                "server.liveness_path '{}' must start with '/'",
                self.server.liveness_path
            ));
        }

        if self.server.request_timeout_secs == Some(0) {
            errors.push("server.request_timeout_secs must be greater than 0".to_string());
        }

        match self.pool.resolve() {
            Ok(handles) if handles.is_empty() => {
                errors.push(format!("pool: {}", ConfigError::EmptyPool));
            }
            Ok(handles) => {
                for handle in handles.iter().filter(|h| self.server.is_own_listener(h)) {
                    errors.push(format!(
                        "pool: backend {} is the front door's own listener ({}:{})",
                        handle, self.server.bind, self.server.port
                    ));
                }
            }
            Err(e) => errors.push(format!("pool: {}", e)),
        }

        if self.monitor.enabled {
            if self.monitor.interval_ms == 0 {
                errors.push("monitor.interval_ms must be greater than 0".to_string());
            }
            if self.monitor.timeout_ms == 0 {
                errors.push("monitor.timeout_ms must be greater than 0".to_string());
            }
            if self.monitor.failure_threshold == 0 || self.monitor.success_threshold == 0 {
                errors.push("monitor thresholds must be greater than 0".to_string());
            }
            if !self.monitor.ping_path.starts_with('/') {
                errors.push(format!(
                    "monitor.ping_path '{}' must start with '/'",
                    self.monitor.ping_path
                ));
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
bind = "127.0.0.1"
port = 9000
liveness_path = "/healthz"
request_timeout_secs = 15

[pool]
instance_count = 5
host = "10.0.0.7"
base_port = 8080
strategy = "round-robin"

[monitor]
enabled = true
interval_ms = 1000
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.liveness_path, "/healthz");
        assert_eq!(config.server.request_timeout(), Some(Duration::from_secs(15)));
        assert_eq!(config.pool.instance_count, Some(5));
        assert_eq!(config.pool.strategy, LoadBalanceStrategy::RoundRobin);
        assert!(config.monitor.enabled);
        assert_eq!(config.monitor.interval(), Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_server_config() {
        let config = ServerConfig::default();
        assert_eq!(config.bind, "0.0.0.0");
        assert_eq!(config.port, 8080);
        assert_eq!(config.liveness_path, "/health");
        assert_eq!(config.request_timeout(), None);
        assert_eq!(config.pool_max_idle_per_host, 10);
        assert_eq!(config.pool_idle_timeout_secs, 90);
    }

    #[test]
    fn test_default_monitor_config() {
        let config = MonitorConfig::default();
        assert!(!config.enabled);
        assert_eq!(config.interval(), Duration::from_secs(5));
        assert_eq!(config.timeout(), Duration::from_secs(2));
        assert_eq!(config.ping_path, "/");
        assert_eq!(config.failure_threshold, 3);
        assert_eq!(config.success_threshold, 1);
    }

    #[test]
    fn test_resolve_from_instance_count() {
        let toml = r#"
instance_count = 3
host = "backend.internal"
base_port = 9100
"#;
        let pool: PoolSection = toml::from_str(toml).unwrap();
        let handles = pool.resolve().unwrap();

        let addrs: Vec<String> = handles.iter().map(|h| h.authority().to_string()).collect();
        assert_eq!(
            addrs,
            vec!["backend.internal:9100", "backend.internal:9101", "backend.internal:9102"]
        );
        assert_eq!(handles[2].index(), 2);
    }

    #[test]
    fn test_resolve_explicit_addresses() {
        let toml = r#"
addresses = ["10.0.0.1:8080", "10.0.0.2:8080"]
"#;
        let pool: PoolSection = toml::from_str(toml).unwrap();
        let built = pool.build().unwrap();
        assert_eq!(built.len(), 2);
        assert_eq!(built.get(1).unwrap().authority().as_str(), "10.0.0.2:8080");
    }

    #[test]
    fn test_explicit_addresses_must_match_count() {
        let toml = r#"
instance_count = 3
addresses = ["10.0.0.1:8080", "10.0.0.2:8080"]
"#;
        let pool: PoolSection = toml::from_str(toml).unwrap();
        let err = pool.resolve().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::CountMismatch {
                instance_count: 3,
                addresses: 2
            }
        ));
    }

    #[test]
    fn test_address_requires_port() {
        let toml = r#"
addresses = ["10.0.0.1"]
"#;
        let pool: PoolSection = toml::from_str(toml).unwrap();
        assert!(matches!(
            pool.resolve().unwrap_err(),
            ConfigError::InvalidAddress { index: 0, .. }
        ));
    }

    #[test]
    fn test_port_overflow_rejected() {
        let pool = PoolSection {
            instance_count: Some(3),
            base_port: 65534,
            ..PoolSection::default()
        };
        assert!(matches!(
            pool.resolve().unwrap_err(),
            ConfigError::PortOutOfRange { index: 2, .. }
        ));
    }

    #[test]
    fn test_empty_config_refuses_to_start() {
        let config: Config = toml::from_str("").unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("pool"));
        assert!(err.contains("at least one backend"));
    }

    #[test]
    fn test_zero_instance_count_refuses_to_start() {
        let config: Config = toml::from_str("[pool]\ninstance_count = 0\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_multiple_errors() {
        let toml = r#"
[server]
liveness_path = "health"
request_timeout_secs = 0

[monitor]
enabled = true
failure_threshold = 0
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();

        assert!(err.contains("liveness_path 'health' must start with '/'"));
        assert!(err.contains("request_timeout_secs must be greater than 0"));
        assert!(err.contains("at least one backend"));
        assert!(err.contains("thresholds must be greater than 0"));
    }

    #[test]
    fn test_monitor_settings_ignored_when_disabled() {
        let toml = r#"
[pool]
instance_count = 1
base_port = 9000

[monitor]
interval_ms = 0
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frontdoor.toml");
        std::fs::write(&path, "[pool]\ninstance_count = 5\nbase_port = 9000\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.pool.build().unwrap().len(), 5);
        assert_eq!(config.pool.strategy, LoadBalanceStrategy::Random);
    }

    #[test]
    fn test_shipped_config_is_valid() {
        let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("frontdoor.toml");
        let config = Config::load(&path).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.pool.build().unwrap().len(), 5);
    }

    #[test]
    fn test_backend_on_own_listener_refused() {
        // Defaults put instance 0 on 127.0.0.1:8080 while listening on 0.0.0.0:8080
        let config: Config = toml::from_str("[pool]\ninstance_count = 1\n").unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("127.0.0.1:8080"), "{}", err);
        assert!(err.contains("own listener"), "{}", err);
    }

    #[test]
    fn test_own_listener_detection() {
        let server = ServerConfig::default();
        let handle = |addr: &str| BackendHandle::new(0, addr.parse().unwrap());

        assert!(server.is_own_listener(&handle("127.0.0.1:8080")));
        assert!(server.is_own_listener(&handle("localhost:8080")));
        assert!(server.is_own_listener(&handle("[::1]:8080")));
        assert!(server.is_own_listener(&handle("0.0.0.0:8080")));
        assert!(!server.is_own_listener(&handle("127.0.0.1:8081")));
        assert!(!server.is_own_listener(&handle("10.0.0.5:8080")));

        let server = ServerConfig {
            bind: "10.0.0.5".to_string(),
            ..ServerConfig::default()
        };
        assert!(server.is_own_listener(&handle("10.0.0.5:8080")));
        assert!(!server.is_own_listener(&handle("127.0.0.1:8080")));
    }

    #[test]
    fn test_later_backend_on_own_listener_refused() {
        let toml = r#"
[server]
port = 9001

[pool]
instance_count = 3
base_port = 9000
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("#1 (127.0.0.1:9001)"), "{}", err);
    }
}
