//! Service configuration
//!
//! Read from a TOML file; every key is optional.
//!
//! ```toml
//! [service]
//! adapter_name = "tunwarden"
//! tunnel_type = "WireGuard"
//! endpoint = "/run/tunwarden/tunwarden.sock"
//! driver = "native"          # or "memory"
//! # driver_path = "C:/Program Files/tunwarden/wireguard.dll"
//!
//! [watchdog]
//! interval_secs = 5
//! timeout_secs = 60
//!
//! [timeouts]
//! driver_call_secs = 10
//! route_op_secs = 10
//! request_read_secs = 5
//!
//! [logging]
//! level = "info"
//! format = "pretty"
//! ```

use crate::adapter::DEFAULT_TUNNEL_TYPE;
use crate::error::{TunnelError, TunnelResult};
use crate::server::DEFAULT_ENDPOINT;
use crate::watchdog::WatchdogConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default adapter name
pub const DEFAULT_ADAPTER_NAME: &str = "tunwarden";

/// Which driver back-end to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    /// The platform tunnel driver
    #[default]
    Native,
    /// In-process simulation; touches nothing on the host
    Memory,
}

/// Runtime service configuration
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Adapter name
    pub adapter_name: String,
    /// Tunnel type string passed to the driver
    pub tunnel_type: String,
    /// Socket path or pipe name of the command channel
    pub endpoint: String,
    /// Driver back-end
    pub driver: DriverKind,
    /// Explicit driver library path (Windows)
    pub driver_path: Option<PathBuf>,
    /// Liveness watchdog
    pub watchdog: WatchdogConfig,
    /// Limit on each driver call
    pub driver_call_timeout: Duration,
    /// Limit on each route / DNS / address change
    pub route_op_timeout: Duration,
    /// Limit on reading a client request
    pub request_read_timeout: Duration,
    /// Log level
    pub log_level: String,
    /// Log format (`pretty` or `compact`)
    pub log_format: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            adapter_name: DEFAULT_ADAPTER_NAME.to_string(),
            tunnel_type: DEFAULT_TUNNEL_TYPE.to_string(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            driver: DriverKind::Native,
            driver_path: None,
            watchdog: WatchdogConfig::default(),
            driver_call_timeout: Duration::from_secs(default_driver_call_secs()),
            route_op_timeout: Duration::from_secs(default_route_op_secs()),
            request_read_timeout: Duration::from_secs(default_request_read_secs()),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl ServiceConfig {
    /// Load from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> TunnelResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            TunnelError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    /// Load from a file if given, otherwise use defaults
    pub fn load(path: Option<&Path>) -> TunnelResult<Self> {
        match path {
            Some(p) => Self::from_file(p),
            None => Ok(Self::default()),
        }
    }

    /// Parse TOML text
    pub fn from_toml(content: &str) -> TunnelResult<Self> {
        let file: ServiceConfigFile =
            toml::from_str(content).map_err(|e| TunnelError::Config(e.to_string()))?;
        file.try_into()
    }
}

/// TOML-deserializable service configuration file format
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfigFile {
    /// `[service]`
    #[serde(default)]
    pub service: ServiceSection,
    /// `[watchdog]`
    #[serde(default)]
    pub watchdog: WatchdogSection,
    /// `[timeouts]`
    #[serde(default)]
    pub timeouts: TimeoutsSection,
    /// `[logging]`
    #[serde(default)]
    pub logging: LoggingSection,
}

/// The `[service]` section
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceSection {
    /// Adapter name (default: "tunwarden")
    #[serde(default = "default_adapter_name")]
    pub adapter_name: String,

    /// Tunnel type (default: "WireGuard")
    #[serde(default = "default_tunnel_type")]
    pub tunnel_type: String,

    /// Command channel endpoint
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Driver back-end (default: native)
    #[serde(default)]
    pub driver: DriverKind,

    /// Driver library path
    #[serde(default)]
    pub driver_path: Option<String>,
}

impl Default for ServiceSection {
    fn default() -> Self {
        Self {
            adapter_name: default_adapter_name(),
            tunnel_type: default_tunnel_type(),
            endpoint: default_endpoint(),
            driver: DriverKind::default(),
            driver_path: None,
        }
    }
}

/// The `[watchdog]` section
#[derive(Debug, Clone, Deserialize)]
pub struct WatchdogSection {
    /// Check interval in seconds (default: 5)
    #[serde(default = "default_watchdog_interval")]
    pub interval_secs: u64,

    /// Liveness timeout in seconds (default: 60)
    #[serde(default = "default_watchdog_timeout")]
    pub timeout_secs: u64,
}

impl Default for WatchdogSection {
    fn default() -> Self {
        Self {
            interval_secs: default_watchdog_interval(),
            timeout_secs: default_watchdog_timeout(),
        }
    }
}

/// The `[timeouts]` section
#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutsSection {
    /// Driver call limit in seconds (default: 10)
    #[serde(default = "default_driver_call_secs")]
    pub driver_call_secs: u64,

    /// Network change limit in seconds (default: 10)
    #[serde(default = "default_route_op_secs")]
    pub route_op_secs: u64,

    /// Request read limit in seconds (default: 5)
    #[serde(default = "default_request_read_secs")]
    pub request_read_secs: u64,
}

impl Default for TimeoutsSection {
    fn default() -> Self {
        Self {
            driver_call_secs: default_driver_call_secs(),
            route_op_secs: default_route_op_secs(),
            request_read_secs: default_request_read_secs(),
        }
    }
}

/// The `[logging]` section
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSection {
    /// Log level (default: "info")
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (default: "pretty")
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_adapter_name() -> String {
    DEFAULT_ADAPTER_NAME.to_string()
}
fn default_tunnel_type() -> String {
    DEFAULT_TUNNEL_TYPE.to_string()
}
fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}
fn default_watchdog_interval() -> u64 {
    5
}
fn default_watchdog_timeout() -> u64 {
    60
}
fn default_driver_call_secs() -> u64 {
    10
}
fn default_route_op_secs() -> u64 {
    10
}
fn default_request_read_secs() -> u64 {
    5
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "pretty".to_string()
}

fn nonzero(name: &str, secs: u64) -> TunnelResult<Duration> {
    if secs == 0 {
        return Err(TunnelError::Config(format!("{} must be greater than zero", name)));
    }
    Ok(Duration::from_secs(secs))
}

impl TryFrom<ServiceConfigFile> for ServiceConfig {
    type Error = TunnelError;

    fn try_from(file: ServiceConfigFile) -> Result<Self, Self::Error> {
        let name = file.service.adapter_name.trim();
        if name.is_empty() {
            return Err(TunnelError::Config("adapter_name must not be empty".into()));
        }

        let watchdog = WatchdogConfig {
            interval: nonzero("watchdog.interval_secs", file.watchdog.interval_secs)?,
            timeout: nonzero("watchdog.timeout_secs", file.watchdog.timeout_secs)?,
        };
        if watchdog.interval >= watchdog.timeout {
            tracing::warn!(
                "Watchdog interval {:?} is not shorter than its timeout {:?}",
                watchdog.interval,
                watchdog.timeout
            );
        }

        Ok(Self {
            adapter_name: name.to_string(),
            tunnel_type: file.service.tunnel_type,
            endpoint: file.service.endpoint,
            driver: file.service.driver,
            driver_path: file.service.driver_path.map(PathBuf::from),
            watchdog,
            driver_call_timeout: nonzero("timeouts.driver_call_secs", file.timeouts.driver_call_secs)?,
            route_op_timeout: nonzero("timeouts.route_op_secs", file.timeouts.route_op_secs)?,
            request_read_timeout: nonzero(
                "timeouts.request_read_secs",
                file.timeouts.request_read_secs,
            )?,
            log_level: file.logging.level,
            log_format: file.logging.format,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_gives_defaults() {
        let config = ServiceConfig::from_toml("").unwrap();
        assert_eq!(config.adapter_name, "tunwarden");
        assert_eq!(config.driver, DriverKind::Native);
        assert_eq!(config.watchdog.interval, Duration::from_secs(5));
        assert_eq!(config.watchdog.timeout, Duration::from_secs(60));
        assert_eq!(config.request_read_timeout, Duration::from_secs(5));
        assert_eq!(config.endpoint, DEFAULT_ENDPOINT);
    }

    #[test]
    fn test_parse_full_file() {
        let toml_str = r#"
[service]
adapter_name = "wg-office"
endpoint = "/tmp/tw.sock"
driver = "memory"
driver_path = "/opt/wireguard.dll"

[watchdog]
interval_secs = 2
timeout_secs = 30

[timeouts]
driver_call_secs = 3

[logging]
level = "debug"
format = "compact"
"#;
        let config = ServiceConfig::from_toml(toml_str).unwrap();
        assert_eq!(config.adapter_name, "wg-office");
        assert_eq!(config.endpoint, "/tmp/tw.sock");
        assert_eq!(config.driver, DriverKind::Memory);
        assert_eq!(config.driver_path, Some(PathBuf::from("/opt/wireguard.dll")));
        assert_eq!(config.watchdog.timeout, Duration::from_secs(30));
        assert_eq!(config.driver_call_timeout, Duration::from_secs(3));
        assert_eq!(config.route_op_timeout, Duration::from_secs(10));
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(ServiceConfig::from_toml("[watchdog]\ntimeout_secs = 0\n").is_err());
        assert!(ServiceConfig::from_toml("[service]\ndriver = \"fpga\"\n").is_err());
        assert!(ServiceConfig::from_toml("[service]\nadapter_name = \" \"\n").is_err());
        assert!(ServiceConfig::from_toml("[bogus]\nx = 1\n").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("service.toml");
        std::fs::write(&path, "[watchdog]\ninterval_secs = 1\n").unwrap();

        let config = ServiceConfig::load(Some(&path)).unwrap();
        assert_eq!(config.watchdog.interval, Duration::from_secs(1));
        assert!(ServiceConfig::load(Some(&dir.path().join("missing.toml"))).is_err());
        assert!(ServiceConfig::load(None).is_ok());
    }
}
