//! Configuration management.
//!
//! Supports configuration from:
//! - TOML config files
//! - Environment variables (`OFCTL_*`)
//! - CLI arguments (for the `ofctl` binary)

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{OfError, Result};

/// Default OpenFlow listening ports (legacy and IANA)
pub const DEFAULT_PORTS: [u16; 2] = [6633, 6653];

/// Minimum keystore / truststore password length
pub const MIN_KS_LENGTH: usize = 6;

/// Dispatch lanes per connection
pub const DISPATCH_LANES: usize = 8;

/// Lane for everything no classifier claims
pub const DEFAULT_LANE: usize = DISPATCH_LANES - 1;

/// Messages taken from a lane per consumer pass unless configured
pub const DEFAULT_BULK_SIZE: usize = 100;

/// Main configuration struct
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Listener and timer settings
    #[serde(default)]
    pub openflow: OpenFlowConfig,

    /// TLS material
    #[serde(default)]
    pub tls: TlsConfig,

    /// Dispatch queue and stats accumulator bounds
    #[serde(default)]
    pub dispatch: DispatchConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path)
            .map_err(|e| OfError::Config(format!("Failed to read config file: {e}")))?;

        toml::from_str(&content)
            .map_err(|e| OfError::Config(format!("Failed to parse config: {e}")))
    }

    /// Default config file location
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("ofctl").join("config.toml"))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(ports) = std::env::var("OFCTL_PORTS") {
            let parsed: Vec<u16> = ports
                .split(',')
                .filter_map(|p| p.trim().parse().ok())
                .collect();
            if !parsed.is_empty() {
                config.openflow.ports = parsed;
            }
        }
        if let Ok(val) = std::env::var("OFCTL_WORKER_THREADS") {
            if let Ok(val) = val.parse() {
                config.openflow.worker_threads = val;
            }
        }

        if let Ok(mode) = std::env::var("OFCTL_TLS_MODE") {
            if let Ok(mode) = mode.parse() {
                config.tls.mode = mode;
            }
        }
        if let Ok(path) = std::env::var("OFCTL_KEYSTORE") {
            config.tls.keystore = Some(PathBuf::from(path));
        }
        if let Ok(pw) = std::env::var("OFCTL_KEYSTORE_PASSWORD") {
            config.tls.keystore_password = Some(pw);
        }
        if let Ok(path) = std::env::var("OFCTL_TRUSTSTORE") {
            config.tls.truststore = Some(PathBuf::from(path));
        }
        if let Ok(pw) = std::env::var("OFCTL_TRUSTSTORE_PASSWORD") {
            config.tls.truststore_password = Some(pw);
        }

        config
    }

    /// Replace the listening ports
    pub fn with_ports(mut self, ports: impl Into<Vec<u16>>) -> Self {
        self.openflow.ports = ports.into();
        self
    }

    /// Set the I/O worker thread count (0 = automatic)
    pub fn with_worker_threads(mut self, n: usize) -> Self {
        self.openflow.worker_threads = n;
        self
    }

    /// Set the handshake completion timeout
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.openflow.handshake_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the idle tick interval and read timeout
    pub fn with_idle(mut self, interval: Duration, read_timeout: Duration) -> Self {
        self.openflow.idle_interval_ms = interval.as_millis() as u64;
        self.openflow.read_timeout_ms = read_timeout.as_millis() as u64;
        self
    }

    /// Set the dispatch queue capacity
    pub fn with_queue_size(mut self, size: usize) -> Self {
        self.dispatch.queue_size = size;
        self
    }

    /// Set the capacity of a priority lane (0 disables it)
    pub fn with_lane_size(mut self, lane: usize, size: usize) -> Self {
        if lane < DEFAULT_LANE {
            if self.dispatch.lane_sizes.len() <= lane {
                self.dispatch.lane_sizes.resize(lane + 1, 0);
            }
            self.dispatch.lane_sizes[lane] = size;
        } else {
            self.dispatch.queue_size = size;
        }
        self
    }

    /// Whether switching to `other` needs the listeners rebuilt.
    pub fn requires_restart(&self, other: &Config) -> bool {
        self.openflow.ports != other.openflow.ports
            || self.openflow.bind_address != other.openflow.bind_address
            || self.openflow.worker_threads != other.openflow.worker_threads
            || self.tls != other.tls
    }
}

/// Listener and timer configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenFlowConfig {
    /// Ports to listen on, in order
    pub ports: Vec<u16>,

    /// Address to bind the listeners to
    pub bind_address: String,

    /// I/O worker threads (0 = one per core)
    pub worker_threads: usize,

    /// Disconnect if the handshake has not completed after this long
    pub handshake_timeout_ms: u64,

    /// Read inactivity that counts as one idle tick
    pub idle_interval_ms: u64,

    /// Idle ticks between keep-alive echoes
    pub max_idle_retry: u32,

    /// Disconnect after this long without reading anything
    pub read_timeout_ms: u64,

    /// Give up on meter features after this long
    pub meter_timeout_ms: u64,

    /// Pending role requests expire after this long
    pub role_timeout_ms: u64,
}

impl Default for OpenFlowConfig {
    fn default() -> Self {
        Self {
            ports: DEFAULT_PORTS.to_vec(),
            bind_address: "0.0.0.0".to_string(),
            worker_threads: 0,
            handshake_timeout_ms: 60_000,
            idle_interval_ms: 5_000,
            max_idle_retry: 4,
            read_timeout_ms: 30_000,
            meter_timeout_ms: 60_000,
            role_timeout_ms: 60_000,
        }
    }
}

impl OpenFlowConfig {
    /// Handshake timeout
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Idle tick interval
    pub fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.idle_interval_ms.max(1))
    }

    /// Read timeout
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Meter features timeout
    pub fn meter_timeout(&self) -> Duration {
        Duration::from_millis(self.meter_timeout_ms)
    }

    /// Role request expiry
    pub fn role_timeout(&self) -> Duration {
        Duration::from_millis(self.role_timeout_ms)
    }
}

/// How TLS is applied to accepted connections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    /// Plain TCP
    #[default]
    Disabled,
    /// Mutual TLS against the truststore
    Enabled,
    /// Mutual TLS plus per-dpid certificate pinning
    Strict,
}

impl std::str::FromStr for TlsMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "disabled" | "off" | "false" => Ok(Self::Disabled),
            "enabled" | "on" | "true" => Ok(Self::Enabled),
            "strict" => Ok(Self::Strict),
            _ => Err(format!("Unknown TLS mode: {s}")),
        }
    }
}

/// TLS material.
///
/// The keystore is a PEM file with the controller certificate chain and
/// private key; the truststore is a PEM bundle of CA certificates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Requested mode
    pub mode: TlsMode,
    /// Keystore path
    pub keystore: Option<PathBuf>,
    /// Keystore password
    pub keystore_password: Option<String>,
    /// Truststore path
    pub truststore: Option<PathBuf>,
    /// Truststore password
    pub truststore_password: Option<String>,
    /// Strict mode: dpid (colon hex) to pinned device certificate (PEM)
    pub pinned_certificates: HashMap<String, PathBuf>,
}

impl TlsConfig {
    /// All four parameters present and both passwords long enough.
    pub fn is_complete(&self) -> bool {
        let long_enough =
            |pw: &Option<String>| pw.as_ref().is_some_and(|p| p.len() >= MIN_KS_LENGTH);
        self.keystore.is_some()
            && self.truststore.is_some()
            && long_enough(&self.keystore_password)
            && long_enough(&self.truststore_password)
    }

    /// Mode actually applied: incomplete material disables TLS.
    pub fn effective_mode(&self) -> TlsMode {
        if self.mode == TlsMode::Disabled {
            return TlsMode::Disabled;
        }
        if !self.is_complete() {
            tracing::warn!(
                "TLS mode {:?} requested but keystore/truststore parameters are missing or \
                 passwords are shorter than {} characters; TLS disabled",
                self.mode,
                MIN_KS_LENGTH
            );
            return TlsMode::Disabled;
        }
        self.mode
    }
}

/// Dispatch configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Capacity of the default lane per connection
    pub queue_size: usize,

    /// Capacities of the priority lanes `0..DEFAULT_LANE` (0 disables a lane)
    pub lane_sizes: Vec<usize>,

    /// Messages taken from each lane per consumer pass, indexed by lane
    pub bulk_sizes: Vec<usize>,

    /// Fragments a multi-part reply may span
    pub max_stats_fragments: usize,

    /// Bytes a multi-part reply may accumulate
    pub max_stats_bytes: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            queue_size: 5000,
            lane_sizes: vec![1000, 0, 0, 0, 0, 0, 0],
            bulk_sizes: vec![DEFAULT_BULK_SIZE; DISPATCH_LANES],
            max_stats_fragments: 1024,
            max_stats_bytes: 16 * 1024 * 1024, // 16 MB
        }
    }
}

impl DispatchConfig {
    /// Capacity of `lane`; 0 means the lane is not created.
    pub fn lane_capacity(&self, lane: usize) -> usize {
        if lane >= DEFAULT_LANE {
            return self.queue_size;
        }
        self.lane_sizes.get(lane).copied().unwrap_or(0)
    }

    /// Per-pass batch size of `lane`.
    pub fn bulk_size(&self, lane: usize) -> usize {
        match self.bulk_sizes.get(lane) {
            Some(&bulk) if bulk > 0 => bulk,
            _ => DEFAULT_BULK_SIZE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete_tls() -> TlsConfig {
        TlsConfig {
            mode: TlsMode::Enabled,
            keystore: Some(PathBuf::from("/etc/ofctl/keystore.pem")),
            keystore_password: Some("secret1".to_string()),
            truststore: Some(PathBuf::from("/etc/ofctl/truststore.pem")),
            truststore_password: Some("secret2".to_string()),
            pinned_certificates: HashMap::new(),
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.openflow.ports, vec![6633, 6653]);
        assert_eq!(config.openflow.worker_threads, 0);
        assert_eq!(config.openflow.handshake_timeout(), Duration::from_secs(60));
        assert_eq!(config.dispatch.queue_size, 5000);
        assert_eq!(config.tls.effective_mode(), TlsMode::Disabled);
    }

    #[test]
    fn test_tls_enabled_when_complete() {
        assert_eq!(complete_tls().effective_mode(), TlsMode::Enabled);

        let strict = TlsConfig {
            mode: TlsMode::Strict,
            ..complete_tls()
        };
        assert_eq!(strict.effective_mode(), TlsMode::Strict);
    }

    #[test]
    fn test_tls_disabled_when_incomplete() {
        let missing_truststore = TlsConfig {
            truststore: None,
            ..complete_tls()
        };
        assert_eq!(missing_truststore.effective_mode(), TlsMode::Disabled);

        let short_password = TlsConfig {
            keystore_password: Some("12345".to_string()),
            ..complete_tls()
        };
        assert!(!short_password.is_complete());
        assert_eq!(short_password.effective_mode(), TlsMode::Disabled);

        let no_password = TlsConfig {
            truststore_password: None,
            ..complete_tls()
        };
        assert_eq!(no_password.effective_mode(), TlsMode::Disabled);
    }

    #[test]
    fn test_config_from_toml() {
        let toml = r#"
            [openflow]
            ports = [6653]
            worker_threads = 4
            handshake_timeout_ms = 15000

            [tls]
            mode = "strict"
            keystore = "/k.pem"
            keystore_password = "password"

            [dispatch]
            queue_size = 10
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.openflow.ports, vec![6653]);
        assert_eq!(config.openflow.worker_threads, 4);
        assert_eq!(config.openflow.handshake_timeout(), Duration::from_secs(15));
        // Unspecified fields keep their defaults.
        assert_eq!(config.openflow.max_idle_retry, 4);
        assert_eq!(config.tls.mode, TlsMode::Strict);
        assert_eq!(config.tls.effective_mode(), TlsMode::Disabled);
        assert_eq!(config.dispatch.queue_size, 10);
        assert_eq!(config.dispatch.max_stats_fragments, 1024);
    }

    #[test]
    fn test_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[openflow]\nports = [7000, 7001]\n").unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.openflow.ports, vec![7000, 7001]);

        std::fs::write(&path, "[openflow\n").unwrap();
        assert!(Config::from_file(&path).is_err());
    }

    #[test]
    fn test_requires_restart() {
        let base = Config::default();
        assert!(!base.requires_restart(&base.clone().with_queue_size(10)));
        assert!(base.requires_restart(&base.clone().with_ports(vec![6653])));
        assert!(base.requires_restart(&base.clone().with_worker_threads(2)));
    }

    #[test]
    fn test_dispatch_lanes() {
        let dispatch = DispatchConfig::default();
        assert_eq!(dispatch.lane_capacity(0), 1000);
        assert_eq!(dispatch.lane_capacity(3), 0);
        assert_eq!(dispatch.lane_capacity(DEFAULT_LANE), 5000);
        assert_eq!(dispatch.bulk_size(DEFAULT_LANE), DEFAULT_BULK_SIZE);

        let config = Config::default().with_lane_size(2, 64).with_lane_size(DEFAULT_LANE, 10);
        assert_eq!(config.dispatch.lane_capacity(2), 64);
        assert_eq!(config.dispatch.queue_size, 10);

        let toml = r#"
            [dispatch]
            lane_sizes = [10]
            bulk_sizes = [5, 0]
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.dispatch.lane_capacity(0), 10);
        assert_eq!(config.dispatch.lane_capacity(1), 0);
        assert_eq!(config.dispatch.bulk_size(0), 5);
        assert_eq!(config.dispatch.bulk_size(1), DEFAULT_BULK_SIZE);
        assert!(!Config::default().requires_restart(&config));
    }

    #[test]
    fn test_tls_mode_parse() {
        assert_eq!("STRICT".parse::<TlsMode>().unwrap(), TlsMode::Strict);
        assert_eq!("enabled".parse::<TlsMode>().unwrap(), TlsMode::Enabled);
        assert!("maybe".parse::<TlsMode>().is_err());
    }
}
