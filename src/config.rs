//! Configuration system for meshbench
//!
//! Supports multiple configuration sources with the following precedence (highest to lowest):
//! 1. CLI arguments
//! 2. Environment variables (MESHBENCH_* prefix)
//! 3. Configuration file (TOML)
//! 4. Default values

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::rendezvous::BarrierKind;
use crate::transport::{NativeMode, RetryPolicy, TransportKind};

/// Main benchmark configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchConfig {
    /// Cluster shape and rendezvous mode
    pub cluster: ClusterSettings,

    /// Listen address selection
    pub network: NetworkSettings,

    /// Transport variant and framing
    pub transport: TransportSettings,

    /// Payload and iteration settings
    pub exchange: ExchangeSettings,

    /// Retry and barrier timing
    pub timing: TimingSettings,

    /// Logging configuration
    pub logging: LoggingSettings,
}

/// Cluster shape and rendezvous mode
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSettings {
    /// Number of worker processes
    pub num_workers: usize,

    /// Connections each worker opens to every peer
    pub endpoints: usize,

    /// Monitor listen port (0 = shared-state rendezvous, no monitor)
    pub monitor_port: u16,

    /// Host the monitor listens on (defaults to the worker's own host)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monitor_host: Option<String>,

    /// Shared board file for shared-state rendezvous and port hand-off
    #[serde(skip_serializing_if = "Option::is_none")]
    pub board: Option<String>,
}

/// Listen address selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    /// Address to listen on and advertise
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    /// Network interface whose IPv4 address is advertised (used when host is unset)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,

    /// Worker listen port (0 = OS-assigned)
    pub listen_port: u16,
}

/// Transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    /// Transport variant: native, stream, buffered
    pub backend: TransportKind,

    /// Native engine mode: tag, am
    pub native_mode: NativeMode,

    /// Stream records smaller than this are sent in one write
    pub coalesce_threshold: usize,
}

/// Payload and iteration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeSettings {
    /// Bytes per payload
    pub payload_size: usize,

    /// Round trips per connection
    pub iterations: usize,

    /// Client sends before receiving (default: client receives first)
    pub client_sends_first: bool,

    /// Send and receive each iteration's payloads concurrently
    pub gather: bool,

    /// One untimed round trip per connection (default: native only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warmup: Option<bool>,
}

/// Retry and barrier timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingSettings {
    /// Delay between connect attempts in milliseconds
    pub connect_backoff_ms: u64,

    /// Give up connecting after this many milliseconds (0 = never)
    pub connect_max_wait_ms: u64,

    /// Discovery and connection barrier poll interval in milliseconds
    pub poll_interval_ms: u64,

    /// Completion barrier poll interval in milliseconds (0 = yield only)
    pub completion_poll_interval_ms: u64,

    /// Connection barrier strategy: poll, notify
    pub barrier: BarrierKind,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level: trace, debug, info, warn, error
    pub level: String,

    /// Log file path (empty = no file logging)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,

    /// Number of rotated log files to keep
    pub max_files: u32,

    /// Enable JSON formatted logging
    pub json_format: bool,
}

// Default implementations

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            num_workers: 2,
            endpoints: 1,
            monitor_port: 0,
            monitor_host: None,
            board: None,
        }
    }
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            host: None,
            interface: None,
            listen_port: 0,
        }
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            backend: TransportKind::Stream,
            native_mode: NativeMode::Tag,
            coalesce_threshold: crate::framing::DEFAULT_COALESCE_THRESHOLD,
        }
    }
}

impl Default for ExchangeSettings {
    fn default() -> Self {
        Self {
            payload_size: 1 << 20,
            iterations: 3,
            client_sends_first: false,
            gather: false,
            warmup: None,
        }
    }
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            connect_backoff_ms: 100,
            connect_max_wait_ms: 0, // Retry forever
            poll_interval_ms: 100,
            completion_poll_interval_ms: 0,
            barrier: BarrierKind::Poll,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            max_files: 5,
            json_format: false,
        }
    }
}

impl BenchConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::default();

        // 1. Load from config file if it exists
        let config_file = Self::find_config_file(config_path)?;
        if let Some(path) = config_file {
            debug!(path = %path.display(), "Loading configuration file");
            config = Self::parse_file(&path)?;
            info!(path = %path.display(), "Configuration loaded from file");
        }

        // 2. Apply environment variable overrides
        config.apply_env_overrides();

        // 3. Expand paths
        config.expand_paths();

        // 4. Validate
        config.validate()?;

        Ok(config)
    }

    /// Parse a TOML file without overrides or validation
    pub fn parse_file(path: &std::path::Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|source| Error::IoRead {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|e| Error::ConfigParse {
            message: format!("{}: {}", path.display(), e.message()),
            source: Some(e),
        })
    }

    /// Find the configuration file to use
    fn find_config_file(explicit_path: Option<&str>) -> Result<Option<PathBuf>> {
        // If explicit path provided, use it (error if not found)
        if let Some(path) = explicit_path {
            let path = PathBuf::from(expand_path(path));
            if path.exists() {
                return Ok(Some(path));
            }
            return Err(Error::ConfigNotFound { path });
        }

        // Search in standard locations
        let search_paths = [
            // Current directory
            Some(PathBuf::from("meshbench.toml")),
            // User config directory
            dirs::config_dir().map(|p| p.join("meshbench").join("config.toml")),
            // Home directory
            dirs::home_dir().map(|p| p.join(".meshbench").join("config.toml")),
            // System config (Linux)
            Some(PathBuf::from("/etc/meshbench/config.toml")),
        ];

        for path in search_paths.iter().flatten() {
            if path.exists() {
                debug!(path = %path.display(), "Found configuration file");
                return Ok(Some(path.clone()));
            }
        }

        debug!("No configuration file found, using defaults");
        Ok(None)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        // Cluster settings
        env_parse("MESHBENCH_WORKERS", &mut self.cluster.num_workers);
        env_parse("MESHBENCH_ENDPOINTS", &mut self.cluster.endpoints);
        env_parse("MESHBENCH_MONITOR_PORT", &mut self.cluster.monitor_port);
        if let Ok(val) = std::env::var("MESHBENCH_MONITOR_HOST") {
            self.cluster.monitor_host = Some(val);
        }
        if let Ok(val) = std::env::var("MESHBENCH_BOARD") {
            self.cluster.board = Some(val);
        }

        // Network settings
        if let Ok(val) = std::env::var("MESHBENCH_HOST") {
            self.network.host = Some(val);
        }
        if let Ok(val) = std::env::var("MESHBENCH_INTERFACE") {
            self.network.interface = Some(val);
        }
        env_parse("MESHBENCH_LISTEN_PORT", &mut self.network.listen_port);

        // Transport settings
        env_parse("MESHBENCH_TRANSPORT", &mut self.transport.backend);
        if let Ok(val) = std::env::var("MESHBENCH_NATIVE_MODE") {
            match val.to_lowercase().as_str() {
                "tag" => self.transport.native_mode = NativeMode::Tag,
                "am" => self.transport.native_mode = NativeMode::Am,
                _ => {}
            }
        }
        env_parse("MESHBENCH_COALESCE_THRESHOLD", &mut self.transport.coalesce_threshold);

        // Exchange settings
        env_parse("MESHBENCH_PAYLOAD_SIZE", &mut self.exchange.payload_size);
        env_parse("MESHBENCH_ITERATIONS", &mut self.exchange.iterations);
        if let Ok(val) = std::env::var("MESHBENCH_CLIENT_SENDS_FIRST") {
            self.exchange.client_sends_first = env_bool(&val);
        }
        if let Ok(val) = std::env::var("MESHBENCH_GATHER") {
            self.exchange.gather = env_bool(&val);
        }
        if let Ok(val) = std::env::var("MESHBENCH_WARMUP") {
            self.exchange.warmup = Some(env_bool(&val));
        }

        // Timing settings
        env_parse("MESHBENCH_CONNECT_BACKOFF_MS", &mut self.timing.connect_backoff_ms);
        env_parse("MESHBENCH_CONNECT_MAX_WAIT_MS", &mut self.timing.connect_max_wait_ms);
        env_parse("MESHBENCH_POLL_INTERVAL_MS", &mut self.timing.poll_interval_ms);
        env_parse(
            "MESHBENCH_COMPLETION_POLL_INTERVAL_MS",
            &mut self.timing.completion_poll_interval_ms,
        );
        if let Ok(val) = std::env::var("MESHBENCH_BARRIER") {
            match val.to_lowercase().as_str() {
                "poll" => self.timing.barrier = BarrierKind::Poll,
                "notify" => self.timing.barrier = BarrierKind::Notify,
                _ => {}
            }
        }

        // Logging settings
        if let Ok(val) = std::env::var("MESHBENCH_LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Ok(val) = std::env::var("MESHBENCH_LOG_FILE") {
            self.logging.file = Some(val);
        }
        if let Ok(val) = std::env::var("MESHBENCH_LOG_JSON") {
            self.logging.json_format = env_bool(&val);
        }
    }

    /// Expand ~ and other path variables
    fn expand_paths(&mut self) {
        if let Some(ref board) = self.cluster.board {
            self.cluster.board = Some(expand_path(board));
        }
        if let Some(ref file) = self.logging.file {
            self.logging.file = Some(expand_path(file));
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.cluster.num_workers == 0 {
            return Err(Error::config_field_invalid(
                "cluster.num_workers",
                "num_workers must be at least 1",
            ));
        }
        if self.cluster.endpoints == 0 {
            return Err(Error::config_field_invalid(
                "cluster.endpoints",
                "endpoints must be at least 1",
            ));
        }
        if self.exchange.iterations == 0 {
            return Err(Error::config_field_invalid(
                "exchange.iterations",
                "iterations must be at least 1",
            ));
        }
        if self.exchange.payload_size as u64 > crate::framing::MAX_RECORD_SIZE / 2 {
            return Err(Error::config_field_invalid(
                "exchange.payload_size",
                format!(
                    "payload_size must not exceed {} bytes",
                    crate::framing::MAX_RECORD_SIZE / 2
                ),
            ));
        }
        if self.network.listen_port != 0 && self.cluster.num_workers > 1 {
            return Err(Error::config_field_invalid(
                "network.listen_port",
                format!(
                    "a fixed listen_port ({}) cannot be shared by {} workers; use 0 for ephemeral ports",
                    self.network.listen_port, self.cluster.num_workers
                ),
            ));
        }
        if self.timing.connect_backoff_ms == 0 {
            return Err(Error::config_field_invalid(
                "timing.connect_backoff_ms",
                "connect_backoff_ms must be positive",
            ));
        }

        // Validate log level
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(Error::config_field_invalid(
                "logging.level",
                format!(
                    "Invalid log level '{}'. Must be one of: {}",
                    self.logging.level,
                    valid_levels.join(", ")
                ),
            ));
        }

        Ok(())
    }

    /// Whether rendezvous goes through a monitor process
    pub fn uses_monitor(&self) -> bool {
        self.cluster.monitor_port != 0
    }

    /// Warm-up setting, falling back to the transport's default
    pub fn warmup(&self) -> bool {
        self.exchange
            .warmup
            .unwrap_or_else(|| self.transport.backend.warmup_by_default())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let max_wait = match self.timing.connect_max_wait_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };
        RetryPolicy::new(Duration::from_millis(self.timing.connect_backoff_ms), max_wait)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.timing.poll_interval_ms)
    }

    pub fn completion_poll_interval(&self) -> Duration {
        Duration::from_millis(self.timing.completion_poll_interval_ms)
    }

    /// Board file path, if configured
    pub fn board_path(&self) -> Option<PathBuf> {
        self.cluster.board.as_ref().map(PathBuf::from)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, target: &mut T) {
    if let Ok(val) = std::env::var(name) {
        if let Ok(parsed) = val.parse() {
            *target = parsed;
        }
    }
}

fn env_bool(val: &str) -> bool {
    val.to_lowercase() == "true" || val == "1"
}

/// Expand ~ and environment variables in paths
fn expand_path(path: &str) -> String {
    shellexpand::full(path)
        .unwrap_or_else(|_| std::borrow::Cow::Borrowed(path))
        .into_owned()
}

/// Default location for `config init`
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".meshbench")
        .join("config.toml")
}

/// Initialize a new configuration file
pub fn init_config(path: Option<&str>, force: bool) -> Result<PathBuf> {
    let config_path = path
        .map(|p| PathBuf::from(expand_path(p)))
        .unwrap_or_else(default_config_path);

    // Check if file exists
    if config_path.exists() && !force {
        return Err(Error::Config(format!(
            "Configuration file already exists: {}. Use --force to overwrite.",
            config_path.display()
        )));
    }

    // Create parent directories
    if let Some(parent) = config_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|source| Error::IoWrite {
                path: parent.to_path_buf(),
                source,
            })?;
        }
    }

    fs::write(&config_path, generate_default_config()).map_err(|source| Error::IoWrite {
        path: config_path.clone(),
        source,
    })?;

    Ok(config_path)
}

/// Generate default configuration content with comments
pub fn generate_default_config() -> String {
    r#"# meshbench configuration

[cluster]
# Number of worker processes
num_workers = 2

# Connections each worker opens to every peer
endpoints = 1

# Monitor listen port (0 = shared-state rendezvous through the board file)
monitor_port = 0

# Host the monitor listens on (defaults to the worker's host)
# monitor_host = "10.0.0.1"

# Board file shared by all processes on this host
# board = "/tmp/meshbench.board"

[network]
# Address to listen on and advertise
# host = "127.0.0.1"

# Interface whose IPv4 address is advertised when host is unset
# interface = "eth0"

# Worker listen port (0 = OS-assigned)
listen_port = 0

[transport]
# Transport variant: native, stream, buffered
backend = "stream"

# Native engine mode: tag, am
native_mode = "tag"

# Stream records smaller than this many bytes go out in a single write
coalesce_threshold = 131072

[exchange]
# Bytes per payload
payload_size = 1048576

# Round trips per connection
iterations = 3

# Client sends before receiving
client_sends_first = false

# Send and receive each round trip's payloads at the same time
gather = false

# One untimed round trip per connection before measuring
# (defaults to true for the native transport only)
# warmup = true

[timing]
# Delay between connect attempts in milliseconds
connect_backoff_ms = 100

# Give up connecting after this many milliseconds (0 = never)
connect_max_wait_ms = 0

# Discovery and connection barrier poll interval in milliseconds
poll_interval_ms = 100

# Completion barrier poll interval in milliseconds (0 = yield only)
completion_poll_interval_ms = 0

# Connection barrier strategy: poll, notify
barrier = "poll"

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log file path (optional)
# file = "~/.meshbench/logs/meshbench.log"

# Number of rotated log files to keep
max_files = 5

# Use JSON format for logs
json_format = false
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn test_default_config() {
        let config = BenchConfig::default();
        assert_eq!(config.cluster.num_workers, 2);
        assert_eq!(config.cluster.endpoints, 1);
        assert_eq!(config.exchange.payload_size, 1 << 20);
        assert_eq!(config.exchange.iterations, 3);
        assert!(!config.exchange.client_sends_first);
        assert!(!config.exchange.gather);
        assert_eq!(config.transport.coalesce_threshold, 131_072);
        assert_eq!(config.logging.level, "info");
        assert!(!config.uses_monitor());
        assert_eq!(config.retry_policy().max_wait, None);
    }

    #[test]
    fn test_env_override() {
        env::set_var("MESHBENCH_TRANSPORT", "buffered");
        env::set_var("MESHBENCH_ITERATIONS", "7");
        env::set_var("MESHBENCH_WARMUP", "1");

        let mut config = BenchConfig::default();
        config.apply_env_overrides();

        assert_eq!(config.transport.backend, TransportKind::Buffered);
        assert_eq!(config.exchange.iterations, 7);
        assert_eq!(config.exchange.warmup, Some(true));

        env::remove_var("MESHBENCH_TRANSPORT");
        env::remove_var("MESHBENCH_ITERATIONS");
        env::remove_var("MESHBENCH_WARMUP");
    }

    #[test]
    fn test_warmup_follows_transport() {
        let mut config = BenchConfig::default();
        assert!(!config.warmup());
        config.transport.backend = TransportKind::Native;
        assert!(config.warmup());
        config.exchange.warmup = Some(false);
        assert!(!config.warmup());
    }

    #[test]
    fn test_fixed_listen_port_needs_single_worker() {
        let mut config = BenchConfig::default();
        config.network.listen_port = 47311;
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            Error::ConfigValidation { field: Some(ref f), .. } if f == "network.listen_port"
        ));

        config.cluster.num_workers = 1;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_zero_workers() {
        let mut config = BenchConfig::default();
        config.cluster.num_workers = 0;
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            Error::ConfigValidation { field: Some(ref f), .. } if f == "cluster.num_workers"
        ));
    }

    #[test]
    fn test_validation_invalid_log_level() {
        let mut config = BenchConfig::default();
        config.logging.level = "invalid".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_valid_config() {
        assert!(BenchConfig::default().validate().is_ok());
    }

    #[test]
    fn test_path_expansion() {
        let mut config = BenchConfig::default();
        config.cluster.board = Some("~/cluster.board".to_string());
        config.expand_paths();
        assert!(!config.cluster.board.unwrap().contains('~'));
    }

    #[test]
    fn test_default_file_matches_defaults() {
        let parsed: BenchConfig = toml::from_str(&generate_default_config()).unwrap();
        let defaults = BenchConfig::default();
        assert_eq!(parsed.cluster.num_workers, defaults.cluster.num_workers);
        assert_eq!(parsed.transport.backend, defaults.transport.backend);
        assert_eq!(parsed.exchange.payload_size, defaults.exchange.payload_size);
        assert_eq!(parsed.timing.barrier, defaults.timing.barrier);
        assert!(parsed.validate().is_ok());
    }

    #[test]
    fn test_parse_config_file() {
        let config_str = r#"
[cluster]
num_workers = 4
endpoints = 2
monitor_port = 9999

[transport]
backend = "native"
native_mode = "am"

[timing]
connect_max_wait_ms = 5000
barrier = "notify"
"#;

        let config: BenchConfig = toml::from_str(config_str).unwrap();

        assert_eq!(config.cluster.num_workers, 4);
        assert_eq!(config.cluster.endpoints, 2);
        assert!(config.uses_monitor());
        assert_eq!(config.transport.backend, TransportKind::Native);
        assert_eq!(config.transport.native_mode, NativeMode::Am);
        assert_eq!(config.timing.barrier, BarrierKind::Notify);
        assert_eq!(
            config.retry_policy().max_wait,
            Some(Duration::from_millis(5000))
        );
        // untouched sections keep defaults
        assert_eq!(config.exchange.iterations, 3);
    }
}
