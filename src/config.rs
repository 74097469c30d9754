//! Server configuration using Figment.
//!
//! Configuration is loaded from:
//! 1. Built-in defaults
//! 2. A TOML file (e.g. `config/daq_stream.toml`)
//! 3. Environment variables prefixed with `DAQ_STREAM_`
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated by a double underscore, because key names
//! themselves contain single underscores:
//!
//! ```text
//! DAQ_STREAM_SERVER__PORT=2100
//! DAQ_STREAM_SERVER__LOG_LEVEL=debug
//! DAQ_STREAM_BUFFERS__DEFAULT__MAX_BYTES=104857600
//! ```
//!
//! # Example
//!
//! ```toml
//! [server]
//! host = "0.0.0.0"
//! port = 2000
//!
//! [buffers.default]
//! max_bytes = 10485760
//! max_chunk_bytes = 1048576
//!
//! [buffers.streams.station_visibilities]
//! max_bytes = 67108864
//! max_chunk_bytes = 8388608
//!
//! [[chunkers]]
//! kind = "udp"
//! data_types = ["station_visibilities"]
//! host = "0.0.0.0"
//! port = 2001
//! packet_size = 8208
//! packets_per_chunk = 512
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::error::{AppResult, DaqError};

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    LoadError(#[from] Box<figment::Error>),
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level server configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Network front end
    #[serde(default)]
    pub server: ServerSettings,
    /// Buffer sizing per data type
    #[serde(default)]
    pub buffers: BufferSettings,
    /// Producers feeding the buffers
    #[serde(default)]
    pub chunkers: Vec<ChunkerConfig>,
}

/// Listening socket and session policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// How long a stream request waits for compatible data before erroring
    #[serde(default = "default_stream_wait_timeout")]
    pub stream_wait_timeout_ms: u64,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            stream_wait_timeout_ms: default_stream_wait_timeout(),
            log_level: default_log_level(),
        }
    }
}

/// Resolved capacity pair for one buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferLimits {
    /// Total bytes the buffer may allocate
    pub max_bytes: usize,
    /// Largest single chunk
    pub max_chunk_bytes: usize,
}

impl Default for BufferLimits {
    fn default() -> Self {
        Self {
            max_bytes: 10 * 1024 * 1024,
            max_chunk_bytes: 1024 * 1024,
        }
    }
}

impl BufferLimits {
    pub fn new(max_bytes: usize, max_chunk_bytes: usize) -> Self {
        Self {
            max_bytes,
            max_chunk_bytes,
        }
    }

    /// Reject limits no buffer can work with.
    pub fn check(&self, buffer: &str) -> AppResult<()> {
        if self.max_bytes == 0 || self.max_chunk_bytes == 0 {
            return Err(DaqError::ZeroSizedBuffer(buffer.to_string()));
        }
        if self.max_chunk_bytes > self.max_bytes {
            return Err(DaqError::Configuration(format!(
                "buffer '{}': max_chunk_bytes ({}) exceeds max_bytes ({})",
                buffer, self.max_chunk_bytes, self.max_bytes
            )));
        }
        Ok(())
    }
}

/// Buffer sizing: a default plus per-type overrides
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BufferSettings {
    #[serde(default)]
    pub default: BufferLimits,
    #[serde(default)]
    pub streams: HashMap<String, BufferLimits>,
    #[serde(default)]
    pub services: HashMap<String, BufferLimits>,
}

impl BufferSettings {
    /// Settings that apply `limits` to every buffer.
    pub fn uniform(limits: BufferLimits) -> Self {
        Self {
            default: limits,
            ..Self::default()
        }
    }

    pub fn with_stream(mut self, name: impl Into<String>, limits: BufferLimits) -> Self {
        self.streams.insert(name.into(), limits);
        self
    }

    pub fn with_service(mut self, name: impl Into<String>, limits: BufferLimits) -> Self {
        self.services.insert(name.into(), limits);
        self
    }

    pub fn stream_limits(&self, name: &str) -> BufferLimits {
        self.streams.get(name).copied().unwrap_or(self.default)
    }

    pub fn service_limits(&self, name: &str) -> BufferLimits {
        self.services.get(name).copied().unwrap_or(self.default)
    }
}

/// Which kind of buffer a chunker feeds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkerRole {
    #[default]
    Stream,
    Service,
}

/// Chunker definition in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkerConfig {
    /// Registered chunker type (udp, file, archive, generator, ...)
    pub kind: String,
    /// Optional label used in logs and thread names
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub role: ChunkerRole,
    /// Buffers this chunker writes into
    pub data_types: Vec<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    /// Default deserialiser hint for consumers of this data
    #[serde(default)]
    pub adapter: Option<String>,
    /// Bytes per chunk for chunkers that read fixed-size units
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default)]
    pub packet_size: Option<usize>,
    #[serde(default)]
    pub packets_per_chunk: Option<usize>,
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Pause between chunks for paced sources
    #[serde(default)]
    pub interval_ms: Option<u64>,
    /// Stop after this many chunks
    #[serde(default)]
    pub count: Option<u64>,
}

impl ChunkerConfig {
    pub fn new<I, S>(kind: impl Into<String>, data_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kind: kind.into(),
            name: None,
            role: ChunkerRole::Stream,
            data_types: data_types.into_iter().map(Into::into).collect(),
            host: None,
            port: None,
            adapter: None,
            chunk_size: default_chunk_size(),
            packet_size: None,
            packets_per_chunk: None,
            path: None,
            interval_ms: None,
            count: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_endpoint(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = Some(host.into());
        self.port = Some(port);
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_packets(mut self, packet_size: usize, packets_per_chunk: usize) -> Self {
        self.packet_size = Some(packet_size);
        self.packets_per_chunk = Some(packets_per_chunk);
        self
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_interval_ms(mut self, interval_ms: u64) -> Self {
        self.interval_ms = Some(interval_ms);
        self
    }

    pub fn with_count(mut self, count: u64) -> Self {
        self.count = Some(count);
        self
    }

    /// Label for logs: the configured name, or the kind plus its first type.
    pub fn label(&self) -> String {
        match (&self.name, self.data_types.first()) {
            (Some(name), _) => name.clone(),
            (None, Some(data_type)) => format!("{}:{}", self.kind, data_type),
            (None, None) => self.kind.clone(),
        }
    }

    /// Socket endpoint this chunker binds, if any.
    pub fn endpoint(&self) -> Option<(String, u16)> {
        match (&self.host, self.port) {
            (Some(host), Some(port)) => Some((host.clone(), port)),
            (None, Some(port)) => Some((default_bind_host(), port)),
            _ => None,
        }
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    2000
}

fn default_stream_wait_timeout() -> u64 {
    2000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_chunk_size() -> usize {
    64 * 1024
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

const ENV_PREFIX: &str = "DAQ_STREAM_";

impl Settings {
    /// Load configuration from `config/daq_stream.toml` and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config/daq_stream.toml")
    }

    /// Load configuration from a specific file path
    ///
    /// Precedence (highest first): environment, file, defaults. A missing file
    /// is not an error; the defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::extract(
            Figment::from(Serialized::defaults(Settings::default()))
                .merge(Toml::file(path.as_ref()))
                .merge(Env::prefixed(ENV_PREFIX).split("__")),
        )
    }

    /// Parse configuration from a TOML string (no environment overrides).
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        Self::extract(Figment::from(Serialized::defaults(Settings::default())).merge(Toml::string(toml)))
    }

    fn extract(figment: Figment) -> Result<Self, ConfigError> {
        let settings: Self = figment
            .extract()
            .map_err(|e| ConfigError::LoadError(Box::new(e)))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Buffer limits are non-zero and chunk limits fit their buffers
    /// - Every chunker declares at least one data type
    /// - No two chunkers bind the same host/port
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.server.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.server.log_level,
                valid_levels.join(", ")
            )));
        }

        let limits = std::iter::once(("default", &self.buffers.default))
            .chain(self.buffers.streams.iter().map(|(k, v)| (k.as_str(), v)))
            .chain(self.buffers.services.iter().map(|(k, v)| (k.as_str(), v)));
        for (name, limit) in limits {
            limit
                .check(name)
                .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        }

        let mut endpoints = HashSet::new();
        for chunker in &self.chunkers {
            if chunker.data_types.is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "Chunker '{}' does not declare any data_types",
                    chunker.label()
                )));
            }
            if chunker.chunk_size == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "Chunker '{}': chunk_size must be > 0",
                    chunker.label()
                )));
            }
            if let Some((host, port)) = chunker.endpoint() {
                if !endpoints.insert((host.clone(), port)) {
                    return Err(ConfigError::ValidationError(format!(
                        "Duplicate chunker endpoint {}:{}",
                        host, port
                    )));
                }
            }
        }

        Ok(())
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::ValidationError(e.to_string()))
    }

    /// Chunkers feeding stream buffers
    pub fn stream_chunkers(&self) -> impl Iterator<Item = &ChunkerConfig> {
        self.chunkers
            .iter()
            .filter(|c| c.role == ChunkerRole::Stream)
    }

    /// Chunkers feeding service buffers
    pub fn service_chunkers(&self) -> impl Iterator<Item = &ChunkerConfig> {
        self.chunkers
            .iter()
            .filter(|c| c.role == ChunkerRole::Service)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [server]
        host = "0.0.0.0"
        port = 2100
        stream_wait_timeout_ms = 500

        [buffers.default]
        max_bytes = 4096
        max_chunk_bytes = 1024

        [buffers.streams.visibilities]
        max_bytes = 1024
        max_chunk_bytes = 256

        [[chunkers]]
        kind = "udp"
        data_types = ["visibilities"]
        host = "0.0.0.0"
        port = 2001
        packet_size = 64
        packets_per_chunk = 4

        [[chunkers]]
        kind = "generator"
        role = "service"
        data_types = ["antenna_positions"]
        chunk_size = 128
        count = 1
    "#;

    #[test]
    fn test_defaults() {
        let settings = Settings::from_toml_str("").unwrap();
        assert_eq!(settings.server.port, 2000);
        assert_eq!(settings.server.log_level, "info");
        assert_eq!(settings.buffers.default, BufferLimits::default());
        assert!(settings.chunkers.is_empty());
    }

    #[test]
    fn test_parse_sample() {
        let settings = Settings::from_toml_str(SAMPLE).unwrap();
        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.server.port, 2100);
        assert_eq!(settings.server.stream_wait_timeout_ms, 500);
        assert_eq!(settings.chunkers.len(), 2);
        assert_eq!(settings.stream_chunkers().count(), 1);
        assert_eq!(settings.service_chunkers().count(), 1);

        let udp = &settings.chunkers[0];
        assert_eq!(udp.endpoint(), Some(("0.0.0.0".to_string(), 2001)));
        assert_eq!(udp.packet_size, Some(64));
        assert_eq!(udp.chunk_size, default_chunk_size());
    }

    #[test]
    fn test_per_type_limits() {
        let settings = Settings::from_toml_str(SAMPLE).unwrap();
        assert_eq!(
            settings.buffers.stream_limits("visibilities"),
            BufferLimits::new(1024, 256)
        );
        assert_eq!(
            settings.buffers.stream_limits("other"),
            BufferLimits::new(4096, 1024)
        );
        assert_eq!(
            settings.buffers.service_limits("antenna_positions"),
            BufferLimits::new(4096, 1024)
        );
    }

    #[test]
    fn test_invalid_log_level() {
        let err = Settings::from_toml_str("[server]\nlog_level = \"chatty\"").unwrap_err();
        assert!(err.to_string().contains("Invalid log_level"));
    }

    #[test]
    fn test_zero_sized_buffer_rejected() {
        let err = Settings::from_toml_str(
            "[buffers.streams.T]\nmax_bytes = 0\nmax_chunk_bytes = 0",
        )
        .unwrap_err();
        assert!(err.to_string().contains("zero capacity"));
    }

    #[test]
    fn test_chunk_larger_than_buffer_rejected() {
        let err = Settings::from_toml_str(
            "[buffers.default]\nmax_bytes = 100\nmax_chunk_bytes = 200",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_duplicate_endpoint_rejected() {
        let toml = r#"
            [[chunkers]]
            kind = "udp"
            data_types = ["a"]
            port = 2001

            [[chunkers]]
            kind = "udp"
            data_types = ["b"]
            host = "0.0.0.0"
            port = 2001
        "#;
        let err = Settings::from_toml_str(toml).unwrap_err();
        assert!(err.to_string().contains("Duplicate chunker endpoint"));
    }

    #[test]
    fn test_chunker_without_types_rejected() {
        let toml = "[[chunkers]]\nkind = \"file\"\ndata_types = []";
        assert!(Settings::from_toml_str(toml).is_err());
    }

    #[test]
    fn test_limits_check() {
        assert!(BufferLimits::new(1024, 256).check("T").is_ok());
        assert!(matches!(
            BufferLimits::new(0, 256).check("T"),
            Err(DaqError::ZeroSizedBuffer(name)) if name == "T"
        ));
    }

    #[test]
    fn test_chunker_label() {
        let config = ChunkerConfig::new("udp", ["visibilities"]);
        assert_eq!(config.label(), "udp:visibilities");
        assert_eq!(config.with_name("station-1").label(), "station-1");
    }

    #[test]
    fn test_effective_config_reloads() {
        let settings = Settings::from_toml_str(SAMPLE).unwrap();
        let rendered = settings.to_toml_string().unwrap();
        let reloaded = Settings::from_toml_str(&rendered).unwrap();
        assert_eq!(reloaded.server.port, settings.server.port);
        assert_eq!(reloaded.chunkers.len(), settings.chunkers.len());
        assert_eq!(
            reloaded.buffers.stream_limits("visibilities"),
            settings.buffers.stream_limits("visibilities")
        );
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load_from(dir.path().join("absent.toml")).unwrap();
        assert_eq!(settings.server.port, 2000);
    }
}
