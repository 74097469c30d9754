//! Custom error types for the server.
//!
//! This module defines the primary error type, `DaqError`, for the whole crate.
//! Using the `thiserror` crate it gives every failure a typed variant so callers
//! can pattern-match on the kind of error rather than inspect strings.
//!
//! ## Error Taxonomy
//!
//! - **Fatal setup errors**: `Config`, `Configuration`, `EndpointInUse`,
//!   `UnknownChunker`, `ZeroSizedBuffer`, `UnregisteredDataType`, `Device`.
//!   Raised while the server is being assembled; they abort startup.
//! - **Backpressure errors**: `ChunkTooLarge`, `BufferFull`, `EmptyChunkRequest`,
//!   `ServiceBufferFull`. The producer drops the current unit of data, logs a
//!   warning and carries on.
//! - **Lookup errors**: `UnknownDataType`, `UnknownVersion`, `RetireCurrent`.
//! - **Protocol errors**: `Protocol`, `Handshake`, `Remote`. A malformed request
//!   becomes an `Error` response and the session stays open; a failed handshake
//!   closes the session.
//! - **Format errors**: `Format`, raised when a chunk archive fails to open.
//!
//! [`DaqError::is_fatal`] separates the first group from everything else.

use daq_pool::LockError;
use thiserror::Error;

use crate::config::ConfigError;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Chunker endpoint {host}:{port} is already registered")]
    EndpointInUse { host: String, port: u16 },

    #[error("Unknown chunker type '{0}'")]
    UnknownChunker(String),

    #[error("Buffer '{0}' is configured with zero capacity")]
    ZeroSizedBuffer(String),

    #[error("Data type '{0}' is required but no buffer provides it")]
    UnregisteredDataType(String),

    #[error("Failed to open device for chunker '{chunker}': {source}")]
    Device {
        chunker: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Chunk of {requested} bytes exceeds the {max} byte limit of '{buffer}'")]
    ChunkTooLarge {
        buffer: String,
        requested: usize,
        max: usize,
    },

    #[error("No writable chunk of {requested} bytes available in '{buffer}'")]
    BufferFull { buffer: String, requested: usize },

    #[error("Zero-byte chunk requested from '{0}'")]
    EmptyChunkRequest(String),

    #[error("Service buffer '{buffer}' has {remaining} bytes left, {requested} requested")]
    ServiceBufferFull {
        buffer: String,
        requested: usize,
        remaining: usize,
    },

    #[error("Unknown data type '{0}'")]
    UnknownDataType(String),

    #[error("Service data '{name}' has no version {version}")]
    UnknownVersion { name: String, version: u64 },

    #[error("Cannot retire version {version} of '{name}': it is the current version")]
    RetireCurrent { name: String, version: u64 },

    #[error("Chunk lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Protocol handshake failed: {0}")]
    Handshake(String),

    #[error("Server replied with error: {0}")]
    Remote(String),

    #[error("Archive format error: {0}")]
    Format(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Shutdown failed with errors")]
    ShutdownFailed(Vec<DaqError>),
}

impl DaqError {
    /// True for setup errors that must abort startup.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DaqError::Config(_)
                | DaqError::Configuration(_)
                | DaqError::EndpointInUse { .. }
                | DaqError::UnknownChunker(_)
                | DaqError::ZeroSizedBuffer(_)
                | DaqError::UnregisteredDataType(_)
                | DaqError::Device { .. }
        )
    }

    /// True when a producer should drop the current unit of data and continue.
    pub fn is_backpressure(&self) -> bool {
        matches!(
            self,
            DaqError::ChunkTooLarge { .. }
                | DaqError::BufferFull { .. }
                | DaqError::EmptyChunkRequest(_)
                | DaqError::ServiceBufferFull { .. }
                | DaqError::Lock(_)
        )
    }
}
