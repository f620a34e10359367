//! Error types for meshbench
//!
//! Provides structured error handling with:
//! - Numeric error codes for machine parsing
//! - Transient classification for the connect retry loop
//! - User-friendly messages with suggestions
//! - Exit codes for CLI

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::protocol::{Opcode, PeerAddress};

/// Result type alias for meshbench operations
pub type Result<T> = std::result::Result<T, Error>;

/// Numeric error codes for machine parsing and documentation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    // Configuration errors (1xx)
    ConfigNotFound = 100,
    ConfigParseError = 101,
    ConfigValidation = 102,

    // IO errors (2xx)
    IoRead = 200,
    IoWrite = 201,
    IoPermission = 202,
    IoNotFound = 203,

    // Connection errors (3xx)
    ConnectionFailed = 300,
    ConnectionTimeout = 301,
    ConnectionCancelled = 302,
    StreamClosed = 303,
    WaitCancelled = 304,

    // Protocol errors (4xx)
    ProtocolViolation = 400,
    ProtocolMalformed = 401,
    RosterMismatch = 402,

    // Data errors (5xx)
    TruncatedData = 500,
    PayloadMismatch = 501,

    // Process errors (6xx)
    WorkerFailed = 600,

    // Internal errors (9xx)
    InternalError = 900,
}

impl ErrorCode {
    /// Get the string code (e.g., "E100")
    pub fn as_str(&self) -> String {
        format!("E{}", *self as u16)
    }

    /// Get the exit code for CLI (maps to 1-125 range)
    pub fn exit_code(&self) -> i32 {
        match *self as u16 {
            100..=199 => 10, // Config errors
            200..=299 => 20, // IO errors
            300..=399 => 30, // Connection errors
            400..=499 => 40, // Protocol errors
            500..=599 => 50, // Data errors
            600..=699 => 60, // Process errors
            900..=999 => 90, // Internal errors
            _ => 1,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Main error type
#[derive(Error, Debug)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    /// Configuration parse error
    #[error("Failed to parse configuration: {message}")]
    ConfigParse {
        message: String,
        #[source]
        source: Option<toml::de::Error>,
    },

    /// Configuration validation error
    #[error("Configuration validation failed: {message}")]
    ConfigValidation { message: String, field: Option<String> },

    /// Generic configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    // ─────────────────────────────────────────────────────────────
    // IO Errors
    // ─────────────────────────────────────────────────────────────

    /// File read error
    #[error("Failed to read file: {path}")]
    IoRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// File write error
    #[error("Failed to write file: {path}")]
    IoWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML serialization error
    #[error("TOML serialization error: {0}")]
    Toml(#[from] toml::ser::Error),

    /// JSON serialization error (message headers, reports)
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // ─────────────────────────────────────────────────────────────
    // Connection Errors
    // ─────────────────────────────────────────────────────────────

    /// Connection attempt failed
    #[error("Failed to connect to {addr}: {source}")]
    ConnectionFailed {
        addr: PeerAddress,
        #[source]
        source: std::io::Error,
    },

    /// Retry policy ran out of time before the peer started listening
    #[error("Gave up connecting to {addr} after {waited:?}")]
    ConnectTimeout { addr: PeerAddress, waited: Duration },

    /// Connect loop was cancelled
    #[error("Connection to {addr} cancelled")]
    Cancelled { addr: PeerAddress },

    /// Peer closed the stream, or the local side already closed it
    #[error("Stream to {peer} closed")]
    StreamClosed { peer: String },

    /// A barrier was abandoned because the run was cancelled
    #[error("Cancelled while waiting for {barrier}")]
    WaitCancelled { barrier: &'static str },

    // ─────────────────────────────────────────────────────────────
    // Protocol Errors
    // ─────────────────────────────────────────────────────────────

    /// Unexpected opcode for the current rendezvous phase
    #[error("Protocol violation: expected {expected}, got {actual}")]
    ProtocolViolation { expected: Opcode, actual: Opcode },

    /// Roster has the wrong number of entries
    #[error("Roster mismatch: expected {expected} workers, got {actual}")]
    RosterMismatch { expected: usize, actual: usize },

    /// Frames could not be decoded into a message
    #[error("Malformed message: {message}")]
    Malformed { message: String },

    // ─────────────────────────────────────────────────────────────
    // Data Errors
    // ─────────────────────────────────────────────────────────────

    /// Fewer bytes arrived than the sender declared
    #[error("Truncated data: declared {declared} bytes, received {received}")]
    TruncatedData { declared: u64, received: u64 },

    /// Payload of the wrong size arrived during the exchange
    #[error("Payload mismatch from {peer}: expected {expected} bytes, got {actual}")]
    PayloadMismatch {
        peer: String,
        expected: usize,
        actual: usize,
    },

    // ─────────────────────────────────────────────────────────────
    // Process Errors
    // ─────────────────────────────────────────────────────────────

    /// A spawned worker or monitor exited unsuccessfully
    #[error("{role} exited with status {status}")]
    WorkerFailed { role: String, status: String },

    // ─────────────────────────────────────────────────────────────
    // Internal Errors
    // ─────────────────────────────────────────────────────────────

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    // ─────────────────────────────────────────────────────────────
    // Error Classification
    // ─────────────────────────────────────────────────────────────

    /// Get the numeric error code
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::ConfigNotFound { .. } => ErrorCode::ConfigNotFound,
            Error::ConfigParse { .. } => ErrorCode::ConfigParseError,
            Error::ConfigValidation { .. } => ErrorCode::ConfigValidation,
            Error::Config(_) => ErrorCode::ConfigValidation,

            Error::IoRead { .. } => ErrorCode::IoRead,
            Error::IoWrite { .. } => ErrorCode::IoWrite,
            Error::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound => ErrorCode::IoNotFound,
                std::io::ErrorKind::PermissionDenied => ErrorCode::IoPermission,
                _ => ErrorCode::IoRead,
            },
            Error::Toml(_) => ErrorCode::ConfigParseError,
            Error::Json(_) => ErrorCode::ProtocolMalformed,

            Error::ConnectionFailed { .. } => ErrorCode::ConnectionFailed,
            Error::ConnectTimeout { .. } => ErrorCode::ConnectionTimeout,
            Error::Cancelled { .. } => ErrorCode::ConnectionCancelled,
            Error::StreamClosed { .. } => ErrorCode::StreamClosed,
            Error::WaitCancelled { .. } => ErrorCode::WaitCancelled,

            Error::ProtocolViolation { .. } => ErrorCode::ProtocolViolation,
            Error::RosterMismatch { .. } => ErrorCode::RosterMismatch,
            Error::Malformed { .. } => ErrorCode::ProtocolMalformed,

            Error::TruncatedData { .. } => ErrorCode::TruncatedData,
            Error::PayloadMismatch { .. } => ErrorCode::PayloadMismatch,

            Error::WorkerFailed { .. } => ErrorCode::WorkerFailed,

            Error::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Whether a failed connect attempt should be retried
    ///
    /// Only "peer not listening yet" style failures qualify.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::ConnectionFailed { source, .. } => is_transient_io(source),
            _ => false,
        }
    }

    /// Get the exit code for CLI
    pub fn exit_code(&self) -> i32 {
        self.code().exit_code()
    }

    // ─────────────────────────────────────────────────────────────
    // User-Friendly Messages
    // ─────────────────────────────────────────────────────────────

    /// Get a user-friendly suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Error::ConfigNotFound { .. } => Some(
                "Run 'meshbench config init' to create a default configuration file.",
            ),
            Error::ConfigParse { .. } => Some(
                "Check your configuration file syntax. Run 'meshbench config validate' to see details.",
            ),
            Error::ConfigValidation { .. } => Some(
                "Review the configuration file and fix the invalid values.",
            ),
            Error::ConnectTimeout { .. } => Some(
                "The peer never started listening. Raise 'connect_max_wait_ms' or check that every worker was launched.",
            ),
            Error::ProtocolViolation { .. } | Error::RosterMismatch { .. } => Some(
                "Workers and monitor disagree on the cluster shape. Check --workers and --endpoints on every process.",
            ),
            Error::TruncatedData { .. } => Some(
                "A peer went away mid-transfer. Check the peer's log for the original failure.",
            ),
            _ => None,
        }
    }

    /// Format the error for terminal display with colors
    pub fn format_for_terminal(&self) -> String {
        let mut output = format!("\x1b[31mError [{}]\x1b[0m: {}\n", self.code().as_str(), self);

        if let Some(hint) = self.suggestion() {
            output.push_str(&format!("\n\x1b[33mHint\x1b[0m: {}\n", hint));
        }

        output
    }

    /// Format the error for logging (no colors)
    pub fn format_for_log(&self) -> String {
        format!("[{}] {}", self.code().as_str(), self)
    }
}

/// IO error kinds that mean "the listener is not there yet"
pub fn is_transient_io(err: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        err.kind(),
        ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::Interrupted
    )
}

// ─────────────────────────────────────────────────────────────────
// Error Constructors
// ─────────────────────────────────────────────────────────────────

impl Error {
    /// Create a config validation error with field name
    pub fn config_field_invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ConfigValidation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a malformed message error
    pub fn malformed(message: impl Into<String>) -> Self {
        Error::Malformed {
            message: message.into(),
        }
    }

    /// Create a stream closed error
    pub fn stream_closed(peer: impl fmt::Display) -> Self {
        Error::StreamClosed {
            peer: peer.to_string(),
        }
    }

    /// Create a truncation error
    pub fn truncated(declared: u64, received: u64) -> Self {
        Error::TruncatedData { declared, received }
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> PeerAddress {
        PeerAddress::new("127.0.0.1", 4000)
    }

    #[test]
    fn test_error_code_format() {
        assert_eq!(ErrorCode::ConfigNotFound.as_str(), "E100");
        assert_eq!(ErrorCode::ProtocolViolation.as_str(), "E400");
        assert_eq!(ErrorCode::TruncatedData.as_str(), "E500");
    }

    #[test]
    fn test_error_exit_codes() {
        assert_eq!(ErrorCode::ConfigValidation.exit_code(), 10);
        assert_eq!(ErrorCode::IoRead.exit_code(), 20);
        assert_eq!(ErrorCode::StreamClosed.exit_code(), 30);
        assert_eq!(ErrorCode::RosterMismatch.exit_code(), 40);
        assert_eq!(ErrorCode::TruncatedData.exit_code(), 50);
        assert_eq!(ErrorCode::InternalError.exit_code(), 90);
    }

    #[test]
    fn test_refused_connection_is_transient() {
        let err = Error::ConnectionFailed {
            addr: addr(),
            source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
        };
        assert!(err.is_transient());
    }

    #[test]
    fn test_other_connect_failures_are_not_transient() {
        let err = Error::ConnectionFailed {
            addr: addr(),
            source: std::io::Error::from(std::io::ErrorKind::AddrNotAvailable),
        };
        assert!(!err.is_transient());
        assert!(!Error::ConnectTimeout { addr: addr(), waited: Duration::from_secs(1) }.is_transient());
    }

    #[test]
    fn test_protocol_and_truncation_messages() {
        let err = Error::ProtocolViolation {
            expected: Opcode::ClusterReady,
            actual: Opcode::Shutdown,
        };
        assert_eq!(err.code(), ErrorCode::ProtocolViolation);
        assert!(err.to_string().contains("CLUSTER_READY"));

        let err = Error::truncated(100, 50);
        assert_eq!(err.code(), ErrorCode::TruncatedData);
        assert!(err.to_string().contains("declared 100"));

        let err = Error::WaitCancelled { barrier: "discovery" };
        assert_eq!(err.exit_code(), 30);
        assert!(err.to_string().contains("discovery"));
    }

    #[test]
    fn test_format_for_terminal() {
        let err = Error::ConfigNotFound {
            path: PathBuf::from("/test/config.toml"),
        };
        let formatted = err.format_for_terminal();
        assert!(formatted.contains("E100"));
        assert!(formatted.contains("\x1b[31m"));
        assert!(formatted.contains("Hint"));
    }

    #[test]
    fn test_format_for_log() {
        let formatted = Error::truncated(8, 3).format_for_log();
        assert!(formatted.contains("[E500]"));
        assert!(!formatted.contains("\x1b["));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert_eq!(err.code(), ErrorCode::IoNotFound);
    }
}
