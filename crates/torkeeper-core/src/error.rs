//! Error types for torkeeper.
//!
//! Validation and precondition errors are returned to the caller without
//! touching the daemon. Daemon and channel errors move the lifecycle state
//! and are reported through `StartResult` or the failing operation.

use std::path::PathBuf;
use thiserror::Error;

/// Configuration rejected before any daemon interaction.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A port was zero.
    #[error("{name} must be in 1..=65535")]
    InvalidPort {
        /// Which setting carried the port.
        name: &'static str,
    },

    /// Two settings share the same port.
    #[error("{first} and {second} both use port {port}")]
    DuplicatePort {
        /// First setting using the port.
        first: &'static str,
        /// Second setting using the port.
        second: &'static str,
        /// The shared port.
        port: u16,
    },

    /// Data directory is not absolute.
    #[error("data directory must be an absolute path: {0:?}")]
    RelativeDataDir(PathBuf),

    /// Bootstrap timeout of zero.
    #[error("timeout_ms must be greater than zero")]
    ZeroTimeout,

    /// Key material is not 64 bytes.
    #[error("key material must be 64 bytes (got {0})")]
    KeyLength(usize),

    /// The data directory could not be created or written.
    #[error("data directory {path:?} unusable: {reason}")]
    Directory {
        /// Offending directory.
        path: PathBuf,
        /// What went wrong.
        reason: String,
    },
}

/// Core error type for torkeeper operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid configuration.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Control port rejected our credentials.
    #[error("control port authentication failed: {0}")]
    Auth(String),

    /// Daemon did not reach 100% bootstrap in time.
    #[error(
        "bootstrap timeout after {timeout_ms} ms ({progress}% complete){}",
        last_warning(.warning)
    )]
    BootstrapTimeout {
        /// The configured limit.
        timeout_ms: u64,
        /// Last progress seen.
        progress: u8,
        /// Last problem the daemon reported, if any.
        warning: Option<String>,
    },

    /// Daemon reported a bootstrap failure, or died while bootstrapping.
    #[error("daemon bootstrap failed: {0}")]
    DaemonBootstrap(String),

    /// Hidden-service target port already in use by an active handle.
    #[error("port {0} already used by an active hidden service")]
    PortConflict(u16),

    /// Unknown hidden service.
    #[error("hidden service not found: {0}")]
    NotFound(String),

    /// Operation requires a running service.
    #[error("service not ready (state: {0})")]
    ServiceNotReady(String),

    /// Control connection lost or closed.
    #[error("control channel closed")]
    ChannelClosed,

    /// Control port answered with an error status.
    #[error("control port error {code}: {message}")]
    Protocol {
        /// Three-digit status code.
        code: u16,
        /// Reply text.
        message: String,
    },

    /// Illegal lifecycle transition.
    #[error("invalid lifecycle transition {from} -> {to}")]
    InvalidTransition {
        /// State before.
        from: String,
        /// Requested state.
        to: String,
    },

    /// Spawning or embedding the daemon failed.
    #[error("daemon error: {0}")]
    Daemon(String),

    /// Malformed key material.
    #[error("invalid key material: {0}")]
    InvalidKey(String),

    /// Malformed onion address.
    #[error("invalid onion address: {0}")]
    InvalidAddress(String),

    /// Proxied HTTP request failed.
    #[error("http error: {0}")]
    Http(String),

    /// Operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using torkeeper's Error.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the error was raised before any daemon interaction.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Error::Config(_) | Error::ServiceNotReady(_) | Error::PortConflict(_) | Error::NotFound(_)
        )
    }

    /// Whether this is one of the two bootstrap failure kinds.
    pub fn is_bootstrap_failure(&self) -> bool {
        matches!(self, Error::BootstrapTimeout { .. } | Error::DaemonBootstrap(_))
    }
}

fn last_warning(warning: &Option<String>) -> String {
    match warning {
        Some(w) => format!(", last warning: {}", w),
        None => String::new(),
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Timeout
        } else {
            Error::Http(e.to_string())
        }
    }
}
