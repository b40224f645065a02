//! Service and hidden-service configuration.
//!
//! Configuration is checked by [`validate`] on every start attempt and is
//! immutable once a supervisor is running with it.

mod datadir;
mod validation;

pub use datadir::{DataDirectory, FsDataDirectory};
pub use validation::{validate, validate_hidden_service, ValidatedConfig};

use crate::onion::OnionSecretKey;
use crate::tor::{DEFAULT_SOCKS_PORT, DEFAULT_TIMEOUT_MS};
use std::path::PathBuf;

/// Startup configuration for the daemon.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// SOCKS5 proxy port the daemon listens on.
    pub socks_port: u16,
    /// Data directory for the daemon (must be absolute).
    pub data_dir: PathBuf,
    /// Bootstrap timeout in milliseconds.
    pub timeout_ms: u32,
    /// Fixed control port; `None` lets the daemon pick one.
    pub control_port: Option<u16>,
    /// Hidden service to provision as soon as the daemon is running.
    pub hidden_service: Option<HiddenServiceConfig>,
}

impl ServiceConfig {
    /// Config with default ports and timeout for the given data directory.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            socks_port: DEFAULT_SOCKS_PORT,
            data_dir: data_dir.into(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            control_port: None,
            hidden_service: None,
        }
    }
}

/// Where the onion service key comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyMaterial {
    /// Caller-supplied 64-byte expanded Ed25519 secret key.
    Provided(OnionSecretKey),
    /// Ask the daemon for a fresh keypair.
    Generated,
}

impl KeyMaterial {
    /// Build from optional raw bytes as handed over by bindings.
    pub fn from_optional_bytes(bytes: Option<&[u8]>) -> Result<Self, crate::error::ConfigError> {
        match bytes {
            None => Ok(KeyMaterial::Generated),
            Some(bytes) => OnionSecretKey::from_slice(bytes)
                .map(KeyMaterial::Provided)
                .map_err(|_| crate::error::ConfigError::KeyLength(bytes.len())),
        }
    }
}

/// Onion service mapping and key.
#[derive(Debug, Clone)]
pub struct HiddenServiceConfig {
    /// Port exposed on the .onion address.
    pub virtual_port: u16,
    /// Local port connections are forwarded to.
    pub target_port: u16,
    /// Key source.
    pub key_material: KeyMaterial,
}

impl HiddenServiceConfig {
    /// Hidden service with a daemon-generated key.
    pub fn generated(virtual_port: u16, target_port: u16) -> Self {
        Self {
            virtual_port,
            target_port,
            key_material: KeyMaterial::Generated,
        }
    }
}
