//! # torkeeper core library
//!
//! Runs a Tor daemon inside a long-lived host process and mediates every
//! interaction with it: bootstrapping, status, onion services, and HTTP
//! traffic through its SOCKS proxy.
//!
//! ## Guarantees
//!
//! - At most one daemon lifecycle per supervisor; concurrent starts share
//!   one attempt
//! - Control commands are serialized over one authenticated connection
//! - No clearnet fallback: HTTP fails unless the daemon is running
//! - Secrets (cookies, passwords, onion keys) never reach the logs
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │          api (binding façade)           │
//! ├─────────────────────────────────────────┤
//! │  supervisor  │ hidden_service │  http   │
//! ├─────────────────────────────────────────┤
//! │   tor (control, launcher)   │  status   │
//! ├─────────────────────────────────────────┤
//! │      config      │       onion          │
//! └─────────────────────────────────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, clippy::all)]
#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod api;
pub mod config;
pub mod error;
pub mod hidden_service;
pub mod http;
pub mod logging;
pub mod onion;
pub mod status;
pub mod supervisor;
pub mod tor;

pub use api::TorService;
pub use config::{HiddenServiceConfig, KeyMaterial, ServiceConfig};
pub use error::{ConfigError, Error, Result};
pub use hidden_service::{HiddenServiceHandle, HiddenServiceRegistry};
pub use http::{HttpMethod, HttpRequest, HttpResponse, ProxyHttpClient};
pub use onion::{OnionAddress, OnionSecretKey};
pub use status::{LifecycleState, ServiceStatus, StatusReporter};
pub use supervisor::{ServiceSupervisor, StartResult, SupervisorOptions};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
