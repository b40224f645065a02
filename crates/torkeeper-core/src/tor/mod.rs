//! Tor daemon integration.
//!
//! Spawns (or embeds) the daemon, talks to it over its ControlPort and
//! tracks bootstrap progress.
//!
//! ## Design
//!
//! All commands travel over one authenticated control connection owned by
//! the supervisor. Outbound traffic goes through the daemon's SOCKS5 port;
//! there is no clearnet fallback.

mod control;
mod launcher;
mod protocol;

pub use control::{ControlAuth, ControlChannel, EventStream};
pub use launcher::{DaemonLauncher, ExternalDaemon, LaunchedDaemon, TorProcessLauncher};
pub use protocol::{
    parse_keywords, quote, BootstrapStatus, ControlEvent, EventKind, Reply, ReplyLine,
    ReplyParser, Severity, ASYNC_EVENT_CODE,
};

use std::time::Duration;

/// Default SOCKS5 proxy port for Tor.
pub const DEFAULT_SOCKS_PORT: u16 = 9050;

/// Default bootstrap timeout (milliseconds).
pub const DEFAULT_TIMEOUT_MS: u32 = 120_000;

/// How long shutdown waits for in-flight commands and daemon exit.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on waiting for a single control reply.
pub const CONTROL_REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum attempts to open the control connection after launch.
pub const MAX_CONNECT_RETRIES: u32 = 3;

/// Bootstrap percentage at which the daemon is usable.
pub const BOOTSTRAP_DONE: u8 = 100;
