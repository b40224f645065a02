//! Lifecycle state and bootstrap progress.

use crate::error::{Error, Result};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;

/// Lifecycle of the managed daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleState {
    /// Nothing launched yet.
    NotStarted,
    /// Launched, waiting for 100% bootstrap.
    Bootstrapping,
    /// Usable.
    Running,
    /// Tearing down.
    ShuttingDown,
    /// Torn down; the supervisor cannot start again.
    Stopped,
    /// Last attempt failed; a new start may retry.
    Failed(String),
}

impl LifecycleState {
    /// Numeric code handed to bindings.
    pub fn code(&self) -> i32 {
        match self {
            LifecycleState::NotStarted => 0,
            LifecycleState::Bootstrapping => 1,
            LifecycleState::Running => 2,
            LifecycleState::ShuttingDown => 3,
            LifecycleState::Stopped => 4,
            LifecycleState::Failed(_) => -1,
        }
    }

    /// Short name without the failure reason.
    pub fn name(&self) -> &'static str {
        match self {
            LifecycleState::NotStarted => "not_started",
            LifecycleState::Bootstrapping => "bootstrapping",
            LifecycleState::Running => "running",
            LifecycleState::ShuttingDown => "shutting_down",
            LifecycleState::Stopped => "stopped",
            LifecycleState::Failed(_) => "failed",
        }
    }

    /// Whether moving to `next` is allowed.
    pub fn can_transition_to(&self, next: &LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (NotStarted, Bootstrapping)
                | (Failed(_), Bootstrapping)
                | (Bootstrapping, Running)
                | (Bootstrapping, Failed(_))
                | (Running, ShuttingDown)
                | (Running, Failed(_))
                | (Failed(_), ShuttingDown)
                | (ShuttingDown, Stopped)
        )
    }

    /// Failure reason, if failed.
    pub fn failure(&self) -> Option<&str> {
        match self {
            LifecycleState::Failed(reason) => Some(reason),
            _ => None,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Failed(reason) => write!(f, "failed: {}", reason),
            other => f.write_str(other.name()),
        }
    }
}

/// Point-in-time view of the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceStatus {
    /// Lifecycle state.
    pub state: LifecycleState,
    /// Bootstrap percentage of the current or last attempt.
    pub bootstrap_percent: u8,
    /// Last bootstrap phase summary.
    pub bootstrap_summary: Option<String>,
    /// Last problem the daemon reported while bootstrapping.
    pub bootstrap_warning: Option<String>,
    /// SOCKS5 proxy address, once running.
    pub socks_endpoint: Option<SocketAddr>,
    /// Control port address, once running.
    pub control_endpoint: Option<SocketAddr>,
}

impl Default for ServiceStatus {
    fn default() -> Self {
        Self {
            state: LifecycleState::NotStarted,
            bootstrap_percent: 0,
            bootstrap_summary: None,
            bootstrap_warning: None,
            socks_endpoint: None,
            control_endpoint: None,
        }
    }
}

/// Shared, observable [`ServiceStatus`].
///
/// Cheap to clone; all clones see the same state.
#[derive(Debug, Clone)]
pub struct StatusReporter {
    tx: Arc<watch::Sender<ServiceStatus>>,
}

impl Default for StatusReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusReporter {
    /// Reporter in `NotStarted`.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ServiceStatus::default());
        Self { tx: Arc::new(tx) }
    }

    /// Current snapshot.
    pub fn status(&self) -> ServiceStatus {
        self.tx.borrow().clone()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.tx.borrow().state.clone()
    }

    /// Whether the service is running.
    pub fn is_running(&self) -> bool {
        self.tx.borrow().state == LifecycleState::Running
    }

    /// `Ok` if running, else [`Error::ServiceNotReady`].
    pub fn require_running(&self) -> Result<()> {
        let state = self.state();
        if state == LifecycleState::Running {
            Ok(())
        } else {
            Err(Error::ServiceNotReady(state.name().to_string()))
        }
    }

    /// Stream of snapshots. The receiver starts at the current value.
    pub fn subscribe(&self) -> watch::Receiver<ServiceStatus> {
        self.tx.subscribe()
    }

    /// Move to `next`, returning the previous state.
    ///
    /// Entering `Bootstrapping` resets progress; leaving `Running` clears
    /// the published endpoints.
    pub fn transition(&self, next: LifecycleState) -> Result<LifecycleState> {
        self.apply(next, None)
    }

    /// Move to `Running` and publish the endpoints in the same update.
    pub fn mark_running(&self, socks: SocketAddr, control: SocketAddr) -> Result<LifecycleState> {
        self.apply(LifecycleState::Running, Some((socks, control)))
    }

    fn apply(
        &self,
        next: LifecycleState,
        endpoints: Option<(SocketAddr, SocketAddr)>,
    ) -> Result<LifecycleState> {
        let mut outcome = None;
        self.tx.send_if_modified(|status| {
            if !status.state.can_transition_to(&next) {
                outcome = Some(Err(Error::InvalidTransition {
                    from: status.state.name().to_string(),
                    to: next.name().to_string(),
                }));
                return false;
            }

            match &next {
                LifecycleState::Bootstrapping => {
                    status.bootstrap_percent = 0;
                    status.bootstrap_summary = None;
                    status.bootstrap_warning = None;
                    status.socks_endpoint = None;
                    status.control_endpoint = None;
                }
                LifecycleState::Running => {
                    if let Some((socks, control)) = endpoints {
                        status.socks_endpoint = Some(socks);
                        status.control_endpoint = Some(control);
                    }
                }
                _ => {
                    status.socks_endpoint = None;
                    status.control_endpoint = None;
                }
            }

            let previous = std::mem::replace(&mut status.state, next.clone());
            outcome = Some(Ok(previous));
            true
        });

        let previous = outcome.unwrap_or_else(|| {
            Err(Error::InvalidTransition {
                from: "unknown".into(),
                to: next.name().to_string(),
            })
        })?;
        tracing::info!(from = %previous.name(), to = %next, "Lifecycle transition");
        Ok(previous)
    }

    /// Record bootstrap progress. Ignored outside `Bootstrapping` and when
    /// it would move backwards. Returns whether the snapshot changed.
    pub fn update_bootstrap(&self, progress: u8, summary: &str) -> bool {
        let progress = progress.min(100);
        self.tx.send_if_modified(|status| {
            if status.state != LifecycleState::Bootstrapping || progress < status.bootstrap_percent {
                return false;
            }
            let summary_changed = status.bootstrap_summary.as_deref() != Some(summary);
            if progress == status.bootstrap_percent && !summary_changed {
                return false;
            }
            status.bootstrap_percent = progress;
            if summary_changed {
                status.bootstrap_summary = Some(summary.to_string());
            }
            true
        })
    }

    /// Remember a bootstrap problem. Ignored outside `Bootstrapping`.
    pub fn record_bootstrap_warning(&self, warning: &str) -> bool {
        self.tx.send_if_modified(|status| {
            if status.state != LifecycleState::Bootstrapping
                || status.bootstrap_warning.as_deref() == Some(warning)
            {
                return false;
            }
            status.bootstrap_warning = Some(warning.to_string());
            true
        })
    }

    /// Last bootstrap problem of the current attempt.
    pub fn bootstrap_warning(&self) -> Option<String> {
        self.tx.borrow().bootstrap_warning.clone()
    }

    /// Bootstrap percentage.
    pub fn bootstrap_percent(&self) -> u8 {
        self.tx.borrow().bootstrap_percent
    }
}
