//! Daemon lifecycle supervision.
//!
//! ## Design
//!
//! A supervisor owns at most one daemon lifecycle. `start` is single-flight:
//! the first caller launches a detached attempt task and every concurrent
//! caller waits on the same settled [`StartResult`]. Dropping a waiting
//! caller never cancels the attempt, so the daemon ends up either fully
//! running or failed and torn down.
//!
//! The supervisor is the only owner of the control channel; the registry
//! and HTTP client get capability-scoped access through it.

use crate::config::{
    validate, validate_hidden_service, DataDirectory, FsDataDirectory, HiddenServiceConfig,
    ServiceConfig, ValidatedConfig,
};
use crate::error::{Error, Result};
use crate::hidden_service::{HiddenServiceHandle, HiddenServiceRegistry};
use crate::http::ProxyHttpClient;
use crate::status::{LifecycleState, ServiceStatus, StatusReporter};
use crate::tor::{
    BootstrapStatus, ControlChannel, DaemonLauncher, EventKind, LaunchedDaemon, Severity,
    TorProcessLauncher, DEFAULT_SHUTDOWN_TIMEOUT, MAX_CONNECT_RETRIES,
};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

/// Delay between control connection attempts, multiplied by the attempt number.
const CONNECT_BACKOFF: Duration = Duration::from_millis(200);

/// Tunables that are not part of [`ServiceConfig`].
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Bound on draining commands and waiting for the daemon to exit.
    pub shutdown_timeout: Duration,
    /// Control connection attempts after launch.
    pub connect_attempts: u32,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            connect_attempts: MAX_CONNECT_RETRIES,
        }
    }
}

/// Outcome of one start attempt.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StartResult {
    /// Whether the daemon is running (and the requested hidden service exists).
    pub success: bool,
    /// Address of the hidden service created during start.
    pub onion_address: Option<String>,
    /// Control port of the running daemon.
    pub control_endpoint: Option<SocketAddr>,
    /// Why the attempt failed.
    pub error_message: Option<String>,
}

impl StartResult {
    fn failure(error: &Error) -> Self {
        Self {
            success: false,
            error_message: Some(error.to_string()),
            ..Self::default()
        }
    }
}

enum Flight {
    Idle,
    InFlight(watch::Receiver<Option<StartResult>>),
}

enum Begin {
    Settled(StartResult),
    Wait(watch::Receiver<Option<StartResult>>),
}

struct Session {
    daemon: LaunchedDaemon,
    channel: Arc<ControlChannel>,
    config: ValidatedConfig,
    monitor: Option<JoinHandle<()>>,
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(monitor) = self.monitor.take() {
            monitor.abort();
        }
    }
}

struct Shared {
    status: StatusReporter,
    registry: HiddenServiceRegistry,
    launcher: Arc<dyn DaemonLauncher>,
    data_dir: Arc<dyn DataDirectory>,
    options: SupervisorOptions,
    flight: StdMutex<Flight>,
    last_result: StdMutex<Option<StartResult>>,
    session: Mutex<Option<Session>>,
    shutdown_lock: Mutex<()>,
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Owns one daemon lifecycle.
///
/// Cheap to clone; clones share the lifecycle.
#[derive(Clone)]
pub struct ServiceSupervisor {
    shared: Arc<Shared>,
}

impl Default for ServiceSupervisor {
    fn default() -> Self {
        Self::new(Arc::new(TorProcessLauncher::from_env()))
    }
}

impl ServiceSupervisor {
    /// Supervisor using `launcher` and the filesystem data directory.
    pub fn new(launcher: Arc<dyn DaemonLauncher>) -> Self {
        Self::with_parts(launcher, Arc::new(FsDataDirectory), SupervisorOptions::default())
    }

    /// Supervisor with every collaborator supplied.
    pub fn with_parts(
        launcher: Arc<dyn DaemonLauncher>,
        data_dir: Arc<dyn DataDirectory>,
        options: SupervisorOptions,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                status: StatusReporter::new(),
                registry: HiddenServiceRegistry::new(),
                launcher,
                data_dir,
                options,
                flight: StdMutex::new(Flight::Idle),
                last_result: StdMutex::new(None),
                session: Mutex::new(None),
                shutdown_lock: Mutex::new(()),
            }),
        }
    }

    /// Validate `config` and make its data directory usable.
    ///
    /// No state change and no daemon interaction.
    pub fn prepare(&self, config: &ServiceConfig) -> Result<ValidatedConfig> {
        let validated = validate(config)?;
        self.shared.data_dir.prepare(&validated.data_dir)?;
        Ok(validated)
    }

    /// Validate `config` and prepare its data directory on the blocking pool.
    async fn prepare_blocking(&self, config: &ServiceConfig) -> Result<ValidatedConfig> {
        let validated = validate(config)?;
        let data_dir = self.shared.data_dir.clone();
        let path = validated.data_dir.clone();
        tokio::task::spawn_blocking(move || data_dir.prepare(&path))
            .await
            .map_err(|e| Error::Daemon(format!("data directory task failed: {}", e)))??;
        Ok(validated)
    }

    /// Start the daemon unless it is already running.
    ///
    /// Running returns the previous result; a start in progress is joined.
    pub async fn start(&self, config: &ServiceConfig) -> StartResult {
        let joined = self.joinable(&lock(&self.shared.flight));
        let begin = match joined {
            Some(begin) => begin,
            None => match self.prepare_blocking(config).await {
                Ok(validated) => self.begin(validated),
                Err(e) => {
                    tracing::warn!(error = %e, "Start rejected");
                    Begin::Settled(StartResult::failure(&e))
                }
            },
        };
        match begin {
            Begin::Settled(result) => result,
            Begin::Wait(rx) => wait_settled(rx).await,
        }
    }

    /// The result a start call gets without launching anything, if any.
    fn joinable(&self, flight: &Flight) -> Option<Begin> {
        if let Flight::InFlight(rx) = flight {
            tracing::debug!("Start already in progress, joining");
            return Some(Begin::Wait(rx.clone()));
        }

        match self.shared.status.state() {
            LifecycleState::Running => {
                let previous = lock(&self.shared.last_result).clone();
                Some(Begin::Settled(previous.unwrap_or(StartResult {
                    success: true,
                    ..StartResult::default()
                })))
            }
            LifecycleState::Stopped | LifecycleState::ShuttingDown => Some(Begin::Settled(StartResult {
                success: false,
                error_message: Some("supervisor stopped".into()),
                ..StartResult::default()
            })),
            LifecycleState::NotStarted
            | LifecycleState::Failed(_)
            | LifecycleState::Bootstrapping => None,
        }
    }

    fn begin(&self, validated: ValidatedConfig) -> Begin {
        let mut flight = lock(&self.shared.flight);
        // Another caller may have launched while the data directory was prepared.
        if let Some(begin) = self.joinable(&flight) {
            return begin;
        }

        if let Err(e) = self.shared.status.transition(LifecycleState::Bootstrapping) {
            return Begin::Settled(StartResult::failure(&e));
        }

        let (tx, rx) = watch::channel(None);
        *flight = Flight::InFlight(rx.clone());
        drop(flight);

        let shared = self.shared.clone();
        tokio::spawn(async move {
            let result = shared.run_attempt(validated).await;
            *lock(&shared.last_result) = Some(result.clone());
            *lock(&shared.flight) = Flight::Idle;
            let _ = tx.send(Some(result));
        });

        Begin::Wait(rx)
    }

    /// Current status. Never blocks on the daemon.
    pub fn status(&self) -> ServiceStatus {
        self.shared.status.status()
    }

    /// Stream of status snapshots.
    pub fn subscribe_status(&self) -> watch::Receiver<ServiceStatus> {
        self.shared.status.subscribe()
    }

    /// Shared status handle.
    pub fn reporter(&self) -> StatusReporter {
        self.shared.status.clone()
    }

    /// Registry of hidden services created through this supervisor.
    pub fn registry(&self) -> &HiddenServiceRegistry {
        &self.shared.registry
    }

    /// HTTP client routed through this supervisor's SOCKS endpoint.
    pub fn http_client(&self) -> ProxyHttpClient {
        ProxyHttpClient::new(self.shared.status.clone())
    }

    /// Control channel of the running daemon.
    pub async fn control_channel(&self) -> Result<Arc<ControlChannel>> {
        Ok(self.running_session().await?.0)
    }

    async fn running_session(&self) -> Result<(Arc<ControlChannel>, ValidatedConfig)> {
        self.shared.status.require_running()?;
        let session = self.shared.session.lock().await;
        match session.as_ref() {
            Some(s) if self.shared.status.is_running() => Ok((s.channel.clone(), s.config.clone())),
            _ => Err(Error::ServiceNotReady(self.shared.status.state().name().to_string())),
        }
    }

    /// Create a hidden service on the running daemon.
    pub async fn create_hidden_service(
        &self,
        config: &HiddenServiceConfig,
    ) -> Result<HiddenServiceHandle> {
        let (channel, running) = self.running_session().await?;
        validate_hidden_service(config, &running)?;
        self.shared.registry.create(&channel, config).await
    }

    /// Delete a hidden service created through this supervisor.
    pub async fn delete_hidden_service(&self, onion_address: &str) -> Result<bool> {
        let (channel, _) = self.running_session().await?;
        self.shared.registry.delete(&channel, onion_address).await
    }

    /// Tear the daemon down.
    ///
    /// Waits for any in-flight start. Returns whether cleanup succeeded;
    /// `true` when there was nothing to do.
    pub async fn shutdown(&self) -> bool {
        let _serial = self.shared.shutdown_lock.lock().await;

        loop {
            let in_flight = match &*lock(&self.shared.flight) {
                Flight::InFlight(rx) => Some(rx.clone()),
                Flight::Idle => None,
            };
            if let Some(rx) = in_flight {
                tracing::debug!("Shutdown waiting for start attempt");
                wait_settled(rx).await;
                continue;
            }

            let flight = lock(&self.shared.flight);
            if matches!(&*flight, Flight::InFlight(_)) {
                continue;
            }
            match self.shared.status.state() {
                LifecycleState::NotStarted | LifecycleState::Stopped => return true,
                LifecycleState::Running | LifecycleState::Failed(_) => {
                    if let Err(e) = self.shared.status.transition(LifecycleState::ShuttingDown) {
                        tracing::warn!(error = %e, "Shutdown transition rejected");
                        return false;
                    }
                    drop(flight);
                    break;
                }
                // Another shutdown holds the lock; unreachable while we hold it.
                LifecycleState::ShuttingDown | LifecycleState::Bootstrapping => return false,
            }
        }

        let timeout = self.shared.options.shutdown_timeout;
        let mut ok = true;

        let session = self.shared.session.lock().await.take();
        if let Some(mut session) = session {
            if let Some(monitor) = session.monitor.take() {
                monitor.abort();
            }
            if !session.channel.is_closed() {
                ok &= self.shared.registry.close_all(&session.channel).await;
            }
            if let Err(e) = session.channel.close(timeout).await {
                tracing::warn!(error = %e, "Control channel did not close cleanly");
                ok = false;
            }
            if let Err(e) = session.daemon.terminate(timeout).await {
                tracing::warn!(error = %e, "Failed to terminate tor");
                ok = false;
            }
        }
        self.shared.registry.invalidate();

        if let Err(e) = self.shared.status.transition(LifecycleState::Stopped) {
            tracing::warn!(error = %e, "Stop transition rejected");
            ok = false;
        }

        tracing::info!(clean = ok, "Service stopped");
        ok
    }
}

async fn wait_settled(mut rx: watch::Receiver<Option<StartResult>>) -> StartResult {
    let settled = match rx.wait_for(|r| r.is_some()).await {
        Ok(result) => result.clone(),
        Err(_) => None,
    };
    settled.unwrap_or_else(|| StartResult {
        success: false,
        error_message: Some("start attempt aborted".into()),
        ..StartResult::default()
    })
}

impl Shared {
    async fn run_attempt(self: &Arc<Self>, config: ValidatedConfig) -> StartResult {
        tracing::info!(
            data_dir = ?config.data_dir,
            socks_port = config.socks_port.get(),
            timeout_ms = config.timeout_ms(),
            "Starting tor"
        );

        // Dropping the bring-up future on timeout drops whatever it launched.
        let outcome = match tokio::time::timeout(config.timeout, self.bring_up(&config)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::BootstrapTimeout {
                timeout_ms: config.timeout_ms(),
                progress: self.status.bootstrap_percent(),
                warning: self.status.bootstrap_warning(),
            }),
        };

        let (daemon, channel) = match outcome {
            Ok(up) => up,
            Err(e) => {
                tracing::warn!(error = %e, bootstrap = e.is_bootstrap_failure(), "Tor failed to start");
                if let Err(te) = self.status.transition(LifecycleState::Failed(e.to_string())) {
                    tracing::warn!(error = %te, "Failed transition rejected");
                }
                return StartResult::failure(&e);
            }
        };

        let control_endpoint = channel.endpoint();
        *self.session.lock().await = Some(Session {
            daemon,
            channel: channel.clone(),
            config: config.clone(),
            monitor: None,
        });

        if let Err(e) = self
            .status
            .mark_running(config.socks_endpoint(), control_endpoint)
        {
            return StartResult::failure(&e);
        }

        let monitor = tokio::spawn(monitor_channel(Arc::downgrade(self), channel.clone()));
        if let Some(session) = self.session.lock().await.as_mut() {
            session.monitor = Some(monitor);
        }

        tracing::info!(
            socks = %config.socks_endpoint(),
            control = %control_endpoint,
            "Tor running"
        );

        let mut result = StartResult {
            success: true,
            control_endpoint: Some(control_endpoint),
            ..StartResult::default()
        };

        if let Some(hs) = &config.hidden_service {
            match self.registry.create(&channel, hs).await {
                Ok(handle) => result.onion_address = Some(handle.onion_address.to_string()),
                Err(e) => {
                    tracing::warn!(error = %e, "Hidden service creation failed");
                    result.success = false;
                    result.error_message = Some(format!("hidden service: {}", e));
                }
            }
        }

        result
    }

    async fn bring_up(
        &self,
        config: &ValidatedConfig,
    ) -> Result<(LaunchedDaemon, Arc<ControlChannel>)> {
        let daemon = self.launcher.launch(config).await?;
        let channel = self.connect(&daemon).await?;

        if daemon.owned {
            channel.take_ownership().await?;
        }

        match channel.get_version().await {
            Ok(version) => tracing::info!(version = %version, "Connected to Tor"),
            Err(e) => tracing::debug!(error = %e, "Tor version unavailable"),
        }

        let mut events = channel.subscribe_events(EventKind::StatusClient).await?;

        match channel.get_info("status/bootstrap-phase").await {
            Ok(phase) => {
                if let Some(status) = BootstrapStatus::parse(&phase) {
                    if self.observe(&status)? {
                        return Ok((daemon, Arc::new(channel)));
                    }
                }
            }
            Err(e) => tracing::debug!(error = %e, "Bootstrap phase unavailable"),
        }

        loop {
            let event = match events.next().await {
                Ok(event) => event,
                Err(Error::ChannelClosed) => {
                    return Err(Error::DaemonBootstrap(
                        "control channel closed during bootstrap".into(),
                    ))
                }
                Err(e) => return Err(e),
            };
            if let Some(status) = BootstrapStatus::from_event(&event) {
                if self.observe(&status)? {
                    break;
                }
            }
        }

        Ok((daemon, Arc::new(channel)))
    }

    async fn connect(&self, daemon: &LaunchedDaemon) -> Result<ControlChannel> {
        let attempts = self.options.connect_attempts.max(1);
        let mut attempt = 1;
        loop {
            match ControlChannel::connect(daemon.control_endpoint, &daemon.auth).await {
                Ok(channel) => return Ok(channel),
                Err(Error::Daemon(msg)) if attempt < attempts => {
                    tracing::debug!(attempt, error = %msg, "Control port not ready, retrying");
                    tokio::time::sleep(CONNECT_BACKOFF * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Record a bootstrap report. `Ok(true)` once done.
    fn observe(&self, status: &BootstrapStatus) -> Result<bool> {
        if status.is_fatal() {
            let reason = status.warning.clone().unwrap_or_else(|| status.summary.clone());
            return Err(Error::DaemonBootstrap(format!(
                "{} at {}% ({})",
                reason, status.progress, status.tag
            )));
        }
        if status.severity == Severity::Warn {
            tracing::warn!(
                progress = status.progress,
                tag = %status.tag,
                warning = ?status.warning,
                recommendation = ?status.recommendation,
                "Bootstrap problem"
            );
            let warning = status.warning.as_deref().unwrap_or(&status.summary);
            self.status.record_bootstrap_warning(warning);
        }
        if self.status.update_bootstrap(status.progress, &status.summary) {
            tracing::info!(progress = status.progress, summary = %status.summary, "Bootstrap progress");
        }
        Ok(status.is_done())
    }
}

/// Fail the lifecycle if the channel closes while running.
async fn monitor_channel(shared: Weak<Shared>, channel: Arc<ControlChannel>) {
    channel.closed().await;
    drop(channel);

    let Some(shared) = shared.upgrade() else {
        return;
    };
    // Any state other than Running means shutdown owns the teardown.
    if shared
        .status
        .transition(LifecycleState::Failed("control channel closed".into()))
        .is_err()
    {
        return;
    }

    tracing::warn!("Control channel lost while running");
    shared.registry.invalidate();

    // Keep the slot locked until the daemon is gone so a concurrent
    // shutdown cannot report Stopped while tor still runs.
    let mut slot = shared.session.lock().await;
    if let Some(mut session) = slot.take() {
        // This task is the session's monitor; don't abort ourselves on drop.
        session.monitor.take();
        if let Err(e) = session.daemon.terminate(shared.options.shutdown_timeout).await {
            tracing::warn!(error = %e, "Failed to terminate tor");
        }
    }
    drop(slot);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_result_failure() {
        let result = StartResult::failure(&Error::BootstrapTimeout {
            timeout_ms: 100,
            progress: 0,
            warning: None,
        });
        assert!(!result.success);
        assert!(result.error_message.unwrap().contains("timeout"));
        assert!(result.onion_address.is_none());
    }

    #[tokio::test]
    async fn test_invalid_config_leaves_state() {
        let supervisor = ServiceSupervisor::default();
        let mut config = ServiceConfig::new("relative/path");
        config.timeout_ms = 0;

        let result = supervisor.start(&config).await;
        assert!(!result.success);
        assert_eq!(supervisor.status().state, LifecycleState::NotStarted);
    }

    #[tokio::test]
    async fn test_shutdown_before_start() {
        let supervisor = ServiceSupervisor::default();
        assert!(supervisor.shutdown().await);
        assert!(supervisor.shutdown().await);
        assert_eq!(supervisor.status().state, LifecycleState::NotStarted);
    }

    #[tokio::test]
    async fn test_operations_require_running() {
        let supervisor = ServiceSupervisor::default();
        assert!(matches!(
            supervisor
                .create_hidden_service(&HiddenServiceConfig::generated(80, 8080))
                .await,
            Err(Error::ServiceNotReady(_))
        ));
        assert!(matches!(
            supervisor.delete_hidden_service("x.onion").await,
            Err(Error::ServiceNotReady(_))
        ));
    }
}
