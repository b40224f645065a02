//! Daemon launch.
//!
//! [`TorProcessLauncher`] spawns the `tor` binary against the configured
//! data directory and waits for it to publish its control port.
//! [`ExternalDaemon`] attaches to a daemon someone else runs.

use super::control::ControlAuth;
use crate::config::ValidatedConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};

/// File Tor writes its control address to.
const CONTROL_PORT_FILE: &str = "control_port";

/// Cookie file Tor writes into its data directory.
const COOKIE_FILE: &str = "control_auth_cookie";

/// How often the control port file is polled during startup.
const PORT_FILE_POLL: Duration = Duration::from_millis(50);

/// Env var overriding the tor binary.
pub const TOR_BIN_ENV: &str = "TOR_BIN";

/// Spawns or embeds the daemon.
#[async_trait]
pub trait DaemonLauncher: Send + Sync {
    /// Bring up a daemon for `config` and report how to reach its control port.
    async fn launch(&self, config: &ValidatedConfig) -> Result<LaunchedDaemon>;
}

/// A daemon that was launched (or attached to) for one lifecycle.
#[derive(Debug)]
pub struct LaunchedDaemon {
    /// Control port address.
    pub control_endpoint: SocketAddr,
    /// Credentials for the control port.
    pub auth: ControlAuth,
    /// Whether this lifecycle owns the daemon and should `TAKEOWNERSHIP`.
    pub owned: bool,
    child: Option<Child>,
}

impl LaunchedDaemon {
    /// A daemon reachable at `control_endpoint` with no process handle.
    pub fn new(control_endpoint: SocketAddr, auth: ControlAuth, owned: bool) -> Self {
        Self {
            control_endpoint,
            auth,
            owned,
            child: None,
        }
    }

    /// Attach the spawned process.
    pub fn with_child(mut self, child: Child) -> Self {
        self.child = Some(child);
        self
    }

    /// OS process id, if this lifecycle spawned the daemon.
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(|c| c.id())
    }

    /// Wait up to `timeout` for the process to exit, then kill it.
    ///
    /// No-op for daemons without a process handle.
    pub async fn terminate(&mut self, timeout: Duration) -> Result<()> {
        let Some(child) = self.child.as_mut() else {
            return Ok(());
        };

        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(status = %status, "Tor exited");
                self.child = None;
                Ok(())
            }
            Ok(Err(e)) => Err(Error::Io(e)),
            Err(_) => {
                tracing::warn!(pid = ?child.id(), "Tor did not exit in time, killing");
                self.kill().await
            }
        }
    }

    /// Kill the process immediately.
    pub async fn kill(&mut self) -> Result<()> {
        if let Some(mut child) = self.child.take() {
            child.kill().await?;
            tracing::info!("Tor killed");
        }
        Ok(())
    }
}

/// Spawns the `tor` binary.
#[derive(Debug, Clone)]
pub struct TorProcessLauncher {
    binary: PathBuf,
}

impl TorProcessLauncher {
    /// Use a specific binary.
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Binary from `TOR_BIN`, else `tor` on `PATH`.
    pub fn from_env() -> Self {
        Self::new(std::env::var_os(TOR_BIN_ENV).map(PathBuf::from).unwrap_or_else(|| "tor".into()))
    }

    fn command(&self, config: &ValidatedConfig, port_file: &Path) -> Command {
        let control_port = config
            .control_port
            .map(|p| p.to_string())
            .unwrap_or_else(|| "auto".into());

        let mut cmd = Command::new(&self.binary);
        cmd.arg("--ignore-missing-torrc")
            .arg("-f")
            .arg(config.data_dir.join("torrc"))
            .arg("--SocksPort")
            .arg(config.socks_port.to_string())
            .arg("--ControlPort")
            .arg(control_port)
            .arg("--ControlPortWriteToFile")
            .arg(port_file)
            .arg("--CookieAuthentication")
            .arg("1")
            .arg("--DataDirectory")
            .arg(&config.data_dir)
            .arg("--__OwningControllerProcess")
            .arg(std::process::id().to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

impl Default for TorProcessLauncher {
    fn default() -> Self {
        Self::from_env()
    }
}

#[async_trait]
impl DaemonLauncher for TorProcessLauncher {
    async fn launch(&self, config: &ValidatedConfig) -> Result<LaunchedDaemon> {
        let port_file = config.data_dir.join(CONTROL_PORT_FILE);
        // A stale file from a previous run would point at a dead port
        match tokio::fs::remove_file(&port_file).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::Io(e)),
        }

        let mut child = self
            .command(config, &port_file)
            .spawn()
            .map_err(|e| Error::Daemon(format!("failed to spawn {:?}: {}", self.binary, e)))?;

        tracing::info!(
            binary = ?self.binary,
            pid = ?child.id(),
            socks_port = config.socks_port.get(),
            "Spawned tor"
        );

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(target: "tor", "{}", line);
                }
            });
        }

        let control_endpoint = loop {
            if let Some(status) = child.try_wait()? {
                return Err(Error::Daemon(format!("tor exited during startup: {}", status)));
            }
            if let Some(endpoint) = read_control_port_file(&port_file).await {
                break endpoint;
            }
            tokio::time::sleep(PORT_FILE_POLL).await;
        };

        tracing::debug!(endpoint = %control_endpoint, "Tor control port published");

        let auth = ControlAuth::Cookie(config.data_dir.join(COOKIE_FILE));
        Ok(LaunchedDaemon::new(control_endpoint, auth, true).with_child(child))
    }
}

/// Parse `PORT=127.0.0.1:NNNN` from the control port file.
async fn read_control_port_file(path: &Path) -> Option<SocketAddr> {
    let contents = tokio::fs::read_to_string(path).await.ok()?;
    parse_control_port_file(&contents)
}

fn parse_control_port_file(contents: &str) -> Option<SocketAddr> {
    contents
        .lines()
        .find_map(|line| line.trim().strip_prefix("PORT="))
        .and_then(|addr| addr.parse().ok())
}

/// A daemon managed outside this process.
///
/// Launch only reports the endpoint; shutdown leaves the daemon running.
#[derive(Debug, Clone)]
pub struct ExternalDaemon {
    /// Control port address.
    pub control_endpoint: SocketAddr,
    /// Credentials for the control port.
    pub auth: ControlAuth,
}

#[async_trait]
impl DaemonLauncher for ExternalDaemon {
    async fn launch(&self, _config: &ValidatedConfig) -> Result<LaunchedDaemon> {
        tracing::info!(endpoint = %self.control_endpoint, "Attaching to running tor");
        Ok(LaunchedDaemon::new(self.control_endpoint, self.auth.clone(), false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{validate, ServiceConfig};

    #[test]
    fn test_parse_control_port_file() {
        assert_eq!(
            parse_control_port_file("PORT=127.0.0.1:39123\n"),
            Some("127.0.0.1:39123".parse().unwrap())
        );
        assert_eq!(parse_control_port_file(""), None);
        assert_eq!(parse_control_port_file("PORT=garbage"), None);
    }

    #[test]
    fn test_command_line() {
        let mut config = ServiceConfig::new("/tmp/tk-launch");
        config.control_port = Some(9151);
        let validated = validate(&config).unwrap();

        let launcher = TorProcessLauncher::new("/usr/bin/tor");
        let cmd = launcher.command(&validated, Path::new("/tmp/tk-launch/control_port"));
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        let pos = |flag: &str| args.iter().position(|a| a == flag).unwrap();
        assert_eq!(args[pos("--SocksPort") + 1], "9050");
        assert_eq!(args[pos("--ControlPort") + 1], "9151");
        assert_eq!(args[pos("--CookieAuthentication") + 1], "1");
        assert_eq!(args[pos("--DataDirectory") + 1], "/tmp/tk-launch");
        assert_eq!(
            args[pos("--__OwningControllerProcess") + 1],
            std::process::id().to_string()
        );
    }

    #[test]
    fn test_auto_control_port() {
        let validated = validate(&ServiceConfig::new("/tmp/tk-launch")).unwrap();
        let cmd = TorProcessLauncher::new("tor").command(&validated, Path::new("/x"));
        let args: Vec<_> = cmd.as_std().get_args().collect();
        assert!(args.iter().any(|a| *a == "auto"));
    }

    #[tokio::test]
    async fn test_missing_binary_is_daemon_error() {
        let tmp = tempfile::tempdir().unwrap();
        let validated = validate(&ServiceConfig::new(tmp.path())).unwrap();
        let launcher = TorProcessLauncher::new(tmp.path().join("no-such-tor"));
        let err = launcher.launch(&validated).await.unwrap_err();
        assert!(matches!(err, Error::Daemon(_)));
    }

    #[tokio::test]
    async fn test_external_daemon_not_owned() {
        let validated = validate(&ServiceConfig::new("/tmp/tk-ext")).unwrap();
        let external = ExternalDaemon {
            control_endpoint: "127.0.0.1:9051".parse().unwrap(),
            auth: ControlAuth::Null,
        };
        let mut daemon = external.launch(&validated).await.unwrap();
        assert!(!daemon.owned);
        assert_eq!(daemon.pid(), None);
        daemon.terminate(Duration::from_millis(10)).await.unwrap();
    }
}
