//! Configuration validation.
//!
//! Fail-fast checks with no side effects. The data directory is only
//! inspected syntactically here; [`super::DataDirectory`] touches the disk.

use super::{HiddenServiceConfig, ServiceConfig};
use crate::error::ConfigError;
use std::net::{Ipv4Addr, SocketAddr};
use std::num::NonZeroU16;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

/// A configuration that passed [`validate`].
#[derive(Debug, Clone)]
pub struct ValidatedConfig {
    /// SOCKS5 port.
    pub socks_port: NonZeroU16,
    /// Fixed control port, if any.
    pub control_port: Option<NonZeroU16>,
    /// Normalized absolute data directory.
    pub data_dir: PathBuf,
    /// Bootstrap timeout.
    pub timeout: Duration,
    /// Hidden service to create once running.
    pub hidden_service: Option<HiddenServiceConfig>,
}

impl ValidatedConfig {
    /// Loopback SOCKS endpoint published once the daemon runs.
    pub fn socks_endpoint(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, self.socks_port.get()))
    }

    /// Bootstrap timeout in milliseconds.
    pub fn timeout_ms(&self) -> u64 {
        self.timeout.as_millis() as u64
    }
}

/// Validate and normalize a service configuration.
pub fn validate(config: &ServiceConfig) -> Result<ValidatedConfig, ConfigError> {
    let socks_port = port("socks_port", config.socks_port)?;
    let control_port = config
        .control_port
        .map(|p| port("control_port", p))
        .transpose()?;

    if config.timeout_ms == 0 {
        return Err(ConfigError::ZeroTimeout);
    }

    let data_dir = normalize_data_dir(&config.data_dir)?;

    let mut ports = vec![("socks_port", socks_port.get())];
    if let Some(control) = control_port {
        ports.push(("control_port", control.get()));
    }
    if let Some(hs) = &config.hidden_service {
        check_hidden_service_ports(hs, &mut ports)?;
    } else {
        check_distinct(&ports)?;
    }

    Ok(ValidatedConfig {
        socks_port,
        control_port,
        data_dir,
        timeout: Duration::from_millis(u64::from(config.timeout_ms)),
        hidden_service: config.hidden_service.clone(),
    })
}

/// Validate a hidden service against the ports of a running service.
pub fn validate_hidden_service(
    hs: &HiddenServiceConfig,
    running: &ValidatedConfig,
) -> Result<(), ConfigError> {
    let mut ports = vec![("socks_port", running.socks_port.get())];
    if let Some(control) = running.control_port {
        ports.push(("control_port", control.get()));
    }
    check_hidden_service_ports(hs, &mut ports)
}

fn check_hidden_service_ports(
    hs: &HiddenServiceConfig,
    ports: &mut Vec<(&'static str, u16)>,
) -> Result<(), ConfigError> {
    let virtual_port = port("virtual_port", hs.virtual_port)?;
    let target_port = port("target_port", hs.target_port)?;

    check_distinct(ports)?;

    // virtual and target may coincide; each must stay clear of the daemon's own ports
    for (name, value) in [("virtual_port", virtual_port.get()), ("target_port", target_port.get())] {
        if let Some((other, _)) = ports.iter().find(|(_, p)| *p == value) {
            return Err(ConfigError::DuplicatePort {
                first: *other,
                second: name,
                port: value,
            });
        }
    }
    ports.push(("virtual_port", virtual_port.get()));
    ports.push(("target_port", target_port.get()));
    Ok(())
}

fn check_distinct(ports: &[(&'static str, u16)]) -> Result<(), ConfigError> {
    for (i, (first, a)) in ports.iter().enumerate() {
        for (second, b) in &ports[i + 1..] {
            if a == b {
                return Err(ConfigError::DuplicatePort {
                    first: *first,
                    second: *second,
                    port: *a,
                });
            }
        }
    }
    Ok(())
}

fn port(name: &'static str, value: u16) -> Result<NonZeroU16, ConfigError> {
    NonZeroU16::new(value).ok_or(ConfigError::InvalidPort { name })
}

fn normalize_data_dir(path: &Path) -> Result<PathBuf, ConfigError> {
    if !path.is_absolute() {
        return Err(ConfigError::RelativeDataDir(path.to_path_buf()));
    }

    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> ServiceConfig {
        ServiceConfig {
            socks_port: 9050,
            data_dir: PathBuf::from("/tmp/t"),
            timeout_ms: 60_000,
            control_port: None,
            hidden_service: None,
        }
    }

    #[test]
    fn test_valid_config() {
        let validated = validate(&base()).expect("valid");
        assert_eq!(validated.socks_port.get(), 9050);
        assert_eq!(validated.timeout, Duration::from_secs(60));
        assert_eq!(validated.socks_endpoint().to_string(), "127.0.0.1:9050");
    }

    #[test]
    fn test_zero_ports_rejected() {
        let mut config = base();
        config.socks_port = 0;
        assert_eq!(
            validate(&config).unwrap_err(),
            ConfigError::InvalidPort { name: "socks_port" }
        );

        let mut config = base();
        config.control_port = Some(0);
        assert!(matches!(
            validate(&config),
            Err(ConfigError::InvalidPort { name: "control_port" })
        ));
    }

    #[test]
    fn test_duplicate_ports_rejected() {
        let mut config = base();
        config.control_port = Some(9050);
        assert!(matches!(
            validate(&config),
            Err(ConfigError::DuplicatePort { port: 9050, .. })
        ));

        let mut config = base();
        config.control_port = Some(9051);
        config.hidden_service = Some(HiddenServiceConfig::generated(80, 9051));
        assert!(matches!(
            validate(&config),
            Err(ConfigError::DuplicatePort { port: 9051, .. })
        ));
    }

    #[test]
    fn test_hidden_service_virtual_may_equal_target() {
        let mut config = base();
        config.hidden_service = Some(HiddenServiceConfig::generated(8080, 8080));
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_relative_data_dir_rejected() {
        let mut config = base();
        config.data_dir = PathBuf::from("relative/dir");
        assert!(matches!(validate(&config), Err(ConfigError::RelativeDataDir(_))));
    }

    #[test]
    fn test_data_dir_normalized() {
        let mut config = base();
        config.data_dir = PathBuf::from("/tmp/./a/../tor");
        let validated = validate(&config).expect("valid");
        assert_eq!(validated.data_dir, PathBuf::from("/tmp/tor"));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut config = base();
        config.timeout_ms = 0;
        assert_eq!(validate(&config).unwrap_err(), ConfigError::ZeroTimeout);
    }

    #[test]
    fn test_hidden_service_against_running() {
        let mut config = base();
        config.control_port = Some(9051);
        let running = validate(&config).expect("valid");

        assert!(validate_hidden_service(&HiddenServiceConfig::generated(9055, 9056), &running).is_ok());
        assert!(validate_hidden_service(&HiddenServiceConfig::generated(9050, 9056), &running).is_err());
        assert!(validate_hidden_service(&HiddenServiceConfig::generated(0, 9056), &running).is_err());
    }
}
