//! Binding façade.
//!
//! [`TorService`] exposes the lifecycle as the flat request/response
//! operations bindings call. Parameter and response types serialize as
//! camelCase JSON so the FFI crate can pass them through unchanged.

use crate::config::{HiddenServiceConfig, KeyMaterial, ServiceConfig};
use crate::error::{ConfigError, Error, Result};
use crate::http::{HttpMethod, HttpRequest, ProxyHttpClient, DEFAULT_REQUEST_TIMEOUT};
use crate::supervisor::{ServiceSupervisor, StartResult};
use crate::tor::{DEFAULT_SOCKS_PORT, DEFAULT_TIMEOUT_MS};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

fn default_socks_port() -> u16 {
    DEFAULT_SOCKS_PORT
}

fn default_timeout_ms() -> u32 {
    DEFAULT_TIMEOUT_MS
}

fn default_request_timeout_ms() -> u64 {
    DEFAULT_REQUEST_TIMEOUT.as_millis() as u64
}

/// Startup parameters for `init_service` and `start_if_not_running`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceParams {
    /// Absolute data directory.
    pub data_dir: String,
    /// SOCKS5 port.
    #[serde(default = "default_socks_port")]
    pub socks_port: u16,
    /// Bootstrap timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u32,
    /// Fixed control port.
    #[serde(default)]
    pub control_port: Option<u16>,
    /// Local port for a hidden service created during start.
    #[serde(default)]
    pub target_port: Option<u16>,
    /// Onion-side port of that service; defaults to `target_port`.
    #[serde(default)]
    pub virtual_port: Option<u16>,
    /// 64-byte expanded secret key for that service.
    #[serde(default)]
    pub key_data: Option<Vec<u8>>,
}

impl ServiceParams {
    /// Parameters with defaults for a data directory.
    pub fn new(data_dir: impl Into<String>) -> Self {
        Self {
            data_dir: data_dir.into(),
            socks_port: DEFAULT_SOCKS_PORT,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            control_port: None,
            target_port: None,
            virtual_port: None,
            key_data: None,
        }
    }
}

impl TryFrom<&ServiceParams> for ServiceConfig {
    type Error = ConfigError;

    fn try_from(params: &ServiceParams) -> std::result::Result<Self, ConfigError> {
        let hidden_service = match params.target_port {
            Some(target_port) => Some(HiddenServiceConfig {
                virtual_port: params.virtual_port.unwrap_or(target_port),
                target_port,
                key_material: KeyMaterial::from_optional_bytes(params.key_data.as_deref())?,
            }),
            None => None,
        };

        Ok(ServiceConfig {
            socks_port: params.socks_port,
            data_dir: PathBuf::from(&params.data_dir),
            timeout_ms: params.timeout_ms,
            control_port: params.control_port,
            hidden_service,
        })
    }
}

/// Result of `start_if_not_running`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartResponse {
    /// Whether the daemon is running with the requested hidden service.
    pub success: bool,
    /// Hidden service created during start.
    pub onion_address: Option<String>,
    /// Control port address.
    pub control_endpoint: Option<String>,
    /// Failure description.
    pub error_message: Option<String>,
}

impl From<StartResult> for StartResponse {
    fn from(result: StartResult) -> Self {
        Self {
            success: result.success,
            onion_address: result.onion_address,
            control_endpoint: result.control_endpoint.map(|e| e.to_string()),
            error_message: result.error_message,
        }
    }
}

/// Result of `get_status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    /// NotStarted 0, Bootstrapping 1, Running 2, ShuttingDown 3, Stopped 4, Failed -1.
    pub code: i32,
    /// State name.
    pub state: String,
    /// Bootstrap percentage.
    pub bootstrap_percent: u8,
    /// Last bootstrap phase summary.
    pub bootstrap_summary: Option<String>,
    /// Last bootstrap problem reported by the daemon.
    pub bootstrap_warning: Option<String>,
    /// SOCKS endpoint when running.
    pub socks_endpoint: Option<String>,
    /// Failure reason when failed.
    pub error_message: Option<String>,
}

/// Parameters of `create_hidden_service`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HiddenServiceParams {
    /// Onion-side port.
    #[serde(alias = "port")]
    pub virtual_port: u16,
    /// Local port.
    pub target_port: u16,
    /// 64-byte expanded secret key; generated when absent.
    #[serde(default)]
    pub key_data: Option<Vec<u8>>,
}

impl TryFrom<&HiddenServiceParams> for HiddenServiceConfig {
    type Error = ConfigError;

    fn try_from(params: &HiddenServiceParams) -> std::result::Result<Self, ConfigError> {
        Ok(HiddenServiceConfig {
            virtual_port: params.virtual_port,
            target_port: params.target_port,
            key_material: KeyMaterial::from_optional_bytes(params.key_data.as_deref())?,
        })
    }
}

/// Result of `create_hidden_service`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HiddenServiceResponse {
    /// `<56 chars>.onion`
    pub onion_address: String,
    /// Daemon-side service id.
    pub control_label: String,
    /// Onion-side port.
    pub virtual_port: u16,
    /// Local port.
    pub target_port: u16,
}

/// Parameters of `http_request`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRequestParams {
    /// GET, POST, PUT, DELETE, PATCH or HEAD.
    pub method: String,
    /// Absolute URL.
    pub url: String,
    /// Header map.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Request body.
    #[serde(default)]
    pub body: Option<String>,
    /// Deadline in milliseconds.
    #[serde(default = "default_request_timeout_ms")]
    pub timeout_ms: u64,
}

/// Result of `http_request`. Transport failures land in `error` with a zero status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpResponseBody {
    /// HTTP status, 0 when no response arrived.
    pub status_code: u16,
    /// Body decoded as UTF-8, lossily.
    pub body: String,
    /// Failure description.
    pub error: Option<String>,
}

impl HttpResponseBody {
    fn failed(error: &Error) -> Self {
        Self {
            status_code: 0,
            body: String::new(),
            error: Some(error.to_string()),
        }
    }
}

/// Flat operation surface over one [`ServiceSupervisor`].
pub struct TorService {
    supervisor: ServiceSupervisor,
    http: ProxyHttpClient,
    initialized: Mutex<Option<ServiceConfig>>,
}

impl Default for TorService {
    fn default() -> Self {
        Self::new(ServiceSupervisor::default())
    }
}

impl TorService {
    /// Façade over `supervisor`.
    pub fn new(supervisor: ServiceSupervisor) -> Self {
        let http = supervisor.http_client();
        Self {
            supervisor,
            http,
            initialized: Mutex::new(None),
        }
    }

    /// Underlying supervisor.
    pub fn supervisor(&self) -> &ServiceSupervisor {
        &self.supervisor
    }

    /// Validate parameters, prepare the data directory, and remember them
    /// for a later parameterless start.
    pub fn init_service(&self, params: &ServiceParams) -> bool {
        let outcome = ServiceConfig::try_from(params)
            .map_err(Error::from)
            .and_then(|config| self.supervisor.prepare(&config).map(|_| config));

        match outcome {
            Ok(config) => {
                *self.initialized.lock().unwrap_or_else(|e| e.into_inner()) = Some(config);
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "Init rejected");
                false
            }
        }
    }

    /// Start unless running. `None` uses the parameters of `init_service`.
    pub async fn start_if_not_running(&self, params: Option<&ServiceParams>) -> StartResponse {
        let config = match params {
            Some(params) => ServiceConfig::try_from(params).map_err(Error::from),
            None => self
                .initialized
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone()
                .ok_or_else(|| Error::ServiceNotReady("not initialized".into())),
        };

        match config {
            Ok(config) => self.supervisor.start(&config).await.into(),
            Err(e) => StartResponse {
                success: false,
                onion_address: None,
                control_endpoint: None,
                error_message: Some(e.to_string()),
            },
        }
    }

    /// Current status.
    pub fn get_status(&self) -> StatusResponse {
        let status = self.supervisor.status();
        StatusResponse {
            code: status.state.code(),
            state: status.state.name().to_string(),
            bootstrap_percent: status.bootstrap_percent,
            bootstrap_summary: status.bootstrap_summary,
            bootstrap_warning: status.bootstrap_warning,
            socks_endpoint: status.socks_endpoint.map(|e| e.to_string()),
            error_message: status.state.failure().map(str::to_string),
        }
    }

    /// Create a hidden service on the running daemon.
    pub async fn create_hidden_service(
        &self,
        params: &HiddenServiceParams,
    ) -> Result<HiddenServiceResponse> {
        let config = HiddenServiceConfig::try_from(params)?;
        let handle = self.supervisor.create_hidden_service(&config).await?;
        Ok(HiddenServiceResponse {
            onion_address: handle.onion_address.to_string(),
            control_label: handle.control_label,
            virtual_port: handle.virtual_port,
            target_port: handle.target_port,
        })
    }

    /// Delete a hidden service by address.
    pub async fn delete_hidden_service(&self, onion_address: &str) -> Result<bool> {
        self.supervisor.delete_hidden_service(onion_address).await
    }

    /// Hex-encoded secret key of a live hidden service.
    pub fn hidden_service_secret_key(&self, onion_address: &str) -> Result<String> {
        Ok(self.supervisor.registry().secret_key(onion_address)?.to_hex())
    }

    /// Tear down the daemon.
    pub async fn shutdown_service(&self) -> bool {
        self.supervisor.shutdown().await
    }

    /// Send an HTTP request through the daemon.
    pub async fn http_request(&self, params: &HttpRequestParams) -> HttpResponseBody {
        let method = match params.method.parse::<HttpMethod>() {
            Ok(method) => method,
            Err(e) => return HttpResponseBody::failed(&e),
        };

        let request = HttpRequest {
            method,
            url: params.url.clone(),
            headers: params
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            body: params.body.clone().map(String::into_bytes),
            timeout: Duration::from_millis(params.timeout_ms),
        };

        match self.http.request(&request).await {
            Ok(response) => HttpResponseBody {
                status_code: response.status_code,
                body: response.text(),
                error: None,
            },
            Err(e) => HttpResponseBody::failed(&e),
        }
    }
}
