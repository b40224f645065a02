//! CLI command implementations.

use crate::DaemonArgs;
use anyhow::{bail, Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use torkeeper_core::tor::{ControlAuth, DaemonLauncher, ExternalDaemon, TorProcessLauncher};
use torkeeper_core::{
    HiddenServiceConfig, HttpMethod, HttpRequest, KeyMaterial, LifecycleState, OnionSecretKey,
    ServiceConfig, ServiceSupervisor, StartResult,
};

/// A `fetch` invocation.
pub struct FetchRequest {
    pub url: String,
    pub method: String,
    pub headers: Vec<String>,
    pub body: Option<String>,
    pub timeout_ms: u64,
}

fn launcher(daemon: &DaemonArgs) -> Arc<dyn DaemonLauncher> {
    match daemon.attach {
        Some(control_endpoint) => {
            let auth = match (&daemon.cookie, &daemon.password) {
                (Some(cookie), _) => ControlAuth::Cookie(cookie.clone()),
                (None, Some(password)) => ControlAuth::Password(password.clone()),
                (None, None) => ControlAuth::Null,
            };
            Arc::new(ExternalDaemon {
                control_endpoint,
                auth,
            })
        }
        None => Arc::new(TorProcessLauncher::from_env()),
    }
}

fn service_config(data_dir: &str, daemon: &DaemonArgs) -> ServiceConfig {
    let mut config = ServiceConfig::new(data_dir);
    config.socks_port = daemon.socks_port;
    config.control_port = daemon.control_port;
    config.timeout_ms = daemon.timeout_ms;
    config
}

/// Decode a hex-encoded 64-byte expanded secret key.
fn parse_key(key_hex: &str) -> Result<OnionSecretKey> {
    let bytes = hex::decode(key_hex.trim()).context("Key is not valid hex")?;
    OnionSecretKey::from_slice(&bytes).context("Key must be 64 bytes")
}

/// Split a `Name: value` header argument.
fn parse_header(header: &str) -> Result<(String, String)> {
    match header.split_once(':') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.trim().to_string()))
        }
        _ => bail!("Header must look like \"Name: value\" (got {:?})", header),
    }
}

/// Print bootstrap progress until the task is aborted.
fn report_progress(supervisor: &ServiceSupervisor) -> JoinHandle<()> {
    let mut updates = supervisor.subscribe_status();
    tokio::spawn(async move {
        let mut last = None;
        while updates.changed().await.is_ok() {
            let status = updates.borrow_and_update().clone();
            if status.state == LifecycleState::Bootstrapping && last != Some(status.bootstrap_percent) {
                last = Some(status.bootstrap_percent);
                println!(
                    "Bootstrapping: {:>3}% {}",
                    status.bootstrap_percent,
                    status.bootstrap_summary.as_deref().unwrap_or("")
                );
            }
        }
    })
}

async fn start(supervisor: &ServiceSupervisor, config: &ServiceConfig) -> Result<StartResult> {
    let progress = report_progress(supervisor);
    let result = supervisor.start(config).await;
    progress.abort();

    if !result.success {
        let reason = result
            .error_message
            .clone()
            .unwrap_or_else(|| "unknown error".into());
        // A failed start-time hidden service leaves tor running.
        supervisor.shutdown().await;
        bail!("Tor failed to start: {}", reason);
    }
    Ok(result)
}

/// Run tor until Ctrl-C, optionally publishing an onion service.
pub async fn run(
    data_dir: &str,
    daemon: &DaemonArgs,
    target_port: Option<u16>,
    virtual_port: Option<u16>,
    key: Option<&str>,
) -> Result<()> {
    let mut config = service_config(data_dir, daemon);
    if let Some(target_port) = target_port {
        let key_material = match key {
            Some(key) => KeyMaterial::Provided(parse_key(key)?),
            None => KeyMaterial::Generated,
        };
        config.hidden_service = Some(HiddenServiceConfig {
            virtual_port: virtual_port.unwrap_or(target_port),
            target_port,
            key_material,
        });
    }

    let supervisor = ServiceSupervisor::new(launcher(daemon));
    let result = start(&supervisor, &config).await?;
    let status = supervisor.status();

    println!("\nTor is running");
    if let Some(socks) = status.socks_endpoint {
        println!("  SOCKS5:  {}", socks);
    }
    if let Some(control) = result.control_endpoint {
        println!("  Control: {}", control);
    }
    if let Some(address) = &result.onion_address {
        let handle = supervisor.registry().get(address);
        println!("  Onion:   {}", address);
        if let Some(handle) = handle {
            println!(
                "           port {} -> 127.0.0.1:{}",
                handle.virtual_port, handle.target_port
            );
        }
        if key.is_none() {
            if let Ok(secret) = supervisor.registry().secret_key(address) {
                println!("  Key:     {}", secret.to_hex());
                println!("           (pass with --key to keep this address)");
            }
        }
    }
    println!("\nPress Ctrl-C to stop");

    let mut updates = supervisor.subscribe_status();
    let lost = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl-C")?;
            None
        }
        failed = updates.wait_for(|s| matches!(s.state, LifecycleState::Failed(_))) => {
            failed.ok().and_then(|s| s.state.failure().map(str::to_string))
        }
    };

    println!("\nShutting down...");
    let clean = supervisor.shutdown().await;

    if let Some(reason) = lost {
        bail!("Tor stopped unexpectedly: {}", reason);
    }
    if !clean {
        bail!("Shutdown did not complete cleanly");
    }
    println!("Stopped");
    Ok(())
}

/// Fetch one URL through tor.
pub async fn fetch(data_dir: &str, daemon: &DaemonArgs, request: FetchRequest) -> Result<()> {
    let method: HttpMethod = request.method.parse().context("Unsupported HTTP method")?;
    let mut http_request = HttpRequest::new(method, request.url)
        .timeout(Duration::from_millis(request.timeout_ms));
    for header in &request.headers {
        let (name, value) = parse_header(header)?;
        http_request = http_request.header(name, value);
    }
    if let Some(body) = request.body {
        http_request = http_request.body(body);
    }

    let config = service_config(data_dir, daemon);
    let supervisor = ServiceSupervisor::new(launcher(daemon));
    start(&supervisor, &config).await?;

    let response = supervisor.http_client().request(&http_request).await;
    supervisor.shutdown().await;
    let response = response.context("Request failed")?;

    eprintln!("HTTP {}", response.status_code);
    for (name, value) in &response.headers {
        eprintln!("{}: {}", name, value);
    }
    eprintln!();
    println!("{}", response.text());
    Ok(())
}

/// Print the onion address a key would publish.
pub fn show_address(key_hex: &str) -> Result<()> {
    let key = parse_key(key_hex)?;
    println!("{}", key.onion_address());
    Ok(())
}
