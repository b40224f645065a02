//! Test doubles: a scripted Tor control port, a launcher that points at it,
//! a SOCKS5 proxy and a tiny HTTP backend.

#![allow(dead_code)]

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

use torkeeper_core::config::{FsDataDirectory, ValidatedConfig};
use torkeeper_core::tor::{ControlAuth, DaemonLauncher, LaunchedDaemon};
use torkeeper_core::{OnionSecretKey, ServiceConfig, ServiceSupervisor, SupervisorOptions};

/// Install a test subscriber once; `RUST_LOG` controls verbosity.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// How the fake daemon bootstraps after `SETEVENTS`.
#[derive(Debug, Clone)]
pub enum Bootstrap {
    /// 5%, 50%, then 100%.
    Complete,
    /// Stops at 45% forever.
    Stall,
    /// Reports an ERR-severity bootstrap problem at 10%.
    Error,
    /// Reports a WARN-severity bootstrap problem at 10%, then stalls.
    Warn,
    /// Hangs up right after `SETEVENTS`.
    HangUp,
}

fn status_line(severity: &str, progress: u8, tag: &str, summary: &str) -> String {
    format!(
        "650 STATUS_CLIENT {} BOOTSTRAP PROGRESS={} TAG={} SUMMARY=\"{}\"\r\n",
        severity, progress, tag, summary
    )
}

/// What the fake daemon answers to a successful `ADD_ONION`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOnionReply {
    /// A valid `ServiceID`, plus `PrivateKey` for generated keys.
    Normal,
    /// A valid `ServiceID` with a truncated `PrivateKey` blob.
    BadPrivateKey,
    /// A `ServiceID` that is not a v3 service id.
    BadServiceId,
}

#[derive(Default)]
struct State {
    commands: Vec<String>,
    onions: HashMap<String, String>,
}

/// A scripted control port.
#[derive(Clone)]
pub struct FakeTor {
    pub addr: SocketAddr,
    state: Arc<Mutex<State>>,
    reject_auth: Arc<AtomicBool>,
    reject_add_onion: Arc<AtomicBool>,
    add_onion_reply: Arc<Mutex<AddOnionReply>>,
    bootstrap: Arc<Mutex<Bootstrap>>,
    active: Arc<AtomicUsize>,
    hang_up: broadcast::Sender<()>,
}

impl FakeTor {
    pub async fn start(bootstrap: Bootstrap) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind fake control port");
        let (hang_up, _) = broadcast::channel(4);
        let fake = Self {
            addr: listener.local_addr().expect("local addr"),
            state: Arc::new(Mutex::new(State::default())),
            reject_auth: Arc::new(AtomicBool::new(false)),
            reject_add_onion: Arc::new(AtomicBool::new(false)),
            add_onion_reply: Arc::new(Mutex::new(AddOnionReply::Normal)),
            bootstrap: Arc::new(Mutex::new(bootstrap)),
            active: Arc::new(AtomicUsize::new(0)),
            hang_up,
        };

        let server = fake.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let conn = server.clone();
                conn.active.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    conn.serve(stream).await;
                    conn.active.fetch_sub(1, Ordering::SeqCst);
                });
            }
        });

        fake
    }

    pub fn set_reject_auth(&self, reject: bool) {
        self.reject_auth.store(reject, Ordering::SeqCst);
    }

    pub fn set_reject_add_onion(&self, reject: bool) {
        self.reject_add_onion.store(reject, Ordering::SeqCst);
    }

    pub fn set_add_onion_reply(&self, reply: AddOnionReply) {
        *self.add_onion_reply.lock().unwrap() = reply;
    }

    pub fn set_bootstrap(&self, bootstrap: Bootstrap) {
        *self.bootstrap.lock().unwrap() = bootstrap;
    }

    /// Every command line received, in order.
    pub fn commands(&self) -> Vec<String> {
        self.state.lock().unwrap().commands.clone()
    }

    /// Commands whose verb is `verb`.
    pub fn commands_named(&self, verb: &str) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter(|c| c.split(' ').next() == Some(verb))
            .collect()
    }

    /// Service ids the fake daemon currently serves.
    pub fn onions(&self) -> Vec<String> {
        self.state.lock().unwrap().onions.keys().cloned().collect()
    }

    /// Open control connections.
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Drop every open control connection, as a crashing daemon would.
    pub fn hang_up(&self) {
        let _ = self.hang_up.send(());
    }

    /// Wait until no control connection is open.
    pub async fn wait_disconnected(&self) -> bool {
        for _ in 0..100 {
            if self.active_connections() == 0 {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    async fn serve(&self, stream: TcpStream) {
        let mut hang_up = self.hang_up.subscribe();
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();
        let mut subscribed = false;

        loop {
            let line = tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => line,
                    _ => return,
                },
                _ = hang_up.recv() => return,
            };
            self.state.lock().unwrap().commands.push(line.clone());

            let (verb, rest) = line.split_once(' ').unwrap_or((line.as_str(), ""));
            let response = match verb {
                "AUTHENTICATE" => {
                    if self.reject_auth.load(Ordering::SeqCst) {
                        let _ = write
                            .write_all(b"515 Authentication failed: Password did not match HashedControlPassword\r\n")
                            .await;
                        return;
                    }
                    "250 OK\r\n".to_string()
                }
                "TAKEOWNERSHIP" => "250 OK\r\n".to_string(),
                "SETEVENTS" => {
                    subscribed = rest.split(' ').any(|k| k == "STATUS_CLIENT");
                    "250 OK\r\n".to_string()
                }
                "GETINFO" => match rest {
                    "version" => "250-version=0.4.8.10 (fake)\r\n250 OK\r\n".to_string(),
                    "status/bootstrap-phase" => {
                        let mut out = "250-status/bootstrap-phase=NOTICE BOOTSTRAP PROGRESS=0 TAG=starting SUMMARY=\"Starting\"\r\n250 OK\r\n".to_string();
                        if subscribed {
                            let script = self.bootstrap.lock().unwrap().clone();
                            match script {
                                Bootstrap::Complete => {
                                    out += &status_line("NOTICE", 5, "conn", "Connecting to a relay");
                                    out += &status_line("NOTICE", 50, "loading_descriptors", "Loading relay descriptors");
                                    out += &status_line("NOTICE", 100, "done", "Done");
                                }
                                Bootstrap::Stall => {
                                    out += &status_line("NOTICE", 5, "conn", "Connecting to a relay");
                                    out += &status_line("NOTICE", 45, "requesting_descriptors", "Asking for relay descriptors");
                                }
                                Bootstrap::Error => {
                                    out += &status_line("NOTICE", 5, "conn", "Connecting to a relay");
                                    out += "650 STATUS_CLIENT ERR BOOTSTRAP PROGRESS=10 TAG=conn_done SUMMARY=\"Connected to a relay\" WARNING=\"No route to host\" REASON=NOROUTE\r\n";
                                }
                                Bootstrap::Warn => {
                                    out += &status_line("NOTICE", 5, "conn", "Connecting to a relay");
                                    out += "650 STATUS_CLIENT WARN BOOTSTRAP PROGRESS=10 TAG=conn_done SUMMARY=\"Connected to a relay\" WARNING=\"Connection refused\" REASON=CONNECTREFUSED COUNT=3 RECOMMENDATION=warn\r\n";
                                }
                                Bootstrap::HangUp => {
                                    let _ = write.write_all(out.as_bytes()).await;
                                    return;
                                }
                            }
                        }
                        out
                    }
                    _ => "552 Unrecognized key\r\n".to_string(),
                },
                "ADD_ONION" => self.add_onion(rest),
                "DEL_ONION" => {
                    if self.state.lock().unwrap().onions.remove(rest).is_some() {
                        "250 OK\r\n".to_string()
                    } else {
                        "552 Unknown Onion Service id\r\n".to_string()
                    }
                }
                "QUIT" => {
                    let _ = write.write_all(b"250 closing connection\r\n").await;
                    return;
                }
                _ => format!("510 Unrecognized command \"{}\"\r\n", verb),
            };

            if write.write_all(response.as_bytes()).await.is_err() {
                return;
            }
        }
    }

    fn add_onion(&self, rest: &str) -> String {
        if self.reject_add_onion.load(Ordering::SeqCst) {
            return "512 Bad arguments to ADD_ONION\r\n".to_string();
        }

        let mut args = rest.split(' ');
        let key_arg = args.next().unwrap_or("");
        let port = args
            .find_map(|a| a.strip_prefix("Port="))
            .unwrap_or("")
            .to_string();

        let (key, returned) = if key_arg.starts_with("NEW:") {
            let mut bytes = [0u8; 64];
            rand::rngs::OsRng.fill_bytes(&mut bytes);
            (OnionSecretKey::from_bytes(bytes), true)
        } else {
            match OnionSecretKey::from_control_blob(key_arg) {
                Ok(key) => (key, false),
                Err(_) => return "513 Invalid key blob\r\n".to_string(),
            }
        };

        let reply = *self.add_onion_reply.lock().unwrap();
        let service_id = match reply {
            AddOnionReply::BadServiceId => "notav3serviceid".to_string(),
            _ => key.onion_address().service_id().to_string(),
        };
        self.state.lock().unwrap().onions.insert(service_id.clone(), port);

        if returned && reply == AddOnionReply::BadPrivateKey {
            format!(
                "250-ServiceID={}\r\n250-PrivateKey=ED25519-V3:AAAA\r\n250 OK\r\n",
                service_id
            )
        } else if returned {
            format!(
                "250-ServiceID={}\r\n250-PrivateKey=ED25519-V3:{}\r\n250 OK\r\n",
                service_id,
                BASE64.encode(key.as_bytes())
            )
        } else {
            format!("250-ServiceID={}\r\n250 OK\r\n", service_id)
        }
    }
}

/// Launcher that "spawns" by pointing at a [`FakeTor`].
pub struct FakeLauncher {
    endpoint: SocketAddr,
    delay: Duration,
    launches: AtomicUsize,
    /// Attach a long-running `sleep` process as the daemon.
    with_process: bool,
    pids: Mutex<Vec<u32>>,
}

impl FakeLauncher {
    pub fn new(fake: &FakeTor) -> Arc<Self> {
        Self::with_delay(fake, Duration::ZERO)
    }

    pub fn with_delay(fake: &FakeTor, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            endpoint: fake.addr,
            delay,
            launches: AtomicUsize::new(0),
            with_process: false,
            pids: Mutex::new(Vec::new()),
        })
    }

    /// Like [`FakeLauncher::new`], with a real child process standing in
    /// for tor. It only exits when killed.
    pub fn with_process(fake: &FakeTor) -> Arc<Self> {
        Arc::new(Self {
            endpoint: fake.addr,
            delay: Duration::ZERO,
            launches: AtomicUsize::new(0),
            with_process: true,
            pids: Mutex::new(Vec::new()),
        })
    }

    /// Process ids of spawned stand-ins.
    pub fn pids(&self) -> Vec<u32> {
        self.pids.lock().unwrap().clone()
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DaemonLauncher for FakeLauncher {
    async fn launch(&self, _config: &ValidatedConfig) -> torkeeper_core::Result<LaunchedDaemon> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let daemon = LaunchedDaemon::new(self.endpoint, ControlAuth::Null, true);
        if !self.with_process {
            return Ok(daemon);
        }
        let child = tokio::process::Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()?;
        if let Some(pid) = child.id() {
            self.pids.lock().unwrap().push(pid);
        }
        Ok(daemon.with_child(child))
    }
}

/// Supervisor wired to a fake launcher with a short shutdown timeout.
pub fn supervisor(launcher: Arc<FakeLauncher>) -> ServiceSupervisor {
    ServiceSupervisor::with_parts(
        launcher,
        Arc::new(FsDataDirectory),
        SupervisorOptions {
            shutdown_timeout: Duration::from_secs(2),
            connect_attempts: 1,
        },
    )
}

/// Config for a data dir under `root` with a 5 s timeout.
pub fn config(root: &Path) -> ServiceConfig {
    let mut config = ServiceConfig::new(root.join("tor"));
    config.timeout_ms = 5_000;
    config
}

/// SOCKS5 proxy that sends every CONNECT to `backend` and records the
/// requested host names.
#[derive(Clone)]
pub struct FakeSocks {
    pub addr: SocketAddr,
    hosts: Arc<Mutex<Vec<String>>>,
    connections: Arc<AtomicUsize>,
}

impl FakeSocks {
    pub async fn start(backend: SocketAddr) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind fake socks");
        let socks = Self {
            addr: listener.local_addr().expect("local addr"),
            hosts: Arc::new(Mutex::new(Vec::new())),
            connections: Arc::new(AtomicUsize::new(0)),
        };

        let server = socks.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                server.connections.fetch_add(1, Ordering::SeqCst);
                let hosts = server.hosts.clone();
                tokio::spawn(async move {
                    let _ = socks5_relay(stream, backend, hosts).await;
                });
            }
        });

        socks
    }

    pub fn hosts(&self) -> Vec<String> {
        self.hosts.lock().unwrap().clone()
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

async fn socks5_relay(
    mut client: TcpStream,
    backend: SocketAddr,
    hosts: Arc<Mutex<Vec<String>>>,
) -> std::io::Result<()> {
    let mut head = [0u8; 2];
    client.read_exact(&mut head).await?;
    let mut methods = vec![0u8; head[1] as usize];
    client.read_exact(&mut methods).await?;
    client.write_all(&[0x05, 0x00]).await?;

    let mut req = [0u8; 4];
    client.read_exact(&mut req).await?;
    let host = match req[3] {
        0x01 => {
            let mut ip = [0u8; 4];
            client.read_exact(&mut ip).await?;
            std::net::Ipv4Addr::from(ip).to_string()
        }
        0x03 => {
            let mut len = [0u8; 1];
            client.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            client.read_exact(&mut name).await?;
            String::from_utf8_lossy(&name).into_owned()
        }
        0x04 => {
            let mut ip = [0u8; 16];
            client.read_exact(&mut ip).await?;
            std::net::Ipv6Addr::from(ip).to_string()
        }
        _ => return Ok(()),
    };
    let mut port = [0u8; 2];
    client.read_exact(&mut port).await?;
    hosts.lock().unwrap().push(host);

    let mut upstream = TcpStream::connect(backend).await?;
    client
        .write_all(&[0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0, 0])
        .await?;
    tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
    Ok(())
}

/// HTTP/1.1 backend.
///
/// `/slow` never answers, `/redirect` answers 302, anything else echoes
/// `<METHOD> <path> <x-test header> <body>`.
pub async fn http_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind backend");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(serve_http(stream));
        }
    });
    addr
}

async fn serve_http(stream: TcpStream) {
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);

    let mut request_line = String::new();
    if reader.read_line(&mut request_line).await.is_err() {
        return;
    }
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("").to_string();
    let path = parts.next().unwrap_or("").to_string();

    let mut content_length = 0usize;
    let mut test_header = String::new();
    loop {
        let mut line = String::new();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            match name.trim().to_ascii_lowercase().as_str() {
                "content-length" => content_length = value.trim().parse().unwrap_or(0),
                "x-test" => test_header = value.trim().to_string(),
                _ => {}
            }
        }
    }
    let mut body = vec![0u8; content_length];
    if reader.read_exact(&mut body).await.is_err() {
        return;
    }

    let response = match path.as_str() {
        "/slow" => {
            tokio::time::sleep(Duration::from_secs(30)).await;
            return;
        }
        "/redirect" => {
            "HTTP/1.1 302 Found\r\nLocation: /elsewhere\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                .to_string()
        }
        _ => {
            let echo = format!(
                "{} {} {} {}",
                method,
                path,
                test_header,
                String::from_utf8_lossy(&body)
            );
            format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                echo.len(),
                echo
            )
        }
    };
    let _ = write.write_all(response.as_bytes()).await;
    let _ = write.shutdown().await;
}
