//! Tor ControlPort client.
//!
//! Communicates with Tor via the ControlPort protocol (control-spec.txt).
//! A single I/O task owns the socket. Commands are queued to it one at a
//! time; each reply is routed back to the caller that issued the command,
//! and `650` notifications are broadcast to event subscribers. A caller
//! that stops waiting never leaves a reply unread on the wire.

use super::protocol::{quote, ControlEvent, EventKind, Reply, ReplyParser};
use super::CONTROL_REPLY_TIMEOUT;
use crate::error::{Error, Result};
use crate::logging::{sanitize_command, sanitize_reply_line, Redacted, RedactedBytes};
use std::collections::BTreeSet;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex, RwLock};
use tokio::task::JoinHandle;

/// Capacity of the event broadcast buffer.
const EVENT_BUFFER: usize = 256;

/// Authentication method for Tor ControlPort.
#[derive(Clone)]
pub enum ControlAuth {
    /// No authentication required.
    Null,
    /// Cookie authentication (reads from file).
    Cookie(PathBuf),
    /// Password authentication.
    Password(String),
}

impl fmt::Debug for ControlAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlAuth::Null => write!(f, "Null"),
            ControlAuth::Cookie(path) => write!(f, "Cookie({:?})", path),
            ControlAuth::Password(password) => f.debug_tuple("Password").field(&Redacted(password)).finish(),
        }
    }
}

struct Request {
    line: String,
    reply: oneshot::Sender<Result<Reply>>,
}

type EventSender = broadcast::Sender<Arc<ControlEvent>>;

/// Authenticated connection to the daemon's control port.
pub struct ControlChannel {
    endpoint: SocketAddr,
    requests: mpsc::Sender<Request>,
    events: Arc<StdMutex<Option<EventSender>>>,
    subscriptions: Mutex<BTreeSet<String>>,
    /// `true` once `close` started; commands hold a read guard while in flight.
    gate: RwLock<bool>,
    closed: watch::Receiver<bool>,
    task: StdMutex<Option<JoinHandle<()>>>,
    reply_timeout: Duration,
}

impl ControlChannel {
    /// Connect and authenticate.
    ///
    /// Returns [`Error::Auth`] when the daemon rejects the credentials.
    pub async fn connect(endpoint: SocketAddr, auth: &ControlAuth) -> Result<Self> {
        let stream = TcpStream::connect(endpoint).await.map_err(|e| {
            Error::Daemon(format!("failed to connect to control port {}: {}", endpoint, e))
        })?;
        // Best effort; the protocol is line oriented and latency sensitive.
        let _ = stream.set_nodelay(true);

        let channel = Self::from_stream(endpoint, stream);
        channel.authenticate(auth).await?;

        tracing::info!(endpoint = %endpoint, "Authenticated with Tor control port");
        Ok(channel)
    }

    fn from_stream(endpoint: SocketAddr, stream: TcpStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        let (requests, rx) = mpsc::channel(32);
        let (event_tx, _) = broadcast::channel(EVENT_BUFFER);
        let events = Arc::new(StdMutex::new(Some(event_tx)));
        let (closed_tx, closed) = watch::channel(false);

        let task = tokio::spawn(run_io(read_half, write_half, rx, events.clone(), closed_tx));

        Self {
            endpoint,
            requests,
            events,
            subscriptions: Mutex::new(BTreeSet::new()),
            gate: RwLock::new(false),
            closed,
            task: StdMutex::new(Some(task)),
            reply_timeout: CONTROL_REPLY_TIMEOUT,
        }
    }

    async fn authenticate(&self, auth: &ControlAuth) -> Result<()> {
        let cmd = match auth {
            ControlAuth::Null => "AUTHENTICATE".to_string(),
            ControlAuth::Cookie(path) => {
                let cookie = tokio::fs::read(path).await.map_err(|e| {
                    Error::Auth(format!("failed to read cookie file {:?}: {}", path, e))
                })?;
                tracing::debug!(cookie = %RedactedBytes(&cookie), "Using cookie authentication");
                format!("AUTHENTICATE {}", hex::encode(cookie))
            }
            ControlAuth::Password(password) => format!("AUTHENTICATE {}", quote(password)),
        };

        match self.send_command(&cmd).await {
            Ok(_) => Ok(()),
            Err(Error::Protocol { code, message }) => {
                Err(Error::Auth(format!("{} {}", code, message)))
            }
            Err(Error::ChannelClosed) => {
                Err(Error::Auth("connection closed during authentication".into()))
            }
            Err(e) => Err(e),
        }
    }

    /// Control port address.
    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    /// Send a command and wait for its reply.
    ///
    /// Error statuses come back as [`Error::Protocol`]. Fails with
    /// [`Error::ChannelClosed`] once the channel is closing or closed.
    pub async fn send_command(&self, line: &str) -> Result<Reply> {
        let gate = self.gate.read().await;
        if *gate {
            return Err(Error::ChannelClosed);
        }
        let reply = self.dispatch(line).await;
        drop(gate);
        reply
    }

    async fn dispatch(&self, line: &str) -> Result<Reply> {
        if line.contains(['\r', '\n']) {
            return Err(Error::Protocol {
                code: 0,
                message: "command must be a single line".into(),
            });
        }

        tracing::debug!(command = %sanitize_command(line), "Control command");

        let (tx, rx) = oneshot::channel();
        self.requests
            .send(Request {
                line: line.to_string(),
                reply: tx,
            })
            .await
            .map_err(|_| Error::ChannelClosed)?;

        let reply = tokio::time::timeout(self.reply_timeout, rx)
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(|_| Error::ChannelClosed)?;

        if let Ok(reply) = &reply {
            for l in &reply.lines {
                tracing::trace!(code = l.code, line = %sanitize_reply_line(&l.text), "Control reply");
            }
        }
        reply
    }

    /// Subscribe to one event kind.
    ///
    /// Issues `SETEVENTS` with the union of all kinds subscribed on this
    /// channel. The stream is registered before the command so no event
    /// following the reply is missed.
    pub async fn subscribe_events(&self, kind: EventKind) -> Result<EventStream> {
        let rx = {
            let guard = self.events.lock().unwrap_or_else(|e| e.into_inner());
            let rx = guard.as_ref().map(|tx| tx.subscribe());
            rx
        };
        let rx = rx.ok_or(Error::ChannelClosed)?;

        let mut subscriptions = self.subscriptions.lock().await;
        let added = subscriptions.insert(kind.as_str().to_string());
        let line = subscriptions
            .iter()
            .fold(String::from("SETEVENTS"), |acc, k| acc + " " + k);

        if let Err(e) = self.send_command(&line).await {
            if added {
                subscriptions.remove(kind.as_str());
            }
            return Err(e);
        }

        tracing::debug!(kind = %kind, "Subscribed to control events");
        Ok(EventStream { rx, kind })
    }

    /// `GETINFO <key>` and return its value.
    pub async fn get_info(&self, key: &str) -> Result<String> {
        let reply = self.send_command(&format!("GETINFO {}", key)).await?;
        reply.value(key).ok_or_else(|| Error::Protocol {
            code: reply.code,
            message: format!("{} not found in response", key),
        })
    }

    /// Daemon version string.
    pub async fn get_version(&self) -> Result<String> {
        self.get_info("version").await
    }

    /// Make the daemon exit when this connection closes.
    pub async fn take_ownership(&self) -> Result<()> {
        self.send_command("TAKEOWNERSHIP").await?;
        Ok(())
    }

    /// `SIGNAL <name>`, e.g. `NEWNYM` or `SHUTDOWN`.
    pub async fn signal(&self, name: &str) -> Result<()> {
        if name.is_empty() || name.contains(char::is_whitespace) {
            return Err(Error::Protocol {
                code: 0,
                message: format!("invalid signal name {:?}", name),
            });
        }
        self.send_command(&format!("SIGNAL {}", name)).await?;
        tracing::debug!(signal = name, "Sent signal");
        Ok(())
    }

    /// Whether the connection is gone.
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolve once the connection is gone, for whatever reason.
    pub async fn closed(&self) {
        let mut rx = self.closed.clone();
        // An error means the I/O task is gone, which is closed as well.
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Refuse new commands, wait up to `drain_timeout` for in-flight ones,
    /// then `QUIT` and wait for the connection to end.
    ///
    /// Idempotent. Returns [`Error::Timeout`] if commands did not drain or
    /// the daemon did not hang up in time; the connection is torn down
    /// either way.
    pub async fn close(&self, drain_timeout: Duration) -> Result<()> {
        let mut gate = match tokio::time::timeout(drain_timeout, self.gate.write()).await {
            Ok(gate) => gate,
            Err(_) => {
                tracing::warn!(endpoint = %self.endpoint, "In-flight control commands did not drain");
                self.abort();
                return Err(Error::Timeout);
            }
        };
        if *gate {
            return Ok(());
        }
        *gate = true;
        drop(gate);

        if !self.is_closed() {
            match tokio::time::timeout(drain_timeout, self.dispatch("QUIT")).await {
                Ok(Ok(_)) | Ok(Err(Error::ChannelClosed)) => {}
                Ok(Err(e)) => tracing::debug!(error = %e, "QUIT failed"),
                Err(_) => tracing::debug!("QUIT timed out"),
            }
        }

        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        let mut outcome = Ok(());
        if let Some(task) = task {
            let abort = task.abort_handle();
            if tokio::time::timeout(drain_timeout, task).await.is_err() {
                tracing::warn!(endpoint = %self.endpoint, "Control connection did not close; dropping it");
                abort.abort();
                outcome = Err(Error::Timeout);
            }
        }
        self.drop_event_sender();

        tracing::info!(endpoint = %self.endpoint, "Control channel closed");
        outcome
    }

    fn abort(&self) {
        if let Some(task) = self.task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
        self.drop_event_sender();
    }

    fn drop_event_sender(&self) {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        self.abort();
    }
}

impl fmt::Debug for ControlChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlChannel")
            .field("endpoint", &self.endpoint)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Events of one kind from a [`ControlChannel`].
pub struct EventStream {
    rx: broadcast::Receiver<Arc<ControlEvent>>,
    kind: EventKind,
}

impl EventStream {
    /// Next event, or [`Error::ChannelClosed`] once the channel is gone.
    pub async fn next(&mut self) -> Result<Arc<ControlEvent>> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.kind == self.kind => return Ok(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(kind = %self.kind, skipped, "Event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return Err(Error::ChannelClosed),
            }
        }
    }

    /// Kind this stream yields.
    pub fn kind(&self) -> &EventKind {
        &self.kind
    }
}

/// Socket owner. Writes one queued command at a time and routes every
/// complete reply to the oldest waiting caller, or to subscribers for `650`.
async fn run_io(
    read_half: OwnedReadHalf,
    mut write_half: OwnedWriteHalf,
    mut requests: mpsc::Receiver<Request>,
    events: Arc<StdMutex<Option<EventSender>>>,
    closed: watch::Sender<bool>,
) {
    let mut lines = BufReader::new(read_half).lines();
    let mut parser = ReplyParser::default();
    let mut pending: Option<oneshot::Sender<Result<Reply>>> = None;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        tracing::debug!("Control connection closed by daemon");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Control connection read failed");
                        break;
                    }
                };

                let reply = match parser.feed(&line) {
                    Ok(Some(reply)) => reply,
                    Ok(None) => continue,
                    Err(e) => {
                        tracing::warn!(error = %e, "Control protocol desynchronized");
                        break;
                    }
                };

                if reply.is_async() {
                    if let Some(event) = ControlEvent::from_reply(&reply) {
                        let guard = events.lock().unwrap_or_else(|e| e.into_inner());
                        if let Some(tx) = guard.as_ref() {
                            // No receivers is fine
                            let _ = tx.send(Arc::new(event));
                        }
                    }
                } else if let Some(tx) = pending.take() {
                    // The caller may have given up; the reply is consumed regardless.
                    let _ = tx.send(reply.into_result());
                } else {
                    tracing::warn!(code = reply.code, "Unsolicited control reply");
                }
            }
            request = requests.recv(), if pending.is_none() => {
                let Some(request) = request else { break };
                let mut bytes = request.line.into_bytes();
                bytes.extend_from_slice(b"\r\n");
                if let Err(e) = write_half.write_all(&bytes).await {
                    tracing::warn!(error = %e, "Control connection write failed");
                    let _ = request.reply.send(Err(Error::Io(e)));
                    break;
                }
                pending = Some(request.reply);
            }
        }
    }

    if let Some(tx) = pending.take() {
        let _ = tx.send(Err(Error::ChannelClosed));
    }
    requests.close();
    while let Ok(request) = requests.try_recv() {
        let _ = request.reply.send(Err(Error::ChannelClosed));
    }
    events.lock().unwrap_or_else(|e| e.into_inner()).take();
    let _ = closed.send(true);
}
