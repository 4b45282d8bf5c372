//! The TCP command channel to the radio.
//!
//! [`CommandChannel`] owns the persistent TCP connection on port 4992. It
//! frames outbound commands with strictly increasing sequence numbers,
//! correlates `R` responses with the commands that caused them, and folds
//! unsolicited `S` status lines into the device state through a
//! [`StateSink`].
//!
//! The channel never retries and never times out a command on its own.
//! Callers that want to wait for an answer use
//! [`send_tracked`](CommandChannel::send_tracked) and apply their own
//! timeout. Any read error, end of stream, or explicit close moves the
//! channel to [`ChannelState::Disconnected`] and reports `connected=false`
//! to the sink exactly once.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, broadcast, oneshot};
use tokio::task::JoinHandle;

use flexbridge_core::{Error, Result, StateSink, StateUpdate, TuningStep};

use crate::codec::{
    self, Command, CommandResponse, InboundLine, LineBuffer, ProtocolVersion, StatusLine,
    mhz_to_hz,
};
use crate::meters::SharedMeterMap;
use crate::mode;

/// Default TCP connect timeout.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Broadcast channel capacity for response subscribers.
const RESPONSE_CHANNEL_CAPACITY: usize = 64;

/// Options for the command channel.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Client program name sent after connecting.
    pub client_name: String,
    /// Send the program name and status subscriptions after connecting.
    pub auto_subscribe: bool,
    /// Slice whose status feeds the device state.
    pub slice_index: u8,
    /// Timeout for establishing the TCP connection.
    pub connect_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            client_name: "flexbridge".to_string(),
            auto_subscribe: true,
            slice_index: 0,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// Connection state of the command channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
}

/// The TCP command channel. Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct CommandChannel {
    inner: Arc<Inner>,
}

struct Inner {
    options: ClientOptions,
    sink: Arc<dyn StateSink>,
    meters: SharedMeterMap,

    /// Write half of the TCP stream. Held while a sequence number is
    /// assigned so numbers reach the wire in order.
    writer: Mutex<Option<OwnedWriteHalf>>,
    /// Next sequence number; reset to 1 on every connect.
    next_seq: AtomicU32,
    /// Waiters for correlated responses.
    pending: Mutex<HashMap<u32, oneshot::Sender<CommandResponse>>>,
    responses: broadcast::Sender<CommandResponse>,

    connecting: AtomicBool,
    connected: AtomicBool,
    /// Incremented per connection so a stale reader cannot close a newer one.
    generation: AtomicU64,

    reader: Mutex<Option<JoinHandle<()>>>,
    version: Mutex<Option<ProtocolVersion>>,
    handle: Mutex<Option<u32>>,
}

impl CommandChannel {
    /// Create a disconnected channel that reports to `sink`.
    pub fn new(sink: Arc<dyn StateSink>, meters: SharedMeterMap, options: ClientOptions) -> Self {
        let (responses, _) = broadcast::channel(RESPONSE_CHANNEL_CAPACITY);
        CommandChannel {
            inner: Arc::new(Inner {
                options,
                sink,
                meters,
                writer: Mutex::new(None),
                next_seq: AtomicU32::new(1),
                pending: Mutex::new(HashMap::new()),
                responses,
                connecting: AtomicBool::new(false),
                connected: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                reader: Mutex::new(None),
                version: Mutex::new(None),
                handle: Mutex::new(None),
            }),
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ChannelState {
        if self.inner.connected.load(Ordering::SeqCst) {
            ChannelState::Connected
        } else if self.inner.connecting.load(Ordering::SeqCst) {
            ChannelState::Connecting
        } else {
            ChannelState::Disconnected
        }
    }

    /// Whether the channel is connected.
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Open the TCP connection and start the reader task.
    ///
    /// The sequence counter restarts at 1. When `auto_subscribe` is set the
    /// client program name and status subscriptions are sent immediately.
    pub async fn connect(&self, addr: SocketAddr) -> Result<()> {
        let inner = &self.inner;
        if inner.connected.load(Ordering::SeqCst)
            || inner
                .connecting
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
        {
            return Err(Error::InvalidParameter(
                "command channel is already connected".into(),
            ));
        }

        tracing::debug!(addr = %addr, "Connecting command channel");
        let stream = tokio::time::timeout(inner.options.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Timeout)
            .and_then(|r| r.map_err(|e| Error::Transport(format!("TCP connect to {addr} failed: {e}"))));

        let stream = match stream {
            Ok(s) => s,
            Err(e) => {
                inner.connecting.store(false, Ordering::SeqCst);
                tracing::warn!(addr = %addr, error = %e, "Command channel connect failed");
                return Err(e);
            }
        };
        // Low latency for short command lines.
        let _ = stream.set_nodelay(true);

        let (read_half, write_half) = stream.into_split();
        let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;

        *inner.writer.lock().await = Some(write_half);
        *inner.version.lock().await = None;
        *inner.handle.lock().await = None;
        inner.next_seq.store(1, Ordering::SeqCst);
        inner.connected.store(true, Ordering::SeqCst);
        inner.connecting.store(false, Ordering::SeqCst);
        inner.sink.apply(StateUpdate::connected(true));

        let reader = tokio::spawn(read_loop(read_half, Arc::clone(inner), generation));
        if let Some(old) = inner.reader.lock().await.replace(reader) {
            old.abort();
        }
        tracing::info!(addr = %addr, "Command channel connected");

        if inner.options.auto_subscribe {
            self.send_command(&Command::client_program(&inner.options.client_name))
                .await?;
            for object in ["slice all", "tx all", "interlock", "meter list"] {
                self.send_command(&Command::subscribe(object)).await?;
            }
        }
        Ok(())
    }

    /// Frame and write a command. Returns its sequence number.
    ///
    /// Fails with [`Error::NotConnected`] without touching the socket when
    /// the channel is not connected.
    pub async fn send(&self, verb: &str, args: &str) -> Result<u32> {
        self.write_command(verb, args, None).await
    }

    /// Send a prebuilt [`Command`].
    pub async fn send_command(&self, command: &Command) -> Result<u32> {
        self.send(command.verb, &command.args).await
    }

    /// Send a command and get a receiver for its correlated response.
    ///
    /// The receiver yields an error if the connection closes first. No
    /// timeout is applied.
    pub async fn send_tracked(
        &self,
        verb: &str,
        args: &str,
    ) -> Result<(u32, oneshot::Receiver<CommandResponse>)> {
        let (tx, rx) = oneshot::channel();
        let seq = self.write_command(verb, args, Some(tx)).await?;
        Ok((seq, rx))
    }

    /// Subscribe to every response the radio sends.
    pub fn subscribe_responses(&self) -> broadcast::Receiver<CommandResponse> {
        self.inner.responses.subscribe()
    }

    /// Protocol version the radio reported on this connection.
    pub async fn version(&self) -> Option<ProtocolVersion> {
        self.inner.version.lock().await.clone()
    }

    /// Client handle the radio assigned on this connection.
    pub async fn handle(&self) -> Option<u32> {
        *self.inner.handle.lock().await
    }

    /// Close the connection. Safe to call when already closed.
    pub async fn close(&self) {
        let inner = &self.inner;
        if let Some(mut writer) = inner.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        if let Some(reader) = inner.reader.lock().await.take() {
            reader.abort();
        }
        let generation = inner.generation.load(Ordering::SeqCst);
        inner.mark_disconnected(generation, "closed").await;
    }

    async fn write_command(
        &self,
        verb: &str,
        args: &str,
        waiter: Option<oneshot::Sender<CommandResponse>>,
    ) -> Result<u32> {
        let inner = &self.inner;
        if !inner.connected.load(Ordering::SeqCst) {
            return Err(Error::NotConnected);
        }

        let mut writer = inner.writer.lock().await;
        let w = writer.as_mut().ok_or(Error::NotConnected)?;

        let seq = inner.next_seq.fetch_add(1, Ordering::SeqCst);
        if let Some(tx) = waiter {
            inner.pending.lock().await.insert(seq, tx);
        }

        let encoded = codec::encode_command(seq, verb, args);
        tracing::debug!(seq = seq, verb = %verb, args = %args, "Sending command");

        let written = match w.write_all(&encoded).await {
            Ok(()) => w.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            inner.pending.lock().await.remove(&seq);
            writer.take();
            drop(writer);
            let generation = inner.generation.load(Ordering::SeqCst);
            inner.mark_disconnected(generation, "write failed").await;
            return Err(Error::Transport(format!("failed to send command: {e}")));
        }
        Ok(seq)
    }
}

impl Inner {
    /// Move to Disconnected, reporting it once per connection.
    async fn mark_disconnected(&self, generation: u64, reason: &str) {
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        if self
            .connected
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::trace!(reason = reason, "Command channel already disconnected");
            return;
        }

        // Dropping the senders wakes waiters with an error.
        self.pending.lock().await.clear();
        tracing::info!(reason = reason, "Command channel disconnected");
        self.sink.apply(StateUpdate::connected(false));
    }

    async fn dispatch_line(&self, line: &str) {
        match codec::parse_line(line) {
            Ok(InboundLine::Response(resp)) => {
                if !resp.is_ok() {
                    tracing::warn!(
                        seq = resp.sequence,
                        status = format!("{:08X}", resp.status),
                        data = %resp.data,
                        "Command failed"
                    );
                } else {
                    tracing::trace!(seq = resp.sequence, data = %resp.data, "Response received");
                }
                let waiter = self.pending.lock().await.remove(&resp.sequence);
                if let Some(tx) = waiter {
                    let _ = tx.send(resp.clone());
                }
                let _ = self.responses.send(resp);
            }
            Ok(InboundLine::Status(status)) => self.process_status(&status).await,
            Ok(InboundLine::Version(v)) => {
                tracing::debug!(version = %v, "Protocol version received");
                *self.version.lock().await = Some(v);
            }
            Ok(InboundLine::Handle(h)) => {
                tracing::debug!(handle = format!("{h:08X}"), "Client handle received");
                *self.handle.lock().await = Some(h);
            }
            Ok(InboundLine::Message(text)) => {
                tracing::info!(message = %text, "Radio message");
            }
            Ok(InboundLine::Unknown(line)) => {
                tracing::trace!(line = %line, "Unknown line from radio");
            }
            Err(e) => {
                tracing::trace!(error = %e, line = %line, "Failed to parse line");
            }
        }
    }

    async fn process_status(&self, status: &StatusLine) {
        match status.object_kind() {
            "slice" => match codec::parse_slice_status(status) {
                Ok(slice) if slice.index == self.options.slice_index => {
                    let update = self.slice_update(&slice);
                    if !update.is_empty() {
                        self.sink.apply(update);
                    }
                }
                Ok(_) => {}
                Err(e) => tracing::trace!(error = %e, "Failed to parse slice status"),
            },
            "interlock" | "transmit" | "tx" => {
                if let Some(tx) = codec::parse_tx_state(status) {
                    self.sink.apply(StateUpdate {
                        tx_active: Some(tx),
                        ..StateUpdate::default()
                    });
                }
            }
            "meter" => match codec::parse_meter_status(status) {
                Ok(defs) => {
                    let mut meters = self.meters.lock().await;
                    for def in &defs {
                        if let Some(role) = meters.apply_status(def) {
                            tracing::debug!(meter_id = def.id, role = role.as_str(), "Meter mapped");
                        }
                    }
                }
                Err(e) => tracing::trace!(error = %e, "Failed to parse meter status"),
            },
            _ => {}
        }
    }

    fn slice_update(&self, slice: &codec::SliceStatus) -> StateUpdate {
        let mut update = StateUpdate {
            frequency_hz: slice.frequency_mhz.map(mhz_to_hz),
            nb_enabled: slice.nb,
            nr_enabled: slice.nr,
            ..StateUpdate::default()
        };
        if let Some(mode_str) = &slice.mode {
            match mode::flex_to_mode(mode_str) {
                Ok(m) => update.mode = Some(m),
                Err(e) => tracing::debug!(error = %e, "Ignoring slice mode"),
            }
        }
        if let Some(step_hz) = slice.step_hz {
            match TuningStep::from_hz(step_hz) {
                Some(step) => update.tuning_step = Some(step),
                None => tracing::debug!(step_hz = step_hz, "Ignoring unsupported tuning step"),
            }
        }
        update
    }
}

/// Background task that reads from the socket and dispatches lines in
/// arrival order.
async fn read_loop(mut reader: OwnedReadHalf, inner: Arc<Inner>, generation: u64) {
    let mut lines = LineBuffer::new();
    let mut chunk = [0u8; 4096];

    let reason = loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break "closed by radio",
            Ok(n) => {
                if !lines.extend(&chunk[..n]) {
                    tracing::warn!("Discarding oversized line from radio");
                }
                while let Some(line) = lines.next_line() {
                    if !line.is_empty() {
                        inner.dispatch_line(&line).await;
                    }
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "TCP read error");
                break "read error";
            }
        }
    };

    inner.mark_disconnected(generation, reason).await;
}
