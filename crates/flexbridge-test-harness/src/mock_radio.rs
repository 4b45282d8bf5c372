//! Mock radio for protocol-level testing.
//!
//! [`MockRadio`] accepts command-channel connections on a random loopback
//! port, one at a time. For each connection it:
//!
//! - optionally sends the `V`/`H` handshake lines,
//! - records every line the client writes,
//! - optionally acknowledges each `C<seq>|...` command with `R<seq>|0|`,
//! - writes any lines queued with [`push_line`](MockRadio::push_line),
//! - hangs up when asked with [`drop_connection`](MockRadio::drop_connection).
//!
//! # Example
//!
//! ```
//! use flexbridge_test_harness::MockRadio;
//! use std::time::Duration;
//!
//! # async fn example() -> flexbridge_core::Result<()> {
//! let radio = MockRadio::start().await?;
//! // ... connect a CommandChannel to radio.addr() and send commands ...
//! radio.push_line("S12345678|slice 0 RF_frequency=14.250000 mode=USB");
//! let lines = radio.wait_for_lines(1, Duration::from_secs(1)).await;
//! # let _ = lines;
//! # Ok(())
//! # }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use flexbridge_core::{Error, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

/// Handshake sent on every accepted connection.
pub const HANDSHAKE: &str = "V1.4.0.0\nH12345678\n";

enum Control {
    Line(String),
    Drop,
}

#[derive(Default)]
struct Shared {
    received: Mutex<Vec<String>>,
    connections: AtomicUsize,
}

/// Options for the mock radio.
#[derive(Debug, Clone)]
pub struct MockRadioOptions {
    /// Send `V`/`H` lines on connect.
    pub handshake: bool,
    /// Answer every command with a success response.
    pub auto_ack: bool,
}

impl Default for MockRadioOptions {
    fn default() -> Self {
        Self {
            handshake: true,
            auto_ack: true,
        }
    }
}

/// A scripted radio listening on loopback.
pub struct MockRadio {
    addr: SocketAddr,
    shared: Arc<Shared>,
    control: mpsc::UnboundedSender<Control>,
    task: JoinHandle<()>,
}

impl MockRadio {
    /// Start a mock radio with default options.
    pub async fn start() -> Result<Self> {
        Self::start_with_options(MockRadioOptions::default()).await
    }

    /// Start a mock radio with custom options.
    pub async fn start_with_options(options: MockRadioOptions) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| Error::Transport(format!("failed to bind mock radio: {e}")))?;
        let addr = listener.local_addr()?;

        let shared = Arc::new(Shared::default());
        let (control, control_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(serve(listener, Arc::clone(&shared), control_rx, options));

        Ok(MockRadio {
            addr,
            shared,
            control,
            task,
        })
    }

    /// Address clients should connect to.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Queue a line for the current (or next) connection. A trailing
    /// newline is added.
    pub fn push_line(&self, line: &str) {
        let _ = self.control.send(Control::Line(line.to_string()));
    }

    /// Hang up the current connection. The radio keeps listening.
    pub fn drop_connection(&self) {
        let _ = self.control.send(Control::Drop);
    }

    /// Every line received so far, across all connections.
    pub async fn received(&self) -> Vec<String> {
        self.shared.received.lock().await.clone()
    }

    /// Forget the lines received so far.
    pub async fn clear(&self) {
        self.shared.received.lock().await.clear();
    }

    /// Number of connections accepted so far.
    pub fn connections(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }

    /// Wait until at least `count` lines have arrived or `timeout` passes,
    /// then return what was received.
    pub async fn wait_for_lines(&self, count: usize, timeout: Duration) -> Vec<String> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let lines = self.received().await;
            if lines.len() >= count || tokio::time::Instant::now() >= deadline {
                return lines;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Wait until at least `count` connections have been accepted.
    pub async fn wait_for_connections(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.connections() < count {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        true
    }
}

impl Drop for MockRadio {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(
    listener: TcpListener,
    shared: Arc<Shared>,
    mut control: mpsc::UnboundedReceiver<Control>,
    options: MockRadioOptions,
) {
    loop {
        let stream = match listener.accept().await {
            Ok((stream, _)) => stream,
            Err(e) => {
                tracing::debug!(error = %e, "Mock radio accept failed");
                return;
            }
        };
        shared.connections.fetch_add(1, Ordering::SeqCst);

        if !serve_connection(stream, &shared, &mut control, &options).await {
            return;
        }
    }
}

/// Serve one connection. Returns `false` once the control side is gone.
async fn serve_connection(
    stream: TcpStream,
    shared: &Shared,
    control: &mut mpsc::UnboundedReceiver<Control>,
    options: &MockRadioOptions,
) -> bool {
    let (read_half, mut write_half) = stream.into_split();
    if options.handshake && write_half.write_all(HANDSHAKE.as_bytes()).await.is_err() {
        return true;
    }
    let mut lines = BufReader::new(read_half).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Ok(Some(line)) = line else {
                    return true;
                };
                let ack = options.auto_ack.then(|| ack_for(&line)).flatten();
                shared.received.lock().await.push(line);
                if let Some(ack) = ack {
                    if write_half.write_all(ack.as_bytes()).await.is_err() {
                        return true;
                    }
                }
            }
            ctrl = control.recv() => match ctrl {
                Some(Control::Line(line)) => {
                    let framed = format!("{line}\n");
                    if write_half.write_all(framed.as_bytes()).await.is_err() {
                        return true;
                    }
                }
                Some(Control::Drop) => return true,
                None => return false,
            },
        }
    }
}

/// `R<seq>|00000000|` for a `C<seq>|...` line.
fn ack_for(line: &str) -> Option<String> {
    let (seq, _) = line.strip_prefix('C')?.split_once('|')?;
    seq.parse::<u32>().ok()?;
    Some(format!("R{seq}|00000000|\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_only_for_commands() {
        assert_eq!(ack_for("C7|info").as_deref(), Some("R7|00000000|\n"));
        assert_eq!(ack_for("hello"), None);
        assert_eq!(ack_for("Cx|info"), None);
    }

    #[tokio::test]
    async fn records_lines_and_acks() {
        let radio = MockRadio::start().await.unwrap();
        let stream = TcpStream::connect(radio.addr()).await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();

        assert_eq!(lines.next_line().await.unwrap().unwrap(), "V1.4.0.0");
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "H12345678");

        write.write_all(b"C1|info\n").await.unwrap();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "R1|00000000|");
        assert_eq!(radio.received().await, vec!["C1|info"]);

        radio.push_line("S1|interlock state=READY");
        assert_eq!(
            lines.next_line().await.unwrap().unwrap(),
            "S1|interlock state=READY"
        );
    }

    #[tokio::test]
    async fn drop_then_accept_again() {
        let options = MockRadioOptions {
            handshake: false,
            auto_ack: false,
        };
        let radio = MockRadio::start_with_options(options).await.unwrap();

        let stream = TcpStream::connect(radio.addr()).await.unwrap();
        let mut lines = BufReader::new(stream).lines();
        radio.drop_connection();
        assert_eq!(lines.next_line().await.unwrap(), None);

        let _second = TcpStream::connect(radio.addr()).await.unwrap();
        assert!(radio.wait_for_connections(2, Duration::from_secs(1)).await);
    }
}
