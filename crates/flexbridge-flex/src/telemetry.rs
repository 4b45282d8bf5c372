//! UDP meter telemetry: decoder, throttle, and the receiving stream.
//!
//! The radio streams meter readings to UDP port 4991. Each datagram is at
//! least 16 bytes:
//!
//! ```text
//! offset 0..2   meter id, u16 big-endian
//! offset 2..4   signal,   i16 big-endian, 1/128 dB units
//! offset 4..16  reserved
//! ```
//!
//! [`decode`] is a pure parser. [`TelemetryStream`] owns the socket,
//! counts malformed datagrams, and passes readings through a per-meter
//! [`Throttle`] before they reach the device state. Readings the throttle
//! rejects are dropped, never queued.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use flexbridge_core::{Error, Result, StateSink};

use crate::meters::SharedMeterMap;

/// Default telemetry port.
pub const TELEMETRY_PORT: u16 = 4991;

/// Smallest datagram that carries a reading.
pub const MIN_PACKET_LEN: usize = 16;

/// Default minimum interval between accepted readings of one meter.
pub const DEFAULT_THROTTLE_INTERVAL: Duration = Duration::from_secs(3);

/// Scale from raw signal units to dB.
const SIGNAL_SCALE: f32 = 128.0;

/// One decoded meter reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TelemetryReading {
    /// Meter id as assigned by the radio.
    pub meter_id: u16,
    /// Scaled signal value (dBm for level meters).
    pub value_dbm: f32,
    /// When the datagram was received.
    pub received_at: Instant,
}

/// Why a datagram could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Malformed {
    /// Fewer than [`MIN_PACKET_LEN`] bytes.
    #[error("telemetry datagram too short: {len} bytes (need {MIN_PACKET_LEN})")]
    TooShort { len: usize },
}

/// Decode a datagram, stamping it with the current time.
pub fn decode(data: &[u8]) -> std::result::Result<TelemetryReading, Malformed> {
    decode_at(data, Instant::now())
}

/// Decode a datagram received at `received_at`.
pub fn decode_at(
    data: &[u8],
    received_at: Instant,
) -> std::result::Result<TelemetryReading, Malformed> {
    if data.len() < MIN_PACKET_LEN {
        return Err(Malformed::TooShort { len: data.len() });
    }
    let meter_id = u16::from_be_bytes([data[0], data[1]]);
    let raw = i16::from_be_bytes([data[2], data[3]]);
    Ok(TelemetryReading {
        meter_id,
        value_dbm: f32::from(raw) / SIGNAL_SCALE,
        received_at,
    })
}

/// Per-meter rate gate.
///
/// A reading is admitted only if at least `interval` has passed since the
/// last *admitted* reading for the same meter id.
#[derive(Debug)]
pub struct Throttle {
    interval: Duration,
    last_accepted: HashMap<u16, Instant>,
}

impl Throttle {
    /// Create a throttle with the given interval.
    pub fn new(interval: Duration) -> Self {
        Throttle {
            interval,
            last_accepted: HashMap::new(),
        }
    }

    /// The configured interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Decide whether a reading for `meter_id` at `at` may pass.
    pub fn admit(&mut self, meter_id: u16, at: Instant) -> bool {
        match self.last_accepted.get(&meter_id) {
            Some(&last) if at.saturating_duration_since(last) < self.interval => false,
            _ => {
                self.last_accepted.insert(meter_id, at);
                true
            }
        }
    }

    /// Forget every meter's history.
    pub fn reset(&mut self) {
        self.last_accepted.clear();
    }
}

impl Default for Throttle {
    fn default() -> Self {
        Self::new(DEFAULT_THROTTLE_INTERVAL)
    }
}

/// Counters kept by a running stream.
#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    malformed: AtomicU64,
    throttled: AtomicU64,
    unmapped: AtomicU64,
    applied: AtomicU64,
}

/// Snapshot of a stream's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TelemetryStats {
    /// Datagrams received.
    pub received: u64,
    /// Datagrams that failed to decode.
    pub malformed: u64,
    /// Readings dropped by the throttle.
    pub throttled: u64,
    /// Readings for meter ids with no known role.
    pub unmapped: u64,
    /// Readings folded into the device state.
    pub applied: u64,
}

/// The UDP telemetry receiver.
///
/// Binding spawns a background task that runs until [`close`] is called
/// or the stream is dropped.
///
/// [`close`]: TelemetryStream::close
pub struct TelemetryStream {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<Counters>,
}

impl TelemetryStream {
    /// Bind the telemetry socket and start receiving.
    pub async fn bind(
        addr: SocketAddr,
        interval: Duration,
        meters: SharedMeterMap,
        sink: Arc<dyn StateSink>,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await.map_err(|e| {
            Error::Transport(format!("failed to bind telemetry socket on {addr}: {e}"))
        })?;
        let local_addr = socket.local_addr()?;

        tracing::debug!(
            addr = %local_addr,
            throttle_ms = interval.as_millis() as u64,
            "Telemetry stream started"
        );

        let cancel = CancellationToken::new();
        let counters = Arc::new(Counters::default());
        let task = tokio::spawn(read_loop(
            socket,
            Throttle::new(interval),
            meters,
            sink,
            Arc::clone(&counters),
            cancel.clone(),
        ));

        Ok(TelemetryStream {
            local_addr,
            cancel,
            task: Mutex::new(Some(task)),
            counters,
        })
    }

    /// Address the socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Current counter values.
    pub fn stats(&self) -> TelemetryStats {
        TelemetryStats {
            received: self.counters.received.load(Ordering::Relaxed),
            malformed: self.counters.malformed.load(Ordering::Relaxed),
            throttled: self.counters.throttled.load(Ordering::Relaxed),
            unmapped: self.counters.unmapped.load(Ordering::Relaxed),
            applied: self.counters.applied.load(Ordering::Relaxed),
        }
    }

    /// Stop receiving and release the socket. Safe to call repeatedly.
    pub async fn close(&self) {
        self.cancel.cancel();
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            let _ = task.await;
            tracing::debug!(addr = %self.local_addr, "Telemetry stream closed");
        }
    }
}

impl Drop for TelemetryStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn read_loop(
    socket: UdpSocket,
    mut throttle: Throttle,
    meters: SharedMeterMap,
    sink: Arc<dyn StateSink>,
    counters: Arc<Counters>,
    cancel: CancellationToken,
) {
    let mut buf = [0u8; 2048];

    loop {
        let received = tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            received = socket.recv_from(&mut buf) => received,
        };

        let (n, src) = match received {
            Ok(r) => r,
            Err(e) => {
                // Non-fatal for UDP.
                tracing::trace!(error = %e, "Telemetry recv error");
                continue;
            }
        };
        counters.received.fetch_add(1, Ordering::Relaxed);

        let reading = match decode(&buf[..n]) {
            Ok(r) => r,
            Err(e) => {
                counters.malformed.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(error = %e, src = %src, "Dropping malformed telemetry");
                continue;
            }
        };

        // Unmapped readings must not open a throttle window for their id.
        let role = meters.lock().await.role_for_id(reading.meter_id);
        let Some(role) = role else {
            counters.unmapped.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(meter_id = reading.meter_id, "Reading for unmapped meter");
            continue;
        };

        if !throttle.admit(reading.meter_id, reading.received_at) {
            counters.throttled.fetch_add(1, Ordering::Relaxed);
            continue;
        }

        tracing::trace!(
            meter_id = reading.meter_id,
            role = role.as_str(),
            value = reading.value_dbm,
            "Meter reading"
        );
        counters.applied.fetch_add(1, Ordering::Relaxed);
        sink.apply(role.update(reading.value_dbm));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meters::{MeterMap, MeterRole};
    use flexbridge_core::StateUpdate;

    fn packet(meter_id: u16, raw: i16) -> Vec<u8> {
        let mut data = vec![0u8; MIN_PACKET_LEN];
        data[0..2].copy_from_slice(&meter_id.to_be_bytes());
        data[2..4].copy_from_slice(&raw.to_be_bytes());
        data
    }

    #[derive(Default)]
    struct Recorder(std::sync::Mutex<Vec<StateUpdate>>);

    impl StateSink for Recorder {
        fn apply(&self, update: StateUpdate) {
            self.0.lock().unwrap().push(update);
        }
    }

    #[test]
    fn decode_signed_signal() {
        let mut data = vec![0x00, 0x01, 0xFF, 0x38];
        data.resize(MIN_PACKET_LEN, 0);
        let reading = decode(&data).unwrap();
        assert_eq!(reading.meter_id, 1);
        assert_eq!(reading.value_dbm, -1.5625);
    }

    #[test]
    fn decode_positive_and_extremes() {
        assert_eq!(decode(&packet(2, 128 * 40)).unwrap().value_dbm, 40.0);
        assert_eq!(decode(&packet(3, i16::MIN)).unwrap().value_dbm, -256.0);
        assert_eq!(decode(&packet(0xFFFF, 0)).unwrap().meter_id, 0xFFFF);
    }

    #[test]
    fn decode_too_short() {
        assert_eq!(decode(&[]), Err(Malformed::TooShort { len: 0 }));
        assert_eq!(decode(&[0u8; 15]), Err(Malformed::TooShort { len: 15 }));
        assert!(decode(&[0u8; 16]).is_ok());
    }

    #[test]
    fn decode_ignores_trailing_bytes() {
        let mut data = packet(5, -128);
        data.extend_from_slice(&[0xAA; 32]);
        let reading = decode(&data).unwrap();
        assert_eq!(reading.meter_id, 5);
        assert_eq!(reading.value_dbm, -1.0);
    }

    #[test]
    fn throttle_admits_first_and_after_interval() {
        let mut throttle = Throttle::default();
        let t0 = Instant::now();
        assert!(throttle.admit(1, t0));
        assert!(!throttle.admit(1, t0 + Duration::from_millis(500)));
        assert!(throttle.admit(1, t0 + Duration::from_millis(3100)));
    }

    #[test]
    fn throttle_measures_from_last_accepted() {
        let mut throttle = Throttle::new(Duration::from_secs(3));
        let t0 = Instant::now();
        assert!(throttle.admit(1, t0));
        assert!(!throttle.admit(1, t0 + Duration::from_millis(2900)));
        // The window is measured from t0, not from the rejected reading.
        assert!(throttle.admit(1, t0 + Duration::from_millis(3000)));
    }

    #[test]
    fn throttle_is_per_meter() {
        let mut throttle = Throttle::default();
        let t0 = Instant::now();
        assert!(throttle.admit(1, t0));
        assert!(throttle.admit(2, t0 + Duration::from_millis(10)));
        assert!(!throttle.admit(2, t0 + Duration::from_millis(20)));
        throttle.reset();
        assert!(throttle.admit(2, t0 + Duration::from_millis(30)));
    }

    #[tokio::test]
    async fn stream_applies_counts_and_throttles() {
        let recorder = Arc::new(Recorder::default());
        let stream = TelemetryStream::bind(
            "127.0.0.1:0".parse().unwrap(),
            Duration::from_secs(3),
            MeterMap::default().shared(),
            recorder.clone(),
        )
        .await
        .unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = stream.local_addr();
        sender.send_to(&packet(1, -73 * 128), target).await.unwrap();
        sender.send_to(&packet(1, -60 * 128), target).await.unwrap();
        sender.send_to(&[0u8; 4], target).await.unwrap();
        sender.send_to(&packet(42, 0), target).await.unwrap();
        sender.send_to(&packet(3, 192), target).await.unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        let settled = |s: TelemetryStats| s.malformed + s.throttled + s.unmapped + s.applied;
        while settled(stream.stats()) < 5 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let stats = stream.stats();
        assert_eq!(stats.received, 5);
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.throttled, 1);
        assert_eq!(stats.unmapped, 1);
        assert_eq!(stats.applied, 2);

        let updates = recorder.0.lock().unwrap().clone();
        assert_eq!(updates[0].s_meter_dbm, Some(-73.0));
        assert_eq!(updates[1].swr_ratio, Some(1.5));

        stream.close().await;
        stream.close().await;
    }

    #[tokio::test]
    async fn unmapped_reading_does_not_start_the_throttle_window() {
        let recorder = Arc::new(Recorder::default());
        let meters = MeterMap::default().shared();
        let stream = TelemetryStream::bind(
            "127.0.0.1:0".parse().unwrap(),
            Duration::from_secs(3),
            meters.clone(),
            recorder.clone(),
        )
        .await
        .unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = stream.local_addr();
        sender.send_to(&packet(12, 128), target).await.unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while stream.stats().unmapped < 1 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // The radio announces meter 12 as SWR; its next reading counts.
        meters.lock().await.insert(12, MeterRole::Swr);
        sender.send_to(&packet(12, 256), target).await.unwrap();
        while stream.stats().applied < 1 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let stats = stream.stats();
        assert_eq!(stats.unmapped, 1);
        assert_eq!(stats.throttled, 0);
        assert_eq!(stats.applied, 1);
        assert_eq!(recorder.0.lock().unwrap()[0].swr_ratio, Some(2.0));

        stream.close().await;
    }

    #[tokio::test]
    async fn close_releases_socket() {
        let stream = TelemetryStream::bind(
            "127.0.0.1:0".parse().unwrap(),
            DEFAULT_THROTTLE_INTERVAL,
            MeterMap::default().shared(),
            Arc::new(Recorder::default()),
        )
        .await
        .unwrap();
        let addr = stream.local_addr();
        stream.close().await;

        let rebound = UdpSocket::bind(addr).await;
        assert!(rebound.is_ok());
    }
}
