//! LAN discovery of the radio via UDP broadcast announcements.
//!
//! The radio periodically broadcasts a short ASCII announcement to UDP
//! port 4992: whitespace-separated `key=value` pairs describing the model,
//! serial number, address, and so on. Other devices share the port, so an
//! announcement is only accepted when it carries the device-type marker
//! pair (by default `type=radio`).
//!
//! # Usage
//!
//! ```no_run
//! use flexbridge_flex::discovery::{self, DeviceMarker, Discovery};
//! use std::time::Duration;
//!
//! # async fn example() -> flexbridge_core::Result<()> {
//! match discovery::discover(Duration::from_secs(3), &DeviceMarker::default()).await? {
//!     Discovery::Found(radio) => println!("{} at {}:{}", radio.model, radio.ip, radio.port),
//!     Discovery::NotFound => println!("no radio found"),
//! }
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use flexbridge_core::{Error, Result};

/// Default discovery broadcast port.
pub const DISCOVERY_PORT: u16 = 4992;

/// Default TCP command port when an announcement omits `port`.
pub const DEFAULT_COMMAND_PORT: u16 = 4992;

/// The `key=value` pair that identifies a radio announcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceMarker {
    pub key: String,
    pub value: String,
}

impl DeviceMarker {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        DeviceMarker {
            key: key.into(),
            value: value.into(),
        }
    }
}

impl Default for DeviceMarker {
    fn default() -> Self {
        DeviceMarker::new("type", "radio")
    }
}

/// A radio found on the local network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredRadio {
    /// Model name (e.g. "FLEX-6600").
    pub model: String,
    /// Serial number.
    pub serial: String,
    /// User-assigned nickname.
    pub nickname: String,
    /// Address of the radio.
    pub ip: IpAddr,
    /// TCP command port.
    pub port: u16,
    /// Firmware version string.
    pub firmware_version: String,
}

impl DiscoveredRadio {
    /// Socket address of the command port.
    pub fn command_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

/// Outcome of a discovery attempt. A timeout is `NotFound`, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Discovery {
    Found(DiscoveredRadio),
    NotFound,
}

/// Listen on the default port and return the first matching radio.
pub async fn discover(timeout: Duration, marker: &DeviceMarker) -> Result<Discovery> {
    discover_on_port(DISCOVERY_PORT, timeout, marker).await
}

/// Listen on a specific port and return the first matching radio.
///
/// The socket is released before returning on every path.
pub async fn discover_on_port(
    port: u16,
    timeout: Duration,
    marker: &DeviceMarker,
) -> Result<Discovery> {
    let socket = bind_discovery_socket(port)?;
    tracing::debug!(
        port = port,
        timeout_ms = timeout.as_millis() as u64,
        "Listening for radio announcements"
    );

    let mut buf = [0u8; 4096];
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }

        match tokio::time::timeout(remaining, socket.recv_from(&mut buf)).await {
            Ok(Ok((n, src))) => match parse_announcement(&buf[..n], src.ip(), marker) {
                Some(radio) => {
                    tracing::info!(
                        model = %radio.model,
                        serial = %radio.serial,
                        ip = %radio.ip,
                        port = radio.port,
                        "Discovered radio"
                    );
                    return Ok(Discovery::Found(radio));
                }
                None => {
                    tracing::trace!(src = %src, "Ignoring non-radio announcement");
                }
            },
            Ok(Err(e)) => {
                tracing::trace!(error = %e, "Discovery recv error");
            }
            Err(_) => break,
        }
    }

    tracing::debug!("Discovery timed out");
    Ok(Discovery::NotFound)
}

/// Bind the discovery socket on all interfaces.
///
/// Address (and, on unix, port) reuse is enabled so the bridge can listen
/// alongside other clients that hold the discovery port the same way.
fn bind_discovery_socket(port: u16) -> Result<UdpSocket> {
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
    let failed = |what: &str, e: std::io::Error| {
        Error::Transport(format!("failed to {what} discovery socket on {addr}: {e}"))
    };

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| failed("create", e))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| failed("set SO_REUSEADDR on", e))?;
    #[cfg(unix)]
    socket
        .set_reuse_port(true)
        .map_err(|e| failed("set SO_REUSEPORT on", e))?;
    socket
        .set_broadcast(true)
        .map_err(|e| failed("enable broadcast on", e))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| failed("configure", e))?;
    socket.bind(&addr.into()).map_err(|e| failed("bind", e))?;

    UdpSocket::from_std(socket.into()).map_err(|e| failed("register", e))
}

/// Parse one announcement datagram.
///
/// Returns `None` unless the payload is UTF-8 and carries the marker pair.
/// `ip` and `port` keys in the payload override the datagram's source.
pub fn parse_announcement(
    data: &[u8],
    src_ip: IpAddr,
    marker: &DeviceMarker,
) -> Option<DiscoveredRadio> {
    let text = std::str::from_utf8(data).ok()?;
    let kv: HashMap<&str, &str> = text
        .split_whitespace()
        .filter_map(|token| token.split_once('='))
        .collect();

    if kv.get(marker.key.as_str()) != Some(&marker.value.as_str()) {
        return None;
    }

    let get = |key: &str| kv.get(key).map(|v| v.to_string()).unwrap_or_default();

    Some(DiscoveredRadio {
        model: get("model"),
        serial: get("serial"),
        nickname: kv
            .get("nickname")
            .or_else(|| kv.get("callsign"))
            .map(|v| v.to_string())
            .unwrap_or_default(),
        ip: kv.get("ip").and_then(|s| s.parse().ok()).unwrap_or(src_ip),
        port: kv
            .get("port")
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_COMMAND_PORT),
        firmware_version: get("version"),
    })
}
