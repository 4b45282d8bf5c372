//! SmartSDR protocol backend for flexbridge.
//!
//! This crate talks to the radio. It provides:
//!
//! - **Codec** ([`codec`]) -- command framing, inbound line buffering, and
//!   parsing of responses and status lines.
//! - **Command channel** ([`client`]) -- the persistent TCP connection with
//!   sequence-numbered commands and status folding.
//! - **Discovery** ([`discovery`]) -- find the radio from its UDP
//!   broadcast announcements.
//! - **Telemetry** ([`telemetry`]) -- decode, throttle and apply UDP meter
//!   readings.
//! - **Meters** ([`meters`]) -- the runtime meter-id to role mapping.
//!
//! # Architecture
//!
//! The radio uses a split transport:
//! - **TCP** for commands (`C<seq>|<verb> <args>\n`), responses and status
//! - **UDP** for real-time meter readings
//!
//! Neither half holds device state of its own. Both deliver
//! [`StateUpdate`](flexbridge_core::StateUpdate)s to a
//! [`StateSink`](flexbridge_core::StateSink) supplied by the caller, and
//! share a [`SharedMeterMap`](meters::SharedMeterMap) so that meter ids
//! announced on TCP are understood by the UDP side.

pub mod client;
pub mod codec;
pub mod discovery;
pub mod meters;
pub mod mode;
pub mod telemetry;

pub use client::{ChannelState, ClientOptions, CommandChannel};
pub use codec::{Command, CommandResponse};
pub use discovery::{DeviceMarker, DiscoveredRadio, Discovery};
pub use meters::{MeterMap, MeterRole, SharedMeterMap};
pub use telemetry::{Malformed, TelemetryReading, TelemetryStats, TelemetryStream, Throttle};
