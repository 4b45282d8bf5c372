//! # flexbridge -- SmartSDR control bridge
//!
//! `flexbridge` connects a networked SmartSDR-style radio to a thin remote
//! display and input surface. It keeps one canonical [`DeviceState`],
//! pushes it to the display, and turns user input into radio commands.
//!
//! ## Architecture
//!
//! | Crate                      | Purpose                                          |
//! |----------------------------|--------------------------------------------------|
//! | `flexbridge-core`          | Device state model, value types, errors          |
//! | `flexbridge-flex`          | Command channel, discovery, meter telemetry      |
//! | `flexbridge-test-harness`  | Scripted mock radio for tests                    |
//! | **`flexbridge`**           | This crate -- synchronizer, input, display, lifecycle |
//!
//! Inside this crate:
//!
//! - [`sync`] -- the [`Synchronizer`] and its push policy
//! - [`input`] -- the [`InputRouter`], action catalog, key descriptors
//! - [`display`] -- the JSON-lines display server
//! - [`bridge`] -- the [`Bridge`] lifecycle
//! - [`config`] -- `flexbridge.toml` loading
//! - [`logging`] -- tracing subscriber setup
//!
//! ## Quick Start
//!
//! ```no_run
//! use flexbridge::{Bridge, BridgeConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let (config, _) = BridgeConfig::load(None)?;
//!     flexbridge::logging::init_logging(Some(&config.logging.level));
//!
//!     let bridge = Bridge::new(config);
//!     bridge.start().await?;
//!     tokio::signal::ctrl_c().await?;
//!     bridge.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod bridge;
pub mod config;
pub mod display;
pub mod input;
pub mod logging;
pub mod sync;

pub use bridge::{Bridge, BridgeState};
pub use config::BridgeConfig;
pub use display::{DisplayMessage, DisplayRequest, DisplayServer};
pub use input::{
    ActionDescriptor, DirectTrigger, InputRouter, KeyDescriptor, MappedActionEvent,
    RegisteredKey, builtin_actions,
};
pub use sync::{Push, PushReason, SubscriptionId, Synchronizer};

pub use flexbridge_core::{DeviceState, Error, Result, StateUpdate};
