//! flexbridge-core: device state model, value types, and errors.
//!
//! Everything here is independent of the radio's wire protocol and of the
//! display surface. The radio backend (`flexbridge-flex`) and the bridge
//! itself (`flexbridge`) both build on these types.
//!
//! # Key types
//!
//! - [`DeviceState`] / [`StateUpdate`] -- canonical radio state and partial updates
//! - [`StateSink`] -- where protocol layers deliver their updates
//! - [`Mode`], [`Screen`], [`TuningStep`], [`KeyMode`] -- closed vocabularies
//! - [`Error`] / [`Result`] -- error handling

pub mod band;
pub mod error;
pub mod helpers;
pub mod state;
pub mod types;

pub use band::{Band, ParseBandError};
pub use error::{Error, Result};
pub use helpers::{format_freq_mhz, s_units_from_dbm, watts_from_dbm};
pub use state::{Changes, DeviceState, MEMORY_SLOTS, MemorySlot, Rejection, StateSink, StateUpdate};
pub use types::*;
