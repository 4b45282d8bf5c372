//! Canonical device state and partial updates.
//!
//! [`DeviceState`] is the single model of the radio that the bridge pushes
//! to the display. It is never mutated field-by-field from outside: every
//! change is expressed as a [`StateUpdate`] and folded in with
//! [`DeviceState::apply`], which validates the update and reports what
//! changed so the caller can decide when to notify the display.
//!
//! Producers that live outside the bridge crate (the command channel and
//! the telemetry stream) hand their updates to a [`StateSink`].

use crate::band::Band;
use crate::types::{DEVICE_COVERAGE, Mode, Screen, TuningStep};

/// Number of memory slots.
pub const MEMORY_SLOTS: usize = 8;

/// A stored frequency/mode pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemorySlot {
    /// Stored frequency in hertz.
    pub frequency_hz: u64,
    /// Stored operating mode.
    pub mode: Mode,
}

/// Complete state of the radio as presented to the display.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceState {
    /// Whether the command channel is connected.
    pub connected: bool,
    /// Active slice frequency in hertz.
    pub frequency_hz: u64,
    /// Active slice mode.
    pub mode: Mode,
    /// Tuning step used by the tune up/down actions.
    pub tuning_step: TuningStep,
    /// Whether the radio is transmitting.
    pub tx_active: bool,
    /// Noise blanker enabled.
    pub nb_enabled: bool,
    /// Noise reduction enabled.
    pub nr_enabled: bool,
    /// Last accepted S-meter reading in dBm.
    pub s_meter_dbm: f32,
    /// Last accepted forward power reading in watts.
    pub power_meter_watts: f32,
    /// Last accepted SWR reading.
    pub swr_ratio: f32,
    /// Memory slots; `None` is an empty slot.
    pub memory_slots: [Option<MemorySlot>; MEMORY_SLOTS],
    /// Screen shown on the display surface.
    pub active_screen: Screen,
}

impl Default for DeviceState {
    fn default() -> Self {
        DeviceState {
            connected: false,
            frequency_hz: 14_250_000,
            mode: Mode::USB,
            tuning_step: TuningStep::default(),
            tx_active: false,
            nb_enabled: false,
            nr_enabled: false,
            s_meter_dbm: -127.0,
            power_meter_watts: 0.0,
            swr_ratio: 1.0,
            memory_slots: [None; MEMORY_SLOTS],
            active_screen: Screen::Vfo,
        }
    }
}

impl DeviceState {
    /// Amateur band label for the current frequency, if any.
    pub fn band(&self) -> Option<Band> {
        Band::from_freq(self.frequency_hz)
    }

    /// Fold a partial update into the state.
    ///
    /// Fields that fail validation are left untouched and reported in
    /// [`Changes::rejected`]; the rest of the update still applies.
    pub fn apply(&mut self, update: &StateUpdate) -> Changes {
        let mut changes = Changes::default();

        if let Some(connected) = update.connected {
            if self.connected != connected {
                self.connected = connected;
                changes.connection = true;
            }
        }

        if let Some(freq_hz) = update.frequency_hz {
            if !DEVICE_COVERAGE.contains(freq_hz) {
                changes.rejected.push(Rejection {
                    field: "frequency_hz",
                    reason: format!("{freq_hz} Hz is outside {DEVICE_COVERAGE}"),
                });
            } else if self.frequency_hz != freq_hz {
                self.frequency_hz = freq_hz;
                changes.continuous = true;
            }
        }

        if let Some(mode) = update.mode {
            if self.mode != mode {
                self.mode = mode;
                changes.discrete = true;
            }
        }

        if let Some(step) = update.tuning_step {
            if self.tuning_step != step {
                self.tuning_step = step;
                changes.continuous = true;
            }
        }

        for (new, current) in [
            (update.tx_active, &mut self.tx_active),
            (update.nb_enabled, &mut self.nb_enabled),
            (update.nr_enabled, &mut self.nr_enabled),
        ] {
            if let Some(value) = new {
                if *current != value {
                    *current = value;
                    changes.discrete = true;
                }
            }
        }

        for (field, new, current) in [
            ("s_meter_dbm", update.s_meter_dbm, &mut self.s_meter_dbm),
            (
                "power_meter_watts",
                update.power_meter_watts,
                &mut self.power_meter_watts,
            ),
            ("swr_ratio", update.swr_ratio, &mut self.swr_ratio),
        ] {
            if let Some(value) = new {
                if !value.is_finite() {
                    changes.rejected.push(Rejection {
                        field,
                        reason: format!("non-finite value {value}"),
                    });
                } else if *current != value {
                    *current = value;
                    changes.meters = true;
                }
            }
        }

        if let Some((index, slot)) = update.memory_slot {
            match self.memory_slots.get_mut(index) {
                Some(existing) => {
                    if *existing != slot {
                        *existing = slot;
                        changes.discrete = true;
                    }
                }
                None => changes.rejected.push(Rejection {
                    field: "memory_slots",
                    reason: format!("slot {index} out of range 0..{MEMORY_SLOTS}"),
                }),
            }
        }

        if let Some(screen) = update.active_screen {
            if self.active_screen != screen {
                self.active_screen = screen;
                changes.screen = true;
            }
        }

        changes
    }
}

/// A partial update to [`DeviceState`]. `None` fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateUpdate {
    pub connected: Option<bool>,
    pub frequency_hz: Option<u64>,
    pub mode: Option<Mode>,
    pub tuning_step: Option<TuningStep>,
    pub tx_active: Option<bool>,
    pub nb_enabled: Option<bool>,
    pub nr_enabled: Option<bool>,
    pub s_meter_dbm: Option<f32>,
    pub power_meter_watts: Option<f32>,
    pub swr_ratio: Option<f32>,
    /// `(slot index, new contents)`; `None` contents clears the slot.
    pub memory_slot: Option<(usize, Option<MemorySlot>)>,
    pub active_screen: Option<Screen>,
}

impl StateUpdate {
    /// Update only the connection flag.
    pub fn connected(connected: bool) -> Self {
        StateUpdate {
            connected: Some(connected),
            ..Self::default()
        }
    }

    /// Update only the frequency.
    pub fn frequency(freq_hz: u64) -> Self {
        StateUpdate {
            frequency_hz: Some(freq_hz),
            ..Self::default()
        }
    }

    /// Update only the mode.
    pub fn mode(mode: Mode) -> Self {
        StateUpdate {
            mode: Some(mode),
            ..Self::default()
        }
    }

    /// Update only the tuning step.
    pub fn tuning_step(step: TuningStep) -> Self {
        StateUpdate {
            tuning_step: Some(step),
            ..Self::default()
        }
    }

    /// Update only the active screen.
    pub fn screen(screen: Screen) -> Self {
        StateUpdate {
            active_screen: Some(screen),
            ..Self::default()
        }
    }

    /// Whether the update carries no fields at all.
    pub fn is_empty(&self) -> bool {
        *self == StateUpdate::default()
    }
}

/// A field of a [`StateUpdate`] that failed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    /// Name of the rejected field.
    pub field: &'static str,
    /// Why it was rejected.
    pub reason: String,
}

/// What an applied [`StateUpdate`] actually changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Changes {
    /// The connected flag flipped.
    pub connection: bool,
    /// A discrete field changed (mode, tx, nb, nr, memory).
    pub discrete: bool,
    /// The active screen changed.
    pub screen: bool,
    /// Frequency or tuning step changed.
    pub continuous: bool,
    /// A meter value changed.
    pub meters: bool,
    /// Fields that were dropped by validation.
    pub rejected: Vec<Rejection>,
}

impl Changes {
    /// Whether the change must reach the display immediately.
    pub fn is_immediate(&self) -> bool {
        self.connection || self.discrete || self.screen
    }

    /// Whether the change can wait for the next periodic push.
    pub fn is_deferred(&self) -> bool {
        self.continuous || self.meters
    }
}

/// Receiver of state updates produced outside the bridge crate.
///
/// The command channel and the telemetry stream feed updates through this
/// trait; the bridge's state synchronizer is the production implementor.
pub trait StateSink: Send + Sync + 'static {
    /// Apply a partial update.
    fn apply(&self, update: StateUpdate);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_state() {
        let state = DeviceState::default();
        assert!(!state.connected);
        assert_eq!(state.tuning_step.hz(), 100);
        assert!(state.memory_slots.iter().all(Option::is_none));
        assert_eq!(state.active_screen, Screen::Vfo);
    }

    #[test]
    fn connect_is_immediate() {
        let mut state = DeviceState::default();
        let changes = state.apply(&StateUpdate::connected(true));
        assert!(changes.connection);
        assert!(changes.is_immediate());
        assert!(state.connected);
    }

    #[test]
    fn unchanged_value_reports_nothing() {
        let mut state = DeviceState::default();
        let changes = state.apply(&StateUpdate::mode(Mode::USB));
        assert_eq!(changes, Changes::default());
    }

    #[test]
    fn frequency_is_deferred() {
        let mut state = DeviceState::default();
        let changes = state.apply(&StateUpdate::frequency(7_074_000));
        assert!(changes.continuous);
        assert!(!changes.is_immediate());
        assert!(changes.is_deferred());
        assert_eq!(state.frequency_hz, 7_074_000);
        assert_eq!(state.band(), Some(Band::Band40m));
    }

    #[test]
    fn out_of_coverage_frequency_rejected_not_clamped() {
        let mut state = DeviceState::default();
        let before = state.frequency_hz;
        let changes = state.apply(&StateUpdate::frequency(144_200_000));
        assert_eq!(state.frequency_hz, before);
        assert_eq!(changes.rejected.len(), 1);
        assert_eq!(changes.rejected[0].field, "frequency_hz");
        assert!(!changes.continuous);
    }

    #[test]
    fn rejected_field_does_not_block_the_rest() {
        let mut state = DeviceState::default();
        let update = StateUpdate {
            frequency_hz: Some(0),
            mode: Some(Mode::CW),
            ..StateUpdate::default()
        };
        let changes = state.apply(&update);
        assert_eq!(state.mode, Mode::CW);
        assert!(changes.discrete);
        assert_eq!(changes.rejected.len(), 1);
    }

    #[test]
    fn screen_change_flagged() {
        let mut state = DeviceState::default();
        let changes = state.apply(&StateUpdate::screen(Screen::Dsp));
        assert!(changes.screen);
        assert_eq!(state.active_screen, Screen::Dsp);
    }

    #[test]
    fn meters_rejects_nan() {
        let mut state = DeviceState::default();
        let update = StateUpdate {
            s_meter_dbm: Some(f32::NAN),
            swr_ratio: Some(1.5),
            ..StateUpdate::default()
        };
        let changes = state.apply(&update);
        assert_eq!(changes.rejected.len(), 1);
        assert!(changes.meters);
        assert_eq!(state.swr_ratio, 1.5);
    }

    #[test]
    fn memory_slot_store_and_clear() {
        let mut state = DeviceState::default();
        let slot = MemorySlot {
            frequency_hz: 7_074_000,
            mode: Mode::DIGU,
        };
        let update = StateUpdate {
            memory_slot: Some((3, Some(slot))),
            ..StateUpdate::default()
        };
        assert!(state.apply(&update).discrete);
        assert_eq!(state.memory_slots[3], Some(slot));

        let clear = StateUpdate {
            memory_slot: Some((3, None)),
            ..StateUpdate::default()
        };
        state.apply(&clear);
        assert_eq!(state.memory_slots[3], None);
    }

    #[test]
    fn memory_slot_out_of_range_rejected() {
        let mut state = DeviceState::default();
        let update = StateUpdate {
            memory_slot: Some((8, None)),
            ..StateUpdate::default()
        };
        let changes = state.apply(&update);
        assert_eq!(changes.rejected[0].field, "memory_slots");
    }

    #[test]
    fn empty_update() {
        assert!(StateUpdate::default().is_empty());
        assert!(!StateUpdate::connected(false).is_empty());
    }
}
