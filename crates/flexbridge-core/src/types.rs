//! Core value types shared by every flexbridge crate.
//!
//! These are the small, closed vocabularies of the bridge: operating
//! modes, display screens, tuning steps, and the physical key trigger
//! modes accepted from the external mapping subsystem.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Operating mode of the radio's active slice.
///
/// The variants use the radio's own wire spelling, so `Display` and
/// `FromStr` are the SmartSDR mode strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Mode {
    /// Upper sideband voice.
    #[default]
    USB,
    /// Lower sideband voice.
    LSB,
    /// CW (morse).
    CW,
    /// Amplitude modulation.
    AM,
    /// Frequency modulation.
    FM,
    /// Digital, upper sideband.
    DIGU,
    /// Digital, lower sideband.
    DIGL,
    /// Synchronous AM.
    SAM,
    /// Narrow FM.
    NFM,
    /// Radio teletype.
    RTTY,
}

/// All modes in cycling order.
const ALL_MODES: &[Mode] = &[
    Mode::USB,
    Mode::LSB,
    Mode::CW,
    Mode::AM,
    Mode::FM,
    Mode::DIGU,
    Mode::DIGL,
    Mode::SAM,
    Mode::NFM,
    Mode::RTTY,
];

impl Mode {
    /// Returns every mode in cycling order.
    pub fn all() -> &'static [Mode] {
        ALL_MODES
    }

    /// The wire spelling of this mode (e.g. `"DIGU"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::USB => "USB",
            Mode::LSB => "LSB",
            Mode::CW => "CW",
            Mode::AM => "AM",
            Mode::FM => "FM",
            Mode::DIGU => "DIGU",
            Mode::DIGL => "DIGL",
            Mode::SAM => "SAM",
            Mode::NFM => "NFM",
            Mode::RTTY => "RTTY",
        }
    }

    /// The next mode in cycling order, wrapping after the last.
    pub fn next(&self) -> Mode {
        let idx = self.position();
        ALL_MODES[(idx + 1) % ALL_MODES.len()]
    }

    /// The previous mode in cycling order, wrapping before the first.
    pub fn prev(&self) -> Mode {
        let idx = self.position();
        ALL_MODES[(idx + ALL_MODES.len() - 1) % ALL_MODES.len()]
    }

    fn position(&self) -> usize {
        ALL_MODES.iter().position(|m| m == self).unwrap_or(0)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a string cannot be parsed into a [`Mode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseModeError(String);

impl fmt::Display for ParseModeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown mode: {}", self.0)
    }
}

impl std::error::Error for ParseModeError {}

impl FromStr for Mode {
    type Err = ParseModeError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "USB" => Ok(Mode::USB),
            "LSB" => Ok(Mode::LSB),
            "CW" => Ok(Mode::CW),
            "AM" => Ok(Mode::AM),
            "FM" => Ok(Mode::FM),
            "DIGU" => Ok(Mode::DIGU),
            "DIGL" => Ok(Mode::DIGL),
            "SAM" => Ok(Mode::SAM),
            "NFM" => Ok(Mode::NFM),
            "RTTY" => Ok(Mode::RTTY),
            _ => Err(ParseModeError(s.to_string())),
        }
    }
}

/// Screen currently shown on the display surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Screen {
    /// Frequency / mode control.
    #[default]
    Vfo,
    /// Noise blanker and noise reduction.
    Dsp,
    /// Memory slots.
    Memory,
    /// Transmit controls and meters.
    Tx,
    /// Parks-on-the-air spot list.
    Pota,
}

impl Screen {
    /// Returns every screen in navigation order.
    pub fn all() -> &'static [Screen] {
        &[
            Screen::Vfo,
            Screen::Dsp,
            Screen::Memory,
            Screen::Tx,
            Screen::Pota,
        ]
    }

    /// The identifier the display uses for this screen.
    pub fn as_str(&self) -> &'static str {
        match self {
            Screen::Vfo => "VFO",
            Screen::Dsp => "DSP",
            Screen::Memory => "MEMORY",
            Screen::Tx => "TX",
            Screen::Pota => "POTA",
        }
    }
}

impl fmt::Display for Screen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Screen {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "VFO" => Ok(Screen::Vfo),
            "DSP" => Ok(Screen::Dsp),
            "MEMORY" => Ok(Screen::Memory),
            "TX" => Ok(Screen::Tx),
            "POTA" => Ok(Screen::Pota),
            _ => Err(format!("unknown screen: {s}")),
        }
    }
}

/// The ordered set of tuning step sizes, in hertz.
pub const TUNING_STEPS_HZ: [u64; 5] = [1, 10, 100, 1_000, 10_000];

/// A tuning step, stored as an index into [`TUNING_STEPS_HZ`].
///
/// The step size in hertz is always derived from the index, so the two
/// can never disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TuningStep(usize);

impl TuningStep {
    /// Create a step from an index. Returns `None` when out of range.
    pub fn from_index(index: usize) -> Option<Self> {
        (index < TUNING_STEPS_HZ.len()).then_some(TuningStep(index))
    }

    /// Create a step from a size in hertz. Returns `None` unless the size
    /// is one of [`TUNING_STEPS_HZ`].
    pub fn from_hz(hz: u64) -> Option<Self> {
        TUNING_STEPS_HZ
            .iter()
            .position(|&s| s == hz)
            .map(TuningStep)
    }

    /// Index into [`TUNING_STEPS_HZ`].
    pub fn index(&self) -> usize {
        self.0
    }

    /// Step size in hertz.
    pub fn hz(&self) -> u64 {
        TUNING_STEPS_HZ[self.0]
    }

    /// The next larger step, saturating at the largest.
    pub fn up(&self) -> Self {
        TuningStep((self.0 + 1).min(TUNING_STEPS_HZ.len() - 1))
    }

    /// The next smaller step, saturating at the smallest.
    pub fn down(&self) -> Self {
        TuningStep(self.0.saturating_sub(1))
    }
}

impl Default for TuningStep {
    /// 100 Hz.
    fn default() -> Self {
        TuningStep(2)
    }
}

/// How a physical key or encoder triggers its mapped action.
///
/// This is the closed 12-value vocabulary accepted by the external
/// mapping subsystem. Anything else, including the string `"default"`,
/// is rejected at registration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyMode {
    Press,
    Release,
    Hold,
    LongPress,
    DoublePress,
    Toggle,
    Repeat,
    PressRelease,
    RotateLeft,
    RotateRight,
    PushRotateLeft,
    PushRotateRight,
}

impl KeyMode {
    /// Returns all twelve key modes.
    pub fn all() -> &'static [KeyMode] {
        &[
            KeyMode::Press,
            KeyMode::Release,
            KeyMode::Hold,
            KeyMode::LongPress,
            KeyMode::DoublePress,
            KeyMode::Toggle,
            KeyMode::Repeat,
            KeyMode::PressRelease,
            KeyMode::RotateLeft,
            KeyMode::RotateRight,
            KeyMode::PushRotateLeft,
            KeyMode::PushRotateRight,
        ]
    }

    /// The wire spelling of this key mode.
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyMode::Press => "press",
            KeyMode::Release => "release",
            KeyMode::Hold => "hold",
            KeyMode::LongPress => "long_press",
            KeyMode::DoublePress => "double_press",
            KeyMode::Toggle => "toggle",
            KeyMode::Repeat => "repeat",
            KeyMode::PressRelease => "press_release",
            KeyMode::RotateLeft => "rotate_left",
            KeyMode::RotateRight => "rotate_right",
            KeyMode::PushRotateLeft => "push_rotate_left",
            KeyMode::PushRotateRight => "push_rotate_right",
        }
    }
}

impl fmt::Display for KeyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyMode {
    type Err = String;

    /// Exact, case-sensitive match against the twelve wire spellings.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        KeyMode::all()
            .iter()
            .copied()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| format!("unknown key mode: {s}"))
    }
}

/// An inclusive frequency range in hertz.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrequencyRange {
    /// Lower bound in hertz (inclusive).
    pub low_hz: u64,
    /// Upper bound in hertz (inclusive).
    pub high_hz: u64,
}

impl FrequencyRange {
    /// Create a new range.
    pub const fn new(low_hz: u64, high_hz: u64) -> Self {
        FrequencyRange { low_hz, high_hz }
    }

    /// Check whether a frequency falls within this range (inclusive).
    pub fn contains(&self, freq_hz: u64) -> bool {
        freq_hz >= self.low_hz && freq_hz <= self.high_hz
    }
}

impl fmt::Display for FrequencyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{} Hz", self.low_hz, self.high_hz)
    }
}

/// Receive coverage of the radio: 30 kHz to 54 MHz.
pub const DEVICE_COVERAGE: FrequencyRange = FrequencyRange::new(30_000, 54_000_000);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_round_trip_all() {
        for &mode in Mode::all() {
            let parsed: Mode = mode.to_string().parse().unwrap();
            assert_eq!(parsed, mode);
        }
        assert_eq!(Mode::all().len(), 10);
    }

    #[test]
    fn mode_parse_is_case_insensitive() {
        assert_eq!("digu".parse::<Mode>().unwrap(), Mode::DIGU);
        assert_eq!("Nfm".parse::<Mode>().unwrap(), Mode::NFM);
    }

    #[test]
    fn mode_parse_rejects_unknown() {
        assert!("CWR".parse::<Mode>().is_err());
        assert!("".parse::<Mode>().is_err());
    }

    #[test]
    fn mode_cycles_wrap() {
        assert_eq!(Mode::USB.next(), Mode::LSB);
        assert_eq!(Mode::RTTY.next(), Mode::USB);
        assert_eq!(Mode::USB.prev(), Mode::RTTY);
        assert_eq!(Mode::LSB.prev(), Mode::USB);
    }

    #[test]
    fn screen_identifiers() {
        for &screen in Screen::all() {
            assert_eq!(screen.as_str().parse::<Screen>().unwrap(), screen);
        }
        assert!("SETTINGS".parse::<Screen>().is_err());
    }

    #[test]
    fn tuning_step_index_and_value_agree() {
        let step = TuningStep::from_index(2).unwrap();
        assert_eq!(step.hz(), 100);
        let up = step.up();
        assert_eq!(up.index(), 3);
        assert_eq!(up.hz(), 1_000);
    }

    #[test]
    fn tuning_step_saturates() {
        let top = TuningStep::from_index(4).unwrap();
        assert_eq!(top.up(), top);
        let bottom = TuningStep::from_index(0).unwrap();
        assert_eq!(bottom.down(), bottom);
    }

    #[test]
    fn tuning_step_rejects_unknown() {
        assert!(TuningStep::from_index(5).is_none());
        assert!(TuningStep::from_hz(50).is_none());
        assert_eq!(TuningStep::from_hz(10_000).unwrap().index(), 4);
    }

    #[test]
    fn key_mode_has_twelve_values() {
        assert_eq!(KeyMode::all().len(), 12);
        for &m in KeyMode::all() {
            assert_eq!(m.as_str().parse::<KeyMode>().unwrap(), m);
        }
    }

    #[test]
    fn key_mode_rejects_default_sentinel() {
        assert!("default".parse::<KeyMode>().is_err());
        assert!("Press".parse::<KeyMode>().is_err());
        assert!("".parse::<KeyMode>().is_err());
    }

    #[test]
    fn device_coverage_edges() {
        assert!(DEVICE_COVERAGE.contains(30_000));
        assert!(DEVICE_COVERAGE.contains(54_000_000));
        assert!(!DEVICE_COVERAGE.contains(29_999));
        assert!(!DEVICE_COVERAGE.contains(144_200_000));
    }
}
