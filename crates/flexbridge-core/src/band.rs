//! Amateur band labelling for the VFO display.
//!
//! The radio tunes continuously across its whole coverage range; the
//! [`Band`] label is purely informational and is derived from the current
//! frequency each time state is pushed to the display.
//!
//! # Example
//!
//! ```
//! use flexbridge_core::Band;
//!
//! let band = Band::from_freq(14_074_000).unwrap();
//! assert_eq!(band, Band::Band20m);
//! assert_eq!(band.to_string(), "20m");
//! ```

use std::fmt;
use std::str::FromStr;

use crate::types::FrequencyRange;

/// Amateur band within the radio's HF + 6 m coverage.
///
/// Band edges follow ITU Region 2 allocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Band {
    /// 160 meters (1.8–2.0 MHz).
    Band160m,
    /// 80 meters (3.5–4.0 MHz).
    Band80m,
    /// 60 meters (5.3305–5.4035 MHz).
    Band60m,
    /// 40 meters (7.0–7.3 MHz).
    Band40m,
    /// 30 meters (10.1–10.15 MHz).
    Band30m,
    /// 20 meters (14.0–14.35 MHz).
    Band20m,
    /// 17 meters (18.068–18.168 MHz).
    Band17m,
    /// 15 meters (21.0–21.45 MHz).
    Band15m,
    /// 12 meters (24.89–24.99 MHz).
    Band12m,
    /// 10 meters (28.0–29.7 MHz).
    Band10m,
    /// 6 meters (50.0–54.0 MHz).
    Band6m,
}

/// All bands in frequency order, lowest first.
const ALL_BANDS: &[Band] = &[
    Band::Band160m,
    Band::Band80m,
    Band::Band60m,
    Band::Band40m,
    Band::Band30m,
    Band::Band20m,
    Band::Band17m,
    Band::Band15m,
    Band::Band12m,
    Band::Band10m,
    Band::Band6m,
];

impl Band {
    /// Returns the band containing the given frequency, or `None` when the
    /// frequency is outside every amateur allocation (e.g. shortwave
    /// broadcast listening).
    pub fn from_freq(freq_hz: u64) -> Option<Band> {
        ALL_BANDS
            .iter()
            .copied()
            .find(|band| band.freq_range().contains(freq_hz))
    }

    /// Returns the frequency range (lower and upper edges) for this band.
    pub fn freq_range(&self) -> FrequencyRange {
        match self {
            Band::Band160m => FrequencyRange::new(1_800_000, 2_000_000),
            Band::Band80m => FrequencyRange::new(3_500_000, 4_000_000),
            Band::Band60m => FrequencyRange::new(5_330_500, 5_403_500),
            Band::Band40m => FrequencyRange::new(7_000_000, 7_300_000),
            Band::Band30m => FrequencyRange::new(10_100_000, 10_150_000),
            Band::Band20m => FrequencyRange::new(14_000_000, 14_350_000),
            Band::Band17m => FrequencyRange::new(18_068_000, 18_168_000),
            Band::Band15m => FrequencyRange::new(21_000_000, 21_450_000),
            Band::Band12m => FrequencyRange::new(24_890_000, 24_990_000),
            Band::Band10m => FrequencyRange::new(28_000_000, 29_700_000),
            Band::Band6m => FrequencyRange::new(50_000_000, 54_000_000),
        }
    }

    /// Returns the short band name (e.g. "20m").
    pub fn name(&self) -> &'static str {
        match self {
            Band::Band160m => "160m",
            Band::Band80m => "80m",
            Band::Band60m => "60m",
            Band::Band40m => "40m",
            Band::Band30m => "30m",
            Band::Band20m => "20m",
            Band::Band17m => "17m",
            Band::Band15m => "15m",
            Band::Band12m => "12m",
            Band::Band10m => "10m",
            Band::Band6m => "6m",
        }
    }

    /// Returns a slice of all bands in frequency order (lowest first).
    pub fn all() -> &'static [Band] {
        ALL_BANDS
    }
}

impl fmt::Display for Band {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Error returned when a string cannot be parsed into a [`Band`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseBandError(String);

impl fmt::Display for ParseBandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown band: '{}'", self.0)
    }
}

impl std::error::Error for ParseBandError {}

impl FromStr for Band {
    type Err = ParseBandError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let lower = s.to_lowercase();
        let trimmed = lower.strip_suffix('m').unwrap_or(&lower);
        ALL_BANDS
            .iter()
            .copied()
            .find(|b| b.name().trim_end_matches('m') == trimmed)
            .ok_or_else(|| ParseBandError(s.to_string()))
    }
}
