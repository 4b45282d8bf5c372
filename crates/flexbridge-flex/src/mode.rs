//! Radio mode strings to [`Mode`] and back.
//!
//! Mode strings are uppercase ASCII in both commands and status lines.
//! A few modes the radio offers have no counterpart in [`Mode`] and are
//! folded onto the closest one:
//! - `CWR` -> `Mode::CW`
//! - `DFM` -> `Mode::FM`
//! - `FDV` (FreeDV) -> `Mode::DIGU`

use flexbridge_core::{Error, Mode, Result};

/// The radio's spelling of a [`Mode`].
pub fn mode_to_flex(mode: Mode) -> &'static str {
    mode.as_str()
}

/// Parse a radio mode string.
///
/// Matching is case-sensitive; the radio always sends uppercase.
pub fn flex_to_mode(flex_mode: &str) -> Result<Mode> {
    match flex_mode {
        "USB" => Ok(Mode::USB),
        "LSB" => Ok(Mode::LSB),
        "CW" | "CWR" => Ok(Mode::CW),
        "AM" => Ok(Mode::AM),
        "SAM" => Ok(Mode::SAM),
        "FM" | "DFM" => Ok(Mode::FM),
        "NFM" => Ok(Mode::NFM),
        "DIGU" | "FDV" => Ok(Mode::DIGU),
        "DIGL" => Ok(Mode::DIGL),
        "RTTY" => Ok(Mode::RTTY),
        _ => Err(Error::Protocol(format!("unknown radio mode: {flex_mode}"))),
    }
}
