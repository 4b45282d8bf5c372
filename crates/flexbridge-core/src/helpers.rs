//! Unit conversions used when folding meter readings into device state.

/// Format a frequency in hertz the way the VFO screen shows it.
///
/// ```
/// use flexbridge_core::format_freq_mhz;
///
/// assert_eq!(format_freq_mhz(14_250_000), "14.250.000");
/// assert_eq!(format_freq_mhz(7_074_500), "7.074.500");
/// ```
pub fn format_freq_mhz(freq_hz: u64) -> String {
    let mhz = freq_hz / 1_000_000;
    let khz = (freq_hz / 1_000) % 1_000;
    let hz = freq_hz % 1_000;
    format!("{mhz}.{khz:03}.{hz:03}")
}

/// Convert a signal strength in dBm to an S-unit label.
///
/// S9 is -73 dBm and each S-unit is 6 dB. Readings above S9 are shown
/// as `S9+N dB`.
///
/// ```
/// use flexbridge_core::s_units_from_dbm;
///
/// assert_eq!(s_units_from_dbm(-73.0), "S9");
/// assert_eq!(s_units_from_dbm(-63.0), "S9+10 dB");
/// ```
pub fn s_units_from_dbm(dbm: f32) -> String {
    if dbm > -73.0 {
        let over = (dbm + 73.0).round() as i32;
        format!("S9+{over} dB")
    } else {
        let s = ((dbm + 127.0) / 6.0).round() as i32;
        format!("S{}", s.clamp(0, 9))
    }
}

/// Convert a power level in dBm to watts.
///
/// ```
/// use flexbridge_core::watts_from_dbm;
///
/// assert!((watts_from_dbm(50.0) - 100.0).abs() < 0.01);
/// ```
pub fn watts_from_dbm(dbm: f32) -> f32 {
    10f32.powf((dbm - 30.0) / 10.0)
}
