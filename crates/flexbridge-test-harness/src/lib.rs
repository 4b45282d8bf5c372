//! flexbridge-test-harness: a scripted stand-in for the radio.
//!
//! [`MockRadio`] listens on a loopback TCP port and speaks enough of the
//! command protocol to exercise the bridge end to end without hardware.

pub mod mock_radio;

pub use mock_radio::MockRadio;
