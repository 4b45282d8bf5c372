//! Error types for flexbridge.
//!
//! All fallible operations across the bridge return [`Result<T>`], which
//! uses [`Error`] as the error type. Transport-layer, protocol-layer, and
//! registration errors are all captured here.
//!
//! Two negative outcomes are deliberately *not* errors: a malformed
//! telemetry datagram (counted and dropped by the decoder) and a discovery
//! timeout (reported as `Discovery::NotFound`).

/// The error type for all flexbridge operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A transport-level error (TCP socket, UDP socket).
    #[error("transport error: {0}")]
    Transport(String),

    /// A protocol-level error (malformed response line, bad status field).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Timed out waiting for a response the caller chose to wait for.
    #[error("timeout waiting for response")]
    Timeout,

    /// An invalid parameter was passed to a command or state update.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// The command channel is not connected.
    #[error("not connected")]
    NotConnected,

    /// The connection to the radio was lost unexpectedly.
    #[error("connection lost")]
    ConnectionLost,

    /// An action or key descriptor failed validation at registration time.
    ///
    /// Carries the offending descriptor id and field so the operator can
    /// fix the mapping before it shows up as misrouted input.
    #[error("invalid registration for '{descriptor}': field '{field}' {reason}")]
    InvalidRegistration {
        /// Id of the descriptor that failed validation.
        descriptor: String,
        /// Name of the offending field.
        field: &'static str,
        /// Human-readable description of the problem.
        reason: String,
    },

    /// A configuration file could not be read or parsed.
    #[error("configuration error: {0}")]
    Config(String),

    /// An underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_transport() {
        let e = Error::Transport("connection refused".into());
        assert_eq!(e.to_string(), "transport error: connection refused");
    }

    #[test]
    fn error_display_protocol() {
        let e = Error::Protocol("bad response line".into());
        assert_eq!(e.to_string(), "protocol error: bad response line");
    }

    #[test]
    fn error_display_not_connected() {
        assert_eq!(Error::NotConnected.to_string(), "not connected");
    }

    #[test]
    fn error_display_invalid_registration_names_descriptor_and_field() {
        let e = Error::InvalidRegistration {
            descriptor: "ptt_key".into(),
            field: "mode",
            reason: "has unknown value 'default'".into(),
        };
        let text = e.to_string();
        assert!(text.contains("ptt_key"), "{text}");
        assert!(text.contains("mode"), "{text}");
        assert!(text.contains("default"), "{text}");
    }

    #[test]
    fn error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broken");
        let e: Error = io_err.into();
        assert!(matches!(e, Error::Io(_)));
        assert!(e.to_string().contains("pipe broken"));
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}
        assert_send::<Error>();
        assert_sync::<Error>();
    }
}
