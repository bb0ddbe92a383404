//! Error types for icomnet.
//!
//! All fallible operations across the library return [`Result<T>`], which
//! uses [`Error`] as the error type. Transport-layer, protocol-layer, and
//! connection-lifecycle errors are all captured here.

use crate::types::ConnectionPhase;

/// The error type for all icomnet operations.
///
/// Variants cover the failure modes encountered when talking to a
/// network-attached transceiver: socket failures, malformed packets,
/// authentication rejection, timeouts, and cancelled connect attempts.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A transport-level error (UDP socket send/recv failure).
    #[error("transport error: {0}")]
    Transport(String),

    /// A protocol-level error (malformed packet, failed length or magic
    /// validation). Inbound packets that fail validation are dropped before
    /// reaching the state machine; this variant surfaces the reason.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Timed out waiting for the radio.
    ///
    /// This typically indicates the radio is powered off, unreachable, or
    /// the control port is wrong.
    #[error("timeout waiting for radio")]
    Timeout,

    /// The radio rejected the login credentials.
    #[error("authentication failed (radio error code {code:#010x})")]
    Auth {
        /// The raw error code from the login response.
        code: u32,
    },

    /// No connection to the radio has been established, or the session has
    /// already been closed.
    #[error("not connected")]
    NotConnected,

    /// The connection to the radio was lost unexpectedly.
    #[error("connection lost")]
    ConnectionLost,

    /// An illegal connection-phase transition was attempted.
    ///
    /// The connection state machine only permits the transitions listed in
    /// [`ConnectionPhase::can_transition_to`]; anything else is a logic
    /// error and is raised rather than silently applied.
    #[error("illegal phase transition: {from} -> {to}")]
    InvalidTransition {
        /// The phase the connection was in.
        from: ConnectionPhase,
        /// The phase that was requested.
        to: ConnectionPhase,
    },

    /// An in-flight connect attempt was cancelled by `disconnect()`.
    #[error("connect attempt {session_id} aborted during {phase}: {reason}")]
    Aborted {
        /// Why the attempt was cancelled.
        reason: String,
        /// The connect-attempt id that was cancelled.
        session_id: u64,
        /// The phase the connection was in when cancelled.
        phase: ConnectionPhase,
    },

    /// An audio or event stream was closed unexpectedly.
    #[error("stream closed")]
    StreamClosed,

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
        let e = Error::Transport("socket closed".into());
        assert_eq!(e.to_string(), "transport error: socket closed");
    }

    #[test]
    fn error_display_auth() {
        let e = Error::Auth { code: 1 };
        assert_eq!(
            e.to_string(),
            "authentication failed (radio error code 0x00000001)"
        );
    }

    #[test]
    fn error_display_invalid_transition() {
        let e = Error::InvalidTransition {
            from: ConnectionPhase::Idle,
            to: ConnectionPhase::Connected,
        };
        assert_eq!(e.to_string(), "illegal phase transition: IDLE -> CONNECTED");
    }

    #[test]
    fn error_display_aborted() {
        let e = Error::Aborted {
            reason: "user disconnect".into(),
            session_id: 3,
            phase: ConnectionPhase::Connecting,
        };
        assert_eq!(
            e.to_string(),
            "connect attempt 3 aborted during CONNECTING: user disconnect"
        );
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

    #[test]
    fn error_implements_std_error() {
        fn assert_std_error<T: std::error::Error>() {}
        assert_std_error::<Error>();
    }
}
