//! Asynchronous client event types.
//!
//! Events are emitted by the connection controller through a
//! [`tokio::sync::broadcast`] channel as the radio link changes state and as
//! CI-V and audio traffic arrives. The command layer and user applications
//! subscribe to these; internal one-shot readiness signals (login complete,
//! sub-session ready) are **not** events -- they are single-use channels
//! private to a connect attempt.

use std::time::Duration;

use bytes::Bytes;

use crate::types::{RadioCapabilities, SessionKind};

/// An event emitted by the client as the radio link changes state.
///
/// Delivered on a best-effort basis through a bounded broadcast channel;
/// slow consumers may miss events under heavy load (e.g. 50 Hz audio).
/// Payload-carrying variants use [`Bytes`] so each subscriber's copy is a
/// cheap reference-count bump, not a buffer clone.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// The radio answered our login.
    Login {
        /// `true` if the radio accepted the credentials.
        ok: bool,
        /// The raw error code from the response (0 on success).
        error_code: u32,
        /// The connection string the radio reported (e.g. "FTTH").
        connection: String,
    },

    /// A status packet was processed.
    ///
    /// Port fields are zero when the radio sent a placeholder status during
    /// its busy/retry phase; such packets carry no port information and do
    /// not reprogram the sub-sessions.
    Status {
        /// Dynamic CI-V port advertised by the radio (0 = not advertised).
        civ_port: u16,
        /// Dynamic audio port advertised by the radio (0 = not advertised).
        audio_port: u16,
        /// Whether the status carried no error indication.
        auth_ok: bool,
        /// The radio's view of the link (`true` = connected).
        connected: bool,
    },

    /// The radio's capability record was parsed.
    Capabilities(RadioCapabilities),

    /// The raw payload of one inbound CI-V packet (bytes past the CI-V
    /// header, which may contain partial frames).
    Civ(Bytes),

    /// One complete reassembled CI-V frame, `FE FE ... FD` inclusive.
    CivFrame(Bytes),

    /// One received audio frame: 16-bit little-endian PCM at 12 kHz.
    Audio(Bytes),

    /// A transport error that did not change the connection phase.
    Error(String),

    /// All three sessions are up.
    Connected,

    /// The connection has been torn down.
    Disconnected,

    /// The health monitor declared the connection lost.
    ConnectionLost {
        /// Which session went silent.
        session: SessionKind,
        /// How long that session had been silent.
        elapsed: Duration,
    },

    /// The reconnect loop re-established the connection.
    ConnectionRestored {
        /// Wall-clock time from the triggering loss to the successful
        /// connect.
        downtime: Duration,
    },

    /// The reconnect loop is about to make an attempt.
    ReconnectAttempting {
        /// 1-based attempt number.
        attempt: u32,
        /// The backoff delay that precedes this attempt.
        delay: Duration,
    },

    /// A reconnect attempt failed.
    ReconnectFailed {
        /// 1-based attempt number.
        attempt: u32,
        /// Description of the failure.
        error: String,
        /// Whether another attempt will be made.
        will_retry: bool,
        /// The delay before the next attempt, if retrying.
        next_delay: Option<Duration>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_are_cloneable() {
        let event = ClientEvent::CivFrame(Bytes::from_static(&[0xFE, 0xFE, 0xE0, 0xA4, 0xFD]));
        let copy = event.clone();
        match (event, copy) {
            (ClientEvent::CivFrame(a), ClientEvent::CivFrame(b)) => assert_eq!(a, b),
            _ => panic!("clone changed variant"),
        }
    }

    #[test]
    fn audio_payload_is_shared_not_copied() {
        let payload = Bytes::from(vec![0u8; 480]);
        let event = ClientEvent::Audio(payload.clone());
        if let ClientEvent::Audio(bytes) = event {
            // Same backing storage: Bytes clones are reference counted.
            assert_eq!(bytes.as_ptr(), payload.as_ptr());
        } else {
            unreachable!();
        }
    }
}
