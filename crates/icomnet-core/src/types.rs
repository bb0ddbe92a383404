//! Connection-level types shared across the icomnet crates.
//!
//! These are plain data types with no I/O: the connection phase state
//! machine, session identifiers, radio capabilities, and the configuration
//! structs consumed by the client.

use std::fmt;
use std::time::Duration;

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// ConnectionPhase
// ---------------------------------------------------------------------------

/// The top-level connection lifecycle phase.
///
/// Only the transitions listed in [`can_transition_to`](Self::can_transition_to)
/// are legal; the controller raises [`Error::InvalidTransition`] on anything
/// else rather than proceeding with a corrupt lifecycle.
///
/// ```text
/// IDLE -> CONNECTING
/// CONNECTING -> CONNECTED | DISCONNECTING | IDLE
/// CONNECTED -> DISCONNECTING | RECONNECTING
/// DISCONNECTING -> IDLE
/// RECONNECTING -> CONNECTED | IDLE
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    /// No connection; the client is quiescent.
    Idle,
    /// A connect attempt is in flight.
    Connecting,
    /// All three sessions are up and the health monitor is running.
    Connected,
    /// A disconnect is in progress (timers stopping, sockets draining).
    Disconnecting,
    /// The reconnect loop is re-establishing a lost connection.
    Reconnecting,
}

impl ConnectionPhase {
    /// Whether the state machine permits moving from `self` to `to`.
    pub fn can_transition_to(self, to: ConnectionPhase) -> bool {
        use ConnectionPhase::*;
        matches!(
            (self, to),
            (Idle, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnecting)
                | (Connecting, Idle)
                | (Connected, Disconnecting)
                | (Connected, Reconnecting)
                | (Disconnecting, Idle)
                | (Reconnecting, Connected)
                | (Reconnecting, Idle)
        )
    }

    /// Validate a transition, returning [`Error::InvalidTransition`] if the
    /// state machine does not permit it.
    pub fn validate_transition(self, to: ConnectionPhase) -> Result<()> {
        if self.can_transition_to(to) {
            Ok(())
        } else {
            Err(Error::InvalidTransition { from: self, to })
        }
    }
}

impl fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionPhase::Idle => "IDLE",
            ConnectionPhase::Connecting => "CONNECTING",
            ConnectionPhase::Connected => "CONNECTED",
            ConnectionPhase::Disconnecting => "DISCONNECTING",
            ConnectionPhase::Reconnecting => "RECONNECTING",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// SessionKind
// ---------------------------------------------------------------------------

/// Which of the three coordinated UDP sessions a packet or timer belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionKind {
    /// The control session on the user-configured port (commonly 50001).
    Control,
    /// The CI-V command session on a radio-advertised dynamic port.
    Civ,
    /// The PCM audio session on a radio-advertised dynamic port.
    Audio,
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionKind::Control => "control",
            SessionKind::Civ => "civ",
            SessionKind::Audio => "audio",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// RadioCapabilities
// ---------------------------------------------------------------------------

/// Capabilities learned from the radio's capability packet.
///
/// Published once per connection via the `capabilities` event and considered
/// stable until disconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RadioCapabilities {
    /// The radio's CI-V bus address (e.g. 0xA4 for the IC-705).
    pub civ_address: u8,
    /// The rig name as reported by the radio (NUL-trimmed).
    pub rig_name: String,
    /// The audio device name as reported by the radio (NUL-trimmed).
    pub audio_name: String,
    /// RX sample rate the radio offers, in hertz.
    pub rx_sample_rate: u16,
    /// TX sample rate the radio accepts, in hertz.
    pub tx_sample_rate: u16,
    /// Whether the radio accepts transmit audio from the network.
    pub supports_tx: bool,
}

impl Default for RadioCapabilities {
    fn default() -> Self {
        RadioCapabilities {
            // Until the capability packet arrives the IC-705 default applies.
            civ_address: 0xA4,
            rig_name: String::new(),
            audio_name: String::new(),
            rx_sample_rate: 12_000,
            tx_sample_rate: 12_000,
            supports_tx: false,
        }
    }
}

// ---------------------------------------------------------------------------
// ClientConfig
// ---------------------------------------------------------------------------

/// Connection parameters for a radio.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Radio hostname or IP address.
    pub host: String,
    /// Control UDP port (the port configured on the radio, commonly 50001).
    pub control_port: u16,
    /// Login username as configured on the radio.
    pub username: String,
    /// Login password as configured on the radio.
    pub password: String,
    /// Client program name sent in the login packet (at most 16 bytes).
    pub client_name: String,
    /// Overall bound on a single connect attempt.
    pub connect_timeout: Duration,
}

impl ClientConfig {
    /// Create a config with the standard control port (50001).
    pub fn new(
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        ClientConfig {
            host: host.into(),
            control_port: 50001,
            username: username.into(),
            password: password.into(),
            client_name: "icomnet".to_string(),
            connect_timeout: Duration::from_secs(30),
        }
    }
}

// ---------------------------------------------------------------------------
// MonitorConfig
// ---------------------------------------------------------------------------

/// Health-monitor and reconnect tuning.
///
/// All fields have conservative defaults matched to the radio's own timing;
/// tests shrink them to keep wall-clock time down.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// How long a session may go without receiving anything before the
    /// connection is declared lost.
    pub timeout: Duration,
    /// How often the monitor inspects the three sessions.
    pub check_interval: Duration,
    /// Whether to enter the reconnect loop on connection loss.
    pub auto_reconnect: bool,
    /// Maximum reconnect attempts; `None` means retry forever.
    pub max_attempts: Option<u32>,
    /// First reconnect delay; doubles each attempt.
    pub base_delay: Duration,
    /// Upper bound on the reconnect delay.
    pub max_delay: Duration,
    /// Pause between tearing the old sessions down and dialing again,
    /// giving the radio time to release the prior session.
    pub release_delay: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            timeout: Duration::from_secs(5),
            check_interval: Duration::from_secs(1),
            auto_reconnect: true,
            max_attempts: None,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            release_delay: Duration::from_secs(5),
        }
    }
}

impl MonitorConfig {
    /// The backoff delay before the given 1-based reconnect attempt:
    /// `min(base * 2^(attempt-1), max_delay)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let delay = self.base_delay.saturating_mul(1u32 << exp);
        delay.min(self.max_delay)
    }
}

// ---------------------------------------------------------------------------
// ConnectionMetrics
// ---------------------------------------------------------------------------

/// A point-in-time snapshot of connection health.
#[derive(Debug, Clone, Default)]
pub struct ConnectionMetrics {
    /// Current lifecycle phase.
    pub phase: Option<ConnectionPhase>,
    /// Id of the current (or most recent) connect attempt.
    pub session_id: u64,
    /// Time since the connection was established, if connected.
    pub connected_for: Option<Duration>,
    /// Time since the most recent disconnect, if any.
    pub since_last_disconnect: Option<Duration>,
    /// Time since each session last received a datagram.
    pub control_receive_age: Option<Duration>,
    /// Time since the CI-V session last received a datagram.
    pub civ_receive_age: Option<Duration>,
    /// Time since the audio session last received a datagram.
    pub audio_receive_age: Option<Duration>,
    /// Reconnect attempts made since the last successful connect.
    pub reconnect_attempts: u32,
}
