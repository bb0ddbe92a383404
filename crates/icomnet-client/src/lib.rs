//! icomnet-client: sessions and connection controller for the Icom WLAN
//! (UDP) protocol.
//!
//! The protocol runs three coordinated UDP sessions against the radio:
//!
//! - **control** -- handshake, login, token lifecycle, stream negotiation
//! - **CI-V** -- command frames on a radio-advertised dynamic port
//! - **audio** -- 16-bit PCM at 12 kHz, 50 Hz frame cadence, both ways
//!
//! [`WlanClient`] owns all three and exposes the connection lifecycle,
//! a broadcast stream of [`icomnet_core::ClientEvent`]s, raw CI-V
//! transport, and the transmit-audio queue.
//!
//! ```no_run
//! use icomnet_client::WlanClient;
//! use icomnet_core::ClientConfig;
//!
//! # async fn example() -> icomnet_core::Result<()> {
//! let client = WlanClient::new(ClientConfig::new("192.168.1.70", "icom", "secret")).await?;
//! client.connect().await?;
//! client.send_civ(&[0xFE, 0xFE, 0xA4, 0xE0, 0x03, 0xFD]).await?;
//! # Ok(())
//! # }
//! ```

pub mod audio;
pub mod civ;
pub mod controller;
pub mod session;
pub mod transport;

pub use audio::AudioSubsession;
pub use civ::CivSubsession;
pub use controller::WlanClient;
pub use session::Session;
pub use transport::{Datagram, UdpEndpoint};
