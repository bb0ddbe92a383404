//! # icomnet -- network control for Icom transceivers
//!
//! `icomnet` is an asynchronous Rust client for the WLAN (UDP) protocol
//! spoken by network-capable Icom amateur-radio transceivers such as the
//! IC-705 and IC-7610. It establishes the three coordinated UDP sessions
//! the protocol requires (control, CI-V, audio), authenticates, transports
//! raw CI-V command frames, and streams bidirectional 16-bit PCM audio at
//! 12 kHz.
//!
//! ## Quick Start
//!
//! ```toml
//! [dependencies]
//! icomnet = "0.1"
//! tokio = { version = "1", features = ["full"] }
//! ```
//!
//! Connect and read the radio's frequency via a raw CI-V frame:
//!
//! ```no_run
//! use icomnet::{ClientConfig, ClientEvent, WlanClient};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ClientConfig::new("192.168.1.70", "icom", "secret");
//!     let client = WlanClient::new(config).await?;
//!     let mut events = client.subscribe();
//!
//!     client.connect().await?;
//!     // Read operating frequency (CI-V command 0x03) from an IC-705.
//!     client.send_civ(&[0xFE, 0xFE, 0xA4, 0xE0, 0x03, 0xFD]).await?;
//!
//!     while let Ok(event) = events.recv().await {
//!         if let ClientEvent::CivFrame(frame) = event {
//!             println!("CI-V: {frame:02X?}");
//!             break;
//!         }
//!     }
//!     client.disconnect(None, false).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! The library is organized as a workspace of focused crates:
//!
//! | Crate                  | Purpose                                         |
//! |------------------------|-------------------------------------------------|
//! | `icomnet-core`         | Types, errors, and the [`ClientEvent`] stream   |
//! | `icomnet-proto`        | Mixed-endian packet codec, credential obfuscation, CI-V reassembly |
//! | `icomnet-client`       | UDP sessions, sub-sessions, connection controller |
//! | `icomnet-test-harness` | In-process mock radio for protocol tests        |
//! | **`icomnet`**          | This facade crate -- re-exports everything      |
//!
//! ## Events
//!
//! The client emits [`ClientEvent`]s through a broadcast channel: login and
//! status results, capabilities, reassembled CI-V frames, received audio,
//! and the connection lifecycle (loss, reconnect attempts, restoration).
//! Subscribe with [`WlanClient::subscribe`]; each subscriber receives an
//! independent copy of every event.
//!
//! ## Scope
//!
//! `icomnet` transports CI-V frames and PCM audio; it does not interpret
//! CI-V commands, convert S-meter units, discover radios via mDNS, or talk
//! to sound hardware. Those concerns layer on top of the event stream and
//! the send primitives.

pub use icomnet_core::*;

/// The pure packet codec: builders, validating parsers, credential
/// obfuscation, and CI-V frame reassembly.
pub mod proto {
    pub use icomnet_proto::*;
}

pub use icomnet_client::WlanClient;

/// Session-level building blocks, exposed for advanced integrations and
/// protocol tooling.
pub mod client {
    pub use icomnet_client::*;
}
