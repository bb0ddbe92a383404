//! icomnet-core: types, errors, and events for the icomnet Icom WLAN client.
//!
//! This crate defines the I/O-free foundations the other icomnet crates
//! build on. Applications depend on these types without pulling in the
//! codec or the network client.
//!
//! # Key types
//!
//! - [`ConnectionPhase`] -- the top-level connection lifecycle state machine
//! - [`ClientEvent`] -- asynchronous link and traffic notifications
//! - [`ClientConfig`] / [`MonitorConfig`] -- connection and health tuning
//! - [`Error`] / [`Result`] -- error handling

pub mod error;
pub mod events;
pub mod types;

// Re-export key types at crate root for ergonomic `use icomnet_core::*`.
pub use error::{Error, Result};
pub use events::ClientEvent;
pub use types::{
    ClientConfig, ConnectionMetrics, ConnectionPhase, MonitorConfig, RadioCapabilities,
    SessionKind,
};
