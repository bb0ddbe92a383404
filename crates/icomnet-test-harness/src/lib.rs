//! icomnet-test-harness: test utilities for icomnet.
//!
//! This crate provides [`MockRadio`], an in-process UDP peer that speaks
//! the radio side of the Icom WLAN protocol, enabling deterministic testing
//! of the connection controller without real hardware on the shack desk.

pub mod mock_radio;

pub use mock_radio::{MockRadio, MockRadioOptions};
