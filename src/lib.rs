//! hidlink - composite BLE HID keyboard/mouse peripheral.
//!
//! The link logic (connection, advertising, peer tracking, report
//! routing, bond storage format) is hardware independent and runs on the
//! host against the fakes in [`ble::testing`]:
//!
//! ```text
//! cargo test --lib
//! cargo test --test integration
//! ```
//!
//! The embedded binary (`--features embedded`) binds the same
//! [`ble::BleDevice`] to the Nordic SoftDevice S140 through the
//! [`nrf`] module.

#![cfg_attr(not(test), no_std)]

#[macro_use]
mod fmt;

pub mod ble;
pub mod config;
pub mod error;
pub mod hid;

#[cfg(feature = "embedded")]
pub mod nrf;
#[cfg(feature = "embedded")]
pub mod storage;

pub use error::Error;
