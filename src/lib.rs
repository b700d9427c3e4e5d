#![cfg_attr(docsrs, feature(doc_cfg))]
//! # essbms_lib
//!
//! This crate decodes the telemetry of battery management systems into a normalized battery
//! snapshot with protection states and charge/discharge permissions.
//!
//! Two device families are supported:
//! - Felicity ESS batteries, read over Modbus RTU register blocks ([`felicity`]),
//! - MNB packs monitored by an SPI analog front-end ([`mnb`]).
//!
//! Both implement [`battery::BatteryDriver`]. The transports are abstracted by
//! [`protocol::RegisterClient`] and [`mnb::AfeSampler`].
//!
//! ## Features
//!
//! - `default`: Enables `bin-dependencies`, which is intended for compiling the `essbms`
//!   command-line tool.
//!
//! ### Client Features
//! - `serialport`: Enables the **synchronous** Modbus RTU client using the `serialport` crate.
//!
//! ### Utility Features
//! - `serde`: Enables `serde` support for serializing/deserializing data structures.
//! - `bin-dependencies`: Enables all features required by the `essbms` binary executable.

/// Contains error types for the library.
mod error;
/// Battery snapshot and the driver interface.
pub mod battery;
/// Felicity ESS Modbus driver.
pub mod felicity;
/// MNB SPI front-end driver.
pub mod mnb;
/// Alarm states and charge/discharge permissions.
pub mod protection;
/// Register map and decoders.
pub mod protocol;

pub use error::{Error, Result};

/// Synchronous Modbus RTU client.
#[cfg_attr(docsrs, doc(cfg(feature = "serialport")))]
#[cfg(feature = "serialport")]
pub mod serialport;
