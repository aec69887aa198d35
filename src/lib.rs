#![cfg_attr(docsrs, feature(doc_cfg))]
//! # dalyble_lib
//!
//! This crate talks to Daly BMS (Battery Management System) units that
//! expose the reverse-engineered "D2" protocol: Modbus-RTU-style read
//! commands carried over a Bluetooth Low Energy GATT characteristic pair.
//! It turns that noisy, half-duplex, notification-based transport into
//! validated battery telemetry (pack voltage, current, cell voltages,
//! temperatures, state of charge).
//!
//! ## Layers
//!
//! - [`protocol`]: command framing, CRC-16, response validation.
//! - [`reading`]: register decoding into typed [`Reading`] snapshots.
//! - [`transport`]: the [`BleTransport`] trait the session is written
//!   against; implement it to bring your own radio stack.
//! - [`client`]: half-duplex request/response discipline over a transport.
//! - [`session`]: the [`Monitor`] running the scan, connect, wake,
//!   periodic-read, reconnect state machine and emitting events.
//!
//! ## Features
//!
//! - `default`: enables `bin-dependencies`, which is intended for compiling
//!   the `dalyble` command-line tool.
//! - `bluest-transport`: the bundled BLE backend built on the `bluest`
//!   crate.
//! - `serde`: `serde` support for telemetry and status types.
//!
//! ## Example
//!
//! ```no_run
//! use dalyble_lib::{Monitor, SessionConfig, SessionEvent};
//! use dalyble_lib::bluest_transport::BluestTransport;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SessionConfig::new("41:18:12:01:37:71");
//!     let transport = BluestTransport::new(&config.address);
//!     let monitor = Monitor::spawn(transport, config);
//!     let mut events = monitor.subscribe();
//!     while let Ok(event) = events.recv().await {
//!         if let SessionEvent::Reading(reading) = event {
//!             println!("{:.1}V {:.1}A", reading.total_voltage_v, reading.current_a);
//!         }
//!     }
//!     Ok(())
//! }
//! ```

/// Contains error types for the library.
mod error;
/// Command framing and response validation for the D2 protocol.
pub mod protocol;
/// Register decoding rules and the telemetry snapshot type.
pub mod reading;
/// The transport abstraction the session is written against.
pub mod transport;

/// Request/response client over a transport.
pub mod client;
/// Connection session state machine and event stream.
pub mod session;

pub use client::BmsClient;
pub use error::{Error, Result};
pub use reading::{CurrentDirection, Reading};
pub use session::{
    Monitor, SessionConfig, SessionEvent, SessionPhase, SessionStats, SessionStatus,
};
pub use transport::{BleTransport, TransportError};

/// BLE backend built on the `bluest` crate.
#[cfg_attr(docsrs, doc(cfg(feature = "bluest-transport")))]
#[cfg(feature = "bluest-transport")]
pub mod bluest_transport;

#[cfg(test)]
pub(crate) mod testutil;
