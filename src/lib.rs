//! Raedam node library: named-node mesh directory and telemetry forwarding
//! for ultrasonic parking occupancy sensors.
//!
//! Every node measures the distance to whatever is parked above it, decides
//! occupancy against a threshold and forwards its reading, together with the
//! readings of the nodes before it, to the next node in a statically
//! configured chain. Nodes address each other by human-assigned names; a
//! name directory, kept fresh by periodic broadcasts, maps those names to
//! the transport's volatile numeric addresses.
//!
//! All logic here is `no_std`, allocation-free and testable on the host with
//! `cargo test`. The ESP32 firmware binary is a thin consumer that supplies
//! the radio ([`transport::MeshTransport`]), the rangefinder pins
//! ([`sensor::HcSr04`]), a clock and the serial console.
//!
//! - `sensor`: HC-SR04 driver, validation and occupancy
//! - `directory`, `announcer`, `router`: name resolution over the mesh
//! - `forwarder`: chain telemetry
//! - `node`: composition root driven by timer, receive and disconnect events
//! - `protocol`, `comm`: JSON wire formats and NDJSON console framing
//! - `config`, `board`, `error`: provisioning, pin maps, error taxonomy

#![cfg_attr(not(test), no_std)]

pub mod announcer;
pub mod board;
pub mod comm;
pub mod config;
pub mod directory;
pub mod error;
pub mod forwarder;
pub mod node;
pub mod protocol;
pub mod router;
pub mod sensor;
pub mod transport;

pub use error::Error;
