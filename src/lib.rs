//! # Talos - Grid Connection Controller for Victron Venus OS
//!
//! A Rust implementation of a battery-protecting grid connection
//! controller: it estimates pack state of charge from voltage, watches
//! load, voltage, state of charge and time-of-day conditions, and
//! decides whether the grid connection actuator should be energized,
//! with latching high-voltage protection on top.
//!
//! ## Features
//!
//! - **Decision Engine**: Debounced enable conditions, latched
//!   protections and a delayed disconnect with startup grace
//! - **Battery Profiles**: NCM and LiFePO4 chemistries with per-cell
//!   thresholds scaled to the configured pack
//! - **SoC Estimation**: Charge-state aware voltage-to-SoC curves
//! - **D-Bus Integration**: Full Venus OS compatibility, telemetry in
//!   and actuation out over the system bus
//! - **Web Interface**: REST API with live status and log streams
//! - **Configuration**: YAML-based configuration with validation
//!
//! ## Architecture
//!
//! The application follows a modular architecture with clear separation of concerns:
//!
//! - `config`: Configuration management and validation
//! - `logging`: Structured logging and tracing
//! - `battery`: Chemistry profiles and derived pack thresholds
//! - `soc`: Voltage-based state of charge estimation
//! - `conditions`: Debounced enable conditions
//! - `protection`: Latching high-voltage and high-SoC protection
//! - `engine`: The decision engine tying conditions and protections together
//! - `driver`: Polling loop and actuator orchestration
//! - `dbus`: D-Bus integration for Venus OS
//! - `web`: HTTP server and REST API

pub mod battery;
pub mod conditions;
pub mod config;
pub mod dbus;
pub mod driver;
pub mod engine;
pub mod error;
pub mod logging;
pub mod protection;
pub mod soc;
pub mod web;

// Re-export commonly used types
pub use config::Config;
pub use driver::GridDriver;
pub use error::{Result, TalosError};
