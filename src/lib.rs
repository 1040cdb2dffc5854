#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # Rowbridge 🚣
//!
//! A Rust library that bridges a water-rower console on a serial port to Bluetooth
//! fitness clients.
//!
//! The console answers a small request/response register protocol. Rowbridge polls it
//! with a single command outstanding at a time, normalizes the register values into one
//! live rower state, and fans that state out to:
//!
//! - **Live data**: FTMS Rower Data notifications sized to the transport limit
//! - **Persistence**: workout, interval, RR and HRV records behind a bounded queue
//!
//! Heart rate arrives from BLE chest straps (service 0x180D) and the console's own
//! receiver. One source is bound at a time; RR intervals feed per-minute HRV windows
//! (SDNN, RMSSD, pNN50).
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use rowbridge::{
//!     live_data::ChannelNotifySink, persistence::JsonLinesSink, serial::TokioSerialConnector,
//!     Pipeline, PipelineConfig,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PipelineConfig::default();
//!     let connector = TokioSerialConnector::new(config.serial.clone());
//!     let (notify, _payloads) = ChannelNotifySink::new(32);
//!     let sink = JsonLinesSink::open("workouts.jsonl").await?;
//!
//!     let bridge = Pipeline::start(config, connector, Arc::new(notify), sink, None).await?;
//!     tokio::signal::ctrl_c().await?;
//!     bridge.shutdown().await?;
//!     Ok(())
//! }
//! ```

/// Bluetooth Low Energy heart-rate scanning
pub mod ble;
/// Console command scheduling
pub mod engine;
/// Error types and handling
pub mod error;
/// Heart-rate measurement parsing and source fusion
pub mod heart_rate;
/// Heart-rate variability windows
pub mod hrv;
/// Shared live rower state
pub mod hub;
/// FTMS Rower Data encoding and notification
pub mod live_data;
/// Storage records and the persistence queue
pub mod persistence;
/// Task wiring and lifecycle
pub mod pipeline;
/// Serial frame format and codec
pub mod protocol;
/// Session recording
pub mod recorder;
/// Console register table
pub mod registers;
/// Serial port access
pub mod serial;
/// Workout session state machine
pub mod session;
/// Register value interpretation
pub mod telemetry;
/// Type definitions and configuration
pub mod types;

// Re-export the main types for convenient usage
pub use error::{Result, RowbridgeError};
pub use hub::{RowerHub, RowerState};
pub use pipeline::Pipeline;
pub use types::{
    DeviceInfo, EncoderConfig, EngineConfig, FusionConfig, HrvConfig, HubConfig, LinkStatus,
    PersistenceConfig, PipelineConfig, ScanConfig, SerialConfig, SessionPhase, WorkoutKind,
    WriterClass,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Bluetooth SIG Heart Rate service UUID (0x180D)
pub const HEART_RATE_SERVICE_UUID: &str = "0000180d-0000-1000-8000-00805f9b34fb";

/// Heart Rate Measurement characteristic UUID (0x2A37)
///
/// Notifies the flags byte, the heart rate and optional energy and RR intervals.
pub const HEART_RATE_MEASUREMENT_UUID: &str = "00002a37-0000-1000-8000-00805f9b34fb";

/// Battery Level characteristic UUID (0x2A19)
pub const BATTERY_LEVEL_UUID: &str = "00002a19-0000-1000-8000-00805f9b34fb";
