#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # ringlink
//!
//! Bluetooth Low Energy communication core for consumer smart rings.
//!
//! The library finds rings, keeps a single connection alive, subscribes to
//! their telemetry channels, decodes heart rate, blood oxygen, battery and
//! HRV-derived stress from the payload dialects different firmware
//! generations emit, and sends the command sequences that switch a ring
//! between continuous monitoring and one-shot readings.
//!
//! ## Wire dialects
//!
//! Rings in this family speak up to three heart-rate dialects, detected in
//! priority order:
//!
//! - **Compact**: 4 bytes `[0x01, bpm, hrv, status]`, gated against a
//!   plausibility window because the ring emits noise in this form
//! - **Structured frame**: 16-byte `0xEF` frames with the value at byte 6
//! - **Standard**: the Bluetooth Heart Rate Measurement characteristic
//!
//! Commands are 16-byte structured frames (`header, opcode, payload,
//! checksum`) or single-byte legacy triggers for older firmware.
//!
//! ## Quick Start
//!
//! ```no_run
//! use ringlink::RingDevice;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let device = RingDevice::new().await?;
//!
//!     // Find rings nearby, strongest signal first
//!     let rings = device.discover().await?;
//!     if let Some(ring) = rings.first() {
//!         device.connect(&ring.id).await?;
//!
//!         // Ask for a single reading; it arrives on the sample feed
//!         let mut samples = device.subscribe_samples();
//!         device.trigger_manual_scan().await?;
//!         let sample = samples.recv().await?;
//!         println!("{}", sample.value);
//!
//!         device.disconnect().await;
//!     }
//!
//!     Ok(())
//! }
//! ```

/// btleplug radio backend
pub mod ble;
/// Connection lifecycle management
pub mod connection;
/// Main device interface
pub mod device;
/// Measurement command sequences
pub mod dispatcher;
/// Error types and handling
pub mod error;
/// Listener registries
pub mod events;
/// In-memory transport for tests and demos
pub mod mock;
/// Characteristic notification subscriptions
pub mod monitor;
/// Wire constants, UUIDs and command framing
pub mod protocol;
/// Device discovery
pub mod scanner;
/// Telemetry decoding
pub mod telemetry;
/// Radio backend abstraction
pub mod transport;
/// Type definitions and configuration
pub mod types;

// Re-export the main types for convenient usage
pub use ble::BtleplugTransport;
pub use connection::{ChangeCause, Connection, ConnectionChange, ConnectionManager};
pub use device::RingDevice;
pub use dispatcher::{CommandDispatcher, DispatchReport, DispatchState};
pub use error::{Result, RingError, TransportError};
pub use events::{ListenerRegistry, Subscription};
pub use monitor::{CharacteristicMonitor, MonitorHandle};
pub use protocol::{decode_binary, encode_binary, Channel, CommandPacket, Opcode};
pub use scanner::{sort_by_signal, DeviceScanner, NameMatcher, ScanHandle};
pub use telemetry::{LinearStressScorer, StressScorer, TelemetryParser};
pub use transport::RingTransport;
pub use types::{
    CommandTiming, ConnectionParams, ConnectionState, DecoderKind, DeviceId, DiscoveredDevice,
    PlausibilityLimits, RingConfig, ScanConfig, TelemetrySample, TelemetryValue,
    UNKNOWN_RSSI,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
