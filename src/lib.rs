#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # FTMS FIT Bridge
//!
//! Turns live telemetry from Bluetooth fitness machines into Garmin FIT
//! activity files.
//!
//! Indoor bikes and rowers speaking the Fitness Machine Service (FTMS) send
//! a notification per second carrying a flag header and whichever fields the
//! machine chose to report. This crate decodes those frames, merges
//! heart-rate strap readings, cleans the stream, tracks the workout phase and
//! finally writes an activity file that the target platform accepts for
//! training-load computation.
//!
//! ## Pipeline
//!
//! - **Decoding** ([`protocol`]): static per-class field tables, absent
//!   fields stay `None`, a zero reading stays `Some(0)`
//! - **Heart-rate merge** ([`heart_rate`]): nearest strap reading within a
//!   skew limit
//! - **Validation** ([`validator`]): range checks, rolling-window outlier
//!   replacement and short-gap interpolation
//! - **Aggregation** ([`session`]): warm-up, main and cool-down detection and
//!   the session summary
//! - **Export** ([`export`], [`fit`]): FIT encoding followed by a
//!   self-validation pass; a file that fails its own checks is never
//!   returned
//!
//! ## Device Identity
//!
//! The platform only computes training load when the file names a device and
//! a sport it understands. [`identity`] maps every machine class to exactly
//! one sport and sub-sport:
//!
//! | Machine | sport | sub_sport |
//! |---------|-------|-----------|
//! | Bike | cycling (2) | indoor_cycling (6) |
//! | Rower | rowing (15) | indoor_rowing (14) |
//!
//! ## Quick Start
//!
//! ```no_run
//! use ftms_fit_bridge::{identify, pipeline, Inbound, MachineClass, PipelineConfig, PipelineEvent};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let identity = identify(Some("Rogue Echo Bike"), MachineClass::Bike);
//!     let workout = pipeline::WorkoutPipeline::new(PipelineConfig::default(), identity)?;
//!     let mut handle = pipeline::spawn(workout);
//!
//!     // the transport feeds notifications into `handle.sender`
//!     handle.sender.send(Inbound::End { early: false })?;
//!
//!     while let Some(event) = handle.events.recv().await {
//!         if let PipelineEvent::Exported(activity) = event {
//!             activity.save("ride.fit")?;
//!         }
//!     }
//!     Ok(())
//! }
//! ```

/// GATT notification routing
pub mod ble;
/// Pipeline configuration
pub mod config;
/// Error types and handling
pub mod error;
/// Activity export and self-validation
pub mod export;
/// FIT binary primitives
pub mod fit;
/// Heart-rate strap merge
pub mod heart_rate;
/// Device identity and sport mapping
pub mod identity;
/// Per-device processing chain
pub mod pipeline;
/// FTMS frame codec
pub mod protocol;
/// Phase detection and session aggregation
pub mod session;
/// Type definitions and data structures
pub mod types;
/// Sample cleaning
pub mod validator;

// Re-export the main types for convenient usage
pub use config::PipelineConfig;
pub use error::{BridgeError, Result};
pub use export::{decode_activity, encode, ExportedActivity, ValidationReport};
pub use identity::{identify, DeviceIdentity};
pub use pipeline::{Inbound, PipelineEvent, WorkoutPipeline};
pub use session::{FinishedSession, SessionAggregator, WorkoutSession};
pub use types::{
    DataQuality, FrameKind, MachineClass, Metric, MetricSample, Phase, PhaseSummary,
    SessionSummary,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Fitness Machine Service UUID (assigned number 0x1826)
///
/// Bikes and rowers advertise this service and expose their data
/// characteristics under it.
pub const FTMS_SERVICE_UUID: &str = "00001826-0000-1000-8000-00805F9B34FB";

/// Indoor Bike Data characteristic UUID (0x2AD2)
///
/// Notified about once per second by indoor bikes. Every value starts with a
/// 16-bit flag header; see [`protocol`] for the field layout.
pub const INDOOR_BIKE_DATA_UUID: &str = "00002AD2-0000-1000-8000-00805F9B34FB";

/// Rower Data characteristic UUID (0x2AD1)
///
/// Notified by rowers, usually once per stroke or once per second. Shares the
/// flag header scheme of the bike characteristic with a rowing field set.
pub const ROWER_DATA_UUID: &str = "00002AD1-0000-1000-8000-00805F9B34FB";

/// Heart Rate Measurement characteristic UUID (0x2A37)
///
/// Sent by chest straps and arm bands. Readings from this characteristic
/// replace any heart rate the machine reports itself.
pub const HEART_RATE_MEASUREMENT_UUID: &str = "00002A37-0000-1000-8000-00805F9B34FB";
