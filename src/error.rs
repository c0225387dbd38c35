use serde::Serialize;
use thiserror::Error;

use crate::types::{MachineClass, Metric};

/// Errors that can occur when decoding a single notification frame
///
/// Decode errors are local to one frame: the pipeline logs them and drops the
/// frame, the workout keeps going.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The frame carried no bytes at all
    #[error("Empty frame")]
    Empty,

    /// The frame ended before a flagged field could be fully read
    #[error("Frame truncated reading {field}: needed {needed} bytes, {remaining} remaining")]
    Truncated {
        /// Name of the field being read
        field: &'static str,
        /// Bytes required by the field
        needed: usize,
        /// Bytes left in the frame
        remaining: usize,
    },

    /// The characteristic does not carry a supported machine class
    #[error("Unsupported machine class for characteristic 0x{0:04X}")]
    UnknownClass(u16),

    /// The flag header sets bits that carry no field definition
    #[error("Flag header 0x{flags:04X} sets reserved bits 0x{reserved:04X}")]
    UnknownFlagCombination {
        /// Complete flag header as received
        flags: u16,
        /// The offending reserved bits
        reserved: u16,
    },
}

/// Non-fatal corrections applied by the sample validator
///
/// Warnings never fail a workout. They are attached to the corrected sample
/// and surface in its quality marker.
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
pub enum ValidationWarning {
    /// An outlier was replaced by the rolling-window median, or a distance
    /// jump by the last good distance
    #[error("{metric} outlier {original} replaced by {replacement}")]
    OutlierCorrected {
        /// Corrected metric
        metric: Metric,
        /// Value as decoded
        original: f64,
        /// Estimate that replaced it
        replacement: f64,
    },

    /// A short gap was filled by linear interpolation
    #[error("{metric} interpolated as {value}")]
    Interpolated {
        /// Interpolated metric
        metric: Metric,
        /// Value written into the sample
        value: f64,
    },

    /// A gap was too long to interpolate and was left absent
    #[error("{metric} gap left unfilled")]
    DataGapUnfilled {
        /// Metric with the gap
        metric: Metric,
    },

    /// A reading outside the accepted range was removed
    #[error("{metric} value {value} outside accepted range")]
    OutOfRange {
        /// Rejected metric
        metric: Metric,
        /// Value as decoded
        value: f64,
    },
}

/// Errors raised by the session aggregator
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AggregationError {
    /// The session ended without a single accepted sample
    #[error("Session ended without any accepted samples")]
    EmptySessionFinalize,

    /// The session has ended and refuses further samples
    #[error("Session has ended - no further samples accepted")]
    SessionEnded,

    /// A sample from another machine class was offered to the session
    #[error("Session records {expected} data, refused {found} sample")]
    MachineClassMismatch {
        /// Machine class fixed for the session
        expected: MachineClass,
        /// Machine class of the refused sample
        found: MachineClass,
    },
}

/// Errors raised while encoding or re-reading an activity file
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EncodeError {
    /// The encoded file failed its own validation pass
    #[error("Activity file failed self-validation ({check}): {reason}")]
    ValidationFailed {
        /// Name of the failing check
        check: &'static str,
        /// Context: message, field, observed values and tolerance
        reason: String,
    },

    /// The device identity cannot describe this session's machine class
    #[error("Identity for {identity} cannot export a {session} session")]
    UnsupportedMachineClass {
        /// Machine class of the session
        session: MachineClass,
        /// Machine class the identity describes
        identity: MachineClass,
    },

    /// The device identity is missing a mandatory value
    #[error("Invalid device identity: {0}")]
    InvalidIdentity(String),

    /// The data section does not fit the 32-bit size field
    #[error("Activity data of {0} bytes exceeds the file size limit")]
    TooLarge(usize),

    /// The bytes are not a well-formed activity file
    #[error("Malformed activity file: {0}")]
    Malformed(String),
}

/// Errors loading or checking pipeline configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration file could not be read
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file is not valid JSON for the schema
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    /// Configuration values are inconsistent
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Errors that can occur anywhere in the telemetry pipeline
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Frame decoding failed
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Session aggregation failed
    #[error("Aggregation error: {0}")]
    Aggregation(#[from] AggregationError),

    /// Activity encoding failed
    #[error("Encode error: {0}")]
    Encode(#[from] EncodeError),

    /// Configuration is unusable
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Bluetooth Low Energy related errors
    #[cfg(feature = "ble")]
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// A pipeline channel closed before the session ended
    #[error("Pipeline channel closed")]
    ChannelClosed,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, BridgeError>;

impl BridgeError {
    /// Check if this error only concerns a single frame
    #[must_use]
    pub const fn is_frame_local(&self) -> bool {
        matches!(self, Self::Decode(_))
    }

    /// Check if the caller can retry the failed operation
    ///
    /// A failed self-validation can be retried with relaxed tolerances, a
    /// dropped frame is simply skipped.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Decode(_) | Self::Encode(EncodeError::ValidationFailed { .. })
        )
    }

    /// Check if no activity file can ever be produced for the session
    #[must_use]
    pub const fn is_empty_session(&self) -> bool {
        matches!(
            self,
            Self::Aggregation(AggregationError::EmptySessionFinalize)
        )
    }
}
