//! Activity file encoder.
//!
//! Message order follows what Garmin devices write for indoor activities:
//!
//! ```text
//! file_id, device_info, event(timer start),
//! record * samples,
//! event(timer stop), lap * phases, session, activity
//! ```
//!
//! Every encoded file is parsed again before it is returned. Structural
//! problems, record timestamps going backwards, session totals that disagree
//! with the records, or identity fields that disagree with the device all
//! fail the export.

use crate::{
    config::ExportConfig,
    error::EncodeError,
    fit::{self, mesg_num, BaseType, FieldDef, FitWriter, MessageDef},
    identity::DeviceIdentity,
    session::{RunningStats, SessionSample, WorkoutSession},
    types::{DataQuality, MachineClass, Phase, SessionSummary},
};
use bytes::Bytes;
use chrono::Utc;
use fitparser::{
    de::{from_bytes_with_options, DecodeOption},
    profile::MesgNum,
    FitDataField, FitDataRecord, Value,
};
use serde::Serialize;
use std::{collections::HashSet, path::Path, time::Duration};
use tracing::{debug, error, info, warn};

mod file_id {
    pub const TYPE: u8 = 0;
    pub const MANUFACTURER: u8 = 1;
    pub const PRODUCT: u8 = 2;
    pub const SERIAL_NUMBER: u8 = 3;
    pub const TIME_CREATED: u8 = 4;
}

mod device_info {
    pub const DEVICE_INDEX: u8 = 0;
    pub const MANUFACTURER: u8 = 2;
    pub const SERIAL_NUMBER: u8 = 3;
    pub const PRODUCT: u8 = 4;
    pub const SOFTWARE_VERSION: u8 = 5;
    pub const HARDWARE_VERSION: u8 = 6;
}

mod event {
    pub const EVENT: u8 = 0;
    pub const EVENT_TYPE: u8 = 1;
}

mod record {
    pub const HEART_RATE: u8 = 3;
    pub const CADENCE: u8 = 4;
    pub const DISTANCE: u8 = 5;
    pub const SPEED: u8 = 6;
    pub const POWER: u8 = 7;
    pub const CALORIES: u8 = 33;
    /// Where readers expand the 16-bit `speed` component
    pub const ENHANCED_SPEED: u8 = 73;
}

/// Field numbers shared by `lap` and `session`, plus their own
mod summary {
    pub const EVENT: u8 = 0;
    pub const EVENT_TYPE: u8 = 1;
    pub const START_TIME: u8 = 2;
    pub const TOTAL_ELAPSED_TIME: u8 = 7;
    pub const TOTAL_TIMER_TIME: u8 = 8;
    pub const TOTAL_DISTANCE: u8 = 9;
    pub const TOTAL_CYCLES: u8 = 10;
    pub const TOTAL_CALORIES: u8 = 11;

    pub const LAP_AVG_SPEED: u8 = 13;
    pub const LAP_MAX_SPEED: u8 = 14;
    pub const LAP_AVG_HEART_RATE: u8 = 15;
    pub const LAP_MAX_HEART_RATE: u8 = 16;
    pub const LAP_AVG_CADENCE: u8 = 17;
    pub const LAP_MAX_CADENCE: u8 = 18;
    pub const LAP_AVG_POWER: u8 = 19;
    pub const LAP_MAX_POWER: u8 = 20;
    pub const LAP_INTENSITY: u8 = 23;
    pub const LAP_TRIGGER: u8 = 24;
    pub const LAP_SPORT: u8 = 25;
    pub const LAP_SUB_SPORT: u8 = 39;

    pub const SESSION_SPORT: u8 = 5;
    pub const SESSION_SUB_SPORT: u8 = 6;
    pub const SESSION_AVG_SPEED: u8 = 14;
    pub const SESSION_MAX_SPEED: u8 = 15;
    pub const SESSION_AVG_HEART_RATE: u8 = 16;
    pub const SESSION_MAX_HEART_RATE: u8 = 17;
    pub const SESSION_AVG_CADENCE: u8 = 18;
    pub const SESSION_MAX_CADENCE: u8 = 19;
    pub const SESSION_AVG_POWER: u8 = 20;
    pub const SESSION_MAX_POWER: u8 = 21;
    pub const SESSION_FIRST_LAP_INDEX: u8 = 25;
    pub const SESSION_NUM_LAPS: u8 = 26;
    pub const SESSION_TRIGGER: u8 = 28;
}

mod activity {
    pub const TOTAL_TIMER_TIME: u8 = 0;
    pub const NUM_SESSIONS: u8 = 1;
    pub const TYPE: u8 = 2;
    pub const EVENT: u8 = 3;
    pub const EVENT_TYPE: u8 = 4;
    pub const LOCAL_TIMESTAMP: u8 = 5;
}

const TIMESTAMP: u8 = 253;
const MESSAGE_INDEX: u8 = 254;

const FILE_TYPE_ACTIVITY: i64 = 4;
const EVENT_TIMER: i64 = 0;
const EVENT_LAP: i64 = 9;
const EVENT_SESSION: i64 = 8;
const EVENT_ACTIVITY: i64 = 26;
const EVENT_TYPE_START: i64 = 0;
const EVENT_TYPE_STOP: i64 = 1;
const EVENT_TYPE_STOP_ALL: i64 = 4;
const LAP_TRIGGER_MANUAL: i64 = 0;
const SESSION_TRIGGER_ACTIVITY_END: i64 = 0;
const ACTIVITY_TYPE_MANUAL: i64 = 0;

/// FIT lap `intensity` values
const INTENSITY_ACTIVE: i64 = 0;
const INTENSITY_WARMUP: i64 = 2;
const INTENSITY_COOLDOWN: i64 = 3;

const FILE_ID_FIELDS: &[FieldDef] = &[
    FieldDef::new(file_id::TYPE, "type", BaseType::Enum),
    FieldDef::new(file_id::MANUFACTURER, "manufacturer", BaseType::UInt16),
    FieldDef::new(file_id::PRODUCT, "product", BaseType::UInt16),
    FieldDef::new(file_id::SERIAL_NUMBER, "serial_number", BaseType::UInt32z),
    FieldDef::new(file_id::TIME_CREATED, "time_created", BaseType::UInt32),
];

const DEVICE_INFO_FIELDS: &[FieldDef] = &[
    FieldDef::new(TIMESTAMP, "timestamp", BaseType::UInt32),
    FieldDef::new(device_info::DEVICE_INDEX, "device_index", BaseType::UInt8),
    FieldDef::new(device_info::MANUFACTURER, "manufacturer", BaseType::UInt16),
    FieldDef::new(device_info::SERIAL_NUMBER, "serial_number", BaseType::UInt32z),
    FieldDef::new(device_info::PRODUCT, "product", BaseType::UInt16),
    FieldDef::new(device_info::SOFTWARE_VERSION, "software_version", BaseType::UInt16),
    FieldDef::new(device_info::HARDWARE_VERSION, "hardware_version", BaseType::UInt8),
];

const EVENT_FIELDS: &[FieldDef] = &[
    FieldDef::new(TIMESTAMP, "timestamp", BaseType::UInt32),
    FieldDef::new(event::EVENT, "event", BaseType::Enum),
    FieldDef::new(event::EVENT_TYPE, "event_type", BaseType::Enum),
];

const RECORD_FIELDS: &[FieldDef] = &[
    FieldDef::new(TIMESTAMP, "timestamp", BaseType::UInt32),
    FieldDef::new(record::HEART_RATE, "heart_rate", BaseType::UInt8),
    FieldDef::new(record::CADENCE, "cadence", BaseType::UInt8),
    FieldDef::new(record::DISTANCE, "distance", BaseType::UInt32),
    FieldDef::new(record::SPEED, "speed", BaseType::UInt16),
    FieldDef::new(record::POWER, "power", BaseType::UInt16),
    FieldDef::new(record::CALORIES, "calories", BaseType::UInt16),
];

const LAP_FIELDS: &[FieldDef] = &[
    FieldDef::new(MESSAGE_INDEX, "message_index", BaseType::UInt16),
    FieldDef::new(TIMESTAMP, "timestamp", BaseType::UInt32),
    FieldDef::new(summary::EVENT, "event", BaseType::Enum),
    FieldDef::new(summary::EVENT_TYPE, "event_type", BaseType::Enum),
    FieldDef::new(summary::START_TIME, "start_time", BaseType::UInt32),
    FieldDef::new(summary::TOTAL_ELAPSED_TIME, "total_elapsed_time", BaseType::UInt32),
    FieldDef::new(summary::TOTAL_TIMER_TIME, "total_timer_time", BaseType::UInt32),
    FieldDef::new(summary::TOTAL_DISTANCE, "total_distance", BaseType::UInt32),
    FieldDef::new(summary::TOTAL_CYCLES, "total_cycles", BaseType::UInt32),
    FieldDef::new(summary::TOTAL_CALORIES, "total_calories", BaseType::UInt16),
    FieldDef::new(summary::LAP_AVG_SPEED, "avg_speed", BaseType::UInt16),
    FieldDef::new(summary::LAP_MAX_SPEED, "max_speed", BaseType::UInt16),
    FieldDef::new(summary::LAP_AVG_HEART_RATE, "avg_heart_rate", BaseType::UInt8),
    FieldDef::new(summary::LAP_MAX_HEART_RATE, "max_heart_rate", BaseType::UInt8),
    FieldDef::new(summary::LAP_AVG_CADENCE, "avg_cadence", BaseType::UInt8),
    FieldDef::new(summary::LAP_MAX_CADENCE, "max_cadence", BaseType::UInt8),
    FieldDef::new(summary::LAP_AVG_POWER, "avg_power", BaseType::UInt16),
    FieldDef::new(summary::LAP_MAX_POWER, "max_power", BaseType::UInt16),
    FieldDef::new(summary::LAP_INTENSITY, "intensity", BaseType::Enum),
    FieldDef::new(summary::LAP_TRIGGER, "lap_trigger", BaseType::Enum),
    FieldDef::new(summary::LAP_SPORT, "sport", BaseType::Enum),
    FieldDef::new(summary::LAP_SUB_SPORT, "sub_sport", BaseType::Enum),
];

const SESSION_FIELDS: &[FieldDef] = &[
    FieldDef::new(MESSAGE_INDEX, "message_index", BaseType::UInt16),
    FieldDef::new(TIMESTAMP, "timestamp", BaseType::UInt32),
    FieldDef::new(summary::EVENT, "event", BaseType::Enum),
    FieldDef::new(summary::EVENT_TYPE, "event_type", BaseType::Enum),
    FieldDef::new(summary::START_TIME, "start_time", BaseType::UInt32),
    FieldDef::new(summary::SESSION_SPORT, "sport", BaseType::Enum),
    FieldDef::new(summary::SESSION_SUB_SPORT, "sub_sport", BaseType::Enum),
    FieldDef::new(summary::TOTAL_ELAPSED_TIME, "total_elapsed_time", BaseType::UInt32),
    FieldDef::new(summary::TOTAL_TIMER_TIME, "total_timer_time", BaseType::UInt32),
    FieldDef::new(summary::TOTAL_DISTANCE, "total_distance", BaseType::UInt32),
    FieldDef::new(summary::TOTAL_CYCLES, "total_cycles", BaseType::UInt32),
    FieldDef::new(summary::TOTAL_CALORIES, "total_calories", BaseType::UInt16),
    FieldDef::new(summary::SESSION_AVG_SPEED, "avg_speed", BaseType::UInt16),
    FieldDef::new(summary::SESSION_MAX_SPEED, "max_speed", BaseType::UInt16),
    FieldDef::new(summary::SESSION_AVG_HEART_RATE, "avg_heart_rate", BaseType::UInt8),
    FieldDef::new(summary::SESSION_MAX_HEART_RATE, "max_heart_rate", BaseType::UInt8),
    FieldDef::new(summary::SESSION_AVG_CADENCE, "avg_cadence", BaseType::UInt8),
    FieldDef::new(summary::SESSION_MAX_CADENCE, "max_cadence", BaseType::UInt8),
    FieldDef::new(summary::SESSION_AVG_POWER, "avg_power", BaseType::UInt16),
    FieldDef::new(summary::SESSION_MAX_POWER, "max_power", BaseType::UInt16),
    FieldDef::new(summary::SESSION_FIRST_LAP_INDEX, "first_lap_index", BaseType::UInt16),
    FieldDef::new(summary::SESSION_NUM_LAPS, "num_laps", BaseType::UInt16),
    FieldDef::new(summary::SESSION_TRIGGER, "trigger", BaseType::Enum),
];

const ACTIVITY_FIELDS: &[FieldDef] = &[
    FieldDef::new(TIMESTAMP, "timestamp", BaseType::UInt32),
    FieldDef::new(activity::TOTAL_TIMER_TIME, "total_timer_time", BaseType::UInt32),
    FieldDef::new(activity::NUM_SESSIONS, "num_sessions", BaseType::UInt16),
    FieldDef::new(activity::TYPE, "type", BaseType::Enum),
    FieldDef::new(activity::EVENT, "event", BaseType::Enum),
    FieldDef::new(activity::EVENT_TYPE, "event_type", BaseType::Enum),
    FieldDef::new(activity::LOCAL_TIMESTAMP, "local_timestamp", BaseType::UInt32),
];

const FILE_ID_MESSAGE: MessageDef = MessageDef {
    global: mesg_num::FILE_ID,
    local: 0,
    fields: FILE_ID_FIELDS,
};
const DEVICE_INFO_MESSAGE: MessageDef = MessageDef {
    global: mesg_num::DEVICE_INFO,
    local: 1,
    fields: DEVICE_INFO_FIELDS,
};
const EVENT_MESSAGE: MessageDef = MessageDef {
    global: mesg_num::EVENT,
    local: 2,
    fields: EVENT_FIELDS,
};
const RECORD_MESSAGE: MessageDef = MessageDef {
    global: mesg_num::RECORD,
    local: 3,
    fields: RECORD_FIELDS,
};
const LAP_MESSAGE: MessageDef = MessageDef {
    global: mesg_num::LAP,
    local: 4,
    fields: LAP_FIELDS,
};
const SESSION_MESSAGE: MessageDef = MessageDef {
    global: mesg_num::SESSION,
    local: 5,
    fields: SESSION_FIELDS,
};
const ACTIVITY_MESSAGE: MessageDef = MessageDef {
    global: mesg_num::ACTIVITY,
    local: 6,
    fields: ACTIVITY_FIELDS,
};

/// Outcome of validating an activity file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    /// True when no check failed
    pub valid: bool,
    /// Problems that do not invalidate the file
    pub warnings: Vec<String>,
    /// Failed checks, as `check: reason`
    pub errors: Vec<String>,
}

/// An encoded and self-validated activity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedActivity {
    /// Complete FIT file
    pub bytes: Bytes,
    /// Report produced by the self-validation pass
    pub report: ValidationReport,
    /// Number of record messages written
    pub record_count: usize,
}

impl ExportedActivity {
    /// Write the file to disk
    ///
    /// # Errors
    ///
    /// Returns any IO error raised while writing.
    pub fn save(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        std::fs::write(path, &self.bytes)
    }
}

/// `file_id` content of a parsed activity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ParsedFileId {
    /// File type
    pub file_type: Option<u8>,
    /// Manufacturer id
    pub manufacturer: Option<u16>,
    /// Product id
    pub product: Option<u16>,
    /// Serial number
    pub serial_number: Option<u32>,
    /// Creation time in FIT seconds
    pub time_created: Option<u32>,
}

/// `device_info` content of a parsed activity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ParsedDeviceInfo {
    /// Manufacturer id
    pub manufacturer: Option<u16>,
    /// Product id
    pub product: Option<u16>,
    /// Serial number
    pub serial_number: Option<u32>,
    /// Software version times 100
    pub software_version: Option<u16>,
}

/// One `record` message in engineering units
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ParsedRecord {
    /// FIT timestamp in seconds
    pub timestamp: Option<u32>,
    /// Heart rate in bpm
    pub heart_rate: Option<u8>,
    /// Cadence in rpm, or stroke rate for rowing
    pub cadence: Option<u8>,
    /// Cumulative distance in meters
    pub distance: Option<f64>,
    /// Speed in m/s
    pub speed: Option<f64>,
    /// Power in watts
    pub power: Option<u16>,
    /// Cumulative energy in kcal
    pub calories: Option<u16>,
}

/// One `lap` message in engineering units
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ParsedLap {
    /// Start time in FIT seconds
    pub start_time: Option<u32>,
    /// Elapsed time in seconds
    pub total_elapsed_time: Option<f64>,
    /// Distance in meters
    pub total_distance: Option<f64>,
    /// Energy in kcal
    pub total_calories: Option<u16>,
    /// Average power in watts
    pub average_power: Option<u16>,
    /// Peak power in watts
    pub max_power: Option<u16>,
    /// FIT intensity value
    pub intensity: Option<u8>,
}

/// The `session` message in engineering units
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ParsedSession {
    /// Start time in FIT seconds
    pub start_time: Option<u32>,
    /// FIT sport
    pub sport: Option<u8>,
    /// FIT sub-sport
    pub sub_sport: Option<u8>,
    /// Elapsed time in seconds
    pub total_elapsed_time: Option<f64>,
    /// Distance in meters
    pub total_distance: Option<f64>,
    /// Strokes (rowing)
    pub total_cycles: Option<u32>,
    /// Energy in kcal
    pub total_calories: Option<u16>,
    /// Average heart rate in bpm
    pub average_heart_rate: Option<u8>,
    /// Peak heart rate in bpm
    pub max_heart_rate: Option<u8>,
    /// Average cadence or stroke rate
    pub average_cadence: Option<u8>,
    /// Average power in watts
    pub average_power: Option<u16>,
    /// Peak power in watts
    pub max_power: Option<u16>,
    /// Number of laps
    pub num_laps: Option<u16>,
}

/// Typed view over a parsed activity file
#[derive(Debug, Clone)]
pub struct ParsedActivity {
    /// `file_id` message
    pub file_id: ParsedFileId,
    /// First `device_info` message, if any
    pub device_info: Option<ParsedDeviceInfo>,
    /// `record` messages in file order
    pub records: Vec<ParsedRecord>,
    /// `lap` messages in file order
    pub laps: Vec<ParsedLap>,
    /// The `session` message
    pub session: ParsedSession,
    /// Every data message as decoded by `fitparser`
    pub messages: Vec<FitDataRecord>,
}

impl ParsedActivity {
    /// Decoded messages of one kind
    pub fn messages_of(&self, kind: MesgNum) -> impl Iterator<Item = &FitDataRecord> + '_ {
        self.messages.iter().filter(move |m| m.kind() == kind)
    }
}

/// Value of field `number`; sub-fields keep their parent's number
fn field(message: &FitDataRecord, number: u8) -> Option<&Value> {
    message
        .fields()
        .iter()
        .find(|f| f.number() == number)
        .map(FitDataField::value)
}

/// Integer content of a value, timestamps in FIT seconds
fn integer(value: &Value) -> Option<i64> {
    match value {
        Value::Timestamp(at) => Some(i64::from(fit::to_fit_timestamp(at.with_timezone(&Utc)))),
        Value::Byte(v) | Value::Enum(v) | Value::UInt8(v) | Value::UInt8z(v) => Some(i64::from(*v)),
        Value::SInt8(v) => Some(i64::from(*v)),
        Value::SInt16(v) => Some(i64::from(*v)),
        Value::UInt16(v) | Value::UInt16z(v) => Some(i64::from(*v)),
        Value::SInt32(v) => Some(i64::from(*v)),
        Value::UInt32(v) | Value::UInt32z(v) => Some(i64::from(*v)),
        Value::SInt64(v) => Some(*v),
        Value::UInt64(v) | Value::UInt64z(v) => i64::try_from(*v).ok(),
        Value::Float32(_)
        | Value::Float64(_)
        | Value::String(_)
        | Value::Array(_)
        | Value::Invalid => None,
    }
}

/// Numeric content of a value after the profile's scale and offset
#[allow(clippy::cast_precision_loss)]
fn real(value: &Value) -> Option<f64> {
    match value {
        Value::Float32(v) => Some(f64::from(*v)),
        Value::Float64(v) => Some(*v),
        Value::Timestamp(_) => None,
        other => integer(other).map(|v| v as f64),
    }
}

fn narrow<T: TryFrom<i64>>(message: &FitDataRecord, number: u8) -> Option<T> {
    field(message, number)
        .and_then(integer)
        .and_then(|v| T::try_from(v).ok())
}

fn scaled(message: &FitDataRecord, number: u8) -> Option<f64> {
    field(message, number).and_then(real)
}

/// Parse an activity file into its typed view
///
/// Both CRCs are checked. Enumerations are read as their numeric values and
/// scaled fields come back in engineering units.
///
/// # Errors
///
/// Returns `EncodeError::Malformed` when `fitparser` rejects the file, or
/// when it does not start with `file_id` or lacks a `session` message.
pub fn decode_activity(bytes: &[u8]) -> Result<ParsedActivity, EncodeError> {
    let options: HashSet<DecodeOption> = [DecodeOption::ReturnNumericEnumValues].into();
    let messages = from_bytes_with_options(bytes, &options)
        .map_err(|e| EncodeError::Malformed(e.to_string()))?;

    let first = messages
        .first()
        .filter(|m| m.kind() == MesgNum::FileId)
        .ok_or_else(|| EncodeError::Malformed("file does not start with file_id".to_string()))?;
    let file_id = ParsedFileId {
        file_type: narrow(first, file_id::TYPE),
        manufacturer: narrow(first, file_id::MANUFACTURER),
        product: narrow(first, file_id::PRODUCT),
        serial_number: narrow(first, file_id::SERIAL_NUMBER),
        time_created: narrow(first, file_id::TIME_CREATED),
    };

    let of_kind = |kind: MesgNum| messages.iter().filter(move |m| m.kind() == kind);

    let device_info = of_kind(MesgNum::DeviceInfo).next().map(|m| ParsedDeviceInfo {
        manufacturer: narrow(m, device_info::MANUFACTURER),
        product: narrow(m, device_info::PRODUCT),
        serial_number: narrow(m, device_info::SERIAL_NUMBER),
        software_version: scaled(m, device_info::SOFTWARE_VERSION)
            .and_then(|v| u16::try_from(round(v * 100.0)).ok()),
    });

    let records = of_kind(MesgNum::Record)
        .map(|m| ParsedRecord {
            timestamp: narrow(m, TIMESTAMP),
            heart_rate: narrow(m, record::HEART_RATE),
            cadence: narrow(m, record::CADENCE),
            distance: scaled(m, record::DISTANCE),
            speed: scaled(m, record::ENHANCED_SPEED).or_else(|| scaled(m, record::SPEED)),
            power: narrow(m, record::POWER),
            calories: narrow(m, record::CALORIES),
        })
        .collect();

    let laps = of_kind(MesgNum::Lap)
        .map(|m| ParsedLap {
            start_time: narrow(m, summary::START_TIME),
            total_elapsed_time: scaled(m, summary::TOTAL_ELAPSED_TIME),
            total_distance: scaled(m, summary::TOTAL_DISTANCE),
            total_calories: narrow(m, summary::TOTAL_CALORIES),
            average_power: narrow(m, summary::LAP_AVG_POWER),
            max_power: narrow(m, summary::LAP_MAX_POWER),
            intensity: narrow(m, summary::LAP_INTENSITY),
        })
        .collect();

    let session_message = of_kind(MesgNum::Session)
        .next()
        .ok_or_else(|| EncodeError::Malformed("file has no session message".to_string()))?;
    let session = ParsedSession {
        start_time: narrow(session_message, summary::START_TIME),
        sport: narrow(session_message, summary::SESSION_SPORT),
        sub_sport: narrow(session_message, summary::SESSION_SUB_SPORT),
        total_elapsed_time: scaled(session_message, summary::TOTAL_ELAPSED_TIME),
        total_distance: scaled(session_message, summary::TOTAL_DISTANCE),
        total_cycles: narrow(session_message, summary::TOTAL_CYCLES),
        total_calories: narrow(session_message, summary::TOTAL_CALORIES),
        average_heart_rate: narrow(session_message, summary::SESSION_AVG_HEART_RATE),
        max_heart_rate: narrow(session_message, summary::SESSION_MAX_HEART_RATE),
        average_cadence: narrow(session_message, summary::SESSION_AVG_CADENCE),
        average_power: narrow(session_message, summary::SESSION_AVG_POWER),
        max_power: narrow(session_message, summary::SESSION_MAX_POWER),
        num_laps: narrow(session_message, summary::SESSION_NUM_LAPS),
    };

    Ok(ParsedActivity {
        file_id,
        device_info,
        records,
        laps,
        session,
        messages,
    })
}

/// A failed self-validation check
#[derive(Debug, Clone, PartialEq)]
struct CheckFailure {
    check: &'static str,
    reason: String,
}

impl CheckFailure {
    fn new(check: &'static str, reason: impl Into<String>) -> Self {
        Self {
            check,
            reason: reason.into(),
        }
    }
}

/// Last valid value of a cumulative record counter, summed as deltas from zero
fn accumulated(values: impl Iterator<Item = Option<f64>>) -> Option<f64> {
    let mut total = None;
    let mut previous = 0.0;
    for value in values.flatten() {
        *total.get_or_insert(0.0) += value - previous;
        previous = value;
    }
    total
}

fn compare_totals(
    check: &'static str,
    field: &str,
    session: Option<f64>,
    records: Option<f64>,
    tolerance: f64,
) -> Result<(), CheckFailure> {
    match (session, records) {
        (None, None) => Ok(()),
        (Some(s), Some(r)) if (s - r).abs() <= tolerance => Ok(()),
        (s, r) => Err(CheckFailure::new(
            check,
            format!(
                "session.{field} {s:?} disagrees with records {r:?} (tolerance {tolerance})"
            ),
        )),
    }
}

fn run_checks(
    parsed: &ParsedActivity,
    identity: &DeviceIdentity,
    config: &ExportConfig,
) -> (Vec<CheckFailure>, Vec<String>) {
    let mut failures = Vec::new();
    let mut warnings = Vec::new();

    // structure
    let sessions = parsed.messages_of(MesgNum::Session).count();
    if sessions != 1 {
        failures.push(CheckFailure::new(
            "structure",
            format!("expected one session message, found {sessions}"),
        ));
    }
    if parsed.device_info.is_none() {
        failures.push(CheckFailure::new("structure", "missing device_info message"));
    }
    if let Some(num_laps) = parsed.session.num_laps {
        if usize::from(num_laps) != parsed.laps.len() {
            failures.push(CheckFailure::new(
                "structure",
                format!(
                    "session.num_laps {num_laps} but {} lap messages",
                    parsed.laps.len()
                ),
            ));
        }
    }

    // timestamps
    let mut previous: Option<u32> = None;
    for (i, timestamp) in parsed.records.iter().map(|r| r.timestamp).enumerate() {
        match (previous, timestamp) {
            (_, None) => failures.push(CheckFailure::new(
                "timestamps",
                format!("record {i} has no timestamp"),
            )),
            (Some(prev), Some(ts)) if ts < prev => failures.push(CheckFailure::new(
                "timestamps",
                format!("record {i} timestamp {ts} precedes {prev}"),
            )),
            (_, Some(ts)) => previous = Some(ts),
        }
    }

    // totals
    let record_distance = accumulated(parsed.records.iter().map(|r| r.distance));
    let record_calories = accumulated(parsed.records.iter().map(|r| r.calories.map(f64::from)));
    let powers: RunningStats = parsed.records.iter().fold(RunningStats::default(), |mut acc, r| {
        acc.push_opt(r.power.map(f64::from));
        acc
    });
    let totals = [
        compare_totals(
            "totals",
            "total_distance",
            parsed.session.total_distance,
            record_distance,
            config.distance_tolerance_m,
        ),
        compare_totals(
            "totals",
            "total_calories",
            parsed.session.total_calories.map(f64::from),
            record_calories,
            config.calorie_tolerance_kcal,
        ),
        compare_totals(
            "totals",
            "avg_power",
            parsed.session.average_power.map(f64::from),
            powers.mean(),
            config.power_tolerance_w,
        ),
    ];
    failures.extend(totals.into_iter().filter_map(Result::err));

    // identity
    let expected_sport = identity.sport() as u8;
    let expected_sub_sport = identity.sub_sport() as u8;
    if parsed.session.sport != Some(expected_sport)
        || parsed.session.sub_sport != Some(expected_sub_sport)
    {
        failures.push(CheckFailure::new(
            "identity",
            format!(
                "session sport {:?}/{:?}, expected {expected_sport}/{expected_sub_sport}",
                parsed.session.sport, parsed.session.sub_sport
            ),
        ));
    }
    if parsed.file_id.manufacturer != Some(identity.manufacturer)
        || parsed.file_id.product != Some(identity.product)
    {
        failures.push(CheckFailure::new(
            "identity",
            format!(
                "file_id manufacturer/product {:?}/{:?}, expected {}/{}",
                parsed.file_id.manufacturer,
                parsed.file_id.product,
                identity.manufacturer,
                identity.product
            ),
        ));
    }
    if parsed.file_id.serial_number != Some(identity.serial_number) {
        failures.push(CheckFailure::new(
            "identity",
            format!(
                "file_id serial number {:?}, expected {}",
                parsed.file_id.serial_number, identity.serial_number
            ),
        ));
    }

    // warnings
    if parsed.records.len() < config.min_records {
        warnings.push(format!(
            "only {} records, fewer than {}",
            parsed.records.len(),
            config.min_records
        ));
    }
    let has_power = parsed.records.iter().any(|r| r.power.is_some());
    let has_heart_rate = parsed.records.iter().any(|r| r.heart_rate.is_some());
    if !has_power && !has_heart_rate {
        warnings.push(
            "no power or heart rate data, training load cannot be computed".to_string(),
        );
    }

    (failures, warnings)
}

/// Validate any activity file against a device identity
///
/// Unlike [`encode`], every failed check is collected into the report.
#[must_use]
pub fn validate_activity(
    bytes: &[u8],
    identity: &DeviceIdentity,
    config: &ExportConfig,
) -> ValidationReport {
    match decode_activity(bytes) {
        Ok(parsed) => {
            let (failures, warnings) = run_checks(&parsed, identity, config);
            ValidationReport {
                valid: failures.is_empty(),
                warnings,
                errors: failures
                    .into_iter()
                    .map(|f| format!("{}: {}", f.check, f.reason))
                    .collect(),
            }
        }
        Err(e) => ValidationReport {
            valid: false,
            warnings: Vec::new(),
            errors: vec![format!("structure: {e}")],
        },
    }
}

/// Encode a finished session with default tolerances
///
/// # Errors
///
/// See [`encode_with`].
pub fn encode(
    session: &WorkoutSession,
    summary: &SessionSummary,
    identity: &DeviceIdentity,
) -> Result<ExportedActivity, EncodeError> {
    encode_with(session, summary, identity, &ExportConfig::default())
}

/// Encode a finished session into a FIT activity file
///
/// The output is parsed and checked before it is returned; no bytes are
/// handed out for a file that fails its own validation.
///
/// # Errors
///
/// - `EncodeError::UnsupportedMachineClass` when the identity describes a
///   different machine class than the session
/// - `EncodeError::InvalidIdentity` for a zero serial number or sentinel ids
/// - `EncodeError::Malformed` for a session without samples
/// - `EncodeError::ValidationFailed` when a self-validation check fails
pub fn encode_with(
    session: &WorkoutSession,
    summary: &SessionSummary,
    identity: &DeviceIdentity,
    config: &ExportConfig,
) -> Result<ExportedActivity, EncodeError> {
    check_identity(session.machine_class(), identity)?;
    if session.is_empty() {
        return Err(EncodeError::Malformed("session holds no samples".to_string()));
    }

    let bytes = write_activity(session, summary, identity, config)?;
    let record_count = session.len();

    let parsed = decode_activity(&bytes).map_err(|e| EncodeError::ValidationFailed {
        check: "structure",
        reason: e.to_string(),
    })?;
    let (failures, mut warnings) = run_checks(&parsed, identity, config);
    if let Some(failure) = failures.into_iter().next() {
        error!("Activity failed self-validation ({}): {}", failure.check, failure.reason);
        return Err(EncodeError::ValidationFailed {
            check: failure.check,
            reason: failure.reason,
        });
    }

    let corrected = session
        .samples()
        .iter()
        .filter(|s| s.sample.quality != DataQuality::Good)
        .count();
    if corrected > 0 {
        warnings.push(format!("{corrected} samples carry corrected values"));
    }
    if summary.distance_estimated {
        warnings.push("distance integrated from speed".to_string());
    }
    for warning in &warnings {
        warn!("Activity export: {warning}");
    }

    info!(
        "Exported {} activity: {} bytes, {record_count} records, {} laps",
        session.machine_class(),
        bytes.len(),
        parsed.laps.len()
    );

    Ok(ExportedActivity {
        bytes,
        report: ValidationReport {
            valid: true,
            warnings,
            errors: Vec::new(),
        },
        record_count,
    })
}

fn check_identity(machine_class: MachineClass, identity: &DeviceIdentity) -> Result<(), EncodeError> {
    if identity.machine_class != machine_class {
        return Err(EncodeError::UnsupportedMachineClass {
            session: machine_class,
            identity: identity.machine_class,
        });
    }
    if identity.serial_number == 0 {
        return Err(EncodeError::InvalidIdentity(
            "serial number must not be zero".to_string(),
        ));
    }
    if identity.manufacturer == u16::MAX || identity.product == u16::MAX {
        return Err(EncodeError::InvalidIdentity(format!(
            "manufacturer {} / product {} collide with the invalid sentinel",
            identity.manufacturer, identity.product
        )));
    }
    Ok(())
}

#[allow(clippy::cast_possible_truncation)]
fn millis(duration: Duration) -> i64 {
    duration.as_millis().min(u128::from(u32::MAX)) as i64
}

#[allow(clippy::cast_possible_truncation)]
fn round(value: f64) -> i64 {
    value.round() as i64
}

const fn lap_intensity(phase: Phase) -> i64 {
    match phase {
        Phase::WarmUp => INTENSITY_WARMUP,
        Phase::Cooldown => INTENSITY_COOLDOWN,
        Phase::NotStarted | Phase::Main | Phase::Ended => INTENSITY_ACTIVE,
    }
}

/// Cadence written to records: crank cadence for bikes, stroke rate for rowers
fn record_cadence(machine_class: MachineClass, entry: &SessionSample) -> Option<f64> {
    match machine_class {
        MachineClass::Bike => entry.sample.cadence,
        MachineClass::Rower => entry.sample.stroke_rate,
    }
}

/// Statistics of one lap computed from its samples
#[derive(Debug, Default)]
struct LapStats {
    power: RunningStats,
    heart_rate: RunningStats,
    cadence: RunningStats,
    speed: RunningStats,
    distance: Option<f64>,
    calories: Option<f64>,
    strokes: Option<f64>,
}

fn write_activity(
    session: &WorkoutSession,
    summary: &SessionSummary,
    identity: &DeviceIdentity,
    config: &ExportConfig,
) -> Result<Bytes, EncodeError> {
    let class = session.machine_class();
    let start = fit::to_fit_timestamp(session.started_at());
    let at = |offset: Duration| {
        i64::from(start) + i64::try_from(offset.as_secs()).unwrap_or(i64::from(u32::MAX))
    };
    let end = at(session.duration());
    let end_time = fit::from_fit_timestamp(u32::try_from(end).unwrap_or(u32::MAX - 1));
    let local_end = fit::to_local_fit_timestamp(end_time, config.utc_offset_at(end_time));
    let sport = i64::from(identity.sport() as u8);
    let sub_sport = i64::from(identity.sub_sport() as u8);

    let mut writer = FitWriter::new();
    writer.write(
        &FILE_ID_MESSAGE,
        &[
            Some(FILE_TYPE_ACTIVITY),
            Some(i64::from(identity.manufacturer)),
            Some(i64::from(identity.product)),
            Some(i64::from(identity.serial_number)),
            Some(i64::from(start)),
        ],
    );
    writer.write(
        &DEVICE_INFO_MESSAGE,
        &[
            Some(i64::from(start)),
            Some(0),
            Some(i64::from(identity.manufacturer)),
            Some(i64::from(identity.serial_number)),
            Some(i64::from(identity.product)),
            Some(i64::from(identity.software_version)),
            Some(i64::from(identity.hardware_version)),
        ],
    );
    writer.write(
        &EVENT_MESSAGE,
        &[Some(i64::from(start)), Some(EVENT_TIMER), Some(EVENT_TYPE_START)],
    );

    let distances = session.distance_track();
    let phases = &summary.phases;
    let mut laps: Vec<LapStats> = phases.iter().map(|_| LapStats::default()).collect();
    if laps.is_empty() {
        laps.push(LapStats::default());
    }

    for (entry, distance) in session.samples().iter().zip(&distances) {
        let sample = &entry.sample;
        let cadence = record_cadence(class, entry);
        writer.write(
            &RECORD_MESSAGE,
            &[
                Some(at(entry.offset)),
                sample.heart_rate.map(i64::from),
                cadence.map(round),
                distance.map(|d| round(d * 100.0)),
                sample.speed_mps.map(|v| round(v * 1000.0)),
                sample.instantaneous_power.map(|p| i64::from(p.max(0))),
                sample.total_energy.map(i64::from),
            ],
        );

        let lap_index = phases
            .iter()
            .rposition(|p| p.start_offset <= entry.offset)
            .unwrap_or(0)
            .min(laps.len() - 1);
        let lap = &mut laps[lap_index];
        lap.power.push_opt(sample.instantaneous_power.map(|p| f64::from(p.max(0))));
        lap.heart_rate.push_opt(sample.heart_rate.map(f64::from));
        lap.cadence.push_opt(cadence);
        lap.speed.push_opt(sample.speed_mps);
        if distance.is_some() {
            lap.distance = *distance;
        }
        if let Some(calories) = sample.total_energy {
            lap.calories = Some(f64::from(calories));
        }
        if let Some(strokes) = sample.stroke_count {
            lap.strokes = Some(f64::from(strokes));
        }
    }
    debug!("Wrote {} records", session.len());

    writer.write(
        &EVENT_MESSAGE,
        &[Some(end), Some(EVENT_TIMER), Some(EVENT_TYPE_STOP_ALL)],
    );

    let mut previous = (0.0, 0.0, 0.0);
    let lap_count = laps.len();
    for (index, lap) in laps.iter().enumerate() {
        let (lap_start, lap_duration, phase) = phases.get(index).map_or(
            (Duration::ZERO, session.duration(), Phase::Main),
            |p| (p.start_offset, p.duration, p.phase),
        );
        let delta = |current: Option<f64>, before: f64| current.map(|c| (c - before).max(0.0));
        let distance = delta(lap.distance, previous.0);
        let calories = delta(lap.calories, previous.1);
        let strokes = delta(lap.strokes, previous.2);
        previous = (
            lap.distance.unwrap_or(previous.0),
            lap.calories.unwrap_or(previous.1),
            lap.strokes.unwrap_or(previous.2),
        );

        writer.write(
            &LAP_MESSAGE,
            &[
                Some(i64::try_from(index).unwrap_or(0)),
                Some(at(lap_start + lap_duration)),
                Some(EVENT_LAP),
                Some(EVENT_TYPE_STOP),
                Some(at(lap_start)),
                Some(millis(lap_duration)),
                Some(millis(lap_duration)),
                distance.map(|d| round(d * 100.0)),
                strokes.map(round),
                calories.map(round),
                lap.speed.mean().map(|v| round(v * 1000.0)),
                lap.speed.max().map(|v| round(v * 1000.0)),
                lap.heart_rate.mean().map(round),
                lap.heart_rate.max().map(round),
                lap.cadence.mean().map(round),
                lap.cadence.max().map(round),
                lap.power.mean().map(round),
                lap.power.max().map(round),
                Some(lap_intensity(phase)),
                Some(LAP_TRIGGER_MANUAL),
                Some(sport),
                Some(sub_sport),
            ],
        );
    }

    let (average_cadence, max_cadence) = match class {
        MachineClass::Bike => (summary.average_cadence, summary.max_cadence),
        MachineClass::Rower => (summary.average_stroke_rate, summary.max_stroke_rate),
    };
    let duration_ms = millis(summary.duration);
    writer.write(
        &SESSION_MESSAGE,
        &[
            Some(0),
            Some(end),
            Some(EVENT_SESSION),
            Some(EVENT_TYPE_STOP),
            Some(i64::from(start)),
            Some(sport),
            Some(sub_sport),
            Some(duration_ms),
            Some(duration_ms),
            summary.total_distance.map(|d| round(d * 100.0)),
            summary.total_strokes.map(i64::from),
            summary.total_energy.map(i64::from),
            summary.average_speed.map(|v| round(v / 3.6 * 1000.0)),
            summary.max_speed.map(|v| round(v / 3.6 * 1000.0)),
            summary.average_heart_rate.map(round),
            summary.max_heart_rate.map(round),
            average_cadence.map(round),
            max_cadence.map(round),
            summary.average_power.map(|p| round(p.max(0.0))),
            summary.max_power.map(|p| round(p.max(0.0))),
            Some(0),
            Some(i64::try_from(lap_count).unwrap_or(i64::from(u16::MAX))),
            Some(SESSION_TRIGGER_ACTIVITY_END),
        ],
    );

    writer.write(
        &ACTIVITY_MESSAGE,
        &[
            Some(end),
            Some(duration_ms),
            Some(1),
            Some(ACTIVITY_TYPE_MANUAL),
            Some(EVENT_ACTIVITY),
            Some(EVENT_TYPE_STOP),
            Some(i64::from(local_end)),
        ],
    );

    writer.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::PhaseConfig,
        identity::{self, GENERIC_ROWER},
        session::SessionAggregator,
        types::MetricSample,
    };
    use chrono::TimeZone;
    use fitparser::profile::TimestampField;
    use std::time::Instant;

    fn finished_bike(samples: usize) -> crate::session::FinishedSession {
        let origin = Instant::now();
        let mut aggregator = SessionAggregator::new(MachineClass::Bike, PhaseConfig::default())
            .with_started_at(Utc.with_ymd_and_hms(2024, 3, 1, 7, 30, 0).unwrap());
        for i in 0..samples {
            let second = u64::try_from(i).unwrap();
            let mut sample =
                MetricSample::new(MachineClass::Bike, origin + Duration::from_secs(second));
            sample.instantaneous_power = Some(150 + i16::try_from(i % 5).unwrap() * 10);
            sample.cadence = Some(85.0);
            sample.set_speed(Some(30.0));
            sample.total_distance = Some(u32::try_from(i).unwrap() * 8);
            sample.total_energy = Some(u16::try_from(i / 4).unwrap());
            sample.heart_rate = (i % 3 != 0).then_some(130);
            aggregator.ingest(sample).unwrap();
        }
        aggregator.finalize().unwrap()
    }

    #[test]
    fn test_encode_round_trip() {
        let finished = finished_bike(30);
        let identity = identity::identify(Some("Echo Bike"), MachineClass::Bike);
        let exported = encode(&finished.session, &finished.summary, &identity).unwrap();

        assert!(exported.report.valid);
        assert_eq!(exported.record_count, 30);

        let parsed = decode_activity(&exported.bytes).unwrap();
        assert_eq!(parsed.records.len(), 30);
        assert_eq!(parsed.laps.len(), 1);
        assert_eq!(parsed.file_id.manufacturer, Some(identity.manufacturer));
        assert_eq!(parsed.file_id.product, Some(1001));
        assert_eq!(parsed.session.sport, Some(2));
        assert_eq!(parsed.session.sub_sport, Some(6));
        assert_eq!(parsed.session.total_distance, Some(232.0));
        assert_eq!(parsed.session.total_calories, Some(7));
        assert_eq!(parsed.laps[0].intensity, Some(2));
        assert_eq!(parsed.records[0].heart_rate, None);
        assert_eq!(parsed.records[1].heart_rate, Some(130));
        assert!((parsed.records[0].speed.unwrap() - 30.0 / 3.6).abs() < 0.001);
    }

    #[test]
    fn test_record_timestamps_follow_offsets() {
        let finished = finished_bike(5);
        let identity = DeviceIdentity::generic(MachineClass::Bike);
        let exported = encode(&finished.session, &finished.summary, &identity).unwrap();
        let parsed = decode_activity(&exported.bytes).unwrap();

        let start = fit::to_fit_timestamp(finished.session.started_at());
        let timestamps: Vec<_> = parsed.records.iter().map(|r| r.timestamp.unwrap()).collect();
        assert_eq!(timestamps, (0..5).map(|i| start + i).collect::<Vec<_>>());
        // too few records for a meaningful activity
        assert!(!exported.report.warnings.is_empty());
    }

    #[test]
    fn test_identity_class_mismatch() {
        let finished = finished_bike(3);
        let identity = DeviceIdentity::for_product(GENERIC_ROWER, 42);
        assert_eq!(
            encode(&finished.session, &finished.summary, &identity),
            Err(EncodeError::UnsupportedMachineClass {
                session: MachineClass::Bike,
                identity: MachineClass::Rower,
            })
        );
    }

    #[test]
    fn test_zero_serial_rejected() {
        let finished = finished_bike(3);
        let identity = DeviceIdentity::generic(MachineClass::Bike).with_serial_number(0);
        assert!(matches!(
            encode(&finished.session, &finished.summary, &identity),
            Err(EncodeError::InvalidIdentity(_))
        ));
    }

    #[test]
    fn test_inconsistent_summary_fails_validation() {
        let finished = finished_bike(10);
        let mut summary = finished.summary.clone();
        summary.average_power = summary.average_power.map(|p| p + 25.0);
        let identity = DeviceIdentity::generic(MachineClass::Bike);

        match encode(&finished.session, &summary, &identity) {
            Err(EncodeError::ValidationFailed { check, reason }) => {
                assert_eq!(check, "totals");
                assert!(reason.contains("avg_power"));
            }
            other => panic!("expected validation failure, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_foreign_identity() {
        let finished = finished_bike(12);
        let identity = DeviceIdentity::generic(MachineClass::Bike);
        let exported = encode(&finished.session, &finished.summary, &identity).unwrap();

        let other = identity.clone().with_serial_number(7);
        let report = validate_activity(&exported.bytes, &other, &ExportConfig::default());
        assert!(!report.valid);
        assert!(report.errors.iter().any(|e| e.starts_with("identity")));

        let report = validate_activity(&exported.bytes, &identity, &ExportConfig::default());
        assert!(report.valid);
        assert!(report.errors.is_empty());
    }

    #[test]
    fn test_local_timestamp_uses_offset() {
        let finished = finished_bike(12);
        let identity = DeviceIdentity::generic(MachineClass::Bike);
        let config = ExportConfig {
            utc_offset_secs: Some(3600),
            ..ExportConfig::default()
        };
        let exported = encode_with(&finished.session, &finished.summary, &identity, &config).unwrap();
        let parsed = decode_activity(&exported.bytes).unwrap();

        let end = fit::to_fit_timestamp(finished.session.started_at()) + 11;
        let message = parsed.messages_of(MesgNum::Activity).next().unwrap();
        assert_eq!(narrow::<u32>(message, TIMESTAMP), Some(end));
        assert_eq!(
            field(message, activity::LOCAL_TIMESTAMP),
            Some(&Value::from(TimestampField::Local(i64::from(end + 3600))))
        );
    }

    #[test]
    fn test_decode_requires_file_id_first() {
        let mut writer = FitWriter::new();
        writer.write(&RECORD_MESSAGE, &[Some(1000), Some(120)]);
        let bytes = writer.finish().unwrap();

        match decode_activity(&bytes) {
            Err(EncodeError::Malformed(reason)) => assert!(reason.contains("file_id")),
            other => panic!("expected malformed, got {other:?}"),
        }
        assert!(matches!(
            decode_activity(b"not a fit file"),
            Err(EncodeError::Malformed(_))
        ));
    }

    #[test]
    fn test_value_conversions() {
        assert_eq!(integer(&Value::UInt16z(7)), Some(7));
        assert_eq!(integer(&Value::SInt64(-3)), Some(-3));
        assert_eq!(integer(&Value::Float64(1.5)), None);
        assert_eq!(real(&Value::Float64(2.25)), Some(2.25));
        assert_eq!(real(&Value::UInt8(9)), Some(9.0));
        assert_eq!(real(&Value::String("x".to_string())), None);
    }

    #[test]
    fn test_accumulated_deltas() {
        assert_eq!(accumulated([None, Some(5.0), None, Some(12.0)].into_iter()), Some(12.0));
        assert_eq!(accumulated([None, None].into_iter()), None);
    }
}
