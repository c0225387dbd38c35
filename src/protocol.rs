//! FTMS notification frame codec.
//!
//! Indoor Bike Data (0x2AD2) and Rower Data (0x2AD1) frames start with a
//! 16-bit little-endian flag header. Each flag bit announces one group of
//! fields, and the groups follow the header in bit order. Bit 0 ("More Data")
//! is inverted: the first group is present when the bit is **clear**.
//!
//! Layout of the per-class groups:
//!
//! | Bit | Bike                                  | Rower                               |
//! |-----|---------------------------------------|-------------------------------------|
//! | 0   | speed u16 (0.01 km/h), inverted       | stroke rate u8 (0.5/min) + count u16, inverted |
//! | 1   | average speed u16                     | average stroke rate u8              |
//! | 2   | cadence u16 (0.5 rpm)                 | total distance u24 (m)              |
//! | 3   | average cadence u16                   | pace u16 (s/500 m)                  |
//! | 4   | total distance u24 (m)                | average pace u16                    |
//! | 5   | resistance i16                        | power i16 (W)                       |
//! | 6   | power i16 (W)                         | average power i16                   |
//! | 7   | average power i16                     | resistance i16                      |
//! | 8   | energy: total u16, per hour u16, per minute u8 | same as bike               |
//! | 9   | heart rate u8                         | heart rate u8                       |
//! | 10  | MET u8 (0.1)                          | MET u8 (0.1)                        |
//! | 11  | elapsed time u16 (s)                  | elapsed time u16 (s)                |
//! | 12  | remaining time u16 (s)                | remaining time u16 (s)              |
//!
//! Bits 13 to 15 are reserved in both layouts.

use crate::{
    error::DecodeError,
    types::{FrameKind, MachineClass, MetricSample},
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::time::Instant;
use tracing::trace;

/// Inverted "More Data" bit of the FTMS flag header
pub const MORE_DATA_FLAG: u16 = 0x0001;

/// Flag bits without a field definition
pub const RESERVED_FLAGS: u16 = 0xE000;

/// Size of the flag header in bytes
const FLAGS_SIZE: usize = 2;

/// Heart Rate Measurement flag selecting a 16-bit value
const HR_VALUE_U16: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Width {
    U8,
    U16,
    U24,
    I16,
}

impl Width {
    const fn len(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::U16 | Self::I16 => 2,
            Self::U24 => 3,
        }
    }

    fn read(self, buf: &mut &[u8]) -> i32 {
        match self {
            Self::U8 => i32::from(buf.get_u8()),
            Self::U16 => i32::from(buf.get_u16_le()),
            #[allow(clippy::cast_possible_truncation)]
            Self::U24 => buf.get_uint_le(3) as i32,
            Self::I16 => i32::from(buf.get_i16_le()),
        }
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn write(self, buf: &mut BytesMut, raw: i32) {
        match self {
            Self::U8 => buf.put_u8(raw as u8),
            Self::U16 => buf.put_u16_le(raw as u16),
            Self::U24 => buf.put_uint_le(u64::from(raw as u32 & 0x00FF_FFFF), 3),
            Self::I16 => buf.put_i16_le(raw as i16),
        }
    }
}

/// Sample field a wire value lands in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Speed,
    AverageSpeed,
    Cadence,
    AverageCadence,
    StrokeRate,
    AverageStrokeRate,
    StrokeCount,
    TotalDistance,
    Pace,
    AveragePace,
    Power,
    AveragePower,
    Resistance,
    TotalEnergy,
    EnergyPerHour,
    EnergyPerMinute,
    HeartRate,
    Met,
    ElapsedTime,
    RemainingTime,
}

impl Slot {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn store(self, sample: &mut MetricSample, raw: i32, resolution: f64) {
        let scaled = f64::from(raw) * resolution;
        match self {
            Self::Speed => sample.set_speed(Some(scaled)),
            Self::AverageSpeed => sample.average_speed = Some(scaled),
            Self::Cadence => sample.cadence = Some(scaled),
            Self::AverageCadence => sample.average_cadence = Some(scaled),
            Self::StrokeRate => sample.stroke_rate = Some(scaled),
            Self::AverageStrokeRate => sample.average_stroke_rate = Some(scaled),
            Self::StrokeCount => sample.stroke_count = Some(raw as u16),
            Self::TotalDistance => sample.total_distance = Some(raw as u32),
            Self::Pace => sample.set_pace(Some(raw as u16)),
            Self::AveragePace => sample.average_pace = Some(raw as u16),
            Self::Power => sample.instantaneous_power = Some(raw as i16),
            Self::AveragePower => sample.average_power = Some(raw as i16),
            Self::Resistance => sample.resistance_level = Some(raw as i16),
            Self::TotalEnergy => sample.total_energy = Some(raw as u16),
            Self::EnergyPerHour => sample.energy_per_hour = Some(raw as u16),
            Self::EnergyPerMinute => sample.energy_per_minute = Some(raw as u8),
            Self::HeartRate => sample.heart_rate = Some(raw as u8),
            Self::Met => sample.metabolic_equivalent = Some(scaled),
            Self::ElapsedTime => sample.elapsed_time = Some(raw as u16),
            Self::RemainingTime => sample.remaining_time = Some(raw as u16),
        }
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    fn load(self, sample: &MetricSample, resolution: f64) -> Option<i32> {
        let unscale = |value: f64| (value / resolution).round() as i32;
        match self {
            Self::Speed => sample.speed.map(unscale),
            Self::AverageSpeed => sample.average_speed.map(unscale),
            Self::Cadence => sample.cadence.map(unscale),
            Self::AverageCadence => sample.average_cadence.map(unscale),
            Self::StrokeRate => sample.stroke_rate.map(unscale),
            Self::AverageStrokeRate => sample.average_stroke_rate.map(unscale),
            Self::StrokeCount => sample.stroke_count.map(i32::from),
            Self::TotalDistance => sample.total_distance.map(|v| v as i32),
            Self::Pace => sample.pace.map(i32::from),
            Self::AveragePace => sample.average_pace.map(i32::from),
            Self::Power => sample.instantaneous_power.map(i32::from),
            Self::AveragePower => sample.average_power.map(i32::from),
            Self::Resistance => sample.resistance_level.map(i32::from),
            Self::TotalEnergy => sample.total_energy.map(i32::from),
            Self::EnergyPerHour => sample.energy_per_hour.map(i32::from),
            Self::EnergyPerMinute => sample.energy_per_minute.map(i32::from),
            Self::HeartRate => sample.heart_rate.map(i32::from),
            Self::Met => sample.metabolic_equivalent.map(unscale),
            Self::ElapsedTime => sample.elapsed_time.map(i32::from),
            Self::RemainingTime => sample.remaining_time.map(i32::from),
        }
    }
}

/// One row of a per-class field table
#[derive(Debug, Clone, Copy)]
struct FieldSpec {
    bit: u8,
    name: &'static str,
    width: Width,
    slot: Slot,
    resolution: f64,
}

impl FieldSpec {
    const fn new(bit: u8, name: &'static str, width: Width, slot: Slot) -> Self {
        Self::scaled(bit, name, width, slot, 1.0)
    }

    const fn scaled(bit: u8, name: &'static str, width: Width, slot: Slot, resolution: f64) -> Self {
        Self {
            bit,
            name,
            width,
            slot,
            resolution,
        }
    }
}

/// Whether the group announced by `bit` is present under `flags`
const fn group_present(flags: u16, bit: u8) -> bool {
    let set = flags & (1 << bit) != 0;
    if bit == 0 {
        !set
    } else {
        set
    }
}

const BIKE_FIELDS: &[FieldSpec] = &[
    FieldSpec::scaled(0, "instantaneous_speed", Width::U16, Slot::Speed, 0.01),
    FieldSpec::scaled(1, "average_speed", Width::U16, Slot::AverageSpeed, 0.01),
    FieldSpec::scaled(2, "instantaneous_cadence", Width::U16, Slot::Cadence, 0.5),
    FieldSpec::scaled(3, "average_cadence", Width::U16, Slot::AverageCadence, 0.5),
    FieldSpec::new(4, "total_distance", Width::U24, Slot::TotalDistance),
    FieldSpec::new(5, "resistance_level", Width::I16, Slot::Resistance),
    FieldSpec::new(6, "instantaneous_power", Width::I16, Slot::Power),
    FieldSpec::new(7, "average_power", Width::I16, Slot::AveragePower),
    FieldSpec::new(8, "total_energy", Width::U16, Slot::TotalEnergy),
    FieldSpec::new(8, "energy_per_hour", Width::U16, Slot::EnergyPerHour),
    FieldSpec::new(8, "energy_per_minute", Width::U8, Slot::EnergyPerMinute),
    FieldSpec::new(9, "heart_rate", Width::U8, Slot::HeartRate),
    FieldSpec::scaled(10, "metabolic_equivalent", Width::U8, Slot::Met, 0.1),
    FieldSpec::new(11, "elapsed_time", Width::U16, Slot::ElapsedTime),
    FieldSpec::new(12, "remaining_time", Width::U16, Slot::RemainingTime),
];

const ROWER_FIELDS: &[FieldSpec] = &[
    FieldSpec::scaled(0, "stroke_rate", Width::U8, Slot::StrokeRate, 0.5),
    FieldSpec::new(0, "stroke_count", Width::U16, Slot::StrokeCount),
    FieldSpec::scaled(1, "average_stroke_rate", Width::U8, Slot::AverageStrokeRate, 0.5),
    FieldSpec::new(2, "total_distance", Width::U24, Slot::TotalDistance),
    FieldSpec::new(3, "instantaneous_pace", Width::U16, Slot::Pace),
    FieldSpec::new(4, "average_pace", Width::U16, Slot::AveragePace),
    FieldSpec::new(5, "instantaneous_power", Width::I16, Slot::Power),
    FieldSpec::new(6, "average_power", Width::I16, Slot::AveragePower),
    FieldSpec::new(7, "resistance_level", Width::I16, Slot::Resistance),
    FieldSpec::new(8, "total_energy", Width::U16, Slot::TotalEnergy),
    FieldSpec::new(8, "energy_per_hour", Width::U16, Slot::EnergyPerHour),
    FieldSpec::new(8, "energy_per_minute", Width::U8, Slot::EnergyPerMinute),
    FieldSpec::new(9, "heart_rate", Width::U8, Slot::HeartRate),
    FieldSpec::scaled(10, "metabolic_equivalent", Width::U8, Slot::Met, 0.1),
    FieldSpec::new(11, "elapsed_time", Width::U16, Slot::ElapsedTime),
    FieldSpec::new(12, "remaining_time", Width::U16, Slot::RemainingTime),
];

const fn fields_for(machine_class: MachineClass) -> &'static [FieldSpec] {
    match machine_class {
        MachineClass::Bike => BIKE_FIELDS,
        MachineClass::Rower => ROWER_FIELDS,
    }
}

/// Number of bytes a frame with the given flag header occupies
///
/// Includes the two header bytes. Reserved bits are ignored.
#[must_use]
pub fn frame_len(machine_class: MachineClass, flags: u16) -> usize {
    FLAGS_SIZE
        + fields_for(machine_class)
            .iter()
            .filter(|entry| group_present(flags, entry.bit))
            .map(|entry| entry.width.len())
            .sum::<usize>()
}

/// Decode a machine data frame, stamping it with the current instant
///
/// # Errors
///
/// See [`decode_at`].
pub fn decode(machine_class: MachineClass, raw: &[u8]) -> Result<MetricSample, DecodeError> {
    decode_at(machine_class, raw, Instant::now())
}

/// Decode a machine data frame received at `at`
///
/// Fields are read strictly in flag-bit order and the cursor only advances
/// over announced groups. Decoding is all-or-nothing: on error no partial
/// sample is returned.
///
/// # Errors
///
/// - `DecodeError::Empty` for a zero-length frame
/// - `DecodeError::UnknownFlagCombination` when reserved bits are set
/// - `DecodeError::Truncated` when the frame ends inside an announced field
pub fn decode_at(
    machine_class: MachineClass,
    raw: &[u8],
    at: Instant,
) -> Result<MetricSample, DecodeError> {
    if raw.is_empty() {
        return Err(DecodeError::Empty);
    }
    if raw.len() < FLAGS_SIZE {
        return Err(DecodeError::Truncated {
            field: "flags",
            needed: FLAGS_SIZE,
            remaining: raw.len(),
        });
    }

    let mut buf = raw;
    let flags = buf.get_u16_le();

    let reserved = flags & RESERVED_FLAGS;
    if reserved != 0 {
        return Err(DecodeError::UnknownFlagCombination { flags, reserved });
    }

    let mut sample = MetricSample::new(machine_class, at);
    for entry in fields_for(machine_class) {
        if !group_present(flags, entry.bit) {
            continue;
        }
        let needed = entry.width.len();
        if buf.remaining() < needed {
            return Err(DecodeError::Truncated {
                field: entry.name,
                needed,
                remaining: buf.remaining(),
            });
        }
        let value = entry.width.read(&mut buf);
        entry.slot.store(&mut sample, value, entry.resolution);
    }

    if buf.has_remaining() {
        trace!(
            "Ignoring {} trailing bytes after {machine_class} frame 0x{flags:04X}",
            buf.remaining()
        );
    }

    Ok(sample)
}

/// Decode a frame keyed by its 16-bit characteristic number
///
/// # Errors
///
/// Returns `DecodeError::UnknownClass` for characteristics that do not carry
/// bike or rower data, otherwise the errors of [`decode_at`].
pub fn decode_frame(
    characteristic: u16,
    raw: &[u8],
    at: Instant,
) -> Result<MetricSample, DecodeError> {
    let machine_class = FrameKind::from_characteristic(characteristic)
        .and_then(FrameKind::machine_class)
        .ok_or(DecodeError::UnknownClass(characteristic))?;
    decode_at(machine_class, raw, at)
}

/// Encode a sample back into its wire frame
///
/// A group is written when any of its fields is present; a missing member of
/// a written group is sent as zero. Used by simulators and replay tooling.
#[must_use]
pub fn encode_frame(sample: &MetricSample) -> Bytes {
    let fields = fields_for(sample.machine_class);

    let mut present_bits: u16 = 0;
    for entry in fields {
        if entry.slot.load(sample, entry.resolution).is_some() {
            present_bits |= 1 << entry.bit;
        }
    }
    let flags = present_bits ^ MORE_DATA_FLAG;

    let mut buf = BytesMut::with_capacity(frame_len(sample.machine_class, flags));
    buf.put_u16_le(flags);
    for entry in fields {
        if group_present(flags, entry.bit) {
            let value = entry.slot.load(sample, entry.resolution).unwrap_or(0);
            entry.width.write(&mut buf, value);
        }
    }
    buf.freeze()
}

/// A decoded Heart Rate Measurement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartRateReading {
    /// Heart rate in bpm as sent, possibly wider than a byte
    pub bpm: u16,
    /// Instant the reading was received
    pub at: Instant,
}

/// Decode a Heart Rate Measurement frame received at `at`
///
/// Sensor contact, energy expended and RR-interval fields are ignored.
///
/// # Errors
///
/// Returns `DecodeError::Empty` or `DecodeError::Truncated` when the value
/// announced by the flag byte is missing.
pub fn decode_heart_rate(raw: &[u8], at: Instant) -> Result<HeartRateReading, DecodeError> {
    let mut buf = raw;
    if !buf.has_remaining() {
        return Err(DecodeError::Empty);
    }
    let flags = buf.get_u8();

    let (needed, field) = if flags & HR_VALUE_U16 != 0 {
        (2, "heart_rate_u16")
    } else {
        (1, "heart_rate_u8")
    };
    if buf.remaining() < needed {
        return Err(DecodeError::Truncated {
            field,
            needed,
            remaining: buf.remaining(),
        });
    }

    let bpm = if needed == 2 {
        buf.get_u16_le()
    } else {
        u16::from(buf.get_u8())
    };
    Ok(HeartRateReading { bpm, at })
}

/// Encode a Heart Rate Measurement frame, using the 8-bit form when it fits
#[must_use]
pub fn encode_heart_rate(bpm: u16) -> Bytes {
    let mut buf = BytesMut::with_capacity(3);
    match u8::try_from(bpm) {
        Ok(value) => {
            buf.put_u8(0);
            buf.put_u8(value);
        }
        Err(_) => {
            buf.put_u8(HR_VALUE_U16);
            buf.put_u16_le(bpm);
        }
    }
    buf.freeze()
}
