//! Garmin FIT binary primitives.
//!
//! A FIT file is a 14-byte header, a stream of definition and data messages,
//! and a trailing CRC-16 over everything before it. Definition messages bind a
//! local message number (0 to 15) to a global message and its field layout;
//! data messages then carry raw field values in that layout. All multi-byte
//! values are written little-endian.
//!
//! [`FitWriter`] produces files. Reading them back goes through `fitparser`,
//! see [`crate::export::decode_activity`].

use crate::error::EncodeError;
use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, FixedOffset, TimeZone, Utc};

/// Size of the header written by [`FitWriter`]
pub const HEADER_SIZE: u8 = 14;

/// FIT protocol version 2.0
pub const PROTOCOL_VERSION: u8 = 0x20;

/// FIT profile version 21.32
pub const PROFILE_VERSION: u16 = 2132;

/// Seconds between the Unix epoch and the FIT epoch (1989-12-31T00:00:00Z)
pub const FIT_EPOCH_OFFSET: i64 = 631_065_600;

/// Record header bit marking a definition message
const DEFINITION_FLAG: u8 = 0x40;

/// Global message numbers
pub mod mesg_num {
    /// `file_id`
    pub const FILE_ID: u16 = 0;
    /// `session`
    pub const SESSION: u16 = 18;
    /// `lap`
    pub const LAP: u16 = 19;
    /// `record`
    pub const RECORD: u16 = 20;
    /// `event`
    pub const EVENT: u16 = 21;
    /// `device_info`
    pub const DEVICE_INFO: u16 = 23;
    /// `activity`
    pub const ACTIVITY: u16 = 34;
}

/// FIT base types used by this crate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BaseType {
    /// enum
    Enum = 0x00,
    /// sint8
    SInt8 = 0x01,
    /// uint8
    UInt8 = 0x02,
    /// string
    String = 0x07,
    /// uint8z
    UInt8z = 0x0A,
    /// sint16
    SInt16 = 0x83,
    /// uint16
    UInt16 = 0x84,
    /// sint32
    SInt32 = 0x85,
    /// uint32
    UInt32 = 0x86,
    /// uint16z
    UInt16z = 0x8B,
    /// uint32z
    UInt32z = 0x8C,
}

impl BaseType {
    /// Wire code
    #[must_use]
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Size of one value in bytes
    #[must_use]
    pub const fn size(self) -> u8 {
        match self {
            Self::Enum | Self::SInt8 | Self::UInt8 | Self::String | Self::UInt8z => 1,
            Self::SInt16 | Self::UInt16 | Self::UInt16z => 2,
            Self::SInt32 | Self::UInt32 | Self::UInt32z => 4,
        }
    }

    /// The invalid sentinel marking an absent value
    #[must_use]
    pub const fn invalid(self) -> i64 {
        match self {
            Self::Enum | Self::UInt8 => 0xFF,
            Self::SInt8 => 0x7F,
            Self::SInt16 => 0x7FFF,
            Self::UInt16 => 0xFFFF,
            Self::SInt32 => 0x7FFF_FFFF,
            Self::UInt32 => 0xFFFF_FFFF,
            Self::String | Self::UInt8z | Self::UInt16z | Self::UInt32z => 0,
        }
    }

    /// Smallest and largest valid values
    const fn valid_range(self) -> (i64, i64) {
        match self {
            Self::Enum | Self::UInt8 => (0, 0xFE),
            Self::SInt8 => (-0x80, 0x7E),
            Self::SInt16 => (-0x8000, 0x7FFE),
            Self::UInt16 => (0, 0xFFFE),
            Self::SInt32 => (-0x8000_0000, 0x7FFF_FFFE),
            Self::UInt32 => (0, 0xFFFF_FFFE),
            Self::String | Self::UInt8z => (1, 0xFF),
            Self::UInt16z => (1, 0xFFFF),
            Self::UInt32z => (1, 0xFFFF_FFFF),
        }
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn put(self, buf: &mut BytesMut, raw: i64) {
        match self.size() {
            1 => buf.put_u8(raw as u8),
            2 => buf.put_u16_le(raw as u16),
            _ => buf.put_u32_le(raw as u32),
        }
    }
}

/// One field of a message layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDef {
    /// Field definition number within the global message
    pub number: u8,
    /// Base type of the field
    pub base_type: BaseType,
    /// Profile name, used in diagnostics
    pub name: &'static str,
}

impl FieldDef {
    /// Describe a field
    #[must_use]
    pub const fn new(number: u8, name: &'static str, base_type: BaseType) -> Self {
        Self {
            number,
            base_type,
            name,
        }
    }
}

/// Static layout of one global message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageDef {
    /// Global message number
    pub global: u16,
    /// Local message number the layout is bound to
    pub local: u8,
    /// Fields in wire order
    pub fields: &'static [FieldDef],
}

impl MessageDef {
    /// Bytes in one data message, excluding the record header
    #[must_use]
    pub fn data_len(&self) -> usize {
        self.fields.iter().map(|f| usize::from(f.base_type.size())).sum()
    }
}

/// Accumulate `bytes` into a FIT CRC-16
#[must_use]
pub fn crc16(init: u16, bytes: &[u8]) -> u16 {
    bytes.iter().fold(init, |crc, byte| crc_byte(crc, *byte))
}

fn crc_byte(mut crc: u16, byte: u8) -> u16 {
    const CRC_TABLE: [u16; 16] = [
        0x0000, 0xCC01, 0xD801, 0x1400, 0xF001, 0x3C00, 0x2800, 0xE401, 0xA001, 0x6C00, 0x7800,
        0xB401, 0x5000, 0x9C01, 0x8801, 0x4400,
    ];

    for nibble in [byte & 0x0F, byte >> 4] {
        let tmp = CRC_TABLE[usize::from(crc & 0x0F)];
        crc = (crc >> 4) & 0x0FFF;
        crc ^= tmp ^ CRC_TABLE[usize::from(nibble)];
    }
    crc
}

/// Convert a wall-clock time into FIT seconds
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn to_fit_timestamp(time: DateTime<Utc>) -> u32 {
    (time.timestamp() - FIT_EPOCH_OFFSET).clamp(0, i64::from(u32::MAX - 1)) as u32
}

/// Convert FIT seconds back into wall-clock time
#[must_use]
pub fn from_fit_timestamp(seconds: u32) -> DateTime<Utc> {
    Utc.timestamp_opt(FIT_EPOCH_OFFSET + i64::from(seconds), 0)
        .single()
        .unwrap_or(DateTime::UNIX_EPOCH)
}

/// FIT seconds of `time` as read on a wall clock at `offset`
///
/// This is the `local_date_time` encoding: the UTC timestamp shifted by the
/// offset east of Greenwich.
#[must_use]
pub fn to_local_fit_timestamp(time: DateTime<Utc>, offset: FixedOffset) -> u32 {
    to_fit_timestamp(time + chrono::Duration::seconds(i64::from(offset.local_minus_utc())))
}

/// Streaming writer for FIT activity files
///
/// Definitions are emitted lazily: the first message written on a local
/// number, or a message whose global number differs from the one currently
/// bound to it, is preceded by its definition.
#[derive(Debug, Default)]
pub struct FitWriter {
    data: BytesMut,
    bound: [Option<u16>; 16],
    messages: usize,
}

impl FitWriter {
    /// Create an empty writer
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Data messages written so far
    #[must_use]
    pub const fn message_count(&self) -> usize {
        self.messages
    }

    /// Write one data message
    ///
    /// `values` pairs with `def.fields`; `None`, or a missing trailing value,
    /// is written as the field's invalid sentinel. Values outside the base
    /// type's valid range are clamped into it.
    pub fn write(&mut self, def: &MessageDef, values: &[Option<i64>]) {
        let local = def.local & 0x0F;
        if self.bound[usize::from(local)] != Some(def.global) {
            self.define(local, def);
        }

        self.data.put_u8(local);
        for (i, field) in def.fields.iter().enumerate() {
            let raw = values.get(i).copied().flatten().map_or_else(
                || field.base_type.invalid(),
                |value| {
                    let (min, max) = field.base_type.valid_range();
                    value.clamp(min, max)
                },
            );
            field.base_type.put(&mut self.data, raw);
        }
        self.messages += 1;
    }

    #[allow(clippy::cast_possible_truncation)]
    fn define(&mut self, local: u8, def: &MessageDef) {
        self.data.put_u8(DEFINITION_FLAG | local);
        self.data.put_u8(0); // reserved
        self.data.put_u8(0); // little-endian
        self.data.put_u16_le(def.global);
        self.data.put_u8(def.fields.len() as u8);
        for field in def.fields {
            self.data.put_u8(field.number);
            self.data.put_u8(field.base_type.size());
            self.data.put_u8(field.base_type.code());
        }
        self.bound[usize::from(local)] = Some(def.global);
    }

    /// Frame the messages with header and CRC
    ///
    /// # Errors
    ///
    /// Returns `EncodeError::TooLarge` when the data does not fit the 32-bit
    /// size field.
    pub fn finish(self) -> Result<Bytes, EncodeError> {
        let data_size =
            u32::try_from(self.data.len()).map_err(|_| EncodeError::TooLarge(self.data.len()))?;

        let mut out = BytesMut::with_capacity(usize::from(HEADER_SIZE) + self.data.len() + 2);
        out.put_u8(HEADER_SIZE);
        out.put_u8(PROTOCOL_VERSION);
        out.put_u16_le(PROFILE_VERSION);
        out.put_u32_le(data_size);
        out.put_slice(b".FIT");
        let header_crc = crc16(0, &out);
        out.put_u16_le(header_crc);

        out.put_slice(&self.data);
        let file_crc = crc16(0, &out);
        out.put_u16_le(file_crc);
        Ok(out.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fitparser::{profile::MesgNum, FitDataRecord, Value};

    const TEST_FIELDS: &[FieldDef] = &[
        FieldDef::new(253, "timestamp", BaseType::UInt32),
        FieldDef::new(3, "heart_rate", BaseType::UInt8),
        FieldDef::new(7, "power", BaseType::UInt16),
        FieldDef::new(13, "temperature", BaseType::SInt8),
        FieldDef::new(33, "calories", BaseType::UInt16),
    ];

    const TEST_MESSAGE: MessageDef = MessageDef {
        global: mesg_num::RECORD,
        local: 3,
        fields: TEST_FIELDS,
    };

    fn value(record: &FitDataRecord, number: u8) -> Option<&Value> {
        record
            .fields()
            .iter()
            .find(|f| f.number() == number)
            .map(fitparser::FitDataField::value)
    }

    #[test]
    fn test_crc_reference_vector() {
        // CRC-16/ARC check value
        assert_eq!(crc16(0, b"123456789"), 0xBB3D);
        assert_eq!(crc16(0, &[]), 0);

        let mut framed = b"123456789".to_vec();
        framed.extend_from_slice(&0xBB3D_u16.to_le_bytes());
        assert_eq!(crc16(0, &framed), 0);
    }

    #[test]
    fn test_base_type_sentinels() {
        assert_eq!(BaseType::UInt16.code(), 0x84);
        assert_eq!(BaseType::UInt32z.code(), 0x8C);
        assert_eq!(BaseType::UInt16.invalid(), 0xFFFF);
        assert_eq!(BaseType::SInt16.invalid(), 0x7FFF);
        assert_eq!(BaseType::UInt32z.invalid(), 0);
        assert_eq!(BaseType::SInt8.valid_range(), (-0x80, 0x7E));
        assert_eq!(BaseType::UInt16z.valid_range(), (1, 0xFFFF));
    }

    #[test]
    fn test_header_layout() {
        let bytes = FitWriter::new().finish().unwrap();
        assert_eq!(bytes.len(), 16);
        assert_eq!(bytes[0], 14);
        assert_eq!(bytes[1], 0x20);
        assert_eq!(&bytes[4..8], &[0, 0, 0, 0]);
        assert_eq!(&bytes[8..12], b".FIT");
        assert_eq!(
            u16::from_le_bytes([bytes[12], bytes[13]]),
            crc16(0, &bytes[..12])
        );
    }

    #[test]
    fn test_written_file_reads_back_with_fitparser() {
        let mut writer = FitWriter::new();
        writer.write(&TEST_MESSAGE, &[Some(1000), Some(140), Some(250), Some(-5), Some(77)]);
        writer.write(&TEST_MESSAGE, &[Some(1001), None, Some(70_000), None]);
        assert_eq!(writer.message_count(), 2);
        let bytes = writer.finish().unwrap();

        let records = fitparser::from_bytes(&bytes).unwrap();
        assert_eq!(records.len(), 2);

        let first = &records[0];
        assert_eq!(first.kind(), MesgNum::Record);
        match value(first, 253) {
            Some(Value::Timestamp(at)) => {
                assert_eq!(at.with_timezone(&Utc), from_fit_timestamp(1000));
            }
            other => panic!("unexpected timestamp {other:?}"),
        }
        assert_eq!(value(first, 3), Some(&Value::UInt8(140)));
        assert_eq!(value(first, 7), Some(&Value::UInt16(250)));
        assert_eq!(value(first, 13), Some(&Value::SInt8(-5)));
        assert_eq!(value(first, 33), Some(&Value::UInt16(77)));

        // sentinels are dropped by the reader
        let second = &records[1];
        assert_eq!(value(second, 3), None);
        assert_eq!(value(second, 13), None);
        assert_eq!(value(second, 33), None);
        // clamped below the sentinel
        assert_eq!(value(second, 7), Some(&Value::UInt16(0xFFFE)));
    }

    #[test]
    fn test_definition_written_once_per_binding() {
        let mut writer = FitWriter::new();
        writer.write(&TEST_MESSAGE, &[]);
        writer.write(&TEST_MESSAGE, &[]);
        let bytes = writer.finish().unwrap();

        let definition_len = 6 + 3 * TEST_FIELDS.len();
        let data_len = 1 + TEST_MESSAGE.data_len();
        assert_eq!(bytes.len(), 16 + definition_len + 2 * data_len);
    }

    #[test]
    fn test_checksums_reject_corruption() {
        let mut writer = FitWriter::new();
        writer.write(&TEST_MESSAGE, &[Some(1)]);
        let bytes = writer.finish().unwrap().to_vec();
        assert!(fitparser::from_bytes(&bytes).is_ok());

        let mut flipped = bytes.clone();
        flipped[20] ^= 0xFF;
        let error = fitparser::from_bytes(&flipped).unwrap_err();
        assert!(error.to_string().contains("CRC"), "{error}");

        let mut bad_header = bytes.clone();
        bad_header[12] ^= 0xFF;
        assert!(fitparser::from_bytes(&bad_header).is_err());

        assert!(fitparser::from_bytes(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn test_fit_timestamp_conversion() {
        let epoch = Utc.with_ymd_and_hms(1989, 12, 31, 0, 0, 0).unwrap();
        assert_eq!(to_fit_timestamp(epoch), 0);

        let time = Utc.with_ymd_and_hms(2024, 3, 1, 7, 30, 0).unwrap();
        assert_eq!(from_fit_timestamp(to_fit_timestamp(time)), time);
    }

    #[test]
    fn test_local_timestamp_applies_offset() {
        let time = Utc.with_ymd_and_hms(2024, 3, 1, 7, 30, 0).unwrap();
        let utc = to_fit_timestamp(time);

        let paris = FixedOffset::east_opt(3600).unwrap();
        assert_eq!(to_local_fit_timestamp(time, paris), utc + 3600);

        let new_york = FixedOffset::west_opt(5 * 3600).unwrap();
        assert_eq!(to_local_fit_timestamp(time, new_york), utc - 5 * 3600);

        let zero = FixedOffset::east_opt(0).unwrap();
        assert_eq!(to_local_fit_timestamp(time, zero), utc);
    }
}
