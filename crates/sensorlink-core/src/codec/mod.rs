//! Pure decoders and encoders for the supported GATT measurement formats.
//!
//! Every decoder reads a leading flags field, then walks the optional fields
//! that the flags enable at increasing offsets. All multi-byte integers are
//! little-endian. Medical values use the IEEE-11073 16-bit SFLOAT and 32-bit
//! FLOAT encodings and are kept as exact mantissa/exponent pairs
//! ([`SFloat`], [`Float32`]) so that `decode(encode(x)) == x` holds; converting
//! to display units is a separate step (see [`crate::units`]).
//!
//! Decoding is total: short or malformed buffers yield a [`DecodeError`] and
//! never panic or silently truncate.
//!
//! | Module | Characteristic(s) |
//! |---|---|
//! | [`heart_rate`] | Heart Rate Measurement, Body Sensor Location |
//! | [`blood_pressure`] | Blood Pressure Measurement, Intermediate Cuff Pressure |
//! | [`csc`] | CSC Measurement (+ derived speed/cadence) |
//! | [`rsc`] | RSC Measurement |
//! | [`thermometer`] | Temperature Measurement, Intermediate Temperature |
//! | [`cgm`] | CGM Measurement, CGM Feature, CGM Session Start Time |
//! | [`battery`] | Battery Level |

pub mod battery;
pub mod blood_pressure;
pub mod cgm;
pub mod csc;
pub mod heart_rate;
pub mod rsc;
pub mod sfloat;
pub mod thermometer;

use serde::Serialize;
use thiserror::Error;

pub use self::blood_pressure::BloodPressureMeasurement;
pub use self::cgm::{CgmFeature, CgmMeasurement, SessionStartTime};
pub use self::csc::{CscCalculator, CscMeasurement, CscMetrics};
pub use self::heart_rate::{BodySensorLocation, HeartRateMeasurement};
pub use self::rsc::RscMeasurement;
pub use self::sfloat::{Float32, GattDateTime, SFloat};
pub use self::thermometer::TemperatureMeasurement;

/// Malformed measurement payload.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The buffer ended before a field the flags announced.
    #[error("{context}: expected at least {expected} bytes, got {actual}")]
    TooShort {
        /// Characteristic being decoded.
        context: &'static str,
        /// Bytes needed to read the next field.
        expected: usize,
        /// Bytes available.
        actual: usize,
    },

    /// Bytes were left over after every announced field was read.
    #[error("{context}: {count} unexpected trailing byte(s)")]
    TrailingBytes {
        /// Characteristic being decoded.
        context: &'static str,
        /// Number of unread bytes.
        count: usize,
    },

    /// A field holds a value outside its defined range.
    #[error("{context}: invalid {field} value {value}")]
    InvalidValue {
        /// Characteristic being decoded.
        context: &'static str,
        /// Field name.
        field: &'static str,
        /// Raw value.
        value: u32,
    },

    /// A size-prefixed record disagrees with its own flags.
    #[error("{context}: record size {size} does not match its flags (expected {expected})")]
    SizeMismatch {
        /// Characteristic being decoded.
        context: &'static str,
        /// Size announced by the record.
        size: usize,
        /// Size implied by the flags.
        expected: usize,
    },

    /// E2E-CRC check failed.
    #[error("{context}: CRC mismatch (computed {computed:#06x}, received {received:#06x})")]
    CrcMismatch {
        /// Characteristic being decoded.
        context: &'static str,
        /// CRC over the received bytes.
        computed: u16,
        /// CRC carried by the payload.
        received: u16,
    },
}

/// A decoded characteristic value, as surfaced to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Measurement {
    /// Heart Rate Measurement notification.
    HeartRate(HeartRateMeasurement),
    /// Body Sensor Location read.
    BodySensorLocation(BodySensorLocation),
    /// Final blood pressure reading.
    BloodPressure(BloodPressureMeasurement),
    /// Cuff pressure while the measurement is in progress.
    IntermediateCuffPressure(BloodPressureMeasurement),
    /// Raw CSC revolution counters.
    CyclingSpeedCadence(CscMeasurement),
    /// Speed/cadence derived from two consecutive CSC measurements.
    CyclingMetrics(CscMetrics),
    /// RSC Measurement notification.
    RunningSpeedCadence(RscMeasurement),
    /// Final temperature reading.
    Temperature(TemperatureMeasurement),
    /// Temperature while the measurement is in progress.
    IntermediateTemperature(TemperatureMeasurement),
    /// Live CGM measurement (records retrieved through RACP arrive as
    /// retrieval events instead).
    Glucose(CgmMeasurement),
    /// CGM Feature read.
    CgmFeature(CgmFeature),
    /// CGM Session Start Time read.
    CgmSessionStartTime(SessionStartTime),
    /// Battery Level, percent.
    BatteryLevel(u8),
}

/// Decoder selector for single-record characteristics.
///
/// Built once per session at discovery time and stored in the handler table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MeasurementKind {
    /// Heart Rate Measurement.
    HeartRate,
    /// Body Sensor Location.
    BodySensorLocation,
    /// Blood Pressure Measurement.
    BloodPressure,
    /// Intermediate Cuff Pressure.
    IntermediateCuffPressure,
    /// CSC Measurement.
    CyclingSpeedCadence,
    /// RSC Measurement.
    RunningSpeedCadence,
    /// Temperature Measurement.
    Temperature,
    /// Intermediate Temperature.
    IntermediateTemperature,
    /// Battery Level.
    BatteryLevel,
}

impl MeasurementKind {
    /// Decode `data` into the matching [`Measurement`] variant.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError`] if the payload is malformed.
    pub fn decode(self, data: &[u8]) -> Result<Measurement, DecodeError> {
        Ok(match self {
            Self::HeartRate => Measurement::HeartRate(heart_rate::decode(data)?),
            Self::BodySensorLocation => {
                Measurement::BodySensorLocation(heart_rate::decode_body_sensor_location(data)?)
            }
            Self::BloodPressure => Measurement::BloodPressure(blood_pressure::decode(data)?),
            Self::IntermediateCuffPressure => {
                Measurement::IntermediateCuffPressure(blood_pressure::decode(data)?)
            }
            Self::CyclingSpeedCadence => Measurement::CyclingSpeedCadence(csc::decode(data)?),
            Self::RunningSpeedCadence => Measurement::RunningSpeedCadence(rsc::decode(data)?),
            Self::Temperature => Measurement::Temperature(thermometer::decode(data)?),
            Self::IntermediateTemperature => {
                Measurement::IntermediateTemperature(thermometer::decode(data)?)
            }
            Self::BatteryLevel => Measurement::BatteryLevel(battery::decode(data)?),
        })
    }
}

// ── Byte cursor ──────────────────────────────────────────────────────────────

/// Little-endian cursor over a payload. Every read is bounds-checked.
pub(crate) struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
    context: &'static str,
}

impl<'a> Reader<'a> {
    pub(crate) const fn new(data: &'a [u8], context: &'static str) -> Self {
        Self {
            data,
            offset: 0,
            context,
        }
    }

    pub(crate) const fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    pub(crate) const fn context(&self) -> &'static str {
        self.context
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let end = self.offset + N;
        let bytes = self
            .data
            .get(self.offset..end)
            .ok_or(DecodeError::TooShort {
                context: self.context,
                expected: end,
                actual: self.data.len(),
            })?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        self.offset = end;
        Ok(out)
    }

    pub(crate) fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take::<1>()?[0])
    }

    pub(crate) fn i8(&mut self) -> Result<i8, DecodeError> {
        Ok(i8::from_le_bytes(self.take::<1>()?))
    }

    pub(crate) fn u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.take::<2>()?))
    }

    pub(crate) fn u24(&mut self) -> Result<u32, DecodeError> {
        let [a, b, c] = self.take::<3>()?;
        Ok(u32::from_le_bytes([a, b, c, 0]))
    }

    pub(crate) fn u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.take::<4>()?))
    }

    pub(crate) fn sfloat(&mut self) -> Result<SFloat, DecodeError> {
        Ok(SFloat::from_raw(self.u16()?))
    }

    pub(crate) fn float32(&mut self) -> Result<Float32, DecodeError> {
        Ok(Float32::from_raw(self.u32()?))
    }

    pub(crate) fn date_time(&mut self) -> Result<GattDateTime, DecodeError> {
        Ok(GattDateTime {
            year: self.u16()?,
            month: self.u8()?,
            day: self.u8()?,
            hours: self.u8()?,
            minutes: self.u8()?,
            seconds: self.u8()?,
        })
    }

    /// Fail if anything is left unread.
    pub(crate) fn finish(self) -> Result<(), DecodeError> {
        match self.remaining() {
            0 => Ok(()),
            count => Err(DecodeError::TrailingBytes {
                context: self.context,
                count,
            }),
        }
    }
}

/// Little-endian payload builder, the mirror of [`Reader`].
#[derive(Default)]
pub(crate) struct Writer(Vec<u8>);

impl Writer {
    pub(crate) fn u8(&mut self, value: u8) -> &mut Self {
        self.0.push(value);
        self
    }

    pub(crate) fn i8(&mut self, value: i8) -> &mut Self {
        self.0.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub(crate) fn u16(&mut self, value: u16) -> &mut Self {
        self.0.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub(crate) fn u24(&mut self, value: u32) -> &mut Self {
        self.0.extend_from_slice(&value.to_le_bytes()[..3]);
        self
    }

    pub(crate) fn u32(&mut self, value: u32) -> &mut Self {
        self.0.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub(crate) fn sfloat(&mut self, value: SFloat) -> &mut Self {
        self.u16(value.to_raw())
    }

    pub(crate) fn float32(&mut self, value: Float32) -> &mut Self {
        self.u32(value.to_raw())
    }

    pub(crate) fn date_time(&mut self, value: &GattDateTime) -> &mut Self {
        self.u16(value.year)
            .u8(value.month)
            .u8(value.day)
            .u8(value.hours)
            .u8(value.minutes)
            .u8(value.seconds)
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        &self.0
    }

    pub(crate) fn into_inner(self) -> Vec<u8> {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reader_reports_needed_length() {
        let mut reader = Reader::new(&[0x01], "test");
        assert_eq!(reader.u8().unwrap(), 0x01);
        assert_eq!(
            reader.u16(),
            Err(DecodeError::TooShort {
                context: "test",
                expected: 3,
                actual: 1
            })
        );
    }

    #[test]
    fn test_reader_little_endian_widths() {
        let mut reader = Reader::new(&[0x34, 0x12, 0x56, 0x34, 0x12, 0x78, 0x56, 0x34, 0x12], "t");
        assert_eq!(reader.u16().unwrap(), 0x1234);
        assert_eq!(reader.u24().unwrap(), 0x12_3456);
        assert_eq!(reader.u32().unwrap(), 0x1234_5678);
        assert!(reader.finish().is_ok());
    }

    #[test]
    fn test_reader_finish_rejects_trailing_bytes() {
        let reader = Reader::new(&[0x00, 0x00], "t");
        assert_eq!(
            reader.finish(),
            Err(DecodeError::TrailingBytes {
                context: "t",
                count: 2
            })
        );
    }

    #[test]
    fn test_writer_mirrors_reader() {
        let mut writer = Writer::default();
        writer.u8(0xAB).u16(0x1234).u24(0x00AB_CDEF).i8(-2);
        let bytes = writer.into_inner();
        assert_eq!(bytes, vec![0xAB, 0x34, 0x12, 0xEF, 0xCD, 0xAB, 0xFE]);

        let mut reader = Reader::new(&bytes, "t");
        assert_eq!(reader.u8().unwrap(), 0xAB);
        assert_eq!(reader.u16().unwrap(), 0x1234);
        assert_eq!(reader.u24().unwrap(), 0x00AB_CDEF);
        assert_eq!(reader.i8().unwrap(), -2);
    }

    #[test]
    fn test_measurement_kind_dispatch() {
        let m = MeasurementKind::BatteryLevel.decode(&[87]).unwrap();
        assert_eq!(m, Measurement::BatteryLevel(87));

        let m = MeasurementKind::HeartRate.decode(&[0x00, 72]).unwrap();
        assert!(matches!(m, Measurement::HeartRate(hr) if hr.heart_rate == 72));

        assert!(MeasurementKind::Temperature.decode(&[]).is_err());
    }
}
