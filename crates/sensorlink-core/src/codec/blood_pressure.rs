//! Blood Pressure Measurement (0x2A35) and Intermediate Cuff Pressure (0x2A36).
//!
//! Both characteristics share one layout. For the intermediate variant the
//! sensor puts the current cuff pressure in `systolic` and sends NaN for the
//! other two compound values.

use bitflags::bitflags;
use serde::Serialize;

use super::{DecodeError, GattDateTime, Reader, SFloat, Writer};

const CONTEXT: &str = "blood pressure measurement";

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Flags: u8 {
        const UNIT_KPA = 1 << 0;
        const TIMESTAMP = 1 << 1;
        const PULSE_RATE = 1 << 2;
        const USER_ID = 1 << 3;
        const MEASUREMENT_STATUS = 1 << 4;
    }
}

/// Unit of the three compound pressure values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PressureUnit {
    /// Millimetres of mercury.
    MmHg,
    /// Kilopascal.
    KPa,
}

bitflags! {
    /// Measurement Status bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MeasurementStatus: u16 {
        /// Body movement detected during measurement.
        const BODY_MOVEMENT = 1 << 0;
        /// Cuff fit too loose.
        const CUFF_TOO_LOOSE = 1 << 1;
        /// Irregular pulse detected.
        const IRREGULAR_PULSE = 1 << 2;
        /// Pulse rate exceeds upper limit.
        const PULSE_RATE_HIGH = 1 << 3;
        /// Pulse rate below lower limit.
        const PULSE_RATE_LOW = 1 << 4;
        /// Improper measurement position.
        const IMPROPER_POSITION = 1 << 5;
    }
}

/// A blood pressure or intermediate cuff pressure record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BloodPressureMeasurement {
    /// Unit of `systolic`, `diastolic` and `mean_arterial_pressure`.
    pub unit: PressureUnit,
    /// Systolic pressure, or current cuff pressure for intermediate values.
    pub systolic: SFloat,
    /// Diastolic pressure.
    pub diastolic: SFloat,
    /// Mean arterial pressure.
    pub mean_arterial_pressure: SFloat,
    /// When the measurement was taken.
    pub timestamp: Option<GattDateTime>,
    /// Beats per minute.
    pub pulse_rate: Option<SFloat>,
    /// User index on multi-user devices; 0xFF means unknown.
    pub user_id: Option<u8>,
    /// Raw Measurement Status field; see [`Self::status_flags`].
    pub status: Option<u16>,
}

impl BloodPressureMeasurement {
    /// Cuff pressure for an intermediate record.
    #[must_use]
    pub const fn cuff_pressure(&self) -> SFloat {
        self.systolic
    }

    /// Measurement status as flags. Unknown bits are retained.
    #[must_use]
    pub fn status_flags(&self) -> Option<MeasurementStatus> {
        self.status.map(MeasurementStatus::from_bits_retain)
    }
}

/// Decode a Blood Pressure Measurement or Intermediate Cuff Pressure.
///
/// # Errors
///
/// Returns [`DecodeError`] if the payload is shorter than its flags require
/// or carries trailing bytes.
pub fn decode(data: &[u8]) -> Result<BloodPressureMeasurement, DecodeError> {
    let mut reader = Reader::new(data, CONTEXT);
    let flags = Flags::from_bits_retain(reader.u8()?);

    let unit = if flags.contains(Flags::UNIT_KPA) {
        PressureUnit::KPa
    } else {
        PressureUnit::MmHg
    };
    let systolic = reader.sfloat()?;
    let diastolic = reader.sfloat()?;
    let mean_arterial_pressure = reader.sfloat()?;
    let timestamp = if flags.contains(Flags::TIMESTAMP) {
        Some(reader.date_time()?)
    } else {
        None
    };
    let pulse_rate = if flags.contains(Flags::PULSE_RATE) {
        Some(reader.sfloat()?)
    } else {
        None
    };
    let user_id = if flags.contains(Flags::USER_ID) {
        Some(reader.u8()?)
    } else {
        None
    };
    let status = if flags.contains(Flags::MEASUREMENT_STATUS) {
        Some(reader.u16()?)
    } else {
        None
    };
    reader.finish()?;

    Ok(BloodPressureMeasurement {
        unit,
        systolic,
        diastolic,
        mean_arterial_pressure,
        timestamp,
        pulse_rate,
        user_id,
        status,
    })
}

/// Encode a blood pressure record.
#[must_use]
pub fn encode(measurement: &BloodPressureMeasurement) -> Vec<u8> {
    let mut flags = Flags::empty();
    flags.set(Flags::UNIT_KPA, measurement.unit == PressureUnit::KPa);
    flags.set(Flags::TIMESTAMP, measurement.timestamp.is_some());
    flags.set(Flags::PULSE_RATE, measurement.pulse_rate.is_some());
    flags.set(Flags::USER_ID, measurement.user_id.is_some());
    flags.set(Flags::MEASUREMENT_STATUS, measurement.status.is_some());

    let mut writer = Writer::default();
    writer
        .u8(flags.bits())
        .sfloat(measurement.systolic)
        .sfloat(measurement.diastolic)
        .sfloat(measurement.mean_arterial_pressure);
    if let Some(timestamp) = &measurement.timestamp {
        writer.date_time(timestamp);
    }
    if let Some(pulse) = measurement.pulse_rate {
        writer.sfloat(pulse);
    }
    if let Some(user) = measurement.user_id {
        writer.u8(user);
    }
    if let Some(status) = measurement.status {
        writer.u16(status);
    }
    writer.into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sf(mantissa: i16, exponent: i8) -> SFloat {
        SFloat::new(mantissa, exponent).unwrap()
    }

    #[test]
    fn test_decode_minimal_mmhg() {
        // systolic 120, diastolic 80, MAP 93
        let data = [0x00, 0x78, 0x00, 0x50, 0x00, 0x5D, 0x00];
        let m = decode(&data).unwrap();
        assert_eq!(m.unit, PressureUnit::MmHg);
        assert_eq!(m.systolic.value(), 120.0);
        assert_eq!(m.diastolic.value(), 80.0);
        assert_eq!(m.mean_arterial_pressure.value(), 93.0);
        assert!(m.timestamp.is_none());
        assert!(m.pulse_rate.is_none());
        assert!(m.user_id.is_none());
        assert!(m.status.is_none());
    }

    #[test]
    fn test_decode_all_fields() {
        let data = [
            0x1F, // all flags, kPa
            0x00, 0xF0, // systolic mantissa 0 exp -1
            0x01, 0x00, // diastolic 1
            0x02, 0x00, // MAP 2
            0xE8, 0x07, 0x03, 0x0F, 0x08, 0x1E, 0x00, // 2024-03-15 08:30:00
            0x48, 0x00, // pulse 72
            0x02, // user 2
            0x05, 0x00, // body movement + irregular pulse
        ];
        let m = decode(&data).unwrap();
        assert_eq!(m.unit, PressureUnit::KPa);
        assert_eq!(m.timestamp.unwrap().year, 2024);
        assert_eq!(m.timestamp.unwrap().minutes, 30);
        assert_eq!(m.pulse_rate.unwrap().value(), 72.0);
        assert_eq!(m.user_id, Some(2));
        let status = m.status_flags().unwrap();
        assert!(status.contains(MeasurementStatus::BODY_MOVEMENT));
        assert!(status.contains(MeasurementStatus::IRREGULAR_PULSE));
        assert!(!status.contains(MeasurementStatus::CUFF_TOO_LOOSE));
    }

    #[test]
    fn test_decode_rejects_truncated_optional_field() {
        // pulse flag set but no pulse bytes
        let data = [0x04, 0x78, 0x00, 0x50, 0x00, 0x5D, 0x00];
        assert!(matches!(decode(&data), Err(DecodeError::TooShort { .. })));
        assert!(decode(&[0x00, 0x78]).is_err());
    }

    #[test]
    fn test_intermediate_cuff_pressure_uses_nan() {
        let m = BloodPressureMeasurement {
            unit: PressureUnit::MmHg,
            systolic: sf(145, 0),
            diastolic: SFloat::NAN,
            mean_arterial_pressure: SFloat::NAN,
            timestamp: None,
            pulse_rate: None,
            user_id: None,
            status: None,
        };
        let decoded = decode(&encode(&m)).unwrap();
        assert_eq!(decoded.cuff_pressure().value(), 145.0);
        assert!(decoded.diastolic.value().is_nan());
    }

    #[test]
    fn test_round_trip_boundaries() {
        let cases = [
            BloodPressureMeasurement {
                unit: PressureUnit::MmHg,
                systolic: sf(0, 0),
                diastolic: sf(0, 0),
                mean_arterial_pressure: sf(0, 0),
                timestamp: None,
                pulse_rate: None,
                user_id: None,
                status: None,
            },
            BloodPressureMeasurement {
                unit: PressureUnit::KPa,
                systolic: sf(2047, 7),
                diastolic: sf(-2048, -8),
                mean_arterial_pressure: sf(160, -1),
                timestamp: Some(GattDateTime {
                    year: 9999,
                    month: 12,
                    day: 31,
                    hours: 23,
                    minutes: 59,
                    seconds: 59,
                }),
                pulse_rate: Some(sf(255, 0)),
                user_id: Some(u8::MAX),
                status: Some(u16::MAX),
            },
        ];
        for m in cases {
            assert_eq!(decode(&encode(&m)).unwrap(), m);
        }
    }
}
