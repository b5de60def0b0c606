//! Heart Rate Measurement (0x2A37) and Body Sensor Location (0x2A38).

use bitflags::bitflags;
use serde::Serialize;

use super::{DecodeError, Reader, Writer};

const CONTEXT: &str = "heart rate measurement";

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Flags: u8 {
        const RATE_U16 = 1 << 0;
        const SENSOR_CONTACT_DETECTED = 1 << 1;
        const SENSOR_CONTACT_SUPPORTED = 1 << 2;
        const ENERGY_EXPENDED = 1 << 3;
        const RR_INTERVALS = 1 << 4;
    }
}

/// One heart rate notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeartRateMeasurement {
    /// Beats per minute.
    pub heart_rate: u16,
    /// `None` if the sensor does not report skin contact.
    pub sensor_contact: Option<bool>,
    /// Accumulated energy in kJ.
    pub energy_expended: Option<u16>,
    /// RR intervals in 1/1024 s, oldest first.
    pub rr_intervals: Vec<u16>,
}

/// Decode a Heart Rate Measurement.
///
/// # Errors
///
/// Returns [`DecodeError`] for short buffers or a dangling RR byte.
pub fn decode(data: &[u8]) -> Result<HeartRateMeasurement, DecodeError> {
    let mut reader = Reader::new(data, CONTEXT);
    let flags = Flags::from_bits_retain(reader.u8()?);

    let heart_rate = if flags.contains(Flags::RATE_U16) {
        reader.u16()?
    } else {
        u16::from(reader.u8()?)
    };
    let sensor_contact = flags
        .contains(Flags::SENSOR_CONTACT_SUPPORTED)
        .then(|| flags.contains(Flags::SENSOR_CONTACT_DETECTED));
    let energy_expended = if flags.contains(Flags::ENERGY_EXPENDED) {
        Some(reader.u16()?)
    } else {
        None
    };

    let mut rr_intervals = Vec::new();
    if flags.contains(Flags::RR_INTERVALS) {
        while reader.remaining() >= 2 {
            rr_intervals.push(reader.u16()?);
        }
    }
    reader.finish()?;

    Ok(HeartRateMeasurement {
        heart_rate,
        sensor_contact,
        energy_expended,
        rr_intervals,
    })
}

/// Encode a Heart Rate Measurement. The 16-bit rate format is used only when
/// the rate does not fit in a byte.
#[must_use]
pub fn encode(measurement: &HeartRateMeasurement) -> Vec<u8> {
    let mut flags = Flags::empty();
    if measurement.heart_rate > u16::from(u8::MAX) {
        flags |= Flags::RATE_U16;
    }
    if let Some(contact) = measurement.sensor_contact {
        flags |= Flags::SENSOR_CONTACT_SUPPORTED;
        flags.set(Flags::SENSOR_CONTACT_DETECTED, contact);
    }
    flags.set(Flags::ENERGY_EXPENDED, measurement.energy_expended.is_some());
    flags.set(Flags::RR_INTERVALS, !measurement.rr_intervals.is_empty());

    let mut writer = Writer::default();
    writer.u8(flags.bits());
    if flags.contains(Flags::RATE_U16) {
        writer.u16(measurement.heart_rate);
    } else {
        #[allow(clippy::cast_possible_truncation)]
        let rate = measurement.heart_rate as u8;
        writer.u8(rate);
    }
    if let Some(energy) = measurement.energy_expended {
        writer.u16(energy);
    }
    for rr in &measurement.rr_intervals {
        writer.u16(*rr);
    }
    writer.into_inner()
}

/// Where the heart rate sensor is worn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BodySensorLocation {
    /// 0
    Other,
    /// 1
    Chest,
    /// 2
    Wrist,
    /// 3
    Finger,
    /// 4
    Hand,
    /// 5
    EarLobe,
    /// 6
    Foot,
}

impl BodySensorLocation {
    const fn code(self) -> u8 {
        match self {
            Self::Other => 0,
            Self::Chest => 1,
            Self::Wrist => 2,
            Self::Finger => 3,
            Self::Hand => 4,
            Self::EarLobe => 5,
            Self::Foot => 6,
        }
    }
}

/// Decode the one-byte Body Sensor Location.
///
/// # Errors
///
/// Returns [`DecodeError::InvalidValue`] for reserved codes.
pub fn decode_body_sensor_location(data: &[u8]) -> Result<BodySensorLocation, DecodeError> {
    let mut reader = Reader::new(data, "body sensor location");
    let code = reader.u8()?;
    reader.finish()?;
    Ok(match code {
        0 => BodySensorLocation::Other,
        1 => BodySensorLocation::Chest,
        2 => BodySensorLocation::Wrist,
        3 => BodySensorLocation::Finger,
        4 => BodySensorLocation::Hand,
        5 => BodySensorLocation::EarLobe,
        6 => BodySensorLocation::Foot,
        value => {
            return Err(DecodeError::InvalidValue {
                context: "body sensor location",
                field: "location",
                value: u32::from(value),
            })
        }
    })
}

/// Encode a Body Sensor Location.
#[must_use]
pub fn encode_body_sensor_location(location: BodySensorLocation) -> Vec<u8> {
    vec![location.code()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_minimal_u8_rate() {
        let m = decode(&[0x00, 60]).unwrap();
        assert_eq!(m.heart_rate, 60);
        assert_eq!(m.sensor_contact, None);
        assert_eq!(m.energy_expended, None);
        assert!(m.rr_intervals.is_empty());
    }

    #[test]
    fn test_decode_all_fields() {
        // u16 rate 300, contact supported + detected, energy 0x0102, two RR
        let data = [0x1F, 0x2C, 0x01, 0x02, 0x01, 0x00, 0x04, 0x10, 0x04];
        let m = decode(&data).unwrap();
        assert_eq!(m.heart_rate, 300);
        assert_eq!(m.sensor_contact, Some(true));
        assert_eq!(m.energy_expended, Some(0x0102));
        assert_eq!(m.rr_intervals, vec![1024, 1040]);
    }

    #[test]
    fn test_decode_contact_supported_not_detected() {
        let m = decode(&[0x04, 80]).unwrap();
        assert_eq!(m.sensor_contact, Some(false));
    }

    #[test]
    fn test_decode_rejects_short_and_dangling() {
        assert!(decode(&[]).is_err());
        assert!(decode(&[0x01, 0x50]).is_err());
        assert!(decode(&[0x08, 0x50, 0x01]).is_err());
        assert!(matches!(
            decode(&[0x10, 0x50, 0x00, 0x04, 0x07]),
            Err(DecodeError::TrailingBytes { count: 1, .. })
        ));
    }

    #[test]
    fn test_round_trip_boundaries() {
        let cases = [
            HeartRateMeasurement {
                heart_rate: 0,
                sensor_contact: None,
                energy_expended: None,
                rr_intervals: vec![],
            },
            HeartRateMeasurement {
                heart_rate: 255,
                sensor_contact: Some(false),
                energy_expended: Some(0),
                rr_intervals: vec![0],
            },
            HeartRateMeasurement {
                heart_rate: u16::MAX,
                sensor_contact: Some(true),
                energy_expended: Some(u16::MAX),
                rr_intervals: vec![u16::MAX, 1, 512],
            },
        ];
        for m in cases {
            assert_eq!(decode(&encode(&m)).unwrap(), m);
        }
    }

    #[test]
    fn test_body_sensor_location() {
        assert_eq!(
            decode_body_sensor_location(&[1]).unwrap(),
            BodySensorLocation::Chest
        );
        assert!(decode_body_sensor_location(&[7]).is_err());
        assert!(decode_body_sensor_location(&[]).is_err());
        for loc in [BodySensorLocation::Other, BodySensorLocation::Foot] {
            assert_eq!(
                decode_body_sensor_location(&encode_body_sensor_location(loc)).unwrap(),
                loc
            );
        }
    }
}
