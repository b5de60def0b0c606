//! RSC Measurement (0x2A53).

use bitflags::bitflags;
use serde::Serialize;

use super::{DecodeError, Reader, Writer};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Flags: u8 {
        const STRIDE_LENGTH = 1 << 0;
        const TOTAL_DISTANCE = 1 << 1;
        const RUNNING = 1 << 2;
    }
}

/// One RSC notification, in wire units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RscMeasurement {
    /// Instantaneous speed in 1/256 m/s.
    pub speed: u16,
    /// Steps per minute.
    pub cadence: u8,
    /// Instantaneous stride length in centimetres.
    pub stride_length: Option<u16>,
    /// Total distance in decimetres.
    pub total_distance: Option<u32>,
    /// `false` while walking.
    pub running: bool,
}

impl RscMeasurement {
    /// Speed in metres per second.
    #[must_use]
    pub fn speed_mps(&self) -> f32 {
        f32::from(self.speed) / 256.0
    }

    /// Total distance in metres.
    #[must_use]
    pub fn total_distance_m(&self) -> Option<f64> {
        self.total_distance.map(|d| f64::from(d) / 10.0)
    }
}

/// Decode an RSC Measurement.
///
/// # Errors
///
/// Returns [`DecodeError`] for short buffers or trailing bytes.
pub fn decode(data: &[u8]) -> Result<RscMeasurement, DecodeError> {
    let mut reader = Reader::new(data, "RSC measurement");
    let flags = Flags::from_bits_retain(reader.u8()?);
    let speed = reader.u16()?;
    let cadence = reader.u8()?;
    let stride_length = if flags.contains(Flags::STRIDE_LENGTH) {
        Some(reader.u16()?)
    } else {
        None
    };
    let total_distance = if flags.contains(Flags::TOTAL_DISTANCE) {
        Some(reader.u32()?)
    } else {
        None
    };
    reader.finish()?;

    Ok(RscMeasurement {
        speed,
        cadence,
        stride_length,
        total_distance,
        running: flags.contains(Flags::RUNNING),
    })
}

/// Encode an RSC Measurement.
#[must_use]
pub fn encode(measurement: &RscMeasurement) -> Vec<u8> {
    let mut flags = Flags::empty();
    flags.set(Flags::STRIDE_LENGTH, measurement.stride_length.is_some());
    flags.set(Flags::TOTAL_DISTANCE, measurement.total_distance.is_some());
    flags.set(Flags::RUNNING, measurement.running);

    let mut writer = Writer::default();
    writer
        .u8(flags.bits())
        .u16(measurement.speed)
        .u8(measurement.cadence);
    if let Some(stride) = measurement.stride_length {
        writer.u16(stride);
    }
    if let Some(distance) = measurement.total_distance {
        writer.u32(distance);
    }
    writer.into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_running_with_distance() {
        // running, distance; 3.5 m/s, 170 spm, 1234.5 m
        let data = [0x06, 0x80, 0x03, 0xAA, 0x39, 0x30, 0x00, 0x00];
        let m = decode(&data).unwrap();
        assert!(m.running);
        assert!((m.speed_mps() - 3.5).abs() < f32::EPSILON);
        assert_eq!(m.cadence, 170);
        assert_eq!(m.stride_length, None);
        assert!((m.total_distance_m().unwrap() - 1234.5).abs() < 1e-9);
    }

    #[test]
    fn test_decode_rejects_short() {
        assert!(decode(&[0x00, 0x01, 0x00]).is_err());
        assert!(decode(&[0x01, 0x01, 0x00, 0x10]).is_err());
    }

    #[test]
    fn test_round_trip_boundaries() {
        let cases = [
            RscMeasurement {
                speed: 0,
                cadence: 0,
                stride_length: None,
                total_distance: None,
                running: false,
            },
            RscMeasurement {
                speed: u16::MAX,
                cadence: u8::MAX,
                stride_length: Some(u16::MAX),
                total_distance: Some(u32::MAX),
                running: true,
            },
        ];
        for m in cases {
            assert_eq!(decode(&encode(&m)).unwrap(), m);
        }
    }
}
