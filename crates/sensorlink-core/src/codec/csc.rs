//! CSC Measurement (0x2A5B) and the derived speed/cadence calculator.

use bitflags::bitflags;
use serde::Serialize;

use super::{DecodeError, Reader, Writer};

const CONTEXT: &str = "CSC measurement";

/// Event times are in 1/1024 s.
const TICKS_PER_SECOND: f32 = 1024.0;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Flags: u8 {
        const WHEEL_REVOLUTIONS = 1 << 0;
        const CRANK_REVOLUTIONS = 1 << 1;
    }
}

/// Cumulative wheel revolutions and the time of the last wheel event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WheelRevolutions {
    /// Wraps at `u32::MAX`.
    pub cumulative: u32,
    /// 1/1024 s, wraps every 64 s.
    pub last_event_time: u16,
}

/// Cumulative crank revolutions and the time of the last crank event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CrankRevolutions {
    /// Wraps at `u16::MAX`.
    pub cumulative: u16,
    /// 1/1024 s, wraps every 64 s.
    pub last_event_time: u16,
}

/// One CSC notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CscMeasurement {
    /// Present on speed sensors.
    pub wheel: Option<WheelRevolutions>,
    /// Present on cadence sensors.
    pub crank: Option<CrankRevolutions>,
}

/// Decode a CSC Measurement.
///
/// # Errors
///
/// Returns [`DecodeError`] for short buffers or trailing bytes.
pub fn decode(data: &[u8]) -> Result<CscMeasurement, DecodeError> {
    let mut reader = Reader::new(data, CONTEXT);
    let flags = Flags::from_bits_retain(reader.u8()?);

    let wheel = if flags.contains(Flags::WHEEL_REVOLUTIONS) {
        Some(WheelRevolutions {
            cumulative: reader.u32()?,
            last_event_time: reader.u16()?,
        })
    } else {
        None
    };
    let crank = if flags.contains(Flags::CRANK_REVOLUTIONS) {
        Some(CrankRevolutions {
            cumulative: reader.u16()?,
            last_event_time: reader.u16()?,
        })
    } else {
        None
    };
    reader.finish()?;

    Ok(CscMeasurement { wheel, crank })
}

/// Encode a CSC Measurement.
#[must_use]
pub fn encode(measurement: &CscMeasurement) -> Vec<u8> {
    let mut flags = Flags::empty();
    flags.set(Flags::WHEEL_REVOLUTIONS, measurement.wheel.is_some());
    flags.set(Flags::CRANK_REVOLUTIONS, measurement.crank.is_some());

    let mut writer = Writer::default();
    writer.u8(flags.bits());
    if let Some(wheel) = measurement.wheel {
        writer.u32(wheel.cumulative).u16(wheel.last_event_time);
    }
    if let Some(crank) = measurement.crank {
        writer.u16(crank.cumulative).u16(crank.last_event_time);
    }
    writer.into_inner()
}

/// Values derived from two consecutive CSC measurements.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CscMetrics {
    /// Metres per second.
    pub speed: Option<f32>,
    /// Metres travelled since the calculator saw its first wheel value.
    pub distance: Option<f32>,
    /// Crank revolutions per minute.
    pub cadence: Option<f32>,
    /// Wheel revolutions per crank revolution over the last interval.
    pub gear_ratio: Option<f32>,
}

/// Stateful calculator turning raw revolution counters into speed, distance,
/// cadence and gear ratio.
///
/// Counter and event-time wrap-around is handled with wrapping arithmetic.
/// An interval whose event time did not advance (the sensor repeated its last
/// event) yields no speed/cadence for that interval.
#[derive(Debug, Clone)]
pub struct CscCalculator {
    wheel_circumference_m: f32,
    first_wheel: Option<u32>,
    previous: Option<CscMeasurement>,
}

impl CscCalculator {
    /// Calculator for a wheel of the given circumference in millimetres.
    #[must_use]
    pub fn new(wheel_circumference_mm: u16) -> Self {
        Self {
            wheel_circumference_m: f32::from(wheel_circumference_mm) / 1000.0,
            first_wheel: None,
            previous: None,
        }
    }

    /// Forget all history, e.g. after a reconnect.
    pub fn reset(&mut self) {
        self.first_wheel = None;
        self.previous = None;
    }

    /// Feed the next measurement. Returns `None` for the first measurement,
    /// which only establishes the baseline.
    pub fn update(&mut self, current: &CscMeasurement) -> Option<CscMetrics> {
        if let (None, Some(wheel)) = (self.first_wheel, current.wheel) {
            self.first_wheel = Some(wheel.cumulative);
        }
        let previous = self.previous.replace(*current)?;

        let mut wheel_delta = None;
        let mut speed = None;
        if let (Some(prev), Some(cur)) = (previous.wheel, current.wheel) {
            let revolutions = cur.cumulative.wrapping_sub(prev.cumulative);
            wheel_delta = Some(revolutions);
            let ticks = cur.last_event_time.wrapping_sub(prev.last_event_time);
            if ticks > 0 {
                #[allow(clippy::cast_precision_loss)]
                let metres = revolutions as f32 * self.wheel_circumference_m;
                speed = Some(metres * TICKS_PER_SECOND / f32::from(ticks));
            }
        }

        let distance = match (self.first_wheel, current.wheel) {
            (Some(first), Some(cur)) => {
                #[allow(clippy::cast_precision_loss)]
                let revolutions = cur.cumulative.wrapping_sub(first) as f32;
                Some(revolutions * self.wheel_circumference_m)
            }
            _ => None,
        };

        let mut crank_delta = None;
        let mut cadence = None;
        if let (Some(prev), Some(cur)) = (previous.crank, current.crank) {
            let revolutions = cur.cumulative.wrapping_sub(prev.cumulative);
            crank_delta = Some(revolutions);
            let ticks = cur.last_event_time.wrapping_sub(prev.last_event_time);
            if ticks > 0 {
                cadence =
                    Some(f32::from(revolutions) * 60.0 * TICKS_PER_SECOND / f32::from(ticks));
            }
        }

        let gear_ratio = match (wheel_delta, crank_delta) {
            (Some(wheel), Some(crank)) if wheel > 0 && crank > 0 => {
                #[allow(clippy::cast_precision_loss)]
                let wheel = wheel as f32;
                Some(wheel / f32::from(crank))
            }
            _ => None,
        };

        Some(CscMetrics {
            speed,
            distance,
            cadence,
            gear_ratio,
        })
    }
}
