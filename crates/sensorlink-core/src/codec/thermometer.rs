//! Temperature Measurement (0x2A1C) and Intermediate Temperature (0x2A1E).

use bitflags::bitflags;
use serde::Serialize;

use super::{DecodeError, Float32, GattDateTime, Reader, Writer};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Flags: u8 {
        const FAHRENHEIT = 1 << 0;
        const TIMESTAMP = 1 << 1;
        const TEMPERATURE_TYPE = 1 << 2;
    }
}

/// Unit of the temperature value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TemperatureUnit {
    /// Degrees Celsius.
    Celsius,
    /// Degrees Fahrenheit.
    Fahrenheit,
}

/// Body site of the measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TemperatureType {
    /// 1
    Armpit,
    /// 2
    Body,
    /// 3
    Ear,
    /// 4
    Finger,
    /// 5
    GastroIntestinalTract,
    /// 6
    Mouth,
    /// 7
    Rectum,
    /// 8
    Toe,
    /// 9
    Tympanum,
    /// Any other code.
    Reserved(u8),
}

impl From<u8> for TemperatureType {
    fn from(code: u8) -> Self {
        match code {
            1 => Self::Armpit,
            2 => Self::Body,
            3 => Self::Ear,
            4 => Self::Finger,
            5 => Self::GastroIntestinalTract,
            6 => Self::Mouth,
            7 => Self::Rectum,
            8 => Self::Toe,
            9 => Self::Tympanum,
            other => Self::Reserved(other),
        }
    }
}

impl From<TemperatureType> for u8 {
    fn from(value: TemperatureType) -> Self {
        match value {
            TemperatureType::Armpit => 1,
            TemperatureType::Body => 2,
            TemperatureType::Ear => 3,
            TemperatureType::Finger => 4,
            TemperatureType::GastroIntestinalTract => 5,
            TemperatureType::Mouth => 6,
            TemperatureType::Rectum => 7,
            TemperatureType::Toe => 8,
            TemperatureType::Tympanum => 9,
            TemperatureType::Reserved(code) => code,
        }
    }
}

/// A temperature or intermediate temperature record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TemperatureMeasurement {
    /// Unit of `value`.
    pub unit: TemperatureUnit,
    /// Temperature.
    pub value: Float32,
    /// When the measurement was taken.
    pub timestamp: Option<GattDateTime>,
    /// Body site.
    pub temperature_type: Option<TemperatureType>,
}

/// Decode a Temperature Measurement or Intermediate Temperature.
///
/// # Errors
///
/// Returns [`DecodeError`] for short buffers or trailing bytes.
pub fn decode(data: &[u8]) -> Result<TemperatureMeasurement, DecodeError> {
    let mut reader = Reader::new(data, "temperature measurement");
    let flags = Flags::from_bits_retain(reader.u8()?);
    let value = reader.float32()?;
    let timestamp = if flags.contains(Flags::TIMESTAMP) {
        Some(reader.date_time()?)
    } else {
        None
    };
    let temperature_type = if flags.contains(Flags::TEMPERATURE_TYPE) {
        Some(TemperatureType::from(reader.u8()?))
    } else {
        None
    };
    reader.finish()?;

    Ok(TemperatureMeasurement {
        unit: if flags.contains(Flags::FAHRENHEIT) {
            TemperatureUnit::Fahrenheit
        } else {
            TemperatureUnit::Celsius
        },
        value,
        timestamp,
        temperature_type,
    })
}

/// Encode a temperature record.
#[must_use]
pub fn encode(measurement: &TemperatureMeasurement) -> Vec<u8> {
    let mut flags = Flags::empty();
    flags.set(
        Flags::FAHRENHEIT,
        measurement.unit == TemperatureUnit::Fahrenheit,
    );
    flags.set(Flags::TIMESTAMP, measurement.timestamp.is_some());
    flags.set(Flags::TEMPERATURE_TYPE, measurement.temperature_type.is_some());

    let mut writer = Writer::default();
    writer.u8(flags.bits()).float32(measurement.value);
    if let Some(timestamp) = &measurement.timestamp {
        writer.date_time(timestamp);
    }
    if let Some(kind) = measurement.temperature_type {
        writer.u8(kind.into());
    }
    writer.into_inner()
}
