//! Continuous Glucose Monitoring: CGM Measurement (0x2AA7), CGM Feature
//! (0x2AA8) and CGM Session Start Time (0x2AAA).
//!
//! A CGM Measurement notification carries one or more size-prefixed records.
//! When the sensor announces E2E-CRC support in its feature characteristic,
//! every record (and the session start time) ends with a CRC-16/MCRF4XX over
//! the preceding bytes.

use bitflags::bitflags;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use super::{DecodeError, GattDateTime, Reader, SFloat, Writer};

const CONTEXT: &str = "CGM measurement";

/// Size, flags, concentration and time offset.
const MIN_RECORD_SIZE: usize = 6;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Flags: u8 {
        const TREND = 1 << 0;
        const QUALITY = 1 << 1;
        const WARNING_OCTET = 1 << 5;
        const CAL_TEMP_OCTET = 1 << 6;
        const STATUS_OCTET = 1 << 7;
    }
}

bitflags! {
    /// Bits of the 24-bit CGM Feature field.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CgmFeatures: u32 {
        /// Calibration supported.
        const CALIBRATION = 1 << 0;
        /// Patient high/low alerts supported.
        const PATIENT_HIGH_LOW_ALERTS = 1 << 1;
        /// Hypo alerts supported.
        const HYPO_ALERTS = 1 << 2;
        /// Hyper alerts supported.
        const HYPER_ALERTS = 1 << 3;
        /// Rate of increase/decrease alerts supported.
        const RATE_ALERTS = 1 << 4;
        /// Device specific alert supported.
        const DEVICE_SPECIFIC_ALERT = 1 << 5;
        /// Sensor malfunction detection supported.
        const SENSOR_MALFUNCTION_DETECTION = 1 << 6;
        /// Sensor temperature high/low detection supported.
        const SENSOR_TEMPERATURE_DETECTION = 1 << 7;
        /// Sensor result high/low detection supported.
        const SENSOR_RESULT_DETECTION = 1 << 8;
        /// Low battery detection supported.
        const LOW_BATTERY_DETECTION = 1 << 9;
        /// Sensor type error detection supported.
        const SENSOR_TYPE_ERROR_DETECTION = 1 << 10;
        /// General device fault supported.
        const GENERAL_DEVICE_FAULT = 1 << 11;
        /// E2E-CRC supported.
        const E2E_CRC = 1 << 12;
        /// Multiple bond supported.
        const MULTIPLE_BOND = 1 << 13;
        /// Multiple sessions supported.
        const MULTIPLE_SESSIONS = 1 << 14;
        /// CGM trend information supported.
        const TREND_INFORMATION = 1 << 15;
        /// CGM quality supported.
        const QUALITY = 1 << 16;
    }
}

/// CRC-16/MCRF4XX: reflected polynomial 0x8408, initial value 0xFFFF, no
/// final XOR.
#[must_use]
pub fn crc16_mcrf4xx(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for byte in data {
        crc ^= u16::from(*byte);
        for _ in 0..8 {
            crc = if crc & 1 == 1 {
                (crc >> 1) ^ 0x8408
            } else {
                crc >> 1
            };
        }
    }
    crc
}

/// One CGM measurement record. Concentration is in mg/dL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CgmMeasurement {
    /// Glucose concentration, mg/dL.
    pub glucose_concentration: SFloat,
    /// Minutes since the session start. Doubles as the record's sequence
    /// number for record access.
    pub time_offset: u16,
    /// Sensor status annunciation, warning octet.
    pub warning: Option<u8>,
    /// Sensor status annunciation, calibration/temperature octet.
    pub cal_temp: Option<u8>,
    /// Sensor status annunciation, status octet.
    pub status: Option<u8>,
    /// Trend in (mg/dL)/min.
    pub trend: Option<SFloat>,
    /// Quality in percent.
    pub quality: Option<SFloat>,
}

impl CgmMeasurement {
    /// Measurement with only the mandatory fields.
    #[must_use]
    pub const fn new(glucose_concentration: SFloat, time_offset: u16) -> Self {
        Self {
            glucose_concentration,
            time_offset,
            warning: None,
            cal_temp: None,
            status: None,
            trend: None,
            quality: None,
        }
    }

    fn flags(&self) -> Flags {
        let mut flags = Flags::empty();
        flags.set(Flags::TREND, self.trend.is_some());
        flags.set(Flags::QUALITY, self.quality.is_some());
        flags.set(Flags::WARNING_OCTET, self.warning.is_some());
        flags.set(Flags::CAL_TEMP_OCTET, self.cal_temp.is_some());
        flags.set(Flags::STATUS_OCTET, self.status.is_some());
        flags
    }
}

fn expected_record_size(flags: Flags, crc: bool) -> usize {
    let octets = [Flags::WARNING_OCTET, Flags::CAL_TEMP_OCTET, Flags::STATUS_OCTET]
        .into_iter()
        .filter(|f| flags.contains(*f))
        .count();
    let sfloats = [Flags::TREND, Flags::QUALITY]
        .into_iter()
        .filter(|f| flags.contains(*f))
        .count();
    MIN_RECORD_SIZE + octets + 2 * sfloats + if crc { 2 } else { 0 }
}

/// Decode every record in a CGM Measurement notification.
///
/// `crc` must be `true` when the sensor announced E2E-CRC support; each
/// record's CRC is then checked.
///
/// # Errors
///
/// Returns [`DecodeError`] if any record is truncated, disagrees with its
/// own size field, or fails its CRC. Records are all-or-nothing per
/// notification.
pub fn decode_records(data: &[u8], crc: bool) -> Result<Vec<CgmMeasurement>, DecodeError> {
    if data.is_empty() {
        return Err(DecodeError::TooShort {
            context: CONTEXT,
            expected: MIN_RECORD_SIZE,
            actual: 0,
        });
    }

    let mut records = Vec::new();
    let mut offset = 0;
    while offset < data.len() {
        let size = usize::from(data[offset]);
        if size < MIN_RECORD_SIZE {
            return Err(DecodeError::SizeMismatch {
                context: CONTEXT,
                size,
                expected: MIN_RECORD_SIZE,
            });
        }
        let end = offset + size;
        let record = data.get(offset..end).ok_or(DecodeError::TooShort {
            context: CONTEXT,
            expected: end,
            actual: data.len(),
        })?;
        records.push(decode_record(record, crc)?);
        offset = end;
    }
    Ok(records)
}

fn decode_record(record: &[u8], crc: bool) -> Result<CgmMeasurement, DecodeError> {
    let mut reader = Reader::new(record, CONTEXT);
    let size = usize::from(reader.u8()?);
    let flags = Flags::from_bits_retain(reader.u8()?);

    let expected = expected_record_size(flags, crc);
    if size != expected {
        return Err(DecodeError::SizeMismatch {
            context: reader.context(),
            size,
            expected,
        });
    }

    let glucose_concentration = reader.sfloat()?;
    let time_offset = reader.u16()?;
    let octet = |flag: Flags, reader: &mut Reader<'_>| -> Result<Option<u8>, DecodeError> {
        if flags.contains(flag) {
            reader.u8().map(Some)
        } else {
            Ok(None)
        }
    };
    let warning = octet(Flags::WARNING_OCTET, &mut reader)?;
    let cal_temp = octet(Flags::CAL_TEMP_OCTET, &mut reader)?;
    let status = octet(Flags::STATUS_OCTET, &mut reader)?;
    let trend = if flags.contains(Flags::TREND) {
        Some(reader.sfloat()?)
    } else {
        None
    };
    let quality = if flags.contains(Flags::QUALITY) {
        Some(reader.sfloat()?)
    } else {
        None
    };
    if crc {
        let received = reader.u16()?;
        let computed = crc16_mcrf4xx(&record[..record.len() - 2]);
        if computed != received {
            return Err(DecodeError::CrcMismatch {
                context: CONTEXT,
                computed,
                received,
            });
        }
    }
    reader.finish()?;

    Ok(CgmMeasurement {
        glucose_concentration,
        time_offset,
        warning,
        cal_temp,
        status,
        trend,
        quality,
    })
}

/// Encode one size-prefixed record, appending a CRC when `crc` is set.
#[must_use]
pub fn encode_record(measurement: &CgmMeasurement, crc: bool) -> Vec<u8> {
    let flags = measurement.flags();
    #[allow(clippy::cast_possible_truncation)]
    let size = expected_record_size(flags, crc) as u8;

    let mut writer = Writer::default();
    writer
        .u8(size)
        .u8(flags.bits())
        .sfloat(measurement.glucose_concentration)
        .u16(measurement.time_offset);
    for octet in [measurement.warning, measurement.cal_temp, measurement.status]
        .into_iter()
        .flatten()
    {
        writer.u8(octet);
    }
    if let Some(trend) = measurement.trend {
        writer.sfloat(trend);
    }
    if let Some(quality) = measurement.quality {
        writer.sfloat(quality);
    }
    if crc {
        let checksum = crc16_mcrf4xx(writer.bytes());
        writer.u16(checksum);
    }
    writer.into_inner()
}

/// Encode several records into one notification payload.
#[must_use]
pub fn encode_records(measurements: &[CgmMeasurement], crc: bool) -> Vec<u8> {
    measurements
        .iter()
        .flat_map(|m| encode_record(m, crc))
        .collect()
}

/// CGM Feature characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CgmFeature {
    /// Raw 24-bit feature field; see [`Self::features`].
    pub features: u32,
    /// Low nibble of the type/location octet.
    pub sample_type: u8,
    /// High nibble of the type/location octet.
    pub sample_location: u8,
}

impl CgmFeature {
    /// Feature bits. Unknown bits are retained.
    #[must_use]
    pub const fn features(&self) -> CgmFeatures {
        CgmFeatures::from_bits_retain(self.features)
    }

    /// Whether measurements and the session start time carry an E2E-CRC.
    #[must_use]
    pub const fn e2e_crc_supported(&self) -> bool {
        self.features().contains(CgmFeatures::E2E_CRC)
    }
}

/// Decode the CGM Feature characteristic.
///
/// The trailing CRC field is always present; it is checked only when the
/// feature bits announce E2E-CRC support (otherwise it is `0xFFFF`).
///
/// # Errors
///
/// Returns [`DecodeError`] for a wrong length or a failed CRC.
pub fn decode_feature(data: &[u8]) -> Result<CgmFeature, DecodeError> {
    let mut reader = Reader::new(data, "CGM feature");
    let features = reader.u24()?;
    let type_location = reader.u8()?;
    let received = reader.u16()?;
    reader.finish()?;

    let feature = CgmFeature {
        features,
        sample_type: type_location & 0x0F,
        sample_location: type_location >> 4,
    };
    if feature.e2e_crc_supported() {
        let computed = crc16_mcrf4xx(&data[..4]);
        if computed != received {
            return Err(DecodeError::CrcMismatch {
                context: "CGM feature",
                computed,
                received,
            });
        }
    }
    Ok(feature)
}

/// Encode the CGM Feature characteristic.
#[must_use]
pub fn encode_feature(feature: &CgmFeature) -> Vec<u8> {
    let mut writer = Writer::default();
    writer
        .u24(feature.features & 0x00FF_FFFF)
        .u8((feature.sample_location << 4) | (feature.sample_type & 0x0F));
    let checksum = if feature.e2e_crc_supported() {
        crc16_mcrf4xx(writer.bytes())
    } else {
        0xFFFF
    };
    writer.u16(checksum);
    writer.into_inner()
}

/// CGM Session Start Time: local date-time plus zone and DST offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionStartTime {
    /// Local wall-clock start.
    pub start: GattDateTime,
    /// UTC offset in 15 minute steps; −128 means unknown.
    pub time_zone: i8,
    /// 0 standard, 2 +0.5 h, 4 +1 h, 8 +2 h, 255 unknown.
    pub dst_offset: u8,
}

impl SessionStartTime {
    /// DST offset in minutes, `None` if unknown or reserved.
    #[must_use]
    pub const fn dst_minutes(&self) -> Option<i64> {
        match self.dst_offset {
            0 => Some(0),
            2 => Some(30),
            4 => Some(60),
            8 => Some(120),
            _ => None,
        }
    }

    /// Session start in UTC. Unknown zone or DST is treated as zero offset;
    /// an unknown date yields `None`.
    #[must_use]
    pub fn to_utc(&self) -> Option<DateTime<Utc>> {
        let local = self.start.to_naive()?;
        let zone_minutes = if self.time_zone == i8::MIN {
            0
        } else {
            i64::from(self.time_zone) * 15
        };
        let offset = Duration::minutes(zone_minutes + self.dst_minutes().unwrap_or(0));
        Some((local - offset).and_utc())
    }
}

/// Decode CGM Session Start Time; `crc` as for [`decode_records`].
///
/// # Errors
///
/// Returns [`DecodeError`] for a wrong length or a failed CRC.
pub fn decode_session_start_time(data: &[u8], crc: bool) -> Result<SessionStartTime, DecodeError> {
    let mut reader = Reader::new(data, "CGM session start time");
    let start = reader.date_time()?;
    let time_zone = reader.i8()?;
    let dst_offset = reader.u8()?;
    if crc {
        let received = reader.u16()?;
        let computed = crc16_mcrf4xx(&data[..9]);
        if computed != received {
            return Err(DecodeError::CrcMismatch {
                context: "CGM session start time",
                computed,
                received,
            });
        }
    }
    reader.finish()?;
    Ok(SessionStartTime {
        start,
        time_zone,
        dst_offset,
    })
}

/// Encode CGM Session Start Time.
#[must_use]
pub fn encode_session_start_time(value: &SessionStartTime, crc: bool) -> Vec<u8> {
    let mut writer = Writer::default();
    writer
        .date_time(&value.start)
        .i8(value.time_zone)
        .u8(value.dst_offset);
    if crc {
        let checksum = crc16_mcrf4xx(writer.bytes());
        writer.u16(checksum);
    }
    writer.into_inner()
}
