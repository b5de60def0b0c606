//! GATT identifiers used by the supported profiles.
//!
//! All UUIDs are Bluetooth SIG assigned numbers expanded onto the base UUID
//! `0000xxxx-0000-1000-8000-00805f9b34fb`.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

const BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;

/// Expand a 16-bit assigned number onto the Bluetooth base UUID.
#[must_use]
pub const fn uuid_from_u16(short: u16) -> Uuid {
    Uuid::from_u128(BASE_UUID | ((short as u128) << 96))
}

/// Identity of a characteristic on a peripheral.
///
/// Characteristic UUIDs are unique within every supported profile, so the
/// UUID alone identifies the target of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CharacteristicId(pub Uuid);

impl CharacteristicId {
    /// Characteristic with a 16-bit assigned number.
    #[must_use]
    pub const fn from_u16(short: u16) -> Self {
        Self(uuid_from_u16(short))
    }

    /// Underlying UUID.
    #[must_use]
    pub const fn uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for CharacteristicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Services ─────────────────────────────────────────────────────────────────

/// Health Thermometer Service.
pub const HEALTH_THERMOMETER_SERVICE: Uuid = uuid_from_u16(0x1809);
/// Heart Rate Service.
pub const HEART_RATE_SERVICE: Uuid = uuid_from_u16(0x180D);
/// Battery Service.
pub const BATTERY_SERVICE: Uuid = uuid_from_u16(0x180F);
/// Blood Pressure Service.
pub const BLOOD_PRESSURE_SERVICE: Uuid = uuid_from_u16(0x1810);
/// Running Speed and Cadence Service.
pub const RUNNING_SPEED_CADENCE_SERVICE: Uuid = uuid_from_u16(0x1814);
/// Cycling Speed and Cadence Service.
pub const CYCLING_SPEED_CADENCE_SERVICE: Uuid = uuid_from_u16(0x1816);
/// Continuous Glucose Monitoring Service.
pub const CGM_SERVICE: Uuid = uuid_from_u16(0x181F);

// ── Characteristics ──────────────────────────────────────────────────────────

/// Battery Level, u8 percent.
pub const BATTERY_LEVEL: CharacteristicId = CharacteristicId::from_u16(0x2A19);
/// Temperature Measurement (indicate).
pub const TEMPERATURE_MEASUREMENT: CharacteristicId = CharacteristicId::from_u16(0x2A1C);
/// Intermediate Temperature (notify).
pub const INTERMEDIATE_TEMPERATURE: CharacteristicId = CharacteristicId::from_u16(0x2A1E);
/// Blood Pressure Measurement (indicate).
pub const BLOOD_PRESSURE_MEASUREMENT: CharacteristicId = CharacteristicId::from_u16(0x2A35);
/// Intermediate Cuff Pressure (notify).
pub const INTERMEDIATE_CUFF_PRESSURE: CharacteristicId = CharacteristicId::from_u16(0x2A36);
/// Heart Rate Measurement (notify).
pub const HEART_RATE_MEASUREMENT: CharacteristicId = CharacteristicId::from_u16(0x2A37);
/// Body Sensor Location (read).
pub const BODY_SENSOR_LOCATION: CharacteristicId = CharacteristicId::from_u16(0x2A38);
/// Record Access Control Point (write + indicate).
pub const RECORD_ACCESS_CONTROL_POINT: CharacteristicId = CharacteristicId::from_u16(0x2A52);
/// RSC Measurement (notify).
pub const RSC_MEASUREMENT: CharacteristicId = CharacteristicId::from_u16(0x2A53);
/// CSC Measurement (notify).
pub const CSC_MEASUREMENT: CharacteristicId = CharacteristicId::from_u16(0x2A5B);
/// CGM Measurement (notify).
pub const CGM_MEASUREMENT: CharacteristicId = CharacteristicId::from_u16(0x2AA7);
/// CGM Feature (read).
pub const CGM_FEATURE: CharacteristicId = CharacteristicId::from_u16(0x2AA8);
/// CGM Session Start Time (read).
pub const CGM_SESSION_START_TIME: CharacteristicId = CharacteristicId::from_u16(0x2AAA);

/// Client Characteristic Configuration descriptor.
pub const CLIENT_CHARACTERISTIC_CONFIGURATION: Uuid = uuid_from_u16(0x2902);

/// CCCD value enabling notifications.
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];
/// CCCD value enabling indications.
pub const ENABLE_INDICATION_VALUE: [u8; 2] = [0x02, 0x00];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_uuid_expansion() {
        assert_eq!(
            HEART_RATE_MEASUREMENT.uuid().to_string(),
            "00002a37-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            CLIENT_CHARACTERISTIC_CONFIGURATION.to_string(),
            "00002902-0000-1000-8000-00805f9b34fb"
        );
    }
}
