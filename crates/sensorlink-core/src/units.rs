//! Display-unit conversions applied by callers on top of decoded values.
//!
//! Codecs keep wire units; nothing in here is used while decoding.

use serde::{Deserialize, Serialize};

const KPA_PER_MMHG: f32 = 0.133_322_4;
const MMOL_PER_L_PER_MG_PER_DL: f32 = 1.0 / 18.0182;

/// Millimetres of mercury to kilopascal.
#[must_use]
pub fn mmhg_to_kpa(mmhg: f32) -> f32 {
    mmhg * KPA_PER_MMHG
}

/// Kilopascal to millimetres of mercury.
#[must_use]
pub fn kpa_to_mmhg(kpa: f32) -> f32 {
    kpa / KPA_PER_MMHG
}

/// Degrees Celsius to Fahrenheit.
#[must_use]
pub fn celsius_to_fahrenheit(celsius: f32) -> f32 {
    celsius.mul_add(9.0 / 5.0, 32.0)
}

/// Degrees Fahrenheit to Celsius.
#[must_use]
pub fn fahrenheit_to_celsius(fahrenheit: f32) -> f32 {
    (fahrenheit - 32.0) * 5.0 / 9.0
}

/// Glucose mg/dL to mmol/L.
#[must_use]
pub fn mg_per_dl_to_mmol_per_l(mg_per_dl: f32) -> f32 {
    mg_per_dl * MMOL_PER_L_PER_MG_PER_DL
}

/// Metres per second to kilometres per hour.
#[must_use]
pub fn mps_to_kmh(mps: f32) -> f32 {
    mps * 3.6
}

/// Metres per second to miles per hour.
#[must_use]
pub fn mps_to_mph(mps: f32) -> f32 {
    mps * 2.236_936
}

/// Preferred unit system for presenting speeds and distances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitSystem {
    /// km/h, km.
    #[default]
    Metric,
    /// mph, miles.
    Imperial,
}

impl UnitSystem {
    /// Speed in m/s expressed in this system.
    #[must_use]
    pub fn speed(self, mps: f32) -> f32 {
        match self {
            Self::Metric => mps_to_kmh(mps),
            Self::Imperial => mps_to_mph(mps),
        }
    }

    /// Distance in metres expressed in this system (km or miles).
    #[must_use]
    pub fn distance(self, metres: f32) -> f32 {
        match self {
            Self::Metric => metres / 1000.0,
            Self::Imperial => metres / 1609.344,
        }
    }
}
