//! IEEE-11073 numeric types and the GATT date-time field.

use chrono::NaiveDate;
use chrono::NaiveDateTime;
use serde::Serialize;

const SFLOAT_NAN: i16 = 0x07FF;
const SFLOAT_NRES: i16 = -0x0800;
const SFLOAT_POSITIVE_INFINITY: i16 = 0x07FE;
const SFLOAT_NEGATIVE_INFINITY: i16 = -0x07FE;
const SFLOAT_RESERVED: i16 = -0x07FF;

/// IEEE-11073 16-bit SFLOAT: 4-bit signed exponent, 12-bit signed mantissa.
///
/// `value = mantissa × 10^exponent`. With exponent 0, the mantissas
/// `0x7FF`, `0x800`, `0x7FE`, `0x802` and `0x801` encode NaN, NRes, +∞, −∞
/// and a reserved value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SFloat {
    mantissa: i16,
    exponent: i8,
}

impl SFloat {
    /// Not-a-number, used by the intermediate cuff pressure for unused fields.
    pub const NAN: Self = Self {
        mantissa: SFLOAT_NAN,
        exponent: 0,
    };

    /// Build from mantissa and exponent; `None` if either is out of range.
    #[must_use]
    pub const fn new(mantissa: i16, exponent: i8) -> Option<Self> {
        if mantissa < -2048 || mantissa > 2047 || exponent < -8 || exponent > 7 {
            None
        } else {
            Some(Self { mantissa, exponent })
        }
    }

    /// Encode `value` with a fixed decimal `exponent`, rounding the mantissa.
    ///
    /// Returns `None` when the scaled value does not fit in 12 bits.
    #[must_use]
    pub fn from_scaled(value: f32, exponent: i8) -> Option<Self> {
        let mantissa = (f64::from(value) / 10f64.powi(i32::from(exponent))).round();
        if !(-2048.0..=2047.0).contains(&mantissa) {
            return None;
        }
        #[allow(clippy::cast_possible_truncation)]
        let mantissa = mantissa as i16;
        Self::new(mantissa, exponent)
    }

    /// Decode the raw little-endian word.
    #[must_use]
    pub const fn from_raw(raw: u16) -> Self {
        // Sign-extend 12-bit mantissa and 4-bit exponent.
        let mantissa = ((raw << 4) as i16) >> 4;
        let exponent = ((raw as i16) >> 12) as i8;
        Self { mantissa, exponent }
    }

    /// Encode to the raw word.
    #[must_use]
    pub const fn to_raw(self) -> u16 {
        (((self.exponent as u16) & 0x000F) << 12) | ((self.mantissa as u16) & 0x0FFF)
    }

    /// Mantissa.
    #[must_use]
    pub const fn mantissa(self) -> i16 {
        self.mantissa
    }

    /// Base-10 exponent.
    #[must_use]
    pub const fn exponent(self) -> i8 {
        self.exponent
    }

    /// `true` for NaN, NRes and the reserved value.
    #[must_use]
    pub const fn is_special(self) -> bool {
        self.exponent == 0
            && matches!(
                self.mantissa,
                SFLOAT_NAN
                    | SFLOAT_NRES
                    | SFLOAT_POSITIVE_INFINITY
                    | SFLOAT_NEGATIVE_INFINITY
                    | SFLOAT_RESERVED
            )
    }

    /// Numeric value; special encodings map to NaN / ±∞.
    #[must_use]
    pub fn value(self) -> f32 {
        if self.exponent == 0 {
            match self.mantissa {
                SFLOAT_POSITIVE_INFINITY => return f32::INFINITY,
                SFLOAT_NEGATIVE_INFINITY => return f32::NEG_INFINITY,
                SFLOAT_NAN | SFLOAT_NRES | SFLOAT_RESERVED => return f32::NAN,
                _ => {}
            }
        }
        #[allow(clippy::cast_possible_truncation)]
        let value = (f64::from(self.mantissa) * 10f64.powi(i32::from(self.exponent))) as f32;
        value
    }
}

const FLOAT_NAN: i32 = 0x007F_FFFF;
const FLOAT_NRES: i32 = -0x0080_0000;
const FLOAT_POSITIVE_INFINITY: i32 = 0x007F_FFFE;
const FLOAT_NEGATIVE_INFINITY: i32 = -0x007F_FFFE;
const FLOAT_RESERVED: i32 = -0x007F_FFFF;

/// IEEE-11073 32-bit FLOAT: 8-bit signed exponent, 24-bit signed mantissa.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Float32 {
    mantissa: i32,
    exponent: i8,
}

impl Float32 {
    /// Build from mantissa and exponent; `None` if the mantissa exceeds 24 bits.
    #[must_use]
    pub const fn new(mantissa: i32, exponent: i8) -> Option<Self> {
        if mantissa < -0x0080_0000 || mantissa > 0x007F_FFFF {
            None
        } else {
            Some(Self { mantissa, exponent })
        }
    }

    /// Encode `value` with a fixed decimal `exponent`, rounding the mantissa.
    #[must_use]
    pub fn from_scaled(value: f32, exponent: i8) -> Option<Self> {
        let mantissa = (f64::from(value) / 10f64.powi(i32::from(exponent))).round();
        if !(-8_388_608.0..=8_388_607.0).contains(&mantissa) {
            return None;
        }
        #[allow(clippy::cast_possible_truncation)]
        let mantissa = mantissa as i32;
        Self::new(mantissa, exponent)
    }

    /// Decode the raw little-endian word.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        let mantissa = ((raw << 8) as i32) >> 8;
        let exponent = (raw >> 24) as i8;
        Self { mantissa, exponent }
    }

    /// Encode to the raw word.
    #[must_use]
    pub const fn to_raw(self) -> u32 {
        ((self.exponent as u8 as u32) << 24) | ((self.mantissa as u32) & 0x00FF_FFFF)
    }

    /// Mantissa.
    #[must_use]
    pub const fn mantissa(self) -> i32 {
        self.mantissa
    }

    /// Base-10 exponent.
    #[must_use]
    pub const fn exponent(self) -> i8 {
        self.exponent
    }

    /// Numeric value; special encodings map to NaN / ±∞.
    #[must_use]
    pub fn value(self) -> f32 {
        if self.exponent == 0 {
            match self.mantissa {
                FLOAT_POSITIVE_INFINITY => return f32::INFINITY,
                FLOAT_NEGATIVE_INFINITY => return f32::NEG_INFINITY,
                FLOAT_NAN | FLOAT_NRES | FLOAT_RESERVED => return f32::NAN,
                _ => {}
            }
        }
        #[allow(clippy::cast_possible_truncation)]
        let value = (f64::from(self.mantissa) * 10f64.powi(i32::from(self.exponent))) as f32;
        value
    }
}

/// The 7-byte GATT Date Time field. Zero year/month/day mean "unknown".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub struct GattDateTime {
    /// 1582..=9999, or 0 if unknown.
    pub year: u16,
    /// 1..=12, or 0 if unknown.
    pub month: u8,
    /// 1..=31, or 0 if unknown.
    pub day: u8,
    /// 0..=23.
    pub hours: u8,
    /// 0..=59.
    pub minutes: u8,
    /// 0..=59.
    pub seconds: u8,
}

impl GattDateTime {
    /// Calendar value, or `None` when any component is unknown or invalid.
    #[must_use]
    pub fn to_naive(&self) -> Option<NaiveDateTime> {
        NaiveDate::from_ymd_opt(
            i32::from(self.year),
            u32::from(self.month),
            u32::from(self.day),
        )?
        .and_hms_opt(
            u32::from(self.hours),
            u32::from(self.minutes),
            u32::from(self.seconds),
        )
    }
}

impl From<NaiveDateTime> for GattDateTime {
    fn from(value: NaiveDateTime) -> Self {
        use chrono::{Datelike, Timelike};
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let converted = Self {
            year: value.year() as u16,
            month: value.month() as u8,
            day: value.day() as u8,
            hours: value.hour() as u8,
            minutes: value.minute() as u8,
            seconds: value.second() as u8,
        };
        converted
    }
}
