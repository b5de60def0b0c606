//! Battery Level (0x2A19).

use super::{DecodeError, Reader};

/// Decode the one-byte battery percentage.
///
/// # Errors
///
/// Returns [`DecodeError::InvalidValue`] for values above 100.
pub fn decode(data: &[u8]) -> Result<u8, DecodeError> {
    let mut reader = Reader::new(data, "battery level");
    let level = reader.u8()?;
    reader.finish()?;
    if level > 100 {
        return Err(DecodeError::InvalidValue {
            context: "battery level",
            field: "level",
            value: u32::from(level),
        });
    }
    Ok(level)
}

/// Encode a battery percentage.
#[must_use]
pub fn encode(level: u8) -> Vec<u8> {
    vec![level]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_battery_bounds() {
        assert_eq!(decode(&encode(0)).unwrap(), 0);
        assert_eq!(decode(&encode(100)).unwrap(), 100);
        assert!(decode(&[101]).is_err());
        assert!(decode(&[]).is_err());
        assert!(decode(&[50, 0]).is_err());
    }
}
