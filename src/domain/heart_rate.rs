//! Heart Rate Measurement decoding
//!
//! Pure decode of the Heart Rate Measurement characteristic (0x2A37) value.
//!
//! # Record Structure
//!
//! ```text
//! [0]     : Flags
//!           bit 0: heart rate value format (0 = u8, 1 = u16 little-endian)
//!           bit 1: sensor contact detected
//!           bit 2: sensor contact supported
//!           bit 3: energy expended present
//!           bit 4: RR intervals present
//! [1]     : Heart rate (u8)            when bit 0 clear
//! [1-2]   : Heart rate (u16 LE)        when bit 0 set
//! [..+2]  : Energy expended (u16 LE, kJ) when bit 3 set
//! [..]    : RR intervals (u16 LE each, 1/1024 s) when bit 4 set
//! ```

use crate::domain::error::DecodeError;
use std::fmt;

const FLAG_RATE_U16: u8 = 1 << 0;
const FLAG_CONTACT_DETECTED: u8 = 1 << 1;
const FLAG_CONTACT_SUPPORTED: u8 = 1 << 2;
const FLAG_ENERGY_EXPENDED: u8 = 1 << 3;
const FLAG_RR_INTERVALS: u8 = 1 << 4;

/// Offset of the heart rate value; the flags byte sits at 0.
const VALUE_OFFSET: usize = 1;

/// Width of the heart rate field, selected by bit 0 of the flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueFormat {
    Uint8,
    Uint16,
}

impl ValueFormat {
    pub fn from_flags(flags: u8) -> Self {
        if flags & FLAG_RATE_U16 != 0 {
            ValueFormat::Uint16
        } else {
            ValueFormat::Uint8
        }
    }

    pub fn width(self) -> usize {
        match self {
            ValueFormat::Uint8 => 1,
            ValueFormat::Uint16 => 2,
        }
    }
}

impl fmt::Display for ValueFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueFormat::Uint8 => f.write_str("UINT8"),
            ValueFormat::Uint16 => f.write_str("UINT16"),
        }
    }
}

/// Beats per minute plus the wire format it was decoded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartRateReading {
    pub bpm: u16,
    pub format: ValueFormat,
}

/// Sensor contact as reported by flags bits 1 and 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorContact {
    NotSupported,
    NotDetected,
    Detected,
}

/// Every field of one measurement record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartRateMeasurement {
    pub reading: HeartRateReading,
    pub sensor_contact: SensorContact,
    pub energy_expended_kj: Option<u16>,
    /// RR intervals in units of 1/1024 second.
    pub rr_intervals: Vec<u16>,
}

/// Decode the heart rate value of `bytes`, with the format chosen by `flags`.
///
/// `bytes` is the full measurement record, so the value starts at offset 1.
pub fn decode(flags: u8, bytes: &[u8]) -> Result<HeartRateReading, DecodeError> {
    let format = ValueFormat::from_flags(flags);
    let required = VALUE_OFFSET + format.width();
    if bytes.len() < required {
        return Err(DecodeError {
            format,
            required,
            actual: bytes.len(),
        });
    }

    let bpm = match format {
        ValueFormat::Uint8 => u16::from(bytes[VALUE_OFFSET]),
        ValueFormat::Uint16 => u16::from_le_bytes([bytes[VALUE_OFFSET], bytes[VALUE_OFFSET + 1]]),
    };

    Ok(HeartRateReading { bpm, format })
}

/// Decode a record using its own first byte as the flags.
pub fn decode_measurement(bytes: &[u8]) -> Result<HeartRateReading, DecodeError> {
    let flags = bytes.first().copied().ok_or(DecodeError {
        format: ValueFormat::Uint8,
        required: VALUE_OFFSET + 1,
        actual: 0,
    })?;
    decode(flags, bytes)
}

/// Decode every field of a record. Trailing optional fields that are cut
/// short are dropped rather than failing the whole record.
pub fn parse_measurement(bytes: &[u8]) -> Result<HeartRateMeasurement, DecodeError> {
    let reading = decode_measurement(bytes)?;
    let flags = bytes[0];

    let sensor_contact = if flags & FLAG_CONTACT_SUPPORTED == 0 {
        SensorContact::NotSupported
    } else if flags & FLAG_CONTACT_DETECTED != 0 {
        SensorContact::Detected
    } else {
        SensorContact::NotDetected
    };

    let mut offset = VALUE_OFFSET + reading.format.width();

    let energy_expended_kj = if flags & FLAG_ENERGY_EXPENDED != 0 {
        let value = read_u16_le(bytes, offset);
        offset += 2;
        value
    } else {
        None
    };

    let mut rr_intervals = Vec::new();
    if flags & FLAG_RR_INTERVALS != 0 {
        while let Some(rr) = read_u16_le(bytes, offset) {
            rr_intervals.push(rr);
            offset += 2;
        }
    }

    Ok(HeartRateMeasurement {
        reading,
        sensor_contact,
        energy_expended_kj,
        rr_intervals,
    })
}

fn read_u16_le(bytes: &[u8], offset: usize) -> Option<u16> {
    let pair = bytes.get(offset..offset + 2)?;
    Some(u16::from_le_bytes([pair[0], pair[1]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_uint8() {
        let reading = decode(0x00, &[0x00, 0x4B]).unwrap();
        assert_eq!(reading.bpm, 75);
        assert_eq!(reading.format, ValueFormat::Uint8);
    }

    #[test]
    fn test_decode_uint16_little_endian() {
        let reading = decode(0x01, &[0x01, 0x4B, 0x00]).unwrap();
        assert_eq!(reading.bpm, 75);
        assert_eq!(reading.format, ValueFormat::Uint16);

        let reading = decode(0x01, &[0x01, 0x2C, 0x01]).unwrap();
        assert_eq!(reading.bpm, 300);
    }

    #[test]
    fn test_decode_too_short() {
        let err = decode(0x00, &[0x00]).unwrap_err();
        assert_eq!(err.required, 2);
        assert_eq!(err.actual, 1);

        let err = decode(0x01, &[0x01, 0x4B]).unwrap_err();
        assert_eq!(err.format, ValueFormat::Uint16);
        assert_eq!(err.required, 3);
    }

    #[test]
    fn test_decode_ignores_other_flag_bits() {
        let reading = decode(0x16, &[0x16, 0x48, 0x00, 0x00]).unwrap();
        assert_eq!(reading.bpm, 72);
        assert_eq!(reading.format, ValueFormat::Uint8);
    }

    #[test]
    fn test_decode_measurement_empty() {
        assert!(decode_measurement(&[]).is_err());
        assert_eq!(decode_measurement(&[0x00, 72]).unwrap().bpm, 72);
    }

    #[test]
    fn test_parse_measurement_full_record() {
        // u8 rate, contact supported + detected, energy, two RR intervals
        let bytes = [0x1E, 0x50, 0x10, 0x00, 0x00, 0x04, 0x10, 0x04];
        let m = parse_measurement(&bytes).unwrap();
        assert_eq!(m.reading.bpm, 80);
        assert_eq!(m.sensor_contact, SensorContact::Detected);
        assert_eq!(m.energy_expended_kj, Some(16));
        assert_eq!(m.rr_intervals, vec![1024, 1040]);
    }

    #[test]
    fn test_parse_measurement_truncated_rr() {
        let bytes = [0x14, 0x50, 0x00, 0x04, 0x10];
        let m = parse_measurement(&bytes).unwrap();
        assert_eq!(m.sensor_contact, SensorContact::NotDetected);
        assert_eq!(m.rr_intervals, vec![1024]);
    }
}
