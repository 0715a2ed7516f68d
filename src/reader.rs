//! One read pass over a meter profile.
//!
//! Registers are read strictly one after another, in catalog order: the RS-485 bus is
//! half-duplex with a single master and cannot serve concurrent requests.

use crate::catalog::{MeterProfile, RegisterDescriptor, ValueType};
use crate::connection::{self, Transport};
use tracing::{debug, warn};

pub const UNSUPPORTED_DATA_TYPE: &str = "UNSUPPORTED_DATA_TYPE";
pub const READ_FAILED: &str = "READ_FAILED";
pub const NOT_A_NUMBER: &str = "NaN";
pub const INFINITY: &str = "inf";
pub const NEG_INFINITY: &str = "-inf";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not read register `{1}` at address {2:#06x}")]
    Read(#[source] connection::Error, &'static str, u16),
}

/// Outcome of reading a single register.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Reading {
    Float(f32),
    /// The register kind is not decoded, the transport was never asked for it.
    Unsupported,
    /// The transport failed to produce a value for this register.
    ReadFailed,
}

impl std::fmt::Display for Reading {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Reading::Float(v) => f.write_fmt(format_args!("{}", v)),
            Reading::Unsupported => f.write_str(UNSUPPORTED_DATA_TYPE),
            Reading::ReadFailed => f.write_str(READ_FAILED),
        }
    }
}

impl serde::Serialize for Reading {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match *self {
            Reading::Float(v) if v.is_finite() => serializer.serialize_f32(v),
            // JSON has no number for these. Unimplemented registers read as all ones (NaN).
            Reading::Float(v) if v.is_nan() => serializer.serialize_str(NOT_A_NUMBER),
            Reading::Float(v) if v > 0.0 => serializer.serialize_str(INFINITY),
            Reading::Float(_) => serializer.serialize_str(NEG_INFINITY),
            Reading::Unsupported => serializer.serialize_str(UNSUPPORTED_DATA_TYPE),
            Reading::ReadFailed => serializer.serialize_str(READ_FAILED),
        }
    }
}

/// Register name to reading, one entry per register of the profile, in profile order.
#[derive(Clone, Debug, PartialEq)]
pub struct ReadResult {
    fields: Vec<(&'static str, Reading)>,
}

impl ReadResult {
    pub fn get(&self, name: &str) -> Option<Reading> {
        self.fields.iter().find(|(n, _)| *n == name).map(|(_, r)| *r)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.fields.iter().map(|(n, _)| *n)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, Reading)> + '_ {
        self.fields.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Number of registers that did not produce a value.
    pub fn failures(&self) -> usize {
        self.fields.iter().filter(|(_, r)| *r == Reading::ReadFailed).count()
    }
}

impl serde::Serialize for ReadResult {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap as _;
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (name, reading) in &self.fields {
            map.serialize_entry(name, reading)?;
        }
        map.end()
    }
}

pub fn decode_f32(words: &[u16]) -> Option<f32> {
    let &[high, low] = words else { return None };
    Some(f32::from_bits((u32::from(high) << 16) | u32::from(low)))
}

/// Read a single register. `Ok(Reading::Unsupported)` is returned without touching the
/// transport if the register kind is not decoded.
async fn read_register<T: Transport>(
    register: &RegisterDescriptor,
    transport: &mut T,
) -> Result<Reading, connection::Error> {
    let ValueType::Float32 = register.value_type else {
        debug!(
            register.name = register.name,
            register.kind = %register.value_type,
            "unsupported register kind, skipping"
        );
        return Ok(Reading::Unsupported);
    };
    let count = register.value_type.words().unwrap_or(2);
    let words = transport.read_input_registers(register.address, count).await?;
    let value = decode_f32(&words).ok_or(connection::Error::WrongLength {
        expected: count,
        received: words.len(),
    })?;
    debug!(
        register.name = register.name,
        register.address = register.address,
        value,
        "read a register"
    );
    Ok(Reading::Float(value))
}

/// Read every register of `profile`. A register that cannot be read is recorded as
/// [`Reading::ReadFailed`] and the pass carries on with the next register.
pub async fn read_all<T: Transport>(profile: &MeterProfile, transport: &mut T) -> ReadResult {
    let mut fields = Vec::with_capacity(profile.registers.len());
    for register in profile.registers {
        let reading = match read_register(register, transport).await {
            Ok(reading) => reading,
            Err(e) => {
                warn!(
                    message = "reading a register failed",
                    register.name = register.name,
                    register.address = register.address,
                    error = (&e as &dyn std::error::Error)
                );
                Reading::ReadFailed
            }
        };
        fields.push((register.name, reading));
    }
    ReadResult { fields }
}

/// [`read_all`] but the first register that cannot be read aborts the pass.
pub async fn read_all_strict<T: Transport>(
    profile: &MeterProfile,
    transport: &mut T,
) -> Result<ReadResult, Error> {
    let mut fields = Vec::with_capacity(profile.registers.len());
    for register in profile.registers {
        let reading = read_register(register, transport)
            .await
            .map_err(|e| Error::Read(e, register.name, register.address))?;
        fields.push((register.name, reading));
    }
    Ok(ReadResult { fields })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_high_word_first() {
        let bits = 230.5f32.to_bits();
        let words = [(bits >> 16) as u16, bits as u16];
        assert_eq!(words, [0x4366, 0x8000]);
        assert_eq!(decode_f32(&words), Some(230.5));
        assert_eq!(decode_f32(&[0xBF80, 0x0000]), Some(-1.0));
        assert_eq!(decode_f32(&[0x4366]), None);
    }

    #[test]
    fn serializes_sentinels() {
        let result = ReadResult {
            fields: vec![
                ("L1_V", Reading::Float(230.5)),
                ("X", Reading::Unsupported),
                ("L2_V", Reading::ReadFailed),
            ],
        };
        assert_eq!(
            serde_json::to_string(&result).unwrap(),
            r#"{"L1_V":230.5,"X":"UNSUPPORTED_DATA_TYPE","L2_V":"READ_FAILED"}"#
        );
        assert_eq!(result.failures(), 1);
        assert_eq!(result.get("X"), Some(Reading::Unsupported));
        assert_eq!(Reading::ReadFailed.to_string(), "READ_FAILED");
    }

    #[test]
    fn serializes_non_finite_values_as_strings() {
        let result = ReadResult {
            fields: vec![
                ("A", Reading::Float(f32::NAN)),
                ("B", Reading::Float(f32::INFINITY)),
                ("C", Reading::Float(f32::NEG_INFINITY)),
            ],
        };
        assert_eq!(
            serde_json::to_string(&result).unwrap(),
            r#"{"A":"NaN","B":"inf","C":"-inf"}"#
        );
    }
}
