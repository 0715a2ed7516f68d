//! The output record: collector metadata and timestamps followed by the readings.

use crate::reader::ReadResult;
use jiff::fmt::temporal::DateTimePrinter;
use jiff::tz::{Offset, TimeZone};
use jiff::Timestamp;

/// The instant a reading was taken, along with the local UTC offset in effect at that instant.
#[derive(Clone, Copy, Debug)]
pub struct Timestamps {
    pub utc: Timestamp,
    pub offset: Offset,
}

impl Timestamps {
    pub fn now() -> Self {
        let utc = Timestamp::now();
        let offset = TimeZone::system().to_offset(utc);
        Self { utc, offset }
    }

    fn printer() -> DateTimePrinter {
        DateTimePrinter::new().precision(Some(6))
    }

    /// E.g. `2024-03-01T12:00:00.250000Z`.
    pub fn utc_string(&self) -> String {
        Self::printer().timestamp_to_string(&self.utc)
    }

    /// E.g. `2024-03-01T13:00:00.250000+01:00`.
    pub fn local_string(&self) -> String {
        Self::printer().timestamp_with_offset_to_string(&self.utc, self.offset)
    }
}

/// Free-text provenance of a record.
pub fn collector(program: &str, hostname: &str, serial_port: &str, device_id: u8) -> String {
    format!("{program}, hostname={hostname}, serialport={serial_port}, RS485_addr={device_id}")
}

pub fn hostname() -> String {
    gethostname::gethostname().to_string_lossy().into_owned()
}

pub struct Record<'a> {
    pub kind: &'a str,
    pub meter_name: &'a str,
    pub meter_type: &'a str,
    pub collector: &'a str,
    pub timestamps: Timestamps,
    pub readings: &'a ReadResult,
}

impl serde::Serialize for Record<'_> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap as _;
        let mut map = serializer.serialize_map(Some(6 + self.readings.len()))?;
        map.serialize_entry("type", self.kind)?;
        map.serialize_entry("meterName", self.meter_name)?;
        map.serialize_entry("meterType", self.meter_type)?;
        map.serialize_entry("collector", self.collector)?;
        map.serialize_entry("ts", &self.timestamps.utc_string())?;
        map.serialize_entry("ts_local", &self.timestamps.local_string())?;
        for (name, reading) in self.readings.iter() {
            map.serialize_entry(name, &reading)?;
        }
        map.end()
    }
}
