//! Small `deku` reader/writer shims shared by object payloads: microsecond timestamps
//! encode as a plain `u64`, with `0` reserved to mean "absent" for the optional fields.

use deku::{ctx::Endian, no_std_io, prelude::*};
use jiff::Timestamp;

use crate::layout::valid_realtime;

pub fn reader_realtime<R: no_std_io::Read + no_std_io::Seek>(
    reader: &mut Reader<R>,
) -> Result<Timestamp, DekuError> {
    let value = u64::from_reader_with_ctx(reader, Endian::Little)?;
    if !valid_realtime(value) {
        return Err(DekuError::Assertion(
            format!("realtime {value} fails VALID_REALTIME").into(),
        ));
    }
    Timestamp::from_microsecond(value as i64)
        .map_err(|err| DekuError::Assertion(format!("invalid timestamp: {err}").into()))
}

pub fn writer_realtime<W: std::io::Write + std::io::Seek>(
    writer: &mut Writer<W>,
    field: &Timestamp,
) -> Result<(), DekuError> {
    let value: u64 = field
        .as_microsecond()
        .try_into()
        .map_err(|_| DekuError::Assertion("timestamp does not fit in u64 microseconds".into()))?;
    value.to_writer(writer, Endian::Little)
}

pub fn reader_realtime_opt<R: no_std_io::Read + no_std_io::Seek>(
    reader: &mut Reader<R>,
) -> Result<Option<Timestamp>, DekuError> {
    let value = u64::from_reader_with_ctx(reader, Endian::Little)?;
    if value == 0 {
        return Ok(None);
    }
    if !valid_realtime(value) {
        return Err(DekuError::Assertion(
            format!("realtime {value} fails VALID_REALTIME").into(),
        ));
    }
    Timestamp::from_microsecond(value as i64)
        .map_err(|err| DekuError::Assertion(format!("invalid timestamp: {err}").into()))
        .map(Some)
}

pub fn writer_realtime_opt<W: std::io::Write + std::io::Seek>(
    writer: &mut Writer<W>,
    field: &Option<Timestamp>,
) -> Result<(), DekuError> {
    let value: u64 = field.map(|ts| ts.as_microsecond()).unwrap_or_default() as u64;
    value.to_writer(writer, Endian::Little)
}
