//! The object model (spec §3 "Object header" and per-type payloads).
//!
//! Every logical construct on disk is an Object: a 16-byte header (type, compression
//! flags, total size) followed by a type-specific payload. Objects are never mutated
//! except for the specific chain-next pointers and counters spec §3 names; they're never
//! freed.

pub use self::data::*;
pub use self::entry::*;
pub use self::entry_array::*;
pub use self::field::*;
pub use self::tag::*;

mod data;
mod entry;
mod entry_array;
mod field;
mod tag;

use deku::prelude::*;

use crate::error::{JournalError, Result};

/// One of the seven kinds of object the format defines, or an unrecognized byte (objects
/// of unknown type must be skipped, never treated as fatal, since the type byte has a
/// reserved range for future additions).
#[derive(Debug, Clone, Copy, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(id_type = "u8", endian = "endian", ctx = "endian: deku::ctx::Endian")]
pub enum ObjectType {
    #[deku(id = "1")]
    Data,
    #[deku(id = "2")]
    Field,
    #[deku(id = "3")]
    Entry,
    #[deku(id = "4")]
    DataHashTable,
    #[deku(id = "5")]
    FieldHashTable,
    #[deku(id = "6")]
    EntryArray,
    #[deku(id = "7")]
    Tag,
    #[deku(id_pat = "_")]
    Unknown(u8),
}

/// Compression codec used for a Data object's payload, packed into 3 bits of the object
/// flags byte (spec §9 "Dynamic dispatch").
#[derive(Debug, Clone, Copy, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(id_type = "u8", endian = "endian", ctx = "endian: deku::ctx::Endian")]
#[repr(u8)]
pub enum DataCompression {
    None = 0b000,
    Xz = 0b001,
    Lz4 = 0b010,
    Zstd = 0b100,
}

#[derive(Debug, Clone, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct ObjectHeader {
    pub r#type: ObjectType,

    #[deku(pad_bytes_after = "6")]
    pub compression: DataCompression,

    /// Total size including this 16-byte header.
    pub size: u64,
}

pub const OBJECT_HEADER_SIZE: u64 = 16;
const _: [(); OBJECT_HEADER_SIZE as usize] = [(); 16];

impl ObjectHeader {
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let (_, header) = <ObjectHeader as DekuContainerRead>::from_bytes((data, 0))
            .map_err(|e| JournalError::BadMessage(format!("object header: {e}")))?;
        Ok(header)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        <ObjectHeader as DekuContainerWrite>::to_bytes(self)
            .map_err(|e| JournalError::BadMessage(format!("object header: {e}")))
    }

    pub const fn payload_size(&self) -> u64 {
        self.size.saturating_sub(OBJECT_HEADER_SIZE)
    }

    pub fn check_type(self, expected: ObjectType) -> Result<Self> {
        if self.r#type != expected {
            Err(JournalError::BadMessage(format!(
                "expected object of type {expected:?}, found {:?}",
                self.r#type
            )))
        } else {
            Ok(self)
        }
    }
}

/// Shared sync parse/serialize helpers for a fixed-size object payload.
pub(crate) trait Payload: Sized {
    fn parse(data: &[u8]) -> Result<Self>;
    fn serialize(&self) -> Result<Vec<u8>>;
}

impl<T> Payload for T
where
    T: for<'a> DekuContainerRead<'a> + DekuContainerWrite,
{
    fn parse(data: &[u8]) -> Result<Self> {
        let (_, value) = T::from_bytes((data, 0))
            .map_err(|e| JournalError::BadMessage(format!("object payload: {e}")))?;
        Ok(value)
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        self.to_bytes()
            .map_err(|e| JournalError::BadMessage(format!("object payload: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_header_round_trips() {
        let header = ObjectHeader {
            r#type: ObjectType::Data,
            compression: DataCompression::Zstd,
            size: 128,
        };
        let bytes = header.to_bytes().unwrap();
        assert_eq!(bytes.len(), OBJECT_HEADER_SIZE as usize);
        let parsed = ObjectHeader::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parsed.payload_size(), 112);
    }

    #[test]
    fn check_type_rejects_mismatch() {
        let header = ObjectHeader {
            r#type: ObjectType::Field,
            compression: DataCompression::None,
            size: 32,
        };
        assert!(header.check_type(ObjectType::Data).is_err());
    }
}
