//! The Data object: one per unique `name=value` byte sequence (spec §3).

use deku::prelude::*;

#[derive(Debug, Clone, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct DataObjectHeader {
    /// Content hash of the payload (keyed or legacy, per the file's flags).
    pub hash: u64,
    /// Next Data object in this hash bucket's chain.
    pub next_hash_offset: u64,
    /// Next Data object sharing the same field name.
    pub next_field_offset: u64,
    /// The Field object this Data belongs to.
    pub head_data_offset: u64,
    /// First entry referencing this value ("plus-one" inline slot of the per-data chain).
    pub entry_offset: u64,
    /// Head of the rest of the per-data entry-array chain.
    pub entry_array_offset: u64,
    /// Number of entries referencing this value.
    pub n_entries: u64,
}

pub const DATA_OBJECT_HEADER_SIZE: u64 = 56;
const _: [(); DATA_OBJECT_HEADER_SIZE as usize] = [(); 56];

impl DataObjectHeader {
    pub fn new(hash: u64, head_data_offset: u64) -> Self {
        Self {
            hash,
            next_hash_offset: 0,
            next_field_offset: 0,
            head_data_offset,
            entry_offset: 0,
            entry_array_offset: 0,
            n_entries: 0,
        }
    }
}
