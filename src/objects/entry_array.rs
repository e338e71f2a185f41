//! An Entry-array segment: part of a singly linked list of entry offsets (spec §4.4).
//!
//! Used for both the global chain (every entry, in append order) and per-data chains
//! (every entry referencing a given value).

use std::num::NonZeroU64;

use deku::prelude::*;

#[derive(Debug, Clone, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct EntryArrayObjectHeader {
    #[deku(map = "|field: u64| -> Result<_, DekuError> { Ok(NonZeroU64::new(field)) }")]
    pub next_entry_array_offset: Option<NonZeroU64>,
}

pub const ENTRY_ARRAY_HEADER_SIZE: u64 = 8;
const _: [(); ENTRY_ARRAY_HEADER_SIZE as usize] = [(); 8];

#[derive(Debug, Clone, Copy, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct EntryArrayItem {
    pub entry_offset: u64,
}

pub const ENTRY_ARRAY_ITEM_SIZE: u64 = 8;
