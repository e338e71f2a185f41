//! The Entry object: an ordered, deduplicated set of references to Data objects plus
//! timestamps and identity (spec §3, §4.5).

use std::num::{NonZeroU128, NonZeroU64};

use deku::prelude::*;
use jiff::Timestamp;

use crate::monotonic::Monotonic;

#[derive(Debug, Clone, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct EntryObjectHeader {
    pub seqnum: NonZeroU64,

    #[deku(
        reader = "crate::deku_helpers::reader_realtime(deku::reader)",
        writer = "crate::deku_helpers::writer_realtime(deku::writer, &self.realtime)"
    )]
    pub realtime: Timestamp,

    pub monotonic: Monotonic,
    pub boot_id: NonZeroU128,
    /// XOR of the per-value legacy hash of every item, independent of which hash function
    /// the data table itself uses (spec §4.5 step 4) — cursors compare this across files
    /// that may use different keyed-hash keys.
    pub xor_hash: u64,
}

pub const ENTRY_OBJECT_HEADER_SIZE: u64 = 48;
const _: [(); ENTRY_OBJECT_HEADER_SIZE as usize] = [(); 48];

/// One item in an entry's reference array: an offset to a Data object, plus that Data
/// object's own stored hash (duplicated here so a reader can spot a corrupted Data object
/// without dereferencing it).
#[derive(Debug, Clone, Copy, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct EntryObjectItem {
    pub data_offset: u64,
    pub hash: u64,
}

pub const ENTRY_OBJECT_ITEM_SIZE: u64 = 16;
const _: [(); ENTRY_OBJECT_ITEM_SIZE as usize] = [(); 16];
