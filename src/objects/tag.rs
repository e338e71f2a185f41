//! The Tag object: an opaque sealing record (spec §6.5). FSS/HMAC sealing itself is a
//! non-goal; the shape is kept so a file carrying tags from elsewhere still parses.

use std::num::NonZeroU64;

use deku::prelude::*;

pub const TAG_LENGTH: u64 = 256 / 8;

#[derive(Debug, Clone, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct TagObjectHeader {
    pub seqnum: NonZeroU64,
    pub epoch: u64,
    pub tag: [u8; TAG_LENGTH as usize],
}

pub const TAG_OBJECT_HEADER_SIZE: u64 = 8 + 8 + TAG_LENGTH;
const _: [(); TAG_OBJECT_HEADER_SIZE as usize] = [(); 48];
