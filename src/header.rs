//! The fixed `Header` at file offset 0 (spec §3).
//!
//! `header_size` may grow in future versions of this format; readers must keep working
//! against a larger `header_size` by gating access to later fields on
//! `header_size >= offsetof(field) + sizeof(field)` (spec §6.1). That ladder is encoded
//! below with `#[deku(cond = "...")]`, the same technique the original skeleton used.

use std::num::{NonZeroU128, NonZeroU64};

use deku::{ctx::Endian, no_std_io, prelude::*};
use flagset::{flags, FlagSet};
use jiff::Timestamp;

use crate::deku_helpers::{reader_realtime_opt, writer_realtime_opt};
use crate::error::{JournalError, Result};
use crate::layout::valid64;

/// Header through `n_objects`; every file, however old, has at least this much.
pub const MIN_HEADER_SIZE: u64 = 208;
/// Header through `field_hash_chain_depth`; the newest layout this crate knows how to write.
pub const MAX_HEADER_SIZE: u64 = 256;

#[derive(Debug, Clone, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "little", magic = b"LPKSHHRH")]
pub struct Header {
    #[deku(
        reader = "CompatibleFlag::deku_reader(deku::reader)",
        writer = "CompatibleFlag::deku_writer(deku::writer, &self.compatible_flags)"
    )]
    pub compatible_flags: FlagSet<CompatibleFlag>,

    #[deku(
        reader = "IncompatibleFlag::deku_reader(deku::reader)",
        writer = "IncompatibleFlag::deku_writer(deku::writer, &self.incompatible_flags)"
    )]
    pub incompatible_flags: FlagSet<IncompatibleFlag>,

    /// The read/write state of the journal file.
    #[deku(pad_bytes_after = "7")]
    pub state: State,

    /// Unique identifier of this file, generated randomly when it is created.
    pub file_id: u128,

    /// Identifier of the machine that created the file. Writing is only allowed from this
    /// machine.
    pub machine_id: u128,

    /// Boot ID of the last entry appended, or of the current boot if the file is empty.
    /// `0` means "no boot recorded yet".
    pub boot_id: u128,

    /// Identifier shared by every file in a rotation lineage, inherited from the template
    /// on rotate.
    pub seqnum_id: NonZeroU128,

    pub header_size: NonZeroU64,
    pub arena_size: NonZeroU64,

    pub data_hash_table_offset: NonZeroU64,
    pub data_hash_table_size: NonZeroU64,
    pub field_hash_table_offset: NonZeroU64,
    pub field_hash_table_size: NonZeroU64,

    /// Offset of the last allocated object; `header_size` if no objects yet beyond the hash
    /// tables.
    pub tail_object_offset: NonZeroU64,

    pub n_objects: NonZeroU64,
    pub n_entries: u64,

    /// `0` if the file is empty.
    pub tail_entry_seqnum: u64,
    /// `0` if the file is empty.
    pub head_entry_seqnum: u64,

    /// Head of the global entry-array chain. There's always at least one entry array.
    pub entry_array_offset: NonZeroU64,

    #[deku(
        reader = "reader_realtime_opt(deku::reader)",
        writer = "writer_realtime_opt(deku::writer, &self.head_entry_realtime)"
    )]
    pub head_entry_realtime: Option<Timestamp>,

    #[deku(
        reader = "reader_realtime_opt(deku::reader)",
        writer = "writer_realtime_opt(deku::writer, &self.tail_entry_realtime)"
    )]
    pub tail_entry_realtime: Option<Timestamp>,

    /// `0` if the file is empty.
    pub tail_entry_monotonic: u64,

    /// `None` if this file was created before this field existed in the format.
    #[deku(cond = "header_size.get() > 208")]
    pub n_data: Option<u64>,

    #[deku(cond = "header_size.get() > 216")]
    pub n_fields: Option<u64>,

    #[deku(cond = "header_size.get() > 224")]
    pub n_tags: Option<u64>,

    #[deku(cond = "header_size.get() > 232")]
    pub n_entry_arrays: Option<u64>,

    /// Longest chain ever observed in the data hash table; used by `rotate_suggested`.
    #[deku(cond = "header_size.get() > 240")]
    pub data_hash_chain_depth: Option<u64>,

    #[deku(cond = "header_size.get() > 248")]
    pub field_hash_chain_depth: Option<u64>,
}

/// Bit mask of every compatible flag this crate understands. Bits outside this mask are
/// tolerated on read (spec §3: "unknown compatible flags ⇒ refuse writes", not reads) and
/// rejected only when a caller asks to open the file writable.
pub const KNOWN_COMPATIBLE_BITS: u32 = CompatibleFlag::Sealed as u32;

/// Bit mask of every incompatible flag this crate understands. Any other bit set anywhere
/// in the file must cause the open to be refused outright (spec §3).
pub const KNOWN_INCOMPATIBLE_BITS: u32 = IncompatibleFlag::CompressedXz as u32
    | IncompatibleFlag::CompressedLz4 as u32
    | IncompatibleFlag::KeyedHash as u32
    | IncompatibleFlag::CompressedZstd as u32;

/// Byte offset of the compatible-flags word, just past the 8-byte magic signature.
const COMPATIBLE_FLAGS_OFFSET: usize = 8;
const INCOMPATIBLE_FLAGS_OFFSET: usize = 12;

impl Header {
    /// Parse a header from its raw bytes (as mapped from file offset 0).
    ///
    /// Unknown incompatible flags are checked against the raw bytes *before* handing off to
    /// `deku`, so the distinction in spec §7 between "protocol not supported" (unknown
    /// incompatible flag) and "bad message" (any other structural violation) survives —
    /// `deku`'s own flag parsing only ever sees bits it already knows about.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < INCOMPATIBLE_FLAGS_OFFSET + 4 {
            return Err(JournalError::NoData("header truncated before flags".into()));
        }
        let incompatible = u32::from_le_bytes(
            data[INCOMPATIBLE_FLAGS_OFFSET..INCOMPATIBLE_FLAGS_OFFSET + 4]
                .try_into()
                .unwrap(),
        );
        if incompatible & !KNOWN_INCOMPATIBLE_BITS != 0 {
            return Err(JournalError::ProtocolNotSupported(format!(
                "unknown incompatible flags: {:#x}",
                incompatible & !KNOWN_INCOMPATIBLE_BITS
            )));
        }

        let (_, header) = <Header as DekuContainerRead>::from_bytes((data, 0))
            .map_err(|e| JournalError::BadMessage(format!("header: {e}")))?;
        header.validate_structure()?;
        Ok(header)
    }

    /// Whether this header carries a compatible flag this crate doesn't know about. Safe to
    /// ignore for reading; a writable open must refuse instead (spec §3).
    pub fn has_unknown_compatible_flags(data: &[u8]) -> bool {
        let Some(bytes) = data.get(COMPATIBLE_FLAGS_OFFSET..COMPATIBLE_FLAGS_OFFSET + 4) else {
            return false;
        };
        let raw = u32::from_le_bytes(bytes.try_into().unwrap());
        raw & !KNOWN_COMPATIBLE_BITS != 0
    }

    /// Serialize this header back to bytes (always `self.header_size` long, zero-padded).
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = <Header as DekuContainerWrite>::to_bytes(self)
            .map_err(|e| JournalError::BadMessage(format!("header: {e}")))?;
        bytes.resize(self.header_size.get() as usize, 0);
        Ok(bytes)
    }

    /// Structural invariants that must hold independent of what the header *means*:
    /// every section offset is `VALID64` and inside the arena, and `header_size` meets the
    /// documented minimum. `state` is already constrained to a known value by the enum
    /// parse itself.
    fn validate_structure(&self) -> Result<()> {
        for offset in [
            self.data_hash_table_offset.get(),
            self.field_hash_table_offset.get(),
            self.tail_object_offset.get(),
            self.entry_array_offset.get(),
        ] {
            if !valid64(offset) || offset < self.header_size.get() {
                return Err(JournalError::BadMessage(format!(
                    "offset {offset} is not a valid in-arena offset"
                )));
            }
        }
        if self.header_size.get() < MIN_HEADER_SIZE {
            return Err(JournalError::BadMessage(format!(
                "header_size {} below minimum {MIN_HEADER_SIZE}",
                self.header_size
            )));
        }
        Ok(())
    }

    pub fn is_keyed_hash(&self) -> bool {
        self.incompatible_flags.contains(IncompatibleFlag::KeyedHash)
    }

    pub fn is_sealed(&self) -> bool {
        self.compatible_flags.contains(CompatibleFlag::Sealed)
    }

    /// How full the data hash table is, or `None` on files predating `n_data`.
    pub fn data_fill_level(&self, bucket_count: u64) -> Option<f64> {
        self.n_data.map(|n| n as f64 / bucket_count as f64)
    }

    pub fn field_fill_level(&self, bucket_count: u64) -> Option<f64> {
        self.n_fields.map(|n| n as f64 / bucket_count as f64)
    }
}

flags! {
    /// Flags safe to ignore if a reader doesn't recognize them.
    pub enum CompatibleFlag: u32 {
        /// The file includes `Tag` objects for forward-secure sealing (spec §6.5). This
        /// crate never sets it; the hook is a no-op.
        Sealed = 0b1,
    }

    /// Flags that must be understood, or the file must be rejected entirely.
    pub enum IncompatibleFlag: u32 {
        CompressedXz   = 0b0001,
        CompressedLz4  = 0b0010,
        KeyedHash      = 0b0100,
        CompressedZstd = 0b1000,
    }
}

impl CompatibleFlag {
    fn deku_reader<R: no_std_io::Read + no_std_io::Seek>(
        reader: &mut Reader<R>,
    ) -> std::result::Result<FlagSet<Self>, DekuError> {
        let value = u32::from_reader_with_ctx(reader, Endian::Little)?;
        // Unknown compatible flags are tolerated at parse time; writes against them are
        // refused later, at the point a mutation is attempted (spec §3).
        Ok(FlagSet::new_truncated(value))
    }

    fn deku_writer<W: std::io::Write + std::io::Seek>(
        writer: &mut Writer<W>,
        field: &FlagSet<Self>,
    ) -> std::result::Result<(), DekuError> {
        field.bits().to_writer(writer, Endian::Little)
    }
}

impl IncompatibleFlag {
    fn deku_reader<R: no_std_io::Read + no_std_io::Seek>(
        reader: &mut Reader<R>,
    ) -> std::result::Result<FlagSet<Self>, DekuError> {
        let value = u32::from_reader_with_ctx(reader, Endian::Little)?;
        FlagSet::new(value).map_err(|_| DekuError::Assertion("unknown incompatible flags".into()))
    }

    fn deku_writer<W: std::io::Write + std::io::Seek>(
        writer: &mut Writer<W>,
        field: &FlagSet<Self>,
    ) -> std::result::Result<(), DekuError> {
        field.bits().to_writer(writer, Endian::Little)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(id_type = "u8", endian = "endian", ctx = "endian: deku::ctx::Endian")]
#[repr(u8)]
pub enum State {
    /// Closed for writing; safe to read, safe to bring back online.
    Offline = 0,
    /// Open for writing by some process.
    Online = 1,
    /// Closed for writing and superseded by a successor file.
    Archived = 2,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> Header {
        Header {
            compatible_flags: FlagSet::default(),
            incompatible_flags: IncompatibleFlag::KeyedHash.into(),
            state: State::Online,
            file_id: 1,
            machine_id: 2,
            boot_id: 3,
            seqnum_id: NonZeroU128::new(4).unwrap(),
            header_size: NonZeroU64::new(MAX_HEADER_SIZE).unwrap(),
            arena_size: NonZeroU64::new(4096).unwrap(),
            data_hash_table_offset: NonZeroU64::new(MAX_HEADER_SIZE).unwrap(),
            data_hash_table_size: NonZeroU64::new(16).unwrap(),
            field_hash_table_offset: NonZeroU64::new(MAX_HEADER_SIZE + 16).unwrap(),
            field_hash_table_size: NonZeroU64::new(16).unwrap(),
            tail_object_offset: NonZeroU64::new(MAX_HEADER_SIZE).unwrap(),
            n_objects: NonZeroU64::new(2).unwrap(),
            n_entries: 0,
            tail_entry_seqnum: 0,
            head_entry_seqnum: 0,
            entry_array_offset: NonZeroU64::new(MAX_HEADER_SIZE + 32).unwrap(),
            head_entry_realtime: None,
            tail_entry_realtime: None,
            tail_entry_monotonic: 0,
            n_data: Some(0),
            n_fields: Some(0),
            n_tags: Some(0),
            n_entry_arrays: Some(1),
            data_hash_chain_depth: Some(0),
            field_hash_chain_depth: Some(0),
        }
    }

    #[test]
    fn round_trips_through_bytes() {
        let header = sample_header();
        let bytes = header.to_bytes().unwrap();
        assert_eq!(bytes.len(), MAX_HEADER_SIZE as usize);
        let parsed = Header::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn rejects_misaligned_offset() {
        let mut header = sample_header();
        header.tail_object_offset = NonZeroU64::new(MAX_HEADER_SIZE + 1).unwrap();
        let bytes = header.to_bytes().unwrap();
        assert!(Header::from_bytes(&bytes).is_err());
    }

    #[test]
    fn older_header_size_omits_tail_fields() {
        let mut header = sample_header();
        header.header_size = NonZeroU64::new(MIN_HEADER_SIZE).unwrap();
        header.n_data = None;
        header.n_fields = None;
        header.n_tags = None;
        header.n_entry_arrays = None;
        header.data_hash_chain_depth = None;
        header.field_hash_chain_depth = None;
        let bytes = header.to_bytes().unwrap();
        assert_eq!(bytes.len(), MIN_HEADER_SIZE as usize);
        let parsed = Header::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.n_data, None);
    }
}
