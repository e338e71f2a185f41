//! File lifecycle (spec §4.7): open/create, append, seek, rotate, dispose, and the
//! online/offline transitions that tie every other module together into one usable
//! journal file object.

use std::num::{NonZeroU128, NonZeroU64};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use jiff::Timestamp;
use parking_lot::Mutex;

use crate::chain::{self, Direction, Probe};
use crate::chain_cache::{ChainCache, ChainProgress};
use crate::codec::{self, Codec, Lz4Codec, NoneCodec, XzCodec, ZstdCodec};
use crate::error::{JournalError, Result};
use crate::hash;
use crate::header::{CompatibleFlag, Header, IncompatibleFlag, State, MAX_HEADER_SIZE};
use crate::heap::{statvfs_free_bytes, Heap, Metrics};
use crate::layout::{valid_monotonic, valid_realtime};
use crate::mmap::{TypeContext, WindowCache};
use crate::monotonic::Monotonic;
use crate::naming;
use crate::objects::{
    is_valid_field_name, DataCompression, DataObjectHeader, EntryObjectHeader, EntryObjectItem,
    FieldObjectHeader, ObjectHeader, ObjectType, Payload, DATA_OBJECT_HEADER_SIZE,
    ENTRY_ARRAY_HEADER_SIZE, ENTRY_ARRAY_ITEM_SIZE, ENTRY_OBJECT_HEADER_SIZE,
    ENTRY_OBJECT_ITEM_SIZE, FIELD_OBJECT_HEADER_SIZE, OBJECT_HEADER_SIZE,
};
use crate::offline::{OfflineActions, OfflineMachine};
use crate::tables::{HashItem, HashTable, ObjectArena, HASH_ITEM_SIZE};
use crate::writer::options::{Compression, CreateOptions};

/// Initial capacity (in entry offsets) of the very first global entry-array segment.
const INITIAL_ENTRY_ARRAY_CAPACITY: u64 = 4;

fn compression_to_flag(compression: Compression) -> IncompatibleFlag {
    match compression {
        Compression::Xz => IncompatibleFlag::CompressedXz,
        Compression::Lz4 => IncompatibleFlag::CompressedLz4,
        Compression::Zstd => IncompatibleFlag::CompressedZstd,
    }
}

fn compression_to_data_compression(compression: Compression) -> DataCompression {
    match compression {
        Compression::Xz => DataCompression::Xz,
        Compression::Lz4 => DataCompression::Lz4,
        Compression::Zstd => DataCompression::Zstd,
    }
}

fn codec_for(compression: DataCompression) -> &'static dyn Codec {
    match compression {
        DataCompression::None => &NoneCodec,
        DataCompression::Xz => &XzCodec,
        DataCompression::Lz4 => &Lz4Codec,
        // Every `ZstdCodec` instance with the default level behaves identically, and the
        // trait object only ever needs `compress`/`decompress`, so a single static with the
        // default level stands in for the whole variant.
        DataCompression::Zstd => {
            static DEFAULT_ZSTD: ZstdCodec = ZstdCodec { level: 3 };
            &DEFAULT_ZSTD
        }
    }
}

fn now_micros() -> u64 {
    Timestamp::now().as_microsecond().max(0) as u64
}

/// The seam between the generic hash-table walk in `tables.rs` and this file's mmap
/// windows. One instance per table (data, field); `table_ctx` picks which window slot the
/// bucket array itself lives in, while chain links are always resolved through the object's
/// own type.
struct FileArena<'a> {
    window: &'a WindowCache,
    table_ctx: TypeContext,
}

impl ObjectArena for FileArena<'_> {
    fn read_hash_item(&self, table_offset: u64, bucket: u64) -> Result<HashItem> {
        let bytes = self
            .window
            .map(self.table_ctx, table_offset + bucket * HASH_ITEM_SIZE, HASH_ITEM_SIZE, true)?;
        HashItem::parse(&bytes)
    }

    fn write_hash_item(&mut self, table_offset: u64, bucket: u64, item: HashItem) -> Result<()> {
        let mut bytes = self
            .window
            .map_mut(self.table_ctx, table_offset + bucket * HASH_ITEM_SIZE, HASH_ITEM_SIZE, true)?;
        bytes.copy_from_slice(&item.serialize()?);
        Ok(())
    }

    fn read_chain_link(&self, offset: u64, object_type: ObjectType) -> Result<(u64, u64)> {
        match object_type {
            ObjectType::Data => {
                let bytes = self.window.map(TypeContext::Data, offset + OBJECT_HEADER_SIZE, DATA_OBJECT_HEADER_SIZE, false)?;
                let h = DataObjectHeader::parse(&bytes)?;
                Ok((h.hash, h.next_hash_offset))
            }
            ObjectType::Field => {
                let bytes = self.window.map(TypeContext::Field, offset + OBJECT_HEADER_SIZE, FIELD_OBJECT_HEADER_SIZE, false)?;
                let h = FieldObjectHeader::parse(&bytes)?;
                Ok((h.hash, h.next_hash_offset))
            }
            other => Err(JournalError::BadMessage(format!("object {other:?} does not participate in a hash chain"))),
        }
    }

    fn write_chain_next(&mut self, offset: u64, object_type: ObjectType, next: u64) -> Result<()> {
        let ctx = match object_type {
            ObjectType::Data => TypeContext::Data,
            ObjectType::Field => TypeContext::Field,
            other => return Err(JournalError::BadMessage(format!("object {other:?} does not participate in a hash chain"))),
        };
        // `next_hash_offset` is the second field of both Data and Field payloads, right
        // after the 8-byte hash.
        let mut bytes = self.window.map_mut(ctx, offset + OBJECT_HEADER_SIZE + 8, 8, false)?;
        bytes.copy_from_slice(&next.to_le_bytes());
        Ok(())
    }

    fn payload_equal(&self, data_offset: u64, payload: &[u8]) -> Result<bool> {
        let object_header = {
            let bytes = self.window.map(TypeContext::Data, data_offset, OBJECT_HEADER_SIZE, false)?;
            ObjectHeader::from_bytes(&bytes)?.check_type(ObjectType::Data)?
        };
        let payload_offset = data_offset + OBJECT_HEADER_SIZE + DATA_OBJECT_HEADER_SIZE;
        let stored_len = object_header.payload_size().saturating_sub(DATA_OBJECT_HEADER_SIZE);
        let stored = self.window.map(TypeContext::Data, payload_offset, stored_len, false)?;
        let decompressed = codec::decompress(object_header.compression, &stored, payload.len())?;
        Ok(decompressed == payload)
    }
}

fn read_data_header(window: &WindowCache, offset: u64) -> Result<DataObjectHeader> {
    let bytes = window.map(TypeContext::Data, offset + OBJECT_HEADER_SIZE, DATA_OBJECT_HEADER_SIZE, false)?;
    DataObjectHeader::parse(&bytes)
}

fn write_data_header(window: &WindowCache, offset: u64, header: &DataObjectHeader) -> Result<()> {
    let mut bytes = window.map_mut(TypeContext::Data, offset + OBJECT_HEADER_SIZE, DATA_OBJECT_HEADER_SIZE, false)?;
    bytes.copy_from_slice(&header.serialize()?);
    Ok(())
}

fn read_field_header(window: &WindowCache, offset: u64) -> Result<FieldObjectHeader> {
    let bytes = window.map(TypeContext::Field, offset + OBJECT_HEADER_SIZE, FIELD_OBJECT_HEADER_SIZE, false)?;
    FieldObjectHeader::parse(&bytes)
}

fn write_field_header(window: &WindowCache, offset: u64, header: &FieldObjectHeader) -> Result<()> {
    let mut bytes = window.map_mut(TypeContext::Field, offset + OBJECT_HEADER_SIZE, FIELD_OBJECT_HEADER_SIZE, false)?;
    bytes.copy_from_slice(&header.serialize()?);
    Ok(())
}

fn read_entry_object_header(window: &WindowCache, offset: u64) -> Result<EntryObjectHeader> {
    let object_header = {
        let bytes = window.map(TypeContext::Entry, offset, OBJECT_HEADER_SIZE, false)?;
        ObjectHeader::from_bytes(&bytes)?.check_type(ObjectType::Entry)?
    };
    let bytes = window.map(TypeContext::Entry, offset + OBJECT_HEADER_SIZE, ENTRY_OBJECT_HEADER_SIZE, false)?;
    let entry = EntryObjectHeader::parse(&bytes)?;
    let _ = object_header;
    Ok(entry)
}

fn read_entry_items(window: &WindowCache, offset: u64) -> Result<Vec<EntryObjectItem>> {
    let object_header = {
        let bytes = window.map(TypeContext::Entry, offset, OBJECT_HEADER_SIZE, false)?;
        ObjectHeader::from_bytes(&bytes)?.check_type(ObjectType::Entry)?
    };
    let n_items = object_header.payload_size().saturating_sub(ENTRY_OBJECT_HEADER_SIZE) / ENTRY_OBJECT_ITEM_SIZE;
    let mut items = Vec::with_capacity(n_items as usize);
    let mut item_offset = offset + OBJECT_HEADER_SIZE + ENTRY_OBJECT_HEADER_SIZE;
    for _ in 0..n_items {
        let bytes = window.map(TypeContext::Entry, item_offset, ENTRY_OBJECT_ITEM_SIZE, false)?;
        items.push(EntryObjectItem::parse(&bytes)?);
        item_offset += ENTRY_OBJECT_ITEM_SIZE;
    }
    Ok(items)
}

/// Read and decompress a Data object's stored payload (the full `name=value` bytes).
fn read_data_payload(window: &WindowCache, data_offset: u64) -> Result<Vec<u8>> {
    let object_header = {
        let bytes = window.map(TypeContext::Data, data_offset, OBJECT_HEADER_SIZE, false)?;
        ObjectHeader::from_bytes(&bytes)?.check_type(ObjectType::Data)?
    };
    let payload_offset = data_offset + OBJECT_HEADER_SIZE + DATA_OBJECT_HEADER_SIZE;
    let stored_len = object_header.payload_size().saturating_sub(DATA_OBJECT_HEADER_SIZE);
    let stored = window.map(TypeContext::Data, payload_offset, stored_len, false)?;
    let size_hint = (stored_len as usize).saturating_mul(4).max(64);
    codec::decompress(object_header.compression, &stored, size_hint)
}

/// A cursor coordinate, comparable across files per spec §4.5 "Cursor compare".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    pub seqnum_id: u128,
    pub seqnum: u64,
    pub boot_id: u128,
    pub monotonic: u64,
    pub realtime: u64,
    pub xor_hash: u64,
}

/// Compare two cursor locations using the priority spec §4.5 documents: same lineage
/// compares by seqnum; else same boot compares by monotonic time; else falls back to
/// realtime, and finally xor_hash as a last-resort tiebreak.
pub fn compare_locations(a: &Location, b: &Location) -> std::cmp::Ordering {
    if a.seqnum_id == b.seqnum_id {
        return a.seqnum.cmp(&b.seqnum);
    }
    if a.boot_id == b.boot_id {
        return a.monotonic.cmp(&b.monotonic);
    }
    if a.realtime != b.realtime {
        return a.realtime.cmp(&b.realtime);
    }
    a.xor_hash.cmp(&b.xor_hash)
}

struct JournalOfflineActions {
    window: Arc<WindowCache>,
    header: Arc<Mutex<Header>>,
    target: State,
}

impl OfflineActions for JournalOfflineActions {
    fn sync(&mut self) -> Result<()> {
        self.window.flush_all()
    }

    fn mark_offline_and_sync(&mut self) -> Result<()> {
        let bytes = {
            let mut header = self.header.lock();
            header.state = self.target;
            header.to_bytes()?
        };
        let mut map = self.window.map_mut(TypeContext::Header, 0, bytes.len() as u64, true)?;
        map.copy_from_slice(&bytes);
        drop(map);
        self.window.flush_all()
    }
}

/// One open journal file: header, mmap windows, object heap policy, and the online/offline
/// coordination needed to operate on it safely (spec §4.7).
pub struct Journal {
    path: Mutex<PathBuf>,
    window: Arc<WindowCache>,
    header: Arc<Mutex<Header>>,
    metrics: Metrics,
    keyed_hash: bool,
    compress_threshold: u64,
    codec: DataCompression,
    chain_cache: Mutex<ChainCache>,
    offline: OfflineMachine,
    writable: bool,
    pending_archive: AtomicBool,
    cursor: Mutex<Option<Location>>,
}

impl Journal {
    fn data_table(&self, header: &Header) -> HashTable {
        HashTable::new(
            header.data_hash_table_offset.get(),
            header.data_hash_table_size.get() / HASH_ITEM_SIZE,
            ObjectType::Data,
        )
    }

    fn field_table(&self, header: &Header) -> HashTable {
        HashTable::new(
            header.field_hash_table_offset.get(),
            header.field_hash_table_size.get() / HASH_ITEM_SIZE,
            ObjectType::Field,
        )
    }

    /// Create a brand new journal file at `path`. `template` inherits `seqnum_id` and
    /// `tail_entry_seqnum` so a rotation lineage stays addressable by one coordinate space
    /// (spec §4.7).
    #[tracing::instrument(level = "debug", skip(options, metrics, template), fields(path = %path.display()))]
    pub fn create_new(path: &Path, options: &CreateOptions, metrics: Metrics, template: Option<&Journal>) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;

        let n_data_buckets = options.data_hash_table_capacity.max(1);
        let n_field_buckets = options.field_hash_table_capacity.max(1);
        let header_size = MAX_HEADER_SIZE;

        file.set_len(crate::layout::page_align(header_size))?;

        let (seqnum_id, tail_entry_seqnum) = match template {
            Some(t) => {
                let h = t.header.lock();
                (h.seqnum_id, h.tail_entry_seqnum)
            }
            None => (NonZeroU128::new(rand::random::<u128>().max(1)).unwrap(), 0),
        };

        // Keyed hashing is always on for newly created files (spec §9 open question:
        // no env var or per-call opt-out, since legacy-hash files only arise from files
        // written by pre-keyed-hash versions of the format).
        let keyed_hash = true;
        let mut incompatible_flags: flagset::FlagSet<IncompatibleFlag> = IncompatibleFlag::KeyedHash.into();
        let data_compression = options.compression.map(compression_to_data_compression).unwrap_or(DataCompression::None);
        if let Some(compression) = options.compression {
            incompatible_flags |= compression_to_flag(compression);
        }

        let mut header = Header {
            compatible_flags: if options.seal { CompatibleFlag::Sealed.into() } else { flagset::FlagSet::default() },
            incompatible_flags,
            state: State::Online,
            file_id: rand::random::<u128>(),
            machine_id: options.machine_id,
            boot_id: options.boot_id,
            seqnum_id,
            header_size: NonZeroU64::new(header_size).unwrap(),
            arena_size: NonZeroU64::new(1).unwrap(),
            data_hash_table_offset: NonZeroU64::new(header_size).unwrap(),
            data_hash_table_size: NonZeroU64::new(n_data_buckets * HASH_ITEM_SIZE).unwrap(),
            field_hash_table_offset: NonZeroU64::new(header_size).unwrap(),
            field_hash_table_size: NonZeroU64::new(n_field_buckets * HASH_ITEM_SIZE).unwrap(),
            tail_object_offset: NonZeroU64::new(header_size).unwrap(),
            n_objects: NonZeroU64::new(1).unwrap(),
            n_entries: 0,
            tail_entry_seqnum,
            head_entry_seqnum: 0,
            entry_array_offset: NonZeroU64::new(header_size).unwrap(),
            head_entry_realtime: None,
            tail_entry_realtime: None,
            tail_entry_monotonic: 0,
            n_data: Some(0),
            n_fields: Some(0),
            n_tags: Some(0),
            n_entry_arrays: Some(0),
            data_hash_chain_depth: Some(0),
            field_hash_chain_depth: Some(0),
        };

        // Write a provisional header before the window cache exists so the allocator's
        // first mapping has a file at least `header_size` long to work against.
        {
            use std::os::unix::fs::FileExt;
            let bytes = header.to_bytes()?;
            file.write_all_at(&bytes, 0)?;
        }

        let window = WindowCache::new(file, true)?;

        {
            let heap = Heap::new(window.file(), &window, &metrics);

            let data_table_object = heap.allocate(&mut header, ObjectType::DataHashTable, n_data_buckets * HASH_ITEM_SIZE)?;
            header.data_hash_table_offset = NonZeroU64::new(data_table_object + OBJECT_HEADER_SIZE).unwrap();

            let field_table_object = heap.allocate(&mut header, ObjectType::FieldHashTable, n_field_buckets * HASH_ITEM_SIZE)?;
            header.field_hash_table_offset = NonZeroU64::new(field_table_object + OBJECT_HEADER_SIZE).unwrap();

            let entry_array_payload = ENTRY_ARRAY_HEADER_SIZE + INITIAL_ENTRY_ARRAY_CAPACITY * ENTRY_ARRAY_ITEM_SIZE;
            let entry_array_object = heap.allocate(&mut header, ObjectType::EntryArray, entry_array_payload)?;
            header.entry_array_offset = NonZeroU64::new(entry_array_object).unwrap();
        }

        let bytes = header.to_bytes()?;
        {
            let mut map = window.map_mut(TypeContext::Header, 0, bytes.len() as u64, true)?;
            map.copy_from_slice(&bytes);
        }
        window.flush_all()?;

        tracing::info!(path = %path.display(), "created new journal file");

        Ok(Self {
            path: Mutex::new(path.to_path_buf()),
            window: Arc::new(window),
            header: Arc::new(Mutex::new(header)),
            metrics,
            keyed_hash,
            compress_threshold: codec::DEFAULT_COMPRESS_THRESHOLD,
            codec: data_compression,
            chain_cache: Mutex::new(ChainCache::new()),
            offline: OfflineMachine::new(),
            writable: true,
            pending_archive: AtomicBool::new(false),
            cursor: Mutex::new(None),
        })
    }

    /// Open an existing journal file. `refresh`, when writable, carries the caller's
    /// current machine/boot identity: the machine ID must match the file's (or the file
    /// must not have recorded one yet), and the boot ID is stamped into the header as the
    /// current boot, matching the "refresh header" step of spec §4.7.
    #[tracing::instrument(level = "debug", skip(metrics, refresh), fields(path = %path.display()))]
    pub fn open_existing(path: &Path, writable: bool, metrics: Metrics, refresh: Option<(u128, u128)>) -> Result<Self> {
        let file = std::fs::OpenOptions::new().read(true).write(writable).open(path)?;
        let window = WindowCache::new(file, writable)?;
        let (file_size, _) = window.refresh_fstat(true)?;
        if file_size < crate::header::MIN_HEADER_SIZE {
            return Err(JournalError::NoData(format!("file is only {file_size} bytes, below the minimum header size")));
        }

        let probe_len = MAX_HEADER_SIZE.min(file_size);
        let raw = window.map(TypeContext::Header, 0, probe_len, true)?;

        if writable && Header::has_unknown_compatible_flags(&raw) {
            return Err(JournalError::ProtocolNotSupported("unknown compatible flags on a writable open".into()));
        }

        let mut header = Header::from_bytes(&raw)?;
        drop(raw);

        if writable {
            // machine_id of 0 means the file was created without a real machine identity
            // (e.g. in tests); anything else must match the caller's own machine (spec §7
            // "host-down").
            if let Some((machine_id, _)) = refresh {
                if header.machine_id != 0 && header.machine_id != machine_id {
                    return Err(JournalError::HostDown);
                }
                header.machine_id = machine_id;
            }
            if header.state == State::Online {
                return Err(JournalError::Busy);
            }
            if header.state == State::Archived {
                return Err(JournalError::Shutdown);
            }
            if let Some(tail) = header.tail_entry_realtime {
                if tail.as_microsecond() as u64 > now_micros() {
                    return Err(JournalError::TxtBsy);
                }
            }

            if let Some((_, boot_id)) = refresh {
                header.boot_id = boot_id;
            }
            header.state = State::Online;
            let bytes = header.to_bytes()?;
            let mut map = window.map_mut(TypeContext::Header, 0, bytes.len() as u64, true)?;
            map.copy_from_slice(&bytes);
            drop(map);
            window.flush_all()?;
        }

        let keyed_hash = header.is_keyed_hash();
        let codec = if header.incompatible_flags.contains(IncompatibleFlag::CompressedZstd) {
            DataCompression::Zstd
        } else if header.incompatible_flags.contains(IncompatibleFlag::CompressedLz4) {
            DataCompression::Lz4
        } else if header.incompatible_flags.contains(IncompatibleFlag::CompressedXz) {
            DataCompression::Xz
        } else {
            DataCompression::None
        };

        Ok(Self {
            path: Mutex::new(path.to_path_buf()),
            window: Arc::new(window),
            header: Arc::new(Mutex::new(header)),
            metrics,
            keyed_hash,
            compress_threshold: codec::DEFAULT_COMPRESS_THRESHOLD,
            codec,
            chain_cache: Mutex::new(ChainCache::new()),
            offline: OfflineMachine::new(),
            writable,
            pending_archive: AtomicBool::new(false),
            cursor: Mutex::new(None),
        })
    }

    /// Open `path`, creating it with `options` if it doesn't exist yet.
    pub fn open(path: &Path, writable: bool, metrics: Metrics, options: Option<&CreateOptions>) -> Result<Self> {
        if path.exists() {
            Self::open_existing(path, writable, metrics, options.map(|o| (o.machine_id, o.boot_id)))
        } else {
            let options = options.ok_or(JournalError::NotFound)?;
            Self::create_new(path, options, metrics, None)
        }
    }

    /// Open `path` with the recovery policy of spec §4.7: on any of the "corrupt, please
    /// rotate" error kinds, dispose the offending file and retry exactly once.
    pub fn open_reliably(path: &Path, writable: bool, metrics: Metrics, options: Option<&CreateOptions>) -> Result<Self> {
        match Self::open(path, writable, metrics, options) {
            Ok(journal) => Ok(journal),
            Err(err) if err.is_recoverable_by_dispose() && path.exists() => {
                tracing::warn!(path = %path.display(), %err, "disposing corrupt journal file and retrying");
                dispose_path(path)?;
                Self::open(path, writable, metrics, options)
            }
            Err(err) => Err(err),
        }
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn header_snapshot(&self) -> Header {
        self.header.lock().clone()
    }

    /// Append a new entry. `monotonic` is clamped to at least 1 microsecond since the
    /// on-disk field cannot represent a true zero (it is stored as a `NonZeroU64`).
    pub fn append_entry(
        &self,
        realtime: Timestamp,
        monotonic: u64,
        boot_id: Option<u128>,
        items: &[&[u8]],
        external_seqnum: Option<&mut u64>,
    ) -> Result<u64> {
        if !self.writable {
            return Err(JournalError::Perm);
        }

        let realtime_micros = realtime.as_microsecond() as u64;
        if !valid_realtime(realtime_micros) {
            return Err(JournalError::BadMessage(format!("realtime {realtime_micros} fails VALID_REALTIME")));
        }
        if !valid_monotonic(monotonic) {
            return Err(JournalError::BadMessage(format!("monotonic {monotonic} fails VALID_MONOTONIC")));
        }

        // Field-name validity is checked for every item up front, before any allocation,
        // so a bad name never leaves the file half-mutated (spec §4.5).
        let mut names = Vec::with_capacity(items.len());
        for item in items {
            let name = match item.iter().position(|&b| b == b'=') {
                Some(pos) if pos > 0 => Some(&item[..pos]),
                _ => None,
            };
            if let Some(name) = name {
                if !is_valid_field_name(name) {
                    return Err(JournalError::BadMessage(format!("invalid field name: {:?}", bstr::BStr::new(name))));
                }
            }
            names.push(name);
        }

        let mut header = self.header.lock();
        let window = &*self.window;

        let seqnum = {
            let external = external_seqnum.as_ref().map(|c| **c).unwrap_or(0);
            header.tail_entry_seqnum.max(external) + 1
        };
        header.tail_entry_seqnum = seqnum;
        if header.head_entry_seqnum == 0 {
            header.head_entry_seqnum = seqnum;
        }
        if let Some(counter) = external_seqnum {
            *counter = seqnum;
        }

        let boot_id_used = boot_id.unwrap_or(header.boot_id);
        if let Some(b) = boot_id {
            header.boot_id = b;
        }
        let boot_id_nz = NonZeroU128::new(boot_id_used).ok_or_else(|| JournalError::BadMessage("boot_id must be non-zero".into()))?;

        let mut item_refs: Vec<(u64, u64)> = Vec::with_capacity(items.len()); // (data_offset, stored_hash)
        let mut xor_hash = 0u64;

        for (item, name) in items.iter().zip(names.iter()) {
            let content_hash = hash::content_hash(item, self.keyed_hash, header.file_id);
            xor_hash ^= hash::legacy_hash(item);

            let data_table = self.data_table(&header);
            let data_arena = FileArena { window, table_ctx: TypeContext::DataHashTable };
            let (found, depth) = data_table.find(&data_arena, content_hash, Some(item))?;
            if let Some(n) = header.data_hash_chain_depth.as_mut() {
                *n = (*n).max(depth);
            }

            let data_offset = match found {
                Some(offset) => offset,
                None => {
                    let (compression, stored) = if self.codec == DataCompression::None {
                        (DataCompression::None, item.to_vec())
                    } else {
                        codec::maybe_compress(codec_for(self.codec), item, self.compress_threshold)?
                    };

                    let field_offset = match name {
                        Some(field_name) => {
                            let field_hash = hash::content_hash(field_name, self.keyed_hash, header.file_id);
                            let field_table = self.field_table(&header);
                            let mut field_arena = FileArena { window, table_ctx: TypeContext::FieldHashTable };
                            let (field_found, fdepth) = field_table.find(&field_arena, field_hash, None)?;
                            if let Some(n) = header.field_hash_chain_depth.as_mut() {
                                *n = (*n).max(fdepth);
                            }
                            match field_found {
                                Some(offset) => offset,
                                None => {
                                    let heap = Heap::new(window.file(), window, &self.metrics);
                                    let offset = heap.allocate(&mut header, ObjectType::Field, FIELD_OBJECT_HEADER_SIZE + field_name.len() as u64)?;
                                    write_field_header(window, offset, &FieldObjectHeader::new(field_hash))?;
                                    let mut bytes = window.map_mut(TypeContext::Field, offset + OBJECT_HEADER_SIZE + FIELD_OBJECT_HEADER_SIZE, field_name.len() as u64, false)?;
                                    bytes.copy_from_slice(field_name);
                                    drop(bytes);
                                    let field_table = self.field_table(&header);
                                    field_table.link(&mut field_arena, offset, field_hash)?;
                                    offset
                                }
                            }
                        }
                        None => 0,
                    };

                    let heap = Heap::new(window.file(), window, &self.metrics);
                    let payload_size = DATA_OBJECT_HEADER_SIZE + stored.len() as u64;
                    let offset = heap.allocate_with_compression(&mut header, ObjectType::Data, payload_size, compression)?;

                    let mut data_header = DataObjectHeader::new(content_hash, field_offset);
                    if let Some(field_offset) = Some(field_offset).filter(|o| *o != 0) {
                        let mut field_header = read_field_header(window, field_offset)?;
                        data_header.next_field_offset = field_header.head_data_offset;
                        field_header.head_data_offset = offset;
                        write_field_header(window, field_offset, &field_header)?;
                    }
                    write_data_header(window, offset, &data_header)?;
                    {
                        let mut bytes = window.map_mut(TypeContext::Data, offset + OBJECT_HEADER_SIZE + DATA_OBJECT_HEADER_SIZE, stored.len() as u64, false)?;
                        bytes.copy_from_slice(&stored);
                    }

                    let data_table = self.data_table(&header);
                    let mut data_arena2 = FileArena { window, table_ctx: TypeContext::DataHashTable };
                    data_table.link(&mut data_arena2, offset, content_hash)?;

                    offset
                }
            };
            item_refs.push((data_offset, content_hash));
        }

        item_refs.sort_by_key(|&(offset, _)| offset);
        item_refs.dedup_by_key(|&mut (offset, _)| offset);

        let heap = Heap::new(window.file(), window, &self.metrics);
        let entry_payload = ENTRY_OBJECT_HEADER_SIZE + item_refs.len() as u64 * ENTRY_OBJECT_ITEM_SIZE;
        let entry_offset = heap.allocate(&mut header, ObjectType::Entry, entry_payload)?;

        let entry_header = EntryObjectHeader {
            seqnum: NonZeroU64::new(seqnum).unwrap(),
            realtime,
            monotonic: Monotonic::new(monotonic.max(1)).unwrap(),
            boot_id: boot_id_nz,
            xor_hash,
        };
        {
            let mut bytes = window.map_mut(TypeContext::Entry, entry_offset + OBJECT_HEADER_SIZE, ENTRY_OBJECT_HEADER_SIZE, false)?;
            bytes.copy_from_slice(&entry_header.serialize()?);
        }
        {
            let mut offset = entry_offset + OBJECT_HEADER_SIZE + ENTRY_OBJECT_HEADER_SIZE;
            for &(data_offset, item_hash) in &item_refs {
                let item = EntryObjectItem { data_offset, hash: item_hash };
                let mut bytes = window.map_mut(TypeContext::Entry, offset, ENTRY_OBJECT_ITEM_SIZE, false)?;
                bytes.copy_from_slice(&item.serialize()?);
                offset += ENTRY_OBJECT_ITEM_SIZE;
            }
        }

        let mut global_first = header.entry_array_offset.get();
        let global_index = header.n_entries;
        chain::append(&heap, &mut header, &mut global_first, global_index, entry_offset)?;
        // The chain just grew by one, so any cached progress point's `total` is now stale;
        // the next bisection re-seeds and republishes it.
        self.chain_cache.lock().invalidate(global_first);

        for &(data_offset, _) in &item_refs {
            let mut data_header = read_data_header(window, data_offset)?;
            if data_header.n_entries == 0 {
                data_header.entry_offset = entry_offset;
            } else {
                let mut per_data_first = data_header.entry_array_offset;
                chain::append(&heap, &mut header, &mut per_data_first, data_header.n_entries - 1, entry_offset)?;
                data_header.entry_array_offset = per_data_first;
            }
            data_header.n_entries += 1;
            write_data_header(window, data_offset, &data_header)?;
        }

        header.n_entries += 1;
        if header.head_entry_realtime.is_none() {
            header.head_entry_realtime = Some(realtime);
        }
        header.tail_entry_realtime = Some(realtime);
        header.tail_entry_monotonic = monotonic;

        let bytes = header.to_bytes()?;
        {
            let mut map = window.map_mut(TypeContext::Header, 0, bytes.len() as u64, true)?;
            map.copy_from_slice(&bytes);
        }

        // Cosmetic: inotify only ever sees metadata changes to mmap'd files, not the
        // writes themselves, so bump mtime with a same-size truncate to wake watchers.
        let len = window.file().metadata()?.len();
        window.file().set_len(len)?;

        Ok(entry_offset)
    }

    fn bisect_global<F>(&self, direction: Direction, probe: F) -> Result<Option<chain::BisectResult>>
    where
        F: FnMut(u64) -> Result<Probe>,
    {
        let header = self.header.lock();
        let first = header.entry_array_offset.get();
        let total = header.n_entries;
        drop(header);

        let seed = self
            .chain_cache
            .lock()
            .get(first)
            .filter(|progress| progress.total == total)
            .map(|progress| progress.last_index);

        let result = chain::bisect_chain(&self.window, first, total, direction, seed, probe)?;
        if let Some(r) = result {
            self.chain_cache.lock().publish(
                first,
                ChainProgress {
                    array_offset: first,
                    begin_index: 0,
                    total,
                    last_index: r.index,
                },
            );
        }
        Ok(result)
    }

    pub fn seek_by_seqnum(&self, seqnum: u64, direction: Direction) -> Result<Option<u64>> {
        let window = &*self.window;
        let result = self.bisect_global(direction, |offset| {
            let entry = read_entry_object_header(window, offset)?;
            Ok(match entry.seqnum.get().cmp(&seqnum) {
                std::cmp::Ordering::Equal => Probe::Found,
                std::cmp::Ordering::Less => Probe::Right,
                std::cmp::Ordering::Greater => Probe::Left,
            })
        })?;
        Ok(result.map(|r| r.offset))
    }

    pub fn seek_by_realtime(&self, realtime: Timestamp, direction: Direction) -> Result<Option<u64>> {
        let window = &*self.window;
        let needle = realtime.as_microsecond();
        let result = self.bisect_global(direction, |offset| {
            let entry = read_entry_object_header(window, offset)?;
            Ok(match entry.realtime.as_microsecond().cmp(&needle) {
                std::cmp::Ordering::Equal => Probe::Found,
                std::cmp::Ordering::Less => Probe::Right,
                std::cmp::Ordering::Greater => Probe::Left,
            })
        })?;
        Ok(result.map(|r| r.offset))
    }

    pub fn seek_by_offset(&self, target: u64, direction: Direction) -> Result<Option<u64>> {
        let result = self.bisect_global(direction, |offset| {
            Ok(match offset.cmp(&target) {
                std::cmp::Ordering::Equal => Probe::Found,
                std::cmp::Ordering::Less => Probe::Right,
                std::cmp::Ordering::Greater => Probe::Left,
            })
        })?;
        Ok(result.map(|r| r.offset))
    }

    /// Locate the Data object for `_BOOT_ID=<hex>` and bisect its per-data "plus-one" chain
    /// by monotonic time (spec §4.5).
    pub fn seek_by_monotonic(&self, boot_id: u128, monotonic: u64, direction: Direction) -> Result<Option<u64>> {
        let needle = format!("_BOOT_ID={boot_id:032x}");
        let header = self.header.lock();
        let content_hash = hash::content_hash(needle.as_bytes(), self.keyed_hash, header.file_id);
        let data_table = self.data_table(&header);
        drop(header);

        let window = &*self.window;
        let arena = FileArena { window, table_ctx: TypeContext::DataHashTable };
        let (found, _) = data_table.find(&arena, content_hash, Some(needle.as_bytes()))?;
        let Some(data_offset) = found else { return Ok(None) };

        let data_header = read_data_header(window, data_offset)?;
        let total = data_header.n_entries;
        let entry_array_offset = data_header.entry_array_offset;
        let inline = data_header.entry_offset;

        let get_at = |index: u64| -> Result<u64> {
            if index == 0 {
                Ok(inline)
            } else {
                chain::get_offset_at(window, entry_array_offset, index - 1)
            }
        };

        let result = chain::bisect(total, direction, None, get_at, |offset| {
            let entry = read_entry_object_header(window, offset)?;
            Ok(match entry.monotonic.0.get().cmp(&monotonic) {
                std::cmp::Ordering::Equal => Probe::Found,
                std::cmp::Ordering::Less => Probe::Right,
                std::cmp::Ordering::Greater => Probe::Left,
            })
        })?;
        Ok(result.map(|r| r.offset))
    }

    /// Step one slot in `direction` from `current_offset` along the global chain,
    /// tolerating (skipping) individually corrupt slots, and enforcing that the step
    /// strictly advances in the requested direction (spec §4.5's ordering guarantee).
    pub fn next_entry(&self, current_offset: u64, direction: Direction) -> Result<Option<u64>> {
        let header = self.header.lock();
        let first = header.entry_array_offset.get();
        let total = header.n_entries;
        drop(header);
        let window = &*self.window;

        let current_index = match chain::bisect_chain(window, first, total, direction, None, |offset| {
            Ok(match offset.cmp(&current_offset) {
                std::cmp::Ordering::Equal => Probe::Found,
                std::cmp::Ordering::Less => Probe::Right,
                std::cmp::Ordering::Greater => Probe::Left,
            })
        })? {
            Some(r) => r.index,
            None => return Ok(None),
        };

        let mut index = current_index;
        loop {
            let next_index = match direction {
                Direction::Down => index.checked_add(1),
                Direction::Up => index.checked_sub(1),
            };
            let Some(next_index) = next_index else { return Ok(None) };
            if next_index >= total {
                return Ok(None);
            }

            match chain::get_offset_at(window, first, next_index) {
                Ok(next_offset) => {
                    let ordered = match direction {
                        Direction::Down => next_offset > current_offset,
                        Direction::Up => next_offset < current_offset,
                    };
                    if !ordered {
                        return Err(JournalError::BadMessage("global chain is not strictly ordered by offset".into()));
                    }
                    return Ok(Some(next_offset));
                }
                Err(err) => {
                    tracing::debug!(index = next_index, %err, "skipping corrupt chain slot");
                    index = next_index;
                    continue;
                }
            }
        }
    }

    /// Step one slot in `direction` from `current_offset` along `data_offset`'s per-data
    /// "plus-one" chain, with the same corruption-skipping and strict-ordering contract as
    /// [`Journal::next_entry`] (spec §4.5).
    pub fn next_entry_for_data(&self, data_offset: u64, current_offset: u64, direction: Direction) -> Result<Option<u64>> {
        let window = &*self.window;
        let data_header = read_data_header(window, data_offset)?;
        let total = data_header.n_entries;
        let inline = data_header.entry_offset;
        let entry_array_offset = data_header.entry_array_offset;

        let get_at = |index: u64| -> Result<u64> {
            if index == 0 {
                Ok(inline)
            } else {
                chain::get_offset_at(window, entry_array_offset, index - 1)
            }
        };

        let current_index = match chain::bisect(total, direction, None, get_at, |offset| {
            Ok(match offset.cmp(&current_offset) {
                std::cmp::Ordering::Equal => Probe::Found,
                std::cmp::Ordering::Less => Probe::Right,
                std::cmp::Ordering::Greater => Probe::Left,
            })
        })? {
            Some(r) => r.index,
            None => return Ok(None),
        };

        let mut index = current_index;
        loop {
            let next_index = match direction {
                Direction::Down => index.checked_add(1),
                Direction::Up => index.checked_sub(1),
            };
            let Some(next_index) = next_index else { return Ok(None) };
            if next_index >= total {
                return Ok(None);
            }

            match get_at(next_index) {
                Ok(next_offset) => {
                    let ordered = match direction {
                        Direction::Down => next_offset > current_offset,
                        Direction::Up => next_offset < current_offset,
                    };
                    if !ordered {
                        return Err(JournalError::BadMessage("per-data chain is not strictly ordered by offset".into()));
                    }
                    return Ok(Some(next_offset));
                }
                Err(err) => {
                    tracing::debug!(index = next_index, %err, "skipping corrupt chain slot");
                    index = next_index;
                    continue;
                }
            }
        }
    }

    /// Every `name=value` payload stored in `entry_offset`'s items, decompressed and in
    /// item order. Used by readers that need the actual field data, not just its location.
    pub fn entry_payloads(&self, entry_offset: u64) -> Result<Vec<Vec<u8>>> {
        let window = &*self.window;
        let items = read_entry_items(window, entry_offset)?;
        items.iter().map(|item| read_data_payload(window, item.data_offset)).collect()
    }

    /// Append a copy of `entry_offset` from `src` into this file, re-deduplicating its
    /// values against this file's own data table rather than copying bytes verbatim (spec
    /// §6.3 `copy_entry`). Used by vacuum/merge-style tools built on top of this crate.
    pub fn copy_entry(&self, src: &Journal, entry_offset: u64) -> Result<u64> {
        if !self.writable {
            return Err(JournalError::Perm);
        }
        let entry = read_entry_object_header(&src.window, entry_offset)?;
        let payloads = src.entry_payloads(entry_offset)?;
        let refs: Vec<&[u8]> = payloads.iter().map(|v| v.as_slice()).collect();
        self.append_entry(entry.realtime, entry.monotonic.0.get(), Some(entry.boot_id.get()), &refs, None)
    }

    /// `rotate_suggested` (spec §4.7): whether the file should be rotated before the next
    /// write.
    pub fn rotate_suggested(&self, max_age_usec: Option<u64>) -> bool {
        let header = self.header.lock();
        if header.header_size.get() < MAX_HEADER_SIZE {
            return true;
        }
        let data_buckets = header.data_hash_table_size.get() / HASH_ITEM_SIZE;
        if let Some(load) = header.data_fill_level(data_buckets) {
            if load > 0.75 {
                return true;
            }
        }
        let field_buckets = header.field_hash_table_size.get() / HASH_ITEM_SIZE;
        if let Some(load) = header.field_fill_level(field_buckets) {
            if load > 0.75 {
                return true;
            }
        }
        if header.data_hash_chain_depth.is_some_and(|d| d > 100) {
            return true;
        }
        if header.field_hash_chain_depth.is_some_and(|d| d > 100) {
            return true;
        }
        if header.n_data.unwrap_or(0) > 0 && header.n_fields == Some(0) {
            return true;
        }
        if let (Some(max_age), Some(head)) = (max_age_usec, header.head_entry_realtime) {
            let age = now_micros().saturating_sub(head.as_microsecond() as u64);
            if age > max_age {
                return true;
            }
        }
        false
    }

    pub fn default_metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn free_bytes(&self) -> Result<u64> {
        statvfs_free_bytes(self.window.file())
    }

    pub fn cutoff_realtime(&self) -> (Option<Timestamp>, Option<Timestamp>) {
        let header = self.header.lock();
        (header.head_entry_realtime, header.tail_entry_realtime)
    }

    /// Earliest and latest monotonic timestamp recorded for `boot_id`, found via its
    /// `_BOOT_ID=<hex>` per-data chain (spec §6.3 `cutoff_monotonic`). `None` if this boot
    /// never appears in the file.
    pub fn cutoff_monotonic(&self, boot_id: u128) -> Result<(Option<u64>, Option<u64>)> {
        let needle = format!("_BOOT_ID={boot_id:032x}");
        let header = self.header.lock();
        let content_hash = hash::content_hash(needle.as_bytes(), self.keyed_hash, header.file_id);
        let data_table = self.data_table(&header);
        drop(header);

        let window = &*self.window;
        let arena = FileArena { window, table_ctx: TypeContext::DataHashTable };
        let (found, _) = data_table.find(&arena, content_hash, Some(needle.as_bytes()))?;
        let Some(data_offset) = found else { return Ok((None, None)) };

        let data_header = read_data_header(window, data_offset)?;
        if data_header.n_entries == 0 {
            return Ok((None, None));
        }

        let first_entry = read_entry_object_header(window, data_header.entry_offset)?;
        let last_offset = if data_header.n_entries == 1 {
            data_header.entry_offset
        } else {
            chain::get_offset_at(window, data_header.entry_array_offset, data_header.n_entries - 2)?
        };
        let last_entry = read_entry_object_header(window, last_offset)?;

        Ok((Some(first_entry.monotonic.0.get()), Some(last_entry.monotonic.0.get())))
    }

    pub fn save_location(&self, location: Location) {
        *self.cursor.lock() = Some(location);
    }

    pub fn reset_location(&self) {
        *self.cursor.lock() = None;
    }

    pub fn saved_location(&self) -> Option<Location> {
        *self.cursor.lock()
    }

    pub fn location_for_entry(&self, entry_offset: u64) -> Result<Location> {
        let header = self.header.lock();
        let seqnum_id = header.seqnum_id.get();
        drop(header);
        let entry = read_entry_object_header(&self.window, entry_offset)?;
        Ok(Location {
            seqnum_id,
            seqnum: entry.seqnum.get(),
            boot_id: entry.boot_id.get(),
            monotonic: entry.monotonic.0.get(),
            realtime: entry.realtime.as_microsecond() as u64,
            xor_hash: entry.xor_hash,
        })
    }

    /// Bring the file offline (§4.6). Blocks until committed if `wait`, otherwise returns
    /// once the background worker has been (re)started.
    pub fn set_offline(&self, wait: bool) -> Result<()> {
        let target = if self.pending_archive.load(Ordering::Acquire) { State::Archived } else { State::Offline };
        tracing::debug!(?target, wait, "bringing journal file offline");
        let actions = JournalOfflineActions {
            window: Arc::clone(&self.window),
            header: Arc::clone(&self.header),
            target,
        };
        self.offline.set_offline(wait, actions)
    }

    /// Bring the file back online; refuses if it is archived.
    pub fn set_online(&self) -> Result<()> {
        if !self.writable {
            return Err(JournalError::Perm);
        }
        let header = Arc::clone(&self.header);
        let window = Arc::clone(&self.window);
        self.offline.set_online(move || {
            let bytes = {
                let mut h = header.lock();
                if h.state == State::Archived {
                    return Err(JournalError::Shutdown);
                }
                h.state = State::Online;
                h.to_bytes()?
            };
            let mut map = window.map_mut(TypeContext::Header, 0, bytes.len() as u64, true)?;
            map.copy_from_slice(&bytes);
            drop(map);
            window.flush_all()
        })
    }

    pub fn close(&self) -> Result<()> {
        if self.writable {
            self.set_offline(true)?;
        }
        Ok(())
    }

    /// Rename the live file to its archived name and mark the header archived (via the
    /// offline worker), without opening a successor. Used standalone by vacuum/shutdown
    /// paths and as the first half of [`Journal::rotate`] (spec §4.7, §6.3 `archive`).
    pub fn archive(&self) -> Result<()> {
        if !self.writable {
            return Err(JournalError::Perm);
        }
        let path = self.path.lock().clone();
        if path.file_name().is_none() {
            return Err(JournalError::BadMessage("cannot archive a file with no real path".into()));
        }

        let (seqnum_id, head_seqnum, head_realtime) = {
            let header = self.header.lock();
            (
                header.seqnum_id.get(),
                header.head_entry_seqnum,
                header.head_entry_realtime.map(|t| t.as_microsecond() as u64).unwrap_or(0),
            )
        };
        let prefix = path.file_stem().and_then(|s| s.to_str()).unwrap_or("journal").to_string();
        let archived = path.with_file_name(naming::archived_filename(&prefix, seqnum_id, head_seqnum, head_realtime));
        std::fs::rename(&path, &archived)?;
        tracing::info!(from = %path.display(), to = %archived.display(), "archived journal file");
        *self.path.lock() = archived;

        self.pending_archive.store(true, Ordering::Release);
        self.set_offline(true)
    }

    /// Archive the live file and open a successor at its original name, inheriting this
    /// file's `seqnum_id` lineage (spec §4.7).
    pub fn rotate(&self) -> Result<Self> {
        if !self.writable {
            return Err(JournalError::Perm);
        }
        let original_path = self.path.lock().clone();
        if original_path.file_name().is_none() {
            return Err(JournalError::BadMessage("cannot rotate a file with no real path".into()));
        }

        self.archive()?;

        let metrics = self.metrics;
        let options = CreateOptions::new(self.header.lock().machine_id, self.header.lock().boot_id, "").with_compression(
            match self.codec {
                DataCompression::None => None,
                DataCompression::Xz => Some(Compression::Xz),
                DataCompression::Lz4 => Some(Compression::Lz4),
                DataCompression::Zstd => Some(Compression::Zstd),
            },
        );
        Self::create_new(&original_path, &options, metrics, Some(self))
    }

    /// Rename the live file to its disposed (quarantined) name, without opening a
    /// successor; used by `open_reliably` and manual recovery.
    pub fn dispose(self) -> Result<()> {
        let path = self.path.lock().clone();
        drop(self);
        tracing::warn!(path = %path.display(), "disposing corrupt journal file");
        dispose_path(&path)
    }

    // --- Sealing hooks (spec §6.5): no-ops since forward-secure sealing is out of scope. ---

    pub fn append_tag(&self) -> Result<()> {
        Ok(())
    }

    pub fn maybe_append_tag(&self, _realtime: Timestamp) -> Result<()> {
        Ok(())
    }

    pub fn hmac_put_object(&self, _offset: u64) -> Result<()> {
        Ok(())
    }

    pub fn append_first_tag(&self) -> Result<()> {
        Ok(())
    }

    pub fn fss_load(&self, _path: &Path) -> Result<()> {
        Ok(())
    }

    pub fn hmac_setup(&self) -> Result<()> {
        Ok(())
    }
}

fn dispose_path(path: &Path) -> Result<()> {
    let prefix = path.file_stem().and_then(|s| s.to_str()).unwrap_or("journal").to_string();
    let disposed = path.with_file_name(naming::disposed_filename_now(&prefix, now_micros()));
    std::fs::rename(path, disposed)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn options() -> CreateOptions {
        CreateOptions::new(1, 1, "system").with_compression(None)
    }

    #[test]
    fn create_then_append_and_seek_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.journal");
        let metrics = Metrics::from_fs_size(Some(1 << 30));
        let journal = Journal::create_new(&path, &options(), metrics, None).unwrap();

        let t1 = Timestamp::from_microsecond(1_000_000).unwrap();
        journal.append_entry(t1, 1, None, &[b"MESSAGE=hello", b"PRIORITY=6"], None).unwrap();
        let t2 = Timestamp::from_microsecond(1_000_001).unwrap();
        journal.append_entry(t2, 2, None, &[b"MESSAGE=world", b"PRIORITY=6"], None).unwrap();
        let t3 = Timestamp::from_microsecond(1_000_002).unwrap();
        journal.append_entry(t3, 3, None, &[b"MESSAGE=hello", b"PRIORITY=3"], None).unwrap();

        let header = journal.header_snapshot();
        assert_eq!(header.n_entries, 3);
        assert_eq!(header.n_data, Some(4));
        assert_eq!(header.n_fields, Some(2));

        let found = journal.seek_by_realtime(t2, Direction::Down).unwrap().unwrap();
        let entry = read_entry_object_header(&journal.window, found).unwrap();
        assert_eq!(entry.seqnum.get(), 2);
    }

    #[test]
    fn dedup_reuses_data_objects() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.journal");
        let metrics = Metrics::from_fs_size(Some(1 << 30));
        let journal = Journal::create_new(&path, &options(), metrics, None).unwrap();

        let t = Timestamp::from_microsecond(2_000_000).unwrap();
        journal.append_entry(t, 1, None, &[b"MESSAGE=hi"], None).unwrap();
        journal.append_entry(t, 2, None, &[b"MESSAGE=hi"], None).unwrap();

        let header = journal.header_snapshot();
        assert_eq!(header.n_entries, 2);
        assert_eq!(header.n_data, Some(1));
    }

    #[test]
    fn next_entry_walks_forward_in_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.journal");
        let metrics = Metrics::from_fs_size(Some(1 << 30));
        let journal = Journal::create_new(&path, &options(), metrics, None).unwrap();

        let mut offsets = Vec::new();
        for i in 0..5u64 {
            let t = Timestamp::from_microsecond(1_000_000 + i as i64).unwrap();
            offsets.push(journal.append_entry(t, i + 1, None, &[b"MESSAGE=x"], None).unwrap());
        }

        let first = journal.seek_by_offset(offsets[0], Direction::Down).unwrap().unwrap();
        assert_eq!(first, offsets[0]);
        let second = journal.next_entry(first, Direction::Down).unwrap().unwrap();
        assert_eq!(second, offsets[1]);
    }

    #[test]
    fn rotate_suggested_true_for_old_header_layout() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.journal");
        let metrics = Metrics::from_fs_size(Some(1 << 30));
        let journal = Journal::create_new(&path, &options(), metrics, None).unwrap();
        assert!(!journal.rotate_suggested(None));

        journal.header.lock().header_size = NonZeroU64::new(crate::header::MIN_HEADER_SIZE).unwrap();
        assert!(journal.rotate_suggested(None));
    }

    #[test]
    fn reopening_a_closed_file_succeeds() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.journal");
        let metrics = Metrics::from_fs_size(Some(1 << 30));
        {
            let journal = Journal::create_new(&path, &options(), metrics, None).unwrap();
            let t = Timestamp::from_microsecond(1_000_000).unwrap();
            journal.append_entry(t, 1, None, &[b"MESSAGE=x"], None).unwrap();
            journal.close().unwrap();
        }

        let reopened = Journal::open_existing(&path, true, metrics, None).unwrap();
        assert_eq!(reopened.header_snapshot().n_entries, 1);
        reopened.close().unwrap();
    }

    #[test]
    fn open_reliably_disposes_a_corrupt_file_and_creates_fresh() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.journal");
        let metrics = Metrics::from_fs_size(Some(1 << 30));
        {
            let journal = Journal::create_new(&path, &options(), metrics, None).unwrap();
            journal.close().unwrap();
        }

        // Corrupt the magic signature.
        {
            use std::io::{Seek, SeekFrom, Write};
            let mut file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
            file.seek(SeekFrom::Start(0)).unwrap();
            file.write_all(b"X").unwrap();
        }

        let reopened = Journal::open_reliably(&path, true, metrics, Some(&options())).unwrap();
        assert_eq!(reopened.header_snapshot().n_entries, 0);

        let mut disposed = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.ends_with(".journal~"));
        assert!(disposed.next().is_some());
    }
}
