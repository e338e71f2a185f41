//! Entry-array chains (spec §4.4): segmented linked lists of entry offsets, used both for
//! the global append-order chain and for each Data object's per-value back-index.
//!
//! Segments grow geometrically so a long-lived chain does not pay one allocation per
//! entry. The "plus-one" variant (the first logical slot lives inline in the owning
//! object, e.g. a Data object's `entry_offset`) is the caller's responsibility: this
//! module only ever deals in chain-relative indices starting at 0.

use std::num::NonZeroU64;

use crate::error::{JournalError, Result};
use crate::heap::Heap;
use crate::header::Header;
use crate::mmap::{TypeContext, WindowCache};
use crate::objects::{
    EntryArrayItem, EntryArrayObjectHeader, ObjectHeader, ObjectType, Payload, ENTRY_ARRAY_HEADER_SIZE,
    ENTRY_ARRAY_ITEM_SIZE, OBJECT_HEADER_SIZE,
};

fn segment_capacity(payload_size: u64) -> u64 {
    payload_size.saturating_sub(ENTRY_ARRAY_HEADER_SIZE) / ENTRY_ARRAY_ITEM_SIZE
}

fn read_object_header(window: &WindowCache, offset: u64) -> Result<ObjectHeader> {
    let bytes = window.map(TypeContext::EntryArray, offset, OBJECT_HEADER_SIZE, false)?;
    ObjectHeader::from_bytes(&bytes)
}

fn read_segment_header(window: &WindowCache, offset: u64) -> Result<EntryArrayObjectHeader> {
    let bytes = window.map(
        TypeContext::EntryArray,
        offset + OBJECT_HEADER_SIZE,
        ENTRY_ARRAY_HEADER_SIZE,
        false,
    )?;
    EntryArrayObjectHeader::parse(&bytes)
}

fn write_next_segment(window: &WindowCache, offset: u64, next: u64) -> Result<()> {
    let header = EntryArrayObjectHeader {
        next_entry_array_offset: NonZeroU64::new(next),
    };
    let mut bytes = window.map_mut(TypeContext::EntryArray, offset + OBJECT_HEADER_SIZE, ENTRY_ARRAY_HEADER_SIZE, false)?;
    bytes.copy_from_slice(&header.serialize()?);
    Ok(())
}

fn item_offset(segment_offset: u64, index: u64) -> u64 {
    segment_offset + OBJECT_HEADER_SIZE + ENTRY_ARRAY_HEADER_SIZE + index * ENTRY_ARRAY_ITEM_SIZE
}

fn write_item(window: &WindowCache, segment_offset: u64, index: u64, entry_offset: u64) -> Result<()> {
    let item = EntryArrayItem { entry_offset };
    let mut bytes = window.map_mut(TypeContext::EntryArray, item_offset(segment_offset, index), ENTRY_ARRAY_ITEM_SIZE, false)?;
    bytes.copy_from_slice(&item.serialize()?);
    Ok(())
}

pub fn read_item(window: &WindowCache, segment_offset: u64, index: u64) -> Result<u64> {
    let bytes = window.map(TypeContext::EntryArray, item_offset(segment_offset, index), ENTRY_ARRAY_ITEM_SIZE, false)?;
    Ok(EntryArrayItem::parse(&bytes)?.entry_offset)
}

/// Follow the chain rooted at `first` to find the entry offset stored at `index` (chain-
/// relative, not accounting for any inline plus-one slot).
pub fn get_offset_at(window: &WindowCache, first: u64, mut index: u64) -> Result<u64> {
    let mut offset = first;
    loop {
        if offset == 0 {
            return Err(JournalError::NotFound);
        }
        let object_header = read_object_header(window, offset)?.check_type(ObjectType::EntryArray)?;
        let capacity = segment_capacity(object_header.payload_size());
        if index < capacity {
            return read_item(window, offset, index);
        }
        index -= capacity;
        let segment_header = read_segment_header(window, offset)?;
        offset = segment_header.next_entry_array_offset.map_or(0, NonZeroU64::get);
    }
}

/// Append `entry_offset` at chain-relative logical index `index` (the caller must ensure
/// this is exactly the next free slot; the chain only ever grows at its end). `chain_first`
/// is `0` for an empty chain and is updated in place if this call creates the first
/// segment.
pub fn append(
    heap: &Heap<'_>,
    header: &mut Header,
    chain_first: &mut u64,
    index: u64,
    entry_offset: u64,
) -> Result<()> {
    let window = heap.window();
    let mut offset = *chain_first;
    let mut prev_offset = 0u64;
    let mut prev_capacity = 0u64;
    let mut remaining = index;

    loop {
        if offset == 0 {
            let new_capacity = ((remaining + 1) * 2).max(4).max(prev_capacity * 2);
            let payload_size = ENTRY_ARRAY_HEADER_SIZE + new_capacity * ENTRY_ARRAY_ITEM_SIZE;
            let new_offset = heap.allocate(header, ObjectType::EntryArray, payload_size)?;

            if prev_offset == 0 {
                *chain_first = new_offset;
            } else {
                write_next_segment(window, prev_offset, new_offset)?;
            }

            write_item(window, new_offset, remaining, entry_offset)?;
            return Ok(());
        }

        let object_header = read_object_header(window, offset)?.check_type(ObjectType::EntryArray)?;
        let capacity = segment_capacity(object_header.payload_size());

        if remaining < capacity {
            write_item(window, offset, remaining, entry_offset)?;
            return Ok(());
        }

        remaining -= capacity;
        prev_offset = offset;
        prev_capacity = capacity;
        let segment_header = read_segment_header(window, offset)?;
        offset = segment_header.next_entry_array_offset.map_or(0, NonZeroU64::get);
    }
}

/// Direction of a bisection search: `Down` moves toward larger/later values, `Up` toward
/// smaller/earlier ones (spec §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Down,
    Up,
}

/// What a probe closure reports about one candidate entry relative to the needle it was
/// given.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    Found,
    /// The candidate's key is greater than the needle.
    Left,
    /// The candidate's key is less than the needle.
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BisectResult {
    pub offset: u64,
    pub index: u64,
}

/// Binary search over `total` logical slots, each resolved to an entry offset by
/// `get_at`. `probe` compares the entry at a candidate offset against the caller's
/// needle. A probe (or `get_at`) error is treated as "this slot is corrupt": the search
/// narrows past it rather than failing outright (spec §4.4's partial-corruption
/// tolerance).
///
/// `seed` is an optional jump-in index — typically the last index a previous bisection
/// against this same chain landed on, supplied by the chain cache — probed first instead
/// of the arithmetic midpoint. It only changes which slot the first comparison lands on;
/// every iteration after that narrows `lo`/`hi` exactly as an unseeded search would, so an
/// out-of-date or wildly wrong seed costs at most one extra probe rather than correctness.
///
/// Generic over how a logical index becomes an offset so the same search drives both the
/// plain entry-array chain case ([`bisect_chain`]) and a Data object's "plus-one" per-value
/// chain (index 0 inline, the rest via the chain), which file.rs bisects directly against
/// the owning Data object rather than a bare chain root.
pub fn bisect<G, F>(
    total: u64,
    direction: Direction,
    seed: Option<u64>,
    mut get_at: G,
    mut probe: F,
) -> Result<Option<BisectResult>>
where
    G: FnMut(u64) -> Result<u64>,
    F: FnMut(u64) -> Result<Probe>,
{
    if total == 0 {
        return Ok(None);
    }

    let mut lo: i64 = 0;
    let mut hi: i64 = total as i64 - 1;
    let mut last_left: Option<(u64, u64)> = None;
    let mut last_right: Option<(u64, u64)> = None;
    let mut next_mid = seed.filter(|&s| s < total);

    while lo <= hi {
        let mid = next_mid.take().unwrap_or_else(|| (lo + (hi - lo) / 2) as u64);
        let offset = match get_at(mid) {
            Ok(offset) => offset,
            Err(_) => {
                hi = mid as i64 - 1;
                continue;
            }
        };

        match probe(offset) {
            Ok(Probe::Found) => return Ok(Some(BisectResult { offset, index: mid })),
            Ok(Probe::Left) => {
                last_left = Some((offset, mid));
                hi = mid as i64 - 1;
            }
            Ok(Probe::Right) => {
                last_right = Some((offset, mid));
                lo = mid as i64 + 1;
            }
            Err(_) => {
                hi = mid as i64 - 1;
            }
        }
    }

    let chosen = match direction {
        Direction::Down => last_left,
        Direction::Up => last_right,
    };

    Ok(chosen.map(|(offset, index)| BisectResult { offset, index }))
}

/// Convenience wrapper over [`bisect`] for a plain entry-array chain rooted at `first`
/// (the global chain, or a per-data chain with no inline slot).
pub fn bisect_chain<F>(
    window: &WindowCache,
    first: u64,
    total: u64,
    direction: Direction,
    seed: Option<u64>,
    probe: F,
) -> Result<Option<BisectResult>>
where
    F: FnMut(u64) -> Result<Probe>,
{
    bisect(total, direction, seed, |index| get_offset_at(window, first, index), probe)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{CompatibleFlag, IncompatibleFlag, State};
    use crate::heap::Metrics;
    use flagset::FlagSet;
    use std::fs::File;
    use std::num::{NonZeroU128, NonZeroU64};

    fn temp_file(len: u64) -> File {
        let file = tempfile::tempfile().unwrap();
        file.set_len(len).unwrap();
        file
    }

    fn test_header(header_size: u64) -> Header {
        Header {
            compatible_flags: FlagSet::default(),
            incompatible_flags: IncompatibleFlag::KeyedHash.into(),
            state: State::Online,
            file_id: 1,
            machine_id: 1,
            boot_id: 1,
            seqnum_id: NonZeroU128::new(1).unwrap(),
            header_size: NonZeroU64::new(header_size).unwrap(),
            arena_size: NonZeroU64::new(1).unwrap(),
            data_hash_table_offset: NonZeroU64::new(header_size).unwrap(),
            data_hash_table_size: NonZeroU64::new(16).unwrap(),
            field_hash_table_offset: NonZeroU64::new(header_size + 16).unwrap(),
            field_hash_table_size: NonZeroU64::new(16).unwrap(),
            tail_object_offset: NonZeroU64::new(header_size).unwrap(),
            n_objects: NonZeroU64::new(1).unwrap(),
            n_entries: 0,
            tail_entry_seqnum: 0,
            head_entry_seqnum: 0,
            entry_array_offset: NonZeroU64::new(header_size + 32).unwrap(),
            head_entry_realtime: None,
            tail_entry_realtime: None,
            tail_entry_monotonic: 0,
            n_data: Some(0),
            n_fields: Some(0),
            n_tags: Some(0),
            n_entry_arrays: Some(0),
            data_hash_chain_depth: Some(0),
            field_hash_chain_depth: Some(0),
        }
    }

    #[test]
    fn append_and_read_back_grows_across_segments() {
        let header_size = 256;
        let file = temp_file(1 << 20);
        let window = WindowCache::new(file.try_clone().unwrap(), true).unwrap();
        let metrics = Metrics::from_fs_size(Some(1 << 30));
        let heap = Heap::new(&file, &window, &metrics);
        let mut header = test_header(header_size);
        header.tail_object_offset = NonZeroU64::new(header_size).unwrap();
        header.n_objects = NonZeroU64::new(1).unwrap();

        // n_objects == 1 means no real objects allocated yet, so the very first
        // allocation takes header_size directly; no seed object is required here.
        let mut first = 0u64;
        for i in 0..20 {
            append(&heap, &mut header, &mut first, i, 1000 + i).unwrap();
        }

        for i in 0..20 {
            let value = get_offset_at(&window, first, i).unwrap();
            assert_eq!(value, 1000 + i);
        }
    }

    #[test]
    fn bisect_finds_exact_match_and_boundaries() {
        let header_size = 256;
        let file = temp_file(1 << 20);
        let window = WindowCache::new(file.try_clone().unwrap(), true).unwrap();
        let metrics = Metrics::from_fs_size(Some(1 << 30));
        let heap = Heap::new(&file, &window, &metrics);
        let mut header = test_header(header_size);
        header.tail_object_offset = NonZeroU64::new(header_size).unwrap();
        header.n_objects = NonZeroU64::new(1).unwrap();

        let values = [10u64, 20, 30, 40, 50];
        let mut first = 0u64;
        for (i, v) in values.iter().enumerate() {
            append(&heap, &mut header, &mut first, i as u64, *v).unwrap();
        }

        let needle = 30u64;
        let result = bisect_chain(&window, first, values.len() as u64, Direction::Down, None, |offset| {
            Ok(match offset.cmp(&needle) {
                std::cmp::Ordering::Equal => Probe::Found,
                std::cmp::Ordering::Less => Probe::Right,
                std::cmp::Ordering::Greater => Probe::Left,
            })
        })
        .unwrap()
        .unwrap();
        assert_eq!(result.offset, 30);

        let needle = 25u64;
        let result = bisect_chain(&window, first, values.len() as u64, Direction::Down, None, |offset| {
            Ok(match offset.cmp(&needle) {
                std::cmp::Ordering::Equal => Probe::Found,
                std::cmp::Ordering::Less => Probe::Right,
                std::cmp::Ordering::Greater => Probe::Left,
            })
        })
        .unwrap()
        .unwrap();
        assert_eq!(result.offset, 30, "Down direction lands on the next value at or above the needle");

        let result = bisect_chain(&window, first, values.len() as u64, Direction::Up, None, |offset| {
            Ok(match offset.cmp(&needle) {
                std::cmp::Ordering::Equal => Probe::Found,
                std::cmp::Ordering::Less => Probe::Right,
                std::cmp::Ordering::Greater => Probe::Left,
            })
        })
        .unwrap()
        .unwrap();
        assert_eq!(result.offset, 20, "Up direction lands on the prior value at or below the needle");
    }
}
