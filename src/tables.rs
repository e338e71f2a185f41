//! Hash tables (spec §4.3): flat bucket arrays over the Data and Field object chains.
//!
//! Both tables share one on-disk layout (`HashItem` buckets, chained collision lists in
//! the arena) and one traversal algorithm; only the bucket-count policy and the presence
//! of a payload-equality check differ between them. [`ObjectArena`] is the seam: it is
//! implemented by whatever owns the mapped file (the object heap), so this module can be
//! exercised against a plain in-memory mock.

use std::num::NonZeroU64;

use deku::prelude::*;

use crate::error::{JournalError, Result};
use crate::objects::ObjectType;

#[derive(Debug, Clone, Copy, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct HashItem {
    #[deku(map = "|field: u64| -> Result<_, DekuError> { Ok(NonZeroU64::new(field)) }")]
    pub head_hash_offset: Option<NonZeroU64>,
    #[deku(map = "|field: u64| -> Result<_, DekuError> { Ok(NonZeroU64::new(field)) }")]
    pub tail_hash_offset: Option<NonZeroU64>,
}

pub const HASH_ITEM_SIZE: u64 = 16;
const _: [(); HASH_ITEM_SIZE as usize] = [(); 16];

impl HashItem {
    pub const EMPTY: HashItem = HashItem {
        head_hash_offset: None,
        tail_hash_offset: None,
    };
}

/// Minimum data-table bucket count, matching the smallest real-world file size.
pub const MIN_DATA_BUCKETS: u64 = 2047;

/// Field table bucket count is not derived from file size; field-name cardinality is
/// bounded by the application, not by log volume.
pub const FIELD_BUCKETS: u64 = 333;

/// `buckets = max_size * 4 / 768 / 3`, approximately one bucket per 768 bytes of arena,
/// targeting a 75% load factor at the configured maximum file size (spec §4.3).
pub fn data_bucket_count(max_size: u64) -> u64 {
    let computed = max_size.saturating_mul(4) / 768 / 3;
    computed.max(MIN_DATA_BUCKETS)
}

pub fn field_bucket_count() -> u64 {
    FIELD_BUCKETS
}

pub fn bucket_index(hash: u64, n_buckets: u64) -> u64 {
    if n_buckets == 0 {
        0
    } else {
        hash % n_buckets
    }
}

/// The operations a hash-table walk needs from the arena that owns the objects it chains
/// through. Implemented by the object heap; a test-only in-memory mock lives in this
/// module's tests.
pub trait ObjectArena {
    fn read_hash_item(&self, table_offset: u64, bucket: u64) -> Result<HashItem>;
    fn write_hash_item(&mut self, table_offset: u64, bucket: u64, item: HashItem) -> Result<()>;

    /// Read `(hash, next_hash_offset)` out of the object at `offset`, which must be of
    /// `object_type` (`Data` or `Field`).
    fn read_chain_link(&self, offset: u64, object_type: ObjectType) -> Result<(u64, u64)>;

    /// Patch the `next_hash_offset` field of the object at `offset` in place.
    fn write_chain_next(&mut self, offset: u64, object_type: ObjectType, next: u64) -> Result<()>;

    /// Byte-equality check against a Data object's (decompressed) payload. Only called
    /// for the data table; the field table matches on hash alone.
    fn payload_equal(&self, data_offset: u64, payload: &[u8]) -> Result<bool>;
}

/// A hash table's location and the chain-depth ceiling it has observed so far.
pub struct HashTable {
    pub table_offset: u64,
    pub n_buckets: u64,
    pub object_type: ObjectType,
}

impl HashTable {
    pub fn new(table_offset: u64, n_buckets: u64, object_type: ObjectType) -> Self {
        Self {
            table_offset,
            n_buckets,
            object_type,
        }
    }

    /// Walk the bucket chain for `hash`, looking for an existing object. For the data
    /// table, `payload` must be `Some` and is compared byte-for-byte against candidates
    /// that share the hash; for the field table, `payload` is `None` and a hash match is
    /// taken as identity. Returns the matching object's offset and the longest chain depth
    /// walked, or `None` with the depth walked if nothing matched.
    pub fn find<A: ObjectArena>(
        &self,
        arena: &A,
        hash: u64,
        payload: Option<&[u8]>,
    ) -> Result<(Option<u64>, u64)> {
        let bucket = bucket_index(hash, self.n_buckets);
        let item = arena.read_hash_item(self.table_offset, bucket)?;
        let mut depth = 0u64;
        let mut prev_offset = 0u64;
        let mut cursor = item.head_hash_offset.map(NonZeroU64::get);

        while let Some(offset) = cursor {
            if prev_offset != 0 && offset <= prev_offset {
                return Err(JournalError::BadMessage(format!(
                    "hash chain cycle at bucket {bucket}: offset {offset} did not increase past {prev_offset}"
                )));
            }
            depth += 1;
            let (candidate_hash, next) = arena.read_chain_link(offset, self.object_type)?;
            if candidate_hash == hash {
                let matches = match payload {
                    Some(p) => arena.payload_equal(offset, p)?,
                    None => true,
                };
                if matches {
                    return Ok((Some(offset), depth));
                }
            }
            prev_offset = offset;
            cursor = NonZeroU64::new(next).map(NonZeroU64::get);
        }

        Ok((None, depth))
    }

    /// Append `offset` to the tail of its bucket's chain, linking it via the object's own
    /// `next_hash_offset` field. Does not check for an existing entry; callers must `find`
    /// first.
    pub fn link<A: ObjectArena>(&self, arena: &mut A, offset: u64, hash: u64) -> Result<()> {
        let bucket = bucket_index(hash, self.n_buckets);
        let item = arena.read_hash_item(self.table_offset, bucket)?;

        match item.tail_hash_offset {
            None => {
                arena.write_hash_item(
                    self.table_offset,
                    bucket,
                    HashItem {
                        head_hash_offset: NonZeroU64::new(offset),
                        tail_hash_offset: NonZeroU64::new(offset),
                    },
                )?;
            }
            Some(tail) => {
                arena.write_chain_next(tail.get(), self.object_type, offset)?;
                arena.write_hash_item(
                    self.table_offset,
                    bucket,
                    HashItem {
                        head_hash_offset: item.head_hash_offset,
                        tail_hash_offset: NonZeroU64::new(offset),
                    },
                )?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    struct MockArena {
        buckets: HashMap<(u64, u64), HashItem>,
        objects: HashMap<u64, (u64, u64, Vec<u8>)>, // offset -> (hash, next, payload)
    }

    impl ObjectArena for MockArena {
        fn read_hash_item(&self, table_offset: u64, bucket: u64) -> Result<HashItem> {
            Ok(self
                .buckets
                .get(&(table_offset, bucket))
                .copied()
                .unwrap_or(HashItem::EMPTY))
        }

        fn write_hash_item(&mut self, table_offset: u64, bucket: u64, item: HashItem) -> Result<()> {
            self.buckets.insert((table_offset, bucket), item);
            Ok(())
        }

        fn read_chain_link(&self, offset: u64, _object_type: ObjectType) -> Result<(u64, u64)> {
            let (hash, next, _) = self
                .objects
                .get(&offset)
                .ok_or_else(|| JournalError::NotFound)?;
            Ok((*hash, *next))
        }

        fn write_chain_next(&mut self, offset: u64, _object_type: ObjectType, next: u64) -> Result<()> {
            self.objects.get_mut(&offset).unwrap().1 = next;
            Ok(())
        }

        fn payload_equal(&self, data_offset: u64, payload: &[u8]) -> Result<bool> {
            Ok(self.objects.get(&data_offset).unwrap().2 == payload)
        }
    }

    impl MockArena {
        fn insert(&mut self, offset: u64, hash: u64, payload: &[u8]) {
            self.objects.insert(offset, (hash, 0, payload.to_vec()));
        }
    }

    #[test]
    fn find_returns_none_on_empty_bucket() {
        let arena = MockArena::default();
        let table = HashTable::new(1000, 16, ObjectType::Data);
        let (found, depth) = table.find(&arena, 42, Some(b"x")).unwrap();
        assert_eq!(found, None);
        assert_eq!(depth, 0);
    }

    #[test]
    fn link_then_find_round_trips() {
        let mut arena = MockArena::default();
        let table = HashTable::new(1000, 16, ObjectType::Data);
        arena.insert(2000, 42, b"hello");
        table.link(&mut arena, 2000, 42).unwrap();

        let (found, depth) = table.find(&arena, 42, Some(b"hello")).unwrap();
        assert_eq!(found, Some(2000));
        assert_eq!(depth, 1);
    }

    #[test]
    fn chained_entries_walk_in_order() {
        let mut arena = MockArena::default();
        let table = HashTable::new(1000, 1, ObjectType::Data); // force same bucket
        arena.insert(2000, 42, b"first");
        arena.insert(3000, 42, b"second");
        table.link(&mut arena, 2000, 42).unwrap();
        table.link(&mut arena, 3000, 42).unwrap();

        let (found, depth) = table.find(&arena, 42, Some(b"second")).unwrap();
        assert_eq!(found, Some(3000));
        assert_eq!(depth, 2);
    }

    #[test]
    fn cycle_is_rejected() {
        let mut arena = MockArena::default();
        arena.insert(3000, 42, b"a");
        arena.insert(2000, 42, b"b");
        // Manually wire a backwards link: 3000 -> 2000 where 2000 < 3000.
        arena.objects.get_mut(&3000).unwrap().1 = 2000;
        arena
            .buckets
            .insert((1000, 0), HashItem {
                head_hash_offset: NonZeroU64::new(3000),
                tail_hash_offset: NonZeroU64::new(2000),
            });

        let table = HashTable::new(1000, 1, ObjectType::Data);
        let result = table.find(&arena, 42, Some(b"b"));
        assert!(result.is_err());
    }

    #[test]
    fn data_bucket_count_is_floored() {
        assert_eq!(data_bucket_count(0), MIN_DATA_BUCKETS);
        assert_eq!(data_bucket_count(1_000_000_000), 1_000_000_000 * 4 / 768 / 3);
    }

    #[test]
    fn field_table_matches_on_hash_alone() {
        let mut arena = MockArena::default();
        let table = HashTable::new(1000, 16, ObjectType::Field);
        arena.insert(2000, 99, b"MESSAGE");
        table.link(&mut arena, 2000, 99).unwrap();

        let (found, _) = table.find(&arena, 99, None).unwrap();
        assert_eq!(found, Some(2000));
    }
}
