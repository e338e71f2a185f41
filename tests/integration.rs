//! End-to-end scenarios exercised through the public reader/writer facade, rather than
//! through `Journal` directly (see the `#[cfg(test)]` modules in `src/file.rs` for
//! lower-level coverage of the same invariants).

use jiff::Timestamp;

use journal_store::chain::Direction;
use journal_store::file::Journal;
use journal_store::heap::Metrics;
use journal_store::naming;
use journal_store::reader::JournalReader;
use journal_store::writer::{CreateOptions, JournalWriter};

fn small_metrics() -> Metrics {
    Metrics::from_fs_size(Some(1 << 30))
}

/// Scenario A: a new file, three entries, two of which share a value.
#[test]
fn three_entries_with_one_shared_value() {
    let dir = tempfile::tempdir().unwrap();
    let options = CreateOptions::new(1, 1, "test").with_compression(None);
    let mut writer = JournalWriter::open(dir.path(), options).unwrap();

    let t1 = Timestamp::from_microsecond(1_000_000).unwrap();
    let t2 = Timestamp::from_microsecond(1_000_001).unwrap();
    let t3 = Timestamp::from_microsecond(1_000_002).unwrap();
    writer.write_entry(t1, 1, &[b"MESSAGE=hello", b"PRIORITY=6"]).unwrap();
    writer.write_entry(t2, 2, &[b"MESSAGE=world", b"PRIORITY=6"]).unwrap();
    writer.write_entry(t3, 3, &[b"MESSAGE=hello", b"PRIORITY=3"]).unwrap();

    let header = writer.journal().header_snapshot();
    assert_eq!(header.n_entries, 3);
    assert_eq!(header.n_data, Some(4));
    assert_eq!(header.n_fields, Some(2));
    writer.close().unwrap();

    let mut reader = JournalReader::new(dir.path(), "test").unwrap();
    let found = reader.seek_to_timestamp(t2, Direction::Down).unwrap().unwrap();
    assert_eq!(found.fields, vec![b"MESSAGE=world".to_vec(), b"PRIORITY=6".to_vec()]);
}

/// Scenario B: rotating the live file archives it under a name that round-trips back to
/// the lineage and head position it was rotated at.
#[test]
fn rotate_archives_under_a_parseable_name_and_keeps_appending() {
    let dir = tempfile::tempdir().unwrap();
    let options = CreateOptions::new(1, 1, "test").with_compression(None);
    let mut writer = JournalWriter::open(dir.path(), options).unwrap();

    let t1 = Timestamp::from_microsecond(1_000_000).unwrap();
    writer.write_entry(t1, 1, &[b"MESSAGE=hello"]).unwrap();
    let predecessor_seqnum_id = writer.journal().header_snapshot().seqnum_id.get();

    writer.rotate().unwrap();
    let header = writer.journal().header_snapshot();
    assert_eq!(header.seqnum_id.get(), predecessor_seqnum_id);
    assert_eq!(header.head_entry_seqnum, 0);
    assert_eq!(header.n_entries, 0);

    let t2 = Timestamp::from_microsecond(1_000_002).unwrap();
    writer.write_entry(t2, 2, &[b"MESSAGE=world"]).unwrap();
    assert_eq!(writer.journal().header_snapshot().head_entry_seqnum, 2);
    writer.close().unwrap();

    let archived = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .find(|p| p.file_name().unwrap().to_str().unwrap().contains('@'))
        .expect("predecessor file was archived");

    let parsed = naming::parse_archived_filename(&archived).unwrap();
    assert_eq!(parsed.prefix, "test");
    assert_eq!(parsed.seqnum_id, predecessor_seqnum_id);
    assert_eq!(parsed.head_seqnum, 1);
    assert_eq!(parsed.head_realtime, 1_000_000);

    assert!(dir.path().join("test.journal").exists());
}

/// Scenario D (reduced scale): bisecting by seqnum still finds the exact target entry
/// when some unrelated entries earlier in the chain are corrupt.
#[test]
fn seek_by_seqnum_tolerates_corruption_earlier_in_the_chain() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.journal");
    let options = CreateOptions::new(1, 1, "test").with_compression(None);
    let metrics = small_metrics();
    let journal = Journal::create_new(&path, &options, metrics, None).unwrap();

    let mut offsets = Vec::new();
    for i in 0..200u64 {
        let t = Timestamp::from_microsecond(1_000_000 + i as i64).unwrap();
        offsets.push(journal.append_entry(t, i + 1, None, &[b"MESSAGE=x"], None).unwrap());
    }

    // Smash the object-type byte of a handful of entries that sort well below the
    // target, leaving every entry from the target onward intact. This makes
    // `check_type` reject them, the same failure mode a torn or partial write leaves.
    {
        use std::os::unix::fs::FileExt;
        let file = std::fs::OpenOptions::new().read(true).write(true).open(&path).unwrap();
        for &corrupt_at in &[offsets[3], offsets[17], offsets[40]] {
            file.write_at(&[0xaa], corrupt_at).unwrap();
        }
    }

    journal.close().unwrap();
    let reopened = Journal::open_existing(&path, true, metrics, None).unwrap();
    let found = reopened.seek_by_seqnum(150, Direction::Up).unwrap().unwrap();
    assert_eq!(found, offsets[149]);
}

/// Scenario E: once a data-hash bucket's chain depth passes 100, rotation is suggested.
#[test]
fn deep_hash_chain_triggers_rotate_suggested() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.journal");
    // A single-bucket table forces every distinct value into the same chain.
    let options = CreateOptions::new(1, 1, "test")
        .with_compression(None)
        .with_data_hash_table_capacity(1)
        .with_field_hash_table_capacity(1);
    let metrics = small_metrics();
    let journal = Journal::create_new(&path, &options, metrics, None).unwrap();

    assert!(!journal.rotate_suggested(None));
    // Each append's hash lookup walks the whole existing chain before concluding its
    // value is new, so inserting the Nth distinct value observes a chain depth of N-1;
    // 102 distinct values are needed for the depth to exceed 100.
    for i in 0..102u64 {
        let t = Timestamp::from_microsecond(1_000_000 + i as i64).unwrap();
        let field = format!("MESSAGE={i}");
        journal.append_entry(t, i + 1, None, &[field.as_bytes()], None).unwrap();
    }

    assert!(journal.rotate_suggested(None));
    assert!(journal.header_snapshot().data_hash_chain_depth.unwrap() > 100);
}

/// Property 7: a payload that crosses the compression threshold still round-trips
/// byte-for-byte, whether or not compression actually ran.
#[test]
fn large_and_small_payloads_round_trip_identically() {
    let dir = tempfile::tempdir().unwrap();
    let options = CreateOptions::new(1, 1, "test"); // default: zstd on
    let mut writer = JournalWriter::open(dir.path(), options).unwrap();

    let small = b"MESSAGE=short".to_vec();
    let mut long_value = b"MESSAGE=".to_vec();
    long_value.extend(std::iter::repeat(b'a').take(2000));

    let t = Timestamp::from_microsecond(1_000_000).unwrap();
    writer.write_entry(t, 1, &[small.as_slice()]).unwrap();
    let t2 = Timestamp::from_microsecond(1_000_001).unwrap();
    writer.write_entry(t2, 2, &[long_value.as_slice()]).unwrap();
    writer.close().unwrap();

    let mut reader = JournalReader::new(dir.path(), "test").unwrap();
    let first = reader.step(Direction::Down).unwrap().unwrap();
    assert_eq!(first.fields, vec![small]);
    let second = reader.step(Direction::Down).unwrap().unwrap();
    assert_eq!(second.fields, vec![long_value]);
}

/// Property 9, exercised through the reader facade: corruption partway through a file
/// is reported by `verify`, not silently accepted or propagated as a panic.
#[test]
fn verify_reports_corruption_instead_of_panicking() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.journal");
    let options = CreateOptions::new(1, 1, "test").with_compression(None);
    let metrics = small_metrics();
    let journal = Journal::create_new(&path, &options, metrics, None).unwrap();

    let mut offsets = Vec::new();
    for i in 0..5u64 {
        let t = Timestamp::from_microsecond(1_000_000 + i as i64).unwrap();
        offsets.push(journal.append_entry(t, i + 1, None, &[b"MESSAGE=x"], None).unwrap());
    }
    journal.close().unwrap();

    // Smash the object-type byte of an entry in the middle of the file; the header and
    // every other entry stay intact, so the file still opens.
    {
        use std::os::unix::fs::FileExt;
        let file = std::fs::OpenOptions::new().read(true).write(true).open(&path).unwrap();
        file.write_at(&[0xaa], offsets[2]).unwrap();
    }

    let reader = JournalReader::new(dir.path(), "test").unwrap();
    assert_eq!(reader.verify(0).unwrap(), false);
}
