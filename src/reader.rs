//! Read-only facade over one scope's journal files (spec §6.3).
//!
//! A scope (`system`, `user-1000`, ...) is usually spread across several files: zero or
//! more archived ones plus, if the writer is still active, one live one. [`JournalReader`]
//! stitches them into a single ordered stream, rolling over to the next file once the
//! current one is exhausted.

use std::fs;
use std::path::{Path, PathBuf};

use jiff::Timestamp;

use crate::chain::Direction;
use crate::error::{JournalError, Result};
use crate::file::{compare_locations, Journal, Location};
use crate::heap::Metrics;
use crate::naming;

/// One journal owner found by [`list`]: a machine ID and the scope name its files share.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalSource {
    pub machine_id: u128,
    pub scope: String,
}

/// Enumerate the distinct `(machine_id, scope)` pairs among the journal files directly
/// inside `directory`. Each distinct filename prefix up to its first `@` counts as one
/// scope; the machine ID is read from whichever one of that scope's files opens first.
pub fn list(directory: &Path) -> Result<Vec<JournalSource>> {
    let mut by_prefix: Vec<(String, PathBuf)> = Vec::new();
    for entry in fs::read_dir(directory)? {
        let entry = entry?;
        let path = entry.path();
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(n) => n,
            None => continue,
        };
        if !name.ends_with(".journal") {
            continue;
        }
        let prefix = match naming::parse_archived_filename(&path) {
            Some(parsed) => parsed.prefix,
            None => name.trim_end_matches(".journal").to_string(),
        };
        if !by_prefix.iter().any(|(p, _)| *p == prefix) {
            by_prefix.push((prefix, path));
        }
    }

    let mut sources = Vec::with_capacity(by_prefix.len());
    for (scope, path) in by_prefix {
        let metrics = Metrics::for_file(&fs::File::open(&path)?)?;
        let journal = Journal::open_existing(&path, false, metrics, None)?;
        let machine_id = journal.header_snapshot().machine_id;
        sources.push(JournalSource { machine_id, scope });
    }
    Ok(sources)
}

/// One ordered entry read back from a scope, with its cursor and decompressed field data.
#[derive(Debug, Clone)]
pub struct Entry {
    pub location: Location,
    pub realtime: Timestamp,
    pub fields: Vec<Vec<u8>>,
}

/// All of one scope's files, oldest archived first and the live file (if any) last, as
/// resolved at construction time. A reader does not notice files rotated in after it was
/// built; construct a fresh one to pick those up.
#[derive(Debug)]
pub struct JournalReader {
    scope: String,
    files: Vec<PathBuf>,
    position: Option<(usize, u64)>,
}

impl JournalReader {
    /// Resolve `scope`'s files inside `directory`, ordering archived files by their
    /// recorded `head_seqnum` and placing the live file (if present) last.
    pub fn new(directory: &Path, scope: impl ToString) -> Result<Self> {
        let scope = scope.to_string();
        let mut archived: Vec<(u64, PathBuf)> = Vec::new();
        let mut live = None;

        for entry in fs::read_dir(directory)? {
            let entry = entry?;
            let path = entry.path();
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(n) => n,
                None => continue,
            };
            if !name.ends_with(".journal") {
                continue;
            }
            if let Some(parsed) = naming::parse_archived_filename(&path) {
                if parsed.prefix == scope {
                    archived.push((parsed.head_seqnum, path));
                }
            } else if path == directory.join(naming::live_filename(&scope)) {
                live = Some(path);
            }
        }

        archived.sort_by_key(|(seqnum, _)| *seqnum);
        let mut files: Vec<PathBuf> = archived.into_iter().map(|(_, path)| path).collect();
        if let Some(live) = live {
            files.push(live);
        }

        Ok(Self { scope, files, position: None })
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    fn open(&self, index: usize) -> Result<Journal> {
        let path = self.files.get(index).ok_or(JournalError::NotFound)?;
        let metrics = Metrics::for_file(&fs::File::open(path)?)?;
        Journal::open_existing(path, false, metrics, None)
    }

    /// Verify one file's structural integrity by walking every entry from head to tail;
    /// any corruption surfaced along the way fails the check (spec §6.3 `verify`).
    pub fn verify(&self, index: usize) -> Result<bool> {
        let journal = self.open(index)?;
        let mut offset = match journal.seek_by_offset(0, Direction::Down)? {
            Some(offset) => offset,
            None => return Ok(true),
        };
        loop {
            if let Err(err) = journal.entry_payloads(offset) {
                if err.is_recoverable_by_dispose() {
                    tracing::warn!(%err, "verification found corruption");
                    return Ok(false);
                }
                return Err(err);
            }
            match journal.next_entry(offset, Direction::Down) {
                Ok(Some(next)) => offset = next,
                Ok(None) => return Ok(true),
                Err(err) if err.is_recoverable_by_dispose() => {
                    tracing::warn!(%err, "verification found corruption");
                    return Ok(false);
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Verify every file that makes up this scope.
    pub fn verify_all(&self) -> Result<bool> {
        for index in 0..self.files.len() {
            if !self.verify(index)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// The offset bound that makes [`Journal::seek_by_offset`] land on the first
    /// (`Down`) or last (`Up`) entry in a file, regardless of what offsets actually exist.
    fn edge_target(direction: Direction) -> u64 {
        match direction {
            Direction::Down => 0,
            Direction::Up => u64::MAX,
        }
    }

    fn read_entry(&self, index: usize, offset: u64) -> Result<Entry> {
        let journal = self.open(index)?;
        let location = journal.location_for_entry(offset)?;
        let realtime = Timestamp::from_microsecond(location.realtime as i64)
            .map_err(|e| JournalError::BadMessage(e.to_string()))?;
        let fields = journal.entry_payloads(offset)?;
        Ok(Entry { location, realtime, fields })
    }

    /// Step to the next entry in `direction`, rolling over to an adjacent file when the
    /// current one is exhausted. Returns `None` once the whole scope is exhausted in that
    /// direction.
    pub fn step(&mut self, direction: Direction) -> Result<Option<Entry>> {
        if self.files.is_empty() {
            return Ok(None);
        }

        let (mut index, mut offset) = match self.position {
            Some(pos) => pos,
            None => {
                let start_index = match direction {
                    Direction::Down => 0,
                    Direction::Up => self.files.len() - 1,
                };
                let mut idx = start_index;
                loop {
                    let journal = self.open(idx)?;
                    if let Some(offset) = journal.seek_by_offset(Self::edge_target(direction), direction)? {
                        self.position = Some((idx, offset));
                        return Ok(Some(self.read_entry(idx, offset)?));
                    }
                    let next = match direction {
                        Direction::Down if idx + 1 < self.files.len() => idx + 1,
                        Direction::Up if idx > 0 => idx - 1,
                        _ => return Ok(None),
                    };
                    idx = next;
                }
            }
        };

        loop {
            let journal = self.open(index)?;
            match journal.next_entry(offset, direction)? {
                Some(next_offset) => {
                    self.position = Some((index, next_offset));
                    return Ok(Some(self.read_entry(index, next_offset)?));
                }
                None => {
                    let next_index = match direction {
                        Direction::Down if index + 1 < self.files.len() => index + 1,
                        Direction::Up if index > 0 => index - 1,
                        _ => return Ok(None),
                    };
                    let next_journal = self.open(next_index)?;
                    match next_journal.seek_by_offset(Self::edge_target(direction), direction)? {
                        Some(next_offset) => {
                            index = next_index;
                            offset = next_offset;
                            self.position = Some((index, offset));
                            return Ok(Some(self.read_entry(index, offset)?));
                        }
                        None => {
                            index = next_index;
                            continue;
                        }
                    }
                }
            }
        }
    }

    /// Seek to the entry with seqnum `seqnum`, or the nearest one in `direction`.
    pub fn seek_to_seqnum(&mut self, seqnum: u64, direction: Direction) -> Result<Option<Entry>> {
        for index in 0..self.files.len() {
            let journal = self.open(index)?;
            if let Some(offset) = journal.seek_by_seqnum(seqnum, direction)? {
                self.position = Some((index, offset));
                return Ok(Some(self.read_entry(index, offset)?));
            }
        }
        Ok(None)
    }

    /// Seek to the entry closest to `timestamp`, or the nearest one in `direction`.
    pub fn seek_to_timestamp(&mut self, timestamp: Timestamp, direction: Direction) -> Result<Option<Entry>> {
        for index in 0..self.files.len() {
            let journal = self.open(index)?;
            if let Some(offset) = journal.seek_by_realtime(timestamp, direction)? {
                self.position = Some((index, offset));
                return Ok(Some(self.read_entry(index, offset)?));
            }
        }
        Ok(None)
    }

    /// Seek to the first entry recorded under `boot_id`.
    pub fn seek_to_boot_id(&mut self, boot_id: u128) -> Result<Option<Entry>> {
        for index in 0..self.files.len() {
            let journal = self.open(index)?;
            if let Some(offset) = journal.seek_by_monotonic(boot_id, 0, Direction::Down)? {
                self.position = Some((index, offset));
                return Ok(Some(self.read_entry(index, offset)?));
            }
        }
        Ok(None)
    }

    /// Save the current position as a comparable cursor, or `None` before the first `step`.
    pub fn cursor(&self) -> Result<Option<Location>> {
        let Some((index, offset)) = self.position else { return Ok(None) };
        Ok(Some(self.open(index)?.location_for_entry(offset)?))
    }
}

/// Compare two cursors, as returned by [`JournalReader::cursor`] (spec §6.3 `compare_locations`).
pub fn compare_cursors(a: &Location, b: &Location) -> std::cmp::Ordering {
    compare_locations(a, b)
}
