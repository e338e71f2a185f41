//! Write-side facade over one scope's live journal file (spec §6.3).
//!
//! Owns exactly one writable [`Journal`] at a time — the live file named by
//! [`naming::live_filename`] inside the scope's directory — and replaces it with a fresh
//! one whenever [`JournalWriter::rotate`] is called or [`Journal::rotate_suggested`] says
//! the current file has outgrown its hash tables.

pub use crate::writer::options::{Compression, CreateOptions};

mod options;

use std::path::{Path, PathBuf};

use jiff::Timestamp;

use crate::error::Result;
use crate::file::Journal;
use crate::heap::Metrics;
use crate::naming;

fn metrics_for(directory: &Path) -> Result<Metrics> {
    let dir_file = std::fs::File::open(directory)?;
    Metrics::for_file(&dir_file)
}

/// One scope's writable journal, rotating to a fresh file transparently as needed.
pub struct JournalWriter {
    directory: PathBuf,
    options: CreateOptions,
    journal: Journal,
}

impl std::fmt::Debug for JournalWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JournalWriter")
            .field("directory", &self.directory)
            .field("options", &self.options)
            .finish()
    }
}

impl JournalWriter {
    /// Open (creating if absent) the live file for `options.scope` inside `directory`,
    /// recovering from corruption per [`Journal::open_reliably`].
    pub fn open(directory: &Path, options: CreateOptions) -> Result<Self> {
        std::fs::create_dir_all(directory)?;
        let path = directory.join(naming::live_filename(&options.scope));
        let metrics = metrics_for(directory)?;
        let journal = Journal::open_reliably(&path, true, metrics, Some(&options))?;
        Ok(Self { directory: directory.to_path_buf(), options, journal })
    }

    /// Write an entry (a set of already-encoded `name=value` items) to the live file,
    /// rotating first if [`Journal::rotate_suggested`] recommends it.
    pub fn write_entry(&mut self, realtime: Timestamp, monotonic: u64, items: &[&[u8]]) -> Result<u64> {
        if self.journal.rotate_suggested(None) {
            self.rotate()?;
        }
        self.journal.append_entry(realtime, monotonic, None, items, None)
    }

    /// Copy one entry from another file (e.g. during a merge or vacuum) into the live file.
    pub fn copy_entry(&mut self, src: &Journal, entry_offset: u64) -> Result<u64> {
        if self.journal.rotate_suggested(None) {
            self.rotate()?;
        }
        self.journal.copy_entry(src, entry_offset)
    }

    /// Archive the current live file and start a fresh one in its place, inheriting its
    /// `seqnum_id` lineage (spec §4.7).
    pub fn rotate(&mut self) -> Result<()> {
        tracing::info!(scope = %self.options.scope, "rotating journal file");
        self.journal = self.journal.rotate()?;
        Ok(())
    }

    /// Seal the journal, if sealing is enabled; a no-op otherwise (spec §6.5).
    pub fn seal(&mut self) -> Result<()> {
        if self.options.seal {
            self.journal.maybe_append_tag(Timestamp::now())?;
        }
        Ok(())
    }

    /// Bring the live file cleanly offline.
    pub fn close(self) -> Result<()> {
        self.journal.close()
    }

    pub fn rotate_suggested(&self, max_age_usec: Option<u64>) -> bool {
        self.journal.rotate_suggested(max_age_usec)
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_creates_the_live_file_and_writes_entries() {
        let dir = tempfile::tempdir().unwrap();
        let options = CreateOptions::new(1, 1, "system").with_compression(None);
        let mut writer = JournalWriter::open(dir.path(), options).unwrap();

        writer
            .write_entry(Timestamp::from_microsecond(1_000_000).unwrap(), 1, &[b"MESSAGE=hi"])
            .unwrap();
        assert_eq!(writer.journal().header_snapshot().n_entries, 1);

        assert!(dir.path().join("system.journal").exists());
        writer.close().unwrap();
    }

    #[test]
    fn rotate_archives_the_old_file_and_keeps_writing() {
        let dir = tempfile::tempdir().unwrap();
        let options = CreateOptions::new(1, 1, "system").with_compression(None);
        let mut writer = JournalWriter::open(dir.path(), options).unwrap();

        writer
            .write_entry(Timestamp::from_microsecond(1_000_000).unwrap(), 1, &[b"MESSAGE=one"])
            .unwrap();
        writer.rotate().unwrap();
        writer
            .write_entry(Timestamp::from_microsecond(1_000_001).unwrap(), 2, &[b"MESSAGE=two"])
            .unwrap();

        let archived = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains('@'))
            .count();
        assert_eq!(archived, 1);
        assert_eq!(writer.journal().header_snapshot().n_entries, 1);
        writer.close().unwrap();
    }
}
