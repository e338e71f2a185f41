//! Sliding mmap windows over a journal file, one per [`TypeContext`] (spec §4.1).
//!
//! Rather than mapping the whole file once, each object type gets its own window that is
//! re-mapped as reads and writes move around the arena. Hash tables ask to be
//! `keep_always`d so the table stays resident across many bucket lookups instead of being
//! evicted by whatever object was read last.

use std::fs::File;
use std::ops::{Deref, DerefMut, Range};
use std::os::unix::fs::MetadataExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use memmap2::{Mmap, MmapMut, MmapOptions};
use parking_lot::{Mutex, MutexGuard};

use crate::error::{JournalError, Result};
use crate::layout::page_align;
use crate::objects::ObjectType;

use super::sigbus::{self, Registration};

/// One of the fixed set of independent window slots a file keeps open at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum TypeContext {
    Header = 0,
    Data = 1,
    Field = 2,
    Entry = 3,
    DataHashTable = 4,
    FieldHashTable = 5,
    EntryArray = 6,
    Tag = 7,
}

pub const N_CONTEXTS: usize = 8;

impl TypeContext {
    pub fn index(self) -> usize {
        self as usize
    }

    /// Unknown object types are only ever skipped over, never mapped for their payload,
    /// so they can share the `Entry` slot without contending with anything meaningful.
    pub fn for_object(object_type: ObjectType) -> Self {
        match object_type {
            ObjectType::Data => TypeContext::Data,
            ObjectType::Field => TypeContext::Field,
            ObjectType::Entry => TypeContext::Entry,
            ObjectType::DataHashTable => TypeContext::DataHashTable,
            ObjectType::FieldHashTable => TypeContext::FieldHashTable,
            ObjectType::EntryArray => TypeContext::EntryArray,
            ObjectType::Tag => TypeContext::Tag,
            ObjectType::Unknown(_) => TypeContext::Entry,
        }
    }
}

enum Mapping {
    ReadOnly(Mmap),
    ReadWrite(MmapMut),
}

impl Mapping {
    fn as_slice(&self) -> &[u8] {
        match self {
            Mapping::ReadOnly(m) => &m[..],
            Mapping::ReadWrite(m) => &m[..],
        }
    }

    fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        match self {
            Mapping::ReadWrite(m) => Some(&mut m[..]),
            Mapping::ReadOnly(_) => None,
        }
    }

    fn flush(&self) -> std::io::Result<()> {
        match self {
            Mapping::ReadWrite(m) => m.flush(),
            Mapping::ReadOnly(_) => Ok(()),
        }
    }
}

struct Window {
    range: Range<u64>,
    mapping: Mapping,
    // `None` if the registry ran out of slots; treated as "assume no sigbus", same as
    // systemd does when mmap-cache's own bookkeeping is exhausted.
    registration: Option<Registration>,
    keep_always: bool,
}

impl Window {
    fn covers(&self, offset: u64, size: u64) -> bool {
        offset >= self.range.start && offset + size <= self.range.end
    }

    fn triggered(&self) -> bool {
        self.registration.as_ref().is_some_and(Registration::triggered)
    }
}

struct FstatCache {
    size: u64,
    nlink: u64,
    checked_at: Option<Instant>,
}

/// Per-file mmap window cache. One per open journal file; the underlying fault registry
/// (`sigbus` module) is process-wide, but each `WindowCache` only ever asks about its own
/// registrations.
pub struct WindowCache {
    file: File,
    writable: bool,
    windows: [Mutex<Option<Window>>; N_CONTEXTS],
    fstat: Mutex<FstatCache>,
    // Once any window's registration reports a fault, this stays `true` for the rest of
    // the `WindowCache`'s life: SIGBUS is sticky per *file* (spec §7/§8 property 10), not
    // just for the one `TypeContext` whose window happened to fault.
    file_sigbus: AtomicBool,
}

const FSTAT_INTERVAL: Duration = Duration::from_secs(5);

impl WindowCache {
    pub fn new(file: File, writable: bool) -> Result<Self> {
        let meta = file.metadata()?;
        let cache = Self {
            file,
            writable,
            windows: std::array::from_fn(|_| Mutex::new(None)),
            fstat: Mutex::new(FstatCache {
                size: meta.size(),
                nlink: meta.nlink(),
                checked_at: Some(Instant::now()),
            }),
            file_sigbus: AtomicBool::new(false),
        };
        if meta.nlink() == 0 {
            return Err(JournalError::IdRm);
        }
        Ok(cache)
    }

    /// Stat the backing descriptor and cache `st_size`/`st_nlink`. Rate-limited to once
    /// per 5 seconds as long as the previous check found the file still linked; a file
    /// observed gone is always rechecked (recovery is not expected, but a spurious stat
    /// failure shouldn't get stuck).
    pub fn refresh_fstat(&self, force: bool) -> Result<(u64, u64)> {
        let mut cache = self.fstat.lock();
        let fresh_enough = !force
            && cache.nlink > 0
            && cache
                .checked_at
                .is_some_and(|at| at.elapsed() < FSTAT_INTERVAL);
        if fresh_enough {
            return Ok((cache.size, cache.nlink));
        }

        let meta = self.file.metadata()?;
        cache.size = meta.size();
        cache.nlink = meta.nlink();
        cache.checked_at = Some(Instant::now());

        if cache.nlink == 0 {
            return Err(JournalError::IdRm);
        }
        Ok((cache.size, cache.nlink))
    }

    /// The underlying file descriptor, shared with the object heap so it doesn't need its
    /// own handle just to call `posix_fallocate`/`statvfs`.
    pub fn file(&self) -> &File {
        &self.file
    }

    /// Whether a SIGBUS has ever been recorded against any of this file's mapped windows.
    /// Sticky at the file level: once a single window's registration reports a fault, this
    /// keeps returning `true` for the rest of the file's life, even after that window is
    /// later evicted and replaced by one that never faulted (a `Registration`'s own `hit`
    /// flag resets on drop, but `file_sigbus` does not).
    pub fn got_sigbus(&self) -> bool {
        if self.file_sigbus.load(Ordering::Acquire) {
            return true;
        }
        let any_triggered = self
            .windows
            .iter()
            .any(|slot| slot.lock().as_ref().is_some_and(Window::triggered));
        if any_triggered {
            self.file_sigbus.store(true, Ordering::Release);
        }
        any_triggered
    }

    fn ensure_window(&self, ctx: TypeContext, offset: u64, size: u64, keep_always: bool) -> Result<()> {
        if self.got_sigbus() {
            return Err(JournalError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "sigbus recorded for this file",
            )));
        }

        let (st_size, _) = self.refresh_fstat(false)?;
        if offset + size > st_size {
            let (st_size, _) = self.refresh_fstat(true)?;
            if offset + size > st_size {
                return Err(JournalError::NoData(format!(
                    "window [{offset}, {end}) exceeds file size {st_size}",
                    end = offset + size
                )));
            }
        }

        let mut slot = self.windows[ctx.index()].lock();

        if let Some(window) = slot.as_ref() {
            if window.covers(offset, size) {
                return Ok(());
            }
        }

        let window_start = offset - (offset % 4096);
        let window_end = page_align(offset + size).max(window_start + 4096);
        let window_end = window_end.min(st_size);
        let window_len = (window_end - window_start) as usize;

        let mapping = if self.writable {
            let mmap = unsafe {
                MmapOptions::new()
                    .offset(window_start)
                    .len(window_len)
                    .map_mut(&self.file)?
            };
            Mapping::ReadWrite(mmap)
        } else {
            let mmap = unsafe {
                MmapOptions::new()
                    .offset(window_start)
                    .len(window_len)
                    .map(&self.file)?
            };
            Mapping::ReadOnly(mmap)
        };

        let registration = sigbus::register(mapping.as_slice().as_ptr(), window_len);

        *slot = Some(Window {
            range: window_start..window_end,
            mapping,
            registration,
            keep_always,
        });

        Ok(())
    }

    /// Map `[offset, offset+size)` for reading. `keep_always` pins the window so a later
    /// unrelated `map` call in the same context does not evict it (used for hash tables).
    pub fn map(&self, ctx: TypeContext, offset: u64, size: u64, keep_always: bool) -> Result<MappedWindow<'_>> {
        self.ensure_window(ctx, offset, size, keep_always)?;
        let guard = self.windows[ctx.index()].lock();
        Ok(MappedWindow {
            guard,
            start: (offset - guard.as_ref().unwrap().range.start) as usize,
            len: size as usize,
        })
    }

    /// Map `[offset, offset+size)` for writing. Fails with [`JournalError::Perm`] if the
    /// cache was opened read-only.
    pub fn map_mut(&self, ctx: TypeContext, offset: u64, size: u64, keep_always: bool) -> Result<MappedWindowMut<'_>> {
        if !self.writable {
            return Err(JournalError::Perm);
        }
        self.ensure_window(ctx, offset, size, keep_always)?;
        let guard = self.windows[ctx.index()].lock();
        Ok(MappedWindowMut {
            start: (offset - guard.as_ref().unwrap().range.start) as usize,
            len: size as usize,
            guard,
        })
    }

    /// Flush every pinned/cached window's dirty pages. Called as part of the offline
    /// state machine's `fsync` step.
    pub fn flush_all(&self) -> Result<()> {
        for slot in &self.windows {
            if let Some(window) = slot.lock().as_ref() {
                window.mapping.flush()?;
            }
        }
        self.file.sync_all()?;
        Ok(())
    }
}

pub struct MappedWindow<'a> {
    guard: MutexGuard<'a, Option<Window>>,
    start: usize,
    len: usize,
}

impl Deref for MappedWindow<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.guard.as_ref().unwrap().mapping.as_slice()[self.start..self.start + self.len]
    }
}

pub struct MappedWindowMut<'a> {
    guard: MutexGuard<'a, Option<Window>>,
    start: usize,
    len: usize,
}

impl Deref for MappedWindowMut<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.guard.as_ref().unwrap().mapping.as_slice()[self.start..self.start + self.len]
    }
}

impl DerefMut for MappedWindowMut<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        let start = self.start;
        let len = self.len;
        &mut self.guard.as_mut().unwrap().mapping.as_mut_slice().unwrap()[start..start + len]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_file(len: usize) -> File {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&vec![0u8; len]).unwrap();
        file
    }

    #[test]
    fn map_reads_written_bytes() {
        let mut file = temp_file(8192);
        use std::io::{Seek, SeekFrom};
        file.seek(SeekFrom::Start(100)).unwrap();
        file.write_all(b"hello").unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();

        let cache = WindowCache::new(file, false).unwrap();
        let window = cache.map(TypeContext::Data, 100, 5, false).unwrap();
        assert_eq!(&window[..], b"hello");
    }

    #[test]
    fn map_mut_rejected_on_readonly_cache() {
        let file = temp_file(4096);
        let cache = WindowCache::new(file, false).unwrap();
        assert!(matches!(
            cache.map_mut(TypeContext::Data, 0, 8, false),
            Err(JournalError::Perm)
        ));
    }

    #[test]
    fn map_mut_writes_are_visible_to_map() {
        let file = temp_file(8192);
        let cache = WindowCache::new(file, true).unwrap();
        {
            let mut window = cache.map_mut(TypeContext::Data, 200, 4, false).unwrap();
            window.copy_from_slice(b"data");
        }
        let window = cache.map(TypeContext::Data, 200, 4, false).unwrap();
        assert_eq!(&window[..], b"data");
    }

    #[test]
    fn out_of_range_is_rejected() {
        let file = temp_file(4096);
        let cache = WindowCache::new(file, false).unwrap();
        assert!(cache.map(TypeContext::Data, 4090, 100, false).is_err());
    }

    #[test]
    fn sigbus_on_one_context_is_sticky_for_the_whole_file() {
        let file = temp_file(8192);
        let cache = WindowCache::new(file, false).unwrap();

        cache.map(TypeContext::Data, 100, 5, false).unwrap();
        cache.map(TypeContext::Field, 200, 5, false).unwrap();
        assert!(!cache.got_sigbus());

        cache.windows[TypeContext::Data.index()]
            .lock()
            .as_ref()
            .unwrap()
            .registration
            .as_ref()
            .unwrap()
            .test_trigger();

        assert!(cache.got_sigbus(), "fault on one window should mark the whole file");
        assert!(
            cache.map(TypeContext::Field, 200, 5, false).is_err(),
            "a different, never-faulted context must also report io once the file is sticky"
        );
    }
}
