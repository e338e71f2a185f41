//! Object heap & allocator (spec §4.2) and the default metrics policy (spec §4.8).
//!
//! The heap is an append-only bump allocator: every object is written once, past the
//! current tail, and never moved or freed. Growth is staged through `posix_fallocate` so a
//! crash mid-write never leaves a sparse hole a later mmap could fault on.

use std::fs::File;
use std::num::NonZeroU64;
use std::os::unix::io::AsRawFd;

use crate::error::{JournalError, Result};
use crate::header::Header;
use crate::layout::{align8, page_align};
use crate::mmap::{TypeContext, WindowCache};
use crate::objects::{DataCompression, ObjectHeader, ObjectType, OBJECT_HEADER_SIZE};

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;
const GROWTH_CHUNK: u64 = 8 * MIB;

fn clamp(value: u64, min: u64, max: u64) -> u64 {
    value.clamp(min, max)
}

/// Per-file size and free-space policy, normally derived once at creation time from
/// `statvfs` and carried in memory for the life of the writable file object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metrics {
    pub max_use: u64,
    pub min_use: u64,
    pub max_size: u64,
    pub min_size: u64,
    pub keep_free: u64,
    pub n_max_files: u64,
}

impl Metrics {
    /// Derive a policy from a filesystem's total capacity, as `statvfs` reports it.
    pub fn from_fs_size(fs_size: Option<u64>) -> Self {
        let fs_size = fs_size.unwrap_or(0);

        let mut max_use = clamp(fs_size / 10, MIB, 4 * GIB);
        let mut min_use = clamp(fs_size / 50, MIB, 16 * MIB);
        if min_use > max_use {
            min_use = max_use;
        }

        let max_size = clamp(page_align(max_use / 8).min(128 * MIB), 4 * MIB, u64::MAX);
        let min_size = 512 * KIB;
        let keep_free = if fs_size == 0 {
            MIB
        } else {
            (fs_size / 20).min(4 * GIB)
        };

        Metrics {
            max_use,
            min_use,
            max_size,
            min_size,
            keep_free,
            n_max_files: 100,
        }
    }

    /// Query `statvfs` on the filesystem backing `file` and derive a policy from it.
    pub fn for_file(file: &File) -> Result<Self> {
        let total = statvfs_total_bytes(file)?;
        Ok(Self::from_fs_size(Some(total)))
    }
}

fn statvfs_raw(file: &File) -> Result<libc::statvfs> {
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::fstatvfs(file.as_raw_fd(), &mut stat) };
    if ret != 0 {
        return Err(JournalError::Io(std::io::Error::last_os_error()));
    }
    Ok(stat)
}

pub fn statvfs_total_bytes(file: &File) -> Result<u64> {
    let stat = statvfs_raw(file)?;
    Ok(stat.f_blocks as u64 * stat.f_frsize as u64)
}

pub fn statvfs_free_bytes(file: &File) -> Result<u64> {
    let stat = statvfs_raw(file)?;
    Ok(stat.f_bavail as u64 * stat.f_frsize as u64)
}

fn posix_fallocate(file: &File, offset: u64, len: u64) -> Result<()> {
    if len == 0 {
        return Ok(());
    }
    let ret = unsafe {
        libc::posix_fallocate(
            file.as_raw_fd(),
            offset as libc::off_t,
            len as libc::off_t,
        )
    };
    if ret != 0 {
        return Err(JournalError::Io(std::io::Error::from_raw_os_error(ret)));
    }
    Ok(())
}

fn round_up_growth_chunk(size: u64) -> u64 {
    ((size + GROWTH_CHUNK - 1) / GROWTH_CHUNK) * GROWTH_CHUNK
}

/// Append-only allocator bound to one open, writable journal file.
pub struct Heap<'a> {
    file: &'a File,
    window: &'a WindowCache,
    metrics: &'a Metrics,
}

impl<'a> Heap<'a> {
    pub fn new(file: &'a File, window: &'a WindowCache, metrics: &'a Metrics) -> Self {
        Self {
            file,
            window,
            metrics,
        }
    }

    pub fn window(&self) -> &'a WindowCache {
        self.window
    }

    /// Allocate a new object of `object_type` with `payload_size` bytes of payload,
    /// writing a zeroed object header at the new offset and updating `header`'s tail
    /// pointer and object count. Returns the offset of the new object (the object header,
    /// not the payload).
    pub fn allocate(
        &self,
        header: &mut Header,
        object_type: ObjectType,
        payload_size: u64,
    ) -> Result<u64> {
        self.allocate_with_compression(header, object_type, payload_size, DataCompression::None)
    }

    /// Same as [`Heap::allocate`], but stamps the object header's compression bits (only
    /// meaningful for `Data` objects; every other type is always `None`).
    pub fn allocate_with_compression(
        &self,
        header: &mut Header,
        object_type: ObjectType,
        payload_size: u64,
        compression: DataCompression,
    ) -> Result<u64> {
        let size = align8(OBJECT_HEADER_SIZE + payload_size);

        // `n_objects` is biased by one: a freshly created file starts at 1 (no real
        // objects allocated yet) since the on-disk field is a `NonZeroU64` and can't
        // represent a true zero count.
        let p = if header.n_objects.get() == 1 {
            header.header_size.get()
        } else {
            let tail = header.tail_object_offset.get();
            let tail_bytes = self
                .window
                .map(TypeContext::Entry, tail, OBJECT_HEADER_SIZE, false)?;
            let tail_header = ObjectHeader::from_bytes(&tail_bytes)?;
            tail + align8(tail_header.size)
        };

        let old_file_size = self.file.metadata()?.len();
        let new_size = page_align(p + size).max(old_file_size);

        if new_size > self.metrics.max_size {
            return Err(JournalError::TooBig(format!(
                "allocation would grow file to {new_size}, exceeding max_size {}",
                self.metrics.max_size
            )));
        }

        let free = statvfs_free_bytes(self.file)?;
        let growth = new_size.saturating_sub(old_file_size);
        if growth > free.saturating_sub(self.metrics.keep_free.min(free)) {
            return Err(JournalError::TooBig(format!(
                "growing by {growth} bytes would eat into keep_free ({} bytes free)",
                self.metrics.keep_free
            )));
        }

        let rounded = round_up_growth_chunk(new_size).min(self.metrics.max_size);
        if rounded > old_file_size {
            posix_fallocate(self.file, old_file_size, rounded - old_file_size)?;
        }

        header.arena_size = NonZeroU64::new((p + size).saturating_sub(header.header_size.get()))
            .unwrap_or(header.arena_size);

        let object_header = ObjectHeader {
            r#type: object_type,
            compression,
            size,
        };
        {
            let mut window = self
                .window
                .map_mut(TypeContext::for_object(object_type), p, size, false)?;
            window.fill(0);
            let bytes = <ObjectHeader as crate::objects::Payload>::serialize(&object_header)?;
            window[..bytes.len()].copy_from_slice(&bytes);
        }

        header.tail_object_offset = NonZeroU64::new(p).unwrap_or(header.tail_object_offset);
        header.n_objects = NonZeroU64::new(header.n_objects.get() + 1).unwrap_or(header.n_objects);

        match object_type {
            ObjectType::Data => {
                if let Some(n) = header.n_data.as_mut() {
                    *n += 1;
                }
            }
            ObjectType::Field => {
                if let Some(n) = header.n_fields.as_mut() {
                    *n += 1;
                }
            }
            ObjectType::Tag => {
                if let Some(n) = header.n_tags.as_mut() {
                    *n += 1;
                }
            }
            ObjectType::EntryArray => {
                if let Some(n) = header.n_entry_arrays.as_mut() {
                    *n += 1;
                }
            }
            _ => {}
        }

        Ok(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_clamp_to_bounds() {
        let m = Metrics::from_fs_size(Some(0));
        assert_eq!(m.max_use, MIB);
        assert_eq!(m.min_use, MIB);
        assert_eq!(m.keep_free, MIB);
        assert_eq!(m.max_size, 4 * MIB);
        assert_eq!(m.n_max_files, 100);
    }

    #[test]
    fn metrics_scale_with_large_filesystems() {
        let m = Metrics::from_fs_size(Some(1000 * GIB));
        assert_eq!(m.max_use, 4 * GIB);
        assert_eq!(m.min_use, 16 * MIB);
        assert_eq!(m.max_size, 128 * MIB);
        assert_eq!(m.keep_free, 4 * GIB);
    }

    #[test]
    fn round_up_growth_chunk_rounds_to_8mib() {
        assert_eq!(round_up_growth_chunk(1), GROWTH_CHUNK);
        assert_eq!(round_up_growth_chunk(GROWTH_CHUNK), GROWTH_CHUNK);
        assert_eq!(round_up_growth_chunk(GROWTH_CHUNK + 1), 2 * GROWTH_CHUNK);
    }
}
