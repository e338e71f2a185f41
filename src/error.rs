//! Error kinds recognized by the storage engine (spec §7).

use std::io;

/// Every error the engine can surface to a caller.
///
/// Corruption discovered while *reading* is tolerated where possible (bisection narrows
/// the window, `next_entry` skips the bad slot) and these variants are never fatal to the
/// file object in that path. Corruption discovered while *writing* the header or right
/// after an allocation is fatal to the open file object.
#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    /// An on-disk invariant was violated: unknown object type, misaligned offset,
    /// truncated object, bogus timestamp, or a cyclic chain.
    #[error("bad message: {0}")]
    BadMessage(String),

    /// The header is internally consistent but the file is truncated past a section it
    /// claims to have.
    #[error("no data: {0}")]
    NoData(String),

    /// An incompatible flag, or a compression codec id, is not understood.
    #[error("protocol not supported: {0}")]
    ProtocolNotSupported(String),

    /// `machine_id` in the header does not match the local machine.
    #[error("host down: machine_id mismatch")]
    HostDown,

    /// The file is already archived; it cannot be written to or brought online.
    #[error("shutdown: file is archived")]
    Shutdown,

    /// The header's `state` was `online` at open time (unclean shutdown).
    #[error("busy: file was not cleanly closed")]
    Busy,

    /// `tail_entry_realtime` is in the future relative to the wall clock.
    #[error("txtbsy: tail entry is from the future")]
    TxtBsy,

    /// The file was removed from under us (`nlink == 0`).
    #[error("idrm: file was deleted")]
    IdRm,

    /// A SIGBUS was observed for this file's mapping, or an I/O syscall failed.
    #[error("io: {0}")]
    Io(#[from] io::Error),

    /// The file would exceed `max_size`, or grow into `keep_free`.
    #[error("too big: {0}")]
    TooBig(String),

    /// A mutating operation was attempted on a read-only file.
    #[error("perm: file is not writable")]
    Perm,

    /// Normal "no such record" outcome; not an error to callers that expect optionality.
    #[error("not found")]
    NotFound,
}

impl JournalError {
    /// Whether this error is one of `open_reliably`'s recovery triggers: on any of these,
    /// the file is disposed (renamed away) and a fresh open is retried exactly once.
    pub fn is_recoverable_by_dispose(&self) -> bool {
        matches!(
            self,
            JournalError::BadMessage(_)
                | JournalError::NoData(_)
                | JournalError::ProtocolNotSupported(_)
                | JournalError::HostDown
                | JournalError::Shutdown
                | JournalError::Busy
                | JournalError::TxtBsy
                | JournalError::IdRm
                | JournalError::Io(_)
        )
    }
}

impl From<JournalError> for io::Error {
    fn from(err: JournalError) -> Self {
        match err {
            JournalError::Io(err) => err,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}

pub type Result<T> = std::result::Result<T, JournalError>;
