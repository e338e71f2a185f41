//! Journal filename scheme (spec §4.9): live, archived and disposed forms of a journal's
//! name, all derived from one `prefix`.
//!
//! ```plain
//! live:     prefix.journal
//! archived: prefix@<seqnum_id-hex>-<head_seqnum-hex>-<head_realtime-hex>.journal
//! disposed: prefix@<now-hex>-<rand-hex>.journal~
//! ```
//!
//! All hex fields are lowercase, fixed-width, zero-padded big-endian (numeric) encodings
//! of the underlying integer, matching the 128-bit `seqnum_id` and 64-bit seqnum/timestamp
//! widths — the same `%016"PRIx64"`-after-`le64toh` convention systemd uses, not a raw
//! little-endian byte dump.

use std::path::{Path, PathBuf};

use rand::RngCore;

pub fn live_filename(prefix: &str) -> PathBuf {
    PathBuf::from(format!("{prefix}.journal"))
}

pub fn archived_filename(prefix: &str, seqnum_id: u128, head_seqnum: u64, head_realtime: u64) -> PathBuf {
    PathBuf::from(format!("{prefix}@{:032x}-{:016x}-{:016x}.journal", seqnum_id, head_seqnum, head_realtime))
}

/// `now` and the random suffix are both caller-supplied so this stays pure; callers use
/// the wall clock and an RNG at the call site.
pub fn disposed_filename(prefix: &str, now: u64, random: u64) -> PathBuf {
    PathBuf::from(format!("{prefix}@{:016x}-{:016x}.journal~", now, random))
}

/// Convenience wrapper over [`disposed_filename`] that draws the random suffix from the
/// thread-local RNG.
pub fn disposed_filename_now(prefix: &str, now: u64) -> PathBuf {
    disposed_filename(prefix, now, rand::thread_rng().next_u64())
}

/// Parsed archived-filename fields, or `None` if `path`'s last component does not match
/// the archived scheme.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivedName {
    pub prefix: String,
    pub seqnum_id: u128,
    pub head_seqnum: u64,
    pub head_realtime: u64,
}

pub fn parse_archived_filename(path: &Path) -> Option<ArchivedName> {
    let filename = path.file_name()?.to_str()?;
    let filename = filename.strip_suffix(".journal")?;
    let (prefix, rest) = filename.split_once('@')?;
    let (seqnum_id, rest) = rest.split_once('-')?;
    let (head_seqnum, head_realtime) = rest.split_once('-')?;

    Some(ArchivedName {
        prefix: prefix.to_string(),
        seqnum_id: u128::from_str_radix(seqnum_id, 16).ok()?,
        head_seqnum: u64::from_str_radix(head_seqnum, 16).ok()?,
        head_realtime: u64::from_str_radix(head_realtime, 16).ok()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archived_round_trips() {
        let name = archived_filename("system", 0x1122_3344_5566_7788_99aa_bbcc_ddee_ff00, 1, 1_000_000);
        let parsed = parse_archived_filename(&name).unwrap();
        assert_eq!(parsed.prefix, "system");
        assert_eq!(parsed.seqnum_id, 0x1122_3344_5566_7788_99aa_bbcc_ddee_ff00);
        assert_eq!(parsed.head_seqnum, 1);
        assert_eq!(parsed.head_realtime, 1_000_000);
    }

    #[test]
    fn archived_filename_matches_the_zero_padded_numeric_convention() {
        // Spec scenario B: seqnum 1, realtime 0x00000000000f4240 (1_000_000).
        let name = archived_filename("test", 1, 1, 1_000_000);
        assert_eq!(
            name,
            PathBuf::from("test@00000000000000000000000000000001-0000000000000001-00000000000f4240.journal")
        );
    }

    #[test]
    fn live_filename_has_no_at_sign() {
        assert_eq!(live_filename("system"), PathBuf::from("system.journal"));
        assert!(parse_archived_filename(&live_filename("system")).is_none());
    }

    #[test]
    fn disposed_filename_is_quarantined() {
        let name = disposed_filename("system", 42, 7);
        assert!(name.to_str().unwrap().ends_with(".journal~"));
    }
}
