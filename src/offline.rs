//! Offline state machine (spec §4.6): coordinates bringing a writable file's header
//! between `online` and `offline`/`archived` across the caller thread and a dedicated
//! "journal-offline" worker thread, using nothing but compare-and-swap on one atomic and
//! an explicit join — no locks shared between the two actors.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;

use crate::error::Result;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RawState {
    Offline = 0,
    Syncing = 1,
    Offlining = 2,
    AgainFromSyncing = 3,
    AgainFromOfflining = 4,
    Cancel = 5,
    Done = 6,
    Joined = 7,
}

impl RawState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => RawState::Offline,
            1 => RawState::Syncing,
            2 => RawState::Offlining,
            3 => RawState::AgainFromSyncing,
            4 => RawState::AgainFromOfflining,
            5 => RawState::Cancel,
            6 => RawState::Done,
            _ => RawState::Joined,
        }
    }
}

/// What the worker (or an inline run on the caller's thread) actually does at each step.
/// Implemented by whatever owns the open file's header and mmap windows.
pub trait OfflineActions: Send {
    /// `fsync` the file. Called from the `syncing` state.
    fn sync(&mut self) -> Result<()>;

    /// Set the header's on-disk `state` to `offline` (or `archived`, if this file has been
    /// rotated away) and `fsync` again. Called from the `offlining` state.
    fn mark_offline_and_sync(&mut self) -> Result<()>;
}

/// Blocks every signal except `SIGBUS` for the duration of `f`, restoring the previous
/// mask afterward. The offline worker must be able to take SIGBUS (it touches mmap'd
/// pages via `fsync`-adjacent bookkeeping); nothing else in the process should see a
/// signal misattributed to it.
fn with_blocked_signals_except_sigbus<R>(f: impl FnOnce() -> R) -> R {
    unsafe {
        let mut new_mask: libc::sigset_t = std::mem::zeroed();
        libc::sigfillset(&mut new_mask);
        libc::sigdelset(&mut new_mask, libc::SIGBUS);
        let mut old_mask: libc::sigset_t = std::mem::zeroed();
        libc::pthread_sigmask(libc::SIG_SETMASK, &new_mask, &mut old_mask);
        let result = f();
        libc::pthread_sigmask(libc::SIG_SETMASK, &old_mask, std::ptr::null_mut());
        result
    }
}

/// Runs one state-machine step. Returns whether the loop should keep going, plus any
/// `fsync`/`mark_offline_and_sync` failure observed at this step — the state machine
/// always advances on such a failure (there is no retry within one `set_offline` call),
/// but the caller decides whether the error is worth propagating or just logging.
fn worker_step(state: &AtomicU8, actions: &mut dyn OfflineActions) -> (bool, Option<crate::error::JournalError>) {
    let current = RawState::from_u8(state.load(Ordering::Acquire));
    match current {
        RawState::Syncing => {
            let err = actions.sync().err();
            let _ = state.compare_exchange(
                RawState::Syncing as u8,
                RawState::Offlining as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            (true, err)
        }
        RawState::Offlining => {
            let err = actions.mark_offline_and_sync().err();
            let _ = state.compare_exchange(
                RawState::Offlining as u8,
                RawState::Done as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            (true, err)
        }
        RawState::AgainFromSyncing | RawState::AgainFromOfflining => {
            let _ = state.compare_exchange(
                current as u8,
                RawState::Syncing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            (true, None)
        }
        RawState::Cancel => {
            let _ = state.compare_exchange(
                RawState::Cancel as u8,
                RawState::Done as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            (false, None)
        }
        RawState::Done | RawState::Joined | RawState::Offline => (false, None),
    }
}

/// Detached-worker variant: runs to completion, logging (not propagating) any fsync
/// failure, since by the time the thread runs there is no caller left to hand it to.
fn worker_loop_detached(state: &AtomicU8, actions: &mut dyn OfflineActions) {
    loop {
        let (keep_going, err) = worker_step(state, actions);
        if let Some(err) = err {
            tracing::warn!(%err, "offline worker step failed");
        }
        if !keep_going {
            break;
        }
    }
}

/// Inline variant for the `wait=true` path: runs the state machine to completion on the
/// caller's own thread and returns the first failure observed, instead of swallowing it,
/// so `set_offline(true, ..)` (and therefore `Journal::close`) surfaces an `io` error
/// rather than reporting success after a failed `fsync`.
fn worker_loop_inline(state: &AtomicU8, actions: &mut dyn OfflineActions) -> Result<()> {
    let mut first_err = None;
    loop {
        let (keep_going, err) = worker_step(state, actions);
        first_err = first_err.or(err);
        if !keep_going {
            break;
        }
    }
    match first_err {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// One file's offline/online coordination state. Does not itself hold the header or
/// window cache; callers supply access to those through an [`OfflineActions`]
/// implementation at each `set_offline` call.
pub struct OfflineMachine {
    state: Arc<AtomicU8>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl Default for OfflineMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl OfflineMachine {
    pub fn new() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(RawState::Offline as u8)),
            join: Mutex::new(None),
        }
    }

    /// Join a lingering worker thread, if any, and settle the internal state back to
    /// `offline` once it has finished (or was never running).
    fn join_worker(&self) {
        if let Some(handle) = self.join.lock().take() {
            let _ = handle.join();
        }
        if RawState::from_u8(self.state.load(Ordering::Acquire)) == RawState::Done {
            self.state.store(RawState::Joined as u8, Ordering::Release);
        }
        self.state.store(RawState::Offline as u8, Ordering::Release);
    }

    /// Bring the file offline (or archived, per what `actions` does in `offlining`).
    /// If `wait`, blocks until the transition has fully committed; otherwise spawns the
    /// dedicated worker thread and returns immediately.
    pub fn set_offline<A: OfflineActions + 'static>(&self, wait: bool, mut actions: A) -> Result<()> {
        let current = RawState::from_u8(self.state.load(Ordering::Acquire));

        if current == RawState::Offline {
            self.join_worker();
            return Ok(());
        }

        if current == RawState::Syncing
            && self
                .state
                .compare_exchange(
                    RawState::Syncing as u8,
                    RawState::AgainFromSyncing as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
        {
            if wait {
                self.join_worker();
            }
            return Ok(());
        }

        if current == RawState::Offlining
            && self
                .state
                .compare_exchange(
                    RawState::Offlining as u8,
                    RawState::AgainFromOfflining as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
        {
            if wait {
                self.join_worker();
            }
            return Ok(());
        }

        self.state.store(RawState::Syncing as u8, Ordering::Release);

        if wait {
            let result = worker_loop_inline(&self.state, &mut actions);
            self.state.store(RawState::Offline as u8, Ordering::Release);
            result
        } else {
            let state = Arc::clone(&self.state);
            let handle = with_blocked_signals_except_sigbus(|| {
                std::thread::Builder::new()
                    .name("journal-offline".into())
                    .spawn(move || worker_loop_detached(&state, &mut actions))
            });
            *self.join.lock() = Some(handle.map_err(crate::error::JournalError::Io)?);
            Ok(())
        }
    }

    /// Cancel any pending `syncing`/`again-*` transition, join the worker, and — if the
    /// header currently says `offline` — mark it `online` and `fsync`. Refuses (the
    /// caller must check separately) to online an already-`archived` file; that check
    /// belongs to whatever owns the header, since this machine doesn't interpret header
    /// contents.
    pub fn set_online(&self, mut mark_online_and_sync: impl FnMut() -> Result<()>) -> Result<()> {
        loop {
            let current = RawState::from_u8(self.state.load(Ordering::Acquire));
            match current {
                RawState::Syncing => {
                    if self
                        .state
                        .compare_exchange(
                            RawState::Syncing as u8,
                            RawState::Cancel as u8,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        break;
                    }
                }
                RawState::AgainFromSyncing | RawState::AgainFromOfflining => {
                    if self
                        .state
                        .compare_exchange(
                            current as u8,
                            RawState::Cancel as u8,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        break;
                    }
                }
                _ => break,
            }
        }

        self.join_worker();
        mark_online_and_sync()
    }

    #[cfg(test)]
    fn raw_state(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingActions {
        syncs: Arc<AtomicUsize>,
        offlines: Arc<AtomicUsize>,
    }

    impl OfflineActions for CountingActions {
        fn sync(&mut self) -> Result<()> {
            self.syncs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn mark_offline_and_sync(&mut self) -> Result<()> {
            self.offlines.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn inline_set_offline_runs_both_steps_and_settles() {
        let machine = OfflineMachine::new();
        let syncs = Arc::new(AtomicUsize::new(0));
        let offlines = Arc::new(AtomicUsize::new(0));
        machine
            .set_offline(
                true,
                CountingActions {
                    syncs: syncs.clone(),
                    offlines: offlines.clone(),
                },
            )
            .unwrap();

        assert_eq!(syncs.load(Ordering::SeqCst), 1);
        assert_eq!(offlines.load(Ordering::SeqCst), 1);
        assert_eq!(machine.raw_state(), RawState::Offline as u8);
    }

    struct FailingSyncActions;

    impl OfflineActions for FailingSyncActions {
        fn sync(&mut self) -> Result<()> {
            Err(crate::error::JournalError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "fsync failed",
            )))
        }

        fn mark_offline_and_sync(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn inline_set_offline_propagates_a_failed_fsync() {
        let machine = OfflineMachine::new();
        let err = machine.set_offline(true, FailingSyncActions).unwrap_err();
        assert!(matches!(err, crate::error::JournalError::Io(_)));
        // The state machine still settles even though the sync step failed.
        assert_eq!(machine.raw_state(), RawState::Offline as u8);
    }

    #[test]
    fn spawned_worker_completes_and_joins() {
        let machine = OfflineMachine::new();
        let syncs = Arc::new(AtomicUsize::new(0));
        let offlines = Arc::new(AtomicUsize::new(0));
        machine
            .set_offline(
                false,
                CountingActions {
                    syncs: syncs.clone(),
                    offlines: offlines.clone(),
                },
            )
            .unwrap();

        // join_worker is also exercised directly by a second set_offline call.
        machine
            .set_offline(
                true,
                CountingActions {
                    syncs: syncs.clone(),
                    offlines: offlines.clone(),
                },
            )
            .unwrap();

        assert!(syncs.load(Ordering::SeqCst) >= 1);
        assert!(offlines.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn set_online_cancels_and_settles_offline_internally() {
        let machine = OfflineMachine::new();
        let called = Arc::new(AtomicUsize::new(0));
        let called2 = called.clone();
        machine
            .set_online(move || {
                called2.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        assert_eq!(called.load(Ordering::SeqCst), 1);
        assert_eq!(machine.raw_state(), RawState::Offline as u8);
    }
}
