//! Process-wide SIGBUS fault registry (spec §4.1).
//!
//! Accessing a memory-mapped page can raise SIGBUS if the backing file was truncated or
//! its filesystem went away mid-access. The only way to survive that is to install a
//! signal handler that records the fault and keep the actual recovery (returning an I/O
//! error instead of crashing) in normal code that checks a flag afterwards.
//!
//! The handler itself must be async-signal-safe: no allocation, no locking. Windows
//! register their address range in a fixed-size, lock-free slot table; the handler does a
//! linear scan with only atomic loads and sets one atomic flag on a match. If nothing
//! matches (a fault outside every registered window), the process is in a state nothing
//! here can recover from, so the handler restores the default disposition and re-raises.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Once;

const MAX_SLOTS: usize = 256;

struct Slot {
    start: AtomicUsize,
    end: AtomicUsize,
    hit: AtomicBool,
}

impl Slot {
    const fn empty() -> Self {
        Slot {
            start: AtomicUsize::new(0),
            end: AtomicUsize::new(0),
            hit: AtomicBool::new(false),
        }
    }
}

static SLOTS: [Slot; MAX_SLOTS] = {
    const EMPTY: Slot = Slot::empty();
    [EMPTY; MAX_SLOTS]
};

static HANDLER_INSTALLED: Once = Once::new();

/// A registered address range. Dropping it frees the slot; it carries no data of its own,
/// [`Registration::triggered`] always re-reads the shared slot.
pub struct Registration {
    index: usize,
}

impl Registration {
    /// Whether a SIGBUS was ever recorded against this range. Sticky: once true, stays
    /// true for the life of the registration, so any operation that later observes it
    /// can surface an I/O error instead of touching the faulting pages again.
    pub fn triggered(&self) -> bool {
        SLOTS[self.index].hit.load(Ordering::Acquire)
    }

    /// Test-only hook to simulate a fault without actually truncating a mapped file out
    /// from under the process (real SIGBUS delivery isn't something a unit test can safely
    /// provoke).
    #[cfg(test)]
    pub(crate) fn test_trigger(&self) {
        SLOTS[self.index].hit.store(true, Ordering::Release);
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        let slot = &SLOTS[self.index];
        slot.start.store(0, Ordering::Release);
        slot.end.store(0, Ordering::Release);
        slot.hit.store(false, Ordering::Release);
    }
}

/// Install the process-wide SIGBUS handler, if not already installed. Idempotent and
/// cheap to call on every window registration.
pub fn ensure_installed() {
    HANDLER_INSTALLED.call_once(|| unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handle_sigbus as usize;
        action.sa_flags = libc::SA_SIGINFO;
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaction(libc::SIGBUS, &action, std::ptr::null_mut());
    });
}

/// Register `[addr, addr+len)` as a live mapping. Returns `None` if every slot is taken
/// (256 concurrently mapped windows is far beyond what one process needs; exhaustion
/// means something upstream is leaking registrations).
pub fn register(addr: *const u8, len: usize) -> Option<Registration> {
    ensure_installed();
    let start = addr as usize;
    let end = start.saturating_add(len);

    for (index, slot) in SLOTS.iter().enumerate() {
        if slot
            .start
            .compare_exchange(0, start, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            slot.end.store(end, Ordering::Release);
            slot.hit.store(false, Ordering::Release);
            return Some(Registration { index });
        }
    }

    None
}

extern "C" fn handle_sigbus(
    signum: libc::c_int,
    info: *mut libc::siginfo_t,
    ctx: *mut libc::c_void,
) {
    let addr = unsafe { (*info).si_addr() } as usize;

    for slot in SLOTS.iter() {
        let start = slot.start.load(Ordering::Acquire);
        if start == 0 {
            continue;
        }
        let end = slot.end.load(Ordering::Acquire);
        if addr >= start && addr < end {
            slot.hit.store(true, Ordering::Release);
            return;
        }
    }

    // Nothing claims this address: restore the default handler and re-raise so the
    // process dies the way it would have without us installed.
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = libc::SIG_DFL;
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaction(libc::SIGBUS, &action, std::ptr::null_mut());
        libc::raise(signum);
    }
    let _ = ctx;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_drop_frees_the_slot() {
        let buf = [0u8; 16];
        let reg = register(buf.as_ptr(), buf.len()).expect("slot available");
        assert!(!reg.triggered());
        drop(reg);
    }

    #[test]
    fn many_registrations_do_not_collide() {
        let buf = [0u8; 16];
        let regs: Vec<_> = (0..8)
            .map(|_| register(buf.as_ptr(), buf.len()).unwrap())
            .collect();
        assert_eq!(regs.len(), 8);
    }
}
