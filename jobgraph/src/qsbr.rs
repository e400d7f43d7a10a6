//! Quiescent-state-based reclamation.
//!
//! Each OS thread that touches the job graph registers once and is handed a
//! tracker slot out of a fixed-size table (`MAX_THREADS`). A [`CriticalSection`]
//! is a stack-scoped guard: while it is alive the owning thread's tracker
//! iteration is odd ("not quiescent"); once it drops, the iteration goes back
//! to even. An [`Item`] records, as a bitmask over tracker slots, which threads
//! must be observed passing through a quiescent state before its payload can be
//! reclaimed -- this is what lets `detach_children` hand `JobNode`s back to the
//! allocator without a lock.
//!
//! Grounded on the `gdul::qsbr` scheme: a global table of per-thread iteration
//! counters plus an `inUse` flag, and a thread-local shadow of "last observed"
//! iterations used to clear mask bits lazily in [`update`].

use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicBool, AtomicI8, AtomicUsize, Ordering};

/// Maximum number of threads that may concurrently participate in reclamation.
pub const MAX_THREADS: usize = 64;

#[repr(align(64))]
struct Tracker {
    iteration: AtomicUsize,
    in_use: AtomicBool,
}

impl Tracker {
    const fn new() -> Self {
        Self {
            iteration: AtomicUsize::new(0),
            in_use: AtomicBool::new(false),
        }
    }
}

struct Globals {
    trackers: [Tracker; MAX_THREADS],
    last_tracker_index: AtomicI8,
}

static GLOBALS: Lazy<Globals> = Lazy::new(|| Globals {
    trackers: std::array::from_fn(|_| Tracker::new()),
    last_tracker_index: AtomicI8::new(0),
});

struct ThreadState {
    index: i8,
    viewed_iterations: [usize; MAX_THREADS],
}

impl ThreadState {
    const fn new() -> Self {
        Self {
            index: -1,
            viewed_iterations: [0; MAX_THREADS],
        }
    }
}

thread_local! {
    static THREAD_STATE: std::cell::RefCell<ThreadState> = std::cell::RefCell::new(ThreadState::new());
}

/// Register the calling thread as a reclamation participant.
///
/// Idempotent: calling it twice on an already-registered thread is a no-op.
///
/// # Panics
/// Panics (debug assertion) if more than [`MAX_THREADS`] threads are
/// registered concurrently -- this is a programming error, not a transient
/// condition.
pub fn register_thread() {
    THREAD_STATE.with(|state| {
        let mut state = state.borrow_mut();
        if state.index != -1 {
            return;
        }

        let mut found = None;
        for (i, tracker) in GLOBALS.trackers.iter().enumerate() {
            if !tracker.in_use.load(Ordering::Acquire)
                && !tracker.in_use.swap(true, Ordering::AcqRel)
            {
                found = Some(i as i8);
                break;
            }
        }

        let index = found.expect("qsbr: MaxThreads exceeded");
        state.index = index;

        let mut last = GLOBALS.last_tracker_index.load(Ordering::Acquire);
        while last < index {
            match GLOBALS.last_tracker_index.compare_exchange_weak(
                last,
                index,
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => last = observed,
            }
        }
    });
}

/// Unregister the calling thread, freeing its tracker slot.
///
/// # Panics
/// Panics (debug assertion) if called from inside an open [`CriticalSection`]
/// -- the tracker's iteration must be even (quiescent) at the point of
/// unregistration.
pub fn unregister_thread() {
    THREAD_STATE.with(|state| {
        let mut state = state.borrow_mut();
        let index = state.index;
        if index == -1 {
            return;
        }

        debug_assert!(
            GLOBALS.trackers[index as usize]
                .iteration
                .load(Ordering::Acquire)
                % 2
                == 0,
            "qsbr: cannot unregister a thread from within a critical section"
        );

        GLOBALS.trackers[index as usize]
            .in_use
            .store(false, Ordering::Release);
        state.index = -1;
    });
}

fn quiescent_state() {
    THREAD_STATE.with(|state| {
        let state = state.borrow();
        let index = state.index;
        debug_assert!(index != -1, "qsbr: thread not registered");
        GLOBALS.trackers[index as usize]
            .iteration
            .fetch_add(1, Ordering::AcqRel);
    });
}

/// A bitmask over tracker slots recording which registered threads must pass
/// through a quiescent state before the item's payload may be reclaimed.
pub struct Item {
    mask: AtomicUsize,
}

impl Default for Item {
    fn default() -> Self {
        Self::new()
    }
}

impl Item {
    pub fn new() -> Self {
        Self {
            mask: AtomicUsize::new(usize::MAX),
        }
    }
}

/// Publish `item` for reclamation tracking: set its mask to every currently
/// registered tracker except the calling thread. Returns `true` if the mask
/// came up empty (no other threads registered, safe to reclaim immediately).
pub fn initialize(item: &Item) -> bool {
    let mask = THREAD_STATE.with(|state| {
        let mut state = state.borrow_mut();
        let last = GLOBALS.last_tracker_index.load(Ordering::Acquire);
        let last_tracked_bit = last as u32 + 1;
        let mut initial = usize::MAX >> ((usize::BITS) - last_tracked_bit);
        initial &= !(1usize << state.index);

        let mut mask = 0usize;
        let mut probe = initial;
        let mut i = 0;
        // Mirrors create_new_mask in the original qsbr.cpp -- every live
        // tracker except the caller must be observed quiescent at least once
        // before the item is safe to reclaim, regardless of its parity right
        // now (a tracker mid-critical-section is exactly the one to wait on).
        while probe != 0 {
            if probe & 1 != 0 {
                let current = GLOBALS.trackers[i].iteration.load(Ordering::Acquire);
                state.viewed_iterations[i] = current;
                mask |= 1usize << i;
            }
            probe >>= 1;
            i += 1;
        }
        mask
    });

    item.mask.store(mask, Ordering::Release);
    mask == 0
}

/// Advance `item`'s mask: clear the bit for any tracker that has advanced its
/// iteration by at least one since [`initialize`]/the last [`update`] *and*
/// is currently even (quiescent) -- a tracker that is unchanged, or that has
/// advanced into an odd (non-quiescent) iteration, is still waited on.
/// Returns `true` once the mask is empty -- the item's referent is then
/// guaranteed unreferenced by every thread that was registered at
/// `initialize` time.
pub fn update(item: &Item) -> bool {
    let existing = item.mask.load(Ordering::Acquire);
    if existing == 0 {
        return true;
    }

    let new_mask = THREAD_STATE.with(|state| {
        let mut state = state.borrow_mut();
        let mut mask = 0usize;
        let mut probe = existing;
        let mut i = 0;
        while probe != 0 {
            if probe & 1 != 0 {
                let previous = state.viewed_iterations[i];
                let current = GLOBALS.trackers[i].iteration.load(Ordering::Acquire);
                let advanced = previous != current;
                let even = current % 2 == 0;
                state.viewed_iterations[i] = current;
                if !(advanced && even) {
                    mask |= 1usize << i;
                }
            }
            probe >>= 1;
            i += 1;
        }
        mask
    });

    item.mask.fetch_and(new_mask, Ordering::AcqRel);
    new_mask == 0
}

/// Read-only query: `true` if `item` still has trackers pending.
pub fn check(item: &Item) -> bool {
    item.mask.load(Ordering::Acquire) != 0
}

/// Scoped guard marking the calling thread as non-quiescent for its lifetime.
///
/// # Panics
/// Panics (debug assertion) if nested inside another open `CriticalSection` on
/// the same thread, or if the thread is not registered.
pub struct CriticalSection {
    _private: (),
}

impl CriticalSection {
    pub fn new() -> Self {
        THREAD_STATE.with(|state| {
            let state = state.borrow();
            let index = state.index;
            debug_assert!(index != -1, "qsbr: thread not registered");
            debug_assert!(
                GLOBALS.trackers[index as usize]
                    .iteration
                    .load(Ordering::Acquire)
                    % 2
                    == 0,
                "qsbr: cannot nest critical sections on the same thread"
            );
        });
        quiescent_state();
        Self { _private: () }
    }
}

impl Default for CriticalSection {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CriticalSection {
    fn drop(&mut self) {
        quiescent_state();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    #[test]
    fn grace_period_observed_after_quiescence() {
        register_thread();

        let item = Item::new();
        initialize(&item);

        let done = Arc::new(AtomicBool::new(false));
        let done2 = done.clone();
        let handle = std::thread::spawn(move || {
            register_thread();
            {
                let _cs = CriticalSection::new();
            }
            done2.store(true, Ordering::Release);
            unregister_thread();
        });

        handle.join().unwrap();
        assert!(done.load(Ordering::Acquire));

        // Eventually update() must report the grace period elapsed.
        let mut reclaimable = false;
        for _ in 0..100 {
            if update(&item) {
                reclaimable = true;
                break;
            }
        }
        assert!(reclaimable);

        unregister_thread();
    }

    #[test]
    fn held_critical_section_blocks_update() {
        register_thread();

        let item = Item::new();

        let (tx, rx) = std::sync::mpsc::channel::<()>();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<()>();
        let handle = std::thread::spawn(move || {
            register_thread();
            let _cs = CriticalSection::new();
            ready_tx.send(()).unwrap();
            rx.recv().ok();
            unregister_thread();
        });

        ready_rx.recv().unwrap();
        initialize(&item);
        assert!(!update(&item));

        tx.send(()).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn register_is_idempotent() {
        register_thread();
        register_thread();
        unregister_thread();
    }
}
