//! Generation-counted history of time bounds
//!
//! A single writer publishes `(start, end)` pairs into a small circular log
//! and advances a shared pointer afterwards. Readers take a snapshot of the
//! current slot and validate it against the pointer, retrying a bounded
//! number of times. No lock is ever taken on either side.
//!
//! ## Protocol
//!
//! Writer, for each update:
//! 1. `next = pointer + 1`, slot = `next & MASK`
//! 2. write `start`, `end`, then `generation = next`
//! 3. advance `pointer` to `next` (release)
//!
//! Reader:
//! 1. load `pointer` (acquire), read the slot it names
//! 2. re-load `pointer`
//! 3. accept when the slot's generation and both pointer loads agree,
//!    otherwise retry (at most [`MAX_SNAPSHOT_ATTEMPTS`] times)
//!
//! A slot is only rewritten after the writer has lapped the whole log, so
//! a reader that sees the pointer unchanged across its read cannot have
//! observed a half-written pair.

use std::sync::atomic::{fence, AtomicI32, AtomicI64, Ordering};

/// Number of slots in the history (power of two)
pub const HISTORY_SIZE: usize = 32;

const HISTORY_MASK: i32 = HISTORY_SIZE as i32 - 1;

/// Snapshot attempts before a reader gives up
pub const MAX_SNAPSHOT_ATTEMPTS: usize = 8;

/// One history entry
#[derive(Default)]
struct Slot {
    start: AtomicI64,
    end: AtomicI64,
    generation: AtomicI32,
}

/// Lock-free single-writer history of `(start, end)` bounds
pub struct TimeBoundsHistory {
    slots: [Slot; HISTORY_SIZE],
    pointer: AtomicI32,
}

impl TimeBoundsHistory {
    /// Create a history with every slot at `(0, 0)` and generation 0
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| Slot::default()),
            pointer: AtomicI32::new(0),
        }
    }

    fn slot(&self, pointer: i32) -> &Slot {
        &self.slots[(pointer & HISTORY_MASK) as usize]
    }

    /// Publish new bounds. Must only be called from the writer side.
    pub fn publish(&self, start: i64, end: i64) {
        let next = self.pointer.load(Ordering::Relaxed).wrapping_add(1);
        let slot = self.slot(next);

        // Orders the previous pointer advance before the slot rewrite
        fence(Ordering::Release);
        slot.start.store(start, Ordering::Relaxed);
        slot.end.store(end, Ordering::Relaxed);
        slot.generation.store(next, Ordering::Release);

        self.pointer.store(next, Ordering::Release);
    }

    /// Bounds as last published. Writer side only: the writer is the sole
    /// mutator so no validation is needed.
    pub fn current(&self) -> (i64, i64) {
        let slot = self.slot(self.pointer.load(Ordering::Relaxed));
        (
            slot.start.load(Ordering::Relaxed),
            slot.end.load(Ordering::Relaxed),
        )
    }

    /// Validated snapshot of the current bounds
    ///
    /// Returns `None` after [`MAX_SNAPSHOT_ATTEMPTS`] inconsistent reads.
    pub fn snapshot(&self) -> Option<(i64, i64)> {
        for _ in 0..MAX_SNAPSHOT_ATTEMPTS {
            let pointer = self.pointer.load(Ordering::Acquire);
            let slot = self.slot(pointer);

            let generation = slot.generation.load(Ordering::Acquire);
            let start = slot.start.load(Ordering::Relaxed);
            let end = slot.end.load(Ordering::Relaxed);

            fence(Ordering::Acquire);
            let pointer_again = self.pointer.load(Ordering::Relaxed);

            if generation == pointer && pointer_again == pointer {
                return Some((start, end));
            }
            std::hint::spin_loop();
        }
        None
    }

    /// Number of updates published so far
    pub fn updates(&self) -> i32 {
        self.pointer.load(Ordering::Acquire)
    }
}

impl Default for TimeBoundsHistory {
    fn default() -> Self {
        Self::new()
    }
}
