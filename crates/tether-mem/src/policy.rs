//! Thread-safety policy abstraction.
//!
//! This module provides the `CountPolicy` trait for abstracting over
//! thread-confined (plain integer) and shared (atomic integer) reference
//! counting. The policy is a compile-time choice: handles over different
//! policies are distinct types and cannot alias each other's control blocks.

use std::cell::Cell;
use std::sync::atomic::{fence, AtomicUsize, Ordering};

/// Trait abstracting over the counter representation of a control block.
///
/// This allows the same handle and control-block implementation to work for
/// both thread-confined and shared scenarios without code duplication.
pub trait CountPolicy: 'static {
    /// Counter type for reference counting (`Cell<usize>` or `AtomicUsize`).
    type Counter: Counter;

    /// Create a new counter initialized to the given value.
    fn new_counter(initial: usize) -> Self::Counter;
}

/// Trait for counter operations, abstracting `Cell` vs atomic.
///
/// `decrement` carries release/acquire semantics in the atomic
/// implementation so that whoever observes the final decrement also
/// observes every write made while the count was held.
pub trait Counter {
    fn get(&self) -> usize;
    fn set(&self, val: usize);
    /// Increment and return the new count. Aborts the process on overflow.
    fn increment(&self) -> usize;
    /// Increment and return the new count, waiting out the transient
    /// `held` sentinel another thread may have parked the counter at.
    /// Aborts the process on overflow.
    fn increment_spinning(&self, held: usize) -> usize;
    /// Decrement and return the new count.
    fn decrement(&self) -> usize;
    /// Increment only if the current count is nonzero.
    ///
    /// Returns whether the increment happened. This must be a single
    /// atomic step in the shared implementation: observing zero and then
    /// incrementing anyway would resurrect a destroyed object.
    fn increment_if_nonzero(&self) -> bool;
    /// Compare-and-swap on the raw count.
    fn compare_exchange(&self, current: usize, new: usize) -> Result<usize, usize>;
}

// Counts are bounded well below this before memory runs out; crossing it
// means the count itself is being leaked in a loop.
const COUNT_CEILING: usize = isize::MAX as usize;

// ============================================================================
// Local policy
// ============================================================================

/// Thread-confined policy using plain `Cell` counters.
///
/// Handles under this policy are `!Send` and `!Sync`; counter updates are
/// plain memory accesses.
#[derive(Debug, Clone, Copy, Default)]
pub struct Local;

impl CountPolicy for Local {
    type Counter = Cell<usize>;

    #[inline]
    fn new_counter(initial: usize) -> Self::Counter {
        Cell::new(initial)
    }
}

impl Counter for Cell<usize> {
    #[inline]
    fn get(&self) -> usize {
        Cell::get(self)
    }

    #[inline]
    fn set(&self, val: usize) {
        Cell::set(self, val);
    }

    #[inline]
    fn increment(&self) -> usize {
        let val = self.get();
        if val > COUNT_CEILING {
            std::process::abort();
        }
        self.set(val + 1);
        val + 1
    }

    #[inline]
    fn decrement(&self) -> usize {
        let val = self.get();
        debug_assert!(val > 0, "decrementing zero reference count");
        self.set(val - 1);
        val - 1
    }

    #[inline]
    fn increment_spinning(&self, held: usize) -> usize {
        // Single-threaded: the sentinel is always restored before control
        // returns to code that could increment.
        debug_assert_ne!(self.get(), held, "counter sentinel leaked");
        self.increment()
    }

    #[inline]
    fn increment_if_nonzero(&self) -> bool {
        let val = self.get();
        if val == 0 {
            return false;
        }
        self.set(val + 1);
        true
    }

    #[inline]
    fn compare_exchange(&self, current: usize, new: usize) -> Result<usize, usize> {
        let val = self.get();
        if val == current {
            self.set(new);
            Ok(val)
        } else {
            Err(val)
        }
    }
}

// ============================================================================
// Shared policy
// ============================================================================

/// Shared policy using atomic counters.
///
/// Distinct handles referencing the same control block may be copied and
/// destroyed from different threads without external synchronization.
#[derive(Debug, Clone, Copy, Default)]
pub struct Shared;

impl CountPolicy for Shared {
    type Counter = AtomicUsize;

    #[inline]
    fn new_counter(initial: usize) -> Self::Counter {
        AtomicUsize::new(initial)
    }
}

impl Counter for AtomicUsize {
    #[inline]
    fn get(&self) -> usize {
        self.load(Ordering::Acquire)
    }

    #[inline]
    fn set(&self, val: usize) {
        self.store(val, Ordering::Release);
    }

    #[inline]
    fn increment(&self) -> usize {
        let prev = self.fetch_add(1, Ordering::Relaxed);
        if prev > COUNT_CEILING {
            std::process::abort();
        }
        prev + 1
    }

    #[inline]
    fn decrement(&self) -> usize {
        let prev = self.fetch_sub(1, Ordering::Release);
        debug_assert!(prev > 0, "decrementing zero reference count");
        if prev == 1 {
            // The final decrement must observe every write made by other
            // owners before they released their counts.
            fence(Ordering::Acquire);
        }
        prev - 1
    }

    fn increment_spinning(&self, held: usize) -> usize {
        let mut n = self.load(Ordering::Relaxed);
        loop {
            if n == held {
                std::hint::spin_loop();
                n = self.load(Ordering::Relaxed);
                continue;
            }
            if n > COUNT_CEILING {
                std::process::abort();
            }
            match self.compare_exchange_weak(n, n + 1, Ordering::Acquire, Ordering::Relaxed) {
                Ok(_) => return n + 1,
                Err(actual) => n = actual,
            }
        }
    }

    fn increment_if_nonzero(&self) -> bool {
        let mut n = self.load(Ordering::Relaxed);
        loop {
            if n == 0 {
                return false;
            }
            if n > COUNT_CEILING {
                std::process::abort();
            }
            match self.compare_exchange_weak(n, n + 1, Ordering::Acquire, Ordering::Relaxed) {
                Ok(_) => return true,
                Err(actual) => n = actual,
            }
        }
    }

    #[inline]
    fn compare_exchange(&self, current: usize, new: usize) -> Result<usize, usize> {
        AtomicUsize::compare_exchange(self, current, new, Ordering::Acquire, Ordering::Relaxed)
    }
}
