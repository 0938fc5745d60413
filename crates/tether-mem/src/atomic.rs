//! Atomic slots for word-sized handle payloads.
//!
//! A single handle variable mutated from several threads needs more than
//! `Clone`/`Drop` (those are only safe on *distinct* handles). An
//! [`AtomicStrong`] is one machine word holding the control-block pointer
//! of a canonical handle; the low pointer bit is a spin tag that serializes
//! the counter update with the slot access, so a `load` hands back a handle
//! whose strong count was incremented before the slot was let go.
//!
//! Aliased and slice payloads do not fit the word; they go through
//! [`AtomicWide`](crate::AtomicWide), which trades lock-freedom for a
//! per-address mutex while keeping the same observable contract.

use std::marker::PhantomData;
use std::mem;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::control::ControlBlock;
use crate::policy::Shared;
use crate::strong::Strong;

// The tag needs the low pointer bit.
const _: () = assert!(mem::align_of::<ControlBlock<Shared>>() >= 2);

const TAG: usize = 1;

/// Fold a caller ordering into the tag-acquire side of the protocol.
fn acquire_side(order: Ordering) -> Ordering {
    match order {
        Ordering::SeqCst => Ordering::SeqCst,
        _ => Ordering::Acquire,
    }
}

/// Fold a caller ordering into the tag-release side of the protocol.
fn release_side(order: Ordering) -> Ordering {
    match order {
        Ordering::SeqCst => Ordering::SeqCst,
        _ => Ordering::Release,
    }
}

/// A lock-free atomic slot for an optional strong handle.
///
/// Only canonical handles — element pointer equal to the owned object —
/// round-trip through the single word; storing an aliased handle is a
/// contract violation and fails an assertion.
///
/// # Example
///
/// ```
/// use std::sync::atomic::Ordering;
/// use tether_mem::{AtomicStrong, Strong};
///
/// let slot: AtomicStrong<i32> = AtomicStrong::new(Some(Strong::new(1)));
/// let seen = slot.load(Ordering::SeqCst).unwrap();
/// assert_eq!(*seen, 1);
///
/// let prev = slot.exchange(None, Ordering::SeqCst);
/// assert_eq!(*prev.unwrap(), 1);
/// assert!(slot.load(Ordering::SeqCst).is_none());
/// ```
pub struct AtomicStrong<T> {
    slot: AtomicUsize,
    _marker: PhantomData<Option<Strong<T, Shared>>>,
}

unsafe impl<T: Send + Sync> Send for AtomicStrong<T> {}
unsafe impl<T: Send + Sync> Sync for AtomicStrong<T> {}

impl<T> AtomicStrong<T> {
    /// Create a slot holding `value`.
    pub fn new(value: Option<Strong<T, Shared>>) -> Self {
        Self {
            slot: AtomicUsize::new(Self::encode(value)),
            _marker: PhantomData,
        }
    }

    /// Create an empty slot.
    pub fn empty() -> Self {
        Self::new(None)
    }

    fn encode(value: Option<Strong<T, Shared>>) -> usize {
        match value {
            Some(handle) => {
                assert!(
                    handle.is_canonical(),
                    "aliased handle in a word-sized atomic slot; use AtomicWide"
                );
                let word = handle.block_ptr().as_ptr() as usize;
                mem::forget(handle);
                word
            }
            None => 0,
        }
    }

    /// Take over the slot's ownership of `word`.
    unsafe fn decode(word: usize) -> Option<Strong<T, Shared>> {
        debug_assert_eq!(word & TAG, 0);
        NonNull::new(word as *mut ControlBlock<Shared>).map(|block| {
            let element = NonNull::new_unchecked(block.as_ref().object() as *mut T);
            Strong::from_parts(block, element)
        })
    }

    /// Produce a new owning handle without disturbing the slot's own count.
    ///
    /// Must run while the tag bit is held, so the occupant cannot be
    /// released concurrently.
    unsafe fn clone_from_word(word: usize) -> Option<Strong<T, Shared>> {
        NonNull::new(word as *mut ControlBlock<Shared>).map(|block| {
            block.as_ref().retain(false);
            let element = NonNull::new_unchecked(block.as_ref().object() as *mut T);
            Strong::from_parts(block, element)
        })
    }

    /// Acquire the tag bit, returning the untagged word.
    fn lock(&self, order: Ordering) -> usize {
        loop {
            let prev = self.slot.fetch_or(TAG, acquire_side(order));
            if prev & TAG == 0 {
                return prev;
            }
            std::hint::spin_loop();
        }
    }

    /// Produce a new strong handle sharing ownership with the current
    /// occupant, or `None` for an empty slot.
    pub fn load(&self, order: Ordering) -> Option<Strong<T, Shared>> {
        let word = self.lock(order);
        let loaded = unsafe { Self::clone_from_word(word) };
        self.slot.store(word, release_side(order));
        loaded
    }

    /// Replace the occupant, releasing whatever was previously held.
    pub fn store(&self, value: Option<Strong<T, Shared>>, order: Ordering) {
        drop(self.exchange(value, order));
    }

    /// Swap in `value`, returning the previous occupant as an owning
    /// handle. No release happens here; ownership transfers to the caller.
    pub fn exchange(
        &self,
        value: Option<Strong<T, Shared>>,
        order: Ordering,
    ) -> Option<Strong<T, Shared>> {
        let new = Self::encode(value);
        let old = self.lock(order);
        self.slot.store(new, release_side(order));
        unsafe { Self::decode(old) }
    }

    /// If the occupant shares ownership with `expected`, replace it with a
    /// copy of `desired` and return `true` (releasing the displaced
    /// occupant). Otherwise write the observed occupant into `expected`
    /// and return `false`; `desired` is untouched either way.
    pub fn compare_exchange_strong(
        &self,
        expected: &mut Option<Strong<T, Shared>>,
        desired: &Option<Strong<T, Shared>>,
        success: Ordering,
        failure: Ordering,
    ) -> bool {
        if let Some(handle) = desired {
            assert!(
                handle.is_canonical(),
                "aliased handle in a word-sized atomic slot; use AtomicWide"
            );
        }
        let expected_word = expected
            .as_ref()
            .map_or(0, |handle| handle.block_ptr().as_ptr() as usize);

        let current = self.lock(success);
        if current == expected_word {
            let new = Self::encode(desired.clone());
            self.slot.store(new, release_side(success));
            // The displaced occupant's destructor may run here, strictly
            // after the slot was let go.
            drop(unsafe { Self::decode(current) });
            true
        } else {
            let observed = unsafe { Self::clone_from_word(current) };
            self.slot.store(current, release_side(failure));
            *expected = observed;
            false
        }
    }

    /// [`compare_exchange_strong`](Self::compare_exchange_strong) with a
    /// contract that additionally permits spurious failure. The current
    /// implementation never fails spuriously; callers must still loop.
    pub fn compare_exchange_weak(
        &self,
        expected: &mut Option<Strong<T, Shared>>,
        desired: &Option<Strong<T, Shared>>,
        success: Ordering,
        failure: Ordering,
    ) -> bool {
        self.compare_exchange_strong(expected, desired, success, failure)
    }

    /// Consume the slot, returning the occupant.
    pub fn into_inner(mut self) -> Option<Strong<T, Shared>> {
        let word = *self.slot.get_mut();
        mem::forget(self);
        unsafe { Self::decode(word & !TAG) }
    }
}

impl<T> Default for AtomicStrong<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T> Drop for AtomicStrong<T> {
    fn drop(&mut self) {
        let word = *self.slot.get_mut();
        drop(unsafe { Self::decode(word & !TAG) });
    }
}

impl<T> std::fmt::Debug for AtomicStrong<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let word = self.slot.load(Ordering::Relaxed) & !TAG;
        f.debug_struct("AtomicStrong")
            .field("occupied", &(word != 0))
            .finish()
    }
}
