//! Mutex-guarded atomic slots for payloads wider than a machine word.
//!
//! Aliased handles carry a separate element pointer and slice handles carry
//! pointer+length; neither fits the single-word protocol of
//! [`AtomicStrong`](crate::AtomicStrong). An [`AtomicWide`] keeps the same
//! observable contract by guarding an ordinary read-modify-write with a
//! mutex drawn from a process-wide, fixed-size table keyed by a hash of the
//! slot's address. Collisions between unrelated slots are benign; the table
//! never grows.
//!
//! The lock is held only across the slot access itself. The destructor of a
//! displaced value runs after the lock is released, so a destructor that
//! touches another atomic slot cannot deadlock on the same shard.

use std::cell::UnsafeCell;
use std::mem;
use std::sync::atomic::Ordering;

use parking_lot::{Mutex, MutexGuard};

use crate::policy::Shared;
use crate::strong::Strong;

const SHARD_COUNT: usize = 64;
const SHARD_INIT: Mutex<()> = Mutex::new(());

static SHARDS: [Mutex<()>; SHARD_COUNT] = [SHARD_INIT; SHARD_COUNT];

/// Pick the shard for a slot address (Fibonacci hashing; low bits of the
/// address are alignment noise, so take the top of the product).
fn shard_for(addr: usize) -> &'static Mutex<()> {
    let mixed = addr.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    &SHARDS[(mixed >> 58) as usize & (SHARD_COUNT - 1)]
}

/// A mutex-guarded atomic slot for an optional strong handle of any
/// payload shape, aliased pairs and slices included.
///
/// The `Ordering` parameters are accepted for signature parity with
/// [`AtomicStrong`](crate::AtomicStrong); the mutex already provides
/// acquire/release on every operation.
///
/// # Example
///
/// ```
/// use std::sync::atomic::Ordering;
/// use tether_mem::{AtomicWide, Strong};
///
/// let slot: AtomicWide<[u32]> = AtomicWide::new(Some(Strong::from_slice(&[1, 2, 3])));
/// assert_eq!(slot.load(Ordering::SeqCst).unwrap().len(), 3);
/// ```
pub struct AtomicWide<T: ?Sized> {
    slot: UnsafeCell<Option<Strong<T, Shared>>>,
}

unsafe impl<T: ?Sized + Send + Sync> Send for AtomicWide<T> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for AtomicWide<T> {}

impl<T: ?Sized> AtomicWide<T> {
    /// Create a slot holding `value`.
    pub fn new(value: Option<Strong<T, Shared>>) -> Self {
        Self {
            slot: UnsafeCell::new(value),
        }
    }

    /// Create an empty slot.
    pub fn empty() -> Self {
        Self::new(None)
    }

    fn guard(&self) -> MutexGuard<'static, ()> {
        shard_for(self.slot.get() as *const () as usize).lock()
    }

    /// Produce a new strong handle sharing ownership with the current
    /// occupant, or `None` for an empty slot.
    pub fn load(&self, _order: Ordering) -> Option<Strong<T, Shared>> {
        let guard = self.guard();
        let loaded = unsafe { (*self.slot.get()).clone() };
        drop(guard);
        loaded
    }

    /// Replace the occupant, releasing whatever was previously held.
    pub fn store(&self, value: Option<Strong<T, Shared>>, _order: Ordering) {
        log::trace!("atomic-wide store on slot {:p}", self.slot.get());
        let guard = self.guard();
        let displaced = unsafe { mem::replace(&mut *self.slot.get(), value) };
        drop(guard);
        // Displaced destructor runs outside the critical section.
        drop(displaced);
    }

    /// Swap in `value`, returning the previous occupant as an owning
    /// handle. No release happens here; ownership transfers to the caller.
    pub fn exchange(
        &self,
        value: Option<Strong<T, Shared>>,
        _order: Ordering,
    ) -> Option<Strong<T, Shared>> {
        log::trace!("atomic-wide exchange on slot {:p}", self.slot.get());
        let guard = self.guard();
        let previous = unsafe { mem::replace(&mut *self.slot.get(), value) };
        drop(guard);
        previous
    }

    /// If the occupant shares ownership with `expected`, replace it with a
    /// copy of `desired` and return `true` (releasing the displaced
    /// occupant). Otherwise write the observed occupant into `expected`
    /// and return `false`; `desired` is untouched either way.
    pub fn compare_exchange_strong(
        &self,
        expected: &mut Option<Strong<T, Shared>>,
        desired: &Option<Strong<T, Shared>>,
        _success: Ordering,
        _failure: Ordering,
    ) -> bool {
        let guard = self.guard();
        let current = unsafe { &mut *self.slot.get() };
        if same_target(current, expected) {
            let displaced = mem::replace(current, desired.clone());
            drop(guard);
            drop(displaced);
            true
        } else {
            let observed = current.clone();
            drop(guard);
            let stale = mem::replace(expected, observed);
            drop(stale);
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
    pub fn into_inner(self) -> Option<Strong<T, Shared>> {
        self.slot.into_inner()
    }
}

/// Ownership equivalence: both empty, or both owned by one control block.
fn same_target<T: ?Sized>(a: &Option<Strong<T, Shared>>, b: &Option<Strong<T, Shared>>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => Strong::ptr_eq(a, b),
        _ => false,
    }
}

impl<T: ?Sized> Default for AtomicWide<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T: ?Sized> std::fmt::Debug for AtomicWide<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let guard = self.guard();
        let occupied = unsafe { (*self.slot.get()).is_some() };
        drop(guard);
        f.debug_struct("AtomicWide")
            .field("occupied", &occupied)
            .finish()
    }
}
