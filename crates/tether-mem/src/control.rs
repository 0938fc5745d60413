//! Control blocks: the shared bookkeeping behind every handle.
//!
//! A [`ControlBlock`] tracks the strong (owning) and weak (observing) counts
//! for one managed object, plus two type-erased cleanup functions bound at
//! construction time: `destroy` runs the object's destructor when the strong
//! count reaches zero, `free` returns the backing storage once the weak
//! count follows. The counter representation is selected by a
//! [`CountPolicy`](crate::CountPolicy), so the same code serves both the
//! thread-confined and the shared mode.
//!
//! Internally the weak counter carries one extra unit owned collectively by
//! the strong handles; the last strong release drops it after running the
//! destructor. This makes the destroy/free handoff a pair of independent
//! zero transitions with no window where both sides could free the block.
//!
//! Three storage layouts bind into the same block type:
//!
//! - *colocated*: `[ControlBlock | value]` in one allocation ([`Inner`]),
//!   including the slice form with a `[T]` tail,
//! - *detached*: the block is its own allocation, adopting a `Box`,
//! - *embedded*: the object itself holds the block (intrusive layout, see
//!   [`HoldsBlock`](crate::HoldsBlock)).

use std::alloc::Layout;
use std::mem;
use std::ptr::{self, NonNull};

use crate::policy::{CountPolicy, Counter};
use crate::source::{AllocError, Global, MemorySource};

/// Sentinel the weak counter is parked at while a sole-ownership check is
/// in flight (see `Strong::get_mut`). Weak increments wait it out.
pub(crate) const WEAK_LOCKED: usize = usize::MAX;

/// Reference-count bookkeeping for one managed object.
pub struct ControlBlock<P: CountPolicy> {
    strong: P::Counter,
    /// Observer count plus one unit held collectively by strong handles.
    weak: P::Counter,
    /// Address of the owned object (not of any aliased element).
    object: *mut (),
    /// Element count for slice objects, 0 otherwise.
    meta: usize,
    destroy: unsafe fn(*mut ControlBlock<P>),
    free: unsafe fn(*mut ControlBlock<P>),
}

impl<P: CountPolicy> ControlBlock<P> {
    pub(crate) fn new(
        object: *mut (),
        meta: usize,
        destroy: unsafe fn(*mut ControlBlock<P>),
        free: unsafe fn(*mut ControlBlock<P>),
        owned: bool,
    ) -> Self {
        let initial = usize::from(owned);
        Self {
            strong: P::new_counter(initial),
            weak: P::new_counter(initial),
            object,
            meta,
            destroy,
            free,
        }
    }

    /// Placeholder block for the embedded (intrusive) layout.
    ///
    /// The block is inert until the containing object is adopted by a
    /// handle, which binds the cleanup functions and takes the first
    /// strong count.
    pub fn new_embedded() -> Self {
        Self::new(ptr::null_mut(), 0, noop_cleanup::<P>, noop_cleanup::<P>, false)
    }

    /// Rebind a placeholder block during adoption.
    ///
    /// # Safety
    ///
    /// `this` must point to a block with no live handles.
    pub(crate) unsafe fn bind(
        this: *mut Self,
        object: *mut (),
        destroy: unsafe fn(*mut ControlBlock<P>),
        free: unsafe fn(*mut ControlBlock<P>),
    ) {
        debug_assert_eq!((*this).strong.get(), 0, "rebinding a live control block");
        (*this).object = object;
        (*this).destroy = destroy;
        (*this).free = free;
        (*this).strong.set(1);
        (*this).weak.set(1);
    }

    #[inline]
    pub(crate) fn object(&self) -> *mut () {
        self.object
    }

    /// Increment the strong or weak count.
    ///
    /// The weak side waits out a counter transiently parked at
    /// [`WEAK_LOCKED`] by a concurrent sole-ownership check, so a
    /// `downgrade` on a distinct handle is always safe.
    #[inline]
    pub fn retain(&self, weak: bool) {
        if weak {
            self.weak.increment_spinning(WEAK_LOCKED);
        } else {
            let count = self.strong.increment();
            debug_assert!(count >= 2, "retaining a strong count from zero");
        }
    }

    /// Decrement the selected count, destroying the object when the strong
    /// count reaches zero and freeing the storage when the weak count
    /// follows. Returns whether the storage was freed; the caller must not
    /// touch the block again if so.
    ///
    /// # Safety
    ///
    /// The caller must own one unit of the selected count.
    pub unsafe fn release(this: *mut Self, weak: bool) -> bool {
        if weak {
            if (*this).weak.decrement() == 0 {
                let free = (*this).free;
                free(this);
                return true;
            }
            false
        } else {
            if (*this).strong.decrement() == 0 {
                let destroy = (*this).destroy;
                destroy(this);
                // Strong handles collectively held one weak unit.
                return Self::release(this, true);
            }
            false
        }
    }

    /// Attempt a weak-to-strong promotion.
    ///
    /// Succeeds only if the strong count is observed nonzero, as a single
    /// atomic step; a destroyed object is never resurrected.
    #[inline]
    pub fn try_promote(&self) -> bool {
        self.strong.increment_if_nonzero()
    }

    /// Snapshot of the selected count. The weak side reports observers
    /// only, excluding the unit held by strong handles.
    pub fn count(&self, weak: bool) -> usize {
        if weak {
            let observers = self.weak.get();
            if observers == WEAK_LOCKED {
                // A sole-ownership check holds the counter; it only locks
                // when no observers exist.
                0
            } else if self.strong.get() > 0 {
                observers - 1
            } else {
                observers
            }
        } else {
            self.strong.get()
        }
    }

    /// Unconditionally run destructor and deallocation, for the no-refcount
    /// ownership variant.
    ///
    /// Without `force`, both counts must be zero; live handles here are a
    /// caller logic bug, not a recoverable condition.
    ///
    /// # Safety
    ///
    /// No handle may use the block afterwards.
    pub unsafe fn manual_destroy(this: *mut Self, force: bool) {
        let strong = (*this).strong.get();
        let weak = (*this).weak.get();
        if force {
            if strong != 0 || weak != 0 {
                log::debug!(
                    "force-destroying control block {:p} with live counts (strong {strong}, weak {weak})",
                    this
                );
            }
        } else {
            assert!(
                strong == 0 && weak == 0,
                "manual destroy with live handles (strong {strong}, weak {weak})"
            );
        }
        let destroy = (*this).destroy;
        let free = (*this).free;
        destroy(this);
        free(this);
    }

    /// Promote an unowned block (counts zero) to owned state.
    pub(crate) fn make_owned(&self) {
        debug_assert_eq!(self.strong.get(), 0);
        self.strong.set(1);
        self.weak.set(1);
    }

    pub(crate) fn weak_counter(&self) -> &P::Counter {
        &self.weak
    }

    pub(crate) fn strong_counter(&self) -> &P::Counter {
        &self.strong
    }
}

impl<P: CountPolicy> std::fmt::Debug for ControlBlock<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlBlock")
            .field("strong", &self.count(false))
            .field("weak", &self.count(true))
            .finish()
    }
}

unsafe fn noop_cleanup<P: CountPolicy>(_block: *mut ControlBlock<P>) {}

// ============================================================================
// Colocated layout
// ============================================================================

/// Control block and value in a single allocation.
#[repr(C)]
pub(crate) struct Inner<T: ?Sized, P: CountPolicy> {
    pub(crate) block: ControlBlock<P>,
    pub(crate) value: T,
}

pub(crate) fn allocate_inner<T, P, S>(
    value: T,
    source: &S,
    owned: bool,
) -> Result<NonNull<Inner<T, P>>, AllocError>
where
    P: CountPolicy,
    S: MemorySource,
{
    let layout = Layout::new::<Inner<T, P>>();
    let mem = source.allocate(layout)?;
    let inner = mem.as_ptr() as *mut Inner<T, P>;
    unsafe {
        let object = ptr::addr_of_mut!((*inner).value) as *mut ();
        ptr::addr_of_mut!((*inner).block).write(ControlBlock::new(
            object,
            0,
            destroy_colocated::<T, P>,
            free_colocated::<T, P, S>,
            owned,
        ));
        ptr::addr_of_mut!((*inner).value).write(value);
        Ok(NonNull::new_unchecked(inner))
    }
}

unsafe fn destroy_colocated<T, P: CountPolicy>(block: *mut ControlBlock<P>) {
    // The block sits at offset 0 of its repr(C) Inner.
    let inner = block as *mut Inner<T, P>;
    ptr::drop_in_place(ptr::addr_of_mut!((*inner).value));
}

unsafe fn free_colocated<T, P: CountPolicy, S: MemorySource>(block: *mut ControlBlock<P>) {
    let layout = Layout::new::<Inner<T, P>>();
    S::default().deallocate(NonNull::new_unchecked(block as *mut u8), layout);
}

// ============================================================================
// Colocated slice layout
// ============================================================================

pub(crate) fn slice_layout<T, P: CountPolicy>(len: usize) -> Result<Layout, AllocError> {
    let header = Layout::new::<ControlBlock<P>>();
    let array = Layout::array::<T>(len).map_err(|_| AllocError {
        size: usize::MAX,
        align: mem::align_of::<T>(),
    })?;
    let (layout, _offset) = header.extend(array).map_err(|_| AllocError {
        size: usize::MAX,
        align: layout_align_max::<T, P>(),
    })?;
    Ok(layout.pad_to_align())
}

fn layout_align_max<T, P: CountPolicy>() -> usize {
    mem::align_of::<T>().max(mem::align_of::<ControlBlock<P>>())
}

pub(crate) fn allocate_inner_slice<T, P, S>(
    values: &[T],
    source: &S,
) -> Result<NonNull<Inner<[T], P>>, AllocError>
where
    T: Clone,
    P: CountPolicy,
    S: MemorySource,
{
    let len = values.len();
    let layout = slice_layout::<T, P>(len)?;
    let mem = source.allocate(layout)?;
    // Attach the length metadata, then cast to the unsized inner type.
    let inner = ptr::slice_from_raw_parts_mut(mem.as_ptr() as *mut T, len) as *mut Inner<[T], P>;
    unsafe {
        let data = ptr::addr_of_mut!((*inner).value) as *mut T;
        ptr::addr_of_mut!((*inner).block).write(ControlBlock::new(
            data as *mut (),
            len,
            destroy_slice::<T, P>,
            free_slice::<T, P, S>,
            true,
        ));
        // If a clone panics, drop the initialized prefix and return the
        // storage; the caller never sees a partial object.
        let mut guard = SliceInitGuard {
            data,
            initialized: 0,
            mem,
            layout,
            source,
        };
        for value in values {
            data.add(guard.initialized).write(value.clone());
            guard.initialized += 1;
        }
        mem::forget(guard);
        Ok(NonNull::new_unchecked(inner))
    }
}

struct SliceInitGuard<'a, T, S: MemorySource> {
    data: *mut T,
    initialized: usize,
    mem: NonNull<u8>,
    layout: Layout,
    source: &'a S,
}

impl<T, S: MemorySource> Drop for SliceInitGuard<'_, T, S> {
    fn drop(&mut self) {
        unsafe {
            ptr::drop_in_place(ptr::slice_from_raw_parts_mut(self.data, self.initialized));
            self.source.deallocate(self.mem, self.layout);
        }
    }
}

unsafe fn destroy_slice<T, P: CountPolicy>(block: *mut ControlBlock<P>) {
    let data = (*block).object as *mut T;
    let len = (*block).meta;
    ptr::drop_in_place(ptr::slice_from_raw_parts_mut(data, len));
}

unsafe fn free_slice<T, P: CountPolicy, S: MemorySource>(block: *mut ControlBlock<P>) {
    let len = (*block).meta;
    let layout = match slice_layout::<T, P>(len) {
        Ok(layout) => layout,
        Err(_) => unreachable!("slice layout validated at construction"),
    };
    S::default().deallocate(NonNull::new_unchecked(block as *mut u8), layout);
}

// ============================================================================
// Detached layout (box adoption)
// ============================================================================

pub(crate) fn allocate_detached<T, P, S>(
    object: *mut T,
    source: &S,
) -> Result<NonNull<ControlBlock<P>>, AllocError>
where
    P: CountPolicy,
    S: MemorySource,
{
    let layout = Layout::new::<ControlBlock<P>>();
    let mem = source.allocate(layout)?;
    let block = mem.as_ptr() as *mut ControlBlock<P>;
    unsafe {
        block.write(ControlBlock::new(
            object as *mut (),
            0,
            destroy_boxed::<T, P>,
            free_detached::<P, S>,
            true,
        ));
        Ok(NonNull::new_unchecked(block))
    }
}

unsafe fn destroy_boxed<T, P: CountPolicy>(block: *mut ControlBlock<P>) {
    // Object storage goes back with the destructor; only the block region
    // has to survive for outstanding weak handles.
    drop(Box::from_raw((*block).object as *mut T));
}

unsafe fn free_detached<P: CountPolicy, S: MemorySource>(block: *mut ControlBlock<P>) {
    let layout = Layout::new::<ControlBlock<P>>();
    S::default().deallocate(NonNull::new_unchecked(block as *mut u8), layout);
}

// ============================================================================
// Embedded (intrusive) layout
// ============================================================================

pub(crate) unsafe fn destroy_embedded<T, P: CountPolicy>(block: *mut ControlBlock<P>) {
    ptr::drop_in_place((*block).object as *mut T);
}

pub(crate) unsafe fn free_embedded<T, P: CountPolicy>(block: *mut ControlBlock<P>) {
    let object = (*block).object as *mut u8;
    Global.deallocate(NonNull::new_unchecked(object), Layout::new::<T>());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Shared;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Destroy/free observer reached through the block's object pointer,
    /// so each test gets its own counters.
    #[derive(Default)]
    struct Probe {
        destroyed: AtomicUsize,
        freed: AtomicUsize,
    }

    unsafe fn probe_destroy(block: *mut ControlBlock<Shared>) {
        let probe = &*((*block).object as *const Probe);
        probe.destroyed.fetch_add(1, Ordering::SeqCst);
    }

    unsafe fn probe_free(block: *mut ControlBlock<Shared>) {
        let probe = &*((*block).object as *const Probe);
        probe.freed.fetch_add(1, Ordering::SeqCst);
        drop(Box::from_raw(block));
    }

    fn leaked_block(probe: &Probe, owned: bool) -> *mut ControlBlock<Shared> {
        Box::into_raw(Box::new(ControlBlock::new(
            probe as *const Probe as *mut (),
            0,
            probe_destroy,
            probe_free,
            owned,
        )))
    }

    #[test]
    fn test_release_order_destroy_then_free() {
        let probe = Probe::default();
        let block = leaked_block(&probe, true);
        unsafe {
            (*block).retain(false);
            assert!(!ControlBlock::release(block, false));
            assert_eq!(probe.destroyed.load(Ordering::SeqCst), 0);

            assert!(ControlBlock::release(block, false));
        }
        assert_eq!(probe.destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(probe.freed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_weak_keeps_block_alive_after_destroy() {
        let probe = Probe::default();
        let block = leaked_block(&probe, true);
        unsafe {
            (*block).retain(true);
            assert!(!ControlBlock::release(block, false));
            // Object destroyed, block still reachable by the weak holder.
            assert_eq!(probe.destroyed.load(Ordering::SeqCst), 1);
            assert_eq!((*block).count(false), 0);
            assert!(!(*block).try_promote());
            assert_eq!(probe.freed.load(Ordering::SeqCst), 0);

            assert!(ControlBlock::release(block, true));
        }
        assert_eq!(probe.freed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_try_promote_succeeds_while_alive() {
        let probe = Probe::default();
        let block = leaked_block(&probe, true);
        unsafe {
            assert!((*block).try_promote());
            assert_eq!((*block).count(false), 2);
            assert!(!ControlBlock::release(block, false));
            assert!(ControlBlock::release(block, false));
        }
        assert_eq!(probe.destroyed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_manual_destroy_force_with_live_counts() {
        let probe = Probe::default();
        let block = leaked_block(&probe, true);
        unsafe {
            // Exceptional teardown: force ignores the live strong count.
            ControlBlock::manual_destroy(block, true);
        }
        assert_eq!(probe.destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(probe.freed.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[should_panic(expected = "manual destroy with live handles")]
    fn test_manual_destroy_rejects_live_counts() {
        let probe = Probe::default();
        let block = leaked_block(&probe, true);
        unsafe {
            ControlBlock::manual_destroy(block, false);
        }
    }

    #[test]
    fn test_manual_destroy_unowned() {
        let probe = Probe::default();
        let block = leaked_block(&probe, false);
        unsafe {
            ControlBlock::manual_destroy(block, false);
        }
        assert_eq!(probe.destroyed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_weak_count_excludes_strong_unit() {
        let probe = Probe::default();
        let block = leaked_block(&probe, true);
        unsafe {
            assert_eq!((*block).count(true), 0);
            (*block).retain(true);
            assert_eq!((*block).count(true), 1);
            assert!(!ControlBlock::release(block, true));
            assert!(ControlBlock::release(block, false));
        }
    }
}
