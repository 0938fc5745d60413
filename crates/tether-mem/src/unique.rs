//! Unique (no-refcount) ownership.
//!
//! A [`Unique`] owns its object outright: no counter traffic on access or
//! move, and teardown goes through the control block's manual-destroy path,
//! which asserts that no shared handles ever existed. `into_shared` trades
//! the exclusivity for reference counting without reallocating.

use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

use crate::control::{allocate_inner, ControlBlock, Inner};
use crate::policy::{CountPolicy, Local, Shared};
use crate::source::{AllocError, Global, MemorySource};
use crate::strong::Strong;

/// Sole ownership of a heap object with a dormant control block.
///
/// The block's counts stay at zero for the whole unique phase; dropping the
/// handle destroys and frees in one step via
/// [`ControlBlock::manual_destroy`].
pub struct Unique<T, P: CountPolicy = Local> {
    inner: NonNull<Inner<T, P>>,
    _marker: PhantomData<T>,
}

unsafe impl<T: Send> Send for Unique<T, Shared> {}
unsafe impl<T: Sync> Sync for Unique<T, Shared> {}

impl<T, P: CountPolicy> Unique<T, P> {
    /// Allocate, aborting on allocation failure.
    pub fn new(value: T) -> Self {
        match Self::try_new(value) {
            Ok(handle) => handle,
            Err(_) => std::alloc::handle_alloc_error(std::alloc::Layout::new::<Inner<T, P>>()),
        }
    }

    /// Allocate through the process-wide allocator, surfacing failure.
    pub fn try_new(value: T) -> Result<Self, AllocError> {
        Self::try_new_in(value, &Global)
    }

    /// Allocate through a caller-supplied [`MemorySource`].
    pub fn try_new_in<S: MemorySource>(value: T, source: &S) -> Result<Self, AllocError> {
        let inner = allocate_inner::<T, P, S>(value, source, false)?;
        Ok(Self {
            inner,
            _marker: PhantomData,
        })
    }

    /// Convert into a reference-counted handle, in place.
    pub fn into_shared(self) -> Strong<T, P> {
        let inner = self.inner;
        std::mem::forget(self);
        unsafe {
            let block = std::ptr::addr_of_mut!((*inner.as_ptr()).block);
            (*block).make_owned();
            Strong::from_parts(
                NonNull::new_unchecked(block),
                NonNull::new_unchecked(std::ptr::addr_of_mut!((*inner.as_ptr()).value)),
            )
        }
    }
}

impl<T, P: CountPolicy> Deref for Unique<T, P> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        unsafe { &(*self.inner.as_ptr()).value }
    }
}

impl<T, P: CountPolicy> DerefMut for Unique<T, P> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut (*self.inner.as_ptr()).value }
    }
}

impl<T, P: CountPolicy> Drop for Unique<T, P> {
    fn drop(&mut self) {
        unsafe {
            let block = std::ptr::addr_of_mut!((*self.inner.as_ptr()).block);
            ControlBlock::manual_destroy(block, false);
        }
    }
}

impl<T: std::fmt::Debug, P: CountPolicy> std::fmt::Debug for Unique<T, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Unique").field(&&**self).finish()
    }
}
