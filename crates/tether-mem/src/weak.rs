//! Weak (non-owning) observer handles.
//!
//! A weak handle can detect but not prevent destruction. It moves through
//! three states: *alive* (strong count positive), *expired* (object
//! destroyed, block kept for the observers), and finally the block is freed
//! when the last observer drops — never skipping a state.
//!
//! # Example
//!
//! ```
//! use tether_mem::Strong;
//!
//! let strong: Strong<i32> = Strong::new(42);
//! let weak = Strong::downgrade(&strong);
//!
//! assert!(!weak.expired());
//! assert_eq!(*weak.upgrade().unwrap(), 42);
//!
//! drop(strong);
//! assert!(weak.expired());
//! assert!(weak.upgrade().is_none());
//! ```

use std::marker::PhantomData;
use std::ptr::NonNull;

use crate::control::ControlBlock;
use crate::policy::{CountPolicy, Local, Shared};
use crate::strong::Strong;

/// A non-owning observer of a reference-counted object.
pub struct Weak<T: ?Sized, P: CountPolicy = Local> {
    block: NonNull<ControlBlock<P>>,
    element: NonNull<T>,
    _marker: PhantomData<T>,
}

unsafe impl<T: ?Sized + Send + Sync> Send for Weak<T, Shared> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for Weak<T, Shared> {}

impl<T: ?Sized, P: CountPolicy> Weak<T, P> {
    /// Assemble a handle from raw parts without touching the counts.
    pub(crate) unsafe fn from_parts(
        block: NonNull<ControlBlock<P>>,
        element: NonNull<T>,
    ) -> Self {
        Self {
            block,
            element,
            _marker: PhantomData,
        }
    }

    fn block(&self) -> &ControlBlock<P> {
        unsafe { self.block.as_ref() }
    }

    /// Whether the observed object has been destroyed.
    ///
    /// Equivalent to `strong_count() == 0`; once true it stays true.
    #[inline]
    pub fn expired(&self) -> bool {
        self.strong_count() == 0
    }

    /// Number of strong handles currently keeping the object alive.
    pub fn strong_count(&self) -> usize {
        self.block().count(false)
    }

    /// Number of weak observers, this one included.
    pub fn weak_count(&self) -> usize {
        self.block().count(true)
    }

    /// Promote to an owning handle.
    ///
    /// Returns `None` if the object has already been destroyed. The
    /// promotion is a single conditional-increment step on the strong
    /// count, so it can never resurrect a destroyed object.
    pub fn upgrade(&self) -> Option<Strong<T, P>> {
        if self.block().try_promote() {
            Some(unsafe { Strong::from_parts(self.block, self.element) })
        } else {
            None
        }
    }

    /// Whether two handles observe the same control block.
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        this.block == other.block
    }
}

impl<T: ?Sized, P: CountPolicy> Clone for Weak<T, P> {
    fn clone(&self) -> Self {
        self.block().retain(true);
        unsafe { Self::from_parts(self.block, self.element) }
    }
}

impl<T: ?Sized, P: CountPolicy> Drop for Weak<T, P> {
    fn drop(&mut self) {
        unsafe {
            ControlBlock::release(self.block.as_ptr(), true);
        }
    }
}

impl<T: ?Sized, P: CountPolicy> std::fmt::Debug for Weak<T, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Weak")
            .field("strong", &self.strong_count())
            .field("weak", &self.weak_count())
            .finish()
    }
}
