//! Allocator capability consumed by the construction helpers.
//!
//! The core never calls `std::alloc` directly from its hot paths; it goes
//! through a [`MemorySource`], and the deallocation half is type-erased into
//! the control block at construction time. Sources are required to be
//! stateless value types (`Default` recreates an equivalent source) so the
//! erased free function can conjure one when the last handle goes away.

use std::alloc::Layout;
use std::ptr::NonNull;

use thiserror::Error;

/// Allocation failure, surfaced by `try_new`-style construction helpers.
///
/// Construction is all-or-nothing: on failure no object is constructed and
/// no storage is retained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("allocation of {size} bytes (align {align}) failed")]
pub struct AllocError {
    /// Requested size in bytes.
    pub size: usize,
    /// Requested alignment in bytes.
    pub align: usize,
}

impl AllocError {
    pub(crate) fn for_layout(layout: Layout) -> Self {
        Self {
            size: layout.size(),
            align: layout.align(),
        }
    }
}

/// A raw allocate/deallocate capability.
pub trait MemorySource: Default {
    /// Allocate storage for `layout`, or report failure.
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError>;

    /// Return storage obtained from [`allocate`](Self::allocate).
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `allocate` on an equivalent source
    /// with the same `layout`, and must not be used afterwards.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

/// The process-wide allocator (`std::alloc`).
#[derive(Debug, Clone, Copy, Default)]
pub struct Global;

impl MemorySource for Global {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        debug_assert!(layout.size() > 0, "zero-sized control allocation");
        // SAFETY: layout has nonzero size (it always contains a control block).
        let ptr = unsafe { std::alloc::alloc(layout) };
        NonNull::new(ptr).ok_or_else(|| AllocError::for_layout(layout))
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        std::alloc::dealloc(ptr.as_ptr(), layout);
    }
}
