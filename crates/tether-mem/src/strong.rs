//! Owning handles.
//!
//! A [`Strong`] keeps its object alive: copying one increments the strong
//! count, dropping one decrements it, and the object's destructor runs
//! exactly once when the last strong handle goes away. The element pointer
//! may differ from the owned object (an aliasing pair produced by
//! [`Strong::project`]); lifetime tracking always follows the control block.

use std::alloc::Layout;
use std::marker::PhantomData;
use std::ops::Deref;
use std::ptr::NonNull;

use crate::control::{
    allocate_detached, allocate_inner, allocate_inner_slice, destroy_embedded, free_embedded,
    ControlBlock,
};
use crate::policy::{CountPolicy, Counter, Local, Shared};
use crate::source::{AllocError, Global, MemorySource};
use crate::weak::Weak;

/// Implemented by objects that embed their own control block (the intrusive
/// layout). The block must be inert ([`ControlBlock::new_embedded`]) until
/// the object is adopted with [`Strong::adopt`].
pub trait HoldsBlock<P: CountPolicy> {
    fn block(&self) -> &ControlBlock<P>;
}

/// An owning, reference-counted handle.
///
/// The counter representation — and with it the thread-safety mode — is
/// the type parameter `P`: [`Local`] handles are confined to one thread,
/// [`Shared`] handles may be copied and dropped from many. The two modes
/// are distinct types, so a `Local` handle can never alias a `Shared`
/// control block.
///
/// # Example
///
/// ```
/// use tether_mem::Strong;
///
/// let a: Strong<String> = Strong::new("hello".to_string());
/// let b = a.clone();
/// assert_eq!(Strong::strong_count(&a), 2);
/// drop(a);
/// assert_eq!(&*b, "hello");
/// ```
pub struct Strong<T: ?Sized, P: CountPolicy = Local> {
    block: NonNull<ControlBlock<P>>,
    element: NonNull<T>,
    _marker: PhantomData<T>,
}

// Sharing a single handle across threads still requires the atomic slot
// types; Send/Sync here covers distinct handles to one object.
unsafe impl<T: ?Sized + Send + Sync> Send for Strong<T, Shared> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for Strong<T, Shared> {}

impl<T, P: CountPolicy> Strong<T, P> {
    /// Allocate a colocated control block and value, aborting on
    /// allocation failure.
    pub fn new(value: T) -> Self {
        match Self::try_new(value) {
            Ok(handle) => handle,
            Err(err) => alloc_failure(err),
        }
    }

    /// Allocate through the process-wide allocator, surfacing failure.
    pub fn try_new(value: T) -> Result<Self, AllocError> {
        Self::try_new_in(value, &Global)
    }

    /// Allocate through a caller-supplied [`MemorySource`].
    pub fn try_new_in<S: MemorySource>(value: T, source: &S) -> Result<Self, AllocError> {
        let inner = allocate_inner::<T, P, S>(value, source, true)?;
        unsafe {
            let block = NonNull::new_unchecked(std::ptr::addr_of_mut!((*inner.as_ptr()).block));
            let element = NonNull::new_unchecked(std::ptr::addr_of_mut!((*inner.as_ptr()).value));
            Ok(Self::from_parts(block, element))
        }
    }

    /// Adopt an existing boxed value (detached layout: the control block is
    /// its own allocation, the box storage is returned together with the
    /// destructor).
    pub fn from_box(value: Box<T>) -> Self {
        let object = Box::into_raw(value);
        match allocate_detached::<T, P, Global>(object, &Global) {
            Ok(block) => unsafe {
                Self::from_parts(block, NonNull::new_unchecked(object))
            },
            Err(err) => {
                // SAFETY: ownership of the box was never transferred.
                drop(unsafe { Box::from_raw(object) });
                alloc_failure(err)
            }
        }
    }
}

impl<T: HoldsBlock<P>, P: CountPolicy> Strong<T, P> {
    /// Adopt a boxed value that embeds its own control block (intrusive
    /// layout). The embedded block is bound to the object's destructor and
    /// storage; the object is destroyed at the last strong release and the
    /// storage — block included — is freed once the last weak handle
    /// follows.
    pub fn adopt(value: Box<T>) -> Self {
        let object = Box::into_raw(value);
        unsafe {
            let block = (*object).block() as *const ControlBlock<P> as *mut ControlBlock<P>;
            ControlBlock::bind(
                block,
                object as *mut (),
                destroy_embedded::<T, P>,
                free_embedded::<T, P>,
            );
            Self::from_parts(
                NonNull::new_unchecked(block),
                NonNull::new_unchecked(object),
            )
        }
    }
}

impl<T: Clone, P: CountPolicy> Strong<[T], P> {
    /// Allocate a colocated control block and slice copy, aborting on
    /// allocation failure.
    pub fn from_slice(values: &[T]) -> Self {
        match Self::try_from_slice(values) {
            Ok(handle) => handle,
            Err(err) => alloc_failure(err),
        }
    }

    /// Slice construction, surfacing allocation failure.
    pub fn try_from_slice(values: &[T]) -> Result<Self, AllocError> {
        let inner = allocate_inner_slice::<T, P, Global>(values, &Global)?;
        unsafe {
            let block = NonNull::new_unchecked(std::ptr::addr_of_mut!((*inner.as_ptr()).block));
            let element = NonNull::new_unchecked(std::ptr::addr_of_mut!((*inner.as_ptr()).value));
            Ok(Self::from_parts(block, element))
        }
    }
}

impl<T: ?Sized, P: CountPolicy> Strong<T, P> {
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

    pub(crate) fn block(&self) -> &ControlBlock<P> {
        unsafe { self.block.as_ref() }
    }

    pub(crate) fn block_ptr(&self) -> NonNull<ControlBlock<P>> {
        self.block
    }

    /// Whether the element is the owned object itself (no aliasing).
    pub(crate) fn is_canonical(&self) -> bool {
        self.element.as_ptr() as *mut () == self.block().object()
    }

    /// Number of strong handles sharing this object.
    pub fn strong_count(this: &Self) -> usize {
        this.block().count(false)
    }

    /// Number of weak observers of this object.
    pub fn weak_count(this: &Self) -> usize {
        this.block().count(true)
    }

    /// Create a weak observer of the same object.
    pub fn downgrade(this: &Self) -> Weak<T, P> {
        this.block().retain(true);
        unsafe { Weak::from_parts(this.block, this.element) }
    }

    /// Create an aliased handle whose element is a sub-object (a field,
    /// a slice element) while ownership keeps following this control block.
    pub fn project<U: ?Sized, F>(this: &Self, f: F) -> Strong<U, P>
    where
        F: FnOnce(&T) -> &U,
    {
        let element = NonNull::from(f(&**this));
        this.block().retain(false);
        unsafe { Strong::from_parts(this.block, element) }
    }

    /// Whether two handles share one control block.
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        this.block == other.block
    }

    /// Raw element pointer.
    pub fn as_ptr(this: &Self) -> *const T {
        this.element.as_ptr()
    }

    /// Mutable access if this is the only handle — no other strong handle
    /// and no weak observer (the teacher-style in-place-when-unique
    /// pattern).
    pub fn get_mut(this: &mut Self) -> Option<&mut T> {
        if this.is_unique() {
            Some(unsafe { this.element.as_mut() })
        } else {
            None
        }
    }

    /// Sole-ownership check. The weak counter is parked at a sentinel for
    /// the duration so a racing `upgrade`/`downgrade` cannot slip between
    /// the two reads.
    fn is_unique(&mut self) -> bool {
        let block = unsafe { self.block.as_ref() };
        if block
            .weak_counter()
            .compare_exchange(1, crate::control::WEAK_LOCKED)
            .is_err()
        {
            return false;
        }
        let unique = block.strong_counter().get() == 1;
        block.weak_counter().set(1);
        unique
    }
}

impl<T: ?Sized, P: CountPolicy> Deref for Strong<T, P> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // Invariant: a live strong handle implies strong >= 1, so the
        // element has not been destroyed.
        unsafe { self.element.as_ref() }
    }
}

impl<T: ?Sized, P: CountPolicy> Clone for Strong<T, P> {
    fn clone(&self) -> Self {
        self.block().retain(false);
        unsafe { Self::from_parts(self.block, self.element) }
    }
}

impl<T: ?Sized, P: CountPolicy> Drop for Strong<T, P> {
    fn drop(&mut self) {
        unsafe {
            ControlBlock::release(self.block.as_ptr(), false);
        }
    }
}

impl<T: ?Sized + std::fmt::Debug, P: CountPolicy> std::fmt::Debug for Strong<T, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Strong")
            .field("value", &&**self)
            .field("strong", &Self::strong_count(self))
            .finish()
    }
}

fn alloc_failure(err: AllocError) -> ! {
    let layout = Layout::from_size_align(err.size, err.align)
        .unwrap_or_else(|_| Layout::new::<u8>());
    std::alloc::handle_alloc_error(layout)
}
