//! # Tether-Mem
//!
//! Shared, weak, and unique ownership of heap objects via reference-counted
//! handles, modeled on C++ `shared_ptr`/`weak_ptr`.
//!
//! ## Features
//!
//! - **Policy-selected counting**: `Local` (plain counters, thread-confined)
//!   or `Shared` (atomic counters) chosen at the type level — the two modes
//!   can never alias one control block
//! - **Strong/weak split**: the object's destructor runs when the last
//!   strong handle goes, the storage outlives it for weak observers
//! - **Aliasing handles**: `Strong::project` points at a sub-object while
//!   ownership keeps following the control block
//! - **Slice payloads**: `Strong<[T]>` colocates the control block with the
//!   element storage in one allocation
//! - **Atomic slots**: one handle variable shared across threads, via a
//!   lock-free word slot (`AtomicStrong`) or a mutex-table fallback for
//!   wider payloads (`AtomicWide`)
//! - **Pluggable allocation**: construction helpers go through a
//!   `MemorySource`; failure surfaces as an error, never a partial object
//!
//! ## Quick Start
//!
//! ```rust
//! use tether_mem::Strong;
//!
//! let strong: Strong<String> = Strong::new("hello".to_string());
//! let weak = Strong::downgrade(&strong);
//! assert_eq!(*weak.upgrade().unwrap(), "hello");
//! drop(strong);
//! assert!(weak.expired());
//! ```
//!
//! Sharing a *single* handle variable between threads goes through a slot
//! type; plain `Clone`/`Drop` on one location from two threads is a data
//! race by design, exactly as with `std::atomic<shared_ptr>`:
//!
//! ```rust
//! use std::sync::atomic::Ordering;
//! use tether_mem::{AtomicStrong, Strong};
//!
//! let slot: AtomicStrong<i32> = AtomicStrong::new(Some(Strong::new(1)));
//! let handle = slot.load(Ordering::SeqCst).unwrap();
//! assert_eq!(*handle, 1);
//! ```

mod atomic;
mod control;
mod fallback;
mod policy;
mod source;
mod strong;
mod unique;
mod weak;

pub use atomic::AtomicStrong;
pub use control::ControlBlock;
pub use fallback::AtomicWide;
pub use policy::{CountPolicy, Counter, Local, Shared};
pub use source::{AllocError, Global, MemorySource};
pub use strong::{HoldsBlock, Strong};
pub use unique::Unique;
pub use weak::Weak;
