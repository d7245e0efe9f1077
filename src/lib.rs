//! A boundary-tag heap allocator over a single fixed region.
//!
//! A [`Heap`] obtains one contiguous, page-aligned, zero-filled region from a
//! [`BackingAllocator`] when it is initialized and never asks for more. All
//! bookkeeping lives inside the region itself: every block starts with a
//! one-word header packing its size and two status bits, and every free block
//! repeats its size in a trailing footer so that a neighbor being freed can
//! find it without walking the heap from the start.
//!
//! ```text
//!   base
//!   │
//!   ▼
//!   ┌─────┬────────┬─────────────┬────────┬──────────────────┬────────┬─────┐
//!   │ pad │ header │   payload   │ header │       free       │ footer │ end │
//!   └─────┴────────┴─────────────┴────────┴──────────────────┴────────┴─────┘
//!         └──── allocated block ─┘└────────── free block ────────────┘
//! ```
//!
//! Allocation is best-fit over the implicit list of blocks, splitting off the
//! unused tail of the chosen block. Deallocation coalesces eagerly with free
//! neighbors on both sides, so no two adjacent blocks are ever both free.
//!
//! ## Characteristics
//!
//! #### Time complexity
//!
//! | Operation                | Best-case | Worst-case |
//! |--------------------------|-----------|------------|
//! | Allocate                 | O(1)      | O(blocks)  |
//! | Deallocate               | O(1)      | O(1)       |
//!
//! #### Fragmentation
//!
//! Blocks are sized to the request rounded up to 8 bytes plus one header word,
//! so internal fragmentation is at most 15 bytes per allocation. Best-fit
//! placement and eager coalescing keep external fragmentation low, but the
//! allocator never moves live blocks.
//!
//! ## Thread safety
//!
//! A [`Heap`] has no internal locking. Callers sharing one heap between threads
//! must serialize every call themselves; the [`global`] facade (feature
//! `global`) does so with a spin lock.

#![doc(html_root_url = "https://docs.rs/boundary_alloc/0.1.0")]
#![warn(missing_debug_implementations)]
#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]
#![cfg_attr(not(any(feature = "std", test)), no_std)]
#![cfg_attr(docs_rs, feature(doc_cfg))]
// This is necessary to allow `sptr` to shadow methods that have since been
// stabilized on raw pointers.
#![allow(unstable_name_collisions)]

#[cfg(any(feature = "alloc", test))]
extern crate alloc;

mod base;
pub mod dump;
pub mod heap;
mod tag;

#[cfg(all(unix, feature = "mmap"))]
mod mmap;

#[cfg(all(unix, feature = "global"))]
#[cfg_attr(docs_rs, doc(cfg(feature = "global")))]
pub mod global;


use core::{fmt, ptr::NonNull};

pub use crate::{
    dump::{BlockInfo, Blocks, Dump, HeapStats},
    heap::{Corruption, CorruptionKind, Heap},
    tag::{END_MARK_SIZE, HEADER_SIZE, MIN_BLOCK_SIZE, PAD_SIZE, WORD_SIZE},
};

#[cfg(all(unix, feature = "mmap"))]
pub use crate::mmap::Mmap;

/// The error type for heap operations.
///
/// Every failure leaves the heap exactly as it was before the call.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// A requested size was zero, negative, or too large to represent.
    InvalidSize,

    /// A pointer passed to [`Heap::deallocate`] is null, misaligned, outside
    /// the region, or does not name a block that is currently allocated.
    ///
    /// Detection is best-effort. The allocated bit in the block header is the
    /// only signal available, so a double free cannot be told apart from a
    /// pointer that was never returned by this heap, and a stray pointer into
    /// the middle of a payload may go unnoticed.
    InvalidArgument,

    /// No free block can satisfy the request, or the backing allocator could
    /// not provide the region.
    OutOfMemory,

    /// [`Heap::init`] was called on a heap that already owns a region.
    AlreadyInitialized,

    /// The heap has not been successfully initialized.
    Uninitialized,
}

impl Error {
    /// Returns the negative status code reported by the C-style entry points.
    pub const fn code(self) -> i32 {
        match self {
            Error::InvalidSize => -1,
            Error::InvalidArgument => -2,
            Error::OutOfMemory => -3,
            Error::AlreadyInitialized => -4,
            Error::Uninitialized => -5,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Error::InvalidSize => "requested size is not positive or too large",
            Error::InvalidArgument => "pointer does not name an allocated block",
            Error::OutOfMemory => "out of memory",
            Error::AlreadyInitialized => "heap has already been initialized",
            Error::Uninitialized => "heap has not been initialized",
        };

        f.write_str(msg)
    }
}

#[cfg(feature = "std")]
#[cfg_attr(docs_rs, doc(cfg(feature = "std")))]
impl std::error::Error for Error {}

/// Types which provide the region managed by a [`Heap`].
///
/// This trait is sealed and implemented by the following types:
/// - [`Mmap`] maps anonymous memory from the operating system (feature
///   `mmap`, unix only).
/// - [`Global`] allocates zeroed memory from the Rust global allocator
///   (feature `alloc`).
pub trait BackingAllocator: Sealed {
    /// Returns the granularity, in bytes, to which region sizes are rounded.
    ///
    /// This is always a power of two and a multiple of [`WORD_SIZE`].
    fn page_size(&self) -> usize;

    /// Obtains a zero-filled, read-write region of `len` bytes aligned to
    /// [`page_size()`](BackingAllocator::page_size).
    ///
    /// Returns `None` if the region could not be provided.
    ///
    /// # Safety
    ///
    /// `len` must be a nonzero multiple of the page size.
    unsafe fn map(&self, len: usize) -> Option<NonNull<u8>>;

    /// Returns a region obtained from [`map`](BackingAllocator::map).
    ///
    /// # Safety
    ///
    /// `ptr` and `len` must describe a region previously returned by `map` on
    /// this backing allocator, and the region must not be accessed afterward.
    unsafe fn unmap(&self, ptr: NonNull<u8>, len: usize);
}

#[cfg(any(feature = "alloc", test))]
/// The global memory allocator.
///
/// Regions are allocated with a fixed alignment of 4096 bytes, which stands in
/// for the page size.
#[derive(Clone, Debug)]
pub struct Global;

#[cfg(any(feature = "alloc", test))]
impl Global {
    const PAGE_SIZE: usize = 4096;

    fn layout(len: usize) -> Option<core::alloc::Layout> {
        core::alloc::Layout::from_size_align(len, Self::PAGE_SIZE).ok()
    }
}

#[cfg(any(feature = "alloc", test))]
impl Sealed for Global {}

#[cfg(any(feature = "alloc", test))]
#[cfg_attr(docs_rs, doc(cfg(feature = "alloc")))]
impl BackingAllocator for Global {
    fn page_size(&self) -> usize {
        Global::PAGE_SIZE
    }

    unsafe fn map(&self, len: usize) -> Option<NonNull<u8>> {
        let layout = Global::layout(len)?;

        // SAFETY: the caller guarantees `len` is nonzero.
        NonNull::new(unsafe { alloc::alloc::alloc_zeroed(layout) })
    }

    unsafe fn unmap(&self, ptr: NonNull<u8>, len: usize) {
        if let Some(layout) = Global::layout(len) {
            unsafe { alloc::alloc::dealloc(ptr.as_ptr(), layout) };
        }
    }
}

#[doc(hidden)]
mod private {
    pub trait Sealed {}
}
use private::Sealed;
