use core::{num::NonZeroUsize, ptr::NonNull};

use sptr::Strict;

use crate::tag::WORD_SIZE;

/// A pointer to the base of the region of memory managed by a heap.
///
/// Blocks are named by their byte offset from the base. All reads and writes
/// of tag words go through this type, so offsets are checked against the
/// region's extent in one place.
#[derive(Copy, Clone, Debug)]
pub struct BasePtr {
    ptr: NonNull<u8>,
    extent: usize,
}

impl BasePtr {
    /// Creates a `BasePtr` from `ptr`, covering `extent` bytes.
    ///
    /// Returns `None` if the region would extend past the end of the address
    /// space.
    #[inline]
    pub fn new(ptr: NonNull<u8>, extent: usize) -> Option<BasePtr> {
        ptr.as_ptr().addr().checked_add(extent)?;

        Some(BasePtr { ptr, extent })
    }

    /// Returns the base pointer as a `NonNull<u8>`.
    #[inline]
    pub fn ptr(self) -> NonNull<u8> {
        self.ptr
    }

    /// Returns the size of the region in bytes.
    #[inline]
    pub fn extent(self) -> usize {
        self.extent
    }

    /// Returns the address of the base pointer.
    #[inline]
    pub fn addr(self) -> NonZeroUsize {
        // SAFETY: the address of a `NonNull` is never zero.
        unsafe { NonZeroUsize::new_unchecked(self.ptr.as_ptr().addr()) }
    }

    /// Calculates the offset from `self` to `ptr`.
    ///
    /// Returns `None` if `ptr` lies outside the region.
    #[inline]
    pub fn offset_of(self, ptr: *const u8) -> Option<usize> {
        let ofs = ptr.addr().checked_sub(self.addr().get())?;

        (ofs < self.extent).then_some(ofs)
    }

    /// Creates a new pointer `offset` bytes past the base.
    ///
    /// The returned pointer has the provenance of this pointer.
    #[inline]
    pub fn with_offset(self, offset: usize) -> NonNull<u8> {
        debug_assert!(offset < self.extent, "offset out of region");

        // SAFETY: `offset` is within the region, which does not wrap around
        // the address space, so the result is in bounds and non-null.
        unsafe { NonNull::new_unchecked(self.ptr.as_ptr().add(offset)) }
    }

    /// Reads the tag word at `offset`.
    ///
    /// # Safety
    ///
    /// `offset` must be a multiple of [`WORD_SIZE`] and lie at least one word
    /// below the end of the region, and the region must still be mapped.
    #[inline]
    pub unsafe fn read_word(self, offset: usize) -> u64 {
        debug_assert_eq!(offset % WORD_SIZE, 0);
        debug_assert!(offset + WORD_SIZE <= self.extent, "word out of region");

        unsafe { self.with_offset(offset).cast::<u64>().as_ptr().read() }
    }

    /// Writes the tag word at `offset`.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `offset` must be a multiple of [`WORD_SIZE`] and lie at least one
    ///   word below the end of the region.
    /// - The region must still be mapped.
    /// - The word must not overlap the payload of an allocated block.
    #[inline]
    pub unsafe fn write_word(self, offset: usize, word: u64) {
        debug_assert_eq!(offset % WORD_SIZE, 0);
        debug_assert!(offset + WORD_SIZE <= self.extent, "word out of region");

        unsafe { self.with_offset(offset).cast::<u64>().as_ptr().write(word) };
    }
}
