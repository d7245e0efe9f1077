//! The heap: initialization, best-fit allocation, and coalescing free.
//!
//! The region is laid out as one padding word, a sequence of blocks, and a
//! one-word end mark. Blocks are addressed by their offset from the region
//! base; the first block sits at offset [`PAD_SIZE`] and the end mark at
//! `region_len - END_MARK_SIZE`.

use core::{fmt, ptr::NonNull};

use sptr::Strict;

use crate::{
    base::BasePtr,
    dump::{Blocks, Dump, HeapStats},
    tag::{
        self, BlockTag, END_MARK, END_MARK_SIZE, FOOTER_SIZE, HEADER_SIZE, MIN_BLOCK_SIZE,
        PAD_SIZE, WORD_SIZE,
    },
    BackingAllocator, Error,
};

#[cfg(any(feature = "alloc", test))]
use crate::Global;
#[cfg(all(unix, feature = "mmap"))]
use crate::Mmap;

/// Offset of the first block's header.
pub(crate) const FIRST_BLOCK: usize = PAD_SIZE;

enum State {
    Uninitialized,
    Ready { base: BasePtr },
}

/// A best-fit, boundary-tag heap over a single region.
///
/// A `Heap` starts out uninitialized. [`init`](Heap::init) obtains the region
/// from the backing allocator exactly once; the region is returned to the
/// backing allocator when the heap is dropped.
pub struct Heap<A: BackingAllocator> {
    state: State,
    backing_allocator: A,
}

// SAFETY: the heap exclusively owns its region, so moving it to another thread
// moves all access to the region along with it.
unsafe impl<A: BackingAllocator + Send> Send for Heap<A> {}

#[cfg(any(feature = "alloc", test))]
impl Heap<Global> {
    /// Creates an uninitialized heap backed by the global allocator.
    pub const fn new() -> Heap<Global> {
        Heap::new_in(Global)
    }

    /// Creates a heap backed by the global allocator and initializes it with a
    /// region of at least `size` bytes.
    ///
    /// # Errors
    ///
    /// See [`Heap::init`].
    #[cfg_attr(docs_rs, doc(cfg(feature = "alloc")))]
    pub fn try_new(size: usize) -> Result<Heap<Global>, Error> {
        let mut heap = Self::new();
        heap.init(size)?;
        Ok(heap)
    }
}

#[cfg(any(feature = "alloc", test))]
impl Default for Heap<Global> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(unix, feature = "mmap"))]
impl Heap<Mmap> {
    /// Creates an uninitialized heap backed by anonymous OS mappings.
    #[cfg_attr(docs_rs, doc(cfg(feature = "mmap")))]
    pub const fn new() -> Heap<Mmap> {
        Heap::new_in(Mmap)
    }
}

impl<A> Heap<A>
where
    A: BackingAllocator,
{
    /// Creates an uninitialized heap that will obtain its region from
    /// `backing_allocator`.
    ///
    /// Use `Heap::new_in(Mmap)` for a heap over memory mapped from the
    /// operating system.
    pub const fn new_in(backing_allocator: A) -> Heap<A> {
        Heap {
            state: State::Uninitialized,
            backing_allocator,
        }
    }

    /// Returns `true` if the heap owns a region.
    pub fn is_initialized(&self) -> bool {
        matches!(self.state, State::Ready { .. })
    }

    /// Returns the size of the region in bytes, or zero if the heap is
    /// uninitialized.
    pub fn region_len(&self) -> usize {
        self.base().map_or(0, BasePtr::extent)
    }

    /// Returns the number of bytes covered by blocks, excluding the leading
    /// padding and the end mark.
    pub fn usable_len(&self) -> usize {
        self.region_len()
            .saturating_sub(PAD_SIZE + END_MARK_SIZE)
    }

    #[inline]
    pub(crate) fn base(&self) -> Option<BasePtr> {
        match self.state {
            State::Uninitialized => None,
            State::Ready { base } => Some(base),
        }
    }

    /// Initializes the heap with a region of at least `size` bytes.
    ///
    /// `size` is rounded up to a multiple of the backing allocator's page size.
    /// The whole region except the leading padding and the end mark becomes a
    /// single free block.
    ///
    /// # Errors
    ///
    /// Returns `Err` if any of the following are true:
    /// - The heap is already initialized ([`Error::AlreadyInitialized`]). The
    ///   existing region is left untouched.
    /// - `size` is zero or cannot be rounded to a page multiple
    ///   ([`Error::InvalidSize`]).
    /// - The backing allocator cannot provide the region
    ///   ([`Error::OutOfMemory`]). The heap stays uninitialized and `init`
    ///   may be retried.
    pub fn init(&mut self, size: usize) -> Result<(), Error> {
        if self.is_initialized() {
            log::debug!("heap already initialized; ignoring init({size})");
            return Err(Error::AlreadyInitialized);
        }

        if size == 0 {
            return Err(Error::InvalidSize);
        }

        let page_size = self.backing_allocator.page_size();
        let len = tag::round_up(size, page_size).ok_or(Error::InvalidSize)?;

        // SAFETY: `len` is a nonzero multiple of the page size.
        let region = unsafe { self.backing_allocator.map(len) }.ok_or_else(|| {
            log::debug!("backing allocator failed to map {len} bytes");
            Error::OutOfMemory
        })?;

        let base = match BasePtr::new(region, len) {
            Some(b) => b,
            None => {
                // SAFETY: `region` was mapped just above with length `len` and
                // nothing else refers to it.
                unsafe { self.backing_allocator.unmap(region, len) };
                return Err(Error::OutOfMemory);
            }
        };

        let first_size = len - PAD_SIZE - END_MARK_SIZE;
        let first = BlockTag::free(first_size, true);
        let end_mark = len - END_MARK_SIZE;

        // SAFETY: the region is freshly mapped and at least one page long, so
        // the first block's header and footer and the end mark are in bounds.
        unsafe {
            base.write_word(FIRST_BLOCK, first.encode());
            base.write_word(FIRST_BLOCK + first_size - FOOTER_SIZE, first.footer());
            base.write_word(end_mark, END_MARK);
        }

        log::debug!(
            "mapped {len}-byte heap at {:#x} with {first_size} usable bytes",
            base.addr().get()
        );

        self.state = State::Ready { base };

        Ok(())
    }

    /// Allocates a block with a payload of at least `size` bytes.
    ///
    /// The smallest free block that fits is chosen, preferring the lowest
    /// address among equally sized candidates. If it is larger than needed,
    /// its tail is split off as a new free block.
    ///
    /// The returned slice starts at the payload, which is always aligned to
    /// [`WORD_SIZE`], and is `size` bytes long.
    ///
    /// # Errors
    ///
    /// Returns `Err` if any of the following are true:
    /// - `size` is zero ([`Error::InvalidSize`]).
    /// - No free block is large enough ([`Error::OutOfMemory`]).
    /// - The heap is uninitialized ([`Error::Uninitialized`]).
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<[u8]>, Error> {
        let base = self.base().ok_or(Error::Uninitialized)?;

        if size == 0 {
            return Err(Error::InvalidSize);
        }

        let Some(required) = tag::block_size_for(size) else {
            log::debug!("allocation of {size} bytes overflows block size");
            return Err(Error::OutOfMemory);
        };

        let Some((block, found)) = best_fit(base, required) else {
            log::debug!("no free block holds {required} bytes");
            return Err(Error::OutOfMemory);
        };

        let remainder = found.size - required;

        // SAFETY: `block` was reached by walking the block list, and every
        // offset written below lies within the chosen free block or is the
        // header of its successor.
        unsafe {
            if remainder >= MIN_BLOCK_SIZE {
                let tail = next_block(block, required);
                let tail_tag = BlockTag::free(remainder, true);

                let head = BlockTag::allocated(required, found.prev_allocated);
                base.write_word(block, head.encode());
                base.write_word(tail, tail_tag.encode());
                base.write_word(tail + remainder - FOOTER_SIZE, tail_tag.footer());

                log::trace!(
                    "split {}-byte block at {block:#x}, {remainder} bytes left free",
                    found.size
                );
            } else {
                // A remainder too small to hold a header and a footer stays
                // with the allocation.
                let whole = BlockTag::allocated(found.size, found.prev_allocated);
                base.write_word(block, whole.encode());

                let next = next_block(block, found.size);
                if next != end_mark(base) {
                    let next_tag = tag_at(base, next);
                    base.write_word(next, next_tag.with_prev_allocated(true).encode());
                }

                log::trace!("allocated whole {}-byte block at {block:#x}", found.size);
            }
        }

        let payload = base.with_offset(block + HEADER_SIZE);

        Ok(NonNull::slice_from_raw_parts(payload, size))
    }

    /// Deallocates the block whose payload starts at `ptr`.
    ///
    /// The block is merged with the free blocks immediately below and above
    /// it, if any.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `ptr` is null, not aligned to
    /// [`WORD_SIZE`], outside the region, or its header is not marked
    /// allocated, and [`Error::Uninitialized`] if the heap is uninitialized.
    /// The heap is not modified in either case.
    ///
    /// These checks are best-effort: a second free of the same pointer is
    /// rejected only while no later allocation has reused the block, and a
    /// pointer into the middle of a payload is rejected only if the word
    /// preceding it does not happen to look like an allocated header.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or have been returned by [`allocate`] on this heap.
    /// After a successful call, the payload must no longer be accessed.
    ///
    /// [`allocate`]: Heap::allocate
    pub unsafe fn deallocate(&mut self, ptr: *mut u8) -> Result<(), Error> {
        let base = self.base().ok_or(Error::Uninitialized)?;

        let block = block_of(base, ptr).map_err(|reason| {
            log::debug!("rejected free of {ptr:p}: {reason}");
            Error::InvalidArgument
        })?;

        // SAFETY: `block_of` verified that `block` holds an allocated header
        // whose extent lies within the block list.
        unsafe {
            let freed = tag_at(base, block);

            let mut start = block;
            let mut size = freed.size;
            let mut prev_allocated = freed.prev_allocated;

            if !prev_allocated {
                let (prev, prev_tag) = prev_block(base, block);
                start = prev;
                size += prev_tag.size;
                prev_allocated = prev_tag.prev_allocated;
            }

            let next = next_block(block, freed.size);
            if next != end_mark(base) {
                let next_tag = tag_at(base, next);

                if next_tag.allocated {
                    base.write_word(next, next_tag.with_prev_allocated(false).encode());
                } else {
                    size += next_tag.size;
                }
            }

            // The footer goes at the tail of the fully merged block.
            let merged = BlockTag::free(size, prev_allocated);
            base.write_word(start, merged.encode());
            base.write_word(start + size - FOOTER_SIZE, merged.footer());

            log::trace!("freed block at {block:#x}; free block at {start:#x} now {size} bytes");
        }

        Ok(())
    }

    /// Returns an iterator over the blocks of the heap in address order.
    ///
    /// The iterator is empty if the heap is uninitialized.
    pub fn blocks(&self) -> Blocks<'_> {
        Blocks::new(self.base())
    }

    /// Returns aggregate statistics over all blocks.
    pub fn stats(&self) -> HeapStats {
        HeapStats::collect(self.blocks())
    }

    /// Returns a printable table of every block.
    pub fn dump(&self) -> Dump<'_, A> {
        Dump::new(self)
    }

    /// Walks the heap and verifies its structural invariants.
    ///
    /// The following are checked:
    /// - Every block size is a multiple of [`WORD_SIZE`] no smaller than
    ///   [`MIN_BLOCK_SIZE`].
    /// - The blocks tile the region exactly, ending at the end mark.
    /// - Every free block's footer matches its header.
    /// - Every previous-allocated bit matches the block below it.
    /// - No two adjacent blocks are both free.
    ///
    /// # Errors
    ///
    /// Returns the first violation found, in address order.
    pub fn validate(&self) -> Result<(), Corruption> {
        let Some(base) = self.base() else {
            return Ok(());
        };

        let end = end_mark(base);
        let mut ofs = FIRST_BLOCK;
        let mut prev_allocated = true;

        while ofs < end {
            // SAFETY: `ofs` is word-aligned and below the end mark.
            let tag = unsafe { tag_at(base, ofs) };

            if tag.size < MIN_BLOCK_SIZE || tag.size % WORD_SIZE != 0 {
                return Err(Corruption::new(ofs, CorruptionKind::BadSize));
            }

            if tag.size > end - ofs {
                return Err(Corruption::new(ofs, CorruptionKind::Overrun));
            }

            if tag.prev_allocated != prev_allocated {
                return Err(Corruption::new(ofs, CorruptionKind::StalePrevBit));
            }

            if !tag.allocated {
                if !prev_allocated {
                    return Err(Corruption::new(ofs, CorruptionKind::Uncoalesced));
                }

                // SAFETY: the block was checked to end at or below the end mark.
                let footer = unsafe { base.read_word(ofs + tag.size - FOOTER_SIZE) };
                if footer != tag.footer() {
                    return Err(Corruption::new(ofs, CorruptionKind::FooterMismatch));
                }
            }

            prev_allocated = tag.allocated;
            ofs = next_block(ofs, tag.size);
        }

        // SAFETY: the end mark is the last word of the region.
        if unsafe { base.read_word(end) } != END_MARK {
            return Err(Corruption::new(end, CorruptionKind::MissingEndMark));
        }

        Ok(())
    }
}

// Block navigation ============================================================

/// Returns the offset of the end mark.
#[inline]
pub(crate) fn end_mark(base: BasePtr) -> usize {
    base.extent() - END_MARK_SIZE
}

/// Reads the header of the block at `block`.
///
/// # Safety
///
/// `block` must be the offset of a block header or the end mark in the region
/// named by `base`.
#[inline]
pub(crate) unsafe fn tag_at(base: BasePtr, block: usize) -> BlockTag {
    BlockTag::decode(unsafe { base.read_word(block) })
}

/// Returns the offset of the block following the `size`-byte block at `block`.
#[inline]
pub(crate) fn next_block(block: usize, size: usize) -> usize {
    debug_assert!(size != 0, "stepped past the end mark");

    block + size
}

/// Returns the offset and header of the free block preceding `block`.
///
/// # Safety
///
/// The block at `block` must have its previous-allocated bit clear, so that the
/// word below it is the footer of a free block.
#[inline]
unsafe fn prev_block(base: BasePtr, block: usize) -> (usize, BlockTag) {
    debug_assert!(block > FIRST_BLOCK, "first block has no predecessor");

    let prev_size = unsafe { base.read_word(block - FOOTER_SIZE) } as usize;
    let prev = block - prev_size;
    let prev_tag = unsafe { tag_at(base, prev) };

    debug_assert!(!prev_tag.allocated && prev_tag.size == prev_size);

    (prev, prev_tag)
}

/// Finds the smallest free block of at least `required` bytes.
///
/// Among equally sized candidates, the one at the lowest address wins.
fn best_fit(base: BasePtr, required: usize) -> Option<(usize, BlockTag)> {
    let end = end_mark(base);
    let mut best: Option<(usize, BlockTag)> = None;
    let mut ofs = FIRST_BLOCK;

    while ofs < end {
        // SAFETY: `ofs` starts at the first block and advances by block sizes,
        // which tile the region up to the end mark.
        let tag = unsafe { tag_at(base, ofs) };

        if !tag.allocated && tag.size >= required && best.map_or(true, |(_, b)| tag.size < b.size)
        {
            best = Some((ofs, tag));

            // Nothing can beat an exact fit.
            if tag.size == required {
                break;
            }
        }

        ofs = next_block(ofs, tag.size);
    }

    best
}

/// Maps a payload pointer to the offset of its block header.
fn block_of(base: BasePtr, ptr: *mut u8) -> Result<usize, &'static str> {
    if ptr.is_null() {
        return Err("null pointer");
    }

    if ptr.addr() % WORD_SIZE != 0 {
        return Err("misaligned pointer");
    }

    let end = end_mark(base);
    let payload = base
        .offset_of(ptr)
        .filter(|&ofs| ofs >= FIRST_BLOCK + HEADER_SIZE && ofs < end)
        .ok_or("pointer outside heap")?;

    let block = payload - HEADER_SIZE;

    // SAFETY: `block` is word-aligned and lies between the first block and the
    // end mark.
    let tag = unsafe { tag_at(base, block) };

    if !tag.allocated {
        return Err("block is not allocated");
    }

    if tag.size < MIN_BLOCK_SIZE || tag.size % WORD_SIZE != 0 || tag.size > end - block {
        return Err("header is not a block header");
    }

    if block == FIRST_BLOCK && !tag.prev_allocated {
        return Err("header is not a block header");
    }

    Ok(block)
}

impl<A> Drop for Heap<A>
where
    A: BackingAllocator,
{
    fn drop(&mut self) {
        if let Some(base) = self.base() {
            // SAFETY: the region was mapped by `init` with this extent and is
            // owned by the heap, which is going away.
            unsafe { self.backing_allocator.unmap(base.ptr(), base.extent()) };
        }
    }
}

impl<A> fmt::Debug for Heap<A>
where
    A: BackingAllocator,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("base", &self.base().map(BasePtr::ptr))
            .field("region_len", &self.region_len())
            .finish()
    }
}

/// A structural invariant violation found by [`Heap::validate`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Corruption {
    /// Offset from the region base of the offending block.
    pub offset: usize,
    /// What was wrong with it.
    pub kind: CorruptionKind,
}

impl Corruption {
    fn new(offset: usize, kind: CorruptionKind) -> Corruption {
        Corruption { offset, kind }
    }
}

/// The kind of a [`Corruption`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CorruptionKind {
    /// The block size is too small or not a multiple of the word size.
    BadSize,
    /// The block extends past the end mark.
    Overrun,
    /// A free block's footer does not match its header.
    FooterMismatch,
    /// The previous-allocated bit disagrees with the preceding block.
    StalePrevBit,
    /// The block and its predecessor are both free.
    Uncoalesced,
    /// The word at the top of the region is not the end mark.
    MissingEndMark,
}

impl fmt::Display for Corruption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = match self.kind {
            CorruptionKind::BadSize => "invalid block size",
            CorruptionKind::Overrun => "block overruns end mark",
            CorruptionKind::FooterMismatch => "footer does not match header",
            CorruptionKind::StalePrevBit => "stale previous-allocated bit",
            CorruptionKind::Uncoalesced => "adjacent free blocks",
            CorruptionKind::MissingEndMark => "missing end mark",
        };

        write!(f, "{what} at offset {:#x}", self.offset)
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::{vec, vec::Vec};

    use super::*;
    use crate::BlockInfo;

    const PAGE: usize = 4096;

    /// Size and free status of each block, in address order.
    fn layout(heap: &Heap<Global>) -> Vec<(usize, bool, bool)> {
        heap.blocks()
            .map(|b| (b.size, b.allocated, b.prev_allocated))
            .collect()
    }

    fn alloc(heap: &mut Heap<Global>, size: usize) -> *mut u8 {
        let ptr = heap.allocate(size).unwrap().cast::<u8>().as_ptr();
        heap.validate().unwrap();
        ptr
    }

    fn free(heap: &mut Heap<Global>, ptr: *mut u8) {
        unsafe { heap.deallocate(ptr).unwrap() };
        heap.validate().unwrap();
    }

    #[test]
    fn init_creates_one_free_block() {
        let heap = Heap::try_new(1).unwrap();

        assert_eq!(heap.region_len(), PAGE);
        assert_eq!(heap.usable_len(), PAGE - 16);
        assert_eq!(layout(&heap), vec![(PAGE - 16, false, true)]);
        heap.validate().unwrap();
    }

    #[test]
    fn init_rounds_up_to_pages() {
        let heap = Heap::try_new(PAGE + 1).unwrap();
        assert_eq!(heap.region_len(), 2 * PAGE);

        let heap = Heap::try_new(2 * PAGE).unwrap();
        assert_eq!(heap.region_len(), 2 * PAGE);
    }

    #[test]
    fn init_rejects_bad_sizes() {
        let mut heap = Heap::<Global>::new();

        assert_eq!(heap.init(0), Err(Error::InvalidSize));
        assert_eq!(heap.init(usize::MAX), Err(Error::InvalidSize));
        assert!(!heap.is_initialized());

        // A failed init leaves the heap free to try again.
        heap.init(PAGE).unwrap();
        assert!(heap.is_initialized());
    }

    #[test]
    fn init_only_once() {
        let mut heap = Heap::try_new(PAGE).unwrap();
        let a = alloc(&mut heap, 100);
        unsafe { a.write_bytes(0xAB, 100) };

        let before = layout(&heap);
        assert_eq!(heap.init(8 * PAGE), Err(Error::AlreadyInitialized));
        assert_eq!(heap.region_len(), PAGE);
        assert_eq!(layout(&heap), before);
        assert!((0..100).all(|i| unsafe { *a.add(i) } == 0xAB));

        free(&mut heap, a);
    }

    #[test]
    fn uninitialized_heap_rejects_everything() {
        let mut heap = Heap::<Global>::new();

        assert_eq!(heap.allocate(8).unwrap_err(), Error::Uninitialized);
        assert_eq!(
            unsafe { heap.deallocate(8 as *mut u8) },
            Err(Error::Uninitialized)
        );
        assert_eq!(heap.blocks().count(), 0);
        heap.validate().unwrap();
    }

    #[test]
    fn allocate_rejects_zero() {
        let mut heap = Heap::try_new(PAGE).unwrap();
        assert_eq!(heap.allocate(0).unwrap_err(), Error::InvalidSize);
        assert_eq!(layout(&heap), vec![(PAGE - 16, false, true)]);
    }

    #[test]
    fn allocate_too_large() {
        let mut heap = Heap::try_new(PAGE).unwrap();

        assert_eq!(heap.allocate(PAGE).unwrap_err(), Error::OutOfMemory);
        assert_eq!(heap.allocate(usize::MAX).unwrap_err(), Error::OutOfMemory);

        // The whole usable region is exactly one block.
        let a = alloc(&mut heap, PAGE - 16 - HEADER_SIZE);
        assert_eq!(layout(&heap), vec![(PAGE - 16, true, true)]);
        assert_eq!(heap.allocate(1).unwrap_err(), Error::OutOfMemory);
        free(&mut heap, a);
    }

    #[test]
    fn payloads_are_word_aligned_and_past_header() {
        let mut heap = Heap::try_new(PAGE).unwrap();
        let base = heap.base().unwrap().addr().get();

        let a = alloc(&mut heap, 3);
        let b = alloc(&mut heap, 13);

        assert_eq!(a as usize % WORD_SIZE, 0);
        assert_eq!(b as usize % WORD_SIZE, 0);
        assert_eq!(a as usize, base + FIRST_BLOCK + HEADER_SIZE);
        assert_eq!(b as usize, a as usize + 16);
    }

    #[test]
    fn allocation_splits_free_block() {
        let mut heap = Heap::try_new(PAGE).unwrap();

        alloc(&mut heap, 32);

        assert_eq!(
            layout(&heap),
            vec![(40, true, true), (PAGE - 16 - 40, false, true)]
        );
    }

    /// Carves `[a:40][guard:16][c:24][guard:16][tail]` and frees `a` and `c`.
    fn two_holes(heap: &mut Heap<Global>) -> (*mut u8, *mut u8) {
        let a = alloc(heap, 32);
        alloc(heap, 8);
        let c = alloc(heap, 16);
        alloc(heap, 8);

        free(heap, a);
        free(heap, c);

        (a, c)
    }

    #[test]
    fn best_fit_prefers_smallest_block() {
        let mut heap = Heap::try_new(PAGE).unwrap();
        let (_, c) = two_holes(&mut heap);

        // Fits both holes and the tail; only the 24-byte hole is a best fit.
        assert_eq!(alloc(&mut heap, 16), c);
    }

    #[test]
    fn best_fit_ties_go_to_lowest_address() {
        let mut heap = Heap::try_new(PAGE).unwrap();

        let a = alloc(&mut heap, 16);
        alloc(&mut heap, 8);
        let c = alloc(&mut heap, 16);
        alloc(&mut heap, 8);
        free(&mut heap, c);
        free(&mut heap, a);

        assert_eq!(alloc(&mut heap, 16), a);
        assert_eq!(alloc(&mut heap, 16), c);
    }

    #[test]
    fn exact_fit_does_not_split() {
        let mut heap = Heap::try_new(PAGE).unwrap();
        let (_, c) = two_holes(&mut heap);
        let before = heap.blocks().count();

        assert_eq!(alloc(&mut heap, 16), c);

        let blocks: Vec<BlockInfo> = heap.blocks().collect();
        assert_eq!(blocks.len(), before);
        assert_eq!((blocks[2].size, blocks[2].allocated), (24, true));
        // The guard above the reused block sees an allocated predecessor again.
        assert!(blocks[3].prev_allocated);
    }

    /// Carves `[a:40][guard:16][tail]` and frees `a`.
    fn one_hole(heap: &mut Heap<Global>) -> *mut u8 {
        let a = alloc(heap, 32);
        alloc(heap, 8);
        free(heap, a);
        a
    }

    #[test]
    fn smaller_request_splits_with_correct_bits() {
        let mut heap = Heap::try_new(PAGE).unwrap();
        let a = one_hole(&mut heap);

        // 24 of the 40-byte hole, leaving a 16-byte free block.
        assert_eq!(alloc(&mut heap, 16), a);

        let blocks = layout(&heap);
        assert_eq!(blocks[0], (24, true, true));
        assert_eq!(blocks[1], (16, false, true));
        // The guard still sits above a free block.
        assert_eq!(blocks[2], (16, true, false));
    }

    #[test]
    fn undersized_remainder_stays_with_allocation() {
        let mut heap = Heap::try_new(PAGE).unwrap();
        let a = one_hole(&mut heap);

        // 32 of the 40-byte hole would leave 8 bytes, too few for a free block.
        assert_eq!(alloc(&mut heap, 24), a);

        let blocks = layout(&heap);
        assert_eq!(blocks[0], (40, true, true));
        assert_eq!(blocks[1], (16, true, true));
    }

    #[test]
    fn free_rejects_invalid_pointers() {
        let mut heap = Heap::try_new(PAGE).unwrap();
        let a = alloc(&mut heap, 32);
        let before = layout(&heap);

        unsafe {
            assert_eq!(heap.deallocate(core::ptr::null_mut()), Err(Error::InvalidArgument));
            assert_eq!(heap.deallocate(a.add(1)), Err(Error::InvalidArgument));
            assert_eq!(heap.deallocate(a.add(4)), Err(Error::InvalidArgument));

            // Aligned, but the word before it is zeroed payload.
            assert_eq!(heap.deallocate(a.add(8)), Err(Error::InvalidArgument));

            let mut outside = 0u64;
            let outside = &mut outside as *mut u64 as *mut u8;
            assert_eq!(heap.deallocate(outside), Err(Error::InvalidArgument));

            // The word before the first block's header is padding.
            let pad = heap.base().unwrap().with_offset(HEADER_SIZE).as_ptr();
            assert_eq!(heap.deallocate(pad), Err(Error::InvalidArgument));
        }

        assert_eq!(layout(&heap), before);
    }

    #[test]
    fn double_free_is_rejected() {
        let mut heap = Heap::try_new(PAGE).unwrap();
        let a = alloc(&mut heap, 32);
        alloc(&mut heap, 32);

        free(&mut heap, a);
        let before = layout(&heap);

        assert_eq!(unsafe { heap.deallocate(a) }, Err(Error::InvalidArgument));
        assert_eq!(layout(&heap), before);
    }

    #[test]
    fn allocate_then_free_restores_layout() {
        let mut heap = Heap::try_new(PAGE).unwrap();
        let (_, _) = two_holes(&mut heap);
        let before = layout(&heap);

        for size in [1, 8, 16, 24, 32, 100, 1000] {
            let p = alloc(&mut heap, size);
            free(&mut heap, p);
            assert_eq!(layout(&heap), before, "size {size}");
        }
    }

    #[test]
    fn free_coalesces_middle_left_right() {
        let mut heap = Heap::try_new(PAGE).unwrap();

        let x = alloc(&mut heap, 32);
        let y = alloc(&mut heap, 32);
        let z = alloc(&mut heap, 32);
        alloc(&mut heap, 8);
        let tail = PAGE - 16 - 3 * 40 - 16;

        free(&mut heap, y);
        assert_eq!(
            layout(&heap),
            vec![
                (40, true, true),
                (40, false, true),
                (40, true, false),
                (16, true, true),
                (tail, false, true),
            ]
        );

        free(&mut heap, x);
        assert_eq!(
            layout(&heap),
            vec![
                (80, false, true),
                (40, true, false),
                (16, true, true),
                (tail, false, true),
            ]
        );

        free(&mut heap, z);
        assert_eq!(
            layout(&heap),
            vec![(120, false, true), (16, true, false), (tail, false, true)]
        );
    }

    #[test]
    fn free_coalesces_in_any_order() {
        const ORDERS: [[usize; 3]; 6] = [
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ];

        for order in ORDERS {
            let mut heap = Heap::try_new(PAGE).unwrap();
            let ptrs = [alloc(&mut heap, 32), alloc(&mut heap, 48), alloc(&mut heap, 64)];
            alloc(&mut heap, 8);

            for i in order {
                free(&mut heap, ptrs[i]);
            }

            let blocks = layout(&heap);
            assert_eq!(blocks[0], (40 + 56 + 72, false, true), "order {order:?}");
            assert_eq!(blocks[1], (16, true, false), "order {order:?}");
        }
    }

    #[test]
    fn freeing_everything_restores_initial_block() {
        let mut heap = Heap::try_new(PAGE).unwrap();
        let initial = layout(&heap);

        let ptrs: Vec<_> = (1..=20).map(|i| alloc(&mut heap, i * 7)).collect();
        for p in ptrs.into_iter().rev().step_by(2) {
            free(&mut heap, p);
        }

        let rest: Vec<_> = heap
            .blocks()
            .filter(|b| b.allocated)
            .map(|b| b.payload().as_ptr())
            .collect();
        for p in rest {
            free(&mut heap, p);
        }

        assert_eq!(layout(&heap), initial);
    }

    #[test]
    fn validate_reports_corruption() {
        let mut heap = Heap::try_new(PAGE).unwrap();
        let a = alloc(&mut heap, 32);
        let base = heap.base().unwrap();

        // Clear the allocated bit behind the heap's back.
        unsafe { a.cast::<u64>().sub(1).write(40 | 0b10) };

        assert_eq!(
            heap.validate(),
            Err(Corruption {
                offset: FIRST_BLOCK,
                kind: CorruptionKind::FooterMismatch,
            })
        );

        unsafe { base.write_word(FIRST_BLOCK, BlockTag::allocated(40, true).encode()) };
        heap.validate().unwrap();
    }
}
