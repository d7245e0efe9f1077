//! Read-only inspection of a heap's blocks.
//!
//! [`Heap::blocks`] walks the implicit block list in address order,
//! [`Heap::stats`] sums it up, and [`Heap::dump`] renders it as a table:
//!
//! ```text
//! No.   Status  Prev    Begin               End                 Size
//! 1     Busy    Busy    0x00007f3a5c001008  0x00007f3a5c00102f  40
//! 2     Free    Busy    0x00007f3a5c001030  0x00007f3a5c001ff7  4040
//! ```
//!
//! None of these modify the heap.

use core::{fmt, iter::FusedIterator, marker::PhantomData, ptr::NonNull};

use crate::{
    base::BasePtr,
    heap::{end_mark, next_block, tag_at, FIRST_BLOCK},
    tag::HEADER_SIZE,
    BackingAllocator, Heap,
};

/// A snapshot of one block's header.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BlockInfo {
    /// One-based position of the block in address order.
    pub index: usize,
    /// Address of the first byte of the block's header.
    pub start: NonNull<u8>,
    /// Total size of the block in bytes, including its header and, if free,
    /// its footer.
    pub size: usize,
    /// Whether the block is allocated.
    pub allocated: bool,
    /// Whether the block immediately preceding this one is allocated.
    pub prev_allocated: bool,
}

impl BlockInfo {
    /// Returns the address of the last byte of the block.
    pub fn end(&self) -> *const u8 {
        self.start.as_ptr().wrapping_add(self.size - 1)
    }

    /// Returns the address of the block's payload.
    ///
    /// This is the address [`Heap::allocate`] returned for the block if it is
    /// allocated.
    pub fn payload(&self) -> NonNull<u8> {
        // SAFETY: every block is larger than its header.
        unsafe { NonNull::new_unchecked(self.start.as_ptr().add(HEADER_SIZE)) }
    }
}

/// An iterator over the blocks of a [`Heap`], in address order.
///
/// Created by [`Heap::blocks`].
#[derive(Clone, Debug)]
pub struct Blocks<'h> {
    base: Option<BasePtr>,
    next: usize,
    index: usize,
    _heap: PhantomData<&'h ()>,
}

impl<'h> Blocks<'h> {
    pub(crate) fn new(base: Option<BasePtr>) -> Blocks<'h> {
        Blocks {
            base,
            next: FIRST_BLOCK,
            index: 0,
            _heap: PhantomData,
        }
    }
}

impl Iterator for Blocks<'_> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<BlockInfo> {
        let base = self.base?;
        let end = end_mark(base);

        if self.next >= end {
            return None;
        }

        // SAFETY: `next` is the first block or was reached by adding block
        // sizes to it, and is below the end mark.
        let tag = unsafe { tag_at(base, self.next) };

        // A zero size would never advance; treat it as the end of the list.
        if tag.size == 0 {
            self.base = None;
            return None;
        }

        self.index += 1;

        let info = BlockInfo {
            index: self.index,
            start: base.with_offset(self.next),
            size: tag.size,
            allocated: tag.allocated,
            prev_allocated: tag.prev_allocated,
        };

        self.next = next_block(self.next, tag.size);

        Some(info)
    }
}

impl FusedIterator for Blocks<'_> {}

/// Aggregate statistics over a heap's blocks.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Total size of allocated blocks, including headers.
    pub busy: usize,
    /// Total size of free blocks, including headers and footers.
    pub free: usize,
    /// Number of allocated blocks.
    pub busy_blocks: usize,
    /// Number of free blocks.
    pub free_blocks: usize,
    /// Size of the largest free block.
    pub largest_free: usize,
}

impl HeapStats {
    pub(crate) fn collect(blocks: Blocks<'_>) -> HeapStats {
        blocks.fold(HeapStats::default(), |mut stats, block| {
            if block.allocated {
                stats.busy += block.size;
                stats.busy_blocks += 1;
            } else {
                stats.free += block.size;
                stats.free_blocks += 1;
                stats.largest_free = stats.largest_free.max(block.size);
            }

            stats
        })
    }

    /// Returns the total size of all blocks.
    pub fn total(&self) -> usize {
        self.busy + self.free
    }
}

/// A printable table of a heap's blocks.
///
/// Created by [`Heap::dump`].
pub struct Dump<'h, A: BackingAllocator> {
    heap: &'h Heap<A>,
}

impl<'h, A: BackingAllocator> Dump<'h, A> {
    pub(crate) fn new(heap: &'h Heap<A>) -> Dump<'h, A> {
        Dump { heap }
    }
}

fn status(allocated: bool) -> &'static str {
    if allocated {
        "Busy"
    } else {
        "Free"
    }
}

impl<A: BackingAllocator> fmt::Display for Dump<'_, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:<6}{:<8}{:<8}{:<20}{:<20}Size",
            "No.", "Status", "Prev", "Begin", "End"
        )?;

        for block in self.heap.blocks() {
            writeln!(
                f,
                "{:<6}{:<8}{:<8}{:<#20x}{:<#20x}{}",
                block.index,
                status(block.allocated),
                status(block.prev_allocated),
                block.start.as_ptr() as usize,
                block.end() as usize,
                block.size
            )?;
        }

        let stats = self.heap.stats();
        writeln!(f, "Total busy size = {}", stats.busy)?;
        writeln!(f, "Total free size = {}", stats.free)?;
        write!(f, "Total size = {}", stats.total())
    }
}

impl<A: BackingAllocator> fmt::Debug for Dump<'_, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dump").field("heap", self.heap).finish()
    }
}
