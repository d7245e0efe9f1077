//! Block header and footer encoding.
//!
//! A block's size is always a multiple of 8, which leaves the two low bits of
//! the size word free to carry status:
//!
//! ```text
//!   63                                      3   2   1   0
//!   ┌──────────────────────────────────────────┬───┬───┬───┐
//!   │                  size                    │ 0 │ p │ a │
//!   └──────────────────────────────────────────┴───┴───┴───┘
//!     a = this block is allocated
//!     p = the block immediately below this one is allocated
//! ```
//!
//! Footers hold the bare size with both status bits clear.

/// Size in bytes of a tag word.
pub const WORD_SIZE: usize = 8;

/// Size in bytes of a block header.
pub const HEADER_SIZE: usize = WORD_SIZE;

/// Size in bytes of a free block's footer.
pub const FOOTER_SIZE: usize = WORD_SIZE;

/// Bytes reserved at the start of the region ahead of the first block.
pub const PAD_SIZE: usize = WORD_SIZE;

/// Size in bytes of the end mark at the top of the region.
pub const END_MARK_SIZE: usize = WORD_SIZE;

/// The smallest block that can be free: a header and a footer.
pub const MIN_BLOCK_SIZE: usize = HEADER_SIZE + FOOTER_SIZE;

/// The raw status word of the end mark: size 0, allocated.
pub(crate) const END_MARK: u64 = ALLOCATED;

const ALLOCATED: u64 = 0b01;
const PREV_ALLOCATED: u64 = 0b10;
const STATUS_MASK: u64 = ALLOCATED | PREV_ALLOCATED;

/// The decoded contents of a block header.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct BlockTag {
    /// Total size of the block in bytes, including its header.
    pub size: usize,
    /// Whether this block is allocated.
    pub allocated: bool,
    /// Whether the block immediately preceding this one is allocated.
    pub prev_allocated: bool,
}

impl BlockTag {
    #[inline]
    pub const fn free(size: usize, prev_allocated: bool) -> BlockTag {
        BlockTag {
            size,
            allocated: false,
            prev_allocated,
        }
    }

    #[inline]
    pub const fn allocated(size: usize, prev_allocated: bool) -> BlockTag {
        BlockTag {
            size,
            allocated: true,
            prev_allocated,
        }
    }

    /// Decodes a header word.
    #[inline]
    pub fn decode(raw: u64) -> BlockTag {
        BlockTag {
            size: (raw & !STATUS_MASK) as usize,
            allocated: raw & ALLOCATED != 0,
            prev_allocated: raw & PREV_ALLOCATED != 0,
        }
    }

    /// Encodes `self` as a header word.
    #[inline]
    pub fn encode(self) -> u64 {
        debug_assert_eq!(self.size % WORD_SIZE, 0, "unaligned block size");

        let mut raw = self.size as u64;
        if self.allocated {
            raw |= ALLOCATED;
        }
        if self.prev_allocated {
            raw |= PREV_ALLOCATED;
        }

        raw
    }

    /// Encodes `self` as a footer word.
    #[inline]
    pub fn footer(self) -> u64 {
        debug_assert_eq!(self.size % WORD_SIZE, 0, "unaligned block size");

        self.size as u64
    }

    #[inline]
    pub fn with_prev_allocated(self, prev_allocated: bool) -> BlockTag {
        BlockTag {
            prev_allocated,
            ..self
        }
    }
}

/// Returns the total block size needed to hold a payload of `len` bytes.
///
/// Returns `None` if `len` is zero or the result would overflow.
#[inline]
pub(crate) fn block_size_for(len: usize) -> Option<usize> {
    if len == 0 {
        return None;
    }

    let size = round_up(len.checked_add(HEADER_SIZE)?, WORD_SIZE)?;

    Some(size.max(MIN_BLOCK_SIZE))
}

/// Rounds `value` up to the next multiple of `align`, a power of two.
#[inline]
pub(crate) fn round_up(value: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two());

    Some(value.checked_add(align - 1)? & !(align - 1))
}
