use core::ptr::{self, NonNull};

use crate::{BackingAllocator, Sealed};

/// Anonymous memory mappings from the operating system.
///
/// Regions are private, read-write and zero-filled, and are unmapped when the
/// owning heap is dropped.
#[derive(Copy, Clone, Debug, Default)]
pub struct Mmap;

impl Sealed for Mmap {}

#[cfg_attr(docs_rs, doc(cfg(feature = "mmap")))]
impl BackingAllocator for Mmap {
    fn page_size(&self) -> usize {
        // SAFETY: `sysconf` has no preconditions.
        match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
            n if n > 0 => n as usize,
            _ => 4096,
        }
    }

    unsafe fn map(&self, len: usize) -> Option<NonNull<u8>> {
        // Memory protection. Read-Write only.
        let protection = libc::PROT_READ | libc::PROT_WRITE;

        // Private to this process and not backed by any file, which also
        // guarantees the pages read as zero.
        let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

        let address = unsafe { libc::mmap(ptr::null_mut(), len, protection, flags, -1, 0) };

        if address == libc::MAP_FAILED {
            return None;
        }

        NonNull::new(address.cast())
    }

    unsafe fn unmap(&self, ptr: NonNull<u8>, len: usize) {
        if unsafe { libc::munmap(ptr.as_ptr().cast(), len) } != 0 {
            log::warn!("munmap of {len} bytes at {ptr:p} failed; region leaked");
        }
    }
}
