//! A process-wide heap with C-style entry points.
//!
//! This module exposes one [`Heap`] backed by [`Mmap`] behind a spin lock,
//! through functions that report failure the way C allocators do: a null
//! pointer from [`alloc_mem`], and a negative status from [`init_mem`] and
//! [`free_mem`] (see [`Error::code`]).
//!
//! The heap can be initialized only once per process. A failed attempt that
//! did not map a region, such as a non-positive size or an exhausted address
//! space, may be retried.

use alloc::string::String;
use core::{fmt::Write, ptr};

use spin::Mutex;

use crate::{Error, Heap, Mmap};

static HEAP: Mutex<Heap<Mmap>> = Mutex::new(Heap::<Mmap>::new());

/// Converts a C-style signed size into a request size.
fn request_size(size: isize) -> Result<usize, Error> {
    match usize::try_from(size) {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(Error::InvalidSize),
    }
}

/// Initializes the process-wide heap with a region of at least `size` bytes.
///
/// Returns 0 on success and a negative [`Error::code`] on failure.
pub fn init_mem(size: isize) -> i32 {
    let res = request_size(size).and_then(|size| HEAP.lock().init(size));

    match res {
        Ok(()) => 0,
        Err(e) => {
            log::debug!("init_mem({size}): {e}");
            e.code()
        }
    }
}

/// Allocates `size` bytes from the process-wide heap.
///
/// Returns a pointer to the payload, aligned to 8 bytes, or null if `size` is
/// not positive, the heap is uninitialized, or no free block fits.
pub fn alloc_mem(size: isize) -> *mut u8 {
    request_size(size)
        .and_then(|size| HEAP.lock().allocate(size))
        .map_or(ptr::null_mut(), |block| block.cast::<u8>().as_ptr())
}

/// Frees a block allocated by [`alloc_mem`].
///
/// Returns 0 on success and a negative [`Error::code`] if `ptr` is null,
/// misaligned, or does not name an allocated block. Detection of double frees
/// and foreign pointers is best-effort; see [`Heap::deallocate`].
///
/// # Safety
///
/// `ptr` must be null or have been returned by [`alloc_mem`], and must not be
/// accessed after a successful call.
pub unsafe fn free_mem(ptr: *mut u8) -> i32 {
    match unsafe { HEAP.lock().deallocate(ptr) } {
        Ok(()) => 0,
        Err(e) => e.code(),
    }
}

/// Logs a table of every block in the process-wide heap at info level, one
/// record per line.
pub fn dump_mem() {
    let mut table = String::new();

    if let Err(e) = write!(table, "{}", HEAP.lock().dump()) {
        log::warn!("dump_mem: failed to render heap: {e}");
        return;
    }

    for line in table.lines() {
        log::info!("{line}");
    }
}

#[cfg(all(test, not(miri)))]
mod tests {
    extern crate std;

    use std::{
        string::{String, ToString},
        vec::Vec,
    };

    use super::*;

    /// Collects the records at info level and above emitted by this module.
    struct Capture(Mutex<Vec<String>>);

    impl log::Log for Capture {
        fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
            metadata.level() <= log::Level::Info
                && metadata.target() == concat!(env!("CARGO_PKG_NAME"), "::global")
        }

        fn log(&self, record: &log::Record<'_>) {
            if self.enabled(record.metadata()) {
                self.0.lock().push(std::format!("{}", record.args()));
            }
        }

        fn flush(&self) {}
    }

    static CAPTURE: Capture = Capture(Mutex::new(Vec::new()));

    #[test]
    fn request_sizes() {
        assert_eq!(request_size(1), Ok(1));
        assert_eq!(request_size(isize::MAX), Ok(isize::MAX as usize));
        assert_eq!(request_size(0), Err(Error::InvalidSize));
        assert_eq!(request_size(-5), Err(Error::InvalidSize));
    }

    // The process-wide heap is shared by every test in this binary, so its
    // whole lifecycle is exercised by this one test.
    #[test]
    fn process_heap_lifecycle() {
        log::set_logger(&CAPTURE).unwrap();
        log::set_max_level(log::LevelFilter::Info);

        assert!(alloc_mem(8).is_null());
        assert_eq!(unsafe { free_mem(8 as *mut u8) }, Error::Uninitialized.code());

        assert_eq!(init_mem(0), Error::InvalidSize.code());
        assert_eq!(init_mem(-1), Error::InvalidSize.code());
        assert_eq!(init_mem(4096), 0);
        assert_eq!(init_mem(4096), Error::AlreadyInitialized.code());

        assert!(alloc_mem(0).is_null());
        assert!(alloc_mem(-5).is_null());

        let a = alloc_mem(24);
        let b = alloc_mem(24);
        assert!(!a.is_null() && !b.is_null());
        assert_eq!(a as usize % 8, 0);

        // Rejected init calls log below info, so the dump is all that was
        // captured.
        dump_mem();
        let records = core::mem::take(&mut *CAPTURE.0.lock());
        let table = HEAP.lock().dump().to_string();
        let expected: Vec<String> = table.lines().map(String::from).collect();

        assert_eq!(records.len(), 1 + 3 + 3);
        assert_eq!(records, expected);
        assert!(records[0].starts_with("No."));
        assert!(records[0].ends_with("Size"));
        assert!(records[1].starts_with("1     Busy    Busy"));
        assert!(records[3].starts_with("3     Free    Busy"));
        assert_eq!(records[6], std::format!("Total size = {}", HEAP.lock().usable_len()));

        unsafe {
            assert_eq!(free_mem(ptr::null_mut()), Error::InvalidArgument.code());
            assert_eq!(free_mem(a.add(3)), Error::InvalidArgument.code());
            assert_eq!(free_mem(a), 0);
            assert_eq!(free_mem(a), Error::InvalidArgument.code());
            assert_eq!(free_mem(b), 0);
        }

        let heap = HEAP.lock();
        heap.validate().unwrap();
        assert_eq!(heap.blocks().count(), 1);
    }
}
