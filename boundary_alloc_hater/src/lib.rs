#![deny(unsafe_op_in_unsafe_fn)]

use std::ptr::NonNull;

use alloc_hater::Subject;
use boundary_alloc::{Error, Global, Heap};

pub struct HeapSubject(Heap<Global>);

impl HeapSubject {
    pub fn new(region_size: usize) -> Result<Self, Error> {
        let h = Heap::try_new(region_size)?;
        Ok(HeapSubject(h))
    }
}

impl Subject for HeapSubject {
    type AllocError = Error;

    fn allocate(&mut self, size: usize) -> Result<NonNull<[u8]>, Self::AllocError> {
        self.0.allocate(size)
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>) {
        unsafe { self.0.deallocate(ptr.as_ptr()) }.expect("live block was rejected by free");
    }

    fn is_consistent(&self) -> bool {
        self.0.validate().is_ok()
    }
}
