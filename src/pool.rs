//! The pool (fixed-size slot) allocator (spec §4.3).
//!
//! The region is carved into `count` equal slots at initialization, each
//! slot's first machine word doubling as an intrusive free-list `next`
//! pointer while the slot is unused. Alignment is implicit: the region base
//! is page/parent-aligned and every slot is a multiple of `block_size`.

use std::ffi::c_void;
use std::mem;

use crate::allocator::{AllocatorHandle, Source};

struct FreeSlot {
    next: *mut FreeSlot,
}

pub struct PoolAllocator {
    source: Option<Source>,
    region: *mut u8,
    capacity: usize,
    block_size: usize,
    free_list: *mut FreeSlot,
}

impl PoolAllocator {
    pub fn new() -> Self {
        Self { source: None, region: std::ptr::null_mut(), capacity: 0, block_size: 0, free_list: std::ptr::null_mut() }
    }

    pub fn initialize(&mut self, count: usize, block_size: usize) {
        assert!(
            block_size % mem::size_of::<usize>() == 0,
            "pool block size must be a multiple of the machine word size"
        );
        self.block_size = block_size;
        self.capacity = count * block_size;
        self.region = Source::Os.acquire(self.capacity, mem::align_of::<usize>());
        self.source = Some(Source::Os);
        self.carve_free_list(count);
    }

    pub fn initialize_with_parent(&mut self, count: usize, block_size: usize, parent: AllocatorHandle) {
        assert!(
            block_size % mem::size_of::<usize>() == 0,
            "pool block size must be a multiple of the machine word size"
        );
        self.block_size = block_size;
        self.capacity = count * block_size;
        self.region = Source::Parent(parent).acquire(self.capacity, mem::align_of::<usize>());
        self.source = Some(Source::Parent(parent));
        self.carve_free_list(count);
    }

    fn carve_free_list(&mut self, count: usize) {
        let mut previous: *mut FreeSlot = std::ptr::null_mut();
        for i in (0..count).rev() {
            let slot = unsafe { self.region.add(i * self.block_size) } as *mut FreeSlot;
            unsafe { (*slot).next = previous };
            previous = slot;
        }
        self.free_list = previous;
    }

    pub fn allocate(&mut self, bytes: usize, _alignment: usize) -> *mut u8 {
        assert!(bytes <= self.block_size, "requested allocation larger than the pool's block size");
        if self.free_list.is_null() {
            log::error!("pool allocator out of memory: capacity {}", self.capacity);
            panic!("pool allocator out of memory");
        }

        let address = self.free_list as *mut u8;
        self.free_list = unsafe { (*self.free_list).next };
        address
    }

    pub fn deallocate(&mut self, pointer: *mut u8) {
        let offset = pointer as usize - self.region as usize;
        let slot = unsafe { self.region.add(offset - (offset % self.block_size)) } as *mut FreeSlot;
        unsafe { (*slot).next = self.free_list };
        self.free_list = slot;
    }

    pub fn copy_from(&mut self, source: &PoolAllocator) {
        assert!(!std::ptr::eq(self, source), "attempted to copy a pool allocator into itself");
        assert!(!source.region.is_null(), "copying from an uninitialized pool allocator");

        self.finalize();
        let count = source.capacity / source.block_size;
        match source.source {
            Some(Source::Os) | None => self.initialize(count, source.block_size),
            Some(Source::Parent(parent)) => self.initialize_with_parent(count, source.block_size, parent),
        }
    }

    pub fn move_from(&mut self, source: &mut PoolAllocator) {
        assert!(!std::ptr::eq(self, source), "attempted to move a pool allocator into itself");

        self.finalize();
        self.source = source.source.take();
        self.region = source.region;
        self.capacity = source.capacity;
        self.block_size = source.block_size;
        self.free_list = source.free_list;

        source.region = std::ptr::null_mut();
        source.capacity = 0;
        source.block_size = 0;
        source.free_list = std::ptr::null_mut();
    }

    pub fn get_capacity(&self) -> usize {
        self.capacity
    }

    pub fn finalize(&mut self) {
        if let Some(source) = self.source.take() {
            source.release(self.region, self.capacity);
        }
        self.region = std::ptr::null_mut();
        self.capacity = 0;
        self.block_size = 0;
        self.free_list = std::ptr::null_mut();
    }

    pub fn get_allocator_info(&mut self) -> AllocatorHandle {
        AllocatorHandle::new(self as *mut PoolAllocator as *mut c_void, Self::allocate_trampoline, Self::deallocate_trampoline)
    }

    unsafe extern "C" fn allocate_trampoline(allocator: *mut c_void, bytes: usize, alignment: usize) -> *mut u8 {
        let this = unsafe { &mut *(allocator as *mut PoolAllocator) };
        this.allocate(bytes, alignment)
    }

    unsafe extern "C" fn deallocate_trampoline(allocator: *mut c_void, pointer: *mut u8) {
        let this = unsafe { &mut *(allocator as *mut PoolAllocator) };
        this.deallocate(pointer);
    }
}

impl Default for PoolAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PoolAllocator {
    fn drop(&mut self) {
        self.finalize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_and_deallocate_reuse_slots() {
        let mut pool = PoolAllocator::new();
        pool.initialize(10, 128);

        let a = pool.allocate(64, 8);
        let b = pool.allocate(100, 8);
        assert_ne!(a, b);

        pool.deallocate(a);
        let c = pool.allocate(10, 8);
        assert_eq!(c, a, "freed slot should be reused head-of-list");
    }

    #[test]
    #[should_panic(expected = "out of memory")]
    fn exhausting_the_pool_is_fatal() {
        let mut pool = PoolAllocator::new();
        pool.initialize(2, 128);
        let _a = pool.allocate(8, 8);
        let _b = pool.allocate(8, 8);
        let _c = pool.allocate(8, 8);
    }

    #[test]
    #[should_panic]
    fn requesting_more_than_block_size_is_fatal() {
        let mut pool = PoolAllocator::new();
        pool.initialize(4, 64);
        let _ = pool.allocate(65, 8);
    }

    #[test]
    fn deallocate_snaps_interior_pointer_to_slot_start() {
        let mut pool = PoolAllocator::new();
        pool.initialize(4, 64);
        let slot = pool.allocate(16, 8);

        // A pointer into the middle of a slot must still free the whole slot.
        let interior = unsafe { slot.add(20) };
        pool.deallocate(interior);

        let reused = pool.allocate(16, 8);
        assert_eq!(reused, slot);
    }
}
