//! The stack (bump) allocator (spec §4.2).
//!
//! State is just a region, its capacity, and a running offset. `allocate`
//! bumps the offset forward after padding for alignment; `deallocate` rolls
//! the offset back to a marker, silently ignoring any marker that isn't
//! less-or-equal to the current offset — this allocator is meant to be used
//! in a scoped, LIFO fashion, not as a general-purpose free list.

use std::ffi::c_void;
use std::mem;

use crate::allocator::{align_to_word, normalize_alignment, AllocatorHandle, Source};
use crate::os;

pub struct StackAllocator {
    source: Option<Source>,
    region: *mut u8,
    capacity: usize,
    offset: usize,
}

impl StackAllocator {
    pub fn new() -> Self {
        Self { source: None, region: std::ptr::null_mut(), capacity: 0, offset: 0 }
    }

    /// Reserves `bytes` from the OS, page-rounded. `capacity` tracks the
    /// actual page-rounded commit (not the raw request), so the full
    /// reserved region is usable rather than leaving the rounding tail
    /// committed but unreachable through `allocate`.
    pub fn initialize(&mut self, bytes: usize) {
        self.capacity = os::align_up_to_page(bytes);
        self.region = Source::Os.acquire(self.capacity, mem::align_of::<usize>());
        self.source = Some(Source::Os);
        self.offset = 0;
    }

    /// Reserves `bytes` from `parent` instead of the OS.
    pub fn initialize_with_parent(&mut self, bytes: usize, parent: AllocatorHandle) {
        self.capacity = bytes;
        self.region = Source::Parent(parent).acquire(bytes, mem::align_of::<usize>());
        self.source = Some(Source::Parent(parent));
        self.offset = 0;
    }

    pub fn allocate(&mut self, bytes: usize, alignment: usize) -> *mut u8 {
        assert!(bytes > 0, "invalid zero-byte allocation");
        let alignment = normalize_alignment(alignment);
        let bytes = align_to_word(bytes);

        let current = unsafe { self.region.add(self.offset) } as usize;
        let misalignment = current & (alignment - 1);
        let padding = if misalignment == 0 { 0 } else { alignment - misalignment };

        let new_offset = self.offset + padding + bytes;
        if new_offset > self.capacity {
            log::error!("stack allocator out of memory: requested {bytes} bytes, {} available", self.capacity - self.offset);
            panic!("stack allocator out of memory");
        }

        let result = unsafe { self.region.add(self.offset + padding) };
        self.offset = new_offset;
        result
    }

    /// Rolls the offset back to `marker` if `marker <= offset`; a marker
    /// past the current offset (out-of-LIFO-order) is silently ignored.
    pub fn deallocate(&mut self, marker: usize) {
        if marker <= self.offset {
            self.offset = marker;
        }
    }

    /// Rolls back to the marker a previously-returned pointer corresponds
    /// to — equivalent to `deallocate(pointer - region_base)`.
    pub fn deallocate_pointer(&mut self, pointer: *mut u8) {
        let marker = pointer as usize - self.region as usize;
        self.deallocate(marker);
    }

    pub fn copy_from(&mut self, source: &StackAllocator) {
        assert!(!std::ptr::eq(self, source), "attempted to copy a stack allocator into itself");
        assert!(!source.region.is_null(), "copying from an uninitialized stack allocator");

        self.finalize();
        match source.source {
            Some(Source::Os) | None => self.initialize(source.capacity),
            Some(Source::Parent(parent)) => self.initialize_with_parent(source.capacity, parent),
        }
    }

    pub fn move_from(&mut self, source: &mut StackAllocator) {
        assert!(!std::ptr::eq(self, source), "attempted to move a stack allocator into itself");

        self.finalize();
        self.source = source.source.take();
        self.region = source.region;
        self.capacity = source.capacity;
        self.offset = source.offset;

        source.region = std::ptr::null_mut();
        source.capacity = 0;
        source.offset = 0;
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
        self.offset = 0;
    }

    pub fn get_allocator_info(&mut self) -> AllocatorHandle {
        AllocatorHandle::new(self as *mut StackAllocator as *mut c_void, Self::allocate_trampoline, Self::deallocate_trampoline)
    }

    unsafe extern "C" fn allocate_trampoline(allocator: *mut c_void, bytes: usize, alignment: usize) -> *mut u8 {
        let this = unsafe { &mut *(allocator as *mut StackAllocator) };
        this.allocate(bytes, alignment)
    }

    unsafe extern "C" fn deallocate_trampoline(allocator: *mut c_void, pointer: *mut u8) {
        let this = unsafe { &mut *(allocator as *mut StackAllocator) };
        this.deallocate_pointer(pointer);
    }
}

impl Default for StackAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for StackAllocator {
    fn drop(&mut self) {
        self.finalize();
    }
}

/// Marker returned by the allocator's current offset, for scoped rollback:
/// `let mark = stack.mark(); ... ; stack.deallocate(mark);`
impl StackAllocator {
    pub fn mark(&self) -> usize {
        self.offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_bumps_and_respects_alignment() {
        let mut stack = StackAllocator::new();
        stack.initialize(4096);

        let a = stack.allocate(10, 8);
        let b = stack.allocate(20, 8);
        assert!((a as usize) < (b as usize));
        assert_eq!(b as usize % 8, 0);
    }

    #[test]
    fn marker_rollback_reuses_space() {
        // S6: allocate A=10, B=20, C=30; deallocate with marker at A's end;
        // a subsequent allocate(40,8) returns the address B occupied.
        let mut stack = StackAllocator::new();
        stack.initialize(4096);

        let _a = stack.allocate(10, 8);
        let marker_after_a = stack.mark();
        let b = stack.allocate(20, 8);
        let _c = stack.allocate(30, 8);

        stack.deallocate(marker_after_a);
        let reused = stack.allocate(40, 8);
        assert_eq!(reused, b);
    }

    #[test]
    fn out_of_order_marker_is_a_noop() {
        let mut stack = StackAllocator::new();
        stack.initialize(4096);
        let _a = stack.allocate(10, 8);
        let _b = stack.allocate(20, 8);
        let offset_before = stack.mark();

        // A marker past the current offset is a no-op, not an error.
        stack.deallocate(offset_before + 1000);
        assert_eq!(stack.mark(), offset_before);
    }

    #[test]
    fn composition_on_top_of_free_list_parent() {
        use crate::free_list::FreeListAllocator;

        let mut parent = FreeListAllocator::new();
        parent.initialize(crate::units::kib(64) as usize);

        let mut stack = StackAllocator::new();
        stack.initialize_with_parent(256, parent.get_allocator_info());
        let p = stack.allocate(64, 8);
        assert!(!p.is_null());

        stack.finalize();
        parent.finalize();
    }
}
