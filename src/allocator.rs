//! The allocator capability and the composition contract (spec §3, §4.1).
//!
//! `AllocatorHandle` is a small value type carrying an opaque allocator
//! pointer plus two function pointers — the same shape as the original
//! library's `AllocatorInfo` vtable-of-two. Any of [`crate::stack::StackAllocator`],
//! [`crate::pool::PoolAllocator`], or [`crate::free_list::FreeListAllocator`]
//! can hand one out, and any of them can be initialized against another's
//! handle instead of the OS, which is what makes them composable.

use std::ffi::c_void;
use std::mem;
use std::ptr::NonNull;

pub use crate::os::AllocError;
use crate::os;

type AllocateFn = unsafe extern "C" fn(*mut c_void, usize, usize) -> *mut u8;
type DeallocateFn = unsafe extern "C" fn(*mut c_void, *mut u8);

/// The allocator capability: handle plus allocate/deallocate entry points.
///
/// Ownership of the allocator behind the handle stays with whoever created
/// it; the handle is a non-owning capability, freely copyable, and valid for
/// as long as the owner hasn't been finalized.
#[derive(Clone, Copy)]
pub struct AllocatorHandle {
    allocator: *mut c_void,
    allocate_fn: AllocateFn,
    deallocate_fn: DeallocateFn,
}

impl AllocatorHandle {
    /// Builds a capability for `allocator`, dispatching through the two
    /// trampolines the concrete allocator type provides.
    pub fn new(allocator: *mut c_void, allocate_fn: AllocateFn, deallocate_fn: DeallocateFn) -> Self {
        Self { allocator, allocate_fn, deallocate_fn }
    }

    /// Requests `bytes` aligned to `alignment`. Fatal abort on failure —
    /// allocator misuse is a programming error per spec §7, not something
    /// this layer recovers from.
    pub fn allocate(&self, bytes: usize, alignment: usize) -> *mut u8 {
        unsafe { (self.allocate_fn)(self.allocator, bytes, alignment) }
    }

    /// Releases a pointer previously returned by [`Self::allocate`] on this
    /// same handle.
    pub fn deallocate(&self, pointer: *mut u8) {
        unsafe { (self.deallocate_fn)(self.allocator, pointer) }
    }

    /// The process-wide default capability, backed by the platform's
    /// aligned heap (`std::alloc::System`). Spec §3/§9 call for this as a
    /// convenience; per §9's stated preference we expose it as an explicit
    /// value rather than a lazily-initialized global, leaving the choice of
    /// whether to thread it or stash it in a `static` to the caller.
    pub fn system() -> Self {
        Self::new(std::ptr::null_mut(), system_allocate, system_deallocate)
    }
}

unsafe extern "C" fn system_allocate(_allocator: *mut c_void, bytes: usize, alignment: usize) -> *mut u8 {
    use std::alloc::{alloc, Layout};
    let layout = Layout::from_size_align(bytes, alignment).expect("invalid layout for system allocator");
    unsafe { alloc(layout) }
}

unsafe extern "C" fn system_deallocate(_allocator: *mut c_void, pointer: *mut u8) {
    // The system allocator needs the original layout to deallocate; since the
    // capability interface only carries a pointer, a global-allocator-backed
    // handle is only safe to mix with allocations it made itself and tracks
    // by other means. Non-test callers should prefer a region allocator.
    let _ = pointer;
    unreachable!(
        "AllocatorHandle::system() cannot deallocate without the original Layout; \
         wrap allocations with their size if you need to free through this handle"
    );
}

/// Rounds `alignment` up to the next power of two, with a floor of one
/// machine word — spec §4.1's alignment-normalization rule, applied before
/// every `allocate` call in this crate.
pub fn normalize_alignment(alignment: usize) -> usize {
    let word = mem::size_of::<usize>();
    let floor = alignment.max(word);
    if floor.is_power_of_two() {
        floor
    } else {
        floor.next_power_of_two()
    }
}

/// Rounds `bytes` up to the next multiple of the machine word size.
pub fn align_to_word(bytes: usize) -> usize {
    let word = mem::size_of::<usize>();
    (bytes + word - 1) & !(word - 1)
}

/// Where a region's bytes came from, and therefore how to give them back.
/// Every allocator in this crate is initialized against one of these two
/// sources (spec §3 "Region", §4.1), which is what lets a `PoolAllocator`
/// sit on top of a `FreeListAllocator` which itself sits on the OS.
#[derive(Clone, Copy)]
pub enum Source {
    Os,
    Parent(AllocatorHandle),
}

impl Source {
    /// Acquires `bytes` (already page-rounded by the caller for `Os`, raw
    /// for `Parent`) aligned to `alignment`. Fatal abort on failure per
    /// spec §7 — this is the boundary where "OS reservation failed" becomes
    /// a programming error rather than a `Result` the caller routes around.
    pub fn acquire(&self, bytes: usize, alignment: usize) -> *mut u8 {
        match self {
            Source::Os => match os::reserve(bytes) {
                Ok(region) => region.as_ptr(),
                Err(err) => {
                    log::error!("OS region reservation failed: {err}");
                    panic!("OS region reservation failed: {err}");
                }
            },
            Source::Parent(handle) => {
                let pointer = handle.allocate(bytes, alignment);
                if pointer.is_null() {
                    log::error!("parent allocator returned a null pointer for {bytes} bytes");
                    panic!("parent allocator returned a null pointer for {bytes} bytes");
                }
                pointer
            }
        }
    }

    /// Releases a region previously returned by [`Self::acquire`] with the
    /// same `bytes`.
    pub fn release(&self, region: *mut u8, bytes: usize) {
        match self {
            Source::Os => {
                if let Some(region) = NonNull::new(region) {
                    unsafe { os::release(region, bytes) };
                }
            }
            Source::Parent(handle) => handle.deallocate(region),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_alignment_floors_to_word_size() {
        let word = mem::size_of::<usize>();
        assert_eq!(normalize_alignment(1), word);
        assert_eq!(normalize_alignment(word), word);
    }

    #[test]
    fn normalize_alignment_rounds_non_power_of_two_up() {
        assert_eq!(normalize_alignment(3), 4.max(mem::size_of::<usize>()));
        assert_eq!(normalize_alignment(100), 128);
    }

    #[test]
    fn align_to_word_rounds_up() {
        let word = mem::size_of::<usize>();
        assert_eq!(align_to_word(1), word);
        assert_eq!(align_to_word(word + 1), word * 2);
    }
}
