//! OS-page reservation wrapper.
//!
//! An OS-backed allocator reserves a page-granular region with a single
//! `mmap` and releases it with a matching `munmap`, the POSIX analogue of
//! the original library's `VirtualAlloc`/`VirtualFree` pair. The teacher
//! crate reaches for `libc` the same way (`sbrk` there, `mmap` here) rather
//! than hand-rolling a syscall wrapper.

use std::ptr::NonNull;

use libc::{c_void, MAP_ANONYMOUS, MAP_FAILED, MAP_PRIVATE, PROT_READ, PROT_WRITE};
use thiserror::Error;

/// The one genuinely fallible mechanism in this crate: everything built on
/// top of it (`FreeListAllocator::initialize`, `StackAllocator::initialize`,
/// `PoolAllocator::initialize`) treats a reservation failure as fatal per
/// spec, but the mechanism itself reports it as a `Result` so the boundary
/// between "can fail" and "must not fail here" stays visible in the types.
#[derive(Debug, Error)]
pub enum AllocError {
    #[error("OS page reservation failed for {bytes} bytes")]
    ReservationFailed { bytes: usize },
}

/// Fixed reference page size per spec §6. Real platforms are queried via
/// `sysconf` when available and this constant is only the fallback.
pub const FALLBACK_PAGE_SIZE: usize = 4096;

/// The page size this process' allocator reservations round up to.
pub fn page_size() -> usize {
    let queried = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if queried > 0 {
        queried as usize
    } else {
        FALLBACK_PAGE_SIZE
    }
}

/// Rounds `bytes` up to the next multiple of the OS page size.
pub fn align_up_to_page(bytes: usize) -> usize {
    let page = page_size();
    (bytes + page - 1) & !(page - 1)
}

/// Reserves and commits `align_up_to_page(bytes)` bytes of read-write,
/// zero-initialized, anonymous memory.
pub fn reserve(bytes: usize) -> Result<NonNull<u8>, AllocError> {
    let committed = align_up_to_page(bytes);
    let region = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            committed,
            PROT_READ | PROT_WRITE,
            MAP_PRIVATE | MAP_ANONYMOUS,
            -1,
            0,
        )
    };

    if region == MAP_FAILED {
        return Err(AllocError::ReservationFailed { bytes: committed });
    }

    NonNull::new(region as *mut u8).ok_or(AllocError::ReservationFailed { bytes: committed })
}

/// Releases a region previously returned by [`reserve`]. `bytes` must be the
/// *requested* size that was passed to `reserve`; the release rounds it up
/// to the page size the same way `reserve` committed it.
///
/// # Safety
/// `region` must be a pointer returned by [`reserve`] with the same `bytes`,
/// not yet released.
pub unsafe fn release(region: NonNull<u8>, bytes: usize) {
    let committed = align_up_to_page(bytes);
    unsafe {
        libc::munmap(region.as_ptr() as *mut c_void, committed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_a_power_of_two() {
        let page = page_size();
        assert!(page > 0 && (page & (page - 1)) == 0);
    }

    #[test]
    fn align_up_to_page_rounds_up() {
        let page = page_size();
        assert_eq!(align_up_to_page(1), page);
        assert_eq!(align_up_to_page(page), page);
        assert_eq!(align_up_to_page(page + 1), page * 2);
    }

    #[test]
    fn reserve_then_release_round_trips() {
        let region = reserve(10 * 1024).expect("reservation should succeed");
        unsafe {
            region.as_ptr().write(0xAB);
            assert_eq!(region.as_ptr().read(), 0xAB);
            release(region, 10 * 1024);
        }
    }
}
