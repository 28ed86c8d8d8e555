//! # rallocator - composable region allocators
//!
//! This crate provides a small family of allocators that manage their own
//! backing memory instead of going through the global heap: a best-fit
//! [`free_list::FreeListAllocator`] backed by a size-indexed red-black tree,
//! a LIFO [`stack::StackAllocator`], and a fixed-slot [`pool::PoolAllocator`].
//!
//! ## Overview
//!
//! Every allocator here owns a single contiguous region, reserved either
//! straight from the OS (`initialize`) or carved out of another allocator
//! (`initialize_with_parent`). The latter is what makes them composable:
//!
//! ```text
//!   OS mmap
//!     └── FreeListAllocator (best-fit, coalescing)
//!           └── PoolAllocator (fixed 128-byte slots)
//!                 └── StackAllocator (scoped, LIFO)
//! ```
//!
//! A [`allocator::AllocatorHandle`] is the capability each allocator hands
//! out to be used as another allocator's parent — a pointer plus two
//! function pointers, not an owning reference.
//!
//! ## The free list allocator
//!
//! [`free_list::FreeListAllocator`] is the one with real bookkeeping. Free
//! blocks are tracked in a red-black tree keyed by size (best-fit, ties go
//! right), and every block — free or reserved — carries a 24-byte
//! [`header::PackedHeader`] packing five 36-bit region-relative offsets
//! (parent, left, right, previous, size) plus its color/free/next-set flags:
//!
//! ```text
//!   ┌────────────────────────┬──────────────────────────────────┐
//!   │   PackedHeader (24B)   │           User Data               │
//!   └────────────────────────┴──────────────────────────────────┘
//!                            ▲
//!                            └── Pointer returned to the caller
//! ```
//!
//! Adjacent free blocks are coalesced eagerly on every deallocation, and an
//! over-aligned allocation shifts its header forward in place, crediting the
//! padding to whichever physical neighbor can absorb it.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use rallocator::free_list::FreeListAllocator;
//!
//! let mut allocator = FreeListAllocator::new();
//! allocator.initialize(10 * 1024);
//!
//! let ptr = allocator.allocate(256, 8);
//! allocator.deallocate(ptr);
//! allocator.finalize();
//! ```
//!
//! ## Error handling
//!
//! Misuse at these allocators' public boundary (out of memory, an oversized
//! request, a foreign pointer) is a programming error, not a recoverable
//! condition, and is reported by panicking after a `log::error!` line. The
//! one exception is the OS reservation itself: [`os::reserve`] is the single
//! genuinely fallible primitive in the crate and reports failure through
//! [`os::AllocError`] before the allocators above it convert it into a panic.
//!
//! ## Crate structure
//!
//! ```text
//!   rallocator
//!   ├── allocator   - AllocatorHandle capability, Source, alignment helpers
//!   ├── os          - mmap/munmap region reservation
//!   ├── header      - packed red-black node header
//!   ├── tree        - the size-indexed red-black tree
//!   ├── free_list   - FreeListAllocator
//!   ├── stack       - StackAllocator
//!   ├── pool        - PoolAllocator
//!   └── units       - byte-size literal helpers (kib, mib, ...)
//! ```

pub mod allocator;
pub mod free_list;
pub mod header;
pub mod os;
pub mod pool;
pub mod stack;
pub mod tree;
pub mod units;

pub use allocator::{AllocError, AllocatorHandle};
pub use free_list::FreeListAllocator;
pub use pool::PoolAllocator;
pub use stack::StackAllocator;
