//! MeMS: a page-granular memory allocator on top of `mmap`.
//!
//! The allocator maps a single page when it starts (the arena), and from then
//! on hands out whole pages first-fit from a free list threaded through the
//! free memory itself. Requests the free list can't satisfy get a fresh
//! mapping of their own.
//!
//! ```no_run
//! use mems::MemAlloc;
//!
//! let mut mems = MemAlloc::new().expect("mmap failed");
//! let p = mems.allocate(1000).expect("mmap failed");
//! unsafe { mems.release(p.as_ptr()) };
//! mems.print_stats();
//! mems.teardown().expect("munmap failed");
//! ```
//!
//! Deliberately simple: free blocks are never merged, nothing is thread-safe,
//! and release believes whatever size it finds at the front of a region.

pub mod allocators;
pub mod blocklist;
pub mod stats;
#[cfg(unix)]
pub mod unix;

pub use allocators::{Arena, MemAlloc, PageSource, ToyPages, Unmapped, PAGE_SIZE};
pub use blocklist::{FreeList, Validity, HEADER_SIZE};
pub use stats::Stats;
#[cfg(unix)]
pub use unix::{LibcPages, MappingFailure};
