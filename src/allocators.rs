//! The allocator itself, and where it gets its pages from.
//!
//! ## Basic Types
//!
//! ### [`MemAlloc`](struct.MemAlloc.html)
//!
//! A `MemAlloc` is a single-threaded, page-granular allocator. It maps one
//! page up front (its [`Arena`](struct.Arena.html)), hands out page-multiple
//! regions first-fit from a [`FreeList`](../blocklist/struct.FreeList.html),
//! and maps fresh regions when nothing in the list is big enough.
//!
//! ### [`PageSource`](trait.PageSource.html)
//!
//! `PageSource` is a simple trait interface meant to abstract over the calls to
//! the OS to map and unmap pages.
//!
//! ### [`ToyPages`](struct.ToyPages.html)
//!
//! `ToyPages` is a buffer that can pretend to be the OS, and implements
//! `PageSource` for such a purpose. It is mainly useful for testing.

use core::fmt;
use core::ptr::NonNull;

use static_assertions::const_assert;

use crate::blocklist::{FreeBlock, FreeHeader, FreeList, Validity, HEADER_SIZE};
use crate::stats::Stats;
#[cfg(unix)]
use crate::unix::{LibcPages, MappingFailure};

/// Page size used unless a page source says otherwise.
pub const PAGE_SIZE: usize = 4096;
const_assert!(PAGE_SIZE % HEADER_SIZE == 0);

// Round value up to the nearest multiple of increment. Nothing is smaller than
// one increment. None if the rounded value doesn't fit in a usize.
fn round_up(value: usize, increment: usize) -> Option<usize> {
    if value == 0 {
        return Some(increment);
    }
    value
        .checked_add(increment - 1)
        .map(|v| v / increment * increment)
}

pub trait PageSource {
    type Err;

    /// Granularity of every region the allocator deals in.
    fn page_size(&self) -> usize;

    /// Map `len` bytes of zero-filled, readable and writable memory.
    ///
    /// # Safety
    ///
    /// The memory returned must be available and untracked by any other rust
    /// code, including the allocator itself, and aligned at least for a
    /// free-block header.
    unsafe fn map(&mut self, len: usize) -> Result<NonNull<u8>, Self::Err>;

    /// Give back a mapping made by `map`.
    ///
    /// # Safety
    ///
    /// `ptr` and `len` must describe exactly one earlier mapping, and nothing
    /// may touch that memory afterwards.
    unsafe fn unmap(&mut self, ptr: NonNull<u8>, len: usize) -> Result<(), Self::Err>;
}

/// The one mapping made when the allocator starts up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arena {
    base: NonNull<u8>,
    size: usize,
}

impl Arena {
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether `ptr` falls inside the arena. Regions mapped on overflow never
    /// do.
    pub fn contains(&self, ptr: *const u8) -> bool {
        let start = self.base.as_ptr() as *const u8;
        start <= ptr && ptr < start.wrapping_add(self.size)
    }
}

// The arena is plain bookkeeping; moving it between threads is fine.
unsafe impl Send for Arena {}

/// What teardown gave back to the OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unmapped {
    pub base: *const u8,
    pub len: usize,
}

impl fmt::Display for Unmapped {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Unmapped: {} bytes at {:p}", self.len, self.base)
    }
}

/// A page-granular, first-fit allocator over memory-mapped pages.
///
/// Released regions go to the front of the free list and are never merged
/// with their neighbours. The allocator keeps no record of what it has handed
/// out: a region remembers its own size in its first `HEADER_SIZE` bytes, and
/// release trusts whatever is there.
///
/// Regions mapped because the free list came up short are not part of the
/// arena, and teardown never unmaps them.
pub struct MemAlloc<S> {
    source: S,
    arena: Arena,
    blocks: FreeList,
}

#[cfg(unix)]
impl MemAlloc<LibcPages> {
    /// Start an allocator on `mmap`ed 4096-byte pages.
    pub fn new() -> Result<Self, MappingFailure> {
        MemAlloc::initialize(LibcPages::default())
    }
}

impl<S: PageSource> MemAlloc<S> {
    /// Map one page from `source` and make it the first free block.
    pub fn initialize(mut source: S) -> Result<Self, S::Err> {
        let size = source.page_size();
        let base = unsafe { source.map(size)? };
        let first = unsafe { FreeBlock::from_raw(base, size, None) };

        let mut blocks = FreeList::default();
        blocks.push_front(first);
        log::debug!("Arena: {} bytes at {:p}", size, base);

        Ok(MemAlloc {
            source,
            arena: Arena { base, size },
            blocks,
        })
    }

    pub fn page_size(&self) -> usize {
        self.source.page_size()
    }

    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    pub fn free_list(&self) -> &FreeList {
        &self.blocks
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Bytes of memory backing a request for `requested` bytes: the next
    /// whole number of pages, and never less than one. None when that many
    /// pages can't be counted in a usize.
    pub fn block_size(&self, requested: usize) -> Option<usize> {
        round_up(requested, self.page_size())
    }

    /// Allocate a region of at least `requested` bytes.
    ///
    /// The first free block big enough is used, split if it is larger than
    /// needed. If there is none, a fresh region is mapped from the source; the
    /// free list is untouched in that case, including on error.
    pub fn allocate(&mut self, requested: usize) -> Result<NonNull<u8>, S::Err> {
        let size = match self.block_size(requested) {
            Some(size) => size,
            None => {
                // No block in the list can be this big; let the source refuse it.
                log::debug!("  {} bytes don't round to whole pages, mapping as-is", requested);
                return self.map_fresh(requested);
            }
        };
        log::debug!("Allocating {} bytes for a request of {}", size, requested);

        let range = match self.blocks.pop_fit(size) {
            Some(range) => range,
            None => {
                log::debug!("  No free block holds {} bytes, mapping a fresh region", size);
                return self.map_fresh(size);
            }
        };

        let len = range.end.as_ptr() as usize - range.start.as_ptr() as usize;
        log::info!("Allocated: {} bytes at {:p}", len, range.start);
        Ok(range.start)
    }

    // A region of its own, outside the arena and the free list.
    fn map_fresh(&mut self, size: usize) -> Result<NonNull<u8>, S::Err> {
        let ptr = unsafe { self.source.map(size)? };
        unsafe { FreeHeader::write(ptr, size, None) };

        log::info!("Allocated: {} bytes at {:p}", size, ptr);
        Ok(ptr)
    }

    /// Put the region at `ptr` back at the front of the free list. Null is
    /// ignored.
    ///
    /// The region's size is read from its first bytes. If the caller wrote over
    /// them, the list now holds a block of whatever size they spell.
    ///
    /// # Safety
    ///
    /// `ptr` must be null, or point to `HEADER_SIZE` writable bytes aligned for
    /// a free-block header (any pointer returned by `allocate` is), which the
    /// caller will not touch again. Releasing the same region twice, or memory
    /// this allocator never handed out, corrupts the list.
    pub unsafe fn release(&mut self, ptr: *mut u8) {
        let ptr = match NonNull::new(ptr) {
            None => return,
            Some(p) => p,
        };

        let block = FreeBlock::reinterpret(ptr);
        let size = block.size();
        self.blocks.push_front(block);

        log::info!("Freed: {} bytes at {:p}", size, ptr);
    }

    /// Virtual and physical addresses are one and the same here.
    pub fn translate<T>(&self, ptr: *mut T) -> *mut T {
        ptr
    }

    /// Take a snapshot of the free list.
    pub fn stats(&self) -> Stats {
        Stats::collect(&self.blocks, self.page_size())
    }

    /// Print the free list report to standard output.
    pub fn print_stats(&self) {
        print!("{}", self.stats());
    }

    /// Check the free list for damage left by misuse of `release`.
    pub fn validity(&self) -> Validity {
        self.blocks.validity(self.page_size())
    }

    /// Unmap the arena, and only the arena, and print what was unmapped.
    pub fn teardown(mut self) -> Result<Unmapped, S::Err> {
        let Arena { base, size } = self.arena;
        unsafe { self.source.unmap(base, size)? };

        let unmapped = Unmapped {
            base: base.as_ptr(),
            len: size,
        };
        println!("{}", unmapped);
        Ok(unmapped)
    }
}

/// A heap buffer playing the part of the OS.
///
/// Mappings are bump-allocated out of the buffer and never reused, so every one
/// comes back zero-filled.
pub struct ToyPages {
    pub page_size: usize,
    /// Bytes handed out so far.
    pub size: usize,
    /// Bytes given back through `unmap`.
    pub unmapped: usize,
    heap: Vec<usize>,
}

impl Default for ToyPages {
    fn default() -> Self {
        ToyPages::new(64, 256 * 1024)
    }
}

impl ToyPages {
    /// A toy OS with `capacity` bytes of memory, in pages of `page_size`.
    ///
    /// Panics if `page_size` can't hold a free-block header.
    pub fn new(page_size: usize, capacity: usize) -> Self {
        assert!(
            page_size >= HEADER_SIZE && page_size % HEADER_SIZE == 0,
            "page size {} must be a multiple of {}",
            page_size,
            HEADER_SIZE
        );
        let word = core::mem::size_of::<usize>();
        let words = capacity / word + usize::from(capacity % word != 0);
        ToyPages {
            page_size,
            size: 0,
            unmapped: 0,
            heap: vec![0; words],
        }
    }

    pub fn capacity(&self) -> usize {
        self.heap.len() * core::mem::size_of::<usize>()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToyPagesExhausted {
    pub requested: usize,
    pub available: usize,
}

impl fmt::Display for ToyPagesExhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "toy pages exhausted: asked for {} bytes, {} left",
            self.requested, self.available
        )
    }
}

impl std::error::Error for ToyPagesExhausted {}

impl PageSource for ToyPages {
    type Err = ToyPagesExhausted;

    fn page_size(&self) -> usize {
        self.page_size
    }

    unsafe fn map(&mut self, len: usize) -> Result<NonNull<u8>, Self::Err> {
        let available = self.capacity() - self.size;
        let allocating = match round_up(len, self.page_size) {
            Some(allocating) if allocating <= available => allocating,
            rounded => {
                return Err(ToyPagesExhausted {
                    requested: rounded.unwrap_or(len),
                    available,
                })
            }
        };

        let ptr = self.heap.as_mut_ptr().cast::<u8>().add(self.size);
        self.size += allocating;
        Ok(NonNull::new_unchecked(ptr))
    }

    unsafe fn unmap(&mut self, _ptr: NonNull<u8>, len: usize) -> Result<(), Self::Err> {
        self.unmapped += len;
        Ok(())
    }
}
