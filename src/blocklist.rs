use core::fmt;
use core::ops::Range;
use core::ptr::{self, NonNull};

use static_assertions::const_assert;

/// The header for our free blocks.
///
/// The header includes the size of the current block (including the header)
/// and a link to the next free block. It is written into the first bytes of
/// the block it describes, so the list needs no memory of its own.
///
/// We use C representation so the header has the same layout as the
/// `{size, next}` pair any released region is reinterpreted as.
#[repr(C)]
pub struct FreeHeader {
    size: usize,
    next: Option<FreeBlock>,
}

/// Bytes at the front of every free block that belong to the list, not to the
/// caller.
pub const HEADER_SIZE: usize = core::mem::size_of::<FreeHeader>();
const_assert!(HEADER_SIZE == 2 * core::mem::size_of::<usize>());

impl FreeHeader {
    /// Write a header at `ptr`, with `size` bytes in the block and a link to
    /// `next`.
    ///
    /// Whatever was at `ptr` before is overwritten without being read.
    ///
    /// # Safety
    ///
    /// `ptr` must be aligned for `FreeHeader` and point to at least
    /// `HEADER_SIZE` bytes of writable memory not borrowed by anything else.
    pub unsafe fn write(ptr: NonNull<u8>, size: usize, next: Option<FreeBlock>) -> NonNull<FreeHeader> {
        let header: NonNull<FreeHeader> = ptr.cast();
        ptr::write(header.as_ptr(), FreeHeader { size, next });
        header
    }
}

/// A `FreeBlock` is a wrapper around a pointer to a freed block to be
/// maintained in a [`FreeList`](struct.FreeList.html).
///
/// Much like a `Box` without an allocator behind it: it doesn't implement
/// Clone or Drop, and ownership of the block moves with the value. A block
/// owns its successor through the `next` field of its header.
#[repr(transparent)]
pub struct FreeBlock {
    header: NonNull<FreeHeader>,
}

impl FreeBlock {
    /// Construct a `FreeBlock` from raw parts: a freed memory block at `ptr` of
    /// size `size`. This will also write the header appropriately.
    ///
    /// # Safety
    ///
    /// `ptr` must point to memory of size `size`, aligned for `FreeHeader`, and
    /// not in use by or accessible by any program logic.
    #[must_use]
    pub unsafe fn from_raw(ptr: NonNull<u8>, size: usize, next: Option<FreeBlock>) -> FreeBlock {
        if size < HEADER_SIZE {
            panic!(
                "Can't fit a {}-byte header in a block of {} bytes",
                HEADER_SIZE, size
            );
        }
        let header = FreeHeader::write(ptr, size, next);
        FreeBlock { header }
    }

    /// Treat the bytes already at `ptr` as a header.
    ///
    /// The size found there is kept as-is; only the link is cleared. Nothing
    /// checks that the size is sane: a region whose first bytes were overwritten
    /// comes back with whatever those bytes say.
    ///
    /// # Safety
    ///
    /// `ptr` must be aligned for `FreeHeader`, point to at least `HEADER_SIZE`
    /// writable bytes, and the memory must not be reachable by anything else
    /// once it is handed to a list. The list will trust the size it finds.
    #[must_use]
    pub unsafe fn reinterpret(ptr: NonNull<u8>) -> FreeBlock {
        let header: NonNull<FreeHeader> = ptr.cast();
        // The old link is garbage as far as we know; overwrite it unread.
        ptr::addr_of_mut!((*header.as_ptr()).next).write(None);
        FreeBlock { header }
    }

    /// The first byte of the block, where its header lives.
    pub fn as_ptr(&self) -> NonNull<u8> {
        self.header.cast()
    }

    /// Get the pointer range covered by this block.
    ///
    /// The range is computed with wrapping arithmetic, since a corrupted size
    /// can point anywhere.
    pub fn as_range(&self) -> Range<*const u8> {
        let start = self.header.as_ptr() as *const u8;
        start..start.wrapping_add(self.size())
    }

    /// The size of the block, in bytes.
    pub fn size(&self) -> usize {
        self.header_view().size
    }

    /// An immutable pointer to the header
    pub fn header_view(&self) -> &FreeHeader {
        unsafe { self.header.as_ref() }
    }

    /// Get a mutable view of the header.
    ///
    /// # Safety
    ///
    /// This method is unsafe because it allows modifying the size or pointer of
    /// a free block in safe code, which could lead to corruption.
    pub unsafe fn header_mut(&mut self) -> &mut FreeHeader {
        self.header.as_mut()
    }

    /// Get the next block over from this one.
    pub fn next(&self) -> Option<&Self> {
        self.header_view().next.as_ref()
    }

    /// Get the next block over from this one.
    fn next_mut(&mut self) -> Option<&mut Self> {
        unsafe { self.header_mut().next.as_mut() }
    }

    /// Remove the next, and return it
    #[must_use]
    fn take_next(&mut self) -> Option<Self> {
        unsafe { self.header_mut().next.take() }
    }

    /// Point this block at `next`. Whatever it pointed at before is dropped
    /// from the chain.
    fn set_next(&mut self, next: Option<FreeBlock>) {
        unsafe { self.header_mut().next = next }
    }

    /// Hand out the front `size` bytes of this block.
    ///
    /// Returns the handed-out region and whatever should take this block's
    /// place in the list: a remainder block covering the back part, or this
    /// block's old successor if nothing is left over. When the leftover is too
    /// small to hold a header, the whole block is handed out.
    ///
    /// The handed-out region keeps a header stamp carrying its own size and no
    /// link, so that it can be released without being told its size.
    ///
    /// Panics if the block is smaller than `size`.
    #[must_use]
    pub fn carve(mut self, size: usize) -> (Range<NonNull<u8>>, Option<FreeBlock>) {
        let own_size = self.size();
        if size > own_size {
            panic!(
                "Can't carve {} bytes out of a block of {} bytes",
                size, own_size
            );
        }

        let next = self.take_next();
        let start = self.as_ptr();

        let (taken, replacement) = if own_size - size >= HEADER_SIZE {
            let remainder = unsafe {
                let rest = NonNull::new_unchecked(start.as_ptr().add(size));
                FreeBlock::from_raw(rest, own_size - size, next)
            };
            log::debug!(
                "Split {} bytes off the front of {:p}:{}, leaving {} at {:p}",
                size,
                start,
                own_size,
                remainder.size(),
                remainder.as_ptr(),
            );
            (size, Some(remainder))
        } else {
            (own_size, next)
        };

        unsafe { self.header_mut().size = taken };
        let end = unsafe { NonNull::new_unchecked(start.as_ptr().wrapping_add(taken)) };
        (start..end, replacement)
    }
}

// A FreeBlock is sendable - as long as the whole "chain" is moved together,
// its fine. Nothing here is safe to share between threads, hence Send but not
// Sync.
unsafe impl Send for FreeBlock {}

/// A `FreeList` is a linked list of free blocks in memory.
///
/// Each block is "owned" by the list once inserted. Blocks are pushed at the
/// head (so the list is in LIFO order of release, not address order) and are
/// never merged with their neighbours, even when they touch.
#[derive(Default)]
pub struct FreeList {
    first: Option<FreeBlock>,
}

pub struct BlockIter<'list> {
    next: Option<&'list FreeBlock>,
}

impl<'list> Iterator for BlockIter<'list> {
    type Item = &'list FreeBlock;

    fn next(&mut self) -> Option<Self::Item> {
        let next = self.next.take()?;

        self.next = next.next();

        Some(next)
    }
}

impl<'list> IntoIterator for &'list FreeList {
    type Item = &'list FreeBlock;
    type IntoIter = BlockIter<'list>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl fmt::Display for FreeList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FreeList(")?;
        let mut start = true;
        for block in self {
            if !start {
                write!(f, ", ")?;
            } else {
                start = false;
            }
            write!(f, "FreeBlock({:?}, {})", block.header, block.size())?;
        }

        write!(f, ")")
    }
}

/// Validity contains a representation of all invalid states found in a
/// FreeList.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Validity {
    /// The list loops back on itself, usually from releasing the same region
    /// twice. Nothing else is checked when this is set.
    pub cyclic: bool,
    /// Number of blocks whose size is zero or not a whole number of pages.
    ///
    /// This happens when a region's header was overwritten before release.
    pub ragged: usize,
    /// Number of pairs of blocks claiming the same memory.
    pub overlaps: usize,
}

impl Validity {
    /// Returns a boolean - a simple check if all cases are clear
    pub fn is_valid(&self) -> bool {
        !self.cyclic && self.ragged == 0 && self.overlaps == 0
    }
}

impl From<Validity> for bool {
    fn from(v: Validity) -> bool {
        v.is_valid()
    }
}

/// State after a single "apply".
pub enum ApplyState<C, R> {
    // Keep going, and pass C into the next 'apply'
    Continue(C),
    // Finish iterating, and return Some(R)
    Finished(R),
    // Finish iterating, and return None
    Fail,
}

impl FreeList {
    pub fn iter(&self) -> BlockIter<'_> {
        BlockIter {
            next: self.first.as_ref(),
        }
    }

    /// The block at the head of the list, if any.
    pub fn first(&self) -> Option<&FreeBlock> {
        self.first.as_ref()
    }

    /// Iterate through the list, and apply a function at each step. This
    /// allows mutating the list as it is traversed, and replaces IterMut, which
    /// cannot be used due to the links between blocks.
    ///
    /// Note that any changes to any block's "next" will be followed at the next
    /// iteration.
    pub fn apply<C, R, F: FnMut(&mut FreeBlock, C) -> ApplyState<C, R>>(
        &mut self,
        start: C,
        mut pred: F,
    ) -> Option<R> {
        let mut next = self.first.as_mut();

        let mut state = start;
        while let Some(block) = next.take() {
            state = match pred(&mut *block, state) {
                ApplyState::Continue(c) => c,
                ApplyState::Finished(r) => return Some(r),
                ApplyState::Fail => return None,
            };
            next = block.next_mut()
        }

        None
    }

    /// Make `block` the new head of the list.
    pub fn push_front(&mut self, mut block: FreeBlock) {
        let old_first = self.first.take();
        block.set_next(old_first);
        self.first = Some(block);
    }

    /// Find the first block holding at least `size` bytes and carve `size`
    /// bytes off its front.
    ///
    /// Blocks are tried in list order and the first that fits wins. The
    /// remainder, if any, takes the carved block's place in the list. Returns
    /// None, leaving the list untouched, if no block is big enough.
    pub fn pop_fit(&mut self, size: usize) -> Option<Range<NonNull<u8>>> {
        let first_size = self.first.as_ref()?.size();
        if first_size >= size {
            log::debug!("  First block at {:p} holds {} bytes", self.first.as_ref()?.as_ptr(), size);
            let (range, replacement) = self.first.take()?.carve(size);
            self.first = replacement;
            return Some(range);
        }

        self.apply((), |previous, ()| {
            let next_size = match previous.next() {
                None => return ApplyState::Fail,
                Some(next) => next.size(),
            };

            if next_size < size {
                // This block is too small, skip it
                return ApplyState::Continue(());
            }

            let block = match previous.take_next() {
                None => return ApplyState::Fail,
                Some(block) => block,
            };
            log::debug!("  Block at {:p} of {} bytes fits", block.as_ptr(), next_size);
            let (range, replacement) = block.carve(size);
            previous.set_next(replacement);
            ApplyState::Finished(range)
        })
    }

    /// Look for structural damage: cycles, sizes that aren't whole pages, and
    /// blocks overlapping each other.
    ///
    /// Cycles are checked first with a two-speed walk, so this terminates even
    /// on a list that loops.
    pub fn validity(&self, page_size: usize) -> Validity {
        let mut validity = Validity::default();

        let mut slow = self.first.as_ref();
        let mut fast = self.first.as_ref();
        loop {
            fast = match fast.and_then(FreeBlock::next).and_then(FreeBlock::next) {
                None => break,
                Some(f) => Some(f),
            };
            slow = slow.and_then(FreeBlock::next);
            if let (Some(s), Some(f)) = (slow, fast) {
                if s.header == f.header {
                    validity.cyclic = true;
                    return validity;
                }
            }
        }

        let ranges: Vec<Range<*const u8>> = self.iter().map(FreeBlock::as_range).collect();
        for block in self.iter() {
            if block.size() == 0 || block.size() % page_size != 0 {
                validity.ragged += 1;
            }
        }
        for (i, a) in ranges.iter().enumerate() {
            for b in &ranges[i + 1..] {
                if a.start < b.end && b.start < a.end {
                    validity.overlaps += 1;
                }
            }
        }

        validity
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.first.is_none()
    }
}
