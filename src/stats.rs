//! A snapshot of the free list's shape, and the report printed from it.

use core::fmt;
use core::ops::Range;

use crate::blocklist::FreeList;

/// One run of the report's outer walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chain {
    /// Range of the block the chain starts at.
    pub head: Range<*const u8>,
    /// Every block visited by the inner walk, the head included.
    pub blocks: Vec<Range<*const u8>>,
    /// Sum of the sizes of `blocks`.
    pub size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stats {
    pub page_size: usize,
    pub chains: Vec<Chain>,
    /// Bytes sitting in the free list.
    pub unused: usize,
    /// Size of each free block, in whole pages, in list order.
    pub pages: Vec<usize>,
}

impl Stats {
    /// Walk `list` and collect a snapshot.
    ///
    /// The outer and inner walks share one cursor: the inner walk runs the
    /// cursor to the end of the list, so a non-empty list always yields exactly
    /// one chain.
    pub fn collect(list: &FreeList, page_size: usize) -> Stats {
        let mut chains = Vec::new();
        let mut unused: usize = 0;

        let mut cursor = list.iter().peekable();
        while let Some(head) = cursor.peek().map(|block| block.as_range()) {
            let mut chain = Chain {
                head,
                blocks: Vec::new(),
                size: 0,
            };
            for block in cursor.by_ref() {
                chain.blocks.push(block.as_range());
                chain.size = chain.size.wrapping_add(block.size());
            }
            unused = unused.wrapping_add(chain.size);
            chains.push(chain);
        }

        let pages = list.iter().map(|block| block.size() / page_size).collect();

        Stats {
            page_size,
            chains,
            unused,
            pages,
        }
    }

    pub fn chain_count(&self) -> usize {
        self.chains.len()
    }
}

// Print a block range with an inclusive end, the way the report has always
// shown it.
struct Span<'a>(&'a Range<*const u8>);

impl fmt::Display for Span<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:p}:{:p}", self.0.start, self.0.end.wrapping_sub(1))
    }
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "MeMS SYSTEM STATS")?;
        for chain in &self.chains {
            write!(f, "MAIN[{}]-> ", Span(&chain.head))?;
            for block in &chain.blocks {
                write!(f, "P[{}] <-> ", Span(block))?;
            }
            // The walk ends on a null cursor; the hole is measured from there.
            let end = core::ptr::null::<u8>();
            let hole = end..end.wrapping_add(chain.size);
            writeln!(f, "H[{}] <-> NULL", Span(&hole))?;
        }
        writeln!(f, "Pages used: {}", self.chain_count())?;
        writeln!(f, "Space unused: {}", self.unused)?;
        writeln!(f, "Main Chain Length: {}", self.chain_count())?;

        write!(f, "Sub-chain Length array: [")?;
        let mut start = true;
        for pages in &self.pages {
            if !start {
                write!(f, ", ")?;
            } else {
                start = false;
            }
            write!(f, "{}", pages)?;
        }
        writeln!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use core::ptr::NonNull;

    use test_env_log::test;

    use crate::blocklist::FreeBlock;

    const PAGE: usize = 64;

    fn list_of(scratch: &mut [usize], layout: &[(usize, usize)]) -> FreeList {
        let base = scratch.as_mut_ptr().cast::<u8>();
        let mut list = FreeList::default();
        // Push in reverse so the list reads in `layout` order.
        for &(page, pages) in layout.iter().rev() {
            let ptr = unsafe { NonNull::new_unchecked(base.add(page * PAGE)) };
            list.push_front(unsafe { FreeBlock::from_raw(ptr, pages * PAGE, None) });
        }
        list
    }

    #[test]
    fn test_empty_list() {
        let stats = Stats::collect(&FreeList::default(), PAGE);
        assert_eq!(stats.chain_count(), 0);
        assert_eq!(stats.unused, 0);
        assert!(stats.pages.is_empty());

        let report = stats.to_string();
        assert!(report.starts_with("MeMS SYSTEM STATS\n"));
        assert!(!report.contains("MAIN["));
        assert!(report.contains("Pages used: 0\n"));
        assert!(report.ends_with("Sub-chain Length array: []\n"));
    }

    #[test]
    fn test_one_chain_regardless_of_shape() {
        let mut scratch = vec![0usize; 8 * PAGE / core::mem::size_of::<usize>()];
        let list = list_of(&mut scratch, &[(5, 1), (0, 3), (3, 2)]);

        let stats = Stats::collect(&list, PAGE);
        assert_eq!(stats.chain_count(), 1);
        assert_eq!(stats.unused, 6 * PAGE);
        assert_eq!(stats.pages, vec![1, 3, 2]);

        let chain = &stats.chains[0];
        assert_eq!(chain.blocks.len(), 3);
        assert_eq!(chain.head, chain.blocks[0]);
        assert_eq!(chain.size, stats.unused);

        let report = stats.to_string();
        log::info!("{}", report);
        assert_eq!(report.matches("MAIN[").count(), 1);
        assert_eq!(report.matches("P[").count(), 3);
        assert!(report.contains("Space unused: 384\n"));
        assert!(report.contains("Main Chain Length: 1\n"));
        assert!(report.contains("Sub-chain Length array: [1, 3, 2]\n"));

        let hole = format!(
            "H[{:p}:{:p}] <-> NULL\n",
            core::ptr::null::<u8>(),
            core::ptr::null::<u8>().wrapping_add(6 * PAGE - 1)
        );
        assert!(report.contains(&hole));
    }

    #[test]
    fn test_span_end_is_inclusive() {
        let mut scratch = vec![0usize; PAGE / core::mem::size_of::<usize>()];
        let list = list_of(&mut scratch, &[(0, 1)]);
        let start = scratch.as_ptr() as *const u8;

        let report = Stats::collect(&list, PAGE).to_string();
        let expected = format!("P[{:p}:{:p}]", start, start.wrapping_add(PAGE - 1));
        assert!(report.contains(&expected));
    }
}
