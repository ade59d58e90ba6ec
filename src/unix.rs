//! Pages of virtual memory straight from the Unix OS, via `mmap`.

use core::fmt;
use core::ptr::{null_mut, NonNull};

use errno::Errno;

use crate::allocators::{PageSource, PAGE_SIZE};
use crate::blocklist::HEADER_SIZE;

/// The OS refused to map (or unmap) memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingFailure {
    /// The call that failed, `mmap` or `munmap`.
    pub call: &'static str,
    /// Bytes asked for.
    pub len: usize,
    pub errno: Errno,
}

impl MappingFailure {
    fn last(call: &'static str, len: usize) -> Self {
        MappingFailure {
            call,
            len,
            errno: errno::errno(),
        }
    }
}

impl fmt::Display for MappingFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} of {} bytes failed: {}", self.call, self.len, self.errno)
    }
}

impl std::error::Error for MappingFailure {}

/// LibcPages uses libc to map anonymous pages upon request.
pub struct LibcPages {
    page_size: usize,
    // Just for tracking, not really needed
    pages: usize,
    mappings: usize,
}

impl Default for LibcPages {
    /// Pages of the fixed `PAGE_SIZE`, whatever the OS uses.
    fn default() -> Self {
        LibcPages::with_page_size(PAGE_SIZE)
    }
}

impl LibcPages {
    /// Use the OS's own page size.
    pub fn system() -> Self {
        LibcPages::with_page_size(sysconf::page::pagesize())
    }

    /// Pages of `page_size` bytes.
    ///
    /// Panics if `page_size` can't hold a free-block header.
    pub fn with_page_size(page_size: usize) -> Self {
        assert!(
            page_size >= HEADER_SIZE && page_size % HEADER_SIZE == 0,
            "page size {} must be a multiple of {}",
            page_size,
            HEADER_SIZE
        );
        LibcPages {
            page_size,
            pages: 0,
            mappings: 0,
        }
    }

    /// Number of pages mapped so far, including ones since unmapped.
    pub fn pages(&self) -> usize {
        self.pages
    }

    /// Number of successful `mmap` calls.
    pub fn mappings(&self) -> usize {
        self.mappings
    }
}

impl PageSource for LibcPages {
    type Err = MappingFailure;

    fn page_size(&self) -> usize {
        self.page_size
    }

    unsafe fn map(&mut self, len: usize) -> Result<NonNull<u8>, MappingFailure> {
        let ptr = libc::mmap(
            // Address we want the memory at. We don't care, so null it is.
            null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            // Anonymous memory, not shared with any other process. The OS hands
            // it over zero-filled.
            libc::MAP_PRIVATE | libc::MAP_ANON,
            // No file behind the mapping.
            -1,
            0,
        );

        if ptr == libc::MAP_FAILED {
            return Err(MappingFailure::last("mmap", len));
        }
        let ptr = NonNull::new(ptr.cast::<u8>()).ok_or_else(|| MappingFailure::last("mmap", len))?;

        self.pages += (len + self.page_size - 1) / self.page_size;
        self.mappings += 1;
        log::debug!("mmap: {} bytes at {:p}", len, ptr);

        Ok(ptr)
    }

    unsafe fn unmap(&mut self, ptr: NonNull<u8>, len: usize) -> Result<(), MappingFailure> {
        if libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), len) != 0 {
            return Err(MappingFailure::last("munmap", len));
        }
        log::debug!("munmap: {} bytes at {:p}", len, ptr);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_env_log::test;

    #[test]
    fn test_map_is_zeroed_and_writable() {
        let mut pages = LibcPages::default();
        let ptr = unsafe { pages.map(2 * PAGE_SIZE) }.expect("mmap of two pages");
        let bytes = unsafe { core::slice::from_raw_parts_mut(ptr.as_ptr(), 2 * PAGE_SIZE) };
        assert!(bytes.iter().all(|&b| b == 0));
        bytes[PAGE_SIZE] = 0xAB;
        assert_eq!(bytes[PAGE_SIZE], 0xAB);

        assert_eq!(pages.pages(), 2);
        assert_eq!(pages.mappings(), 1);
        unsafe { pages.unmap(ptr, 2 * PAGE_SIZE) }.expect("munmap");
    }

    #[test]
    fn test_map_failure_reports_errno() {
        let mut pages = LibcPages::default();
        // No address space is this large.
        let err = unsafe { pages.map(usize::MAX - PAGE_SIZE) }.unwrap_err();
        assert_eq!(err.call, "mmap");
        assert_ne!(err.errno.0, 0);
        assert!(err.to_string().starts_with("mmap of "));
        assert_eq!(pages.mappings(), 0);
    }

    #[test]
    #[should_panic(expected = "must be a multiple of")]
    fn test_page_too_small_for_header() {
        let _ = LibcPages::with_page_size(HEADER_SIZE / 2);
    }

    #[test]
    #[should_panic(expected = "must be a multiple of")]
    fn test_page_not_header_multiple() {
        let _ = LibcPages::with_page_size(HEADER_SIZE + 1);
    }

    #[test]
    fn test_system_page_size() {
        let pages = LibcPages::system();
        assert!(pages.page_size().is_power_of_two());
    }
}
