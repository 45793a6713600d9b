//! Fixed-size block allocator backing chunk storage.
//!
//! Blocks come in two size classes. Memory is requested from the system in
//! pages, each subdivided into equal blocks threaded on a per-page free
//! list. Freed pages are only returned to the system by [ChunkAllocator::flush].

use std::alloc::{alloc, dealloc, Layout};
use std::ptr::NonNull;

use tracing::debug;

use crate::error::EcsError;

/// Small block size.
pub const SMALL_BLOCK: usize = 8 * 1024;
/// Large block size, twice the small one.
pub const LARGE_BLOCK: usize = 2 * SMALL_BLOCK;

const BLOCKS_PER_PAGE: usize = 16;
const BLOCK_ALIGN: usize = 64;

/// The two block sizes served by the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeClass {
    Small,
    Large,
}

impl SizeClass {
    /// Bytes in one block of this class.
    pub fn block_bytes(self) -> usize {
        match self {
            SizeClass::Small => SMALL_BLOCK,
            SizeClass::Large => LARGE_BLOCK,
        }
    }

    /// Smallest class able to hold `bytes`. Requests beyond the large
    /// class are a programming error.
    pub fn for_request(bytes: usize) -> SizeClass {
        assert!(bytes <= LARGE_BLOCK, "chunk request of {bytes} bytes exceeds block size");
        if bytes <= SMALL_BLOCK {
            SizeClass::Small
        } else {
            SizeClass::Large
        }
    }

    fn index(self) -> usize {
        match self {
            SizeClass::Small => 0,
            SizeClass::Large => 1,
        }
    }

    fn page_layout(self) -> Layout {
        Layout::from_size_align(self.block_bytes() * BLOCKS_PER_PAGE, BLOCK_ALIGN).unwrap()
    }
}

/// An allocated block. Returned to the allocator via [ChunkAllocator::free].
#[derive(Debug)]
pub struct Block {
    ptr: NonNull<u8>,
    class: SizeClass,
}

impl Block {
    pub fn ptr(&self) -> NonNull<u8> { self.ptr }

    pub fn class(&self) -> SizeClass { self.class }

    /// Usable bytes in the block.
    pub fn len(&self) -> usize { self.class.block_bytes() }
}

struct Page {
    base: NonNull<u8>,
    class: SizeClass,
    free: Vec<u16>,
}

impl Page {
    fn new(class: SizeClass) -> Result<Page, EcsError> {
        // safety: the layout has non-zero size
        let raw = unsafe { alloc(class.page_layout()) };
        let base = NonNull::new(raw).ok_or(EcsError::OutOfMemory)?;
        Ok(Page {
            base,
            class,
            free: (0..BLOCKS_PER_PAGE as u16).rev().collect(),
        })
    }

    fn contains(&self, ptr: NonNull<u8>) -> bool {
        let base = self.base.as_ptr() as usize;
        let addr = ptr.as_ptr() as usize;
        addr >= base && addr < base + self.class.page_layout().size()
    }

    fn block_ptr(&self, index: u16) -> NonNull<u8> {
        debug_assert!((index as usize) < BLOCKS_PER_PAGE);
        // safety: index is within the page allocation
        unsafe {
            NonNull::new_unchecked(
                self.base
                    .as_ptr()
                    .add(index as usize * self.class.block_bytes()),
            )
        }
    }

    fn used(&self) -> usize { BLOCKS_PER_PAGE - self.free.len() }

    fn is_unused(&self) -> bool { self.free.len() == BLOCKS_PER_PAGE }
}

impl Drop for Page {
    fn drop(&mut self) {
        // safety: base was produced by alloc with the same layout
        unsafe { dealloc(self.base.as_ptr(), self.class.page_layout()) };
    }
}

#[derive(Default)]
struct PoolStats {
    pages: usize,
    free_pages: usize,
    used_blocks: usize,
}

struct Pool {
    class: SizeClass,
    pages: Vec<Page>,
}

impl Pool {
    fn new(class: SizeClass) -> Pool {
        Pool {
            class,
            pages: Vec::new(),
        }
    }

    fn alloc(&mut self) -> Result<Block, EcsError> {
        let page = match self.pages.iter_mut().position(|p| !p.free.is_empty()) {
            Some(index) => &mut self.pages[index],
            None => {
                let page = Page::new(self.class)?;
                debug!(
                    class = ?self.class,
                    bytes = self.class.page_layout().size(),
                    "allocated chunk page"
                );
                self.pages.push(page);
                self.pages.last_mut().unwrap()
            }
        };
        let index = page.free.pop().unwrap();
        Ok(Block {
            ptr: page.block_ptr(index),
            class: self.class,
        })
    }

    fn free(&mut self, block: Block) {
        let page = self
            .pages
            .iter_mut()
            .find(|p| p.contains(block.ptr))
            .expect("block does not belong to this allocator");
        let offset = block.ptr.as_ptr() as usize - page.base.as_ptr() as usize;
        debug_assert_eq!(offset % self.class.block_bytes(), 0);
        let index = (offset / self.class.block_bytes()) as u16;
        debug_assert!(!page.free.contains(&index), "double free of chunk block");
        page.free.push(index);
    }

    fn flush(&mut self) {
        let before = self.pages.len();
        self.pages.retain(|p| !p.is_unused());
        let released = before - self.pages.len();
        if released > 0 {
            debug!(class = ?self.class, released, "released chunk pages");
        }
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            pages: self.pages.len(),
            free_pages: self.pages.iter().filter(|p| p.is_unused()).count(),
            used_blocks: self.pages.iter().map(|p| p.used()).sum(),
        }
    }
}

/// Allocator statistics exported for diagnostics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AllocStats {
    /// Bytes reserved from the system across all pages.
    pub reserved_bytes: usize,
    /// Bytes handed out in live blocks.
    pub used_bytes: usize,
    /// Total pages held.
    pub page_count: usize,
    /// Pages whose blocks are all free.
    pub free_page_count: usize,
}

/// Serves aligned fixed-size blocks out of two page pools.
pub struct ChunkAllocator {
    pools: [Pool; 2],
}

// The allocator is single-threaded; a Universe may move it between worlds
// behind a mutex.
unsafe impl Send for ChunkAllocator {}

impl Default for ChunkAllocator {
    fn default() -> Self { Self::new() }
}

impl ChunkAllocator {
    pub fn new() -> Self {
        ChunkAllocator {
            pools: [Pool::new(SizeClass::Small), Pool::new(SizeClass::Large)],
        }
    }

    /// Allocates a block able to hold `bytes`, rounding up to a class.
    pub fn alloc(&mut self, bytes: usize) -> Result<Block, EcsError> {
        let class = SizeClass::for_request(bytes);
        self.pools[class.index()].alloc()
    }

    /// Returns a block to its page.
    pub fn free(&mut self, block: Block) {
        let class = block.class;
        self.pools[class.index()].free(block);
    }

    /// Releases every page whose blocks are all free.
    pub fn flush(&mut self) {
        for pool in &mut self.pools {
            pool.flush();
        }
    }

    pub fn stats(&self) -> AllocStats {
        let mut stats = AllocStats::default();
        for pool in &self.pools {
            let pool_stats = pool.stats();
            let block_bytes = pool.class.block_bytes();
            stats.reserved_bytes += pool_stats.pages * block_bytes * BLOCKS_PER_PAGE;
            stats.used_bytes += pool_stats.used_blocks * block_bytes;
            stats.page_count += pool_stats.pages;
            stats.free_page_count += pool_stats.free_pages;
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_requests_up() {
        assert_eq!(SizeClass::for_request(1), SizeClass::Small);
        assert_eq!(SizeClass::for_request(SMALL_BLOCK), SizeClass::Small);
        assert_eq!(SizeClass::for_request(SMALL_BLOCK + 1), SizeClass::Large);
        assert_eq!(SizeClass::for_request(LARGE_BLOCK), SizeClass::Large);
    }

    #[test]
    fn blocks_are_aligned_and_distinct() {
        let mut allocator = ChunkAllocator::new();
        let a = allocator.alloc(100).unwrap();
        let b = allocator.alloc(SMALL_BLOCK).unwrap();
        assert_eq!(a.ptr().as_ptr() as usize % BLOCK_ALIGN, 0);
        assert_ne!(a.ptr(), b.ptr());
        assert_eq!(a.len(), SMALL_BLOCK);
        allocator.free(a);
        allocator.free(b);
    }

    #[test]
    fn flush_releases_only_unused_pages() {
        let mut allocator = ChunkAllocator::new();
        let keep = allocator.alloc(LARGE_BLOCK).unwrap();
        let drop_me = allocator.alloc(100).unwrap();

        let stats = allocator.stats();
        assert_eq!(stats.page_count, 2);
        assert_eq!(stats.used_bytes, SMALL_BLOCK + LARGE_BLOCK);

        allocator.free(drop_me);
        allocator.flush();
        let stats = allocator.stats();
        assert_eq!(stats.page_count, 1);
        assert_eq!(stats.free_page_count, 0);
        assert_eq!(stats.used_bytes, LARGE_BLOCK);

        allocator.free(keep);
        allocator.flush();
        assert_eq!(allocator.stats().page_count, 0);
    }

    #[test]
    fn recycles_freed_blocks() {
        let mut allocator = ChunkAllocator::new();
        let a = allocator.alloc(64).unwrap();
        let addr = a.ptr();
        allocator.free(a);
        let b = allocator.alloc(64).unwrap();
        assert_eq!(b.ptr(), addr);
        allocator.free(b);
    }
}
