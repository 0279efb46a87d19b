//! Memory allocation strategies backing the physical memory pool.
//!
//! This module defines the [`ConsecAllocator`] trait and the [`alloc_memory`] function
//! for allocating memory whose physical layout is contiguous within a bounded window.

use crate::memory::{ConsecBlocks, GetConsecPfns};
use crate::util::Size;
use crate::util::compact_mem;
use log::warn;

/// Trait for memory allocation strategies that provide physically consecutive memory blocks.
///
/// Different allocators may use different underlying mechanisms such as hugetlbfs
/// pages or transparent huge pages. The larger the physically contiguous window,
/// the more address bits the discovery can vary.
///
/// # Associated Types
///
/// * `Error` - The error type returned by allocation operations. Must implement [`std::error::Error`].
///
/// # Examples
///
/// See the `drama-hugepage` crate for a concrete implementation.
pub trait ConsecAllocator {
    /// The error type returned by allocation operations.
    type Error: std::error::Error;

    /// Returns the size of individual memory blocks managed by this allocator.
    ///
    /// The block size typically corresponds to the underlying memory page size
    /// (e.g., 1GB for hugepages, 2MB for THP).
    fn block_size(&self) -> Size;

    /// Allocates consecutive physical memory blocks of the specified size.
    ///
    /// # Errors
    ///
    /// May return an error if:
    /// * Physical memory allocation fails
    /// * Required kernel interfaces are unavailable
    /// * Insufficient large pages are available
    fn alloc_consec_blocks(&mut self, size: Size) -> Result<ConsecBlocks, Self::Error>;
}

/// Allocate memory using an allocation strategy.
///
/// Compacts memory first (best effort) to improve the odds of the large-page
/// request being satisfied, then logs the physical ranges obtained.
///
/// # Errors
///
/// Returns the allocator's error if the allocation fails.
pub fn alloc_memory<E: std::error::Error>(
    allocator: &mut dyn ConsecAllocator<Error = E>,
    size: Size,
) -> Result<ConsecBlocks, E> {
    let compacted = compact_mem();
    match compacted {
        Ok(_) => {}
        Err(e) => warn!("Memory compaction failed: {:?}", e),
    }
    let memory = allocator.alloc_consec_blocks(size)?;
    memory.log_pfns(log::Level::Debug);
    Ok(memory)
}
