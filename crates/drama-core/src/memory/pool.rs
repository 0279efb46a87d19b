//! The physical memory pool addresses are sampled from.

use std::collections::HashMap;
use std::sync::Mutex;

use log::{debug, info, warn};
use rand::Rng as _;
use thiserror::Error;

use super::memblock::{self, GetConsecPfns, merge_consecutive};
use super::{BytePointer, ConsecBlocks, FormatPfns, LinuxPageMapError, PhysAddr};
use crate::allocator::{ConsecAllocator, alloc_memory};
use crate::util::{PAGE_MASK, PAGE_SIZE, Rng, Size};

/// Serializes pool setup and teardown. Reads of an acquired pool are lock-free.
static POOL_LOCK: Mutex<()> = Mutex::new(());

/// Errors acquiring or translating the physical memory pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The allocator could not satisfy the requested size or page backing
    #[error("could not acquire {requested} of large-page backed memory: {reason}")]
    ResourceExhausted {
        /// Requested pool size
        requested: Size,
        /// Allocator error message
        reason: String,
    },
    /// Virtual to physical translation is denied or unsupported
    #[error("physical address translation unavailable: {0}")]
    TranslationUnavailable(#[from] LinuxPageMapError),
    /// The allocator returned no memory
    #[error("allocation returned an empty pool")]
    EmptyPool,
    /// The pool was already released
    #[error("pool has been released")]
    Released,
    /// Offset outside of the pool
    #[error("offset 0x{offset:x} outside of pool of 0x{len:x} bytes")]
    OffsetOutOfRange {
        /// Requested offset
        offset: usize,
        /// Pool length
        len: usize,
    },
}

impl From<memblock::Error> for PoolError {
    fn from(value: memblock::Error) -> Self {
        match value {
            memblock::Error::LinuxPageMapError(e) => PoolError::TranslationUnavailable(e),
            memblock::Error::EmptyPfnRange => PoolError::EmptyPool,
        }
    }
}

/// A set of physical addresses that can be drawn from and accessed.
///
/// Implemented by the hardware-backed [`PhysPool`] and by [`SyntheticPool`],
/// which models an address space without backing memory.
pub trait AddressPool: Sync {
    /// Mask of the physical address bits that vary freely inside the pool,
    /// i.e., the largest aligned, physically contiguous window.
    fn window(&self) -> usize;

    /// Draws an address uniformly from the pool, aligned to `1 << align_shift`.
    fn random_addr(&self, rng: &mut Rng, align_shift: usize) -> PhysAddr;

    /// Whether `addr` lies inside the pool.
    fn contains(&self, addr: PhysAddr) -> bool;

    /// The virtual address backing `addr`, if the pool has backing memory.
    fn virt(&self, addr: PhysAddr) -> Option<*const u8>;

    /// Total size of the pool in bytes.
    fn size(&self) -> usize;
}

/// Large-page backed memory with a physical address table.
///
/// Acquired once per run. All page translations are resolved during
/// acquisition, so missing privileges surface at startup and the pool is
/// read-only afterwards. The backing memory is released when the pool is
/// dropped, or earlier with [`PhysPool::release`].
pub struct PhysPool {
    blocks: Option<ConsecBlocks>,
    /// Physical page address for each virtual page, in virtual order
    pages: Vec<PhysAddr>,
    /// Physical page address to virtual page pointer
    by_phys: HashMap<PhysAddr, *mut u8>,
    window: usize,
}

// The page tables are immutable after acquisition and the backing memory is only read.
unsafe impl Send for PhysPool {}
unsafe impl Sync for PhysPool {}

impl PhysPool {
    /// Reserves `size` bytes using `allocator` and resolves their physical addresses.
    ///
    /// # Errors
    ///
    /// * [`PoolError::ResourceExhausted`] if the allocator cannot satisfy the request
    /// * [`PoolError::TranslationUnavailable`] if pagemap access is denied
    pub fn acquire<E: std::error::Error>(
        allocator: &mut dyn ConsecAllocator<Error = E>,
        size: Size,
    ) -> Result<Self, PoolError> {
        info!("Acquiring {} pool", size);
        let blocks = {
            let _guard = POOL_LOCK.lock().unwrap_or_else(|e| e.into_inner());
            alloc_memory(allocator, size).map_err(|e| PoolError::ResourceExhausted {
                requested: size,
                reason: e.to_string(),
            })?
        };
        // release the blocks if translation fails
        match blocks.page_pfns() {
            Ok(pages) => Self::from_parts(blocks, pages),
            Err(e) => {
                let _guard = POOL_LOCK.lock().unwrap_or_else(|e| e.into_inner());
                blocks.dealloc();
                Err(e.into())
            }
        }
    }

    /// Builds a pool from already allocated blocks and their page addresses.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::EmptyPool`] if `pages` is empty.
    pub fn from_parts(blocks: ConsecBlocks, pages: Vec<PhysAddr>) -> Result<Self, PoolError> {
        let ranges = merge_consecutive(&pages)?;
        debug!("Pool PFNs:\n{}", ranges.format_pfns());
        let window = ranges
            .iter()
            .map(|r| aligned_window(r.start.as_usize(), r.end.as_usize()))
            .max()
            .unwrap_or(0);
        let by_phys = pages
            .iter()
            .enumerate()
            .map(|(idx, &phys)| (phys, blocks.addr(idx * PAGE_SIZE)))
            .collect();
        info!(
            "Pool of {} pages in {} physical ranges, contiguous window of {} address bits",
            pages.len(),
            ranges.len(),
            (window + 1).trailing_zeros()
        );
        Ok(PhysPool {
            blocks: Some(blocks),
            pages,
            by_phys,
            window,
        })
    }

    /// Resolves the physical address of the byte at `offset` into the pool.
    ///
    /// # Errors
    ///
    /// Fails if the pool has been released or `offset` is out of range.
    pub fn translate(&self, offset: usize) -> Result<PhysAddr, PoolError> {
        if self.blocks.is_none() {
            return Err(PoolError::Released);
        }
        let page = self
            .pages
            .get(offset / PAGE_SIZE)
            .ok_or(PoolError::OffsetOutOfRange {
                offset,
                len: self.size(),
            })?;
        Ok(*page + (offset & PAGE_MASK))
    }

    /// Unmaps the pool. Calling it again is a no-op.
    pub fn release(&mut self) {
        if let Some(blocks) = self.blocks.take() {
            let _guard = POOL_LOCK.lock().unwrap_or_else(|e| e.into_inner());
            info!("Releasing pool of {} bytes", blocks.len());
            self.by_phys.clear();
            self.pages.clear();
            blocks.dealloc();
        }
    }

    /// Whether the pool still holds its memory.
    pub fn is_acquired(&self) -> bool {
        self.blocks.is_some()
    }
}

impl Drop for PhysPool {
    fn drop(&mut self) {
        self.release();
    }
}

impl AddressPool for PhysPool {
    fn window(&self) -> usize {
        self.window
    }

    fn random_addr(&self, rng: &mut Rng, align_shift: usize) -> PhysAddr {
        if self.pages.is_empty() {
            warn!("random_addr on a released pool");
            return PhysAddr::default();
        }
        let page = self.pages[rng.random_range(0..self.pages.len())];
        let offset = rng.random_range(0..PAGE_SIZE) & !((1 << align_shift) - 1) & PAGE_MASK;
        page + offset
    }

    fn contains(&self, addr: PhysAddr) -> bool {
        self.by_phys.contains_key(&addr.page())
    }

    fn virt(&self, addr: PhysAddr) -> Option<*const u8> {
        self.by_phys
            .get(&addr.page())
            .map(|&page| unsafe { page.byte_add(addr.as_usize() & PAGE_MASK) } as *const u8)
    }

    fn size(&self) -> usize {
        self.pages.len() * PAGE_SIZE
    }
}

/// Largest `2^k - 1` such that an aligned block of `2^k` bytes fits in `start..end`.
fn aligned_window(start: usize, end: usize) -> usize {
    let mut k = (end - start).checked_ilog2().unwrap_or(0);
    loop {
        let block = 1usize << k;
        let aligned = start.next_multiple_of(block);
        if aligned.checked_add(block).is_some_and(|e| e <= end) {
            return block - 1;
        }
        if k == 0 {
            return 0;
        }
        k -= 1;
    }
}

/// An address space of `2^bits` bytes without backing memory.
///
/// Paired with a synthetic oracle to exercise sampling, solving and
/// validation without hardware access.
#[derive(Debug, Clone, Copy)]
pub struct SyntheticPool {
    base: usize,
    bits: u32,
}

impl SyntheticPool {
    /// Creates a pool covering `base..base + 2^bits`. `base` is aligned down to `2^bits`.
    pub fn new(base: usize, bits: u32) -> Self {
        let base = base & !((1usize << bits) - 1);
        SyntheticPool { base, bits }
    }
}

impl AddressPool for SyntheticPool {
    fn window(&self) -> usize {
        (1 << self.bits) - 1
    }

    fn random_addr(&self, rng: &mut Rng, align_shift: usize) -> PhysAddr {
        let offset = rng.random::<u64>() as usize & self.window() & !((1 << align_shift) - 1);
        PhysAddr::new(self.base | offset)
    }

    fn contains(&self, addr: PhysAddr) -> bool {
        addr.as_usize() >> self.bits == self.base >> self.bits
    }

    fn virt(&self, _addr: PhysAddr) -> Option<*const u8> {
        None
    }

    fn size(&self) -> usize {
        1 << self.bits
    }
}
