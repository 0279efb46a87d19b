use std::{ops::Range, ptr::null_mut};

use super::PhysAddr;
use crate::memory::virt_to_phys::LinuxPageMapError;
use crate::memory::{LinuxPageMap, VirtToPhysResolver};
use crate::util::PAGE_SIZE;
use libc::{MAP_ANONYMOUS, MAP_POPULATE, MAP_SHARED};
use log::{log, trace, warn};
use pagemap2::VirtualMemoryArea;

/// Trait for accessing memory as a byte pointer.
///
/// Provides low-level access to memory regions with byte-level addressing.
#[allow(clippy::len_without_is_empty)]
pub trait BytePointer {
    /// Returns a mutable pointer to the byte at the given offset.
    ///
    /// # Safety
    ///
    /// The returned pointer is valid only while the memory region exists.
    /// Dereferencing requires unsafe code and proper synchronization.
    fn addr(&self, offset: usize) -> *mut u8;

    /// Returns a mutable pointer to the start of the memory region.
    fn ptr(&self) -> *mut u8;

    /// Returns the total length of the memory region in bytes.
    fn len(&self) -> usize;
}

/// A managed memory region.
///
/// Represents an allocated memory block with pointer and length.
#[derive(Clone, Debug)]
pub struct Memory {
    /// Block pointer
    pub ptr: *mut u8,
    /// Block length in bytes
    pub len: usize,
}

unsafe impl Send for Memory {}

impl Memory {
    /// Creates a new memory block with the given pointer and length.
    pub fn new(ptr: *mut u8, len: usize) -> Self {
        Memory { ptr, len }
    }

    /// Allocates memory using mmap.
    ///
    /// Creates a memory-mapped region of the specified size with
    /// read/write permissions. The region is backed by regular pages, so
    /// only page-internal address bits are physically contiguous.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if mmap fails.
    pub fn mmap(size: usize) -> std::result::Result<Self, std::io::Error> {
        let p = unsafe {
            libc::mmap(
                null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                MAP_SHARED | MAP_ANONYMOUS | MAP_POPULATE,
                -1,
                0,
            )
        };
        if p == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error());
        }
        unsafe { libc::memset(p, 0x00, size) };
        Ok(Memory::new(p as *mut u8, size))
    }

    /// Deallocates the memory block.
    ///
    /// Unmaps the memory region using munmap. Consumes self.
    pub fn dealloc(self) {
        let r = unsafe { libc::munmap(self.ptr as *mut libc::c_void, self.len) };
        if r != 0 {
            warn!(
                "munmap({:p}, {}) failed: {}",
                self.ptr,
                self.len,
                std::io::Error::last_os_error()
            );
        }
    }
}

impl BytePointer for Memory {
    fn addr(&self, offset: usize) -> *mut u8 {
        assert!(
            offset < self.len,
            "Memory::addr failed. Offset {} >= {}",
            offset,
            self.len
        );
        unsafe { self.ptr.byte_add(offset) }
    }
    fn ptr(&self) -> *mut u8 {
        self.ptr
    }
    fn len(&self) -> usize {
        self.len
    }
}

/// Errors that can occur during physical frame number operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error resolving virtual to physical address
    #[error(transparent)]
    LinuxPageMapError(#[from] LinuxPageMapError),
    /// Memory region has no physical pages mapped
    #[error("Empty PFN range")]
    EmptyPfnRange,
}

/// Result type for memblock operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Type alias for consecutive physical frame number ranges.
pub type ConsecPfns = Vec<Range<PhysAddr>>;

/// Trait for types that can provide their page-wise physical addresses.
///
/// Allows querying which physical address ranges a memory region occupies.
pub trait GetConsecPfns {
    /// Returns the physical address of every page, in virtual order.
    ///
    /// # Errors
    ///
    /// Returns an error if PFN resolution fails.
    fn page_pfns(&self) -> Result<Vec<PhysAddr>>;

    /// Returns the consecutive PFN ranges for this memory region.
    ///
    /// # Errors
    ///
    /// Returns an error if PFN resolution fails.
    fn consec_pfns(&self) -> Result<ConsecPfns> {
        let pfns = self.page_pfns()?;
        merge_consecutive(&pfns)
    }

    /// Logs the PFN ranges at the specified log level.
    fn log_pfns(&self, level: log::Level) {
        let pfns = match self.consec_pfns() {
            Ok(pfns) => pfns,
            Err(e) => {
                warn!("Failed to get PFNs: {:?}", e);
                return;
            }
        };
        let pfns = pfns.format_pfns();
        log!(level, "PFNs:\n{}", pfns);
    }
}

/// Merges page addresses into ranges of physically consecutive pages.
pub(crate) fn merge_consecutive(pfns: &[PhysAddr]) -> Result<ConsecPfns> {
    let Some((&first, rest)) = pfns.split_first() else {
        return Err(Error::EmptyPfnRange);
    };
    let mut consecs = vec![];
    let mut phys_prev = first;
    let mut range_start = first;
    for &phys in rest {
        if phys != phys_prev + PAGE_SIZE {
            consecs.push(range_start..phys_prev + PAGE_SIZE);
            range_start = phys;
        }
        phys_prev = phys;
    }
    consecs.push(range_start..phys_prev + PAGE_SIZE);
    Ok(consecs)
}

impl GetConsecPfns for Memory {
    fn page_pfns(&self) -> Result<Vec<PhysAddr>> {
        (self.ptr, self.len).page_pfns()
    }
}

impl<T> GetConsecPfns for (*mut T, usize) {
    fn page_pfns(&self) -> Result<Vec<PhysAddr>> {
        trace!("Get PFNs for vaddr 0x{:x}", self.0 as u64);
        let mut resolver = LinuxPageMap::new()?;
        let start = self.0 as u64;
        let mut pfns =
            resolver.get_phys_range(VirtualMemoryArea::from((start, start + self.1 as u64)))?;
        pfns.truncate(self.1.div_ceil(PAGE_SIZE));
        if pfns.is_empty() {
            return Err(Error::EmptyPfnRange);
        }
        Ok(pfns)
    }
}

/// Formats physical frame number ranges for display.
pub trait FormatPfns {
    /// Formats PFN ranges as a human-readable string.
    fn format_pfns(&self) -> String;
}

impl FormatPfns for ConsecPfns {
    fn format_pfns(&self) -> String {
        let mut pfns = String::from("");
        for range in self {
            pfns += &format!(
                "{:p}..[{:04} KB]..{:p}\n",
                range.start,
                (range.end.as_usize() - range.start.as_usize()) / 1024,
                range.end
            );
        }
        pfns
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_consecutive() {
        let pages = [0x1000, 0x2000, 0x3000, 0x8000, 0x9000]
            .map(PhysAddr::new)
            .to_vec();
        let ranges = merge_consecutive(&pages).expect("ranges");
        assert_eq!(
            ranges,
            vec![
                PhysAddr::new(0x1000)..PhysAddr::new(0x4000),
                PhysAddr::new(0x8000)..PhysAddr::new(0xa000)
            ]
        );
        assert!(merge_consecutive(&[]).is_err());
    }

    #[test]
    fn test_format_pfns() {
        let ranges: ConsecPfns = vec![PhysAddr::new(0x200000)..PhysAddr::new(0x400000)];
        assert!(ranges.format_pfns().contains("[2048 KB]"));
    }
}
