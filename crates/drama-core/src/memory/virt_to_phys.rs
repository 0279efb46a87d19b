use std::fmt::{Debug, Formatter};
use std::ops::{Add, BitXor};

use crate::util::{PAGE_MASK, PAGE_SHIFT};
use itertools::Itertools;
use pagemap2::{PageMapError, VirtualMemoryArea};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[repr(transparent)]
#[derive(
    Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
/// Physical memory address.
///
/// A newtype wrapper around a physical address value. Only the pool that
/// handed out a `PhysAddr` knows its virtual backing.
pub struct PhysAddr(usize);

impl Debug for PhysAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("PhysAddr(0x{:02x})", self.0))
    }
}

impl PhysAddr {
    /// Creates a new physical address.
    pub const fn new(addr: usize) -> Self {
        PhysAddr(addr)
    }

    /// Returns the address as a usize.
    pub const fn as_usize(&self) -> usize {
        self.0
    }

    /// Returns the address of the page containing this address.
    pub const fn page(&self) -> PhysAddr {
        PhysAddr(self.0 & !PAGE_MASK)
    }
}

/// Trait for resolving virtual addresses to physical addresses.
///
/// Implementors provide methods to translate virtual memory addresses
/// to physical addresses using system interfaces like `/proc/{pid}/pagemap`.
pub trait VirtToPhysResolver {
    /// Errors that can occur during phsical address resolution
    type Error;
    /// Translates a virtual address to a physical address.
    ///
    /// # Errors
    ///
    /// Returns an error if address translation fails.
    fn get_phys(&mut self, virt: u64) -> Result<PhysAddr, Self::Error>;

    /// Translates a range of virtual addresses to the physical addresses of their pages.
    ///
    /// # Errors
    ///
    /// Returns an error if address translation fails.
    fn get_phys_range(&mut self, region: VirtualMemoryArea) -> Result<Vec<PhysAddr>, Self::Error>;
}

/// Errors that can happen during PageMap operations
#[derive(Debug, Error)]
pub enum LinuxPageMapError {
    /// Reading or parsing the pagemap failed
    #[error(transparent)]
    PageMap(#[from] PageMapError),
    /// The kernel reported PFN 0, which happens when the process lacks `CAP_SYS_ADMIN`
    #[error("got PFN 0 for virtual address 0x{virt:x}, insufficient privileges?")]
    ZeroPfn {
        /// The virtual address that could not be resolved
        virt: u64,
    },
    /// The pagemap returned an unexpected number of entries
    #[error("got {got} pagemap entries for virtual address 0x{virt:x}, expected exactly one")]
    UnexpectedEntries {
        /// The queried virtual address
        virt: u64,
        /// Number of entries returned
        got: usize,
    },
}

/// Virtual to physical address translator using Linux pagemap.
///
/// Uses `/proc/{pid}/pagemap` to translate virtual to physical addresses.
/// Requires root privileges to access pagemap.
pub struct LinuxPageMap {
    pagemap_wrapper: pagemap2::PageMap,
}

impl LinuxPageMap {
    /// Creates a new pagemap for the current process.
    ///
    /// # Errors
    ///
    /// Returns an error if opening `/proc/self/pagemap` fails.
    pub fn new() -> Result<LinuxPageMap, LinuxPageMapError> {
        let res = LinuxPageMap {
            pagemap_wrapper: pagemap2::PageMap::new(std::process::id() as u64)?,
        };
        Ok(res)
    }
}

impl VirtToPhysResolver for LinuxPageMap {
    type Error = LinuxPageMapError;
    fn get_phys(&mut self, virt: u64) -> Result<PhysAddr, Self::Error> {
        let vaddr_start_page = virt & !(PAGE_MASK as u64);
        let vaddr_end_page = vaddr_start_page + PAGE_MASK as u64;

        let memory_region = VirtualMemoryArea::from((vaddr_start_page, vaddr_end_page));
        let entry = self.pagemap_wrapper.pagemap_vma(&memory_region)?;
        if entry.len() != 1 {
            return Err(LinuxPageMapError::UnexpectedEntries {
                virt,
                got: entry.len(),
            });
        }
        let pfn = entry[0].pfn()?;
        if pfn == 0 {
            return Err(LinuxPageMapError::ZeroPfn { virt });
        }

        let phys_addr = ((pfn << PAGE_SHIFT) | (virt & PAGE_MASK as u64)) as usize;

        Ok(PhysAddr(phys_addr))
    }

    fn get_phys_range(
        &mut self,
        memory_region: VirtualMemoryArea,
    ) -> Result<Vec<PhysAddr>, Self::Error> {
        let start = memory_region.start_address();
        let entry = self.pagemap_wrapper.pagemap_vma(&memory_region)?;
        let pfns = entry
            .into_iter()
            .map(|e| e.pfn())
            .collect::<Result<Vec<u64>, PageMapError>>()?;
        if let Some(idx) = pfns.iter().position(|&pfn| pfn == 0) {
            return Err(LinuxPageMapError::ZeroPfn {
                virt: start + (idx << PAGE_SHIFT) as u64,
            });
        }
        Ok(pfns
            .iter()
            .map(|p| PhysAddr((*p << PAGE_SHIFT) as usize))
            .collect_vec())
    }
}

impl From<PhysAddr> for usize {
    fn from(addr: PhysAddr) -> usize {
        addr.0
    }
}

impl From<usize> for PhysAddr {
    fn from(addr: usize) -> PhysAddr {
        PhysAddr(addr)
    }
}

impl std::fmt::Pointer for PhysAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:p}", self.0 as *const u8)
    }
}

impl Add<usize> for PhysAddr {
    type Output = PhysAddr;

    fn add(self, rhs: usize) -> Self::Output {
        PhysAddr(self.0 + rhs)
    }
}

/// Flipping the bits of a difference vector moves to the partner address.
impl BitXor<usize> for PhysAddr {
    type Output = PhysAddr;

    fn bitxor(self, rhs: usize) -> Self::Output {
        PhysAddr(self.0 ^ rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xor_partner() {
        let a = PhysAddr::new(0x4000_1040);
        let b = a ^ 0x2000;
        assert_eq!(b.as_usize(), 0x4000_3040);
        assert_eq!(b ^ 0x2000, a);
        assert_eq!(a.page(), PhysAddr::new(0x4000_1000));
    }

    #[test]
    #[ignore = "pagemap translation needs root permissions"]
    fn test_translate_stack_page() {
        let x = 0u64;
        let mut pagemap = LinuxPageMap::new().expect("pagemap");
        let phys = pagemap.get_phys(&x as *const u64 as u64).expect("translate");
        assert_ne!(phys.as_usize() & !PAGE_MASK, 0);
    }
}
