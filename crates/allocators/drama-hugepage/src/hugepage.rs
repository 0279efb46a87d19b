use drama_core::allocator::ConsecAllocator;
use drama_core::memory::{ConsecBlocks, Memory};
use drama_core::util::BASE_MSB;
use drama_core::util::Size::{self, GB, MB};
use lazy_static::lazy_static;
use libc::{MAP_POPULATE, MAP_SHARED, O_CREAT, O_RDWR};
use log::{debug, info};
use std::ffi::{CString, c_void};
use std::fs::File;
use std::io::{Error, ErrorKind, Read};

// https://www.kernel.org/doc/Documentation/vm/hugetlbpage.txt
//
// The output of "cat /proc/meminfo" will include lines like:
// ...
// HugePages_Total: uuu
// HugePages_Free:  vvv
// HugePages_Rsvd:  www
// HugePages_Surp:  xxx
// Hugepagesize:    yyy kB
// Hugetlb:         zzz kB

const MEMINFO_PATH: &str = "/proc/meminfo";
const TOKEN: &str = "Hugepagesize:";
const HUGETLBFS_FILE: &str = "/dev/hugepages/drama_pool";

lazy_static! {
    static ref HUGEPAGE_SIZE: isize = {
        let buf = File::open(MEMINFO_PATH).map_or("".to_owned(), |mut f| {
            let mut s = String::new();
            let _ = f.read_to_string(&mut s);
            s
        });
        parse_hugepage_size(&buf)
    };
}

fn parse_hugepage_size(s: &str) -> isize {
    for line in s.lines() {
        if let Some(rest) = line.strip_prefix(TOKEN) {
            let mut parts = rest.split_whitespace();

            let p = parts.next().unwrap_or("0");
            let mut hugepage_size = p.parse::<isize>().unwrap_or(-1);

            hugepage_size *= parts.next().map_or(1, |x| match x {
                "kB" => 1024,
                _ => 1,
            });

            return hugepage_size;
        }
    }

    -1
}

/// Hugepage-based allocator for the physical memory pool.
///
/// Allocates memory using Linux hugepages mounted at `/dev/hugepages`.
/// The default hugepage size is detected from `/proc/meminfo`. Each hugepage
/// is physically contiguous, so a 1 GiB page lets discovery vary the lower 30
/// address bits and a 2 MiB page the lower 21.
///
/// # Platform Requirements
///
/// - Hugepages must be reserved via kernel boot parameters or `/proc/sys/vm/nr_hugepages`
/// - Hugetlbfs must be mounted at `/dev/hugepages`
#[derive(Debug, Default, Copy, Clone)]
pub struct HugepageAllocator {}

/// Supported hugepage sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HugepageSize {
    /// 2 Megabyte hugepage
    TwoMb,
    /// 1 Gigabyte hugepage
    OneGb,
}

impl HugepageSize {
    /// The hugepage size configured on this system.
    ///
    /// # Errors
    ///
    /// Fails if `/proc/meminfo` reports no or an unsupported hugepage size.
    pub fn detect() -> Result<Self, Error> {
        match *HUGEPAGE_SIZE {
            s if s == GB(1).bytes() as isize => Ok(HugepageSize::OneGb),
            s if s == MB(2).bytes() as isize => Ok(HugepageSize::TwoMb),
            s => Err(Error::new(
                ErrorKind::Unsupported,
                format!("unsupported hugepage size {}", s),
            )),
        }
    }

    /// Size of one page.
    pub fn size(&self) -> Size {
        match self {
            HugepageSize::TwoMb => MB(2),
            HugepageSize::OneGb => GB(1),
        }
    }
}

impl ConsecAllocator for HugepageAllocator {
    type Error = Error;
    fn block_size(&self) -> Size {
        Size::B((*HUGEPAGE_SIZE).max(0) as usize)
    }
    fn alloc_consec_blocks(&mut self, size: Size) -> Result<ConsecBlocks, Self::Error> {
        let page = HugepageSize::detect()?;
        let pages = size.bytes().div_ceil(page.size().bytes()).max(1);
        info!("Allocating {} hugepage(s) of {}", pages, page.size());
        let region = Memory::hugepages(page, pages)?;
        unsafe { libc::memset(region.ptr as *mut c_void, 0x00, region.len) };
        // one block per page, since only a single page is guaranteed to be contiguous
        let blocks = (0..pages)
            .map(|i| {
                let len = page.size().bytes();
                Memory::new(unsafe { region.ptr.byte_add(i * len) }, len)
            })
            .collect();
        Ok(ConsecBlocks::new(blocks))
    }
}

trait Hugepage {
    fn hugepages(size: HugepageSize, count: usize) -> Result<Self, Error>
    where
        Self: Sized;
}

impl Hugepage for Memory {
    fn hugepages(size: HugepageSize, count: usize) -> Result<Self, Error> {
        let len = size.size().bytes() * count;
        let path = CString::new(HUGETLBFS_FILE).map_err(|e| Error::new(ErrorKind::InvalidInput, e))?;
        let fd = unsafe { libc::open(path.as_ptr(), O_RDWR | O_CREAT, 0o600) };
        if fd == -1 {
            return Err(Error::last_os_error());
        }
        let p = unsafe {
            libc::mmap(
                BASE_MSB,
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                MAP_SHARED | MAP_POPULATE,
                fd,
                0,
            )
        };
        let err = Error::last_os_error();
        unsafe {
            libc::close(fd);
            // the mapping keeps the pages alive
            libc::unlink(path.as_ptr());
        }
        if p == libc::MAP_FAILED {
            return Err(err);
        }
        debug!("Mapped {} bytes of hugepages at {:p}", len, p);
        Ok(Memory::new(p as *mut u8, len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drama_core::memory::{BytePointer, GetConsecPfns};

    #[test]
    fn test_parse_hugepage_size() {
        // correct.
        assert_eq!(parse_hugepage_size("Hugepagesize:1024"), 1024);
        assert_eq!(parse_hugepage_size("Hugepagesize: 2048 kB"), 2 << 20);
        assert_eq!(
            parse_hugepage_size("HugePages_Total: 1\nHugepagesize: 1048576 kB\n"),
            1 << 30
        );

        // wrong.
        assert_eq!(parse_hugepage_size("Hugepagesize:1kB"), -1);
        assert_eq!(parse_hugepage_size("Hugepagesize: 2kB"), -1);
        assert_eq!(parse_hugepage_size("MemTotal: 1 kB"), -1);
    }

    #[test]
    #[ignore = "requires reserved hugepages and root privileges"]
    fn test_allocator() -> Result<(), Box<dyn std::error::Error>> {
        let mut hugepage_alloc = HugepageAllocator {};
        let mem = hugepage_alloc.alloc_consec_blocks(Size::B(4096))?;
        let p = mem.ptr();
        assert!(!p.is_null(), "allocation failed");
        unsafe {
            *p = 20;
            assert_eq!(*p, 20);
        }
        // a single hugepage is one physically contiguous range
        assert_eq!(mem.consec_pfns()?.len(), 1);
        mem.dealloc();
        Ok(())
    }
}
