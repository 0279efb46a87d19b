/// Page shift value (12 bits) for 4KB pages
pub const PAGE_SHIFT: usize = 12;
/// Standard page size (4096 bytes)
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;
/// Mask for extracting page offset
pub const PAGE_MASK: usize = PAGE_SIZE - 1;

/// Cache line shift value (6 bits) for x86_64
pub const CL_SHIFT: usize = 6;

/// Address hint for hugepage mappings
pub const BASE_MSB: *mut libc::c_void = 0x2000000000 as *mut libc::c_void;
