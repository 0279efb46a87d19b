//! The `memory` module provides the physical memory pool and the primitives it is built from.
//!
//! The `memory` module provides the following abstractions:
//! - `PhysPool`: Large-page backed memory with a resolved physical address table.
//! - `AddressPool`: A trait for anything physical addresses can be sampled from.
//! - `SyntheticPool`: An address space without backing memory, for synthetic runs.
//! - `BytePointer`: A trait for accessing memory as a byte pointer.
//! - `LinuxPageMap`: A struct that provides a mapping from virtual to physical addresses.
//! - `VirtToPhysResolver`: A trait for resolving the physical address of a provided virtual address.
//! - `MemoryTupleTimer`: A trait for timing DRAM accesses to address pairs.
//!
//! The `memory` module also provides the following helper structs:
//! - `ConsecBlocks`: A struct that represents a collection of memory blocks.
//! - `Memory`: A struct that represents a memory block.
//! - `DRAMAddr`: Bank/row/column coordinates of a physical address.
//! - `BitRange`: A contiguous range of address bits.
mod consec_blocks;
mod dram_addr;
mod memblock;
mod pool;
mod timer;
mod virt_to_phys;

pub use self::consec_blocks::ConsecBlocks;
pub use self::dram_addr::{BitRange, BitRangeError, DRAMAddr};
pub use self::memblock::{
    BytePointer, ConsecPfns, Error as ConsecPfnsError, FormatPfns, GetConsecPfns, Memory,
};
pub use self::pool::{AddressPool, PhysPool, PoolError, SyntheticPool};
pub use self::timer::{MemoryTupleTimer, TimerError, construct_memory_tuple_timer, median};
pub use self::virt_to_phys::PhysAddr;
pub use self::virt_to_phys::{LinuxPageMap, LinuxPageMapError, VirtToPhysResolver};
