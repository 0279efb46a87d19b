use crate::memory::memblock::{self, GetConsecPfns};
use crate::memory::{BytePointer, Memory, PhysAddr};

/// Collection of memory blocks forming one allocation.
///
/// This struct manages multiple [`Memory`] blocks that may or may not be physically
/// contiguous. It provides a unified interface for accessing memory across multiple
/// allocations while tracking physical address ranges.
#[derive(Clone, Debug)]
pub struct ConsecBlocks {
    /// Vector of memory blocks managed by this collection
    pub blocks: Vec<Memory>,
}

impl ConsecBlocks {
    /// Creates a new collection of memory blocks.
    ///
    /// # Arguments
    ///
    /// * `blocks` - Vector of memory blocks to manage
    pub fn new(blocks: Vec<Memory>) -> Self {
        ConsecBlocks { blocks }
    }

    /// Deallocates all memory blocks in this collection.
    ///
    /// Consumes self and frees all underlying memory allocations.
    pub fn dealloc(self) {
        for block in self.blocks {
            block.dealloc();
        }
    }
}

impl BytePointer for ConsecBlocks {
    fn addr(&self, offset: usize) -> *mut u8 {
        assert!(offset < self.len(), "Offset {} >= {}", offset, self.len());
        let mut offset = offset;
        for block in &self.blocks {
            if offset < block.len {
                return block.addr(offset);
            }
            offset -= block.len;
        }
        unreachable!("block not found for offset 0x{:x}", offset);
    }

    fn ptr(&self) -> *mut u8 {
        self.blocks
            .first()
            .map_or(std::ptr::null_mut(), |block| block.ptr())
    }

    fn len(&self) -> usize {
        self.blocks.iter().map(|block| block.len).sum()
    }
}

impl GetConsecPfns for ConsecBlocks {
    fn page_pfns(&self) -> memblock::Result<Vec<PhysAddr>> {
        let mut pfns = vec![];
        for block in &self.blocks {
            pfns.extend(block.page_pfns()?);
        }
        Ok(pfns)
    }
}
