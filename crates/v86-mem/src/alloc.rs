//! First-fit allocator over the scratch region.
//!
//! The pool is described by an ordered list of blocks that always tiles the
//! whole region: the sizes sum to the pool size and each block starts where the
//! previous one ends. Allocation splits the first free block that is large
//! enough; freeing merges the released block with free neighbours so that two
//! free blocks are never adjacent.

use tracing::trace;

use crate::{AllocError, RealModeAddress};

/// Allocation granularity. Every block starts on a paragraph boundary so its
/// address can be handed to real-mode code as `segment:0000`.
pub const BLOCK_ALIGN: u32 = 16;

/// Default size of the descriptor table.
pub const DEFAULT_BLOCK_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    pub size: u32,
    pub free: bool,
}

#[derive(Debug, Clone)]
pub struct ScratchPool {
    base: RealModeAddress,
    size: u32,
    blocks: Vec<Block>,
    capacity: usize,
}

impl ScratchPool {
    /// Creates a pool spanning `size` bytes at `base` with room for at most
    /// `capacity` block descriptors.
    ///
    /// `base` should be paragraph aligned and `size` a multiple of
    /// [`BLOCK_ALIGN`]; a ragged tail is never handed out.
    pub fn new(base: RealModeAddress, size: u32, capacity: usize) -> Self {
        let size = size & !(BLOCK_ALIGN - 1);
        let capacity = capacity.max(1);
        let mut blocks = Vec::with_capacity(capacity);
        if size > 0 {
            blocks.push(Block { size, free: true });
        }
        Self {
            base,
            size,
            blocks,
            capacity,
        }
    }

    pub fn base(&self) -> RealModeAddress {
        self.base
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Start addresses and sizes of every live allocation, in address order.
    pub fn allocations(&self) -> impl Iterator<Item = (RealModeAddress, u32)> + '_ {
        let base = self.base.linear();
        self.blocks
            .iter()
            .scan(0u32, move |offset, block| {
                let start = *offset;
                *offset += block.size;
                Some((start, *block))
            })
            .filter(|(_, block)| !block.free)
            .filter_map(move |(start, block)| {
                RealModeAddress::new(base + start).map(|addr| (addr, block.size))
            })
    }

    pub fn free_bytes(&self) -> u32 {
        self.blocks.iter().filter(|b| b.free).map(|b| b.size).sum()
    }

    /// Reserves at least `size` bytes and returns the block's start address.
    pub fn alloc(&mut self, size: u32) -> Result<RealModeAddress, AllocError> {
        if size == 0 {
            return Err(AllocError::ZeroSize);
        }
        let rounded = size
            .checked_add(BLOCK_ALIGN - 1)
            .map(|s| s & !(BLOCK_ALIGN - 1))
            .ok_or(AllocError::Exhausted { requested: size })?;

        let mut offset = 0u32;
        let mut blocked_by_table = false;
        for i in 0..self.blocks.len() {
            let block = self.blocks[i];
            if block.free && block.size >= rounded {
                if block.size > rounded {
                    // Splitting needs a fresh descriptor; an exact fit further
                    // along may still succeed without one.
                    if self.blocks.len() == self.capacity {
                        blocked_by_table = true;
                        offset += block.size;
                        continue;
                    }
                    self.blocks.insert(
                        i + 1,
                        Block {
                            size: block.size - rounded,
                            free: true,
                        },
                    );
                }
                self.blocks[i] = Block {
                    size: rounded,
                    free: false,
                };
                let addr = RealModeAddress::new(self.base.linear() + offset)
                    .ok_or(AllocError::Exhausted { requested: size })?;
                trace!(%addr, size = rounded, "scratch alloc");
                return Ok(addr);
            }
            offset += block.size;
        }

        if blocked_by_table {
            Err(AllocError::TableFull {
                capacity: self.capacity,
            })
        } else {
            Err(AllocError::Exhausted { requested: size })
        }
    }

    /// Releases the allocation starting at `addr`.
    ///
    /// Addresses that are not the exact start of a live block are rejected
    /// without touching the pool.
    pub fn free(&mut self, addr: RealModeAddress) -> Result<(), AllocError> {
        let not_allocated = AllocError::NotAllocated { addr };
        let target = addr
            .offset_from(self.base)
            .ok_or_else(|| not_allocated.clone())?;

        let mut offset = 0u32;
        let mut found = None;
        for (i, block) in self.blocks.iter().enumerate() {
            if offset == target {
                found = Some(i);
                break;
            }
            if offset > target {
                break;
            }
            offset += block.size;
        }
        let mut i = found.ok_or_else(|| not_allocated.clone())?;
        if self.blocks[i].free {
            return Err(not_allocated);
        }

        self.blocks[i].free = true;
        if i + 1 < self.blocks.len() && self.blocks[i + 1].free {
            self.blocks[i].size += self.blocks[i + 1].size;
            self.blocks.remove(i + 1);
        }
        if i > 0 && self.blocks[i - 1].free {
            self.blocks[i - 1].size += self.blocks[i].size;
            self.blocks.remove(i);
            i -= 1;
        }
        trace!(%addr, merged = self.blocks[i].size, "scratch free");
        Ok(())
    }

    /// Whether `addr` falls inside the pool.
    pub fn contains(&self, addr: RealModeAddress) -> bool {
        addr.offset_from(self.base).is_some_and(|off| off < self.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(size: u32, capacity: usize) -> ScratchPool {
        ScratchPool::new(RealModeAddress::new(0x10000).unwrap(), size, capacity)
    }

    fn addr(linear: u32) -> RealModeAddress {
        RealModeAddress::new(linear).unwrap()
    }

    #[test]
    fn first_fit_hands_out_ascending_addresses() {
        let mut pool = pool(0x1000, 16);
        assert_eq!(pool.alloc(0x100).unwrap(), addr(0x10000));
        assert_eq!(pool.alloc(1).unwrap(), addr(0x10100));
        assert_eq!(pool.alloc(0x20).unwrap(), addr(0x10110));
        assert_eq!(pool.free_bytes(), 0x1000 - 0x130);
    }

    #[test]
    fn exact_fit_consumes_the_whole_pool() {
        let mut pool = pool(0x1000, 16);
        assert_eq!(pool.alloc(0x1000).unwrap(), addr(0x10000));
        assert_eq!(pool.blocks(), &[Block { size: 0x1000, free: false }]);
        assert!(pool.alloc(1).unwrap_err().is_exhausted());
    }

    #[test]
    fn oversized_request_is_exhaustion() {
        let mut pool = pool(0x1000, 16);
        assert_eq!(
            pool.alloc(0x1001),
            Err(AllocError::Exhausted { requested: 0x1001 })
        );
        assert_eq!(pool.alloc(0), Err(AllocError::ZeroSize));
    }

    #[test]
    fn freeing_coalesces_both_neighbours() {
        let mut pool = pool(0x300, 16);
        let a = pool.alloc(0x100).unwrap();
        let b = pool.alloc(0x100).unwrap();
        let c = pool.alloc(0x100).unwrap();
        pool.free(a).unwrap();
        pool.free(c).unwrap();
        assert_eq!(pool.blocks().len(), 3);
        pool.free(b).unwrap();
        assert_eq!(pool.blocks(), &[Block { size: 0x300, free: true }]);
    }

    #[test]
    fn free_of_unknown_or_interior_address_is_rejected() {
        let mut pool = pool(0x300, 16);
        let a = pool.alloc(0x100).unwrap();
        let before = pool.blocks().to_vec();

        assert_eq!(
            pool.free(addr(0x10010)),
            Err(AllocError::NotAllocated { addr: addr(0x10010) })
        );
        assert!(pool.free(addr(0x0FFF0)).is_err());
        assert!(pool.free(addr(0x10100)).is_err());
        assert_eq!(pool.blocks(), &before[..]);

        pool.free(a).unwrap();
        assert!(pool.free(a).is_err());
    }

    #[test]
    fn full_table_still_allows_exact_fit() {
        let mut pool = pool(0x400, 3);
        let a = pool.alloc(0x100).unwrap();
        let _b = pool.alloc(0x100).unwrap();
        assert_eq!(pool.blocks().len(), 3);
        pool.free(a).unwrap();

        assert_eq!(
            pool.alloc(0x10),
            Err(AllocError::TableFull { capacity: 3 })
        );
        assert_eq!(pool.alloc(0x100).unwrap(), a);
    }
}
