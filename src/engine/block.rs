//! Per-block bookkeeping and the global chunk bitmap (spec.md §3, §4.C).

use bitflags::bitflags;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockLifecycle {
    Unknown,
    Scanning,
    NeedsScan,
    Empty,
    Allocating,
    Full,
    Dirty,
    Checkpoint,
    Collecting,
    Dead,
}

impl Default for BlockLifecycle {
    fn default() -> Self {
        BlockLifecycle::Unknown
    }
}

bitflags! {
    #[derive(Default)]
    pub struct BlockFlags: u8 {
        const NEEDS_RETIRING   = 0b0000_0001;
        const SKIP_ERASED_CHECK = 0b0000_0010;
        const GC_PRIORITISE    = 0b0000_0100;
        const HAS_SUMMARY      = 0b0000_1000;
        const HAS_SHRINK_HDR   = 0b0001_0000;
    }
}

const MAX_STRIKES: u8 = 3;

#[derive(Debug, Clone, Default)]
pub struct BlockInfo {
    pub state: BlockLifecycle,
    pub seq_number: u32,
    /// 10-bit counters in the original; plain `u16` here, kept under 1024
    /// by construction (`chunks_per_block` never exceeds that in practice).
    pub pages_in_use: u16,
    pub soft_del_pages: u16,
    pub flags: BlockFlags,
    pub strikes: u8,
}

impl BlockInfo {
    pub fn fresh_empty() -> Self {
        Self { state: BlockLifecycle::Empty, ..Default::default() }
    }

    pub fn add_live_chunk(&mut self) {
        self.pages_in_use += 1;
    }

    /// A chunk in this block was deleted or soft-deleted.
    pub fn retire_chunk(&mut self, soft: bool) {
        debug_assert!(self.pages_in_use > 0);
        self.pages_in_use -= 1;
        if soft {
            self.soft_del_pages += 1;
        }
        if self.pages_in_use == 0 && self.state == BlockLifecycle::Full {
            self.state = BlockLifecycle::Dirty;
        }
    }

    pub fn invariant_holds(&self) -> bool {
        self.soft_del_pages <= self.pages_in_use
    }

    /// Called after an erase failure; returns true once the block must be
    /// retired (spec.md §4.H: three strikes).
    pub fn record_erase_strike(&mut self) -> bool {
        self.strikes += 1;
        if self.strikes >= MAX_STRIKES {
            self.state = BlockLifecycle::Dead;
            self.flags.insert(BlockFlags::NEEDS_RETIRING);
            true
        } else {
            false
        }
    }

    pub fn mark_erased(&mut self) {
        self.state = BlockLifecycle::Empty;
        self.pages_in_use = 0;
        self.soft_del_pages = 0;
        self.strikes = 0;
        self.flags.remove(BlockFlags::HAS_SHRINK_HDR | BlockFlags::HAS_SUMMARY | BlockFlags::GC_PRIORITISE);
    }
}

/// Flat physical chunk address: `block_slot * chunks_per_block + page`.
/// Used uniformly by the tnode tree, object headers, and the chunk bitmap
/// so a chunk number round-trips through all three without re-deriving
/// block/page arithmetic differently in each place.
pub fn chunk_addr(block_slot: u32, page: u32, chunks_per_block: u32) -> u32 {
    block_slot * chunks_per_block + page
}

pub fn split_chunk_addr(addr: u32, chunks_per_block: u32) -> (u32, u32) {
    (addr / chunks_per_block, addr % chunks_per_block)
}

/// One bit per chunk of every block, tracking which chunks are live
/// (spec.md §4.C). Indexed by absolute chunk number (`block_index *
/// chunks_per_block + page`), not by on-flash block id, so the allocator
/// can address it directly.
#[derive(Debug, Clone)]
pub struct ChunkBitmap {
    bits: Vec<u8>,
    chunks_per_block: u32,
}

impl ChunkBitmap {
    pub fn new(n_blocks: u32, chunks_per_block: u32) -> Self {
        let n_chunks = n_blocks as usize * chunks_per_block as usize;
        Self { bits: vec![0u8; (n_chunks + 7) / 8], chunks_per_block }
    }

    /// Rebuild from the raw bytes a checkpoint stored (spec.md §4.J: the
    /// bitmap rides along with the rest of the device summary).
    pub fn from_bits(bits: Vec<u8>, chunks_per_block: u32) -> Self {
        Self { bits, chunks_per_block }
    }

    pub fn bits(&self) -> &[u8] {
        &self.bits
    }

    fn index(&self, block_slot: u32, page: u32) -> usize {
        (block_slot * self.chunks_per_block + page) as usize
    }

    pub fn is_set(&self, block_slot: u32, page: u32) -> bool {
        let idx = self.index(block_slot, page);
        self.bits[idx / 8] & (1 << (idx % 8)) != 0
    }

    pub fn set(&mut self, block_slot: u32, page: u32) {
        let idx = self.index(block_slot, page);
        self.bits[idx / 8] |= 1 << (idx % 8);
    }

    pub fn clear(&mut self, block_slot: u32, page: u32) {
        let idx = self.index(block_slot, page);
        self.bits[idx / 8] &= !(1 << (idx % 8));
    }

    pub fn clear_block(&mut self, block_slot: u32) {
        for page in 0..self.chunks_per_block {
            self.clear(block_slot, page);
        }
    }

    /// Count of set bits within one block's chunk range — used to verify
    /// `pages_in_use` matches the bitmap (spec.md §8, invariant 2).
    pub fn count_block(&self, block_slot: u32) -> u32 {
        (0..self.chunks_per_block).filter(|&p| self.is_set(block_slot, p)).count() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pages_in_use_matches_bitmap_count() {
        let mut bitmap = ChunkBitmap::new(4, 8);
        let mut info = BlockInfo::fresh_empty();
        info.state = BlockLifecycle::Full;
        for page in [0, 1, 2] {
            bitmap.set(1, page);
            info.add_live_chunk();
        }
        assert_eq!(bitmap.count_block(1), info.pages_in_use as u32);
        assert!(info.invariant_holds());
    }

    #[test]
    fn block_dirties_when_last_live_chunk_goes() {
        let mut info = BlockInfo::fresh_empty();
        info.state = BlockLifecycle::Full;
        info.add_live_chunk();
        info.retire_chunk(false);
        assert_eq!(info.state, BlockLifecycle::Dirty);
    }

    #[test]
    fn three_strikes_retires_block() {
        let mut info = BlockInfo::fresh_empty();
        assert!(!info.record_erase_strike());
        assert!(!info.record_erase_strike());
        assert!(info.record_erase_strike());
        assert_eq!(info.state, BlockLifecycle::Dead);
    }
}
