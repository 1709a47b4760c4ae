//! Allocator: pick the next free chunk, reserve blocks for GC (spec.md §4.G).

use crate::engine::block::{BlockInfo, BlockLifecycle};
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::header::{HIGHEST_SEQUENCE_NUMBER, LOWEST_SEQUENCE_NUMBER};

pub struct Allocator {
    pub alloc_block: Option<u32>,
    pub alloc_page: u32,
    pub chunks_per_block: u32,
    pub n_reserved_blocks: u32,
    next_seq_number: u32,
    last_finder_position: u32,
}

impl Allocator {
    pub fn new(chunks_per_block: u32, n_reserved_blocks: u32) -> Self {
        Self {
            alloc_block: None,
            alloc_page: 0,
            chunks_per_block,
            n_reserved_blocks,
            next_seq_number: LOWEST_SEQUENCE_NUMBER,
            last_finder_position: 0,
        }
    }

    /// Resume numbering after a scan that found the highest sequence
    /// number already in use on the device.
    pub fn resume_sequence_at(&mut self, highest_seen: u32) {
        self.next_seq_number = highest_seen.saturating_add(1).max(LOWEST_SEQUENCE_NUMBER);
    }

    fn next_sequence_number(&mut self) -> EngineResult<u32> {
        if self.next_seq_number > HIGHEST_SEQUENCE_NUMBER {
            return Err(EngineError::OutOfMemory);
        }
        let seq = self.next_seq_number;
        self.next_seq_number += 1;
        Ok(seq)
    }

    /// Count of blocks currently `Empty` in `blocks`.
    pub fn n_free_blocks(blocks: &[BlockInfo]) -> u32 {
        blocks.iter().filter(|b| b.state == BlockLifecycle::Empty).count() as u32
    }

    /// Whether `n` more chunks can be programmed without eating the GC
    /// reserve (spec.md §4.G `check_alloc_available`).
    pub fn check_alloc_available(&self, blocks: &[BlockInfo], n: u32) -> bool {
        let free = Self::n_free_blocks(blocks);
        let chunks_needed_blocks = (n + self.chunks_per_block - 1) / self.chunks_per_block.max(1);
        free >= self.n_reserved_blocks + chunks_needed_blocks || (self.alloc_block.is_some() && chunks_needed_blocks == 0)
    }

    /// Scan forward from the last finder position for an `Empty` block,
    /// transition it to `Allocating`, assign its sequence number, and make
    /// it the current allocation cursor.
    pub fn alloc_block_finder(&mut self, blocks: &mut [BlockInfo]) -> EngineResult<u32> {
        let n = blocks.len() as u32;
        if n == 0 {
            return Err(EngineError::NoSpace);
        }
        for i in 0..n {
            let slot = (self.last_finder_position + i) % n;
            if blocks[slot as usize].state == BlockLifecycle::Empty {
                let seq = self.next_sequence_number()?;
                blocks[slot as usize].state = BlockLifecycle::Allocating;
                blocks[slot as usize].seq_number = seq;
                self.last_finder_position = (slot + 1) % n;
                self.alloc_block = Some(slot);
                self.alloc_page = 0;
                return Ok(slot);
            }
        }
        Err(EngineError::NoSpace)
    }

    /// Reserve the next chunk slot in the current allocation block,
    /// finding a new block first if none is active or the current one is
    /// full. Returns `(block_slot, page)`. Honors the GC reserve: once
    /// free blocks (beyond the current allocation block) drop to
    /// `n_reserved_blocks`, new user writes fail with `NoSpace` while GC
    /// may still proceed via [`alloc_for_gc`](Self::alloc_for_gc).
    pub fn next_chunk(&mut self, blocks: &mut [BlockInfo], for_gc: bool) -> EngineResult<(u32, u32)> {
        if let Some(block) = self.alloc_block {
            if self.alloc_page < self.chunks_per_block && blocks[block as usize].state == BlockLifecycle::Allocating {
                let page = self.alloc_page;
                self.alloc_page += 1;
                if self.alloc_page == self.chunks_per_block {
                    blocks[block as usize].state = BlockLifecycle::Full;
                    self.alloc_block = None;
                }
                return Ok((block, page));
            }
        }
        let free = Self::n_free_blocks(blocks);
        if !for_gc && free <= self.n_reserved_blocks {
            return Err(EngineError::NoSpace);
        }
        if for_gc && free == 0 {
            return Err(EngineError::NoSpace);
        }
        let block = self.alloc_block_finder(blocks)?;
        let page = self.alloc_page;
        self.alloc_page += 1;
        if self.alloc_page == self.chunks_per_block {
            blocks[block as usize].state = BlockLifecycle::Full;
            self.alloc_block = None;
        }
        Ok((block, page))
    }

    pub fn alloc_for_gc(&mut self, blocks: &mut [BlockInfo]) -> EngineResult<(u32, u32)> {
        self.next_chunk(blocks, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_blocks(n: usize) -> Vec<BlockInfo> {
        (0..n).map(|_| BlockInfo::fresh_empty()).collect()
    }

    #[test]
    fn allocates_sequential_pages_in_one_block() {
        let mut blocks = fresh_blocks(4);
        let mut alloc = Allocator::new(4, 1);
        let (b0, p0) = alloc.next_chunk(&mut blocks, false).unwrap();
        let (b1, p1) = alloc.next_chunk(&mut blocks, false).unwrap();
        assert_eq!(b0, b1);
        assert_eq!((p0, p1), (0, 1));
    }

    #[test]
    fn fills_block_then_moves_on() {
        let mut blocks = fresh_blocks(4);
        let mut alloc = Allocator::new(2, 1);
        let (first_block, _) = alloc.next_chunk(&mut blocks, false).unwrap();
        alloc.next_chunk(&mut blocks, false).unwrap();
        assert_eq!(blocks[first_block as usize].state, BlockLifecycle::Full);
        let (second_block, _) = alloc.next_chunk(&mut blocks, false).unwrap();
        assert_ne!(first_block, second_block);
    }

    #[test]
    fn honors_reserve_for_user_writes() {
        let mut blocks = fresh_blocks(2);
        let mut alloc = Allocator::new(2, 1);
        // consume the one non-reserved block fully
        alloc.next_chunk(&mut blocks, false).unwrap();
        alloc.next_chunk(&mut blocks, false).unwrap();
        assert_eq!(alloc.next_chunk(&mut blocks, false).unwrap_err(), EngineError::NoSpace);
        // GC can still dip into the reserve
        assert!(alloc.alloc_for_gc(&mut blocks).is_ok());
    }

    #[test]
    fn sequence_numbers_are_monotonic() {
        let mut blocks = fresh_blocks(3);
        let mut alloc = Allocator::new(1, 0);
        alloc.next_chunk(&mut blocks, false).unwrap();
        let seq_a = blocks.iter().find(|b| b.seq_number != 0).unwrap().seq_number;
        alloc.next_chunk(&mut blocks, false).unwrap();
        let seq_b = blocks.iter().filter(|b| b.seq_number != 0).map(|b| b.seq_number).max().unwrap();
        assert!(seq_b > seq_a);
    }
}
