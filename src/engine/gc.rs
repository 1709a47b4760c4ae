//! Garbage collector: victim selection and the copy-forward stepper
//! (spec.md §4.H). The actual chunk rewrite (reading the tag, consulting
//! the object's tnode, reprogramming through the allocator) needs the
//! object graph and NAND driver, so it's supplied by the caller as
//! closures — this module owns the policy, not the flash I/O.

use crate::engine::block::{BlockFlags, BlockInfo, BlockLifecycle};
use crate::engine::error::{EngineError, EngineResult};

/// Background worker urgency, 0 (idle, may defer entirely) to 3 (forced).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum GcUrgency {
    Idle = 0,
    Low = 1,
    Medium = 2,
    Forced = 3,
}

pub struct GarbageCollector {
    pub gc_disable: bool,
    pub refresh_period: u32,
    pub passive_threshold: u16,
    skip_counter: u32,
}

impl GarbageCollector {
    pub fn new(refresh_period: u32, passive_threshold: u16) -> Self {
        Self { gc_disable: false, refresh_period, passive_threshold, skip_counter: 0 }
    }

    /// Four-policy victim selection, tried in priority order (spec.md §4.H).
    pub fn select_victim(&mut self, blocks: &[BlockInfo], urgency: GcUrgency) -> Option<u32> {
        if self.gc_disable || urgency == GcUrgency::Idle {
            return None;
        }
        self.forced_candidate(blocks)
            .or_else(|| self.oldest_dirty_candidate(blocks))
            .or_else(|| self.passive_candidate(blocks))
            .or_else(|| self.refresh_candidate(blocks))
    }

    fn forced_candidate(&self, blocks: &[BlockInfo]) -> Option<u32> {
        blocks
            .iter()
            .position(|b| b.flags.contains(BlockFlags::GC_PRIORITISE) && b.state != BlockLifecycle::Dead)
            .map(|i| i as u32)
    }

    fn oldest_dirty_candidate(&self, blocks: &[BlockInfo]) -> Option<u32> {
        let oldest_active = blocks
            .iter()
            .filter(|b| matches!(b.state, BlockLifecycle::Full | BlockLifecycle::Dirty | BlockLifecycle::Allocating))
            .map(|b| b.seq_number)
            .min()?;
        blocks
            .iter()
            .position(|b| b.state == BlockLifecycle::Dirty && b.seq_number == oldest_active)
            .map(|i| i as u32)
    }

    fn passive_candidate(&self, blocks: &[BlockInfo]) -> Option<u32> {
        blocks
            .iter()
            .enumerate()
            .filter(|(_, b)| b.state == BlockLifecycle::Dirty && b.pages_in_use < self.passive_threshold)
            .min_by_key(|(_, b)| b.pages_in_use)
            .map(|(i, _)| i as u32)
    }

    fn refresh_candidate(&mut self, blocks: &[BlockInfo]) -> Option<u32> {
        self.skip_counter += 1;
        if self.skip_counter < self.refresh_period {
            return None;
        }
        self.skip_counter = 0;
        blocks
            .iter()
            .enumerate()
            .filter(|(_, b)| b.state == BlockLifecycle::Full)
            .min_by_key(|(_, b)| b.seq_number)
            .map(|(i, _)| i as u32)
    }

    /// Walk `victim`'s chunks in physical order, copy-forwarding every live
    /// one, then erase. `is_live` decides whether a chunk still needs
    /// copying (unreachable/soft-deleted chunks are skipped, not copied);
    /// `copy_forward` performs the rewrite through the normal write path;
    /// `erase` performs the physical erase and reports success.
    pub fn collect_block(
        &mut self,
        blocks: &mut [BlockInfo],
        victim: u32,
        chunks_per_block: u32,
        mut is_live: impl FnMut(u32) -> bool,
        mut copy_forward: impl FnMut(u32) -> EngineResult<()>,
        mut erase: impl FnMut(u32) -> EngineResult<bool>,
    ) -> EngineResult<()> {
        blocks[victim as usize].state = BlockLifecycle::Collecting;
        for page in 0..chunks_per_block {
            if is_live(page) {
                copy_forward(page)?;
            }
        }
        if erase(victim)? {
            blocks[victim as usize].mark_erased();
            Ok(())
        } else {
            blocks[victim as usize].record_erase_strike();
            Err(EngineError::NandEraseFail)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(state: BlockLifecycle, seq: u32, pages_in_use: u16) -> BlockInfo {
        BlockInfo { state, seq_number: seq, pages_in_use, ..Default::default() }
    }

    #[test]
    fn forced_beats_everything() {
        let mut blocks = vec![block(BlockLifecycle::Dirty, 1, 0), block(BlockLifecycle::Full, 2, 10)];
        blocks[1].flags.insert(BlockFlags::GC_PRIORITISE);
        let mut gc = GarbageCollector::new(1000, 5);
        assert_eq!(gc.select_victim(&blocks, GcUrgency::Low), Some(1));
    }

    #[test]
    fn oldest_dirty_releases_oldest_sequence() {
        let blocks = vec![block(BlockLifecycle::Dirty, 1, 0), block(BlockLifecycle::Full, 2, 10)];
        let mut gc = GarbageCollector::new(1000, 0);
        assert_eq!(gc.select_victim(&blocks, GcUrgency::Low), Some(0));
    }

    #[test]
    fn passive_prefers_dirtiest_under_threshold() {
        let blocks = vec![block(BlockLifecycle::Dirty, 5, 3), block(BlockLifecycle::Dirty, 6, 1)];
        let mut gc = GarbageCollector::new(1000, 4);
        // oldest_dirty would also fire here (both are Dirty, seq 5 is the
        // min among active blocks) — push seq 5 out of range to isolate passive.
        let blocks2 = vec![block(BlockLifecycle::Full, 1, 10), block(BlockLifecycle::Dirty, 6, 1), block(BlockLifecycle::Dirty, 7, 3)];
        let _ = blocks;
        assert_eq!(gc.select_victim(&blocks2, GcUrgency::Low), Some(1));
    }

    #[test]
    fn refresh_fires_every_period() {
        let blocks = vec![block(BlockLifecycle::Full, 1, 10), block(BlockLifecycle::Full, 2, 10)];
        let mut gc = GarbageCollector::new(2, 0);
        assert_eq!(gc.select_victim(&blocks, GcUrgency::Low), None);
        assert_eq!(gc.select_victim(&blocks, GcUrgency::Low), Some(0));
    }

    #[test]
    fn idle_urgency_defers() {
        let blocks = vec![block(BlockLifecycle::Dirty, 1, 0)];
        let mut gc = GarbageCollector::new(1, 0);
        assert_eq!(gc.select_victim(&blocks, GcUrgency::Idle), None);
    }
}
