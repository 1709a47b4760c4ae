//! In-RAM NAND, the fixture device used by the engine's test suite.

use crate::{check_block_range, check_page_range, EccResult, NandDriver, NandGeometry, NandOutcome};
use anyhow::{bail, Result};
use std::collections::HashSet;

/// Byte value of an erased NAND cell.
const ERASED: u8 = 0xff;

struct BlockState {
    /// Concatenated data+oob bytes for every page, `ERASED` until programmed.
    pages: Vec<u8>,
    /// Highest page index programmed so far, -1 meaning none (block erased).
    high_water: i64,
    bad: bool,
}

impl BlockState {
    fn fresh(bytes_per_page: usize, chunks_per_block: u32) -> Self {
        Self {
            pages: vec![ERASED; bytes_per_page * chunks_per_block as usize],
            high_water: -1,
            bad: false,
        }
    }
}

/// A RAM-backed `NandDriver`. Supports fault injection so the scanner and
/// allocator/GC tests can exercise ECC and bad-block paths without real
/// hardware: see [`MemoryNand::inject_ecc_unfixed`] and
/// [`MemoryNand::inject_permanent_failure`].
pub struct MemoryNand {
    geometry: NandGeometry,
    blocks: Vec<BlockState>,
    ecc_unfixed: HashSet<(u32, u32)>,
    ecc_fixed: HashSet<(u32, u32)>,
    program_failures: HashSet<u32>,
    erase_failures: HashSet<u32>,
}

impl MemoryNand {
    pub fn new(geometry: NandGeometry) -> Self {
        let bytes_per_page = geometry.total_bytes_per_chunk() as usize;
        let n_blocks = geometry.n_blocks() as usize;
        let blocks = (0..n_blocks)
            .map(|_| BlockState::fresh(bytes_per_page, geometry.chunks_per_block))
            .collect();
        Self {
            geometry,
            blocks,
            ecc_unfixed: HashSet::new(),
            ecc_fixed: HashSet::new(),
            program_failures: HashSet::new(),
            erase_failures: HashSet::new(),
        }
    }

    fn slot(&self, block: u32) -> &BlockState {
        &self.blocks[(block - self.geometry.start_block) as usize]
    }

    fn slot_mut(&mut self, block: u32) -> &mut BlockState {
        &mut self.blocks[(block - self.geometry.start_block) as usize]
    }

    /// Make the next read of `(block, page)` report an uncorrectable ECC error.
    pub fn inject_ecc_unfixed(&mut self, block: u32, page: u32) {
        self.ecc_unfixed.insert((block, page));
    }

    /// Make the next read of `(block, page)` report a corrected ECC error.
    pub fn inject_ecc_fixed(&mut self, block: u32, page: u32) {
        self.ecc_fixed.insert((block, page));
    }

    /// Make the next program attempt on `block` fail permanently.
    pub fn inject_permanent_failure(&mut self, block: u32) {
        self.program_failures.insert(block);
    }

    /// Make the next erase attempt on `block` fail permanently.
    pub fn inject_erase_failure(&mut self, block: u32) {
        self.erase_failures.insert(block);
    }
}

impl NandDriver for MemoryNand {
    fn geometry(&self) -> &NandGeometry {
        &self.geometry
    }

    fn program_chunk(&mut self, block: u32, page: u32, data: &[u8], oob: &[u8]) -> Result<NandOutcome> {
        check_block_range(&self.geometry, block)?;
        check_page_range(&self.geometry, page)?;
        if data.len() != self.geometry.data_bytes_per_chunk as usize {
            bail!("data length {} != {}", data.len(), self.geometry.data_bytes_per_chunk);
        }
        if oob.len() != self.geometry.spare_bytes_per_chunk as usize {
            bail!("oob length {} != {}", oob.len(), self.geometry.spare_bytes_per_chunk);
        }
        if self.program_failures.remove(&block) {
            return Ok(NandOutcome::PermanentFailure);
        }
        let bytes_per_page = self.geometry.total_bytes_per_chunk() as usize;
        let state = self.slot_mut(block);
        if state.bad {
            return Ok(NandOutcome::PermanentFailure);
        }
        if page as i64 <= state.high_water {
            bail!("block {} page {} already programmed; must erase first", block, page);
        }
        let off = page as usize * bytes_per_page;
        state.pages[off..off + data.len()].copy_from_slice(data);
        state.pages[off + data.len()..off + data.len() + oob.len()].copy_from_slice(oob);
        state.high_water = page as i64;
        Ok(NandOutcome::Ok)
    }

    fn read_chunk(&mut self, block: u32, page: u32, data_out: &mut [u8], oob_out: &mut [u8]) -> Result<EccResult> {
        check_block_range(&self.geometry, block)?;
        check_page_range(&self.geometry, page)?;
        let bytes_per_page = self.geometry.total_bytes_per_chunk() as usize;
        let state = self.slot(block);
        let off = page as usize * bytes_per_page;
        data_out.copy_from_slice(&state.pages[off..off + data_out.len()]);
        oob_out.copy_from_slice(&state.pages[off + data_out.len()..off + data_out.len() + oob_out.len()]);
        if self.ecc_unfixed.remove(&(block, page)) {
            return Ok(EccResult::Unfixed);
        }
        if self.ecc_fixed.remove(&(block, page)) {
            return Ok(EccResult::Fixed);
        }
        Ok(EccResult::NoError)
    }

    fn erase_block(&mut self, block: u32) -> Result<NandOutcome> {
        check_block_range(&self.geometry, block)?;
        if self.erase_failures.remove(&block) {
            self.slot_mut(block).bad = true;
            return Ok(NandOutcome::PermanentFailure);
        }
        let bytes_per_page = self.geometry.total_bytes_per_chunk() as usize;
        let chunks_per_block = self.geometry.chunks_per_block;
        let state = self.slot_mut(block);
        state.pages = vec![ERASED; bytes_per_page * chunks_per_block as usize];
        state.high_water = -1;
        Ok(NandOutcome::Ok)
    }

    fn mark_bad(&mut self, block: u32) -> Result<()> {
        check_block_range(&self.geometry, block)?;
        self.slot_mut(block).bad = true;
        Ok(())
    }

    fn check_bad(&mut self, block: u32) -> Result<bool> {
        check_block_range(&self.geometry, block)?;
        Ok(self.slot(block).bad)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_geometry() -> NandGeometry {
        NandGeometry {
            data_bytes_per_chunk: 512,
            spare_bytes_per_chunk: 16,
            chunks_per_block: 32,
            start_block: 0,
            end_block: 15,
            n_reserved_blocks: 2,
        }
    }

    #[test]
    fn program_then_read_round_trips() -> Result<()> {
        let mut nand = MemoryNand::new(test_geometry());
        let data = vec![0xab; 512];
        let oob = vec![0x01; 16];
        assert_eq!(nand.program_chunk(0, 0, &data, &oob)?, NandOutcome::Ok);
        let mut data_out = vec![0u8; 512];
        let mut oob_out = vec![0u8; 16];
        let ecc = nand.read_chunk(0, 0, &mut data_out, &mut oob_out)?;
        assert_eq!(ecc, EccResult::NoError);
        assert_eq!(data_out, data);
        assert_eq!(oob_out, oob);
        Ok(())
    }

    #[test]
    fn out_of_order_program_rejected() -> Result<()> {
        let mut nand = MemoryNand::new(test_geometry());
        let data = vec![0; 512];
        let oob = vec![0; 16];
        nand.program_chunk(0, 1, &data, &oob)?;
        assert!(nand.program_chunk(0, 0, &data, &oob).is_err());
        Ok(())
    }

    #[test]
    fn erase_resets_high_water_mark() -> Result<()> {
        let mut nand = MemoryNand::new(test_geometry());
        let data = vec![0; 512];
        let oob = vec![0; 16];
        nand.program_chunk(0, 0, &data, &oob)?;
        nand.erase_block(0)?;
        assert_eq!(nand.program_chunk(0, 0, &data, &oob)?, NandOutcome::Ok);
        Ok(())
    }

    #[test]
    fn injected_ecc_unfixed_surfaces_once() -> Result<()> {
        let mut nand = MemoryNand::new(test_geometry());
        let data = vec![0; 512];
        let oob = vec![0; 16];
        nand.program_chunk(0, 0, &data, &oob)?;
        nand.inject_ecc_unfixed(0, 0);
        let mut d = vec![0u8; 512];
        let mut o = vec![0u8; 16];
        assert_eq!(nand.read_chunk(0, 0, &mut d, &mut o)?, EccResult::Unfixed);
        assert_eq!(nand.read_chunk(0, 0, &mut d, &mut o)?, EccResult::NoError);
        Ok(())
    }

    #[test]
    fn mark_bad_blocks_further_programming() -> Result<()> {
        let mut nand = MemoryNand::new(test_geometry());
        nand.mark_bad(1)?;
        assert!(nand.check_bad(1)?);
        let data = vec![0; 512];
        let oob = vec![0; 16];
        assert_eq!(nand.program_chunk(1, 0, &data, &oob)?, NandOutcome::PermanentFailure);
        Ok(())
    }
}
