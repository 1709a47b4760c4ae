//! File-backed NAND: a regular file stands in for the flash part, one
//! "erase" fills the block's byte range with 0xff, one "program" writes a
//! page's worth of bytes. Used by the CLI to persist an image across runs.

use crate::{check_block_range, check_page_range, EccResult, NandDriver, NandGeometry, NandOutcome};
use anyhow::{bail, Result};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

const ERASED: u8 = 0xff;

pub struct FileNand {
    geometry: NandGeometry,
    file: File,
    /// Highest page programmed per block since the last erase, -1 if none.
    high_water: Vec<i64>,
    bad: Vec<bool>,
}

impl FileNand {
    /// Open (creating if needed) `path` as a NAND image of `geometry`,
    /// filling any newly-created region with the erased byte value.
    pub fn open(path: impl AsRef<Path>, geometry: NandGeometry) -> Result<Self> {
        let bytes_per_page = geometry.total_bytes_per_chunk() as u64;
        let image_len = bytes_per_page * geometry.n_chunks();
        let path = path.as_ref();
        let existed = path.exists();
        let file = OpenOptions::new().read(true).write(true).create(true).open(path)?;
        if !existed {
            file.set_len(image_len)?;
            let fill = vec![ERASED; bytes_per_page as usize];
            for chunk in 0..geometry.n_chunks() {
                file.write_at(&fill, chunk * bytes_per_page)?;
            }
        } else if file.metadata()?.len() != image_len {
            bail!(
                "image {} has length {} but geometry expects {}",
                path.display(),
                file.metadata()?.len(),
                image_len
            );
        }
        let n_blocks = geometry.n_blocks() as usize;
        Ok(Self {
            geometry,
            file,
            high_water: vec![-1; n_blocks],
            bad: vec![false; n_blocks],
        })
    }

    fn page_offset(&self, block: u32, page: u32) -> u64 {
        let bytes_per_page = self.geometry.total_bytes_per_chunk() as u64;
        let block_index = (block - self.geometry.start_block) as u64;
        (block_index * self.geometry.chunks_per_block as u64 + page as u64) * bytes_per_page
    }

    fn slot(&self, block: u32) -> usize {
        (block - self.geometry.start_block) as usize
    }
}

impl NandDriver for FileNand {
    fn deinit(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

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
        let slot = self.slot(block);
        if self.bad[slot] {
            return Ok(NandOutcome::PermanentFailure);
        }
        if page as i64 <= self.high_water[slot] {
            bail!("block {} page {} already programmed; must erase first", block, page);
        }
        let off = self.page_offset(block, page);
        self.file.write_at(data, off)?;
        self.file.write_at(oob, off + data.len() as u64)?;
        self.high_water[slot] = page as i64;
        Ok(NandOutcome::Ok)
    }

    fn read_chunk(&mut self, block: u32, page: u32, data_out: &mut [u8], oob_out: &mut [u8]) -> Result<EccResult> {
        check_block_range(&self.geometry, block)?;
        check_page_range(&self.geometry, page)?;
        let off = self.page_offset(block, page);
        self.file.read_exact_at(data_out, off)?;
        self.file.read_exact_at(oob_out, off + data_out.len() as u64)?;
        Ok(EccResult::NoError)
    }

    fn erase_block(&mut self, block: u32) -> Result<NandOutcome> {
        check_block_range(&self.geometry, block)?;
        let bytes_per_page = self.geometry.total_bytes_per_chunk() as usize;
        let fill = vec![ERASED; bytes_per_page];
        for page in 0..self.geometry.chunks_per_block {
            let off = self.page_offset(block, page);
            self.file.write_at(&fill, off)?;
        }
        self.high_water[self.slot(block)] = -1;
        Ok(NandOutcome::Ok)
    }

    fn mark_bad(&mut self, block: u32) -> Result<()> {
        check_block_range(&self.geometry, block)?;
        let slot = self.slot(block);
        self.bad[slot] = true;
        Ok(())
    }

    fn check_bad(&mut self, block: u32) -> Result<bool> {
        check_block_range(&self.geometry, block)?;
        Ok(self.bad[self.slot(block)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    fn test_geometry() -> NandGeometry {
        NandGeometry {
            data_bytes_per_chunk: 512,
            spare_bytes_per_chunk: 16,
            chunks_per_block: 4,
            start_block: 0,
            end_block: 3,
            n_reserved_blocks: 1,
        }
    }

    #[test]
    fn program_then_read_round_trips() -> Result<()> {
        let path = env::temp_dir().join(format!("nandfs-test-{}.img", rand::random::<u32>()));
        let mut nand = FileNand::open(&path, test_geometry())?;
        let data = vec![0x42; 512];
        let oob = vec![0x07; 16];
        nand.program_chunk(0, 0, &data, &oob)?;
        let mut d = vec![0u8; 512];
        let mut o = vec![0u8; 16];
        nand.read_chunk(0, 0, &mut d, &mut o)?;
        assert_eq!(d, data);
        assert_eq!(o, oob);
        std::fs::remove_file(&path).ok();
        Ok(())
    }

    #[test]
    fn reopening_preserves_contents() -> Result<()> {
        let path = env::temp_dir().join(format!("nandfs-test-{}.img", rand::random::<u32>()));
        {
            let mut nand = FileNand::open(&path, test_geometry())?;
            nand.program_chunk(0, 0, &vec![9; 512], &vec![1; 16])?;
            nand.deinit()?;
        }
        {
            let mut nand = FileNand::open(&path, test_geometry())?;
            let mut d = vec![0u8; 512];
            let mut o = vec![0u8; 16];
            nand.read_chunk(0, 0, &mut d, &mut o)?;
            assert_eq!(d, vec![9; 512]);
            assert_eq!(o, vec![1; 16]);
        }
        std::fs::remove_file(&path).ok();
        Ok(())
    }
}
