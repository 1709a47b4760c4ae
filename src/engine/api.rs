//! Top-level device API (spec.md §4.K): the `Device` type that wires the
//! allocator, block table, chunk bitmap, object graph, tnode trees, chunk
//! cache, tag codec, scanner, checkpoint codec and garbage collector
//! together into one coherent filesystem engine over a `NandDriver`.
//!
//! File data is written through, not write-back: the chunk cache here only
//! ever holds clean read copies (and GC's locked copy-forward buffer). That
//! keeps `flush`/checkpoint trivial — there is never a dirty chunk still
//! sitting in RAM at unmount — at the cost of not batching small writes into
//! one chunk program. See DESIGN.md for why that trade was made.

use crate::engine::alloc::Allocator;
use crate::engine::block::{chunk_addr, split_chunk_addr, BlockInfo, BlockLifecycle, ChunkBitmap};
use crate::engine::cache::{CacheEntry, ChunkCacheManager};
use crate::engine::checkpoint::{self, DeviceRuntimeSummary};
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::gc::{GarbageCollector, GcUrgency};
use crate::engine::header::{
    is_reserved_object_id, ExtraTags, ObjectHeaderRecord, Tags, CHECKPOINT_BLOCK_SLOT, CHECKPOINT_MAGIC,
    CHECKPOINT_VERSION, OBJECTID_LOSTNFOUND, OBJECTID_ROOT, WR_ATTEMPTS,
};
use crate::engine::mount::{DeviceStats, MountOptions};
use crate::engine::object::{Object, ObjectFlags, ObjectTable, ObjectVariant, XattrFlags};
use crate::engine::scan::{self, ensure_root_and_lostnfound};
use crate::engine::tags::{TagCodec, TagStorage, Yaffs1Codec, Yaffs2Codec};
use disk_driver::{NandDriver, NandGeometry, NandOutcome};
use std::collections::HashSet;

fn now() -> u32 {
    chrono::Utc::now().timestamp() as u32
}

fn build_codec(mount: &MountOptions) -> Box<dyn TagCodec + Send> {
    if mount.legacy_yaffs1_tags {
        Box::new(Yaffs1Codec)
    } else {
        Box::new(Yaffs2Codec { storage: mount.tag_storage, ecc_enabled: mount.tags_ecc })
    }
}

/// A mounted filesystem. Generic over the backing `NandDriver` so the same
/// engine runs against `MemoryNand` in tests and `FileNand` in the binary.
pub struct Device<D: NandDriver> {
    nand: D,
    geometry: NandGeometry,
    codec: Box<dyn TagCodec + Send>,
    mount: MountOptions,
    blocks: Vec<BlockInfo>,
    bitmap: ChunkBitmap,
    objects: ObjectTable,
    alloc: Allocator,
    gc: GarbageCollector,
    cache: ChunkCacheManager,
    pub stats: DeviceStats,
    /// Directories whose `mtime`/`ctime` changed but whose header chunk
    /// hasn't been rewritten yet (SPEC_FULL §3: a directory's on-flash
    /// header carries no child list — only the children's own
    /// `parent_obj_id` does — so adding/removing an entry never needs an
    /// immediate header rewrite; only the timestamp touch does, and that's
    /// worth batching).
    dirty_dirs: HashSet<u32>,
    read_only: bool,
}

impl<D: NandDriver> Device<D> {
    fn chunk_payload_len(&self) -> usize {
        let data_len = self.geometry.data_bytes_per_chunk as usize;
        let tag_len = self.codec.packed_len();
        if self.mount.tag_storage == TagStorage::OutOfBand && self.geometry.spare_bytes_per_chunk as usize >= tag_len {
            data_len
        } else {
            data_len - tag_len
        }
    }

    fn pack_chunk(&self, payload: &[u8], tags: &Tags, extra: Option<&ExtraTags>) -> (Vec<u8>, Vec<u8>) {
        let tag_bytes = self.codec.encode(tags, extra);
        let mut data_buf = vec![0u8; self.geometry.data_bytes_per_chunk as usize];
        let mut oob_buf = vec![0u8; self.geometry.spare_bytes_per_chunk as usize];
        if self.mount.tag_storage == TagStorage::OutOfBand && oob_buf.len() >= tag_bytes.len() {
            let n = payload.len().min(data_buf.len());
            data_buf[..n].copy_from_slice(&payload[..n]);
            oob_buf[..tag_bytes.len()].copy_from_slice(&tag_bytes);
        } else {
            let usable = data_buf.len() - tag_bytes.len();
            let n = payload.len().min(usable);
            data_buf[..n].copy_from_slice(&payload[..n]);
            let tail = data_buf.len() - tag_bytes.len();
            data_buf[tail..].copy_from_slice(&tag_bytes);
        }
        (data_buf, oob_buf)
    }

    fn read_physical(&mut self, block_slot: u32, page: u32) -> EngineResult<(Vec<u8>, Tags, Option<ExtraTags>)> {
        let block_num = self.geometry.start_block + block_slot;
        let mut data = vec![0u8; self.geometry.data_bytes_per_chunk as usize];
        let mut oob = vec![0u8; self.geometry.spare_bytes_per_chunk as usize];
        self.nand.read_chunk(block_num, page, &mut data, &mut oob).map_err(|_| EngineError::NandReadFail)?;
        let tag_bytes = scan::tag_bytes_for(self.codec.as_ref(), &data, &oob);
        let decoded = self.codec.decode(&tag_bytes).map_err(|_| EngineError::TagInvalid)?;
        Ok((data, decoded.tags, decoded.extra))
    }

    /// Allocate the next chunk and program it, retrying across bad blocks up
    /// to `WR_ATTEMPTS` times (spec.md §4.G/§6) and triggering a GC pass if
    /// the allocator reports `NoSpace` on a user write.
    fn allocate_and_program(&mut self, payload: &[u8], tags: &Tags, extra: Option<&ExtraTags>, for_gc: bool) -> EngineResult<u32> {
        if self.read_only {
            return Err(EngineError::ReadOnly);
        }
        for attempt in 0..WR_ATTEMPTS {
            let (block_slot, page) = match self.alloc.next_chunk(&mut self.blocks, for_gc) {
                Ok(bp) => bp,
                Err(EngineError::NoSpace) if !for_gc && attempt == 0 => {
                    self.run_gc_pass()?;
                    continue;
                }
                Err(e) => return Err(e),
            };
            let mut tags = *tags;
            tags.seq_number = self.blocks[block_slot as usize].seq_number;
            let (data, oob) = self.pack_chunk(payload, &tags, extra);
            let block_num = self.geometry.start_block + block_slot;
            let outcome = self.nand.program_chunk(block_num, page, &data, &oob).map_err(|_| EngineError::NandProgramFail)?;
            match outcome {
                NandOutcome::Ok => {
                    self.bitmap.set(block_slot, page);
                    self.blocks[block_slot as usize].add_live_chunk();
                    return Ok(chunk_addr(block_slot, page, self.geometry.chunks_per_block));
                }
                NandOutcome::RetryEligible => continue,
                NandOutcome::PermanentFailure => {
                    self.blocks[block_slot as usize].record_erase_strike();
                    if !self.mount.disable_bad_block_marking {
                        let _ = self.nand.mark_bad(block_num);
                    }
                    continue;
                }
            }
        }
        Err(EngineError::NandProgramFail)
    }

    fn retire_physical(&mut self, addr: u32) {
        let (block_slot, page) = split_chunk_addr(addr, self.geometry.chunks_per_block);
        if self.bitmap.is_set(block_slot, page) {
            self.bitmap.clear(block_slot, page);
            self.blocks[block_slot as usize].retire_chunk(false);
        }
    }

    fn write_header_chunk(&mut self, obj_id: u32, is_shrink: bool) -> EngineResult<()> {
        let obj = self.objects.get(obj_id).ok_or(EngineError::NoSuchObject)?.clone();
        let mut hdr = ObjectHeaderRecord::zeroed();
        hdr.obj_type = obj.variant.obj_type().into();
        hdr.parent_obj_id = obj.parent_obj_id;
        hdr.set_name(&obj.name);
        hdr.mode = obj.mode;
        hdr.uid = obj.uid;
        hdr.gid = obj.gid;
        hdr.atime = obj.atime;
        hdr.mtime = obj.mtime;
        hdr.ctime = obj.ctime;
        hdr.rdev = obj.rdev;
        let (file_size, equiv_id, shadows_obj) = match &obj.variant {
            ObjectVariant::File { size, .. } => (*size, -1i32, -1i32),
            ObjectVariant::Hardlink { equiv_id } => (0, *equiv_id as i32, -1),
            _ => (0, -1, -1),
        };
        if let ObjectVariant::Symlink { alias } = &obj.variant {
            hdr.set_alias(alias);
        }
        hdr.set_file_size(file_size);
        hdr.equiv_id = equiv_id;
        hdr.shadows_obj = shadows_obj;
        hdr.is_shrink = is_shrink as u32;

        let mut payload = vec![0u8; self.geometry.data_bytes_per_chunk as usize];
        hdr.write_into(&mut payload);
        let tags = Tags { chunk_used: true, obj_id, chunk_id: 0, n_bytes: 0, seq_number: 0 };
        let extra = ExtraTags {
            parent_obj_id: obj.parent_obj_id,
            is_shrink,
            shadows_obj_id: shadows_obj,
            obj_type: obj.variant.obj_type().into(),
            file_size,
            equiv_id,
        };
        let new_addr = self.allocate_and_program(&payload, &tags, Some(&extra), false)?;
        if is_shrink {
            let (block_slot, _) = split_chunk_addr(new_addr, self.geometry.chunks_per_block);
            self.blocks[block_slot as usize].flags.insert(crate::engine::block::BlockFlags::HAS_SHRINK_HDR);
        }
        if let Some(old) = obj.header_chunk {
            self.retire_physical(old);
        }
        let obj_mut = self.objects.get_mut(obj_id).ok_or(EngineError::NoSuchObject)?;
        obj_mut.header_chunk = Some(new_addr);
        obj_mut.flags.remove(ObjectFlags::DIRTY);
        Ok(())
    }

    fn touch_dir(&mut self, dir_id: u32) {
        if let Some(dir) = self.objects.get_mut(dir_id) {
            dir.mtime = now();
            dir.ctime = dir.mtime;
            dir.flags.insert(ObjectFlags::DIRTY);
        }
        self.dirty_dirs.insert(dir_id);
    }

    /// Rewrite the header of every directory queued by [`touch_dir`]
    /// (spec.md §3 `defered_dir_update`). Called from `sync`, unmount and
    /// checkpoint save so the batching never outlives those boundaries.
    pub fn flush_dirty_dirs(&mut self) -> EngineResult<()> {
        let ids: Vec<u32> = self.dirty_dirs.drain().collect();
        for id in ids {
            self.write_header_chunk(id, false)?;
        }
        Ok(())
    }

    // ---- lifecycle -----------------------------------------------------

    /// Erase every usable block and lay down fresh root/lost+found headers
    /// (spec.md §4.K `format`).
    pub fn format(mut nand: D, mount: MountOptions) -> EngineResult<Self> {
        let geometry = *nand.geometry();
        for block_num in geometry.start_block..=geometry.end_block {
            if nand.check_bad(block_num).map_err(|_| EngineError::NandReadFail)? {
                continue;
            }
            nand.erase_block(block_num).map_err(|_| EngineError::NandEraseFail)?;
        }
        let n_blocks = geometry.n_blocks();
        let mut dev = Device {
            nand,
            geometry,
            codec: build_codec(&mount),
            blocks: (0..n_blocks).map(|_| BlockInfo::fresh_empty()).collect(),
            bitmap: ChunkBitmap::new(n_blocks, geometry.chunks_per_block),
            objects: ObjectTable::new(),
            alloc: Allocator::new(geometry.chunks_per_block, geometry.n_reserved_blocks),
            gc: GarbageCollector::new(500, geometry.chunks_per_block as u16 / 4),
            cache: ChunkCacheManager::new(mount.n_caches, mount.cache_bypass_aligned),
            stats: DeviceStats::default(),
            dirty_dirs: HashSet::new(),
            read_only: false,
            mount,
        };
        dev.nand.init().map_err(|_| EngineError::NandProgramFail)?;
        // Reserve the checkpoint's fixed block before any header gets a
        // chance to be allocated into it (see CHECKPOINT_BLOCK_SLOT).
        dev.blocks[CHECKPOINT_BLOCK_SLOT as usize].state = BlockLifecycle::Checkpoint;
        ensure_root_and_lostnfound(&mut dev.objects);
        let now = now();
        for id in [OBJECTID_ROOT, OBJECTID_LOSTNFOUND] {
            if let Some(o) = dev.objects.get_mut(id) {
                o.atime = now;
                o.mtime = now;
                o.ctime = now;
            }
            dev.write_header_chunk(id, false)?;
        }
        if !dev.mount.skip_checkpoint_write {
            dev.save_checkpoint()?;
        }
        Ok(dev)
    }

    /// Mount an already-formatted device: restore from checkpoint unless
    /// disabled or invalid, falling back to a full backward scan (spec.md
    /// §4.I, §4.K `initialise`).
    pub fn mount(mut nand: D, mount: MountOptions) -> EngineResult<Self> {
        let geometry = *nand.geometry();
        nand.init().map_err(|_| EngineError::NandProgramFail)?;
        let n_blocks = geometry.n_blocks();
        let mut dev = Device {
            nand,
            geometry,
            codec: build_codec(&mount),
            blocks: (0..n_blocks).map(|_| BlockInfo::fresh_empty()).collect(),
            bitmap: ChunkBitmap::new(n_blocks, geometry.chunks_per_block),
            objects: ObjectTable::new(),
            alloc: Allocator::new(geometry.chunks_per_block, geometry.n_reserved_blocks),
            gc: GarbageCollector::new(500, geometry.chunks_per_block as u16 / 4),
            cache: ChunkCacheManager::new(mount.n_caches, mount.cache_bypass_aligned),
            stats: DeviceStats::default(),
            dirty_dirs: HashSet::new(),
            read_only: false,
            mount,
        };

        let restored = if dev.mount.skip_checkpoint_read { None } else { dev.try_restore_checkpoint() };
        if let Some(highest_seq) = restored {
            dev.alloc.resume_sequence_at(highest_seq);
            dev.stats.checkpoint_restores += 1;
        } else {
            if !dev.mount.skip_checkpoint_read {
                dev.stats.checkpoint_restore_failures += 1;
            }
            let outcome = scan::scan_device(
                &mut dev.nand,
                dev.codec.as_ref(),
                &dev.geometry,
                &mut dev.blocks,
                &mut dev.bitmap,
                &mut dev.objects,
                dev.mount.lazy_load,
                dev.mount.empty_lost_and_found,
            )
            .map_err(|_| EngineError::TagInvalid)?;
            dev.alloc.resume_sequence_at(outcome.highest_seq_seen);
            dev.stats.scans_performed += 1;
        }
        Ok(dev)
    }

    /// Try to reconstruct device state from the checkpoint blocks, checking
    /// validity at every step; returns the highest sequence number seen on
    /// success. Any failure is swallowed — the caller falls back to a scan
    /// (spec.md §4.J: a bad checkpoint must never fail the mount).
    fn try_restore_checkpoint(&mut self) -> Option<u32> {
        let (data, oob) = self.read_checkpoint_block_raw().ok()?;
        let bytes = self.checkpoint_bytes_from_raw(&data, &oob);
        let restored = checkpoint::deserialize(&bytes, CHECKPOINT_VERSION, CHECKPOINT_MAGIC).ok()?;

        self.blocks = restored.blocks.iter().map(checkpoint::block_record_to_info).collect();
        if self.blocks.len() != self.geometry.n_blocks() as usize {
            return None;
        }
        self.bitmap = ChunkBitmap::from_bits(restored.bitmap_bits, self.geometry.chunks_per_block);
        self.objects = ObjectTable::new();
        for rec in &restored.objects {
            let entries = restored.tnode_entries.get(&rec.obj_id).cloned().unwrap_or_default();
            let xattrs = restored.xattr_data.get(&rec.obj_id).cloned().unwrap_or_default();
            let mut stub = checkpoint::object_record_to_stub(rec, &entries, xattrs);
            if is_reserved_object_id(rec.obj_id) {
                stub.variant = ObjectVariant::Directory { children: vec![] };
            }
            self.objects.insert(stub);
        }
        // header chunks still carry the authoritative name/mode/timestamps;
        // the checkpoint object record only carries identity and data
        // layout, so re-read every header to fill the rest in.
        let ids: Vec<(u32, u32)> =
            self.objects.iter().filter_map(|o| o.header_chunk.map(|c| (o.obj_id, c))).collect();
        for (obj_id, addr) in ids {
            let (block_slot, page) = split_chunk_addr(addr, self.geometry.chunks_per_block);
            let Ok((data, _, _)) = self.read_physical(block_slot, page) else { continue };
            let Some(hdr) = ObjectHeaderRecord::from_bytes(&data) else { continue };
            if let Some(o) = self.objects.get_mut(obj_id) {
                o.name = hdr.name_str();
                o.mode = hdr.mode;
                o.uid = hdr.uid;
                o.gid = hdr.gid;
                o.atime = hdr.atime;
                o.mtime = hdr.mtime;
                o.ctime = hdr.ctime;
                o.rdev = hdr.rdev;
                if let ObjectVariant::Symlink { alias } = &mut o.variant {
                    *alias = hdr.alias_str();
                }
            }
        }
        scan::link_children_and_relink_orphans(&mut self.objects, self.mount.empty_lost_and_found);
        ensure_root_and_lostnfound(&mut self.objects);
        Some(restored.summary.seq_number)
    }

    fn read_checkpoint_block_raw(&mut self) -> Result<(Vec<u8>, Vec<u8>), ()> {
        let mut data = vec![0u8; self.geometry.data_bytes_per_chunk as usize];
        let mut oob = vec![0u8; self.geometry.spare_bytes_per_chunk as usize];
        self.nand
            .read_chunk(self.geometry.start_block + CHECKPOINT_BLOCK_SLOT, 0, &mut data, &mut oob)
            .map_err(|_| ())?;
        Ok((data, oob))
    }

    fn checkpoint_bytes_from_raw(&self, data: &[u8], oob: &[u8]) -> Vec<u8> {
        // The checkpoint block stores its own length as the first 4 bytes
        // of payload so the reader knows where the serialized envelope ends
        // inside the fixed-size chunk.
        let len = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
        let _ = oob;
        data[4..4 + len.min(data.len() - 4)].to_vec()
    }

    /// Serialize and write the checkpoint block (spec.md §4.J, §4.K).
    /// Always targets the reserved checkpoint object-id's chunk rather than
    /// the normal log — the checkpoint is not itself a logged chunk with
    /// tags the scanner interprets.
    pub fn save_checkpoint(&mut self) -> EngineResult<()> {
        if self.mount.skip_checkpoint_write || self.read_only {
            return Ok(());
        }
        self.flush_dirty_dirs()?;
        let summary = DeviceRuntimeSummary {
            erased_block_count: self.blocks.iter().filter(|b| b.state == BlockLifecycle::Empty).count() as u32,
            alloc_block: self.alloc.alloc_block.unwrap_or(u32::MAX),
            alloc_page: self.alloc.alloc_page,
            n_free_chunks: Allocator::n_free_blocks(&self.blocks) * self.geometry.chunks_per_block,
            n_deleted_files: self.objects.iter().filter(|o| o.flags.contains(ObjectFlags::DELETED)).count() as u32,
            n_unlinked_files: self.objects.iter().filter(|o| o.flags.contains(ObjectFlags::UNLINKED)).count() as u32,
            seq_number: self.blocks.iter().map(|b| b.seq_number).max().unwrap_or(0),
        };
        let bytes = checkpoint::serialize(&summary, &self.objects, &self.blocks, self.bitmap.bits(), CHECKPOINT_VERSION, CHECKPOINT_MAGIC);
        let cap = self.geometry.data_bytes_per_chunk as usize - 4;
        if bytes.len() > cap {
            // Device too small / too many objects to fit one checkpoint
            // chunk: skip rather than fail the unmount, next mount just scans.
            log::warn!("checkpoint payload ({} bytes) exceeds one chunk ({cap}); skipping save", bytes.len());
            return Ok(());
        }
        let mut payload = vec![0u8; self.geometry.data_bytes_per_chunk as usize];
        payload[..4].copy_from_slice(&(bytes.len() as u32).to_le_bytes());
        payload[4..4 + bytes.len()].copy_from_slice(&bytes);
        let mut oob = vec![0u8; self.geometry.spare_bytes_per_chunk as usize];
        // The checkpoint's physical home is fixed (CHECKPOINT_BLOCK_SLOT,
        // page 0) rather than allocator-assigned, so mount can find it
        // without a scan; re-erase that one block first since it may
        // already hold page 0 from a previous checkpoint.
        let checkpoint_block = self.geometry.start_block + CHECKPOINT_BLOCK_SLOT;
        self.nand.erase_block(checkpoint_block).map_err(|_| EngineError::NandEraseFail)?;
        self.nand
            .program_chunk(checkpoint_block, 0, &payload, &mut oob)
            .map_err(|_| EngineError::NandProgramFail)?;
        self.stats.checkpoint_saves += 1;
        Ok(())
    }

    /// Flush the read cache, write a fresh checkpoint (unless disabled) and
    /// hand the driver back (spec.md §4.K `deinitialise`).
    pub fn unmount(mut self) -> EngineResult<D> {
        self.sync()?;
        self.nand.deinit().map_err(|_| EngineError::NandProgramFail)?;
        Ok(self.nand)
    }

    /// Flush all pending directory header rewrites and (unless disabled)
    /// write a checkpoint, without unmounting.
    pub fn sync(&mut self) -> EngineResult<()> {
        self.flush_dirty_dirs()?;
        self.save_checkpoint()?;
        Ok(())
    }

    // ---- lookups ---------------------------------------------------------

    pub fn attr(&self, obj_id: u32) -> EngineResult<&Object> {
        self.objects.get(obj_id).ok_or(EngineError::NoSuchObject)
    }

    pub fn find_by_name(&self, parent: u32, name: &str) -> EngineResult<&Object> {
        self.objects.find_by_name(parent, name).ok_or(EngineError::NoSuchObject)
    }

    pub fn readdir(&self, dir_id: u32) -> EngineResult<Vec<(u32, String)>> {
        let dir = self.objects.get(dir_id).ok_or(EngineError::NoSuchObject)?;
        match &dir.variant {
            ObjectVariant::Directory { children } => {
                Ok(children.iter().filter_map(|&id| self.objects.get(id).map(|o| (id, o.name.clone()))).collect())
            }
            _ => Err(EngineError::NotADirectory),
        }
    }

    // ---- creation ----------------------------------------------------

    fn create_object(&mut self, parent: u32, name: &str, variant: ObjectVariant, mode: u32, uid: u32, gid: u32) -> EngineResult<u32> {
        if self.read_only {
            return Err(EngineError::ReadOnly);
        }
        let ts = now();
        let id = self.objects.create(parent, name, variant, mode, uid, gid, ts, self.mount.max_objects)?;
        if let Err(e) = self.write_header_chunk(id, false) {
            self.objects.remove(id);
            self.objects.detach_from_parent(id);
            return Err(e);
        }
        self.touch_dir(parent);
        Ok(id)
    }

    pub fn create_file(&mut self, parent: u32, name: &str, mode: u32, uid: u32, gid: u32) -> EngineResult<u32> {
        self.create_object(parent, name, ObjectVariant::File { size: 0, tnode: crate::engine::tnode::Tnode::new() }, mode, uid, gid)
    }

    pub fn create_dir(&mut self, parent: u32, name: &str, mode: u32, uid: u32, gid: u32) -> EngineResult<u32> {
        self.create_object(parent, name, ObjectVariant::Directory { children: vec![] }, mode, uid, gid)
    }

    pub fn create_symlink(&mut self, parent: u32, name: &str, target: &str, uid: u32, gid: u32) -> EngineResult<u32> {
        if target.len() > crate::engine::header::MAX_ALIAS_LENGTH {
            return Err(EngineError::NameTooLong);
        }
        self.create_object(parent, name, ObjectVariant::Symlink { alias: target.to_string() }, 0o777, uid, gid)
    }

    pub fn create_special(&mut self, parent: u32, name: &str, mode: u32, rdev: u32, uid: u32, gid: u32) -> EngineResult<u32> {
        let id = self.create_object(parent, name, ObjectVariant::Special { rdev }, mode, uid, gid)?;
        if let Some(o) = self.objects.get_mut(id) {
            o.rdev = rdev;
        }
        Ok(id)
    }

    pub fn link(&mut self, parent: u32, name: &str, target_obj_id: u32) -> EngineResult<u32> {
        let ts = now();
        let id = self.objects.link(parent, name, target_obj_id, ts, self.mount.max_objects)?;
        if let Err(e) = self.write_header_chunk(id, false) {
            self.objects.remove(id);
            return Err(e);
        }
        self.touch_dir(parent);
        Ok(id)
    }

    // ---- removal / rename ---------------------------------------------

    fn free_file_chunks(&mut self, obj_id: u32) {
        let addrs: Vec<u32> = match self.objects.get(obj_id).map(|o| &o.variant) {
            Some(ObjectVariant::File { tnode, .. }) => tnode.iter_entries().into_iter().map(|(_, addr)| addr).collect(),
            _ => Vec::new(),
        };
        for addr in addrs {
            self.retire_physical(addr);
        }
    }

    /// `unlink`/`rmdir` (spec.md §4.D, §4.K). Directories must be empty;
    /// the unlinked object is moved under the reserved unlinked pseudo-dir
    /// and its data chunks freed immediately (no hardlink refcounting here
    /// — hardlinks are distinct objects chained by `equiv_id`, so removing
    /// one name never touches another object's chunks).
    pub fn unlink(&mut self, parent: u32, name: &str) -> EngineResult<()> {
        if self.read_only {
            return Err(EngineError::ReadOnly);
        }
        let obj = self.objects.find_by_name(parent, name).ok_or(EngineError::NoSuchObject)?;
        let obj_id = obj.obj_id;
        if is_reserved_object_id(obj_id) {
            return Err(EngineError::NoSuchObject);
        }
        if self.objects.directory_not_empty(obj_id) {
            return Err(EngineError::DirectoryNotEmpty);
        }
        self.free_file_chunks(obj_id);
        if let Some(old) = self.objects.get(obj_id).and_then(|o| o.header_chunk) {
            self.retire_physical(old);
        }
        self.objects.unlink(obj_id)?;
        self.objects.remove(obj_id);
        self.touch_dir(parent);
        Ok(())
    }

    pub fn rename(&mut self, old_parent: u32, old_name: &str, new_parent: u32, new_name: &str) -> EngineResult<()> {
        if self.read_only {
            return Err(EngineError::ReadOnly);
        }
        let obj_id = self.objects.find_by_name(old_parent, old_name).ok_or(EngineError::NoSuchObject)?.obj_id;
        let shadowed = self.objects.rename(obj_id, new_parent, new_name)?;
        if let Some(shadow_id) = shadowed {
            self.free_file_chunks(shadow_id);
            if let Some(old) = self.objects.get(shadow_id).and_then(|o| o.header_chunk) {
                self.retire_physical(old);
            }
            self.objects.remove(shadow_id);
        }
        self.write_header_chunk(obj_id, false)?;
        self.touch_dir(old_parent);
        if new_parent != old_parent {
            self.touch_dir(new_parent);
        }
        Ok(())
    }

    // ---- file data -------------------------------------------------------

    fn resolve_for_read(&mut self, tnode_addr: u32) -> EngineResult<Vec<u8>> {
        let (block_slot, page) = split_chunk_addr(tnode_addr, self.geometry.chunks_per_block);
        let (data, tags, _) = self.read_physical(block_slot, page)?;
        Ok(data[..tags.n_bytes as usize].to_vec())
    }

    pub fn read(&mut self, obj_id: u32, offset: u64, buf: &mut [u8]) -> EngineResult<usize> {
        let chunk_len = self.chunk_payload_len() as u64;
        let size = match self.objects.get(obj_id).map(|o| &o.variant) {
            Some(ObjectVariant::File { size, .. }) => *size,
            Some(_) => return Err(EngineError::NotADirectory),
            None => return Err(EngineError::NoSuchObject),
        };
        if offset >= size {
            return Ok(0);
        }
        let to_read = buf.len().min((size - offset) as usize);
        let mut done = 0usize;
        while done < to_read {
            let pos = offset + done as u64;
            let logical = (pos / chunk_len) as u32;
            let in_chunk = (pos % chunk_len) as usize;
            let want = (to_read - done).min(chunk_len as usize - in_chunk);

            if let Some(entry) = self.cache.get(obj_id, logical) {
                let n = want.min(entry.data.len().saturating_sub(in_chunk));
                buf[done..done + n].copy_from_slice(&entry.data[in_chunk..in_chunk + n]);
                if n < want {
                    buf[done + n..done + want].iter_mut().for_each(|b| *b = 0);
                }
            } else {
                let addr = match self.objects.get(obj_id).map(|o| &o.variant) {
                    Some(ObjectVariant::File { tnode, .. }) => tnode.find(logical),
                    _ => None,
                };
                let payload = match addr {
                    Some(a) => self.resolve_for_read(a)?,
                    None => Vec::new(), // sparse hole, reads as zero
                };
                let n = want.min(payload.len().saturating_sub(in_chunk));
                if n > 0 {
                    buf[done..done + n].copy_from_slice(&payload[in_chunk..in_chunk + n]);
                }
                if n < want {
                    buf[done + n..done + want].iter_mut().for_each(|b| *b = 0);
                }
                let n_bytes = payload.len() as u32;
                let cache = &mut self.cache;
                let _ = cache.admit(
                    CacheEntry { obj_id, chunk_id: logical, dirty: false, locked: false, n_bytes, data: payload },
                    |_| Ok(()),
                );
            }
            done += want;
        }
        Ok(done)
    }

    /// Write-through: each touched chunk is read-modify-written straight to
    /// flash and the tnode entry updated immediately.
    pub fn write(&mut self, obj_id: u32, offset: u64, data: &[u8]) -> EngineResult<usize> {
        if self.read_only {
            return Err(EngineError::ReadOnly);
        }
        let chunk_len = self.chunk_payload_len();
        if !matches!(self.objects.get(obj_id).map(|o| &o.variant), Some(ObjectVariant::File { .. })) {
            return Err(EngineError::NoSuchObject);
        }
        let mut done = 0usize;
        while done < data.len() {
            let pos = offset + done as u64;
            let logical = (pos / chunk_len as u64) as u32;
            let in_chunk = (pos % chunk_len as u64) as usize;
            let want = (data.len() - done).min(chunk_len - in_chunk);

            let mut chunk_buf = if in_chunk == 0 && want == chunk_len {
                vec![0u8; chunk_len]
            } else {
                let existing_addr = match self.objects.get(obj_id).map(|o| &o.variant) {
                    Some(ObjectVariant::File { tnode, .. }) => tnode.find(logical),
                    _ => None,
                };
                match existing_addr {
                    Some(a) => {
                        let mut buf = self.resolve_for_read(a)?;
                        buf.resize(chunk_len, 0);
                        buf
                    }
                    None => vec![0u8; chunk_len],
                }
            };
            chunk_buf[in_chunk..in_chunk + want].copy_from_slice(&data[done..done + want]);
            let n_bytes = {
                let existing_addr = match self.objects.get(obj_id).map(|o| &o.variant) {
                    Some(ObjectVariant::File { tnode, .. }) => tnode.find(logical),
                    _ => None,
                };
                let prior_len = match existing_addr {
                    Some(a) => self.resolve_for_read(a).map(|v| v.len()).unwrap_or(0),
                    None => 0,
                };
                prior_len.max(in_chunk + want)
            };

            let tags = Tags { chunk_used: true, obj_id, chunk_id: logical + 1, n_bytes: n_bytes as u32, seq_number: 0 };
            let new_addr = self.allocate_and_program(&chunk_buf[..n_bytes], &tags, None, false)?;

            let old_addr = match self.objects.get_mut(obj_id).map(|o| &mut o.variant) {
                Some(ObjectVariant::File { tnode, .. }) => {
                    let slot = tnode.add_find(logical);
                    let old = if *slot != 0 { Some(*slot) } else { None };
                    *slot = new_addr;
                    old
                }
                _ => None,
            };
            if let Some(old) = old_addr {
                self.retire_physical(old);
            }
            self.cache.invalidate(obj_id, logical);
            done += want;
        }
        if let Some(ObjectVariant::File { size, .. }) = self.objects.get_mut(obj_id).map(|o| &mut o.variant) {
            *size = (*size).max(offset + data.len() as u64);
        }
        if let Some(o) = self.objects.get_mut(obj_id) {
            o.mtime = now();
            o.ctime = o.mtime;
        }
        Ok(done)
    }

    /// Truncate or extend a file (spec.md §4.D/§4.K). Shrinking frees every
    /// chunk beyond the new size and rewrites the header with `is_shrink`
    /// set, matching the original's shrink-header convention.
    pub fn resize(&mut self, obj_id: u32, new_size: u64) -> EngineResult<()> {
        if self.read_only {
            return Err(EngineError::ReadOnly);
        }
        let chunk_len = self.chunk_payload_len() as u64;
        let old_size = match self.objects.get(obj_id).map(|o| &o.variant) {
            Some(ObjectVariant::File { size, .. }) => *size,
            Some(_) => return Err(EngineError::NotADirectory),
            None => return Err(EngineError::NoSuchObject),
        };
        if new_size < old_size {
            let first_freed_chunk = (new_size.div_ceil(chunk_len.max(1))) as u32;
            let last_chunk = ((old_size.saturating_sub(1)) / chunk_len.max(1)) as u32;
            let mut freed = Vec::new();
            if let Some(ObjectVariant::File { tnode, .. }) = self.objects.get_mut(obj_id).map(|o| &mut o.variant) {
                for logical in first_freed_chunk..=last_chunk {
                    let slot = tnode.add_find(logical);
                    if *slot != 0 {
                        freed.push(*slot);
                        *slot = 0;
                    }
                }
                tnode.prune();
            }
            for addr in freed {
                self.retire_physical(addr);
                self.cache.invalidate(obj_id, split_chunk_addr(addr, self.geometry.chunks_per_block).0);
            }
        }
        if let Some(ObjectVariant::File { size, .. }) = self.objects.get_mut(obj_id).map(|o| &mut o.variant) {
            *size = new_size;
        }
        self.write_header_chunk(obj_id, new_size < old_size)
    }

    pub fn flush(&mut self, obj_id: u32) -> EngineResult<()> {
        let dirty = self.objects.get(obj_id).map(|o| o.flags.contains(ObjectFlags::DIRTY)).unwrap_or(false);
        if dirty {
            self.write_header_chunk(obj_id, false)?;
        }
        Ok(())
    }

    // ---- xattrs (in-RAM only, persisted via checkpoint — see object.rs) --

    pub fn set_xattr(&mut self, obj_id: u32, name: &str, value: &[u8]) -> EngineResult<()> {
        let obj = self.objects.get_mut(obj_id).ok_or(EngineError::NoSuchObject)?;
        obj.xattr_data.insert(name.to_string(), value.to_vec());
        obj.xattr = XattrFlags::XATTR_KNOWN | XattrFlags::HAS_XATTR;
        obj.ctime = now();
        Ok(())
    }

    pub fn get_xattr(&self, obj_id: u32, name: &str) -> EngineResult<Vec<u8>> {
        let obj = self.objects.get(obj_id).ok_or(EngineError::NoSuchObject)?;
        obj.xattr_data.get(name).cloned().ok_or(EngineError::NoSuchObject)
    }

    pub fn list_xattr(&self, obj_id: u32) -> EngineResult<Vec<String>> {
        let obj = self.objects.get(obj_id).ok_or(EngineError::NoSuchObject)?;
        Ok(obj.xattr_data.keys().cloned().collect())
    }

    pub fn remove_xattr(&mut self, obj_id: u32, name: &str) -> EngineResult<()> {
        let obj = self.objects.get_mut(obj_id).ok_or(EngineError::NoSuchObject)?;
        obj.xattr_data.remove(name).ok_or(EngineError::NoSuchObject)?;
        if obj.xattr_data.is_empty() {
            obj.xattr.remove(XattrFlags::HAS_XATTR);
        }
        obj.ctime = now();
        Ok(())
    }

    // ---- garbage collection --------------------------------------------

    fn urgency(&self) -> GcUrgency {
        let free = Allocator::n_free_blocks(&self.blocks);
        let reserved = self.alloc.n_reserved_blocks.max(1);
        if free <= reserved {
            GcUrgency::Forced
        } else if free <= reserved * 2 {
            GcUrgency::Medium
        } else if free <= reserved * 4 {
            GcUrgency::Low
        } else {
            GcUrgency::Idle
        }
    }

    /// Run one GC step if a suitable victim block exists (spec.md §4.H).
    /// Copy-forwards every still-live chunk, then erases the block.
    pub fn run_gc_pass(&mut self) -> EngineResult<bool> {
        if self.gc.gc_disable || self.read_only {
            return Ok(false);
        }
        let urgency = self.urgency();
        let Some(victim) = self.gc.select_victim(&self.blocks, urgency) else { return Ok(false) };
        self.blocks[victim as usize].state = BlockLifecycle::Collecting;

        for page in 0..self.geometry.chunks_per_block {
            if !self.bitmap.is_set(victim, page) {
                continue;
            }
            let (data, tags, _) = self.read_physical(victim, page)?;
            let addr = chunk_addr(victim, page, self.geometry.chunks_per_block);
            if tags.is_header() {
                let still_current = self.objects.get(tags.obj_id).and_then(|o| o.header_chunk) == Some(addr);
                if still_current {
                    self.write_header_chunk(tags.obj_id, false)?;
                }
            } else if let Some(logical) = tags.logical_chunk() {
                let still_current = match self.objects.get(tags.obj_id).map(|o| &o.variant) {
                    Some(ObjectVariant::File { tnode, .. }) => tnode.find(logical) == Some(addr),
                    _ => false,
                };
                if still_current {
                    let payload = &data[..tags.n_bytes as usize];
                    let new_tags = Tags { chunk_used: true, obj_id: tags.obj_id, chunk_id: logical + 1, n_bytes: tags.n_bytes, seq_number: 0 };
                    let new_addr = self.allocate_and_program(payload, &new_tags, None, true)?;
                    if let Some(ObjectVariant::File { tnode, .. }) = self.objects.get_mut(tags.obj_id).map(|o| &mut o.variant) {
                        *tnode.add_find(logical) = new_addr;
                    }
                }
            }
        }

        match self.nand.erase_block(self.geometry.start_block + victim) {
            Ok(NandOutcome::Ok) => {
                self.blocks[victim as usize].mark_erased();
                self.bitmap.clear_block(victim);
            }
            _ => {
                self.blocks[victim as usize].record_erase_strike();
                if !self.mount.disable_bad_block_marking {
                    let _ = self.nand.mark_bad(self.geometry.start_block + victim);
                }
            }
        }
        self.stats.gc_passes += 1;
        Ok(true)
    }

    // ---- accessors for the outer CLI/VFS seam --------------------------

    pub fn geometry(&self) -> NandGeometry {
        self.geometry
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }

    pub fn free_blocks(&self) -> u32 {
        Allocator::n_free_blocks(&self.blocks)
    }

    /// `setattr` (spec.md §4.K): update mode/ownership/times in place and
    /// rewrite the header chunk. Size changes go through `resize` instead,
    /// since they also touch tnode/chunk bookkeeping.
    pub fn set_attr(
        &mut self,
        obj_id: u32,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        atime: Option<u32>,
        mtime: Option<u32>,
    ) -> EngineResult<()> {
        if self.read_only {
            return Err(EngineError::ReadOnly);
        }
        let obj = self.objects.get_mut(obj_id).ok_or(EngineError::NoSuchObject)?;
        if let Some(m) = mode {
            obj.mode = (obj.mode & !0o7777) | (m & 0o7777);
        }
        if let Some(u) = uid {
            obj.uid = u;
        }
        if let Some(g) = gid {
            obj.gid = g;
        }
        if let Some(a) = atime {
            obj.atime = a;
        }
        if let Some(m) = mtime {
            obj.mtime = m;
        }
        obj.ctime = now();
        obj.flags.insert(ObjectFlags::DIRTY);
        self.write_header_chunk(obj_id, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use disk_driver::memory::MemoryNand;

    fn geometry() -> NandGeometry {
        NandGeometry { data_bytes_per_chunk: 512, spare_bytes_per_chunk: 64, chunks_per_block: 8, start_block: 0, end_block: 15, n_reserved_blocks: 2 }
    }

    fn fresh_device() -> Device<MemoryNand> {
        let nand = MemoryNand::new(geometry());
        Device::format(nand, MountOptions::default()).unwrap()
    }

    #[test]
    fn format_creates_root_and_lost_and_found() {
        let dev = fresh_device();
        assert!(dev.attr(OBJECTID_ROOT).is_ok());
        assert!(dev.attr(OBJECTID_LOSTNFOUND).is_ok());
    }

    #[test]
    fn write_read_round_trip_within_and_across_chunks() {
        let mut dev = fresh_device();
        let id = dev.create_file(OBJECTID_ROOT, "a.txt", 0o644, 0, 0).unwrap();
        let payload: Vec<u8> = (0..1200u32).map(|i| (i % 251) as u8).collect();
        dev.write(id, 0, &payload).unwrap();
        let mut out = vec![0u8; payload.len()];
        let n = dev.read(id, 0, &mut out).unwrap();
        assert_eq!(n, payload.len());
        assert_eq!(out, payload);
    }

    #[test]
    fn remount_recovers_via_checkpoint() {
        let dev = fresh_device();
        let id = dev_with_file(dev);
        let mut nand_holder: Option<MemoryNand> = None;
        let mut dev = refmt(id, &mut nand_holder);
        let found = dev.find_by_name(OBJECTID_ROOT, "f.bin").unwrap();
        assert_eq!(found.obj_id, id.1);
        let mut out = vec![0u8; 4];
        dev.read(id.1, 0, &mut out).unwrap();
        assert_eq!(out, b"ABCD");

        fn dev_with_file(mut dev: Device<MemoryNand>) -> (Device<MemoryNand>, u32) {
            let id = dev.create_file(OBJECTID_ROOT, "f.bin", 0o644, 0, 0).unwrap();
            dev.write(id, 0, b"ABCD").unwrap();
            (dev, id)
        }
        fn refmt(id: (Device<MemoryNand>, u32), holder: &mut Option<MemoryNand>) -> Device<MemoryNand> {
            let nand = id.0.unmount().unwrap();
            *holder = Some(nand);
            Device::mount(holder.take().unwrap(), MountOptions::default()).unwrap()
        }
    }

    #[test]
    fn rename_shadows_and_frees_displaced_object() {
        let mut dev = fresh_device();
        let x = dev.create_file(OBJECTID_ROOT, "x", 0o644, 0, 0).unwrap();
        let _y = dev.create_file(OBJECTID_ROOT, "y", 0o644, 0, 0).unwrap();
        dev.rename(OBJECTID_ROOT, "x", OBJECTID_ROOT, "y").unwrap();
        assert_eq!(dev.find_by_name(OBJECTID_ROOT, "y").unwrap().obj_id, x);
        assert!(dev.find_by_name(OBJECTID_ROOT, "x").is_err());
    }

    #[test]
    fn hardlink_survives_unlink_of_original_name() {
        let mut dev = fresh_device();
        let a = dev.create_file(OBJECTID_ROOT, "a", 0o644, 0, 0).unwrap();
        dev.write(a, 0, b"payload").unwrap();
        let b = dev.link(OBJECTID_ROOT, "b", a).unwrap();
        dev.unlink(OBJECTID_ROOT, "a").unwrap();
        assert!(dev.find_by_name(OBJECTID_ROOT, "a").is_err());
        let link = dev.attr(b).unwrap();
        assert!(matches!(link.variant, ObjectVariant::Hardlink { equiv_id } if equiv_id == a));
    }

    #[test]
    fn resize_down_frees_trailing_chunks() {
        let mut dev = fresh_device();
        let id = dev.create_file(OBJECTID_ROOT, "big", 0o644, 0, 0).unwrap();
        let payload = vec![7u8; 3000];
        dev.write(id, 0, &payload).unwrap();
        dev.resize(id, 10).unwrap();
        let mut out = vec![0u8; 10];
        assert_eq!(dev.read(id, 0, &mut out).unwrap(), 10);
        assert_eq!(&out, &payload[..10]);
        let mut tail = vec![0u8; 4];
        assert_eq!(dev.read(id, 2000, &mut tail).unwrap(), 0);
    }

    #[test]
    fn write_under_reserve_pressure_triggers_gc_and_succeeds() {
        let small_geo = NandGeometry { data_bytes_per_chunk: 256, spare_bytes_per_chunk: 32, chunks_per_block: 4, start_block: 0, end_block: 5, n_reserved_blocks: 1 };
        let nand = MemoryNand::new(small_geo);
        let mut dev = Device::format(nand, MountOptions::default()).unwrap();
        let id = dev.create_file(OBJECTID_ROOT, "churn", 0o644, 0, 0).unwrap();
        for round in 0..40u8 {
            let payload = vec![round; 200];
            dev.write(id, 0, &payload).unwrap();
        }
        let mut out = vec![0u8; 200];
        dev.read(id, 0, &mut out).unwrap();
        assert_eq!(out, vec![39u8; 200]);
    }

    #[test]
    fn mkdir_then_readdir_lists_entries() {
        let mut dev = fresh_device();
        let dir = dev.create_dir(OBJECTID_ROOT, "sub", 0o755, 0, 0).unwrap();
        dev.create_file(dir, "x", 0o644, 0, 0).unwrap();
        dev.create_file(dir, "y", 0o644, 0, 0).unwrap();
        let mut names: Vec<String> = dev.readdir(dir).unwrap().into_iter().map(|(_, n)| n).collect();
        names.sort();
        assert_eq!(names, vec!["x".to_string(), "y".to_string()]);
    }

    #[test]
    fn xattr_set_get_list_remove() {
        let mut dev = fresh_device();
        let id = dev.create_file(OBJECTID_ROOT, "f", 0o644, 0, 0).unwrap();
        dev.set_xattr(id, "user.note", b"hi").unwrap();
        assert_eq!(dev.get_xattr(id, "user.note").unwrap(), b"hi");
        assert_eq!(dev.list_xattr(id).unwrap(), vec!["user.note".to_string()]);
        dev.remove_xattr(id, "user.note").unwrap();
        assert!(dev.get_xattr(id, "user.note").is_err());
    }
}
