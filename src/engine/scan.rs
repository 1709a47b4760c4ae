//! Mount-time scanner (spec.md §4.I): reconstructs the live object graph
//! from a backward (newest-sequence-first) walk of the log, with no
//! persistent index required. Used whenever there's no valid checkpoint
//! to restore from.

use crate::engine::block::{chunk_addr, BlockFlags, BlockInfo, BlockLifecycle, ChunkBitmap};
use crate::engine::header::{
    ObjectHeaderRecord, ObjectType, CHECKPOINT_BLOCK_SLOT, OBJECTID_LOSTNFOUND, OBJECTID_ROOT,
};
use crate::engine::object::{Object, ObjectFlags, ObjectTable, ObjectVariant, XattrFlags};
use crate::engine::tags::{DecodedTags, TagCodec};
use crate::engine::tnode::Tnode;
use anyhow::Result;
use disk_driver::{EccResult, NandDriver, NandGeometry};
use std::collections::HashSet;
use log::warn;

pub struct ScanOutcome {
    pub highest_seq_seen: u32,
}

/// Backward scan over every usable block (spec.md §4.I, steps 1-7).
pub fn scan_device(
    nand: &mut dyn NandDriver,
    codec: &dyn TagCodec,
    geometry: &NandGeometry,
    blocks: &mut [BlockInfo],
    bitmap: &mut ChunkBitmap,
    objects: &mut ObjectTable,
    lazy_load: bool,
    empty_lost_n_found: bool,
) -> Result<ScanOutcome> {
    ensure_root_and_lostnfound(objects);

    probe_block_headers(nand, codec, geometry, blocks)?;

    let mut order: Vec<u32> = (0..blocks.len() as u32).collect();
    order.sort_by(|&a, &b| blocks[b as usize].seq_number.cmp(&blocks[a as usize].seq_number));

    // (obj_id, chunk_id) already accepted as live, newest instance first.
    let mut seen: HashSet<(u32, u32)> = HashSet::new();
    let mut shadowed: HashSet<u32> = HashSet::new();
    let mut highest_seq_seen = 0u32;

    for &block_slot in &order {
        if block_slot == CHECKPOINT_BLOCK_SLOT
            || blocks[block_slot as usize].state == BlockLifecycle::Dead
            || blocks[block_slot as usize].state == BlockLifecycle::Empty
        {
            continue;
        }
        highest_seq_seen = highest_seq_seen.max(blocks[block_slot as usize].seq_number);
        blocks[block_slot as usize].state = BlockLifecycle::Scanning;

        let scan_result =
            scan_one_block(nand, codec, geometry, blocks, bitmap, objects, block_slot, &mut seen, &mut shadowed, lazy_load);
        match scan_result {
            Ok(()) => {
                if blocks[block_slot as usize].state == BlockLifecycle::Scanning {
                    blocks[block_slot as usize].state = BlockLifecycle::Full;
                }
            }
            Err(e) => {
                warn!("scan of block {} failed: {}; skipping", block_slot, e);
                blocks[block_slot as usize].state = BlockLifecycle::NeedsScan;
            }
        }
    }

    link_children_and_relink_orphans(objects, empty_lost_n_found);

    Ok(ScanOutcome { highest_seq_seen })
}

pub(crate) fn ensure_root_and_lostnfound(objects: &mut ObjectTable) {
    for (id, name) in [(OBJECTID_ROOT, ""), (OBJECTID_LOSTNFOUND, "lost+found")] {
        if objects.get(id).is_none() {
            objects.insert(Object {
                obj_id: id,
                parent_obj_id: 0,
                name: name.to_string(),
                mode: 0o755,
                uid: 0,
                gid: 0,
                atime: 0,
                mtime: 0,
                ctime: 0,
                rdev: 0,
                header_chunk: None,
                variant: ObjectVariant::Directory { children: vec![] },
                flags: ObjectFlags::VALID | ObjectFlags::FAKE,
                xattr: XattrFlags::empty(),
                xattr_data: std::collections::HashMap::new(),
            });
        }
    }
}

/// First pass: read chunk 0 of every block to learn its occupancy and
/// sequence number (spec.md §4.I step 1, "query_block").
fn probe_block_headers(
    nand: &mut dyn NandDriver,
    codec: &dyn TagCodec,
    geometry: &NandGeometry,
    blocks: &mut [BlockInfo],
) -> Result<()> {
    let data_len = geometry.data_bytes_per_chunk as usize;
    let mut data = vec![0u8; data_len];
    let mut oob = vec![0u8; geometry.spare_bytes_per_chunk as usize];
    for (slot, block_info) in blocks.iter_mut().enumerate() {
        if slot as u32 == CHECKPOINT_BLOCK_SLOT {
            // Reserved for the checkpoint record, written/read directly by
            // block/page rather than through tagged chunks — never probed
            // as ordinary log content (see CHECKPOINT_BLOCK_SLOT).
            block_info.state = BlockLifecycle::Checkpoint;
            continue;
        }
        let block_num = geometry.start_block + slot as u32;
        if nand.check_bad(block_num)? {
            block_info.state = BlockLifecycle::Dead;
            continue;
        }
        let _ = nand.read_chunk(block_num, 0, &mut data, &mut oob)?;
        let tag_bytes = tag_bytes_for(codec, &data, &oob);
        let decoded = codec.decode(&tag_bytes)?;
        if decoded.tags.chunk_used {
            block_info.seq_number = decoded.tags.seq_number;
            block_info.state = BlockLifecycle::NeedsScan;
        } else {
            block_info.state = BlockLifecycle::Empty;
        }
    }
    Ok(())
}

pub(crate) fn tag_bytes_for(codec: &dyn TagCodec, data: &[u8], oob: &[u8]) -> Vec<u8> {
    let len = codec.packed_len();
    if oob.len() >= len {
        oob[..len].to_vec()
    } else {
        data[data.len() - len..].to_vec()
    }
}

#[allow(clippy::too_many_arguments)]
fn scan_one_block(
    nand: &mut dyn NandDriver,
    codec: &dyn TagCodec,
    geometry: &NandGeometry,
    blocks: &mut [BlockInfo],
    bitmap: &mut ChunkBitmap,
    objects: &mut ObjectTable,
    block_slot: u32,
    seen: &mut HashSet<(u32, u32)>,
    shadowed: &mut HashSet<u32>,
    lazy_load: bool,
) -> Result<()> {
    let block_num = geometry.start_block + block_slot;
    let data_len = geometry.data_bytes_per_chunk as usize;
    let mut data = vec![0u8; data_len];
    let mut oob = vec![0u8; geometry.spare_bytes_per_chunk as usize];

    for page in 0..geometry.chunks_per_block {
        let ecc_read = nand.read_chunk(block_num, page, &mut data, &mut oob)?;
        let tag_bytes = tag_bytes_for(codec, &data, &oob);
        let DecodedTags { tags, extra, ecc } = codec.decode(&tag_bytes)?;
        if !tags.chunk_used {
            continue;
        }
        if ecc == EccResult::Unfixed || ecc_read == EccResult::Unfixed {
            blocks[block_slot as usize].flags.insert(BlockFlags::GC_PRIORITISE);
            continue;
        }

        if tags.is_header() {
            handle_header_chunk(
                objects, blocks, bitmap, block_slot, geometry.chunks_per_block, &tags, extra.as_ref(), &data, seen,
                shadowed, lazy_load,
            );
        } else if let Some(logical) = tags.logical_chunk() {
            handle_data_chunk(
                objects, blocks, bitmap, block_slot, geometry.chunks_per_block, tags.obj_id, logical, tags.n_bytes, page,
                seen,
            );
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn handle_header_chunk(
    objects: &mut ObjectTable,
    blocks: &mut [BlockInfo],
    bitmap: &mut ChunkBitmap,
    block_slot: u32,
    chunks_per_block: u32,
    tags: &crate::engine::header::Tags,
    extra: Option<&crate::engine::header::ExtraTags>,
    data: &[u8],
    seen: &mut HashSet<(u32, u32)>,
    shadowed: &mut HashSet<u32>,
    lazy_load: bool,
) {
    let key = (tags.obj_id, 0u32);
    if seen.contains(&key) || shadowed.contains(&tags.obj_id) {
        // superseded instance: contributes to soft_del_pages on its block.
        blocks[block_slot as usize].retire_chunk(true);
        return;
    }
    seen.insert(key);
    bitmap.set(block_slot, 0);
    blocks[block_slot as usize].add_live_chunk();

    let Some(hdr) = ObjectHeaderRecord::from_bytes(data) else {
        return;
    };
    if let Some(extra) = extra {
        if extra.shadows_obj_id >= 0 {
            shadowed.insert(extra.shadows_obj_id as u32);
        }
    }
    let obj_type = ObjectType::try_from(hdr.obj_type).unwrap_or(ObjectType::Unknown);
    let variant = match obj_type {
        ObjectType::File => ObjectVariant::File { size: hdr.file_size(), tnode: Tnode::new() },
        ObjectType::Directory => ObjectVariant::Directory { children: vec![] },
        ObjectType::Symlink => ObjectVariant::Symlink { alias: hdr.alias_str() },
        ObjectType::Hardlink => ObjectVariant::Hardlink { equiv_id: hdr.equiv_id.max(0) as u32 },
        ObjectType::Special => ObjectVariant::Special { rdev: hdr.rdev },
        ObjectType::Unknown => return,
    };
    let mut flags = ObjectFlags::VALID;
    if lazy_load {
        flags.insert(ObjectFlags::LAZY_LOADED);
    }
    objects.insert(Object {
        obj_id: tags.obj_id,
        parent_obj_id: hdr.parent_obj_id,
        name: hdr.name_str(),
        mode: hdr.mode,
        uid: hdr.uid,
        gid: hdr.gid,
        atime: hdr.atime,
        mtime: hdr.mtime,
        ctime: hdr.ctime,
        rdev: hdr.rdev,
        header_chunk: Some(chunk_addr(block_slot, 0, chunks_per_block)),
        variant,
        flags,
        xattr: XattrFlags::empty(),
        xattr_data: std::collections::HashMap::new(),
    });
}

#[allow(clippy::too_many_arguments)]
fn handle_data_chunk(
    objects: &mut ObjectTable,
    blocks: &mut [BlockInfo],
    bitmap: &mut ChunkBitmap,
    block_slot: u32,
    chunks_per_block: u32,
    obj_id: u32,
    logical_chunk: u32,
    n_bytes: u32,
    page: u32,
    seen: &mut HashSet<(u32, u32)>,
) {
    let key = (obj_id, logical_chunk + 1);
    if seen.contains(&key) {
        blocks[block_slot as usize].retire_chunk(true);
        return;
    }
    seen.insert(key);
    bitmap.set(block_slot, page);
    blocks[block_slot as usize].add_live_chunk();
    let _ = n_bytes;
    if let Some(obj) = objects.get_mut(obj_id) {
        if let ObjectVariant::File { tnode, .. } = &mut obj.variant {
            *tnode.add_find(logical_chunk) = chunk_addr(block_slot, page, chunks_per_block);
        }
    }
}

/// The scanner never sees a directory's sibling list directly — only each
/// child's own header, which carries `parent_obj_id`. This pass rebuilds
/// every directory's `children` from that, relinking orphans (parent not
/// resolvable) under `lost+found` unless `empty_lost_n_found` is set, in
/// which case they're deleted instead (spec.md §4.I step 7).
pub(crate) fn link_children_and_relink_orphans(objects: &mut ObjectTable, empty_lost_n_found: bool) {
    let child_ids: Vec<u32> = objects
        .iter()
        .filter(|o| o.obj_id != OBJECTID_ROOT && o.obj_id != OBJECTID_LOSTNFOUND)
        .map(|o| o.obj_id)
        .collect();
    for id in child_ids {
        let parent = objects.get(id).map(|o| o.parent_obj_id);
        let parent_is_dir = parent.and_then(|p| objects.get(p)).map(|p| p.is_dir()).unwrap_or(false);
        let target_parent = if parent_is_dir {
            parent.unwrap()
        } else if empty_lost_n_found {
            objects.remove(id);
            continue;
        } else {
            if let Some(obj) = objects.get_mut(id) {
                obj.parent_obj_id = OBJECTID_LOSTNFOUND;
            }
            OBJECTID_LOSTNFOUND
        };
        if let Some(parent_obj) = objects.get_mut(target_parent) {
            if let ObjectVariant::Directory { children } = &mut parent_obj.variant {
                if !children.contains(&id) {
                    children.push(id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tags::{TagStorage, Yaffs2Codec};
    use disk_driver::memory::MemoryNand;

    fn geometry() -> NandGeometry {
        NandGeometry { data_bytes_per_chunk: 512, spare_bytes_per_chunk: 32, chunks_per_block: 8, start_block: 0, end_block: 3, n_reserved_blocks: 1 }
    }

    fn write_header(
        nand: &mut MemoryNand,
        codec: &Yaffs2Codec,
        block: u32,
        page: u32,
        obj_id: u32,
        parent: u32,
        name: &str,
        seq: u32,
    ) {
        let mut hdr = ObjectHeaderRecord::zeroed();
        hdr.obj_type = ObjectType::File as u32;
        hdr.parent_obj_id = parent;
        hdr.set_name(name);
        hdr.mode = 0o644;
        let mut data = vec![0u8; 512];
        hdr.write_into(&mut data);
        let tags = crate::engine::header::Tags { chunk_used: true, obj_id, chunk_id: 0, n_bytes: 0, seq_number: seq };
        let extra = crate::engine::header::ExtraTags { parent_obj_id: parent, is_shrink: false, shadows_obj_id: -1, obj_type: ObjectType::File as u32, file_size: 0, equiv_id: -1 };
        let tag_bytes = codec.encode(&tags, Some(&extra));
        let mut oob = vec![0u8; 32];
        oob[..tag_bytes.len()].copy_from_slice(&tag_bytes);
        nand.program_chunk(block, page, &data, &oob).unwrap();
    }

    #[test]
    fn newest_header_wins_on_duplicate_obj_id() {
        let geo = geometry();
        let mut nand = MemoryNand::new(geo);
        let codec = Yaffs2Codec { storage: TagStorage::OutOfBand, ecc_enabled: false };
        // older instance in block 0 (lower seq), newer in block 1 (higher seq)
        write_header(&mut nand, &codec, 0, 0, 10, OBJECTID_ROOT, "old-name", 5);
        write_header(&mut nand, &codec, 1, 0, 10, OBJECTID_ROOT, "new-name", 9);

        let mut blocks: Vec<BlockInfo> = (0..4).map(|_| BlockInfo::fresh_empty()).collect();
        let mut bitmap = ChunkBitmap::new(4, 8);
        let mut objects = ObjectTable::new();
        scan_device(&mut nand, &codec, &geo, &mut blocks, &mut bitmap, &mut objects, false, false).unwrap();

        let obj = objects.get(10).unwrap();
        assert_eq!(obj.name, "new-name");
        assert_eq!(blocks[0].soft_del_pages, 1);
    }
}
