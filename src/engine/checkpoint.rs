//! Checkpoint snapshot (spec.md §4.J): serializes runtime state into the
//! log so the next mount can skip a full scan, with a strict validity
//! envelope (magic/version/head/tail/checksum) that falls back to a full
//! scan on any mismatch rather than failing the mount.

use crate::engine::block::{BlockFlags, BlockInfo, BlockLifecycle};
use crate::engine::error::EngineError;
use crate::engine::header::ObjectType;
use crate::engine::object::{Object, ObjectFlags, ObjectTable, ObjectVariant};
use macro_tools::ApplyMem;
use std::collections::HashMap;
use zerocopy::{AsBytes, FromBytes};

/// Runtime counters mirrored into the checkpoint summary (spec.md §4.J).
#[derive(Debug, Clone, Default)]
pub struct DeviceRuntimeSummary {
    pub erased_block_count: u32,
    pub alloc_block: u32,
    pub alloc_page: u32,
    pub n_free_chunks: u32,
    pub n_deleted_files: u32,
    pub n_unlinked_files: u32,
    pub seq_number: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, ApplyMem)]
#[apply_mem(target = "DeviceRuntimeSummary")]
pub struct CheckpointSummaryRecord {
    pub erased_block_count: u32,
    pub alloc_block: u32,
    pub alloc_page: u32,
    pub n_free_chunks: u32,
    pub n_deleted_files: u32,
    pub n_unlinked_files: u32,
    pub seq_number: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes)]
struct ValidityMarker {
    magic: u32,
    version: u32,
    head: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes)]
pub struct CheckpointObjectRecord {
    pub obj_id: u32,
    pub obj_type: u32,
    pub parent_obj_id: u32,
    pub header_chunk: u64,
    pub flags: u32,
    pub n_data_chunks: u32,
    pub size_low: u32,
    pub size_high: u32,
    pub equiv_id: i32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes)]
pub struct CheckpointBlockRecord {
    pub state: u32,
    pub seq_number: u32,
    pub pages_in_use: u32,
    pub soft_del_pages: u32,
    pub flags: u32,
    pub strikes: u32,
}

fn lifecycle_to_u32(state: BlockLifecycle) -> u32 {
    match state {
        BlockLifecycle::Unknown => 0,
        BlockLifecycle::Scanning => 1,
        BlockLifecycle::NeedsScan => 2,
        BlockLifecycle::Empty => 3,
        BlockLifecycle::Allocating => 4,
        BlockLifecycle::Full => 5,
        BlockLifecycle::Dirty => 6,
        BlockLifecycle::Checkpoint => 7,
        BlockLifecycle::Collecting => 8,
        BlockLifecycle::Dead => 9,
    }
}

fn lifecycle_from_u32(v: u32) -> BlockLifecycle {
    match v {
        1 => BlockLifecycle::Scanning,
        2 => BlockLifecycle::NeedsScan,
        3 => BlockLifecycle::Empty,
        4 => BlockLifecycle::Allocating,
        5 => BlockLifecycle::Full,
        6 => BlockLifecycle::Dirty,
        7 => BlockLifecycle::Checkpoint,
        8 => BlockLifecycle::Collecting,
        9 => BlockLifecycle::Dead,
        _ => BlockLifecycle::Unknown,
    }
}

/// Rolling sum+xor checksum over the payload between the head and tail
/// validity markers.
fn checksum(bytes: &[u8]) -> (u32, u32) {
    let mut sum = std::num::Wrapping(0u32);
    let mut xor = 0u32;
    for chunk in bytes.chunks(4) {
        let mut word = [0u8; 4];
        word[..chunk.len()].copy_from_slice(chunk);
        let v = u32::from_le_bytes(word);
        sum += std::num::Wrapping(v);
        xor ^= v;
    }
    (sum.0, xor)
}

pub fn serialize(
    summary: &DeviceRuntimeSummary,
    objects: &ObjectTable,
    blocks: &[BlockInfo],
    bitmap_bits: &[u8],
    version: u32,
    magic: u32,
) -> Vec<u8> {
    let mut payload = Vec::new();
    let summary_record = CheckpointSummaryRecord::capture_from(summary);
    payload.extend_from_slice(summary_record.as_bytes());

    let objs: Vec<&Object> = objects.iter().collect();
    payload.extend_from_slice(&(objs.len() as u32).to_le_bytes());
    for o in &objs {
        let tnode_entries: Vec<(u32, u32)> = match &o.variant {
            ObjectVariant::File { tnode, .. } => tnode.iter_entries(),
            _ => Vec::new(),
        };
        let rec = CheckpointObjectRecord {
            obj_id: o.obj_id,
            obj_type: o.variant.obj_type().into(),
            parent_obj_id: o.parent_obj_id,
            header_chunk: o.header_chunk.unwrap_or(0) as u64,
            flags: o.flags.bits() as u32,
            n_data_chunks: tnode_entries.len() as u32,
            size_low: match &o.variant {
                ObjectVariant::File { size, .. } => *size as u32,
                _ => 0,
            },
            size_high: match &o.variant {
                ObjectVariant::File { size, .. } => (*size >> 32) as u32,
                _ => 0,
            },
            equiv_id: match &o.variant {
                ObjectVariant::Hardlink { equiv_id } => *equiv_id as i32,
                _ => -1,
            },
        };
        payload.extend_from_slice(rec.as_bytes());
        // Tnode entries ride immediately after their object's fixed record so
        // the reader can pull exactly `n_data_chunks` pairs before moving on
        // to the next object (spec.md §4.J: checkpoint must reproduce tnode
        // mappings exactly, not just file size).
        for (chunk_id, value) in &tnode_entries {
            payload.extend_from_slice(&chunk_id.to_le_bytes());
            payload.extend_from_slice(&value.to_le_bytes());
        }
        // xattr key/value pairs have no on-flash record of their own (§3
        // supplement); the checkpoint is the only thing that can carry them
        // across an unmount, so they ride here too.
        payload.extend_from_slice(&(o.xattr_data.len() as u32).to_le_bytes());
        for (key, value) in &o.xattr_data {
            payload.extend_from_slice(&(key.len() as u32).to_le_bytes());
            payload.extend_from_slice(key.as_bytes());
            payload.extend_from_slice(&(value.len() as u32).to_le_bytes());
            payload.extend_from_slice(value);
        }
    }

    let block_records: Vec<CheckpointBlockRecord> = blocks
        .iter()
        .map(|b| CheckpointBlockRecord {
            state: lifecycle_to_u32(b.state),
            seq_number: b.seq_number,
            pages_in_use: b.pages_in_use as u32,
            soft_del_pages: b.soft_del_pages as u32,
            flags: b.flags.bits() as u32,
            strikes: b.strikes as u32,
        })
        .collect();
    payload.extend_from_slice(&(block_records.len() as u32).to_le_bytes());
    for rec in &block_records {
        payload.extend_from_slice(rec.as_bytes());
    }

    payload.extend_from_slice(&(bitmap_bits.len() as u32).to_le_bytes());
    payload.extend_from_slice(bitmap_bits);

    let (sum, xor) = checksum(&payload);

    let mut out = Vec::new();
    out.extend_from_slice(ValidityMarker { magic, version, head: 1 }.as_bytes());
    out.extend_from_slice(&payload);
    out.extend_from_slice(&sum.to_le_bytes());
    out.extend_from_slice(&xor.to_le_bytes());
    out.extend_from_slice(ValidityMarker { magic, version, head: 0 }.as_bytes());
    out
}

pub struct RestoredCheckpoint {
    pub summary: DeviceRuntimeSummary,
    pub objects: Vec<CheckpointObjectRecord>,
    /// Per-object `(logical_chunk, physical_chunk)` pairs, keyed by `obj_id`,
    /// for rebuilding each file's tnode tree via `Tnode::from_entries`.
    pub tnode_entries: HashMap<u32, Vec<(u32, u32)>>,
    /// Per-object xattr key/value pairs, keyed by `obj_id`.
    pub xattr_data: HashMap<u32, HashMap<String, Vec<u8>>>,
    pub blocks: Vec<CheckpointBlockRecord>,
    pub bitmap_bits: Vec<u8>,
}

pub fn deserialize(bytes: &[u8], expected_version: u32, expected_magic: u32) -> Result<RestoredCheckpoint, EngineError> {
    let marker_len = std::mem::size_of::<ValidityMarker>();
    if bytes.len() < marker_len * 2 + 8 {
        return Err(EngineError::CheckpointInvalid);
    }
    let head = ValidityMarker::read_from(&bytes[..marker_len]).ok_or(EngineError::CheckpointInvalid)?;
    if head.magic != expected_magic || head.version != expected_version || head.head != 1 {
        return Err(EngineError::CheckpointInvalid);
    }
    let tail_start = bytes.len() - marker_len;
    let tail = ValidityMarker::read_from(&bytes[tail_start..]).ok_or(EngineError::CheckpointInvalid)?;
    if tail.magic != expected_magic || tail.version != expected_version || tail.head != 0 {
        return Err(EngineError::CheckpointInvalid);
    }

    let payload_end = tail_start - 8;
    let payload = &bytes[marker_len..payload_end];
    let stored_sum = u32::from_le_bytes(bytes[payload_end..payload_end + 4].try_into().unwrap());
    let stored_xor = u32::from_le_bytes(bytes[payload_end + 4..payload_end + 8].try_into().unwrap());
    let (sum, xor) = checksum(payload);
    if sum != stored_sum || xor != stored_xor {
        return Err(EngineError::CheckpointInvalid);
    }

    let mut off = 0usize;
    let summary_len = std::mem::size_of::<CheckpointSummaryRecord>();
    let summary_record =
        CheckpointSummaryRecord::read_from(&payload[off..off + summary_len]).ok_or(EngineError::CheckpointInvalid)?;
    off += summary_len;
    let mut summary = DeviceRuntimeSummary::default();
    summary_record.apply_to(&mut summary);

    let n_objects = read_u32(payload, &mut off)?;
    let obj_len = std::mem::size_of::<CheckpointObjectRecord>();
    let mut objects = Vec::with_capacity(n_objects as usize);
    let mut tnode_entries = HashMap::new();
    let mut xattr_data = HashMap::new();
    for _ in 0..n_objects {
        let rec = CheckpointObjectRecord::read_from(payload.get(off..off + obj_len).ok_or(EngineError::CheckpointInvalid)?)
            .ok_or(EngineError::CheckpointInvalid)?;
        off += obj_len;
        if rec.obj_type == ObjectType::File as u32 && rec.n_data_chunks > 0 {
            let mut entries = Vec::with_capacity(rec.n_data_chunks as usize);
            for _ in 0..rec.n_data_chunks {
                let chunk_id = read_u32(payload, &mut off)?;
                let value = read_u32(payload, &mut off)?;
                entries.push((chunk_id, value));
            }
            tnode_entries.insert(rec.obj_id, entries);
        }
        let n_xattrs = read_u32(payload, &mut off)?;
        if n_xattrs > 0 {
            let mut map = HashMap::new();
            for _ in 0..n_xattrs {
                let key_len = read_u32(payload, &mut off)? as usize;
                let key_bytes = payload.get(off..off + key_len).ok_or(EngineError::CheckpointInvalid)?;
                let key = String::from_utf8_lossy(key_bytes).into_owned();
                off += key_len;
                let val_len = read_u32(payload, &mut off)? as usize;
                let value = payload.get(off..off + val_len).ok_or(EngineError::CheckpointInvalid)?.to_vec();
                off += val_len;
                map.insert(key, value);
            }
            xattr_data.insert(rec.obj_id, map);
        }
        objects.push(rec);
    }

    let n_blocks = read_u32(payload, &mut off)?;
    let block_len = std::mem::size_of::<CheckpointBlockRecord>();
    let mut blocks = Vec::with_capacity(n_blocks as usize);
    for _ in 0..n_blocks {
        let rec = CheckpointBlockRecord::read_from(payload.get(off..off + block_len).ok_or(EngineError::CheckpointInvalid)?)
            .ok_or(EngineError::CheckpointInvalid)?;
        blocks.push(rec);
        off += block_len;
    }

    let bitmap_len = read_u32(payload, &mut off)? as usize;
    let bitmap_bits = payload.get(off..off + bitmap_len).ok_or(EngineError::CheckpointInvalid)?.to_vec();

    Ok(RestoredCheckpoint { summary, objects, tnode_entries, xattr_data, blocks, bitmap_bits })
}

fn read_u32(bytes: &[u8], off: &mut usize) -> Result<u32, EngineError> {
    let slice = bytes.get(*off..*off + 4).ok_or(EngineError::CheckpointInvalid)?;
    *off += 4;
    Ok(u32::from_le_bytes(slice.try_into().unwrap()))
}

pub fn block_record_to_info(rec: &CheckpointBlockRecord) -> BlockInfo {
    BlockInfo {
        state: lifecycle_from_u32(rec.state),
        seq_number: rec.seq_number,
        pages_in_use: rec.pages_in_use as u16,
        soft_del_pages: rec.soft_del_pages as u16,
        flags: BlockFlags::from_bits_truncate(rec.flags as u8),
        strikes: rec.strikes as u8,
    }
}

pub fn object_record_to_stub(
    rec: &CheckpointObjectRecord,
    tnode_entries: &[(u32, u32)],
    xattr_data: HashMap<String, Vec<u8>>,
) -> Object {
    use crate::engine::tnode::{Tnode, TnodeMode};
    let obj_type = ObjectType::try_from(rec.obj_type).unwrap_or(ObjectType::Unknown);
    let variant = match obj_type {
        ObjectType::File => ObjectVariant::File {
            size: (rec.size_high as u64) << 32 | rec.size_low as u64,
            tnode: Tnode::from_entries(TnodeMode::Wide, tnode_entries),
        },
        ObjectType::Directory => ObjectVariant::Directory { children: vec![] },
        ObjectType::Symlink => ObjectVariant::Symlink { alias: String::new() },
        ObjectType::Hardlink => ObjectVariant::Hardlink { equiv_id: rec.equiv_id.max(0) as u32 },
        _ => ObjectVariant::Special { rdev: 0 },
    };
    Object {
        obj_id: rec.obj_id,
        parent_obj_id: rec.parent_obj_id,
        name: String::new(),
        mode: 0,
        uid: 0,
        gid: 0,
        atime: 0,
        mtime: 0,
        ctime: 0,
        rdev: 0,
        header_chunk: Some(rec.header_chunk as u32),
        variant,
        flags: ObjectFlags::from_bits_truncate(rec.flags as u16),
        xattr: if xattr_data.is_empty() {
            crate::engine::object::XattrFlags::empty()
        } else {
            crate::engine::object::XattrFlags::XATTR_KNOWN | crate::engine::object::XattrFlags::HAS_XATTR
        },
        xattr_data,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::header::CHECKPOINT_VERSION;

    #[test]
    fn round_trips_summary_and_block_table() {
        let summary = DeviceRuntimeSummary { erased_block_count: 3, alloc_block: 1, alloc_page: 2, n_free_chunks: 500, n_deleted_files: 1, n_unlinked_files: 0, seq_number: 42 };
        let objects = ObjectTable::new();
        let blocks = vec![BlockInfo::fresh_empty(), BlockInfo::fresh_empty()];
        let bitmap_bits = vec![0u8; 4];
        let bytes = serialize(&summary, &objects, &blocks, &bitmap_bits, CHECKPOINT_VERSION, 0x1234);
        let restored = deserialize(&bytes, CHECKPOINT_VERSION, 0x1234).unwrap();
        assert_eq!(restored.summary.seq_number, 42);
        assert_eq!(restored.blocks.len(), 2);
    }

    #[test]
    fn wrong_version_is_rejected() {
        let summary = DeviceRuntimeSummary::default();
        let objects = ObjectTable::new();
        let bytes = serialize(&summary, &objects, &[], &[], CHECKPOINT_VERSION, 0x1234);
        assert!(deserialize(&bytes, CHECKPOINT_VERSION + 1, 0x1234).is_err());
    }

    #[test]
    fn round_trips_file_tnode_mappings() {
        use crate::engine::object::ObjectVariant;
        use crate::engine::tnode::Tnode;
        let mut objects = ObjectTable::new();
        let obj_id = objects
            .create(0, "data.bin", ObjectVariant::File { size: 0, tnode: Tnode::new() }, 0o644, 0, 0, 0, 10_000)
            .unwrap();
        {
            let obj = objects.get_mut(obj_id).unwrap();
            obj.xattr_data.insert("user.comment".to_string(), b"hello".to_vec());
            if let ObjectVariant::File { tnode, .. } = &mut obj.variant {
                *tnode.add_find(0) = 10;
                *tnode.add_find(7) = 70;
                *tnode.add_find(500_000) = 99;
            }
        }
        let summary = DeviceRuntimeSummary::default();
        let bytes = serialize(&summary, &objects, &[], &[], CHECKPOINT_VERSION, 0x1234);
        let restored = deserialize(&bytes, CHECKPOINT_VERSION, 0x1234).unwrap();
        let rec = restored.objects.iter().find(|r| r.obj_id == obj_id).unwrap();
        assert_eq!(rec.n_data_chunks, 3);
        let entries = restored.tnode_entries.get(&obj_id).unwrap();
        let xattrs = restored.xattr_data.get(&obj_id).cloned().unwrap_or_default();
        let rebuilt = object_record_to_stub(rec, entries, xattrs);
        if let ObjectVariant::File { tnode, .. } = &rebuilt.variant {
            assert_eq!(tnode.find(0), Some(10));
            assert_eq!(tnode.find(7), Some(70));
            assert_eq!(tnode.find(500_000), Some(99));
        } else {
            panic!("expected a file variant");
        }
        assert_eq!(rebuilt.xattr_data.get("user.comment"), Some(&b"hello".to_vec()));
    }

    #[test]
    fn corrupted_payload_fails_checksum() {
        let summary = DeviceRuntimeSummary::default();
        let objects = ObjectTable::new();
        let mut bytes = serialize(&summary, &objects, &[], &[], CHECKPOINT_VERSION, 0x1234);
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xff;
        assert!(deserialize(&bytes, CHECKPOINT_VERSION, 0x1234).is_err());
    }
}
