//! On-flash record layouts and the device-wide constants that govern them
//! (spec.md §3, §6). Grounded on `examples/original_source/fs/yaffs2/yaffs_guts.h`.

use num_enum::{IntoPrimitive, TryFromPrimitive};
use zerocopy::{AsBytes, FromBytes};

/// 19-bit object-id space (`yaffs_guts.h`'s `YAFFS_MAX_OBJECT_ID`-adjacent range).
pub const OBJECT_SPACE: u32 = 0x0004_0000;

pub const OBJECTID_ROOT: u32 = 1;
pub const OBJECTID_LOSTNFOUND: u32 = 2;
pub const OBJECTID_UNLINKED: u32 = 3;
pub const OBJECTID_DELETED: u32 = 4;
pub const OBJECTID_SUMMARY: u32 = 0x10;
pub const OBJECTID_CHECKPOINT_LO: u32 = 0x20;
pub const OBJECTID_CHECKPOINT_HI: u32 = 0x21;

pub fn is_reserved_object_id(id: u32) -> bool {
    matches!(
        id,
        OBJECTID_ROOT | OBJECTID_LOSTNFOUND | OBJECTID_UNLINKED | OBJECTID_DELETED | OBJECTID_SUMMARY
            | OBJECTID_CHECKPOINT_LO | OBJECTID_CHECKPOINT_HI
    )
}

pub const CHECKPOINT_VERSION: u32 = 8;
pub const CHECKPOINT_MAGIC: u32 = 0x0059_4643; // "YFC\0", arbitrary but stable

/// The block slot (relative to `geometry.start_block`) permanently reserved
/// for the checkpoint record. It is written/read directly by block/page
/// number rather than through the allocator, so it must never be handed out
/// as a normal log block — otherwise a checkpoint save's erase-then-program
/// could destroy a live header or data chunk the allocator placed there.
pub const CHECKPOINT_BLOCK_SLOT: u32 = 0;

/// Sequence numbers are assigned from this range; `SEQUENCE_BAD_BLOCK` is
/// reserved outside it so a genuine sequence number can never collide with
/// the "couldn't physically mark bad" sentinel (spec.md §9 open question a).
pub const LOWEST_SEQUENCE_NUMBER: u32 = 1;
pub const SEQUENCE_BAD_BLOCK: u32 = 0xffff_0000;
pub const HIGHEST_SEQUENCE_NUMBER: u32 = SEQUENCE_BAD_BLOCK - 1;

pub const WR_ATTEMPTS: u32 = 320;

pub const MAX_SHORT_NAME_LENGTH: usize = 15;
pub const MAX_NAME_LENGTH: usize = 255;
pub const MAX_ALIAS_LENGTH: usize = 159;

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum ObjectType {
    Unknown = 0,
    File = 1,
    Symlink = 2,
    Directory = 3,
    Hardlink = 4,
    Special = 5,
}

impl Default for ObjectType {
    fn default() -> Self {
        ObjectType::Unknown
    }
}

/// Fixed-length on-flash object header (spec.md §3, §6). `zerocopy` derives
/// drive the byte-level (de)serialization; raw-cast helpers in `utils.rs`
/// remain only for the variable-length tag bytes this derive can't reach.
#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes)]
pub struct ObjectHeaderRecord {
    pub obj_type: u32,
    pub parent_obj_id: u32,
    pub name_checksum: u16,
    pub _reserved0: u16,
    pub name: [u8; 256],
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: u32,
    pub mtime: u32,
    pub ctime: u32,
    pub file_size_low: u32,
    pub equiv_id: i32,
    pub alias: [u8; 160],
    pub rdev: u32,
    pub win_ctime: [u32; 2],
    pub win_atime: [u32; 2],
    pub win_mtime: [u32; 2],
    pub inband_shadowed_obj_id: u32,
    pub inband_is_shrink: u32,
    pub file_size_high: u32,
    pub shadows_obj: i32,
    pub is_shrink: u32,
    pub short_name: [u8; MAX_SHORT_NAME_LENGTH + 1],
    pub _reserved1: [u32; 3],
}

impl ObjectHeaderRecord {
    pub fn zeroed() -> Self {
        zerocopy::FromBytes::new_zeroed()
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        <Self as zerocopy::FromBytes>::read_from(bytes)
    }

    pub fn write_into(&self, out: &mut [u8]) {
        out[..std::mem::size_of::<Self>()].copy_from_slice(self.as_bytes());
    }

    pub fn name_str(&self) -> String {
        decode_fixed_str(&self.name)
    }

    pub fn set_name(&mut self, name: &str) {
        encode_fixed_str(&mut self.name, name);
        encode_fixed_str(&mut self.short_name, &name[..name.len().min(MAX_SHORT_NAME_LENGTH)]);
    }

    pub fn alias_str(&self) -> String {
        decode_fixed_str(&self.alias)
    }

    pub fn set_alias(&mut self, alias: &str) {
        encode_fixed_str(&mut self.alias, alias);
    }

    pub fn file_size(&self) -> u64 {
        (self.file_size_high as u64) << 32 | self.file_size_low as u64
    }

    pub fn set_file_size(&mut self, size: u64) {
        self.file_size_low = size as u32;
        self.file_size_high = (size >> 32) as u32;
    }
}

fn decode_fixed_str(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

fn encode_fixed_str(buf: &mut [u8], s: &str) {
    buf.iter_mut().for_each(|b| *b = 0);
    let bytes = s.as_bytes();
    let n = bytes.len().min(buf.len() - 1);
    buf[..n].copy_from_slice(&bytes[..n]);
}

/// In-memory view of a chunk's core tag fields (spec.md §4.B). The wire
/// encoding (OOB vs inband, YAFFS1 vs YAFFS2 packing) lives in `tags.rs`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tags {
    pub chunk_used: bool,
    pub obj_id: u32,
    /// 0 = header chunk, N>=1 = data chunk holding logical chunk N-1.
    pub chunk_id: u32,
    pub n_bytes: u32,
    pub seq_number: u32,
}

impl Tags {
    pub fn is_header(&self) -> bool {
        self.chunk_used && self.chunk_id == 0
    }

    pub fn logical_chunk(&self) -> Option<u32> {
        (self.chunk_used && self.chunk_id > 0).then(|| self.chunk_id - 1)
    }
}

/// The "extra" group carried only by header chunks (spec.md §4.B).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtraTags {
    pub parent_obj_id: u32,
    pub is_shrink: bool,
    pub shadows_obj_id: i32,
    pub obj_type: u32,
    pub file_size: u64,
    pub equiv_id: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_name_round_trips() {
        let mut hdr = ObjectHeaderRecord::zeroed();
        hdr.set_name("a-fairly-long-file-name.txt");
        assert_eq!(hdr.name_str(), "a-fairly-long-file-name.txt");
        assert_eq!(hdr.short_name.len(), MAX_SHORT_NAME_LENGTH + 1);
    }

    #[test]
    fn file_size_packs_into_two_halves() {
        let mut hdr = ObjectHeaderRecord::zeroed();
        hdr.set_file_size(0x1_0000_0001);
        assert_eq!(hdr.file_size_low, 1);
        assert_eq!(hdr.file_size_high, 1);
        assert_eq!(hdr.file_size(), 0x1_0000_0001);
    }

    #[test]
    fn bad_block_sentinel_outside_sequence_range() {
        assert!(SEQUENCE_BAD_BLOCK > HIGHEST_SEQUENCE_NUMBER);
    }
}
