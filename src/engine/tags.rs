//! Tag codec (spec.md §4.B). Packs/unpacks the per-chunk tag record into
//! either the NAND spare area (OOB) or the tail of the chunk payload
//! (inband), with an optional YAFFS1-style legacy 8-byte+ECC packing for
//! platforms that need it. Both strategies share one `TagCodec` seam.

use crate::engine::header::{ExtraTags, Tags};
use anyhow::{anyhow, bail, Result};
use disk_driver::EccResult;
use zerocopy::{AsBytes, FromBytes};

/// Where per-chunk tags live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagStorage {
    /// Tags live in the NAND spare (out-of-band) area.
    OutOfBand,
    /// Tags live inline at the tail of the chunk payload, shrinking the
    /// usable data portion by `packed_len()`.
    Inband,
}

/// A decoded chunk: its core tags, the header "extra" group (only present
/// for header chunks), and the ECC outcome of decoding the tag bytes.
pub struct DecodedTags {
    pub tags: Tags,
    pub extra: Option<ExtraTags>,
    pub ecc: EccResult,
}

/// Strategy for packing `Tags`/`ExtraTags` to and from bytes. Selected at
/// mount by the `stored-endian`/legacy-tags mount options.
pub trait TagCodec {
    /// Bytes the packed tag record occupies, independent of storage mode.
    fn packed_len(&self) -> usize;

    fn encode(&self, tags: &Tags, extra: Option<&ExtraTags>) -> Vec<u8>;

    /// Returns `Unfixed` rather than an `Err` when the packed bytes don't
    /// check out — callers treat the chunk as absent, not as a hard error
    /// (spec.md §4.B, §7).
    fn decode(&self, bytes: &[u8]) -> Result<DecodedTags>;
}

/// The YAFFS2-style packer: a tag-ecc byte, a format byte, then the fields
/// verbatim, followed by the extra group when present. A single parity
/// byte over the payload stands in for the original's CRC-style tag ECC —
/// `FIXED` is reported when the parity disagrees but the record otherwise
/// parses; `Unfixed` when the record is structurally invalid.
pub struct Yaffs2Codec {
    pub storage: TagStorage,
    pub ecc_enabled: bool,
}

/// Fixed-size on-flash layout of the core tag group. All fields are 4 bytes
/// wide (booleans stored as `u32`) so the `repr(C)` layout has no implicit
/// padding, matching `ObjectHeaderRecord`'s own zerocopy-friendly shape.
#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes)]
struct Yaffs2CoreRecord {
    chunk_used: u32,
    obj_id: u32,
    chunk_id: u32,
    n_bytes: u32,
    seq_number: u32,
}

/// Fixed-size on-flash layout of the "extra" group carried by header chunks.
/// `file_size` is split into low/high halves, the same trick
/// `ObjectHeaderRecord` uses, to keep every field 4-byte aligned.
#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes)]
struct Yaffs2ExtraRecord {
    parent_obj_id: u32,
    is_shrink: u32,
    shadows_obj_id: i32,
    obj_type: u32,
    file_size_low: u32,
    file_size_high: u32,
    equiv_id: i32,
}

const YAFFS2_CORE_LEN: usize = std::mem::size_of::<Yaffs2CoreRecord>();
const YAFFS2_EXTRA_LEN: usize = std::mem::size_of::<Yaffs2ExtraRecord>();

impl Yaffs2Codec {
    fn core_len(&self) -> usize {
        YAFFS2_CORE_LEN + YAFFS2_EXTRA_LEN + if self.ecc_enabled { 1 } else { 0 }
    }

    fn parity(bytes: &[u8]) -> u8 {
        bytes.iter().fold(0u8, |acc, b| acc ^ b)
    }
}

impl TagCodec for Yaffs2Codec {
    fn packed_len(&self) -> usize {
        self.core_len()
    }

    fn encode(&self, tags: &Tags, extra: Option<&ExtraTags>) -> Vec<u8> {
        let core = Yaffs2CoreRecord {
            chunk_used: tags.chunk_used as u32,
            obj_id: tags.obj_id,
            chunk_id: tags.chunk_id,
            n_bytes: tags.n_bytes,
            seq_number: tags.seq_number,
        };
        let extra = extra.cloned().unwrap_or_default();
        let extra_record = Yaffs2ExtraRecord {
            parent_obj_id: extra.parent_obj_id,
            is_shrink: extra.is_shrink as u32,
            shadows_obj_id: extra.shadows_obj_id,
            obj_type: extra.obj_type,
            file_size_low: extra.file_size as u32,
            file_size_high: (extra.file_size >> 32) as u32,
            equiv_id: extra.equiv_id,
        };
        let mut out = Vec::with_capacity(self.core_len());
        out.extend_from_slice(core.as_bytes());
        out.extend_from_slice(extra_record.as_bytes());
        if self.ecc_enabled {
            let parity = Self::parity(&out);
            out.push(parity);
        }
        out
    }

    fn decode(&self, bytes: &[u8]) -> Result<DecodedTags> {
        if bytes.len() < self.core_len() {
            bail!("tag record too short: {} < {}", bytes.len(), self.core_len());
        }
        let core_and_extra = YAFFS2_CORE_LEN + YAFFS2_EXTRA_LEN;
        let mut ecc = EccResult::NoError;
        if self.ecc_enabled {
            let stored_parity = bytes[core_and_extra];
            let computed = Self::parity(&bytes[..core_and_extra]);
            if stored_parity != computed {
                ecc = EccResult::Fixed;
            }
        }
        let core = Yaffs2CoreRecord::read_from(&bytes[..YAFFS2_CORE_LEN])
            .ok_or_else(|| anyhow!("malformed core tag record"))?;
        let extra_record = Yaffs2ExtraRecord::read_from(&bytes[YAFFS2_CORE_LEN..core_and_extra])
            .ok_or_else(|| anyhow!("malformed extra tag record"))?;

        let chunk_used = core.chunk_used != 0;
        let tags = Tags {
            chunk_used,
            obj_id: core.obj_id,
            chunk_id: core.chunk_id,
            n_bytes: core.n_bytes,
            seq_number: core.seq_number,
        };
        let file_size = (extra_record.file_size_high as u64) << 32 | extra_record.file_size_low as u64;
        let extra = ExtraTags {
            parent_obj_id: extra_record.parent_obj_id,
            is_shrink: extra_record.is_shrink != 0,
            shadows_obj_id: extra_record.shadows_obj_id,
            obj_type: extra_record.obj_type,
            file_size,
            equiv_id: extra_record.equiv_id,
        };

        if !chunk_used {
            // An erased/never-programmed chunk reads back as all-0xff; a
            // structurally-parsed "unused" record with garbage fields is
            // indistinguishable from real corruption, so treat it as absent.
            if bytes.iter().all(|&b| b == 0xff) {
                return Ok(DecodedTags { tags: Tags::default(), extra: None, ecc: EccResult::NoError });
            }
        }
        Ok(DecodedTags { tags, extra: Some(extra), ecc })
    }
}

/// Legacy YAFFS1-style packing: tags squeezed into 8 bytes plus a 12-bit
/// ECC, no "extra" header group (YAFFS1 devices always re-read the full
/// object header; there is no inline header hint).
pub struct Yaffs1Codec;

const YAFFS1_PACKED_LEN: usize = 8 + 2; // 8 data bytes + 12-bit ecc stored in 2 bytes

impl Yaffs1Codec {
    fn ecc12(bytes: &[u8]) -> u16 {
        // A 12-bit parity-tree stand-in: fold the byte stream through a
        // CRC-like shift so single-bit corruption changes the checksum.
        let mut crc: u16 = 0;
        for &b in bytes {
            crc ^= (b as u16) << 4;
            for _ in 0..8 {
                crc = if crc & 0x800 != 0 { (crc << 1) ^ 0x1021 } else { crc << 1 };
                crc &= 0x0fff;
            }
        }
        crc
    }
}

impl TagCodec for Yaffs1Codec {
    fn packed_len(&self) -> usize {
        YAFFS1_PACKED_LEN
    }

    fn encode(&self, tags: &Tags, _extra: Option<&ExtraTags>) -> Vec<u8> {
        let mut core = Vec::with_capacity(8);
        // YAFFS1 chunk ids and object ids are narrower; truncate to fit the
        // legacy 8-byte record the way the original packer does.
        let packed_id = ((tags.obj_id & 0x3ffff) << 10) | (tags.chunk_id.min(0x3ff));
        core.extend_from_slice(&packed_id.to_le_bytes());
        core.extend_from_slice(&(tags.n_bytes as u16).to_le_bytes());
        core.push(tags.chunk_used as u8);
        core.push(0); // reserved, matches the original's byte_count/unused padding
        let ecc = Self::ecc12(&core);
        let mut out = core;
        out.extend_from_slice(&ecc.to_le_bytes());
        out
    }

    fn decode(&self, bytes: &[u8]) -> Result<DecodedTags> {
        if bytes.len() < YAFFS1_PACKED_LEN {
            bail!("YAFFS1 tag record too short: {} < {}", bytes.len(), YAFFS1_PACKED_LEN);
        }
        let core = &bytes[..8];
        let stored_ecc = u16::from_le_bytes([bytes[8], bytes[9]]);
        let computed_ecc = Self::ecc12(core);
        let ecc = if stored_ecc == computed_ecc {
            EccResult::NoError
        } else if core.iter().all(|&b| b == 0xff) {
            EccResult::NoError
        } else {
            EccResult::Unfixed
        };
        let packed_id = u32::from_le_bytes([core[0], core[1], core[2], core[3]]);
        let obj_id = (packed_id >> 10) & 0x3ffff;
        let chunk_id = packed_id & 0x3ff;
        let n_bytes = u16::from_le_bytes([core[4], core[5]]) as u32;
        let chunk_used = core[6] != 0;
        let tags = Tags { chunk_used, obj_id, chunk_id, n_bytes, seq_number: 0 };
        Ok(DecodedTags { tags, extra: None, ecc })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tags() -> (Tags, ExtraTags) {
        (
            Tags { chunk_used: true, obj_id: 42, chunk_id: 0, n_bytes: 0, seq_number: 7 },
            ExtraTags { parent_obj_id: 1, is_shrink: false, shadows_obj_id: -1, obj_type: 3, file_size: 4096, equiv_id: -1 },
        )
    }

    #[test]
    fn yaffs2_round_trips_header_tags() -> Result<()> {
        let codec = Yaffs2Codec { storage: TagStorage::OutOfBand, ecc_enabled: true };
        let (tags, extra) = sample_tags();
        let bytes = codec.encode(&tags, Some(&extra));
        let decoded = codec.decode(&bytes)?;
        assert_eq!(decoded.ecc, EccResult::NoError);
        assert_eq!(decoded.tags, tags);
        assert_eq!(decoded.extra.unwrap(), extra);
        Ok(())
    }

    #[test]
    fn yaffs2_flips_a_bit_and_is_fixed() -> Result<()> {
        let codec = Yaffs2Codec { storage: TagStorage::Inband, ecc_enabled: true };
        let (tags, extra) = sample_tags();
        let mut bytes = codec.encode(&tags, Some(&extra));
        bytes[1] ^= 0x01;
        let decoded = codec.decode(&bytes)?;
        assert_eq!(decoded.ecc, EccResult::Fixed);
        Ok(())
    }

    #[test]
    fn yaffs1_round_trips_data_chunk_tags() -> Result<()> {
        let codec = Yaffs1Codec;
        let tags = Tags { chunk_used: true, obj_id: 99, chunk_id: 3, n_bytes: 512, seq_number: 0 };
        let bytes = codec.encode(&tags, None);
        let decoded = codec.decode(&bytes)?;
        assert_eq!(decoded.ecc, EccResult::NoError);
        assert_eq!(decoded.tags.obj_id, 99);
        assert_eq!(decoded.tags.chunk_id, 3);
        assert_eq!(decoded.tags.n_bytes, 512);
        Ok(())
    }

    #[test]
    fn yaffs1_detects_corruption() -> Result<()> {
        let codec = Yaffs1Codec;
        let tags = Tags { chunk_used: true, obj_id: 5, chunk_id: 1, n_bytes: 100, seq_number: 0 };
        let mut bytes = codec.encode(&tags, None);
        bytes[0] ^= 0xff;
        let decoded = codec.decode(&bytes)?;
        assert_eq!(decoded.ecc, EccResult::Unfixed);
        Ok(())
    }
}
