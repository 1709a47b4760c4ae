//! In-RAM object graph (spec.md §3, §4.D). Back-references are stable
//! `obj_id`s resolved through the hash table, never raw pointers (spec.md
//! §9: "Back-references ... re-architect as arena-allocated objects
//! addressed by stable obj_id").

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::header::{is_reserved_object_id, ObjectType, MAX_NAME_LENGTH};
use crate::engine::tnode::Tnode;
use bitflags::bitflags;
use std::collections::HashMap;

bitflags! {
    #[derive(Default)]
    pub struct ObjectFlags: u16 {
        const DELETED         = 0b0000_0000_0001;
        const SOFT_DEL        = 0b0000_0000_0010;
        const UNLINKED        = 0b0000_0000_0100;
        const FAKE            = 0b0000_0000_1000;
        const RENAME_ALLOWED  = 0b0000_0001_0000;
        const UNLINK_ALLOWED  = 0b0000_0010_0000;
        const DIRTY           = 0b0000_0100_0000;
        const VALID           = 0b0000_1000_0000;
        const LAZY_LOADED     = 0b0001_0000_0000;
        const DEFERED_FREE    = 0b0010_0000_0000;
        const BEING_CREATED   = 0b0100_0000_0000;
        const IS_SHADOWED     = 0b1000_0000_0000;
    }
}

bitflags! {
    #[derive(Default)]
    pub struct XattrFlags: u8 {
        const XATTR_KNOWN = 0b01;
        const HAS_XATTR   = 0b10;
    }
}

/// Physical location of an object header or data chunk: the chunk's flat
/// absolute chunk number (`block.rs::chunk_addr`), as produced by the
/// allocator.
pub type ChunkAddr = u32;

#[derive(Debug, Clone)]
pub enum ObjectVariant {
    File { size: u64, tnode: Tnode },
    Directory { children: Vec<u32> },
    Symlink { alias: String },
    Hardlink { equiv_id: u32 },
    Special { rdev: u32 },
}

impl ObjectVariant {
    pub fn obj_type(&self) -> ObjectType {
        match self {
            ObjectVariant::File { .. } => ObjectType::File,
            ObjectVariant::Directory { .. } => ObjectType::Directory,
            ObjectVariant::Symlink { .. } => ObjectType::Symlink,
            ObjectVariant::Hardlink { .. } => ObjectType::Hardlink,
            ObjectVariant::Special { .. } => ObjectType::Special,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Object {
    pub obj_id: u32,
    pub parent_obj_id: u32,
    pub name: String,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: u32,
    pub mtime: u32,
    pub ctime: u32,
    pub rdev: u32,
    pub header_chunk: Option<ChunkAddr>,
    pub variant: ObjectVariant,
    pub flags: ObjectFlags,
    pub xattr: XattrFlags,
    /// Extended attribute key/value store. In-RAM only: unlike the object
    /// header this has no on-flash record of its own, so it does not survive
    /// a fresh mount-time scan (only a checkpoint restore, which persists it
    /// alongside the object record it belongs to) — see DESIGN.md.
    pub xattr_data: HashMap<String, Vec<u8>>,
}

impl Object {
    pub fn is_dir(&self) -> bool {
        matches!(self.variant, ObjectVariant::Directory { .. })
    }
}

/// 256-bucket hash index over the object graph, keyed by `obj_id` (spec.md
/// §3: "Objects are indexed by obj_id in a 256-bucket hash table").
pub struct ObjectTable {
    buckets: Vec<HashMap<u32, Object>>,
    next_id: u32,
}

const N_BUCKETS: usize = 256;

fn bucket_of(obj_id: u32) -> usize {
    (obj_id as usize) & (N_BUCKETS - 1)
}

impl ObjectTable {
    pub fn new() -> Self {
        Self { buckets: (0..N_BUCKETS).map(|_| HashMap::new()).collect(), next_id: OBJECTID_FIRST_FREE }
    }

    pub fn get(&self, obj_id: u32) -> Option<&Object> {
        self.buckets[bucket_of(obj_id)].get(&obj_id)
    }

    pub fn get_mut(&mut self, obj_id: u32) -> Option<&mut Object> {
        self.buckets[bucket_of(obj_id)].get_mut(&obj_id)
    }

    pub fn insert(&mut self, obj: Object) {
        self.buckets[bucket_of(obj.obj_id)].insert(obj.obj_id, obj);
    }

    pub fn remove(&mut self, obj_id: u32) -> Option<Object> {
        self.buckets[bucket_of(obj_id)].remove(&obj_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Object> {
        self.buckets.iter().flat_map(|b| b.values())
    }

    fn alloc_id(&mut self, max_objects: u32) -> EngineResult<u32> {
        let start = self.next_id;
        loop {
            let candidate = self.next_id;
            self.next_id = if self.next_id + 1 >= OBJECT_SPACE_LIMIT { OBJECTID_FIRST_FREE } else { self.next_id + 1 };
            if !is_reserved_object_id(candidate) && self.get(candidate).is_none() {
                return Ok(candidate);
            }
            if self.next_id == start {
                return Err(EngineError::OutOfMemory);
            }
            if candidate >= max_objects {
                continue;
            }
        }
    }

    pub fn find_by_number(&self, obj_id: u32) -> Option<&Object> {
        self.get(obj_id)
    }

    pub fn find_by_name(&self, parent: u32, name: &str) -> Option<&Object> {
        let dir = self.get(parent)?;
        let children = match &dir.variant {
            ObjectVariant::Directory { children } => children,
            _ => return None,
        };
        children.iter().find_map(|&id| self.get(id).filter(|o| o.name == name))
    }

    /// Create a new object under `parent`, in-RAM only — the caller
    /// (component K) is responsible for writing the header chunk and
    /// reconciling failures.
    pub fn create(
        &mut self,
        parent: u32,
        name: &str,
        variant: ObjectVariant,
        mode: u32,
        uid: u32,
        gid: u32,
        now: u32,
        max_objects: u32,
    ) -> EngineResult<u32> {
        if name.len() > MAX_NAME_LENGTH {
            return Err(EngineError::NameTooLong);
        }
        if parent != 0 {
            let parent_obj = self.get(parent).ok_or(EngineError::NoSuchObject)?;
            if !parent_obj.is_dir() {
                return Err(EngineError::NotADirectory);
            }
        }
        let obj_id = self.alloc_id(max_objects)?;
        let obj = Object {
            obj_id,
            parent_obj_id: parent,
            name: name.to_string(),
            mode,
            uid,
            gid,
            atime: now,
            mtime: now,
            ctime: now,
            rdev: 0,
            header_chunk: None,
            variant,
            flags: ObjectFlags::VALID | ObjectFlags::DIRTY,
            xattr: XattrFlags::empty(),
            xattr_data: HashMap::new(),
        };
        self.insert(obj);
        if let Some(parent_obj) = self.get_mut(parent) {
            if let ObjectVariant::Directory { children } = &mut parent_obj.variant {
                children.push(obj_id);
            }
        }
        Ok(obj_id)
    }

    /// Detach `obj_id` from its parent directory's sibling list, in-RAM.
    pub fn detach_from_parent(&mut self, obj_id: u32) {
        let parent_id = match self.get(obj_id) {
            Some(o) => o.parent_obj_id,
            None => return,
        };
        if let Some(parent) = self.get_mut(parent_id) {
            if let ObjectVariant::Directory { children } = &mut parent.variant {
                children.retain(|&c| c != obj_id);
            }
        }
    }

    /// `unlink` (spec.md §4.D): remove the name, move the object under the
    /// unlinked pseudo-directory. Hardlink-equivalent objects and true
    /// deletion of the backing data are handled by component K, since that
    /// requires coordinating with the tnode tree and block bookkeeping.
    pub fn unlink(&mut self, obj_id: u32) -> EngineResult<()> {
        self.detach_from_parent(obj_id);
        let obj = self.get_mut(obj_id).ok_or(EngineError::NoSuchObject)?;
        obj.parent_obj_id = OBJECTID_UNLINKED_PLACEHOLDER;
        obj.flags.insert(ObjectFlags::UNLINKED | ObjectFlags::DIRTY);
        Ok(())
    }

    /// `rename` (spec.md §4.D). If `new_parent/new_name` already names an
    /// object, it becomes shadowed: the caller records `shadows_obj` on the
    /// new header so scan-time discards the shadowed identity.
    pub fn rename(&mut self, obj_id: u32, new_parent: u32, new_name: &str) -> EngineResult<Option<u32>> {
        if new_name.len() > MAX_NAME_LENGTH {
            return Err(EngineError::NameTooLong);
        }
        let shadowed = self.find_by_name(new_parent, new_name).map(|o| o.obj_id).filter(|&id| id != obj_id);
        if let Some(shadow_id) = shadowed {
            self.detach_from_parent(shadow_id);
            if let Some(shadow) = self.get_mut(shadow_id) {
                shadow.flags.insert(ObjectFlags::IS_SHADOWED | ObjectFlags::DELETED);
            }
        }
        self.detach_from_parent(obj_id);
        {
            let new_parent_obj = self.get(new_parent).ok_or(EngineError::NoSuchObject)?;
            if !new_parent_obj.is_dir() {
                return Err(EngineError::NotADirectory);
            }
        }
        let obj = self.get_mut(obj_id).ok_or(EngineError::NoSuchObject)?;
        obj.parent_obj_id = new_parent;
        obj.name = new_name.to_string();
        obj.flags.insert(ObjectFlags::DIRTY);
        if let Some(parent_obj) = self.get_mut(new_parent) {
            if let ObjectVariant::Directory { children } = &mut parent_obj.variant {
                children.push(obj_id);
            }
        }
        Ok(shadowed)
    }

    /// `link` (spec.md §4.D): create a hardlink object chained to `equiv_obj`.
    pub fn link(&mut self, parent: u32, name: &str, equiv_obj: u32, now: u32, max_objects: u32) -> EngineResult<u32> {
        self.get(equiv_obj).ok_or(EngineError::NoSuchObject)?;
        self.create(parent, name, ObjectVariant::Hardlink { equiv_id: equiv_obj }, 0, 0, 0, now, max_objects)
    }

    /// `retype` (spec.md §4.D): change an object's variant in place,
    /// preserving its identity and name. Used when, e.g., a placeholder
    /// created during scan turns out to be a directory once its header is
    /// read.
    pub fn retype(&mut self, obj_id: u32, variant: ObjectVariant) -> EngineResult<()> {
        let obj = self.get_mut(obj_id).ok_or(EngineError::NoSuchObject)?;
        obj.variant = variant;
        obj.flags.insert(ObjectFlags::DIRTY);
        Ok(())
    }

    pub fn directory_not_empty(&self, obj_id: u32) -> bool {
        match self.get(obj_id).map(|o| &o.variant) {
            Some(ObjectVariant::Directory { children }) => !children.is_empty(),
            _ => false,
        }
    }
}

const OBJECTID_FIRST_FREE: u32 = 0x40;
const OBJECT_SPACE_LIMIT: u32 = crate::engine::header::OBJECT_SPACE;
const OBJECTID_UNLINKED_PLACEHOLDER: u32 = crate::engine::header::OBJECTID_UNLINKED;

#[cfg(test)]
mod tests {
    use super::*;

    fn root_table() -> ObjectTable {
        let mut table = ObjectTable::new();
        table.insert(Object {
            obj_id: crate::engine::header::OBJECTID_ROOT,
            parent_obj_id: 0,
            name: String::new(),
            mode: 0o755,
            uid: 0,
            gid: 0,
            atime: 0,
            mtime: 0,
            ctime: 0,
            rdev: 0,
            header_chunk: None,
            variant: ObjectVariant::Directory { children: vec![] },
            flags: ObjectFlags::VALID,
            xattr: XattrFlags::empty(),
            xattr_data: HashMap::new(),
        });
        table
    }

    #[test]
    fn create_then_find_by_name() {
        let mut table = root_table();
        let id = table
            .create(1, "a", ObjectVariant::File { size: 0, tnode: Tnode::new() }, 0o644, 0, 0, 1000, 10_000)
            .unwrap();
        assert_eq!(table.find_by_name(1, "a").unwrap().obj_id, id);
    }

    #[test]
    fn rename_shadows_existing_name() {
        let mut table = root_table();
        let x = table
            .create(1, "x", ObjectVariant::File { size: 0, tnode: Tnode::new() }, 0o644, 0, 0, 0, 10_000)
            .unwrap();
        let y = table
            .create(1, "y", ObjectVariant::File { size: 0, tnode: Tnode::new() }, 0o644, 0, 0, 0, 10_000)
            .unwrap();
        let shadowed = table.rename(x, 1, "y").unwrap();
        assert_eq!(shadowed, Some(y));
        assert!(table.get(y).unwrap().flags.contains(ObjectFlags::IS_SHADOWED));
        assert_eq!(table.find_by_name(1, "y").unwrap().obj_id, x);
        assert!(table.find_by_name(1, "x").is_none());
    }

    #[test]
    fn unlink_detaches_from_directory() {
        let mut table = root_table();
        let id = table
            .create(1, "a", ObjectVariant::File { size: 0, tnode: Tnode::new() }, 0o644, 0, 0, 0, 10_000)
            .unwrap();
        table.unlink(id).unwrap();
        assert!(table.find_by_name(1, "a").is_none());
        assert!(table.get(id).unwrap().flags.contains(ObjectFlags::UNLINKED));
    }
}
