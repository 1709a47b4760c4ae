//! FUSE translation layer, gated behind a cargo feature. Every method here
//! does the same two things: translate FUSE's `ino`/reply vocabulary into an
//! `engine::Device` call, and translate an `EngineError` back into a libc
//! errno via `EngineError::to_errno`. `obj_id` and FUSE `ino` are the same
//! number space — `OBJECTID_ROOT == 1 == FUSE_ROOT_ID`.

use crate::engine::api::Device;
use crate::engine::error::EngineError;
use crate::engine::header::OBJECTID_ROOT;
use crate::engine::object::{Object, ObjectVariant};
use disk_driver::NandDriver;
use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyWrite, ReplyXattr, Request, TimeOrNow,
};
use libc::c_int;
use std::ffi::OsStr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const TTL: Duration = Duration::from_secs(1);

fn epoch(secs: u32) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(secs as u64)
}

fn time_or_now(t: Option<TimeOrNow>, fallback: u32) -> Option<u32> {
    match t {
        None => None,
        Some(TimeOrNow::SpecificTime(st)) => {
            Some(st.duration_since(UNIX_EPOCH).map(|d| d.as_secs() as u32).unwrap_or(fallback))
        }
        Some(TimeOrNow::Now) => Some(fallback),
    }
}

fn file_type(obj: &Object) -> FileType {
    match &obj.variant {
        ObjectVariant::Directory { .. } => FileType::Directory,
        ObjectVariant::Symlink { .. } => FileType::Symlink,
        ObjectVariant::Hardlink { .. } => FileType::RegularFile,
        ObjectVariant::File { .. } => FileType::RegularFile,
        ObjectVariant::Special { .. } => {
            let fmt = obj.mode & libc::S_IFMT as u32;
            if fmt == libc::S_IFCHR as u32 {
                FileType::CharDevice
            } else if fmt == libc::S_IFBLK as u32 {
                FileType::BlockDevice
            } else if fmt == libc::S_IFIFO as u32 {
                FileType::NamedPipe
            } else if fmt == libc::S_IFSOCK as u32 {
                FileType::Socket
            } else {
                FileType::CharDevice
            }
        }
    }
}

/// `Device<D>` wrapped for shared access from `fuser`'s single-threaded
/// dispatch loop and the background GC thread (spec.md §5).
pub struct VfsAdapter<D: NandDriver + Send + 'static> {
    device: Arc<Mutex<Device<D>>>,
}

impl<D: NandDriver + Send + 'static> VfsAdapter<D> {
    pub fn new(device: Arc<Mutex<Device<D>>>) -> Self {
        Self { device }
    }

    /// Follow a hardlink object's `equiv_id` chain to the data-bearing
    /// object it stands in for (spec.md §3: hardlinks are distinct objects
    /// chained by `equiv_id`, not refcounts on a shared inode).
    fn resolve(dev: &Device<D>, obj_id: u32) -> Result<u32, EngineError> {
        let mut current = obj_id;
        loop {
            match &dev.attr(current)?.variant {
                ObjectVariant::Hardlink { equiv_id } => current = *equiv_id,
                _ => return Ok(current),
            }
        }
    }

    fn attr_for(dev: &Device<D>, ino: u64) -> Result<FileAttr, EngineError> {
        let obj_id = ino as u32;
        let content_id = Self::resolve(dev, obj_id)?;
        let content = dev.attr(content_id)?;
        let size = match &content.variant {
            ObjectVariant::File { size, .. } => *size,
            ObjectVariant::Symlink { alias } => alias.len() as u64,
            _ => 0,
        };
        let blksize = dev.geometry().data_bytes_per_chunk;
        let blocks = size.div_ceil(blksize.max(1) as u64);
        let identity = dev.attr(obj_id)?;
        Ok(FileAttr {
            ino,
            size,
            blocks,
            atime: epoch(identity.atime),
            mtime: epoch(identity.mtime),
            ctime: epoch(identity.ctime),
            crtime: epoch(identity.ctime),
            kind: file_type(content),
            perm: (identity.mode & 0o7777) as u16,
            nlink: 1,
            uid: identity.uid,
            gid: identity.gid,
            rdev: identity.rdev,
            blksize,
            flags: 0,
        })
    }
}

macro_rules! lock_or_eio {
    ($self:expr, $reply:expr) => {
        match $self.device.lock() {
            Ok(guard) => guard,
            Err(_) => {
                $reply.error(libc::EIO);
                return;
            }
        }
    };
}

impl<D: NandDriver + Send + 'static> Filesystem for VfsAdapter<D> {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        log::info!("mounted nandfs");
        Ok(())
    }

    fn destroy(&mut self) {
        if let Ok(mut dev) = self.device.lock() {
            let _ = dev.sync();
        }
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(name) = name.to_str() else { return reply.error(libc::EINVAL) };
        let dev = lock_or_eio!(self, reply);
        match dev.find_by_name(parent as u32, name) {
            Ok(obj) => {
                let ino = obj.obj_id as u64;
                match Self::attr_for(&dev, ino) {
                    Ok(attr) => reply.entry(&TTL, &attr, 0),
                    Err(e) => reply.error(e.to_errno()),
                }
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        let dev = lock_or_eio!(self, reply);
        match Self::attr_for(&dev, ino) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let obj_id = ino as u32;
        let mut dev = lock_or_eio!(self, reply);
        let now = chrono::Utc::now().timestamp() as u32;
        if let Err(e) = dev.set_attr(obj_id, mode, uid, gid, time_or_now(atime, now), time_or_now(mtime, now)) {
            return reply.error(e.to_errno());
        }
        if let Some(sz) = size {
            if let Err(e) = dev.resize(obj_id, sz) {
                return reply.error(e.to_errno());
            }
        }
        match Self::attr_for(&dev, ino) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let dev = lock_or_eio!(self, reply);
        match dev.attr(ino as u32) {
            Ok(obj) => match &obj.variant {
                ObjectVariant::Symlink { alias } => reply.data(alias.as_bytes()),
                _ => reply.error(libc::EINVAL),
            },
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn mknod(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let Some(name) = name.to_str() else { return reply.error(libc::EINVAL) };
        let mut dev = lock_or_eio!(self, reply);
        let file_type_bits = mode & libc::S_IFMT as u32;
        let result = if file_type_bits == 0 || file_type_bits == libc::S_IFREG as u32 {
            dev.create_file(parent as u32, name, mode, req.uid(), req.gid())
        } else {
            dev.create_special(parent as u32, name, mode, rdev, req.uid(), req.gid())
        };
        match result {
            Ok(id) => match Self::attr_for(&dev, id as u64) {
                Ok(attr) => reply.entry(&TTL, &attr, 0),
                Err(e) => reply.error(e.to_errno()),
            },
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn mkdir(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, mode: u32, _umask: u32, reply: ReplyEntry) {
        let Some(name) = name.to_str() else { return reply.error(libc::EINVAL) };
        let mut dev = lock_or_eio!(self, reply);
        match dev.create_dir(parent as u32, name, mode, req.uid(), req.gid()) {
            Ok(id) => match Self::attr_for(&dev, id as u64) {
                Ok(attr) => reply.entry(&TTL, &attr, 0),
                Err(e) => reply.error(e.to_errno()),
            },
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(name) = name.to_str() else { return reply.error(libc::EINVAL) };
        let mut dev = lock_or_eio!(self, reply);
        match dev.unlink(parent as u32, name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(name) = name.to_str() else { return reply.error(libc::EINVAL) };
        let mut dev = lock_or_eio!(self, reply);
        match dev.unlink(parent as u32, name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn symlink(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        link: &std::path::Path,
        reply: ReplyEntry,
    ) {
        let (Some(name), Some(link)) = (name.to_str(), link.to_str()) else { return reply.error(libc::EINVAL) };
        let mut dev = lock_or_eio!(self, reply);
        match dev.create_symlink(parent as u32, name, link, req.uid(), req.gid()) {
            Ok(id) => match Self::attr_for(&dev, id as u64) {
                Ok(attr) => reply.entry(&TTL, &attr, 0),
                Err(e) => reply.error(e.to_errno()),
            },
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn link(&mut self, _req: &Request<'_>, ino: u64, newparent: u64, newname: &OsStr, reply: ReplyEntry) {
        let Some(newname) = newname.to_str() else { return reply.error(libc::EINVAL) };
        let mut dev = lock_or_eio!(self, reply);
        match dev.link(newparent as u32, newname, ino as u32) {
            Ok(id) => match Self::attr_for(&dev, id as u64) {
                Ok(attr) => reply.entry(&TTL, &attr, 0),
                Err(e) => reply.error(e.to_errno()),
            },
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (Some(name), Some(newname)) = (name.to_str(), newname.to_str()) else {
            return reply.error(libc::EINVAL);
        };
        let mut dev = lock_or_eio!(self, reply);
        match dev.rename(parent as u32, name, newparent as u32, newname) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let mut dev = lock_or_eio!(self, reply);
        let content_id = match Self::resolve(&dev, ino as u32) {
            Ok(id) => id,
            Err(e) => return reply.error(e.to_errno()),
        };
        let mut buf = vec![0u8; size as usize];
        match dev.read(content_id, offset.max(0) as u64, &mut buf) {
            Ok(n) => reply.data(&buf[..n]),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let mut dev = lock_or_eio!(self, reply);
        let content_id = match Self::resolve(&dev, ino as u32) {
            Ok(id) => id,
            Err(e) => return reply.error(e.to_errno()),
        };
        match dev.write(content_id, offset.max(0) as u64, data) {
            Ok(n) => reply.written(n as u32),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        let mut dev = lock_or_eio!(self, reply);
        match dev.flush(ino as u32) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let mut dev = lock_or_eio!(self, reply);
        let _ = dev.flush(ino as u32);
        reply.ok();
    }

    fn readdir(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, offset: i64, mut reply: ReplyDirectory) {
        let dev = lock_or_eio!(self, reply);
        let entries = match dev.readdir(ino as u32) {
            Ok(e) => e,
            Err(e) => return reply.error(e.to_errno()),
        };
        let mut synthesized = vec![(ino as u32, ".".to_string()), (OBJECTID_ROOT, "..".to_string())];
        synthesized.extend(entries);
        for (i, (id, name)) in synthesized.into_iter().enumerate().skip(offset as usize) {
            let kind = match dev.attr(id) {
                Ok(obj) => file_type(obj),
                Err(_) => FileType::RegularFile,
            };
            if reply.add(id as u64, (i + 1) as i64, kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, _mask: i32, reply: ReplyEmpty) {
        let dev = lock_or_eio!(self, reply);
        match dev.attr(ino as u32) {
            Ok(_) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(name) = name.to_str() else { return reply.error(libc::EINVAL) };
        let mut dev = lock_or_eio!(self, reply);
        match dev.create_file(parent as u32, name, mode, req.uid(), req.gid()) {
            Ok(id) => match Self::attr_for(&dev, id as u64) {
                Ok(attr) => reply.created(&TTL, &attr, 0, 0, 0),
                Err(e) => reply.error(e.to_errno()),
            },
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let Some(name) = name.to_str() else { return reply.error(libc::EINVAL) };
        let mut dev = lock_or_eio!(self, reply);
        match dev.set_xattr(ino as u32, name, value) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn getxattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        let Some(name) = name.to_str() else { return reply.error(libc::EINVAL) };
        let dev = lock_or_eio!(self, reply);
        match dev.get_xattr(ino as u32, name) {
            Ok(value) => {
                if size == 0 {
                    reply.size(value.len() as u32)
                } else if value.len() > size as usize {
                    reply.error(libc::ERANGE)
                } else {
                    reply.data(&value)
                }
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        let dev = lock_or_eio!(self, reply);
        match dev.list_xattr(ino as u32) {
            Ok(names) => {
                let joined = names.iter().fold(Vec::new(), |mut acc, n| {
                    acc.extend_from_slice(n.as_bytes());
                    acc.push(0);
                    acc
                });
                if size == 0 {
                    reply.size(joined.len() as u32)
                } else if joined.len() > size as usize {
                    reply.error(libc::ERANGE)
                } else {
                    reply.data(&joined)
                }
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn removexattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(name) = name.to_str() else { return reply.error(libc::EINVAL) };
        let mut dev = lock_or_eio!(self, reply);
        match dev.remove_xattr(ino as u32, name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }
}
