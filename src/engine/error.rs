//! Engine-internal error type (spec.md §7). Kept as a plain enum in the
//! teacher's no-`thiserror` style; converted to `anyhow::Error` at the
//! top-level API and to libc error codes at the FUSE shim.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineError {
    NandProgramFail,
    NandReadFail,
    NandEraseFail,
    EccUnfixable,
    BadBlock,
    NoSpace,
    NoSuchObject,
    NameTooLong,
    NotADirectory,
    DirectoryNotEmpty,
    CrossDevice,
    CheckpointInvalid,
    TagInvalid,
    OutOfMemory,
    ReadOnly,
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            EngineError::NandProgramFail => "NAND program failed",
            EngineError::NandReadFail => "NAND read failed",
            EngineError::NandEraseFail => "NAND erase failed",
            EngineError::EccUnfixable => "uncorrectable ECC error",
            EngineError::BadBlock => "block is bad",
            EngineError::NoSpace => "no space left on device",
            EngineError::NoSuchObject => "no such object",
            EngineError::NameTooLong => "name too long",
            EngineError::NotADirectory => "not a directory",
            EngineError::DirectoryNotEmpty => "directory not empty",
            EngineError::CrossDevice => "cross-device link",
            EngineError::CheckpointInvalid => "checkpoint invalid",
            EngineError::TagInvalid => "tag invalid",
            EngineError::OutOfMemory => "out of memory",
            EngineError::ReadOnly => "read-only filesystem",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for EngineError {}

pub type EngineResult<T> = Result<T, EngineError>;

/// libc errno for the FUSE shim (spec.md §7 propagation policy, surfaced as
/// a plain `i32` so `vfs_adapter.rs` doesn't need to pull in an fs-specific
/// error crate on top of `libc`).
impl EngineError {
    pub fn to_errno(self) -> i32 {
        match self {
            EngineError::NandProgramFail
            | EngineError::NandReadFail
            | EngineError::NandEraseFail
            | EngineError::BadBlock => libc::EIO,
            EngineError::EccUnfixable => libc::EIO,
            EngineError::NoSpace => libc::ENOSPC,
            EngineError::NoSuchObject => libc::ENOENT,
            EngineError::NameTooLong => libc::ENAMETOOLONG,
            EngineError::NotADirectory => libc::ENOTDIR,
            EngineError::DirectoryNotEmpty => libc::ENOTEMPTY,
            EngineError::CrossDevice => libc::EXDEV,
            EngineError::CheckpointInvalid => libc::EIO,
            EngineError::TagInvalid => libc::EIO,
            EngineError::OutOfMemory => libc::ENOMEM,
            EngineError::ReadOnly => libc::EROFS,
        }
    }
}
