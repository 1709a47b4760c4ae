//! `nandfs`: a log-structured NAND flash filesystem engine (spec.md §1-§9),
//! exposed as a library, a CLI/daemon binary (`main.rs`), and — behind the
//! `fuse-adapter` feature — a mountable FUSE filesystem (`vfs_adapter.rs`).

extern crate core;

pub mod engine;
#[cfg(feature = "fuse-adapter")]
pub mod vfs_adapter;

use lazy_static::lazy_static;
use mut_static::MutStatic;

lazy_static! {
    /// Absolute mountpoint path, set once by `main.rs` before mounting.
    pub static ref MOUNT_POINT: MutStatic<String> = MutStatic::new();
    /// Backing image file path, set once by `main.rs`.
    pub static ref DEVICE_FILE: MutStatic<String> = MutStatic::new();
}

/// `env_logger` initialisation: respects `RUST_LOG`, defaults to `info`.
pub fn init_logs() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).try_init();
}

/// Ad hoc field dump for tracing during development.
#[macro_export]
macro_rules! prv {
    ($($e:expr),+ $(,)?) => {
        $(log::debug!("{} = {:?}", stringify!($e), $e);)+
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn globals_round_trip() {
        MOUNT_POINT.set("/mnt/nandfs".to_string()).unwrap();
        assert_eq!(MOUNT_POINT.read().unwrap().as_str(), "/mnt/nandfs");
    }
}
