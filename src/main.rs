use anyhow::{anyhow, bail, Result};
use clap::{arg, command, ArgAction, ArgMatches, Command};
use disk_driver::file::FileNand;
use disk_driver::NandGeometry;
use log::*;
use nandfs::engine::mount::MountOptions;
use nandfs::engine::Device;
use nandfs::{init_logs, DEVICE_FILE, MOUNT_POINT};
use std::env::set_var;
use std::io::{self, BufRead, Write as _};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[cfg(feature = "fuse-adapter")]
use {
    execute::Execute, fork::fork, fork::Fork, fuser::MountOption, nandfs::vfs_adapter::VfsAdapter, nix::sys::signal,
    retry::delay::Fixed, retry::{retry_with_index, OperationResult}, std::process::Stdio,
};

fn geometry_args(cmd: Command) -> Command {
    cmd.arg(arg!(--"data-bytes" <N> "Payload bytes per chunk").default_value("2048"))
        .arg(arg!(--"spare-bytes" <N> "Out-of-band bytes per chunk").default_value("64"))
        .arg(arg!(--"chunks-per-block" <N> "Chunks (pages) per erase block").default_value("64"))
        .arg(arg!(--blocks <N> "Number of erase blocks in the image").default_value("64"))
        .arg(arg!(--"reserved-blocks" <N> "Blocks held back as the GC reserve").default_value("4"))
}

fn geometry_from(matches: &ArgMatches) -> Result<NandGeometry> {
    let n_blocks: u32 = matches.get_one::<String>("blocks").unwrap().parse()?;
    Ok(NandGeometry {
        data_bytes_per_chunk: matches.get_one::<String>("data-bytes").unwrap().parse()?,
        spare_bytes_per_chunk: matches.get_one::<String>("spare-bytes").unwrap().parse()?,
        chunks_per_block: matches.get_one::<String>("chunks-per-block").unwrap().parse()?,
        start_block: 0,
        end_block: n_blocks.saturating_sub(1),
        n_reserved_blocks: matches.get_one::<String>("reserved-blocks").unwrap().parse()?,
    })
}

fn main() -> Result<()> {
    let matches = command!()
        .arg(arg!(-v --verbose "Print more debug information, or set `RUST_LOG=debug`").action(ArgAction::SetTrue))
        .subcommand(geometry_args(
            Command::new("format")
                .about("Erase a NAND image and lay down a fresh filesystem")
                .arg(arg!(-d --device <FILE> "Device path (filesystem storage file)").required(true))
                .arg(arg!(-o --options <OPTS> "Comma-separated mount options").default_value("")),
        ))
        .subcommand(
            Command::new("fsck")
                .about("Mount read-only, report scan/checkpoint stats, unmount")
                .arg(arg!(-d --device <FILE> "Device path (filesystem storage file)").required(true))
                .arg(arg!(-o --options <OPTS> "Comma-separated mount options").default_value("")),
        )
        .subcommand(
            Command::new("shell")
                .about("Mount and drive the filesystem from an interactive line shell")
                .arg(arg!(-d --device <FILE> "Device path (filesystem storage file)").required(true))
                .arg(arg!(-o --options <OPTS> "Comma-separated mount options").default_value("")),
        )
        .subcommand(
            Command::new("mount")
                .about("Mount as a FUSE filesystem")
                .arg(arg!([mountpoint] "Mountpoint directory").default_value("tests/mnt"))
                .arg(arg!(-d --device <FILE> "Device path (filesystem storage file)").default_value("ddriver"))
                .arg(arg!(-o --options <OPTS> "Comma-separated mount options").default_value(""))
                .arg(arg!(-r --"read-only" "Mount as read only filesystem").action(ArgAction::SetTrue))
                .arg(arg!(-f --front "Keep daemon running in front").action(ArgAction::SetTrue))
                .arg(arg!(--"no-gc-worker" "Disable the background GC thread").action(ArgAction::SetTrue)),
        )
        .get_matches();

    if matches.get_flag("verbose") {
        set_var("RUST_LOG", "debug");
    }
    init_logs();

    match matches.subcommand() {
        Some(("format", sub)) => cmd_format(sub),
        Some(("fsck", sub)) => cmd_fsck(sub),
        Some(("shell", sub)) => cmd_shell(sub),
        Some(("mount", sub)) => cmd_mount(sub),
        _ => bail!("a subcommand is required (format, mount, fsck, shell); see --help"),
    }
}

fn open_device(sub: &ArgMatches) -> Result<FileNand> {
    let device = sub.get_one::<String>("device").unwrap();
    FileNand::open(device, default_geometry())
}

/// Geometry is fixed once a device image exists, so `mount`/`fsck`/`shell`
/// read it back rather than re-accepting it on the command line; only
/// `format` picks the layout for a fresh image.
fn default_geometry() -> NandGeometry {
    NandGeometry { data_bytes_per_chunk: 2048, spare_bytes_per_chunk: 64, chunks_per_block: 64, start_block: 0, end_block: 63, n_reserved_blocks: 4 }
}

fn cmd_format(sub: &ArgMatches) -> Result<()> {
    let device = sub.get_one::<String>("device").unwrap();
    let geometry = geometry_from(sub)?;
    let nand = FileNand::open(device, geometry)?;
    let options = MountOptions::parse(sub.get_one::<String>("options").unwrap());
    let dev = Device::format(nand, options).map_err(|e| anyhow!("format failed: {}", e))?;
    dev.unmount().map_err(|e| anyhow!("unmount after format failed: {}", e))?;
    info!("formatted {}", device);
    Ok(())
}

fn cmd_fsck(sub: &ArgMatches) -> Result<()> {
    let nand = open_device(sub)?;
    let options = MountOptions::parse(sub.get_one::<String>("options").unwrap());
    let mut dev = Device::mount(nand, options).map_err(|e| anyhow!("mount failed: {}", e))?;
    dev.set_read_only(true);
    let root_entries = dev.readdir(nandfs::engine::header::OBJECTID_ROOT).map_err(|e| anyhow!("{}", e))?;
    println!("free blocks: {}", dev.free_blocks());
    println!("root entries: {}", root_entries.len());
    println!("stats: {:?}", dev.stats);
    dev.unmount().map_err(|e| anyhow!("unmount failed: {}", e))?;
    Ok(())
}

/// Resolve a `/`-separated path to an obj_id, walking from the root by name.
fn resolve_path<D: disk_driver::NandDriver>(dev: &Device<D>, path: &str) -> Result<u32> {
    let mut current = nandfs::engine::header::OBJECTID_ROOT;
    for component in path.split('/').filter(|s| !s.is_empty()) {
        current = dev.find_by_name(current, component).map_err(|e| anyhow!("{}: {}", path, e))?.obj_id;
    }
    Ok(current)
}

fn cmd_shell(sub: &ArgMatches) -> Result<()> {
    let nand = open_device(sub)?;
    let options = MountOptions::parse(sub.get_one::<String>("options").unwrap());
    let mut dev = Device::mount(nand, options).map_err(|e| anyhow!("mount failed: {}", e))?;
    println!("nandfs shell — ls/cat/mkdir/touch/write/rm/stat/sync/exit");
    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        let mut words = line.split_whitespace();
        let Some(cmd) = words.next() else { continue };
        let rest: Vec<&str> = words.collect();
        let result = run_shell_command(&mut dev, cmd, &rest);
        if let Err(e) = result {
            println!("error: {}", e);
        }
        if cmd == "exit" || cmd == "quit" {
            break;
        }
    }
    dev.unmount().map_err(|e| anyhow!("unmount failed: {}", e))?;
    Ok(())
}

fn run_shell_command<D: disk_driver::NandDriver>(dev: &mut Device<D>, cmd: &str, args: &[&str]) -> Result<()> {
    match cmd {
        "ls" => {
            let path = args.first().copied().unwrap_or("");
            let dir = resolve_path(dev, path)?;
            for (id, name) in dev.readdir(dir).map_err(|e| anyhow!("{}", e))? {
                println!("{:>8}  {}", id, name);
            }
        }
        "mkdir" => {
            let path = args.first().ok_or_else(|| anyhow!("usage: mkdir <path>"))?;
            let (parent, name) = split_parent(dev, path)?;
            dev.create_dir(parent, &name, 0o755, 0, 0).map_err(|e| anyhow!("{}", e))?;
        }
        "touch" => {
            let path = args.first().ok_or_else(|| anyhow!("usage: touch <path>"))?;
            let (parent, name) = split_parent(dev, path)?;
            dev.create_file(parent, &name, 0o644, 0, 0).map_err(|e| anyhow!("{}", e))?;
        }
        "write" => {
            let path = args.first().ok_or_else(|| anyhow!("usage: write <path> <text...>"))?;
            let text = args[1..].join(" ");
            let id = resolve_path(dev, path)?;
            dev.write(id, 0, text.as_bytes()).map_err(|e| anyhow!("{}", e))?;
        }
        "cat" => {
            let path = args.first().ok_or_else(|| anyhow!("usage: cat <path>"))?;
            let id = resolve_path(dev, path)?;
            let mut buf = vec![0u8; 1 << 20];
            let n = dev.read(id, 0, &mut buf).map_err(|e| anyhow!("{}", e))?;
            io::stdout().write_all(&buf[..n])?;
            println!();
        }
        "rm" => {
            let path = args.first().ok_or_else(|| anyhow!("usage: rm <path>"))?;
            let (parent, name) = split_parent(dev, path)?;
            dev.unlink(parent, &name).map_err(|e| anyhow!("{}", e))?;
        }
        "stat" => {
            let path = args.first().ok_or_else(|| anyhow!("usage: stat <path>"))?;
            let id = resolve_path(dev, path)?;
            let obj = dev.attr(id).map_err(|e| anyhow!("{}", e))?;
            println!("obj_id={} mode={:o} uid={} gid={} mtime={}", obj.obj_id, obj.mode, obj.uid, obj.gid, obj.mtime);
        }
        "sync" => {
            dev.sync().map_err(|e| anyhow!("{}", e))?;
        }
        "exit" | "quit" => {}
        other => println!("unknown command {:?}", other),
    }
    Ok(())
}

fn split_parent<D: disk_driver::NandDriver>(dev: &Device<D>, path: &str) -> Result<(u32, String)> {
    let path = path.trim_end_matches('/');
    match path.rfind('/') {
        Some(idx) => Ok((resolve_path(dev, &path[..idx])?, path[idx + 1..].to_string())),
        None => Ok((nandfs::engine::header::OBJECTID_ROOT, path.to_string())),
    }
}

#[cfg(feature = "fuse-adapter")]
fn cmd_mount(sub: &ArgMatches) -> Result<()> {
    let mountpoint = sub.get_one::<String>("mountpoint").unwrap();
    let device = sub.get_one::<String>("device").unwrap();
    let path_mountpoint = std::fs::canonicalize(mountpoint)?;
    let abspath_mountpoint = path_mountpoint.to_str().unwrap().to_string();
    DEVICE_FILE.set(device.clone()).unwrap();
    MOUNT_POINT.set(abspath_mountpoint.clone()).unwrap();

    let nand = FileNand::open(device, default_geometry())?;
    let mut options = MountOptions::parse(sub.get_one::<String>("options").unwrap());
    let read_only = sub.get_flag("read-only");
    options.skip_checkpoint_write = options.skip_checkpoint_write || read_only;
    let mut dev = Device::mount(nand, options).map_err(|e| anyhow!("mount failed: {}", e))?;
    dev.set_read_only(read_only);

    macro_rules! umount {
        () => {{
            info!("unmounting {}", MOUNT_POINT.read().unwrap().clone());
            let mut command = execute::command_args!("fusermount", "-u", MOUNT_POINT.read().unwrap().clone());
            command.stdout(Stdio::piped());
            match command.execute_output() {
                Ok(out) => info!("fusermount: {}", String::from_utf8_lossy(&out.stdout)),
                Err(e) => warn!("fusermount failed: {}", e),
            }
        }};
    }

    extern "C" fn signal_handler(_: i32) {
        println!("[{}] received signal, unmounting", std::process::id());
        let mut command = execute::command_args!("fusermount", "-u", MOUNT_POINT.read().unwrap().clone());
        let _ = command.execute_output();
        std::process::exit(0);
    }
    let sig_action =
        signal::SigAction::new(signal::SigHandler::Handler(signal_handler), signal::SaFlags::SA_NODEFER, signal::SigSet::empty());
    unsafe {
        if let Err(e) = signal::sigaction(signal::SIGINT, &sig_action) {
            warn!("SIGINT handler install failed: {:?}", e);
        }
    }

    let fuse_options = vec![
        if read_only { MountOption::RO } else { MountOption::RW },
        MountOption::FSName("nandfs".to_string()),
    ];

    let shared = Arc::new(Mutex::new(dev));
    let worker = (!read_only && !sub.get_flag("no-gc-worker"))
        .then(|| nandfs::engine::GcWorker::spawn(shared.clone(), Duration::from_millis(200)));

    let retry_times = 3;
    let result = match if sub.get_flag("front") { Ok(Fork::Child) } else { fork() } {
        Ok(Fork::Parent(child)) => {
            info!("daemon running at pid {}", child);
            Ok(())
        }
        Ok(Fork::Child) => retry_with_index(Fixed::from_millis(100), |current_try| {
            info!("[try {}/{}] mounting at {}", current_try, retry_times, abspath_mountpoint);
            let adapter = VfsAdapter::new(shared.clone());
            match fuser::mount2(adapter, &abspath_mountpoint, &fuse_options) {
                Ok(()) => OperationResult::Ok(()),
                Err(e) if current_try > retry_times => {
                    OperationResult::Err(format!("mount failed after {} retries: {}", retry_times, e))
                }
                Err(_) => {
                    umount!();
                    OperationResult::Retry("mount failed, retrying after umount".to_string())
                }
            }
        })
        .map_err(|e| anyhow!("mount failed: {}", e)),
        Err(e) => Err(anyhow!("fork failed: {}", e)),
    };
    if let Some(worker) = worker {
        worker.stop();
    }
    if let Ok(dev) = Arc::try_unwrap(shared).map(|m| m.into_inner().unwrap()) {
        let _ = dev.unmount();
    }
    result
}

#[cfg(not(feature = "fuse-adapter"))]
fn cmd_mount(_sub: &ArgMatches) -> Result<()> {
    bail!("built without the `fuse-adapter` feature; rebuild with --features fuse-adapter to mount")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_path_resolution_round_trips() {
        let geometry = default_geometry();
        let nand = disk_driver::memory::MemoryNand::new(geometry);
        let mut dev = Device::format(nand, MountOptions::default()).unwrap();
        run_shell_command(&mut dev, "mkdir", &["a"]).unwrap();
        run_shell_command(&mut dev, "touch", &["a/b.txt"]).unwrap();
        run_shell_command(&mut dev, "write", &["a/b.txt", "hello", "world"]).unwrap();
        let id = resolve_path(&dev, "a/b.txt").unwrap();
        let mut buf = vec![0u8; 16];
        let n = dev.read(id, 0, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello world");
    }
}
