//! Background GC (spec.md §5, SPEC_FULL §5). The teacher's FUSE filesystem
//! has no concurrency of its own — `fuser` dispatches every request on one
//! thread — so this is the one new seam: callers share a mounted `Device`
//! through a single gross `std::sync::Mutex` and a background thread keeps
//! garbage collection running between requests, joined at shutdown via an
//! atomic flag rather than left detached.

use crate::engine::api::Device;
use disk_driver::NandDriver;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub struct GcWorker {
    bg_running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl GcWorker {
    /// Spawn a thread that calls `run_gc_pass` on `device` until stopped,
    /// sleeping `idle_backoff` whenever a pass finds nothing to collect.
    pub fn spawn<D>(device: Arc<Mutex<Device<D>>>, idle_backoff: Duration) -> Self
    where
        D: NandDriver + Send + 'static,
    {
        let bg_running = Arc::new(AtomicBool::new(true));
        let running = bg_running.clone();
        let handle = thread::spawn(move || {
            while running.load(Ordering::Relaxed) {
                let collected = match device.lock() {
                    Ok(mut dev) => dev.run_gc_pass().unwrap_or(false),
                    Err(_) => break,
                };
                if !collected {
                    thread::sleep(idle_backoff);
                }
            }
        });
        Self { bg_running, handle: Some(handle) }
    }

    pub fn stop(mut self) {
        self.bg_running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for GcWorker {
    fn drop(&mut self) {
        self.bg_running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mount::MountOptions;
    use disk_driver::memory::MemoryNand;
    use disk_driver::NandGeometry;

    fn geometry() -> NandGeometry {
        NandGeometry { data_bytes_per_chunk: 512, spare_bytes_per_chunk: 64, chunks_per_block: 8, start_block: 0, end_block: 15, n_reserved_blocks: 2 }
    }

    #[test]
    fn worker_starts_and_stops_cleanly() {
        let nand = MemoryNand::new(geometry());
        let dev = Device::format(nand, MountOptions::default()).unwrap();
        let shared = Arc::new(Mutex::new(dev));
        let worker = GcWorker::spawn(shared.clone(), Duration::from_millis(5));
        thread::sleep(Duration::from_millis(25));
        worker.stop();
        assert!(shared.lock().is_ok());
    }
}
