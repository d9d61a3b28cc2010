//! Deferred deallocation of stem audio
//!
//! Stems reach the render thread as `basedrop::Shared<Stem>`. When the engine
//! drops the last reference (a voice is replaced or finishes), the pointer is
//! queued instead of freed, and the collector thread frees it later. Freeing
//! a multi-megabyte buffer on the audio thread would stall the callback.
//!
//! The collector is an explicit object owned by the host, not a global.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use basedrop::{Collector, Handle, Shared};

use crate::types::Stem;

/// Stem audio shared with the render thread
pub type SharedStem = Shared<Stem>;

/// How often the collector thread frees queued allocations
const COLLECT_INTERVAL: Duration = Duration::from_millis(100);

/// Owns the collector thread
pub struct StemCollector {
    handle: Handle,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl StemCollector {
    /// Spawn the collector thread
    pub fn spawn() -> std::io::Result<Self> {
        let (tx, rx) = mpsc::channel();
        let shutdown = Arc::new(AtomicBool::new(false));
        let stop = shutdown.clone();

        let thread = thread::Builder::new()
            .name("stem-gc".to_string())
            .spawn(move || {
                // Collector is !Sync, so it lives and dies on this thread
                let mut collector = Collector::new();
                if tx.send(collector.handle()).is_err() {
                    return;
                }
                log::debug!("Stem collector started");

                while !stop.load(Ordering::Acquire) {
                    collector.collect();
                    thread::park_timeout(COLLECT_INTERVAL);
                }
                collector.collect();
                log::debug!("Stem collector stopped");
            })?;

        let handle = rx.recv().map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::Other, "stem collector exited early")
        })?;

        Ok(Self {
            handle,
            shutdown,
            thread: Some(thread),
        })
    }

    /// Handle for creating further `Shared` allocations
    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    /// Wrap a decoded stem for use by the engine
    pub fn share(&self, stem: Stem) -> SharedStem {
        Shared::new(&self.handle, stem)
    }
}

impl Drop for StemCollector {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            thread.thread().unpark();
            let _ = thread.join();
        }
    }
}
