// Background syncer
//
// Periodically runs the work queue and, when the dependency limit was
// exceeded, pushes dirty buffers so the graph can shrink.

use crate::softdep::{BufferFlusher, FsBackend, Softdep};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

pub struct Syncer {
    monitor_thread: Option<JoinHandle<()>>,
    shutdown: Arc<Mutex<bool>>,
}

impl Syncer {
    pub fn spawn<B>(softdep: Arc<Softdep>, backend: Arc<B>, interval: Duration) -> Self
    where
        B: FsBackend + BufferFlusher + 'static,
    {
        let shutdown = Arc::new(Mutex::new(false));
        let monitor_shutdown = shutdown.clone();
        let monitor_thread = std::thread::spawn(move || {
            Self::monitor_loop(softdep, backend, monitor_shutdown, interval);
        });
        Self {
            monitor_thread: Some(monitor_thread),
            shutdown,
        }
    }

    fn monitor_loop<B>(softdep: Arc<Softdep>, backend: Arc<B>, shutdown: Arc<Mutex<bool>>, interval: Duration)
    where
        B: FsBackend + BufferFlusher,
    {
        loop {
            {
                let shutdown = shutdown.lock().unwrap();
                if *shutdown {
                    break;
                }
            }
            if softdep.needs_fsck() {
                log::warn!("softdep: syncer stopping, filesystem needs fsck");
                break;
            }

            if softdep.cleanup_requested() {
                log::debug!("softdep: dependency limit exceeded, flushing");
                if let Err(e) = backend.flush_dirty(&softdep) {
                    log::warn!("Error flushing dirty buffers: {}", e);
                }
            }
            if let Err(e) = softdep.process_worklist(backend.as_ref()) {
                log::warn!("Error processing worklist: {}", e);
            }

            std::thread::sleep(interval);
        }
    }

    pub fn shutdown(&mut self) {
        {
            let mut shutdown = self.shutdown.lock().unwrap();
            *shutdown = true;
        }
        if let Some(thread) = self.monitor_thread.take() {
            thread.join().ok();
        }
    }
}

impl Drop for Syncer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
