//! Background framebuffer destruction
//!
//! RMFB can block while the kernel drops its last references, so cached
//! framebuffers are destroyed on a dedicated thread instead of the frame
//! path. The thread sleeps on the cache's condition variable, takes the whole
//! reclaim list under the cache mutex and drops it after unlocking.

use crate::cache::CacheShared;
use crate::framebuffer::CachedFramebuffer;
use crate::Result;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info};

const THREAD_NAME: &str = "fb-reclaimer";

pub struct AsyncReclaimer {
    shared: Arc<CacheShared>,
    handle: Option<JoinHandle<()>>,
}

impl AsyncReclaimer {
    pub(crate) fn spawn(shared: Arc<CacheShared>) -> Result<Self> {
        let worker = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || run(&worker))?;
        info!("Started {} thread", THREAD_NAME);
        Ok(Self {
            shared,
            handle: Some(handle),
        })
    }

    /// Stop the thread and wait for it. Framebuffers still queued stay in the
    /// cache state and are destroyed with it.
    pub fn shutdown(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.shared.lock().shutdown = true;
        self.shared.wake.notify_all();
        if handle.join().is_err() {
            error!("{} thread panicked", THREAD_NAME);
        }
        debug!("Stopped {} thread", THREAD_NAME);
    }
}

impl Drop for AsyncReclaimer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(shared: &CacheShared) {
    loop {
        let batch: Vec<CachedFramebuffer> = {
            let mut state = shared.lock();
            while state.reclaim.is_empty() && !state.shutdown {
                state = match shared.wake.wait(state) {
                    Ok(guard) => guard,
                    Err(e) => e.into_inner(),
                };
            }
            if state.shutdown {
                return;
            }
            state.reclaim.drain(..).collect()
        };

        let count = batch.len();
        drop(batch);
        debug!("Reclaimed {} framebuffers", count);
    }
}
