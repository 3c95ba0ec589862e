//! Atomic transactions
//!
//! An [`AtomicTransaction`] collects property writes for one atomic request
//! and is committed at most once. Values are compared against what the last
//! successful commit wrote so unchanged properties are not resent.
//!
//! State shared between transactions (committed values, the debug re-test
//! rate limiter, the protected-window query) lives in [`AtomicContext`].

use crate::config::DebugConfig;
use crate::kms::{commit_flags, DisplayHooks, KmsDevice, PropertyBlob, PropertyWrite};
use crate::property::BoundProperty;
use crate::{Error, Result};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs;
use std::os::unix::io::{FromRawFd, OwnedFd};
use std::path::Path;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};

/// Value written to the debug node to turn verbose messages back off
const DRM_DEBUG_DISABLE: u32 = 0;

/// Outcome of a commit the kernel did not reject
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitStatus {
    /// The request was applied
    Applied,
    /// A TEST_ONLY request passed validation
    Tested,
    /// Rejected because the kernel is inside a protected execution window.
    /// Nothing was applied; the caller retries on its next commit.
    Deferred,
}

/// State shared by every transaction of one display
pub struct AtomicContext {
    device: Arc<dyn KmsDevice>,
    hooks: Arc<dyn DisplayHooks>,
    committed: Mutex<HashMap<(u32, u32), u64>>,
    debug: DebugConfig,
    last_debug_retest: Mutex<Option<Instant>>,
}

impl AtomicContext {
    pub fn new(device: Arc<dyn KmsDevice>, hooks: Arc<dyn DisplayHooks>, debug: DebugConfig) -> Self {
        Self {
            device,
            hooks,
            committed: Mutex::new(HashMap::new()),
            debug,
            last_debug_retest: Mutex::new(None),
        }
    }

    pub fn device(&self) -> &Arc<dyn KmsDevice> {
        &self.device
    }

    pub fn hooks(&self) -> &Arc<dyn DisplayHooks> {
        &self.hooks
    }

    fn committed(&self) -> MutexGuard<'_, HashMap<(u32, u32), u64>> {
        self.committed.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Last value committed to `(object, property)`
    pub fn committed_value(&self, object_id: u32, property_id: u32) -> Option<u64> {
        self.committed().get(&(object_id, property_id)).copied()
    }

    /// Forget every committed value so the next transaction writes everything
    /// again. Needed once kernel objects referenced by the current state may
    /// have been destroyed behind our back.
    pub fn forget_committed(&self) {
        self.committed().clear();
    }

    fn record_committed(&self, writes: &[PropertyWrite]) {
        let mut committed = self.committed();
        for write in writes {
            committed.insert((write.object_id, write.property_id), write.value);
        }
    }

    /// Enable kernel atomic debug messages and replay a rejected request as
    /// TEST_ONLY so the kernel logs why. Runs at most once per dump interval.
    fn retest_with_debug(&self, writes: &[PropertyWrite], errno: i32) {
        let Some(node) = self.debug.drm_debug_node.as_deref() else {
            return;
        };

        let mut last = self.last_debug_retest.lock().unwrap_or_else(|e| e.into_inner());
        let interval = Duration::from_millis(self.debug.atomic_dump_interval_ms);
        if last.is_some_and(|at| at.elapsed() < interval) {
            return;
        }

        if let Err(e) = write_debug_node(node, self.debug.drm_debug_enable_value) {
            debug!("Cannot enable DRM debug messages via {:?}: {}", node, e);
            return;
        }

        error!("Commit error, enabled atomic debug messages and testing again");
        let retest = self.device.atomic_commit(writes, commit_flags::TEST_ONLY);
        let retest_errno = match &retest {
            Ok(()) => 0,
            Err(e) => e.raw_os_error().unwrap_or(libc::EIO),
        };
        if retest_errno != errno {
            error!("Re-test commit error ({}) differs from {}", retest_errno, errno);
        }

        if let Err(e) = write_debug_node(node, DRM_DEBUG_DISABLE) {
            warn!("Failed to disable DRM debug messages via {:?}: {}", node, e);
        }
        *last = Some(Instant::now());
    }
}

fn write_debug_node(node: &Path, value: u32) -> std::io::Result<()> {
    fs::write(node, value.to_string())
}

/// One named write, kept for the error dump
#[derive(Debug, Clone, Copy)]
struct NamedWrite {
    write: PropertyWrite,
    name: &'static str,
}

/// Single-use builder for one atomic request
pub struct AtomicTransaction {
    ctx: Arc<AtomicContext>,
    writes: Vec<NamedWrite>,
    old_blobs: Vec<PropertyBlob>,
    ack: Option<Box<dyn FnOnce() + Send>>,
    /// Where the kernel stores the retire fence fd, -1 until it does
    out_fence_slot: Option<Box<AtomicI32>>,
    retire_fence: Option<OwnedFd>,
    committed: bool,
    error: Option<i32>,
}

impl AtomicTransaction {
    pub fn new(ctx: Arc<AtomicContext>) -> Self {
        Self {
            ctx,
            writes: Vec::new(),
            old_blobs: Vec::new(),
            ack: None,
            out_fence_slot: None,
            retire_fence: None,
            committed: false,
            error: None,
        }
    }

    /// Queue a property write
    ///
    /// An unsupported property fails the transaction unless `optional`, in
    /// which case it is skipped. A value equal to the last committed one is
    /// skipped too.
    pub fn add_property(&mut self, prop: &BoundProperty, value: u64, optional: bool) -> Result<()> {
        let Some(id) = self.check_supported(prop, optional)? else {
            return Ok(());
        };
        if self.ctx.committed_value(prop.object_id, id) == Some(value) {
            trace!("{}({}) unchanged at {}", prop.name, prop.object_id, value);
            return Ok(());
        }
        self.push(prop, id, value);
        Ok(())
    }

    /// Like [`add_property`](Self::add_property) without change suppression,
    /// for values that only mean something for one request (fence fds)
    pub fn add_property_always(&mut self, prop: &BoundProperty, value: u64, optional: bool) -> Result<()> {
        if let Some(id) = self.check_supported(prop, optional)? {
            self.push(prop, id, value);
        }
        Ok(())
    }

    fn check_supported(&mut self, prop: &BoundProperty, optional: bool) -> Result<Option<u32>> {
        match prop.id {
            Some(id) => Ok(Some(id.0)),
            None if optional => Ok(None),
            None => {
                error!("{} property is not available for object {}", prop.name, prop.object_id);
                self.error = Some(libc::EINVAL);
                Err(Error::UnsupportedProperty {
                    object_id: prop.object_id,
                    name: prop.name.to_string(),
                })
            }
        }
    }

    fn push(&mut self, prop: &BoundProperty, property_id: u32, value: u64) {
        let write = PropertyWrite {
            object_id: prop.object_id,
            property_id,
            value,
        };
        // A second write to the same property replaces the first
        match self
            .writes
            .iter_mut()
            .find(|w| w.write.object_id == prop.object_id && w.write.property_id == property_id)
        {
            Some(existing) => existing.write.value = value,
            None => self.writes.push(NamedWrite {
                write,
                name: prop.name,
            }),
        }
    }

    /// Ask for a retire fence through `prop`, a CRTC's OUT_FENCE_PTR. Skipped
    /// when the CRTC has no such property.
    pub fn request_out_fence(&mut self, prop: &BoundProperty) -> Result<()> {
        if !prop.is_supported() {
            return Ok(());
        }
        let slot = self
            .out_fence_slot
            .get_or_insert_with(|| Box::new(AtomicI32::new(-1)));
        let ptr = &**slot as *const AtomicI32 as usize as u64;
        self.add_property_always(prop, ptr, true)
    }

    /// Retire fence returned by the last successful commit
    pub fn take_out_fence(&mut self) -> Option<OwnedFd> {
        self.retire_fence.take()
    }

    fn collect_out_fence(&mut self) {
        let Some(slot) = &self.out_fence_slot else {
            return;
        };
        let fd = slot.swap(-1, Ordering::SeqCst);
        if fd >= 0 {
            trace!("Retire fence fd {}", fd);
            // SAFETY: the kernel installed `fd` for this request and nothing
            // else owns it
            self.retire_fence = Some(unsafe { OwnedFd::from_raw_fd(fd) });
        }
    }

    /// Keep `blob` alive until this transaction is dropped
    pub fn retire_blob(&mut self, blob: PropertyBlob) {
        self.old_blobs.push(blob);
    }

    /// Run `ack` after the next successful real commit
    pub fn set_ack_callback(&mut self, ack: impl FnOnce() + Send + 'static) {
        self.ack = Some(Box::new(ack));
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Value queued for `(object, property)`
    pub fn pending_value(&self, object_id: u32, property_id: u32) -> Option<u64> {
        self.writes
            .iter()
            .find(|w| w.write.object_id == object_id && w.write.property_id == property_id)
            .map(|w| w.write.value)
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    /// Submit the queued writes
    pub fn commit(&mut self, flags: u32) -> Result<CommitStatus> {
        if self.committed {
            return Err(Error::Drm("atomic transaction committed twice".into()));
        }
        self.committed = true;

        let writes: Vec<PropertyWrite> = self.writes.iter().map(|w| w.write).collect();
        let test_only = flags & commit_flags::TEST_ONLY != 0;
        debug!("Atomic commit: {} writes, flags {:#x}", writes.len(), flags);

        match self.ctx.device.atomic_commit(&writes, flags) {
            Ok(()) if test_only => Ok(CommitStatus::Tested),
            Ok(()) => {
                self.ctx.record_committed(&writes);
                self.collect_out_fence();
                if let Some(ack) = self.ack.take() {
                    ack();
                }
                Ok(CommitStatus::Applied)
            }
            Err(e) => {
                let errno = e.raw_os_error().unwrap_or(libc::EIO);
                if errno == libc::EPERM && self.ctx.hooks.is_in_protected_execution_window() {
                    debug!("Skipping commit error handling, kernel is in a protected window");
                    return Ok(CommitStatus::Deferred);
                }
                if errno == libc::EINVAL {
                    self.ctx.retest_with_debug(&writes, errno);
                }
                error!("Commit error: {}", e);
                self.error = Some(errno);
                Err(Error::from_commit(&e))
            }
        }
    }

    fn dump(&self) -> String {
        let mut out = String::from("atomic commit error\n");
        for (i, w) in self.writes.iter().enumerate() {
            let _ = writeln!(
                out,
                "property[{}] object_id: {}, property_id: {}, name: {}, value: {}",
                i, w.write.object_id, w.write.property_id, w.name, w.write.value
            );
        }
        out
    }
}

impl Drop for AtomicTransaction {
    fn drop(&mut self) {
        if self.error.is_some() {
            error!("{}", self.dump());
        }
        if !self.old_blobs.is_empty() {
            debug!("Destroying {} retired blobs", self.old_blobs.len());
        }
        // `old_blobs` drops after this, destroying each blob
    }
}
