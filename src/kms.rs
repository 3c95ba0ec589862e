//! Kernel display-control collaborators
//!
//! The engine never talks to the kernel directly. Everything goes through
//! [`KmsDevice`], implemented by [`crate::DrmDevice`] for real card nodes and
//! by [`crate::sim::SimulatedKms`] for tests. Display-level side channels
//! (vsync worker, vblank-off delay, protected content state) are reached
//! through [`DisplayHooks`].

use crate::format::FourCc;
use crate::mode::ModeId;
use std::fmt;
use std::io;
use std::os::unix::io::{BorrowedFd, RawFd};
use std::sync::Arc;
use tracing::{debug, error};

/// Atomic commit flags (from drm_mode.h)
pub mod commit_flags {
    pub const PAGE_FLIP_EVENT: u32 = 0x01;
    pub const TEST_ONLY: u32 = 0x0100;
    pub const NONBLOCK: u32 = 0x0200;
    pub const ALLOW_MODESET: u32 = 0x0400;
}

/// `DRM_MODE_FB_MODIFIERS` flag for ADDFB2
pub const FB_FLAG_MODIFIERS: u32 = 1 << 1;

/// Arguments of an ADDFB2 call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramebufferRequest {
    pub width: u32,
    pub height: u32,
    pub format: FourCc,
    pub handles: [u32; 4],
    pub pitches: [u32; 4],
    pub offsets: [u32; 4],
    pub modifiers: [u64; 4],
    pub flags: u32,
}

/// One `(object, property, value)` triple of an atomic request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertyWrite {
    pub object_id: u32,
    pub property_id: u32,
    pub value: u64,
}

/// Kernel mode-setting device
///
/// Errors are returned as `io::Error` carrying the kernel errno.
pub trait KmsDevice: Send + Sync {
    /// Import a dma-buf fd as a GEM handle
    fn prime_fd_to_handle(&self, fd: RawFd) -> io::Result<u32>;

    fn gem_close(&self, handle: u32) -> io::Result<()>;

    fn add_framebuffer(&self, request: &FramebufferRequest) -> io::Result<u32>;

    fn remove_framebuffer(&self, fb_id: u32) -> io::Result<()>;

    fn create_property_blob(&self, data: &[u8]) -> io::Result<u32>;

    fn destroy_property_blob(&self, blob_id: u32) -> io::Result<()>;

    /// Submit a batch of property writes as one atomic request
    fn atomic_commit(&self, writes: &[PropertyWrite], flags: u32) -> io::Result<()>;

    /// When the fence behind `fence` signaled, in CLOCK_MONOTONIC ns.
    /// `None` while it is still active.
    fn fence_signal_time(&self, fence: BorrowedFd<'_>) -> io::Result<Option<i64>>;
}

/// Side channels of the display owning the pipeline
///
/// All methods have no-op defaults.
pub trait DisplayHooks: Send + Sync {
    /// Turn hardware vsync event delivery on or off
    fn set_vsync_enabled(&self, _enabled: bool) {}

    /// Delay (in frames) before the kernel turns vblank interrupts off.
    /// 0 keeps them on.
    fn set_vblank_off_delay(&self, _frames: u32) {}

    /// Whether the kernel is currently inside a protected execution window
    /// (e.g. a trusted UI session) during which commits are rejected with
    /// `EPERM`
    fn is_in_protected_execution_window(&self) -> bool {
        false
    }

    /// A deferred mode switch has physically taken effect
    fn on_mode_applied(&self, _mode: ModeId) {}
}

/// Hooks that do nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl DisplayHooks for NoopHooks {}

/// A kernel property blob, destroyed when dropped
pub struct PropertyBlob {
    device: Arc<dyn KmsDevice>,
    id: u32,
}

impl PropertyBlob {
    pub fn create(device: &Arc<dyn KmsDevice>, data: &[u8]) -> io::Result<Self> {
        let id = device.create_property_blob(data)?;
        debug!("Created property blob {} ({} bytes)", id, data.len());
        Ok(Self {
            device: Arc::clone(device),
            id,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }
}

impl fmt::Debug for PropertyBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PropertyBlob").field(&self.id).finish()
    }
}

impl Drop for PropertyBlob {
    fn drop(&mut self) {
        if let Err(e) = self.device.destroy_property_blob(self.id) {
            error!("Failed to destroy property blob {}: {}", self.id, e);
        } else {
            debug!("Destroyed property blob {}", self.id);
        }
    }
}
