//! In-process stand-in for a DRM device
//!
//! `SimulatedKms` keeps the kernel objects it hands out in memory, records
//! every atomic request and lets callers inject errnos. It is what the unit
//! tests and the `test_modeset` binary run against. [`simulated_display`]
//! describes the CRTC, connector and planes of a matching panel.
//!
//! Once [`SimulatedKms::enable_out_fences`] names the OUT_FENCE_PTR property,
//! every applied commit writing it gets a memfd as its retire fence. Fences
//! are told apart by inode so duplicated fds resolve to the same fence. They
//! stay active until [`SimulatedKms::signal_fences`].

use crate::kms::{commit_flags, DisplayHooks, FramebufferRequest, KmsDevice, PropertyWrite};
use crate::mode::{DisplayMode, ModeId};
use crate::pipeline::DisplayLayout;
use crate::property::{PropertyInfo, PropertyTable};
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::os::unix::io::{AsRawFd, BorrowedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::trace;

/// First id handed out for framebuffers
const FB_ID_BASE: u32 = 101;
const BLOB_ID_BASE: u32 = 1000;

pub const SIM_CRTC_ID: u32 = 40;
pub const SIM_CONNECTOR_ID: u32 = 50;
pub const SIM_FIRST_PLANE_ID: u32 = 60;

/// Refresh-rate switch duration the simulated connector reports, in frames
pub const SIM_RR_SWITCH_DURATION: u64 = 2;

/// Property table and layout of a simulated panel with `plane_count` planes
pub fn simulated_display(plane_count: u32, modes: Vec<DisplayMode>) -> (PropertyTable, DisplayLayout) {
    let mut next_id = 0;
    let mut id = || {
        next_id += 1;
        next_id
    };

    let mut table = PropertyTable::new()
        .with(SIM_CRTC_ID, id(), PropertyInfo::new("ACTIVE"))
        .with(SIM_CRTC_ID, id(), PropertyInfo::new("MODE_ID"))
        .with(SIM_CONNECTOR_ID, id(), PropertyInfo::new("CRTC_ID"))
        .with(
            SIM_CONNECTOR_ID,
            id(),
            PropertyInfo::new("rr_switch_duration")
                .with_value(SIM_RR_SWITCH_DURATION)
                .immutable(),
        );

    let plane_ids: Vec<u32> = (0..plane_count).map(|i| SIM_FIRST_PLANE_ID + i).collect();
    for &plane in &plane_ids {
        for name in [
            "CRTC_ID", "FB_ID", "CRTC_X", "CRTC_Y", "CRTC_W", "CRTC_H", "SRC_X", "SRC_Y", "SRC_W",
            "SRC_H", "rotation", "IN_FENCE_FD", "colormap",
        ] {
            table = table.with(plane, id(), PropertyInfo::new(name));
        }
        table = table
            .with(
                plane,
                id(),
                PropertyInfo::new("pixel blend mode")
                    .with_enum("None", 0)
                    .with_enum("Pre-multiplied", 1)
                    .with_enum("Coverage", 2),
            )
            .with(
                plane,
                id(),
                PropertyInfo::new("zpos").with_range(0, u64::from(plane_count.max(1) - 1)),
            )
            .with(plane, id(), PropertyInfo::new("alpha").with_range(0, 0xffff));
    }

    table = table.with(SIM_CRTC_ID, id(), PropertyInfo::new("OUT_FENCE_PTR"));

    let layout = DisplayLayout {
        crtc_id: SIM_CRTC_ID,
        connector_id: SIM_CONNECTOR_ID,
        plane_ids,
        modes,
    };
    (table, layout)
}

/// One atomic request seen by the device
#[derive(Debug, Clone)]
pub struct CommitRecord {
    pub writes: Vec<PropertyWrite>,
    pub flags: u32,
}

impl CommitRecord {
    /// Value written to `(object, property)`, if any
    pub fn value_of(&self, object_id: u32, property_id: u32) -> Option<u64> {
        self.writes
            .iter()
            .find(|w| w.object_id == object_id && w.property_id == property_id)
            .map(|w| w.value)
    }
}

#[derive(Default)]
struct SimState {
    next_fb: u32,
    next_blob: u32,
    next_handle: u32,
    live_fbs: HashMap<u32, FramebufferRequest>,
    live_blobs: HashMap<u32, Vec<u8>>,
    open_handles: HashSet<u32>,
    fb_removals: HashMap<u32, u32>,
    blob_destroys: HashMap<u32, u32>,
    commits: Vec<CommitRecord>,
    add_fb_calls: usize,
    blob_creates: usize,
    add_fb_errors: VecDeque<i32>,
    blob_errors: VecDeque<i32>,
    commit_errors: VecDeque<i32>,
    out_fence_prop: Option<u32>,
    /// Retire fences handed out, by (device, inode), and when they signaled
    fences: HashMap<(u64, u64), Option<i64>>,
}

/// Simulated [`KmsDevice`]
pub struct SimulatedKms {
    state: Mutex<SimState>,
    removed: Condvar,
}

impl SimulatedKms {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SimState {
                next_fb: FB_ID_BASE,
                next_blob: BLOB_ID_BASE,
                next_handle: 1,
                ..Default::default()
            }),
            removed: Condvar::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fail the next ADDFB2 with `errno`
    pub fn fail_next_add_framebuffer(&self, errno: i32) {
        self.lock().add_fb_errors.push_back(errno);
    }

    /// Fail the next CREATEPROPBLOB with `errno`
    pub fn fail_next_blob(&self, errno: i32) {
        self.lock().blob_errors.push_back(errno);
    }

    /// Fail the next atomic commit with `errno`
    pub fn fail_next_commit(&self, errno: i32) {
        self.lock().commit_errors.push_back(errno);
    }

    /// Return a retire fence through `property_id` on every applied commit
    pub fn enable_out_fences(&self, property_id: u32) {
        self.lock().out_fence_prop = Some(property_id);
    }

    /// Signal every retire fence handed out so far at `timestamp`
    pub fn signal_fences(&self, timestamp: i64) {
        for signal_time in self.lock().fences.values_mut() {
            signal_time.get_or_insert(timestamp);
        }
    }

    pub fn out_fences_created(&self) -> usize {
        self.lock().fences.len()
    }

    pub fn add_framebuffer_calls(&self) -> usize {
        self.lock().add_fb_calls
    }

    pub fn blob_creations(&self) -> usize {
        self.lock().blob_creates
    }

    pub fn live_framebuffers(&self) -> usize {
        self.lock().live_fbs.len()
    }

    pub fn framebuffer(&self, fb_id: u32) -> Option<FramebufferRequest> {
        self.lock().live_fbs.get(&fb_id).cloned()
    }

    pub fn live_blobs(&self) -> Vec<u32> {
        let mut blobs: Vec<u32> = self.lock().live_blobs.keys().copied().collect();
        blobs.sort_unstable();
        blobs
    }

    pub fn blob_data(&self, blob_id: u32) -> Option<Vec<u8>> {
        self.lock().live_blobs.get(&blob_id).cloned()
    }

    pub fn open_gem_handles(&self) -> usize {
        self.lock().open_handles.len()
    }

    /// How many times RMFB was issued for `fb_id`
    pub fn removal_count(&self, fb_id: u32) -> u32 {
        self.lock().fb_removals.get(&fb_id).copied().unwrap_or(0)
    }

    pub fn total_removals(&self) -> u32 {
        self.lock().fb_removals.values().sum()
    }

    pub fn blob_destroy_count(&self, blob_id: u32) -> u32 {
        self.lock().blob_destroys.get(&blob_id).copied().unwrap_or(0)
    }

    pub fn commits(&self) -> Vec<CommitRecord> {
        self.lock().commits.clone()
    }

    pub fn last_commit(&self) -> Option<CommitRecord> {
        self.lock().commits.last().cloned()
    }

    /// Block until at least `count` framebuffers have been removed in total
    pub fn wait_for_removals(&self, count: u32, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if state.fb_removals.values().sum::<u32>() >= count {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = match self.removed.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(e) => e.into_inner().0,
            };
        }
    }
}

impl KmsDevice for SimulatedKms {
    fn prime_fd_to_handle(&self, fd: RawFd) -> io::Result<u32> {
        if fd < 0 {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        let mut state = self.lock();
        let handle = state.next_handle;
        state.next_handle += 1;
        state.open_handles.insert(handle);
        Ok(handle)
    }

    fn gem_close(&self, handle: u32) -> io::Result<()> {
        if self.lock().open_handles.remove(&handle) {
            Ok(())
        } else {
            Err(io::Error::from_raw_os_error(libc::EINVAL))
        }
    }

    fn add_framebuffer(&self, request: &FramebufferRequest) -> io::Result<u32> {
        let mut state = self.lock();
        state.add_fb_calls += 1;
        if let Some(errno) = state.add_fb_errors.pop_front() {
            return Err(io::Error::from_raw_os_error(errno));
        }
        let fb_id = state.next_fb;
        state.next_fb += 1;
        state.live_fbs.insert(fb_id, request.clone());
        trace!("sim: ADDFB2 -> {}", fb_id);
        Ok(fb_id)
    }

    fn remove_framebuffer(&self, fb_id: u32) -> io::Result<()> {
        let mut state = self.lock();
        *state.fb_removals.entry(fb_id).or_insert(0) += 1;
        let existed = state.live_fbs.remove(&fb_id).is_some();
        drop(state);
        self.removed.notify_all();
        if existed {
            Ok(())
        } else {
            Err(io::Error::from_raw_os_error(libc::ENOENT))
        }
    }

    fn create_property_blob(&self, data: &[u8]) -> io::Result<u32> {
        let mut state = self.lock();
        state.blob_creates += 1;
        if let Some(errno) = state.blob_errors.pop_front() {
            return Err(io::Error::from_raw_os_error(errno));
        }
        let blob_id = state.next_blob;
        state.next_blob += 1;
        state.live_blobs.insert(blob_id, data.to_vec());
        Ok(blob_id)
    }

    fn destroy_property_blob(&self, blob_id: u32) -> io::Result<()> {
        let mut state = self.lock();
        *state.blob_destroys.entry(blob_id).or_insert(0) += 1;
        if state.live_blobs.remove(&blob_id).is_some() {
            Ok(())
        } else {
            Err(io::Error::from_raw_os_error(libc::ENOENT))
        }
    }

    fn atomic_commit(&self, writes: &[PropertyWrite], flags: u32) -> io::Result<()> {
        let mut state = self.lock();
        state.commits.push(CommitRecord {
            writes: writes.to_vec(),
            flags,
        });
        if let Some(errno) = state.commit_errors.pop_front() {
            return Err(io::Error::from_raw_os_error(errno));
        }
        if flags & commit_flags::TEST_ONLY != 0 {
            return Ok(());
        }

        let out_fence = state
            .out_fence_prop
            .and_then(|prop| writes.iter().find(|w| w.property_id == prop));
        if let Some(write) = out_fence {
            let name = b"sim-retire-fence\0";
            let fd = unsafe { libc::memfd_create(name.as_ptr().cast(), libc::MFD_CLOEXEC) };
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            let inode = match inode_of(fd) {
                Ok(inode) => inode,
                Err(e) => {
                    unsafe { libc::close(fd) };
                    return Err(e);
                }
            };
            // SAFETY: OUT_FENCE_PTR carries the address of the caller's
            // AtomicI32 slot, alive for the whole commit
            let slot = unsafe { &*(write.value as usize as *const AtomicI32) };
            slot.store(fd, Ordering::SeqCst);
            state.fences.insert(inode, None);
            trace!("sim: retire fence {} (inode {:?})", fd, inode);
        }
        Ok(())
    }

    fn fence_signal_time(&self, fence: BorrowedFd<'_>) -> io::Result<Option<i64>> {
        let inode = inode_of(fence.as_raw_fd())?;
        self.lock()
            .fences
            .get(&inode)
            .copied()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))
    }
}

fn inode_of(fd: RawFd) -> io::Result<(u64, u64)> {
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut stat) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok((stat.st_dev as u64, stat.st_ino as u64))
}

#[derive(Debug, Default)]
struct HooksLog {
    vsync_enabled: Vec<bool>,
    vblank_off_delays: Vec<u32>,
    applied: Vec<ModeId>,
}

/// [`DisplayHooks`] that record every call
#[derive(Debug, Default)]
pub struct RecordingHooks {
    log: Mutex<HooksLog>,
    protected: AtomicBool,
}

impl RecordingHooks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, HooksLog> {
        self.log.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Pretend the kernel entered or left a protected execution window
    pub fn set_protected(&self, protected: bool) {
        self.protected.store(protected, Ordering::SeqCst);
    }

    pub fn vsync_enabled_calls(&self) -> Vec<bool> {
        self.lock().vsync_enabled.clone()
    }

    pub fn vblank_off_delays(&self) -> Vec<u32> {
        self.lock().vblank_off_delays.clone()
    }

    pub fn applied_modes(&self) -> Vec<ModeId> {
        self.lock().applied.clone()
    }
}

impl DisplayHooks for RecordingHooks {
    fn set_vsync_enabled(&self, enabled: bool) {
        self.lock().vsync_enabled.push(enabled);
    }

    fn set_vblank_off_delay(&self, frames: u32) {
        self.lock().vblank_off_delays.push(frames);
    }

    fn is_in_protected_execution_window(&self) -> bool {
        self.protected.load(Ordering::SeqCst)
    }

    fn on_mode_applied(&self, mode: ModeId) {
        self.lock().applied.push(mode);
    }
}
