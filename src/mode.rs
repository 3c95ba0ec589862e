//! Display modes and mode state
//!
//! [`ModeState`] pairs a mode with the kernel property blob encoding it. Two
//! instances exist per display: the active state (what the hardware runs)
//! and the desired state (what the next frame should switch to).

use crate::atomic::AtomicTransaction;
use crate::ffi::{
    DrmModeModeinfo, DRM_MODE_FLAG_TE_FREQ_X2, DRM_MODE_FLAG_TE_FREQ_X4, DRM_MODE_TYPE_VRR,
};
use crate::kms::PropertyBlob;
use std::fmt;
use std::os::raw::c_char;

const NSEC_PER_SEC: i64 = 1_000_000_000;

/// Connector-assigned mode identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModeId(pub u32);

impl fmt::Display for ModeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One display timing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayMode {
    pub id: ModeId,
    /// Pixel clock in kHz
    pub clock: u32,
    pub hdisplay: u16,
    pub hsync_start: u16,
    pub hsync_end: u16,
    pub htotal: u16,
    pub hskew: u16,
    pub vdisplay: u16,
    pub vsync_start: u16,
    pub vsync_end: u16,
    pub vtotal: u16,
    pub vscan: u16,
    pub vrefresh: u32,
    pub flags: u32,
    pub mode_type: u32,
    pub name: String,
}

impl DisplayMode {
    /// Build a mode with generic blanking intervals around the active area
    pub fn new(id: u32, width: u16, height: u16, refresh: u32) -> Self {
        let hsync_start = width.saturating_add(48);
        let hsync_end = hsync_start.saturating_add(32);
        let htotal = hsync_end.saturating_add(80);
        let vsync_start = height.saturating_add(3);
        let vsync_end = vsync_start.saturating_add(6);
        let vtotal = vsync_end.saturating_add(21);
        let clock = (u64::from(htotal) * u64::from(vtotal) * u64::from(refresh) / 1000) as u32;

        Self {
            id: ModeId(id),
            clock,
            hdisplay: width,
            hsync_start,
            hsync_end,
            htotal,
            hskew: 0,
            vdisplay: height,
            vsync_start,
            vsync_end,
            vtotal,
            vscan: 0,
            vrefresh: refresh,
            flags: 0,
            mode_type: 0,
            name: format!("{}x{}", width, height),
        }
    }

    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_type(mut self, mode_type: u32) -> Self {
        self.mode_type = mode_type;
        self
    }

    pub fn width(&self) -> u16 {
        self.hdisplay
    }

    pub fn height(&self) -> u16 {
        self.vdisplay
    }

    pub fn is_vrr(&self) -> bool {
        self.mode_type & DRM_MODE_TYPE_VRR != 0
    }

    /// Refresh period in nanoseconds
    pub fn vsync_period_ns(&self) -> i64 {
        if self.vrefresh == 0 {
            return 0;
        }
        NSEC_PER_SEC / i64::from(self.vrefresh)
    }

    /// Period of the tearing-effect signal vsync events are derived from
    pub fn te_period_ns(&self) -> i64 {
        let multiplier = if self.flags & DRM_MODE_FLAG_TE_FREQ_X4 != 0 {
            4
        } else if self.flags & DRM_MODE_FLAG_TE_FREQ_X2 != 0 {
            2
        } else {
            1
        };
        self.vsync_period_ns() / multiplier
    }

    /// Everything besides the refresh rate that a seamless switch must keep
    fn timing_class(&self) -> (bool, u32) {
        (
            self.is_vrr(),
            self.flags & (DRM_MODE_FLAG_TE_FREQ_X2 | DRM_MODE_FLAG_TE_FREQ_X4),
        )
    }

    /// Whether switching from `self` to `other` changes resolution or timing
    /// class rather than only the refresh rate
    pub fn is_full_mode_switch(&self, other: &DisplayMode) -> bool {
        self.hdisplay != other.hdisplay
            || self.vdisplay != other.vdisplay
            || self.timing_class() != other.timing_class()
    }

    pub fn to_modeinfo(&self) -> DrmModeModeinfo {
        let mut info = DrmModeModeinfo {
            clock: self.clock,
            hdisplay: self.hdisplay,
            hsync_start: self.hsync_start,
            hsync_end: self.hsync_end,
            htotal: self.htotal,
            hskew: self.hskew,
            vdisplay: self.vdisplay,
            vsync_start: self.vsync_start,
            vsync_end: self.vsync_end,
            vtotal: self.vtotal,
            vscan: self.vscan,
            vrefresh: self.vrefresh,
            flags: self.flags,
            type_: self.mode_type,
            ..Default::default()
        };
        // Keep the trailing NUL
        let max = info.name.len() - 1;
        for (dst, src) in info.name.iter_mut().zip(self.name.bytes().take(max)) {
            *dst = src as c_char;
        }
        info
    }

    /// Payload of a MODE_ID property blob
    pub fn to_blob_bytes(&self) -> Vec<u8> {
        self.to_modeinfo().to_bytes()
    }
}

impl fmt::Display for DisplayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}({}x{}@{})",
            self.id, self.hdisplay, self.vdisplay, self.vrefresh
        )
    }
}

/// A mode together with the blob the kernel knows it by
#[derive(Debug, Default)]
pub struct ModeState {
    mode: Option<DisplayMode>,
    blob: Option<PropertyBlob>,
    old_blob: Option<PropertyBlob>,
    pending: bool,
    seamless: bool,
}

impl ModeState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(&self) -> Option<&DisplayMode> {
        self.mode.as_ref()
    }

    pub fn mode_id(&self) -> Option<ModeId> {
        self.mode.as_ref().map(|m| m.id)
    }

    pub fn blob_id(&self) -> Option<u32> {
        self.blob.as_ref().map(PropertyBlob::id)
    }

    /// A blob is installed that the hardware has not been given yet
    pub fn needs_mode_set(&self) -> bool {
        self.pending && self.blob.is_some()
    }

    pub fn is_seamless(&self) -> bool {
        self.seamless
    }

    /// Whether moving to `mode` is a full switch; true when no mode is set
    pub fn is_full_mode_switch(&self, mode: &DisplayMode) -> bool {
        self.mode.as_ref().map_or(true, |m| m.is_full_mode_switch(mode))
    }

    /// Install `mode` with its `blob`
    ///
    /// The blob being replaced becomes the old blob; the previous old blob is
    /// handed to `txn` and destroyed once that transaction is gone.
    pub fn set_mode(
        &mut self,
        mode: DisplayMode,
        blob: PropertyBlob,
        seamless: bool,
        txn: &mut AtomicTransaction,
    ) {
        if let Some(old) = self.old_blob.take() {
            txn.retire_blob(old);
        }
        self.old_blob = self.blob.replace(blob);
        self.mode = Some(mode);
        self.seamless = seamless;
        self.pending = true;
    }

    /// Move this state's mode and blob into `to` after a commit carried it.
    /// The mode itself is kept so later requests compare against it.
    pub fn apply(&mut self, to: &mut ModeState, txn: &mut AtomicTransaction) {
        if let (Some(mode), Some(blob)) = (self.mode.clone(), self.blob.take()) {
            to.set_mode(mode, blob, self.seamless, txn);
        }
        if let Some(old) = self.old_blob.take() {
            txn.retire_blob(old);
        }
        self.pending = false;
    }

    pub fn clear_pending(&mut self) {
        self.pending = false;
    }

    /// Make the installed mode count as not yet applied
    pub fn force_mode_set(&mut self) {
        self.pending = true;
    }

    /// Drop mode and blobs; the blobs go to `txn`
    pub fn reset(&mut self, txn: &mut AtomicTransaction) {
        for blob in [self.blob.take(), self.old_blob.take()].into_iter().flatten() {
            txn.retire_blob(blob);
        }
        self.mode = None;
        self.pending = false;
        self.seamless = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atomic::AtomicContext;
    use crate::config::DebugConfig;
    use crate::ffi::MODEINFO_SIZE;
    use crate::kms::{KmsDevice, NoopHooks};
    use crate::sim::SimulatedKms;
    use std::sync::Arc;

    fn blob(device: &Arc<dyn KmsDevice>, mode: &DisplayMode) -> PropertyBlob {
        PropertyBlob::create(device, &mode.to_blob_bytes()).unwrap()
    }

    fn txn(sim: &Arc<SimulatedKms>) -> AtomicTransaction {
        let ctx = AtomicContext::new(sim.clone(), Arc::new(NoopHooks), DebugConfig::default());
        AtomicTransaction::new(Arc::new(ctx))
    }

    #[test]
    fn test_full_mode_switch_classification() {
        let fhd60 = DisplayMode::new(1, 1920, 1080, 60);
        let fhd120 = DisplayMode::new(2, 1920, 1080, 120);
        let qhd120 = DisplayMode::new(3, 2960, 1440, 120);
        let fhd120_te = DisplayMode::new(4, 1920, 1080, 120).with_flags(DRM_MODE_FLAG_TE_FREQ_X2);
        let fhd60_vrr = DisplayMode::new(5, 1920, 1080, 60).with_type(DRM_MODE_TYPE_VRR);

        assert!(!fhd60.is_full_mode_switch(&fhd120));
        assert!(fhd60.is_full_mode_switch(&qhd120));
        assert!(fhd120.is_full_mode_switch(&fhd120_te));
        assert!(fhd60.is_full_mode_switch(&fhd60_vrr));
        assert!(ModeState::new().is_full_mode_switch(&fhd60));
    }

    #[test]
    fn test_periods() {
        let mode = DisplayMode::new(1, 2960, 1440, 120);
        assert_eq!(mode.vsync_period_ns(), 8_333_333);
        assert_eq!(mode.clone().with_flags(DRM_MODE_FLAG_TE_FREQ_X2).te_period_ns(), 4_166_666);
        assert_eq!(DisplayMode::new(2, 10, 10, 0).vsync_period_ns(), 0);
    }

    #[test]
    fn test_modeinfo_blob() {
        let mut mode = DisplayMode::new(1, 1920, 1080, 60);
        mode.name = "x".repeat(40);
        let info = mode.to_modeinfo();
        assert_eq!(info.hdisplay, 1920);
        assert_eq!(info.name[31], 0);
        assert_eq!(mode.to_blob_bytes().len(), MODEINFO_SIZE);
    }

    #[test]
    fn test_superseded_blob_outlives_the_transaction_that_replaced_it() {
        let sim = SimulatedKms::new();
        let device: Arc<dyn KmsDevice> = sim.clone();
        let a = DisplayMode::new(1, 1920, 1080, 60);
        let b = DisplayMode::new(2, 1920, 1080, 120);
        let c = DisplayMode::new(3, 1920, 1080, 90);
        let mut desired = ModeState::new();

        let blob_a = blob(&device, &a);
        let id_a = blob_a.id();
        let mut t1 = txn(&sim);
        desired.set_mode(a, blob_a, true, &mut t1);
        assert!(desired.needs_mode_set());
        drop(t1);

        let mut t2 = txn(&sim);
        desired.set_mode(b.clone(), blob(&device, &b), true, &mut t2);
        drop(t2);
        // Still the old blob, not yet retired
        assert_eq!(sim.blob_destroy_count(id_a), 0);

        let mut t3 = txn(&sim);
        desired.set_mode(c.clone(), blob(&device, &c), true, &mut t3);
        assert_eq!(sim.blob_destroy_count(id_a), 0);
        drop(t3);
        assert_eq!(sim.blob_destroy_count(id_a), 1);
    }

    #[test]
    fn test_apply_moves_blob_to_active() {
        let sim = SimulatedKms::new();
        let device: Arc<dyn KmsDevice> = sim.clone();
        let a = DisplayMode::new(1, 1920, 1080, 60);
        let mut active = ModeState::new();
        let mut desired = ModeState::new();

        let blob_a = blob(&device, &a);
        let id_a = blob_a.id();
        let mut t = txn(&sim);
        desired.set_mode(a, blob_a, false, &mut t);
        desired.apply(&mut active, &mut t);
        active.clear_pending();
        drop(t);

        assert_eq!(active.blob_id(), Some(id_a));
        assert_eq!(active.mode_id(), Some(ModeId(1)));
        assert!(!active.needs_mode_set());
        assert!(!desired.needs_mode_set());
        assert_eq!(desired.mode_id(), Some(ModeId(1)));
        assert_eq!(sim.live_blobs(), vec![id_a]);

        active.force_mode_set();
        assert!(active.needs_mode_set());

        let mut t = txn(&sim);
        active.reset(&mut t);
        drop(t);
        assert!(sim.live_blobs().is_empty());
    }
}
