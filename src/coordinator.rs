//! Mode-switch state machine
//!
//! ```text
//!             request_mode(M != active)
//!   Stable(A) ─────────────────────────► DesiredPending(A, M)
//!      ▲                                   │ frame commit carries M's blob
//!      │ vsync period matches / timeout    ▼
//!      └────────────────────────────── Applying(M)
//! ```
//!
//! [`set_active_config`](ModeSwitchCoordinator::set_active_config) skips the
//! vsync confirmation and goes straight to `Stable`. The coordinator is not
//! synchronised itself; the pipeline keeps it under the display mutex shared
//! by the frame path and the vsync callback.

use crate::atomic::{AtomicContext, AtomicTransaction, CommitStatus};
use crate::kms::{commit_flags, PropertyBlob};
use crate::mode::{DisplayMode, ModeId, ModeState};
use crate::property::{BoundProperty, PropertyCatalog};
use crate::vsync::VsyncReconciler;
use crate::{Error, Result};
use std::os::unix::io::OwnedFd;
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

/// Vblank-off delay restored once a resolution switch has settled
const VBLANK_OFF_DELAY_DEFAULT: u32 = 1;

/// Called with the new mode after the commit carrying it succeeded
pub type ConfigChangeCallback = Arc<dyn Fn(ModeId) + Send + Sync>;

/// Observable state of the mode machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeSwitchState {
    Stable(Option<ModeId>),
    DesiredPending {
        active: Option<ModeId>,
        desired: ModeId,
        blob_id: u32,
    },
    Applying(ModeId),
}

/// CRTC and connector properties a mode set writes
#[derive(Debug, Clone, Copy)]
pub struct ModeProperties {
    pub crtc_id: u32,
    pub active: BoundProperty,
    pub mode_id: BoundProperty,
    pub connector_crtc: BoundProperty,
}

impl ModeProperties {
    pub fn resolve(catalog: &dyn PropertyCatalog, crtc_id: u32, connector_id: u32) -> Self {
        Self {
            crtc_id,
            active: BoundProperty::resolve(catalog, crtc_id, "ACTIVE"),
            mode_id: BoundProperty::resolve(catalog, crtc_id, "MODE_ID"),
            connector_crtc: BoundProperty::resolve(catalog, connector_id, "CRTC_ID"),
        }
    }
}

pub struct ModeSwitchCoordinator {
    atomic: Arc<AtomicContext>,
    modes: Vec<DisplayMode>,
    props: ModeProperties,
    active: ModeState,
    desired: ModeState,
    vsync: VsyncReconciler,
    resolution_switch_in_progress: bool,
    /// Vsync events requested by the client
    vsync_requested: bool,
    hw_vsync_enabled: bool,
    config_change_callback: Option<ConfigChangeCallback>,
}

impl ModeSwitchCoordinator {
    pub fn new(
        atomic: Arc<AtomicContext>,
        modes: Vec<DisplayMode>,
        props: ModeProperties,
        transient_duration: u32,
    ) -> Self {
        Self {
            atomic,
            modes,
            props,
            active: ModeState::new(),
            desired: ModeState::new(),
            vsync: VsyncReconciler::new(transient_duration),
            resolution_switch_in_progress: false,
            vsync_requested: false,
            hw_vsync_enabled: false,
            config_change_callback: None,
        }
    }

    pub fn modes(&self) -> &[DisplayMode] {
        &self.modes
    }

    pub fn active_mode(&self) -> Option<&DisplayMode> {
        self.active.mode()
    }

    pub fn is_resolution_switch_in_progress(&self) -> bool {
        self.resolution_switch_in_progress
    }

    pub fn transient_duration(&self) -> u32 {
        self.vsync.transient_duration()
    }

    pub fn set_config_change_callback(&mut self, callback: Option<ConfigChangeCallback>) {
        self.config_change_callback = callback;
    }

    pub fn state(&self) -> ModeSwitchState {
        if self.desired.needs_mode_set() {
            if let (Some(desired), Some(blob_id)) = (self.desired.mode_id(), self.desired.blob_id()) {
                return ModeSwitchState::DesiredPending {
                    active: self.active.mode_id(),
                    desired,
                    blob_id,
                };
            }
        }
        match (self.vsync.desired_period(), self.active.mode_id()) {
            (Some(_), Some(mode)) => ModeSwitchState::Applying(mode),
            _ => ModeSwitchState::Stable(self.active.mode_id()),
        }
    }

    fn find_mode(&self, mode_id: ModeId) -> Result<DisplayMode> {
        self.modes
            .iter()
            .find(|m| m.id == mode_id)
            .cloned()
            .ok_or_else(|| {
                error!("Could not find mode {}", mode_id);
                Error::UnknownMode(mode_id.0)
            })
    }

    fn create_mode_blob(&self, mode: &DisplayMode) -> Result<PropertyBlob> {
        PropertyBlob::create(self.atomic.device(), &mode.to_blob_bytes()).map_err(|e| {
            error!("Failed to create mode property blob for {}: {}", mode, e);
            Error::from_kernel("create mode blob", e)
        })
    }

    fn is_same_active_mode(&self, mode_id: ModeId) -> bool {
        self.active.blob_id().is_some()
            && self.active.mode_id() == Some(mode_id)
            && !self.active.needs_mode_set()
    }

    /// Write ACTIVE, MODE_ID and the connector binding for `blob_id`
    fn add_display_mode(&self, txn: &mut AtomicTransaction, blob_id: u32, mode_id: ModeId) -> Result<()> {
        txn.add_property(&self.props.active, 1, false)?;
        txn.add_property(&self.props.mode_id, u64::from(blob_id), false)?;
        txn.add_property(&self.props.connector_crtc, u64::from(self.props.crtc_id), false)?;
        if let Some(callback) = &self.config_change_callback {
            let callback = Arc::clone(callback);
            txn.set_ack_callback(move || callback(mode_id));
        }
        Ok(())
    }

    /// Ask for `mode_id` to be applied with the next frame
    ///
    /// With `test_only` the switch is only validated by a TEST_ONLY commit
    /// (skipped for resolution changes) and no state changes.
    pub fn request_mode(&mut self, mode_id: ModeId, test_only: bool) -> Result<()> {
        let mode = self.find_mode(mode_id)?;

        if self.desired.needs_mode_set() {
            info!(
                "Previous mode change {:?} request is not applied",
                self.desired.mode_id()
            );
            if !test_only && self.desired.mode_id() == Some(mode_id) {
                debug!("Same desired mode {}", mode_id);
                return Ok(());
            }
        } else if self.is_same_active_mode(mode_id) {
            debug!("Same mode {}", mode_id);
            return Ok(());
        }

        let full_switch = self.active.blob_id().is_some() && self.active.is_full_mode_switch(&mode);
        if test_only {
            if !full_switch {
                self.test_mode(&mode)?;
            }
            return Ok(());
        }

        let blob = self.create_mode_blob(&mode)?;
        let mut txn = AtomicTransaction::new(Arc::clone(&self.atomic));
        if full_switch {
            self.resolution_switch_in_progress = true;
            self.atomic.hooks().set_vblank_off_delay(0);
        }
        let seamless = !self.active.is_full_mode_switch(&mode);
        info!("Requested mode {}", mode);
        self.desired.set_mode(mode, blob, seamless, &mut txn);
        Ok(())
    }

    /// Validate `mode` with a TEST_ONLY commit. The pending request's blob is
    /// reused when it already describes `mode`.
    fn test_mode(&self, mode: &DisplayMode) -> Result<()> {
        let mut txn = AtomicTransaction::new(Arc::clone(&self.atomic));
        let pending_blob = self
            .desired
            .blob_id()
            .filter(|_| self.desired.needs_mode_set() && self.desired.mode_id() == Some(mode.id));
        let result = match pending_blob {
            Some(blob_id) => self
                .add_display_mode(&mut txn, blob_id, mode.id)
                .and_then(|()| txn.commit(commit_flags::TEST_ONLY)),
            None => {
                let blob = self.create_mode_blob(mode)?;
                let result = self
                    .add_display_mode(&mut txn, blob.id(), mode.id)
                    .and_then(|()| txn.commit(commit_flags::TEST_ONLY));
                txn.retire_blob(blob);
                result
            }
        };
        if let Err(e) = result {
            error!("Test commit for mode {} failed: {}", mode, e);
            return Err(e);
        }
        Ok(())
    }

    /// Embed the pending mode set, if any, into a frame transaction
    pub fn prepare_commit(&self, txn: &mut AtomicTransaction) -> Result<()> {
        if !self.desired.needs_mode_set() {
            return Ok(());
        }
        match (self.desired.blob_id(), self.desired.mode_id()) {
            (Some(blob_id), Some(mode_id)) => self.add_display_mode(txn, blob_id, mode_id),
            _ => Ok(()),
        }
    }

    /// Flags for a frame commit
    pub fn commit_flags(&self) -> u32 {
        let mut flags = commit_flags::NONBLOCK;
        if self.desired.needs_mode_set() && !self.desired.is_seamless() {
            flags |= commit_flags::ALLOW_MODESET;
        }
        flags
    }

    /// A mode set will ride along with the next frame
    pub fn is_mode_set_pending(&self) -> bool {
        self.desired.needs_mode_set()
    }

    /// Promote the desired mode after a frame commit carrying it was applied.
    /// `retire_fence` signals once that frame is on screen.
    pub fn finish_commit(&mut self, txn: &mut AtomicTransaction, retire_fence: Option<OwnedFd>) {
        if !self.desired.needs_mode_set() {
            return;
        }
        self.desired.apply(&mut self.active, txn);
        self.active.clear_pending();

        let period = self.active.mode().map_or(0, DisplayMode::te_period_ns);
        if let Some(mode) = self.active.mode() {
            info!("Mode {} committed, waiting for vsync period {}ns", mode, period);
        }
        self.vsync.arm(period, retire_fence);
        // Needed to observe the period
        self.set_hw_vsync(true);
    }

    /// Feed a vsync timestamp. Returns true once no switch is outstanding.
    pub fn on_vsync(&mut self, timestamp: i64) -> bool {
        self.poll_retire_fence(timestamp);
        let applied = self.vsync.on_vsync(timestamp);
        if !applied {
            return false;
        }

        if self.vsync.desired_period().is_some() {
            self.vsync.reset_desired_period();
            self.end_resolution_switch();
            if let Some(mode) = self.active.mode_id() {
                info!("Mode {} applied", mode);
                self.atomic.hooks().on_mode_applied(mode);
            }
        }

        if !self.vsync_requested && self.hw_vsync_enabled {
            self.set_hw_vsync(false);
            self.vsync.reset_timestamp();
        }
        true
    }

    fn poll_retire_fence(&mut self, timestamp: i64) {
        let Some(fence) = self.vsync.pending_retire_fence() else {
            return;
        };
        match self.atomic.device().fence_signal_time(fence) {
            Ok(Some(signal_time)) => self.vsync.fence_signaled(signal_time),
            Ok(None) => trace!("Mode set frame not on screen at {}", timestamp),
            Err(e) => {
                warn!("Cannot read retire fence ({}), counting vsync {} instead", e, timestamp);
                self.vsync.fence_signaled(timestamp);
            }
        }
    }

    /// Apply `mode_id` right away with a modeset-allowed commit
    pub fn set_active_config(&mut self, mode_id: ModeId) -> Result<()> {
        let mode = self.find_mode(mode_id)?;
        if self.is_same_active_mode(mode_id) {
            debug!("Same mode {}", mode_id);
            if self.desired.needs_mode_set() {
                // Back to the active mode: drop the pending request
                let mut txn = AtomicTransaction::new(Arc::clone(&self.atomic));
                self.desired.reset(&mut txn);
                self.vsync.reset_desired_period();
                self.end_resolution_switch();
            }
            return Ok(());
        }

        let blob = self.create_mode_blob(&mode)?;
        let seamless = !self.active.is_full_mode_switch(&mode);
        let mut txn = AtomicTransaction::new(Arc::clone(&self.atomic));

        let result = self
            .add_display_mode(&mut txn, blob.id(), mode_id)
            .and_then(|()| txn.commit(commit_flags::ALLOW_MODESET));
        let status = match result {
            Ok(status) => status,
            Err(e) => {
                error!("Failed to apply mode {}: {}", mode, e);
                txn.retire_blob(blob);
                return Err(e);
            }
        };

        if status == CommitStatus::Deferred {
            info!("Mode {} deferred to the next frame", mode);
            self.desired.set_mode(mode, blob, seamless, &mut txn);
            return Ok(());
        }

        let period = mode.te_period_ns();
        info!("Active mode set to {}", mode);
        self.active.set_mode(mode, blob, seamless, &mut txn);
        self.active.clear_pending();
        // Anything still pending is superseded
        self.desired.reset(&mut txn);
        self.vsync.reset_desired_period();
        self.vsync.set_vsync_period(period);
        self.end_resolution_switch();
        Ok(())
    }

    fn end_resolution_switch(&mut self) {
        if self.resolution_switch_in_progress {
            self.resolution_switch_in_progress = false;
            self.atomic.hooks().set_vblank_off_delay(VBLANK_OFF_DELAY_DEFAULT);
        }
    }

    /// Write the properties that detach the CRTC from the connector
    pub fn clear_display_mode(&self, txn: &mut AtomicTransaction) -> Result<()> {
        txn.add_property(&self.props.connector_crtc, 0, false)?;
        txn.add_property(&self.props.mode_id, 0, false)?;
        txn.add_property(&self.props.active, 0, false)?;
        Ok(())
    }

    /// Make the next request for the active mode re-apply it
    pub fn force_mode_set(&mut self) {
        self.active.force_mode_set();
    }

    /// Client request for vsync events
    pub fn set_vsync_enabled(&mut self, enabled: bool) {
        self.vsync_requested = enabled;
        if enabled {
            self.set_hw_vsync(true);
        } else if self.vsync.desired_period().is_none() {
            // Stays on while a switch is being confirmed
            self.set_hw_vsync(false);
            self.vsync.reset_timestamp();
        }
    }

    fn set_hw_vsync(&mut self, enabled: bool) {
        if self.hw_vsync_enabled != enabled {
            self.hw_vsync_enabled = enabled;
            self.atomic.hooks().set_vsync_enabled(enabled);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DebugConfig;
    use crate::kms::{DisplayHooks, KmsDevice};
    use crate::property::{PropertyInfo, PropertyTable};
    use crate::sim::{RecordingHooks, SimulatedKms};
    use std::sync::atomic::{AtomicU32, Ordering};

    const CRTC: u32 = 40;
    const CONNECTOR: u32 = 50;
    const PROP_ACTIVE: u32 = 1;
    const PROP_MODE_ID: u32 = 2;
    const PROP_CRTC_ID: u32 = 3;

    const A: ModeId = ModeId(1);
    const B: ModeId = ModeId(2);
    const C: ModeId = ModeId(3);

    struct Fixture {
        sim: Arc<SimulatedKms>,
        hooks: Arc<RecordingHooks>,
        atomic: Arc<AtomicContext>,
        coordinator: ModeSwitchCoordinator,
    }

    fn fixture() -> Fixture {
        let sim = SimulatedKms::new();
        let hooks = RecordingHooks::new();
        let device: Arc<dyn KmsDevice> = sim.clone();
        let display_hooks: Arc<dyn DisplayHooks> = hooks.clone();
        let debug = DebugConfig {
            drm_debug_node: None,
            ..Default::default()
        };
        let atomic = Arc::new(AtomicContext::new(device, display_hooks, debug));
        let table = PropertyTable::new()
            .with(CRTC, PROP_ACTIVE, PropertyInfo::new("ACTIVE"))
            .with(CRTC, PROP_MODE_ID, PropertyInfo::new("MODE_ID"))
            .with(CONNECTOR, PROP_CRTC_ID, PropertyInfo::new("CRTC_ID"));
        let modes = vec![
            DisplayMode::new(A.0, 1920, 1080, 60),
            DisplayMode::new(B.0, 2960, 1440, 120),
            DisplayMode::new(C.0, 1920, 1080, 120),
        ];
        let props = ModeProperties::resolve(&table, CRTC, CONNECTOR);
        let coordinator = ModeSwitchCoordinator::new(atomic.clone(), modes, props, 2);
        Fixture {
            sim,
            hooks,
            atomic,
            coordinator,
        }
    }

    impl Fixture {
        /// Commit a frame carrying whatever the coordinator wants to embed
        fn commit_frame(&mut self) -> Result<CommitStatus> {
            let mut txn = AtomicTransaction::new(self.atomic.clone());
            self.coordinator.prepare_commit(&mut txn)?;
            let status = txn.commit(self.coordinator.commit_flags())?;
            if status == CommitStatus::Applied {
                self.coordinator.finish_commit(&mut txn, None);
            }
            Ok(status)
        }
    }

    #[test]
    fn test_request_for_active_mode_is_a_no_op() {
        let mut fx = fixture();
        fx.coordinator.set_active_config(A).unwrap();
        let blobs = fx.sim.blob_creations();
        let commits = fx.sim.commits().len();

        fx.coordinator.request_mode(A, false).unwrap();
        fx.coordinator.request_mode(A, true).unwrap();

        assert_eq!(fx.sim.blob_creations(), blobs);
        assert_eq!(fx.sim.commits().len(), commits);
        assert_eq!(fx.coordinator.state(), ModeSwitchState::Stable(Some(A)));
    }

    #[test]
    fn test_full_switch_converges_on_vsync() {
        let mut fx = fixture();
        fx.coordinator.set_active_config(A).unwrap();
        fx.coordinator.on_vsync(0);

        fx.coordinator.request_mode(B, false).unwrap();
        let blob_b = match fx.coordinator.state() {
            ModeSwitchState::DesiredPending { active, desired, blob_id } => {
                assert_eq!(active, Some(A));
                assert_eq!(desired, B);
                blob_id
            }
            other => panic!("unexpected state {:?}", other),
        };
        assert!(fx.coordinator.is_resolution_switch_in_progress());
        assert_eq!(fx.hooks.vblank_off_delays(), vec![0]);

        assert_eq!(fx.commit_frame().unwrap(), CommitStatus::Applied);
        let commit = fx.sim.last_commit().unwrap();
        assert_eq!(commit.value_of(CRTC, PROP_MODE_ID), Some(u64::from(blob_b)));
        assert_ne!(commit.flags & commit_flags::ALLOW_MODESET, 0);
        assert_eq!(fx.coordinator.state(), ModeSwitchState::Applying(B));
        assert_eq!(fx.hooks.vsync_enabled_calls(), vec![true]);

        assert!(!fx.coordinator.on_vsync(16_600_000));
        assert!(!fx.coordinator.on_vsync(33_200_000));
        assert_eq!(fx.coordinator.state(), ModeSwitchState::Applying(B));
        assert!(fx.coordinator.on_vsync(41_500_000));

        assert_eq!(fx.coordinator.state(), ModeSwitchState::Stable(Some(B)));
        assert!(!fx.coordinator.is_resolution_switch_in_progress());
        assert_eq!(fx.hooks.vblank_off_delays(), vec![0, 1]);
        assert_eq!(fx.hooks.applied_modes(), vec![B]);
        assert_eq!(fx.hooks.vsync_enabled_calls(), vec![true, false]);
    }

    #[test]
    fn test_unreadable_retire_fence_falls_back_to_vsync() {
        let mut fx = fixture();
        fx.coordinator.set_active_config(A).unwrap();
        fx.coordinator.on_vsync(0);
        fx.coordinator.request_mode(B, false).unwrap();

        let mut txn = AtomicTransaction::new(fx.atomic.clone());
        fx.coordinator.prepare_commit(&mut txn).unwrap();
        txn.commit(fx.coordinator.commit_flags()).unwrap();
        // Not a fence the device knows about
        let fence = OwnedFd::from(std::fs::File::open("/dev/null").unwrap());
        fx.coordinator.finish_commit(&mut txn, Some(fence));

        // Same timeline as without a fence
        assert!(!fx.coordinator.on_vsync(16_666_666));
        assert!(!fx.coordinator.on_vsync(33_333_333));
        assert!(fx.coordinator.on_vsync(50_000_000));
        assert_eq!(fx.coordinator.state(), ModeSwitchState::Stable(Some(B)));
    }

    #[test]
    fn test_refresh_only_switch_is_seamless() {
        let mut fx = fixture();
        fx.coordinator.set_active_config(A).unwrap();
        fx.coordinator.request_mode(C, false).unwrap();

        assert!(!fx.coordinator.is_resolution_switch_in_progress());
        assert_eq!(fx.coordinator.commit_flags(), commit_flags::NONBLOCK);
        assert!(fx.hooks.vblank_off_delays().is_empty());
    }

    #[test]
    fn test_superseded_request_blob_released_after_frame() {
        let mut fx = fixture();
        fx.coordinator.set_active_config(A).unwrap();
        let active_blob = fx.sim.live_blobs()[0];

        fx.coordinator.request_mode(B, false).unwrap();
        let blob_b = fx.sim.live_blobs()[1];
        // Same pending mode again: nothing new
        fx.coordinator.request_mode(B, false).unwrap();
        assert_eq!(fx.sim.blob_creations(), 2);

        fx.coordinator.request_mode(C, false).unwrap();
        let blob_c = fx.sim.live_blobs()[2];
        assert_eq!(fx.sim.blob_destroy_count(blob_b), 0);

        fx.commit_frame().unwrap();
        assert_eq!(fx.sim.blob_destroy_count(blob_b), 1);
        assert_eq!(fx.sim.blob_destroy_count(blob_c), 0);
        // The previous active blob waits for the next replacement
        assert_eq!(fx.sim.blob_destroy_count(active_blob), 0);
        assert_eq!(
            fx.sim.last_commit().unwrap().value_of(CRTC, PROP_MODE_ID),
            Some(u64::from(blob_c))
        );
    }

    #[test]
    fn test_test_only_request_keeps_state() {
        let mut fx = fixture();
        fx.coordinator.set_active_config(A).unwrap();
        let commits = fx.sim.commits().len();

        fx.coordinator.request_mode(C, true).unwrap();
        assert_eq!(fx.coordinator.state(), ModeSwitchState::Stable(Some(A)));
        let commit = fx.sim.last_commit().unwrap();
        assert_eq!(commit.flags, commit_flags::TEST_ONLY);
        assert_eq!(fx.sim.commits().len(), commits + 1);

        // Resolution switches are not tested
        fx.coordinator.request_mode(B, true).unwrap();
        assert_eq!(fx.sim.commits().len(), commits + 1);
        assert_eq!(fx.sim.live_blobs().len(), 1);
    }

    #[test]
    fn test_failed_test_only_request_is_reported() {
        let mut fx = fixture();
        fx.coordinator.set_active_config(A).unwrap();
        fx.sim.fail_next_commit(libc::EINVAL);
        let err = fx.coordinator.request_mode(C, true).unwrap_err();
        assert!(matches!(err, Error::CommitFailed { .. }));
        assert_eq!(fx.sim.live_blobs().len(), 1);
    }

    #[test]
    fn test_blob_failure_leaves_state_unchanged() {
        let mut fx = fixture();
        fx.coordinator.set_active_config(A).unwrap();
        fx.sim.fail_next_blob(libc::ENOMEM);

        let err = fx.coordinator.request_mode(B, false).unwrap_err();
        assert!(err.is_resource_exhausted());
        assert_eq!(fx.coordinator.state(), ModeSwitchState::Stable(Some(A)));
        assert!(!fx.coordinator.is_resolution_switch_in_progress());
    }

    #[test]
    fn test_failed_frame_keeps_request_pending() {
        let mut fx = fixture();
        fx.coordinator.set_active_config(A).unwrap();
        fx.coordinator.request_mode(C, false).unwrap();

        fx.sim.fail_next_commit(libc::EBUSY);
        assert!(fx.commit_frame().is_err());
        assert!(matches!(
            fx.coordinator.state(),
            ModeSwitchState::DesiredPending { desired: C, .. }
        ));

        fx.commit_frame().unwrap();
        assert_eq!(fx.coordinator.state(), ModeSwitchState::Applying(C));
    }

    #[test]
    fn test_unknown_mode() {
        let mut fx = fixture();
        assert!(matches!(
            fx.coordinator.request_mode(ModeId(77), false),
            Err(Error::UnknownMode(77))
        ));
        assert!(fx.coordinator.set_active_config(ModeId(77)).is_err());
    }

    #[test]
    fn test_set_active_config_supersedes_pending_request() {
        let mut fx = fixture();
        fx.coordinator.set_active_config(A).unwrap();
        fx.coordinator.request_mode(B, false).unwrap();

        fx.coordinator.set_active_config(C).unwrap();
        assert_eq!(fx.coordinator.state(), ModeSwitchState::Stable(Some(C)));
        assert!(!fx.coordinator.is_resolution_switch_in_progress());
        assert_eq!(
            fx.sim.last_commit().unwrap().flags,
            commit_flags::ALLOW_MODESET
        );
        // A frame now carries no mode set
        fx.commit_frame().unwrap();
        assert_eq!(fx.sim.last_commit().unwrap().value_of(CRTC, PROP_MODE_ID), None);
    }

    #[test]
    fn test_set_active_config_back_to_active_mode_cancels_request() {
        let mut fx = fixture();
        fx.coordinator.set_active_config(A).unwrap();
        fx.coordinator.request_mode(B, false).unwrap();
        let blob_b = fx.sim.live_blobs()[1];
        let commits = fx.sim.commits().len();

        fx.coordinator.set_active_config(A).unwrap();
        assert_eq!(fx.coordinator.state(), ModeSwitchState::Stable(Some(A)));
        assert_eq!(fx.sim.commits().len(), commits);
        assert_eq!(fx.sim.blob_destroy_count(blob_b), 1);
        assert!(!fx.coordinator.is_resolution_switch_in_progress());
        assert_eq!(fx.hooks.vblank_off_delays(), vec![0, 1]);

        fx.commit_frame().unwrap();
        let commit = fx.sim.last_commit().unwrap();
        assert_eq!(commit.value_of(CRTC, PROP_MODE_ID), None);
        assert_eq!(commit.flags & commit_flags::ALLOW_MODESET, 0);
        assert_eq!(fx.coordinator.state(), ModeSwitchState::Stable(Some(A)));
    }

    #[test]
    fn test_test_only_request_reuses_pending_blob() {
        let mut fx = fixture();
        fx.coordinator.set_active_config(A).unwrap();
        fx.coordinator.request_mode(C, false).unwrap();
        let blob_c = match fx.coordinator.state() {
            ModeSwitchState::DesiredPending { blob_id, .. } => blob_id,
            other => panic!("unexpected state {:?}", other),
        };
        let blobs = fx.sim.blob_creations();

        fx.coordinator.request_mode(C, true).unwrap();
        assert_eq!(fx.sim.blob_creations(), blobs);
        let commit = fx.sim.last_commit().unwrap();
        assert_eq!(commit.flags, commit_flags::TEST_ONLY);
        assert_eq!(commit.value_of(CRTC, PROP_MODE_ID), Some(u64::from(blob_c)));
        assert_eq!(fx.sim.blob_destroy_count(blob_c), 0);
        assert!(matches!(
            fx.coordinator.state(),
            ModeSwitchState::DesiredPending { desired: C, .. }
        ));
    }

    #[test]
    fn test_ack_callback_reports_mode() {
        let mut fx = fixture();
        let acked = Arc::new(AtomicU32::new(0));
        let seen = acked.clone();
        fx.coordinator
            .set_config_change_callback(Some(Arc::new(move |mode: ModeId| {
                seen.store(mode.0, Ordering::SeqCst);
            })));

        fx.coordinator.set_active_config(A).unwrap();
        assert_eq!(acked.load(Ordering::SeqCst), A.0);

        fx.coordinator.request_mode(C, true).unwrap();
        assert_eq!(acked.load(Ordering::SeqCst), A.0);

        fx.coordinator.request_mode(C, false).unwrap();
        fx.commit_frame().unwrap();
        assert_eq!(acked.load(Ordering::SeqCst), C.0);
    }

    #[test]
    fn test_clear_display_forces_reapply() {
        let mut fx = fixture();
        fx.coordinator.set_active_config(A).unwrap();

        let mut txn = AtomicTransaction::new(fx.atomic.clone());
        fx.coordinator.clear_display_mode(&mut txn).unwrap();
        txn.commit(commit_flags::ALLOW_MODESET).unwrap();
        fx.coordinator.force_mode_set();

        let blobs = fx.sim.blob_creations();
        fx.coordinator.set_active_config(A).unwrap();
        assert_eq!(fx.sim.blob_creations(), blobs + 1);
        let commit = fx.sim.last_commit().unwrap();
        assert_eq!(commit.value_of(CRTC, PROP_ACTIVE), Some(1));
    }

    #[test]
    fn test_client_vsync_survives_switch() {
        let mut fx = fixture();
        fx.coordinator.set_active_config(A).unwrap();
        fx.coordinator.set_vsync_enabled(true);
        fx.coordinator.request_mode(C, false).unwrap();
        fx.commit_frame().unwrap();

        fx.coordinator.on_vsync(0);
        assert!(fx.coordinator.on_vsync(8_333_333));
        assert_eq!(fx.hooks.vsync_enabled_calls(), vec![true]);

        fx.coordinator.set_vsync_enabled(false);
        assert_eq!(fx.hooks.vsync_enabled_calls(), vec![true, false]);
    }

    #[test]
    fn test_protected_window_defers_immediate_mode_set() {
        let mut fx = fixture();
        fx.hooks.set_protected(true);
        fx.sim.fail_next_commit(libc::EPERM);

        fx.coordinator.set_active_config(A).unwrap();
        assert!(matches!(
            fx.coordinator.state(),
            ModeSwitchState::DesiredPending { active: None, desired: A, .. }
        ));

        fx.hooks.set_protected(false);
        fx.commit_frame().unwrap();
        assert_eq!(fx.coordinator.state(), ModeSwitchState::Applying(A));
    }
}
