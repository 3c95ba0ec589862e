//! Per-display frame pipeline
//!
//! [`DisplayPipeline`] ties the framebuffer cache, atomic transactions and
//! the mode-switch coordinator together. The producer thread calls
//! [`commit_frame`](DisplayPipeline::commit_frame) with the final plane
//! assignment of each frame; the vsync thread calls
//! [`on_vsync`](DisplayPipeline::on_vsync). Both go through the same display
//! mutex, so mode state never changes under a frame being built.
//!
//! The config-change callback never runs under that mutex. Modes acked by a
//! commit are queued and reported once the operation has released it, so the
//! callback may call back into the pipeline.

use crate::atomic::{AtomicContext, AtomicTransaction, CommitStatus};
use crate::cache::{CacheStats, FramebufferCache};
use crate::config::EngineConfig;
use crate::coordinator::{
    ConfigChangeCallback, ModeProperties, ModeSwitchCoordinator, ModeSwitchState,
};
use crate::framebuffer::{create_framebuffer, BufferIdentity, FramebufferSource, LayerId};
use crate::kms::{commit_flags, DisplayHooks, KmsDevice};
use crate::mode::{DisplayMode, ModeId};
use crate::property::{BoundProperty, PropertyCatalog};
use crate::{Error, Result};
use std::collections::HashSet;
use std::os::unix::io::{OwnedFd, RawFd};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, trace, warn};

/// Consecutive failed commits between two health reports
const COMMIT_FAILURE_REPORT_INTERVAL: u32 = 10;

/// Default alpha range when the plane does not report one
const ALPHA_MAX: u64 = 0xffff;

/// Kernel objects driven by one pipeline
#[derive(Debug, Clone)]
pub struct DisplayLayout {
    pub crtc_id: u32,
    pub connector_id: u32,
    /// Planes this display may use, in channel order
    pub plane_ids: Vec<u32>,
    /// Modes advertised by the connector
    pub modes: Vec<DisplayMode>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BlendMode {
    None,
    #[default]
    Premultiplied,
    Coverage,
}

impl BlendMode {
    /// Enum entry name of the `pixel blend mode` property
    fn drm_name(self) -> &'static str {
        match self {
            BlendMode::None => "None",
            BlendMode::Premultiplied => "Pre-multiplied",
            BlendMode::Coverage => "Coverage",
        }
    }
}

/// Final configuration of one hardware plane for a frame
#[derive(Debug, Clone, PartialEq)]
pub struct PlaneConfig {
    pub plane_id: u32,
    /// Layer the buffer belongs to; `None` for anonymous buffers
    pub owner: Option<LayerId>,
    pub source: FramebufferSource,
    /// Source crop in buffer pixels
    pub src: Rect,
    pub dst: Rect,
    /// DRM rotation/reflection bitmask
    pub rotation: Option<u64>,
    pub blend: BlendMode,
    /// Plane alpha in `0.0..=1.0`
    pub alpha: f32,
    pub zpos: u32,
    pub acquire_fence: Option<RawFd>,
}

impl PlaneConfig {
    /// Full-opacity plane scanning `source` unscaled into `dst`
    pub fn new(plane_id: u32, owner: Option<LayerId>, source: FramebufferSource, dst: Rect) -> Self {
        Self {
            plane_id,
            owner,
            source,
            src: Rect::new(0, 0, dst.width, dst.height),
            dst,
            rotation: None,
            blend: BlendMode::default(),
            alpha: 1.0,
            zpos: 0,
            acquire_fence: None,
        }
    }
}

/// Everything shown by one frame
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameConfig {
    pub planes: Vec<PlaneConfig>,
}

/// Result of a frame commit
#[derive(Debug)]
pub struct FrameCommit {
    pub status: CommitStatus,
    /// Signals when the frame is replaced on screen. Only present for
    /// applied commits on CRTCs with OUT_FENCE_PTR.
    pub retire_fence: Option<OwnedFd>,
}

/// Resolved properties of one plane
#[derive(Debug, Clone)]
struct PlaneProperties {
    plane_id: u32,
    crtc_id: BoundProperty,
    fb_id: BoundProperty,
    crtc_x: BoundProperty,
    crtc_y: BoundProperty,
    crtc_w: BoundProperty,
    crtc_h: BoundProperty,
    src_x: BoundProperty,
    src_y: BoundProperty,
    src_w: BoundProperty,
    src_h: BoundProperty,
    rotation: BoundProperty,
    blend: BoundProperty,
    zpos: BoundProperty,
    alpha: BoundProperty,
    in_fence_fd: BoundProperty,
    colormap: BoundProperty,
}

impl PlaneProperties {
    fn resolve(catalog: &dyn PropertyCatalog, plane_id: u32) -> Self {
        let bind = |name| BoundProperty::resolve(catalog, plane_id, name);
        Self {
            plane_id,
            crtc_id: bind("CRTC_ID"),
            fb_id: bind("FB_ID"),
            crtc_x: bind("CRTC_X"),
            crtc_y: bind("CRTC_Y"),
            crtc_w: bind("CRTC_W"),
            crtc_h: bind("CRTC_H"),
            src_x: bind("SRC_X"),
            src_y: bind("SRC_Y"),
            src_w: bind("SRC_W"),
            src_h: bind("SRC_H"),
            rotation: bind("rotation"),
            blend: bind("pixel blend mode"),
            zpos: bind("zpos"),
            alpha: bind("alpha"),
            in_fence_fd: bind("IN_FENCE_FD"),
            colormap: bind("colormap"),
        }
    }

    fn write(
        &self,
        txn: &mut AtomicTransaction,
        catalog: &dyn PropertyCatalog,
        config: &PlaneConfig,
        fb_id: u32,
        crtc_id: u32,
    ) -> Result<()> {
        // Solid colours have no buffer to crop
        let src = match config.source {
            FramebufferSource::SolidColor { .. } => {
                Rect::new(0, 0, config.dst.width, config.dst.height)
            }
            FramebufferSource::Buffer(_) => config.src,
        };

        txn.add_property(&self.crtc_id, u64::from(crtc_id), false)?;
        txn.add_property(&self.fb_id, u64::from(fb_id), false)?;
        txn.add_property(&self.crtc_x, i64::from(config.dst.x) as u64, false)?;
        txn.add_property(&self.crtc_y, i64::from(config.dst.y) as u64, false)?;
        txn.add_property(&self.crtc_w, u64::from(config.dst.width), false)?;
        txn.add_property(&self.crtc_h, u64::from(config.dst.height), false)?;
        // 16.16 fixed point
        txn.add_property(&self.src_x, (src.x.max(0) as u64) << 16, false)?;
        txn.add_property(&self.src_y, (src.y.max(0) as u64) << 16, false)?;
        txn.add_property(&self.src_w, u64::from(src.width) << 16, false)?;
        txn.add_property(&self.src_h, u64::from(src.height) << 16, false)?;

        if let Some(rotation) = config.rotation {
            txn.add_property(&self.rotation, rotation, true)?;
        }

        if let Some(id) = self.blend.id {
            let value = catalog.enum_value_for(id, config.blend.drm_name())?;
            txn.add_property(&self.blend, value, true)?;
        }

        if let Some(id) = self.zpos.id {
            if !catalog.is_immutable(id) {
                let min = catalog.range(id).map_or(0, |(min, _)| min);
                txn.add_property(&self.zpos, u64::from(config.zpos) + min, true)?;
            }
        }

        if let Some(id) = self.alpha.id {
            let max = catalog.range(id).map_or(ALPHA_MAX, |(_, max)| max);
            let value = (config.alpha.clamp(0.0, 1.0) * max as f32).round() as u64;
            txn.add_property(&self.alpha, value, true)?;
        }

        if let Some(fence) = config.acquire_fence {
            txn.add_property_always(&self.in_fence_fd, fence as u64, false)?;
        }

        if let FramebufferSource::SolidColor { color, .. } = config.source {
            txn.add_property(&self.colormap, u64::from(color), false)?;
        }
        Ok(())
    }

    fn disable(&self, txn: &mut AtomicTransaction) -> Result<()> {
        txn.add_property(&self.crtc_id, 0, false)?;
        txn.add_property(&self.fb_id, 0, false)
    }
}

/// Mode-machine state shared by the frame path and the vsync callback
struct DisplayState {
    coordinator: ModeSwitchCoordinator,
    frames: u64,
}

pub struct DisplayPipeline {
    device: Arc<dyn KmsDevice>,
    catalog: Arc<dyn PropertyCatalog>,
    atomic: Arc<AtomicContext>,
    cache: FramebufferCache,
    planes: Vec<PlaneProperties>,
    crtc_id: u32,
    out_fence_ptr: BoundProperty,
    state: Mutex<DisplayState>,
    commit_failures: AtomicU32,
    /// Modes acked under the display mutex, not yet reported
    config_changes: Arc<Mutex<Vec<ModeId>>>,
    config_change_callback: Mutex<Option<ConfigChangeCallback>>,
}

impl DisplayPipeline {
    pub fn new(
        device: Arc<dyn KmsDevice>,
        catalog: Arc<dyn PropertyCatalog>,
        hooks: Arc<dyn DisplayHooks>,
        layout: DisplayLayout,
        config: &EngineConfig,
    ) -> Result<Self> {
        if layout.modes.is_empty() {
            return Err(Error::InvalidConfiguration(format!(
                "connector {} has no modes",
                layout.connector_id
            )));
        }

        let atomic = Arc::new(AtomicContext::new(
            Arc::clone(&device),
            hooks,
            config.debug.clone(),
        ));
        let cache = FramebufferCache::new(Arc::clone(&device), config.cache.clone())?;
        let planes = layout
            .plane_ids
            .iter()
            .map(|&plane| PlaneProperties::resolve(catalog.as_ref(), plane))
            .collect();

        let transient = transient_duration(
            catalog.as_ref(),
            layout.connector_id,
            config.vsync.default_transient_duration,
        );
        let props = ModeProperties::resolve(catalog.as_ref(), layout.crtc_id, layout.connector_id);
        info!(
            "Display pipeline: crtc {} connector {} with {} planes, {} modes, transient duration {}",
            layout.crtc_id,
            layout.connector_id,
            layout.plane_ids.len(),
            layout.modes.len(),
            transient
        );
        let mut coordinator =
            ModeSwitchCoordinator::new(Arc::clone(&atomic), layout.modes, props, transient);
        let config_changes = Arc::new(Mutex::new(Vec::new()));
        let queue = Arc::clone(&config_changes);
        coordinator.set_config_change_callback(Some(Arc::new(move |mode: ModeId| {
            lock(&queue).push(mode);
        })));
        let out_fence_ptr = BoundProperty::resolve(catalog.as_ref(), layout.crtc_id, "OUT_FENCE_PTR");

        Ok(Self {
            device,
            catalog,
            atomic,
            cache,
            planes,
            crtc_id: layout.crtc_id,
            out_fence_ptr,
            state: Mutex::new(DisplayState {
                coordinator,
                frames: 0,
            }),
            commit_failures: AtomicU32::new(0),
            config_changes,
            config_change_callback: Mutex::new(None),
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, DisplayState> {
        lock(&self.state)
    }

    /// Hand queued mode acks to the callback. Must run without the display
    /// mutex held.
    fn report_config_changes(&self) {
        let changes = std::mem::take(&mut *lock(&self.config_changes));
        if changes.is_empty() {
            return;
        }
        let callback = lock(&self.config_change_callback).clone();
        if let Some(callback) = callback {
            for mode in changes {
                callback(mode);
            }
        }
    }

    fn plane(&self, plane_id: u32) -> Result<&PlaneProperties> {
        self.planes
            .iter()
            .find(|p| p.plane_id == plane_id)
            .ok_or_else(|| Error::InvalidConfiguration(format!("plane {} is not ours", plane_id)))
    }

    /// Framebuffer for a plane, from the cache or newly created
    pub fn get_or_create_framebuffer(&self, config: &PlaneConfig) -> Result<u32> {
        self.cache
            .get_or_create(config.owner, config.source.identity(), || {
                create_framebuffer(&self.device, &config.source)
            })
    }

    /// Build and commit one frame
    ///
    /// Running out of kernel memory drops every cached framebuffer and
    /// retries the frame once.
    pub fn commit_frame(&self, frame: &FrameConfig) -> Result<FrameCommit> {
        self.validate(frame)?;

        let result = {
            let mut state = self.lock_state();
            match self.try_commit_frame(&mut state, frame) {
                Err(e) if e.is_resource_exhausted() => {
                    warn!("{}, releasing cached framebuffers and retrying frame", e);
                    self.cache.release_all();
                    self.atomic.forget_committed();
                    self.try_commit_frame(&mut state, frame)
                }
                other => other,
            }
        };
        self.report_config_changes();

        match &result {
            Ok(_) => {
                self.commit_failures.store(0, Ordering::Relaxed);
            }
            Err(Error::CommitFailed { errno }) => {
                let failures = self.commit_failures.fetch_add(1, Ordering::Relaxed) + 1;
                if failures % COMMIT_FAILURE_REPORT_INTERVAL == 0 {
                    error!("{} consecutive frame commits failed, last errno {}", failures, errno);
                }
            }
            Err(_) => {}
        }
        result
    }

    fn validate(&self, frame: &FrameConfig) -> Result<()> {
        let mut seen = HashSet::new();
        for plane in &frame.planes {
            self.plane(plane.plane_id)?;
            if !seen.insert(plane.plane_id) {
                return Err(Error::InvalidConfiguration(format!(
                    "plane {} assigned twice",
                    plane.plane_id
                )));
            }
        }
        Ok(())
    }

    fn try_commit_frame(&self, state: &mut DisplayState, frame: &FrameConfig) -> Result<FrameCommit> {
        self.cache.check_shrink();

        let mut txn = AtomicTransaction::new(Arc::clone(&self.atomic));
        state.coordinator.prepare_commit(&mut txn)?;

        let mut has_secure = false;
        for config in &frame.planes {
            let fb_id = self.get_or_create_framebuffer(config)?;
            self.plane(config.plane_id)?
                .write(&mut txn, self.catalog.as_ref(), config, fb_id, self.crtc_id)?;
            has_secure |= config.source.is_secure();
            trace!("Plane {} scans out framebuffer {}", config.plane_id, fb_id);
        }

        for plane in &self.planes {
            if !frame.planes.iter().any(|c| c.plane_id == plane.plane_id) {
                plane.disable(&mut txn)?;
            }
        }

        txn.request_out_fence(&self.out_fence_ptr)?;

        let status = txn.commit(state.coordinator.commit_flags())?;
        let retire_fence = txn.take_out_fence();
        match status {
            CommitStatus::Applied => {
                // The coordinator keeps its own copy to time the mode switch
                let mode_set_fence = if state.coordinator.is_mode_set_pending() {
                    retire_fence.as_ref().and_then(|fd| {
                        fd.try_clone()
                            .map_err(|e| warn!("Failed to dup retire fence: {}", e))
                            .ok()
                    })
                } else {
                    None
                };
                state.coordinator.finish_commit(&mut txn, mode_set_fence);
            }
            CommitStatus::Deferred => debug!("Frame deferred by protected window"),
            CommitStatus::Tested => {}
        }
        self.cache.flip(has_secure);
        state.frames += 1;
        Ok(FrameCommit {
            status,
            retire_fence,
        })
    }

    /// Request a mode for the next frame, or only validate it
    pub fn request_mode_change(&self, mode_id: ModeId, test_only: bool) -> Result<()> {
        self.lock_state().coordinator.request_mode(mode_id, test_only)
    }

    /// Apply a mode immediately, before frames are flowing
    pub fn set_active_config(&self, mode_id: ModeId) -> Result<()> {
        let result = self.lock_state().coordinator.set_active_config(mode_id);
        self.report_config_changes();
        result
    }

    /// Hardware vsync callback. Returns true once no mode switch is
    /// outstanding.
    pub fn on_vsync(&self, timestamp_ns: i64) -> bool {
        self.lock_state().coordinator.on_vsync(timestamp_ns)
    }

    pub fn set_vsync_enabled(&self, enabled: bool) {
        self.lock_state().coordinator.set_vsync_enabled(enabled);
    }

    pub fn notify_layer_destroyed(&self, owner: LayerId) {
        self.cache.cleanup(owner);
    }

    pub fn notify_buffers_freed(&self, owner: LayerId, buffers: &[BufferIdentity]) {
        self.cache.uncache_buffers(owner, buffers);
    }

    /// Turn every plane off and, with `need_mode_clear`, detach the CRTC so
    /// the next mode request re-applies the mode
    pub fn clear_display(&self, need_mode_clear: bool) -> Result<()> {
        let mut state = self.lock_state();
        let mut txn = AtomicTransaction::new(Arc::clone(&self.atomic));
        for plane in &self.planes {
            plane.disable(&mut txn)?;
        }
        if need_mode_clear {
            state.coordinator.clear_display_mode(&mut txn)?;
        }

        let flags = if need_mode_clear {
            commit_flags::ALLOW_MODESET
        } else {
            0
        };
        txn.commit(flags)?;
        if need_mode_clear {
            state.coordinator.force_mode_set();
        }
        info!("Cleared display (mode clear: {})", need_mode_clear);
        Ok(())
    }

    /// Drop every secure framebuffer, e.g. when protected playback ends
    pub fn destroy_secure_framebuffers(&self) {
        self.cache.destroy_all_secure_buffers();
    }

    pub fn mode_switch_state(&self) -> ModeSwitchState {
        self.lock_state().coordinator.state()
    }

    pub fn active_mode(&self) -> Option<DisplayMode> {
        self.lock_state().coordinator.active_mode().cloned()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Frame commits that failed in a row; 0 after any success
    pub fn consecutive_commit_failures(&self) -> u32 {
        self.commit_failures.load(Ordering::Relaxed)
    }

    pub fn frames_committed(&self) -> u64 {
        self.lock_state().frames
    }

    /// Called with the new mode once a commit carrying it has been applied,
    /// after the call that committed it has released the display state
    pub fn set_config_change_callback<F>(&self, callback: F)
    where
        F: Fn(ModeId) + Send + Sync + 'static,
    {
        *lock(&self.config_change_callback) = Some(Arc::new(callback));
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Vsync periods a refresh-rate switch takes according to the connector
fn transient_duration(catalog: &dyn PropertyCatalog, connector_id: u32, fallback: u32) -> u32 {
    let prop = BoundProperty::resolve(catalog, connector_id, "rr_switch_duration");
    let Some(id) = prop.id else {
        return fallback;
    };
    match catalog.current_value(id) {
        Ok(value) if value > 0 => u32::try_from(value).unwrap_or(fallback),
        Ok(_) => fallback,
        Err(e) => {
            warn!("Failed to read rr_switch_duration: {}", e);
            fallback
        }
    }
}
