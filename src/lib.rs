//! Framebuffer cache and atomic mode-switch engine for DRM/KMS displays
//!
//! This library sits between a display compositor's layer planner and the
//! kernel display driver. For every frame it turns the final plane
//! assignment into kernel framebuffers (cached per layer), writes the plane
//! properties into one atomic request and, when a display mode change is
//! pending, carries the mode set in the same request and confirms it from
//! the hardware vsync timing.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │              Compositor (layer planning, composition)       │
//! └─────────────────────────────────────────────────────────────┘
//!          │ FrameConfig / mode requests        ▲ vsync timestamps
//!          ▼                                    │
//! ┌─────────────────────────────────────────────────────────────┐
//! │              DisplayPipeline                                │
//! │  ┌──────────────────┐  ┌──────────────────┐  ┌───────────┐ │
//! │  │ FramebufferCache │  │ ModeSwitch-      │  │ Vsync-    │ │
//! │  │ + AsyncReclaimer │  │ Coordinator      │  │ Reconciler│ │
//! │  └──────────────────┘  └──────────────────┘  └───────────┘ │
//! │              AtomicTransaction (change suppression)         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                    KmsDevice (ADDFB2, blobs, ATOMIC)
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │              Kernel DRM/KMS driver                          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use drm_modeset_engine::{DisplayPipeline, DrmDevice, EngineConfig, NoopHooks};
//!
//! let device = Arc::new(DrmDevice::open(Path::new("/dev/dri/card0"))?);
//! let pipeline = DisplayPipeline::new(device, catalog, Arc::new(NoopHooks), layout, &config)?;
//! pipeline.set_active_config(ModeId(1))?;
//! pipeline.commit_frame(&frame)?;
//! ```

pub mod atomic;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod drm_device;
pub mod error;
pub mod ffi;
pub mod format;
pub mod framebuffer;
pub mod kms;
pub mod mode;
pub mod pipeline;
pub mod property;
pub mod reclaim;
pub mod sim;
pub mod vsync;

pub use atomic::{AtomicContext, AtomicTransaction, CommitStatus};
pub use cache::{CacheStats, FramebufferCache};
pub use config::EngineConfig;
pub use coordinator::{ModeSwitchCoordinator, ModeSwitchState};
pub use drm_device::DrmDevice;
pub use error::Error;
pub use format::FourCc;
pub use framebuffer::{BufferIdentity, BufferSource, FramebufferSource, LayerId};
pub use kms::{DisplayHooks, KmsDevice, NoopHooks};
pub use mode::{DisplayMode, ModeId};
pub use pipeline::{
    BlendMode, DisplayLayout, DisplayPipeline, FrameCommit, FrameConfig, PlaneConfig, Rect,
};
pub use property::{PropertyCatalog, PropertyTable};

/// Result type for this crate
pub type Result<T> = std::result::Result<T, Error>;
