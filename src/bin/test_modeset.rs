//! Test binary for the modeset engine
//!
//! Drives a display pipeline over the simulated device: commits a run of
//! frames, switches to a second mode mid-run and feeds vsync timestamps from
//! a separate thread until the switch is confirmed. Retire fences signal on
//! the vsync after their frame was committed.

use anyhow::{bail, Context, Result};
use clap::Parser;
use drm_modeset_engine::sim::{
    simulated_display, RecordingHooks, SimulatedKms, SIM_CRTC_ID, SIM_FIRST_PLANE_ID,
};
use drm_modeset_engine::{
    BufferSource, DisplayMode, DisplayPipeline, EngineConfig, FourCc, FrameConfig,
    FramebufferSource, LayerId, ModeId, ModeSwitchState, PlaneConfig, PropertyCatalog, Rect,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "test_modeset")]
#[command(about = "Exercise the framebuffer cache and mode switching on a simulated display", long_about = None)]
struct Args {
    /// Frames to commit
    #[arg(short, long, default_value_t = 120)]
    frames: u32,

    /// Frame at which the second mode is requested
    #[arg(long, default_value_t = 30)]
    switch_at: u32,

    /// Distinct buffers each layer cycles through
    #[arg(long, default_value_t = 3)]
    buffers: u64,

    /// Engine config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose debug output
    #[arg(short, long)]
    debug: bool,
}

fn layer_plane(plane_id: u32, layer: u64, buffer_id: u64, width: u32, height: u32) -> PlaneConfig {
    let source = FramebufferSource::Buffer(BufferSource {
        buffer_id,
        format: FourCc::ABGR8888,
        fds: vec![3],
        width,
        height,
        secure: false,
        rcd: false,
    });
    PlaneConfig::new(plane_id, Some(LayerId(layer)), source, Rect::new(0, 0, width, height))
}

fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = if args.debug {
        "debug,drm_modeset_engine=trace"
    } else {
        "warn,drm_modeset_engine=info,test_modeset=info"
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => EngineConfig::from_env(),
    };
    // The simulated device never rejects a commit with EINVAL
    config.debug.drm_debug_node = None;

    println!("=== Modeset Engine Test ===\n");

    let modes = vec![
        DisplayMode::new(1, 1080, 2400, 60),
        DisplayMode::new(2, 1080, 2400, 120),
        DisplayMode::new(3, 1440, 3200, 60),
    ];
    let (table, layout) = simulated_display(2, modes);
    let sim = SimulatedKms::new();
    if let Some(out_fence_ptr) = table.lookup(SIM_CRTC_ID, "OUT_FENCE_PTR") {
        sim.enable_out_fences(out_fence_ptr.0);
    }
    let hooks = RecordingHooks::new();
    let pipeline = Arc::new(DisplayPipeline::new(
        sim.clone(),
        Arc::new(table),
        hooks.clone(),
        layout,
        &config,
    )?);
    pipeline.set_config_change_callback(|mode| info!("Config changed to mode {}", mode));

    println!("--- Step 1: Initial mode ---");
    pipeline.set_active_config(ModeId(1))?;
    println!("  Active: {:?}", pipeline.active_mode());

    // Vsync worker at the rate of whatever mode is active
    let running = Arc::new(AtomicBool::new(true));
    let vsync = {
        let pipeline = Arc::clone(&pipeline);
        let running = Arc::clone(&running);
        let sim = Arc::clone(&sim);
        thread::Builder::new()
            .name("vsync".to_string())
            .spawn(move || {
                let mut timestamp = 0i64;
                while running.load(Ordering::Relaxed) {
                    let period = pipeline
                        .active_mode()
                        .map_or(16_666_666, |mode| mode.vsync_period_ns());
                    timestamp += period;
                    sim.signal_fences(timestamp);
                    pipeline.on_vsync(timestamp);
                    thread::sleep(Duration::from_millis(1));
                }
            })
            .context("spawning vsync thread")?
    };

    println!("\n--- Step 2: Frames ---");
    for frame in 0..args.frames {
        if frame == args.switch_at {
            println!("  Frame {}: requesting mode 3", frame);
            pipeline.request_mode_change(ModeId(3), false)?;
        }

        let (width, height) = pipeline
            .active_mode()
            .map_or((1080, 2400), |mode| (u32::from(mode.width()), u32::from(mode.height())));
        let buffer = u64::from(frame) % args.buffers.max(1);
        let planes = vec![
            layer_plane(SIM_FIRST_PLANE_ID, 1, buffer, width, height),
            layer_plane(SIM_FIRST_PLANE_ID + 1, 2, 100 + buffer, width, 200),
        ];
        if let Err(e) = pipeline.commit_frame(&FrameConfig { planes }) {
            warn!("Frame {} failed: {}", frame, e);
        }
        thread::sleep(Duration::from_millis(2));
    }

    println!("\n--- Step 3: Waiting for mode switch ---");
    let mut settled = false;
    for _ in 0..100 {
        if let ModeSwitchState::Stable(Some(mode)) = pipeline.mode_switch_state() {
            println!("  Stable at mode {}", mode);
            settled = true;
            break;
        }
        thread::sleep(Duration::from_millis(5));
    }

    running.store(false, Ordering::Relaxed);
    if vsync.join().is_err() {
        bail!("vsync thread panicked");
    }

    let stats = pipeline.cache_stats();
    println!("\n--- Results ---");
    println!("  Frames committed: {}", pipeline.frames_committed());
    println!("  Framebuffers created: {}", sim.add_framebuffer_calls());
    println!("  Retire fences: {}", sim.out_fences_created());
    println!("  Cache: {:?}", stats);
    println!("  Applied modes: {:?}", hooks.applied_modes());
    println!("  Vblank-off delays: {:?}", hooks.vblank_off_delays());

    if !settled {
        bail!("mode switch did not settle: {:?}", pipeline.mode_switch_state());
    }
    println!("\n=== Test Complete ===");
    Ok(())
}
