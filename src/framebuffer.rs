//! Framebuffer identities and kernel framebuffer ownership
//!
//! A [`CachedFramebuffer`] owns one kernel framebuffer id and removes it when
//! dropped. [`create_framebuffer`] turns a plane's buffer description into an
//! ADDFB2 call; the GEM handles it opens on the way are closed before it
//! returns, whether the call succeeded or not.

use crate::format::{modifier, FourCc};
use crate::kms::{FramebufferRequest, KmsDevice, FB_FLAG_MODIFIERS};
use crate::{Error, Result};
use std::fmt;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Maximum number of memory planes a scanout format may use
const MAX_PLANE_NUM: usize = 3;

/// Index of the chroma plane in a single-buffer YUV layout
const CBCR_INDEX: usize = 1;

/// Handle value the display engine expects for solid colour framebuffers
const COLORMAP_HANDLE: u32 = 0xff00_0000;

/// Compositor layer owning cached framebuffers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LayerId(pub u64);

/// Structural identity of a scanout buffer, the cache match key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferIdentity {
    Pixel {
        buffer_id: u64,
        format: FourCc,
        secure: bool,
    },
    SolidColor {
        width: u32,
        height: u32,
    },
}

impl BufferIdentity {
    pub fn is_secure(&self) -> bool {
        matches!(self, BufferIdentity::Pixel { secure: true, .. })
    }

    /// Producer-assigned buffer id, 0 for solid colours
    pub fn buffer_id(&self) -> u64 {
        match self {
            BufferIdentity::Pixel { buffer_id, .. } => *buffer_id,
            BufferIdentity::SolidColor { .. } => 0,
        }
    }
}

/// Memory-backed buffer to scan out
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferSource {
    /// Producer-unique id of the allocation
    pub buffer_id: u64,
    pub format: FourCc,
    /// One dma-buf fd per memory buffer
    pub fds: Vec<RawFd>,
    /// Full allocation size
    pub width: u32,
    pub height: u32,
    pub secure: bool,
    /// Rounded-corner mask plane
    pub rcd: bool,
}

/// What a plane scans out
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramebufferSource {
    Buffer(BufferSource),
    /// Solid fill; `color` is ARGB8888 and is not part of the identity
    SolidColor { width: u32, height: u32, color: u32 },
}

impl FramebufferSource {
    pub fn identity(&self) -> BufferIdentity {
        match self {
            FramebufferSource::Buffer(buffer) => BufferIdentity::Pixel {
                buffer_id: buffer.buffer_id,
                format: buffer.format,
                secure: buffer.secure,
            },
            FramebufferSource::SolidColor { width, height, .. } => BufferIdentity::SolidColor {
                width: *width,
                height: *height,
            },
        }
    }

    pub fn is_secure(&self) -> bool {
        matches!(self, FramebufferSource::Buffer(BufferSource { secure: true, .. }))
    }
}

/// A kernel framebuffer, removed with RMFB when dropped
pub struct CachedFramebuffer {
    device: Arc<dyn KmsDevice>,
    fb_id: u32,
    identity: BufferIdentity,
}

impl CachedFramebuffer {
    pub fn new(device: Arc<dyn KmsDevice>, fb_id: u32, identity: BufferIdentity) -> Self {
        Self {
            device,
            fb_id,
            identity,
        }
    }

    pub fn id(&self) -> u32 {
        self.fb_id
    }

    pub fn identity(&self) -> &BufferIdentity {
        &self.identity
    }
}

impl fmt::Debug for CachedFramebuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedFramebuffer")
            .field("fb_id", &self.fb_id)
            .field("identity", &self.identity)
            .finish()
    }
}

impl Drop for CachedFramebuffer {
    fn drop(&mut self) {
        match self.device.remove_framebuffer(self.fb_id) {
            Ok(()) => debug!("Removed framebuffer {}", self.fb_id),
            Err(e) => error!("Failed to remove framebuffer {}: {}", self.fb_id, e),
        }
    }
}

/// GEM handles imported for one ADDFB2 call, closed on drop
struct GemHandles {
    device: Arc<dyn KmsDevice>,
    handles: Vec<u32>,
}

impl GemHandles {
    fn new(device: &Arc<dyn KmsDevice>) -> Self {
        Self {
            device: Arc::clone(device),
            handles: Vec::with_capacity(MAX_PLANE_NUM),
        }
    }

    fn import(&mut self, fd: RawFd) -> Result<u32> {
        let handle = self
            .device
            .prime_fd_to_handle(fd)
            .map_err(|e| Error::from_kernel("prime fd to handle", e))?;
        self.handles.push(handle);
        Ok(handle)
    }
}

impl Drop for GemHandles {
    fn drop(&mut self) {
        for handle in self.handles.drain(..) {
            if let Err(e) = self.device.gem_close(handle) {
                error!("Failed to close gem handle 0x{:x}: {}", handle, e);
            }
        }
    }
}

/// Create a kernel framebuffer for `source`
pub fn create_framebuffer(device: &Arc<dyn KmsDevice>, source: &FramebufferSource) -> Result<u32> {
    match source {
        FramebufferSource::Buffer(buffer) => {
            let mut handles = GemHandles::new(device);
            let request = buffer_request(buffer, &mut handles)?;
            // The framebuffer keeps its own reference; ours close when `handles` drops
            add_framebuffer(device, &request)
        }
        FramebufferSource::SolidColor { width, height, .. } => {
            add_framebuffer(device, &color_request(*width, *height)?)
        }
    }
}

fn add_framebuffer(device: &Arc<dyn KmsDevice>, request: &FramebufferRequest) -> Result<u32> {
    device.add_framebuffer(request).map_err(|e| {
        error!(
            "Failed to add FB: {}x{} format {:?} handles {:?} pitches {:?} offsets {:?} modifiers {:#x?}: {}",
            request.width,
            request.height,
            request.format,
            request.handles,
            request.pitches,
            request.offsets,
            request.modifiers,
            e
        );
        Error::from_kernel("addfb2", e)
    })
}

fn buffer_request(buffer: &BufferSource, handles: &mut GemHandles) -> Result<FramebufferRequest> {
    let info = buffer.format.info().ok_or_else(|| {
        Error::InvalidConfiguration(format!("unsupported format {:?}", buffer.format))
    })?;

    let buffer_num = buffer.fds.len();
    let plane_num = info.planes as usize;
    if buffer_num == 0 || buffer_num > plane_num {
        return Err(Error::InvalidConfiguration(format!(
            "{} buffers for {:?} with {} planes",
            buffer_num, buffer.format, plane_num
        )));
    }
    if plane_num > MAX_PLANE_NUM {
        return Err(Error::InvalidConfiguration(format!(
            "{:?} needs {} planes",
            buffer.format, plane_num
        )));
    }
    if buffer.rcd && (buffer.format != FourCc::C8 || buffer_num != 1 || buffer.secure) {
        return Err(Error::InvalidConfiguration(
            "rounded corner planes must be a single unprotected C8 buffer".into(),
        ));
    }

    let mut request = FramebufferRequest {
        width: buffer.width,
        height: buffer.height,
        format: buffer.format,
        handles: [0; 4],
        pitches: [0; 4],
        offsets: [0; 4],
        modifiers: [0; 4],
        flags: 0,
    };
    if buffer.secure {
        request.modifiers[0] |= modifier::PROTECTION;
    }

    let too_large = || {
        Error::InvalidConfiguration(format!(
            "{}x{} {:?} buffer is too large",
            buffer.width, buffer.height, buffer.format
        ))
    };
    let pitch = info.pitch(buffer.width).ok_or_else(too_large)?;
    let chroma_offset = if buffer_num == 1 && plane_num > 1 {
        Some(info.primary_plane_len(buffer.width, buffer.height).ok_or_else(too_large)?)
    } else {
        None
    };

    for (index, fd) in buffer.fds.iter().enumerate() {
        request.pitches[index] = pitch;
        request.modifiers[index] = request.modifiers[0];
        request.handles[index] = handles.import(*fd)?;
    }

    if let Some(offset) = chroma_offset {
        request.offsets[CBCR_INDEX] = offset;
        for plane in 1..plane_num {
            request.handles[plane] = request.handles[0];
            request.pitches[plane] = request.pitches[0];
            request.modifiers[plane] = request.modifiers[0];
        }
    }

    if request.modifiers[0] != 0 {
        request.flags = FB_FLAG_MODIFIERS;
    }
    Ok(request)
}

fn color_request(width: u32, height: u32) -> Result<FramebufferRequest> {
    if width == 0 || height == 0 {
        warn!("Solid colour framebuffer with empty size {}x{}", width, height);
    }
    let pitch = width.checked_mul(4).ok_or_else(|| {
        Error::InvalidConfiguration(format!("solid colour width {} is too large", width))
    })?;
    Ok(FramebufferRequest {
        width,
        height,
        format: FourCc::BGRA8888,
        handles: [COLORMAP_HANDLE, 0, 0, 0],
        pitches: [pitch, 0, 0, 0],
        offsets: [0; 4],
        modifiers: [modifier::COLORMAP, 0, 0, 0],
        flags: FB_FLAG_MODIFIERS,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedKms;

    fn rgba(buffer_id: u64) -> FramebufferSource {
        FramebufferSource::Buffer(BufferSource {
            buffer_id,
            format: FourCc::ABGR8888,
            fds: vec![3],
            width: 1080,
            height: 2400,
            secure: false,
            rcd: false,
        })
    }

    #[test]
    fn test_rgba_framebuffer_closes_handles() {
        let sim = SimulatedKms::new();
        let device: Arc<dyn KmsDevice> = sim.clone();

        let fb_id = create_framebuffer(&device, &rgba(7)).unwrap();
        let request = sim.framebuffer(fb_id).unwrap();
        assert_eq!(request.pitches[0], 1080 * 4);
        assert_eq!(request.flags, 0);
        assert_eq!(sim.open_gem_handles(), 0);
    }

    #[test]
    fn test_single_buffer_nv12_shares_handle() {
        let sim = SimulatedKms::new();
        let device: Arc<dyn KmsDevice> = sim.clone();
        let source = FramebufferSource::Buffer(BufferSource {
            buffer_id: 9,
            format: FourCc::NV12,
            fds: vec![5],
            width: 1920,
            height: 1080,
            secure: true,
            rcd: false,
        });

        let fb_id = create_framebuffer(&device, &source).unwrap();
        let request = sim.framebuffer(fb_id).unwrap();
        assert_eq!(request.handles[1], request.handles[0]);
        assert_eq!(request.offsets[1], 1920 * 1080);
        assert_eq!(request.modifiers[1], modifier::PROTECTION);
        assert_eq!(request.flags, FB_FLAG_MODIFIERS);
    }

    #[test]
    fn test_failed_addfb_still_closes_handles() {
        let sim = SimulatedKms::new();
        let device: Arc<dyn KmsDevice> = sim.clone();
        sim.fail_next_add_framebuffer(libc::ENOMEM);

        let err = create_framebuffer(&device, &rgba(1)).unwrap_err();
        assert!(err.is_resource_exhausted());
        assert_eq!(sim.open_gem_handles(), 0);
        assert_eq!(sim.live_framebuffers(), 0);
    }

    #[test]
    fn test_bad_fd_and_bad_format_rejected() {
        let sim = SimulatedKms::new();
        let device: Arc<dyn KmsDevice> = sim.clone();

        let mut source = rgba(1);
        if let FramebufferSource::Buffer(buffer) = &mut source {
            buffer.format = FourCc(0x1234_5678);
        }
        assert!(matches!(
            create_framebuffer(&device, &source),
            Err(Error::InvalidConfiguration(_))
        ));

        let rcd = FramebufferSource::Buffer(BufferSource {
            buffer_id: 2,
            format: FourCc::ARGB8888,
            fds: vec![4],
            width: 64,
            height: 64,
            secure: false,
            rcd: true,
        });
        assert!(create_framebuffer(&device, &rcd).is_err());
        assert_eq!(sim.add_framebuffer_calls(), 0);
    }

    #[test]
    fn test_solid_color_framebuffer() {
        let sim = SimulatedKms::new();
        let device: Arc<dyn KmsDevice> = sim.clone();
        let source = FramebufferSource::SolidColor {
            width: 100,
            height: 50,
            color: 0xff20_4080,
        };

        let fb_id = create_framebuffer(&device, &source).unwrap();
        let request = sim.framebuffer(fb_id).unwrap();
        assert_eq!(request.format, FourCc::BGRA8888);
        assert_eq!(request.modifiers[0], modifier::COLORMAP);
        assert_eq!(
            source.identity(),
            BufferIdentity::SolidColor { width: 100, height: 50 }
        );
    }

    #[test]
    fn test_oversized_buffers_rejected() {
        let sim = SimulatedKms::new();
        let device: Arc<dyn KmsDevice> = sim.clone();

        let wide = FramebufferSource::Buffer(BufferSource {
            buffer_id: 1,
            format: FourCc::ARGB8888,
            fds: vec![3],
            width: u32::MAX / 2,
            height: 16,
            secure: false,
            rcd: false,
        });
        assert!(matches!(
            create_framebuffer(&device, &wide),
            Err(Error::InvalidConfiguration(_))
        ));

        let tall = FramebufferSource::Buffer(BufferSource {
            buffer_id: 2,
            format: FourCc::NV12,
            fds: vec![3],
            width: 70_000,
            height: 70_000,
            secure: false,
            rcd: false,
        });
        assert!(matches!(
            create_framebuffer(&device, &tall),
            Err(Error::InvalidConfiguration(_))
        ));

        let color = FramebufferSource::SolidColor {
            width: u32::MAX,
            height: 1,
            color: 0,
        };
        assert!(matches!(
            create_framebuffer(&device, &color),
            Err(Error::InvalidConfiguration(_))
        ));

        assert_eq!(sim.add_framebuffer_calls(), 0);
        assert_eq!(sim.open_gem_handles(), 0);
    }

    #[test]
    fn test_drop_removes_framebuffer_once() {
        let sim = SimulatedKms::new();
        let device: Arc<dyn KmsDevice> = sim.clone();
        let fb_id = create_framebuffer(&device, &rgba(3)).unwrap();

        let cached = CachedFramebuffer::new(device, fb_id, rgba(3).identity());
        drop(cached);
        assert_eq!(sim.removal_count(fb_id), 1);
        assert_eq!(sim.live_framebuffers(), 0);
    }
}
