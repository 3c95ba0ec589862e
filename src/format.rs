//! DRM fourcc pixel formats and framebuffer modifiers

use std::fmt;

/// DRM fourcc code
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FourCc(pub u32);

impl FourCc {
    pub const XRGB8888: FourCc = FourCc(0x34325258); // 'XR24'
    pub const ARGB8888: FourCc = FourCc(0x34325241); // 'AR24'
    pub const XBGR8888: FourCc = FourCc(0x34324258); // 'XB24'
    pub const ABGR8888: FourCc = FourCc(0x34324241); // 'AB24'
    pub const RGBA8888: FourCc = FourCc(0x34324152); // 'RA24'
    pub const BGRA8888: FourCc = FourCc(0x34324142); // 'BA24'
    pub const RGB565: FourCc = FourCc(0x36314752); // 'RG16'
    pub const ABGR2101010: FourCc = FourCc(0x30334241); // 'AB30'
    pub const NV12: FourCc = FourCc(0x3231564e); // 'NV12'
    pub const NV21: FourCc = FourCc(0x3132564e); // 'NV21'
    pub const P010: FourCc = FourCc(0x30313050); // 'P010'
    pub const C8: FourCc = FourCc(0x20203843); // 'C8  '

    /// Layout information, `None` for formats the engine cannot scan out
    pub fn info(self) -> Option<FormatInfo> {
        let info = match self {
            FourCc::XRGB8888
            | FourCc::ARGB8888
            | FourCc::XBGR8888
            | FourCc::ABGR8888
            | FourCc::RGBA8888
            | FourCc::BGRA8888
            | FourCc::ABGR2101010 => FormatInfo { bytes_per_pixel: 4, planes: 1 },
            FourCc::RGB565 => FormatInfo { bytes_per_pixel: 2, planes: 1 },
            FourCc::NV12 | FourCc::NV21 => FormatInfo { bytes_per_pixel: 1, planes: 2 },
            FourCc::P010 => FormatInfo { bytes_per_pixel: 2, planes: 2 },
            FourCc::C8 => FormatInfo { bytes_per_pixel: 1, planes: 1 },
            _ => return None,
        };
        Some(info)
    }
}

impl fmt::Debug for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.0.to_le_bytes();
        if bytes.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
            write!(f, "{}", String::from_utf8_lossy(&bytes).trim_end())
        } else {
            write!(f, "0x{:08x}", self.0)
        }
    }
}

/// Memory layout of a scanout format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatInfo {
    /// Bytes per pixel of the primary (luma or packed RGB) plane
    pub bytes_per_pixel: u32,
    /// Number of memory planes
    pub planes: u32,
}

impl FormatInfo {
    /// Bytes per row of the primary plane, `None` on overflow
    pub fn pitch(&self, width: u32) -> Option<u32> {
        width.checked_mul(self.bytes_per_pixel)
    }

    /// Byte length of the primary plane of a single-buffer multi-plane image
    pub fn primary_plane_len(&self, width: u32, height: u32) -> Option<u32> {
        self.pitch(width)?.checked_mul(height)
    }
}

/// Framebuffer modifiers
pub mod modifier {
    pub const LINEAR: u64 = 0;

    /// Vendor bit telling the display engine the buffer lives in protected
    /// memory
    pub const PROTECTION: u64 = 1 << 51;

    /// Vendor bit marking a solid colour framebuffer with no backing memory
    pub const COLORMAP: u64 = 1 << 52;
}
