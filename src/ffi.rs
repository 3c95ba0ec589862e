//! Raw DRM uapi definitions
//!
//! Struct layouts and ioctl numbers from drm.h / drm_mode.h, limited to what
//! the engine issues: handle import/close, framebuffers, property blobs and
//! atomic commits. The sync_file info query used on retire fences lives here
//! too.

use std::mem::size_of;
use std::os::raw::{c_char, c_uint};

// DRM ioctl command numbers (from drm.h and drm_mode.h)
const DRM_IOCTL_BASE: libc::c_ulong = 0x64; // 'd'
const SYNC_IOC_MAGIC: libc::c_ulong = 0x3e; // '>'

// _IOC(dir, type, nr, size)
const fn ioc(dir: libc::c_ulong, ty: libc::c_ulong, nr: libc::c_ulong, size: usize) -> libc::c_ulong {
    (dir << 30) | (ty << 8) | nr | ((size as libc::c_ulong) << 16)
}

// Helper to build DRM ioctl numbers
const fn drm_iowr(nr: libc::c_ulong, size: usize) -> libc::c_ulong {
    // _IOC_READ|_IOC_WRITE
    ioc(3, DRM_IOCTL_BASE, nr, size)
}

const fn drm_iow(nr: libc::c_ulong, size: usize) -> libc::c_ulong {
    // _IOC_WRITE
    ioc(1, DRM_IOCTL_BASE, nr, size)
}

pub const DRM_IOCTL_GEM_CLOSE: libc::c_ulong = drm_iow(0x09, size_of::<DrmGemClose>());
pub const DRM_IOCTL_SET_CLIENT_CAP: libc::c_ulong = drm_iow(0x0d, size_of::<DrmSetClientCap>());
pub const DRM_IOCTL_PRIME_FD_TO_HANDLE: libc::c_ulong =
    drm_iowr(0x2e, size_of::<DrmPrimeHandle>());

// Mode setting ioctls (0xA0+)
pub const DRM_IOCTL_MODE_RMFB: libc::c_ulong = drm_iowr(0xaf, size_of::<c_uint>());
pub const DRM_IOCTL_MODE_ADDFB2: libc::c_ulong = drm_iowr(0xb8, size_of::<DrmModeFbCmd2>());
pub const DRM_IOCTL_MODE_ATOMIC: libc::c_ulong = drm_iowr(0xbc, size_of::<DrmModeAtomic>());
pub const DRM_IOCTL_MODE_CREATEPROPBLOB: libc::c_ulong =
    drm_iowr(0xbd, size_of::<DrmModeCreateBlob>());
pub const DRM_IOCTL_MODE_DESTROYPROPBLOB: libc::c_ulong =
    drm_iowr(0xbe, size_of::<DrmModeDestroyBlob>());

// sync_file query (from linux/sync_file.h)
pub const SYNC_IOC_FILE_INFO: libc::c_ulong = ioc(3, SYNC_IOC_MAGIC, 4, size_of::<SyncFileInfo>());

/// Client capabilities
pub const DRM_CLIENT_CAP_UNIVERSAL_PLANES: u64 = 2;
pub const DRM_CLIENT_CAP_ATOMIC: u64 = 3;

/// Mode flags and types used to classify timings
pub const DRM_MODE_TYPE_PREFERRED: u32 = 1 << 3;
pub const DRM_MODE_TYPE_VRR: u32 = 1 << 7;
pub const DRM_MODE_FLAG_TE_FREQ_X2: u32 = 1 << 27;
pub const DRM_MODE_FLAG_TE_FREQ_X4: u32 = 1 << 28;

// drm_gem_close struct
#[repr(C)]
pub struct DrmGemClose {
    pub handle: u32,
    pub pad: u32,
}

// drm_set_client_cap struct
#[repr(C)]
pub struct DrmSetClientCap {
    pub capability: u64,
    pub value: u64,
}

// drm_prime_handle struct
#[repr(C)]
pub struct DrmPrimeHandle {
    pub handle: u32,
    pub flags: u32,
    pub fd: i32,
}

// drm_mode_fb_cmd2 struct (for ADDFB2)
#[repr(C)]
pub struct DrmModeFbCmd2 {
    pub fb_id: u32,
    pub width: u32,
    pub height: u32,
    pub pixel_format: u32,
    pub flags: u32,
    pub handles: [u32; 4],
    pub pitches: [u32; 4],
    pub offsets: [u32; 4],
    pub modifier: [u64; 4],
}

// drm_mode_create_blob struct
#[repr(C)]
pub struct DrmModeCreateBlob {
    pub data: u64,
    pub length: u32,
    pub blob_id: u32,
}

// drm_mode_destroy_blob struct
#[repr(C)]
pub struct DrmModeDestroyBlob {
    pub blob_id: u32,
}

// drm_mode_atomic struct
#[repr(C)]
pub struct DrmModeAtomic {
    pub flags: u32,
    pub count_objs: u32,
    pub objs_ptr: u64,
    pub count_props_ptr: u64,
    pub props_ptr: u64,
    pub prop_values_ptr: u64,
    pub reserved: u64,
    pub user_data: u64,
}

// drm_mode_modeinfo struct, the payload of a MODE_ID blob
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct DrmModeModeinfo {
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
    pub type_: u32,
    pub name: [c_char; 32],
}

/// Size of `drm_mode_modeinfo` as the kernel expects it in a blob
pub const MODEINFO_SIZE: usize = 68;

impl DrmModeModeinfo {
    /// Serialize in native byte order, field by field
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MODEINFO_SIZE);
        out.extend_from_slice(&self.clock.to_ne_bytes());
        for v in [
            self.hdisplay,
            self.hsync_start,
            self.hsync_end,
            self.htotal,
            self.hskew,
            self.vdisplay,
            self.vsync_start,
            self.vsync_end,
            self.vtotal,
            self.vscan,
        ] {
            out.extend_from_slice(&v.to_ne_bytes());
        }
        out.extend_from_slice(&self.vrefresh.to_ne_bytes());
        out.extend_from_slice(&self.flags.to_ne_bytes());
        out.extend_from_slice(&self.type_.to_ne_bytes());
        out.extend(self.name.iter().map(|c| *c as u8));
        out
    }
}

// sync_fence_info struct
#[repr(C)]
#[derive(Clone, Copy)]
pub struct SyncFenceInfo {
    pub obj_name: [c_char; 32],
    pub driver_name: [c_char; 32],
    /// 1 signaled, 0 active, negative on error
    pub status: i32,
    pub flags: u32,
    pub timestamp_ns: u64,
}

impl Default for SyncFenceInfo {
    fn default() -> Self {
        Self {
            obj_name: [0; 32],
            driver_name: [0; 32],
            status: 0,
            flags: 0,
            timestamp_ns: 0,
        }
    }
}

// sync_file_info struct
#[repr(C)]
pub struct SyncFileInfo {
    pub name: [c_char; 32],
    pub status: i32,
    pub flags: u32,
    pub num_fences: u32,
    pub pad: u32,
    pub sync_fence_info: u64,
}

impl SyncFileInfo {
    pub fn new(num_fences: u32, sync_fence_info: u64) -> Self {
        Self {
            name: [0; 32],
            status: 0,
            flags: 0,
            num_fences,
            pad: 0,
            sync_fence_info,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_struct_sizes_match_kernel() {
        assert_eq!(size_of::<DrmModeFbCmd2>(), 104);
        assert_eq!(size_of::<DrmModeAtomic>(), 56);
        assert_eq!(size_of::<DrmModeCreateBlob>(), 16);
        assert_eq!(size_of::<DrmPrimeHandle>(), 12);
        assert_eq!(size_of::<DrmModeModeinfo>(), MODEINFO_SIZE);
        assert_eq!(DrmModeModeinfo::default().to_bytes().len(), MODEINFO_SIZE);
        assert_eq!(size_of::<SyncFileInfo>(), 56);
        assert_eq!(size_of::<SyncFenceInfo>(), 80);
    }

    #[test]
    fn test_ioctl_numbers() {
        // Values from the kernel headers
        assert_eq!(DRM_IOCTL_MODE_ATOMIC, 0xc03864bc);
        assert_eq!(DRM_IOCTL_MODE_ADDFB2, 0xc06864b8);
        assert_eq!(DRM_IOCTL_MODE_RMFB, 0xc00464af);
        assert_eq!(DRM_IOCTL_GEM_CLOSE, 0x40086409);
        assert_eq!(SYNC_IOC_FILE_INFO, 0xc0383e04);
    }
}
