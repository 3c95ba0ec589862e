//! Kernel-backed [`KmsDevice`]
//!
//! Talks to a DRM card node with raw ioctls. Property discovery is not done
//! here; callers populate a [`crate::PropertyTable`] at start-up.

use crate::ffi::*;
use crate::kms::{FramebufferRequest, KmsDevice, PropertyWrite};
use crate::Result;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::raw::c_void;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, BorrowedFd, RawFd};
use std::path::Path;
use tracing::{debug, info, trace};

/// An opened DRM card node with atomic mode setting enabled
pub struct DrmDevice {
    file: File,
}

impl DrmDevice {
    /// Open a card node (e.g. `/dev/dri/card0`) and enable the client caps
    /// the engine relies on
    pub fn open(path: &Path) -> Result<Self> {
        info!("Opening DRM device {:?}", path);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(path)?;
        let device = Self { file };

        device.set_client_cap(DRM_CLIENT_CAP_UNIVERSAL_PLANES, 1)?;
        device.set_client_cap(DRM_CLIENT_CAP_ATOMIC, 1)?;

        Ok(device)
    }

    fn set_client_cap(&self, capability: u64, value: u64) -> io::Result<()> {
        let mut cap = DrmSetClientCap { capability, value };
        self.ioctl(DRM_IOCTL_SET_CLIENT_CAP, &mut cap as *mut _ as *mut c_void)
    }

    fn ioctl(&self, request: libc::c_ulong, arg: *mut c_void) -> io::Result<()> {
        ioctl(self.file.as_raw_fd(), request, arg)
    }
}

/// Issue an ioctl, restarting on EINTR/EAGAIN like libdrm's drmIoctl
fn ioctl(fd: RawFd, request: libc::c_ulong, arg: *mut c_void) -> io::Result<()> {
    loop {
        let ret = unsafe { libc::ioctl(fd, request as _, arg) };
        if ret == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) | Some(libc::EAGAIN) => continue,
            _ => return Err(err),
        }
    }
}

/// Signal time of a sync_file: the latest of its fences, `None` while any is
/// still active
pub fn sync_file_signal_time(fence: BorrowedFd<'_>) -> io::Result<Option<i64>> {
    let fd = fence.as_raw_fd();
    let mut info = SyncFileInfo::new(0, 0);
    ioctl(fd, SYNC_IOC_FILE_INFO, &mut info as *mut _ as *mut c_void)?;
    if info.status < 0 {
        return Err(io::Error::from_raw_os_error(-info.status));
    }
    if info.status == 0 {
        return Ok(None);
    }
    if info.num_fences == 0 {
        return Err(io::Error::from_raw_os_error(libc::EINVAL));
    }

    let mut fences = vec![SyncFenceInfo::default(); info.num_fences as usize];
    let mut info = SyncFileInfo::new(info.num_fences, fences.as_mut_ptr() as u64);
    ioctl(fd, SYNC_IOC_FILE_INFO, &mut info as *mut _ as *mut c_void)?;

    let mut signal_time = None;
    for fence in &fences[..(info.num_fences as usize).min(fences.len())] {
        if fence.status < 0 {
            return Err(io::Error::from_raw_os_error(-fence.status));
        }
        if fence.status == 0 {
            return Ok(None);
        }
        let ts = i64::try_from(fence.timestamp_ns).unwrap_or(i64::MAX);
        signal_time = Some(signal_time.map_or(ts, |latest: i64| latest.max(ts)));
    }
    trace!("sync_file {} signaled at {:?}", fd, signal_time);
    Ok(signal_time)
}

impl KmsDevice for DrmDevice {
    fn prime_fd_to_handle(&self, fd: RawFd) -> io::Result<u32> {
        let mut args = DrmPrimeHandle {
            handle: 0,
            flags: 0,
            fd,
        };
        self.ioctl(DRM_IOCTL_PRIME_FD_TO_HANDLE, &mut args as *mut _ as *mut c_void)?;
        trace!("Imported fd {} as GEM handle {}", fd, args.handle);
        Ok(args.handle)
    }

    fn gem_close(&self, handle: u32) -> io::Result<()> {
        let mut args = DrmGemClose { handle, pad: 0 };
        self.ioctl(DRM_IOCTL_GEM_CLOSE, &mut args as *mut _ as *mut c_void)
    }

    fn add_framebuffer(&self, request: &FramebufferRequest) -> io::Result<u32> {
        let mut cmd = DrmModeFbCmd2 {
            fb_id: 0,
            width: request.width,
            height: request.height,
            pixel_format: request.format.0,
            flags: request.flags,
            handles: request.handles,
            pitches: request.pitches,
            offsets: request.offsets,
            modifier: request.modifiers,
        };
        self.ioctl(DRM_IOCTL_MODE_ADDFB2, &mut cmd as *mut _ as *mut c_void)?;
        debug!(
            "Created framebuffer {}: {}x{} format={:?}",
            cmd.fb_id, request.width, request.height, request.format
        );
        Ok(cmd.fb_id)
    }

    fn remove_framebuffer(&self, fb_id: u32) -> io::Result<()> {
        let mut id: libc::c_uint = fb_id;
        self.ioctl(DRM_IOCTL_MODE_RMFB, &mut id as *mut _ as *mut c_void)
    }

    fn create_property_blob(&self, data: &[u8]) -> io::Result<u32> {
        let length = u32::try_from(data.len())
            .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
        let mut args = DrmModeCreateBlob {
            data: data.as_ptr() as u64,
            length,
            blob_id: 0,
        };
        self.ioctl(DRM_IOCTL_MODE_CREATEPROPBLOB, &mut args as *mut _ as *mut c_void)?;
        Ok(args.blob_id)
    }

    fn destroy_property_blob(&self, blob_id: u32) -> io::Result<()> {
        let mut args = DrmModeDestroyBlob { blob_id };
        self.ioctl(DRM_IOCTL_MODE_DESTROYPROPBLOB, &mut args as *mut _ as *mut c_void)
    }

    fn atomic_commit(&self, writes: &[PropertyWrite], flags: u32) -> io::Result<()> {
        let packed = PackedAtomic::new(writes);
        let mut args = DrmModeAtomic {
            flags,
            count_objs: packed.objs.len() as u32,
            objs_ptr: packed.objs.as_ptr() as u64,
            count_props_ptr: packed.count_props.as_ptr() as u64,
            props_ptr: packed.props.as_ptr() as u64,
            prop_values_ptr: packed.values.as_ptr() as u64,
            reserved: 0,
            user_data: 0,
        };
        self.ioctl(DRM_IOCTL_MODE_ATOMIC, &mut args as *mut _ as *mut c_void)
    }

    fn fence_signal_time(&self, fence: BorrowedFd<'_>) -> io::Result<Option<i64>> {
        sync_file_signal_time(fence)
    }
}

impl AsRawFd for DrmDevice {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

/// Property writes regrouped per object, the layout DRM_IOCTL_MODE_ATOMIC
/// expects
struct PackedAtomic {
    objs: Vec<u32>,
    count_props: Vec<u32>,
    props: Vec<u32>,
    values: Vec<u64>,
}

impl PackedAtomic {
    fn new(writes: &[PropertyWrite]) -> Self {
        // Objects keep the order of their first write
        let mut grouped: Vec<(u32, Vec<&PropertyWrite>)> = Vec::new();
        for write in writes {
            match grouped.iter_mut().find(|(obj, _)| *obj == write.object_id) {
                Some((_, list)) => list.push(write),
                None => grouped.push((write.object_id, vec![write])),
            }
        }

        let mut packed = Self {
            objs: Vec::with_capacity(grouped.len()),
            count_props: Vec::with_capacity(grouped.len()),
            props: Vec::with_capacity(writes.len()),
            values: Vec::with_capacity(writes.len()),
        };
        for (obj, list) in grouped {
            packed.objs.push(obj);
            packed.count_props.push(list.len() as u32);
            for write in list {
                packed.props.push(write.property_id);
                packed.values.push(write.value);
            }
        }
        packed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsFd;

    fn write(object_id: u32, property_id: u32, value: u64) -> PropertyWrite {
        PropertyWrite {
            object_id,
            property_id,
            value,
        }
    }

    #[test]
    fn test_atomic_packing_groups_by_object() {
        let writes = [
            write(10, 1, 100),
            write(20, 5, 7),
            write(10, 2, 200),
            write(30, 9, 0),
            write(20, 6, 8),
        ];
        let packed = PackedAtomic::new(&writes);

        assert_eq!(packed.objs, vec![10, 20, 30]);
        assert_eq!(packed.count_props, vec![2, 2, 1]);
        assert_eq!(packed.props, vec![1, 2, 5, 6, 9]);
        assert_eq!(packed.values, vec![100, 200, 7, 8, 0]);
    }

    #[test]
    fn test_signal_time_rejects_non_fence_fd() {
        let file = File::open("/dev/null").unwrap();
        assert!(sync_file_signal_time(file.as_fd()).is_err());
    }

    #[test]
    fn test_open_missing_node_fails() {
        assert!(DrmDevice::open(Path::new("/nonexistent/dri/card9")).is_err());
    }
}
