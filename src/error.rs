//! Error types for the modeset engine

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Malformed buffer or format input. Caller error, never retried.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The kernel ran out of memory creating a framebuffer, handle or blob.
    #[error("kernel resources exhausted: {0}")]
    ResourceExhausted(String),

    #[error("property {name} is not supported by object {object_id}")]
    UnsupportedProperty { object_id: u32, name: String },

    /// Any commit rejection that is not a protected-content deferral.
    #[error("atomic commit failed: errno {errno}")]
    CommitFailed { errno: i32 },

    #[error("mode {0} is not available on this connector")]
    UnknownMode(u32),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("DRM error: {0}")]
    Drm(String),
}

impl Error {
    /// Classify a kernel error raised while creating an object (framebuffer,
    /// GEM handle, property blob).
    pub fn from_kernel(what: &str, err: io::Error) -> Self {
        match err.raw_os_error() {
            Some(libc::ENOMEM) | Some(libc::ENOSPC) => {
                Error::ResourceExhausted(format!("{}: {}", what, err))
            }
            Some(libc::EINVAL) => Error::InvalidConfiguration(format!("{}: {}", what, err)),
            _ => Error::Drm(format!("{}: {}", what, err)),
        }
    }

    /// Classify a kernel error returned by an atomic commit.
    pub fn from_commit(err: &io::Error) -> Self {
        match err.raw_os_error() {
            Some(libc::ENOMEM) => Error::ResourceExhausted(format!("atomic commit: {}", err)),
            Some(errno) => Error::CommitFailed { errno },
            None => Error::CommitFailed { errno: libc::EIO },
        }
    }

    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self, Error::ResourceExhausted(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_error_classification() {
        let oom = Error::from_kernel("addfb2", io::Error::from_raw_os_error(libc::ENOMEM));
        assert!(oom.is_resource_exhausted());

        let inval = Error::from_kernel("addfb2", io::Error::from_raw_os_error(libc::EINVAL));
        assert!(matches!(inval, Error::InvalidConfiguration(_)));

        let busy = Error::from_commit(&io::Error::from_raw_os_error(libc::EBUSY));
        assert!(matches!(busy, Error::CommitFailed { errno } if errno == libc::EBUSY));
    }
}
