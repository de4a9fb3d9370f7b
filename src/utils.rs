//! Small helpers shared across the crate.

use std::os::unix::io::{AsFd, AsRawFd};
use std::path::PathBuf;

use drm::control::Device as ControlDevice;

use tracing::warn;

use crate::device::DrmDeviceFd;

/// Trait representing open devices that *may* return a `Path`
pub trait DevPath {
    /// Returns the path of the open device if possible
    fn dev_path(&self) -> Option<PathBuf>;
}

impl<A: AsFd> DevPath for A {
    fn dev_path(&self) -> Option<PathBuf> {
        use std::fs;

        fs::read_link(format!("/proc/self/fd/{:?}", self.as_fd().as_raw_fd())).ok()
    }
}

/// A kernel property blob that is destroyed when dropped
#[derive(Debug)]
pub(crate) struct OwnedBlob {
    fd: DrmDeviceFd,
    id: u64,
}

impl OwnedBlob {
    pub fn new(fd: DrmDeviceFd, value: drm::control::property::Value<'static>) -> Self {
        OwnedBlob {
            fd,
            id: value.into(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for OwnedBlob {
    fn drop(&mut self) {
        if let Err(err) = self.fd.destroy_property_blob(self.id) {
            warn!(blob = self.id, ?err, "failed to destroy property blob");
        }
    }
}
