//! Wrapper around a kernel-registered framebuffer.

use std::sync::Arc;

use drm::buffer;
use drm::control::{framebuffer, Device as ControlDevice};
use drm_fourcc::DrmFormat;

use tracing::{trace, warn};

use crate::device::DrmDeviceFd;

/// A kernel-registered framebuffer.
///
/// Buffer allocation and import are the business of the caller; this type
/// only wraps the result of an `AddFB2` ioctl. The kernel framebuffer is
/// destroyed once the last reference is dropped, so plane states holding an
/// [`Arc`] of it keep it alive for as long as it might be scanned out.
#[derive(Debug)]
pub struct DrmFramebuffer {
    drm: DrmDeviceFd,
    fb: framebuffer::Handle,
    format: DrmFormat,
    strides: [u32; 4],
    size: (u32, u32),
    buffer: Option<buffer::Handle>,
}

impl DrmFramebuffer {
    /// Wrap an already registered framebuffer.
    ///
    /// `buffer` is the driver handle of the underlying buffer object. It is
    /// only needed for framebuffers attached to cursor planes, which the
    /// legacy interface updates by buffer handle rather than by framebuffer.
    pub fn new(
        drm: DrmDeviceFd,
        fb: framebuffer::Handle,
        format: DrmFormat,
        strides: [u32; 4],
        size: (u32, u32),
        buffer: Option<buffer::Handle>,
    ) -> Arc<Self> {
        Arc::new(DrmFramebuffer {
            drm,
            fb,
            format,
            strides,
            size,
            buffer,
        })
    }

    /// Handle of the kernel framebuffer
    pub fn handle(&self) -> framebuffer::Handle {
        self.fb
    }

    /// Format and modifier of the framebuffer
    pub fn format(&self) -> DrmFormat {
        self.format
    }

    /// Per-plane strides in bytes
    pub fn strides(&self) -> [u32; 4] {
        self.strides
    }

    /// Dimensions in pixels
    pub fn size(&self) -> (u32, u32) {
        self.size
    }

    pub(crate) fn buffer_handle(&self) -> Option<buffer::Handle> {
        self.buffer
    }
}

impl AsRef<framebuffer::Handle> for DrmFramebuffer {
    fn as_ref(&self) -> &framebuffer::Handle {
        &self.fb
    }
}

impl Drop for DrmFramebuffer {
    fn drop(&mut self) {
        trace!(fb = ?self.fb, "destroying framebuffer");
        if let Err(err) = self.drm.destroy_framebuffer(self.fb) {
            warn!(fb = ?self.fb, ?err, "failed to destroy framebuffer");
        }
    }
}

/// View of a framebuffer's underlying buffer object, as required by the
/// legacy cursor interface.
pub(crate) struct CursorBuffer<'a> {
    pub fb: &'a DrmFramebuffer,
    pub handle: buffer::Handle,
}

impl buffer::Buffer for CursorBuffer<'_> {
    fn size(&self) -> (u32, u32) {
        self.fb.size
    }

    fn format(&self) -> drm_fourcc::DrmFourcc {
        self.fb.format.code
    }

    fn pitch(&self) -> u32 {
        self.fb.strides[0]
    }

    fn handle(&self) -> buffer::Handle {
        self.handle
    }
}
