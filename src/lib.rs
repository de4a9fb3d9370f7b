//! **drm-scanout** is the state-commit core of a kms display backend for
//! wayland compositors.
//!
//! The compositor decomposes each frame into per-plane configurations and
//! hands them to this crate as a [`PendingState`]; the crate translates the
//! transaction into either a single atomic commit ioctl or, on kernels
//! without atomic modesetting, an equivalent ordered sequence of legacy
//! ioctls, and reconciles the kernel's completion events back into
//! presentation feedback.
//!
//! ## How to use
//!
//! Open a drm node and wrap it in a [`DrmDeviceFd`], then create a
//! [`DrmDevice`]. The device probes the kernel's capabilities, discovers
//! crtcs, planes and connectors and caches every property id and enum code
//! the backend needs (the kernel assigns these dynamically; only the names
//! are stable).
//!
//! Create a [`DrmOutput`] per crtc you want to drive, with the connectors
//! and planes your plane-assignment policy selected. Each frame, build a
//! [`PendingState`], fill in one [`OutputState`] per output and a
//! [`PlaneState`] per plane, and submit it:
//!
//! - [`PendingState::test`] asks the kernel whether the configuration
//!   would be accepted, without side effects,
//! - [`PendingState::apply`] commits asynchronously; completion arrives
//!   through the event loop,
//! - [`PendingState::apply_sync`] disables outputs synchronously.
//!
//! Insert the [`DrmDevice`] into your [`calloop`] event loop to receive
//! [`DrmEvent::FrameComplete`] once a commit has reached the screen. Per
//! output, at most one commit may be in flight: wait for the completion
//! before applying the next state.
//!
//! Buffer allocation, rendering, hotplug detection and output layout are
//! the caller's business; this crate only consumes already-registered
//! [`DrmFramebuffer`]s and already-made plane assignments.

#![warn(missing_docs, missing_debug_implementations)]

mod atomic;
mod device;
mod error;
mod formats;
mod framebuffer;
mod hdr;
mod legacy;
mod output;
mod plane;
mod properties;
mod state;
mod utils;

pub use device::{
    Completions, DrmDevice, DrmDeviceFd, DrmEvent, FrameComplete, FrameFlags, KmsCaps,
};
pub use error::{AccessError, Error};
pub use formats::{FormatCatalog, FormatEntry};
pub use framebuffer::DrmFramebuffer;
pub use hdr::{Eotf, HdrMetadata};
pub use output::{DrmConnector, DrmOutput};
pub use plane::DrmPlane;
pub use properties::{
    ContentProtection, DpmsState, HdcpContentType, PanelOrientation, PlaneKind,
};
pub use state::{
    DamageClips, DamageRect, HdcpProtection, OutputState, PendingState, PlaneState,
};
pub use utils::DevPath;
