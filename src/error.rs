//! Errors thrown by [`DrmDevice`](crate::DrmDevice) and the state-commit
//! entry points.

use std::io;
use std::path::PathBuf;

use drm::control::{connector, crtc, plane, Mode};

use crate::properties::PlaneKind;

/// Errors thrown by the kms backend
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The kernel does not report monotonic timestamps for vblank events
    #[error("The kernel does not support monotonic vblank timestamps")]
    MonotonicTimestampsUnsupported,
    /// The kernel does not expose universal planes
    #[error("The kernel does not support universal planes")]
    UniversalPlanesUnsupported,
    /// The device encountered an access error
    #[error(transparent)]
    Access(#[from] AccessError),
    /// Unable to determine the device id of the drm device
    #[error("Unable to determine the device id of the drm device")]
    UnableToGetDeviceId(#[source] rustix::io::Errno),
    /// The given configuration was rejected by the kernel's atomic test
    #[error("The given configuration was rejected by the kernel: {0}")]
    TestFailed(#[source] io::Error),
    /// The given crtc does not belong to this device
    #[error("Crtc `{0:?}` is unknown to this device")]
    UnknownCrtc(crtc::Handle),
    /// The given connector does not belong to this device
    #[error("Connector `{0:?}` is unknown to this device")]
    UnknownConnector(connector::Handle),
    /// The given crtc is already driven by another output
    #[error("Crtc `{0:?}` is already in use by another output")]
    CrtcAlreadyInUse(crtc::Handle),
    /// The given connector is already attached to another output
    #[error("Connector `{0:?}` is already in use by another output")]
    ConnectorAlreadyInUse(connector::Handle),
    /// This operation would result in an output without connectors
    #[error("Output on crtc `{0:?}` would have no connectors, which is not accepted")]
    SurfaceWithoutConnectors(crtc::Handle),
    /// The given plane cannot be driven by the given crtc
    #[error("Plane `{1:?}` is not compatible for use with crtc `{0:?}`")]
    PlaneNotCompatible(crtc::Handle, plane::Handle),
    /// The given plane is not of the kind required by its role on the output
    #[error("Plane `{0:?}` cannot be used as a {1:?} plane")]
    UnsuitablePlane(plane::Handle, PlaneKind),
    /// The mode is not supported by all connectors of the output
    #[error("Mode `{0:?}` is not supported by all connectors")]
    ModeNotSuitable(Mode),
    /// A property required to drive an object was not exposed by the kernel
    #[error("Unknown property `{name}` on object `{object}`")]
    UnknownProperty {
        /// Raw id of the object carrying the property
        object: u32,
        /// Canonical name of the property
        name: &'static str,
    },
    /// The gamma ramp size does not match the crtc's gamma size
    #[error("Gamma ramp of size {0} does not match the output's gamma size {1}")]
    GammaSizeMismatch(u32, u32),
    /// The plane's `IN_FORMATS` blob could not be parsed
    #[error("Plane IN_FORMATS blob is malformed")]
    InvalidFormatBlob,
}

/// Error message and device path
#[derive(Debug, thiserror::Error)]
#[error("Access error: {errmsg} on device `{dev:?}` ({source})")]
pub struct AccessError {
    /// Error message
    pub errmsg: &'static str,
    /// Device path of the drm device
    pub dev: Option<PathBuf>,
    /// Underlying error of the kernel interface
    pub source: io::Error,
}
