//! Outputs and the connectors that feed them.
//!
//! A [`DrmOutput`] bundles one crtc with one or more cloned connectors and
//! the planes assigned to it. The output owns the commit bookkeeping for
//! its crtc: the current and last applied states, the pending-completion
//! flags and the monotonic frame counter.

use std::sync::{Arc, Mutex, MutexGuard};

use drm::control::{connector, crtc, Device as ControlDevice, Mode};

use tracing::{debug, info_span, instrument};

use crate::device::{DeviceInner, DrmDeviceFd};
use crate::error::{AccessError, Error};
use crate::hdr::{HdrMetadata, HdrOutputMetadata};
use crate::plane::DrmPlane;
use crate::properties::{ConnectorProp, PanelOrientation, PropertyTable};
use crate::state::AppliedOutputState;
use crate::utils::{DevPath, OwnedBlob};

/// A physical output port of the device.
///
/// Cheaply cloneable handle; all clones refer to the same connector.
#[derive(Debug, Clone)]
pub struct DrmConnector {
    pub(crate) inner: Arc<ConnectorInner>,
}

#[derive(Debug)]
pub(crate) struct ConnectorInner {
    pub(crate) handle: connector::Handle,
    pub(crate) interface: connector::Interface,
    pub(crate) props: Mutex<PropertyTable<ConnectorProp>>,
    meta: Mutex<ConnectorMeta>,
}

#[derive(Debug, Default, Clone)]
struct ConnectorMeta {
    inherited_max_bpc: u64,
    non_desktop: bool,
    orientation: PanelOrientation,
    edid: Option<Vec<u8>>,
}

impl DrmConnector {
    pub(crate) fn discover(fd: &DrmDeviceFd, handle: connector::Handle) -> Result<Self, Error> {
        let info = fd.get_connector(handle, false).map_err(|source| {
            Error::Access(AccessError {
                errmsg: "Failed to get connector info",
                dev: fd.dev_path(),
                source,
            })
        })?;

        let conn = DrmConnector {
            inner: Arc::new(ConnectorInner {
                handle,
                interface: info.interface(),
                props: Mutex::new(PropertyTable::new()),
                meta: Mutex::new(ConnectorMeta::default()),
            }),
        };
        conn.refresh(fd)?;
        Ok(conn)
    }

    /// Re-read the connector's properties.
    ///
    /// Enum codes may change across a hotplug cycle, so this has to run
    /// every time the connector reappears. The property names are canonical
    /// and resolve to the same set of known properties.
    pub(crate) fn refresh(&self, fd: &DrmDeviceFd) -> Result<(), Error> {
        let props = fd.get_properties(self.inner.handle).map_err(|source| {
            Error::Access(AccessError {
                errmsg: "Failed to get connector properties",
                dev: fd.dev_path(),
                source,
            })
        })?;

        let mut table = self.inner.props.lock().unwrap();
        table.populate(fd, &props);

        let mut meta = self.inner.meta.lock().unwrap();
        meta.inherited_max_bpc = table.value(ConnectorProp::MaxBpc, &props, 0);
        meta.non_desktop = table.value(ConnectorProp::NonDesktop, &props, 0) != 0;
        meta.orientation = PanelOrientation::from_index(table.value(
            ConnectorProp::PanelOrientation,
            &props,
            PanelOrientation::Normal as u64,
        ))
        .unwrap_or_default();

        meta.edid = match table.value(ConnectorProp::Edid, &props, 0) {
            0 => None,
            blob_id => fd.get_property_blob(blob_id).ok(),
        };

        Ok(())
    }

    /// Handle of the connector
    pub fn handle(&self) -> connector::Handle {
        self.inner.handle
    }

    /// Interface type of the connector (HDMI, DP, ...)
    pub fn interface(&self) -> connector::Interface {
        self.inner.interface
    }

    /// Whether the connector drives a head-mounted or otherwise
    /// non-desktop display
    pub fn non_desktop(&self) -> bool {
        self.inner.meta.lock().unwrap().non_desktop
    }

    /// Mounting orientation of the panel
    pub fn panel_orientation(&self) -> PanelOrientation {
        self.inner.meta.lock().unwrap().orientation
    }

    /// The "max bpc" value the connector had when it was discovered. This
    /// is what gets re-programmed when no explicit value is requested.
    pub fn inherited_max_bpc(&self) -> u64 {
        self.inner.meta.lock().unwrap().inherited_max_bpc
    }

    /// The raw EDID blob of the connected display, if the kernel exposes
    /// one
    pub fn edid(&self) -> Option<Vec<u8>> {
        self.inner.meta.lock().unwrap().edid.clone()
    }
}

impl PartialEq for DrmConnector {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
impl Eq for DrmConnector {}

/// One crtc plus the connectors it drives.
///
/// Cheaply cloneable handle; all clones refer to the same output. Outputs
/// are turned off through a pending state with DPMS off, not by dropping
/// the handle; a dropped output leaves the hardware untouched until the
/// next state-invalid commit sweeps its crtc.
#[derive(Debug, Clone)]
pub struct DrmOutput {
    pub(crate) inner: Arc<OutputInner>,
}

#[derive(Debug)]
pub(crate) struct OutputInner {
    pub(crate) device: Arc<DeviceInner>,
    pub(crate) crtc: crtc::Handle,
    pub(crate) gamma_size: u32,
    pub(crate) primary_plane: DrmPlane,
    pub(crate) cursor_plane: Option<DrmPlane>,
    pub(crate) heads: Mutex<Vec<DrmConnector>>,
    pub(crate) progress: Mutex<OutputProgress>,
    pub(crate) span: tracing::Span,
}

#[derive(Debug)]
pub(crate) struct OutputProgress {
    pub(crate) mode: Mode,
    pub(crate) mode_blob: Option<OwnedBlob>,
    pub(crate) state_cur: AppliedOutputState,
    pub(crate) state_last: Option<AppliedOutputState>,
    pub(crate) page_flip_pending: bool,
    pub(crate) atomic_complete_pending: bool,
    pub(crate) msc: u64,
    pub(crate) max_bpc: u64,
    pub(crate) hdr_blob: Option<OwnedBlob>,
    pub(crate) pending_disable_heads: Vec<DrmConnector>,
    pub(crate) renderer_reset: bool,
}

impl OutputProgress {
    /// Fold the kernel's 32 bit frame sequence into the 64 bit media
    /// stream counter, accounting for wrap-around.
    pub(crate) fn update_msc(&mut self, seq: u32) {
        let mut msc_hi = self.msc >> 32;
        if u64::from(seq) < (self.msc & 0xffff_ffff) {
            msc_hi += 1;
        }
        self.msc = (msc_hi << 32) + u64::from(seq);
    }
}

impl DrmOutput {
    pub(crate) fn new(
        device: Arc<DeviceInner>,
        crtc: crtc::Handle,
        gamma_size: u32,
        mode: Mode,
        primary_plane: DrmPlane,
        cursor_plane: Option<DrmPlane>,
        heads: Vec<DrmConnector>,
    ) -> Self {
        let span = info_span!("drm_output", crtc = ?crtc);
        DrmOutput {
            inner: Arc::new(OutputInner {
                device,
                crtc,
                gamma_size,
                primary_plane,
                cursor_plane,
                heads: Mutex::new(heads),
                progress: Mutex::new(OutputProgress {
                    mode,
                    mode_blob: None,
                    state_cur: AppliedOutputState::default(),
                    state_last: None,
                    page_flip_pending: false,
                    atomic_complete_pending: false,
                    msc: 0,
                    max_bpc: 0,
                    hdr_blob: None,
                    pending_disable_heads: Vec::new(),
                    renderer_reset: false,
                }),
                span,
            }),
        }
    }

    /// The crtc driving this output
    pub fn crtc(&self) -> crtc::Handle {
        self.inner.crtc
    }

    /// The primary plane of the output
    pub fn primary_plane(&self) -> &DrmPlane {
        &self.inner.primary_plane
    }

    /// The cursor plane of the output, if one was assigned
    pub fn cursor_plane(&self) -> Option<&DrmPlane> {
        self.inner.cursor_plane.as_ref()
    }

    /// The connectors currently attached to the output
    pub fn heads(&self) -> Vec<DrmConnector> {
        self.inner.heads.lock().unwrap().clone()
    }

    /// The currently configured mode
    pub fn current_mode(&self) -> Mode {
        self.inner.progress.lock().unwrap().mode
    }

    /// The monotonic media stream counter of the output
    pub fn msc(&self) -> u64 {
        self.inner.progress.lock().unwrap().msc
    }

    /// Configure a new mode for the output.
    ///
    /// The mode takes effect with the next commit. The cached kernel blob
    /// of the previous mode is destroyed.
    #[instrument(parent = &self.inner.span, skip(self))]
    pub fn set_mode(&self, mode: Mode) -> Result<(), Error> {
        let fd = &self.inner.device.fd;
        for head in self.inner.heads.lock().unwrap().iter() {
            let info = fd.get_connector(head.handle(), false).map_err(|source| {
                Error::Access(AccessError {
                    errmsg: "Failed to get connector info",
                    dev: fd.dev_path(),
                    source,
                })
            })?;
            if !info.modes().contains(&mode) {
                return Err(Error::ModeNotSuitable(mode));
            }
        }

        let mut progress = self.inner.progress.lock().unwrap();
        progress.mode = mode;
        progress.mode_blob = None;
        Ok(())
    }

    /// Detach a connector from the output.
    ///
    /// The connector keeps showing the last frame until the next commit,
    /// which queues it for an explicit disable.
    #[instrument(parent = &self.inner.span, skip(self))]
    pub fn detach_head(&self, conn: connector::Handle) -> Result<(), Error> {
        let mut heads = self.inner.heads.lock().unwrap();
        if heads.len() == 1 && heads[0].handle() == conn {
            return Err(Error::SurfaceWithoutConnectors(self.inner.crtc));
        }
        let Some(pos) = heads.iter().position(|head| head.handle() == conn) else {
            return Ok(());
        };
        let head = heads.remove(pos);
        drop(heads);

        self.inner
            .progress
            .lock()
            .unwrap()
            .pending_disable_heads
            .push(head);
        Ok(())
    }

    /// Request a "max bpc" for the output's connectors. A value of zero
    /// re-programs each connector's inherited value; other values are
    /// clamped to the property's range at commit time.
    pub fn set_max_bpc(&self, max_bpc: u64) {
        self.inner.progress.lock().unwrap().max_bpc = max_bpc;
    }

    /// Set or clear the HDR static metadata of the output.
    ///
    /// The metadata is written to the connectors of this output with the
    /// next commit. Stale metadata on other outputs is cleaned up by the
    /// same commit.
    #[instrument(parent = &self.inner.span, skip_all)]
    pub fn set_hdr_metadata(&self, metadata: Option<&HdrMetadata>) -> Result<(), Error> {
        let fd = &self.inner.device.fd;
        let blob = match metadata {
            Some(metadata) => {
                let raw = HdrOutputMetadata::from(metadata);
                let value = fd.create_property_blob(&raw).map_err(|source| {
                    Error::Access(AccessError {
                        errmsg: "Failed to create HDR metadata blob",
                        dev: fd.dev_path(),
                        source,
                    })
                })?;
                Some(OwnedBlob::new(fd.clone(), value))
            }
            None => None,
        };

        debug!(cleared = metadata.is_none(), "updating hdr metadata");
        self.inner.progress.lock().unwrap().hdr_blob = blob;
        self.inner.device.request_hdr_cleanup();
        Ok(())
    }

    /// Program the legacy gamma ramp of the owning crtc.
    ///
    /// Gamma programming is out-of-band with commits; it is never part of
    /// a transaction.
    #[instrument(parent = &self.inner.span, skip_all)]
    pub fn set_gamma(&self, red: &[u16], green: &[u16], blue: &[u16]) -> Result<(), Error> {
        let size = red.len();
        if size != self.inner.gamma_size as usize || green.len() != size || blue.len() != size {
            return Err(Error::GammaSizeMismatch(size as u32, self.inner.gamma_size));
        }

        let fd = &self.inner.device.fd;
        fd.set_gamma(self.inner.crtc, red, green, blue)
            .map_err(|source| {
                Error::Access(AccessError {
                    errmsg: "Failed to set gamma",
                    dev: fd.dev_path(),
                    source,
                })
            })
    }

    /// Gamma ramp size of the owning crtc
    pub fn gamma_size(&self) -> u32 {
        self.inner.gamma_size
    }

    /// Returns `true` once after a failed legacy commit invalidated the
    /// renderer's surface. The compositor is expected to reinitialize its
    /// rendering state for this output before drawing the next frame.
    pub fn take_renderer_reset(&self) -> bool {
        std::mem::replace(
            &mut self.inner.progress.lock().unwrap().renderer_reset,
            false,
        )
    }

    pub(crate) fn progress(&self) -> MutexGuard<'_, OutputProgress> {
        self.inner.progress.lock().unwrap()
    }
}

impl PartialEq for DrmOutput {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
impl Eq for DrmOutput {}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress_with_msc(msc: u64) -> OutputProgress {
        OutputProgress {
            mode: unsafe { std::mem::zeroed() },
            mode_blob: None,
            state_cur: AppliedOutputState::default(),
            state_last: None,
            page_flip_pending: false,
            atomic_complete_pending: false,
            msc,
            max_bpc: 0,
            hdr_blob: None,
            pending_disable_heads: Vec::new(),
            renderer_reset: false,
        }
    }

    #[test]
    fn msc_tracks_kernel_sequence() {
        let mut progress = progress_with_msc(0);
        progress.update_msc(10);
        assert_eq!(progress.msc, 10);
        progress.update_msc(11);
        assert_eq!(progress.msc, 11);
    }

    #[test]
    fn msc_wraps_into_high_bits() {
        let mut progress = progress_with_msc(0xffff_ffff);
        progress.update_msc(0);
        assert_eq!(progress.msc, 0x1_0000_0000);
        progress.update_msc(1);
        assert_eq!(progress.msc, 0x1_0000_0001);
    }

    #[test]
    fn msc_is_monotonic_across_wraps() {
        let mut progress = progress_with_msc(0x2_ffff_fff0);
        let mut last = progress.msc;
        for seq in [0xffff_fff1u32, 0xffff_ffff, 0, 1, 2] {
            progress.update_msc(seq);
            assert!(progress.msc > last);
            last = progress.msc;
        }
    }
}
