//! The drm device: capability probing, resource discovery and the
//! page-flip event demultiplexer.
//!
//! A [`DrmDevice`] is created from an open drm node. On creation it probes
//! the kernel's capabilities (fatal if monotonic timestamps or universal
//! planes are missing), discovers all crtcs, planes and connectors and
//! populates their property tables.
//!
//! The device is a [`calloop::EventSource`]: once inserted into an event
//! loop it drains the kernel's page-flip events, routes each to the output
//! owning the event's crtc and yields a [`DrmEvent::FrameComplete`] with
//! presentation feedback.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use calloop::{EventSource, Interest, Poll, PostAction, Readiness, Token, TokenFactory};
use drm::control::{connector, crtc, Device as ControlDevice, Event, Mode, PageFlipEvent};
use drm::{ClientCapability, Device as BasicDevice, DriverCapability};

use smallvec::SmallVec;
use tracing::{debug, info, info_span, instrument, trace, warn};

mod fd;
pub use fd::DrmDeviceFd;

use crate::error::{AccessError, Error};
use crate::hdr::{HdrMetadata, HdrOutputMetadata};
use crate::output::{DrmConnector, DrmOutput, OutputInner};
use crate::plane::DrmPlane;
use crate::properties::{CrtcProp, PropertyTable};
use crate::state::{HdcpProtection, PendingState};
use crate::utils::{DevPath, OwnedBlob};

bitflags::bitflags! {
    /// How a frame completion was produced
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FrameFlags: u32 {
        /// The frame was presented at a vblank
        const VSYNC = 1 << 0;
        /// Completion was signalled by the hardware
        const HW_COMPLETION = 1 << 1;
        /// The timestamp was taken by the hardware clock
        const HW_CLOCK = 1 << 2;
    }
}

/// Presentation feedback for one completed commit
#[derive(Debug, Clone, Copy)]
pub struct FrameComplete {
    /// The crtc the commit completed on
    pub crtc: crtc::Handle,
    /// How the completion was produced
    pub flags: FrameFlags,
    /// Timestamp of the completion, on the monotonic clock
    pub time: Duration,
    /// The output's media stream counter at completion
    pub msc: u64,
}

/// Completions returned directly by the synchronous apply paths
pub type Completions = SmallVec<[FrameComplete; 2]>;

/// Synthesize a completion for a synchronously disabled output, stamped
/// with a fresh read of the monotonic clock.
pub(crate) fn synthesized_complete(crtc: crtc::Handle, msc: u64) -> FrameComplete {
    let now = rustix::time::clock_gettime(rustix::time::ClockId::Monotonic);
    FrameComplete {
        crtc,
        flags: FrameFlags::HW_COMPLETION,
        time: Duration::new(now.tv_sec as u64, now.tv_nsec as u32),
        msc,
    }
}

/// Events generated by a [`DrmDevice`]
#[derive(Debug)]
pub enum DrmEvent {
    /// A commit completed on the provided crtc
    FrameComplete(FrameComplete),
    /// An error happened while processing events
    Error(Error),
}

/// Kernel features discovered once per device opening
#[derive(Debug, Clone, Copy)]
pub struct KmsCaps {
    /// The kernel supports atomic modesetting and reports the crtc in
    /// vblank events
    pub atomic_modeset: bool,
    /// Framebuffers can be created with explicit format modifiers
    pub fb_modifiers: bool,
    /// Modes carry aspect-ratio information
    pub aspect_ratio_supported: bool,
    /// Writeback connectors are exposed
    pub writeback_supported: bool,
    /// Dimensions the cursor plane expects
    pub cursor_size: (u32, u32),
}

#[derive(Debug)]
pub(crate) struct DrmCrtc {
    pub(crate) handle: crtc::Handle,
    pub(crate) props: PropertyTable<CrtcProp>,
}

#[derive(Debug, Default)]
struct HdrCommitState {
    /// Transient metadata blob consumed by the next commit
    blob: Option<OwnedBlob>,
    /// Set while stale per-output metadata still needs re-programming
    clean: bool,
}

/// One-slot comparator for the desired protection, so unchanged commits
/// skip the content-protection property writes.
#[derive(Debug, Default)]
struct HdcpTracker {
    last: Option<HdcpProtection>,
}

impl HdcpTracker {
    fn update(&mut self, protection: HdcpProtection) -> bool {
        match self.last {
            None => {
                self.last = Some(protection);
                false
            }
            Some(last) if last != protection => {
                self.last = Some(protection);
                true
            }
            Some(_) => false,
        }
    }
}

#[derive(Debug)]
pub(crate) struct DeviceInner {
    pub(crate) fd: DrmDeviceFd,
    dev_id: u64,
    pub(crate) caps: KmsCaps,
    pub(crate) sprites_are_broken: bool,
    cursors_are_broken: AtomicBool,
    // Sticky: a commit constructed while this is set emits the full
    // disable preamble and allows modesets.
    state_invalid: AtomicBool,
    crtcs: Vec<DrmCrtc>,
    planes: Vec<DrmPlane>,
    connectors: Mutex<Vec<DrmConnector>>,
    outputs: Mutex<HashMap<crtc::Handle, Weak<OutputInner>>>,
    hdr: Mutex<HdrCommitState>,
    hdcp: Mutex<HdcpTracker>,
    pub(crate) span: tracing::Span,
}

impl DeviceInner {
    pub(crate) fn state_invalid(&self) -> bool {
        self.state_invalid.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_state_invalid(&self) {
        self.state_invalid.store(true, Ordering::SeqCst);
    }

    pub(crate) fn clear_state_invalid(&self) {
        self.state_invalid.store(false, Ordering::SeqCst);
    }

    pub(crate) fn cursors_broken(&self) -> bool {
        self.cursors_are_broken.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_cursors_broken(&self) {
        self.cursors_are_broken.store(true, Ordering::SeqCst);
    }

    pub(crate) fn crtc(&self, handle: crtc::Handle) -> Option<&DrmCrtc> {
        self.crtcs.iter().find(|crtc| crtc.handle == handle)
    }

    pub(crate) fn crtcs(&self) -> &[DrmCrtc] {
        &self.crtcs
    }

    pub(crate) fn planes(&self) -> &[DrmPlane] {
        &self.planes
    }

    pub(crate) fn connectors(&self) -> Vec<DrmConnector> {
        self.connectors.lock().unwrap().clone()
    }

    pub(crate) fn output_for_crtc(&self, crtc: crtc::Handle) -> Option<DrmOutput> {
        self.outputs
            .lock()
            .unwrap()
            .get(&crtc)
            .and_then(Weak::upgrade)
            .map(|inner| DrmOutput { inner })
    }

    /// Crtcs currently claimed by a live output
    pub(crate) fn claimed_crtcs(&self) -> HashSet<crtc::Handle> {
        let mut outputs = self.outputs.lock().unwrap();
        outputs.retain(|_, output| output.strong_count() > 0);
        outputs.keys().copied().collect()
    }

    /// Connectors currently attached to a live output
    pub(crate) fn claimed_connectors(&self) -> HashSet<connector::Handle> {
        self.outputs
            .lock()
            .unwrap()
            .values()
            .filter_map(Weak::upgrade)
            .flat_map(|output| {
                output
                    .heads
                    .lock()
                    .unwrap()
                    .iter()
                    .map(|head| head.handle())
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Reassert drm master authority. External session managers may have
    /// taken it; failure is left for the following commit to surface.
    pub(crate) fn reassert_master(&self) {
        let authenticated = self
            .fd
            .generate_auth_token()
            .and_then(|token| self.fd.authenticate_auth_token(token))
            .is_ok();
        if !authenticated {
            if let Err(err) = self.fd.acquire_master_lock() {
                debug!("failed to reassert drm master: {}", err);
            }
        }
    }

    pub(crate) fn hdcp_changed(&self, protection: HdcpProtection) -> bool {
        self.hdcp.lock().unwrap().update(protection)
    }

    pub(crate) fn transient_hdr_blob(&self) -> Option<u64> {
        self.hdr.lock().unwrap().blob.as_ref().map(|blob| blob.id())
    }

    pub(crate) fn hdr_cleanup_requested(&self) -> bool {
        self.hdr.lock().unwrap().clean
    }

    pub(crate) fn request_hdr_cleanup(&self) {
        self.hdr.lock().unwrap().clean = true;
    }

    /// Drop the transient blob without touching the cleanup flag, for
    /// failed commits.
    pub(crate) fn take_transient_hdr_blob(&self) {
        self.hdr.lock().unwrap().blob = None;
    }

    /// A commit that used the hdr state went through; the transient blob
    /// is spent and per-output metadata is in sync again.
    pub(crate) fn finish_hdr_commit(&self) {
        let mut hdr = self.hdr.lock().unwrap();
        hdr.blob = None;
        hdr.clean = false;
    }

    /// Route a page-flip event to the output owning its crtc.
    fn handle_page_flip(&self, event: PageFlipEvent) -> Option<FrameComplete> {
        let Some(output) = self.output_for_crtc(event.crtc) else {
            // The initial disable sweep turns off crtcs nothing drives;
            // their events have no owner.
            if self.caps.atomic_modeset {
                trace!(crtc = ?event.crtc, "page-flip event for unowned crtc");
            } else {
                warn!(crtc = ?event.crtc, "page-flip event for unknown output");
            }
            return None;
        };

        let mut progress = output.progress();
        progress.update_msc(event.frame);

        if self.caps.atomic_modeset {
            assert!(progress.atomic_complete_pending);
            progress.atomic_complete_pending = false;
        } else {
            assert!(progress.page_flip_pending);
            progress.page_flip_pending = false;
        }

        // The kernel no longer scans out of the previous state; release it
        // together with its framebuffers.
        let _last = progress.state_last.take();

        Some(FrameComplete {
            crtc: event.crtc,
            flags: FrameFlags::VSYNC | FrameFlags::HW_COMPLETION | FrameFlags::HW_CLOCK,
            time: event.duration,
            msc: progress.msc,
        })
    }
}

/// An open drm device
#[derive(Debug)]
pub struct DrmDevice {
    pub(crate) inner: Arc<DeviceInner>,
    token: Option<Token>,
}

impl DrmDevice {
    /// Create a new [`DrmDevice`] from an open drm node.
    ///
    /// Probes the kernel's capabilities and discovers all crtcs, planes
    /// and connectors. The device starts with invalid state: the first
    /// commit emits a full disable preamble for everything it does not
    /// drive.
    pub fn new(fd: DrmDeviceFd) -> Result<Self, Error> {
        let span = info_span!("drm_kms");
        let _guard = span.enter();
        info!("DrmDevice initializing");

        let dev_id = fd.dev_id().map_err(Error::UnableToGetDeviceId)?;
        let (caps, sprites_are_broken) = probe_caps(&fd)?;

        let resources = fd.resource_handles().map_err(|source| {
            Error::Access(AccessError {
                errmsg: "Error loading drm resources",
                dev: fd.dev_path(),
                source,
            })
        })?;

        let mut crtcs = Vec::with_capacity(resources.crtcs().len());
        for handle in resources.crtcs() {
            let props = fd.get_properties(*handle).map_err(|source| {
                Error::Access(AccessError {
                    errmsg: "Failed to get crtc properties",
                    dev: fd.dev_path(),
                    source,
                })
            })?;
            let mut table = PropertyTable::new();
            table.populate(&fd, &props);
            crtcs.push(DrmCrtc {
                handle: *handle,
                props: table,
            });
        }

        let plane_handles = fd.plane_handles().map_err(|source| {
            Error::Access(AccessError {
                errmsg: "Error loading planes",
                dev: fd.dev_path(),
                source,
            })
        })?;
        let mut planes = Vec::with_capacity(plane_handles.len());
        for handle in plane_handles {
            planes.push(DrmPlane::discover(
                &fd,
                handle,
                &resources,
                caps.fb_modifiers,
            )?);
        }

        let mut connectors = Vec::with_capacity(resources.connectors().len());
        for handle in resources.connectors() {
            connectors.push(DrmConnector::discover(&fd, *handle)?);
        }

        drop(_guard);
        Ok(DrmDevice {
            inner: Arc::new(DeviceInner {
                fd,
                dev_id,
                caps,
                sprites_are_broken,
                cursors_are_broken: AtomicBool::new(false),
                state_invalid: AtomicBool::new(true),
                crtcs,
                planes,
                connectors: Mutex::new(connectors),
                outputs: Mutex::new(HashMap::new()),
                hdr: Mutex::new(HdrCommitState::default()),
                hdcp: Mutex::new(HdcpTracker::default()),
                span,
            }),
            token: None,
        })
    }

    /// Returns if the underlying implementation uses atomic modesetting
    pub fn is_atomic(&self) -> bool {
        self.inner.caps.atomic_modeset
    }

    /// The capabilities discovered at device creation
    pub fn capabilities(&self) -> &KmsCaps {
        &self.inner.caps
    }

    /// Dimensions the cursor plane expects
    pub fn cursor_size(&self) -> (u32, u32) {
        self.inner.caps.cursor_size
    }

    /// Whether overlay planes cannot be driven safely on this device
    pub fn sprites_broken(&self) -> bool {
        self.inner.sprites_are_broken
    }

    /// Whether a cursor ioctl failed this session and cursor planes are
    /// suppressed
    pub fn cursors_broken(&self) -> bool {
        self.inner.cursors_broken()
    }

    /// The device id of the underlying drm node
    pub fn device_id(&self) -> u64 {
        self.inner.dev_id
    }

    /// Returns a reference to the underlying device fd
    pub fn device_fd(&self) -> DrmDeviceFd {
        self.inner.fd.clone()
    }

    /// Returns a list of crtcs of this device
    pub fn crtcs(&self) -> Vec<crtc::Handle> {
        self.inner.crtcs.iter().map(|crtc| crtc.handle).collect()
    }

    /// Returns the planes of this device
    pub fn planes(&self) -> &[DrmPlane] {
        &self.inner.planes
    }

    /// Returns the connectors of this device
    pub fn connectors(&self) -> Vec<DrmConnector> {
        self.inner.connectors()
    }

    /// Returns the connector with the given handle, if it exists
    pub fn connector(&self, handle: connector::Handle) -> Option<DrmConnector> {
        self.inner
            .connectors
            .lock()
            .unwrap()
            .iter()
            .find(|conn| conn.handle() == handle)
            .cloned()
    }

    /// Re-enumerate the device's connectors after a hotplug notification.
    ///
    /// Known connectors have their property tables re-populated (names are
    /// canonical, ids and enum codes may have changed), new ones are
    /// discovered and vanished ones are dropped.
    #[instrument(parent = &self.inner.span, skip(self))]
    pub fn rescan_connectors(&self) -> Result<(), Error> {
        let fd = &self.inner.fd;
        let resources = fd.resource_handles().map_err(|source| {
            Error::Access(AccessError {
                errmsg: "Error loading drm resources",
                dev: fd.dev_path(),
                source,
            })
        })?;

        let mut connectors = self.inner.connectors.lock().unwrap();
        connectors.retain(|conn| resources.connectors().contains(&conn.handle()));
        for handle in resources.connectors() {
            match connectors.iter().find(|conn| conn.handle() == *handle) {
                Some(conn) => conn.refresh(fd)?,
                None => connectors.push(DrmConnector::discover(fd, *handle)?),
            }
        }

        Ok(())
    }

    /// Create a new output driving `crtc`.
    ///
    /// The plane-assignment policy is the caller's: the output is created
    /// with the primary plane (and optionally cursor plane) the caller
    /// selected for the crtc.
    #[instrument(parent = &self.inner.span, skip(self, primary_plane, cursor_plane))]
    pub fn create_output(
        &self,
        crtc: crtc::Handle,
        mode: Mode,
        connectors: &[connector::Handle],
        primary_plane: &DrmPlane,
        cursor_plane: Option<&DrmPlane>,
    ) -> Result<DrmOutput, Error> {
        use crate::properties::PlaneKind;

        if connectors.is_empty() {
            return Err(Error::SurfaceWithoutConnectors(crtc));
        }
        if self.inner.crtc(crtc).is_none() {
            return Err(Error::UnknownCrtc(crtc));
        }
        if self.inner.claimed_crtcs().contains(&crtc) {
            return Err(Error::CrtcAlreadyInUse(crtc));
        }

        if primary_plane.kind() != PlaneKind::Primary {
            return Err(Error::UnsuitablePlane(
                primary_plane.handle(),
                PlaneKind::Primary,
            ));
        }
        if !primary_plane.supports_crtc(crtc) {
            return Err(Error::PlaneNotCompatible(crtc, primary_plane.handle()));
        }
        if let Some(cursor) = cursor_plane {
            if cursor.kind() != PlaneKind::Cursor {
                return Err(Error::UnsuitablePlane(cursor.handle(), PlaneKind::Cursor));
            }
            if !cursor.supports_crtc(crtc) {
                return Err(Error::PlaneNotCompatible(crtc, cursor.handle()));
            }
        }

        let claimed = self.inner.claimed_connectors();
        let mut heads = Vec::with_capacity(connectors.len());
        for handle in connectors {
            if claimed.contains(handle) {
                return Err(Error::ConnectorAlreadyInUse(*handle));
            }
            let conn = self
                .connector(*handle)
                .ok_or(Error::UnknownConnector(*handle))?;

            let info = self.inner.fd.get_connector(*handle, false).map_err(|source| {
                Error::Access(AccessError {
                    errmsg: "Error loading connector info",
                    dev: self.inner.fd.dev_path(),
                    source,
                })
            })?;
            if !info.modes().contains(&mode) {
                return Err(Error::ModeNotSuitable(mode));
            }

            heads.push(conn);
        }

        let gamma_size = self
            .inner
            .fd
            .get_crtc(crtc)
            .map_err(|source| {
                Error::Access(AccessError {
                    errmsg: "Error loading crtc info",
                    dev: self.inner.fd.dev_path(),
                    source,
                })
            })?
            .gamma_length();

        info!(?crtc, ?mode, ?connectors, "initializing output");
        let output = DrmOutput::new(
            self.inner.clone(),
            crtc,
            gamma_size,
            mode,
            primary_plane.clone(),
            cursor_plane.cloned(),
            heads,
        );
        self.inner
            .outputs
            .lock()
            .unwrap()
            .insert(crtc, Arc::downgrade(&output.inner));

        Ok(output)
    }

    /// Start a new, empty transaction against this device
    pub fn new_pending_state(&self) -> PendingState {
        PendingState::new(self.inner.clone())
    }

    /// Install transient HDR metadata, consumed by the next commit: the
    /// blob is written to the connectors of every lit output contained in
    /// that commit and destroyed afterwards.
    #[instrument(parent = &self.inner.span, skip_all)]
    pub fn set_hdr_metadata(&self, metadata: &HdrMetadata) -> Result<(), Error> {
        let raw = HdrOutputMetadata::from(metadata);
        let value = self.inner.fd.create_property_blob(&raw).map_err(|source| {
            Error::Access(AccessError {
                errmsg: "Failed to create HDR metadata blob",
                dev: self.inner.fd.dev_path(),
                source,
            })
        })?;
        self.inner.hdr.lock().unwrap().blob =
            Some(OwnedBlob::new(self.inner.fd.clone(), value));
        Ok(())
    }

    /// Invalidate the device state, e.g. after a VT switch-in.
    ///
    /// The next commit emits a full disable preamble for every crtc,
    /// connector and plane it does not drive, and allows modesets.
    pub fn mark_state_invalid(&self) {
        self.inner.mark_state_invalid();
    }

    /// Whether the next commit starts from invalidated state
    pub fn state_invalid(&self) -> bool {
        self.inner.state_invalid()
    }
}

/// Probe the kernel's capabilities, apply the environment overrides and
/// derive the feature flags gating the other components.
fn probe_caps(fd: &DrmDeviceFd) -> Result<(KmsCaps, bool), Error> {
    if fd
        .get_driver_capability(DriverCapability::MonotonicTimestamp)
        .unwrap_or(0)
        != 1
    {
        return Err(Error::MonotonicTimestampsUnsupported);
    }

    let cursor_width = fd
        .get_driver_capability(DriverCapability::CursorWidth)
        .unwrap_or(64) as u32;
    let cursor_height = fd
        .get_driver_capability(DriverCapability::CursorHeight)
        .unwrap_or(64) as u32;

    if fd
        .set_client_capability(ClientCapability::UniversalPlanes, true)
        .is_err()
    {
        return Err(Error::UniversalPlanesUnsupported);
    }

    let mut atomic_modeset = false;
    if std::env::var_os("WESTON_DISABLE_ATOMIC").is_none() {
        let crtc_in_vblank = fd
            .get_driver_capability(DriverCapability::CRTCInVBlankEvent)
            .unwrap_or(0)
            == 1;
        atomic_modeset = fd
            .set_client_capability(ClientCapability::Atomic, true)
            .is_ok()
            && crtc_in_vblank;
    }
    info!(
        "DRM: {} atomic modesetting",
        if atomic_modeset {
            "supports"
        } else {
            "does not support"
        }
    );

    let mut fb_modifiers = false;
    if std::env::var_os("WESTON_DISABLE_GBM_MODIFIERS").is_none() {
        fb_modifiers = fd
            .get_driver_capability(DriverCapability::AddFB2Modifiers)
            .unwrap_or(0)
            == 1;
    }
    info!(
        "DRM: {} framebuffer modifiers",
        if fb_modifiers {
            "supports"
        } else {
            "does not support"
        }
    );

    let writeback_supported = fd
        .set_client_capability(ClientCapability::WritebackConnectors, true)
        .is_ok();

    let aspect_ratio_supported = fd
        .set_client_capability(ClientCapability::AspectRatio, true)
        .is_ok();
    info!(
        "DRM: {} picture aspect ratio",
        if aspect_ratio_supported {
            "supports"
        } else {
            "does not support"
        }
    );

    // Hardware planes cannot synchronize properly without atomic commits:
    // updates would either tear or stall on extra vblanks. Cursors are
    // tolerable, so they stay enabled.
    let sprites_are_broken =
        !atomic_modeset || std::env::var_os("WESTON_FORCE_RENDERER").is_some();

    Ok((
        KmsCaps {
            atomic_modeset,
            fb_modifiers,
            aspect_ratio_supported,
            writeback_supported,
            cursor_size: (cursor_width, cursor_height),
        },
        sprites_are_broken,
    ))
}

impl EventSource for DrmDevice {
    type Event = DrmEvent;
    type Metadata = ();
    type Ret = ();
    type Error = io::Error;

    fn process_events<F>(
        &mut self,
        _: Readiness,
        token: Token,
        mut callback: F,
    ) -> Result<PostAction, Self::Error>
    where
        F: FnMut(Self::Event, &mut Self::Metadata) -> Self::Ret,
    {
        if Some(token) != self.token {
            return Ok(PostAction::Continue);
        }

        match self.inner.fd.receive_events() {
            Ok(events) => {
                for event in events {
                    match event {
                        Event::PageFlip(event) => {
                            trace!(crtc = ?event.crtc, "got a page-flip event");
                            if let Some(completion) = self.inner.handle_page_flip(event) {
                                callback(DrmEvent::FrameComplete(completion), &mut ());
                            }
                        }
                        _ => {
                            trace!(
                                "got a non-page-flip event of device '{:?}'",
                                self.inner.fd.dev_path()
                            );
                        }
                    }
                }
            }
            Err(source) => {
                callback(
                    DrmEvent::Error(Error::Access(AccessError {
                        errmsg: "Error processing drm events",
                        dev: self.inner.fd.dev_path(),
                        source,
                    })),
                    &mut (),
                );
            }
        }
        Ok(PostAction::Continue)
    }

    fn register(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> calloop::Result<()> {
        let token = factory.token();
        self.token = Some(token);
        unsafe { poll.register(&self.inner.fd, Interest::READ, calloop::Mode::Level, token) }
    }

    fn reregister(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> calloop::Result<()> {
        let token = factory.token();
        self.token = Some(token);
        poll.reregister(&self.inner.fd, Interest::READ, calloop::Mode::Level, token)
    }

    fn unregister(&mut self, poll: &mut Poll) -> calloop::Result<()> {
        self.token = None;
        poll.unregister(&self.inner.fd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_send<S: Send>() {}

    #[test]
    fn device_is_send() {
        is_send::<DrmDevice>();
        is_send::<DrmOutput>();
        is_send::<PendingState>();
    }

    #[test]
    fn hdcp_tracker_fires_once_per_change() {
        let mut tracker = HdcpTracker::default();
        // the first observation seeds the comparator
        assert!(!tracker.update(HdcpProtection::Disable));
        assert!(!tracker.update(HdcpProtection::Disable));
        assert!(tracker.update(HdcpProtection::Type0));
        assert!(!tracker.update(HdcpProtection::Type0));
        assert!(tracker.update(HdcpProtection::Type1));
        assert!(tracker.update(HdcpProtection::Disable));
    }

    #[test]
    fn synthesized_completions_are_hw_completion_only() {
        let crtc: crtc::Handle = drm::control::from_u32(1).unwrap();
        let completion = synthesized_complete(crtc, 7);
        assert_eq!(completion.flags, FrameFlags::HW_COMPLETION);
        assert_eq!(completion.msc, 7);
        assert!(!completion.flags.contains(FrameFlags::VSYNC));
    }
}
