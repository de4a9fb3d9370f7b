//! Pending state construction and promotion.
//!
//! The compositor describes one commit as a [`PendingState`]: a set of
//! [`OutputState`]s, each carrying the [`PlaneState`]s of the planes it
//! drives. A pending state is consumed exactly once by
//! [`apply`](PendingState::apply) or [`apply_sync`](PendingState::apply_sync);
//! [`test`](PendingState::test) only borrows it.
//!
//! On a successful commit every output state is *promoted*: it becomes the
//! output's current state, the previous current state either becomes the
//! *last* state (asynchronous commits, waiting for the completion event) or
//! is dropped right away (synchronous commits). Framebuffer lifetime rides
//! on the `Arc`s held by those states, so a buffer the kernel may still
//! scan out is never released early.

use std::os::unix::io::OwnedFd;
use std::sync::Arc;

use tracing::instrument;

use crate::device::{Completions, DeviceInner, DrmDeviceFd};
use crate::error::{AccessError, Error};
use crate::framebuffer::DrmFramebuffer;
use crate::output::{DrmOutput, OutputProgress};
use crate::plane::DrmPlane;
use crate::properties::{ContentProtection, DpmsState, HdcpContentType, PlaneKind};
use crate::utils::DevPath;
use crate::{atomic, legacy};

/// Requested content protection for an output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HdcpProtection {
    /// No content protection
    #[default]
    Disable,
    /// Protection for legacy type-0 content
    Type0,
    /// Protection for strict type-1 content
    Type1,
}

impl HdcpProtection {
    /// The kernel property values realising this protection level
    pub(crate) fn to_kernel(self) -> (ContentProtection, HdcpContentType) {
        match self {
            HdcpProtection::Disable => (ContentProtection::Undesired, HdcpContentType::Type0),
            HdcpProtection::Type0 => (ContentProtection::Desired, HdcpContentType::Type0),
            HdcpProtection::Type1 => (ContentProtection::Desired, HdcpContentType::Type1),
        }
    }
}

/// Damage rectangle in framebuffer coordinates, end-exclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct DamageRect {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

/// A kernel blob carrying the damage rectangles of one plane state, as
/// consumed by the `FB_DAMAGE_CLIPS` plane property.
#[derive(Debug)]
pub struct DamageClips {
    fd: DrmDeviceFd,
    blob: u64,
}

impl DamageClips {
    /// Upload a set of damage rectangles. Returns `None` for an empty set.
    pub fn from_rects(fd: &DrmDeviceFd, rects: &[DamageRect]) -> Result<Option<Self>, Error> {
        if rects.is_empty() {
            return Ok(None);
        }

        // struct drm_mode_rect
        let mut data = Vec::with_capacity(rects.len() * 16);
        for rect in rects {
            data.extend_from_slice(&rect.x1.to_ne_bytes());
            data.extend_from_slice(&rect.y1.to_ne_bytes());
            data.extend_from_slice(&rect.x2.to_ne_bytes());
            data.extend_from_slice(&rect.y2.to_ne_bytes());
        }

        let blob = drm_ffi::mode::create_property_blob(
            std::os::unix::io::AsFd::as_fd(fd),
            &mut data,
        )
        .map_err(|errno| {
            Error::Access(AccessError {
                errmsg: "Failed to create damage clips blob",
                dev: fd.dev_path(),
                source: errno,
            })
        })?;

        Ok(Some(DamageClips {
            fd: fd.clone(),
            blob: blob.blob_id as u64,
        }))
    }

    pub(crate) fn blob_id(&self) -> u64 {
        self.blob
    }
}

impl Drop for DamageClips {
    fn drop(&mut self) {
        use drm::control::Device as ControlDevice;
        let _ = self.fd.destroy_property_blob(self.blob);
    }
}

/// Desired configuration of one plane for one commit
#[derive(Debug)]
pub struct PlaneState {
    pub(crate) plane: DrmPlane,
    pub(crate) fb: Option<Arc<DrmFramebuffer>>,
    // source rectangle in 16.16 fixed point
    pub(crate) src_x: u32,
    pub(crate) src_y: u32,
    pub(crate) src_w: u32,
    pub(crate) src_h: u32,
    // destination rectangle in integer pixels
    pub(crate) dest_x: i32,
    pub(crate) dest_y: i32,
    pub(crate) dest_w: u32,
    pub(crate) dest_h: u32,
    pub(crate) in_fence: Option<OwnedFd>,
    pub(crate) zpos: Option<u64>,
    pub(crate) damage: Option<DamageClips>,
}

impl PlaneState {
    fn new(plane: DrmPlane) -> Self {
        PlaneState {
            plane,
            fb: None,
            src_x: 0,
            src_y: 0,
            src_w: 0,
            src_h: 0,
            dest_x: 0,
            dest_y: 0,
            dest_w: 0,
            dest_h: 0,
            in_fence: None,
            zpos: None,
            damage: None,
        }
    }

    /// The plane this state drives
    pub fn plane(&self) -> &DrmPlane {
        &self.plane
    }

    /// The framebuffer to scan out, or `None` to disable the plane
    pub fn framebuffer(&self) -> Option<&Arc<DrmFramebuffer>> {
        self.fb.as_ref()
    }

    /// Attach a framebuffer; `None` disables the plane
    pub fn set_framebuffer(&mut self, fb: Option<Arc<DrmFramebuffer>>) -> &mut Self {
        self.fb = fb;
        self
    }

    /// Set the source rectangle in pixels
    pub fn set_source(&mut self, x: u32, y: u32, w: u32, h: u32) -> &mut Self {
        self.set_source_fixed(x << 16, y << 16, w << 16, h << 16)
    }

    /// Set the source rectangle in 16.16 fixed point
    pub fn set_source_fixed(&mut self, x: u32, y: u32, w: u32, h: u32) -> &mut Self {
        self.src_x = x;
        self.src_y = y;
        self.src_w = w;
        self.src_h = h;
        self
    }

    /// Set the destination rectangle on the crtc in integer pixels
    pub fn set_destination(&mut self, x: i32, y: i32, w: u32, h: u32) -> &mut Self {
        self.dest_x = x;
        self.dest_y = y;
        self.dest_w = w;
        self.dest_h = h;
        self
    }

    /// Attach a fence the kernel waits on before scanning out the
    /// framebuffer
    pub fn set_in_fence(&mut self, fence: OwnedFd) -> &mut Self {
        self.in_fence = Some(fence);
        self
    }

    /// Request a stacking position. Only written to planes whose zpos
    /// range is mutable.
    pub fn set_zpos(&mut self, zpos: u64) -> &mut Self {
        self.zpos = Some(zpos);
        self
    }

    /// Attach the damage rectangles of this frame
    pub fn set_damage_clips(&mut self, damage: Option<DamageClips>) -> &mut Self {
        self.damage = damage;
        self
    }
}

/// Desired configuration of one output for one commit
#[derive(Debug)]
pub struct OutputState {
    pub(crate) output: DrmOutput,
    pub(crate) dpms: DpmsState,
    pub(crate) protection: HdcpProtection,
    pub(crate) planes: Vec<PlaneState>,
    pub(crate) render_fence: Option<OwnedFd>,
}

impl OutputState {
    fn new(output: DrmOutput) -> Self {
        OutputState {
            output,
            dpms: DpmsState::On,
            protection: HdcpProtection::Disable,
            planes: Vec::new(),
            render_fence: None,
        }
    }

    /// The output this state configures
    pub fn output(&self) -> &DrmOutput {
        &self.output
    }

    /// The desired power state
    pub fn dpms(&self) -> DpmsState {
        self.dpms
    }

    /// Set the desired power state. States applied through
    /// [`PendingState::apply_sync`] must be off.
    pub fn set_dpms(&mut self, dpms: DpmsState) -> &mut Self {
        self.dpms = dpms;
        self
    }

    /// Set the desired content protection
    pub fn set_protection(&mut self, protection: HdcpProtection) -> &mut Self {
        self.protection = protection;
        self
    }

    /// Attach a render fence, used as the in-fence of the primary plane
    /// when its state does not carry one of its own
    pub fn set_render_fence(&mut self, fence: OwnedFd) -> &mut Self {
        self.render_fence = Some(fence);
        self
    }

    /// The state of `plane` within this output state, creating an empty
    /// (disabling) state if the plane has none yet
    pub fn plane_state(&mut self, plane: &DrmPlane) -> &mut PlaneState {
        let idx = match self.planes.iter().position(|ps| ps.plane == *plane) {
            Some(idx) => idx,
            None => {
                self.planes.push(PlaneState::new(plane.clone()));
                self.planes.len() - 1
            }
        };
        &mut self.planes[idx]
    }

    /// The state of `plane` within this output state, if any
    pub fn existing_plane_state(&self, plane: &DrmPlane) -> Option<&PlaneState> {
        self.planes.iter().find(|ps| ps.plane == *plane)
    }

    /// All plane states of this output state
    pub fn plane_states(&self) -> &[PlaneState] {
        &self.planes
    }
}

/// An output state that has been handed to the kernel
#[derive(Debug, Default)]
pub(crate) struct AppliedOutputState {
    pub(crate) dpms: DpmsState,
    pub(crate) protection: HdcpProtection,
    pub(crate) planes: Vec<PlaneState>,
}

/// How a commit finishes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PromoteMode {
    /// The commit was fully processed when the ioctl returned
    Sync,
    /// The commit completes with an event
    Async,
}

/// Mark an output state as current on its output.
///
/// The previous current state is kept as the last state while an
/// asynchronous commit is in flight (the kernel may still scan out of its
/// framebuffers) and dropped otherwise. Each driven plane records the newly
/// committed framebuffer.
pub(crate) fn promote(
    progress: &mut OutputProgress,
    applied: AppliedOutputState,
    mode: PromoteMode,
    atomic: bool,
) {
    assert!(
        progress.state_last.is_none(),
        "state promoted while a previous commit is still in flight"
    );

    let mut page_flip = false;
    for plane_state in &applied.planes {
        plane_state.plane.set_committed_fb(plane_state.fb.clone());
        if mode == PromoteMode::Async && !atomic {
            debug_assert!(plane_state.plane.kind() != PlaneKind::Overlay);
            if plane_state.plane.kind() == PlaneKind::Primary {
                page_flip = true;
            }
        }
    }

    let previous = std::mem::replace(&mut progress.state_cur, applied);
    match mode {
        PromoteMode::Async => {
            progress.state_last = Some(previous);
            if atomic {
                progress.atomic_complete_pending = true;
            } else if page_flip {
                progress.page_flip_pending = true;
            }
        }
        PromoteMode::Sync => drop(previous),
    }

    debug_assert!(!(progress.page_flip_pending && progress.atomic_complete_pending));
}

/// One transaction against the device: the set of output configurations to
/// commit together.
#[derive(Debug)]
pub struct PendingState {
    pub(crate) device: Arc<DeviceInner>,
    pub(crate) outputs: Vec<OutputState>,
}

impl PendingState {
    pub(crate) fn new(device: Arc<DeviceInner>) -> Self {
        PendingState {
            device,
            outputs: Vec::new(),
        }
    }

    /// The state for `output` within this transaction, creating a fresh one
    /// (DPMS on, no planes) if the output has none yet
    pub fn output_state(&mut self, output: &DrmOutput) -> &mut OutputState {
        let idx = match self.outputs.iter().position(|os| os.output == *output) {
            Some(idx) => idx,
            None => {
                self.outputs.push(OutputState::new(output.clone()));
                self.outputs.len() - 1
            }
        };
        &mut self.outputs[idx]
    }

    /// All output states of this transaction
    pub fn output_states(&self) -> &[OutputState] {
        &self.outputs
    }

    /// Whether the transaction configures no outputs
    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    /// Ask the kernel whether it would accept this state, without side
    /// effects.
    ///
    /// Atomic kernels vet the request as if it were committed. A passing
    /// test is advisory: it ignores in-flight commits, so a subsequent
    /// apply can still fail on timing. Without atomic modesetting there is
    /// no way to check, so the test optimistically succeeds.
    #[instrument(parent = &self.device.span, skip(self))]
    pub fn test(&self) -> Result<(), Error> {
        if self.device.caps.atomic_modeset {
            atomic::test(self)
        } else {
            Ok(())
        }
    }

    /// Apply this state asynchronously: the primary entry point for
    /// committing state to the device.
    ///
    /// Completions for outputs that were disabled synchronously are
    /// returned directly; everything else completes through the device
    /// event source. Consumes the state and clears the device's
    /// state-invalid flag, even on failure.
    #[instrument(parent = &self.device.span, skip(self))]
    pub fn apply(self) -> Result<Completions, Error> {
        if self.device.caps.atomic_modeset {
            atomic::apply(self, PromoteMode::Async)
        } else {
            legacy::apply(self, false)
        }
    }

    /// The synchronous version of [`apply`](Self::apply). May only be used
    /// to disable outputs: every contained output state must be DPMS off.
    /// The request has completed when this returns, and the returned
    /// completions are synthesized from the monotonic clock.
    #[instrument(parent = &self.device.span, skip(self))]
    pub fn apply_sync(self) -> Result<Completions, Error> {
        for state in &self.outputs {
            assert!(
                state.dpms == DpmsState::Off,
                "apply_sync may only disable outputs"
            );
        }

        if self.device.caps.atomic_modeset {
            atomic::apply(self, PromoteMode::Sync)
        } else {
            legacy::apply(self, true)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::output::OutputProgress;

    fn empty_progress() -> OutputProgress {
        OutputProgress {
            mode: unsafe { std::mem::zeroed() },
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
        }
    }

    fn applied_with_planes(kinds: &[PlaneKind]) -> AppliedOutputState {
        AppliedOutputState {
            dpms: DpmsState::On,
            protection: HdcpProtection::Disable,
            planes: kinds
                .iter()
                .enumerate()
                .map(|(i, kind)| PlaneState::new(DrmPlane::fake(10 + i as u32, *kind)))
                .collect(),
        }
    }

    #[test]
    fn async_atomic_promotion_holds_last_state() {
        let mut progress = empty_progress();
        promote(
            &mut progress,
            applied_with_planes(&[PlaneKind::Primary]),
            PromoteMode::Async,
            true,
        );

        assert!(progress.atomic_complete_pending);
        assert!(!progress.page_flip_pending);
        assert!(progress.state_last.is_some());
        assert_eq!(progress.state_cur.dpms, DpmsState::On);
    }

    #[test]
    fn sync_promotion_frees_previous_state() {
        let mut progress = empty_progress();
        promote(
            &mut progress,
            applied_with_planes(&[PlaneKind::Primary]),
            PromoteMode::Sync,
            true,
        );

        assert!(!progress.atomic_complete_pending);
        assert!(!progress.page_flip_pending);
        assert!(progress.state_last.is_none());
    }

    #[test]
    fn legacy_promotion_flags_primary_flip_only() {
        let mut progress = empty_progress();
        promote(
            &mut progress,
            applied_with_planes(&[PlaneKind::Cursor]),
            PromoteMode::Async,
            false,
        );
        assert!(!progress.page_flip_pending);
        progress.state_last = None;

        promote(
            &mut progress,
            applied_with_planes(&[PlaneKind::Primary, PlaneKind::Cursor]),
            PromoteMode::Async,
            false,
        );
        assert!(progress.page_flip_pending);
        assert!(!progress.atomic_complete_pending);
    }

    #[test]
    #[should_panic(expected = "still in flight")]
    fn promotion_with_inflight_commit_is_a_contract_violation() {
        let mut progress = empty_progress();
        promote(
            &mut progress,
            applied_with_planes(&[PlaneKind::Primary]),
            PromoteMode::Async,
            true,
        );
        // the completion for the first commit never fired
        promote(
            &mut progress,
            applied_with_planes(&[PlaneKind::Primary]),
            PromoteMode::Async,
            true,
        );
    }

    #[test]
    fn hdcp_levels_map_to_kernel_values() {
        assert_eq!(
            HdcpProtection::Disable.to_kernel(),
            (ContentProtection::Undesired, HdcpContentType::Type0)
        );
        assert_eq!(
            HdcpProtection::Type0.to_kernel(),
            (ContentProtection::Desired, HdcpContentType::Type0)
        );
        assert_eq!(
            HdcpProtection::Type1.to_kernel(),
            (ContentProtection::Desired, HdcpContentType::Type1)
        );
    }
}
