//! The legacy committer.
//!
//! Implements the same external contract as the atomic committer on
//! kernels without atomic modesetting, through an ordered sequence of
//! `SetCrtc`/`PageFlip`/`SetCursor` ioctls. The legacy interface can
//! neither scale nor clip nor fence the scanout plane, cannot drive
//! overlays safely, and has no way to test a configuration up front.

use drm::control::{connector, dumbbuffer::DumbBuffer, Device as ControlDevice, PageFlipFlags};

use smallvec::SmallVec;
use tracing::{info, trace, warn};

use crate::device::{synthesized_complete, Completions, DeviceInner, FrameComplete};
use crate::error::{AccessError, Error};
use crate::framebuffer::CursorBuffer;
use crate::output::OutputInner;
use crate::properties::{ConnectorProp, DpmsState};
use crate::state::{promote, AppliedOutputState, OutputState, PendingState, PromoteMode};
use crate::utils::DevPath;

/// Upper bound on the connectors one legacy `SetCrtc` can drive
pub(crate) const MAX_CLONED_CONNECTORS: usize = 4;

/// Apply a pending state through the legacy interface.
///
/// Output states that fail mid-sequence are recovered individually: their
/// current state is reset, the device state is invalidated and the
/// renderer is asked to reinitialize. The remaining outputs are still
/// applied.
#[profiling::function]
pub(crate) fn apply(pending: PendingState, sync: bool) -> Result<Completions, Error> {
    let device = pending.device.clone();

    if device.state_invalid() {
        // Explicitly disable all the crtcs we aren't using. This also
        // disables their connectors, so no separate connector pass is
        // needed with the pre-atomic interface.
        let claimed = device.claimed_crtcs();
        for crtc in device.crtcs() {
            if claimed.contains(&crtc.handle) {
                continue;
            }
            trace!(crtc = ?crtc.handle, "disabling unused crtc");
            if let Err(err) = device.fd.set_crtc(crtc.handle, None, (0, 0), &[], None) {
                warn!(crtc = ?crtc.handle, "failed to disable crtc: {}", err);
            }
        }
    }

    let mut completions = Completions::new();
    for state in pending.outputs {
        debug_assert!(!sync || state.dpms == DpmsState::Off);

        let output = state.output.clone();
        match apply_output(&device, state) {
            Ok(Some(completion)) => completions.push(completion),
            Ok(None) => {}
            Err(err) => {
                warn!(crtc = ?output.crtc(), "couldn't apply state: {}", err);
                // The framebuffer context may have been invalidated by the
                // partial commit; reset to a clean slate and have the
                // renderer start over.
                let mut progress = output.progress();
                progress.state_cur = AppliedOutputState::default();
                progress.renderer_reset = true;
                drop(progress);
                device.mark_state_invalid();
            }
        }
    }

    device.clear_state_invalid();

    Ok(completions)
}

fn apply_output(device: &DeviceInner, state: OutputState) -> Result<Option<FrameComplete>, Error> {
    let output = state.output.clone();
    let inner = &output.inner;
    let heads = inner.heads.lock().unwrap().clone();

    assert!(heads.len() <= MAX_CLONED_CONNECTORS);
    let connectors: SmallVec<[connector::Handle; MAX_CLONED_CONNECTORS]> =
        heads.iter().map(|head| head.handle()).collect();

    if state.dpms != DpmsState::On {
        if inner.cursor_plane.is_some() {
            #[allow(deprecated)]
            let result = device.fd.set_cursor(inner.crtc, Option::<&DumbBuffer>::None);
            if let Err(err) = result {
                warn!("set_cursor failed disabling: {}", err);
            }
        }

        if let Err(err) = device.fd.set_crtc(inner.crtc, None, (0, 0), &[], None) {
            warn!("set_crtc failed disabling: {}", err);
        }

        let applied = AppliedOutputState {
            dpms: state.dpms,
            protection: state.protection,
            planes: state.planes,
        };
        let mut progress = output.progress();
        promote(&mut progress, applied, PromoteMode::Sync, false);

        return Ok(Some(synthesized_complete(inner.crtc, progress.msc)));
    }

    let scanout = state
        .existing_plane_state(&inner.primary_plane)
        .expect("enabled output state without a state for the primary plane");

    // The legacy SetCrtc interface cannot scale, the legacy PageFlip
    // interface cannot clip, and neither supports fences.
    assert!(scanout.src_x == 0 && scanout.src_y == 0);
    assert!(scanout.dest_x == 0 && scanout.dest_y == 0);
    assert!(scanout.in_fence.is_none());

    let fb = scanout
        .fb
        .clone()
        .expect("enabled output state without a scanout framebuffer");

    let mut progress = output.progress();

    // A modeset is needed on the first commit after invalidation and
    // whenever the scanout buffer layout changed.
    let committed = inner.primary_plane.committed_fb();
    let needs_set_crtc = device.state_invalid()
        || committed
            .map(|committed| committed.strides()[0] != fb.strides()[0])
            .unwrap_or(true);

    if needs_set_crtc {
        info!(crtc = ?inner.crtc, mode = ?progress.mode.name(), "setting mode");
        device
            .fd
            .set_crtc(
                inner.crtc,
                Some(fb.handle()),
                (0, 0),
                &connectors,
                Some(progress.mode),
            )
            .map_err(|source| {
                Error::Access(AccessError {
                    errmsg: "Error setting crtc",
                    dev: device.fd.dev_path(),
                    source,
                })
            })?;
    }

    trace!(crtc = ?inner.crtc, "queueing page flip");
    device
        .fd
        .page_flip(inner.crtc, fb.handle(), PageFlipFlags::EVENT, None)
        .map_err(|source| {
            Error::Access(AccessError {
                errmsg: "Failed to queue page flip",
                dev: device.fd.dev_path(),
                source,
            })
        })?;

    assert!(!progress.page_flip_pending);

    update_cursor(device, inner, &state);

    if state.dpms != progress.state_cur.dpms {
        for head in &heads {
            let props = head.inner.props.lock().unwrap();
            let (Some(prop), Some(code)) = (
                props.prop(ConnectorProp::Dpms),
                props.enum_code(ConnectorProp::Dpms, state.dpms.index()),
            ) else {
                continue;
            };
            drop(props);

            trace!(connector = ?head.handle(), "setting DPMS to {:?}", state.dpms);
            if let Err(err) = device.fd.set_property(head.handle(), prop, code) {
                warn!(connector = ?head.handle(), "failed to set DPMS property: {}", err);
            }
        }
    }

    let applied = AppliedOutputState {
        dpms: state.dpms,
        protection: state.protection,
        planes: state.planes,
    };
    promote(&mut progress, applied, PromoteMode::Async, false);

    Ok(None)
}

/// Update the cursor plane through the dedicated legacy ioctls.
///
/// A failing cursor ioctl marks cursors as broken for the rest of the
/// session and hides the cursor, rather than failing the commit.
#[allow(deprecated)]
fn update_cursor(device: &DeviceInner, inner: &OutputInner, state: &OutputState) {
    let Some(plane) = &inner.cursor_plane else {
        return;
    };
    let Some(cursor_state) = state.existing_plane_state(plane) else {
        return;
    };

    let Some(fb) = &cursor_state.fb else {
        let _ = device.fd.set_cursor(inner.crtc, Option::<&DumbBuffer>::None);
        return;
    };

    if device.cursors_broken() {
        return;
    }

    let changed = plane
        .committed_fb()
        .map(|committed| !std::sync::Arc::ptr_eq(&committed, fb))
        .unwrap_or(true);

    let result = (|| {
        if changed {
            let Some(handle) = fb.buffer_handle() else {
                warn!("cursor framebuffer carries no buffer handle");
                return Err(());
            };
            let buffer = CursorBuffer { fb, handle };
            device.fd.set_cursor(inner.crtc, Some(&buffer)).map_err(|err| {
                warn!("failed to set cursor: {}", err);
            })?;
        }

        device
            .fd
            .move_cursor(inner.crtc, (cursor_state.dest_x, cursor_state.dest_y))
            .map_err(|err| {
                warn!("failed to move cursor: {}", err);
            })
    })();

    if result.is_err() {
        device.mark_cursors_broken();
        let _ = device.fd.set_cursor(inner.crtc, Option::<&DumbBuffer>::None);
    }
}
