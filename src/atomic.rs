//! The atomic committer.
//!
//! Serializes a [`PendingState`] into a single atomic request and submits
//! it with TEST/ASYNC/SYNC semantics. All object configuration goes through
//! properties; the property ids and enum codes come out of the per-object
//! [`PropertyTable`](crate::properties::PropertyTable)s.

use std::sync::Arc;

use drm::control::atomic::AtomicModeReq;
use drm::control::{property, AtomicCommitFlags, Device as ControlDevice};

use tracing::{debug, trace, warn};

use crate::device::{synthesized_complete, Completions, DeviceInner, DrmCrtc};
use crate::error::{AccessError, Error};
use crate::output::{DrmConnector, OutputProgress};
use crate::properties::{ConnectorProp, CrtcProp, DpmsState, HdcpContentType, ObjectProps, PlaneKind, PlaneProp, RangeValues};
use crate::state::{promote, AppliedOutputState, OutputState, PendingState, PlaneState, PromoteMode};
use crate::utils::DevPath;

fn conn_prop(conn: &DrmConnector, prop: ConnectorProp) -> Result<property::Handle, Error> {
    conn.inner
        .props
        .lock()
        .unwrap()
        .prop(prop)
        .ok_or(Error::UnknownProperty {
            object: conn.inner.handle.into(),
            name: ConnectorProp::DEFS[prop.index()].name,
        })
}

fn crtc_prop(crtc: &DrmCrtc, prop: CrtcProp) -> Result<property::Handle, Error> {
    crtc.props.prop(prop).ok_or(Error::UnknownProperty {
        object: crtc.handle.into(),
        name: CrtcProp::DEFS[prop.index()].name,
    })
}

fn plane_prop(state: &PlaneState, prop: PlaneProp) -> Result<property::Handle, Error> {
    state
        .plane()
        .inner
        .props
        .prop(prop)
        .ok_or(Error::UnknownProperty {
            object: state.plane().handle().into(),
            name: PlaneProp::DEFS[prop.index()].name,
        })
}

/// Lazily create the kernel blob for the output's current mode, reusing a
/// previously created one.
fn ensure_mode_blob(device: &DeviceInner, progress: &mut OutputProgress) -> Result<u64, Error> {
    if let Some(blob) = &progress.mode_blob {
        return Ok(blob.id());
    }

    let value = device
        .fd
        .create_property_blob(&progress.mode)
        .map_err(|source| {
            Error::Access(AccessError {
                errmsg: "Failed to create property blob for mode",
                dev: device.fd.dev_path(),
                source,
            })
        })?;
    let blob = crate::utils::OwnedBlob::new(device.fd.clone(), value);
    let id = blob.id();
    progress.mode_blob = Some(blob);
    Ok(id)
}

/// Translate the desired protection into the connector's
/// `Content Protection` and `HDCP Content Type` properties.
///
/// The content-type property is not exposed on platforms without HDCP 2.2
/// support, in which case type-1 cannot be realised and nothing is
/// written; type-0 still works through the content-protection property
/// alone.
fn set_hdcp_property(
    req: &mut AtomicModeReq,
    conn: &DrmConnector,
    protection: crate::state::HdcpProtection,
) -> Result<(), Error> {
    let (drm_protection, content_type) = protection.to_kernel();

    let props = conn.inner.props.lock().unwrap();
    if !props.has(ConnectorProp::ContentProtection) {
        return Ok(());
    }
    if !props.has(ConnectorProp::HdcpContentType) && content_type != HdcpContentType::Type0 {
        return Ok(());
    }

    let Some(code) = props.enum_code(ConnectorProp::ContentProtection, drm_protection.index())
    else {
        warn!(connector = ?conn.inner.handle, "content protection value not exposed by the kernel");
        return Ok(());
    };
    let prop = props.prop(ConnectorProp::ContentProtection).ok_or(Error::UnknownProperty {
        object: conn.inner.handle.into(),
        name: "Content Protection",
    })?;
    req.add_property(conn.inner.handle, prop, property::Value::Unknown(code));

    if !props.has(ConnectorProp::HdcpContentType) {
        return Ok(());
    }
    let Some(code) = props.enum_code(ConnectorProp::HdcpContentType, content_type.index()) else {
        return Ok(());
    };
    let prop = props.prop(ConnectorProp::HdcpContentType).ok_or(Error::UnknownProperty {
        object: conn.inner.handle.into(),
        name: "HDCP Content Type",
    })?;
    req.add_property(conn.inner.handle, prop, property::Value::Unknown(code));

    Ok(())
}

/// Clamp a requested "max bpc" into the property's range. A requested
/// value of zero means the connector's inherited value must be
/// re-programmed.
fn clamp_max_bpc(requested: u64, inherited: u64, range: (u64, u64)) -> u64 {
    if requested == 0 {
        inherited
    } else {
        requested.clamp(range.0, range.1)
    }
}

fn set_max_bpc(
    req: &mut AtomicModeReq,
    conn: &DrmConnector,
    requested: u64,
) -> Result<(), Error> {
    let props = conn.inner.props.lock().unwrap();
    let Some(prop) = props.prop(ConnectorProp::MaxBpc) else {
        return Ok(());
    };
    let Some(RangeValues::Unsigned(min, max)) = props.stored_range(ConnectorProp::MaxBpc) else {
        return Ok(());
    };
    drop(props);

    let max_bpc = clamp_max_bpc(requested, conn.inherited_max_bpc(), (min, max));
    req.add_property(
        conn.inner.handle,
        prop,
        property::Value::UnsignedRange(max_bpc),
    );
    Ok(())
}

/// Serialize one output state into the request
fn output_request(
    device: &Arc<DeviceInner>,
    state: &OutputState,
    req: &mut AtomicModeReq,
    flags: &mut AtomicCommitFlags,
    test_only: bool,
) -> Result<(), Error> {
    let output = &state.output().inner;
    let crtc = device.crtc(output.crtc).ok_or(Error::UnknownProperty {
        object: u32::from(output.crtc),
        name: "CRTC",
    })?;
    let heads = output.heads.lock().unwrap().clone();
    let mut progress = output.progress.lock().unwrap();

    debug!(
        crtc = ?output.crtc,
        testing = test_only,
        dpms = ?state.dpms,
        "serializing output state"
    );

    if state.dpms != progress.state_cur.dpms {
        trace!("dpms state differs, modeset OK");
        *flags |= AtomicCommitFlags::ALLOW_MODESET;
    }

    if state.dpms == DpmsState::On {
        let blob_id = ensure_mode_blob(device, &mut progress)?;
        req.add_property(
            crtc.handle,
            crtc_prop(crtc, CrtcProp::ModeId)?,
            property::Value::Blob(blob_id),
        );
        req.add_property(
            crtc.handle,
            crtc_prop(crtc, CrtcProp::Active)?,
            property::Value::Boolean(true),
        );

        // No need for the DPMS property, it is implicit in routing and
        // crtc activity.
        for head in &heads {
            req.add_property(
                head.inner.handle,
                conn_prop(head, ConnectorProp::CrtcId)?,
                property::Value::CRTC(Some(crtc.handle)),
            );
        }

        if let Some(hdr_blob) = device.transient_hdr_blob() {
            for head in &heads {
                let props = head.inner.props.lock().unwrap();
                if let Some(prop) = props.prop(ConnectorProp::HdrOutputMetadata) {
                    req.add_property(
                        head.inner.handle,
                        prop,
                        property::Value::Blob(hdr_blob),
                    );
                    *flags |= AtomicCommitFlags::ALLOW_MODESET;
                }
            }
        }
    } else {
        req.add_property(
            crtc.handle,
            crtc_prop(crtc, CrtcProp::ModeId)?,
            property::Value::Unknown(0),
        );
        req.add_property(
            crtc.handle,
            crtc_prop(crtc, CrtcProp::Active)?,
            property::Value::Boolean(false),
        );

        for head in &heads {
            req.add_property(
                head.inner.handle,
                conn_prop(head, ConnectorProp::CrtcId)?,
                property::Value::CRTC(None),
            );
        }
        for head in progress.pending_disable_heads.drain(..) {
            req.add_property(
                head.inner.handle,
                conn_prop(&head, ConnectorProp::CrtcId)?,
                property::Value::CRTC(None),
            );
        }
    }

    for head in &heads {
        if device.hdcp_changed(state.protection) {
            set_hdcp_property(req, head, state.protection)?;
            *flags |= AtomicCommitFlags::ALLOW_MODESET;
        }

        if head.inner.props.lock().unwrap().has(ConnectorProp::HdrOutputMetadata)
            && device.hdr_cleanup_requested()
        {
            let blob_id = progress.hdr_blob.as_ref().map(|blob| blob.id()).unwrap_or(0);
            req.add_property(
                head.inner.handle,
                conn_prop(head, ConnectorProp::HdrOutputMetadata)?,
                property::Value::Blob(blob_id),
            );
            *flags |= AtomicCommitFlags::ALLOW_MODESET;
        }

        set_max_bpc(req, head, progress.max_bpc)?;
    }

    for plane_state in state.plane_states() {
        let plane = plane_state.plane();
        let fb = plane_state.framebuffer();

        req.add_property(
            plane.handle(),
            plane_prop(plane_state, PlaneProp::FbId)?,
            property::Value::Framebuffer(fb.map(|fb| fb.handle())),
        );
        req.add_property(
            plane.handle(),
            plane_prop(plane_state, PlaneProp::CrtcId)?,
            property::Value::CRTC(fb.map(|_| crtc.handle)),
        );
        req.add_property(
            plane.handle(),
            plane_prop(plane_state, PlaneProp::SrcX)?,
            property::Value::UnsignedRange(plane_state.src_x as u64),
        );
        req.add_property(
            plane.handle(),
            plane_prop(plane_state, PlaneProp::SrcY)?,
            property::Value::UnsignedRange(plane_state.src_y as u64),
        );
        req.add_property(
            plane.handle(),
            plane_prop(plane_state, PlaneProp::SrcW)?,
            property::Value::UnsignedRange(plane_state.src_w as u64),
        );
        req.add_property(
            plane.handle(),
            plane_prop(plane_state, PlaneProp::SrcH)?,
            property::Value::UnsignedRange(plane_state.src_h as u64),
        );
        req.add_property(
            plane.handle(),
            plane_prop(plane_state, PlaneProp::CrtcX)?,
            property::Value::SignedRange(plane_state.dest_x as i64),
        );
        req.add_property(
            plane.handle(),
            plane_prop(plane_state, PlaneProp::CrtcY)?,
            property::Value::SignedRange(plane_state.dest_y as i64),
        );
        req.add_property(
            plane.handle(),
            plane_prop(plane_state, PlaneProp::CrtcW)?,
            property::Value::UnsignedRange(plane_state.dest_w as u64),
        );
        req.add_property(
            plane.handle(),
            plane_prop(plane_state, PlaneProp::CrtcH)?,
            property::Value::UnsignedRange(plane_state.dest_h as u64),
        );

        if let Some(prop) = plane.inner.props.prop(PlaneProp::FbDamageClips) {
            let blob_id = plane_state
                .damage
                .as_ref()
                .map(|damage| damage.blob_id())
                .unwrap_or(0);
            req.add_property(plane.handle(), prop, property::Value::Blob(blob_id));
        }

        if let Some(fence) = &plane_state.in_fence {
            use std::os::unix::io::AsRawFd;
            req.add_property(
                plane.handle(),
                plane_prop(plane_state, PlaneProp::InFenceFd)?,
                property::Value::SignedRange(fence.as_raw_fd() as i64),
            );
        } else if let (Some(fence), PlaneKind::Primary, Some(_)) =
            (&state.render_fence, plane.kind(), fb)
        {
            use std::os::unix::io::AsRawFd;
            req.add_property(
                plane.handle(),
                plane_prop(plane_state, PlaneProp::InFenceFd)?,
                property::Value::SignedRange(fence.as_raw_fd() as i64),
            );
        }

        // invented zpos values come with a collapsed range and stay
        // untouched
        if let (Some(zpos), true) = (plane_state.zpos, plane.zpos_mutable()) {
            req.add_property(
                plane.handle(),
                plane_prop(plane_state, PlaneProp::Zpos)?,
                property::Value::UnsignedRange(zpos),
            );
        }
    }

    Ok(())
}

/// Serialize a whole pending state, including the disable preamble for
/// invalidated device state.
fn build_request(
    device: &Arc<DeviceInner>,
    outputs: &[OutputState],
    mut flags: AtomicCommitFlags,
    test_only: bool,
) -> Result<(AtomicModeReq, AtomicCommitFlags), Error> {
    let mut req = AtomicModeReq::new();

    if device.state_invalid() {
        debug!("previous state invalid; starting with fresh state");

        // If all state needs resetting (e.g. at start up or after a
        // VT switch-in), explicitly disable everything we aren't using.
        // Used objects get their defaults overridden further down.
        let claimed_connectors = device.claimed_connectors();
        for conn in device.connectors() {
            if claimed_connectors.contains(&conn.handle()) {
                continue;
            }
            trace!(connector = ?conn.handle(), "disabling inactive connector");
            req.add_property(
                conn.inner.handle,
                conn_prop(&conn, ConnectorProp::CrtcId)?,
                property::Value::CRTC(None),
            );
        }

        let claimed_crtcs = device.claimed_crtcs();
        for crtc in device.crtcs() {
            if claimed_crtcs.contains(&crtc.handle) {
                continue;
            }

            // The kernel refuses to generate an event for an off->off
            // transition, so only disable crtcs whose live ACTIVE
            // property reads as on.
            let props = device.fd.get_properties(crtc.handle).map_err(|source| {
                Error::Access(AccessError {
                    errmsg: "Failed to get crtc properties",
                    dev: device.fd.dev_path(),
                    source,
                })
            })?;
            if crtc.props.value(CrtcProp::Active, &props, 0) == 0 {
                continue;
            }

            trace!(crtc = ?crtc.handle, "disabling unused crtc");
            req.add_property(
                crtc.handle,
                crtc_prop(crtc, CrtcProp::Active)?,
                property::Value::Boolean(false),
            );
            req.add_property(
                crtc.handle,
                crtc_prop(crtc, CrtcProp::ModeId)?,
                property::Value::Unknown(0),
            );
        }

        // Disable all planes; planes in use get overridden by the
        // output states.
        for plane in device.planes() {
            let props = &plane.inner.props;
            if let Some(prop) = props.prop(PlaneProp::CrtcId) {
                req.add_property(plane.handle(), prop, property::Value::CRTC(None));
            }
            if let Some(prop) = props.prop(PlaneProp::FbId) {
                req.add_property(plane.handle(), prop, property::Value::Framebuffer(None));
            }
        }

        flags |= AtomicCommitFlags::ALLOW_MODESET;
    }

    for state in outputs {
        output_request(device, state, &mut req, &mut flags, test_only)?;
    }

    Ok((req, flags))
}

/// Submit a pending state with the TEST flag. Does not consume the state
/// and does not touch the device's invalid flag.
pub(crate) fn test(pending: &PendingState) -> Result<(), Error> {
    let device = &pending.device;
    let (req, flags) = build_request(
        device,
        &pending.outputs,
        AtomicCommitFlags::TEST_ONLY,
        true,
    )?;

    device.reassert_master();

    trace!("testing atomic state: {:?}", req);
    device
        .fd
        .atomic_commit(flags, req)
        .map_err(Error::TestFailed)
}

/// Commit a pending state. Consumes the state; on success all output
/// states are promoted and the invalid flag is cleared, on failure the
/// invalid flag escalates so the next commit starts from a fresh disable
/// preamble.
#[profiling::function]
pub(crate) fn apply(pending: PendingState, mode: PromoteMode) -> Result<Completions, Error> {
    let device = pending.device.clone();

    let flags = match mode {
        PromoteMode::Sync => AtomicCommitFlags::empty(),
        PromoteMode::Async => AtomicCommitFlags::PAGE_FLIP_EVENT | AtomicCommitFlags::NONBLOCK,
    };

    let result = build_request(&device, &pending.outputs, flags, false).and_then(|(req, flags)| {
        // An external session manager may have taken drm master away;
        // reassert it so the commit is not rejected outright. Failure is
        // not fatal, the commit below will surface the actual error.
        device.reassert_master();

        debug!(?flags, "committing atomic state");
        device.fd.atomic_commit(flags, req).map_err(|source| {
            Error::Access(AccessError {
                errmsg: "Atomic commit failed",
                dev: device.fd.dev_path(),
                source,
            })
        })
    });

    if let Err(err) = result {
        warn!("atomic: couldn't commit new state: {}", err);
        // Escalate: have the next commit emit the full disable preamble.
        device.mark_state_invalid();
        device.take_transient_hdr_blob();
        return Err(err);
    }

    let mut completions = Completions::new();
    for state in pending.outputs {
        let output = state.output.clone();
        let applied = AppliedOutputState {
            dpms: state.dpms,
            protection: state.protection,
            planes: state.planes,
        };
        let mut progress = output.progress();
        promote(&mut progress, applied, mode, true);
        if mode == PromoteMode::Sync {
            completions.push(synthesized_complete(output.crtc(), progress.msc));
        }
    }

    device.clear_state_invalid();
    device.finish_hdr_commit();

    Ok(completions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requested_zero_programs_the_inherited_max_bpc() {
        assert_eq!(clamp_max_bpc(0, 10, (6, 16)), 10);
    }

    #[test]
    fn out_of_range_max_bpc_is_clamped() {
        assert_eq!(clamp_max_bpc(4, 10, (6, 16)), 6);
        assert_eq!(clamp_max_bpc(18, 10, (6, 16)), 16);
        assert_eq!(clamp_max_bpc(12, 10, (6, 16)), 12);
    }
}
