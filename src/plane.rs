//! Plane discovery and bookkeeping.

use std::sync::{Arc, Mutex};

use drm::control::{crtc, plane, Device as ControlDevice};

use tracing::debug;

use crate::device::DrmDeviceFd;
use crate::error::{AccessError, Error};
use crate::formats::FormatCatalog;
use crate::framebuffer::DrmFramebuffer;
use crate::properties::{PlaneKind, PlaneProp, PropertyTable, RangeValues};
use crate::utils::DevPath;

/// A compositable plane of the device.
///
/// Cheaply cloneable handle; all clones refer to the same plane.
#[derive(Debug, Clone)]
pub struct DrmPlane {
    pub(crate) inner: Arc<PlaneInner>,
}

#[derive(Debug)]
pub(crate) struct PlaneInner {
    pub(crate) handle: plane::Handle,
    pub(crate) kind: PlaneKind,
    pub(crate) props: PropertyTable<PlaneProp>,
    pub(crate) formats: FormatCatalog,
    pub(crate) zpos: Option<(u64, u64)>,
    pub(crate) compatible_crtcs: Vec<crtc::Handle>,
    // What the kernel currently scans out of this plane. Updated on state
    // promotion; keeps the framebuffer alive together with the states that
    // reference it.
    committed_fb: Mutex<Option<Arc<DrmFramebuffer>>>,
}

impl DrmPlane {
    pub(crate) fn discover(
        fd: &DrmDeviceFd,
        handle: plane::Handle,
        resources: &drm::control::ResourceHandles,
        use_modifiers: bool,
    ) -> Result<Self, Error> {
        let info = fd.get_plane(handle).map_err(|source| {
            Error::Access(AccessError {
                errmsg: "Failed to get plane info",
                dev: fd.dev_path(),
                source,
            })
        })?;
        let compatible_crtcs = resources.filter_crtcs(info.possible_crtcs());
        let props = fd.get_properties(handle).map_err(|source| {
            Error::Access(AccessError {
                errmsg: "Failed to get plane properties",
                dev: fd.dev_path(),
                source,
            })
        })?;

        let mut table = PropertyTable::new();
        table.populate(fd, &props);

        // Universal planes are requested before discovery, so the kernel
        // exposes the type property on every plane. Anything unrecognized
        // is treated as an overlay.
        let kind = PlaneKind::from_index(table.value(
            PlaneProp::Type,
            &props,
            PlaneKind::Overlay as u64,
        ))
        .unwrap_or(PlaneKind::Overlay);

        let zpos = table
            .range_values(PlaneProp::Zpos, &props)
            .map(|range| match range {
                RangeValues::Unsigned(min, max) => (min, max),
                RangeValues::Signed(min, max) => (min.max(0) as u64, max.max(0) as u64),
            });

        let formats = Self::populate_formats(fd, &table, &info, &props, use_modifiers)?;

        debug!(
            ?handle,
            ?kind,
            ?zpos,
            formats = formats.formats().count(),
            "discovered plane"
        );

        Ok(DrmPlane {
            inner: Arc::new(PlaneInner {
                handle,
                kind,
                props: table,
                formats,
                zpos,
                compatible_crtcs,
                committed_fb: Mutex::new(None),
            }),
        })
    }

    /// Populates the plane's format catalog, using either the `IN_FORMATS`
    /// blob property (if available), or the plane's format list if not.
    fn populate_formats(
        fd: &DrmDeviceFd,
        table: &PropertyTable<PlaneProp>,
        info: &plane::Info,
        props: &drm::control::PropertyValueSet,
        use_modifiers: bool,
    ) -> Result<FormatCatalog, Error> {
        if use_modifiers {
            let blob_id = table.value(PlaneProp::InFormats, props, 0);
            if blob_id != 0 {
                if let Ok(data) = fd.get_property_blob(blob_id) {
                    return FormatCatalog::from_in_formats(&data);
                }
            }
        }

        Ok(FormatCatalog::from_format_list(info.formats()))
    }

    /// Handle of the plane
    pub fn handle(&self) -> plane::Handle {
        self.inner.handle
    }

    /// Kind of the plane
    pub fn kind(&self) -> PlaneKind {
        self.inner.kind
    }

    /// Formats and modifiers accepted by the plane
    pub fn formats(&self) -> &FormatCatalog {
        &self.inner.formats
    }

    /// The `(min, max)` zpos range of the plane, if it exposes one
    pub fn zpos_range(&self) -> Option<(u64, u64)> {
        self.inner.zpos
    }

    /// Whether the plane carries a mutable zpos. Planes without a zpos
    /// property or with a collapsed range cannot be restacked.
    pub fn zpos_mutable(&self) -> bool {
        self.inner
            .zpos
            .map(|(min, max)| min != max)
            .unwrap_or(false)
    }

    /// Whether the plane can be driven by the given crtc
    pub fn supports_crtc(&self, crtc: crtc::Handle) -> bool {
        self.inner.compatible_crtcs.contains(&crtc)
    }

    pub(crate) fn committed_fb(&self) -> Option<Arc<DrmFramebuffer>> {
        self.inner.committed_fb.lock().unwrap().clone()
    }

    pub(crate) fn set_committed_fb(&self, fb: Option<Arc<DrmFramebuffer>>) {
        *self.inner.committed_fb.lock().unwrap() = fb;
    }

    #[cfg(test)]
    pub(crate) fn fake(handle: u32, kind: PlaneKind) -> Self {
        DrmPlane {
            inner: Arc::new(PlaneInner {
                handle: drm::control::from_u32(handle).unwrap(),
                kind,
                props: PropertyTable::new(),
                formats: FormatCatalog::default(),
                zpos: None,
                compatible_crtcs: Vec::new(),
                committed_fb: Mutex::new(None),
            }),
        }
    }
}

impl PartialEq for DrmPlane {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
impl Eq for DrmPlane {}
