//! Property registry.
//!
//! KMS exposes object configuration through named properties whose numeric
//! ids and enum codes are assigned by the driver at runtime. There is no
//! hardcoded constant for e.g. a primary plane type; the property has to be
//! queried to find the value associated with the string `"Primary"`.
//!
//! This module reduces that "strings plus dynamic enum codes" ABI to
//! compile-time enumerations: a [`PropertyTable`] caches, per object, the
//! kernel-assigned property id, the range bounds and the enum codes for
//! every property the backend is interested in. All call sites use the
//! compile-time enums; this is the only place that touches the raw ids.

use std::marker::PhantomData;

use drm::control::{property, Device as ControlDevice, PropertyValueSet};

use tracing::{trace, warn};

/// Kind of a plane, as exposed by the `"type"` plane property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PlaneKind {
    /// The primary plane, spanning the whole output
    Primary,
    /// An overlay plane, composited above the primary plane
    Overlay,
    /// A small sprite plane used for the cursor
    Cursor,
}

impl PlaneKind {
    pub(crate) const NAMES: &'static [&'static str] = &["Primary", "Overlay", "Cursor"];

    pub(crate) fn from_index(idx: u64) -> Option<Self> {
        match idx {
            0 => Some(PlaneKind::Primary),
            1 => Some(PlaneKind::Overlay),
            2 => Some(PlaneKind::Cursor),
            _ => None,
        }
    }
}

/// Display power management state of an output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DpmsState {
    /// The output is lit and scanning out
    On,
    /// Standby power saving
    Standby,
    /// Suspend power saving
    Suspend,
    /// The output is off
    #[default]
    Off,
}

impl DpmsState {
    pub(crate) const NAMES: &'static [&'static str] = &["On", "Standby", "Suspend", "Off"];

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

/// Kernel-side content protection state of a connector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentProtection {
    /// No protection is wanted
    Undesired,
    /// Protection has been requested but is not established yet
    Desired,
    /// Protection is established
    Enabled,
}

impl ContentProtection {
    pub(crate) const NAMES: &'static [&'static str] = &["Undesired", "Desired", "Enabled"];

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

/// HDCP content type of a connector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HdcpContentType {
    /// Legacy type-0 content
    Type0,
    /// Strict type-1 content, requiring HDCP 2.2
    Type1,
}

impl HdcpContentType {
    pub(crate) const NAMES: &'static [&'static str] = &["HDCP Type0", "HDCP Type1"];

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

/// Mounting orientation of the panel behind a connector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PanelOrientation {
    /// The panel is mounted upright
    #[default]
    Normal,
    /// The panel is mounted upside down
    UpsideDown,
    /// The panel is mounted with its left side up
    LeftSideUp,
    /// The panel is mounted with its right side up
    RightSideUp,
}

impl PanelOrientation {
    pub(crate) const NAMES: &'static [&'static str] =
        &["Normal", "Upside Down", "Left Side Up", "Right Side Up"];

    pub(crate) fn from_index(idx: u64) -> Option<Self> {
        match idx {
            0 => Some(PanelOrientation::Normal),
            1 => Some(PanelOrientation::UpsideDown),
            2 => Some(PanelOrientation::LeftSideUp),
            3 => Some(PanelOrientation::RightSideUp),
            _ => None,
        }
    }
}

/// Static description of a property the backend knows about
#[derive(Debug)]
pub(crate) struct PropertyDef {
    /// Canonical property name, stable across drivers
    pub name: &'static str,
    /// Known enum value names in internal variant order; empty for
    /// non-enum properties
    pub enum_names: &'static [&'static str],
}

const fn plain(name: &'static str) -> PropertyDef {
    PropertyDef {
        name,
        enum_names: &[],
    }
}

const fn enumerated(name: &'static str, enum_names: &'static [&'static str]) -> PropertyDef {
    PropertyDef { name, enum_names }
}

/// Trait implemented by the per-object-kind property enumerations
pub(crate) trait ObjectProps: Copy {
    const DEFS: &'static [PropertyDef];

    fn index(self) -> usize;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PlaneProp {
    Type,
    SrcX,
    SrcY,
    SrcW,
    SrcH,
    CrtcX,
    CrtcY,
    CrtcW,
    CrtcH,
    FbId,
    CrtcId,
    InFormats,
    InFenceFd,
    FbDamageClips,
    Zpos,
}

impl ObjectProps for PlaneProp {
    const DEFS: &'static [PropertyDef] = &[
        enumerated("type", PlaneKind::NAMES),
        plain("SRC_X"),
        plain("SRC_Y"),
        plain("SRC_W"),
        plain("SRC_H"),
        plain("CRTC_X"),
        plain("CRTC_Y"),
        plain("CRTC_W"),
        plain("CRTC_H"),
        plain("FB_ID"),
        plain("CRTC_ID"),
        plain("IN_FORMATS"),
        plain("IN_FENCE_FD"),
        plain("FB_DAMAGE_CLIPS"),
        plain("zpos"),
    ];

    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectorProp {
    Edid,
    Dpms,
    CrtcId,
    NonDesktop,
    ContentProtection,
    HdcpContentType,
    PanelOrientation,
    HdrOutputMetadata,
    MaxBpc,
}

impl ObjectProps for ConnectorProp {
    const DEFS: &'static [PropertyDef] = &[
        plain("EDID"),
        enumerated("DPMS", DpmsState::NAMES),
        plain("CRTC_ID"),
        plain("non-desktop"),
        enumerated("Content Protection", ContentProtection::NAMES),
        enumerated("HDCP Content Type", HdcpContentType::NAMES),
        enumerated("panel orientation", PanelOrientation::NAMES),
        plain("HDR_OUTPUT_METADATA"),
        plain("max bpc"),
    ];

    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CrtcProp {
    ModeId,
    Active,
}

impl ObjectProps for CrtcProp {
    const DEFS: &'static [PropertyDef] = &[plain("MODE_ID"), plain("ACTIVE")];

    fn index(self) -> usize {
        self as usize
    }
}

/// Range bounds of a `RANGE` or `SIGNED_RANGE` property
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RangeValues {
    Unsigned(u64, u64),
    Signed(i64, i64),
}

/// One slot per known enum value name; `valid` is set once the kernel
/// reported a code for the name.
#[derive(Debug, Clone, Copy, Default)]
struct EnumSlot {
    valid: bool,
    value: u64,
}

#[derive(Debug, Clone, Default)]
struct PropertyInfo {
    id: Option<property::Handle>,
    range: Option<RangeValues>,
    enums: Box<[EnumSlot]>,
}

/// Value shape of a property as reported by the kernel
#[derive(Debug, Clone)]
pub(crate) enum ValueShape {
    Plain,
    UnsignedRange(u64, u64),
    SignedRange(i64, i64),
    Enumerated(Vec<(String, u64)>),
}

/// A single property discovered on a KMS object
#[derive(Debug, Clone)]
pub(crate) struct DiscoveredProperty {
    pub id: property::Handle,
    pub name: String,
    pub shape: ValueShape,
}

/// Per-object cache of kernel-assigned property ids and enum codes
#[derive(Debug)]
pub(crate) struct PropertyTable<P: ObjectProps> {
    entries: Box<[PropertyInfo]>,
    _kind: PhantomData<P>,
}

impl<P: ObjectProps> Default for PropertyTable<P> {
    fn default() -> Self {
        PropertyTable::new()
    }
}

impl<P: ObjectProps> PropertyTable<P> {
    pub fn new() -> Self {
        let mut table = PropertyTable {
            entries: vec![PropertyInfo::default(); P::DEFS.len()].into_boxed_slice(),
            _kind: PhantomData,
        };
        table.clear();
        table
    }

    /// Release all cached ids and codes, leaving the table usable for a
    /// further [`populate`](Self::populate).
    pub fn clear(&mut self) {
        for (entry, def) in self.entries.iter_mut().zip(P::DEFS) {
            entry.id = None;
            entry.range = None;
            entry.enums = vec![EnumSlot::default(); def.enum_names.len()].into_boxed_slice();
        }
    }

    /// Populate the table from the raw properties of one object.
    ///
    /// Safe to re-invoke when the object's potential property values change,
    /// which currently only happens on connector hotplug.
    pub fn populate(&mut self, dev: &impl ControlDevice, props: &PropertyValueSet) {
        let (ids, _) = props.as_props_and_values();
        let discovered = ids.iter().filter_map(|id| {
            let info = dev.get_property(*id).ok()?;
            let name = info.name().to_str().ok()?.to_owned();
            let shape = match info.value_type() {
                property::ValueType::UnsignedRange(min, max) => ValueShape::UnsignedRange(*min, *max),
                property::ValueType::SignedRange(min, max) => ValueShape::SignedRange(*min, *max),
                property::ValueType::Enum(values) => {
                    let (_, enums) = values.values();
                    ValueShape::Enumerated(
                        enums
                            .iter()
                            .map(|v| (v.name().to_string_lossy().into_owned(), v.value()))
                            .collect(),
                    )
                }
                _ => ValueShape::Plain,
            };
            Some(DiscoveredProperty {
                id: *id,
                name,
                shape,
            })
        });
        self.populate_from(discovered);
    }

    /// Core of [`populate`](Self::populate), decoupled from the ioctl layer.
    pub fn populate_from(&mut self, discovered: impl Iterator<Item = DiscoveredProperty>) {
        self.clear();

        for prop in discovered {
            let Some(idx) = P::DEFS.iter().position(|def| def.name == prop.name) else {
                // We don't know/care about this property.
                trace!("unrecognized property {:?} '{}'", prop.id, prop.name);
                continue;
            };
            let def = &P::DEFS[idx];
            let entry = &mut self.entries[idx];

            let codes = match (&prop.shape, def.enum_names.is_empty()) {
                (ValueShape::Enumerated(_), true) => {
                    warn!(
                        "expected property '{}' to not be an enum, but it is; ignoring",
                        prop.name
                    );
                    continue;
                }
                (ValueShape::Enumerated(codes), false) => Some(codes),
                (_, false) => {
                    warn!(
                        "expected property '{}' to be an enum, but it is not; ignoring",
                        prop.name
                    );
                    continue;
                }
                (_, true) => None,
            };

            entry.id = Some(prop.id);
            entry.range = match &prop.shape {
                ValueShape::UnsignedRange(min, max) => Some(RangeValues::Unsigned(*min, *max)),
                ValueShape::SignedRange(min, max) => Some(RangeValues::Signed(*min, *max)),
                _ => None,
            };

            if let Some(codes) = codes {
                for (slot, name) in entry.enums.iter_mut().zip(def.enum_names) {
                    if let Some((_, value)) = codes.iter().find(|(n, _)| n == name) {
                        slot.valid = true;
                        slot.value = *value;
                    }
                }
            }
        }
    }

    /// The kernel-assigned id of a property, if the kernel exposes it
    pub fn prop(&self, p: P) -> Option<property::Handle> {
        self.entries[p.index()].id
    }

    pub fn has(&self, p: P) -> bool {
        self.prop(p).is_some()
    }

    /// The current value of a property within `props`, with enum codes
    /// translated back to the internal variant index. Returns `default` if
    /// the property is absent or an enum code has no internal variant.
    pub fn value(&self, p: P, props: &PropertyValueSet, default: u64) -> u64 {
        let (ids, values) = props.as_props_and_values();
        self.value_raw(p, ids, values, default)
    }

    pub fn value_raw(
        &self,
        p: P,
        ids: &[property::Handle],
        values: &[property::RawValue],
        default: u64,
    ) -> u64 {
        let entry = &self.entries[p.index()];
        let Some(id) = entry.id else {
            return default;
        };

        for (prop_id, raw) in ids.iter().zip(values) {
            if *prop_id != id {
                continue;
            }

            // Simple (non-enum) types can return the value directly
            if P::DEFS[p.index()].enum_names.is_empty() {
                return *raw;
            }

            // Map from raw code to the internal variant index
            if let Some(idx) = entry
                .enums
                .iter()
                .position(|slot| slot.valid && slot.value == *raw)
            {
                return idx as u64;
            }

            // We don't have a mapping for this code
            break;
        }

        default
    }

    /// The range bounds of a property, but only when the property is present
    /// in `props` and is a range
    pub fn range_values(&self, p: P, props: &PropertyValueSet) -> Option<RangeValues> {
        let (ids, _) = props.as_props_and_values();
        self.range_values_raw(p, ids)
    }

    pub fn range_values_raw(&self, p: P, ids: &[property::Handle]) -> Option<RangeValues> {
        let entry = &self.entries[p.index()];
        let id = entry.id?;
        if !ids.contains(&id) {
            return None;
        }
        entry.range
    }

    /// The range bounds recorded at population time, without re-querying
    /// the object
    pub fn stored_range(&self, p: P) -> Option<RangeValues> {
        self.entries[p.index()].range
    }

    /// The kernel code of an enum variant, if the kernel exposes the variant
    pub fn enum_code(&self, p: P, variant: usize) -> Option<u64> {
        let entry = &self.entries[p.index()];
        entry
            .enums
            .get(variant)
            .filter(|slot| slot.valid)
            .map(|slot| slot.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(raw: u32) -> property::Handle {
        drm::control::from_u32(raw).unwrap()
    }

    fn plane_type_prop(id: u32, codes: &[(&str, u64)]) -> DiscoveredProperty {
        DiscoveredProperty {
            id: handle(id),
            name: "type".into(),
            shape: ValueShape::Enumerated(
                codes.iter().map(|(n, v)| (n.to_string(), *v)).collect(),
            ),
        }
    }

    #[test]
    fn populate_matches_known_properties() {
        let mut table = PropertyTable::<PlaneProp>::new();
        table.populate_from(
            vec![
                plane_type_prop(7, &[("Primary", 101), ("Overlay", 102), ("Cursor", 103)]),
                DiscoveredProperty {
                    id: handle(8),
                    name: "FB_ID".into(),
                    shape: ValueShape::Plain,
                },
                DiscoveredProperty {
                    id: handle(9),
                    name: "no-such-property".into(),
                    shape: ValueShape::Plain,
                },
            ]
            .into_iter(),
        );

        assert_eq!(table.prop(PlaneProp::Type), Some(handle(7)));
        assert_eq!(table.prop(PlaneProp::FbId), Some(handle(8)));
        assert_eq!(table.prop(PlaneProp::CrtcId), None);
        assert_eq!(table.enum_code(PlaneProp::Type, 0), Some(101));
        assert_eq!(table.enum_code(PlaneProp::Type, 2), Some(103));
    }

    #[test]
    fn unmatched_enum_names_stay_invalid() {
        let mut table = PropertyTable::<PlaneProp>::new();
        table.populate_from(vec![plane_type_prop(7, &[("Primary", 1)])].into_iter());

        assert_eq!(table.enum_code(PlaneProp::Type, 0), Some(1));
        assert_eq!(table.enum_code(PlaneProp::Type, 1), None);
        assert_eq!(table.enum_code(PlaneProp::Type, 2), None);
    }

    #[test]
    fn type_mismatch_leaves_property_absent() {
        let mut table = PropertyTable::<PlaneProp>::new();
        table.populate_from(
            vec![
                // known enum exposed as non-enum
                DiscoveredProperty {
                    id: handle(7),
                    name: "type".into(),
                    shape: ValueShape::Plain,
                },
                // known non-enum exposed as enum
                DiscoveredProperty {
                    id: handle(8),
                    name: "FB_ID".into(),
                    shape: ValueShape::Enumerated(vec![("Bogus".into(), 1)]),
                },
            ]
            .into_iter(),
        );

        assert_eq!(table.prop(PlaneProp::Type), None);
        assert_eq!(table.prop(PlaneProp::FbId), None);
    }

    #[test]
    fn repopulate_is_idempotent() {
        let mut table = PropertyTable::<ConnectorProp>::new();
        let before = vec![
            DiscoveredProperty {
                id: handle(20),
                name: "CRTC_ID".into(),
                shape: ValueShape::Plain,
            },
            DiscoveredProperty {
                id: handle(21),
                name: "DPMS".into(),
                shape: ValueShape::Enumerated(vec![
                    ("On".into(), 0),
                    ("Standby".into(), 1),
                    ("Suspend".into(), 2),
                    ("Off".into(), 3),
                ]),
            },
        ];
        table.populate_from(before.into_iter());
        assert_eq!(table.prop(ConnectorProp::CrtcId), Some(handle(20)));

        // Hotplug may hand out new codes; names are canonical.
        let after = vec![
            DiscoveredProperty {
                id: handle(30),
                name: "CRTC_ID".into(),
                shape: ValueShape::Plain,
            },
            DiscoveredProperty {
                id: handle(31),
                name: "DPMS".into(),
                shape: ValueShape::Enumerated(vec![("On".into(), 7), ("Off".into(), 9)]),
            },
        ];
        table.populate_from(after.into_iter());

        assert_eq!(table.prop(ConnectorProp::CrtcId), Some(handle(30)));
        assert_eq!(table.prop(ConnectorProp::Dpms), Some(handle(31)));
        assert_eq!(
            table.enum_code(ConnectorProp::Dpms, DpmsState::On.index()),
            Some(7)
        );
        assert_eq!(
            table.enum_code(ConnectorProp::Dpms, DpmsState::Standby.index()),
            None
        );
        assert_eq!(table.prop(ConnectorProp::Edid), None);
    }

    #[test]
    fn value_translates_enum_codes() {
        let mut table = PropertyTable::<PlaneProp>::new();
        table.populate_from(
            vec![plane_type_prop(
                7,
                &[("Primary", 101), ("Overlay", 102), ("Cursor", 103)],
            )]
            .into_iter(),
        );

        let ids = [handle(7)];
        assert_eq!(table.value_raw(PlaneProp::Type, &ids, &[103], 0), 2);
        assert_eq!(
            PlaneKind::from_index(table.value_raw(PlaneProp::Type, &ids, &[101], 1)),
            Some(PlaneKind::Primary)
        );
        // unknown code falls back to the caller-supplied default
        assert_eq!(table.value_raw(PlaneProp::Type, &ids, &[999], 1), 1);
    }

    #[test]
    fn value_returns_default_when_absent() {
        let table = PropertyTable::<PlaneProp>::new();
        assert_eq!(table.value_raw(PlaneProp::FbId, &[], &[], 42), 42);
    }

    #[test]
    fn range_values_only_for_ranges() {
        let mut table = PropertyTable::<ConnectorProp>::new();
        table.populate_from(
            vec![
                DiscoveredProperty {
                    id: handle(5),
                    name: "max bpc".into(),
                    shape: ValueShape::UnsignedRange(6, 16),
                },
                DiscoveredProperty {
                    id: handle(6),
                    name: "CRTC_ID".into(),
                    shape: ValueShape::Plain,
                },
            ]
            .into_iter(),
        );

        assert_eq!(
            table.range_values_raw(ConnectorProp::MaxBpc, &[handle(5)]),
            Some(RangeValues::Unsigned(6, 16))
        );
        // not part of the queried props
        assert_eq!(table.range_values_raw(ConnectorProp::MaxBpc, &[handle(6)]), None);
        // not a range
        assert_eq!(table.range_values_raw(ConnectorProp::CrtcId, &[handle(6)]), None);
    }

    #[test]
    fn clear_resets_for_repopulation() {
        let mut table = PropertyTable::<CrtcProp>::new();
        table.populate_from(
            vec![DiscoveredProperty {
                id: handle(3),
                name: "ACTIVE".into(),
                shape: ValueShape::Plain,
            }]
            .into_iter(),
        );
        assert!(table.has(CrtcProp::Active));

        table.clear();
        assert!(!table.has(CrtcProp::Active));
        assert_eq!(table.value_raw(CrtcProp::Active, &[handle(3)], &[1], 0), 0);
    }
}
