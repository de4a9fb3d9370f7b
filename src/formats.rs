//! Per-plane format and modifier discovery.
//!
//! The preferred path walks the plane's `IN_FORMATS` blob, which enumerates
//! every `(format, modifier)` pair the plane accepts. Planes on kernels
//! without the blob (or with modifier support disabled) fall back to the
//! plane's plain format list with a single linear modifier per format.

use drm_fourcc::{DrmFormat, DrmFourcc, DrmModifier};

use crate::error::Error;

/// A single format with all modifiers the plane accepts for it
#[derive(Debug, Clone)]
pub struct FormatEntry {
    /// Fourcc code of the format
    pub code: DrmFourcc,
    /// Accepted modifiers for the format
    pub modifiers: Vec<DrmModifier>,
}

/// The set of formats and modifiers accepted by one plane
#[derive(Debug, Clone, Default)]
pub struct FormatCatalog {
    entries: Vec<FormatEntry>,
}

impl FormatCatalog {
    /// Parse an `IN_FORMATS` blob.
    ///
    /// Fails on malformed blobs without exposing a partial catalog.
    pub(crate) fn from_in_formats(data: &[u8]) -> Result<Self, Error> {
        use std::mem::size_of;

        if data.len() < size_of::<drm_ffi::drm_format_modifier_blob>() {
            return Err(Error::InvalidFormatBlob);
        }

        // The blob comes out of the kernel with no alignment guarantees,
        // so always copy using `read_unaligned` instead of taking slices.
        let header = unsafe {
            (data.as_ptr() as *const drm_ffi::drm_format_modifier_blob).read_unaligned()
        };

        let formats_len = (header.count_formats as usize).checked_mul(size_of::<u32>());
        let modifiers_len =
            (header.count_modifiers as usize).checked_mul(size_of::<drm_ffi::drm_format_modifier>());
        let formats_end = formats_len.and_then(|l| (header.formats_offset as usize).checked_add(l));
        let modifiers_end =
            modifiers_len.and_then(|l| (header.modifiers_offset as usize).checked_add(l));
        match (formats_end, modifiers_end) {
            (Some(f), Some(m)) if f <= data.len() && m <= data.len() => {}
            _ => return Err(Error::InvalidFormatBlob),
        }

        let mut entries: Vec<FormatEntry> = Vec::with_capacity(header.count_formats as usize);
        unsafe {
            let formats_ptr =
                data.as_ptr().add(header.formats_offset as usize) as *const u32;
            let modifiers_ptr = data.as_ptr().add(header.modifiers_offset as usize)
                as *const drm_ffi::drm_format_modifier;

            for i in 0..header.count_modifiers as usize {
                let mod_info = modifiers_ptr.add(i).read_unaligned();
                for bit in 0..64u32 {
                    if mod_info.formats & (1u64 << bit) == 0 {
                        continue;
                    }
                    let index = mod_info.offset as usize + bit as usize;
                    if index >= header.count_formats as usize {
                        return Err(Error::InvalidFormatBlob);
                    }
                    let raw = formats_ptr.add(index).read_unaligned();
                    let Ok(code) = DrmFourcc::try_from(raw) else {
                        continue;
                    };
                    add_pair(&mut entries, code, DrmModifier::from(mod_info.modifier));
                }
            }
        }

        Ok(FormatCatalog { entries })
    }

    /// Build a catalog from a plane's plain format list, attaching a single
    /// linear modifier per format
    pub(crate) fn from_format_list(formats: &[u32]) -> Self {
        let mut entries = Vec::with_capacity(formats.len());
        for raw in formats {
            if let Ok(code) = DrmFourcc::try_from(*raw) {
                add_pair(&mut entries, code, DrmModifier::Linear);
            }
        }
        FormatCatalog { entries }
    }

    /// All formats accepted by the plane
    pub fn formats(&self) -> impl Iterator<Item = DrmFourcc> + '_ {
        self.entries.iter().map(|entry| entry.code)
    }

    /// The modifiers accepted for a format, if the format is accepted at all
    pub fn modifiers(&self, code: DrmFourcc) -> Option<&[DrmModifier]> {
        self.entries
            .iter()
            .find(|entry| entry.code == code)
            .map(|entry| entry.modifiers.as_slice())
    }

    /// Whether the plane accepts the exact format and modifier pair
    pub fn supports(&self, format: DrmFormat) -> bool {
        self.modifiers(format.code)
            .map(|mods| mods.contains(&format.modifier))
            .unwrap_or(false)
    }
}

fn add_pair(entries: &mut Vec<FormatEntry>, code: DrmFourcc, modifier: DrmModifier) {
    match entries.iter_mut().find(|entry| entry.code == code) {
        Some(entry) => {
            if !entry.modifiers.contains(&modifier) {
                entry.modifiers.push(modifier);
            }
        }
        None => entries.push(FormatEntry {
            code,
            modifiers: vec![modifier],
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const XRGB8888: u32 = 0x34325258;
    const ARGB8888: u32 = 0x34325241;

    fn push_u32(data: &mut Vec<u8>, v: u32) {
        data.extend_from_slice(&v.to_ne_bytes());
    }

    fn push_u64(data: &mut Vec<u8>, v: u64) {
        data.extend_from_slice(&v.to_ne_bytes());
    }

    // Layout of struct drm_format_modifier_blob: a 24 byte header followed
    // by the format array and the modifier array.
    fn build_blob(formats: &[u32], modifiers: &[(u64, u32, u64)]) -> Vec<u8> {
        let mut data = Vec::new();
        let formats_offset = 24u32;
        let modifiers_offset = formats_offset + 4 * formats.len() as u32;
        push_u32(&mut data, 1); // version
        push_u32(&mut data, 0); // flags
        push_u32(&mut data, formats.len() as u32);
        push_u32(&mut data, formats_offset);
        push_u32(&mut data, modifiers.len() as u32);
        push_u32(&mut data, modifiers_offset);
        for fmt in formats {
            push_u32(&mut data, *fmt);
        }
        for (mask, offset, modifier) in modifiers {
            push_u64(&mut data, *mask);
            push_u32(&mut data, *offset);
            push_u32(&mut data, 0); // pad
            push_u64(&mut data, *modifier);
        }
        data
    }

    #[test]
    fn parses_in_formats_blob() {
        const LINEAR: u64 = 0;
        const INTEL_X_TILED: u64 = (1 << 56) | 1;

        let blob = build_blob(
            &[XRGB8888, ARGB8888],
            &[(0b11, 0, LINEAR), (0b01, 0, INTEL_X_TILED)],
        );
        let catalog = FormatCatalog::from_in_formats(&blob).unwrap();

        let xrgb = catalog.modifiers(DrmFourcc::Xrgb8888).unwrap();
        assert_eq!(
            xrgb,
            &[DrmModifier::Linear, DrmModifier::from(INTEL_X_TILED)]
        );
        let argb = catalog.modifiers(DrmFourcc::Argb8888).unwrap();
        assert_eq!(argb, &[DrmModifier::Linear]);
        assert!(catalog.supports(DrmFormat {
            code: DrmFourcc::Xrgb8888,
            modifier: DrmModifier::from(INTEL_X_TILED),
        }));
        assert!(!catalog.supports(DrmFormat {
            code: DrmFourcc::Argb8888,
            modifier: DrmModifier::from(INTEL_X_TILED),
        }));
    }

    #[test]
    fn truncated_blob_is_rejected() {
        let blob = build_blob(&[XRGB8888], &[(0b1, 0, 0)]);
        assert!(FormatCatalog::from_in_formats(&blob[..blob.len() - 4]).is_err());
        assert!(FormatCatalog::from_in_formats(&blob[..8]).is_err());
    }

    #[test]
    fn out_of_range_format_index_is_rejected() {
        // modifier references format slot 1, but only one format is present
        let blob = build_blob(&[XRGB8888], &[(0b10, 0, 0)]);
        assert!(FormatCatalog::from_in_formats(&blob).is_err());
    }

    #[test]
    fn fallback_attaches_linear_modifier() {
        let catalog = FormatCatalog::from_format_list(&[XRGB8888, ARGB8888, 0xdeadbeef]);
        assert_eq!(catalog.formats().count(), 2);
        assert_eq!(
            catalog.modifiers(DrmFourcc::Argb8888).unwrap(),
            &[DrmModifier::Linear]
        );
    }
}
