//! HDR static metadata, translated into the kernel's
//! `HDR_OUTPUT_METADATA` blob format.

/// Electro-optical transfer function of the mastering display
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eotf {
    /// Traditional gamma, SDR luminance range
    TraditionalSdr,
    /// Traditional gamma, HDR luminance range
    TraditionalHdr,
    /// SMPTE ST 2084 (PQ)
    St2084,
    /// Hybrid log-gamma
    Hlg,
}

/// HDR static metadata for one output, CTA-861.3 style.
///
/// Chromaticity coordinates are in units of 0.00002, luminance values in the
/// units the infoframe defines (cd/m² for the maxima, 0.0001 cd/m² for the
/// minimum).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HdrMetadata {
    /// Transfer function the content is mastered for
    pub eotf: Eotf,
    /// Chromaticity of the red, green and blue display primaries
    pub display_primaries: [(u16, u16); 3],
    /// Chromaticity of the white point
    pub white_point: (u16, u16),
    /// Maximum mastering display luminance
    pub max_display_mastering_luminance: u16,
    /// Minimum mastering display luminance
    pub min_display_mastering_luminance: u16,
    /// Maximum content light level
    pub max_cll: u16,
    /// Maximum frame-average light level
    pub max_fall: u16,
}

/// `struct hdr_metadata_infoframe` from the kernel ABI
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct HdrMetadataInfoframe {
    eotf: u8,
    metadata_type: u8,
    display_primaries: [[u16; 2]; 3],
    white_point: [u16; 2],
    max_display_mastering_luminance: u16,
    min_display_mastering_luminance: u16,
    max_cll: u16,
    max_fall: u16,
}

/// `struct hdr_output_metadata` from the kernel ABI
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub(crate) struct HdrOutputMetadata {
    metadata_type: u32,
    infoframe: HdrMetadataInfoframe,
}

// HDMI_STATIC_METADATA_TYPE1
const STATIC_METADATA_TYPE1: u32 = 0;

impl From<&HdrMetadata> for HdrOutputMetadata {
    fn from(metadata: &HdrMetadata) -> Self {
        HdrOutputMetadata {
            metadata_type: STATIC_METADATA_TYPE1,
            infoframe: HdrMetadataInfoframe {
                eotf: metadata.eotf as u8,
                metadata_type: STATIC_METADATA_TYPE1 as u8,
                display_primaries: metadata.display_primaries.map(|(x, y)| [x, y]),
                white_point: [metadata.white_point.0, metadata.white_point.1],
                max_display_mastering_luminance: metadata.max_display_mastering_luminance,
                min_display_mastering_luminance: metadata.min_display_mastering_luminance,
                max_cll: metadata.max_cll,
                max_fall: metadata.max_fall,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_matches_kernel_abi_size() {
        // 4 byte type tag + 26 byte infoframe, padded to u32 alignment
        assert_eq!(std::mem::size_of::<HdrMetadataInfoframe>(), 26);
        assert_eq!(std::mem::size_of::<HdrOutputMetadata>(), 32);
    }

    #[test]
    fn eotf_codes_match_the_infoframe_abi() {
        assert_eq!(Eotf::TraditionalSdr as u8, 0);
        assert_eq!(Eotf::TraditionalHdr as u8, 1);
        assert_eq!(Eotf::St2084 as u8, 2);
        assert_eq!(Eotf::Hlg as u8, 3);
    }
}
