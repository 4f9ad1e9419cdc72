//! SOP class inventory and the routing rule that decides which spool
//! subdirectory an incoming instance lands in.
//!
//! The abstract syntax list is reconstructed from the storage SOP classes
//! supported across the dicom-rs SCP/SCU examples, supplemented with the RT
//! classes the teacher's own `sop_classes.rs` names (`RT_STRUCTURE_SET_STORAGE`,
//! `RT_DOSE_STORAGE`, `RT_PLAN_STORAGE`) since this service must accept RT
//! structure sets as a first-class input, not just images.

use dicom_dictionary_std::uids::*;

#[allow(deprecated)]
pub static ABSTRACT_SYNTAXES: &[&str] = &[
    CT_IMAGE_STORAGE,
    ENHANCED_CT_IMAGE_STORAGE,
    STANDALONE_CURVE_STORAGE,
    STANDALONE_OVERLAY_STORAGE,
    SECONDARY_CAPTURE_IMAGE_STORAGE,
    ULTRASOUND_IMAGE_STORAGE_RETIRED,
    NUCLEAR_MEDICINE_IMAGE_STORAGE_RETIRED,
    MR_IMAGE_STORAGE,
    ENHANCED_MR_IMAGE_STORAGE,
    MR_SPECTROSCOPY_STORAGE,
    ENHANCED_MR_COLOR_IMAGE_STORAGE,
    ULTRASOUND_MULTI_FRAME_IMAGE_STORAGE_RETIRED,
    COMPUTED_RADIOGRAPHY_IMAGE_STORAGE,
    DIGITAL_X_RAY_IMAGE_STORAGE_FOR_PRESENTATION,
    DIGITAL_X_RAY_IMAGE_STORAGE_FOR_PROCESSING,
    ENCAPSULATED_PDF_STORAGE,
    ENCAPSULATED_CDA_STORAGE,
    ENCAPSULATED_STL_STORAGE,
    GRAYSCALE_SOFTCOPY_PRESENTATION_STATE_STORAGE,
    POSITRON_EMISSION_TOMOGRAPHY_IMAGE_STORAGE,
    BREAST_TOMOSYNTHESIS_IMAGE_STORAGE,
    BREAST_PROJECTION_X_RAY_IMAGE_STORAGE_FOR_PRESENTATION,
    BREAST_PROJECTION_X_RAY_IMAGE_STORAGE_FOR_PROCESSING,
    ENHANCED_PET_IMAGE_STORAGE,
    RT_IMAGE_STORAGE,
    RT_DOSE_STORAGE,
    RT_STRUCTURE_SET_STORAGE,
    RT_PLAN_STORAGE,
    NUCLEAR_MEDICINE_IMAGE_STORAGE,
    ULTRASOUND_MULTI_FRAME_IMAGE_STORAGE,
    MULTI_FRAME_SINGLE_BIT_SECONDARY_CAPTURE_IMAGE_STORAGE,
    MULTI_FRAME_GRAYSCALE_BYTE_SECONDARY_CAPTURE_IMAGE_STORAGE,
    MULTI_FRAME_GRAYSCALE_WORD_SECONDARY_CAPTURE_IMAGE_STORAGE,
    MULTI_FRAME_TRUE_COLOR_SECONDARY_CAPTURE_IMAGE_STORAGE,
    BASIC_TEXT_SR_STORAGE,
    ENHANCED_SR_STORAGE,
    COMPREHENSIVE_SR_STORAGE,
    VERIFICATION,
];

/// Which spool subdirectory an instance of this SOP class belongs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteClass {
    /// Structure set — the contour source.
    Structure,
    /// Image-bearing instance that a derived overlay series can be built
    /// from.
    Image,
    /// Accepted under the broad storage syntax list but neither of the
    /// above; stored for completeness and logged.
    Other,
}

pub fn route_for(sop_class_uid: &str) -> RouteClass {
    if sop_class_uid == RT_STRUCTURE_SET_STORAGE {
        return RouteClass::Structure;
    }
    const IMAGE_CLASSES: &[&str] = &[
        CT_IMAGE_STORAGE,
        ENHANCED_CT_IMAGE_STORAGE,
        MR_IMAGE_STORAGE,
        ENHANCED_MR_IMAGE_STORAGE,
        ENHANCED_MR_COLOR_IMAGE_STORAGE,
        COMPUTED_RADIOGRAPHY_IMAGE_STORAGE,
        DIGITAL_X_RAY_IMAGE_STORAGE_FOR_PRESENTATION,
        DIGITAL_X_RAY_IMAGE_STORAGE_FOR_PROCESSING,
        POSITRON_EMISSION_TOMOGRAPHY_IMAGE_STORAGE,
        ENHANCED_PET_IMAGE_STORAGE,
        NUCLEAR_MEDICINE_IMAGE_STORAGE,
        RT_IMAGE_STORAGE,
    ];
    if IMAGE_CLASSES.contains(&sop_class_uid) {
        RouteClass::Image
    } else {
        RouteClass::Other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structure_set_routes_to_structure() {
        assert_eq!(route_for(RT_STRUCTURE_SET_STORAGE), RouteClass::Structure);
    }

    #[test]
    fn ct_image_routes_to_image() {
        assert_eq!(route_for(CT_IMAGE_STORAGE), RouteClass::Image);
    }

    #[test]
    fn unknown_storage_class_routes_to_other() {
        assert_eq!(route_for(ENCAPSULATED_PDF_STORAGE), RouteClass::Other);
    }
}
