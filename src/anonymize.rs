//! Tag-table rewrite rule engine: applies the configured `remove_tags` /
//! `blank_tags` lists to a dataset in place, plus the built-in patient-module
//! sweep when `full_anonymization_enabled` is set.
//!
//! Tag names are resolved the way the teacher's `utils/dicom_tags::parse_tag`
//! does — through `StandardDataDictionary::parse_tag`, with a raw
//! `GGGGEEEE` hex fallback for tags the dictionary doesn't know by name.

use dicom_core::header::{Header, Tag};
use dicom_core::{DataDictionary, DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::StandardDataDictionary;

use crate::config::AnonymizationConfig;
use crate::dicom_view::DicomObject;
use crate::error::{Error, Result};

/// Patient-module tags blanked when `full_anonymization_enabled` is set,
/// independent of the configured rule lists — the same tag set the teacher's
/// `PATIENT_BASIC` constant names for patient-scoped metadata.
const FULL_ANONYMIZATION_BLANK_TAGS: &[&str] = &[
    "PatientName",
    "PatientID",
    "PatientBirthDate",
    "PatientAddress",
    "PatientTelephoneNumbers",
    "OtherPatientIDs",
    "OtherPatientNames",
    "ReferringPhysicianName",
    "InstitutionName",
    "InstitutionAddress",
];

fn parse_tag(tag_str: &str) -> Result<Tag> {
    if let Some(tag) = StandardDataDictionary.parse_tag(tag_str) {
        return Ok(tag);
    }
    if tag_str.len() == 8 {
        if let (Ok(group), Ok(element)) =
            (u16::from_str_radix(&tag_str[0..4], 16), u16::from_str_radix(&tag_str[4..8], 16))
        {
            return Ok(Tag(group, element));
        }
    }
    Err(Error::Config {
        reason: format!("unrecognised anonymization tag '{tag_str}'"),
    })
}

/// Applies the configured rules to `obj` in place. No-op entirely when
/// `cfg.enabled` is false.
pub fn apply(obj: &mut DicomObject, cfg: &AnonymizationConfig) -> Result<()> {
    if !cfg.enabled {
        return Ok(());
    }

    for name in &cfg.rules.remove_tags {
        let tag = parse_tag(name)?;
        obj.remove_element(tag);
    }

    for name in &cfg.rules.blank_tags {
        let tag = parse_tag(name)?;
        blank(obj, tag);
    }

    if cfg.full_anonymization_enabled {
        for name in FULL_ANONYMIZATION_BLANK_TAGS {
            let tag = parse_tag(name)?;
            blank(obj, tag);
        }
    }

    Ok(())
}

/// Replaces an element's value with an empty string of the same VR rather
/// than removing it — some downstream consumers expect the tag present but
/// empty (Type 2) rather than absent (Type 3).
fn blank(obj: &mut DicomObject, tag: Tag) {
    let vr = obj.element(tag).map(|e| e.vr()).unwrap_or(VR::LO);
    obj.put(DataElement::new(tag, vr, PrimitiveValue::from("")));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AnonymizationRules;
    use dicom_core::dicom_value;
    use dicom_dictionary_std::tags;
    use dicom_object::InMemDicomObject;

    fn sample_obj() -> DicomObject {
        InMemDicomObject::from_element_iter([
            DataElement::new(tags::PATIENT_NAME, VR::PN, dicom_value!(Str, "Doe^Jane")),
            DataElement::new(tags::PATIENT_ID, VR::LO, dicom_value!(Str, "12345")),
            DataElement::new(tags::STUDY_DESCRIPTION, VR::LO, dicom_value!(Str, "Pelvis Planning")),
        ])
    }

    #[test]
    fn disabled_leaves_dataset_untouched() {
        let mut obj = sample_obj();
        let cfg = AnonymizationConfig {
            enabled: false,
            full_anonymization_enabled: true,
            rules: AnonymizationRules::default(),
        };
        apply(&mut obj, &cfg).unwrap();
        assert_eq!(obj.element(tags::PATIENT_NAME).unwrap().to_str().unwrap(), "Doe^Jane");
    }

    #[test]
    fn remove_tags_drops_the_element_entirely() {
        let mut obj = sample_obj();
        let cfg = AnonymizationConfig {
            enabled: true,
            full_anonymization_enabled: false,
            rules: AnonymizationRules {
                remove_tags: vec!["PatientID".to_string()],
                blank_tags: vec![],
            },
        };
        apply(&mut obj, &cfg).unwrap();
        assert!(obj.element(tags::PATIENT_ID).is_err());
    }

    #[test]
    fn full_anonymization_blanks_patient_name_even_without_explicit_rule() {
        let mut obj = sample_obj();
        let cfg = AnonymizationConfig {
            enabled: true,
            full_anonymization_enabled: true,
            rules: AnonymizationRules::default(),
        };
        apply(&mut obj, &cfg).unwrap();
        assert_eq!(obj.element(tags::PATIENT_NAME).unwrap().to_str().unwrap(), "");
        assert_eq!(obj.element(tags::STUDY_DESCRIPTION).unwrap().to_str().unwrap(), "Pelvis Planning");
    }
}
