//! Confirms a YAML configuration document, once loaded, wires correctly
//! into the `Spool` and `anonymize` modules without any extra glue code —
//! the same directories and rules a real deployment would configure.

use dicom_core::{dicom_value, DataElement, VR};
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;

use netrt_edge::anonymize;
use netrt_edge::config::Config;
use netrt_edge::spool::Spool;

#[test]
fn loaded_config_drives_spool_directories_and_anonymization_rules() {
    let tmp = tempfile::tempdir().unwrap();
    let yaml = format!(
        r#"
dicom_destination:
  ip: 10.0.0.5
  ae_title: ARCHIVE
directories:
  working: {working}
  logs: {logs}
  quarantine_subdir: quarantine
anonymization:
  enabled: true
  rules:
    remove_tags:
      - PatientID
    blank_tags:
      - PatientName
"#,
        working = tmp.path().join("working").display(),
        logs = tmp.path().join("logs").display(),
    );
    let config_path = tmp.path().join("config.yaml");
    std::fs::write(&config_path, yaml).unwrap();

    let cfg = Config::load(&config_path).unwrap();
    assert!(cfg.anonymization.enabled);

    let spool = Spool::new(cfg.directories.clone());
    spool.init().unwrap();
    assert!(tmp.path().join("working").is_dir());
    spool.create("1.2.3").unwrap();

    let mut obj = InMemDicomObject::from_element_iter([
        DataElement::new(tags::PATIENT_NAME, VR::PN, dicom_value!(Str, "Doe^Jane")),
        DataElement::new(tags::PATIENT_ID, VR::LO, dicom_value!(Str, "12345")),
    ]);
    anonymize::apply(&mut obj, &cfg.anonymization).unwrap();

    assert!(obj.element(tags::PATIENT_ID).is_err());
    assert_eq!(obj.element(tags::PATIENT_NAME).unwrap().to_str().unwrap(), "");
}

#[test]
fn rejects_configuration_with_invalid_worker_count_before_anything_starts() {
    let tmp = tempfile::tempdir().unwrap();
    let yaml = r#"
dicom_destination:
  ip: 10.0.0.5
  ae_title: ARCHIVE
concurrency:
  pipeline_workers: 0
"#;
    let config_path = tmp.path().join("config.yaml");
    std::fs::write(&config_path, yaml).unwrap();

    let err = Config::load(&config_path).unwrap_err();
    assert_eq!(err.kind().as_str(), "config-error");
}
