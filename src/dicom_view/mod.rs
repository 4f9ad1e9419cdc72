//! Typed accessors over `InMemDicomObject`.
//!
//! The rest of the pipeline never reaches for a raw `Tag` directly; it asks
//! this module for a `StudyKey`, a `SeriesKey`, an `InstancePose`. Grounded on
//! `get_str_tag`/`get_int_tag` in the teacher's storescp association loop and
//! `get_element_value` in its `object` module, generalised into a small typed
//! layer instead of scattering tag lookups across every component.

use dicom_core::header::Tag;
use dicom_dictionary_std::tags;
use dicom_object::mem::InMemDicomObject;
use dicom_object::StandardDataDictionary;

use crate::error::{Error, Result};

pub type DicomObject = InMemDicomObject<StandardDataDictionary>;

fn get_str(obj: &DicomObject, tag: Tag) -> Option<String> {
    obj.element(tag).ok().and_then(|e| e.to_str().ok()).map(|s| s.trim().to_string())
}

fn get_str_or_empty(obj: &DicomObject, tag: Tag) -> String {
    get_str(obj, tag).unwrap_or_default()
}

fn get_int(obj: &DicomObject, tag: Tag) -> Option<i64> {
    obj.element(tag).ok().and_then(|e| e.to_int().ok())
}

fn get_f64s(obj: &DicomObject, tag: Tag) -> Option<Vec<f64>> {
    obj.element(tag)
        .ok()
        .and_then(|e| e.to_multi_float64().ok())
}

/// Uniquely identifies a study: `(StudyInstanceUID)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StudyKey(pub String);

/// Uniquely identifies a series within a study.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeriesKey(pub String);

/// Uniquely identifies a frame of reference; contours and images must share
/// one before a contour can be rasterised onto an image's geometry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameOfReferenceKey(pub String);

/// Spatial pose of a single image-bearing instance: enough geometry to place
/// a contour point cloud onto its pixel grid.
#[derive(Debug, Clone)]
pub struct InstancePose {
    pub image_position_patient: [f64; 3],
    pub image_orientation_patient: [f64; 6],
    pub pixel_spacing: [f64; 2],
    pub rows: u32,
    pub columns: u32,
}

impl InstancePose {
    /// Unit normal of the image plane, row × column direction cosines.
    pub fn slice_normal(&self) -> [f64; 3] {
        let r = [
            self.image_orientation_patient[0],
            self.image_orientation_patient[1],
            self.image_orientation_patient[2],
        ];
        let c = [
            self.image_orientation_patient[3],
            self.image_orientation_patient[4],
            self.image_orientation_patient[5],
        ];
        cross(r, c)
    }

    /// Signed projection of the instance's position onto its own slice
    /// normal — the ordering key that replaces filename-based ordering.
    pub fn slice_position(&self) -> f64 {
        dot(self.image_position_patient, self.slice_normal())
    }

    /// Maps a patient-space point to a fractional (row, column) pixel
    /// coordinate in this instance's grid, or `None` if degenerate.
    pub fn patient_to_pixel(&self, point: [f64; 3]) -> Option<(f64, f64)> {
        let row_dir = [
            self.image_orientation_patient[0],
            self.image_orientation_patient[1],
            self.image_orientation_patient[2],
        ];
        let col_dir = [
            self.image_orientation_patient[3],
            self.image_orientation_patient[4],
            self.image_orientation_patient[5],
        ];
        let rel = sub(point, self.image_position_patient);
        let col = dot(rel, row_dir) / self.pixel_spacing[1];
        let row = dot(rel, col_dir) / self.pixel_spacing[0];
        Some((row, col))
    }
}

fn cross(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

fn dot(a: [f64; 3], b: [f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn sub(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

pub fn study_key(obj: &DicomObject) -> Result<StudyKey> {
    get_str(obj, tags::STUDY_INSTANCE_UID)
        .filter(|s| !s.is_empty())
        .map(StudyKey)
        .ok_or_else(|| Error::MalformedIdentifier {
            reason: "missing StudyInstanceUID".to_string(),
        })
}

pub fn series_key(obj: &DicomObject) -> Result<SeriesKey> {
    get_str(obj, tags::SERIES_INSTANCE_UID)
        .filter(|s| !s.is_empty())
        .map(SeriesKey)
        .ok_or_else(|| Error::MalformedIdentifier {
            reason: "missing SeriesInstanceUID".to_string(),
        })
}

pub fn sop_instance_uid(obj: &DicomObject) -> Result<String> {
    get_str(obj, tags::SOP_INSTANCE_UID)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::MalformedIdentifier {
            reason: "missing SOPInstanceUID".to_string(),
        })
}

pub fn sop_class_uid(obj: &DicomObject) -> Result<String> {
    get_str(obj, tags::SOP_CLASS_UID)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::MalformedIdentifier {
            reason: "missing SOPClassUID".to_string(),
        })
}

pub fn frame_of_reference(obj: &DicomObject) -> Option<FrameOfReferenceKey> {
    get_str(obj, tags::FRAME_OF_REFERENCE_UID).map(FrameOfReferenceKey)
}

pub fn modality(obj: &DicomObject) -> String {
    get_str_or_empty(obj, tags::MODALITY)
}

pub fn series_description(obj: &DicomObject) -> String {
    get_str_or_empty(obj, tags::SERIES_DESCRIPTION)
}

pub fn series_number(obj: &DicomObject) -> Option<i64> {
    get_int(obj, tags::SERIES_NUMBER)
}

pub fn instance_number(obj: &DicomObject) -> Option<i64> {
    get_int(obj, tags::INSTANCE_NUMBER)
}

pub fn instance_pose(obj: &DicomObject) -> Result<InstancePose> {
    let position = get_f64s(obj, tags::IMAGE_POSITION_PATIENT)
        .filter(|v| v.len() == 3)
        .ok_or_else(|| Error::CoordinateMismatch {
            reason: "missing or malformed ImagePositionPatient".to_string(),
        })?;
    let orientation = get_f64s(obj, tags::IMAGE_ORIENTATION_PATIENT)
        .filter(|v| v.len() == 6)
        .ok_or_else(|| Error::CoordinateMismatch {
            reason: "missing or malformed ImageOrientationPatient".to_string(),
        })?;
    let spacing = get_f64s(obj, tags::PIXEL_SPACING)
        .filter(|v| v.len() == 2)
        .ok_or_else(|| Error::CoordinateMismatch {
            reason: "missing or malformed PixelSpacing".to_string(),
        })?;
    let rows = get_int(obj, tags::ROWS).ok_or_else(|| Error::CoordinateMismatch {
        reason: "missing Rows".to_string(),
    })?;
    let columns = get_int(obj, tags::COLUMNS).ok_or_else(|| Error::CoordinateMismatch {
        reason: "missing Columns".to_string(),
    })?;

    Ok(InstancePose {
        image_position_patient: [position[0], position[1], position[2]],
        image_orientation_patient: [
            orientation[0],
            orientation[1],
            orientation[2],
            orientation[3],
            orientation[4],
            orientation[5],
        ],
        pixel_spacing: [spacing[0], spacing[1]],
        rows: rows as u32,
        columns: columns as u32,
    })
}

pub fn rows(obj: &DicomObject) -> Option<u32> {
    get_int(obj, tags::ROWS).map(|v| v as u32)
}

pub fn columns(obj: &DicomObject) -> Option<u32> {
    get_int(obj, tags::COLUMNS).map(|v| v as u32)
}

pub fn bits_allocated(obj: &DicomObject) -> Option<u16> {
    get_int(obj, tags::BITS_ALLOCATED).map(|v| v as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slice_normal_of_axial_orientation_is_unit_z() {
        let pose = InstancePose {
            image_position_patient: [0.0, 0.0, 0.0],
            image_orientation_patient: [1.0, 0.0, 0.0, 0.0, 1.0, 0.0],
            pixel_spacing: [1.0, 1.0],
            rows: 512,
            columns: 512,
        };
        let n = pose.slice_normal();
        assert!((n[0]).abs() < 1e-9);
        assert!((n[1]).abs() < 1e-9);
        assert!((n[2] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn slice_position_orders_by_projection_not_filename() {
        let mut pose = InstancePose {
            image_position_patient: [0.0, 0.0, -30.0],
            image_orientation_patient: [1.0, 0.0, 0.0, 0.0, 1.0, 0.0],
            pixel_spacing: [1.0, 1.0],
            rows: 10,
            columns: 10,
        };
        let low = pose.slice_position();
        pose.image_position_patient[2] = 5.0;
        let high = pose.slice_position();
        assert!(high > low);
    }
}
