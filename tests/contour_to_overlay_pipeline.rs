//! Exercises the contour → synth boundary end to end: a synthetic image
//! instance's geometry drives rasterisation of a patient-space polygon, and
//! the resulting mask is packed into a real overlay-plane element that a
//! viewer (or this test, standing in for one) can unpack back out.

use dicom_core::header::Tag;
use dicom_core::value::PrimitiveValue;
use dicom_core::{dicom_value, DataElement, VR};
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;

use netrt_edge::config::ProcessingConfig;
use netrt_edge::contour::{rasterize_polygon, ContourPolygon, MaskPlane};
use netrt_edge::dicom_view::{self};
use netrt_edge::synth;

fn axial_ct_slice(rows: u16, columns: u16, z: f64) -> InMemDicomObject {
    InMemDicomObject::from_element_iter([
        DataElement::new(tags::SOP_CLASS_UID, VR::UI, dicom_value!(Str, "1.2.840.10008.5.1.4.1.1.2")),
        DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, "1.2.3.4.100")),
        DataElement::new(tags::STUDY_INSTANCE_UID, VR::UI, dicom_value!(Str, "1.2.3.4")),
        DataElement::new(tags::SERIES_INSTANCE_UID, VR::UI, dicom_value!(Str, "1.2.3.4.1")),
        DataElement::new(tags::FRAME_OF_REFERENCE_UID, VR::UI, dicom_value!(Str, "1.2.3.4.99")),
        DataElement::new(tags::ROWS, VR::US, dicom_value!(U16, [rows])),
        DataElement::new(tags::COLUMNS, VR::US, dicom_value!(U16, [columns])),
        DataElement::new(tags::BITS_ALLOCATED, VR::US, dicom_value!(U16, [8])),
        DataElement::new(
            tags::IMAGE_POSITION_PATIENT,
            VR::DS,
            PrimitiveValue::Strs(vec!["0.0".to_string(), "0.0".to_string(), format!("{z}")].into()),
        ),
        DataElement::new(
            tags::IMAGE_ORIENTATION_PATIENT,
            VR::DS,
            PrimitiveValue::Strs(
                vec!["1.0", "0.0", "0.0", "0.0", "1.0", "0.0"]
                    .into_iter()
                    .map(str::to_string)
                    .collect::<Vec<String>>()
                    .into(),
            ),
        ),
        DataElement::new(
            tags::PIXEL_SPACING,
            VR::DS,
            PrimitiveValue::Strs(vec!["1.0".to_string(), "1.0".to_string()].into()),
        ),
        DataElement::new(
            tags::PIXEL_DATA,
            VR::OW,
            PrimitiveValue::U8(vec![0u8; (rows as usize) * (columns as usize)].into()),
        ),
    ])
}

#[test]
fn a_square_contour_rasterises_and_round_trips_through_an_overlay_element() {
    let source = axial_ct_slice(10, 10, 0.0);
    let pose = dicom_view::instance_pose(&source).unwrap();

    // a 4x4 patient-space square, centred, planar at z = 0.0
    let polygon = ContourPolygon {
        points: vec![[3.0, 3.0, 0.0], [7.0, 3.0, 0.0], [7.0, 7.0, 0.0], [3.0, 7.0, 0.0]],
    };
    let mask = rasterize_polygon(&polygon, &pose);
    let filled_pixels: usize = mask.data.iter().map(|&b| b as usize).sum();
    assert!(filled_pixels >= 9, "a 4x4 square should cover at least a 3x3 region");

    let cfg = ProcessingConfig {
        ignore_contour_names_containing: vec![],
        overlay_series_number: 9901,
        overlay_series_description: "RT Contour Overlay".to_string(),
        overlay_study_description: None,
        add_burn_in_disclaimer: false,
        burn_in_text: String::new(),
    };
    let derived = synth::build_overlay_instance(&source, std::slice::from_ref(&mask), "1.2.3.4.200", 1, &cfg).unwrap();

    let overlay_rows = derived.element(Tag(0x6000, 0x0010)).unwrap().to_int::<u16>().unwrap();
    let overlay_columns = derived.element(Tag(0x6000, 0x0011)).unwrap().to_int::<u16>().unwrap();
    assert_eq!(overlay_rows, 10);
    assert_eq!(overlay_columns, 10);

    let packed = derived.element(Tag(0x6000, 0x3000)).unwrap().to_bytes().unwrap();
    let unpacked = unpack_bits(&packed, mask.data.len());
    assert_eq!(unpacked, mask.data);

    // the overlay mask never touches PixelData itself
    let pixel_data = derived.element(tags::PIXEL_DATA).unwrap().to_bytes().unwrap();
    assert!(pixel_data.iter().all(|&b| b == 0));
}

#[test]
fn two_rois_on_the_same_slice_merge_without_losing_either_region() {
    let source = axial_ct_slice(10, 10, 0.0);
    let pose = dicom_view::instance_pose(&source).unwrap();

    let left = ContourPolygon {
        points: vec![[0.5, 0.5, 0.0], [2.0, 0.5, 0.0], [2.0, 2.0, 0.0], [0.5, 2.0, 0.0]],
    };
    let right = ContourPolygon {
        points: vec![[7.0, 7.0, 0.0], [9.0, 7.0, 0.0], [9.0, 9.0, 0.0], [7.0, 9.0, 0.0]],
    };

    let mut merged = MaskPlane::empty(pose.rows, pose.columns);
    merged.merge(&rasterize_polygon(&left, &pose));
    merged.merge(&rasterize_polygon(&right, &pose));

    let left_mask = rasterize_polygon(&left, &pose);
    let right_mask = rasterize_polygon(&right, &pose);
    assert!(left_mask.data.iter().any(|&b| b == 1));
    assert!(right_mask.data.iter().any(|&b| b == 1));
    for i in 0..merged.data.len() {
        assert_eq!(merged.data[i], left_mask.data[i] | right_mask.data[i]);
    }
}

/// Inverse of `synth`'s bit-packing: bit 0 of the first byte is the first
/// pixel, LSB first.
fn unpack_bits(packed: &[u8], len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    for i in 0..len {
        let byte = packed[i / 8];
        let bit = (byte >> (i % 8)) & 1;
        out.push(bit);
    }
    out
}
