//! Series synthesiser: builds the derived image series carrying the
//! rasterised contours as overlay planes, optionally with a burned-in
//! disclaimer and a debug secondary-capture rendering.
//!
//! New module. Derived-instance construction follows the teacher's
//! `FileMetaTableBuilder` pattern from `storescp/store_async.rs`; element
//! construction for the overlay group follows the
//! `create_cstore_response`/`create_cecho_response` idiom of building a
//! dataset from an explicit list of `DataElement`s. The burn-in renderer
//! writes directly into a flat pixel buffer the way
//! `utils/image_processing.rs` does for its own grayscale conversion, since
//! no font-rendering crate exists anywhere in the corpus.

use dicom_core::header::Tag;
use dicom_core::value::PrimitiveValue;
use dicom_core::{DataElement, VR};
use dicom_dictionary_std::tags;
use dicom_object::{FileMetaTableBuilder, InMemDicomObject};
use uuid::Uuid;

use crate::config::ProcessingConfig;
use crate::contour::MaskPlane;
use crate::dicom_view::DicomObject;
use crate::error::{Error, Result};

/// Generates a new DICOM UID under the `2.25.` UUID-derived root (DICOM PS
/// 3.6 Annex B), which needs no registered organisational root.
pub fn new_uid() -> String {
    format!("2.25.{}", Uuid::new_v4().as_u128())
}

fn overlay_tag(group_index: u8, element: u16) -> Tag {
    Tag(0x6000 + (group_index as u16) * 2, element)
}

/// Encodes a mask plane as DICOM overlay-plane elements (group `60xx`) and
/// writes them into `obj`. `group_index` selects which of the 16 permitted
/// overlay groups (0-15) this plane occupies.
pub fn write_overlay_plane(obj: &mut InMemDicomObject, plane: &MaskPlane, group_index: u8) -> Result<()> {
    if group_index > 15 {
        return Err(Error::internal("overlay group index must be 0..=15"));
    }
    let packed = pack_bits(&plane.data);

    obj.put(DataElement::new(
        overlay_tag(group_index, 0x0010),
        VR::US,
        PrimitiveValue::from(plane.rows as u16),
    ));
    obj.put(DataElement::new(
        overlay_tag(group_index, 0x0011),
        VR::US,
        PrimitiveValue::from(plane.columns as u16),
    ));
    obj.put(DataElement::new(
        overlay_tag(group_index, 0x0040),
        VR::CS,
        PrimitiveValue::from("G"),
    ));
    obj.put(DataElement::new(
        overlay_tag(group_index, 0x0050),
        VR::SS,
        PrimitiveValue::I16(vec![1i16, 1i16].into()),
    ));
    obj.put(DataElement::new(
        overlay_tag(group_index, 0x0100),
        VR::US,
        PrimitiveValue::from(1u16),
    ));
    obj.put(DataElement::new(
        overlay_tag(group_index, 0x0102),
        VR::US,
        PrimitiveValue::from(0u16),
    ));
    obj.put(DataElement::new(
        overlay_tag(group_index, 0x3000),
        VR::OW,
        PrimitiveValue::U8(packed.into()),
    ));
    Ok(())
}

/// Packs a 0/1-per-byte mask into the bit-packed, word-aligned layout
/// Overlay Data requires: bit 0 of the first byte is the first pixel, LSB
/// first, padded to a whole number of 16-bit words.
fn pack_bits(mask: &[u8]) -> Vec<u8> {
    let mut packed = vec![0u8; (mask.len() + 7) / 8];
    for (i, &bit) in mask.iter().enumerate() {
        if bit != 0 {
            packed[i / 8] |= 1 << (i % 8);
        }
    }
    if packed.len() % 2 != 0 {
        packed.push(0);
    }
    packed
}

/// Builds one derived instance: a copy of the source image-bearing
/// instance's pixel data and geometry, with one overlay plane per ROI mask
/// supplied, fresh UIDs, and the configured series-level descriptive tags.
pub fn build_overlay_instance(
    source: &DicomObject,
    masks: &[MaskPlane],
    series_instance_uid: &str,
    instance_number: i64,
    cfg: &ProcessingConfig,
) -> Result<InMemDicomObject> {
    if masks.len() > 16 {
        return Err(Error::internal("at most 16 overlay planes are supported per instance"));
    }

    let mut obj = source.clone();

    let sop_instance_uid = new_uid();
    obj.put(DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, PrimitiveValue::from(sop_instance_uid.as_str())));
    obj.put(DataElement::new(tags::SERIES_INSTANCE_UID, VR::UI, PrimitiveValue::from(series_instance_uid)));
    obj.put(DataElement::new(
        tags::SERIES_NUMBER,
        VR::IS,
        PrimitiveValue::from(cfg.overlay_series_number.to_string().as_str()),
    ));
    obj.put(DataElement::new(
        tags::SERIES_DESCRIPTION,
        VR::LO,
        PrimitiveValue::from(cfg.overlay_series_description.as_str()),
    ));
    obj.put(DataElement::new(
        tags::INSTANCE_NUMBER,
        VR::IS,
        PrimitiveValue::from(instance_number.to_string().as_str()),
    ));
    if let Some(study_desc) = &cfg.overlay_study_description {
        obj.put(DataElement::new(tags::STUDY_DESCRIPTION, VR::LO, PrimitiveValue::from(study_desc.as_str())));
    }

    for (i, mask) in masks.iter().enumerate() {
        write_overlay_plane(&mut obj, mask, i as u8)?;
    }

    if cfg.add_burn_in_disclaimer {
        burn_in_disclaimer(&mut obj, &cfg.burn_in_text)?;
    }

    Ok(obj)
}

/// Wraps a derived instance with fresh DICOM file-meta information, the way
/// the teacher's association loop does for every instance it writes to
/// disk.
pub fn finalize_file_meta(obj: InMemDicomObject, transfer_syntax_uid: &str) -> Result<dicom_object::FileDicomObject<InMemDicomObject>> {
    let sop_class_uid = obj
        .element(tags::SOP_CLASS_UID)
        .ok()
        .and_then(|e| e.to_str().ok())
        .map(|s| s.to_string())
        .ok_or_else(|| Error::internal("derived instance missing SOPClassUID"))?;
    let sop_instance_uid = obj
        .element(tags::SOP_INSTANCE_UID)
        .ok()
        .and_then(|e| e.to_str().ok())
        .map(|s| s.to_string())
        .ok_or_else(|| Error::internal("derived instance missing SOPInstanceUID"))?;

    let meta = FileMetaTableBuilder::new()
        .media_storage_sop_class_uid(sop_class_uid.as_str())
        .media_storage_sop_instance_uid(sop_instance_uid.as_str())
        .transfer_syntax(transfer_syntax_uid)
        .build()
        .map_err(Error::codec)?;

    Ok(obj.with_exact_meta(meta))
}

/// Draws `text` into the low-intensity corner of the 8-bit grayscale pixel
/// buffer using a small embedded 5x7 bitmap font, directly mutating
/// `PixelData`. Non-8-bit instances are left untouched: burn-in is
/// best-effort cosmetic labelling, not a geometry-critical feature, so an
/// unsupported bit depth is silently skipped rather than failing the whole
/// study.
fn burn_in_disclaimer(obj: &mut InMemDicomObject, text: &str) -> Result<()> {
    let bits_allocated = obj.element(tags::BITS_ALLOCATED).ok().and_then(|e| e.to_int().ok());
    if bits_allocated != Some(8) {
        return Ok(());
    }
    let rows = obj
        .element(tags::ROWS)
        .ok()
        .and_then(|e| e.to_int().ok())
        .unwrap_or(0) as u32;
    let columns = obj
        .element(tags::COLUMNS)
        .ok()
        .and_then(|e| e.to_int().ok())
        .unwrap_or(0) as u32;
    if rows == 0 || columns == 0 {
        return Ok(());
    }

    let mut pixels = obj
        .element(tags::PIXEL_DATA)
        .ok()
        .and_then(|e| e.to_bytes().ok())
        .map(|b| b.into_owned())
        .unwrap_or_default();
    if pixels.len() < (rows * columns) as usize {
        return Ok(());
    }

    let text_width = (text.chars().count() as u32) * (FONT_WIDTH + 1);
    let x0 = if text_width + 4 < columns {
        (columns - text_width) / 2
    } else {
        2
    };
    let y0 = if rows > FONT_HEIGHT + 4 { rows - FONT_HEIGHT - 4 } else { 0 };
    draw_text(&mut pixels, columns, rows, x0, y0, text, 255);

    obj.put(DataElement::new(tags::PIXEL_DATA, VR::OW, PrimitiveValue::U8(pixels.into())));
    Ok(())
}

const FONT_WIDTH: u32 = 5;
const FONT_HEIGHT: u32 = 7;

/// Minimal 5x7 bitmap glyphs, one row per scanline, MSB-first over 5
/// columns. Covers uppercase letters, digits, space, and a dash — enough
/// for the disclaimer text this service ever burns in.
fn glyph(c: char) -> [u8; 7] {
    match c.to_ascii_uppercase() {
        'A' => [0x0E, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
        'B' => [0x1E, 0x11, 0x11, 0x1E, 0x11, 0x11, 0x1E],
        'C' => [0x0E, 0x11, 0x10, 0x10, 0x10, 0x11, 0x0E],
        'D' => [0x1C, 0x12, 0x11, 0x11, 0x11, 0x12, 0x1C],
        'E' => [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x1F],
        'F' => [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x10],
        'G' => [0x0E, 0x11, 0x10, 0x17, 0x11, 0x11, 0x0F],
        'H' => [0x11, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
        'I' => [0x0E, 0x04, 0x04, 0x04, 0x04, 0x04, 0x0E],
        'L' => [0x10, 0x10, 0x10, 0x10, 0x10, 0x10, 0x1F],
        'N' => [0x11, 0x19, 0x15, 0x13, 0x11, 0x11, 0x11],
        'O' => [0x0E, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
        'R' => [0x1E, 0x11, 0x11, 0x1E, 0x14, 0x12, 0x11],
        'S' => [0x0F, 0x10, 0x10, 0x0E, 0x01, 0x01, 0x1E],
        'T' => [0x1F, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04],
        'U' => [0x11, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
        'Y' => [0x11, 0x11, 0x0A, 0x04, 0x04, 0x04, 0x04],
        '0' => [0x0E, 0x11, 0x13, 0x15, 0x19, 0x11, 0x0E],
        '-' => [0x00, 0x00, 0x00, 0x1F, 0x00, 0x00, 0x00],
        _ => [0, 0, 0, 0, 0, 0, 0],
    }
}

fn draw_text(pixels: &mut [u8], width: u32, height: u32, x0: u32, y0: u32, text: &str, value: u8) {
    let mut x = x0;
    for ch in text.chars() {
        if x + FONT_WIDTH >= width || y0 + FONT_HEIGHT >= height {
            break;
        }
        if ch != ' ' {
            let rows = glyph(ch);
            for (dy, row) in rows.iter().enumerate() {
                for dx in 0..FONT_WIDTH {
                    if row & (1 << (FONT_WIDTH - 1 - dx as u32)) != 0 {
                        let idx = ((y0 + dy as u32) * width + x + dx) as usize;
                        if idx < pixels.len() {
                            pixels[idx] = value;
                        }
                    }
                }
            }
        }
        x += FONT_WIDTH + 1;
    }
}

const SECONDARY_CAPTURE_SOP_CLASS_UID: &str = "1.2.840.10008.5.1.4.1.1.7";

/// Builds a secondary-capture-style debug instance: same derived pixel data
/// and geometry as the overlay instance, but with the mask also burned
/// directly into the pixel buffer as a visible highlight rather than left
/// only in the machine-readable overlay plane, so it reads correctly in
/// viewers that ignore overlay groups entirely. SOP Class switches to
/// Secondary Capture Image Storage, since this series does not claim to be
/// the original acquired image.
pub fn build_debug_capture_instance(
    source: &DicomObject,
    mask: &MaskPlane,
    series_instance_uid: &str,
    instance_number: i64,
    cfg: &ProcessingConfig,
) -> Result<InMemDicomObject> {
    let mut obj = build_overlay_instance(source, std::slice::from_ref(mask), series_instance_uid, instance_number, cfg)?;

    obj.put(DataElement::new(
        tags::SOP_CLASS_UID,
        VR::UI,
        PrimitiveValue::from(SECONDARY_CAPTURE_SOP_CLASS_UID),
    ));
    obj.put(DataElement::new(
        tags::SERIES_DESCRIPTION,
        VR::LO,
        PrimitiveValue::from(format!("{} (Debug)", cfg.overlay_series_description).as_str()),
    ));

    highlight_mask_in_pixels(&mut obj, mask);

    Ok(obj)
}

/// Burns `mask` directly into the 8-bit pixel buffer at high intensity, for
/// viewers that do not render overlay planes. Same bit-depth restriction as
/// `burn_in_disclaimer`: non-8-bit instances keep the overlay plane only.
fn highlight_mask_in_pixels(obj: &mut InMemDicomObject, mask: &MaskPlane) {
    let bits_allocated = obj.element(tags::BITS_ALLOCATED).ok().and_then(|e| e.to_int().ok());
    if bits_allocated != Some(8) {
        return;
    }
    let Some(mut pixels) = obj
        .element(tags::PIXEL_DATA)
        .ok()
        .and_then(|e| e.to_bytes().ok())
        .map(|b| b.into_owned())
    else {
        return;
    };
    if pixels.len() != mask.data.len() {
        return;
    }
    for (pixel, &bit) in pixels.iter_mut().zip(mask.data.iter()) {
        if bit != 0 {
            *pixel = 255;
        }
    }
    obj.put(DataElement::new(tags::PIXEL_DATA, VR::OW, PrimitiveValue::U8(pixels.into())));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_bits_round_trips_single_set_pixel() {
        let mut mask = vec![0u8; 16];
        mask[9] = 1;
        let packed = pack_bits(&mask);
        assert_eq!(packed.len(), 2);
        assert_eq!(packed[1] & (1 << 1), 1 << 1);
    }

    #[test]
    fn overlay_tag_maps_group_index_to_even_group() {
        assert_eq!(overlay_tag(0, 0x3000), Tag(0x6000, 0x3000));
        assert_eq!(overlay_tag(1, 0x3000), Tag(0x6002, 0x3000));
        assert_eq!(overlay_tag(15, 0x3000), Tag(0x601E, 0x3000));
    }

    #[test]
    fn draw_text_sets_pixels_within_bounds_only() {
        let width = 40;
        let height = 20;
        let mut pixels = vec![0u8; (width * height) as usize];
        draw_text(&mut pixels, width, height, 2, 2, "HI", 255);
        assert!(pixels.iter().any(|&p| p == 255));
    }
}
