#![allow(dead_code)]

use dicom::core::value::{PixelFragmentSequence, Value};
use dicom::core::header::Header;
use dicom::core::{DataElement, PrimitiveValue, VR};
use dicom::object::mem::InMemElement;
use dicom::object::{FileMetaTableBuilder, InMemDicomObject};
use dicom_dictionary_std::tags;

pub const SOP_CLASS: &str = "1.2.840.10008.5.1.4.1.1.7";
pub const SOP_INSTANCE: &str = "1.2.826.0.1.3680043.2.1125.1";
pub const EXPLICIT_LE: &str = "1.2.840.10008.1.2.1";
pub const RLE: &str = "1.2.840.10008.1.2.5";

/// Attributes of an 8-bit monochrome image of `frames` frames.
pub fn image_attributes(rows: u16, columns: u16, frames: u32) -> Vec<InMemElement> {
    let mut elements = vec![
        DataElement::new(tags::SOP_CLASS_UID, VR::UI, PrimitiveValue::from(SOP_CLASS)),
        DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, PrimitiveValue::from(SOP_INSTANCE)),
        DataElement::new(tags::MODALITY, VR::CS, PrimitiveValue::from("OT")),
        DataElement::new(tags::SAMPLES_PER_PIXEL, VR::US, PrimitiveValue::from(1_u16)),
        DataElement::new(
            tags::PHOTOMETRIC_INTERPRETATION,
            VR::CS,
            PrimitiveValue::from("MONOCHROME2"),
        ),
        DataElement::new(tags::ROWS, VR::US, PrimitiveValue::from(rows)),
        DataElement::new(tags::COLUMNS, VR::US, PrimitiveValue::from(columns)),
        DataElement::new(tags::BITS_ALLOCATED, VR::US, PrimitiveValue::from(8_u16)),
        DataElement::new(tags::BITS_STORED, VR::US, PrimitiveValue::from(8_u16)),
        DataElement::new(tags::HIGH_BIT, VR::US, PrimitiveValue::from(7_u16)),
        DataElement::new(tags::PIXEL_REPRESENTATION, VR::US, PrimitiveValue::from(0_u16)),
    ];
    if frames > 1 {
        elements.push(DataElement::new(
            tags::NUMBER_OF_FRAMES,
            VR::IS,
            PrimitiveValue::from(frames.to_string()),
        ));
    }
    elements
}

fn write_part10(elements: Vec<InMemElement>, transfer_syntax: &str) -> Vec<u8> {
    let file = InMemDicomObject::from_element_iter(elements)
        .with_meta(
            FileMetaTableBuilder::new()
                .transfer_syntax(transfer_syntax)
                .media_storage_sop_class_uid(SOP_CLASS)
                .media_storage_sop_instance_uid(SOP_INSTANCE),
        )
        .expect("file meta should build");
    let mut out = Vec::new();
    file.write_all(&mut out).expect("file should serialize");
    out
}

/// Explicit little endian Part-10 file with native pixel data. The pixel
/// data is the last element, so its value is the tail of the file.
pub fn native_file(rows: u16, columns: u16, frames: u32, pixels: Vec<u8>) -> Vec<u8> {
    let mut elements = image_attributes(rows, columns, frames);
    elements.push(DataElement::new(tags::PIXEL_DATA, VR::OB, PrimitiveValue::from(pixels)));
    write_part10(elements, EXPLICIT_LE)
}

/// Native YBR_FULL_422 file: two bytes per pixel, Y1 Y2 Cb Cr per pixel pair.
pub fn ybr_422_file(rows: u16, columns: u16, frames: u32, pixels: Vec<u8>) -> Vec<u8> {
    let mut elements: Vec<InMemElement> = image_attributes(rows, columns, frames)
        .into_iter()
        .filter(|e| e.tag() != tags::SAMPLES_PER_PIXEL && e.tag() != tags::PHOTOMETRIC_INTERPRETATION)
        .collect();
    elements.push(DataElement::new(tags::SAMPLES_PER_PIXEL, VR::US, PrimitiveValue::from(3_u16)));
    elements.push(DataElement::new(
        tags::PHOTOMETRIC_INTERPRETATION,
        VR::CS,
        PrimitiveValue::from("YBR_FULL_422"),
    ));
    elements.push(DataElement::new(tags::PLANAR_CONFIGURATION, VR::US, PrimitiveValue::from(0_u16)));
    elements.push(DataElement::new(tags::PIXEL_DATA, VR::OB, PrimitiveValue::from(pixels)));
    write_part10(elements, EXPLICIT_LE)
}

/// RLE Lossless Part-10 file with the given offset table and fragments.
pub fn rle_file(rows: u16, columns: u16, frames: u32, offset_table: Vec<u32>, fragments: Vec<Vec<u8>>) -> Vec<u8> {
    let mut elements = image_attributes(rows, columns, frames);
    elements.push(DataElement::new(
        tags::PIXEL_DATA,
        VR::OB,
        Value::PixelSequence(PixelFragmentSequence::new(offset_table, fragments)),
    ));
    write_part10(elements, RLE)
}

/// One RLE frame of a single 8-bit segment stored as literal runs.
pub fn rle_frame(samples: &[u8]) -> Vec<u8> {
    let mut frame = vec![0u8; 64];
    frame[0..4].copy_from_slice(&1u32.to_le_bytes());
    frame[4..8].copy_from_slice(&64u32.to_le_bytes());
    for run in samples.chunks(128) {
        frame.push((run.len() - 1) as u8);
        frame.extend_from_slice(run);
    }
    if frame.len() % 2 == 1 {
        frame.push(0x80);
    }
    frame
}

pub const MULTIPART_TYPE: &str = r#"multipart/related; type="application/octet-stream"; boundary=frame-boundary"#;

/// A single-part `multipart/related` body carrying `data`.
pub fn multipart(transfer_syntax: &str, data: &[u8]) -> Vec<u8> {
    let mut body = format!(
        "--frame-boundary\r\nContent-Type: application/octet-stream; transfer-syntax={transfer_syntax}\r\n\r\n"
    )
    .into_bytes();
    body.extend_from_slice(data);
    body.extend_from_slice(b"\r\n--frame-boundary--\r\n");
    body
}
