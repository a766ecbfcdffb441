//! Compressed families delegated to the `dicom-pixeldata` codec registry.
//!
//! The frame is wrapped in a minimal in-memory object carrying the pixel
//! module and a single encapsulated fragment, then decoded the same way a
//! file read from disk would be.

use super::{ByteOrder, CodecAdapter, CodecError, DecodeRequest, RawFrame, samples_from_bytes};
use crate::enums::PlanarConfiguration;
use crate::frame::FrameDescriptor;

use dicom::core::value::{PixelFragmentSequence, Value};
use dicom::core::{DataElement, PrimitiveValue, VR};
use dicom::object::{FileMetaTableBuilder, InMemDicomObject};
use dicom::pixeldata::PixelDecoder;
use dicom::transfer_syntax::{TransferSyntaxIndex, TransferSyntaxRegistry};
use dicom_dictionary_std::tags;

const SECONDARY_CAPTURE_SOP_CLASS: &str = "1.2.840.10008.5.1.4.1.1.7";

/// Compression family served by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    JpegBaseline,
    JpegExtended,
    JpegLossless,
    JpegLs,
    JpegLsNearLossless,
    Jpeg2000,
    HighThroughputJpeg2000,
}

/// Whether the linked `dicom-pixeldata` build carries a decoder for the
/// encapsulated pixel data of `uid`. Depends on the codec features enabled
/// on `dicom-transfer-syntax-registry` anywhere in the dependency graph.
pub fn is_available(uid: &str) -> bool {
    TransferSyntaxRegistry
        .get(uid)
        .is_some_and(|ts| ts.is_encapsulated_pixel_data() && ts.can_decode_all())
}

#[derive(Debug, Clone, Copy)]
pub struct DicomRsAdapter {
    family: Family,
}

impl DicomRsAdapter {
    pub const fn new(family: Family) -> Self {
        Self { family }
    }

    pub fn family(&self) -> Family {
        self.family
    }

    fn wrap(&self, request: &DecodeRequest<'_>) -> Result<dicom::object::DefaultDicomObject, CodecError> {
        let descriptor = request.descriptor;
        let object = InMemDicomObject::from_element_iter([
            DataElement::new(tags::SAMPLES_PER_PIXEL, VR::US, PrimitiveValue::from(descriptor.samples_per_pixel)),
            DataElement::new(
                tags::PHOTOMETRIC_INTERPRETATION,
                VR::CS,
                PrimitiveValue::from(descriptor.photometric_interpretation.as_str()),
            ),
            DataElement::new(
                tags::PLANAR_CONFIGURATION,
                VR::US,
                PrimitiveValue::from(match descriptor.planar_configuration {
                    PlanarConfiguration::Interleaved => 0_u16,
                    PlanarConfiguration::Planar => 1_u16,
                }),
            ),
            DataElement::new(tags::NUMBER_OF_FRAMES, VR::IS, PrimitiveValue::from("1")),
            DataElement::new(tags::ROWS, VR::US, PrimitiveValue::from(descriptor.rows)),
            DataElement::new(tags::COLUMNS, VR::US, PrimitiveValue::from(descriptor.columns)),
            DataElement::new(tags::BITS_ALLOCATED, VR::US, PrimitiveValue::from(descriptor.bits_allocated)),
            DataElement::new(tags::BITS_STORED, VR::US, PrimitiveValue::from(descriptor.bits_stored)),
            DataElement::new(
                tags::HIGH_BIT,
                VR::US,
                PrimitiveValue::from(descriptor.bits_stored.saturating_sub(1)),
            ),
            DataElement::new(
                tags::PIXEL_REPRESENTATION,
                VR::US,
                PrimitiveValue::from(u16::from(descriptor.pixel_representation.is_signed())),
            ),
            DataElement::new(
                tags::PIXEL_DATA,
                VR::OB,
                Value::PixelSequence(PixelFragmentSequence::new(
                    Vec::<u32>::new(),
                    vec![request.bytes.to_vec()],
                )),
            ),
        ]);

        object
            .with_meta(
                FileMetaTableBuilder::new()
                    .transfer_syntax(request.transfer_syntax)
                    .media_storage_sop_class_uid(SECONDARY_CAPTURE_SOP_CLASS)
                    .media_storage_sop_instance_uid("2.25.0"),
            )
            .map_err(|e| self.backend_error(e))
    }

    fn backend_error(&self, error: impl std::fmt::Display) -> CodecError {
        CodecError::Backend {
            codec: self.name(),
            message: error.to_string(),
        }
    }
}

impl CodecAdapter for DicomRsAdapter {
    fn name(&self) -> &'static str {
        match self.family {
            Family::JpegBaseline => "jpeg-baseline",
            Family::JpegExtended => "jpeg-extended",
            Family::JpegLossless => "jpeg-lossless",
            Family::JpegLs => "jpeg-ls",
            Family::JpegLsNearLossless => "jpeg-ls-near-lossless",
            Family::Jpeg2000 => "jpeg2000",
            Family::HighThroughputJpeg2000 => "htj2k",
        }
    }

    fn decode(&self, request: &DecodeRequest<'_>) -> Result<RawFrame, CodecError> {
        if !is_available(request.transfer_syntax) {
            return Err(CodecError::Unavailable {
                codec: self.name(),
                transfer_syntax: request.transfer_syntax.to_string(),
            });
        }
        if request.bytes.is_empty() {
            return Err(CodecError::Truncated {
                codec: self.name(),
                expected: 1,
                actual: 0,
            });
        }
        let object = self.wrap(request)?;
        let decoded = object
            .decode_pixel_data_frame(0)
            .map_err(|e| self.backend_error(e))?;

        // Color codecs in the registry hand back interleaved RGB.
        let mut output: FrameDescriptor = request.descriptor.clone();
        if output.samples_per_pixel == 3 {
            output.photometric_interpretation = "RGB".to_string();
            output.planar_configuration = PlanarConfiguration::Interleaved;
        }
        let samples = samples_from_bytes(self.name(), decoded.data(), &output, native_order())?;
        Ok(RawFrame {
            descriptor: output,
            samples,
            decode_level: 0,
        })
    }
}

fn native_order() -> ByteOrder {
    if cfg!(target_endian = "big") {
        ByteOrder::Big
    } else {
        ByteOrder::Little
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_fragment_is_rejected_before_decoding() {
        let descriptor = FrameDescriptor::monochrome(8, 8, 8, 8);
        let request = DecodeRequest {
            transfer_syntax: "1.2.840.10008.1.2.4.50",
            descriptor: &descriptor,
            bytes: &[],
            decode_level: 0,
            is_final: true,
        };
        let error = DicomRsAdapter::new(Family::JpegBaseline).decode(&request).unwrap_err();
        assert!(matches!(error, CodecError::Truncated { codec: "jpeg-baseline", .. }));
    }

    #[test]
    fn garbage_surfaces_backend_message() {
        let descriptor = FrameDescriptor::monochrome(8, 8, 8, 8);
        let request = DecodeRequest {
            transfer_syntax: "1.2.840.10008.1.2.4.50",
            descriptor: &descriptor,
            bytes: &[0x00, 0x01, 0x02, 0x03],
            decode_level: 0,
            is_final: true,
        };
        let error = DicomRsAdapter::new(Family::JpegBaseline).decode(&request).unwrap_err();
        assert!(matches!(error, CodecError::Backend { .. }));
    }

    #[test]
    fn codec_missing_from_the_build_is_unavailable() {
        let descriptor = FrameDescriptor::monochrome(8, 8, 8, 8);
        let request = DecodeRequest {
            transfer_syntax: "1.2.840.10008.1.2.4.80",
            descriptor: &descriptor,
            bytes: &[0xFF, 0xD8, 0xFF, 0xF7],
            decode_level: 0,
            is_final: true,
        };
        assert!(!is_available(request.transfer_syntax));
        let error = DicomRsAdapter::new(Family::JpegLs).decode(&request).unwrap_err();
        assert!(matches!(error, CodecError::Unavailable { codec: "jpeg-ls", .. }));
    }

    /// Encode a flat 8-bit frame with the registry's JPEG baseline encoder.
    fn jpeg_baseline_frame(rows: u16, columns: u16, value: u8) -> Vec<u8> {
        use dicom::pixeldata::Transcode;
        use dicom::transfer_syntax::entries::JPEG_BASELINE;

        let pixels = vec![value; rows as usize * columns as usize];
        let mut file = InMemDicomObject::from_element_iter([
            DataElement::new(tags::SOP_CLASS_UID, VR::UI, PrimitiveValue::from(SECONDARY_CAPTURE_SOP_CLASS)),
            DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, PrimitiveValue::from("2.25.1")),
            DataElement::new(tags::SAMPLES_PER_PIXEL, VR::US, PrimitiveValue::from(1_u16)),
            DataElement::new(tags::PHOTOMETRIC_INTERPRETATION, VR::CS, PrimitiveValue::from("MONOCHROME2")),
            DataElement::new(tags::ROWS, VR::US, PrimitiveValue::from(rows)),
            DataElement::new(tags::COLUMNS, VR::US, PrimitiveValue::from(columns)),
            DataElement::new(tags::BITS_ALLOCATED, VR::US, PrimitiveValue::from(8_u16)),
            DataElement::new(tags::BITS_STORED, VR::US, PrimitiveValue::from(8_u16)),
            DataElement::new(tags::HIGH_BIT, VR::US, PrimitiveValue::from(7_u16)),
            DataElement::new(tags::PIXEL_REPRESENTATION, VR::US, PrimitiveValue::from(0_u16)),
            DataElement::new(tags::PIXEL_DATA, VR::OB, PrimitiveValue::from(pixels)),
        ])
        .with_meta(
            FileMetaTableBuilder::new()
                .transfer_syntax("1.2.840.10008.1.2.1")
                .media_storage_sop_class_uid(SECONDARY_CAPTURE_SOP_CLASS)
                .media_storage_sop_instance_uid("2.25.1"),
        )
        .unwrap();
        file.transcode(&JPEG_BASELINE.erased()).unwrap();
        let fragments = file.get(tags::PIXEL_DATA).unwrap().fragments().unwrap();
        fragments[0].clone()
    }

    #[test]
    fn jpeg_baseline_frame_decodes() {
        use crate::dispatcher::{DecodeOptions, Dispatcher};
        use crate::enums::DecodeStatus;
        use crate::frame::{CompressedPayload, PixelBuffer};

        let bytes = jpeg_baseline_frame(8, 8, 100);
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
        let descriptor = FrameDescriptor::monochrome(8, 8, 8, 8);
        let payload = CompressedPayload::complete("1.2.840.10008.1.2.4.50", bytes);
        let frame = Dispatcher::default()
            .decode(&descriptor, &payload, DecodeOptions::default())
            .unwrap();
        assert_eq!(frame.status, DecodeStatus::Complete);
        let PixelBuffer::U8(samples) = &frame.pixels else {
            panic!("expected 8-bit samples, got {:?}", frame.pixels.sample_type());
        };
        assert_eq!(samples.len(), 64);
        assert!(samples.iter().all(|&v| v.abs_diff(100) <= 2), "{samples:?}");
    }
}
