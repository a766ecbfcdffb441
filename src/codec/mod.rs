//! Codec adapters, one per compression family.
//!
//! An adapter turns the compressed bytes of one frame into raw samples in the
//! sample container width declared by the frame descriptor. Post-processing
//! (sign extension, range scan, scaling, color) is left to the
//! [`Dispatcher`](crate::dispatcher::Dispatcher).

pub mod dicom_rs;
pub mod native;
pub mod rle;

use crate::frame::{FrameDescriptor, PixelBuffer};

use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum CodecError {
    #[error("Unsupported bits allocated: {0}")]
    UnsupportedBitsAllocated(u16),

    #[error("Truncated {codec} data: expected {expected} bytes, found {actual}")]
    Truncated {
        codec: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Malformed {codec} data: {reason}")]
    Malformed { codec: &'static str, reason: String },

    #[error("{codec} codec for {transfer_syntax} is not part of this build")]
    Unavailable {
        codec: &'static str,
        transfer_syntax: String,
    },

    #[error("{codec} decoder failed: {message}")]
    Backend { codec: &'static str, message: String },
}

/// Input of a single adapter invocation.
#[derive(Debug, Clone, Copy)]
pub struct DecodeRequest<'a> {
    pub transfer_syntax: &'a str,
    pub descriptor: &'a FrameDescriptor,
    pub bytes: &'a [u8],
    /// Requested subresolution level, honored only by adapters that support it.
    pub decode_level: u8,
    /// `false` while more bytes for this frame may still arrive.
    pub is_final: bool,
}

/// Samples produced by an adapter, before post-processing.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    /// Geometry and layout of `samples`. Adapters update rows/columns for
    /// subresolution output and the photometric interpretation when the
    /// codec already converted color.
    pub descriptor: FrameDescriptor,
    pub samples: PixelBuffer,
    pub decode_level: u8,
}

pub trait CodecAdapter: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn supports_decode_level(&self) -> bool {
        false
    }

    fn decode(&self, request: &DecodeRequest<'_>) -> Result<RawFrame, CodecError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
}

/// Interpret `bytes` as samples of the descriptor's container width.
///
/// Signed representations produce signed buffers so later sign extension
/// works on the right type. 32-bit containers are widened to float.
pub(crate) fn samples_from_bytes(
    codec: &'static str,
    bytes: &[u8],
    descriptor: &FrameDescriptor,
    order: ByteOrder,
) -> Result<PixelBuffer, CodecError> {
    let count = descriptor.stored_sample_count();
    let signed = descriptor.pixel_representation.is_signed();
    let expected = descriptor.frame_size_bytes();
    if bytes.len() < expected {
        return Err(CodecError::Truncated {
            codec,
            expected,
            actual: bytes.len(),
        });
    }

    let buffer = match descriptor.bits_allocated {
        1 => PixelBuffer::U8(unpack_bits(bytes, count)),
        8 if signed => PixelBuffer::I8(bytes[..count].iter().map(|&b| b as i8).collect()),
        8 => PixelBuffer::U8(bytes[..count].to_vec()),
        16 => {
            let words = bytes[..count * 2].chunks_exact(2).map(|pair| match order {
                ByteOrder::Little => u16::from_le_bytes([pair[0], pair[1]]),
                ByteOrder::Big => u16::from_be_bytes([pair[0], pair[1]]),
            });
            if signed {
                PixelBuffer::I16(words.map(|w| w as i16).collect())
            } else {
                PixelBuffer::U16(words.collect())
            }
        }
        32 => {
            let words = bytes[..count * 4].chunks_exact(4).map(|quad| {
                let quad = [quad[0], quad[1], quad[2], quad[3]];
                match order {
                    ByteOrder::Little => u32::from_le_bytes(quad),
                    ByteOrder::Big => u32::from_be_bytes(quad),
                }
            });
            if signed {
                PixelBuffer::F32(words.map(|w| w as i32 as f32).collect())
            } else {
                PixelBuffer::F32(words.map(|w| w as f32).collect())
            }
        }
        other => return Err(CodecError::UnsupportedBitsAllocated(other)),
    };
    Ok(buffer)
}

/// Expand 1-bit packed samples, least significant bit first.
pub(crate) fn unpack_bits(bytes: &[u8], count: usize) -> Vec<u8> {
    (0..count)
        .map(|index| (bytes[index / 8] >> (index % 8)) & 1)
        .collect()
}

/// Zero-extend a partial payload so intermediate deliveries still decode.
pub(crate) fn pad_partial<'a>(
    bytes: &'a [u8],
    expected: usize,
    is_final: bool,
) -> std::borrow::Cow<'a, [u8]> {
    if is_final || bytes.len() >= expected {
        std::borrow::Cow::Borrowed(bytes)
    } else {
        let mut padded = bytes.to_vec();
        padded.resize(expected, 0);
        std::borrow::Cow::Owned(padded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enums::PixelRepresentation;

    #[test]
    fn unpacks_lsb_first() {
        assert_eq!(unpack_bits(&[0b0000_0101, 0b1], 9), vec![1, 0, 1, 0, 0, 0, 0, 0, 1]);
    }

    #[test]
    fn signed_words_keep_their_bits() {
        let descriptor = FrameDescriptor::monochrome(1, 2, 16, 16)
            .with_pixel_representation(PixelRepresentation::Signed);
        let buffer =
            samples_from_bytes("test", &[0xFF, 0xFF, 0x02, 0x00], &descriptor, ByteOrder::Little)
                .unwrap();
        assert_eq!(buffer, PixelBuffer::I16(vec![-1, 2]));
    }

    #[test]
    fn short_input_is_truncated_error() {
        let descriptor = FrameDescriptor::monochrome(2, 2, 16, 16);
        let error = samples_from_bytes("test", &[0; 6], &descriptor, ByteOrder::Little).unwrap_err();
        assert!(matches!(error, CodecError::Truncated { expected: 8, actual: 6, .. }));
    }
}
