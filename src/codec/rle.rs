use super::{CodecAdapter, CodecError, DecodeRequest, RawFrame};
use crate::enums::PlanarConfiguration;
use crate::frame::PixelBuffer;

const CODEC: &str = "rle";
const HEADER_LEN: usize = 64;
const MAX_SEGMENTS: usize = 15;

/// RLE Lossless: a 64 byte header of segment offsets followed by PackBits
/// segments, one per byte plane, most significant byte first.
#[derive(Debug, Clone, Copy, Default)]
pub struct RleAdapter;

impl CodecAdapter for RleAdapter {
    fn name(&self) -> &'static str {
        CODEC
    }

    fn decode(&self, request: &DecodeRequest<'_>) -> Result<RawFrame, CodecError> {
        let descriptor = request.descriptor;
        let bytes_per_sample = match descriptor.bits_allocated {
            8 => 1,
            16 => 2,
            other => return Err(CodecError::UnsupportedBitsAllocated(other)),
        };
        let samples_per_pixel = descriptor.samples_per_pixel as usize;
        let pixel_count = descriptor.pixel_count();
        let offsets = read_header(request.bytes)?;
        let expected_segments = samples_per_pixel * bytes_per_sample;
        if offsets.len() != expected_segments {
            return Err(CodecError::Malformed {
                codec: CODEC,
                reason: format!(
                    "expected {expected_segments} segments, header declares {}",
                    offsets.len()
                ),
            });
        }

        // Output is sample interleaved regardless of the declared planar
        // configuration.
        let mut planes = vec![0u8; pixel_count * expected_segments];
        for (segment, &start) in offsets.iter().enumerate() {
            let end = offsets
                .get(segment + 1)
                .copied()
                .unwrap_or(request.bytes.len())
                .min(request.bytes.len());
            if start > end {
                if request.is_final {
                    return Err(CodecError::Truncated {
                        codec: CODEC,
                        expected: start,
                        actual: request.bytes.len(),
                    });
                }
                continue;
            }
            let plane = &mut planes[segment * pixel_count..(segment + 1) * pixel_count];
            let written = unpack_segment(&request.bytes[start..end], plane);
            if written < pixel_count && request.is_final {
                return Err(CodecError::Malformed {
                    codec: CODEC,
                    reason: format!("segment {segment} decoded {written} of {pixel_count} bytes"),
                });
            }
        }

        let signed = descriptor.pixel_representation.is_signed();
        let sample_at = |pixel: usize, sample: usize, byte: usize| {
            planes[(sample * bytes_per_sample + byte) * pixel_count + pixel]
        };
        let order = (0..pixel_count).flat_map(|pixel| (0..samples_per_pixel).map(move |s| (pixel, s)));
        let samples = match (bytes_per_sample, signed) {
            (1, false) => PixelBuffer::U8(order.map(|(p, s)| sample_at(p, s, 0)).collect()),
            (1, true) => PixelBuffer::I8(order.map(|(p, s)| sample_at(p, s, 0) as i8).collect()),
            (_, false) => PixelBuffer::U16(
                order
                    .map(|(p, s)| u16::from_be_bytes([sample_at(p, s, 0), sample_at(p, s, 1)]))
                    .collect(),
            ),
            (_, true) => PixelBuffer::I16(
                order
                    .map(|(p, s)| i16::from_be_bytes([sample_at(p, s, 0), sample_at(p, s, 1)]))
                    .collect(),
            ),
        };

        let mut output = descriptor.clone();
        output.planar_configuration = PlanarConfiguration::Interleaved;
        Ok(RawFrame {
            descriptor: output,
            samples,
            decode_level: 0,
        })
    }
}

fn read_header(bytes: &[u8]) -> Result<Vec<usize>, CodecError> {
    if bytes.len() < HEADER_LEN {
        return Err(CodecError::Truncated {
            codec: CODEC,
            expected: HEADER_LEN,
            actual: bytes.len(),
        });
    }
    let word = |index: usize| {
        let at = index * 4;
        u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]) as usize
    };
    let count = word(0);
    if count == 0 || count > MAX_SEGMENTS {
        return Err(CodecError::Malformed {
            codec: CODEC,
            reason: format!("invalid segment count {count}"),
        });
    }
    let offsets: Vec<usize> = (1..=count).map(word).collect();
    if offsets[0] != HEADER_LEN || offsets.windows(2).any(|pair| pair[0] > pair[1]) {
        return Err(CodecError::Malformed {
            codec: CODEC,
            reason: "segment offsets out of order".to_string(),
        });
    }
    Ok(offsets)
}

/// PackBits decode into `plane`, returning how many bytes were produced.
fn unpack_segment(segment: &[u8], plane: &mut [u8]) -> usize {
    let mut input = 0;
    let mut output = 0;
    while input < segment.len() && output < plane.len() {
        let header = segment[input] as i8;
        input += 1;
        match header {
            0..=127 => {
                let run = header as usize + 1;
                let available = run.min(segment.len() - input).min(plane.len() - output);
                plane[output..output + available]
                    .copy_from_slice(&segment[input..input + available]);
                input += run;
                output += available;
            }
            -127..=-1 => {
                let Some(&value) = segment.get(input) else {
                    break;
                };
                input += 1;
                let run = ((1 - header as isize) as usize).min(plane.len() - output);
                plane[output..output + run].fill(value);
                output += run;
            }
            -128 => {}
        }
    }
    output
}
