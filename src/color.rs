//! Color-space conversion keyed by photometric interpretation.
//!
//! Output is always sample-interleaved 8-bit RGB.

use crate::codec::RawFrame;
use crate::enums::PlanarConfiguration;
use crate::frame::{FrameDescriptor, PixelBuffer};

use ndarray::Array3;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ColorError {
    #[error("Unsupported photometric interpretation: {0}")]
    UnsupportedPhotometric(String),

    #[error("Unsupported sample type for {photometric}: {found:?}")]
    UnsupportedSamples {
        photometric: String,
        found: crate::frame::SampleType,
    },

    #[error("Palette color image without lookup tables")]
    MissingPalette,

    #[error("Color data has {actual} samples, expected {expected}")]
    LengthMismatch { expected: usize, actual: usize },
}

/// Convert a color frame to interleaved RGB. Returns the converted samples
/// and the descriptor describing them.
pub fn convert_to_rgb(frame: &RawFrame) -> Result<(FrameDescriptor, PixelBuffer), ColorError> {
    let descriptor = &frame.descriptor;
    let pixel_count = descriptor.pixel_count();
    let photometric = descriptor.photometric_interpretation.as_str();

    let rgb = match photometric {
        "PALETTE COLOR" => apply_palette(descriptor, &frame.samples)?,
        "RGB" | "YBR_RCT" | "YBR_ICT" => interleave(descriptor, bytes_of(photometric, &frame.samples)?)?,
        "YBR_FULL" => ybr_full_to_rgb(&interleave(descriptor, bytes_of(photometric, &frame.samples)?)?),
        "YBR_FULL_422" => {
            let data = bytes_of(photometric, &frame.samples)?;
            if data.len() == pixel_count * 2 {
                ybr_422_to_rgb(data, pixel_count)
            } else {
                ybr_full_to_rgb(&interleave(descriptor, data)?)
            }
        }
        other => return Err(ColorError::UnsupportedPhotometric(other.to_string())),
    };

    let mut output = descriptor.clone();
    output.samples_per_pixel = 3;
    output.bits_allocated = 8;
    output.bits_stored = 8;
    output.planar_configuration = PlanarConfiguration::Interleaved;
    output.photometric_interpretation = "RGB".to_string();
    output.palette = None;
    Ok((output, PixelBuffer::U8(rgb)))
}

fn bytes_of<'a>(photometric: &str, samples: &'a PixelBuffer) -> Result<&'a [u8], ColorError> {
    match samples {
        PixelBuffer::U8(data) => Ok(data),
        other => Err(ColorError::UnsupportedSamples {
            photometric: photometric.to_string(),
            found: other.sample_type(),
        }),
    }
}

fn interleave(descriptor: &FrameDescriptor, data: &[u8]) -> Result<Vec<u8>, ColorError> {
    let expected = descriptor.pixel_count() * 3;
    if data.len() != expected {
        return Err(ColorError::LengthMismatch {
            expected,
            actual: data.len(),
        });
    }
    match descriptor.planar_configuration {
        PlanarConfiguration::Interleaved => Ok(data.to_vec()),
        PlanarConfiguration::Planar => {
            let shape = (3, descriptor.rows as usize, descriptor.columns as usize);
            let planes = Array3::from_shape_vec(shape, data.to_vec()).map_err(|_| {
                ColorError::LengthMismatch {
                    expected,
                    actual: data.len(),
                }
            })?;
            Ok(planes.permuted_axes([1, 2, 0]).iter().copied().collect())
        }
    }
}

#[inline]
fn ybr_pixel(y: u8, cb: u8, cr: u8) -> [u8; 3] {
    let y = y as f32;
    let cb = cb as f32 - 128.0;
    let cr = cr as f32 - 128.0;
    let clamp = |v: f32| v.round().clamp(0.0, 255.0) as u8;
    [
        clamp(y + 1.402 * cr),
        clamp(y - 0.344_136 * cb - 0.714_136 * cr),
        clamp(y + 1.772 * cb),
    ]
}

fn ybr_full_to_rgb(interleaved: &[u8]) -> Vec<u8> {
    interleaved
        .chunks_exact(3)
        .flat_map(|ybr| ybr_pixel(ybr[0], ybr[1], ybr[2]))
        .collect()
}

/// Two luminance samples share one Cb/Cr pair: Y1 Y2 Cb Cr.
fn ybr_422_to_rgb(data: &[u8], pixel_count: usize) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(pixel_count * 3);
    for group in data.chunks_exact(4) {
        let (cb, cr) = (group[2], group[3]);
        rgb.extend(ybr_pixel(group[0], cb, cr));
        rgb.extend(ybr_pixel(group[1], cb, cr));
    }
    rgb.truncate(pixel_count * 3);
    rgb
}

fn apply_palette(descriptor: &FrameDescriptor, samples: &PixelBuffer) -> Result<Vec<u8>, ColorError> {
    let palette = descriptor.palette.as_ref().ok_or(ColorError::MissingPalette)?;
    let mut rgb = Vec::with_capacity(samples.len() * 3);
    for index in 0..samples.len() {
        let value = samples.get(index).unwrap_or_default() as i32;
        rgb.push(palette.red.lookup_u8(value));
        rgb.push(palette.green.lookup_u8(value));
        rgb.push(palette.blue.lookup_u8(value));
    }
    Ok(rgb)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{LutChannel, PaletteLut};

    fn raw(descriptor: FrameDescriptor, samples: PixelBuffer) -> RawFrame {
        RawFrame {
            descriptor,
            samples,
            decode_level: 0,
        }
    }

    #[test]
    fn planar_rgb_is_interleaved() {
        let descriptor =
            FrameDescriptor::monochrome(1, 2, 8, 8).with_color(3, "RGB", PlanarConfiguration::Planar);
        let (_, rgb) = convert_to_rgb(&raw(descriptor, PixelBuffer::U8(vec![1, 2, 3, 4, 5, 6]))).unwrap();
        assert_eq!(rgb, PixelBuffer::U8(vec![1, 3, 5, 2, 4, 6]));
    }

    #[test]
    fn ybr_full_neutral_gray_stays_gray() {
        let descriptor = FrameDescriptor::monochrome(1, 1, 8, 8).with_color(
            3,
            "YBR_FULL",
            PlanarConfiguration::Interleaved,
        );
        let (out, rgb) = convert_to_rgb(&raw(descriptor, PixelBuffer::U8(vec![100, 128, 128]))).unwrap();
        assert_eq!(rgb, PixelBuffer::U8(vec![100, 100, 100]));
        assert_eq!(out.photometric_interpretation, "RGB");
    }

    #[test]
    fn ybr_422_shares_chroma() {
        let descriptor = FrameDescriptor::monochrome(1, 2, 8, 8).with_color(
            3,
            "YBR_FULL_422",
            PlanarConfiguration::Interleaved,
        );
        let (_, rgb) = convert_to_rgb(&raw(descriptor, PixelBuffer::U8(vec![10, 200, 128, 128]))).unwrap();
        assert_eq!(rgb, PixelBuffer::U8(vec![10, 10, 10, 200, 200, 200]));
    }

    #[test]
    fn palette_lookup() {
        let channel = |data: Vec<u16>| LutChannel {
            first_mapped: 0,
            bits: 8,
            data,
        };
        let mut descriptor = FrameDescriptor::monochrome(1, 2, 8, 8);
        descriptor.photometric_interpretation = "PALETTE COLOR".to_string();
        descriptor.palette = Some(PaletteLut {
            red: channel(vec![10, 20]),
            green: channel(vec![30, 40]),
            blue: channel(vec![50, 60]),
        });
        let (_, rgb) = convert_to_rgb(&raw(descriptor, PixelBuffer::U8(vec![1, 0]))).unwrap();
        assert_eq!(rgb, PixelBuffer::U8(vec![20, 40, 60, 10, 30, 50]));
    }

    #[test]
    fn unknown_photometric_is_named() {
        let descriptor = FrameDescriptor::monochrome(1, 1, 8, 8).with_color(
            3,
            "HSV",
            PlanarConfiguration::Interleaved,
        );
        let error = convert_to_rgb(&raw(descriptor, PixelBuffer::U8(vec![0, 0, 0]))).unwrap_err();
        assert!(matches!(error, ColorError::UnsupportedPhotometric(name) if name == "HSV"));
    }
}
