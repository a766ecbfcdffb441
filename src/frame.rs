use crate::enums::{DecodeStatus, PixelRepresentation, PlanarConfiguration};

use dicom::core::Tag;
use dicom::object::InMemDicomObject;
use dicom_dictionary_std::tags;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::time::Duration;
use thiserror::Error;

/// Buffers at least this long are scanned in parallel.
const PARALLEL_SCAN_THRESHOLD: usize = 1 << 16;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("Missing attribute {0}")]
    MissingAttribute(&'static str),

    #[error("Invalid attribute {name}: {reason}")]
    InvalidAttribute { name: &'static str, reason: String },
}

/// One channel of a palette color lookup table.
#[derive(Debug, Clone, PartialEq)]
pub struct LutChannel {
    pub first_mapped: i32,
    pub bits: u16,
    pub data: Vec<u16>,
}

impl LutChannel {
    /// Look up a stored value, clamping to the table's mapped range, scaled to 8 bits.
    pub fn lookup_u8(&self, value: i32) -> u8 {
        if self.data.is_empty() {
            return 0;
        }
        let index = (value - self.first_mapped).clamp(0, self.data.len() as i32 - 1) as usize;
        let entry = self.data[index];
        if self.bits > 8 {
            (entry >> 8) as u8
        } else {
            entry as u8
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PaletteLut {
    pub red: LutChannel,
    pub green: LutChannel,
    pub blue: LutChannel,
}

/// Geometry and sample layout of one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameDescriptor {
    pub rows: u16,
    pub columns: u16,
    pub samples_per_pixel: u16,
    pub bits_allocated: u16,
    pub bits_stored: u16,
    pub pixel_representation: PixelRepresentation,
    pub planar_configuration: PlanarConfiguration,
    pub photometric_interpretation: String,
    pub palette: Option<PaletteLut>,
}

impl FrameDescriptor {
    /// Unsigned MONOCHROME2 with the given bit depth.
    pub fn monochrome(rows: u16, columns: u16, bits_allocated: u16, bits_stored: u16) -> Self {
        Self {
            rows,
            columns,
            samples_per_pixel: 1,
            bits_allocated,
            bits_stored,
            pixel_representation: PixelRepresentation::Unsigned,
            planar_configuration: PlanarConfiguration::Interleaved,
            photometric_interpretation: "MONOCHROME2".to_string(),
            palette: None,
        }
    }

    pub fn with_pixel_representation(mut self, representation: PixelRepresentation) -> Self {
        self.pixel_representation = representation;
        self
    }

    pub fn with_color(
        mut self,
        samples_per_pixel: u16,
        photometric_interpretation: &str,
        planar_configuration: PlanarConfiguration,
    ) -> Self {
        self.samples_per_pixel = samples_per_pixel;
        self.photometric_interpretation = photometric_interpretation.to_string();
        self.planar_configuration = planar_configuration;
        self
    }

    pub fn pixel_count(&self) -> usize {
        self.rows as usize * self.columns as usize
    }

    pub fn sample_count(&self) -> usize {
        self.pixel_count() * self.samples_per_pixel as usize
    }

    /// Samples actually stored for one uncompressed frame. YBR_FULL_422
    /// keeps one Cb/Cr pair per two pixels.
    pub fn stored_sample_count(&self) -> usize {
        if self.samples_per_pixel == 3 && self.photometric_interpretation == "YBR_FULL_422" {
            self.pixel_count() * 2
        } else {
            self.sample_count()
        }
    }

    /// Size in bytes of one uncompressed frame.
    pub fn frame_size_bytes(&self) -> usize {
        if self.bits_allocated == 1 {
            self.stored_sample_count().div_ceil(8)
        } else {
            self.stored_sample_count() * (self.bits_allocated as usize).div_ceil(8)
        }
    }

    pub fn is_color(&self) -> bool {
        self.samples_per_pixel > 1 || self.photometric_interpretation == "PALETTE COLOR"
    }

    /// Read the image pixel module from a dataset.
    pub fn from_dataset(dataset: &InMemDicomObject) -> Result<Self, DescriptorError> {
        let rows = read_u16(dataset, tags::ROWS, "Rows")?;
        let columns = read_u16(dataset, tags::COLUMNS, "Columns")?;
        let bits_allocated = read_u16(dataset, tags::BITS_ALLOCATED, "BitsAllocated")?;
        let samples_per_pixel =
            read_u16(dataset, tags::SAMPLES_PER_PIXEL, "SamplesPerPixel").unwrap_or(1);
        let bits_stored =
            read_u16(dataset, tags::BITS_STORED, "BitsStored").unwrap_or(bits_allocated);
        if bits_stored == 0 || bits_stored > bits_allocated {
            return Err(DescriptorError::InvalidAttribute {
                name: "BitsStored",
                reason: format!("{bits_stored} with {bits_allocated} bits allocated"),
            });
        }
        let pixel_representation = PixelRepresentation::from_value(
            read_u16(dataset, tags::PIXEL_REPRESENTATION, "PixelRepresentation").unwrap_or(0),
        );
        let planar_configuration = PlanarConfiguration::from_value(
            read_u16(dataset, tags::PLANAR_CONFIGURATION, "PlanarConfiguration").unwrap_or(0),
        );
        let photometric_interpretation = dataset
            .element(tags::PHOTOMETRIC_INTERPRETATION)
            .ok()
            .and_then(|element| element.to_str().ok())
            .map(|value| value.trim().to_string())
            .unwrap_or_else(|| "MONOCHROME2".to_string());

        let palette = if photometric_interpretation == "PALETTE COLOR" {
            Some(read_palette(dataset)?)
        } else {
            None
        };

        Ok(Self {
            rows,
            columns,
            samples_per_pixel,
            bits_allocated,
            bits_stored,
            pixel_representation,
            planar_configuration,
            photometric_interpretation,
            palette,
        })
    }
}

fn read_u16(
    dataset: &InMemDicomObject,
    tag: Tag,
    name: &'static str,
) -> Result<u16, DescriptorError> {
    dataset
        .element(tag)
        .map_err(|_| DescriptorError::MissingAttribute(name))?
        .to_int::<u16>()
        .map_err(|e| DescriptorError::InvalidAttribute {
            name,
            reason: e.to_string(),
        })
}

fn read_palette(dataset: &InMemDicomObject) -> Result<PaletteLut, DescriptorError> {
    Ok(PaletteLut {
        red: read_lut_channel(
            dataset,
            tags::RED_PALETTE_COLOR_LOOKUP_TABLE_DESCRIPTOR,
            tags::RED_PALETTE_COLOR_LOOKUP_TABLE_DATA,
            "RedPaletteColorLookupTable",
        )?,
        green: read_lut_channel(
            dataset,
            tags::GREEN_PALETTE_COLOR_LOOKUP_TABLE_DESCRIPTOR,
            tags::GREEN_PALETTE_COLOR_LOOKUP_TABLE_DATA,
            "GreenPaletteColorLookupTable",
        )?,
        blue: read_lut_channel(
            dataset,
            tags::BLUE_PALETTE_COLOR_LOOKUP_TABLE_DESCRIPTOR,
            tags::BLUE_PALETTE_COLOR_LOOKUP_TABLE_DATA,
            "BluePaletteColorLookupTable",
        )?,
    })
}

fn read_lut_channel(
    dataset: &InMemDicomObject,
    descriptor_tag: Tag,
    data_tag: Tag,
    name: &'static str,
) -> Result<LutChannel, DescriptorError> {
    let descriptor = dataset
        .element(descriptor_tag)
        .map_err(|_| DescriptorError::MissingAttribute(name))?
        .to_multi_int::<i32>()
        .map_err(|e| DescriptorError::InvalidAttribute {
            name,
            reason: e.to_string(),
        })?;
    if descriptor.len() < 3 {
        return Err(DescriptorError::InvalidAttribute {
            name,
            reason: format!("expected 3 values, found {}", descriptor.len()),
        });
    }
    let raw = dataset
        .element(data_tag)
        .map_err(|_| DescriptorError::MissingAttribute(name))?
        .to_bytes()
        .map_err(|e| DescriptorError::InvalidAttribute {
            name,
            reason: e.to_string(),
        })?;
    let bits = descriptor[2] as u16;
    let data = if bits > 8 {
        raw.chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect()
    } else {
        raw.iter().map(|&value| value as u16).collect()
    };
    Ok(LutChannel {
        first_mapped: descriptor[1],
        bits,
        data,
    })
}

/// Element type of a [`PixelBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleType {
    U8,
    I8,
    U16,
    I16,
    F32,
}

impl SampleType {
    /// Whether every value in `[min, max]` is exactly representable.
    pub fn holds(self, min: f64, max: f64, integral: bool) -> bool {
        let (lo, hi) = match self {
            SampleType::U8 => (u8::MIN as f64, u8::MAX as f64),
            SampleType::I8 => (i8::MIN as f64, i8::MAX as f64),
            SampleType::U16 => (u16::MIN as f64, u16::MAX as f64),
            SampleType::I16 => (i16::MIN as f64, i16::MAX as f64),
            SampleType::F32 => return true,
        };
        integral && min >= lo && max <= hi
    }

    /// Smallest type that losslessly represents the range.
    pub fn smallest_for(min: f64, max: f64, integral: bool) -> Self {
        [
            SampleType::U8,
            SampleType::I8,
            SampleType::U16,
            SampleType::I16,
        ]
        .into_iter()
        .find(|kind| kind.holds(min, max, integral))
        .unwrap_or(SampleType::F32)
    }
}

/// Typed sample storage of a decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub enum PixelBuffer {
    U8(Vec<u8>),
    I8(Vec<i8>),
    U16(Vec<u16>),
    I16(Vec<i16>),
    F32(Vec<f32>),
}

macro_rules! with_samples {
    ($buffer:expr, $samples:ident => $body:expr) => {
        match $buffer {
            PixelBuffer::U8($samples) => $body,
            PixelBuffer::I8($samples) => $body,
            PixelBuffer::U16($samples) => $body,
            PixelBuffer::I16($samples) => $body,
            PixelBuffer::F32($samples) => $body,
        }
    };
}

impl PixelBuffer {
    /// Zero-filled buffer, typically handed back in as a reusable target.
    pub fn zeroed(kind: SampleType, len: usize) -> Self {
        match kind {
            SampleType::U8 => PixelBuffer::U8(vec![0; len]),
            SampleType::I8 => PixelBuffer::I8(vec![0; len]),
            SampleType::U16 => PixelBuffer::U16(vec![0; len]),
            SampleType::I16 => PixelBuffer::I16(vec![0; len]),
            SampleType::F32 => PixelBuffer::F32(vec![0.0; len]),
        }
    }

    pub fn len(&self) -> usize {
        with_samples!(self, samples => samples.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn sample_type(&self) -> SampleType {
        match self {
            PixelBuffer::U8(_) => SampleType::U8,
            PixelBuffer::I8(_) => SampleType::I8,
            PixelBuffer::U16(_) => SampleType::U16,
            PixelBuffer::I16(_) => SampleType::I16,
            PixelBuffer::F32(_) => SampleType::F32,
        }
    }

    /// Native-endian byte view of the samples.
    pub fn as_bytes(&self) -> &[u8] {
        with_samples!(self, samples => bytemuck::cast_slice(samples.as_slice()))
    }

    pub fn get(&self, index: usize) -> Option<f64> {
        with_samples!(self, samples => samples.get(index).map(|&v| v as f64))
    }

    /// Observed minimum and maximum, `None` for an empty buffer.
    pub fn min_max(&self) -> Option<(f64, f64)> {
        if self.is_empty() {
            return None;
        }
        let (min, max) = with_samples!(self, samples => scan_range(samples));
        Some((min, max))
    }

    /// Copy every sample into a new buffer of `kind`. The caller guarantees
    /// the values fit.
    pub fn convert_to(&self, kind: SampleType) -> PixelBuffer {
        with_samples!(self, samples => match kind {
            SampleType::U8 => PixelBuffer::U8(samples.iter().map(|&v| v as u8).collect()),
            SampleType::I8 => PixelBuffer::I8(samples.iter().map(|&v| v as i8).collect()),
            SampleType::U16 => PixelBuffer::U16(samples.iter().map(|&v| v as u16).collect()),
            SampleType::I16 => PixelBuffer::I16(samples.iter().map(|&v| v as i16).collect()),
            SampleType::F32 => PixelBuffer::F32(samples.iter().map(|&v| v as f32).collect()),
        })
    }

    /// Overwrite `target` with these samples, keeping the target's type.
    /// Lengths must match.
    pub fn copy_into(&self, target: &mut PixelBuffer) {
        with_samples!(self, source => match target {
            PixelBuffer::U8(dst) => dst.iter_mut().zip(source).for_each(|(d, &s)| *d = s as u8),
            PixelBuffer::I8(dst) => dst.iter_mut().zip(source).for_each(|(d, &s)| *d = s as i8),
            PixelBuffer::U16(dst) => dst.iter_mut().zip(source).for_each(|(d, &s)| *d = s as u16),
            PixelBuffer::I16(dst) => dst.iter_mut().zip(source).for_each(|(d, &s)| *d = s as i16),
            PixelBuffer::F32(dst) => dst.iter_mut().zip(source).for_each(|(d, &s)| *d = s as f32),
        })
    }

    /// Apply `value * slope + intercept` in place, rounding for integer types.
    pub fn apply_linear(&mut self, slope: f64, intercept: f64) {
        macro_rules! rescale {
            ($samples:expr, $ty:ty) => {
                $samples
                    .par_iter_mut()
                    .for_each(|v| *v = (*v as f64 * slope + intercept).round() as $ty)
            };
        }
        match self {
            PixelBuffer::U8(samples) => rescale!(samples, u8),
            PixelBuffer::I8(samples) => rescale!(samples, i8),
            PixelBuffer::U16(samples) => rescale!(samples, u16),
            PixelBuffer::I16(samples) => rescale!(samples, i16),
            PixelBuffer::F32(samples) => samples
                .par_iter_mut()
                .for_each(|v| *v = (*v as f64 * slope + intercept) as f32),
        }
    }
}

fn scan_range<T>(samples: &[T]) -> (f64, f64)
where
    T: Copy + Into<f64> + Send + Sync,
{
    let fold = |(min, max): (f64, f64), value: f64| (min.min(value), max.max(value));
    let identity = (f64::INFINITY, f64::NEG_INFINITY);
    if samples.len() >= PARALLEL_SCAN_THRESHOLD {
        samples
            .par_iter()
            .map(|&v| Into::<f64>::into(v))
            .fold(|| identity, fold)
            .reduce(|| identity, |a, b| (a.0.min(b.0), a.1.max(b.1)))
    } else {
        samples.iter().map(|&v| Into::<f64>::into(v)).fold(identity, fold)
    }
}

/// Linear rescale and optional per-modality factor for stored values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingParameters {
    pub rescale_slope: f64,
    pub rescale_intercept: f64,
    #[serde(default)]
    pub modality: String,
    /// Activity-concentration factor (SUVbw) applied to PT images.
    #[serde(default)]
    pub suv_factor: Option<f64>,
}

impl ScalingParameters {
    pub fn linear(rescale_slope: f64, rescale_intercept: f64) -> Self {
        Self {
            rescale_slope,
            rescale_intercept,
            modality: String::new(),
            suv_factor: None,
        }
    }

    /// Effective `(slope, intercept)` including the modality factor.
    pub fn effective(&self) -> (f64, f64) {
        match self.suv_factor {
            Some(factor) if self.modality == "PT" => (
                self.rescale_slope * factor,
                self.rescale_intercept * factor,
            ),
            _ => (self.rescale_slope, self.rescale_intercept),
        }
    }

    pub fn is_well_formed(&self) -> bool {
        let (slope, intercept) = self.effective();
        slope.is_finite() && intercept.is_finite()
    }

    pub fn is_integral(&self) -> bool {
        let (slope, intercept) = self.effective();
        slope.fract() == 0.0 && intercept.fract() == 0.0
    }

    pub fn is_identity(&self) -> bool {
        self.effective() == (1.0, 0.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalingSkipped {
    /// Scaling would need float samples and float rendering is off.
    FloatRenderingDisabled,
    /// Slope or intercept is not a finite number.
    MalformedParameters,
    /// Color frames are never rescaled.
    ColorImage,
}

/// What happened to a requested rescale.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalingInfo {
    pub requested: bool,
    pub applied: bool,
    pub parameters: Option<ScalingParameters>,
    pub skipped: Option<ScalingSkipped>,
    pub min_after: f64,
    pub max_after: f64,
}

impl ScalingInfo {
    pub(crate) fn unscaled(min: f64, max: f64) -> Self {
        Self {
            requested: false,
            applied: false,
            parameters: None,
            skipped: None,
            min_after: min,
            max_after: max,
        }
    }
}

/// Compressed pixel bytes for one frame as delivered by retrieval.
#[derive(Debug, Clone, PartialEq)]
pub struct CompressedPayload {
    pub transfer_syntax: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
    /// Location of `bytes` within the accumulated response body.
    pub pixel_range: Range<usize>,
    pub is_final: bool,
    pub status: DecodeStatus,
    pub percent_complete: f64,
    /// Subresolution level to decode at, 0 is full resolution.
    pub decode_level: u8,
}

impl CompressedPayload {
    /// A complete payload, as produced by a single-shot fetch.
    pub fn complete(transfer_syntax: impl Into<String>, bytes: Vec<u8>) -> Self {
        let len = bytes.len();
        Self {
            transfer_syntax: transfer_syntax.into(),
            content_type: "application/octet-stream".to_string(),
            bytes,
            pixel_range: 0..len,
            is_final: true,
            status: DecodeStatus::Complete,
            percent_complete: 100.0,
            decode_level: 0,
        }
    }
}

/// Decoded samples for one frame. Never mutated after delivery; each
/// progressive update yields a new value.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFrame {
    /// Geometry of `pixels`, reduced when decoded at a subresolution level.
    pub descriptor: FrameDescriptor,
    pub pixels: PixelBuffer,
    pub transfer_syntax: String,
    pub min_value: f64,
    pub max_value: f64,
    pub scaling: ScalingInfo,
    pub decode_duration: Duration,
    pub status: DecodeStatus,
    pub decode_level: u8,
    pub percent_complete: f64,
}
