//! Transfer-syntax dispatch and pixel post-processing.

use crate::codec::{CodecError, DecodeRequest};
use crate::color::{self, ColorError};
use crate::enums::DecodeStatus;
use crate::error::ErrorKind;
use crate::frame::{
    CompressedPayload, DecodedFrame, FrameDescriptor, PixelBuffer, SampleType, ScalingInfo,
    ScalingParameters, ScalingSkipped,
};
use crate::transfer_syntax::TransferSyntaxRegistry;
use crate::worker_pool::TaskHandler;

use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use web_time::Instant;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Unsupported transfer syntax: {0}")]
    UnsupportedTransferSyntax(String),

    #[error("Target buffer of type {target:?} cannot hold values in [{min}, {max}]")]
    UnsupportedTargetBuffer {
        target: SampleType,
        min: f64,
        max: f64,
    },

    #[error("Target buffer holds {actual} samples, decoded frame has {expected}")]
    TargetLengthMismatch { expected: usize, actual: usize },

    #[error("Decoding {transfer_syntax} failed: {source}")]
    Codec {
        transfer_syntax: String,
        #[source]
        source: CodecError,
    },

    #[error(transparent)]
    Color(#[from] ColorError),
}

impl DecodeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DecodeError::UnsupportedTransferSyntax(_)
            | DecodeError::UnsupportedTargetBuffer { .. }
            | DecodeError::Codec {
                source: CodecError::Unavailable { .. },
                ..
            }
            | DecodeError::Color(ColorError::UnsupportedPhotometric(_)) => ErrorKind::Configuration,
            DecodeError::TargetLengthMismatch { .. }
            | DecodeError::Codec { .. }
            | DecodeError::Color(_) => ErrorKind::Data,
        }
    }
}

/// Per-call options of [`Dispatcher::decode`].
#[derive(Debug, Clone, Default)]
pub struct DecodeOptions {
    /// Buffer to reuse for the output. Its length must equal the decoded
    /// sample count; its type is kept.
    pub target: Option<PixelBuffer>,
    /// Rescale to apply when `pre_scale` is on.
    pub scaling: Option<ScalingParameters>,
    pub pre_scale: bool,
    pub allow_float_rendering: bool,
}

#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: Arc<TransferSyntaxRegistry>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(TransferSyntaxRegistry::global().clone())
    }
}

/// How a requested rescale will be handled.
enum ScalePlan {
    NotRequested,
    Skipped(ScalingParameters, ScalingSkipped),
    Apply(ScalingParameters),
}

impl Dispatcher {
    pub fn new(registry: TransferSyntaxRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }

    pub fn registry(&self) -> &TransferSyntaxRegistry {
        &self.registry
    }

    /// Decode one payload of the frame described by `descriptor`.
    pub fn decode(
        &self,
        descriptor: &FrameDescriptor,
        payload: &CompressedPayload,
        options: DecodeOptions,
    ) -> Result<DecodedFrame, DecodeError> {
        let start = Instant::now();
        let entry = self
            .registry
            .get(&payload.transfer_syntax)
            .ok_or_else(|| DecodeError::UnsupportedTransferSyntax(payload.transfer_syntax.clone()))?;
        let adapter = &entry.adapter;

        let decode_level = if adapter.supports_decode_level() {
            payload.decode_level
        } else {
            0
        };
        let raw = adapter
            .decode(&DecodeRequest {
                transfer_syntax: entry.uid,
                descriptor,
                bytes: &payload.bytes,
                decode_level,
                is_final: payload.is_final,
            })
            .map_err(|source| DecodeError::Codec {
                transfer_syntax: payload.transfer_syntax.clone(),
                source,
            })?;

        // A partial payload decoded at full resolution is an approximation,
        // not a reduced image.
        let status = match payload.status {
            DecodeStatus::Subresolution if raw.decode_level == 0 => DecodeStatus::Lossy,
            status => status,
        };
        let level = raw.decode_level;

        let plan = plan_scaling(descriptor, &options);
        let (output_descriptor, samples) = if descriptor.is_color() {
            color::convert_to_rgb(&raw)?
        } else {
            let mut samples = raw.samples;
            sign_extend(&mut samples, descriptor);
            (raw.descriptor, samples)
        };

        let (min_value, max_value) = samples.min_max().unwrap_or((0.0, 0.0));
        let (pixels, scaling) = match plan {
            ScalePlan::Apply(parameters) => {
                let (slope, intercept) = parameters.effective();
                let (a, b) = (min_value * slope + intercept, max_value * slope + intercept);
                let (lo, hi) = (a.min(b).min(min_value), a.max(b).max(max_value));
                let mut pixels =
                    place(&samples, options.target, lo, hi, parameters.is_integral())?;
                pixels.apply_linear(slope, intercept);
                let (min_after, max_after) = pixels.min_max().unwrap_or((0.0, 0.0));
                let scaling = ScalingInfo {
                    requested: true,
                    applied: true,
                    parameters: Some(parameters),
                    skipped: None,
                    min_after,
                    max_after,
                };
                (pixels, scaling)
            }
            ScalePlan::Skipped(parameters, reason) => {
                let pixels = place(&samples, options.target, min_value, max_value, true)?;
                let mut scaling = ScalingInfo::unscaled(min_value, max_value);
                scaling.requested = true;
                scaling.parameters = Some(parameters);
                scaling.skipped = Some(reason);
                (pixels, scaling)
            }
            ScalePlan::NotRequested => {
                let integral = !matches!(samples, PixelBuffer::F32(_));
                let pixels = place(&samples, options.target, min_value, max_value, integral)?;
                (pixels, ScalingInfo::unscaled(min_value, max_value))
            }
        };

        let decode_duration = start.elapsed();
        debug!(
            transfer_syntax = %payload.transfer_syntax,
            codec = adapter.name(),
            ?status,
            decode_level,
            elapsed_ms = decode_duration.as_secs_f64() * 1000.0,
            "frame decoded"
        );

        Ok(DecodedFrame {
            descriptor: output_descriptor,
            pixels,
            transfer_syntax: payload.transfer_syntax.clone(),
            min_value,
            max_value,
            scaling,
            decode_duration,
            status,
            decode_level: level,
            percent_complete: payload.percent_complete,
        })
    }
}

fn plan_scaling(descriptor: &FrameDescriptor, options: &DecodeOptions) -> ScalePlan {
    let Some(parameters) = options.scaling.clone().filter(|_| options.pre_scale) else {
        return ScalePlan::NotRequested;
    };
    if descriptor.is_color() {
        ScalePlan::Skipped(parameters, ScalingSkipped::ColorImage)
    } else if !parameters.is_well_formed() {
        ScalePlan::Skipped(parameters, ScalingSkipped::MalformedParameters)
    } else if !parameters.is_integral() && !options.allow_float_rendering {
        ScalePlan::Skipped(parameters, ScalingSkipped::FloatRenderingDisabled)
    } else {
        ScalePlan::Apply(parameters)
    }
}

/// Restore the sign of values stored in fewer bits than their container.
pub(crate) fn sign_extend(samples: &mut PixelBuffer, descriptor: &FrameDescriptor) {
    if !descriptor.pixel_representation.is_signed() {
        return;
    }
    // Reinterpret unsigned containers coming from codecs that ignore
    // pixel representation.
    let reinterpreted = match &*samples {
        PixelBuffer::U8(values) => Some(PixelBuffer::I8(values.iter().map(|&v| v as i8).collect())),
        PixelBuffer::U16(values) => {
            Some(PixelBuffer::I16(values.iter().map(|&v| v as i16).collect()))
        }
        _ => None,
    };
    if let Some(reinterpreted) = reinterpreted {
        *samples = reinterpreted;
    }
    match samples {
        PixelBuffer::I8(values) if (1..8).contains(&descriptor.bits_stored) => {
            let shift = 8 - descriptor.bits_stored as u32;
            values.iter_mut().for_each(|v| *v = (*v << shift) >> shift);
        }
        PixelBuffer::I16(values) if (1..16).contains(&descriptor.bits_stored) => {
            let shift = 16 - descriptor.bits_stored as u32;
            values.iter_mut().for_each(|v| *v = (*v << shift) >> shift);
        }
        _ => {}
    }
}

/// Put samples into the caller's target or into a fresh buffer of the
/// smallest type holding `[min, max]`.
fn place(
    samples: &PixelBuffer,
    target: Option<PixelBuffer>,
    min: f64,
    max: f64,
    integral: bool,
) -> Result<PixelBuffer, DecodeError> {
    match target {
        Some(mut target) => {
            if target.len() != samples.len() {
                return Err(DecodeError::TargetLengthMismatch {
                    expected: samples.len(),
                    actual: target.len(),
                });
            }
            if !target.sample_type().holds(min, max, integral) {
                return Err(DecodeError::UnsupportedTargetBuffer {
                    target: target.sample_type(),
                    min,
                    max,
                });
            }
            samples.copy_into(&mut target);
            Ok(target)
        }
        None => {
            let kind = SampleType::smallest_for(min, max, integral);
            if kind == samples.sample_type() {
                Ok(samples.clone())
            } else {
                Ok(samples.convert_to(kind))
            }
        }
    }
}

/// Task type served by [`DecodeHandler`].
pub const DECODE_TASK: &str = "decodeTask";

/// One payload to decode, moved into the worker that runs it.
#[derive(Debug, Clone)]
pub struct DecodeJob {
    pub descriptor: FrameDescriptor,
    pub payload: CompressedPayload,
    pub options: DecodeOptions,
}

/// Runs [`Dispatcher::decode`] inside pool workers.
#[derive(Debug, Clone, Default)]
pub struct DecodeHandler {
    dispatcher: Dispatcher,
}

impl DecodeHandler {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }
}

impl TaskHandler for DecodeHandler {
    type Input = DecodeJob;
    type Output = DecodedFrame;
    type Error = DecodeError;

    fn supports(&self, task_type: &str) -> bool {
        task_type == DECODE_TASK
    }

    fn handle(&self, _task_type: &str, job: DecodeJob) -> Result<DecodedFrame, DecodeError> {
        self.dispatcher
            .decode(&job.descriptor, &job.payload, job.options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enums::{PixelRepresentation, PlanarConfiguration};
    use crate::transfer_syntax::uids;
    use proptest::prelude::*;

    fn payload(transfer_syntax: &str, bytes: Vec<u8>) -> CompressedPayload {
        CompressedPayload::complete(transfer_syntax, bytes)
    }

    fn u16_bytes(values: &[u16]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    #[test]
    fn unknown_transfer_syntax_is_configuration_error() {
        let descriptor = FrameDescriptor::monochrome(1, 1, 8, 8);
        let error = Dispatcher::default()
            .decode(&descriptor, &payload("1.2.3.4.5", vec![0]), DecodeOptions::default())
            .unwrap_err();
        assert!(matches!(error, DecodeError::UnsupportedTransferSyntax(ref uid) if uid == "1.2.3.4.5"));
        assert_eq!(error.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn missing_codec_is_configuration_error() {
        use crate::codec::dicom_rs::{DicomRsAdapter, Family};

        let mut registry = TransferSyntaxRegistry::empty();
        registry.register(uids::JPEG_2000, "JPEG 2000", Arc::new(DicomRsAdapter::new(Family::Jpeg2000)));
        let descriptor = FrameDescriptor::monochrome(2, 2, 8, 8);
        let error = Dispatcher::new(registry)
            .decode(&descriptor, &payload(uids::JPEG_2000, vec![0xFF, 0x4F]), DecodeOptions::default())
            .unwrap_err();
        assert!(matches!(
            error,
            DecodeError::Codec { source: CodecError::Unavailable { .. }, .. }
        ));
        assert_eq!(error.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn eleven_bit_negative_one_survives() {
        let descriptor = FrameDescriptor::monochrome(1, 2, 16, 11)
            .with_pixel_representation(PixelRepresentation::Signed);
        let frame = Dispatcher::default()
            .decode(
                &descriptor,
                &payload(uids::EXPLICIT_VR_LITTLE_ENDIAN, u16_bytes(&[0x07FF, 0x0005])),
                DecodeOptions::default(),
            )
            .unwrap();
        assert_eq!(frame.pixels, PixelBuffer::I8(vec![-1, 5]));
        assert_eq!((frame.min_value, frame.max_value), (-1.0, 5.0));
    }

    proptest! {
        #[test]
        fn sign_extension_restores_stored_value(bits_stored in 2u16..16, seed in any::<i16>()) {
            let half = 1i32 << (bits_stored - 1);
            let value = (seed as i32).rem_euclid(2 * half) - half;
            let stored = (value as u16) & ((1u16 << bits_stored) - 1);
            let descriptor = FrameDescriptor::monochrome(1, 1, 16, bits_stored)
                .with_pixel_representation(PixelRepresentation::Signed);
            let mut samples = PixelBuffer::U16(vec![stored]);
            sign_extend(&mut samples, &descriptor);
            prop_assert_eq!(samples, PixelBuffer::I16(vec![value as i16]));
        }
    }

    #[test]
    fn zero_bits_stored_leaves_samples_alone() {
        let descriptor = FrameDescriptor::monochrome(1, 1, 16, 0)
            .with_pixel_representation(PixelRepresentation::Signed);
        let mut samples = PixelBuffer::U16(vec![0x8001]);
        sign_extend(&mut samples, &descriptor);
        assert_eq!(samples, PixelBuffer::I16(vec![0x8001_u16 as i16]));
    }

    #[test]
    fn output_type_is_minimal_for_range() {
        let descriptor = FrameDescriptor::monochrome(1, 2, 16, 16);
        let frame = Dispatcher::default()
            .decode(
                &descriptor,
                &payload(uids::EXPLICIT_VR_LITTLE_ENDIAN, u16_bytes(&[0, 200])),
                DecodeOptions::default(),
            )
            .unwrap();
        assert_eq!(frame.pixels.sample_type(), SampleType::U8);

        let signed = descriptor.with_pixel_representation(PixelRepresentation::Signed);
        let frame = Dispatcher::default()
            .decode(
                &signed,
                &payload(uids::EXPLICIT_VR_LITTLE_ENDIAN, u16_bytes(&[(-10i16) as u16, 300])),
                DecodeOptions::default(),
            )
            .unwrap();
        assert_eq!(frame.pixels, PixelBuffer::I16(vec![-10, 300]));
    }

    #[test]
    fn target_length_must_match() {
        let descriptor = FrameDescriptor::monochrome(2, 2, 8, 8);
        let options = DecodeOptions {
            target: Some(PixelBuffer::zeroed(SampleType::U16, 3)),
            ..DecodeOptions::default()
        };
        let error = Dispatcher::default()
            .decode(&descriptor, &payload(uids::EXPLICIT_VR_LITTLE_ENDIAN, vec![1, 2, 3, 4]), options)
            .unwrap_err();
        assert!(matches!(error, DecodeError::TargetLengthMismatch { expected: 4, actual: 3 }));
        assert_eq!(error.kind(), ErrorKind::Data);
    }

    #[test]
    fn target_buffer_keeps_its_type() {
        let descriptor = FrameDescriptor::monochrome(2, 2, 8, 8);
        let options = DecodeOptions {
            target: Some(PixelBuffer::zeroed(SampleType::F32, 4)),
            ..DecodeOptions::default()
        };
        let frame = Dispatcher::default()
            .decode(&descriptor, &payload(uids::EXPLICIT_VR_LITTLE_ENDIAN, vec![1, 2, 3, 4]), options)
            .unwrap();
        assert_eq!(frame.pixels, PixelBuffer::F32(vec![1.0, 2.0, 3.0, 4.0]));
    }

    #[test]
    fn integral_rescale_is_applied() {
        let descriptor = FrameDescriptor::monochrome(1, 2, 16, 12);
        let options = DecodeOptions {
            scaling: Some(ScalingParameters::linear(1.0, -1024.0)),
            pre_scale: true,
            ..DecodeOptions::default()
        };
        let frame = Dispatcher::default()
            .decode(
                &descriptor,
                &payload(uids::EXPLICIT_VR_LITTLE_ENDIAN, u16_bytes(&[0, 2048])),
                options,
            )
            .unwrap();
        assert!(frame.scaling.applied);
        assert_eq!(frame.pixels, PixelBuffer::I16(vec![-1024, 1024]));
        assert_eq!((frame.scaling.min_after, frame.scaling.max_after), (-1024.0, 1024.0));
        assert_eq!((frame.min_value, frame.max_value), (0.0, 2048.0));
    }

    #[test]
    fn fractional_rescale_without_float_rendering_is_flagged() {
        let descriptor = FrameDescriptor::monochrome(1, 2, 8, 8);
        let options = DecodeOptions {
            scaling: Some(ScalingParameters::linear(0.5, 0.0)),
            pre_scale: true,
            allow_float_rendering: false,
            ..DecodeOptions::default()
        };
        let frame = Dispatcher::default()
            .decode(&descriptor, &payload(uids::EXPLICIT_VR_LITTLE_ENDIAN, vec![10, 20]), options)
            .unwrap();
        assert!(frame.scaling.requested);
        assert!(!frame.scaling.applied);
        assert_eq!(frame.scaling.skipped, Some(ScalingSkipped::FloatRenderingDisabled));
        assert_eq!(frame.pixels, PixelBuffer::U8(vec![10, 20]));
    }

    #[test]
    fn fractional_rescale_with_float_rendering_yields_floats() {
        let descriptor = FrameDescriptor::monochrome(1, 2, 8, 8);
        let options = DecodeOptions {
            scaling: Some(ScalingParameters::linear(0.5, 0.0)),
            pre_scale: true,
            allow_float_rendering: true,
            ..DecodeOptions::default()
        };
        let frame = Dispatcher::default()
            .decode(&descriptor, &payload(uids::EXPLICIT_VR_LITTLE_ENDIAN, vec![10, 21]), options)
            .unwrap();
        assert_eq!(frame.pixels, PixelBuffer::F32(vec![5.0, 10.5]));
        assert_eq!(frame.scaling.max_after, 10.5);
    }

    #[test]
    fn color_frames_are_converted_and_never_scaled() {
        let descriptor = FrameDescriptor::monochrome(1, 1, 8, 8).with_color(
            3,
            "RGB",
            PlanarConfiguration::Interleaved,
        );
        let options = DecodeOptions {
            scaling: Some(ScalingParameters::linear(2.0, 0.0)),
            pre_scale: true,
            ..DecodeOptions::default()
        };
        let frame = Dispatcher::default()
            .decode(&descriptor, &payload(uids::EXPLICIT_VR_LITTLE_ENDIAN, vec![1, 2, 3]), options)
            .unwrap();
        assert_eq!(frame.pixels, PixelBuffer::U8(vec![1, 2, 3]));
        assert_eq!(frame.scaling.skipped, Some(ScalingSkipped::ColorImage));
        assert_eq!(frame.status, DecodeStatus::Complete);
    }

    #[test]
    fn every_default_native_syntax_yields_full_sample_count() {
        let descriptor = FrameDescriptor::monochrome(3, 4, 8, 8);
        for uid in [
            uids::IMPLICIT_VR_LITTLE_ENDIAN,
            uids::EXPLICIT_VR_LITTLE_ENDIAN,
            uids::DEFLATED_EXPLICIT_VR_LITTLE_ENDIAN,
            uids::EXPLICIT_VR_BIG_ENDIAN,
        ] {
            let frame = Dispatcher::default()
                .decode(&descriptor, &payload(uid, vec![7; 12]), DecodeOptions::default())
                .unwrap();
            assert_eq!(frame.pixels.len(), 12, "{uid}");
        }
    }

    fn streamed(bytes: Vec<u8>, decode_level: u8) -> CompressedPayload {
        CompressedPayload {
            is_final: false,
            status: DecodeStatus::Subresolution,
            percent_complete: 5.0,
            decode_level,
            ..payload(uids::EXPLICIT_VR_LITTLE_ENDIAN, bytes)
        }
    }

    #[test]
    fn full_resolution_decode_of_partial_data_is_lossy() {
        let descriptor = FrameDescriptor::monochrome(4, 4, 8, 8);
        let frame = Dispatcher::default()
            .decode(&descriptor, &streamed(vec![9; 3], 3), DecodeOptions::default())
            .unwrap();
        assert_eq!(frame.status, DecodeStatus::Lossy);
        assert_eq!(frame.decode_level, 0);
        assert_eq!((frame.descriptor.rows, frame.descriptor.columns), (4, 4));
    }

    /// Keeps every other row and column.
    #[derive(Debug)]
    struct DecimatingAdapter;

    impl crate::codec::CodecAdapter for DecimatingAdapter {
        fn name(&self) -> &'static str {
            "decimating"
        }

        fn supports_decode_level(&self) -> bool {
            true
        }

        fn decode(&self, request: &DecodeRequest<'_>) -> Result<crate::codec::RawFrame, CodecError> {
            let mut descriptor = request.descriptor.clone();
            descriptor.rows = descriptor.rows.div_ceil(2);
            descriptor.columns = descriptor.columns.div_ceil(2);
            Ok(crate::codec::RawFrame {
                samples: PixelBuffer::U8(vec![1; descriptor.pixel_count()]),
                descriptor,
                decode_level: request.decode_level.min(1),
            })
        }
    }

    #[test]
    fn adapter_decode_level_keeps_subresolution_status() {
        let mut registry = TransferSyntaxRegistry::empty();
        registry.register(uids::EXPLICIT_VR_LITTLE_ENDIAN, "Decimated", Arc::new(DecimatingAdapter));
        let descriptor = FrameDescriptor::monochrome(4, 4, 8, 8);
        let frame = Dispatcher::new(registry)
            .decode(&descriptor, &streamed(vec![9; 3], 3), DecodeOptions::default())
            .unwrap();
        assert_eq!(frame.status, DecodeStatus::Subresolution);
        assert_eq!(frame.decode_level, 1);
        assert_eq!(frame.pixels.len(), 4);
    }

    #[tokio::test]
    async fn decode_handler_runs_in_pool() {
        use crate::config::PoolConfig;
        use crate::worker_pool::WorkerPool;

        let pool = WorkerPool::new(
            PoolConfig {
                max_workers: 1,
                start_workers_on_demand: true,
            },
            DecodeHandler::default(),
        );
        let job = DecodeJob {
            descriptor: FrameDescriptor::monochrome(1, 2, 8, 8),
            payload: payload(uids::EXPLICIT_VR_LITTLE_ENDIAN, vec![3, 9]),
            options: DecodeOptions::default(),
        };
        let (_, result) = pool.submit(DECODE_TASK, job, 0);
        let frame = result.await.unwrap();
        assert_eq!(frame.pixels, PixelBuffer::U8(vec![3, 9]));
        assert_eq!(pool.stats().completed, 1);
        pool.shutdown();
    }
}
