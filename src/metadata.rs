//! Typed module records describing an image, keyed by image id.

use crate::error::ErrorKind;
use crate::frame::{DescriptorError, FrameDescriptor, ScalingParameters};

use dicom::core::Tag;
use dicom::object::InMemDicomObject;
use dicom_dictionary_std::tags;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MetadataError {
    #[error("No {module} metadata for {image_id}")]
    Missing {
        module: &'static str,
        image_id: String,
    },

    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
}

impl MetadataError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MetadataError::Missing { .. } => ErrorKind::Configuration,
            MetadataError::Descriptor(_) => ErrorKind::Data,
        }
    }
}

/// Image plane module.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImagePlane {
    pub pixel_spacing: Option<(f64, f64)>,
    pub slice_thickness: Option<f64>,
    pub image_position: Option<[f64; 3]>,
    pub image_orientation: Option<[f64; 6]>,
}

impl ImagePlane {
    pub fn from_dataset(dataset: &InMemDicomObject) -> Self {
        Self {
            pixel_spacing: floats(dataset, tags::PIXEL_SPACING).and_then(|v| match v[..] {
                [row, column] => Some((row, column)),
                _ => None,
            }),
            slice_thickness: floats(dataset, tags::SLICE_THICKNESS).and_then(|v| v.first().copied()),
            image_position: floats(dataset, tags::IMAGE_POSITION_PATIENT)
                .and_then(|v| v.try_into().ok()),
            image_orientation: floats(dataset, tags::IMAGE_ORIENTATION_PATIENT)
                .and_then(|v| v.try_into().ok()),
        }
    }
}

fn floats(dataset: &InMemDicomObject, tag: Tag) -> Option<Vec<f64>> {
    dataset.element(tag).ok()?.to_multi_float64().ok()
}

/// Rescale parameters of a dataset. Absent slope and intercept read as the
/// identity.
pub fn scaling_from_dataset(dataset: &InMemDicomObject) -> ScalingParameters {
    let value = |tag| floats(dataset, tag).and_then(|v| v.first().copied());
    let modality = dataset
        .element(tags::MODALITY)
        .ok()
        .and_then(|element| element.to_str().ok())
        .map(|modality| modality.trim().to_string())
        .unwrap_or_default();
    ScalingParameters {
        rescale_slope: value(tags::RESCALE_SLOPE).unwrap_or(1.0),
        rescale_intercept: value(tags::RESCALE_INTERCEPT).unwrap_or(0.0),
        modality,
        suv_factor: None,
    }
}

/// Everything known about one image.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageMetadata {
    pub descriptor: FrameDescriptor,
    pub plane: ImagePlane,
    pub scaling: ScalingParameters,
    pub transfer_syntax: Option<String>,
}

impl ImageMetadata {
    pub fn from_dataset(dataset: &InMemDicomObject) -> Result<Self, MetadataError> {
        Ok(Self {
            descriptor: FrameDescriptor::from_dataset(dataset)?,
            plane: ImagePlane::from_dataset(dataset),
            scaling: scaling_from_dataset(dataset),
            transfer_syntax: None,
        })
    }
}

/// Source of module records for an image id.
pub trait MetadataProvider: Send + Sync + fmt::Debug {
    fn pixel_module(&self, image_id: &str) -> Option<FrameDescriptor>;

    fn image_plane(&self, image_id: &str) -> Option<ImagePlane>;

    fn scaling(&self, image_id: &str) -> Option<ScalingParameters>;

    fn transfer_syntax(&self, image_id: &str) -> Option<String>;
}

/// Provider backed by records registered up front, e.g. from a study
/// metadata query.
#[derive(Debug, Clone, Default)]
pub struct StaticMetadataProvider {
    records: Arc<RwLock<HashMap<String, ImageMetadata>>>,
}

impl StaticMetadataProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, image_id: impl Into<String>, metadata: ImageMetadata) {
        self.records.write().insert(image_id.into(), metadata);
    }

    pub fn remove(&self, image_id: &str) -> Option<ImageMetadata> {
        self.records.write().remove(image_id)
    }

    fn with<T>(&self, image_id: &str, read: impl FnOnce(&ImageMetadata) -> Option<T>) -> Option<T> {
        self.records.read().get(image_id).and_then(read)
    }
}

impl MetadataProvider for StaticMetadataProvider {
    fn pixel_module(&self, image_id: &str) -> Option<FrameDescriptor> {
        self.with(image_id, |record| Some(record.descriptor.clone()))
    }

    fn image_plane(&self, image_id: &str) -> Option<ImagePlane> {
        self.with(image_id, |record| Some(record.plane.clone()))
    }

    fn scaling(&self, image_id: &str) -> Option<ScalingParameters> {
        self.with(image_id, |record| Some(record.scaling.clone()))
    }

    fn transfer_syntax(&self, image_id: &str) -> Option<String> {
        self.with(image_id, |record| record.transfer_syntax.clone())
    }
}
