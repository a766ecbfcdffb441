//! Error taxonomy shared by every component.

use crate::cache::CacheError;
use crate::config::ConfigError;
use crate::dataset::DatasetError;
use crate::dispatcher::DecodeError;
use crate::frame::DescriptorError;
use crate::locator::LocatorError;
use crate::metadata::MetadataError;
use crate::multiframe::MultiframeError;
use crate::retrieve::RetrieveError;
use crate::worker_pool::{PoolError, TaskError};

use thiserror::Error;

/// Broad class of a failure, used to decide whether retrying with more data
/// can help.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Caller or deployment problem, never fixed by more bytes.
    Configuration,
    /// Bad or insufficient input data.
    Data,
    /// Request failed in the transport.
    Transport,
    /// Work was cancelled or the pool went away.
    Cancelled,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error(transparent)]
    Locator(#[from] LocatorError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    Descriptor(#[from] DescriptorError),

    #[error(transparent)]
    Retrieve(#[from] RetrieveError),

    #[error(transparent)]
    Dataset(#[from] DatasetError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Multiframe(#[from] MultiframeError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Pool(#[from] PoolError),
}

impl LoadError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LoadError::Locator(error) => error.kind(),
            LoadError::Config(error) => error.kind(),
            LoadError::Metadata(error) => error.kind(),
            LoadError::Descriptor(_) => ErrorKind::Data,
            LoadError::Retrieve(error) => error.kind(),
            LoadError::Dataset(error) => error.kind(),
            LoadError::Cache(error) => error.kind(),
            LoadError::Multiframe(error) => error.kind(),
            LoadError::Decode(error) => error.kind(),
            LoadError::Pool(error) => error.kind(),
        }
    }
}

impl From<TaskError<DecodeError>> for LoadError {
    fn from(error: TaskError<DecodeError>) -> Self {
        match error {
            TaskError::Failed(error) => LoadError::Decode(error),
            TaskError::Pool(error) => LoadError::Pool(error),
        }
    }
}
