//! Per-frame attribute resolution for enhanced multiframe containers.
//!
//! Functional group macros are flattened onto the container attributes:
//! first every group of the shared item, then every group of the frame's
//! per-frame item, so per-frame values win.

use crate::error::ErrorKind;

use dicom::object::InMemDicomObject;
use dicom_dictionary_std::tags;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MultiframeError {
    #[error("Frame {frame} requested, container has {frames}")]
    FrameOutOfRange { frame: u32, frames: u32 },
}

impl MultiframeError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Configuration
    }
}

pub fn number_of_frames(container: &InMemDicomObject) -> u32 {
    container
        .element(tags::NUMBER_OF_FRAMES)
        .ok()
        .and_then(|element| element.to_int::<u32>().ok())
        .unwrap_or(1)
}

/// Attributes of the 1-based `frame`. Single-frame containers are returned
/// unchanged.
pub fn combine_frame(container: &InMemDicomObject, frame: u32) -> Result<InMemDicomObject, MultiframeError> {
    let frames = number_of_frames(container);
    if frames <= 1 {
        return Ok(container.clone());
    }
    if frame == 0 || frame > frames {
        return Err(MultiframeError::FrameOutOfRange { frame, frames });
    }

    let mut combined = container.clone();
    combined.remove_element(tags::SHARED_FUNCTIONAL_GROUPS_SEQUENCE);
    combined.remove_element(tags::PER_FRAME_FUNCTIONAL_GROUPS_SEQUENCE);

    let shared = group_item(container, tags::SHARED_FUNCTIONAL_GROUPS_SEQUENCE, 0);
    let per_frame = group_item(
        container,
        tags::PER_FRAME_FUNCTIONAL_GROUPS_SEQUENCE,
        frame as usize - 1,
    );
    for item in shared.into_iter().chain(per_frame) {
        flatten_into(&mut combined, item);
    }
    Ok(combined)
}

fn group_item(
    container: &InMemDicomObject,
    tag: dicom::core::Tag,
    index: usize,
) -> Option<&InMemDicomObject> {
    container.element(tag).ok()?.items()?.get(index)
}

/// Copy the contents of each functional group macro in `item` onto
/// `target`.
fn flatten_into(target: &mut InMemDicomObject, item: &InMemDicomObject) {
    for group in item {
        match group.items().and_then(|items| items.first()) {
            Some(macro_item) => {
                for element in macro_item {
                    target.put(element.clone());
                }
            }
            None => {
                target.put(group.clone());
            }
        }
    }
}

/// Memoized [`combine_frame`] results per container key and frame.
#[derive(Debug, Clone, Default)]
pub struct MultiframeIndex {
    entries: Arc<Mutex<HashMap<(String, u32), Arc<InMemDicomObject>>>>,
}

impl MultiframeIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolve(
        &self,
        key: &str,
        container: &InMemDicomObject,
        frame: u32,
    ) -> Result<Arc<InMemDicomObject>, MultiframeError> {
        let entry = (key.to_string(), frame);
        if let Some(combined) = self.entries.lock().get(&entry) {
            return Ok(Arc::clone(combined));
        }
        let combined = Arc::new(combine_frame(container, frame)?);
        debug!(key, frame, "frame attributes combined");
        self.entries.lock().insert(entry, Arc::clone(&combined));
        Ok(combined)
    }

    /// Drop memoized frames of a container, e.g. after it was replaced.
    pub fn forget(&self, key: &str) {
        self.entries.lock().retain(|(container, _), _| container != key);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
