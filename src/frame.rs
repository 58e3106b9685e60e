//! Tracked frame: the logical unit the sender ships.
//!
//! One frame couples a timestamp with an optional image, a dictionary of
//! named tool poses, and free-form custom fields. Frames are assembled by a
//! channel from its buffers at a common timestamp, handed to the message
//! factory, and discarded.

use crate::buffer::{FieldMap, ImageFrame, ItemStatus};
use crate::math::Matrix4x4;
use std::collections::BTreeMap;

/// One named pose within a frame, with its device-reported validity.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameTransform {
    pub matrix: Matrix4x4,
    pub valid: bool,
}

#[derive(Debug, Clone, Default)]
pub struct TrackedFrame {
    /// Acquisition timestamp in system seconds.
    pub timestamp: f64,
    pub image: Option<ImageFrame>,
    /// Poses keyed by transform name ("ProbeToReference" etc).
    pub transforms: BTreeMap<String, FrameTransform>,
    pub custom_fields: FieldMap,
}

impl TrackedFrame {
    pub fn new(timestamp: f64) -> Self {
        Self {
            timestamp,
            ..Default::default()
        }
    }

    pub fn set_transform(&mut self, name: impl Into<String>, matrix: Matrix4x4, status: ItemStatus) {
        self.transforms.insert(
            name.into(),
            FrameTransform {
                matrix,
                valid: status.is_valid(),
            },
        );
    }

    pub fn transform(&self, name: &str) -> Option<&FrameTransform> {
        self.transforms.get(name)
    }

    pub fn set_custom_field(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.custom_fields.insert(name.into(), value.into());
    }

    pub fn custom_field(&self, name: &str) -> Option<&str> {
        self.custom_fields.get(name).map(String::as_str)
    }
}
