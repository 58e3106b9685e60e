//! Buffer element types: image frames, tool poses, and the timestamped item
//! wrapper stored in the ring.

use crate::math::Matrix4x4;
use std::collections::BTreeMap;

/// Validity of one stored sample, as reported by the acquisition device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ItemStatus {
    #[default]
    Ok,
    /// The device produced no data for this slot.
    Missing,
    /// The device produced data it flagged as unusable.
    Invalid,
}

impl ItemStatus {
    #[inline]
    pub fn is_valid(self) -> bool {
        self == ItemStatus::Ok
    }
}

/// Scalar type of one image component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PixelType {
    #[default]
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    F32,
    F64,
}

impl PixelType {
    pub fn bytes_per_scalar(self) -> usize {
        match self {
            PixelType::U8 | PixelType::I8 => 1,
            PixelType::U16 | PixelType::I16 => 2,
            PixelType::U32 | PixelType::I32 | PixelType::F32 => 4,
            PixelType::F64 => 8,
        }
    }
}

/// Acquisition mode of the image stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImageType {
    #[default]
    BMode,
    Rf,
}

/// Row/column ordering of the pixel data relative to the transducer.
/// Marked-near/far, Unmarked-near/far; the wire format carries it verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImageOrientation {
    #[default]
    Mf,
    Mn,
    Uf,
    Un,
}

/// Geometry of one image stream. Every frame written to a buffer must match
/// the buffer's format exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageFormat {
    /// Frame size in pixels (columns, rows, slices).
    pub size: [usize; 3],
    pub pixel_type: PixelType,
    pub components: usize,
    pub image_type: ImageType,
    pub orientation: ImageOrientation,
}

impl ImageFormat {
    pub fn bytes_per_pixel(&self) -> usize {
        self.pixel_type.bytes_per_scalar() * self.components
    }

    pub fn frame_bytes(&self) -> usize {
        self.size[0] * self.size[1] * self.size[2] * self.bytes_per_pixel()
    }
}

/// One image frame: geometry plus raw pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageFrame {
    pub format: ImageFormat,
    pub pixels: Vec<u8>,
}

impl ImageFrame {
    pub fn new(format: ImageFormat, pixels: Vec<u8>) -> Self {
        Self { format, pixels }
    }
}

/// Payload variant stored in a buffer slot: a video frame or a tool pose.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamPayload {
    Image(ImageFrame),
    Transform(Matrix4x4),
}

impl StreamPayload {
    pub fn as_image(&self) -> Option<&ImageFrame> {
        match self {
            StreamPayload::Image(frame) => Some(frame),
            StreamPayload::Transform(_) => None,
        }
    }

    pub fn as_transform(&self) -> Option<&Matrix4x4> {
        match self {
            StreamPayload::Transform(matrix) => Some(matrix),
            StreamPayload::Image(_) => None,
        }
    }
}

/// Arbitrary string-keyed metadata attached to an item or a frame.
pub type FieldMap = BTreeMap<String, String>;

/// One element of the timestamped circular buffer.
///
/// `uid` is assigned by the buffer, strictly monotonic, never reused.
/// `index` is the producer's own counter and may skip values when the
/// device drops frames.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamItem {
    pub uid: u64,
    pub index: u64,
    pub filtered_ts: f64,
    pub unfiltered_ts: f64,
    pub status: ItemStatus,
    pub payload: StreamPayload,
    pub custom_fields: FieldMap,
}

impl StreamItem {
    /// True if the item carries usable video data.
    pub fn has_valid_video_data(&self) -> bool {
        self.status.is_valid() && matches!(self.payload, StreamPayload::Image(_))
    }

    /// True if the item carries a usable pose.
    pub fn has_valid_transform_data(&self) -> bool {
        self.status.is_valid() && matches!(self.payload, StreamPayload::Transform(_))
    }
}
