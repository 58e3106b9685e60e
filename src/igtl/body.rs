//! OpenIGTLink v1 message body codecs.
//!
//! Bodies are packed big-endian into plain byte vectors; the header that
//! fronts them is built in [`super::header`]. Only the types the server
//! emits or consumes are implemented.

use crate::buffer::{ImageFrame, PixelType};
use crate::error::{Error, Result};
use crate::math::Matrix4x4;

/// STATUS code: OK.
pub const STATUS_OK: u16 = 1;
/// STATUS code: generic error.
pub const STATUS_ERROR: u16 = 9;

/// STRING body text encoding: US-ASCII (MIBenum 3).
const STRING_ENCODING_ASCII: u16 = 3;

fn push_fixed_str(out: &mut Vec<u8>, value: &str, width: usize) {
    let bytes = value.as_bytes();
    let n = bytes.len().min(width);
    out.extend_from_slice(&bytes[..n]);
    out.resize(out.len() + width - n, 0);
}

fn scalar_type_code(pixel_type: PixelType) -> u8 {
    match pixel_type {
        PixelType::I8 => 2,
        PixelType::U8 => 3,
        PixelType::I16 => 4,
        PixelType::U16 => 5,
        PixelType::I32 => 6,
        PixelType::U32 => 7,
        PixelType::F32 => 10,
        PixelType::F64 => 11,
    }
}

/// TRANSFORM body: the rotation block and origin as 12 floats.
pub fn pack_transform(matrix: &Matrix4x4) -> Vec<u8> {
    let mut out = Vec::with_capacity(48);
    for col in 0..3 {
        for row in 0..3 {
            out.extend_from_slice(&(matrix.get(row, col) as f32).to_be_bytes());
        }
    }
    for row in 0..3 {
        out.extend_from_slice(&(matrix.get(row, 3) as f32).to_be_bytes());
    }
    out
}

/// POSITION body: translation plus rotation quaternion (x, y, z, w).
pub fn pack_position(matrix: &Matrix4x4) -> Vec<u8> {
    let quaternion = crate::math::Quaternion::from_matrix(matrix);
    let translation = matrix.translation();
    let mut out = Vec::with_capacity(28);
    for value in translation {
        out.extend_from_slice(&(value as f32).to_be_bytes());
    }
    for value in [quaternion.x, quaternion.y, quaternion.z, quaternion.w] {
        out.extend_from_slice(&(value as f32).to_be_bytes());
    }
    out
}

/// IMAGE body: 72-byte subheader (geometry + orientation) followed by raw
/// pixels. `image_to_reference` supplies the orientation block.
pub fn pack_image(frame: &ImageFrame, image_to_reference: &Matrix4x4) -> Vec<u8> {
    let format = &frame.format;
    let mut out = Vec::with_capacity(72 + frame.pixels.len());
    out.extend_from_slice(&1u16.to_be_bytes()); // body version
    out.push(format.components as u8);
    out.push(scalar_type_code(format.pixel_type));
    out.push(1); // endianness of pixel data: big
    out.push(2); // coordinate convention: LPS
    for dim in format.size {
        out.extend_from_slice(&(dim as u16).to_be_bytes());
    }
    // Orientation: normalized axes and origin from the pose matrix.
    for col in 0..3 {
        for row in 0..3 {
            out.extend_from_slice(&(image_to_reference.get(row, col) as f32).to_be_bytes());
        }
    }
    for row in 0..3 {
        out.extend_from_slice(&(image_to_reference.get(row, 3) as f32).to_be_bytes());
    }
    // Subvolume = full volume.
    for _ in 0..3 {
        out.extend_from_slice(&0u16.to_be_bytes());
    }
    for dim in format.size {
        out.extend_from_slice(&(dim as u16).to_be_bytes());
    }
    out.extend_from_slice(&frame.pixels);
    out
}

/// STRING body: encoding, length, text.
pub fn pack_string(text: &str) -> Vec<u8> {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(4 + bytes.len());
    out.extend_from_slice(&STRING_ENCODING_ASCII.to_be_bytes());
    out.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    out.extend_from_slice(bytes);
    out
}

/// Inverse of [`pack_string`]; CLIENTINFO bodies share this layout.
pub fn parse_string(body: &[u8]) -> Result<String> {
    if body.len() < 4 {
        return Err(Error::Protocol(format!(
            "STRING body too short: {} bytes",
            body.len()
        )));
    }
    let length = u16::from_be_bytes([body[2], body[3]]) as usize;
    if body.len() < 4 + length {
        return Err(Error::Protocol(format!(
            "STRING body truncated: declared {length}, got {}",
            body.len() - 4
        )));
    }
    Ok(String::from_utf8_lossy(&body[4..4 + length]).into_owned())
}

/// STATUS body: code, subcode, error name, message.
pub fn pack_status(code: u16, subcode: i64, error_name: &str, message: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(30 + message.len());
    out.extend_from_slice(&code.to_be_bytes());
    out.extend_from_slice(&subcode.to_be_bytes());
    push_fixed_str(&mut out, error_name, 20);
    out.extend_from_slice(message.as_bytes());
    out
}

/// One image-metadata record.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ImageMetaItem {
    pub name: String,
    pub id: String,
    pub modality: String,
    pub patient_name: String,
    pub patient_id: String,
    /// Seconds since the Unix epoch; zero when unknown.
    pub timestamp: f64,
    pub size: [u16; 3],
    pub pixel_type: PixelType,
}

/// IMGMETA body: fixed 260-byte records.
pub fn pack_image_meta(items: &[ImageMetaItem]) -> Vec<u8> {
    let mut out = Vec::with_capacity(items.len() * 260);
    for item in items {
        push_fixed_str(&mut out, &item.name, 64);
        push_fixed_str(&mut out, &item.id, 20);
        push_fixed_str(&mut out, &item.modality, 32);
        push_fixed_str(&mut out, &item.patient_name, 64);
        push_fixed_str(&mut out, &item.patient_id, 64);
        out.extend_from_slice(&super::header::timestamp_to_wire(item.timestamp).to_be_bytes());
        for dim in item.size {
            out.extend_from_slice(&dim.to_be_bytes());
        }
        out.push(scalar_type_code(item.pixel_type));
        out.push(0); // reserved
    }
    out
}
