//! Message factory: turns tracked frames and command responses into packed
//! OpenIGTLink messages.
//!
//! The server depends only on the [`MessageFactory`] trait so tests can
//! substitute a recording fake; [`DefaultMessageFactory`] implements the
//! standard packing. One tracked frame fans out into zero or more messages
//! depending on the client's effective subscription, in subscription order.

use super::body;
use super::client_info::Subscription;
use super::header::IgtlMessage;
use crate::command::CommandResponse;
use crate::frame::TrackedFrame;
use crate::math::Matrix4x4;
use crate::transforms::TransformRepository;
use log::{debug, warn};
use std::sync::Arc;

/// Device name used for image command responses with no name of their own.
pub const DEFAULT_IMAGE_DEVICE_NAME: &str = "ServerImage";
/// Device name for image metadata responses.
pub const IMAGE_META_DEVICE_NAME: &str = "ServerImageMetaData";

pub trait MessageFactory: Send + Sync {
    /// Pack every message the subscription selects from one frame.
    /// `frame.timestamp` is already the wire (UTC) timestamp when called
    /// from the sender.
    fn pack_frame_messages(
        &self,
        subscription: &Subscription,
        frame: &TrackedFrame,
        repository: Option<&Arc<dyn TransformRepository>>,
        send_valid_transforms_only: bool,
    ) -> Vec<IgtlMessage>;

    /// Pack one command response; `timestamp` is the wire (UTC) time of the
    /// reply. None when the response cannot be represented.
    fn pack_command_response(
        &self,
        response: &CommandResponse,
        timestamp: f64,
    ) -> Option<IgtlMessage>;
}

#[derive(Default)]
pub struct DefaultMessageFactory;

impl DefaultMessageFactory {
    pub fn new() -> Self {
        Self
    }

    /// A frame pose by name, falling back to the repository for derived
    /// relations the device did not stream directly.
    fn resolve_transform(
        frame: &TrackedFrame,
        repository: Option<&Arc<dyn TransformRepository>>,
        name: &str,
    ) -> Option<(Matrix4x4, bool)> {
        if let Some(found) = frame.transform(name) {
            return Some((found.matrix, found.valid));
        }
        let (from, to) = crate::transforms::split_transform_name(name)?;
        let resolved = repository?.transform(from, to)?;
        Some((resolved.matrix, resolved.valid))
    }
}

impl MessageFactory for DefaultMessageFactory {
    fn pack_frame_messages(
        &self,
        subscription: &Subscription,
        frame: &TrackedFrame,
        repository: Option<&Arc<dyn TransformRepository>>,
        send_valid_transforms_only: bool,
    ) -> Vec<IgtlMessage> {
        let mut messages = Vec::new();
        for message_type in &subscription.message_types {
            match message_type.as_str() {
                "IMAGE" => {
                    let Some(image) = &frame.image else {
                        continue;
                    };
                    for stream in &subscription.image_streams {
                        let embedded_name = format!(
                            "{}To{}",
                            stream.name, stream.embedded_transform_to_frame
                        );
                        let pose = Self::resolve_transform(frame, repository, &embedded_name)
                            .map(|(matrix, _)| matrix)
                            .unwrap_or_else(Matrix4x4::identity);
                        messages.push(IgtlMessage::new(
                            "IMAGE",
                            stream.name.clone(),
                            frame.timestamp,
                            body::pack_image(image, &pose),
                        ));
                    }
                }
                "TRANSFORM" | "POSITION" => {
                    for name in &subscription.transform_names {
                        let Some((matrix, valid)) =
                            Self::resolve_transform(frame, repository, name)
                        else {
                            debug!("transform {name} not present in frame or repository");
                            continue;
                        };
                        if !valid && send_valid_transforms_only {
                            debug!("skipping invalid transform {name}");
                            continue;
                        }
                        let packed = if message_type == "TRANSFORM" {
                            body::pack_transform(&matrix)
                        } else {
                            body::pack_position(&matrix)
                        };
                        messages.push(IgtlMessage::new(
                            message_type.clone(),
                            name.clone(),
                            frame.timestamp,
                            packed,
                        ));
                    }
                }
                "STRING" => {
                    for name in &subscription.string_names {
                        let Some(value) = frame.custom_field(name) else {
                            continue;
                        };
                        messages.push(IgtlMessage::new(
                            "STRING",
                            name.clone(),
                            frame.timestamp,
                            body::pack_string(value),
                        ));
                    }
                }
                other => {
                    warn!("subscription requests unsupported message type {other}");
                }
            }
        }
        messages
    }

    fn pack_command_response(
        &self,
        response: &CommandResponse,
        timestamp: f64,
    ) -> Option<IgtlMessage> {
        match response {
            CommandResponse::String {
                success,
                message,
                device_name,
                ..
            } => {
                if device_name.is_empty() {
                    warn!("command reply has an empty device name");
                }
                let reply = format!(
                    "<CommandReply Status=\"{}\" Message=\"{}\"/>",
                    if *success { "SUCCESS" } else { "FAIL" },
                    escape_xml_attribute(message),
                );
                Some(IgtlMessage::new(
                    "STRING",
                    device_name.clone(),
                    timestamp,
                    body::pack_string(&reply),
                ))
            }
            CommandResponse::Image {
                image_name,
                image,
                image_to_reference,
                ..
            } => {
                let name = if image_name.is_empty() {
                    DEFAULT_IMAGE_DEVICE_NAME
                } else {
                    image_name
                };
                Some(IgtlMessage::new(
                    "IMAGE",
                    name,
                    timestamp,
                    body::pack_image(image, image_to_reference),
                ))
            }
            CommandResponse::ImageMeta { items, .. } => Some(IgtlMessage::new(
                "IMGMETA",
                IMAGE_META_DEVICE_NAME,
                timestamp,
                body::pack_image_meta(items),
            )),
        }
    }
}

fn escape_xml_attribute(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            other => out.push(other),
        }
    }
    out
}
