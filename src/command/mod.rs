//! Remote command requests and responses.
//!
//! Commands arrive as STRING messages whose body is an XML document and
//! whose device name encodes an optional uid (`prefix[_uid]`, uid = text
//! after the last underscore). Responses are a tagged variant in place of
//! the acquisition toolkit's response class hierarchy; routing is decided
//! by the tag: image responses broadcast to every client, everything else
//! returns to the requester.

mod processor;

pub use processor::{CommandHandler, CommandProcessor, HandlerContext};

use crate::buffer::ImageFrame;
use crate::igtl::ImageMetaItem;
use crate::math::Matrix4x4;

/// How long a client's seen-uid set survives without any inbound message
/// before it is cleared.
pub const CLEAR_PREVIOUS_COMMANDS_TIMEOUT_SEC: f64 = 30.0;

#[derive(Debug, Clone, PartialEq)]
pub struct CommandRequest {
    pub client_id: u64,
    /// The raw XML command document.
    pub command_xml: String,
    /// Device-name prefix; responses echo the full original name.
    pub device_prefix: String,
    /// Dedupe uid; empty = not dedupe-eligible.
    pub uid: String,
}

impl CommandRequest {
    /// Device name to reply with: the full original name, uid included.
    pub fn response_device_name(&self) -> String {
        if self.uid.is_empty() {
            self.device_prefix.clone()
        } else {
            format!("{}_{}", self.device_prefix, self.uid)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandResponse {
    /// Unicast to the originating client.
    String {
        client_id: u64,
        success: bool,
        message: String,
        device_name: String,
    },
    /// Broadcast to every connected client.
    Image {
        client_id: u64,
        image_name: String,
        image: ImageFrame,
        image_to_reference: Matrix4x4,
    },
    /// Unicast to the originating client.
    ImageMeta {
        client_id: u64,
        items: Vec<ImageMetaItem>,
    },
}

impl CommandResponse {
    pub fn client_id(&self) -> u64 {
        match self {
            CommandResponse::String { client_id, .. }
            | CommandResponse::Image { client_id, .. }
            | CommandResponse::ImageMeta { client_id, .. } => *client_id,
        }
    }

    /// Image responses go to all clients.
    pub fn is_broadcast(&self) -> bool {
        matches!(self, CommandResponse::Image { .. })
    }
}

/// Device-name prefix: everything before the last underscore, or the whole
/// name when there is none.
pub fn prefix_from_device_name(device_name: &str) -> &str {
    match device_name.rfind('_') {
        Some(pos) => &device_name[..pos],
        None => device_name,
    }
}

/// Device-name uid: everything after the last underscore, or empty.
pub fn uid_from_device_name(device_name: &str) -> &str {
    match device_name.rfind('_') {
        Some(pos) => &device_name[pos + 1..],
        None => "",
    }
}
