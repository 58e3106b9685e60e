//! OpenIGTLink protocol support: header codec, body codecs, subscription
//! schema, and the outbound message factory.

pub mod body;
pub mod client_info;
pub mod factory;
pub mod header;

pub use body::{ImageMetaItem, STATUS_ERROR, STATUS_OK};
pub use client_info::{ImageStream, Subscription};
pub use factory::{
    DefaultMessageFactory, MessageFactory, DEFAULT_IMAGE_DEVICE_NAME, IMAGE_META_DEVICE_NAME,
};
pub use header::{
    check_body_crc, crc64, IgtlMessage, MessageHeader, HEADER_SIZE, PROTOCOL_VERSION,
};

/// An empty STATUS_OK message; doubles as the keep-alive packet and the
/// GET_STATUS reply.
pub fn status_ok_message(timestamp: f64) -> IgtlMessage {
    IgtlMessage::new(
        "STATUS",
        "Server",
        timestamp,
        body::pack_status(STATUS_OK, 0, "", ""),
    )
}
