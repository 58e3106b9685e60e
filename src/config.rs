//! Server configuration, read once at startup from an XML file.
//!
//! The acquisition ecosystem this server joins describes device sets in XML,
//! so the server knobs live on a `StreamingServer` element inside the same
//! document:
//!
//! ```xml
//! <ServerConfiguration>
//!   <StreamingServer
//!       ListeningPort="18944"
//!       OutputChannelId="VideoStream"
//!       MissingInputGracePeriodSec="3.0"
//!       MaxTimeSpentWithProcessingMs="50"
//!       MaxNumberOfIgtlMessagesToSend="100"
//!       SendValidTransformsOnly="TRUE"
//!       IgtlMessageCrcCheckEnabled="FALSE">
//!     <DefaultClientInfo>
//!       <MessageTypes>
//!         <Message Type="IMAGE"/>
//!       </MessageTypes>
//!       <ImageNames>
//!         <Image Name="Image" EmbeddedTransformToFrame="Reference"/>
//!       </ImageNames>
//!     </DefaultClientInfo>
//!   </StreamingServer>
//! </ServerConfiguration>
//! ```
//!
//! `ListeningPort` and `OutputChannelId` are required; everything else has
//! defaults. A missing required attribute or malformed XML fails startup.

use crate::error::{Error, Result};
use crate::igtl::Subscription;
use log::debug;
use roxmltree::{Document, Node};
use std::path::Path;

pub const DEFAULT_MAX_TIME_SPENT_WITH_PROCESSING_MS: f64 = 50.0;
pub const DEFAULT_MAX_NUMBER_OF_MESSAGES_TO_SEND: usize = 100;

/// Synthetic source parameters (`<SimulatedSource>` element, optional).
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedSourceConfig {
    pub output_channel_id: String,
    pub frame_rate_hz: f64,
    pub image_size: [usize; 2],
    pub transform_name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub listening_port: u16,
    pub output_channel_id: String,
    pub missing_input_grace_period_sec: f64,
    pub max_time_spent_with_processing_ms: f64,
    pub max_number_of_messages_to_send: usize,
    pub send_valid_transforms_only: bool,
    pub crc_check_enabled: bool,
    pub default_client_info: Subscription,
    pub simulated_source: Option<SimulatedSourceConfig>,
}

fn required_attr<'a>(node: &'a Node, name: &str) -> Result<&'a str> {
    node.attribute(name).ok_or_else(|| {
        Error::Config(format!(
            "{} element is missing required attribute {name}",
            node.tag_name().name()
        ))
    })
}

fn parse_attr<T: std::str::FromStr>(node: &Node, name: &str, default: T) -> Result<T> {
    match node.attribute(name) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|_| {
            Error::Config(format!("attribute {name} has invalid value '{raw}'"))
        }),
    }
}

fn parse_bool_attr(node: &Node, name: &str, default: bool) -> Result<bool> {
    match node.attribute(name) {
        None => Ok(default),
        Some(raw) => match raw {
            "TRUE" | "True" | "true" | "1" => Ok(true),
            "FALSE" | "False" | "false" | "0" => Ok(false),
            other => Err(Error::Config(format!(
                "attribute {name} has invalid boolean value '{other}'"
            ))),
        },
    }
}

fn find_element<'a, 'i>(root: &Node<'a, 'i>, name: &str) -> Option<Node<'a, 'i>> {
    root.descendants()
        .find(|node| node.is_element() && node.tag_name().name() == name)
}

impl ServerConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path).map_err(|e| {
            Error::Config(format!(
                "failed to read config {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Self::from_xml(&content)
    }

    pub fn from_xml(xml: &str) -> Result<Self> {
        let doc = Document::parse(xml)
            .map_err(|e| Error::Config(format!("failed to parse config XML: {e}")))?;
        let root = doc.root_element();

        let server = find_element(&root, "StreamingServer")
            .ok_or_else(|| Error::Config("no StreamingServer element in config".to_string()))?;

        let listening_port: u16 = required_attr(&server, "ListeningPort")?
            .parse()
            .map_err(|_| Error::Config("ListeningPort is not a valid port number".to_string()))?;
        let output_channel_id = required_attr(&server, "OutputChannelId")?.to_string();

        let default_client_info = match find_element(&server, "DefaultClientInfo") {
            Some(node) => Subscription::from_node(&node),
            None => Subscription::default(),
        };
        if default_client_info.is_empty() {
            debug!("config carries no DefaultClientInfo; clients must subscribe explicitly");
        }

        let simulated_source = match find_element(&root, "SimulatedSource") {
            Some(node) => Some(SimulatedSourceConfig {
                output_channel_id: node
                    .attribute("OutputChannelId")
                    .unwrap_or(&output_channel_id)
                    .to_string(),
                frame_rate_hz: parse_attr(&node, "FrameRateHz", 30.0)?,
                image_size: [
                    parse_attr(&node, "ImageWidth", 64usize)?,
                    parse_attr(&node, "ImageHeight", 48usize)?,
                ],
                transform_name: node
                    .attribute("TransformName")
                    .unwrap_or("ProbeToReference")
                    .to_string(),
            }),
            None => None,
        };

        Ok(Self {
            listening_port,
            output_channel_id,
            missing_input_grace_period_sec: parse_attr(
                &server,
                "MissingInputGracePeriodSec",
                0.0,
            )?,
            max_time_spent_with_processing_ms: parse_attr(
                &server,
                "MaxTimeSpentWithProcessingMs",
                DEFAULT_MAX_TIME_SPENT_WITH_PROCESSING_MS,
            )?,
            max_number_of_messages_to_send: parse_attr(
                &server,
                "MaxNumberOfIgtlMessagesToSend",
                DEFAULT_MAX_NUMBER_OF_MESSAGES_TO_SEND,
            )?,
            send_valid_transforms_only: parse_bool_attr(&server, "SendValidTransformsOnly", true)?,
            crc_check_enabled: parse_bool_attr(&server, "IgtlMessageCrcCheckEnabled", false)?,
            default_client_info,
            simulated_source,
        })
    }
}
