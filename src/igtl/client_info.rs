//! Client subscription lists and the CLIENTINFO body schema.
//!
//! A client describes what it wants to receive as four lists: message
//! types, transform names, image streams, and string names. An empty list
//! means "use the server default" for that list. The same XML schema is
//! used in two places: the `DefaultClientInfo` element of the server
//! configuration and the body of an inbound CLIENTINFO message.
//!
//! ```xml
//! <ClientInfo>
//!   <MessageTypes>
//!     <Message Type="IMAGE"/>
//!   </MessageTypes>
//!   <TransformNames>
//!     <Transform Name="ProbeToReference"/>
//!   </TransformNames>
//!   <ImageNames>
//!     <Image Name="Image" EmbeddedTransformToFrame="Reference"/>
//!   </ImageNames>
//!   <StringNames>
//!     <String Name="DepthMm"/>
//!   </StringNames>
//! </ClientInfo>
//! ```

use crate::error::{Error, Result};
use roxmltree::Node;

/// One subscribed image stream and the frame its embedded pose refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageStream {
    pub name: String,
    pub embedded_transform_to_frame: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Subscription {
    pub message_types: Vec<String>,
    pub transform_names: Vec<String>,
    pub image_streams: Vec<ImageStream>,
    pub string_names: Vec<String>,
}

impl Subscription {
    pub fn is_empty(&self) -> bool {
        self.message_types.is_empty()
            && self.transform_names.is_empty()
            && self.image_streams.is_empty()
            && self.string_names.is_empty()
    }

    /// Parse a `<ClientInfo>` document.
    pub fn from_xml(xml: &str) -> Result<Self> {
        let doc = roxmltree::Document::parse(xml)
            .map_err(|e| Error::Protocol(format!("malformed ClientInfo XML: {e}")))?;
        let root = doc.root_element();
        if root.tag_name().name() != "ClientInfo" {
            return Err(Error::Protocol(format!(
                "expected ClientInfo element, got {}",
                root.tag_name().name()
            )));
        }
        Ok(Self::from_node(&root))
    }

    /// Parse from an already-located `<ClientInfo>`-shaped element (the
    /// configuration's `DefaultClientInfo` has the same children).
    pub fn from_node(node: &Node) -> Self {
        let mut info = Subscription::default();
        for section in node.children().filter(Node::is_element) {
            match section.tag_name().name() {
                "MessageTypes" => {
                    for entry in section.children().filter(Node::is_element) {
                        if let Some(value) = entry.attribute("Type") {
                            info.message_types.push(value.to_string());
                        }
                    }
                }
                "TransformNames" => {
                    for entry in section.children().filter(Node::is_element) {
                        if let Some(value) = entry.attribute("Name") {
                            info.transform_names.push(value.to_string());
                        }
                    }
                }
                "ImageNames" => {
                    for entry in section.children().filter(Node::is_element) {
                        if let Some(name) = entry.attribute("Name") {
                            info.image_streams.push(ImageStream {
                                name: name.to_string(),
                                embedded_transform_to_frame: entry
                                    .attribute("EmbeddedTransformToFrame")
                                    .unwrap_or("Reference")
                                    .to_string(),
                            });
                        }
                    }
                }
                "StringNames" => {
                    for entry in section.children().filter(Node::is_element) {
                        if let Some(value) = entry.attribute("Name") {
                            info.string_names.push(value.to_string());
                        }
                    }
                }
                other => log::debug!("ignoring unknown ClientInfo section {other}"),
            }
        }
        info
    }

    /// Resolve this subscription against the server defaults: each list
    /// falls back to the default independently when empty.
    pub fn effective(&self, defaults: &Subscription) -> Subscription {
        Subscription {
            message_types: pick(&self.message_types, &defaults.message_types),
            transform_names: pick(&self.transform_names, &defaults.transform_names),
            image_streams: pick(&self.image_streams, &defaults.image_streams),
            string_names: pick(&self.string_names, &defaults.string_names),
        }
    }
}

fn pick<T: Clone>(own: &[T], default: &[T]) -> Vec<T> {
    if own.is_empty() {
        default.to_vec()
    } else {
        own.to_vec()
    }
}
