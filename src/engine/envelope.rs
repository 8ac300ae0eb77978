//! Message envelope submitted in one publish operation

use bytes::Bytes;
use std::collections::BTreeMap;

/// Header carrying the caller's message-type tag
pub const MESSAGE_TYPE_HEADER: &str = "message_type";

pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Payload plus the metadata the broker stores with it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub payload: Bytes,
    pub content_type: String,
    pub persistent: bool,
    pub headers: BTreeMap<String, String>,
}

impl Envelope {
    /// Persistent envelope with the default content type and no headers
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            persistent: true,
            headers: BTreeMap::new(),
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn with_persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Tag the envelope with the serialization format of its payload
    pub fn with_message_type(self, message_type: impl Into<String>) -> Self {
        self.with_header(MESSAGE_TYPE_HEADER, message_type)
    }

    pub fn message_type(&self) -> Option<&str> {
        self.headers.get(MESSAGE_TYPE_HEADER).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}
