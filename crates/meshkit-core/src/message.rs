use serde::{Deserialize, Serialize};

use crate::error::Result;

/// The self-describing wrapper around every message on the wire.
///
/// Serialized as `{"type": "<tag>", "payload": <json or null>}`, one envelope
/// per transport message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub type_tag: String,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
}

impl Envelope {
    pub fn new(type_tag: impl Into<String>, payload: Option<serde_json::Value>) -> Self {
        Self {
            type_tag: type_tag.into(),
            payload,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Strip module paths from a Rust type name, keeping generic structure.
///
/// `chat::model::Note` becomes `Note`, `alloc::vec::Vec<chat::Note>` becomes `Vec<Note>`.
pub fn short_type_name(full: &str) -> String {
    let mut out = String::with_capacity(full.len());
    let mut segment = String::new();
    let mut chars = full.chars().peekable();

    while let Some(c) = chars.next() {
        if c == ':' && chars.peek() == Some(&':') {
            chars.next();
            // Path segment, not part of the short name.
            segment.clear();
        } else if c.is_alphanumeric() || c == '_' {
            segment.push(c);
        } else {
            out.push_str(&segment);
            segment.clear();
            out.push(c);
        }
    }
    out.push_str(&segment);
    out
}
