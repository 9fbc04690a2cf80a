use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one remote media object: a message inside a chat
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectRef {
    pub chat_id: i64,
    pub message_id: i64,
}

impl ObjectRef {
    pub fn new(chat_id: i64, message_id: i64) -> Self {
        Self {
            chat_id,
            message_id,
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.chat_id, self.message_id)
    }
}

/// What the backend knows about an object once it has been resolved
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaInfo {
    /// Content-addressable id of the underlying file, stable across sessions
    pub file_id: String,
    /// Total size in bytes, never zero
    pub size: u64,
    /// Declared MIME type, if the backend knows it
    pub mime_type: Option<String>,
}

impl MediaInfo {
    /// MIME type with the generic video fallback applied
    pub fn content_type(&self) -> &str {
        self.mime_type
            .as_deref()
            .filter(|m| !m.is_empty())
            .unwrap_or(crate::constants::DEFAULT_MIME_TYPE)
    }

    /// Whether the container is plausibly ISO-BMFF (mp4/mov family)
    pub fn is_mp4_like(&self) -> bool {
        match self.mime_type.as_deref() {
            None => true,
            Some(mime) => matches!(
                mime,
                "video/mp4" | "video/quicktime" | "video/x-m4v" | "audio/mp4" | "application/mp4"
            ),
        }
    }
}
