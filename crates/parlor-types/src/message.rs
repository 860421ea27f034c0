//! Conversation message types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Metadata key naming the tool that produced a message.
pub const META_TOOL: &str = "tool";

/// Metadata key holding the file path a tool operated on.
pub const META_PATH: &str = "path";

/// Metadata key classifying a message (e.g. `"summary"`).
pub const META_TYPE: &str = "type";

/// Metadata key for the file provenance carried by a summary message.
pub const META_COMPACTION_DETAILS: &str = "compactionDetails";

/// Value of [`META_TYPE`] on synthetic compaction summaries.
pub const TYPE_SUMMARY: &str = "summary";

/// Tool tag for a file read.
pub const TOOL_FILE_READ: &str = "file_read";

/// Tool tag for a directory listing.
pub const TOOL_FILE_LIST: &str = "file_list";

/// Tool tag for a file write.
pub const TOOL_FILE_WRITE: &str = "file_write";

/// A single message in a conversation.
///
/// Messages are append-only: once created they are never reordered or edited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub text: String,
    /// `true` when the assistant authored the message.
    pub from_bot: bool,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl Message {
    /// A user-authored message stamped with the current time.
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(text, false)
    }

    /// A bot-authored message stamped with the current time.
    pub fn bot(text: impl Into<String>) -> Self {
        Self::new(text, true)
    }

    fn new(text: impl Into<String>, from_bot: bool) -> Self {
        Self {
            text: text.into(),
            from_bot,
            timestamp: Utc::now(),
            metadata: Map::new(),
        }
    }

    /// Attach a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Tag the message as the record of a tool call on `path`.
    pub fn with_tool(self, tool: &str, path: impl Into<String>) -> Self {
        self.with_metadata(META_TOOL, tool)
            .with_metadata(META_PATH, path.into())
    }

    /// Look up a string-valued metadata entry.
    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    /// Whether this is a synthetic compaction summary.
    pub fn is_summary(&self) -> bool {
        self.meta_str(META_TYPE) == Some(TYPE_SUMMARY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_set_author() {
        assert!(!Message::user("hi").from_bot);
        assert!(Message::bot("hello").from_bot);
    }

    #[test]
    fn tool_tags_are_readable() {
        let msg = Message::bot("read it").with_tool(TOOL_FILE_READ, "/src/main.rs");
        assert_eq!(msg.meta_str(META_TOOL), Some("file_read"));
        assert_eq!(msg.meta_str(META_PATH), Some("/src/main.rs"));
        assert!(!msg.is_summary());
    }

    #[test]
    fn summary_detection() {
        let msg = Message::user("summary").with_metadata(META_TYPE, TYPE_SUMMARY);
        assert!(msg.is_summary());
    }

    #[test]
    fn empty_metadata_is_omitted_from_json() {
        let json = serde_json::to_value(Message::user("hi")).unwrap();
        assert!(json.get("metadata").is_none());
        assert_eq!(json["from_bot"], false);

        let back: Message = serde_json::from_value(json).unwrap();
        assert!(back.metadata.is_empty());
    }
}
