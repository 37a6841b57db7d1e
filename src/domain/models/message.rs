#[cfg(test)]
#[path = "message_test.rs"]
mod tests;

use chrono::Utc;
use serde_derive::Deserialize;
use serde_derive::Serialize;
use uuid::Uuid;

use super::Role;
use super::ToolActivity;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageImage {
    pub media_type: String,
    pub base64_data: String,
}

/// A single chat message. Assistant messages are mutated in place while a
/// turn streams; every optional field defaults so documents written by older
/// versions still load.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<MessageImage>>,
    #[serde(default)]
    pub is_streaming: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_activities: Option<Vec<ToolActivity>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

impl Message {
    pub fn new(role: Role, text: &str) -> Message {
        return Message {
            id: Uuid::new_v4().to_string(),
            role,
            content: text.to_string(),
            timestamp: Utc::now().timestamp_millis(),
            images: None,
            is_streaming: false,
            status_text: None,
            tool_activities: None,
            reasoning: None,
        };
    }

    pub fn user(text: &str, images: Vec<MessageImage>) -> Message {
        let mut message = Message::new(Role::User, text);
        if !images.is_empty() {
            message.images = Some(images);
        }

        return message;
    }

    /// The empty assistant bubble inserted the instant a turn starts. It is
    /// removed again if the turn finishes with no content and no error.
    pub fn placeholder() -> Message {
        let mut message = Message::new(Role::Assistant, "");
        message.is_streaming = true;
        message.status_text = Some("Thinking...".to_string());

        return message;
    }

    pub fn append(&mut self, text: &str) {
        self.content += text;
    }
}
