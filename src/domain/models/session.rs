#[cfg(test)]
#[path = "session_test.rs"]
mod tests;

use chrono::Utc;
use serde_derive::Deserialize;
use serde_derive::Serialize;

use super::Message;

/// How much of the first user message becomes the session name.
const NAME_MAX_CHARS: usize = 40;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub name: String,
    pub created_at: i64,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub archived: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
}

impl Session {
    pub fn new(id: &str, name: &str) -> Session {
        return Session {
            id: id.to_string(),
            name: name.to_string(),
            created_at: Utc::now().timestamp_millis(),
            messages: vec![],
            archived: false,
            remote_id: None,
        };
    }

    pub fn is_remote_backed(&self) -> bool {
        return self.remote_id.is_some();
    }

    /// Derives a session name from the first sent message.
    pub fn name_from_input(text: &str) -> String {
        let trimmed = text.trim();
        let mut name: String = trimmed.chars().take(NAME_MAX_CHARS).collect();
        if trimmed.chars().count() > NAME_MAX_CHARS {
            name.push('…');
        }
        if name.is_empty() {
            name = "New chat".to_string();
        }

        return name;
    }

    /// Accretive by-id merge: appends only messages whose id is not already
    /// present. Never removes or reorders what is already there, so applying
    /// the same remote list twice is a no-op the second time.
    pub fn merge_messages(&mut self, incoming: Vec<Message>) {
        for message in incoming {
            if self.messages.iter().any(|e| return e.id == message.id) {
                continue;
            }
            self.messages.push(message);
        }
    }
}
