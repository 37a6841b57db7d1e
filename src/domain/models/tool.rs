use serde_derive::Deserialize;
use serde_derive::Serialize;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Running,
    Completed,
    Error,
}

/// One tool invocation surfaced on an assistant message. Created on a
/// tool-start event and completed on the matching tool-end event, keyed by
/// `id`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolActivity {
    pub id: String,
    pub name: String,
    pub status: ToolStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

impl ToolActivity {
    pub fn running(id: &str, name: &str) -> ToolActivity {
        return ToolActivity {
            id: id.to_string(),
            name: name.to_string(),
            status: ToolStatus::Running,
            result: None,
        };
    }
}
