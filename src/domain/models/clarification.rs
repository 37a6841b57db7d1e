use serde_derive::Deserialize;
use serde_derive::Serialize;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClarificationChoice {
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClarificationQuestion {
    pub text: String,
    #[serde(default)]
    pub options: Vec<ClarificationChoice>,
    #[serde(default)]
    pub multiple: bool,
}

/// A structured mid-conversation question from the backend. Answers are one
/// inner list per sub-question so multi-select questions can carry several
/// values.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClarificationRequest {
    pub id: String,
    #[serde(rename = "sessionID", default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub questions: Vec<ClarificationQuestion>,
}
