use serde_derive::Deserialize;
use serde_derive::Serialize;

/// One event in the streaming reply contract. Both the direct-completion
/// backend and the remote session service reduce their wire formats to this
/// union, so the streaming engine only ever sees one shape.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum StreamEvent {
    StreamStart,
    Delta {
        text: String,
    },
    ToolStart {
        id: String,
        name: String,
    },
    ToolEnd {
        id: String,
        result: String,
    },
    Status {
        text: String,
    },
    Reasoning {
        text: String,
    },
    Usage {
        input_tokens: u64,
        output_tokens: u64,
    },
    /// Local-model housekeeping notices (history compression and the like),
    /// rendered as inline informational text.
    OllamaStatus {
        status: String,
    },
    StreamEnd,
    Error {
        message: String,
    },
}
