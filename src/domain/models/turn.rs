#[cfg(test)]
#[path = "turn_test.rs"]
mod tests;

use uuid::Uuid;

use super::StreamEvent;
use super::ToolActivity;
use super::ToolStatus;

/// Error payloads can echo entire request bodies back (base64 images
/// included); anything past this many chars is cut before it reaches a
/// message.
const ERROR_TEXT_CAP: usize = 500;
const TRUNCATION_MARKER: &str = "… [truncated]";

/// Mutable accumulator for one streaming response. Owned exclusively by the
/// engine invocation that created it and never shared across turns; the
/// `token` is the turn's identity for stale-cancel checks.
#[derive(Clone, Debug)]
pub struct Turn {
    pub token: String,
    pub content: String,
    pub reasoning: String,
    pub status: Option<String>,
    pub tools: Vec<ToolActivity>,
    pub done: bool,
    pub error: Option<String>,
}

impl Default for Turn {
    fn default() -> Turn {
        return Turn::new();
    }
}

impl Turn {
    pub fn new() -> Turn {
        return Turn {
            token: Uuid::new_v4().to_string(),
            content: "".to_string(),
            reasoning: "".to_string(),
            status: Some("Thinking...".to_string()),
            tools: vec![],
            done: false,
            error: None,
        };
    }

    /// Applies one stream event to the accumulator. Terminal events set
    /// `done`; everything else mutates in place. `usage` is intentionally not
    /// accumulated here — the engine forwards it straight to the counters.
    pub fn apply(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::StreamStart => {}
            StreamEvent::Delta { text } => {
                self.content += text;
                self.status = None;
            }
            StreamEvent::ToolStart { id, name } => {
                self.tools.push(ToolActivity::running(id, name));
                self.status = Some(verb_for_tool(name));
            }
            StreamEvent::ToolEnd { id, result } => {
                if let Some(tool) = self.tools.iter_mut().find(|e| return e.id == *id) {
                    tool.status = if result.starts_with("[error]") {
                        ToolStatus::Error
                    } else {
                        ToolStatus::Completed
                    };
                    tool.result = Some(result.to_string());
                }
            }
            StreamEvent::Status { text } => {
                self.status = Some(text.to_string());
            }
            StreamEvent::Reasoning { text } => {
                self.reasoning += text;
            }
            StreamEvent::Usage { .. } => {}
            StreamEvent::OllamaStatus { status } => match status.as_str() {
                "compressing" => {
                    self.status = Some("Compressing history...".to_string());
                }
                "compression_failed" => {
                    self.content += "\n*(history compression failed, continuing with the full conversation)*\n";
                }
                _ => {
                    self.status = None;
                }
            },
            StreamEvent::StreamEnd => {
                self.done = true;
            }
            StreamEvent::Error { message } => {
                self.done = true;
                self.error = Some(truncate_error(message));
            }
        }
    }
}

fn truncate_error(message: &str) -> String {
    if message.chars().count() <= ERROR_TEXT_CAP {
        return message.to_string();
    }

    let mut truncated: String = message.chars().take(ERROR_TEXT_CAP).collect();
    truncated += TRUNCATION_MARKER;

    return truncated;
}

/// Human verb shown while a tool runs. Unknown namespaced tools (MCP-style
/// `server_tool` names) get their own fallback so remote tools read
/// differently from local unknowns.
fn verb_for_tool(name: &str) -> String {
    let verb = match name {
        "bash" => "Running a command...",
        "read" => "Reading files...",
        "write" | "edit" => "Editing files...",
        "glob" | "grep" => "Searching the codebase...",
        "webfetch" => "Fetching a page...",
        "websearch" => "Searching the web...",
        "todowrite" | "todoread" => "Updating the plan...",
        "task" => "Delegating...",
        other => {
            if other.starts_with("mcp_") || other.contains('_') {
                "Calling a remote tool..."
            } else {
                "Running a tool..."
            }
        }
    };

    return verb.to_string();
}
