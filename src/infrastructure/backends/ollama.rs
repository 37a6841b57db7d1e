#[cfg(test)]
#[path = "ollama_test.rs"]
mod tests;

use std::time::Duration;

use anyhow::bail;
use anyhow::Result;
use async_trait::async_trait;
use futures::stream::TryStreamExt;
use serde_derive::Deserialize;
use serde_derive::Serialize;
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use tokio_util::io::StreamReader;

use crate::configuration::Config;
use crate::configuration::ConfigKey;
use crate::domain::models::BackendPrompt;
use crate::domain::models::CompletionBackend;
use crate::domain::models::Role;
use crate::domain::models::StreamEvent;

/// Histories longer than this get their oldest messages summarized into a
/// rolling prior-context pair before the completion request.
const HISTORY_COMPRESS_THRESHOLD: usize = 10;
/// Recent messages always sent uncompressed.
const HISTORY_KEEP_RECENT: usize = 6;
/// Transcripts shorter than this are not worth a summarization round-trip.
const MIN_SUMMARIZE_LEN: usize = 400;
/// Sentinel prefix marking a compressed-history message.
const PRIOR_CONTEXT_PREFIX: &str = "[Prior context —";

fn convert_err(err: reqwest::Error) -> std::io::Error {
    let err_msg = err.to_string();
    return std::io::Error::new(std::io::ErrorKind::Interrupted, err_msg);
}

#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ChatMessageRequest {
    role: String,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    images: Option<Vec<String>>,
}

#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessageRequest>,
    stream: bool,
}

#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: String,
}

#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    message: Option<ChatResponseMessage>,
    done: bool,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
    #[serde(default)]
    eval_count: Option<u64>,
}

#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct GenerateRequest {
    model: String,
    prompt: String,
    stream: bool,
}

#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct GenerateResponse {
    response: String,
}

#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Model {
    name: String,
}

#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ModelListResponse {
    pub models: Vec<Model>,
}

/// The direct-completion path: the full message history, image attachments
/// included, against a local Ollama chat endpoint.
pub struct Ollama {
    url: String,
    timeout: String,
}

impl Default for Ollama {
    fn default() -> Ollama {
        return Ollama {
            url: Config::get(ConfigKey::OllamaURL),
            timeout: Config::get(ConfigKey::BackendHealthCheckTimeout),
        };
    }
}

impl Ollama {
    async fn summarize(&self, model: &str, text: &str) -> Result<String> {
        let prompt = format!(
            "Extract ONLY the key facts and decisions from this conversation. \
Do NOT list user requests. Do NOT write \"User asked X, then Y\". \
Output format: what was decided, what was done, what remains. Nothing else.\n\n{text}"
        );
        let req = GenerateRequest {
            model: model.to_string(),
            prompt,
            stream: false,
        };

        let res = reqwest::Client::new()
            .post(format!("{url}/api/generate", url = self.url))
            .json(&req)
            .send()
            .await?;

        if !res.status().is_success() {
            bail!("Failed to make summarization request to Ollama");
        }

        let body = res.json::<GenerateResponse>().await?;
        return Ok(body.response.trim().to_string());
    }

    /// Rolls the oldest messages of a long history into one prior-context
    /// pair, keeping the recent turns verbatim. On failure the full history
    /// is sent unchanged.
    async fn compress_history(
        &self,
        model: &str,
        messages: Vec<ChatMessageRequest>,
        tx: &mpsc::UnboundedSender<StreamEvent>,
    ) -> Vec<ChatMessageRequest> {
        if messages.len() <= HISTORY_COMPRESS_THRESHOLD {
            return messages;
        }

        let split = messages.len() - HISTORY_KEEP_RECENT;
        let transcript = messages[..split]
            .iter()
            .map(|message| {
                return format!("[{role}]: {text}\n\n", role = message.role, text = message.content);
            })
            .collect::<String>();
        if transcript.len() < MIN_SUMMARIZE_LEN {
            return messages;
        }

        let _ = tx.send(StreamEvent::OllamaStatus {
            status: "compressing".to_string(),
        });

        match self.summarize(model, &transcript).await {
            Ok(summary) => {
                let _ = tx.send(StreamEvent::OllamaStatus {
                    status: "done".to_string(),
                });

                let mut result = vec![
                    ChatMessageRequest {
                        role: "user".to_string(),
                        content: format!(
                            "{PRIOR_CONTEXT_PREFIX} {count} messages compressed]\n{summary}",
                            count = split
                        ),
                        images: None,
                    },
                    ChatMessageRequest {
                        role: "assistant".to_string(),
                        content: "Context received.".to_string(),
                        images: None,
                    },
                ];
                result.extend_from_slice(&messages[split..]);
                return result;
            }
            Err(err) => {
                tracing::warn!(error = ?err, "history compression failed");
                let _ = tx.send(StreamEvent::OllamaStatus {
                    status: "compression_failed".to_string(),
                });
                let _ = tx.send(StreamEvent::OllamaStatus {
                    status: "done".to_string(),
                });
                return messages;
            }
        }
    }
}

#[async_trait]
impl CompletionBackend for Ollama {
    async fn health_check(&self) -> Result<()> {
        let res = reqwest::Client::new()
            .get(&self.url)
            .timeout(Duration::from_millis(self.timeout.parse::<u64>()?))
            .send()
            .await;

        if res.is_err() {
            tracing::error!(error = ?res.unwrap_err(), "Ollama is not running");
            bail!("Ollama is not running");
        }

        let res = res.unwrap();
        if res.status() != 200 {
            tracing::error!(status = res.status().as_u16(), "Ollama health check failed");
            bail!("Ollama health check failed");
        }

        return Ok(());
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        let res = reqwest::Client::new()
            .get(format!("{url}/api/tags", url = self.url))
            .send()
            .await?
            .json::<ModelListResponse>()
            .await?;

        let mut models: Vec<String> = res
            .models
            .iter()
            .map(|model| {
                return model.name.to_string();
            })
            .collect();

        models.sort();

        return Ok(models);
    }

    async fn get_completion<'a>(
        &self,
        prompt: BackendPrompt,
        tx: &'a mpsc::UnboundedSender<StreamEvent>,
    ) -> Result<()> {
        let messages = prompt
            .messages
            .iter()
            .map(|message| {
                let role = match message.role {
                    Role::User => "user".to_string(),
                    Role::Assistant => "assistant".to_string(),
                };
                let images = message.images.as_ref().map(|images| {
                    return images
                        .iter()
                        .map(|image| {
                            return image.base64_data.to_string();
                        })
                        .collect::<Vec<String>>();
                });

                return ChatMessageRequest {
                    role,
                    content: message.content.to_string(),
                    images,
                };
            })
            .collect::<Vec<ChatMessageRequest>>();

        let model = Config::get(ConfigKey::Model);
        let messages = self.compress_history(&model, messages, tx).await;

        let req = ChatRequest {
            model,
            messages,
            stream: true,
        };

        let res = reqwest::Client::new()
            .post(format!("{url}/api/chat", url = self.url))
            .json(&req)
            .send()
            .await?;

        if !res.status().is_success() {
            tracing::error!(
                status = res.status().as_u16(),
                "Failed to make completion request to Ollama"
            );
            bail!("Failed to make completion request to Ollama");
        }

        let stream = res.bytes_stream().map_err(convert_err);
        let mut lines_reader = StreamReader::new(stream).lines();

        while let Ok(line) = lines_reader.next_line().await {
            if line.is_none() {
                break;
            }

            let ores: ChatResponse = match serde_json::from_str(&line.unwrap()) {
                Ok(ores) => ores,
                Err(_) => continue,
            };
            tracing::debug!(body = ?ores, "Completion response");

            if let Some(message) = &ores.message {
                if !message.content.is_empty() {
                    tx.send(StreamEvent::Delta {
                        text: message.content.to_string(),
                    })?;
                }
            }

            if ores.done {
                let input_tokens = ores.prompt_eval_count.unwrap_or(0);
                let output_tokens = ores.eval_count.unwrap_or(0);
                if input_tokens > 0 || output_tokens > 0 {
                    tx.send(StreamEvent::Usage {
                        input_tokens,
                        output_tokens,
                    })?;
                }
                tx.send(StreamEvent::StreamEnd)?;
                break;
            }
        }

        return Ok(());
    }
}
