use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use super::Message;
use super::StreamEvent;

/// Everything a direct-completion request needs: the full message history of
/// the session, image parts included.
pub struct BackendPrompt {
    pub messages: Vec<Message>,
}

impl BackendPrompt {
    pub fn new(messages: Vec<Message>) -> BackendPrompt {
        return BackendPrompt { messages };
    }
}

#[async_trait]
pub trait CompletionBackend {
    /// Used at startup to verify the backend is reachable before offering it
    /// as the non-remote send path.
    async fn health_check(&self) -> Result<()>;

    /// All models the backend can serve, for presentation code to offer.
    async fn list_models(&self) -> Result<Vec<String>>;

    /// Requests a completion for the full message history. Results stream
    /// back through the channel as `StreamEvent`s, ending with a terminal
    /// `stream_end` or `error` event.
    async fn get_completion<'a>(
        &self,
        prompt: BackendPrompt,
        tx: &'a mpsc::UnboundedSender<StreamEvent>,
    ) -> Result<()>;
}

pub type BackendBox = Box<dyn CompletionBackend + Send + Sync>;
