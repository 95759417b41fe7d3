pub mod sse;
pub mod webhook;

use crate::db::models::{Message, Sender};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Recent messages included with every request, for continuity.
pub const DEFAULT_CONTEXT_TURNS: usize = 10;

/// Fragment carried by the terminal event synthesized on a stream error.
pub const STREAM_ERROR_APOLOGY: &str = "Sorry, there was a problem with the tool connection.";

/// One user utterance bound for the single-shot backend.
#[derive(Debug, Clone)]
pub struct ReplyRequest {
    pub message: String,
    pub sender: Sender,
    pub context: Option<String>,
}

/// One-request, one-optional-response transport.
#[async_trait]
pub trait ReplyTransport: Send + Sync {
    /// Returns the bot's reply text, or `None` when no usable text came back.
    async fn request_reply(&self, request: &ReplyRequest) -> Option<String>;
}

/// Long-lived transport delivering a reply as incremental fragments.
pub trait StreamTransport: Send + Sync {
    fn open(&self, prompt: &str) -> StreamHandle;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Fragment(String),
    Done,
    /// Terminal; the stream is closed and carries the apology fragment.
    Error(String),
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamEvent::Fragment(_))
    }
}

/// Receiving end of an open stream. Dropping or disconnecting tears it down.
pub struct StreamHandle {
    events: mpsc::UnboundedReceiver<StreamEvent>,
    task: Option<JoinHandle<()>>,
}

impl StreamHandle {
    pub fn new(events: mpsc::UnboundedReceiver<StreamEvent>, task: Option<JoinHandle<()>>) -> Self {
        Self { events, task }
    }

    /// A handle fed by `events` with no background task, for scripted streams.
    pub fn from_events(events: Vec<StreamEvent>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        for event in events {
            let _ = tx.send(event);
        }
        Self::new(rx, None)
    }

    /// Next event; a closed channel without a terminal event reads as an error.
    pub async fn next_event(&mut self) -> StreamEvent {
        match self.events.recv().await {
            Some(event) => event,
            None => StreamEvent::Error(STREAM_ERROR_APOLOGY.to_string()),
        }
    }

    pub fn disconnect(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.events.close();
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    #[error("Stream closed before completion")]
    Closed,
}

/// Speaker labels and instructions shared by both transports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptContext {
    pub system_prompt: String,
    pub user_name: String,
    pub assistant_name: String,
    pub turns: usize,
}

impl PromptContext {
    /// `[speaker] text` lines for the most recent turns, placeholders excluded.
    pub fn render_turns(&self, messages: &[Message]) -> String {
        let real: Vec<&Message> = messages.iter().filter(|m| !m.placeholder).collect();
        let start = real.len().saturating_sub(self.turns);
        real[start..]
            .iter()
            .map(|m| {
                let speaker = match m.sender {
                    Sender::User => &self.user_name,
                    Sender::Bot => &self.assistant_name,
                };
                format!("[{}] {}", speaker, m.text)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Instructions plus recent turns, sent alongside a single-shot request.
    pub fn webhook_context(&self, history: &[Message]) -> String {
        format!(
            "[SYSTEM INSTRUCTIONS]\n{}\n\n[CHAT CONTEXT]\n{}",
            self.system_prompt,
            self.render_turns(history)
        )
    }

    /// Full prompt embedded in the streaming request.
    pub fn stream_prompt(&self, history: &[Message], request: &str) -> String {
        format!(
            "{}\n\n[REQUEST]\n{}",
            self.webhook_context(history),
            request
        )
    }
}
