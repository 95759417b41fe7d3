use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Bot,
}

impl Sender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sender::User => "user",
            Sender::Bot => "bot",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Message {
    pub text: String,
    pub sender: Sender,
    pub time: String,
    /// Set on the transient "is thinking" bubble; such messages are never persisted.
    #[serde(skip)]
    pub placeholder: bool,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(text, Sender::User)
    }

    pub fn bot(text: impl Into<String>) -> Self {
        Self::new(text, Sender::Bot)
    }

    pub fn placeholder(text: impl Into<String>) -> Self {
        Self {
            placeholder: true,
            ..Self::new(text, Sender::Bot)
        }
    }

    fn new(text: impl Into<String>, sender: Sender) -> Self {
        Self {
            text: text.into(),
            sender,
            time: clock_time(),
            placeholder: false,
        }
    }
}

/// Hour:minute of the local clock, as shown next to each bubble.
pub fn clock_time() -> String {
    Local::now().format("%H:%M").to_string()
}

pub type Conversation = Vec<Message>;

pub const ARCHIVE_TITLE_LIMIT: usize = 50;
pub const UNTITLED_CONVERSATION: &str = "New conversation";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ArchiveEntry {
    pub id: String,
    pub messages: Conversation,
    pub timestamp: DateTime<Utc>,
    pub title: String,
}

impl ArchiveEntry {
    pub fn from_conversation(messages: &[Message]) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            messages: messages.iter().filter(|m| !m.placeholder).cloned().collect(),
            timestamp: Utc::now(),
            title: archive_title(messages),
        }
    }
}

/// Title from the first user message, cut to 50 characters plus an ellipsis.
pub fn archive_title(messages: &[Message]) -> String {
    match messages.iter().find(|m| m.sender == Sender::User) {
        Some(first) if first.text.chars().count() > ARCHIVE_TITLE_LIMIT => {
            let head: String = first.text.chars().take(ARCHIVE_TITLE_LIMIT).collect();
            format!("{}...", head)
        }
        Some(first) => first.text.clone(),
        None => UNTITLED_CONVERSATION.to_string(),
    }
}
