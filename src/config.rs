use crate::db::kv::StoreError;
use crate::db::Database;
use crate::transport::{PromptContext, DEFAULT_CONTEXT_TURNS};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_WEBHOOK_URL: &str = "http://localhost:5678/webhook/chat";
pub const DEFAULT_STREAM_URL: &str = "http://localhost:5678/mcp/sse";

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a sharp, efficient assistant whose priority is to \
complete tasks and deliver results. You have access to business and productivity tools through \
the automation backend; for any actionable request, decide which tool fits and use it rather than \
describing what you could do. Ask questions only when absolutely necessary. Be concise and \
businesslike, but polite. If a task cannot be performed with the available tools, say so briefly \
and suggest a practical alternative.";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChatConfig {
    pub webhook_url: String,
    pub stream_url: String,
    pub assistant_name: String,
    pub user_name: String,
    pub sender_from: String,
    pub system_prompt: String,
    pub context_turns: usize,
    pub archive_limit: usize,
    pub request_timeout_secs: u64,
    pub local_greetings: bool,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            webhook_url: DEFAULT_WEBHOOK_URL.to_string(),
            stream_url: DEFAULT_STREAM_URL.to_string(),
            assistant_name: "Ghost".to_string(),
            user_name: "Mr Moloto".to_string(),
            sender_from: "Ghost Chatbot".to_string(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            context_turns: DEFAULT_CONTEXT_TURNS,
            archive_limit: 50,
            request_timeout_secs: 30,
            local_greetings: false,
        }
    }
}

pub const SETTING_KEYS: &[&str] = &[
    "webhook_url",
    "stream_url",
    "assistant_name",
    "user_name",
    "sender_from",
    "system_prompt",
    "context_turns",
    "archive_limit",
    "request_timeout_secs",
    "local_greetings",
];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Unknown setting key: {0}")]
    UnknownKey(String),
    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ChatConfig {
    /// Defaults overlaid with whatever the settings table holds.
    pub fn load(db: &Database) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        for (key, value) in db.list_settings()? {
            if SETTING_KEYS.contains(&key.as_str()) {
                config.apply(&key, &value)?;
            }
        }
        Ok(config)
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let invalid = || ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        };
        match key {
            "webhook_url" => self.webhook_url = value.to_string(),
            "stream_url" => self.stream_url = value.to_string(),
            "assistant_name" => self.assistant_name = value.to_string(),
            "user_name" => self.user_name = value.to_string(),
            "sender_from" => self.sender_from = value.to_string(),
            "system_prompt" => self.system_prompt = value.to_string(),
            "context_turns" => self.context_turns = value.parse().map_err(|_| invalid())?,
            "archive_limit" => {
                self.archive_limit = value
                    .parse()
                    .ok()
                    .filter(|n: &usize| *n > 0)
                    .ok_or_else(invalid)?
            }
            "request_timeout_secs" => {
                self.request_timeout_secs = value
                    .parse()
                    .ok()
                    .filter(|n: &u64| *n > 0)
                    .ok_or_else(invalid)?
            }
            "local_greetings" => {
                self.local_greetings = match value {
                    "true" | "on" | "1" => true,
                    "false" | "off" | "0" => false,
                    _ => return Err(invalid()),
                }
            }
            _ => return Err(ConfigError::UnknownKey(key.to_string())),
        }
        Ok(())
    }

    pub fn greeting(&self) -> String {
        format!(
            "Yebo {}! {} here. Ready to execute. What's the next task?",
            self.user_name, self.assistant_name
        )
    }

    pub fn thinking_text(&self) -> String {
        format!("{} is thinking...", self.assistant_name)
    }

    pub fn call_greeting(&self) -> String {
        format!(
            "Voice call connected! I'm {}, ready to assist you {}. How can I help?",
            self.assistant_name, self.user_name
        )
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn prompt_context(&self) -> PromptContext {
        PromptContext {
            system_prompt: self.system_prompt.clone(),
            user_name: self.user_name.clone(),
            assistant_name: self.assistant_name.clone(),
            turns: self.context_turns,
        }
    }
}

pub fn get_settings(db: &Database) -> Result<HashMap<String, String>, ConfigError> {
    let mut map = HashMap::new();
    for (key, value) in db.list_settings()? {
        if SETTING_KEYS.contains(&key.as_str()) {
            map.insert(key, value);
        }
    }
    Ok(map)
}

pub fn set_setting(db: &Database, key: &str, value: &str) -> Result<(), ConfigError> {
    if !SETTING_KEYS.contains(&key) {
        return Err(ConfigError::UnknownKey(key.to_string()));
    }
    // Validate before storing so a bad value never poisons later loads.
    ChatConfig::default().apply(key, value)?;
    db.set_setting(key, value)?;
    Ok(())
}

pub fn delete_setting(db: &Database, key: &str) -> Result<(), ConfigError> {
    if !SETTING_KEYS.contains(&key) {
        return Err(ConfigError::UnknownKey(key.to_string()));
    }
    db.delete_setting(key)?;
    Ok(())
}

/// `CHAT_RELAY_DATA_DIR`, else the platform data directory.
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("CHAT_RELAY_DATA_DIR") {
        return PathBuf::from(dir);
    }
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("chat-relay")
}
