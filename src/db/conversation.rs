//! Durable copy of the active conversation and the bounded archive.
//!
//! Every operation fails open: unreadable data loads as absent and write
//! failures are logged and dropped. The in-memory conversation owned by the
//! orchestrator stays authoritative for the session either way.

use std::sync::Arc;

use tracing::warn;

use super::kv::{KeyValueStore, StoreError};
use super::models::{ArchiveEntry, Conversation, Message};

pub const CONVERSATION_KEY: &str = "conversation_v1";
pub const ARCHIVE_KEY: &str = "conversation_archive_v1";
pub const DEFAULT_ARCHIVE_LIMIT: usize = 50;

pub struct ConversationStore {
    kv: Arc<dyn KeyValueStore>,
    greeting: String,
    archive_limit: usize,
}

impl ConversationStore {
    pub fn new(kv: Arc<dyn KeyValueStore>, greeting: impl Into<String>) -> Self {
        Self {
            kv,
            greeting: greeting.into(),
            archive_limit: DEFAULT_ARCHIVE_LIMIT,
        }
    }

    pub fn with_archive_limit(mut self, limit: usize) -> Self {
        self.archive_limit = limit.max(1);
        self
    }

    pub fn greeting(&self) -> &str {
        &self.greeting
    }

    /// A fresh conversation holding only the greeting.
    pub fn fresh(&self) -> Conversation {
        vec![Message::bot(self.greeting.clone())]
    }

    pub fn load(&self) -> Conversation {
        match self.read::<Conversation>(CONVERSATION_KEY) {
            Some(messages) if !messages.is_empty() => messages,
            _ => self.fresh(),
        }
    }

    pub fn save(&self, messages: &[Message]) {
        let persisted: Vec<&Message> = messages.iter().filter(|m| !m.placeholder).collect();
        self.write(CONVERSATION_KEY, &persisted);
    }

    pub fn clear(&self) {
        if let Err(e) = self.kv.remove(CONVERSATION_KEY) {
            warn!("Failed to clear persisted conversation: {}", e);
        }
    }

    /// Prepends an entry for `messages` and keeps the newest `archive_limit`.
    pub fn archive(&self, messages: &[Message]) -> ArchiveEntry {
        let entry = ArchiveEntry::from_conversation(messages);
        let mut entries = self.load_archive();
        entries.insert(0, entry.clone());
        entries.truncate(self.archive_limit);
        self.write(ARCHIVE_KEY, &entries);
        entry
    }

    /// Removes and returns the archived conversation with `id`.
    pub fn take_archived(&self, id: &str) -> Option<ArchiveEntry> {
        let mut entries = self.load_archive();
        let index = entries.iter().position(|e| e.id == id)?;
        let entry = entries.remove(index);
        self.write(ARCHIVE_KEY, &entries);
        Some(entry)
    }

    pub fn load_archive(&self) -> Vec<ArchiveEntry> {
        self.read(ARCHIVE_KEY).unwrap_or_default()
    }

    pub fn clear_archive(&self) {
        if let Err(e) = self.kv.remove(ARCHIVE_KEY) {
            warn!("Failed to clear conversation archive: {}", e);
        }
    }

    fn read<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = match self.kv.get(key) {
            Ok(raw) => raw?,
            Err(e) => {
                warn!("Failed to read {}: {}", key, e);
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Ignoring malformed {} entry: {}", key, e);
                None
            }
        }
    }

    fn write<T: serde::Serialize + ?Sized>(&self, key: &str, value: &T) {
        let result = serde_json::to_string(value)
            .map_err(StoreError::from)
            .and_then(|json| self.kv.set(key, &json));
        if let Err(e) = result {
            warn!("Failed to persist {}: {}", key, e);
        }
    }
}
