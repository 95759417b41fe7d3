//! Chat orchestrator: the single owner of the live conversation.
//!
//! Sends go to the single-shot transport first and fall back to the
//! streaming transport when it yields nothing usable. Every mutation is
//! persisted through the [`ConversationStore`] and published as a
//! [`ChatSnapshot`] for whatever renders the conversation.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::ChatConfig;
use crate::db::conversation::ConversationStore;
use crate::db::models::{ArchiveEntry, Conversation, Message, Sender};
use crate::transport::{
    PromptContext, ReplyRequest, ReplyTransport, StreamEvent, StreamTransport,
};

/// Appended when neither transport produced any text.
pub const FALLBACK_REPLY: &str =
    "Sorry, I couldn't get a response from the assistant right now. Please try again.";

/// Spoken when a voice message gets no reply.
pub const VOICE_FALLBACK_REPLY: &str =
    "Thank you for your message. I'm processing your request now.";

const GREETINGS: &[&str] = &[
    "hello",
    "hi",
    "hey",
    "howzit",
    "good morning",
    "good afternoon",
    "good evening",
    "yebo",
];

#[derive(Debug, Clone, PartialEq)]
pub struct ChatSnapshot {
    pub messages: Vec<Message>,
    pub processing: bool,
}

struct ChatState {
    messages: Conversation,
    in_flight: usize,
    /// Bumped whenever the conversation is replaced or truncated; sends
    /// started under an older generation drop their results.
    generation: u64,
}

impl ChatState {
    fn snapshot(&self) -> ChatSnapshot {
        ChatSnapshot {
            messages: self.messages.clone(),
            processing: self.in_flight > 0,
        }
    }

    fn replace(&mut self, messages: Conversation) {
        self.messages = messages;
        self.generation += 1;
    }
}

pub struct ChatOrchestrator {
    store: ConversationStore,
    reply: Arc<dyn ReplyTransport>,
    stream: Arc<dyn StreamTransport>,
    prompt: PromptContext,
    thinking_text: String,
    local_greetings: bool,
    state: Mutex<ChatState>,
    updates: watch::Sender<ChatSnapshot>,
}

impl ChatOrchestrator {
    pub fn new(
        store: ConversationStore,
        reply: Arc<dyn ReplyTransport>,
        stream: Arc<dyn StreamTransport>,
        config: &ChatConfig,
    ) -> Self {
        let state = ChatState {
            messages: store.load(),
            in_flight: 0,
            generation: 0,
        };
        let (updates, _) = watch::channel(state.snapshot());
        Self {
            store,
            reply,
            stream,
            prompt: config.prompt_context(),
            thinking_text: config.thinking_text(),
            local_greetings: config.local_greetings,
            state: Mutex::new(state),
            updates,
        }
    }

    pub fn messages(&self) -> Vec<Message> {
        self.with_state(|state| state.messages.clone())
    }

    pub fn is_processing(&self) -> bool {
        self.with_state(|state| state.in_flight > 0)
    }

    pub fn subscribe(&self) -> watch::Receiver<ChatSnapshot> {
        self.updates.subscribe()
    }

    pub async fn send_message(&self, text: &str) {
        let question = text.trim();
        if question.is_empty() {
            return;
        }

        let (generation, history) = self.mutate(|state, store| {
            let history = state.messages.clone();
            state.messages.push(Message::user(question));
            store.save(&state.messages);
            (state.generation, history)
        });

        if self.local_greetings && is_greeting(question) {
            debug!("Answering greeting locally");
            let greeting = self.store.greeting().to_string();
            self.mutate(|state, store| {
                if state.generation == generation {
                    state.messages.push(Message::bot(greeting));
                    store.save(&state.messages);
                }
            });
            return;
        }

        let slot = self.mutate(|state, _| {
            state.in_flight += 1;
            state.messages.push(Message::placeholder(self.thinking_text.clone()));
            state.messages.len() - 1
        });

        let request = ReplyRequest {
            message: question.to_string(),
            sender: Sender::User,
            context: Some(self.prompt.webhook_context(&history)),
        };
        let reply = match self.reply.request_reply(&request).await {
            Some(reply) => reply,
            None => {
                info!("No single-shot reply, falling back to the event stream");
                self.stream_reply(generation, slot, &history, question).await
            }
        };

        self.mutate(|state, store| {
            state.in_flight = state.in_flight.saturating_sub(1);
            if state.generation != generation {
                info!("Dropping reply for a conversation that was cleared or rewound");
                return;
            }
            if let Some(message) = state.messages.get_mut(slot) {
                *message = Message::bot(reply);
            }
            store.save(&state.messages);
        });
    }

    /// Streams a reply, growing the placeholder in place, and returns the
    /// final text (or the fallback when nothing arrived).
    async fn stream_reply(
        &self,
        generation: u64,
        slot: usize,
        history: &[Message],
        question: &str,
    ) -> String {
        let mut handle = self.stream.open(&self.prompt.stream_prompt(history, question));
        let mut accumulated = String::new();

        loop {
            match handle.next_event().await {
                StreamEvent::Fragment(fragment) => {
                    accumulated.push_str(&fragment);
                    let live = self.mutate(|state, _| {
                        if state.generation != generation {
                            return false;
                        }
                        if let Some(message) = state.messages.get_mut(slot) {
                            message.text = accumulated.clone();
                        }
                        true
                    });
                    if !live {
                        handle.disconnect();
                        break;
                    }
                }
                StreamEvent::Done => break,
                StreamEvent::Error(apology) => {
                    warn!("Event stream ended with an error: {}", apology);
                    break;
                }
            }
        }

        let text = accumulated.trim();
        if text.is_empty() {
            FALLBACK_REPLY.to_string()
        } else {
            text.to_string()
        }
    }

    /// Resets to a lone greeting and forgets the persisted conversation.
    pub fn clear_history(&self) {
        self.mutate(|state, store| {
            state.replace(store.fresh());
            store.clear();
        });
    }

    /// Archives the current conversation when it holds more than the
    /// greeting, then clears it.
    pub fn new_chat(&self) -> Option<ArchiveEntry> {
        let entry = self.mutate(|state, store| {
            let real = state.messages.iter().filter(|m| !m.placeholder).count();
            let entry = (real > 1).then(|| store.archive(&state.messages));
            state.replace(store.fresh());
            store.clear();
            entry
        });
        if let Some(entry) = &entry {
            info!("Archived conversation \"{}\"", entry.title);
        }
        entry
    }

    /// Rewinds the conversation to end at `index` (inclusive).
    pub fn load_message_context(&self, index: usize) -> bool {
        self.mutate(|state, store| {
            if index >= state.messages.len() {
                return false;
            }
            let mut kept: Conversation = state.messages[..=index].to_vec();
            kept.retain(|m| !m.placeholder);
            state.replace(kept);
            store.save(&state.messages);
            true
        })
    }

    /// Single-shot round trip for the voice call. Never touches the visible
    /// conversation and never falls back to streaming.
    pub async fn send_voice_message(&self, text: &str) -> String {
        let text = text.trim();
        if text.is_empty() {
            return VOICE_FALLBACK_REPLY.to_string();
        }
        let history = self.messages();
        let request = ReplyRequest {
            message: text.to_string(),
            sender: Sender::User,
            context: Some(self.prompt.webhook_context(&history)),
        };
        match self.reply.request_reply(&request).await {
            Some(reply) => reply,
            None => {
                info!("No reply for voice message, using fallback");
                VOICE_FALLBACK_REPLY.to_string()
            }
        }
    }

    pub fn archives(&self) -> Vec<ArchiveEntry> {
        self.store.load_archive()
    }

    pub fn clear_archive(&self) {
        self.store.clear_archive();
    }

    /// Makes an archived conversation the live one. The entry leaves the
    /// archive; the next `new_chat` files it again.
    pub fn restore_archive(&self, id: &str) -> bool {
        let Some(entry) = self.store.take_archived(id) else {
            return false;
        };
        self.mutate(|state, store| {
            state.replace(entry.messages);
            store.save(&state.messages);
        });
        true
    }

    fn with_state<R>(&self, f: impl FnOnce(&ChatState) -> R) -> R {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&*state)
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut ChatState, &ConversationStore) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let result = f(&mut *state, &self.store);
        self.updates.send_replace(state.snapshot());
        result
    }
}

/// Whether `text` is a bare greeting, ignoring case and punctuation.
pub fn is_greeting(text: &str) -> bool {
    let cleaned: String = text
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_whitespace())
        .collect();
    let cleaned = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");

    GREETINGS.iter().any(|g| {
        cleaned == *g
            || cleaned.starts_with(&format!("{} ", g))
            || cleaned.ends_with(&format!(" {}", g))
            || cleaned.contains(&format!(" {} ", g))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::kv::{KeyValueStore, MemoryStore};
    use crate::transport::StreamHandle;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::{mpsc, Notify};

    struct FakeReply {
        reply: Option<String>,
        requests: Mutex<Vec<ReplyRequest>>,
        gate: Option<Arc<Notify>>,
    }

    impl FakeReply {
        fn new(reply: Option<&str>) -> Arc<Self> {
            Arc::new(Self {
                reply: reply.map(str::to_string),
                requests: Mutex::new(Vec::new()),
                gate: None,
            })
        }

        fn gated(reply: Option<&str>, gate: Arc<Notify>) -> Arc<Self> {
            Arc::new(Self {
                reply: reply.map(str::to_string),
                requests: Mutex::new(Vec::new()),
                gate: Some(gate),
            })
        }

        fn calls(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ReplyTransport for FakeReply {
        async fn request_reply(&self, request: &ReplyRequest) -> Option<String> {
            self.requests.lock().unwrap().push(request.clone());
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            self.reply.clone()
        }
    }

    /// Streams scripted events, or hands the sender to the test when live.
    struct FakeStream {
        events: Vec<StreamEvent>,
        opened: AtomicUsize,
        prompts: Mutex<Vec<String>>,
        live: Mutex<Option<mpsc::UnboundedSender<StreamEvent>>>,
        open_signal: Arc<Notify>,
        is_live: bool,
    }

    impl FakeStream {
        fn scripted(events: Vec<StreamEvent>) -> Arc<Self> {
            Self::build(events, false)
        }

        fn live() -> Arc<Self> {
            Self::build(Vec::new(), true)
        }

        fn build(events: Vec<StreamEvent>, is_live: bool) -> Arc<Self> {
            Arc::new(Self {
                events,
                opened: AtomicUsize::new(0),
                prompts: Mutex::new(Vec::new()),
                live: Mutex::new(None),
                open_signal: Arc::new(Notify::new()),
                is_live,
            })
        }

        fn opened(&self) -> usize {
            self.opened.load(Ordering::SeqCst)
        }

        fn sender(&self) -> mpsc::UnboundedSender<StreamEvent> {
            self.live.lock().unwrap().clone().unwrap()
        }
    }

    impl StreamTransport for FakeStream {
        fn open(&self, prompt: &str) -> StreamHandle {
            self.opened.fetch_add(1, Ordering::SeqCst);
            self.prompts.lock().unwrap().push(prompt.to_string());
            let handle = if self.is_live {
                let (tx, rx) = mpsc::unbounded_channel();
                *self.live.lock().unwrap() = Some(tx);
                StreamHandle::new(rx, None)
            } else {
                StreamHandle::from_events(self.events.clone())
            };
            self.open_signal.notify_one();
            handle
        }
    }

    fn orchestrator_with(
        kv: Arc<dyn KeyValueStore>,
        reply: Arc<FakeReply>,
        stream: Arc<FakeStream>,
        config: &ChatConfig,
    ) -> ChatOrchestrator {
        let store = ConversationStore::new(kv, config.greeting());
        ChatOrchestrator::new(store, reply, stream, config)
    }

    fn orchestrator(reply: Arc<FakeReply>, stream: Arc<FakeStream>) -> ChatOrchestrator {
        orchestrator_with(
            Arc::new(MemoryStore::new()),
            reply,
            stream,
            &ChatConfig::default(),
        )
    }

    fn texts(messages: &[Message]) -> Vec<String> {
        messages.iter().map(|m| m.text.clone()).collect()
    }

    #[tokio::test]
    async fn test_blank_input_is_ignored() {
        let reply = FakeReply::new(Some("x"));
        let stream = FakeStream::scripted(vec![]);
        let chat = orchestrator(reply.clone(), stream.clone());
        chat.send_message("   \n").await;
        assert_eq!(chat.messages().len(), 1);
        assert_eq!(reply.calls(), 0);
        assert_eq!(stream.opened(), 0);
    }

    #[tokio::test]
    async fn test_single_shot_reply_skips_stream() {
        let reply = FakeReply::new(Some("X"));
        let stream = FakeStream::scripted(vec![StreamEvent::Fragment("nope".into())]);
        let chat = orchestrator(reply.clone(), stream.clone());

        chat.send_message("Do the thing").await;

        let messages = chat.messages();
        assert_eq!(texts(&messages)[1..], ["Do the thing", "X"]);
        assert_eq!(messages[2].sender, Sender::Bot);
        assert!(!messages[2].placeholder);
        assert_eq!(stream.opened(), 0);
        assert!(!chat.is_processing());
    }

    #[tokio::test]
    async fn test_stream_fragments_accumulate_into_one_message() {
        let reply = FakeReply::new(None);
        let stream = FakeStream::scripted(vec![
            StreamEvent::Fragment("Hel".into()),
            StreamEvent::Fragment("lo".into()),
            StreamEvent::Done,
        ]);
        let chat = orchestrator(reply, stream.clone());

        chat.send_message("greet me").await;

        let messages = chat.messages();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[2].text, "Hello");
        assert_eq!(messages.iter().filter(|m| m.text == "Hello").count(), 1);
        assert!(messages.iter().all(|m| !m.placeholder));
        assert_eq!(stream.opened(), 1);
    }

    #[tokio::test]
    async fn test_both_transports_fail_yields_fallback() {
        let reply = FakeReply::new(None);
        let stream = FakeStream::scripted(vec![StreamEvent::Error(
            crate::transport::STREAM_ERROR_APOLOGY.into(),
        )]);
        let chat = orchestrator(reply, stream);

        chat.send_message("anything").await;

        let last = chat.messages().last().cloned().unwrap();
        assert_eq!(last.text, FALLBACK_REPLY);
        assert_eq!(last.sender, Sender::Bot);
        assert!(!chat.is_processing());
    }

    #[tokio::test]
    async fn test_example_scenario_persists_final_state() {
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let config = ChatConfig::default();
        let reply = FakeReply::new(None);
        let stream = FakeStream::scripted(vec![
            StreamEvent::Fragment("4".into()),
            StreamEvent::Done,
        ]);
        let chat = orchestrator_with(kv.clone(), reply.clone(), stream.clone(), &config);

        chat.send_message("What is 2+2?").await;

        let expected = vec![config.greeting(), "What is 2+2?".into(), "4".into()];
        assert_eq!(texts(&chat.messages()), expected);

        let reloaded = ConversationStore::new(kv, config.greeting()).load();
        assert_eq!(texts(&reloaded), expected);

        let prompt = stream.prompts.lock().unwrap()[0].clone();
        assert!(prompt.ends_with("[REQUEST]\nWhat is 2+2?"));
        assert!(prompt.contains("[Ghost] Yebo Mr Moloto!"));
        let request = reply.requests.lock().unwrap()[0].clone();
        assert_eq!(request.message, "What is 2+2?");
        assert!(request.context.unwrap().starts_with("[SYSTEM INSTRUCTIONS]"));
    }

    #[tokio::test]
    async fn test_user_message_is_shown_before_reply_arrives() {
        let gate = Arc::new(Notify::new());
        let reply = FakeReply::gated(Some("done"), gate.clone());
        let chat = Arc::new(orchestrator(reply.clone(), FakeStream::scripted(vec![])));
        let mut updates = chat.subscribe();

        let task = {
            let chat = chat.clone();
            tokio::spawn(async move { chat.send_message("slow one").await })
        };

        // Wait for the placeholder, which follows the user message.
        updates
            .wait_for(|snap| snap.messages.iter().any(|m| m.placeholder))
            .await
            .unwrap();
        let during = chat.messages();
        assert_eq!(during.len(), 3);
        assert_eq!(during[1].text, "slow one");
        assert_eq!(during[1].sender, Sender::User);
        assert_eq!(during[2].text, "Ghost is thinking...");
        assert!(chat.is_processing());

        gate.notify_one();
        task.await.unwrap();
        assert_eq!(texts(&chat.messages())[2], "done");
        assert!(!chat.is_processing());
    }

    #[tokio::test]
    async fn test_placeholder_grows_in_place() {
        let stream = FakeStream::live();
        let chat = Arc::new(orchestrator(FakeReply::new(None), stream.clone()));
        let mut updates = chat.subscribe();

        let task = {
            let chat = chat.clone();
            tokio::spawn(async move { chat.send_message("stream it").await })
        };
        stream.open_signal.notified().await;
        let tx = stream.sender();

        tx.send(StreamEvent::Fragment("par".into())).unwrap();
        updates
            .wait_for(|snap| snap.messages.last().map(|m| m.text.as_str()) == Some("par"))
            .await
            .unwrap();
        let during = chat.messages();
        assert_eq!(during.len(), 3);
        assert!(during[2].placeholder);

        tx.send(StreamEvent::Fragment("tial ".into())).unwrap();
        tx.send(StreamEvent::Done).unwrap();
        task.await.unwrap();

        let messages = chat.messages();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[2].text, "partial");
        assert!(!messages[2].placeholder);
    }

    #[tokio::test]
    async fn test_clear_during_stream_discards_late_reply() {
        let stream = FakeStream::live();
        let chat = Arc::new(orchestrator(FakeReply::new(None), stream.clone()));

        let task = {
            let chat = chat.clone();
            tokio::spawn(async move { chat.send_message("long task").await })
        };
        stream.open_signal.notified().await;
        let tx = stream.sender();

        chat.clear_history();
        let _ = tx.send(StreamEvent::Fragment("stale".into()));
        let _ = tx.send(StreamEvent::Done);
        task.await.unwrap();

        let messages = chat.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text, ChatConfig::default().greeting());
        assert!(!chat.is_processing());
    }

    #[tokio::test]
    async fn test_clear_history_resets_to_greeting() {
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let config = ChatConfig::default();
        let chat = orchestrator_with(
            kv.clone(),
            FakeReply::new(Some("ok")),
            FakeStream::scripted(vec![]),
            &config,
        );
        chat.send_message("one").await;
        chat.send_message("two").await;
        chat.clear_history();

        let messages = chat.messages();
        assert_eq!(texts(&messages), vec![config.greeting()]);
        assert_eq!(messages[0].sender, Sender::Bot);
        assert_eq!(ConversationStore::new(kv, config.greeting()).load().len(), 1);
    }

    #[tokio::test]
    async fn test_new_chat_archives_with_title() {
        let chat = orchestrator(FakeReply::new(Some("ok")), FakeStream::scripted(vec![]));
        let long = "Please summarise every email I received from the finance team last week";
        chat.send_message(long).await;

        let entry = chat.new_chat().unwrap();
        assert_eq!(entry.title, format!("{}...", &long[..50]));
        assert_eq!(entry.messages.len(), 3);
        assert_eq!(chat.archives().len(), 1);
        assert_eq!(chat.messages().len(), 1);
    }

    #[tokio::test]
    async fn test_new_chat_on_fresh_conversation_does_not_archive() {
        let chat = orchestrator(FakeReply::new(Some("ok")), FakeStream::scripted(vec![]));
        assert!(chat.new_chat().is_none());
        assert!(chat.archives().is_empty());
    }

    #[tokio::test]
    async fn test_load_message_context_truncates_and_persists() {
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let config = ChatConfig::default();
        let chat = orchestrator_with(
            kv.clone(),
            FakeReply::new(Some("ok")),
            FakeStream::scripted(vec![]),
            &config,
        );
        chat.send_message("first").await;
        chat.send_message("second").await;
        assert_eq!(chat.messages().len(), 5);

        assert!(chat.load_message_context(2));
        assert_eq!(texts(&chat.messages()), vec![config.greeting(), "first".into(), "ok".into()]);
        assert!(!chat.load_message_context(10));

        let reloaded = orchestrator_with(
            kv,
            FakeReply::new(None),
            FakeStream::scripted(vec![]),
            &config,
        );
        assert_eq!(reloaded.messages().len(), 3);
    }

    #[tokio::test]
    async fn test_restore_archive() {
        let chat = orchestrator(FakeReply::new(Some("ok")), FakeStream::scripted(vec![]));
        chat.send_message("remember this").await;
        let entry = chat.new_chat().unwrap();

        assert!(chat.restore_archive(&entry.id));
        assert_eq!(texts(&chat.messages())[1], "remember this");
        assert!(chat.archives().is_empty());
        assert!(!chat.restore_archive(&entry.id));
        assert!(!chat.restore_archive("missing"));

        // Archiving the restored conversation again leaves a single copy.
        let again = chat.new_chat().unwrap();
        let archives = chat.archives();
        assert_eq!(archives.len(), 1);
        assert_eq!(archives[0].id, again.id);
        assert_eq!(archives[0].title, entry.title);

        chat.clear_archive();
        assert!(chat.archives().is_empty());
    }

    #[tokio::test]
    async fn test_voice_message_leaves_conversation_alone() {
        let reply = FakeReply::new(Some("spoken reply"));
        let stream = FakeStream::scripted(vec![StreamEvent::Fragment("never".into())]);
        let chat = orchestrator(reply, stream.clone());

        assert_eq!(chat.send_voice_message("hello there").await, "spoken reply");
        assert_eq!(chat.messages().len(), 1);
        assert_eq!(stream.opened(), 0);
    }

    #[tokio::test]
    async fn test_voice_message_fallback() {
        let stream = FakeStream::scripted(vec![StreamEvent::Fragment("never".into())]);
        let chat = orchestrator(FakeReply::new(None), stream.clone());
        assert_eq!(chat.send_voice_message("status?").await, VOICE_FALLBACK_REPLY);
        assert_eq!(stream.opened(), 0);
    }

    #[tokio::test]
    async fn test_local_greeting_shortcut() {
        let config = ChatConfig {
            local_greetings: true,
            ..ChatConfig::default()
        };
        let reply = FakeReply::new(Some("remote"));
        let chat = orchestrator_with(
            Arc::new(MemoryStore::new()),
            reply.clone(),
            FakeStream::scripted(vec![]),
            &config,
        );
        chat.send_message("Howzit!").await;
        assert_eq!(reply.calls(), 0);
        assert_eq!(chat.messages().last().unwrap().text, config.greeting());

        chat.send_message("What's on my calendar?").await;
        assert_eq!(reply.calls(), 1);
    }

    #[test]
    fn test_is_greeting() {
        assert!(is_greeting("Hello"));
        assert!(is_greeting("hi there"));
        assert!(is_greeting("well, good morning"));
        assert!(is_greeting("oh hey you"));
        assert!(!is_greeting("highlight the report"));
        assert!(!is_greeting("book a flight"));
    }
}
