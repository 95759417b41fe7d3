pub mod chat;
pub mod config;
pub mod db;
pub mod files;
pub mod logging;
pub mod transport;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info};

use chat::{
    format_duration, ChatOrchestrator, ChatSnapshot, SpeechCapture, SpeechOutput, Utterance,
    VoiceCall, VoiceReply,
};
use config::ChatConfig;
use db::conversation::ConversationStore;
use db::models::{Message, Sender};
use db::Database;
use files::AttachmentTray;
use transport::sse::{SseClient, SseConfig};
use transport::webhook::{WebhookClient, WebhookConfig};

/// One line of terminal input.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Send(String),
    Clear,
    New,
    History,
    Rewind(usize),
    Archive,
    Restore(String),
    ClearArchive,
    Attach(PathBuf),
    Detach(usize),
    Settings,
    Set(String, String),
    Unset(String),
    Call,
    Hangup,
    Mute,
    PushToTalk,
    Quit,
    Empty,
    Invalid(String),
}

impl Command {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return Command::Empty;
        }
        let Some(rest) = line.strip_prefix('/') else {
            return Command::Send(line.to_string());
        };
        let (name, arg) = match rest.split_once(char::is_whitespace) {
            Some((name, arg)) => (name, arg.trim()),
            None => (rest, ""),
        };
        match (name, arg) {
            ("clear", "") => Command::Clear,
            ("new", "") => Command::New,
            ("history", "") => Command::History,
            ("rewind", n) => n
                .parse()
                .map(Command::Rewind)
                .unwrap_or_else(|_| Command::Invalid("usage: /rewind <message number>".into())),
            ("archive", "") => Command::Archive,
            ("archive", "clear") => Command::ClearArchive,
            ("restore", id) if !id.is_empty() => Command::Restore(id.to_string()),
            ("attach", path) if !path.is_empty() => Command::Attach(PathBuf::from(path)),
            ("detach", n) => n
                .parse()
                .map(Command::Detach)
                .unwrap_or_else(|_| Command::Invalid("usage: /detach <attachment number>".into())),
            ("settings", "") => Command::Settings,
            ("set", kv) => match kv.split_once(char::is_whitespace) {
                Some((key, value)) => Command::Set(key.to_string(), value.trim().to_string()),
                None => Command::Invalid("usage: /set <key> <value>".into()),
            },
            ("unset", key) if !key.is_empty() => Command::Unset(key.to_string()),
            ("call", "") => Command::Call,
            ("hangup", "") => Command::Hangup,
            ("mute", "") => Command::Mute,
            ("ptt", "") => Command::PushToTalk,
            ("quit", "") | ("exit", "") => Command::Quit,
            _ => Command::Invalid(format!("unknown command: {}", line)),
        }
    }
}

/// Capture stand-in for the terminal: typed lines are the transcripts.
struct TerminalCapture;

impl SpeechCapture for TerminalCapture {
    fn start(&self) {
        debug!("Capture started");
    }

    fn stop(&self) {
        debug!("Capture stopped");
    }
}

/// Prints utterances instead of speaking them; playback finishes at once.
#[derive(Default)]
struct TerminalSpeech {
    finished: Mutex<Vec<u64>>,
}

impl TerminalSpeech {
    fn drain(&self) -> Vec<u64> {
        self.finished
            .lock()
            .map(|mut ids| std::mem::take(&mut *ids))
            .unwrap_or_default()
    }
}

impl SpeechOutput for TerminalSpeech {
    fn speak(&self, utterance: Utterance) {
        println!("  (voice) {}", utterance.text);
        if let Ok(mut ids) = self.finished.lock() {
            ids.push(utterance.id);
        }
    }

    fn cancel_all(&self) {
        if let Ok(mut ids) = self.finished.lock() {
            ids.clear();
        }
    }
}

fn settle(call: &mut VoiceCall, speech: &TerminalSpeech) {
    for id in speech.drain() {
        call.speech_finished(id);
    }
    println!(
        "  [{} | {}{}{}]",
        format_duration(call.elapsed_secs()),
        call.state().label(),
        if call.is_muted() { " | muted" } else { "" },
        if call.is_push_to_talk() { " | push-to-talk" } else { "" },
    );
}

fn format_message(index: usize, message: &Message, assistant: &str) -> String {
    let speaker = match message.sender {
        Sender::User => "you",
        Sender::Bot => assistant,
    };
    format!("{:>3} {} {}: {}", index, message.time, speaker, message.text)
}

fn print_message(index: usize, message: &Message, assistant: &str) {
    println!("{}", format_message(index, message, assistant));
}

/// Tracks what of the live conversation has reached the terminal.
#[derive(Debug, Default)]
struct Transcript {
    printed: usize,
    partial: String,
}

impl Transcript {
    /// Treats the first `len` messages as already shown.
    fn sync(&mut self, len: usize) {
        self.printed = len;
        self.partial.clear();
    }

    /// Lines for messages not yet shown. A placeholder is shown each time
    /// its text grows and is printed for good once replaced.
    fn render(&mut self, snapshot: &ChatSnapshot, assistant: &str) -> Vec<String> {
        let mut lines = Vec::new();
        if snapshot.messages.len() < self.printed {
            self.sync(snapshot.messages.len());
        }
        for (i, message) in snapshot.messages.iter().enumerate().skip(self.printed) {
            if message.placeholder {
                if message.text != self.partial {
                    lines.push(format!("    ... {}", message.text));
                    self.partial = message.text.clone();
                }
                break;
            }
            lines.push(format_message(i, message, assistant));
            self.printed = i + 1;
            self.partial.clear();
        }
        lines
    }
}

struct Session {
    db: Arc<Database>,
    config: ChatConfig,
    chat: Arc<ChatOrchestrator>,
}

impl Session {
    fn open(db: Arc<Database>) -> Result<Self, Box<dyn std::error::Error>> {
        let config = ChatConfig::load(&db)?;
        let store = ConversationStore::new(db.clone(), config.greeting())
            .with_archive_limit(config.archive_limit);
        let reply = WebhookClient::new(WebhookConfig {
            url: config.webhook_url.clone(),
            from: config.sender_from.clone(),
            timeout: config.request_timeout(),
        })?;
        let stream = SseClient::new(SseConfig {
            url: config.stream_url.clone(),
        })?;
        let chat = Arc::new(ChatOrchestrator::new(
            store,
            Arc::new(reply),
            Arc::new(stream),
            &config,
        ));
        info!(
            "Relaying to {} (stream {})",
            config.webhook_url, config.stream_url
        );
        Ok(Self { db, config, chat })
    }
}

/// Terminal front end: opens the store, wires the transports and runs the
/// command loop until `/quit` or end of input.
pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    logging::init();

    let data_dir = config::data_dir();
    let db = Arc::new(Database::new(&data_dir)?);
    info!("Data directory: {}", data_dir.display());

    let mut session = Session::open(db)?;
    let mut tray = AttachmentTray::new();
    let capture: Arc<TerminalCapture> = Arc::new(TerminalCapture);
    let speech = Arc::new(TerminalSpeech::default());
    let mut call: Option<VoiceCall> = None;
    let (reply_tx, mut voice_replies) = mpsc::unbounded_channel::<VoiceReply>();

    let mut updates = session.chat.subscribe();
    let mut transcript = Transcript::default();
    for line in transcript.render(&updates.borrow_and_update(), &session.config.assistant_name) {
        println!("{}", line);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => line,
                None => break,
            },
            changed = updates.changed() => {
                if changed.is_err() {
                    updates = session.chat.subscribe();
                }
                let snapshot = updates.borrow_and_update().clone();
                for line in transcript.render(&snapshot, &session.config.assistant_name) {
                    println!("{}", line);
                }
                continue;
            }
            Some(reply) = voice_replies.recv() => {
                match call.as_mut() {
                    Some(active) => {
                        if active.reply_ready(reply) {
                            settle(active, &speech);
                        }
                    }
                    None => debug!("Voice reply arrived after the call ended"),
                }
                continue;
            }
        };

        let command = Command::parse(&line);
        let replaces_conversation = matches!(
            command,
            Command::Clear
                | Command::New
                | Command::Rewind(_)
                | Command::Restore(_)
                | Command::Set(..)
                | Command::Unset(_)
        );
        match command {
            Command::Empty => {}
            Command::Quit => break,
            Command::Invalid(reason) => println!("  {}", reason),
            Command::Send(text) => {
                if let Some(active) = call.as_mut() {
                    // In push-to-talk mode a typed line is one held press.
                    active.push_to_talk_pressed();
                    match active.begin_turn(&text) {
                        Some(turn) => {
                            let tx = reply_tx.clone();
                            tokio::spawn(async move {
                                let _ = tx.send(turn.reply().await);
                            });
                        }
                        None => println!("  (not listening)"),
                    }
                    active.push_to_talk_released();
                    settle(active, &speech);
                    continue;
                }
                let attached = tray.take();
                if !attached.is_empty() {
                    debug!("Releasing {} attachment(s) with message", attached.len());
                    for file in &attached {
                        println!("  + {}", file.describe());
                    }
                }
                let chat = session.chat.clone();
                tokio::spawn(async move { chat.send_message(&text).await });
            }
            Command::Clear => {
                session.chat.clear_history();
                println!("  Conversation cleared.");
            }
            Command::New => match session.chat.new_chat() {
                Some(entry) => println!("  Archived \"{}\" ({})", entry.title, entry.id),
                None => println!("  Started a new conversation."),
            },
            Command::History => {
                for (i, message) in session.chat.messages().iter().enumerate() {
                    print_message(i, message, &session.config.assistant_name);
                }
            }
            Command::Rewind(index) => {
                if session.chat.load_message_context(index) {
                    println!("  Rewound to message {}.", index);
                } else {
                    println!("  No message {}.", index);
                }
            }
            Command::Archive => {
                let archives = session.chat.archives();
                if archives.is_empty() {
                    println!("  Archive is empty.");
                }
                for entry in archives {
                    println!(
                        "  {} {} {} ({} messages)",
                        entry.id,
                        entry.timestamp.format("%Y-%m-%d %H:%M"),
                        entry.title,
                        entry.messages.len()
                    );
                }
            }
            Command::ClearArchive => {
                session.chat.clear_archive();
                println!("  Archive cleared.");
            }
            Command::Restore(id) => {
                if session.chat.restore_archive(&id) {
                    println!("  Restored {}.", id);
                } else {
                    println!("  No archived conversation {}.", id);
                }
            }
            Command::Attach(path) => match tray.add(&path) {
                Ok(file) => println!("  Attached {}", file.describe()),
                Err(e) => println!("  {}", e),
            },
            Command::Detach(index) => match tray.remove(index) {
                Some(file) => println!("  Removed {}", file.name),
                None => println!("  No attachment {}.", index),
            },
            Command::Settings => {
                let stored = config::get_settings(&session.db)?;
                for key in config::SETTING_KEYS {
                    match stored.get(*key) {
                        Some(value) => println!("  {} = {}", key, value),
                        None => println!("  {} (default)", key),
                    }
                }
            }
            Command::Set(key, value) => match config::set_setting(&session.db, &key, &value) {
                Ok(()) => {
                    session = Session::open(session.db.clone())?;
                    println!("  {} updated.", key);
                }
                Err(e) => println!("  {}", e),
            },
            Command::Unset(key) => match config::delete_setting(&session.db, &key) {
                Ok(()) => {
                    session = Session::open(session.db.clone())?;
                    println!("  {} reset to default.", key);
                }
                Err(e) => println!("  {}", e),
            },
            Command::Call => {
                if call.is_some() {
                    println!("  Already in a call.");
                    continue;
                }
                let mut active = VoiceCall::new(
                    session.chat.clone(),
                    capture.clone(),
                    speech.clone(),
                    session.config.call_greeting(),
                );
                active.start_call();
                settle(&mut active, &speech);
                call = Some(active);
            }
            Command::Hangup => match call.take() {
                Some(mut active) => {
                    let duration = format_duration(active.elapsed_secs());
                    active.end_call();
                    println!("  Call ended after {}.", duration);
                }
                None => println!("  Not in a call."),
            },
            toggle @ (Command::Mute | Command::PushToTalk) => match call.as_mut() {
                Some(active) => {
                    if toggle == Command::Mute {
                        active.toggle_mute();
                    } else {
                        active.toggle_push_to_talk();
                    }
                    settle(active, &speech);
                }
                None => println!("  Not in a call."),
            },
        }

        if replaces_conversation {
            updates = session.chat.subscribe();
            let len = updates.borrow_and_update().messages.len();
            transcript.sync(len);
        }
    }

    if let Some(mut active) = call.take() {
        active.end_call();
    }
    Ok(())
}
