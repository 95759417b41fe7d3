//! Simulated real-time voice call on top of the chat orchestrator.
//!
//! The call loops `idle -> listening -> processing -> speaking -> idle`.
//! Speech capture and playback are external collaborators: capture results
//! arrive through [`VoiceCall::begin_turn`] and playback completion through
//! [`VoiceCall::speech_finished`]. The backend round trip runs outside the
//! call as a [`VoiceTurn`], so the call stays controllable while it waits.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use super::orchestrator::ChatOrchestrator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Listening,
    Processing,
    Speaking,
}

impl CallState {
    pub fn label(&self) -> &'static str {
        match self {
            CallState::Idle => "Ready",
            CallState::Listening => "Listening...",
            CallState::Processing => "Processing...",
            CallState::Speaking => "Speaking...",
        }
    }
}

/// Speech-to-text capture. Results are fed back via `handle_transcript`.
pub trait SpeechCapture: Send + Sync {
    fn start(&self);
    fn stop(&self);
}

/// Text-to-speech playback. Must report completion of each utterance via
/// `speech_finished(utterance.id)`.
pub trait SpeechOutput: Send + Sync {
    fn speak(&self, utterance: Utterance);
    /// Stops every utterance currently playing or queued.
    fn cancel_all(&self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utterance {
    pub id: u64,
    pub text: String,
}

/// A transcript on its way to the backend.
pub struct VoiceTurn {
    pub id: u64,
    pub transcript: String,
    chat: Arc<ChatOrchestrator>,
}

impl VoiceTurn {
    pub async fn reply(self) -> VoiceReply {
        let text = self.chat.send_voice_message(&self.transcript).await;
        VoiceReply { turn: self.id, text }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceReply {
    pub turn: u64,
    pub text: String,
}

pub struct VoiceCall {
    chat: Arc<ChatOrchestrator>,
    capture: Arc<dyn SpeechCapture>,
    speech: Arc<dyn SpeechOutput>,
    greeting: String,
    state: CallState,
    active: bool,
    muted: bool,
    push_to_talk: bool,
    capturing: bool,
    next_utterance: u64,
    speaking: Option<u64>,
    next_turn: u64,
    pending_turn: Option<u64>,
    transcript: String,
    ticker: Option<JoinHandle<()>>,
    elapsed: Arc<watch::Sender<u64>>,
}

impl VoiceCall {
    pub fn new(
        chat: Arc<ChatOrchestrator>,
        capture: Arc<dyn SpeechCapture>,
        speech: Arc<dyn SpeechOutput>,
        greeting: impl Into<String>,
    ) -> Self {
        let (elapsed, _) = watch::channel(0);
        Self {
            chat,
            capture,
            speech,
            greeting: greeting.into(),
            state: CallState::Idle,
            active: false,
            muted: false,
            push_to_talk: false,
            capturing: false,
            next_utterance: 0,
            speaking: None,
            next_turn: 0,
            pending_turn: None,
            transcript: String::new(),
            ticker: None,
            elapsed: Arc::new(elapsed),
        }
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn is_push_to_talk(&self) -> bool {
        self.push_to_talk
    }

    pub fn is_capturing(&self) -> bool {
        self.capturing
    }

    /// Last recognised utterance, cleared once the reply has been spoken.
    pub fn transcript(&self) -> &str {
        &self.transcript
    }

    pub fn elapsed_secs(&self) -> u64 {
        *self.elapsed.borrow()
    }

    pub fn subscribe_duration(&self) -> watch::Receiver<u64> {
        self.elapsed.subscribe()
    }

    /// Starts the duration ticker and speaks the greeting.
    pub fn start_call(&mut self) {
        if self.active {
            return;
        }
        info!("Voice call started");
        self.active = true;
        self.elapsed.send_replace(0);

        let elapsed = self.elapsed.clone();
        let started = Instant::now();
        self.ticker = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            interval.tick().await;
            loop {
                interval.tick().await;
                elapsed.send_replace(started.elapsed().as_secs());
            }
        }));

        let greeting = self.greeting.clone();
        self.say(greeting);
    }

    /// Tears everything down and returns to a reset idle state.
    pub fn end_call(&mut self) {
        if !self.active {
            return;
        }
        info!("Voice call ended after {}s", self.elapsed_secs());
        self.speech.cancel_all();
        self.stop_listening();
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
        self.elapsed.send_replace(0);
        self.active = false;
        self.muted = false;
        self.push_to_talk = false;
        self.speaking = None;
        self.pending_turn = None;
        self.transcript.clear();
        self.state = CallState::Idle;
    }

    /// Playback of utterance `id` completed. Stale ids are ignored.
    pub fn speech_finished(&mut self, id: u64) {
        if !self.active || self.speaking != Some(id) {
            debug!("Ignoring completion of utterance {}", id);
            return;
        }
        self.speaking = None;
        self.transcript.clear();
        self.state = CallState::Idle;
        if !self.push_to_talk {
            self.start_listening();
        }
    }

    /// A finished capture. Stops capture and moves to processing, returning
    /// the turn to run against the backend. Blank results keep the call where
    /// it is; results that arrive while processing or speaking are dropped.
    pub fn begin_turn(&mut self, text: &str) -> Option<VoiceTurn> {
        if !self.active {
            return None;
        }
        let accepting = match self.state {
            CallState::Listening => true,
            CallState::Idle => self.push_to_talk && !self.muted,
            CallState::Processing | CallState::Speaking => false,
        };
        if !accepting || text.trim().is_empty() {
            return None;
        }

        self.stop_listening();
        self.speech.cancel_all();
        self.transcript = text.trim().to_string();
        self.state = CallState::Processing;
        self.next_turn += 1;
        self.pending_turn = Some(self.next_turn);
        debug!("Voice transcript: {}", self.transcript);

        Some(VoiceTurn {
            id: self.next_turn,
            transcript: self.transcript.clone(),
            chat: self.chat.clone(),
        })
    }

    /// Speaks the reply to the pending turn. Replies for a turn the call no
    /// longer waits on are dropped; returns whether it was spoken.
    pub fn reply_ready(&mut self, reply: VoiceReply) -> bool {
        if !self.active || self.pending_turn != Some(reply.turn) {
            debug!("Dropping reply for voice turn {}", reply.turn);
            return false;
        }
        self.pending_turn = None;
        self.say(reply.text);
        true
    }

    /// Runs one turn to completion while holding the call.
    pub async fn handle_transcript(&mut self, text: &str) {
        if let Some(turn) = self.begin_turn(text) {
            let reply = turn.reply().await;
            self.reply_ready(reply);
        }
    }

    pub fn toggle_mute(&mut self) {
        self.muted = !self.muted;
        if self.muted {
            self.stop_listening();
        } else if self.state == CallState::Idle && !self.push_to_talk {
            self.start_listening();
        }
    }

    pub fn toggle_push_to_talk(&mut self) {
        self.push_to_talk = !self.push_to_talk;
        if self.push_to_talk {
            self.stop_listening();
        } else if self.state == CallState::Idle && !self.muted {
            self.start_listening();
        }
    }

    pub fn push_to_talk_pressed(&mut self) {
        if self.push_to_talk && !self.muted && self.state == CallState::Idle {
            self.start_listening();
        }
    }

    pub fn push_to_talk_released(&mut self) {
        if self.push_to_talk && self.capturing {
            self.stop_listening();
        }
    }

    fn say(&mut self, text: String) {
        self.speech.cancel_all();
        self.next_utterance += 1;
        let id = self.next_utterance;
        self.speaking = Some(id);
        self.state = CallState::Speaking;
        self.speech.speak(Utterance { id, text });
    }

    fn start_listening(&mut self) {
        if !self.active || self.muted || self.capturing {
            return;
        }
        self.capture.start();
        self.capturing = true;
        self.state = CallState::Listening;
    }

    fn stop_listening(&mut self) {
        if self.capturing {
            self.capture.stop();
            self.capturing = false;
        }
        if self.state == CallState::Listening {
            self.state = CallState::Idle;
        }
    }
}

impl Drop for VoiceCall {
    fn drop(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
    }
}

/// `MM:SS` for a call duration in seconds.
pub fn format_duration(secs: u64) -> String {
    format!("{:02}:{:02}", secs / 60, secs % 60)
}
