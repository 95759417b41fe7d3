pub mod orchestrator;
pub mod voice;

pub use orchestrator::{ChatOrchestrator, ChatSnapshot};
pub use voice::{
    format_duration, CallState, SpeechCapture, SpeechOutput, Utterance, VoiceCall, VoiceReply,
    VoiceTurn,
};
