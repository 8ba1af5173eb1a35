//! Events of a transcription-only realtime session.

use serde::{Deserialize, Serialize};

/// Base64 encoded little-endian PCM16 mono audio at 24 kHz.
pub type Base64EncodedAudioBytes = String;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InputAudioTranscription {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnDetection {
    ServerVad {
        threshold: f32,
        prefix_padding_ms: u32,
        silence_duration_ms: u32,
    },
}

impl Default for TurnDetection {
    fn default() -> Self {
        TurnDetection::ServerVad {
            threshold: 0.5,
            prefix_padding_ms: 300,
            silence_duration_ms: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptionSession {
    pub input_audio_format: String,
    pub input_audio_transcription: InputAudioTranscription,
    pub turn_detection: TurnDetection,
}

impl TranscriptionSession {
    pub fn new(model: &str) -> Self {
        Self {
            input_audio_format: "pcm16".to_string(),
            input_audio_transcription: InputAudioTranscription {
                model: model.to_string(),
                language: None,
            },
            turn_detection: TurnDetection::default(),
        }
    }

    pub fn with_language(mut self, language: &str) -> Self {
        self.input_audio_transcription.language = Some(language.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "transcription_session.update")]
    SessionUpdate { session: TranscriptionSession },
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend { audio: Base64EncodedAudioBytes },
    #[serde(rename = "input_audio_buffer.clear")]
    InputAudioBufferClear,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ApiError {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "transcription_session.created")]
    SessionCreated,
    #[serde(rename = "transcription_session.updated")]
    SessionUpdated,
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted,
    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped,
    #[serde(rename = "conversation.item.input_audio_transcription.delta")]
    TranscriptionDelta {
        #[serde(default)]
        item_id: String,
        delta: String,
    },
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    TranscriptionCompleted {
        #[serde(default)]
        item_id: String,
        transcript: String,
    },
    #[serde(rename = "error")]
    Error { error: ApiError },
    /// Synthesized locally when the websocket closes.
    #[serde(rename = "close")]
    Close {
        #[serde(default)]
        reason: Option<String>,
    },
    #[serde(other)]
    Unknown,
}
