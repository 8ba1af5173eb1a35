//! Request and event payloads of the streaming avatar API.

use serde::{Deserialize, Serialize};

/// Every REST response wraps its payload in `data`.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenData {
    pub token: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Low,
    Medium,
    #[default]
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum VoiceEmotion {
    Excited,
    Serious,
    Friendly,
    Soothing,
    Broadcaster,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VoiceSetting {
    pub voice_id: String,
    pub rate: f32,
    pub emotion: VoiceEmotion,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewSessionRequest {
    pub avatar_name: String,
    pub quality: Quality,
    pub language: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<VoiceSetting>,
}

impl NewSessionRequest {
    pub fn new(avatar_name: impl Into<String>) -> Self {
        Self {
            avatar_name: avatar_name.into(),
            quality: Quality::default(),
            language: "en".to_string(),
            voice: None,
        }
    }

    pub fn with_quality(mut self, quality: Quality) -> Self {
        self.quality = quality;
        self
    }

    pub fn with_language(mut self, language: &str) -> Self {
        self.language = language.to_string();
        self
    }

    pub fn with_voice(mut self, voice: VoiceSetting) -> Self {
        self.voice = Some(voice);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SessionData {
    pub session_id: String,
    /// Media server URL for the WebRTC leg.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
    /// Websocket carrying the session's speaking events.
    #[serde(default)]
    pub realtime_endpoint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    /// Speak the text verbatim.
    Repeat,
    /// Treat the text as a prompt for the provider's own model.
    Talk,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskRequest {
    pub session_id: String,
    pub text: String,
    pub task_type: TaskType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionRequest {
    pub session_id: String,
}

/// Events pushed over the session websocket.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "avatar_start_talking")]
    AvatarStartTalking {
        #[serde(default)]
        task_id: Option<String>,
    },
    #[serde(rename = "avatar_stop_talking")]
    AvatarStopTalking {
        #[serde(default)]
        task_id: Option<String>,
    },
    #[serde(rename = "avatar_talking_message")]
    AvatarTalkingMessage {
        #[serde(default)]
        message: String,
    },
    /// Synthesized locally when the websocket closes.
    #[serde(rename = "close")]
    Close {
        #[serde(default)]
        reason: Option<String>,
    },
    #[serde(other)]
    Unknown,
}
