//! Application Configuration Module
//!
//! Loads every setting the partner service needs from the environment once at
//! startup. The language-model provider is chosen here and carried as data.

use partner_core::avatar::{AvatarConfig, AvatarQuality, DEFAULT_VOICE_ID, VoiceConfig};
use partner_core::llm::{
    DEFAULT_CLAUDE_MODEL, DEFAULT_GROQ_MODEL, ProviderCredential, ProviderSelection,
};
use secrecy::SecretString;
use std::env;
use std::path::PathBuf;
use tracing::Level;

/// Where exported recordings go when no directory is given.
pub const DEFAULT_RECORDINGS_DIR: &str = "recordings";

#[derive(Debug)]
pub struct Config {
    pub heygen_api_key: SecretString,
    pub provider: ProviderSelection,
    /// Realtime transcription credential. Without it only typed input works.
    pub openai_api_key: Option<SecretString>,
    pub avatar: AvatarConfig,
    pub camera_device: Option<String>,
    pub recordings_dir: PathBuf,
    pub persona_file: Option<PathBuf>,
    /// TrueType font for the recording labels. System fonts are tried otherwise.
    pub label_font: Option<PathBuf>,
    pub log_level: Level,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid log level provided for RUST_LOG: {0}")]
    InvalidLogLevel(String),
    #[error("Invalid value for {var}: {reason}")]
    InvalidValue { var: &'static str, reason: String },
}

impl Config {
    /// Loads configuration from the process environment, after `.env`.
    ///
    // *   `HEYGEN_API_KEY`: Streaming avatar credential. Required.
    // *   `GROQ_API_KEY` / `ANTHROPIC_API_KEY` (or `CLAUDE_API_KEY`): At least one is required. Groq wins when both are set.
    // *   `GROQ_MODEL`, `CLAUDE_MODEL`: (Optional) Model overrides.
    // *   `OPENAI_API_KEY`: (Optional) Enables microphone transcription.
    // *   `HEYGEN_AVATAR_ID`, `HEYGEN_VOICE_ID`, `AVATAR_QUALITY`: (Optional) Avatar identity, voice and quality.
    // *   `CAMERA_DEVICE`: (Optional) Camera passed to ffmpeg.
    // *   `RECORDINGS_DIR`: (Optional) Export directory. Defaults to "recordings".
    // *   `PERSONA_FILE`: (Optional) JSON persona to start with.
    // *   `RECORDING_FONT`: (Optional) TrueType font for the recording labels.
    // *   `RUST_LOG`: (Optional) The logging level. Defaults to "INFO".
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let heygen_api_key = var("HEYGEN_API_KEY")
            .map(SecretString::from)
            .ok_or_else(|| ConfigError::MissingVar("HEYGEN_API_KEY".to_string()))?;

        let groq = var("GROQ_API_KEY").map(|key| {
            ProviderCredential::new(
                &key,
                var("GROQ_MODEL").unwrap_or_else(|| DEFAULT_GROQ_MODEL.to_string()),
            )
        });
        let claude = var("ANTHROPIC_API_KEY")
            .or_else(|| var("CLAUDE_API_KEY"))
            .map(|key| {
                ProviderCredential::new(
                    &key,
                    var("CLAUDE_MODEL").unwrap_or_else(|| DEFAULT_CLAUDE_MODEL.to_string()),
                )
            });
        let provider = ProviderSelection::from_credentials(groq, claude).ok_or_else(|| {
            ConfigError::MissingVar(
                "GROQ_API_KEY or ANTHROPIC_API_KEY must be set".to_string(),
            )
        })?;

        let quality = match var("AVATAR_QUALITY") {
            Some(q) => q
                .parse::<AvatarQuality>()
                .map_err(|reason| ConfigError::InvalidValue {
                    var: "AVATAR_QUALITY",
                    reason,
                })?,
            None => AvatarQuality::default(),
        };
        let defaults = AvatarConfig::default();
        let avatar = AvatarConfig {
            avatar_id: var("HEYGEN_AVATAR_ID").unwrap_or(defaults.avatar_id),
            voice: VoiceConfig {
                voice_id: var("HEYGEN_VOICE_ID").unwrap_or_else(|| DEFAULT_VOICE_ID.to_string()),
                ..defaults.voice
            },
            quality,
            language: defaults.language,
        };

        let log_level_str = var("RUST_LOG").unwrap_or_else(|| "INFO".to_string());
        let log_level = log_level_str
            .parse::<Level>()
            .map_err(|_| ConfigError::InvalidLogLevel(log_level_str))?;

        Ok(Self {
            heygen_api_key,
            provider,
            openai_api_key: var("OPENAI_API_KEY").map(SecretString::from),
            avatar,
            camera_device: var("CAMERA_DEVICE"),
            recordings_dir: var("RECORDINGS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_RECORDINGS_DIR)),
            persona_file: var("PERSONA_FILE").map(PathBuf::from),
            label_font: var("RECORDING_FONT").map(PathBuf::from),
            log_level,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use partner_core::llm::ProviderKind;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn heygen_key_is_required() {
        let err = load(&[("GROQ_API_KEY", "g")]).unwrap_err();
        assert!(matches!(err, ConfigError::MissingVar(v) if v == "HEYGEN_API_KEY"));
    }

    #[test]
    fn some_llm_key_is_required() {
        let err = load(&[("HEYGEN_API_KEY", "h")]).unwrap_err();
        assert!(matches!(err, ConfigError::MissingVar(_)));
    }

    #[test]
    fn groq_is_preferred_and_defaults_apply() {
        let config = load(&[
            ("HEYGEN_API_KEY", "h"),
            ("GROQ_API_KEY", "g"),
            ("ANTHROPIC_API_KEY", "c"),
        ])
        .unwrap();
        assert_eq!(config.provider.kind(), ProviderKind::Groq);
        assert_eq!(config.provider.model(), DEFAULT_GROQ_MODEL);
        assert_eq!(config.avatar, AvatarConfig::default());
        assert_eq!(config.recordings_dir, PathBuf::from("recordings"));
        assert_eq!(config.log_level, Level::INFO);
        assert!(config.openai_api_key.is_none());
        assert!(config.label_font.is_none());
    }

    #[test]
    fn claude_alias_and_overrides() {
        let config = load(&[
            ("HEYGEN_API_KEY", "h"),
            ("CLAUDE_API_KEY", "c"),
            ("CLAUDE_MODEL", "claude-test"),
            ("GROQ_API_KEY", "  "),
            ("HEYGEN_AVATAR_ID", "Anna_public"),
            ("HEYGEN_VOICE_ID", "v-42"),
            ("AVATAR_QUALITY", "Medium"),
            ("RUST_LOG", "debug"),
            ("RECORDING_FONT", "/fonts/Inter.ttf"),
        ])
        .unwrap();
        assert_eq!(config.provider.kind(), ProviderKind::Claude);
        assert_eq!(config.provider.model(), "claude-test");
        assert_eq!(config.avatar.avatar_id, "Anna_public");
        assert_eq!(config.avatar.voice.voice_id, "v-42");
        assert!(!config.avatar.voice.is_default());
        assert_eq!(config.avatar.quality, AvatarQuality::Medium);
        assert_eq!(config.log_level, Level::DEBUG);
        assert_eq!(config.label_font, Some(PathBuf::from("/fonts/Inter.ttf")));
    }

    #[test]
    fn bad_quality_and_log_level_are_rejected() {
        let base = [("HEYGEN_API_KEY", "h"), ("GROQ_API_KEY", "g")];

        let mut vars = base.to_vec();
        vars.push(("AVATAR_QUALITY", "ultra"));
        assert!(matches!(
            load(&vars).unwrap_err(),
            ConfigError::InvalidValue { var: "AVATAR_QUALITY", .. }
        ));

        let mut vars = base.to_vec();
        vars.push(("RUST_LOG", "chatty"));
        assert!(matches!(
            load(&vars).unwrap_err(),
            ConfigError::InvalidLogLevel(_)
        ));
    }
}
