//! Session adapter for the remote streaming avatar.

use crate::error::{Error, Result};
use crate::media::{LiveVideo, VideoSource};
use crate::voice::VoiceEmotion;
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// The named lifecycle and speaking events a remote avatar session emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvatarSignal {
    StreamReady,
    StreamDisconnected,
    StartedSpeaking,
    StoppedSpeaking,
}

pub type SignalListener = Box<dyn Fn(AvatarSignal) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AvatarQuality {
    Low,
    Medium,
    #[default]
    High,
}

impl std::str::FromStr for AvatarQuality {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(AvatarQuality::Low),
            "medium" => Ok(AvatarQuality::Medium),
            "high" => Ok(AvatarQuality::High),
            other => Err(format!("unknown avatar quality '{other}'")),
        }
    }
}

/// Placeholder voice id meaning "use the avatar's own voice".
pub const DEFAULT_VOICE_ID: &str = "default_voice";

#[derive(Debug, Clone, PartialEq)]
pub struct VoiceConfig {
    pub voice_id: String,
    pub rate: f32,
    pub emotion: VoiceEmotion,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            voice_id: DEFAULT_VOICE_ID.to_string(),
            rate: 1.0,
            emotion: VoiceEmotion::Friendly,
        }
    }
}

impl VoiceConfig {
    pub fn is_default(&self) -> bool {
        self.voice_id.is_empty() || self.voice_id == DEFAULT_VOICE_ID
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AvatarConfig {
    pub avatar_id: String,
    pub voice: VoiceConfig,
    pub quality: AvatarQuality,
    pub language: String,
}

impl Default for AvatarConfig {
    fn default() -> Self {
        Self {
            avatar_id: "default_avatar".to_string(),
            voice: VoiceConfig::default(),
            quality: AvatarQuality::High,
            language: "en".to_string(),
        }
    }
}

/// How the avatar treats a speak payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeakMode {
    /// Vocalize the text literally.
    Repeat,
    /// Let the remote side generate its own answer to the text.
    Talk,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_id: String,
}

/// The remote avatar provider boundary.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AvatarProvider: Send + Sync {
    /// Exchanges the long-lived credential for a short-lived access token.
    async fn create_token(&self) -> anyhow::Result<String>;

    /// Installs the single signal listener. Must happen before `open_session`.
    fn subscribe(&self, listener: SignalListener);

    async fn open_session(&self, token: &str, config: &AvatarConfig)
    -> anyhow::Result<SessionInfo>;

    async fn speak(&self, session_id: &str, text: &str, mode: SpeakMode) -> anyhow::Result<()>;

    async fn interrupt(&self, session_id: &str) -> anyhow::Result<()>;

    async fn stop(&self, session_id: &str) -> anyhow::Result<()>;

    /// The provider's current video output, if it has one.
    fn media_source(&self) -> Option<Arc<dyn VideoSource>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
enum Phase {
    #[default]
    Uninitialized,
    Open(String),
    Closed,
}

#[derive(Debug, Default)]
struct AvatarState {
    phase: Phase,
    connected: bool,
    speaking: bool,
}

impl AvatarState {
    fn apply(&mut self, signal: AvatarSignal) {
        match signal {
            AvatarSignal::StreamReady => self.connected = true,
            AvatarSignal::StreamDisconnected => {
                self.connected = false;
                self.speaking = false;
            }
            AvatarSignal::StartedSpeaking => self.speaking = true,
            AvatarSignal::StoppedSpeaking => self.speaking = false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AvatarStatus {
    pub initialized: bool,
    pub connected: bool,
    pub speaking: bool,
    pub session_id: Option<String>,
}

/// One remote avatar session, from token acquisition to `close`.
pub struct AvatarService {
    provider: Arc<dyn AvatarProvider>,
    video: Arc<LiveVideo>,
    state: Arc<Mutex<AvatarState>>,
    on_signal: Arc<dyn Fn(AvatarSignal) + Send + Sync>,
}

fn lock(state: &Mutex<AvatarState>) -> MutexGuard<'_, AvatarState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl AvatarService {
    /// `on_signal` is called after each signal has been applied to the local state.
    pub fn new(
        provider: Arc<dyn AvatarProvider>,
        video: Arc<LiveVideo>,
        on_signal: impl Fn(AvatarSignal) + Send + Sync + 'static,
    ) -> Self {
        Self {
            provider,
            video,
            state: Arc::new(Mutex::new(AvatarState::default())),
            on_signal: Arc::new(on_signal),
        }
    }

    pub async fn initialize(&self, config: &AvatarConfig) -> Result<()> {
        if lock(&self.state).phase != Phase::Uninitialized {
            return Err(Error::InitializationFailure(
                "avatar session was already initialized".to_string(),
            ));
        }

        // Step 1: Exchange the API key for an access token.
        let token = self
            .provider
            .create_token()
            .await
            .map_err(|e| Error::InitializationFailure(format!("access token: {e:#}")))?;

        // Step 2: Subscribe before opening so the first ready event is not lost.
        let state = self.state.clone();
        let on_signal = self.on_signal.clone();
        self.provider.subscribe(Box::new(move |signal| {
            tracing::debug!("avatar signal: {:?}", signal);
            lock(&state).apply(signal);
            on_signal(signal);
        }));

        // Step 3: Open the remote session.
        let info = self
            .provider
            .open_session(&token, config)
            .await
            .map_err(|e| Error::InitializationFailure(format!("avatar session: {e:#}")))?;

        tracing::info!("avatar session {} opened", info.session_id);
        lock(&self.state).phase = Phase::Open(info.session_id);
        self.refresh_video();
        Ok(())
    }

    fn session_id(&self) -> Result<String> {
        match &lock(&self.state).phase {
            Phase::Open(id) => Ok(id.clone()),
            _ => Err(Error::NotInitialized("avatar session")),
        }
    }

    /// Speaks `text` literally, minus any `[stage directions]`.
    pub async fn speak(&self, text: &str) -> Result<()> {
        let session_id = self.session_id()?;
        let cleaned = strip_stage_directions(text);
        if cleaned.is_empty() {
            tracing::debug!("nothing left to vocalize after stripping stage directions");
            return Ok(());
        }
        self.provider
            .speak(&session_id, &cleaned, SpeakMode::Repeat)
            .await
            .map_err(|e| Error::provider(format!("avatar speak failed: {e:#}")))
    }

    /// Best-effort cancellation of in-progress speech.
    pub async fn interrupt(&self) {
        let Ok(session_id) = self.session_id() else {
            return;
        };
        if let Err(e) = self.provider.interrupt(&session_id).await {
            tracing::warn!("avatar interrupt failed: {:#}", e);
        }
    }

    /// Stops the remote session. Later operations fail with `NotInitialized`.
    pub async fn close(&self) -> Result<()> {
        let session_id = {
            let mut state = lock(&self.state);
            let previous = std::mem::replace(&mut state.phase, Phase::Closed);
            state.connected = false;
            state.speaking = false;
            match previous {
                Phase::Open(id) => id,
                _ => return Ok(()),
            }
        };
        self.video.set_source(None);
        self.provider
            .stop(&session_id)
            .await
            .map_err(|e| Error::provider(format!("avatar stop failed: {e:#}")))
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }

    pub fn is_speaking(&self) -> bool {
        lock(&self.state).speaking
    }

    pub fn status(&self) -> AvatarStatus {
        let state = lock(&self.state);
        let session_id = match &state.phase {
            Phase::Open(id) => Some(id.clone()),
            _ => None,
        };
        AvatarStatus {
            initialized: session_id.is_some(),
            connected: state.connected,
            speaking: state.speaking,
            session_id,
        }
    }

    fn refresh_video(&self) {
        let open = matches!(lock(&self.state).phase, Phase::Open(_));
        self.video
            .set_source(if open { self.provider.media_source() } else { None });
    }

    /// The avatar's video output. Always the same handle; only its source changes.
    pub fn video_handle(&self) -> Arc<LiveVideo> {
        self.refresh_video();
        self.video.clone()
    }
}

/// Removes `[bracketed]` non-verbal cues and collapses the remaining whitespace.
pub fn strip_stage_directions(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut depth = 0usize;
    for c in text.chars() {
        match c {
            '[' => depth += 1,
            ']' if depth > 0 => depth -= 1,
            _ if depth == 0 => out.push(c),
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::FrameSlot;
    use mockall::Sequence;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn strips_bracketed_cues() {
        assert_eq!(
            strip_stage_directions("[sighs] Well,  it has been [pause] a long week."),
            "Well, it has been a long week."
        );
        assert_eq!(strip_stage_directions("[laughs] [nods]"), "");
        assert_eq!(strip_stage_directions("a ] b"), "a ] b");
    }

    fn capture_listener(mock: &mut MockAvatarProvider) -> Arc<Mutex<Option<SignalListener>>> {
        let slot: Arc<Mutex<Option<SignalListener>>> = Arc::new(Mutex::new(None));
        let store = slot.clone();
        mock.expect_subscribe().times(1).returning(move |listener| {
            *store.lock().unwrap() = Some(listener);
        });
        slot
    }

    #[tokio::test]
    async fn subscribes_before_opening_the_session() {
        let mut mock = MockAvatarProvider::new();
        let mut seq = Sequence::new();
        mock.expect_create_token()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok("tok".to_string()));
        mock.expect_subscribe()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| ());
        mock.expect_open_session()
            .withf(|token, config| token == "tok" && config.language == "en")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| {
                Ok(SessionInfo {
                    session_id: "s1".to_string(),
                })
            });
        mock.expect_media_source().returning(|| None);

        let avatar = AvatarService::new(Arc::new(mock), LiveVideo::new(), |_| {});
        avatar.initialize(&AvatarConfig::default()).await.unwrap();
        assert_eq!(avatar.status().session_id.as_deref(), Some("s1"));
    }

    #[tokio::test]
    async fn token_failure_is_an_initialization_failure() {
        let mut mock = MockAvatarProvider::new();
        mock.expect_create_token()
            .returning(|| Err(anyhow::anyhow!("401 unauthorized")));
        mock.expect_subscribe().never();
        mock.expect_open_session().never();

        let avatar = AvatarService::new(Arc::new(mock), LiveVideo::new(), |_| {});
        let err = avatar.initialize(&AvatarConfig::default()).await.unwrap_err();
        assert!(matches!(err, Error::InitializationFailure(msg) if msg.contains("401")));
        assert!(matches!(
            avatar.speak("hi").await,
            Err(Error::NotInitialized(_))
        ));
    }

    #[tokio::test]
    async fn signals_update_state_before_the_callback_runs() {
        let mut mock = MockAvatarProvider::new();
        mock.expect_create_token().returning(|| Ok("tok".into()));
        let listener = capture_listener(&mut mock);
        mock.expect_open_session().returning(|_, _| {
            Ok(SessionInfo {
                session_id: "s1".into(),
            })
        });
        mock.expect_media_source().returning(|| None);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = seen.clone();
        let avatar = Arc::new(AvatarService::new(
            Arc::new(mock),
            LiveVideo::new(),
            move |signal| record.lock().unwrap().push(signal),
        ));
        avatar.initialize(&AvatarConfig::default()).await.unwrap();

        let emit = |signal: AvatarSignal| (listener.lock().unwrap().as_ref().unwrap())(signal);
        emit(AvatarSignal::StreamReady);
        emit(AvatarSignal::StartedSpeaking);
        assert!(avatar.is_connected());
        assert!(avatar.is_speaking());

        emit(AvatarSignal::StreamDisconnected);
        assert!(!avatar.is_connected());
        assert!(!avatar.is_speaking());
        assert_eq!(seen.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn speak_sends_cleaned_text_in_repeat_mode() {
        let mut mock = MockAvatarProvider::new();
        mock.expect_create_token().returning(|| Ok("tok".into()));
        mock.expect_subscribe().returning(|_| ());
        mock.expect_open_session().returning(|_, _| {
            Ok(SessionInfo {
                session_id: "s1".into(),
            })
        });
        mock.expect_media_source().returning(|| None);
        mock.expect_speak()
            .withf(|id, text, mode| id == "s1" && text == "I'm fine." && *mode == SpeakMode::Repeat)
            .times(1)
            .returning(|_, _, _| Ok(()));
        mock.expect_stop()
            .times(1)
            .returning(|_| Ok(()));

        let avatar = AvatarService::new(Arc::new(mock), LiveVideo::new(), |_| {});
        avatar.initialize(&AvatarConfig::default()).await.unwrap();
        avatar.speak("[smiles] I'm fine.").await.unwrap();
        // Nothing to say, no remote call.
        avatar.speak("[shrugs]").await.unwrap();

        avatar.close().await.unwrap();
        avatar.close().await.unwrap();
        assert!(matches!(
            avatar.speak("again").await,
            Err(Error::NotInitialized(_))
        ));
    }

    #[tokio::test]
    async fn interrupt_failures_are_swallowed() {
        let mut mock = MockAvatarProvider::new();
        mock.expect_create_token().returning(|| Ok("tok".into()));
        mock.expect_subscribe().returning(|_| ());
        mock.expect_open_session().returning(|_, _| {
            Ok(SessionInfo {
                session_id: "s1".into(),
            })
        });
        mock.expect_media_source().returning(|| None);
        mock.expect_interrupt()
            .times(1)
            .returning(|_| Err(anyhow::anyhow!("gone")));

        let avatar = AvatarService::new(Arc::new(mock), LiveVideo::new(), |_| {});
        avatar.initialize(&AvatarConfig::default()).await.unwrap();
        avatar.interrupt().await;
    }

    #[tokio::test]
    async fn video_handle_is_stable_across_polls() {
        let slot = FrameSlot::new();
        let polls = Arc::new(AtomicUsize::new(0));

        let mut mock = MockAvatarProvider::new();
        mock.expect_create_token().returning(|| Ok("tok".into()));
        mock.expect_subscribe().returning(|_| ());
        mock.expect_open_session().returning(|_, _| {
            Ok(SessionInfo {
                session_id: "s1".into(),
            })
        });
        let source = slot.clone();
        let counter = polls.clone();
        mock.expect_media_source().returning(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Some(source.clone() as Arc<dyn VideoSource>)
        });
        mock.expect_stop().returning(|_| Ok(()));

        let avatar = AvatarService::new(Arc::new(mock), LiveVideo::new(), |_| {});
        avatar.initialize(&AvatarConfig::default()).await.unwrap();

        let first = avatar.video_handle();
        let second = avatar.video_handle();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(first.has_source());
        assert!(polls.load(Ordering::SeqCst) >= 2);

        avatar.close().await.unwrap();
        assert!(!first.has_source());
    }
}
