//! Hand-written fakes for the stateful collaborators.

use crate::avatar::{
    AvatarConfig, AvatarProvider, AvatarSignal, SessionInfo, SignalListener, SpeakMode,
};
use crate::dialogue::{DialogueService, LanguageModel, Turn};
use crate::error::{Error, RecordingError, Result};
use crate::media::{AudioTrack, VideoSource};
use crate::orchestrator::SessionFactory;
use crate::persona::Persona;
use crate::recorder::{EncodeRequest, EncodingSession, MediaEncoder, Microphone, RecordingFormat};
use crate::transcription::{TranscriptEvent, TranscriptionSource, broadcast_stream};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Semaphore, broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

const OPEN_PERMITS: usize = 1_000_000;

/// Counts and controls the scripted language model shared by every dialogue
/// a [`FakeFactory`] creates.
#[derive(Clone)]
pub struct LlmProbe {
    calls: Arc<AtomicUsize>,
    fail: Arc<AtomicBool>,
    permits: Arc<Semaphore>,
    last_instructions: Arc<Mutex<String>>,
}

impl LlmProbe {
    fn new() -> Self {
        Self {
            calls: Arc::new(AtomicUsize::new(0)),
            fail: Arc::new(AtomicBool::new(false)),
            permits: Arc::new(Semaphore::new(OPEN_PERMITS)),
            last_instructions: Arc::new(Mutex::new(String::new())),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Blocks every request until [`LlmProbe::release`].
    pub fn hold(&self) {
        let available = self.permits.available_permits();
        if let Ok(permits) = self.permits.try_acquire_many(available as u32) {
            permits.forget();
        }
    }

    pub fn release(&self) {
        self.permits.add_permits(OPEN_PERMITS);
    }

    pub fn last_instructions(&self) -> String {
        self.last_instructions.lock().unwrap().clone()
    }
}

struct ScriptedModel {
    probe: LlmProbe,
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn complete(&self, instructions: &str, _turns: &[Turn]) -> Result<String> {
        self.probe.calls.fetch_add(1, Ordering::SeqCst);
        *self.probe.last_instructions.lock().unwrap() = instructions.to_string();
        let _permit = self.probe.permits.acquire().await;
        if self.probe.fail.load(Ordering::SeqCst) {
            return Err(Error::provider_status(500, "scripted failure"));
        }
        Ok("Sounds good. [nods]".to_string())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AvatarBehavior {
    pub fail_token: bool,
    pub fail_stop: bool,
    /// Emit `StartedSpeaking` whenever asked to speak.
    pub speaks_aloud: bool,
}

impl Default for AvatarBehavior {
    fn default() -> Self {
        Self {
            fail_token: false,
            fail_stop: false,
            speaks_aloud: true,
        }
    }
}

pub struct FakeAvatar {
    behavior: AvatarBehavior,
    listener: Mutex<Option<SignalListener>>,
    spoken: Mutex<Vec<String>>,
    stopped: AtomicBool,
}

impl FakeAvatar {
    pub fn new(behavior: AvatarBehavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            listener: Mutex::new(None),
            spoken: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn emit(&self, signal: AvatarSignal) {
        if let Some(listener) = self.listener.lock().unwrap().as_ref() {
            listener(signal);
        }
    }

    pub fn spoken(&self) -> Vec<String> {
        self.spoken.lock().unwrap().clone()
    }

    pub fn was_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AvatarProvider for FakeAvatar {
    async fn create_token(&self) -> anyhow::Result<String> {
        if self.behavior.fail_token {
            anyhow::bail!("token endpoint returned 401");
        }
        Ok("token".to_string())
    }

    fn subscribe(&self, listener: SignalListener) {
        *self.listener.lock().unwrap() = Some(listener);
    }

    async fn open_session(&self, _token: &str, _config: &AvatarConfig) -> anyhow::Result<SessionInfo> {
        self.emit(AvatarSignal::StreamReady);
        Ok(SessionInfo {
            session_id: "fake-session".to_string(),
        })
    }

    async fn speak(&self, _session_id: &str, text: &str, _mode: SpeakMode) -> anyhow::Result<()> {
        self.spoken.lock().unwrap().push(text.to_string());
        if self.behavior.speaks_aloud {
            self.emit(AvatarSignal::StartedSpeaking);
        }
        Ok(())
    }

    async fn interrupt(&self, _session_id: &str) -> anyhow::Result<()> {
        self.emit(AvatarSignal::StoppedSpeaking);
        Ok(())
    }

    async fn stop(&self, _session_id: &str) -> anyhow::Result<()> {
        self.stopped.store(true, Ordering::SeqCst);
        if self.behavior.fail_stop {
            anyhow::bail!("stop failed");
        }
        Ok(())
    }

    fn media_source(&self) -> Option<Arc<dyn VideoSource>> {
        None
    }
}

pub struct FakeFactory {
    pub llm: LlmProbe,
    behavior: AvatarBehavior,
    avatars: Mutex<Vec<Arc<FakeAvatar>>>,
    dialogues: Mutex<Vec<Arc<DialogueService>>>,
}

impl FakeFactory {
    pub fn new(behavior: AvatarBehavior) -> Arc<Self> {
        Arc::new(Self {
            llm: LlmProbe::new(),
            behavior,
            avatars: Mutex::new(Vec::new()),
            dialogues: Mutex::new(Vec::new()),
        })
    }

    pub fn current_avatar(&self) -> Option<Arc<FakeAvatar>> {
        self.avatars.lock().unwrap().last().cloned()
    }

    pub fn avatars_created(&self) -> usize {
        self.avatars.lock().unwrap().len()
    }

    pub fn last_dialogue(&self) -> Option<Arc<DialogueService>> {
        self.dialogues.lock().unwrap().last().cloned()
    }

    pub fn last_dialogue_turns(&self) -> usize {
        self.last_dialogue().map_or(0, |d| d.turn_count())
    }
}

impl SessionFactory for FakeFactory {
    fn dialogue(&self, persona: &Persona) -> Arc<DialogueService> {
        let dialogue = Arc::new(DialogueService::new(
            Box::new(ScriptedModel {
                probe: self.llm.clone(),
            }),
            persona,
        ));
        self.dialogues.lock().unwrap().push(dialogue.clone());
        dialogue
    }

    fn avatar_provider(&self) -> Arc<dyn AvatarProvider> {
        let avatar = FakeAvatar::new(self.behavior);
        self.avatars.lock().unwrap().push(avatar.clone());
        avatar
    }
}

pub struct FakeTranscriber {
    listening: AtomicBool,
    failed: AtomicBool,
    events: broadcast::Sender<TranscriptEvent>,
}

impl FakeTranscriber {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(16);
        Arc::new(Self {
            listening: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            events,
        })
    }

    /// Simulates the recognition backend dropping mid-session.
    pub fn fail(&self) {
        self.failed.store(true, Ordering::SeqCst);
    }
}

impl TranscriptionSource for FakeTranscriber {
    fn is_supported(&self) -> bool {
        true
    }

    fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    fn has_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    fn start(&self) -> Result<()> {
        self.listening.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.listening.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn transcripts(&self) -> BoxStream<'static, TranscriptEvent> {
        broadcast_stream(self.events.subscribe())
    }
}

pub struct FakeMicrophone {
    deny: bool,
    acquired: AtomicUsize,
    released: Arc<AtomicUsize>,
}

impl FakeMicrophone {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            deny: false,
            acquired: AtomicUsize::new(0),
            released: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn denied() -> Arc<Self> {
        Arc::new(Self {
            deny: true,
            acquired: AtomicUsize::new(0),
            released: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Microphone for FakeMicrophone {
    async fn acquire(&self) -> Result<AudioTrack> {
        if self.deny {
            return Err(Error::Device("microphone permission denied".to_string()));
        }
        self.acquired.fetch_add(1, Ordering::SeqCst);
        let (_tx, rx) = mpsc::channel(1);
        let released = self.released.clone();
        Ok(AudioTrack::new(
            48_000,
            1,
            rx,
            Some(Box::new(move || {
                released.fetch_add(1, Ordering::SeqCst);
            })),
        ))
    }
}

/// Turns every received frame into one chunk.
pub struct FakeEncoder {
    supported: Vec<String>,
    frames: Arc<AtomicUsize>,
    sessions: AtomicUsize,
}

impl FakeEncoder {
    pub fn supporting(mime_types: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            supported: mime_types.iter().map(|m| m.to_string()).collect(),
            frames: Arc::new(AtomicUsize::new(0)),
            sessions: AtomicUsize::new(0),
        })
    }

    pub fn frames_encoded(&self) -> usize {
        self.frames.load(Ordering::SeqCst)
    }

    pub fn sessions_started(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }
}

struct FakeSession {
    stop_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

#[async_trait]
impl EncodingSession for FakeSession {
    async fn finish(self: Box<Self>) -> Result<(), RecordingError> {
        let _ = self.stop_tx.send(());
        self.handle
            .await
            .map_err(|e| RecordingError::Encoder(e.to_string()))
    }
}

#[async_trait]
impl MediaEncoder for FakeEncoder {
    fn is_type_supported(&self, format: &RecordingFormat) -> bool {
        self.supported.contains(&format.mime_type)
    }

    async fn start(
        &self,
        request: EncodeRequest,
    ) -> Result<Box<dyn EncodingSession>, RecordingError> {
        self.sessions.fetch_add(1, Ordering::SeqCst);
        let EncodeRequest {
            mut video,
            audio,
            chunks,
            ..
        } = request;
        let frames = self.frames.clone();
        let (stop_tx, mut stop_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let _audio = audio;
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    frame = video.recv() => match frame {
                        Some(frame) => {
                            frames.fetch_add(1, Ordering::SeqCst);
                            let chunk = format!("{}x{};", frame.width(), frame.height());
                            let _ = chunks.send(Bytes::from(chunk));
                        }
                        None => break,
                    },
                }
            }
        });
        Ok(Box::new(FakeSession { stop_tx, handle }))
    }
}
