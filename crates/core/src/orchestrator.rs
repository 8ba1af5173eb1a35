//! The session hub.
//!
//! A single [`SessionOrchestrator`] owns the session state machine and every
//! per-session collaborator. All inputs (user commands, transcripts, avatar
//! signals, timer ticks, finished exchanges) arrive on one channel and are
//! handled one at a time, so state transitions never interleave.

use crate::avatar::{AvatarConfig, AvatarProvider, AvatarService, AvatarSignal};
use crate::dialogue::DialogueService;
use crate::error::{Error, Result};
use crate::media::{FrameSlot, LiveVideo, VideoSource};
use crate::persona::Persona;
use crate::recorder::{Recorder, RecordingArtifact, RecordingFormat};
use crate::task::RepeatingTask;
use crate::transcription::{TranscriptEvent, TranscriptionSource};
use crate::voice::detect_voice_settings;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Starting,
    Active,
    Ending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub started_at: DateTime<Utc>,
    pub elapsed_seconds: u64,
}

/// Whether transcription may produce input right now.
pub fn gate_open(state: SessionState, avatar_connected: bool, avatar_speaking: bool) -> bool {
    state == SessionState::Active && avatar_connected && !avatar_speaking
}

/// Builds the per-session collaborators. Called once per started session.
pub trait SessionFactory: Send + Sync {
    fn dialogue(&self, persona: &Persona) -> Arc<DialogueService>;

    fn avatar_provider(&self) -> Arc<dyn AvatarProvider>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriptionState {
    Ready,
    Listening,
    Error,
    Unsupported,
}

/// A point-in-time view of the session, derived from the live collaborators.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStatus {
    pub state: SessionState,
    pub elapsed_seconds: u64,
    pub avatar: ConnectionState,
    pub dialogue: ConnectionState,
    pub transcription: TranscriptionState,
    pub avatar_speaking: bool,
    pub recording: bool,
    pub artifact_ready: bool,
    pub provider: Option<&'static str>,
    pub turns: usize,
    pub persona: String,
}

/// Notices for whoever presents the session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(SessionState),
    GateChanged(bool),
    UserSaid(String),
    PartnerSaid(String),
    Elapsed(u64),
    Error(String),
}

pub type Reply<T> = oneshot::Sender<Result<T>>;

pub enum Input {
    StartSession(Reply<()>),
    EndSession(Reply<()>),
    SetPersona(Persona, Reply<()>),
    StartRecording(Reply<RecordingFormat>),
    StopRecording(Reply<RecordingArtifact>),
    ExportRecording(PathBuf, Reply<PathBuf>),
    Status(oneshot::Sender<SessionStatus>),
    Shutdown(oneshot::Sender<()>),
    Transcript(TranscriptEvent),
    Avatar { epoch: u64, signal: AvatarSignal },
    Tick { epoch: u64 },
    ExchangeFinished {
        epoch: u64,
        outcome: Result<Option<String>>,
    },
}

#[derive(Debug, Default)]
struct Faults {
    avatar: bool,
    dialogue: bool,
    transcription: bool,
}

pub struct SessionOrchestrator {
    state: SessionState,
    session: Option<Session>,
    // Identifies the current session; inputs tagged with an older epoch are stale.
    epoch: u64,
    // The epoch of the session that is Active right now, 0 when none is.
    live_epoch: Arc<AtomicU64>,
    persona: Persona,
    avatar_config: AvatarConfig,
    factory: Arc<dyn SessionFactory>,
    transcriber: Arc<dyn TranscriptionSource>,
    recorder: Recorder,
    camera: Option<Arc<dyn VideoSource>>,
    avatar_view: Arc<LiveVideo>,
    dialogue: Option<Arc<DialogueService>>,
    avatar: Option<Arc<AvatarService>>,
    in_flight: bool,
    ticker: Option<RepeatingTask>,
    artifact: Option<RecordingArtifact>,
    faults: Faults,
    inbox_tx: mpsc::UnboundedSender<Input>,
    inbox: mpsc::UnboundedReceiver<Input>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionOrchestrator {
    pub fn new(
        factory: Arc<dyn SessionFactory>,
        transcriber: Arc<dyn TranscriptionSource>,
        recorder: Recorder,
        camera: Option<Arc<dyn VideoSource>>,
        persona: Persona,
        avatar_config: AvatarConfig,
    ) -> Self {
        let (inbox_tx, inbox) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(64);
        Self {
            state: SessionState::Idle,
            session: None,
            epoch: 0,
            live_epoch: Arc::new(AtomicU64::new(0)),
            persona,
            avatar_config,
            factory,
            transcriber,
            recorder,
            camera,
            avatar_view: LiveVideo::new(),
            dialogue: None,
            avatar: None,
            in_flight: false,
            ticker: None,
            artifact: None,
            faults: Faults::default(),
            inbox_tx,
            inbox,
            events,
        }
    }

    pub fn handle(&self) -> OrchestratorHandle {
        OrchestratorHandle {
            inbox: self.inbox_tx.clone(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// The avatar's video output. The same handle for the orchestrator's lifetime.
    pub fn avatar_view(&self) -> Arc<LiveVideo> {
        match &self.avatar {
            Some(avatar) => avatar.video_handle(),
            None => self.avatar_view.clone(),
        }
    }

    /// Handles inputs until shutdown.
    pub async fn run(mut self) {
        let pump = self.spawn_transcript_pump();
        tracing::info!("session orchestrator running");
        while let Some(input) = self.inbox.recv().await {
            if self.dispatch(input).await.is_break() {
                break;
            }
        }
        pump.abort();
        tracing::info!("session orchestrator stopped");
    }

    fn spawn_transcript_pump(&self) -> JoinHandle<()> {
        let mut transcripts = self.transcriber.transcripts();
        let inbox = self.inbox_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = transcripts.next().await {
                if inbox.send(Input::Transcript(event)).is_err() {
                    break;
                }
            }
        })
    }

    pub async fn dispatch(&mut self, input: Input) -> ControlFlow<()> {
        match input {
            Input::StartSession(reply) => {
                let _ = reply.send(self.start_session().await);
            }
            Input::EndSession(reply) => {
                let _ = reply.send(self.end_session().await);
            }
            Input::SetPersona(persona, reply) => {
                self.set_persona(persona);
                let _ = reply.send(Ok(()));
            }
            Input::StartRecording(reply) => {
                let _ = reply.send(self.start_recording().await);
            }
            Input::StopRecording(reply) => {
                let _ = reply.send(self.stop_recording().await);
            }
            Input::ExportRecording(dir, reply) => {
                let _ = reply.send(self.export_recording(&dir).await);
            }
            Input::Status(reply) => {
                let _ = reply.send(self.status());
            }
            Input::Shutdown(ack) => {
                self.shutdown().await;
                let _ = ack.send(());
                return ControlFlow::Break(());
            }
            Input::Transcript(event) => self.on_transcript(event),
            Input::Avatar { epoch, signal } => self.on_avatar_signal(epoch, signal),
            Input::Tick { epoch } => self.on_tick(epoch),
            Input::ExchangeFinished { epoch, outcome } => self.on_exchange_finished(epoch, outcome),
        }
        ControlFlow::Continue(())
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            tracing::info!("session state {:?} -> {:?}", self.state, state);
            self.state = state;
            self.emit(SessionEvent::StateChanged(state));
        }
        self.enforce_gate();
    }

    fn avatar_flags(&self) -> (bool, bool) {
        self.avatar
            .as_ref()
            .map(|a| (a.is_connected(), a.is_speaking()))
            .unwrap_or((false, false))
    }

    pub fn gate(&self) -> bool {
        let (connected, speaking) = self.avatar_flags();
        gate_open(self.state, connected, speaking)
    }

    /// Brings the transcription source in line with the gating policy.
    /// Safe to call any number of times.
    fn enforce_gate(&mut self) {
        if !self.transcriber.is_supported() || self.transcriber.has_failed() {
            return;
        }
        let open = self.gate();
        if open == self.transcriber.is_listening() {
            return;
        }
        let result = if open {
            self.transcriber.start()
        } else {
            self.transcriber.stop()
        };
        match result {
            Ok(()) => {
                self.faults.transcription = false;
                tracing::debug!("microphone gate {}", if open { "opened" } else { "closed" });
                self.emit(SessionEvent::GateChanged(open));
            }
            Err(e) => {
                self.faults.transcription = true;
                tracing::warn!("failed to switch transcription: {}", e);
                self.emit(SessionEvent::Error(e.to_string()));
            }
        }
    }

    /// Idle -> Starting -> Active. A no-op unless the orchestrator is idle.
    pub async fn start_session(&mut self) -> Result<()> {
        if self.state != SessionState::Idle {
            tracing::debug!("start ignored, session is {:?}", self.state);
            return Ok(());
        }
        self.epoch += 1;
        let epoch = self.epoch;
        self.faults = Faults::default();
        self.set_state(SessionState::Starting);

        // Step 1: Bring up a fresh avatar session.
        let inbox = self.inbox_tx.clone();
        let avatar = Arc::new(AvatarService::new(
            self.factory.avatar_provider(),
            self.avatar_view.clone(),
            move |signal| {
                let _ = inbox.send(Input::Avatar { epoch, signal });
            },
        ));
        if let Err(e) = avatar.initialize(&self.avatar_config).await {
            tracing::error!("session start failed: {}", e);
            self.faults.avatar = true;
            self.set_state(SessionState::Idle);
            return Err(e);
        }

        // Step 2: Fresh dialogue for this session.
        let dialogue = self.factory.dialogue(&self.persona);
        dialogue.reset_session(&self.persona);
        tracing::info!("dialogue bound to {}", dialogue.provider_name());

        // Step 3: Start the clock.
        self.session = Some(Session {
            started_at: Utc::now(),
            elapsed_seconds: 0,
        });
        let inbox = self.inbox_tx.clone();
        self.ticker = Some(RepeatingTask::spawn(
            Instant::now() + Duration::from_secs(1),
            Duration::from_secs(1),
            move || match inbox.send(Input::Tick { epoch }) {
                Ok(()) => ControlFlow::Continue(()),
                Err(_) => ControlFlow::Break(()),
            },
        ));

        self.avatar = Some(avatar);
        self.dialogue = Some(dialogue);
        self.in_flight = false;
        self.live_epoch.store(epoch, Ordering::SeqCst);
        self.set_state(SessionState::Active);
        Ok(())
    }

    /// Active -> Ending -> Idle. Every teardown step runs even if an earlier one fails.
    pub async fn end_session(&mut self) -> Result<()> {
        if self.state != SessionState::Active {
            tracing::debug!("end ignored, session is {:?}", self.state);
            return Ok(());
        }
        self.live_epoch.store(0, Ordering::SeqCst);
        self.in_flight = false;
        self.set_state(SessionState::Ending);
        if let Some(ticker) = self.ticker.take() {
            ticker.stop().await;
        }

        // Step 1: Stop recording, keeping what was captured.
        if self.recorder.is_recording() {
            match self.recorder.stop_recording().await {
                Ok(artifact) => self.artifact = Some(artifact),
                Err(e) => tracing::warn!("failed to stop recording during teardown: {}", e),
            }
        }

        // Step 2: Disconnect the avatar.
        if let Some(avatar) = self.avatar.take() {
            if avatar.is_speaking() {
                avatar.interrupt().await;
            }
            if let Err(e) = avatar.close().await {
                tracing::warn!("failed to close avatar session: {}", e);
            }
        }
        self.avatar_view.set_source(None);

        // Step 3: Forget the conversation.
        if let Some(dialogue) = self.dialogue.take() {
            dialogue.clear_history();
        }

        self.session = None;
        self.set_state(SessionState::Idle);
        Ok(())
    }

    /// Replaces the persona. An active session keeps running with a reset dialogue.
    pub fn set_persona(&mut self, persona: Persona) {
        tracing::info!("persona set to {}", persona.name);
        self.persona = persona;
        if self.state == SessionState::Active {
            if let Some(dialogue) = &self.dialogue {
                dialogue.reset_session(&self.persona);
            }
        }
    }

    pub fn persona(&self) -> &Persona {
        &self.persona
    }

    /// Records the camera beside the avatar. Without a camera the left half stays black.
    pub async fn start_recording(&mut self) -> Result<RecordingFormat> {
        let camera = match &self.camera {
            Some(camera) => camera.clone(),
            None => {
                tracing::info!("no camera, recording the avatar beside a blank panel");
                FrameSlot::new() as Arc<dyn VideoSource>
            }
        };
        let avatar: Arc<dyn VideoSource> = self.avatar_view();
        self.recorder.start_recording(camera, avatar).await
    }

    /// Stops the recording and retains the artifact, replacing any older one.
    pub async fn stop_recording(&mut self) -> Result<RecordingArtifact> {
        let artifact = self.recorder.stop_recording().await?;
        self.artifact = Some(artifact.clone());
        Ok(artifact)
    }

    pub fn artifact(&self) -> Option<&RecordingArtifact> {
        self.artifact.as_ref()
    }

    pub async fn export_recording(&self, dir: &Path) -> Result<PathBuf> {
        let artifact = self.artifact.as_ref().ok_or(Error::NoArtifact)?;
        let path = artifact.save_to(dir).await?;
        tracing::info!("recording saved to {}", path.display());
        Ok(path)
    }

    pub fn status(&self) -> SessionStatus {
        let avatar = match (&self.avatar, self.state) {
            (Some(a), _) if a.is_connected() => ConnectionState::Connected,
            (Some(_), _) | (None, SessionState::Starting) => ConnectionState::Connecting,
            (None, _) if self.faults.avatar => ConnectionState::Error,
            (None, _) => ConnectionState::Disconnected,
        };
        let dialogue = match &self.dialogue {
            Some(_) if self.faults.dialogue => ConnectionState::Error,
            Some(_) => ConnectionState::Connected,
            None => ConnectionState::Disconnected,
        };
        let transcription = if !self.transcriber.is_supported() {
            TranscriptionState::Unsupported
        } else if self.faults.transcription || self.transcriber.has_failed() {
            TranscriptionState::Error
        } else if self.transcriber.is_listening() {
            TranscriptionState::Listening
        } else {
            TranscriptionState::Ready
        };
        SessionStatus {
            state: self.state,
            elapsed_seconds: self.session.as_ref().map_or(0, |s| s.elapsed_seconds),
            avatar,
            dialogue,
            transcription,
            avatar_speaking: self.avatar_flags().1,
            recording: self.recorder.is_recording(),
            artifact_ready: self.artifact.is_some(),
            provider: self.dialogue.as_ref().map(|d| d.provider_name()),
            turns: self.dialogue.as_ref().map_or(0, |d| d.turn_count()),
            persona: self.persona.name.clone(),
        }
    }

    async fn shutdown(&mut self) {
        if let Err(e) = self.end_session().await {
            tracing::warn!("failed to end session on shutdown: {}", e);
        }
        if self.recorder.is_recording() {
            if let Err(e) = self.recorder.stop_recording().await {
                tracing::warn!("failed to stop recording on shutdown: {}", e);
            }
        }
        if self.transcriber.is_listening() {
            if let Err(e) = self.transcriber.stop() {
                tracing::warn!("failed to stop transcription on shutdown: {}", e);
            }
        }
    }

    fn on_transcript(&mut self, event: TranscriptEvent) {
        if !event.is_final {
            return;
        }
        let text = event.text.trim();
        if text.is_empty() {
            return;
        }
        if self.state != SessionState::Active {
            tracing::debug!("transcript dropped, no active session");
            return;
        }
        let (connected, speaking) = self.avatar_flags();
        if speaking {
            tracing::debug!("transcript dropped while the avatar is speaking: {:?}", text);
            return;
        }
        if !gate_open(self.state, connected, speaking) {
            tracing::debug!("transcript dropped, microphone gate is closed");
            return;
        }
        if self.in_flight {
            tracing::debug!("transcript dropped, a message is already in flight");
            return;
        }
        let (Some(dialogue), Some(avatar)) = (self.dialogue.clone(), self.avatar.clone()) else {
            return;
        };

        let text = text.to_string();
        self.in_flight = true;
        self.emit(SessionEvent::UserSaid(text.clone()));

        let epoch = self.epoch;
        let live_epoch = self.live_epoch.clone();
        let inbox = self.inbox_tx.clone();
        tokio::spawn(async move {
            let outcome = exchange(&dialogue, &avatar, &live_epoch, epoch, &text).await;
            let _ = inbox.send(Input::ExchangeFinished { epoch, outcome });
        });
    }

    fn on_avatar_signal(&mut self, epoch: u64, signal: AvatarSignal) {
        if epoch != self.epoch || self.avatar.is_none() {
            return;
        }
        if signal == AvatarSignal::StreamDisconnected {
            tracing::warn!("avatar stream disconnected");
        }
        self.enforce_gate();
    }

    fn on_tick(&mut self, epoch: u64) {
        if epoch != self.epoch || self.state != SessionState::Active {
            return;
        }
        if let Some(session) = self.session.as_mut() {
            session.elapsed_seconds += 1;
            let elapsed = session.elapsed_seconds;
            self.emit(SessionEvent::Elapsed(elapsed));
        }
    }

    fn on_exchange_finished(&mut self, epoch: u64, outcome: Result<Option<String>>) {
        if epoch != self.epoch {
            return;
        }
        self.in_flight = false;
        match outcome {
            Ok(Some(reply)) => {
                self.faults.dialogue = false;
                self.emit(SessionEvent::PartnerSaid(reply));
            }
            Ok(None) => {}
            Err(e) => {
                if matches!(e, Error::Provider { .. }) {
                    self.faults.dialogue = true;
                }
                tracing::error!("exchange failed: {}", e);
                self.emit(SessionEvent::Error(e.to_string()));
            }
        }
    }
}

/// One user utterance through the dialogue and out of the avatar.
/// Returns `None` if the session ended before the reply could be spoken.
async fn exchange(
    dialogue: &DialogueService,
    avatar: &AvatarService,
    live_epoch: &AtomicU64,
    epoch: u64,
    text: &str,
) -> Result<Option<String>> {
    let reply = dialogue.send_message(text).await?;
    let voice = detect_voice_settings(&reply);
    tracing::debug!(
        emotion = ?voice.emotion,
        rate = voice.rate,
        "partner reply ready"
    );
    if live_epoch.load(Ordering::SeqCst) != epoch {
        tracing::debug!("session ended before the reply was spoken");
        return Ok(None);
    }
    avatar.speak(&reply).await?;
    Ok(Some(reply))
}

/// Cloneable command surface for a running orchestrator.
#[derive(Clone)]
pub struct OrchestratorHandle {
    inbox: mpsc::UnboundedSender<Input>,
}

impl OrchestratorHandle {
    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Input) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.inbox
            .send(make(tx))
            .map_err(|_| Error::NotInitialized("session orchestrator"))?;
        rx.await
            .map_err(|_| Error::NotInitialized("session orchestrator"))?
    }

    pub async fn start_session(&self) -> Result<()> {
        self.request(Input::StartSession).await
    }

    pub async fn end_session(&self) -> Result<()> {
        self.request(Input::EndSession).await
    }

    pub async fn set_persona(&self, persona: Persona) -> Result<()> {
        self.request(|reply| Input::SetPersona(persona, reply)).await
    }

    pub async fn start_recording(&self) -> Result<RecordingFormat> {
        self.request(Input::StartRecording).await
    }

    pub async fn stop_recording(&self) -> Result<RecordingArtifact> {
        self.request(Input::StopRecording).await
    }

    pub async fn export_recording(&self, dir: PathBuf) -> Result<PathBuf> {
        self.request(|reply| Input::ExportRecording(dir, reply)).await
    }

    pub async fn status(&self) -> Result<SessionStatus> {
        let (tx, rx) = oneshot::channel();
        self.inbox
            .send(Input::Status(tx))
            .map_err(|_| Error::NotInitialized("session orchestrator"))?;
        rx.await
            .map_err(|_| Error::NotInitialized("session orchestrator"))
    }

    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.inbox.send(Input::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}
