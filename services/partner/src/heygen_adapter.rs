use crate::avatar_room::{self, MediaRoom, RoomSignal};
use anyhow::{Context, Result};
use async_trait::async_trait;
use heygen_streaming::types::{
    NewSessionRequest, Quality, ServerEvent, SessionData, TaskRequest, TaskType,
    VoiceEmotion as HeyGenEmotion, VoiceSetting,
};
use heygen_streaming::{ServerRx, StreamingApi};
use partner_core::avatar::{
    AvatarConfig, AvatarProvider, AvatarQuality, AvatarSignal, SessionInfo, SignalListener,
    SpeakMode,
};
use partner_core::media::{FrameSlot, VideoSource};
use partner_core::voice::VoiceEmotion;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

type SharedListener = Arc<dyn Fn(AvatarSignal) + Send + Sync>;

/// How long to wait for the avatar's first video frame before reporting the
/// stream ready anyway.
const VIDEO_START_TIMEOUT: Duration = Duration::from_secs(10);

/// Implements [`AvatarProvider`] over the streaming avatar REST and event API,
/// with the avatar's video arriving through a [`MediaRoom`].
/// Generic over [`StreamingApi`] so the wire client can be mocked in tests.
pub struct HeyGenAdapter<C: StreamingApi> {
    client: C,
    room: Arc<dyn MediaRoom>,
    video: Arc<FrameSlot>,
    listener: Mutex<Option<SharedListener>>,
    token: Mutex<Option<String>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    room_pump: Mutex<Option<JoinHandle<()>>>,
}

impl HeyGenAdapter<heygen_streaming::Client> {
    pub fn from_api_key(api_key: &secrecy::SecretString) -> Self {
        use secrecy::ExposeSecret;
        let config = heygen_streaming::Config::builder()
            .with_api_key(api_key.expose_secret())
            .build();
        Self::new(
            heygen_streaming::Client::new(config),
            avatar_room::default_room(),
        )
    }
}

fn abort(task: &Mutex<Option<JoinHandle<()>>>) {
    if let Some(task) = task.lock().unwrap_or_else(PoisonError::into_inner).take() {
        task.abort();
    }
}

impl<C: StreamingApi> HeyGenAdapter<C> {
    pub fn new(client: C, room: Arc<dyn MediaRoom>) -> Self {
        Self {
            client,
            room,
            video: FrameSlot::new(),
            listener: Mutex::new(None),
            token: Mutex::new(None),
            pump: Mutex::new(None),
            room_pump: Mutex::new(None),
        }
    }

    fn listener(&self) -> Option<SharedListener> {
        self.listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn emit(&self, signal: AvatarSignal) {
        if let Some(listener) = self.listener() {
            listener(signal);
        }
    }

    fn token(&self) -> Result<String> {
        self.token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .context("avatar session has no access token")
    }

    fn clear_token(&self) {
        self.token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Joins the session's media room. The stream is reported ready once video
    /// flows, or straight away when there is no room to join.
    async fn join_media(&self, data: &SessionData) {
        let (Some(url), Some(room_token)) = (data.url.as_deref(), data.access_token.as_deref())
        else {
            tracing::warn!("avatar session has no media room, continuing without video");
            self.emit(AvatarSignal::StreamReady);
            return;
        };
        let (signals_tx, signals) = mpsc::unbounded_channel();
        match self
            .room
            .join(url, room_token, self.video.clone(), signals_tx)
            .await
        {
            Ok(()) => {
                abort(&self.room_pump);
                if let Some(listener) = self.listener() {
                    *self.room_pump.lock().unwrap_or_else(PoisonError::into_inner) =
                        Some(spawn_room_pump(signals, listener, VIDEO_START_TIMEOUT));
                }
            }
            Err(e) => {
                tracing::warn!("avatar video unavailable: {:#}", e);
                self.emit(AvatarSignal::StreamReady);
            }
        }
    }
}

fn quality(quality: AvatarQuality) -> Quality {
    match quality {
        AvatarQuality::Low => Quality::Low,
        AvatarQuality::Medium => Quality::Medium,
        AvatarQuality::High => Quality::High,
    }
}

fn emotion(emotion: VoiceEmotion) -> HeyGenEmotion {
    match emotion {
        VoiceEmotion::Friendly => HeyGenEmotion::Friendly,
        VoiceEmotion::Serious => HeyGenEmotion::Serious,
        VoiceEmotion::Cheerful => HeyGenEmotion::Excited,
        VoiceEmotion::Calm | VoiceEmotion::Soothing => HeyGenEmotion::Soothing,
        VoiceEmotion::Broadcast => HeyGenEmotion::Broadcaster,
    }
}

/// Builds the session request. The voice block is only sent for a real voice id.
pub fn session_request(config: &AvatarConfig) -> NewSessionRequest {
    let request = NewSessionRequest::new(&config.avatar_id)
        .with_quality(quality(config.quality))
        .with_language(&config.language);
    if config.voice.is_default() {
        request
    } else {
        request.with_voice(VoiceSetting {
            voice_id: config.voice.voice_id.clone(),
            rate: config.voice.rate,
            emotion: emotion(config.voice.emotion),
        })
    }
}

/// Turns media room signals into stream signals. The first ready is sent
/// when video starts or after `ready_timeout`, whichever comes first.
fn spawn_room_pump(
    mut signals: mpsc::UnboundedReceiver<RoomSignal>,
    listener: SharedListener,
    ready_timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        match tokio::time::timeout(ready_timeout, signals.recv()).await {
            Ok(Some(RoomSignal::VideoStarted)) => tracing::info!("avatar video started"),
            Ok(Some(RoomSignal::Disconnected) | None) => {
                tracing::warn!("avatar media room closed before any video arrived");
            }
            Err(_) => tracing::warn!(
                "no avatar video after {:?}, continuing without it",
                ready_timeout
            ),
        }
        listener(AvatarSignal::StreamReady);

        while let Some(signal) = signals.recv().await {
            match signal {
                RoomSignal::VideoStarted => listener(AvatarSignal::StreamReady),
                RoomSignal::Disconnected => listener(AvatarSignal::StreamDisconnected),
            }
        }
    })
}

fn spawn_event_pump(mut events: ServerRx, listener: SharedListener) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(n)) => {
                    tracing::warn!("avatar event pump lagged, {} events dropped", n);
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            match event {
                ServerEvent::AvatarStartTalking { .. } => listener(AvatarSignal::StartedSpeaking),
                ServerEvent::AvatarStopTalking { .. } => listener(AvatarSignal::StoppedSpeaking),
                ServerEvent::AvatarTalkingMessage { message } => {
                    tracing::trace!("avatar talking: {}", message);
                }
                ServerEvent::Close { reason } => {
                    tracing::info!("avatar stream disconnected: {:?}", reason);
                    listener(AvatarSignal::StreamDisconnected);
                    break;
                }
                ServerEvent::Unknown => {}
            }
        }
    })
}

#[async_trait]
impl<C: StreamingApi> AvatarProvider for HeyGenAdapter<C> {
    async fn create_token(&self) -> Result<String> {
        self.client
            .create_token()
            .await
            .context("failed to get access token")
    }

    fn subscribe(&self, listener: SignalListener) {
        *self.listener.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::from(listener));
    }

    async fn open_session(&self, token: &str, config: &AvatarConfig) -> Result<SessionInfo> {
        *self.token.lock().unwrap_or_else(PoisonError::into_inner) = Some(token.to_string());

        let data = match self.client.new_session(token, session_request(config)).await {
            Ok(data) => data,
            Err(e) => {
                self.clear_token();
                return Err(e).context("failed to create avatar session");
            }
        };
        if let Err(e) = self.client.start_session(token, &data.session_id).await {
            // The session exists remotely even though it never started.
            if let Err(stop_err) = self.client.stop_session(token, &data.session_id).await {
                tracing::warn!(
                    "failed to release unstarted avatar session {}: {:#}",
                    data.session_id,
                    stop_err
                );
            }
            self.clear_token();
            return Err(e).context("failed to start avatar session");
        }
        tracing::info!("avatar session {} started", data.session_id);

        match (data.realtime_endpoint.as_deref(), self.listener()) {
            (Some(endpoint), Some(listener)) => match self.client.server_events(endpoint).await {
                Ok(events) => {
                    abort(&self.pump);
                    *self.pump.lock().unwrap_or_else(PoisonError::into_inner) =
                        Some(spawn_event_pump(events, listener));
                }
                Err(e) => tracing::warn!("avatar events unavailable: {:#}", e),
            },
            (None, _) => tracing::warn!("avatar session has no event endpoint"),
            (Some(_), None) => tracing::warn!("avatar session opened without a listener"),
        }

        self.join_media(&data).await;
        Ok(SessionInfo {
            session_id: data.session_id,
        })
    }

    async fn speak(&self, session_id: &str, text: &str, mode: SpeakMode) -> Result<()> {
        let token = self.token()?;
        let task_type = match mode {
            SpeakMode::Repeat => TaskType::Repeat,
            SpeakMode::Talk => TaskType::Talk,
        };
        self.client
            .send_task(
                &token,
                TaskRequest {
                    session_id: session_id.to_string(),
                    text: text.to_string(),
                    task_type,
                },
            )
            .await
            .context("avatar speak failed")
    }

    async fn interrupt(&self, session_id: &str) -> Result<()> {
        let token = self.token()?;
        self.client
            .interrupt(&token, session_id)
            .await
            .context("avatar interrupt failed")
    }

    async fn stop(&self, session_id: &str) -> Result<()> {
        abort(&self.pump);
        abort(&self.room_pump);
        self.room.leave().await;
        self.video.clear();
        let token = self.token()?;
        let result = self
            .client
            .stop_session(&token, session_id)
            .await
            .context("failed to stop avatar session");
        self.clear_token();
        result
    }

    fn media_source(&self) -> Option<Arc<dyn VideoSource>> {
        Some(self.video.clone() as Arc<dyn VideoSource>)
    }
}
