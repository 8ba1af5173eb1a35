//! Transcription sources for the console client.
//!
//! [`MicTranscriber`] streams the microphone to a realtime transcription
//! session. [`ConsoleTranscriber`] turns typed lines into final transcripts.

use futures::stream::BoxStream;
use partner_core::error::Result;
use partner_core::transcription::{TranscriptEvent, TranscriptionSource, broadcast_stream};
use partner_native_utils::audio::Pcm16Encoder;
use partner_native_utils::capture::{INPUT_CHUNK_SIZE, MicCapture};
use realtime_transcribe::types::{ClientEvent, ServerEvent};
use realtime_transcribe::{ClientTx, ServerRx};
use secrecy::{ExposeSecret, SecretString};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

const TRANSCRIPT_CAPACITY: usize = 32;
const CAPTURE_CHANNEL_CAPACITY: usize = 64;

/// Maps a server event to the transcript it carries, if any.
pub fn transcript_from(event: &ServerEvent) -> Option<TranscriptEvent> {
    match event {
        ServerEvent::TranscriptionDelta { delta, .. } if !delta.is_empty() => {
            Some(TranscriptEvent::interim(delta.clone()))
        }
        ServerEvent::TranscriptionCompleted { transcript, .. } => {
            let text = transcript.trim();
            (!text.is_empty()).then(|| TranscriptEvent::final_text(text))
        }
        _ => None,
    }
}

/// Resamples captured audio and appends it to the session while `listening`.
/// Audio captured while not listening is discarded.
pub async fn forward_audio(
    mut chunks: mpsc::Receiver<Vec<f32>>,
    listening: Arc<AtomicBool>,
    mut encoder: Pcm16Encoder,
    client: ClientTx,
) {
    let mut was_listening = false;
    while let Some(chunk) = chunks.recv().await {
        let is_listening = listening.load(Ordering::SeqCst);
        if !is_listening {
            if was_listening {
                encoder.clear();
            }
            was_listening = false;
            continue;
        }
        was_listening = true;
        if let Some(audio) = encoder.push(&chunk) {
            if client
                .send(ClientEvent::InputAudioBufferAppend { audio })
                .await
                .is_err()
            {
                tracing::warn!("transcription session closed, audio forwarding stopped");
                break;
            }
        }
    }
}

/// Publishes transcripts until the session goes away, then marks it `failed`.
async fn forward_transcripts(
    mut events: ServerRx,
    out: broadcast::Sender<TranscriptEvent>,
    failed: Arc<AtomicBool>,
) {
    loop {
        match events.recv().await {
            Ok(ServerEvent::Close { reason }) => {
                tracing::warn!("transcription session closed: {:?}", reason);
                break;
            }
            Ok(event) => {
                if let Some(transcript) = transcript_from(&event) {
                    let _ = out.send(transcript);
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!("transcription events lagged, {} dropped", n);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    failed.store(true, Ordering::SeqCst);
}

struct Running {
    client: ClientTx,
    _capture: MicCapture,
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for Running {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Microphone speech recognition over a realtime transcription session.
pub struct MicTranscriber {
    listening: Arc<AtomicBool>,
    failed: Arc<AtomicBool>,
    events: broadcast::Sender<TranscriptEvent>,
    running: Mutex<Option<Running>>,
}

impl MicTranscriber {
    /// Without a credential, or when the session or microphone cannot be
    /// opened, the transcriber reports itself unsupported.
    pub async fn connect(api_key: Option<&SecretString>, device: Option<String>) -> Self {
        let (events, _) = broadcast::channel(TRANSCRIPT_CAPACITY);
        let transcriber = Self {
            listening: Arc::new(AtomicBool::new(false)),
            failed: Arc::new(AtomicBool::new(false)),
            events,
            running: Mutex::new(None),
        };
        let Some(api_key) = api_key else {
            tracing::info!("OPENAI_API_KEY not set, microphone transcription unavailable");
            return transcriber;
        };
        match transcriber.open(api_key, device).await {
            Ok(running) => {
                *transcriber
                    .running
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(running);
            }
            Err(e) => tracing::error!("microphone transcription unavailable: {:#}", e),
        }
        transcriber
    }

    async fn open(&self, api_key: &SecretString, device: Option<String>) -> anyhow::Result<Running> {
        let config = realtime_transcribe::Config::builder()
            .with_api_key(api_key.expose_secret())
            .build();
        let client = realtime_transcribe::connect_with_config(256, config).await?;
        let server_events = client.server_events()?;
        client.configure().await?;
        let sender = client.sender()?;

        let (capture, chunks) = tokio::task::spawn_blocking(move || {
            MicCapture::start(device, CAPTURE_CHANNEL_CAPACITY)
        })
        .await??;
        let encoder = Pcm16Encoder::new(capture.sample_rate() as f64, INPUT_CHUNK_SIZE)?;

        let tasks = vec![
            tokio::spawn(forward_audio(
                chunks,
                self.listening.clone(),
                encoder,
                sender.clone(),
            )),
            tokio::spawn(forward_transcripts(
                server_events,
                self.events.clone(),
                self.failed.clone(),
            )),
        ];
        tracing::info!("microphone transcription ready");
        Ok(Running {
            client: sender,
            _capture: capture,
            tasks,
        })
    }
}

impl TranscriptionSource for MicTranscriber {
    fn is_supported(&self) -> bool {
        self.running
            .lock()
            .map(|r| r.is_some())
            .unwrap_or(false)
    }

    fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst) && !self.has_failed()
    }

    fn has_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    fn start(&self) -> Result<()> {
        if self.is_supported()
            && !self.has_failed()
            && !self.listening.swap(true, Ordering::SeqCst)
        {
            tracing::debug!("microphone listening");
        }
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        if self.listening.swap(false, Ordering::SeqCst) {
            tracing::debug!("microphone muted");
            if let Ok(guard) = self.running.lock() {
                if let Some(running) = guard.as_ref() {
                    // Half-spoken audio must not be committed once the avatar talks.
                    let _ = running.client.try_send(ClientEvent::InputAudioBufferClear);
                }
            }
        }
        Ok(())
    }

    fn transcripts(&self) -> BoxStream<'static, TranscriptEvent> {
        broadcast_stream(self.events.subscribe())
    }
}

/// Typed input. Each submitted line is one final transcript.
pub struct ConsoleTranscriber {
    listening: AtomicBool,
    events: broadcast::Sender<TranscriptEvent>,
}

impl ConsoleTranscriber {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(TRANSCRIPT_CAPACITY);
        Self {
            listening: AtomicBool::new(false),
            events,
        }
    }

    /// Delivers `line` if the partner is listening. Returns whether it was delivered.
    pub fn submit(&self, line: &str) -> bool {
        let text = line.trim();
        if text.is_empty() || !self.is_listening() {
            return false;
        }
        self.events.send(TranscriptEvent::final_text(text)).is_ok()
    }
}

impl Default for ConsoleTranscriber {
    fn default() -> Self {
        Self::new()
    }
}

impl TranscriptionSource for ConsoleTranscriber {
    fn is_supported(&self) -> bool {
        true
    }

    fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
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
