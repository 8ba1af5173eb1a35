//! Dual-source session recorder.
//!
//! Two live video sources are composited side by side on a fixed-rate redraw
//! loop, combined with one microphone track and handed to a [`MediaEncoder`].
//! Encoded chunks are buffered as they arrive and concatenated on stop.

mod artifact;
mod compositor;
mod encoder;
mod format;
mod label;

pub use artifact::{FILE_PREFIX, RecordingArtifact};
pub use compositor::{Compositor, Layout};
pub use encoder::{EncodeRequest, EncoderSettings, EncodingSession, MediaEncoder, Microphone};
pub use format::{RecordingFormat, default_preferences, negotiate};
pub use label::LabelFont;

use crate::error::{RecordingError, Result};
use crate::media::{VideoSource, VideoTrack};
use crate::task::RepeatingTask;
use bytes::Bytes;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::Instant;

// Frames waiting for the encoder. Older frames are dropped, never queued.
const FRAME_BUFFER: usize = 2;

#[derive(Debug, Clone)]
pub struct RecorderConfig {
    pub layout: Layout,
    pub frame_rate: u32,
    pub settings: EncoderSettings,
    /// Tried in order; the first one the encoder supports wins.
    pub preferences: Vec<RecordingFormat>,
    /// Draws the panel labels. Recordings are unlabeled without it.
    pub label_font: Option<Arc<LabelFont>>,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            layout: Layout::default(),
            frame_rate: 30,
            settings: EncoderSettings::default(),
            preferences: default_preferences(),
            label_font: None,
        }
    }
}

struct ActiveRecording {
    format: RecordingFormat,
    redraw: RepeatingTask,
    session: Box<dyn EncodingSession>,
    collector: JoinHandle<Vec<Bytes>>,
}

/// Records at most one composited stream at a time.
///
/// Both operations take `&mut self`, so a start and a stop can never overlap.
pub struct Recorder {
    encoder: Arc<dyn MediaEncoder>,
    microphone: Arc<dyn Microphone>,
    config: RecorderConfig,
    active: Option<ActiveRecording>,
}

impl Recorder {
    pub fn new(
        encoder: Arc<dyn MediaEncoder>,
        microphone: Arc<dyn Microphone>,
        config: RecorderConfig,
    ) -> Self {
        Self {
            encoder,
            microphone,
            config,
            active: None,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.active.is_some()
    }

    pub fn format(&self) -> Option<&RecordingFormat> {
        self.active.as_ref().map(|a| &a.format)
    }

    /// Starts recording `left` and `right` side by side.
    pub async fn start_recording(
        &mut self,
        left: Arc<dyn VideoSource>,
        right: Arc<dyn VideoSource>,
    ) -> Result<RecordingFormat> {
        if self.active.is_some() {
            return Err(RecordingError::AlreadyRecording.into());
        }

        // Step 1: Pick a format before touching any device.
        let encoder = self.encoder.clone();
        let format = negotiate(&self.config.preferences, |f| encoder.is_type_supported(f))?;

        // Step 2: Acquire the microphone.
        let audio = self.microphone.acquire().await?;

        // Step 3: Start the redraw loop feeding the video track.
        let layout = self.config.layout.clone();
        let fps = self.config.frame_rate.max(1);
        let (frame_tx, video) = VideoTrack::channel(layout.width, layout.height, fps, FRAME_BUFFER);
        let compositor = Compositor::new(layout, self.config.label_font.clone());
        let redraw = RepeatingTask::spawn(
            Instant::now(),
            Duration::from_secs(1) / fps,
            move || {
                let frame = Arc::new(compositor.paint(left.as_ref(), right.as_ref()));
                match frame_tx.try_send(frame) {
                    Ok(()) | Err(TrySendError::Full(_)) => ControlFlow::Continue(()),
                    Err(TrySendError::Closed(_)) => ControlFlow::Break(()),
                }
            },
        );

        // Step 4: Buffer encoded chunks as they arrive.
        let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel::<Bytes>();
        let collector = tokio::spawn(async move {
            let mut chunks = Vec::new();
            while let Some(chunk) = chunk_rx.recv().await {
                if !chunk.is_empty() {
                    chunks.push(chunk);
                }
            }
            chunks
        });

        // Step 5: Start the encoder.
        let request = EncodeRequest {
            format: format.clone(),
            settings: self.config.settings.clone(),
            video,
            audio,
            chunks: chunk_tx,
        };
        let session = match self.encoder.start(request).await {
            Ok(session) => session,
            Err(e) => {
                redraw.stop().await;
                collector.abort();
                return Err(e.into());
            }
        };

        tracing::info!("recording started as {}", format);
        self.active = Some(ActiveRecording {
            format: format.clone(),
            redraw,
            session,
            collector,
        });
        Ok(format)
    }

    /// Finalizes the encoder and returns everything recorded since start.
    pub async fn stop_recording(&mut self) -> Result<RecordingArtifact> {
        let Some(active) = self.active.take() else {
            return Err(RecordingError::NoActiveRecording.into());
        };

        let finished = active.session.finish().await;
        active.redraw.stop().await;

        if let Err(e) = finished {
            active.collector.abort();
            return Err(e.into());
        }
        let chunks = active
            .collector
            .await
            .map_err(|e| RecordingError::Encoder(format!("chunk collector failed: {e}")))?;

        let artifact = RecordingArtifact::from_chunks(active.format, chunks);
        tracing::info!(
            "recording stopped, {} bytes of {}",
            artifact.len(),
            artifact.format
        );
        Ok(artifact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::media::FrameSlot;
    use crate::testing::{FakeEncoder, FakeMicrophone};
    use image::{Rgba, RgbaImage};

    fn small_config() -> RecorderConfig {
        RecorderConfig {
            layout: Layout {
                width: 32,
                height: 16,
                ..Layout::default()
            },
            ..RecorderConfig::default()
        }
    }

    fn sources() -> (Arc<dyn VideoSource>, Arc<dyn VideoSource>) {
        let camera = FrameSlot::new();
        camera.publish(Arc::new(RgbaImage::from_pixel(8, 8, Rgba([9, 9, 9, 255]))));
        // The avatar side has nothing decodable yet.
        (camera, FrameSlot::new())
    }

    #[tokio::test(start_paused = true)]
    async fn records_until_stopped() {
        let encoder = FakeEncoder::supporting(&["video/webm;codecs=vp9,opus"]);
        let mic = FakeMicrophone::new();
        let mut recorder = Recorder::new(encoder.clone(), mic.clone(), small_config());
        let (left, right) = sources();

        let format = recorder.start_recording(left, right).await.unwrap();
        assert_eq!(format.mime_type, "video/webm;codecs=vp9,opus");
        assert!(recorder.is_recording());

        tokio::time::sleep(Duration::from_millis(500)).await;
        let artifact = recorder.stop_recording().await.unwrap();

        assert!(!recorder.is_recording());
        assert!(!artifact.is_empty());
        assert!(encoder.frames_encoded() >= 5);
        assert_eq!(mic.released(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn second_start_is_rejected_without_disturbing_the_first() {
        let encoder = FakeEncoder::supporting(&["video/webm"]);
        let mic = FakeMicrophone::new();
        let mut recorder = Recorder::new(encoder.clone(), mic.clone(), small_config());
        let (left, right) = sources();

        recorder
            .start_recording(left.clone(), right.clone())
            .await
            .unwrap();
        let err = recorder.start_recording(left, right).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Recording(RecordingError::AlreadyRecording)
        ));
        assert_eq!(mic.acquired(), 1);
        assert_eq!(encoder.sessions_started(), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!recorder.stop_recording().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stop_without_start_fails() {
        let mut recorder = Recorder::new(
            FakeEncoder::supporting(&["video/webm"]),
            FakeMicrophone::new(),
            small_config(),
        );
        assert!(matches!(
            recorder.stop_recording().await,
            Err(Error::Recording(RecordingError::NoActiveRecording))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn falls_back_when_the_preferred_codec_is_missing() {
        let encoder = FakeEncoder::supporting(&["video/webm"]);
        let mut recorder = Recorder::new(encoder, FakeMicrophone::new(), small_config());
        let (left, right) = sources();

        let format = recorder.start_recording(left, right).await.unwrap();
        assert_eq!(format.mime_type, "video/webm");
        assert_eq!(format.extension, "webm");

        tokio::time::sleep(Duration::from_millis(100)).await;
        let artifact = recorder.stop_recording().await.unwrap();
        assert_eq!(artifact.format.mime_type, "video/webm");
        assert!(!artifact.is_empty());
    }

    #[tokio::test]
    async fn unsupported_formats_never_touch_the_microphone() {
        let mic = FakeMicrophone::new();
        let mut recorder =
            Recorder::new(FakeEncoder::supporting(&[]), mic.clone(), small_config());
        let (left, right) = sources();

        let err = recorder.start_recording(left, right).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Recording(RecordingError::UnsupportedFormat(_))
        ));
        assert_eq!(mic.acquired(), 0);
        assert!(!recorder.is_recording());
    }

    #[tokio::test]
    async fn microphone_failure_is_a_device_error() {
        let mut recorder = Recorder::new(
            FakeEncoder::supporting(&["video/mp4"]),
            FakeMicrophone::denied(),
            small_config(),
        );
        let (left, right) = sources();

        let err = recorder.start_recording(left, right).await.unwrap_err();
        assert!(matches!(err, Error::Device(_)));
        assert!(!recorder.is_recording());
    }
}
