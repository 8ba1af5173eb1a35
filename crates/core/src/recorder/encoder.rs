use super::format::RecordingFormat;
use crate::error::{RecordingError, Result};
use crate::media::{AudioTrack, VideoTrack};
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderSettings {
    pub video_bits_per_second: u32,
    pub audio_bits_per_second: u32,
    /// How often encoded output is flushed as a chunk.
    pub timeslice: Duration,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            video_bits_per_second: 2_500_000,
            audio_bits_per_second: 128_000,
            timeslice: Duration::from_secs(1),
        }
    }
}

/// Everything an encoder needs to produce one recording.
pub struct EncodeRequest {
    pub format: RecordingFormat,
    pub settings: EncoderSettings,
    pub video: VideoTrack,
    pub audio: AudioTrack,
    /// Encoded chunks in output order. Dropped by the encoder once finished.
    pub chunks: mpsc::UnboundedSender<Bytes>,
}

/// Combines a video and an audio track into one encoded stream.
#[async_trait]
pub trait MediaEncoder: Send + Sync {
    fn is_type_supported(&self, format: &RecordingFormat) -> bool;

    async fn start(
        &self,
        request: EncodeRequest,
    ) -> Result<Box<dyn EncodingSession>, RecordingError>;
}

/// A running encode. Held by the recorder, so it must be shareable across
/// the orchestrator's `&self` awaits.
#[async_trait]
pub trait EncodingSession: Send + Sync {
    /// Flushes remaining output and releases the tracks.
    async fn finish(self: Box<Self>) -> Result<(), RecordingError>;
}

/// The single owner of the microphone device.
#[async_trait]
pub trait Microphone: Send + Sync {
    async fn acquire(&self) -> Result<AudioTrack>;
}
