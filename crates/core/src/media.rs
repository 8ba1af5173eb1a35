//! Live media handles shared between the session components.
//!
//! Every device or remote stream has exactly one owner. Other components only
//! ever see it through [`VideoSource`] (read-only frame access) or through an
//! [`AudioTrack`] handed over by its owner.

use image::RgbaImage;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::mpsc;

/// A decoded RGBA video frame. Cheap to clone.
pub type VideoFrame = Arc<RgbaImage>;

/// Read-only access to a live video feed.
pub trait VideoSource: Send + Sync {
    /// The most recent decodable frame, or `None` while the feed has nothing to show.
    fn current_frame(&self) -> Option<VideoFrame>;
}

/// Holds the latest frame published by a producer task.
#[derive(Default)]
pub struct FrameSlot {
    frame: RwLock<Option<VideoFrame>>,
}

impl FrameSlot {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn publish(&self, frame: VideoFrame) {
        *self.frame.write().unwrap_or_else(PoisonError::into_inner) = Some(frame);
    }

    pub fn clear(&self) {
        *self.frame.write().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl VideoSource for FrameSlot {
    fn current_frame(&self) -> Option<VideoFrame> {
        self.frame
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// A stable video handle whose underlying source can be swapped in place.
///
/// Views and the recorder keep the same `Arc<LiveVideo>` for as long as they
/// like; reconnecting the remote stream only changes what it points at.
#[derive(Default)]
pub struct LiveVideo {
    source: RwLock<Option<Arc<dyn VideoSource>>>,
}

impl LiveVideo {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_source(&self, source: Option<Arc<dyn VideoSource>>) {
        *self.source.write().unwrap_or_else(PoisonError::into_inner) = source;
    }

    pub fn has_source(&self) -> bool {
        self.source
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

impl VideoSource for LiveVideo {
    fn current_frame(&self) -> Option<VideoFrame> {
        let source = self
            .source
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        source.and_then(|s| s.current_frame())
    }
}

/// Frames captured from a drawing surface at a fixed rate.
pub struct VideoTrack {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    frames: mpsc::Receiver<VideoFrame>,
}

impl VideoTrack {
    /// Creates a track and the sender its producer writes into. The track ends
    /// once the sender is dropped.
    pub fn channel(
        width: u32,
        height: u32,
        frame_rate: u32,
        capacity: usize,
    ) -> (mpsc::Sender<VideoFrame>, Self) {
        let (tx, frames) = mpsc::channel(capacity);
        (
            tx,
            Self {
                width,
                height,
                frame_rate,
                frames,
            },
        )
    }

    pub async fn recv(&mut self) -> Option<VideoFrame> {
        self.frames.recv().await
    }
}

/// Called once when an audio track is stopped or dropped.
pub type ReleaseFn = Box<dyn FnOnce() + Send>;

/// Mono or interleaved f32 samples from a capture device.
pub struct AudioTrack {
    pub sample_rate: u32,
    pub channels: u16,
    samples: mpsc::Receiver<Vec<f32>>,
    release: Option<ReleaseFn>,
}

impl AudioTrack {
    pub fn new(
        sample_rate: u32,
        channels: u16,
        samples: mpsc::Receiver<Vec<f32>>,
        release: Option<ReleaseFn>,
    ) -> Self {
        Self {
            sample_rate,
            channels,
            samples,
            release,
        }
    }

    pub async fn recv(&mut self) -> Option<Vec<f32>> {
        self.samples.recv().await
    }

    /// Releases the underlying device. Safe to call more than once.
    pub fn stop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
        self.samples.close();
    }
}

impl Drop for AudioTrack {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for AudioTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioTrack")
            .field("sample_rate", &self.sample_rate)
            .field("channels", &self.channels)
            .finish()
    }
}
