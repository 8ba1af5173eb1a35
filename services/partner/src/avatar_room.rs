//! The avatar's WebRTC media leg.
//!
//! A streaming avatar session hands back a media server URL and a room
//! token. Joining that room is the only way to see the avatar; decoded
//! frames land in a [`FrameSlot`] the recorder and any viewer read from.

use async_trait::async_trait;
use image::RgbaImage;
use partner_core::media::FrameSlot;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Frames this small are placeholder frames sent before the real video starts.
const MIN_FRAME_SIDE: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomSignal {
    /// The first frame of a newly subscribed video track was published.
    VideoStarted,
    Disconnected,
}

pub type RoomSignals = mpsc::UnboundedSender<RoomSignal>;

#[async_trait]
pub trait MediaRoom: Send + Sync {
    /// Joins the room and publishes the avatar's video into `frames` until `leave`.
    async fn join(
        &self,
        url: &str,
        token: &str,
        frames: Arc<FrameSlot>,
        signals: RoomSignals,
    ) -> anyhow::Result<()>;

    async fn leave(&self);
}

/// Builds an RGBA frame by letting `convert` fill a tightly packed buffer.
/// `convert` receives the buffer and its stride in bytes.
pub fn rgba_frame(
    width: u32,
    height: u32,
    convert: impl FnOnce(&mut [u8], u32),
) -> Option<RgbaImage> {
    if width < MIN_FRAME_SIDE || height < MIN_FRAME_SIDE {
        return None;
    }
    let stride = width * 4;
    let mut bytes = vec![0u8; (stride * height) as usize];
    convert(&mut bytes, stride);
    RgbaImage::from_raw(width, height, bytes)
}

/// Used when the binary is built without WebRTC support.
pub struct NoMediaRoom;

#[async_trait]
impl MediaRoom for NoMediaRoom {
    async fn join(&self, _: &str, _: &str, _: Arc<FrameSlot>, _: RoomSignals) -> anyhow::Result<()> {
        anyhow::bail!("built without webrtc support")
    }

    async fn leave(&self) {}
}

#[cfg(feature = "webrtc")]
pub use self::livekit_room::LiveKitRoom;

/// The room implementation this build ships with.
pub fn default_room() -> Arc<dyn MediaRoom> {
    #[cfg(feature = "webrtc")]
    {
        Arc::new(LiveKitRoom::new())
    }
    #[cfg(not(feature = "webrtc"))]
    {
        Arc::new(NoMediaRoom)
    }
}

#[cfg(feature = "webrtc")]
mod livekit_room {
    use super::{MediaRoom, RoomSignal, RoomSignals, rgba_frame};
    use anyhow::Context;
    use async_trait::async_trait;
    use futures::StreamExt;
    use livekit::track::RemoteTrack;
    use livekit::{Room, RoomEvent, RoomOptions};
    use livekit::webrtc::prelude::VideoFormatType;
    use livekit::webrtc::video_frame::VideoBuffer;
    use livekit::webrtc::video_stream::native::NativeVideoStream;
    use partner_core::media::FrameSlot;
    use std::sync::{Arc, Mutex, PoisonError};
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;

    struct Joined {
        room: Room,
        events: JoinHandle<()>,
    }

    /// A LiveKit room subscriber for the avatar's video track.
    pub struct LiveKitRoom {
        joined: Mutex<Option<Joined>>,
    }

    impl LiveKitRoom {
        pub fn new() -> Self {
            Self {
                joined: Mutex::new(None),
            }
        }

        fn take(&self) -> Option<Joined> {
            self.joined
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take()
        }
    }

    impl Default for LiveKitRoom {
        fn default() -> Self {
            Self::new()
        }
    }

    fn to_rgba(buffer: &dyn VideoBuffer) -> Option<image::RgbaImage> {
        rgba_frame(buffer.width(), buffer.height(), |bytes, stride| {
            // libyuv names formats by word order; ABGR is RGBA in memory.
            buffer.to_argb(
                VideoFormatType::ABGR,
                bytes,
                stride,
                buffer.width() as i32,
                buffer.height() as i32,
            )
        })
    }

    async fn publish_frames(
        mut stream: NativeVideoStream,
        frames: Arc<FrameSlot>,
        signals: RoomSignals,
    ) {
        let mut started = false;
        while let Some(frame) = stream.next().await {
            let Some(image) = to_rgba(&*frame.buffer) else {
                continue;
            };
            frames.publish(Arc::new(image));
            if !started {
                started = true;
                let _ = signals.send(RoomSignal::VideoStarted);
            }
        }
        tracing::debug!("avatar video stream ended");
    }

    async fn handle_events(
        mut events: mpsc::UnboundedReceiver<RoomEvent>,
        frames: Arc<FrameSlot>,
        signals: RoomSignals,
    ) {
        let mut video: Option<JoinHandle<()>> = None;
        while let Some(event) = events.recv().await {
            match event {
                RoomEvent::TrackSubscribed {
                    track: RemoteTrack::Video(track),
                    participant,
                    ..
                } => {
                    tracing::info!("avatar video track from {:?}", participant.identity());
                    if let Some(previous) = video.take() {
                        previous.abort();
                    }
                    let stream = NativeVideoStream::new(track.rtc_track());
                    video = Some(tokio::spawn(publish_frames(
                        stream,
                        frames.clone(),
                        signals.clone(),
                    )));
                }
                RoomEvent::TrackUnsubscribed {
                    track: RemoteTrack::Video(_),
                    ..
                } => {
                    if let Some(previous) = video.take() {
                        previous.abort();
                    }
                    frames.clear();
                }
                RoomEvent::Disconnected { reason } => {
                    tracing::warn!("avatar media room disconnected: {:?}", reason);
                    let _ = signals.send(RoomSignal::Disconnected);
                    break;
                }
                _ => {}
            }
        }
        if let Some(video) = video {
            video.abort();
        }
        frames.clear();
    }

    #[async_trait]
    impl MediaRoom for LiveKitRoom {
        async fn join(
            &self,
            url: &str,
            token: &str,
            frames: Arc<FrameSlot>,
            signals: RoomSignals,
        ) -> anyhow::Result<()> {
            self.leave().await;
            let (room, events) = Room::connect(url, token, RoomOptions::default())
                .await
                .context("failed to join the avatar media room")?;
            tracing::info!("joined avatar media room {}", room.name());
            let events = tokio::spawn(handle_events(events, frames, signals));
            *self.joined.lock().unwrap_or_else(PoisonError::into_inner) =
                Some(Joined { room, events });
            Ok(())
        }

        async fn leave(&self) {
            let Some(joined) = self.take() else {
                return;
            };
            joined.events.abort();
            if let Err(e) = joined.room.close().await {
                tracing::warn!("failed to leave avatar media room: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_frames_are_skipped() {
        let mut called = false;
        assert!(rgba_frame(8, 720, |_, _| called = true).is_none());
        assert!(rgba_frame(1280, 2, |_, _| called = true).is_none());
        assert!(!called);
    }

    #[test]
    fn converted_bytes_become_the_frame() {
        let frame = rgba_frame(12, 10, |bytes, stride| {
            assert_eq!(stride, 48);
            assert_eq!(bytes.len(), 480);
            bytes[..4].copy_from_slice(&[9, 8, 7, 255]);
        })
        .unwrap();
        assert_eq!(frame.dimensions(), (12, 10));
        assert_eq!(frame.get_pixel(0, 0).0, [9, 8, 7, 255]);
        assert_eq!(frame.get_pixel(11, 9).0, [0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn joining_without_webrtc_fails_cleanly() {
        let (signals, _rx) = mpsc::unbounded_channel();
        let err = NoMediaRoom
            .join("wss://media", "room-token", FrameSlot::new(), signals)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("webrtc"));
    }
}
