use async_trait::async_trait;
use partner_core::error::{Error, Result};
use partner_core::media::AudioTrack;
use partner_core::recorder::Microphone;
use partner_native_utils::capture::MicCapture;

const TRACK_CAPACITY: usize = 64;

/// Opens a fresh capture of the configured input device for each recording.
pub struct CpalMicrophone {
    device: Option<String>,
}

impl CpalMicrophone {
    pub fn new(device: Option<String>) -> Self {
        Self { device }
    }
}

#[async_trait]
impl Microphone for CpalMicrophone {
    async fn acquire(&self) -> Result<AudioTrack> {
        let device = self.device.clone();
        let (capture, samples) =
            tokio::task::spawn_blocking(move || MicCapture::start(device, TRACK_CAPACITY))
                .await
                .map_err(|e| Error::Device(format!("capture thread failed: {e}")))?
                .map_err(|e| Error::Device(format!("{e:#}")))?;

        let sample_rate = capture.sample_rate();
        Ok(AudioTrack::new(
            sample_rate,
            1,
            samples,
            Some(Box::new(move || release_off_runtime(capture))),
        ))
    }
}

/// Drops `value` on the blocking pool when called from a runtime worker.
/// Stopping a capture joins its device thread.
fn release_off_runtime<T: Send + 'static>(value: T) {
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn_blocking(move || drop(value));
        }
        Err(_) => drop(value),
    }
}
