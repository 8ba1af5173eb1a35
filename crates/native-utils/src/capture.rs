//! Microphone capture on a dedicated thread.
//!
//! `cpal::Stream` is not `Send`, so the stream lives on its own thread for
//! its whole life. The device callback only pushes mono samples into a ring
//! buffer; the thread drains it on a short interval and forwards chunks to
//! an async channel.

use crate::audio;
use anyhow::Context;
use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{FrameCount, StreamConfig};
use ringbuf::HeapCons;
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc;

/// Frames per device callback.
pub const INPUT_CHUNK_SIZE: usize = 1024;
/// Capacity of the capture ring buffer.
pub const CAPTURE_BUFFER_MS: usize = 500;
const DRAIN_INTERVAL: Duration = Duration::from_millis(20);

/// A running capture. Dropping it stops the device stream.
pub struct MicCapture {
    sample_rate: u32,
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl MicCapture {
    /// Opens the input device and starts forwarding mono f32 chunks.
    pub fn start(
        device_name: Option<String>,
        capacity: usize,
    ) -> anyhow::Result<(Self, mpsc::Receiver<Vec<f32>>)> {
        let (chunk_tx, chunk_rx) = mpsc::channel(capacity);
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<anyhow::Result<u32>>(1);
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let thread = std::thread::Builder::new()
            .name("mic-capture".to_string())
            .spawn(move || run_capture(device_name, chunk_tx, ready_tx, stop_rx))
            .context("failed to spawn capture thread")?;

        let sample_rate = ready_rx
            .recv()
            .context("capture thread exited before reporting")??;

        Ok((
            Self {
                sample_rate,
                stop_tx: Some(stop_tx),
                thread: Some(thread),
            },
            chunk_rx,
        ))
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn stop(&mut self) {
        self.stop_tx.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("capture thread panicked");
            }
        }
    }
}

impl Drop for MicCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_capture(
    device_name: Option<String>,
    chunk_tx: mpsc::Sender<Vec<f32>>,
    ready_tx: std_mpsc::SyncSender<anyhow::Result<u32>>,
    stop_rx: std_mpsc::Receiver<()>,
) {
    let (stream, sample_rate, mut consumer) = match open_stream(device_name.as_deref()) {
        Ok(opened) => opened,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };
    if let Err(e) = stream.play() {
        let _ = ready_tx.send(Err(anyhow::Error::new(e).context("failed to start input stream")));
        return;
    }
    let _ = ready_tx.send(Ok(sample_rate));
    tracing::info!("microphone capture started at {} Hz", sample_rate);

    loop {
        match stop_rx.recv_timeout(DRAIN_INTERVAL) {
            Err(std_mpsc::RecvTimeoutError::Timeout) => {
                if !forward(&mut consumer, &chunk_tx) {
                    break;
                }
            }
            Ok(()) | Err(std_mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    drop(stream);
    tracing::info!("microphone capture stopped");
}

fn open_stream(
    device_name: Option<&str>,
) -> anyhow::Result<(cpal::Stream, u32, HeapCons<f32>)> {
    let input = crate::device::get_or_default_input(device_name)?;
    tracing::info!("Using input device: {:?}", input.name()?);

    let default_config = input
        .default_input_config()
        .context("failed to get default input config")?;
    let config = StreamConfig {
        channels: default_config.channels(),
        sample_rate: default_config.sample_rate(),
        buffer_size: cpal::BufferSize::Fixed(FrameCount::from(INPUT_CHUNK_SIZE as u32)),
    };
    let channels = config.channels as usize;
    let sample_rate = config.sample_rate.0;
    tracing::debug!("Input stream config: {:?}", &config);

    let (mut producer, consumer) =
        audio::shared_buffer(sample_rate as usize * CAPTURE_BUFFER_MS / 1000).split();

    let input_data_fn = move |data: &[f32], _: &cpal::InputCallbackInfo| {
        let dropped = push_mono(&mut producer, data, channels);
        if dropped > 0 {
            tracing::warn!("capture buffer full, dropped {} samples", dropped);
        }
    };

    let stream = input
        .build_input_stream(
            &config,
            input_data_fn,
            move |err| tracing::error!("An error occurred on input stream: {}", err),
            None,
        )
        .context("failed to build input stream")?;

    Ok((stream, sample_rate, consumer))
}

/// Downmixes one callback's interleaved frames into the ring. Returns how
/// many mono samples did not fit.
fn push_mono<P>(producer: &mut P, data: &[f32], channels: usize) -> usize
where
    P: Producer<Item = f32>,
{
    let mono = audio::downmix(data, channels);
    mono.len() - producer.push_slice(&mono)
}

/// Moves everything buffered into one chunk. Returns `false` once the
/// receiving side is gone.
fn forward<C: Consumer<Item = f32> + Observer>(
    consumer: &mut C,
    chunk_tx: &mpsc::Sender<Vec<f32>>,
) -> bool {
    if consumer.is_empty() {
        return !chunk_tx.is_closed();
    }
    let chunk: Vec<f32> = consumer.pop_iter().collect();
    match chunk_tx.try_send(chunk) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            tracing::warn!("capture consumer is behind, dropping a chunk");
            true
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stereo_callback_lands_as_mono_until_the_ring_is_full() {
        let (mut producer, mut consumer) = audio::shared_buffer(3).split();

        let stereo = [1.0, 0.0, 0.5, 0.5, 0.2, 0.4, 1.0, 1.0];
        let dropped = push_mono(&mut producer, &stereo, 2);
        assert_eq!(dropped, 1);

        let mono: Vec<f32> = consumer.pop_iter().collect();
        assert_eq!(mono.len(), 3);
        assert_eq!(mono[0], 0.5);
        assert_eq!(mono[1], 0.5);
        assert!((mono[2] - 0.3).abs() < 1e-6);
    }

    #[test]
    fn forward_drains_ring_into_one_chunk() {
        let (mut producer, mut consumer) = audio::shared_buffer(16).split();
        let (tx, mut rx) = mpsc::channel(1);

        assert!(forward(&mut consumer, &tx));
        assert!(rx.try_recv().is_err());

        producer.push_slice(&[0.1, 0.2, 0.3]);
        assert!(forward(&mut consumer, &tx));
        assert_eq!(rx.try_recv().unwrap(), vec![0.1, 0.2, 0.3]);

        producer.push_slice(&[0.4]);
        drop(rx);
        assert!(!forward(&mut consumer, &tx));
    }
}
