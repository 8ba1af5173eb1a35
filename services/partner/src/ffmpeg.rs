//! Camera capture and recording encode through ffmpeg subprocesses.

use anyhow::Context;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use image::RgbaImage;
use partner_core::error::RecordingError;
use partner_core::media::{AudioTrack, FrameSlot, VideoSource, VideoTrack};
use partner_core::recorder::{
    EncodeRequest, EncoderSettings, EncodingSession, MediaEncoder, RecordingFormat,
};
use std::collections::HashSet;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

pub const FFMPEG: &str = "ffmpeg";

const AUDIO_ACCEPT_TIMEOUT: Duration = Duration::from_secs(5);
const EXIT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_BUFFER: usize = 64 * 1024;

/// Camera frames are delivered at this size; the compositor scales them.
pub const CAMERA_WIDTH: u32 = 960;
pub const CAMERA_HEIGHT: u32 = 540;
pub const CAMERA_FPS: u32 = 30;

/// Encoders and muxers an ffmpeg build provides.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FfmpegCapabilities {
    encoders: HashSet<String>,
    muxers: HashSet<String>,
}

/// The concrete ffmpeg settings for one recording format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodePlan {
    pub muxer: String,
    pub video_encoder: String,
    pub audio_encoder: String,
}

/// Names from `ffmpeg -encoders` / `-muxers` output: the second column of
/// every line after the `---` separator.
fn parse_listing(listing: &str) -> HashSet<String> {
    listing
        .lines()
        .skip_while(|line| !line.trim_start().starts_with("--"))
        .skip(1)
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(str::to_string)
        .collect()
}

fn encoder_candidates(codec: &str) -> &'static [&'static str] {
    let codec = codec.to_ascii_lowercase();
    match codec.split('.').next().unwrap_or_default() {
        "vp9" | "vp09" => &["libvpx-vp9"],
        "vp8" => &["libvpx"],
        "opus" => &["libopus", "opus"],
        "h264" | "avc1" => &["libx264"],
        "aac" | "mp4a" => &["aac"],
        _ => &[],
    }
}

fn is_video_codec(codec: &str) -> bool {
    matches!(
        codec.to_ascii_lowercase().split('.').next(),
        Some("vp9" | "vp09" | "vp8" | "h264" | "avc1")
    )
}

impl FfmpegCapabilities {
    pub fn from_listings(encoders: &str, muxers: &str) -> Self {
        Self {
            encoders: parse_listing(encoders),
            muxers: parse_listing(muxers),
        }
    }

    /// Runs the binary once for each listing. Missing ffmpeg means no capabilities.
    pub async fn probe(binary: &str) -> anyhow::Result<Self> {
        let encoders = Self::list(binary, "-encoders").await?;
        let muxers = Self::list(binary, "-muxers").await?;
        let capabilities = Self::from_listings(&encoders, &muxers);
        tracing::debug!(
            "ffmpeg offers {} encoders and {} muxers",
            capabilities.encoders.len(),
            capabilities.muxers.len()
        );
        Ok(capabilities)
    }

    async fn list(binary: &str, flag: &str) -> anyhow::Result<String> {
        let output = Command::new(binary)
            .args(["-hide_banner", flag])
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("failed to run {binary} {flag}"))?;
        if !output.status.success() {
            anyhow::bail!("{binary} {flag} exited with {}", output.status);
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn first_available(&self, candidates: &[&str]) -> Option<String> {
        candidates
            .iter()
            .find(|c| self.encoders.contains(**c))
            .map(|c| c.to_string())
    }

    /// With codecs requested, every one of them must be available.
    fn pick(&self, requested: &[&str], defaults: &[&str]) -> Option<String> {
        if requested.is_empty() {
            return defaults
                .iter()
                .find_map(|c| self.first_available(encoder_candidates(c)));
        }
        let found = requested
            .iter()
            .map(|c| self.first_available(encoder_candidates(c)))
            .collect::<Option<Vec<_>>>()?;
        found.into_iter().next()
    }

    /// How to produce `format`, or `None` when this build cannot.
    pub fn plan(&self, format: &RecordingFormat) -> Option<EncodePlan> {
        let (muxer, video_defaults, audio_defaults): (&str, &[&str], &[&str]) =
            match format.container() {
                "video/webm" => ("webm", &["vp9", "vp8"], &["opus"]),
                "video/mp4" => ("mp4", &["h264"], &["aac"]),
                _ => return None,
            };
        if !self.muxers.contains(muxer) {
            return None;
        }

        let codecs = format.codecs();
        let (video, audio): (Vec<&str>, Vec<&str>) =
            codecs.into_iter().partition(|c| is_video_codec(c));
        let video = self.pick(&video, video_defaults)?;
        let audio = self.pick(&audio, audio_defaults)?;

        Some(EncodePlan {
            muxer: muxer.to_string(),
            video_encoder: video,
            audio_encoder: audio,
        })
    }
}

/// Video arrives as raw RGBA on stdin, audio as f32le from a loopback TCP
/// connection, and the muxed stream leaves on stdout.
pub fn encode_args(
    plan: &EncodePlan,
    settings: &EncoderSettings,
    video: &VideoTrack,
    audio: &AudioTrack,
    audio_port: u16,
) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        "-f".into(),
        "rawvideo".into(),
        "-pix_fmt".into(),
        "rgba".into(),
        "-s".into(),
        format!("{}x{}", video.width, video.height),
        "-r".into(),
        video.frame_rate.to_string(),
        "-i".into(),
        "pipe:0".into(),
        "-f".into(),
        "f32le".into(),
        "-ar".into(),
        audio.sample_rate.to_string(),
        "-ac".into(),
        audio.channels.to_string(),
        "-i".into(),
        format!("tcp://127.0.0.1:{audio_port}"),
        "-c:v".into(),
        plan.video_encoder.clone(),
        "-b:v".into(),
        settings.video_bits_per_second.to_string(),
        "-pix_fmt".into(),
        "yuv420p".into(),
        "-c:a".into(),
        plan.audio_encoder.clone(),
        "-b:a".into(),
        settings.audio_bits_per_second.to_string(),
    ];
    if plan.muxer == "mp4" {
        // stdout is not seekable.
        args.extend(["-movflags".into(), "frag_keyframe+empty_moov".into()]);
    }
    args.extend(["-f".into(), plan.muxer.clone(), "pipe:1".into()]);
    args
}

/// Reads encoded output and emits it as one chunk per `timeslice`.
pub async fn collect_output<R: AsyncRead + Unpin>(
    mut output: R,
    timeslice: Duration,
    chunks: mpsc::UnboundedSender<Bytes>,
) {
    let mut pending = BytesMut::new();
    let mut buf = vec![0u8; READ_BUFFER];
    let mut tick = tokio::time::interval(timeslice);
    tick.tick().await;
    loop {
        tokio::select! {
            read = output.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => pending.extend_from_slice(&buf[..n]),
                Err(e) => {
                    tracing::warn!("failed to read encoder output: {}", e);
                    break;
                }
            },
            _ = tick.tick() => {
                if !pending.is_empty() && chunks.send(pending.split().freeze()).is_err() {
                    return;
                }
            }
        }
    }
    if !pending.is_empty() {
        let _ = chunks.send(pending.freeze());
    }
}

async fn write_video<W: AsyncWrite + Unpin>(
    mut video: VideoTrack,
    mut sink: W,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            frame = video.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = sink.write_all(frame.as_raw()).await {
                    tracing::warn!("encoder stopped accepting video: {}", e);
                    break;
                }
            }
        }
    }
    let _ = sink.shutdown().await;
}

async fn write_audio(mut audio: AudioTrack, listener: TcpListener, mut stop: watch::Receiver<bool>) {
    let accepted = tokio::select! {
        _ = stop.changed() => return,
        accepted = tokio::time::timeout(AUDIO_ACCEPT_TIMEOUT, listener.accept()) => accepted,
    };
    let mut socket = match accepted {
        Ok(Ok((socket, _))) => socket,
        Ok(Err(e)) => {
            tracing::error!("encoder audio connection failed: {}", e);
            return;
        }
        Err(_) => {
            tracing::error!("encoder never connected for audio");
            return;
        }
    };
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            samples = audio.recv() => {
                let Some(samples) = samples else { break };
                let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
                if let Err(e) = socket.write_all(&bytes).await {
                    tracing::warn!("encoder stopped accepting audio: {}", e);
                    break;
                }
            }
        }
    }
    let _ = socket.shutdown().await;
    audio.stop();
}

fn log_stderr(child: &mut Child, name: &'static str) -> Option<JoinHandle<()>> {
    let stderr = child.stderr.take()?;
    Some(tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::warn!("{}: {}", name, line);
        }
    }))
}

/// A [`MediaEncoder`] backed by an ffmpeg subprocess per recording.
pub struct FfmpegEncoder {
    binary: String,
    capabilities: FfmpegCapabilities,
}

impl FfmpegEncoder {
    pub fn new(binary: impl Into<String>, capabilities: FfmpegCapabilities) -> Self {
        Self {
            binary: binary.into(),
            capabilities,
        }
    }

    /// Probes once. Without a working ffmpeg every format is unsupported.
    pub async fn probe(binary: &str) -> Self {
        let capabilities = match FfmpegCapabilities::probe(binary).await {
            Ok(capabilities) => capabilities,
            Err(e) => {
                tracing::warn!("recording unavailable: {:#}", e);
                FfmpegCapabilities::default()
            }
        };
        Self::new(binary, capabilities)
    }
}

#[async_trait]
impl MediaEncoder for FfmpegEncoder {
    fn is_type_supported(&self, format: &RecordingFormat) -> bool {
        self.capabilities.plan(format).is_some()
    }

    async fn start(
        &self,
        request: EncodeRequest,
    ) -> Result<Box<dyn EncodingSession>, RecordingError> {
        let EncodeRequest {
            format,
            settings,
            video,
            audio,
            chunks,
        } = request;
        let plan = self
            .capabilities
            .plan(&format)
            .ok_or_else(|| RecordingError::UnsupportedFormat(vec![format.mime_type.clone()]))?;

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| RecordingError::Encoder(format!("audio socket: {e}")))?;
        let port = listener
            .local_addr()
            .map_err(|e| RecordingError::Encoder(format!("audio socket: {e}")))?
            .port();

        let args = encode_args(&plan, &settings, &video, &audio, port);
        tracing::debug!("starting encoder: {} {}", self.binary, args.join(" "));
        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RecordingError::Encoder(format!("failed to start {}: {e}", self.binary)))?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(RecordingError::Encoder("encoder pipes unavailable".into()));
        };
        let (stop_tx, stop_rx) = watch::channel(false);

        let writers = vec![
            tokio::spawn(write_video(video, stdin, stop_rx.clone())),
            tokio::spawn(write_audio(audio, listener, stop_rx)),
        ];
        let reader = tokio::spawn(collect_output(stdout, settings.timeslice, chunks));
        let stderr = log_stderr(&mut child, "encoder");

        Ok(Box::new(FfmpegSession {
            child,
            stop_tx,
            writers,
            reader,
            stderr,
        }))
    }
}

struct FfmpegSession {
    child: Child,
    stop_tx: watch::Sender<bool>,
    writers: Vec<JoinHandle<()>>,
    reader: JoinHandle<()>,
    stderr: Option<JoinHandle<()>>,
}

#[async_trait]
impl EncodingSession for FfmpegSession {
    async fn finish(self: Box<Self>) -> Result<(), RecordingError> {
        let FfmpegSession {
            mut child,
            stop_tx,
            writers,
            reader,
            stderr,
        } = *self;

        // Closing both inputs lets ffmpeg flush and exit.
        let _ = stop_tx.send(true);
        for writer in writers {
            let _ = writer.await;
        }

        let status = match tokio::time::timeout(EXIT_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => return Err(RecordingError::Encoder(format!("encoder wait failed: {e}"))),
            Err(_) => {
                let _ = child.kill().await;
                reader.abort();
                return Err(RecordingError::Encoder("encoder did not exit".into()));
            }
        };
        reader
            .await
            .map_err(|e| RecordingError::Encoder(format!("output reader failed: {e}")))?;
        if let Some(stderr) = stderr {
            let _ = stderr.await;
        }

        if !status.success() {
            return Err(RecordingError::Encoder(format!("encoder exited with {status}")));
        }
        Ok(())
    }
}

/// Platform camera input arguments.
pub fn camera_input_args(os: &str, device: Option<&str>) -> Vec<String> {
    let size = "1280x720".to_string();
    let rate = CAMERA_FPS.to_string();
    match os {
        "macos" => vec![
            "-f".into(),
            "avfoundation".into(),
            "-framerate".into(),
            rate,
            "-video_size".into(),
            size,
            "-i".into(),
            device.unwrap_or("0").to_string(),
        ],
        "windows" => vec![
            "-f".into(),
            "dshow".into(),
            "-framerate".into(),
            rate,
            "-i".into(),
            format!("video={}", device.unwrap_or("Integrated Camera")),
        ],
        _ => vec![
            "-f".into(),
            "v4l2".into(),
            "-framerate".into(),
            rate,
            "-video_size".into(),
            size,
            "-i".into(),
            device.unwrap_or("/dev/video0").to_string(),
        ],
    }
}

/// Reads fixed-size RGBA frames and publishes each into `slot`.
pub async fn read_frames<R: AsyncRead + Unpin>(
    mut input: R,
    width: u32,
    height: u32,
    slot: Arc<FrameSlot>,
) {
    let mut buf = vec![0u8; (width * height * 4) as usize];
    loop {
        if let Err(e) = input.read_exact(&mut buf).await {
            tracing::info!("camera feed ended: {}", e);
            break;
        }
        match RgbaImage::from_raw(width, height, buf.clone()) {
            Some(frame) => slot.publish(Arc::new(frame)),
            None => break,
        }
    }
    slot.clear();
}

/// The local camera, decoded by an ffmpeg subprocess.
pub struct FfmpegCamera {
    slot: Arc<FrameSlot>,
    _child: Child,
    reader: JoinHandle<()>,
    stderr: Option<JoinHandle<()>>,
}

impl FfmpegCamera {
    pub fn open(binary: &str, device: Option<&str>) -> anyhow::Result<Self> {
        let mut args = vec!["-hide_banner".to_string(), "-loglevel".into(), "error".into()];
        args.extend(camera_input_args(std::env::consts::OS, device));
        args.extend([
            "-vf".into(),
            format!("scale={CAMERA_WIDTH}:{CAMERA_HEIGHT}"),
            "-pix_fmt".into(),
            "rgba".into(),
            "-f".into(),
            "rawvideo".into(),
            "pipe:1".into(),
        ]);

        let mut child = Command::new(binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to start {binary} for the camera"))?;
        let stdout = child.stdout.take().context("camera stdout unavailable")?;

        let slot = FrameSlot::new();
        let reader = tokio::spawn(read_frames(
            stdout,
            CAMERA_WIDTH,
            CAMERA_HEIGHT,
            slot.clone(),
        ));
        let stderr = log_stderr(&mut child, "camera");
        tracing::info!("camera capture started");
        Ok(Self {
            slot,
            _child: child,
            reader,
            stderr,
        })
    }

    pub fn source(&self) -> Arc<dyn VideoSource> {
        self.slot.clone()
    }
}

impl Drop for FfmpegCamera {
    fn drop(&mut self) {
        self.reader.abort();
        if let Some(stderr) = &self.stderr {
            stderr.abort();
        }
    }
}
