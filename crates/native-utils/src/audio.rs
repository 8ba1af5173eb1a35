use base64::Engine;
use ringbuf::HeapRb;
use rubato::{FastFixedIn, PolynomialDegree, Resampler};

/// Sample rate the realtime transcription endpoint expects.
pub const REALTIME_API_PCM16_SAMPLE_RATE: f64 = 24000.0;

/// Creates a resampler to convert between audio sample rates.
pub fn create_resampler(
    in_sampling_rate: f64,
    out_sampling_rate: f64,
    chunk_size: usize,
) -> anyhow::Result<FastFixedIn<f32>> {
    let resampler = FastFixedIn::<f32>::new(
        out_sampling_rate / in_sampling_rate,
        1.0,
        PolynomialDegree::Cubic,
        chunk_size,
        1,
    )?;
    Ok(resampler)
}

/// Creates a new ring buffer on the heap for shared audio data.
pub fn shared_buffer(size: usize) -> HeapRb<f32> {
    HeapRb::new(size)
}

/// Averages interleaved frames down to one channel.
pub fn downmix(data: &[f32], channels: usize) -> Vec<f32> {
    if channels > 1 {
        data.chunks(channels)
            .map(|c| c.iter().sum::<f32>() / channels as f32)
            .collect()
    } else {
        data.to_vec()
    }
}

/// Encodes f32 samples as base64 PCM16.
pub fn encode_f32(pcm32: &[f32]) -> String {
    let pcm16: Vec<u8> = pcm32.to_binary();
    base64::engine::general_purpose::STANDARD.encode(&pcm16)
}

/// Little-endian byte representation of a sample slice.
pub trait ToBinary {
    fn to_binary(&self) -> Vec<u8>;
}

impl ToBinary for [i16] {
    fn to_binary(&self) -> Vec<u8> {
        self.iter().flat_map(|&sample| sample.to_le_bytes()).collect()
    }
}

impl ToBinary for [f32] {
    /// Quantizes to PCM16.
    fn to_binary(&self) -> Vec<u8> {
        self.iter()
            .flat_map(|&sample| {
                let v = (sample * 32768.0).clamp(i16::MIN as f32, i16::MAX as f32) as i16;
                v.to_le_bytes()
            })
            .collect()
    }
}

/// Buffers mono capture audio, resamples it to the realtime rate in fixed
/// chunks and yields base64 PCM16 payloads.
pub struct Pcm16Encoder {
    resampler: FastFixedIn<f32>,
    pending: Vec<f32>,
    chunk_size: usize,
}

impl Pcm16Encoder {
    pub fn new(input_sample_rate: f64, chunk_size: usize) -> anyhow::Result<Self> {
        Ok(Self {
            resampler: create_resampler(
                input_sample_rate,
                REALTIME_API_PCM16_SAMPLE_RATE,
                chunk_size,
            )?,
            pending: Vec::with_capacity(chunk_size * 2),
            chunk_size,
        })
    }

    /// Returns a payload once at least one full chunk has accumulated.
    pub fn push(&mut self, samples: &[f32]) -> Option<String> {
        self.pending.extend_from_slice(samples);
        let mut resampled: Vec<f32> = Vec::new();
        while self.pending.len() >= self.chunk_size {
            let chunk: Vec<f32> = self.pending.drain(..self.chunk_size).collect();
            match self.resampler.process(&[chunk.as_slice()], None) {
                Ok(out) => {
                    if let Some(channel) = out.first() {
                        resampled.extend_from_slice(channel);
                    }
                }
                Err(e) => tracing::warn!("failed to resample capture chunk: {}", e),
            }
        }
        (!resampled.is_empty()).then(|| encode_f32(&resampled))
    }

    /// Drops buffered audio, e.g. when listening is paused.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.resampler.reset();
    }
}
