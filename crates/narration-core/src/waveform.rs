//! Waveform extraction for visualization.
//!
//! Decoded audio is reduced to a fixed number of peak buckets and normalized
//! into `[0, 1]`. Decoding is delegated to a [`SampleDecoder`] so the
//! reduction itself stays independent of any audio format.

use crate::error::{Error, Result};
use rodio::{Decoder, Source};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_BUCKETS: usize = 500;

/// Normalized peaks plus the duration of the audio they summarize.
#[derive(Debug, Clone, PartialEq)]
pub struct Waveform {
    pub samples: Vec<f32>,
    pub duration: Duration,
}

/// Mono samples in `[-1, 1]` as produced by a decoder.
#[derive(Debug, Clone)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl DecodedAudio {
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }
}

pub trait SampleDecoder: Send + Sync {
    fn decode_mono(&self, path: &Path) -> Result<DecodedAudio>;
}

/// Decodes WAV with `hound` and everything else through `rodio`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileDecoder;

impl SampleDecoder for FileDecoder {
    fn decode_mono(&self, path: &Path) -> Result<DecodedAudio> {
        let is_wav = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("wav"))
            .unwrap_or(false);
        if is_wav {
            match decode_wav(path) {
                Ok(decoded) => return Ok(decoded),
                Err(err) => {
                    debug!(path = %path.display(), "hound could not read WAV, retrying with rodio: {err}");
                }
            }
        }
        decode_with_rodio(path)
    }
}

fn decode_wav(path: &Path) -> Result<DecodedAudio> {
    let reader =
        hound::WavReader::open(path).map_err(|err| Error::UnreadableResource(err.to_string()))?;
    let spec = reader.spec();
    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<Result<_, _>>()
            .map_err(|err| Error::UnreadableResource(err.to_string()))?,
        hound::SampleFormat::Int => {
            let scale = (1_i64 << spec.bits_per_sample.saturating_sub(1).min(31)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()
                .map_err(|err| Error::UnreadableResource(err.to_string()))?
        }
    };
    Ok(DecodedAudio {
        samples: mix_to_mono(&interleaved, spec.channels),
        sample_rate: spec.sample_rate,
    })
}

fn decode_with_rodio(path: &Path) -> Result<DecodedAudio> {
    let file = File::open(path).map_err(|err| Error::UnreadableResource(err.to_string()))?;
    let decoder = Decoder::new(BufReader::new(file))
        .map_err(|err| Error::UnreadableResource(err.to_string()))?;
    let channels = decoder.channels();
    let sample_rate = decoder.sample_rate();
    let interleaved: Vec<f32> = decoder.convert_samples::<f32>().collect();
    Ok(DecodedAudio {
        samples: mix_to_mono(&interleaved, channels),
        sample_rate,
    })
}

fn mix_to_mono(interleaved: &[f32], channels: u16) -> Vec<f32> {
    let channels = channels.max(1) as usize;
    if channels == 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Peak-per-bucket downsample.
///
/// Inputs no longer than `buckets` are returned unchanged. Otherwise each of
/// the `buckets` contiguous windows of `len / buckets` samples contributes its
/// largest absolute value; samples past `buckets * window` are not scanned.
pub fn downsample_peaks(samples: &[f32], buckets: usize) -> Vec<f32> {
    let buckets = buckets.max(1);
    if samples.len() <= buckets {
        return samples.to_vec();
    }
    let window = samples.len() / buckets;
    (0..buckets)
        .map(|bucket| {
            samples[bucket * window..(bucket + 1) * window]
                .iter()
                .filter(|s| s.is_finite())
                .fold(0.0_f32, |peak, s| peak.max(s.abs()))
        })
        .collect()
}

/// Scale magnitudes by the global peak so every value lands in `[0, 1]`.
/// Silence stays all zeros.
pub fn normalize_peaks(peaks: &[f32]) -> Vec<f32> {
    let magnitudes: Vec<f32> = peaks
        .iter()
        .map(|s| if s.is_finite() { s.abs() } else { 0.0 })
        .collect();
    let max = magnitudes.iter().copied().fold(0.0_f32, f32::max);
    if max <= 0.0 {
        return vec![0.0; magnitudes.len()];
    }
    magnitudes
        .into_iter()
        .map(|s| (s / max).clamp(0.0, 1.0))
        .collect()
}

/// Downsample then normalize. Fails with `EmptyResource` on no samples.
pub fn build_waveform(samples: &[f32], buckets: usize) -> Result<Vec<f32>> {
    if samples.is_empty() {
        return Err(Error::EmptyResource);
    }
    Ok(normalize_peaks(&downsample_peaks(samples, buckets)))
}

pub fn extract_waveform(
    decoder: &dyn SampleDecoder,
    path: &Path,
    buckets: usize,
) -> Result<Waveform> {
    let decoded = decoder.decode_mono(path)?;
    let samples = build_waveform(&decoded.samples, buckets)?;
    info!(
        path = %path.display(),
        frames = decoded.samples.len(),
        buckets = samples.len(),
        "Extracted waveform"
    );
    Ok(Waveform {
        samples,
        duration: decoded.duration(),
    })
}

/// Run extraction on its own thread; the receiver yields exactly one result.
pub fn spawn_waveform_job(path: PathBuf, buckets: usize) -> mpsc::Receiver<Result<Waveform>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let result = extract_waveform(&FileDecoder, &path, buckets);
        if let Err(err) = &result {
            warn!(path = %path.display(), "Waveform extraction failed: {err}");
        }
        let _ = tx.send(result);
    });
    rx
}
