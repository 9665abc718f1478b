//! WAV loading and resampling
//!
//! All audio is handled as mono f32 in [-1.0, 1.0]. Multi-channel files are
//! averaged down to mono; anything not at the target sample rate is resampled
//! with Rubato's FFT resampler (linear interpolation for very short clips).

use std::path::Path;

use crate::error::{Error, Result};

/// Read a WAV file as mono f32 samples at `target_rate` Hz.
pub fn read_raw_audio(path: impl AsRef<Path>, target_rate: u32) -> Result<Vec<f32>> {
    let path = path.as_ref();
    let mut reader = hound::WavReader::open(path)?;
    let spec = reader.spec();

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<_, _>>()?,
        hound::SampleFormat::Int => {
            let max = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / max))
                .collect::<std::result::Result<_, _>>()?
        }
    };

    let mono = if spec.channels > 1 {
        to_mono(&samples, spec.channels as usize)
    } else {
        samples
    };

    if spec.sample_rate == target_rate {
        return Ok(mono);
    }

    tracing::debug!(
        path = %path.display(),
        from = spec.sample_rate,
        to = target_rate,
        "Resampling audio"
    );
    resample(&mono, spec.sample_rate, target_rate)
}

/// Average interleaved channels down to mono.
fn to_mono(samples: &[f32], channels: usize) -> Vec<f32> {
    samples
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Resample mono audio from `from_rate` to `to_rate`.
///
/// Uses Rubato's `FftFixedIn` fed in fixed-size chunks. Clips shorter than
/// one chunk fall back to linear interpolation, which Rubato cannot handle.
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    use rubato::{FftFixedIn, Resampler};

    if from_rate == to_rate {
        return Ok(samples.to_vec());
    }

    const CHUNK: usize = 1024;
    if samples.len() < CHUNK {
        return Ok(resample_linear(samples, from_rate, to_rate));
    }

    let mut resampler = FftFixedIn::<f64>::new(from_rate as usize, to_rate as usize, CHUNK, 2, 1)
        .map_err(|e| Error::Resample(e.to_string()))?;

    let expected = (samples.len() as f64 * to_rate as f64 / from_rate as f64).round() as usize;
    let delay = resampler.output_delay();

    let mut output = Vec::with_capacity(expected + delay);
    let mut input = vec![vec![0.0f64; CHUNK]];

    for chunk in samples.chunks(CHUNK) {
        for (dst, &src) in input[0].iter_mut().zip(chunk.iter()) {
            *dst = src as f64;
        }
        // Zero-pad the final partial chunk
        for dst in input[0].iter_mut().skip(chunk.len()) {
            *dst = 0.0;
        }
        let frames = resampler
            .process(&input, None)
            .map_err(|e| Error::Resample(e.to_string()))?;
        output.extend(frames[0].iter().map(|&s| s as f32));
    }

    // Flush the resampler's internal latency with silence so the signal tail
    // makes it out, then drop the leading delay and trim to the ideal length
    let silence = vec![vec![0.0f64; CHUNK]];
    while output.len() < delay + expected {
        let frames = resampler
            .process(&silence, None)
            .map_err(|e| Error::Resample(e.to_string()))?;
        output.extend(frames[0].iter().map(|&s| s as f32));
    }

    Ok(output[delay..delay + expected].to_vec())
}

/// Linear interpolation fallback for clips too short for the FFT resampler.
fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if samples.is_empty() {
        return Vec::new();
    }
    let ratio = to_rate as f64 / from_rate as f64;
    let new_len = (samples.len() as f64 * ratio) as usize;

    let mut resampled = Vec::with_capacity(new_len);
    for i in 0..new_len {
        let src_idx = i as f64 / ratio;
        let idx_floor = src_idx.floor() as usize;
        let idx_ceil = (idx_floor + 1).min(samples.len() - 1);
        let frac = (src_idx - idx_floor as f64) as f32;
        resampled.push(samples[idx_floor] * (1.0 - frac) + samples[idx_ceil] * frac);
    }
    resampled
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_wav(path: &Path, rate: u32, samples: &[f32]) {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for &s in samples {
            writer.write_sample((s * 32767.0) as i16).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn test_read_wav_same_rate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        let samples: Vec<f32> = (0..800).map(|i| (i as f32 * 0.05).sin() * 0.5).collect();
        write_wav(&path, 16000, &samples);

        let loaded = read_raw_audio(&path, 16000).unwrap();
        assert_eq!(loaded.len(), 800);
        // 16-bit quantization error only
        assert!((loaded[100] - samples[100]).abs() < 1e-3);
    }

    #[test]
    fn test_resample_halves_length() {
        let samples: Vec<f32> = (0..8000).map(|i| (i as f32 * 0.01).sin()).collect();
        let out = resample(&samples, 16000, 8000).unwrap();
        assert_eq!(out.len(), samples.len() / 2);
        // The flush keeps the signal tail; the final samples are not silence
        let tail_energy: f32 = out[out.len() - 200..].iter().map(|s| s * s).sum();
        assert!(tail_energy > 1.0, "tail energy {tail_energy}");
    }

    #[test]
    fn test_resample_short_clip_uses_linear() {
        let samples = vec![0.0f32; 100];
        let out = resample(&samples, 8000, 16000).unwrap();
        assert_eq!(out.len(), 200);
    }

    #[test]
    fn test_to_mono_averages() {
        let stereo = vec![1.0, 0.0, 0.5, 0.5];
        assert_eq!(to_mono(&stereo, 2), vec![0.5, 0.5]);
    }
}
