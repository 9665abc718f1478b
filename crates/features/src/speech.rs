//! Speech featurizer
//!
//! Converts a raw mono signal into a `[time, frequency_bins, channels]`
//! feature tensor using sliding-window FFT. Supports log-mel filterbank and
//! log power spectrogram transforms, optional pre-emphasis, delta channels
//! and mean/variance normalization. Deterministic for identical input and
//! configuration.

use std::sync::Arc;

use ndarray::{Array2, Array3};
use parking_lot::Mutex;
use realfft::num_complex::Complex;
use realfft::{RealFftPlanner, RealToComplex};

use ctc_asr_config::{FeatureType, SpeechConfig};
use ctc_asr_core::{Error, Result};

/// Speech featurizer with a reusable FFT plan.
///
/// `extract` takes `&self`; the FFT scratch buffers live behind a mutex so a
/// single featurizer can be shared across dataset workers.
pub struct SpeechFeaturizer {
    config: SpeechConfig,
    frame_length: usize,
    frame_step: usize,
    n_fft: usize,
    hann_window: Vec<f32>,
    mel_filters: Vec<Vec<f32>>,
    fft: Arc<dyn RealToComplex<f32>>,
    scratch: Mutex<Scratch>,
}

struct Scratch {
    windowed: Vec<f32>,
    spectrum: Vec<Complex<f32>>,
}

impl SpeechFeaturizer {
    pub fn new(config: &SpeechConfig) -> Self {
        let frame_length = config.frame_length();
        let frame_step = config.frame_step();
        let n_fft = frame_length.next_power_of_two();

        // Periodic Hann window over the frame length, zero-padded to n_fft
        let hann_window: Vec<f32> = (0..frame_length)
            .map(|i| {
                let x = 2.0 * std::f32::consts::PI * i as f32 / frame_length as f32;
                0.5 * (1.0 - x.cos())
            })
            .collect();

        let mel_filters = create_mel_filters(
            config.sample_rate as usize,
            n_fft,
            config.num_feature_bins,
        );

        let mut planner = RealFftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(n_fft);

        let n_bins = n_fft / 2 + 1;
        Self {
            config: config.clone(),
            frame_length,
            frame_step,
            n_fft,
            hann_window,
            mel_filters,
            fft,
            scratch: Mutex::new(Scratch {
                windowed: vec![0.0; n_fft],
                spectrum: vec![Complex::new(0.0, 0.0); n_bins],
            }),
        }
    }

    /// Feature shape as `(frequency_bins, channels)`, a pure function of the
    /// configuration. Matches the dimensions `extract` produces.
    pub fn compute_feature_dim(&self) -> (usize, usize) {
        let channels =
            1 + self.config.delta as usize + self.config.delta_delta as usize;
        (self.config.num_feature_bins, channels)
    }

    /// Number of frames `extract` produces for a signal of `samples` samples
    pub fn num_frames(&self, samples: usize) -> usize {
        if samples < self.frame_length {
            0
        } else {
            1 + (samples - self.frame_length) / self.frame_step
        }
    }

    /// Extract a `[time, frequency_bins, channels]` feature tensor.
    pub fn extract(&self, signal: &[f32]) -> Result<Array3<f32>> {
        let n_frames = self.num_frames(signal.len());
        if n_frames == 0 {
            return Err(Error::Feature(format!(
                "signal too short: {} samples, need at least {}",
                signal.len(),
                self.frame_length
            )));
        }

        let mut signal = signal.to_vec();
        if self.config.normalize_signal {
            normalize_signal(&mut signal);
        }
        if self.config.preemphasis > 0.0 {
            preemphasis(&mut signal, self.config.preemphasis);
        }

        let (n_bins, channels) = self.compute_feature_dim();
        let base = self.frame_transform(&signal, n_frames, n_bins)?;

        let mut features = Array3::<f32>::zeros((n_frames, n_bins, channels));
        features.slice_mut(ndarray::s![.., .., 0]).assign(&base);
        if self.config.delta {
            let delta = compute_delta(&base);
            features.slice_mut(ndarray::s![.., .., 1]).assign(&delta);
            if self.config.delta_delta {
                let delta2 = compute_delta(&delta);
                features.slice_mut(ndarray::s![.., .., 2]).assign(&delta2);
            }
        } else if self.config.delta_delta {
            // delta_delta without delta still occupies channel 1
            let delta2 = compute_delta(&compute_delta(&base));
            features.slice_mut(ndarray::s![.., .., 1]).assign(&delta2);
        }

        if self.config.normalize_feature {
            if self.config.normalize_per_feature {
                normalize_per_feature(&mut features);
            } else {
                normalize_global(&mut features);
            }
        }

        Ok(features)
    }

    /// Windowed FFT over all frames, producing the base `[time, bins]` matrix
    fn frame_transform(
        &self,
        signal: &[f32],
        n_frames: usize,
        n_bins: usize,
    ) -> Result<Array2<f32>> {
        if self.config.feature_type == FeatureType::Spectrogram
            && n_bins > self.n_fft / 2 + 1
        {
            return Err(Error::Feature(format!(
                "num_feature_bins {} exceeds {} FFT bins",
                n_bins,
                self.n_fft / 2 + 1
            )));
        }

        let mut out = Array2::<f32>::zeros((n_frames, n_bins));
        let mut scratch = self.scratch.lock();

        for frame_idx in 0..n_frames {
            let start = frame_idx * self.frame_step;

            let Scratch { windowed, spectrum } = &mut *scratch;
            for (i, w) in windowed.iter_mut().enumerate() {
                *w = if i < self.frame_length {
                    signal[start + i] * self.hann_window[i]
                } else {
                    0.0
                };
            }

            self.fft
                .process(windowed, spectrum)
                .map_err(|e| Error::Feature(e.to_string()))?;

            match self.config.feature_type {
                FeatureType::Logfbank => {
                    for (m, filter) in self.mel_filters.iter().enumerate() {
                        let mut energy = 0.0f32;
                        for (j, c) in spectrum.iter().enumerate() {
                            energy += c.norm_sqr() * filter[j];
                        }
                        out[[frame_idx, m]] = (energy + 1e-9).ln();
                    }
                }
                FeatureType::Spectrogram => {
                    for bin in 0..n_bins {
                        out[[frame_idx, bin]] = (spectrum[bin].norm_sqr() + 1e-9).ln();
                    }
                }
                // Rejected at config validation
                FeatureType::Mfcc => {
                    return Err(Error::Feature("mfcc is not implemented".to_string()))
                }
            }
        }

        Ok(out)
    }
}

fn hz_to_mel(hz: f32) -> f32 {
    2595.0 * (1.0 + hz / 700.0).log10()
}

fn mel_to_hz(mel: f32) -> f32 {
    700.0 * (10.0_f32.powf(mel / 2595.0) - 1.0)
}

fn create_mel_filters(sample_rate: usize, n_fft: usize, n_mels: usize) -> Vec<Vec<f32>> {
    let mel_min = hz_to_mel(0.0);
    let mel_max = hz_to_mel(sample_rate as f32 / 2.0);

    let mel_points: Vec<f32> = (0..n_mels + 2)
        .map(|i| mel_min + (mel_max - mel_min) * i as f32 / (n_mels + 1) as f32)
        .collect();
    let bin_points: Vec<usize> = mel_points
        .iter()
        .map(|&m| ((n_fft + 1) as f32 * mel_to_hz(m) / sample_rate as f32).floor() as usize)
        .collect();

    let n_bins = n_fft / 2 + 1;
    let mut filters = vec![vec![0.0f32; n_bins]; n_mels];

    for i in 0..n_mels {
        let start = bin_points[i];
        let center = bin_points[i + 1];
        let end = bin_points[i + 2];

        for j in start..center {
            if center > start && j < n_bins {
                filters[i][j] = (j - start) as f32 / (center - start) as f32;
            }
        }
        for j in center..end {
            if end > center && j < n_bins {
                filters[i][j] = (end - j) as f32 / (end - center) as f32;
            }
        }
    }

    filters
}

/// Scale the signal to unit peak
fn normalize_signal(signal: &mut [f32]) {
    let peak = signal.iter().fold(0.0f32, |m, &s| m.max(s.abs()));
    if peak > 0.0 {
        for s in signal.iter_mut() {
            *s /= peak;
        }
    }
}

/// In-place pre-emphasis filter: y[t] = x[t] - coef * x[t-1]
fn preemphasis(signal: &mut [f32], coef: f32) {
    for i in (1..signal.len()).rev() {
        signal[i] -= coef * signal[i - 1];
    }
}

/// Two-sided delta regression with a window of 2 frames, edge-clamped
fn compute_delta(x: &Array2<f32>) -> Array2<f32> {
    const N: isize = 2;
    let denom: f32 = 2.0 * (1..=N).map(|n| (n * n) as f32).sum::<f32>();
    let (t_len, bins) = x.dim();

    let mut out = Array2::<f32>::zeros((t_len, bins));
    for t in 0..t_len as isize {
        for b in 0..bins {
            let mut acc = 0.0f32;
            for n in 1..=N {
                let fwd = (t + n).clamp(0, t_len as isize - 1) as usize;
                let bwd = (t - n).clamp(0, t_len as isize - 1) as usize;
                acc += n as f32 * (x[[fwd, b]] - x[[bwd, b]]);
            }
            out[[t as usize, b]] = acc / denom;
        }
    }
    out
}

/// Mean/variance normalization over the entire tensor
fn normalize_global(features: &mut Array3<f32>) {
    let n = features.len() as f32;
    if n == 0.0 {
        return;
    }
    let mean = features.sum() / n;
    let var = features.iter().map(|&x| (x - mean) * (x - mean)).sum::<f32>() / n;
    let std = (var + 1e-10).sqrt();
    features.mapv_inplace(|x| (x - mean) / std);
}

/// Mean/variance normalization per (bin, channel) across time
fn normalize_per_feature(features: &mut Array3<f32>) {
    let (t_len, bins, channels) = features.dim();
    if t_len == 0 {
        return;
    }
    for b in 0..bins {
        for c in 0..channels {
            let mut sum = 0.0f32;
            let mut sum_sq = 0.0f32;
            for t in 0..t_len {
                let v = features[[t, b, c]];
                sum += v;
                sum_sq += v * v;
            }
            let mean = sum / t_len as f32;
            let var = sum_sq / t_len as f32 - mean * mean;
            let std = (var + 1e-10).sqrt();
            for t in 0..t_len {
                features[[t, b, c]] = (features[[t, b, c]] - mean) / std;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(len: usize) -> Vec<f32> {
        (0..len).map(|i| (i as f32 * 0.05).sin() * 0.5).collect()
    }

    #[test]
    fn test_feature_dim_matches_extract() {
        let config = SpeechConfig {
            num_feature_bins: 40,
            delta: true,
            delta_delta: true,
            ..Default::default()
        };
        let featurizer = SpeechFeaturizer::new(&config);

        let (bins, channels) = featurizer.compute_feature_dim();
        assert_eq!((bins, channels), (40, 3));
        // Idempotent
        assert_eq!(featurizer.compute_feature_dim(), (40, 3));

        let features = featurizer.extract(&tone(3200)).unwrap();
        let (t_len, f_bins, f_channels) = features.dim();
        assert_eq!((f_bins, f_channels), (bins, channels));
        assert_eq!(t_len, featurizer.num_frames(3200));
    }

    #[test]
    fn test_extract_deterministic() {
        let featurizer = SpeechFeaturizer::new(&SpeechConfig::default());
        let signal = tone(4800);
        let a = featurizer.extract(&signal).unwrap();
        let b = featurizer.extract(&signal).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_short_signal_rejected() {
        let featurizer = SpeechFeaturizer::new(&SpeechConfig::default());
        assert!(featurizer.extract(&tone(100)).is_err());
    }

    #[test]
    fn test_global_normalization_zero_mean() {
        let config = SpeechConfig {
            normalize_feature: true,
            normalize_per_feature: false,
            ..Default::default()
        };
        let featurizer = SpeechFeaturizer::new(&config);
        let features = featurizer.extract(&tone(3200)).unwrap();
        let mean = features.sum() / features.len() as f32;
        assert!(mean.abs() < 1e-3);
    }

    #[test]
    fn test_spectrogram_feature_type() {
        let config = SpeechConfig {
            feature_type: FeatureType::Spectrogram,
            num_feature_bins: 129,
            ..Default::default()
        };
        let featurizer = SpeechFeaturizer::new(&config);
        let features = featurizer.extract(&tone(3200)).unwrap();
        assert_eq!(features.dim().1, 129);
    }

    #[test]
    fn test_hz_mel_round_trip() {
        let hz = 1000.0;
        assert!((mel_to_hz(hz_to_mel(hz)) - hz).abs() < 0.01);
    }
}
