//! Speech featurizer configuration

use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Feature transform applied to each audio frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FeatureType {
    /// Log-mel filterbank energies
    #[default]
    Logfbank,
    /// Log power spectrogram (no mel warping)
    Spectrogram,
    /// MFCC - accepted by the schema but not implemented
    Mfcc,
}

/// Speech featurizer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeechConfig {
    /// Audio sample rate in Hz
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    /// Frame window length in milliseconds
    #[serde(default = "default_frame_ms")]
    pub frame_ms: u32,

    /// Frame hop in milliseconds
    #[serde(default = "default_stride_ms")]
    pub stride_ms: u32,

    /// Number of frequency bins per frame
    #[serde(default = "default_num_feature_bins")]
    pub num_feature_bins: usize,

    /// Frame transform
    #[serde(default)]
    pub feature_type: FeatureType,

    /// Pre-emphasis coefficient; 0.0 disables the filter
    #[serde(default = "default_preemphasis")]
    pub preemphasis: f32,

    /// Scale the signal to unit peak before framing
    #[serde(default = "default_true")]
    pub normalize_signal: bool,

    /// Mean/variance normalize the extracted features
    #[serde(default = "default_true")]
    pub normalize_feature: bool,

    /// Normalize per frequency bin instead of over the whole utterance
    #[serde(default)]
    pub normalize_per_feature: bool,

    /// Append a first-order delta channel
    #[serde(default)]
    pub delta: bool,

    /// Append a second-order delta channel
    #[serde(default)]
    pub delta_delta: bool,
}

fn default_sample_rate() -> u32 {
    16000
}
fn default_frame_ms() -> u32 {
    25
}
fn default_stride_ms() -> u32 {
    10
}
fn default_num_feature_bins() -> usize {
    80
}
fn default_preemphasis() -> f32 {
    0.97
}
fn default_true() -> bool {
    true
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            frame_ms: default_frame_ms(),
            stride_ms: default_stride_ms(),
            num_feature_bins: default_num_feature_bins(),
            feature_type: FeatureType::default(),
            preemphasis: default_preemphasis(),
            normalize_signal: true,
            normalize_feature: true,
            normalize_per_feature: false,
            delta: false,
            delta_delta: false,
        }
    }
}

impl SpeechConfig {
    /// Window length in samples
    pub fn frame_length(&self) -> usize {
        (self.sample_rate as usize * self.frame_ms as usize) / 1000
    }

    /// Hop length in samples
    pub fn frame_step(&self) -> usize {
        (self.sample_rate as usize * self.stride_ms as usize) / 1000
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_rate == 0 {
            return Err(ConfigError::InvalidValue {
                field: "speech_config.sample_rate".to_string(),
                message: "Sample rate cannot be 0".to_string(),
            });
        }
        if self.stride_ms == 0 || self.frame_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "speech_config.frame_ms".to_string(),
                message: "Frame and stride must be positive".to_string(),
            });
        }
        if self.stride_ms > self.frame_ms {
            return Err(ConfigError::InvalidValue {
                field: "speech_config.stride_ms".to_string(),
                message: format!(
                    "Stride ({}ms) cannot exceed frame length ({}ms)",
                    self.stride_ms, self.frame_ms
                ),
            });
        }
        if self.num_feature_bins == 0 {
            return Err(ConfigError::InvalidValue {
                field: "speech_config.num_feature_bins".to_string(),
                message: "Must be at least 1".to_string(),
            });
        }
        if self.feature_type == FeatureType::Mfcc {
            return Err(ConfigError::InvalidValue {
                field: "speech_config.feature_type".to_string(),
                message: "mfcc is not implemented; use logfbank or spectrogram".to_string(),
            });
        }
        if !(0.0..1.0).contains(&self.preemphasis) {
            return Err(ConfigError::InvalidValue {
                field: "speech_config.preemphasis".to_string(),
                message: format!("Must be in [0.0, 1.0), got {}", self.preemphasis),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = SpeechConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.frame_length(), 400);
        assert_eq!(config.frame_step(), 160);
    }

    #[test]
    fn test_mfcc_rejected() {
        let config = SpeechConfig {
            feature_type: FeatureType::Mfcc,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_stride_bound() {
        let config = SpeechConfig {
            frame_ms: 10,
            stride_ms: 25,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
