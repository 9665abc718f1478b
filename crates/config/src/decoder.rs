//! Decoder and vocabulary configuration

use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Text featurizer / decoder configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecoderConfig {
    /// Path to the vocabulary file (one token per line)
    pub vocabulary: String,

    /// Beam width for beam-search decoding
    #[serde(default = "default_beam_width")]
    pub beam_width: usize,

    /// Place the CTC blank at index 0 (otherwise at num_classes - 1)
    #[serde(default = "default_true")]
    pub blank_at_zero: bool,

    /// Language-model rescoring configuration
    #[serde(default)]
    pub lm_config: LmConfig,
}

/// Language-model rescoring weights and artifact path.
///
/// `model_path` points at an external binary trie/n-gram file; it is handed
/// opaquely to whatever `ExternalScorer` the embedder attaches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LmConfig {
    /// Path to the language-model artifact, if any
    #[serde(default)]
    pub model_path: Option<String>,

    /// Weight of the language-model log probability
    #[serde(default = "default_alpha")]
    pub alpha: f32,

    /// Word insertion bonus weight
    #[serde(default = "default_beta")]
    pub beta: f32,
}

fn default_beam_width() -> usize {
    100
}
fn default_alpha() -> f32 {
    2.0
}
fn default_beta() -> f32 {
    2.0
}
fn default_true() -> bool {
    true
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            vocabulary: "config/vocabulary.txt".to_string(),
            beam_width: default_beam_width(),
            blank_at_zero: true,
            lm_config: LmConfig::default(),
        }
    }
}

impl Default for LmConfig {
    fn default() -> Self {
        Self {
            model_path: None,
            alpha: default_alpha(),
            beta: default_beta(),
        }
    }
}

impl DecoderConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.vocabulary.is_empty() {
            return Err(ConfigError::MissingField(
                "decoder_config.vocabulary".to_string(),
            ));
        }
        if self.beam_width == 0 {
            return Err(ConfigError::InvalidValue {
                field: "decoder_config.beam_width".to_string(),
                message: "Must be at least 1".to_string(),
            });
        }
        if !self.lm_config.alpha.is_finite() || !self.lm_config.beta.is_finite() {
            return Err(ConfigError::InvalidValue {
                field: "decoder_config.lm_config".to_string(),
                message: "alpha and beta must be finite".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DecoderConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.beam_width, 100);
        assert!(config.blank_at_zero);
        assert!(config.lm_config.model_path.is_none());
    }

    #[test]
    fn test_zero_beam_rejected() {
        let config = DecoderConfig {
            beam_width: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
