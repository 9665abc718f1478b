//! DeepSpeech2 architecture configuration

use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// One convolutional subsampling block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvBlockConfig {
    /// Number of output filters
    pub filters: usize,
    /// Kernel size as [time, frequency]
    pub kernel: [usize; 2],
    /// Strides as [time, frequency]
    pub strides: [usize; 2],
}

/// DeepSpeech2 architecture configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Convolutional subsampling stack
    #[serde(default = "default_conv_blocks")]
    pub conv_blocks: Vec<ConvBlockConfig>,

    /// Number of recurrent layers
    #[serde(default = "default_rnn_layers")]
    pub rnn_layers: usize,

    /// Hidden units per recurrent layer (per direction)
    #[serde(default = "default_rnn_units")]
    pub rnn_units: usize,

    /// Run the recurrent stack bidirectionally
    #[serde(default = "default_true")]
    pub rnn_bidirectional: bool,

    /// Apply batch norm to each recurrent layer's output
    #[serde(default)]
    pub rnn_batch_norm: bool,

    /// Units in the fully-connected head; 0 skips the head
    #[serde(default = "default_fc_units")]
    pub fc_units: usize,

    /// Dropout probability applied after the FC head during training
    #[serde(default = "default_dropout")]
    pub dropout: f32,
}

fn default_conv_blocks() -> Vec<ConvBlockConfig> {
    vec![
        ConvBlockConfig {
            filters: 32,
            kernel: [11, 41],
            strides: [2, 2],
        },
        ConvBlockConfig {
            filters: 32,
            kernel: [11, 21],
            strides: [1, 2],
        },
        ConvBlockConfig {
            filters: 96,
            kernel: [11, 11],
            strides: [1, 2],
        },
    ]
}

fn default_rnn_layers() -> usize {
    3
}
fn default_rnn_units() -> usize {
    512
}
fn default_fc_units() -> usize {
    1024
}
fn default_dropout() -> f32 {
    0.2
}
fn default_true() -> bool {
    true
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            conv_blocks: default_conv_blocks(),
            rnn_layers: default_rnn_layers(),
            rnn_units: default_rnn_units(),
            rnn_bidirectional: true,
            rnn_batch_norm: false,
            fc_units: default_fc_units(),
            dropout: default_dropout(),
        }
    }
}

impl ModelConfig {
    /// Factor by which the conv stack shortens the time axis
    pub fn time_reduction_factor(&self) -> usize {
        self.conv_blocks.iter().map(|b| b.strides[0]).product()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.conv_blocks.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "model_config.conv_blocks".to_string(),
                message: "At least one conv block is required".to_string(),
            });
        }
        for (i, block) in self.conv_blocks.iter().enumerate() {
            if block.filters == 0 || block.kernel.contains(&0) || block.strides.contains(&0) {
                return Err(ConfigError::InvalidValue {
                    field: format!("model_config.conv_blocks[{}]", i),
                    message: "filters, kernel and strides must be positive".to_string(),
                });
            }
        }
        if self.rnn_layers == 0 || self.rnn_units == 0 {
            return Err(ConfigError::InvalidValue {
                field: "model_config.rnn_layers".to_string(),
                message: "The recurrent stack cannot be empty".to_string(),
            });
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(ConfigError::InvalidValue {
                field: "model_config.dropout".to_string(),
                message: format!("Must be in [0.0, 1.0), got {}", self.dropout),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_time_reduction() {
        let config = ModelConfig::default();
        assert!(config.validate().is_ok());
        // Strides 2, 1, 1 on the time axis
        assert_eq!(config.time_reduction_factor(), 2);
    }

    #[test]
    fn test_empty_conv_rejected() {
        let config = ModelConfig {
            conv_blocks: Vec::new(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
