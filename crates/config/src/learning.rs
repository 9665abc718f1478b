//! Training configuration: dataset, optimizer, running and augmentations

use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Training configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct LearningConfig {
    /// Dataset configuration
    #[serde(default, rename = "dataset_config")]
    pub dataset: DatasetConfig,

    /// Optimizer configuration
    #[serde(default, rename = "optimizer_config")]
    pub optimizer: OptimizerConfig,

    /// Running configuration (epochs, batching, checkpoints)
    #[serde(default, rename = "running_config")]
    pub running: RunningConfig,

    /// Training-time augmentations
    #[serde(default)]
    pub augmentations: AugmentationConfig,
}

impl LearningConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.optimizer.validate()?;
        self.running.validate()?;
        Ok(())
    }
}

/// Dataset configuration.
///
/// Paths are transcript list files: one `audio_path<TAB>transcript` entry per
/// line, `#` lines ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// Training transcript lists
    #[serde(default)]
    pub train_paths: Vec<String>,

    /// Evaluation transcript lists
    #[serde(default)]
    pub eval_paths: Vec<String>,

    /// Drop utterances longer than this many seconds; 0 disables the filter
    #[serde(default = "default_max_duration")]
    pub max_duration_s: f32,

    /// Shuffle the training set each epoch
    #[serde(default = "default_true")]
    pub shuffle: bool,
}

/// Optimizer (AdamW) configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,

    #[serde(default = "default_beta1")]
    pub beta1: f64,

    #[serde(default = "default_beta2")]
    pub beta2: f64,

    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,

    #[serde(default = "default_epsilon")]
    pub epsilon: f64,
}

/// Running configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunningConfig {
    /// Training batch size
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Number of training epochs
    #[serde(default = "default_num_epochs")]
    pub num_epochs: usize,

    /// Directory for checkpoint files
    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: String,

    /// Maximum number of checkpoints retained on disk
    #[serde(default = "default_max_ckpts")]
    pub max_ckpts: usize,

    /// Eval batch size = batch_size * eval_train_ratio
    #[serde(default = "default_eval_train_ratio")]
    pub eval_train_ratio: usize,

    /// Log the step loss every this many steps
    #[serde(default = "default_log_interval")]
    pub log_interval: usize,
}

/// Training-time augmentations applied to features
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AugmentationConfig {
    /// Standard deviation of Gaussian noise added to features; 0 disables
    #[serde(default)]
    pub noise_std: f32,
}

fn default_max_duration() -> f32 {
    20.0
}
fn default_learning_rate() -> f64 {
    1e-4
}
fn default_beta1() -> f64 {
    0.9
}
fn default_beta2() -> f64 {
    0.999
}
fn default_weight_decay() -> f64 {
    1e-6
}
fn default_epsilon() -> f64 {
    1e-8
}
fn default_batch_size() -> usize {
    8
}
fn default_num_epochs() -> usize {
    20
}
fn default_checkpoint_dir() -> String {
    "checkpoints".to_string()
}
fn default_max_ckpts() -> usize {
    10
}
fn default_eval_train_ratio() -> usize {
    1
}
fn default_log_interval() -> usize {
    10
}
fn default_true() -> bool {
    true
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            train_paths: Vec::new(),
            eval_paths: Vec::new(),
            max_duration_s: default_max_duration(),
            shuffle: true,
        }
    }
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: default_learning_rate(),
            beta1: default_beta1(),
            beta2: default_beta2(),
            weight_decay: default_weight_decay(),
            epsilon: default_epsilon(),
        }
    }
}

impl Default for RunningConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            num_epochs: default_num_epochs(),
            checkpoint_dir: default_checkpoint_dir(),
            max_ckpts: default_max_ckpts(),
            eval_train_ratio: default_eval_train_ratio(),
            log_interval: default_log_interval(),
        }
    }
}

impl Default for AugmentationConfig {
    fn default() -> Self {
        Self { noise_std: 0.0 }
    }
}

impl OptimizerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.learning_rate <= 0.0 {
            return Err(ConfigError::InvalidValue {
                field: "learning_config.optimizer_config.learning_rate".to_string(),
                message: format!("Must be positive, got {}", self.learning_rate),
            });
        }
        for (field, value) in [("beta1", self.beta1), ("beta2", self.beta2)] {
            if !(0.0..1.0).contains(&value) {
                return Err(ConfigError::InvalidValue {
                    field: format!("learning_config.optimizer_config.{}", field),
                    message: format!("Must be in [0.0, 1.0), got {}", value),
                });
            }
        }
        Ok(())
    }
}

impl RunningConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "learning_config.running_config.batch_size".to_string(),
                message: "Must be at least 1".to_string(),
            });
        }
        if self.max_ckpts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "learning_config.running_config.max_ckpts".to_string(),
                message: "Must retain at least one checkpoint".to_string(),
            });
        }
        if self.eval_train_ratio == 0 {
            return Err(ConfigError::InvalidValue {
                field: "learning_config.running_config.eval_train_ratio".to_string(),
                message: "Must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_valid() {
        assert!(LearningConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_batch_rejected() {
        let mut config = LearningConfig::default();
        config.running.batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_learning_rate_rejected() {
        let mut config = LearningConfig::default();
        config.optimizer.learning_rate = 0.0;
        assert!(config.validate().is_err());
    }
}
