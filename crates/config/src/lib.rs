//! Configuration management for the CTC ASR toolkit
//!
//! Supports loading configuration from:
//! - A default YAML file plus an optional user override file (override wins)
//! - Environment variables (CTC_ASR prefix)
//!
//! The merged configuration is deserialized into a strongly-typed `Settings`
//! struct and validated eagerly at load; it is immutable afterwards.

pub mod decoder;
pub mod learning;
pub mod model;
pub mod speech;
pub mod settings;

pub use decoder::{DecoderConfig, LmConfig};
pub use learning::{
    AugmentationConfig, DatasetConfig, LearningConfig, OptimizerConfig, RunningConfig,
};
pub use model::{ConvBlockConfig, ModelConfig};
pub use settings::{load_settings, ObservabilityConfig, Settings};
pub use speech::{FeatureType, SpeechConfig};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

impl From<config::ConfigError> for ConfigError {
    fn from(err: config::ConfigError) -> Self {
        ConfigError::ParseError(err.to_string())
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        ConfigError::ParseError(err.to_string())
    }
}
