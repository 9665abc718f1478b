//! Merged settings and the layered loader

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::{
    ConfigError, DecoderConfig, LearningConfig, ModelConfig, SpeechConfig,
};

/// Top-level settings, mirroring the YAML schema:
/// `speech_config`, `decoder_config`, `model_config`, `learning_config`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Settings {
    /// Speech featurizer configuration
    #[serde(default, rename = "speech_config")]
    pub speech: SpeechConfig,

    /// Decoder / vocabulary configuration
    #[serde(default, rename = "decoder_config")]
    pub decoder: DecoderConfig,

    /// Acoustic model architecture
    #[serde(default, rename = "model_config")]
    pub model: ModelConfig,

    /// Training configuration
    #[serde(default, rename = "learning_config")]
    pub learning: LearningConfig,

    /// Logging configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level filter when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit JSON-formatted logs
    #[serde(default)]
    pub log_json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_json: false,
        }
    }
}

impl Settings {
    /// Parse settings from a YAML string (no layering, no environment)
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let settings: Settings = serde_yaml::from_str(yaml)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate every section; called eagerly at load
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.speech.validate()?;
        self.decoder.validate()?;
        self.model.validate()?;
        self.learning.validate()?;
        Ok(())
    }
}

/// Load settings from a default file, an optional user override file and the
/// environment.
///
/// Priority (highest to lowest):
/// 1. Environment variables (CTC_ASR prefix, `__` separator)
/// 2. The user override file, when given
/// 3. The default file
///
/// The default file must exist; a missing override file falls back to the
/// defaults silently.
pub fn load_settings(
    default_path: impl AsRef<Path>,
    override_path: Option<&Path>,
) -> Result<Settings, ConfigError> {
    let default_path = default_path.as_ref();
    if !default_path.is_file() {
        return Err(ConfigError::FileNotFound(
            default_path.display().to_string(),
        ));
    }

    let mut builder =
        Config::builder().add_source(File::from(default_path).required(true));

    if let Some(path) = override_path {
        if !path.is_file() {
            tracing::debug!(path = %path.display(), "Override config missing, using defaults");
        }
        builder = builder.add_source(File::from(path).required(false));
    }

    builder = builder.add_source(
        Environment::with_prefix("CTC_ASR")
            .separator("__")
            .try_parsing(true),
    );

    let config = builder.build()?;
    let settings: Settings = config.try_deserialize()?;

    settings.validate()?;

    Ok(settings)
}
