//! Trained-model export
//!
//! Weights-only export writes the safetensors file alone; a full export
//! adds a JSON manifest next to it carrying the architecture, feature
//! dimensions and class count, so inference can rebuild the model without
//! the training configuration.

use std::path::Path;

use candle_nn::VarMap;
use serde::{Deserialize, Serialize};

use ctc_asr_config::ModelConfig;
use ctc_asr_core::{Error, Result};
use ctc_asr_model::DeepSpeech2;

/// Architecture sidecar written next to the exported weights
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportManifest {
    pub model_config: ModelConfig,
    pub feature_dim: [usize; 2],
    pub num_classes: usize,
}

impl ExportManifest {
    pub fn for_model(model: &DeepSpeech2) -> Self {
        let (bins, channels) = model.feature_dim();
        Self {
            model_config: model.config().clone(),
            feature_dim: [bins, channels],
            num_classes: model.num_classes(),
        }
    }
}

fn manifest_path(weights: &Path) -> std::path::PathBuf {
    weights.with_extension("json")
}

/// Export `model`'s weights to `path`; with `weights_only` unset, also
/// write the JSON manifest beside them.
pub fn export_model(
    varmap: &VarMap,
    model: &DeepSpeech2,
    path: &Path,
    weights_only: bool,
) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    varmap.save(path)?;
    tracing::info!(path = %path.display(), "Exported weights");

    if !weights_only {
        let manifest = ExportManifest::for_model(model);
        let sidecar = manifest_path(path);
        let json = serde_json::to_string_pretty(&manifest)
            .map_err(|e| Error::Checkpoint(format!("manifest serialization: {e}")))?;
        std::fs::write(&sidecar, json)?;
        tracing::info!(path = %sidecar.display(), "Exported model manifest");
    }
    Ok(())
}

/// Read the manifest written by a full export
pub fn read_manifest(weights: &Path) -> Result<ExportManifest> {
    let sidecar = manifest_path(weights);
    let contents = std::fs::read_to_string(&sidecar)?;
    serde_json::from_str(&contents)
        .map_err(|e| Error::Checkpoint(format!("manifest {}: {e}", sidecar.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarBuilder;
    use ctc_asr_config::ConvBlockConfig;

    fn tiny_model(varmap: &VarMap) -> DeepSpeech2 {
        let config = ModelConfig {
            conv_blocks: vec![ConvBlockConfig {
                filters: 2,
                kernel: [3, 3],
                strides: [2, 2],
            }],
            rnn_layers: 1,
            rnn_units: 4,
            rnn_bidirectional: false,
            rnn_batch_norm: false,
            fc_units: 0,
            dropout: 0.0,
        };
        let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
        DeepSpeech2::new(&config, (8, 1), 4, vb).unwrap()
    }

    #[test]
    fn test_full_export_writes_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let varmap = VarMap::new();
        let model = tiny_model(&varmap);
        let path = dir.path().join("model.safetensors");

        export_model(&varmap, &model, &path, false).unwrap();
        assert!(path.is_file());

        let manifest = read_manifest(&path).unwrap();
        assert_eq!(manifest.num_classes, 4);
        assert_eq!(manifest.feature_dim, [8, 1]);
        assert_eq!(manifest.model_config.rnn_units, 4);
    }

    #[test]
    fn test_weights_only_skips_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let varmap = VarMap::new();
        let model = tiny_model(&varmap);
        let path = dir.path().join("weights.safetensors");

        export_model(&varmap, &model, &path, true).unwrap();
        assert!(path.is_file());
        assert!(!dir.path().join("weights.json").exists());
        assert!(read_manifest(&path).is_err());
    }
}
