//! Training toolkit: datasets, checkpoints, the CTC trainer and export

pub mod checkpoint;
pub mod dataset;
pub mod export;
pub mod trainer;

pub use checkpoint::CheckpointManager;
pub use dataset::{Batch, SpeechDataset, Utterance};
pub use export::{export_model, read_manifest, ExportManifest};
pub use trainer::{PrecisionPolicy, TrainSession};
