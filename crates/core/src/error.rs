//! Error taxonomy shared across the workspace

use thiserror::Error;

/// Errors raised by featurization, training, checkpointing and decoding.
///
/// Configuration loading has its own error type in `ctc-asr-config`.
#[derive(Error, Debug)]
pub enum Error {
    #[error("data error: {0}")]
    Data(String),

    #[error("feature extraction error: {0}")]
    Feature(String),

    #[error("model build error: {0}")]
    ModelBuild(String),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("audio error: {0}")]
    Audio(#[from] hound::Error),

    #[error("resample error: {0}")]
    Resample(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
