//! Core types for the CTC ASR toolkit
//!
//! This crate provides foundational pieces used across all other crates:
//! - Error taxonomy shared by featurization, training and decoding
//! - Decoded hypothesis types
//! - WAV loading and resampling
//! - The external language-model scorer trait

pub mod audio;
pub mod error;
pub mod scorer;
pub mod types;

pub use audio::{read_raw_audio, resample};
pub use error::{Error, Result};
pub use scorer::ExternalScorer;
pub use types::Hypothesis;
