//! Featurizers: raw audio to feature tensors, text to token ids
//!
//! - `speech`: framing, FFT, log-mel filterbank, normalization
//! - `text`: vocabulary bijection, blank placement, scorer attachment

pub mod speech;
pub mod text;

pub use speech::SpeechFeaturizer;
pub use text::TextFeaturizer;
