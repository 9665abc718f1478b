//! DeepSpeech2-style acoustic model with CTC loss and decoding
//!
//! - `ds2`: the convolutional/recurrent model on candle
//! - `ctc`: differentiable log-space CTC loss
//! - `decode`: greedy and prefix beam-search decoding with optional
//!   language-model rescoring
//! - `quantized`: on-device inference variant with quantized matmuls

pub mod ctc;
pub mod decode;
pub mod ds2;
pub mod quantized;

pub use ctc::{ctc_loss, ctc_loss_batch};
pub use decode::{beam_search, greedy_decode};
pub use ds2::DeepSpeech2;
pub use quantized::QuantizedDeepSpeech2;
