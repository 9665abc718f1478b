//! Quantized on-device inference variant
//!
//! Built from a trained model by quantizing the large matmuls (GRU gates,
//! FC head, classifier) to Q8_0 through candle's `QMatMul`, with an F16
//! fallback for matrices whose inner dimension Q8_0 cannot block. Batch
//! norm is folded into the conv weights since inference never updates
//! running statistics.
//!
//! Entry points take a raw mono signal and featurize internally, matching
//! the shape of an on-device pipeline rather than batched training tensors.

use candle_core::quantized::{GgmlDType, QMatMul, QTensor};
use candle_core::{DType, Module, Tensor};
use candle_nn::BatchNorm;

use ctc_asr_core::{Error, Hypothesis, Result};
use ctc_asr_features::{SpeechFeaturizer, TextFeaturizer};

use crate::decode::{beam_search, greedy_decode};
use crate::ds2::{clipped_relu, conv2d_asym, gru_combine, reverse_time, DeepSpeech2};

// Matches the BatchNormConfig the conv blocks are built with
const BN_EPS: f64 = 1e-5;

/// Q8_0 blocks along the inner dimension in groups of 32
fn quantize_weight(w: &Tensor) -> candle_core::Result<QMatMul> {
    let w = w.to_dtype(DType::F32)?;
    let dtype = if w.dim(1)? % 32 == 0 {
        GgmlDType::Q8_0
    } else {
        GgmlDType::F16
    };
    QMatMul::from_qtensor(QTensor::quantize(&w, dtype)?)
}

struct FoldedConv {
    weight: Tensor,
    bias: Tensor,
    strides: [usize; 2],
}

impl FoldedConv {
    /// Fold batch-norm statistics into the conv weight and bias
    fn new(
        weight: &Tensor,
        bias: &Tensor,
        bn: &BatchNorm,
        strides: [usize; 2],
    ) -> candle_core::Result<Self> {
        let mean = bn.running_mean().to_dtype(DType::F32)?;
        let var = bn.running_var().to_dtype(DType::F32)?;
        let (gamma, beta) = match bn.weight_and_bias() {
            Some((w, b)) => (w.to_dtype(DType::F32)?, b.to_dtype(DType::F32)?),
            None => {
                let ones = mean.ones_like()?;
                (ones.clone(), mean.zeros_like()?)
            }
        };
        // scale = gamma / sqrt(var + eps), applied per output channel
        let scale = (gamma / (var.clone() + BN_EPS)?.sqrt()?)?;
        let cout = scale.dim(0)?;
        let weight = weight
            .to_dtype(DType::F32)?
            .broadcast_mul(&scale.reshape((cout, 1, 1, 1))?)?;
        let bias = ((bias.to_dtype(DType::F32)? - mean)?.mul(&scale)? + beta)?;
        Ok(Self {
            weight,
            bias,
            strides,
        })
    }

    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        clipped_relu(&conv2d_asym(x, &self.weight, &self.bias, self.strides)?)
    }
}

/// Eval-mode batch norm collapsed to `x * scale + shift` over the last dim
struct NormAffine {
    scale: Tensor,
    shift: Tensor,
}

impl NormAffine {
    fn from_batch_norm(bn: &BatchNorm) -> candle_core::Result<Self> {
        let mean = bn.running_mean().to_dtype(DType::F32)?;
        let var = bn.running_var().to_dtype(DType::F32)?;
        let (gamma, beta) = match bn.weight_and_bias() {
            Some((w, b)) => (w.to_dtype(DType::F32)?, b.to_dtype(DType::F32)?),
            None => (mean.ones_like()?, mean.zeros_like()?),
        };
        let scale = (gamma / (var + BN_EPS)?.sqrt()?)?;
        let shift = (beta - mean.mul(&scale)?)?;
        Ok(Self { scale, shift })
    }

    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        x.broadcast_mul(&self.scale)?.broadcast_add(&self.shift)
    }
}

struct QGru {
    w_ih: QMatMul,
    w_hh: QMatMul,
    b_ih: Tensor,
    b_hh: Tensor,
    hidden: usize,
}

impl QGru {
    fn new(
        w_ih: &Tensor,
        w_hh: &Tensor,
        b_ih: &Tensor,
        b_hh: &Tensor,
        hidden: usize,
    ) -> candle_core::Result<Self> {
        Ok(Self {
            w_ih: quantize_weight(w_ih)?,
            w_hh: quantize_weight(w_hh)?,
            b_ih: b_ih.to_dtype(DType::F32)?,
            b_hh: b_hh.to_dtype(DType::F32)?,
            hidden,
        })
    }

    fn seq(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let (b, t, _in) = x.dims3()?;
        let mut h = Tensor::zeros((b, self.hidden), DType::F32, x.device())?;
        let mut outputs = Vec::with_capacity(t);
        for step in 0..t {
            let xt = x.narrow(1, step, 1)?.squeeze(1)?;
            let gi = self.w_ih.forward(&xt)?.broadcast_add(&self.b_ih)?;
            let gh = self.w_hh.forward(&h)?.broadcast_add(&self.b_hh)?;
            h = gru_combine(&gi, &gh, &h, self.hidden)?;
            outputs.push(h.clone());
        }
        Tensor::stack(&outputs, 1)
    }
}

struct QGruLayer {
    fwd: QGru,
    bwd: Option<QGru>,
    bn: Option<NormAffine>,
}

impl QGruLayer {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let fwd = self.fwd.seq(x)?;
        let out = match &self.bwd {
            None => fwd,
            Some(bwd) => {
                let reversed = reverse_time(x)?;
                let bwd_out = reverse_time(&bwd.seq(&reversed)?)?;
                Tensor::cat(&[&fwd, &bwd_out], 2)?
            }
        };
        match &self.bn {
            None => Ok(out),
            Some(bn) => bn.forward(&out),
        }
    }
}

struct QLinear {
    weight: QMatMul,
    bias: Option<Tensor>,
}

impl QLinear {
    fn from_linear(linear: &candle_nn::Linear) -> candle_core::Result<Self> {
        Ok(Self {
            weight: quantize_weight(linear.weight())?,
            bias: match linear.bias() {
                Some(b) => Some(b.to_dtype(DType::F32)?),
                None => None,
            },
        })
    }

    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let x = self.weight.forward(x)?;
        match &self.bias {
            Some(b) => x.broadcast_add(b),
            None => Ok(x),
        }
    }
}

/// Single-utterance inference model with quantized matmuls.
///
/// Owns its featurizers so callers hand in nothing but audio.
pub struct QuantizedDeepSpeech2 {
    conv_blocks: Vec<FoldedConv>,
    gru_layers: Vec<QGruLayer>,
    fc: Option<QLinear>,
    classifier: QLinear,
    speech: SpeechFeaturizer,
    text: TextFeaturizer,
}

impl QuantizedDeepSpeech2 {
    pub fn from_model(
        model: &DeepSpeech2,
        speech: SpeechFeaturizer,
        text: TextFeaturizer,
    ) -> Result<Self> {
        if text.num_classes() != model.num_classes() {
            return Err(Error::ModelBuild(format!(
                "vocabulary has {} classes but the model emits {}",
                text.num_classes(),
                model.num_classes()
            )));
        }

        let hidden = model.hidden_units();
        let mut conv_blocks = Vec::new();
        for (weight, bias, bn, strides) in model.conv_parts() {
            conv_blocks.push(
                FoldedConv::new(weight, bias, bn, strides)
                    .map_err(|e| Error::ModelBuild(e.to_string()))?,
            );
        }

        let mut gru_layers: Vec<QGruLayer> = Vec::new();
        for (w_ih, w_hh, b_ih, b_hh, is_bwd) in model.gru_parts() {
            let gru = QGru::new(w_ih, w_hh, b_ih, b_hh, hidden)
                .map_err(|e| Error::ModelBuild(e.to_string()))?;
            if is_bwd {
                let layer = gru_layers
                    .last_mut()
                    .ok_or_else(|| Error::ModelBuild("dangling backward gru".to_string()))?;
                layer.bwd = Some(gru);
            } else {
                gru_layers.push(QGruLayer {
                    fwd: gru,
                    bwd: None,
                    bn: None,
                });
            }
        }
        for (layer, bn) in gru_layers.iter_mut().zip(model.rnn_bn_parts()) {
            if let Some(bn) = bn {
                layer.bn = Some(
                    NormAffine::from_batch_norm(bn)
                        .map_err(|e| Error::ModelBuild(e.to_string()))?,
                );
            }
        }

        let fc = match model.fc_part() {
            Some(fc) => {
                Some(QLinear::from_linear(fc).map_err(|e| Error::ModelBuild(e.to_string()))?)
            }
            None => None,
        };
        let classifier = QLinear::from_linear(model.classifier_part())
            .map_err(|e| Error::ModelBuild(e.to_string()))?;

        tracing::info!(
            conv_blocks = conv_blocks.len(),
            gru_layers = gru_layers.len(),
            "Quantized model for on-device inference"
        );

        Ok(Self {
            conv_blocks,
            gru_layers,
            fc,
            classifier,
            speech,
            text,
        })
    }

    /// Frame log-probabilities for one raw mono signal
    fn frame_log_probs(&self, signal: &[f32]) -> Result<Vec<Vec<f32>>> {
        let features = self.speech.extract(signal)?;
        let (t, bins, channels) = features.dim();
        let flat: Vec<f32> = features.iter().copied().collect();
        let device = candle_core::Device::Cpu;
        let x = Tensor::from_vec(flat, (1, t, bins, channels), &device)?;

        // [B, C, T, F]
        let mut x = x.permute((0, 3, 1, 2))?;
        for block in &self.conv_blocks {
            x = block.forward(&x)?;
        }
        let (b, c, t, f) = x.dims4()?;
        let mut x = x.permute((0, 2, 1, 3))?.reshape((b, t, c * f))?;
        for layer in &self.gru_layers {
            x = layer.forward(&x)?;
        }
        if let Some(fc) = &self.fc {
            x = clipped_relu(&fc.forward(&x)?)?;
        }
        let logits = self.classifier.forward(&x)?;
        let log_probs = candle_nn::ops::log_softmax(&logits, candle_core::D::Minus1)?;
        let mut batches = log_probs.to_vec3::<f32>()?;
        Ok(batches.swap_remove(0))
    }

    /// Greedy transcription of one raw mono signal
    pub fn recognize(&self, signal: &[f32]) -> Result<Hypothesis> {
        let frames = self.frame_log_probs(signal)?;
        Ok(greedy_decode(&frames, &self.text))
    }

    /// Beam-search transcription of one raw mono signal
    pub fn recognize_beam(&self, signal: &[f32], lm: bool) -> Result<Hypothesis> {
        if lm && self.text.scorer().is_none() {
            return Err(Error::Decode(
                "lm rescoring requested but no scorer is attached".to_string(),
            ));
        }
        let frames = self.frame_log_probs(signal)?;
        beam_search(&frames, &self.text, lm)
    }

    pub fn text_featurizer(&self) -> &TextFeaturizer {
        &self.text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::{VarBuilder, VarMap};
    use ctc_asr_config::{DecoderConfig, ModelConfig, SpeechConfig};

    fn speech_config() -> SpeechConfig {
        SpeechConfig {
            sample_rate: 8000,
            num_feature_bins: 16,
            ..Default::default()
        }
    }

    fn text_featurizer() -> TextFeaturizer {
        TextFeaturizer::from_tokens(
            vec!["a".to_string(), "b".to_string(), " ".to_string()],
            DecoderConfig::default(),
        )
        .unwrap()
    }

    fn float_model(num_classes: usize) -> DeepSpeech2 {
        let model_config = ModelConfig {
            rnn_layers: 1,
            rnn_units: 8,
            fc_units: 16,
            ..Default::default()
        };
        let speech = SpeechFeaturizer::new(&speech_config());
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, candle_core::DType::F32, &Device::Cpu);
        DeepSpeech2::new(
            &model_config,
            speech.compute_feature_dim(),
            num_classes,
            vb,
        )
        .unwrap()
    }

    #[test]
    fn test_quantized_recognize_runs() {
        let text = text_featurizer();
        let model = float_model(text.num_classes());
        let speech = SpeechFeaturizer::new(&speech_config());
        let expected_frames = model.output_time_len(speech.num_frames(4000));

        let quantized = QuantizedDeepSpeech2::from_model(&model, speech, text).unwrap();

        let signal: Vec<f32> = (0..4000)
            .map(|i| (i as f32 * 0.05).sin() * 0.3)
            .collect();
        let frames = quantized.frame_log_probs(&signal).unwrap();
        assert_eq!(frames.len(), expected_frames);
        for frame in &frames {
            let mass: f32 = frame.iter().map(|lp| lp.exp()).sum();
            assert!((mass - 1.0).abs() < 1e-3, "frame mass {mass}");
        }

        let hyp = quantized.recognize(&signal).unwrap();
        assert!(hyp.score.is_finite());
        let beam = quantized.recognize_beam(&signal, false).unwrap();
        assert!(beam.score.is_finite());
    }

    #[test]
    fn test_vocabulary_mismatch_rejected() {
        let text = text_featurizer();
        let model = float_model(text.num_classes());
        let speech = SpeechFeaturizer::new(&speech_config());
        let small = TextFeaturizer::from_tokens(
            vec!["a".to_string()],
            DecoderConfig::default(),
        )
        .unwrap();
        assert!(QuantizedDeepSpeech2::from_model(&model, speech, small).is_err());
    }

    #[test]
    fn test_lm_requires_scorer() {
        let text = text_featurizer();
        let model = float_model(text.num_classes());
        let speech = SpeechFeaturizer::new(&speech_config());
        let quantized = QuantizedDeepSpeech2::from_model(&model, speech, text).unwrap();
        let signal = vec![0.1f32; 4000];
        assert!(quantized.recognize_beam(&signal, true).is_err());
    }
}
